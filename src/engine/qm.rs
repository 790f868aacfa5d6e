//! Process backends: each constrained optimization runs as a child process
//! in its own job directory under the work directory.
//!
//! The default path drives the external `geometric-optimize` program with
//! the engine's single-point input plus a constraints file, and reads the
//! optimum back from `qdata.txt`. With native optimization the QM program's
//! own constrained optimizer runs instead, with the fixed-dihedral
//! directives spliced into the input; extra user constraints are only
//! supported on the geomeTRIC path, which the CLI enforces.
//!
//! Job directories are named by identity prefix, so resubmitting the same
//! job lands in the same place.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use log::warn;

use loaders::BOHR_PER_ANGSTROM;
use loaders::template::InputTemplate;
use loaders::xyz;

use crate::E;
use crate::config::EngineKind;
use crate::geometry::Geometry;
use crate::grid::GridPoint;
use crate::scan::state::{Job, ResultRecord};

use super::{EngineError, JobHandle, Optimizer, job_constraints};

pub struct ProcessEngine {
    kind: EngineKind,
    template: InputTemplate,
    dihedrals: Vec<[usize; 4]>,
    native_opt: bool,
    extra_constraints: Option<String>,
    work_dir: PathBuf,
    max_procs: usize,
    next_handle: JobHandle,
    running: Vec<RunningJob>,
}

struct RunningJob {
    handle: JobHandle,
    dir: PathBuf,
    start: Geometry,
    child: Child,
}

impl ProcessEngine {
    pub fn new(
        kind: EngineKind,
        template: InputTemplate,
        dihedrals: Vec<[usize; 4]>,
        work_dir: PathBuf,
    ) -> Self {
        ProcessEngine {
            kind,
            template,
            dihedrals,
            native_opt: false,
            extra_constraints: None,
            work_dir,
            max_procs: 1,
            next_handle: 0,
            running: Vec::new(),
        }
    }

    /// Use the QM program's own constrained optimizer instead of geomeTRIC.
    pub fn with_native_opt(mut self, native_opt: bool) -> Self {
        self.native_opt = native_opt;
        self
    }

    /// Extra constraints appended to every job's constraints file
    /// (geomeTRIC path only).
    pub fn with_extra_constraints(mut self, extra: Option<String>) -> Self {
        self.extra_constraints = extra;
        self
    }

    /// Number of QM processes allowed to run at once.
    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs.max(1);
        self
    }

    fn input_name(&self) -> &'static str {
        input_file_name(self.kind)
    }

    fn command(&self, dir: &Path) -> std::io::Result<Command> {
        let mut command = if self.native_opt {
            match self.kind {
                EngineKind::Psi4 => {
                    let mut c = Command::new("psi4");
                    c.args(["input.dat", "output.dat"]);
                    c
                }
                EngineKind::Qchem => {
                    let mut c = Command::new("qchem");
                    c.args(["run.in", "run.out"]);
                    c
                }
                EngineKind::Terachem => {
                    let mut c = Command::new("terachem");
                    c.arg("run.in");
                    c
                }
            }
        } else {
            let mut c = Command::new("geometric-optimize");
            c.arg("--engine").arg(self.kind.to_string()).arg("--qdata");
            c.args([self.input_name(), "constraints.txt"]);
            c
        };
        command.current_dir(dir);
        command.stdout(File::create(dir.join("stdout.log"))?);
        command.stderr(File::create(dir.join("stderr.log"))?);
        Ok(command)
    }

    fn write_inputs(&self, dir: &Path, job: &Job) -> Result<(), EngineError> {
        for (name, contents) in job_files(
            self.kind,
            &self.template,
            &self.dihedrals,
            self.native_opt,
            self.extra_constraints.as_deref(),
            job,
        ) {
            fs::write(dir.join(name), contents)?;
        }
        Ok(())
    }

    /// Final geometry (bohr) and energy from a finished job directory.
    fn parse_result(&self, dir: &Path) -> Option<(Vec<E>, E)> {
        if !self.native_opt {
            return parse_qdata(&fs::read_to_string(dir.join("qdata.txt")).ok()?);
        }
        match self.kind {
            EngineKind::Psi4 => {
                let text = fs::read_to_string(dir.join("output.dat")).ok()?;
                parse_psi4_output(&text, self.template.natoms())
            }
            EngineKind::Qchem => {
                let text = fs::read_to_string(dir.join("run.out")).ok()?;
                parse_qchem_output(&text, self.template.natoms())
            }
            EngineKind::Terachem => {
                let text = fs::read_to_string(dir.join("scr").join("optim.xyz")).ok()?;
                parse_terachem_optim(&text)
            }
        }
    }
}

impl Optimizer for ProcessEngine {
    fn submit(&mut self, job: &Job) -> Result<JobHandle, EngineError> {
        let handle = self.next_handle;
        self.next_handle += 1;

        let dir = self.work_dir.join(&job.id[..12]);
        fs::create_dir_all(&dir)?;
        self.write_inputs(&dir, job)?;

        let mut command = self.command(&dir)?;
        let child = command.spawn().map_err(|source| EngineError::Spawn {
            program: command.get_program().to_string_lossy().into_owned(),
            source,
        })?;
        self.running.push(RunningJob {
            handle,
            dir,
            start: job.start.clone(),
            child,
        });
        Ok(handle)
    }

    fn poll_ready(&mut self) -> Vec<JobHandle> {
        self.running
            .iter_mut()
            .filter_map(|job| match job.child.try_wait() {
                Ok(Some(_)) => Some(job.handle),
                Ok(None) => None,
                // The process is gone; collect will report the failure.
                Err(_) => Some(job.handle),
            })
            .collect()
    }

    fn collect(&mut self, handle: JobHandle) -> ResultRecord {
        let position = self
            .running
            .iter()
            .position(|job| job.handle == handle)
            .expect("collect of a handle that is not running");
        let mut job = self.running.remove(position);

        match job.child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!("optimizer exited with {status} in {}", job.dir.display());
                return ResultRecord::failed(job.start);
            }
            Err(err) => {
                warn!("could not reap optimizer in {}: {err}", job.dir.display());
                return ResultRecord::failed(job.start);
            }
        }

        match self.parse_result(&job.dir) {
            Some((coords, energy)) if coords.len() == job.start.coords().len() => {
                match Geometry::new(coords) {
                    Ok(final_geometry) => ResultRecord::ok(job.start, final_geometry, energy),
                    Err(_) => ResultRecord::failed(job.start),
                }
            }
            _ => {
                warn!("no usable result in {}", job.dir.display());
                ResultRecord::failed(job.start)
            }
        }
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.max_procs)
    }
}

pub(crate) fn input_file_name(kind: EngineKind) -> &'static str {
    match kind {
        EngineKind::Psi4 => "input.dat",
        EngineKind::Qchem | EngineKind::Terachem => "run.in",
    }
}

/// Every file one job needs, as `(name, contents)` pairs: the rendered input
/// (with native constraint directives spliced in when requested), the
/// TeraChem coordinates side file if any, and the geomeTRIC constraints
/// file on the external path.
pub(crate) fn job_files(
    kind: EngineKind,
    template: &InputTemplate,
    dihedrals: &[[usize; 4]],
    native_opt: bool,
    extra_constraints: Option<&str>,
    job: &Job,
) -> Vec<(String, String)> {
    let coords_angstrom: Vec<E> = job
        .start
        .coords()
        .iter()
        .map(|c| c / BOHR_PER_ANGSTROM)
        .collect();
    let insert = native_opt.then(|| native_insert(kind, dihedrals, &job.target));
    let rendered = template.render(&coords_angstrom, insert.as_deref());

    let mut files = vec![(input_file_name(kind).to_string(), rendered.main)];
    if let Some(aux) = rendered.aux {
        files.push(aux);
    }
    if !native_opt {
        files.push((
            "constraints.txt".to_string(),
            job_constraints(dihedrals, &job.target, extra_constraints),
        ));
    }
    files
}

/// Fixed-dihedral directives in each program's native dialect, spliced into
/// the job input after the geometry.
fn native_insert(kind: EngineKind, dihedrals: &[[usize; 4]], target: &GridPoint) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    match kind {
        EngineKind::Psi4 => {
            out.push_str("set optking {\n  fixed_dihedral = (\"\n");
            for (idxs, value) in dihedrals.iter().zip(target.values()) {
                let [i, j, k, l] = *idxs;
                let _ = writeln!(
                    out,
                    "    {} {} {} {} {:.2}",
                    i + 1,
                    j + 1,
                    k + 1,
                    l + 1,
                    f64::from(*value)
                );
            }
            out.push_str("  \")\n}\n");
        }
        EngineKind::Qchem => {
            out.push_str("$opt\nCONSTRAINT\n");
            for (idxs, value) in dihedrals.iter().zip(target.values()) {
                let [i, j, k, l] = *idxs;
                let _ = writeln!(
                    out,
                    "tors {} {} {} {} {:.2}",
                    i + 1,
                    j + 1,
                    k + 1,
                    l + 1,
                    f64::from(*value)
                );
            }
            out.push_str("ENDCONSTRAINT\n$end\n");
        }
        EngineKind::Terachem => {
            out.push_str("$constraint_set\n");
            for (idxs, value) in dihedrals.iter().zip(target.values()) {
                let [i, j, k, l] = *idxs;
                let _ = writeln!(
                    out,
                    "dihedral {:.2} {}_{}_{}_{}",
                    f64::from(*value),
                    i + 1,
                    j + 1,
                    k + 1,
                    l + 1
                );
            }
            out.push_str("$end\n");
        }
    }
    out
}

/// Last energy on a line containing `marker`.
fn last_energy(text: &str, marker: &str) -> Option<E> {
    text.lines()
        .filter(|line| line.contains(marker))
        .next_back()?
        .split_whitespace()
        .filter_map(|tok| tok.parse::<E>().ok())
        .next_back()
}

/// geomeTRIC's `qdata.txt`: the last `COORDS` (bohr) and `ENERGY` records
/// are the converged optimum.
fn parse_qdata(text: &str) -> Option<(Vec<E>, E)> {
    let mut coords = None;
    let mut energy = None;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("COORDS") => {
                coords = fields.map(|tok| tok.parse::<E>().ok()).collect::<Option<Vec<E>>>();
            }
            Some("ENERGY") => {
                energy = fields.next().and_then(|tok| tok.parse::<E>().ok());
            }
            _ => {}
        }
    }
    Some((coords?, energy?))
}

/// Reads `element x y z` lines (Angstrom) following the last `marker` line.
fn coords_after_marker(text: &str, marker: &str, natoms: usize) -> Option<Vec<E>> {
    let tail = &text[text.rfind(marker)?..];
    let mut coords = Vec::with_capacity(3 * natoms);
    let mut started = false;
    for line in tail.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Accept both `El x y z` and Q-Chem's `n El x y z`.
        let floats: Option<Vec<E>> = match fields.len() {
            4 => fields[1..].iter().map(|t| t.parse().ok()).collect(),
            5 if fields[0].parse::<usize>().is_ok() => {
                fields[2..].iter().map(|t| t.parse().ok()).collect()
            }
            _ => None,
        };
        match floats {
            Some(triple) => {
                started = true;
                coords.extend(triple);
                if coords.len() == 3 * natoms {
                    return Some(coords);
                }
            }
            None if started => break,
            None => {}
        }
    }
    None
}

fn to_bohr(coords_angstrom: Vec<E>) -> Vec<E> {
    coords_angstrom
        .into_iter()
        .map(|c| c * BOHR_PER_ANGSTROM)
        .collect()
}

fn parse_psi4_output(text: &str, natoms: usize) -> Option<(Vec<E>, E)> {
    let energy = last_energy(text, "Final energy is")?;
    let coords = coords_after_marker(text, "Final optimized geometry", natoms)?;
    Some((to_bohr(coords), energy))
}

fn parse_qchem_output(text: &str, natoms: usize) -> Option<(Vec<E>, E)> {
    let energy = last_energy(text, "Final energy is")?;
    let coords = coords_after_marker(text, "OPTIMIZATION CONVERGED", natoms)?;
    Some((to_bohr(coords), energy))
}

/// TeraChem streams optimization frames to `scr/optim.xyz` with the energy
/// in each comment line; the last frame is the optimum.
fn parse_terachem_optim(text: &str) -> Option<(Vec<E>, E)> {
    let frames = xyz::parse(text, "optim.xyz").ok()?;
    let last = frames.last()?;
    let energy = last
        .comment
        .split_whitespace()
        .find_map(|tok| tok.parse::<E>().ok())?;
    Some((to_bohr(last.coords.clone()), energy))
}
