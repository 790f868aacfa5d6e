use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use derive_more::{Display, Error, From};
use log::{LevelFilter, info};

use loaders::template::{InputTemplate, TemplateFormat};
use loaders::{BOHR_PER_ANGSTROM, LoaderError, constraints, dihedrals, xyz};

use torscan::Status;
use torscan::callback::ProgressOutput;
use torscan::config::{ConfigError, DEFAULT_ENERGY_DECREASE_THRESH, EngineKind, ScanConfig};
use torscan::engine::{EngineError, Optimizers, qm::ProcessEngine, wq::WorkQueueEngine};
use torscan::geometry::{Geometry, GeometryError};
use torscan::persistence::{DEFAULT_LOG_PATH, PersistError, ScanLog};
use torscan::scan::{ScanError, ScanHooks, Scanner};
use torscan::terminators::InterruptTerminator;

/// Potential energy scan over one or more dihedral angles.
#[derive(Parser, Debug)]
#[command(name = "torscan", version)]
struct Args {
    /// Input template for the QM engine; its geometry seeds the scan.
    inputfile: PathBuf,

    /// File defining the dihedral angles to scan.
    dihedralfile: PathBuf,

    /// Grid spacing in degrees: one value for every dihedral, or one per
    /// dihedral.
    #[arg(short = 'g', long, num_args = 1.., default_values_t = [15])]
    grid_spacing: Vec<i32>,

    /// Engine used to run the optimizations.
    #[arg(short = 'e', long, value_enum, default_value_t = EngineKind::Psi4)]
    engine: EngineKind,

    /// Extra freeze/set constraints in geomeTRIC format (not available with
    /// --native_opt).
    #[arg(short = 'c', long)]
    constraints: Option<PathBuf>,

    /// Use the QM program's own constrained optimizer instead of geomeTRIC.
    #[arg(long)]
    native_opt: bool,

    /// Accept a new optimum only when it undercuts the incumbent by this
    /// much (a.u.).
    #[arg(long, default_value_t = DEFAULT_ENERGY_DECREASE_THRESH)]
    energy_thresh: f64,

    /// Listen on this port and distribute optimizations to connected
    /// workers.
    #[arg(long)]
    wq_port: Option<u16>,

    /// Multi-frame XYZ of starting geometries, overriding the template
    /// geometry.
    #[arg(long)]
    init_coords: Option<PathBuf>,

    /// Atom indices in the dihedral file are zero-based.
    #[arg(long)]
    zero_based_numbering: bool,

    /// Print more information while running.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Display, Error, From)]
enum CliError {
    #[display("{_0}")]
    Loader(#[error(source)] LoaderError),
    #[display("{_0}")]
    Config(#[error(source)] ConfigError),
    #[display("{_0}")]
    Geometry(#[error(source)] GeometryError),
    #[display("{_0}")]
    Engine(#[error(source)] EngineError),
    #[display("{_0}")]
    Persist(#[error(source)] PersistError),
    #[display("{_0}")]
    Scan(#[error(source)] ScanError),
    #[display("extra constraints are not supported with --native_opt")]
    NativeOptConstraints,
    #[display("init_coords frame {frame} does not match the template's elements")]
    #[from(ignore)]
    SeedElements { frame: usize },
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    // Echo the command line for reproducibility.
    println!("{}", std::env::args().collect::<Vec<_>>().join(" "));

    match run(args) {
        Ok(Status::Interrupted) => {
            eprintln!("scan interrupted; completed work is in {DEFAULT_LOG_PATH}");
            ExitCode::from(130)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<Status, CliError> {
    if args.zero_based_numbering {
        info!(
            "--zero_based_numbering is deprecated; prefer #zero_based_numbering in the dihedral file"
        );
    }
    let dihedral_file = dihedrals::load(&args.dihedralfile, args.zero_based_numbering)?;
    let grid_dim = dihedral_file.dihedrals.len();

    let grid_spacing = if args.grid_spacing.len() == grid_dim {
        args.grid_spacing.clone()
    } else if args.grid_spacing.len() == 1 {
        vec![args.grid_spacing[0]; grid_dim]
    } else {
        return Err(ConfigError::SpacingCount {
            spacings: args.grid_spacing.len(),
            dihedrals: grid_dim,
        }
        .into());
    };

    let format = match args.engine {
        EngineKind::Psi4 => TemplateFormat::Psi4,
        EngineKind::Qchem => TemplateFormat::QChem,
        EngineKind::Terachem => TemplateFormat::TeraChem,
    };
    let template = InputTemplate::load(&args.inputfile, format)?;

    let extra_constraints = match &args.constraints {
        Some(path) => {
            if args.native_opt {
                return Err(CliError::NativeOptConstraints);
            }
            let text = std::fs::read_to_string(path).map_err(LoaderError::from)?;
            let entries = constraints::parse(&text, &path.display().to_string())?;
            check_constraint_overlap(&entries, &dihedral_file.dihedrals)?;
            Some(constraints::render(&entries))
        }
        None => None,
    };

    let elements: Vec<String> = template.elements().to_vec();
    let init_coords = match &args.init_coords {
        Some(path) => {
            let frames = xyz::load(path)?;
            frames
                .iter()
                .enumerate()
                .map(|(frame, f)| {
                    if f.elements != elements {
                        return Err(CliError::SeedElements { frame });
                    }
                    Ok(to_bohr_geometry(&f.coords)?)
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        None => vec![to_bohr_geometry(template.coords_angstrom())?],
    };

    let config = ScanConfig {
        dihedrals: dihedral_file.dihedrals.clone(),
        grid_spacing,
        dihedral_ranges: dihedral_file.ranges.clone(),
        elements,
        init_coords,
        energy_decrease_thresh: args.energy_thresh,
    };
    let mut scanner = Scanner::from_config(config)?;

    let log_path = PathBuf::from(DEFAULT_LOG_PATH);
    if log_path.exists() {
        scanner.replay(ScanLog::replay(&log_path)?);
    }
    let mut scanner = scanner.with_log(ScanLog::append_to(&log_path)?);

    let mut optimizer: Optimizers = match args.wq_port {
        Some(port) => WorkQueueEngine::bind(
            port,
            args.engine,
            template,
            dihedral_file.dihedrals.clone(),
        )?
        .with_native_opt(args.native_opt)
        .with_extra_constraints(extra_constraints)
        .into(),
        None => ProcessEngine::new(
            args.engine,
            template,
            dihedral_file.dihedrals.clone(),
            PathBuf::from("jobs"),
        )
        .with_native_opt(args.native_opt)
        .with_extra_constraints(extra_constraints)
        .into(),
    };

    let mut hooks = ScanHooks {
        callback: Box::new(ProgressOutput {}),
        terminator: Box::new(InterruptTerminator::new()),
    };
    let status = scanner.run(&mut optimizer, &mut hooks)?;

    println!("Scan finished: {status:?}");
    println!(" {:<20} {}", "Grid ID", "Energy");
    for (point, grid_status) in &scanner.state().grid_status {
        match grid_status.best() {
            Some(best) => println!("  {:<20} {:.10}", point.to_string(), best.energy),
            None => println!("  {:<20} unreached", point.to_string()),
        }
    }
    Ok(status)
}

fn to_bohr_geometry(coords_angstrom: &[f64]) -> Result<Geometry, GeometryError> {
    Geometry::new(
        coords_angstrom
            .iter()
            .map(|c| c * BOHR_PER_ANGSTROM)
            .collect(),
    )
}

/// A scanned dihedral may not also be frozen or set by the extra
/// constraints.
fn check_constraint_overlap(
    entries: &[constraints::ConstraintEntry],
    scanned: &[[usize; 4]],
) -> Result<(), ConfigError> {
    for entry in entries.iter().filter(|e| e.kind == "dihedral") {
        let Ok(quad) = <[usize; 4]>::try_from(entry.atoms.clone()) else {
            continue;
        };
        let reversed = [quad[3], quad[2], quad[1], quad[0]];
        if let Some(dim) = scanned.iter().position(|d| *d == quad || *d == reversed) {
            return Err(ConfigError::ScannedDihedralConstrained { dim });
        }
    }
    Ok(())
}
