//! QM input templates.
//!
//! A template is the user's own single-point or optimization input for the
//! chosen program; the scanner only needs to lift the starting geometry out
//! of it and write it back with a different geometry (plus, for native
//! constrained optimizations, a block of extra directives) for every job.
//!
//! Psi4 and Q-Chem carry the geometry inline (`molecule {...}` and
//! `$molecule...$end` blocks); TeraChem references an external XYZ file via
//! its `coordinates` key.

use std::fmt::Write as _;
use std::path::Path;

use crate::xyz::{self, XyzFrame};
use crate::LoaderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Psi4,
    QChem,
    TeraChem,
}

#[derive(Debug, Clone)]
pub struct InputTemplate {
    format: TemplateFormat,
    /// Lines up to and including the geometry block opener, plus any
    /// non-coordinate lines (charge/multiplicity, units) preceding the
    /// coordinates. For TeraChem this is the whole input file.
    head: Vec<String>,
    /// The geometry block terminator and any in-block lines after the
    /// coordinates. Empty for TeraChem.
    block_tail: Vec<String>,
    /// Lines after the geometry block.
    tail: Vec<String>,
    elements: Vec<String>,
    /// Template coordinates in Angstrom.
    coords: Vec<f64>,
    /// Name of the external coordinates file (TeraChem only).
    aux_name: Option<String>,
}

/// A job input produced from a template: the main input file contents and an
/// optional side file (TeraChem's coordinates XYZ).
#[derive(Debug, Clone)]
pub struct RenderedInput {
    pub main: String,
    pub aux: Option<(String, String)>,
}

impl InputTemplate {
    pub fn load(path: &Path, format: TemplateFormat) -> Result<Self, LoaderError> {
        let text = std::fs::read_to_string(path)?;
        let source = path.display().to_string();
        match format {
            TemplateFormat::Psi4 | TemplateFormat::QChem => parse_single_file(&text, &source, format),
            TemplateFormat::TeraChem => {
                let coords_name = terachem_coords_name(&text, &source)?;
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let frames = xyz::load(&dir.join(&coords_name))?;
                parse_with_coords(&text, coords_name, &frames[0])
            }
        }
    }

    pub fn format(&self) -> TemplateFormat {
        self.format
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    pub fn natoms(&self) -> usize {
        self.elements.len()
    }

    /// Template geometry, flat, in Angstrom.
    pub fn coords_angstrom(&self) -> &[f64] {
        &self.coords
    }

    /// Rebuilds the input with `coords` (Angstrom) in place of the template
    /// geometry. `insert` lines are placed directly after the geometry block
    /// (Psi4/Q-Chem) or appended to the input (TeraChem), which is where the
    /// native constrained-optimization directives belong.
    pub fn render(&self, coords: &[f64], insert: Option<&str>) -> RenderedInput {
        debug_assert_eq!(coords.len(), 3 * self.natoms());
        match self.format {
            TemplateFormat::Psi4 | TemplateFormat::QChem => {
                let mut main = String::new();
                for line in &self.head {
                    let _ = writeln!(main, "{line}");
                }
                write_coord_lines(&mut main, &self.elements, coords);
                for line in &self.block_tail {
                    let _ = writeln!(main, "{line}");
                }
                if let Some(extra) = insert {
                    let _ = writeln!(main, "{}", extra.trim_end());
                }
                for line in &self.tail {
                    let _ = writeln!(main, "{line}");
                }
                RenderedInput { main, aux: None }
            }
            TemplateFormat::TeraChem => {
                let mut main = String::new();
                for line in &self.head {
                    let _ = writeln!(main, "{line}");
                }
                if let Some(extra) = insert {
                    let _ = writeln!(main, "{}", extra.trim_end());
                }
                let name = self.aux_name.clone().unwrap_or_else(|| "start.xyz".to_string());
                let contents = xyz::render(&self.elements, coords, "job geometry");
                RenderedInput {
                    main,
                    aux: Some((name, contents)),
                }
            }
        }
    }
}

fn write_coord_lines(out: &mut String, elements: &[String], coords: &[f64]) {
    for (element, atom) in elements.iter().zip(coords.chunks_exact(3)) {
        let _ = writeln!(
            out,
            "  {:<4}{:>16.10}{:>16.10}{:>16.10}",
            element, atom[0], atom[1], atom[2]
        );
    }
}

/// Attempts to read a line as `element x y z`.
fn coord_line(line: &str) -> Option<(String, [f64; 3])> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return None;
    }
    let x = fields[1].parse().ok()?;
    let y = fields[2].parse().ok()?;
    let z = fields[3].parse().ok()?;
    Some((fields[0].to_string(), [x, y, z]))
}

pub fn parse_single_file(
    text: &str,
    source: &str,
    format: TemplateFormat,
) -> Result<InputTemplate, LoaderError> {
    let opens = |line: &str| match format {
        TemplateFormat::Psi4 => {
            let t = line.trim_start();
            t.starts_with("molecule") && t.contains('{')
        }
        TemplateFormat::QChem => line.trim().eq_ignore_ascii_case("$molecule"),
        TemplateFormat::TeraChem => false,
    };
    let closes = |line: &str| match format {
        TemplateFormat::Psi4 => line.trim() == "}",
        _ => line.trim().eq_ignore_ascii_case("$end"),
    };

    let mut head = Vec::new();
    let mut block_tail = Vec::new();
    let mut tail = Vec::new();
    let mut elements = Vec::new();
    let mut coords = Vec::new();

    // before -> in_block -> after_coords -> done
    let mut phase = 0;
    for line in text.lines() {
        match phase {
            0 => {
                head.push(line.to_string());
                if opens(line) {
                    phase = 1;
                }
            }
            1 => {
                if closes(line) {
                    block_tail.push(line.to_string());
                    phase = 3;
                } else if let Some((element, atom)) = coord_line(line) {
                    elements.push(element);
                    coords.extend(atom);
                    phase = 2;
                } else {
                    head.push(line.to_string());
                }
            }
            2 => {
                if let Some((element, atom)) = coord_line(line) {
                    elements.push(element);
                    coords.extend(atom);
                } else {
                    block_tail.push(line.to_string());
                    if closes(line) {
                        phase = 3;
                    }
                }
            }
            _ => tail.push(line.to_string()),
        }
    }

    if phase < 2 || elements.is_empty() {
        return Err(LoaderError::parse(
            source,
            1,
            "no geometry block with coordinates found in template",
        ));
    }

    Ok(InputTemplate {
        format,
        head,
        block_tail,
        tail,
        elements,
        coords,
        aux_name: None,
    })
}

/// Builds a TeraChem template from the input text plus the frame loaded from
/// its external coordinates file.
pub fn parse_with_coords(
    text: &str,
    coords_name: String,
    frame: &XyzFrame,
) -> Result<InputTemplate, LoaderError> {
    Ok(InputTemplate {
        format: TemplateFormat::TeraChem,
        head: text.lines().map(str::to_string).collect(),
        block_tail: Vec::new(),
        tail: Vec::new(),
        elements: frame.elements.clone(),
        coords: frame.coords.clone(),
        aux_name: Some(coords_name),
    })
}

fn terachem_coords_name(text: &str, source: &str) -> Result<String, LoaderError> {
    for (lineno, line) in text.lines().enumerate() {
        let mut fields = line.split_whitespace();
        if fields.next().is_some_and(|k| k.eq_ignore_ascii_case("coordinates")) {
            return fields.next().map(str::to_string).ok_or_else(|| {
                LoaderError::parse(source, lineno + 1, "coordinates key without a file name")
            });
        }
    }
    Err(LoaderError::parse(source, 1, "no coordinates key in TeraChem input"))
}
