//! Multi-frame XYZ files: an atom count line, a comment line, then one
//! `element x y z` line per atom, repeated per frame. Coordinates in Angstrom.

use std::fmt::Write as _;
use std::path::Path;

use crate::LoaderError;

#[derive(Debug, Clone, PartialEq)]
pub struct XyzFrame {
    pub elements: Vec<String>,
    /// Flat `3 * natoms` coordinates in Angstrom.
    pub coords: Vec<f64>,
    pub comment: String,
}

pub fn load(path: &Path) -> Result<Vec<XyzFrame>, LoaderError> {
    let text = std::fs::read_to_string(path)?;
    parse(&text, &path.display().to_string())
}

pub fn parse(text: &str, source: &str) -> Result<Vec<XyzFrame>, LoaderError> {
    let mut frames = Vec::new();
    let mut lines = text.lines().enumerate();

    while let Some((lineno, header)) = lines.next() {
        if header.trim().is_empty() {
            continue; // blank lines between or after frames
        }
        let natoms: usize = header.trim().parse().map_err(|_| {
            LoaderError::parse(source, lineno + 1, format!("expected atom count, found {:?}", header.trim()))
        })?;
        let comment = lines
            .next()
            .ok_or_else(|| LoaderError::parse(source, lineno + 2, "missing comment line"))?
            .1
            .to_string();

        let mut elements = Vec::with_capacity(natoms);
        let mut coords = Vec::with_capacity(3 * natoms);
        for _ in 0..natoms {
            let (atom_lineno, line) = lines
                .next()
                .ok_or_else(|| LoaderError::parse(source, lineno + 1, "truncated frame"))?;
            let mut fields = line.split_whitespace();
            let element = fields
                .next()
                .ok_or_else(|| LoaderError::parse(source, atom_lineno + 1, "empty atom line"))?;
            elements.push(element.to_string());
            for _ in 0..3 {
                let tok = fields.next().ok_or_else(|| {
                    LoaderError::parse(source, atom_lineno + 1, "expected 3 coordinates")
                })?;
                coords.push(tok.parse::<f64>().map_err(|_| {
                    LoaderError::parse(source, atom_lineno + 1, format!("not a number: {tok:?}"))
                })?);
            }
        }
        frames.push(XyzFrame {
            elements,
            coords,
            comment,
        });
    }

    if frames.is_empty() {
        return Err(LoaderError::parse(source, 1, "no frames found"));
    }
    Ok(frames)
}

/// Formats a single frame; `coords` in Angstrom.
pub fn render(elements: &[String], coords: &[f64], comment: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", elements.len());
    let _ = writeln!(out, "{comment}");
    for (element, xyz) in elements.iter().zip(coords.chunks_exact(3)) {
        let _ = writeln!(
            out,
            "{:<4}{:>16.10}{:>16.10}{:>16.10}",
            element, xyz[0], xyz[1], xyz[2]
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    static HOOH: &str = "4\nhydrogen peroxide\nH -0.9 1.65 0.0\nO 0.0 0.0 0.0\nO 2.75 0.0 0.0\nH 3.65 1.65 0.0\n";

    #[test]
    fn single_frame() {
        let frames = parse(HOOH, "test").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].elements, ["H", "O", "O", "H"]);
        assert_eq!(frames[0].coords.len(), 12);
        assert_eq!(frames[0].coords[3..6], [0.0, 0.0, 0.0]);
    }

    #[test]
    fn multiple_frames() {
        let text = format!("{HOOH}{HOOH}");
        let frames = parse(&text, "test").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);
    }

    #[test]
    fn round_trip() {
        let frames = parse(HOOH, "test").unwrap();
        let text = render(&frames[0].elements, &frames[0].coords, "hydrogen peroxide");
        let reparsed = parse(&text, "test").unwrap();
        assert_eq!(frames, reparsed);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        assert!(parse("4\ncomment\nH 0 0 0\n", "test").is_err());
        assert!(parse("x\ncomment\n", "test").is_err());
    }
}
