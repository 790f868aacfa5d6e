//! Dihedral definition files.
//!
//! One dihedral per line as whitespace-separated integers: either four atom
//! indices `i j k l`, or six values `i j k l low high` where `low`/`high` are
//! inclusive range limits in degrees. Lines starting with `#` are comments;
//! the directive `#zero_based_numbering` switches atom indices to zero-based
//! (`#one_based_numbering` restates the default and conflicts with it).
//! Indices are one-based by default and always returned zero-based.

use std::path::Path;

use crate::LoaderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DihedralFile {
    /// Zero-based atom index quadruples, in file order.
    pub dihedrals: Vec<[usize; 4]>,
    /// Per-dihedral range limit, `None` for a full wrapping circle.
    pub ranges: Vec<Option<(i32, i32)>>,
    /// Whether the file (or the caller) selected zero-based numbering.
    pub zero_based: bool,
}

pub fn load(path: &Path, zero_based: bool) -> Result<DihedralFile, LoaderError> {
    let text = std::fs::read_to_string(path)?;
    parse(&text, &path.display().to_string(), zero_based)
}

pub fn parse(text: &str, source: &str, zero_based: bool) -> Result<DihedralFile, LoaderError> {
    let mut zero_based = zero_based;
    let mut dihedrals = Vec::new();
    let mut ranges = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            match comment.trim().to_lowercase().as_str() {
                "zero_based_numbering" => zero_based = true,
                "one_based_numbering" if zero_based => {
                    return Err(LoaderError::parse(
                        source,
                        lineno,
                        "cannot request both zero_based_numbering and one_based_numbering",
                    ));
                }
                _ => {}
            }
            continue;
        }

        let fields: Vec<i64> = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<i64>().map_err(|_| {
                    LoaderError::parse(source, lineno, format!("not an integer: {tok:?}"))
                })
            })
            .collect::<Result<_, _>>()?;

        let range = match fields.len() {
            4 => None,
            6 => {
                let (low, high) = (fields[4], fields[5]);
                if !(-180..=180).contains(&low) || !(-180..=180).contains(&high) || low >= high {
                    return Err(LoaderError::parse(
                        source,
                        lineno,
                        format!("range [{low}, {high}] must satisfy -180 <= low < high <= 180"),
                    ));
                }
                Some((low as i32, high as i32))
            }
            n => {
                return Err(LoaderError::parse(
                    source,
                    lineno,
                    format!("expected 4 or 6 integers, found {n}"),
                ));
            }
        };

        let offset = if zero_based { 0 } else { 1 };
        let mut idxs = [0usize; 4];
        for (slot, &field) in idxs.iter_mut().zip(&fields[..4]) {
            if field < offset {
                return Err(LoaderError::parse(
                    source,
                    lineno,
                    format!("atom index {field} must be >= {offset}"),
                ));
            }
            *slot = (field - offset) as usize;
        }

        dihedrals.push(idxs);
        ranges.push(range);
    }

    if dihedrals.is_empty() {
        return Err(LoaderError::parse(source, 1, "no dihedral definitions found"));
    }

    Ok(DihedralFile {
        dihedrals,
        ranges,
        zero_based,
    })
}
