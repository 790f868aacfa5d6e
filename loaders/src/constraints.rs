//! geomeTRIC-style constraint files: `$freeze` and `$set` blocks whose lines
//! name an internal coordinate (`distance`, `angle`, `dihedral`, `xyz`) and
//! its one-based atom indices, plus a target value inside `$set`.
//!
//! Atom indices are returned zero-based; [`render`] converts back.

use std::fmt::Write as _;

use crate::LoaderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintBlock {
    Freeze,
    Set,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintEntry {
    pub block: ConstraintBlock,
    /// Coordinate kind as written (`distance`, `angle`, `dihedral`, `xyz`).
    pub kind: String,
    /// Zero-based atom indices.
    pub atoms: Vec<usize>,
    /// Target value; present iff the entry sits in a `$set` block.
    pub value: Option<f64>,
}

fn arity(kind: &str) -> Option<usize> {
    match kind {
        "xyz" => Some(1),
        "distance" => Some(2),
        "angle" => Some(3),
        "dihedral" => Some(4),
        _ => None,
    }
}

pub fn parse(text: &str, source: &str) -> Result<Vec<ConstraintEntry>, LoaderError> {
    let mut entries = Vec::new();
    let mut block = None;

    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('$') {
            block = match name.trim().to_lowercase().as_str() {
                "freeze" => Some(ConstraintBlock::Freeze),
                "set" => Some(ConstraintBlock::Set),
                "end" => None,
                other => {
                    return Err(LoaderError::parse(
                        source,
                        lineno,
                        format!("unsupported constraint block ${other}"),
                    ));
                }
            };
            continue;
        }

        let Some(block) = block else {
            return Err(LoaderError::parse(
                source,
                lineno,
                "constraint line outside of a $freeze/$set block",
            ));
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        let kind = fields[0].to_lowercase();
        let Some(n_atoms) = arity(&kind) else {
            return Err(LoaderError::parse(
                source,
                lineno,
                format!("unknown coordinate kind {kind:?}"),
            ));
        };
        let expected = n_atoms + usize::from(block == ConstraintBlock::Set);
        if fields.len() != 1 + expected {
            return Err(LoaderError::parse(
                source,
                lineno,
                format!("{kind} expects {expected} fields after the kind"),
            ));
        }

        let mut atoms = Vec::with_capacity(n_atoms);
        for tok in &fields[1..1 + n_atoms] {
            let index: usize = tok.parse().map_err(|_| {
                LoaderError::parse(source, lineno, format!("not an atom index: {tok:?}"))
            })?;
            if index == 0 {
                return Err(LoaderError::parse(source, lineno, "atom indices are one-based"));
            }
            atoms.push(index - 1);
        }

        let value = if block == ConstraintBlock::Set {
            Some(fields[1 + n_atoms].parse::<f64>().map_err(|_| {
                LoaderError::parse(
                    source,
                    lineno,
                    format!("not a value: {:?}", fields[1 + n_atoms]),
                )
            })?)
        } else {
            None
        };

        entries.push(ConstraintEntry {
            block,
            kind,
            atoms,
            value,
        });
    }

    Ok(entries)
}

/// Formats entries back into `$freeze`/`$set` blocks with one-based indices.
pub fn render(entries: &[ConstraintEntry]) -> String {
    let mut out = String::new();
    for wanted in [ConstraintBlock::Freeze, ConstraintBlock::Set] {
        let group: Vec<&ConstraintEntry> = entries.iter().filter(|e| e.block == wanted).collect();
        if group.is_empty() {
            continue;
        }
        let _ = writeln!(
            out,
            "{}",
            match wanted {
                ConstraintBlock::Freeze => "$freeze",
                ConstraintBlock::Set => "$set",
            }
        );
        for entry in group {
            let _ = write!(out, "{}", entry.kind);
            for atom in &entry.atoms {
                let _ = write!(out, " {}", atom + 1);
            }
            if let Some(value) = entry.value {
                let _ = write!(out, " {value}");
            }
            let _ = writeln!(out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_and_set_blocks() {
        let text = "$freeze\ndistance 1 2\n$set\ndihedral 1 2 3 4 120.0\n";
        let entries = parse(text, "test").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].block, ConstraintBlock::Freeze);
        assert_eq!(entries[0].atoms, [0, 1]);
        assert_eq!(entries[0].value, None);
        assert_eq!(entries[1].atoms, [0, 1, 2, 3]);
        assert_eq!(entries[1].value, Some(120.0));
    }

    #[test]
    fn round_trip() {
        let text = "$freeze\nangle 2 3 4\n$set\ndistance 1 2 1.5\n";
        let entries = parse(text, "test").unwrap();
        let reparsed = parse(&render(&entries), "test").unwrap();
        assert_eq!(entries, reparsed);
    }

    #[test]
    fn comments_are_stripped() {
        let entries = parse("$freeze\ndihedral 1 2 3 4 # backbone\n", "test").unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("dihedral 1 2 3 4\n", "test").is_err()); // outside a block
        assert!(parse("$scan\ndihedral 1 2 3 4 0 120 7\n", "test").is_err());
        assert!(parse("$set\ndihedral 1 2 3 120.0\n", "test").is_err());
        assert!(parse("$freeze\ndihedral 0 1 2 3\n", "test").is_err());
        assert!(parse("$set\nbond 1 2 1.0\n", "test").is_err());
    }
}
