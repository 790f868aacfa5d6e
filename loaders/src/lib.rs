//! Loaders for the external file formats a dihedral scan touches: dihedral
//! definition files, multi-frame XYZ geometry files, QM input templates, and
//! geomeTRIC-style constraint files.
//!
//! All coordinates cross this crate's boundary in Angstrom, matching the file
//! formats; the scanner converts to bohr at its own edge.

pub mod constraints;
pub mod dihedrals;
pub mod template;
pub mod xyz;

use derive_more::{Display, Error, From};

/// Conversion factor from Angstrom to bohr (CODATA 2018).
pub const BOHR_PER_ANGSTROM: f64 = 1.889_726_125_457_828;

#[derive(Debug, Display, Error, From)]
pub enum LoaderError {
    #[display("i/o error: {source}")]
    Io { source: std::io::Error },
    /// A line that could not be interpreted, with its origin and line number.
    #[display("{path}:{line}: {message}")]
    #[from(ignore)]
    Parse {
        path: String,
        line: usize,
        message: String,
    },
}

impl LoaderError {
    pub(crate) fn parse(path: &str, line: usize, message: impl Into<String>) -> Self {
        LoaderError::Parse {
            path: path.to_string(),
            line,
            message: message.into(),
        }
    }
}
