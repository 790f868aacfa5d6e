//! Typed scan configuration.
//!
//! Everything the scanner needs to reproduce a scan lives here: the dihedral
//! atom quadruples, the grid geometry, the element list, and the seed
//! geometries. The configuration is serializable and travels inside the
//! scan state.

use clap::ValueEnum;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

use crate::E;
use crate::geometry::Geometry;
use crate::grid::{GridPoint, TorsionGrid};

/// Supported quantum-chemistry backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Psi4,
    Qchem,
    Terachem,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EngineKind::Psi4 => "psi4",
            EngineKind::Qchem => "qchem",
            EngineKind::Terachem => "terachem",
        })
    }
}

/// Accept a new optimum only when it undercuts the incumbent by more than
/// this (a.u.); guards against oscillation from numerical noise.
pub const DEFAULT_ENERGY_DECREASE_THRESH: E = 1e-5;

fn default_thresh() -> E {
    DEFAULT_ENERGY_DECREASE_THRESH
}

#[derive(Debug, Display, Error, PartialEq)]
pub enum ConfigError {
    #[display("no dihedrals to scan")]
    NoDihedrals,
    #[display("{spacings} grid spacing value(s) for {dihedrals} dihedral(s)")]
    SpacingCount { spacings: usize, dihedrals: usize },
    #[display("{ranges} range limit(s) for {dihedrals} dihedral(s)")]
    RangeCount { ranges: usize, dihedrals: usize },
    #[display("grid spacing {spacing} is not in 1..=180 degrees")]
    BadSpacing { spacing: i32 },
    #[display("dihedral range [{low}, {high}] must satisfy -180 <= low < high <= 180")]
    BadRange { low: i32, high: i32 },
    #[display("dihedral atom index {index} out of bounds for {natoms} atoms")]
    AtomIndex { index: usize, natoms: usize },
    #[display("dihedral {dim} repeats an atom index")]
    DegenerateDihedral { dim: usize },
    #[display("geometry has {found} coordinates, expected {expected}")]
    AtomCount { expected: usize, found: usize },
    #[display("no starting geometries")]
    NoSeeds,
    #[display(
        "starting geometry {seed} has dihedral {angle:.2} deg, outside the range of dimension {dim}"
    )]
    SeedOutsideRange { seed: usize, dim: usize, angle: E },
    #[display("dihedral {dim} is scanned and may not appear in the extra constraints")]
    ScannedDihedralConstrained { dim: usize },
}

/// The immutable description of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Zero-based atom index quadruples, one per scanned dihedral.
    pub dihedrals: Vec<[usize; 4]>,
    /// Grid spacing in degrees per dihedral.
    pub grid_spacing: Vec<i32>,
    /// Per-dihedral range limit, `None` for a full wrapping circle.
    pub dihedral_ranges: Vec<Option<(i32, i32)>>,
    /// Element symbols, fixed across the whole scan.
    pub elements: Vec<String>,
    /// Seed geometries in bohr; every one starts its own wavefront.
    pub init_coords: Vec<Geometry>,
    #[serde(default = "default_thresh")]
    pub energy_decrease_thresh: E,
}

impl ScanConfig {
    /// Validates the configuration and returns the scan lattice.
    pub fn validate(&self) -> Result<TorsionGrid, ConfigError> {
        if self.dihedrals.is_empty() {
            return Err(ConfigError::NoDihedrals);
        }
        if self.grid_spacing.len() != self.dihedrals.len() {
            return Err(ConfigError::SpacingCount {
                spacings: self.grid_spacing.len(),
                dihedrals: self.dihedrals.len(),
            });
        }
        if self.dihedral_ranges.len() != self.dihedrals.len() {
            return Err(ConfigError::RangeCount {
                ranges: self.dihedral_ranges.len(),
                dihedrals: self.dihedrals.len(),
            });
        }
        let grid = TorsionGrid::new(self.grid_spacing.clone(), self.dihedral_ranges.clone())?;

        let natoms = self.elements.len();
        for (dim, idxs) in self.dihedrals.iter().enumerate() {
            for &index in idxs {
                if index >= natoms {
                    return Err(ConfigError::AtomIndex { index, natoms });
                }
            }
            let mut sorted = *idxs;
            sorted.sort_unstable();
            if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
                return Err(ConfigError::DegenerateDihedral { dim });
            }
        }
        if self.init_coords.is_empty() {
            return Err(ConfigError::NoSeeds);
        }
        for geometry in &self.init_coords {
            if geometry.natoms() != natoms {
                return Err(ConfigError::AtomCount {
                    expected: 3 * natoms,
                    found: geometry.coords().len(),
                });
            }
        }
        self.seed_points(&grid)?;
        Ok(grid)
    }

    /// Measured dihedral angles of `geometry`, in scan-dimension order.
    pub fn measure(&self, geometry: &Geometry) -> Vec<E> {
        self.dihedrals
            .iter()
            .map(|&idxs| geometry.dihedral(idxs))
            .collect()
    }

    /// Quantized starting grid point for every seed geometry. A seed whose
    /// dihedral falls outside a configured range is a configuration error.
    pub fn seed_points(&self, grid: &TorsionGrid) -> Result<Vec<GridPoint>, ConfigError> {
        self.init_coords
            .iter()
            .enumerate()
            .map(|(seed, geometry)| {
                let angles = self.measure(geometry);
                for (dim, &angle) in angles.iter().enumerate() {
                    if grid.quantize_angle(dim, angle).is_none() {
                        return Err(ConfigError::SeedOutsideRange { seed, dim, angle });
                    }
                }
                Ok(grid.quantize(&angles).expect("all dimensions quantized"))
            })
            .collect()
    }
}
