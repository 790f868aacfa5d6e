//! End-to-end scan scenarios driven by the scripted engine, plus shared
//! fixtures.

pub mod server;

use crate::E;
use crate::config::{DEFAULT_ENERGY_DECREASE_THRESH, ScanConfig};
use crate::geometry::Geometry;
use crate::grid::GridPoint;

/// H-O-O-H with the 0-1-2-3 dihedral at `angle` degrees (coordinates in
/// bohr; the values are only plausible, the scanner does not care).
pub fn hooh(angle: E) -> Geometry {
    let rad = angle.to_radians();
    Geometry::new(vec![
        -0.9,
        1.65,
        0.0, // H
        0.0,
        0.0,
        0.0, // O
        2.75,
        0.0,
        0.0, // O
        3.65,
        1.65 * rad.cos(),
        1.65 * rad.sin(), // H
    ])
    .unwrap()
}

/// A five-atom zig-zag chain carrying two scannable dihedrals, 0-1-2-3 and
/// 1-2-3-4, both driven to 0 degrees.
pub fn chain5() -> Geometry {
    let planar = Geometry::new(vec![
        0.0, 0.0, 0.0, //
        2.0, 0.0, 0.0, //
        3.0, 2.0, 0.0, //
        5.0, 2.0, 0.0, //
        6.0, 4.0, 0.0,
    ])
    .unwrap();
    planar
        .with_dihedral([0, 1, 2, 3], 0.0)
        .with_dihedral([1, 2, 3, 4], 0.0)
}

pub fn config_1d(spacing: i32, range: Option<(i32, i32)>, seed_angle: E) -> ScanConfig {
    ScanConfig {
        dihedrals: vec![[0, 1, 2, 3]],
        grid_spacing: vec![spacing],
        dihedral_ranges: vec![range],
        elements: vec!["H".into(), "O".into(), "O".into(), "H".into()],
        init_coords: vec![hooh(seed_angle)],
        energy_decrease_thresh: DEFAULT_ENERGY_DECREASE_THRESH,
    }
}

pub fn config_2d(spacing: i32) -> ScanConfig {
    ScanConfig {
        dihedrals: vec![[0, 1, 2, 3], [1, 2, 3, 4]],
        grid_spacing: vec![spacing, spacing],
        dihedral_ranges: vec![None, None],
        elements: vec!["C".into(); 5],
        init_coords: vec![chain5()],
        energy_decrease_thresh: DEFAULT_ENERGY_DECREASE_THRESH,
    }
}

/// Scripted relaxation: drive every scanned dihedral exactly onto the
/// target grid angles, leaving everything else alone.
pub fn snap(config: &ScanConfig, start: &Geometry, target: &GridPoint) -> Geometry {
    let mut geometry = start.clone();
    for (idxs, &value) in config.dihedrals.iter().zip(target.values()) {
        geometry = geometry.with_dihedral(*idxs, E::from(value));
    }
    geometry
}
