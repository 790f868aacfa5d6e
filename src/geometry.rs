//! Molecular geometries as flat coordinate vectors in bohr, plus the
//! dihedral-angle measurement and manipulation the scanner needs.

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

use crate::E;

#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("geometry length {len} is not a multiple of 3")]
pub struct GeometryError {
    pub len: usize,
}

/// A fixed-size molecular geometry: `3 * natoms` coordinates in bohr.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Geometry(Vec<E>);

impl Geometry {
    pub fn new(coords: Vec<E>) -> Result<Self, GeometryError> {
        if coords.len() % 3 != 0 {
            return Err(GeometryError { len: coords.len() });
        }
        Ok(Geometry(coords))
    }

    pub fn natoms(&self) -> usize {
        self.0.len() / 3
    }

    pub fn coords(&self) -> &[E] {
        &self.0
    }

    pub fn into_coords(self) -> Vec<E> {
        self.0
    }

    fn atom(&self, i: usize) -> [E; 3] {
        [self.0[3 * i], self.0[3 * i + 1], self.0[3 * i + 2]]
    }

    fn set_atom(&mut self, i: usize, p: [E; 3]) {
        self.0[3 * i..3 * i + 3].copy_from_slice(&p);
    }

    /// Signed dihedral angle over atoms `[i, j, k, l]` in degrees, in
    /// `(-180, 180]`.
    ///
    /// Atom indices must be in bounds; callers validate them at
    /// configuration time.
    pub fn dihedral(&self, idxs: [usize; 4]) -> E {
        let [i, j, k, l] = idxs;
        let b0 = sub(self.atom(i), self.atom(j));
        let b1 = unit(sub(self.atom(k), self.atom(j)));
        let b2 = sub(self.atom(l), self.atom(k));

        // Projections of the outer bonds onto the plane normal to the axis.
        let v = sub(b0, scale(b1, dot(b0, b1)));
        let w = sub(b2, scale(b1, dot(b2, b1)));

        let x = dot(v, w);
        let y = dot(cross(b1, v), w);
        y.atan2(x).to_degrees()
    }

    /// Returns a copy with the dihedral over `idxs` driven to `angle`
    /// degrees by rotating the trailing atom about the central bond.
    ///
    /// Only atom `l` moves; callers that need rigid-group rotation must
    /// bring their own bond topology.
    pub fn with_dihedral(&self, idxs: [usize; 4], angle: E) -> Geometry {
        let [_, j, k, l] = idxs;
        let delta = (angle - self.dihedral(idxs)).to_radians();
        let axis = unit(sub(self.atom(k), self.atom(j)));
        let origin = self.atom(k);

        let mut out = self.clone();
        out.set_atom(l, rotate_about(self.atom(l), origin, axis, delta));
        out
    }
}

fn sub(a: [E; 3], b: [E; 3]) -> [E; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn add(a: [E; 3], b: [E; 3]) -> [E; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scale(a: [E; 3], s: E) -> [E; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn dot(a: [E; 3], b: [E; 3]) -> E {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [E; 3], b: [E; 3]) -> [E; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn unit(a: [E; 3]) -> [E; 3] {
    scale(a, 1.0 / dot(a, a).sqrt())
}

/// Rodrigues rotation of `p` about the line through `origin` along the unit
/// vector `axis` by `angle` radians.
fn rotate_about(p: [E; 3], origin: [E; 3], axis: [E; 3], angle: E) -> [E; 3] {
    let r = sub(p, origin);
    let (sin, cos) = angle.sin_cos();
    let rotated = add(
        add(scale(r, cos), scale(cross(axis, r), sin)),
        scale(axis, dot(axis, r) * (1.0 - cos)),
    );
    add(rotated, origin)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    /// H-O-O-H with the H-O-O-H dihedral at `angle` degrees.
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

    #[rstest]
    #[case(0.0)]
    #[case(60.0)]
    #[case(-60.0)]
    #[case(179.0)]
    #[case(-90.0)]
    fn dihedral_matches_construction(#[case] angle: E) {
        let geo = hooh(angle);
        assert!((geo.dihedral([0, 1, 2, 3]) - angle).abs() < 1e-9);
    }

    #[rstest]
    #[case(0.0, 120.0)]
    #[case(60.0, -60.0)]
    #[case(-150.0, 30.0)]
    fn with_dihedral_hits_the_target(#[case] from: E, #[case] to: E) {
        let geo = hooh(from).with_dihedral([0, 1, 2, 3], to);
        assert!((geo.dihedral([0, 1, 2, 3]) - to).abs() < 1e-9);
        // Only the trailing atom moved.
        assert_eq!(geo.coords()[..9], hooh(from).coords()[..9]);
    }

    #[test]
    fn dihedral_sign_flips_with_mirror() {
        let geo = hooh(45.0);
        let mut mirrored = geo.coords().to_vec();
        for z in mirrored.iter_mut().skip(2).step_by(3) {
            *z = -*z;
        }
        let mirrored = Geometry::new(mirrored).unwrap();
        assert!((geo.dihedral([0, 1, 2, 3]) + mirrored.dihedral([0, 1, 2, 3])).abs() < 1e-9);
    }

    #[test]
    fn rejects_ragged_coordinates() {
        assert!(Geometry::new(vec![0.0; 7]).is_err());
    }
}
