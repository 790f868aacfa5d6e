//! The torsion grid: a discrete N-torus of integer dihedral angles.
//!
//! Each dimension has an integer spacing and either wraps the full circle
//! (canonical values in `[-180, 180)`) or is limited to a configured
//! `[low, high]` range. Grid values on a dimension are exactly
//! `{low + k * spacing <= high}` with `low = -180` for wrapping dimensions;
//! a spacing that does not divide the span truncates the axis at the high
//! end.

use std::fmt;
use std::str::FromStr;

use derive_more::{Display, Error};
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::E;
use crate::config::ConfigError;

/// One lattice site: an ordered tuple of integer dihedral angles in degrees.
///
/// Ordering is lexicographic over the integer tuple; the `Display`/`FromStr`
/// pair is the comma-joined string encoding used at every serialization
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridPoint(Vec<i32>);

impl GridPoint {
    pub fn new(values: Vec<i32>) -> Self {
        GridPoint(values)
    }

    pub fn values(&self) -> &[i32] {
        &self.0
    }

    pub fn dims(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for GridPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join(","))
    }
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("not a grid point: {text:?}")]
pub struct ParseGridPointError {
    pub text: String,
}

impl FromStr for GridPoint {
    type Err = ParseGridPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(GridPoint(Vec::new()));
        }
        s.split(',')
            .map(|tok| tok.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map(GridPoint)
            .map_err(|_| ParseGridPointError {
                text: s.to_string(),
            })
    }
}

impl Serialize for GridPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GridPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// The scan lattice: per-dimension spacings and optional range limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorsionGrid {
    spacings: Vec<i32>,
    ranges: Vec<Option<(i32, i32)>>,
}

impl TorsionGrid {
    pub fn new(spacings: Vec<i32>, ranges: Vec<Option<(i32, i32)>>) -> Result<Self, ConfigError> {
        if spacings.len() != ranges.len() {
            return Err(ConfigError::RangeCount {
                ranges: ranges.len(),
                dihedrals: spacings.len(),
            });
        }
        for &spacing in &spacings {
            if !(1..=180).contains(&spacing) {
                return Err(ConfigError::BadSpacing { spacing });
            }
        }
        for range in ranges.iter().flatten() {
            let (low, high) = *range;
            if low < -180 || high > 180 || low >= high {
                return Err(ConfigError::BadRange { low, high });
            }
        }
        Ok(TorsionGrid { spacings, ranges })
    }

    pub fn dims(&self) -> usize {
        self.spacings.len()
    }

    pub fn spacing(&self, d: usize) -> i32 {
        self.spacings[d]
    }

    pub fn range(&self, d: usize) -> Option<(i32, i32)> {
        self.ranges[d]
    }

    /// `(low, count)` for dimension `d`: the axis is `low + k * spacing` for
    /// `k` in `0..count`.
    fn axis(&self, d: usize) -> (i32, i32) {
        let spacing = self.spacings[d];
        match self.ranges[d] {
            None => (-180, (360 + spacing - 1) / spacing),
            Some((low, high)) => (low, (high - low) / spacing + 1),
        }
    }

    fn axis_values(&self, d: usize) -> Vec<i32> {
        let (low, count) = self.axis(d);
        (0..count).map(|k| low + k * self.spacings[d]).collect()
    }

    /// All grid points, in dimension-major lexicographic order.
    pub fn enumerate(&self) -> Vec<GridPoint> {
        if self.dims() == 0 {
            return vec![GridPoint(Vec::new())];
        }
        (0..self.dims())
            .map(|d| self.axis_values(d))
            .multi_cartesian_product()
            .map(GridPoint)
            .collect()
    }

    pub fn contains(&self, p: &GridPoint) -> bool {
        p.dims() == self.dims()
            && p.0.iter().enumerate().all(|(d, &v)| {
                let (low, count) = self.axis(d);
                v >= low && (v - low) % self.spacings[d] == 0 && (v - low) / self.spacings[d] < count
            })
    }

    /// Grid points one step away from `p`: for each dimension the `+spacing`
    /// step first, then `-spacing`. Wrapping dimensions wrap modulo 360 into
    /// `[-180, 180)`; limited dimensions drop steps leaving their range. A
    /// wrapped step that misses the lattice (truncated axis) is dropped too.
    pub fn neighbors(&self, p: &GridPoint) -> Vec<GridPoint> {
        debug_assert_eq!(p.dims(), self.dims());
        let mut out = Vec::with_capacity(2 * self.dims());
        for d in 0..self.dims() {
            for step in [self.spacings[d], -self.spacings[d]] {
                let v = p.0[d] + step;
                let v = match self.ranges[d] {
                    None => wrap_i(v),
                    Some((low, high)) => {
                        if v < low || v > high {
                            continue;
                        }
                        v
                    }
                };
                let mut q = p.clone();
                q.0[d] = v;
                if self.contains(&q) {
                    out.push(q);
                }
            }
        }
        out
    }

    /// Nearest legal grid value for dimension `d`, or `None` when `value`
    /// falls outside the configured range (beyond half a spacing past either
    /// end). An exact half rounds toward the candidate with the larger
    /// absolute angle.
    pub fn quantize_angle(&self, d: usize, value: E) -> Option<i32> {
        let spacing = self.spacings[d];
        let s = spacing as E;
        let (low, count) = self.axis(d);
        match self.ranges[d] {
            None => {
                let k = nearest_step(wrap_f(value), low as E, s);
                // Values near +180 can round one past the last axis value:
                // onto the seam (wraps to -180) when the spacing divides the
                // circle, onto the last value when the axis is truncated.
                let k = if k >= i64::from(count) {
                    if 360 % spacing == 0 { 0 } else { i64::from(count) - 1 }
                } else {
                    k
                };
                Some(low + k as i32 * spacing)
            }
            Some(_) => {
                let k = nearest_step(value, low as E, s);
                if k < 0 || k >= i64::from(count) {
                    return None;
                }
                Some(low + k as i32 * spacing)
            }
        }
    }

    /// Quantizes a full tuple of measured dihedral angles (degrees), or
    /// `None` if any dimension falls outside its range.
    pub fn quantize(&self, angles: &[E]) -> Option<GridPoint> {
        debug_assert_eq!(angles.len(), self.dims());
        angles
            .iter()
            .enumerate()
            .map(|(d, &a)| self.quantize_angle(d, a))
            .collect::<Option<Vec<_>>>()
            .map(GridPoint)
    }
}

/// Nearest integer step count for `(value - low) / s`, breaking exact halves
/// toward the candidate angle with the larger magnitude.
fn nearest_step(value: E, low: E, s: E) -> i64 {
    let q = (value - low) / s;
    let kf = q.floor();
    if (q - kf - 0.5).abs() <= 1e-9 {
        let lo_v = low + kf * s;
        let hi_v = lo_v + s;
        if hi_v.abs() >= lo_v.abs() {
            kf as i64 + 1
        } else {
            kf as i64
        }
    } else {
        q.round() as i64
    }
}

/// Wraps an integer angle into `[-180, 180)`.
pub fn wrap_i(v: i32) -> i32 {
    (v + 180).rem_euclid(360) - 180
}

/// Wraps a float angle into `[-180.0, 180.0)`.
pub fn wrap_f(v: E) -> E {
    (v + 180.0).rem_euclid(360.0) - 180.0
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn grid_1d(spacing: i32, range: Option<(i32, i32)>) -> TorsionGrid {
        TorsionGrid::new(vec![spacing], vec![range]).unwrap()
    }

    #[test]
    fn enumerate_full_circle() {
        let points = grid_1d(60, None).enumerate();
        let values: Vec<i32> = points.iter().map(|p| p.values()[0]).collect();
        assert_eq!(values, [-180, -120, -60, 0, 60, 120]);
    }

    #[test]
    fn enumerate_with_range() {
        let points = grid_1d(60, Some((-120, 120))).enumerate();
        let values: Vec<i32> = points.iter().map(|p| p.values()[0]).collect();
        assert_eq!(values, [-120, -60, 0, 60, 120]);
    }

    #[test]
    fn enumerate_truncates_uneven_spacing() {
        // 50 does not divide the span; the axis stops short of the high end.
        let values: Vec<i32> = grid_1d(50, Some((-100, 120)))
            .enumerate()
            .iter()
            .map(|p| p.values()[0])
            .collect();
        assert_eq!(values, [-100, -50, 0, 50, 100]);
    }

    #[test]
    fn enumerate_2d_is_dimension_major() {
        let grid = TorsionGrid::new(vec![90, 90], vec![None, None]).unwrap();
        let points = grid.enumerate();
        assert_eq!(points.len(), 16);
        assert_eq!(points[0].values(), [-180, -180]);
        assert_eq!(points[1].values(), [-180, -90]);
        assert_eq!(points[4].values(), [-90, -180]);
    }

    #[test]
    fn neighbors_wrap_and_order() {
        let grid = grid_1d(60, None);
        let n = grid.neighbors(&GridPoint::new(vec![120]));
        // +spacing first; 180 wraps onto -180.
        assert_eq!(n, [GridPoint::new(vec![-180]), GridPoint::new(vec![60])]);
    }

    #[test]
    fn neighbors_respect_range_limits() {
        let grid = grid_1d(60, Some((-120, 120)));
        let n = grid.neighbors(&GridPoint::new(vec![120]));
        assert_eq!(n, [GridPoint::new(vec![60])]);
    }

    #[test]
    fn neighbors_2d_enumerates_each_dimension() {
        let grid = TorsionGrid::new(vec![90, 90], vec![None, None]).unwrap();
        let n = grid.neighbors(&GridPoint::new(vec![0, 0]));
        let expected: Vec<GridPoint> = [[90, 0], [-90, 0], [0, 90], [0, -90]]
            .iter()
            .map(|v| GridPoint::new(v.to_vec()))
            .collect();
        assert_eq!(n, expected);
    }

    #[test]
    fn neighbor_set_can_be_empty() {
        // Range shorter than the spacing: a single point with no neighbors.
        let grid = grid_1d(120, Some((-30, 30)));
        assert_eq!(grid.enumerate().len(), 1);
        assert!(grid.neighbors(&GridPoint::new(vec![-30])).is_empty());
    }

    #[rstest]
    #[case(0.0, 0)]
    #[case(29.9, 60)]
    #[case(-29.9, -60)]
    #[case(30.0, 60)] // exact half rounds away from zero
    #[case(-30.0, -60)]
    #[case(150.0, -180)] // away from zero onto the seam
    #[case(179.9, -180)]
    #[case(-179.9, -180)]
    #[case(359.0, 0)] // wraps before quantizing
    fn quantize_full_circle(#[case] angle: E, #[case] expected: i32) {
        assert_eq!(grid_1d(60, None).quantize_angle(0, angle), Some(expected));
    }

    #[rstest]
    #[case(-120.4, Some(-120))]
    #[case(119.0, Some(120))]
    #[case(149.9, Some(120))] // within half a spacing of the last value
    #[case(151.0, None)] // discarded beyond the range
    #[case(-151.0, None)]
    fn quantize_with_range(#[case] angle: E, #[case] expected: Option<i32>) {
        assert_eq!(
            grid_1d(60, Some((-120, 120))).quantize_angle(0, angle),
            expected
        );
    }

    #[test]
    fn quantize_tuple() {
        let grid = TorsionGrid::new(vec![60, 90], vec![None, Some((-90, 90))]).unwrap();
        assert_eq!(
            grid.quantize(&[59.0, -89.0]),
            Some(GridPoint::new(vec![60, -90]))
        );
        assert_eq!(grid.quantize(&[59.0, -170.0]), None);
    }

    #[test]
    fn contains_checks_the_lattice() {
        let grid = grid_1d(60, None);
        assert!(grid.contains(&GridPoint::new(vec![-180])));
        assert!(grid.contains(&GridPoint::new(vec![120])));
        assert!(!grid.contains(&GridPoint::new(vec![180])));
        assert!(!grid.contains(&GridPoint::new(vec![30])));
        assert!(!grid.contains(&GridPoint::new(vec![0, 0])));
    }

    #[test]
    fn grid_point_string_round_trip() {
        let p = GridPoint::new(vec![30, -90, 180]);
        assert_eq!(p.to_string(), "30,-90,180");
        assert_eq!("30,-90,180".parse::<GridPoint>().unwrap(), p);
        assert!("30,x".parse::<GridPoint>().is_err());
    }

    #[rstest]
    #[case(vec![0], vec![None])]
    #[case(vec![181], vec![None])]
    #[case(vec![60], vec![Some((-190, 0))])]
    #[case(vec![60], vec![Some((120, 120))])]
    #[case(vec![60], vec![])]
    fn rejects_bad_configuration(
        #[case] spacings: Vec<i32>,
        #[case] ranges: Vec<Option<(i32, i32)>>,
    ) {
        assert!(TorsionGrid::new(spacings, ranges).is_err());
    }
}
