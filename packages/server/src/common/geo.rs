//! Integer grid coordinates and the Manhattan metric.

use serde::{Deserialize, Serialize};

/// A point on the integer grid. No bounds are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: i64,
    pub longitude: i64,
}

impl Coordinate {
    pub fn new(latitude: i64, longitude: i64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Manhattan distance `|Δlat| + |Δlon|` to another point.
    pub fn manhattan_distance(&self, other: &Coordinate) -> i64 {
        (self.latitude - other.latitude).abs() + (self.longitude - other.longitude).abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manhattan_distance() {
        let a = Coordinate::new(0, 0);
        let b = Coordinate::new(10, 10);
        assert_eq!(a.manhattan_distance(&b), 20);
        assert_eq!(b.manhattan_distance(&a), 20);
    }

    #[test]
    fn test_manhattan_distance_negative_axes() {
        let a = Coordinate::new(-5, 3);
        let b = Coordinate::new(2, -4);
        assert_eq!(a.manhattan_distance(&b), 14);
    }

    #[test]
    fn test_manhattan_distance_same_point_is_zero() {
        let a = Coordinate::new(42, -7);
        assert_eq!(a.manhattan_distance(&a), 0);
    }
}
