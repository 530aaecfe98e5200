use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Integer block coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[i32; 3]", into = "[i32; 3]")]
pub struct Vec3I {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Vec3I {
    pub const ZERO: Vec3I = Vec3I::new(0, 0, 0);

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Component-wise maximum.
    pub fn max(self, other: Vec3I) -> Vec3I {
        Vec3I::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
        )
    }

    /// Component-wise minimum.
    pub fn min(self, other: Vec3I) -> Vec3I {
        Vec3I::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    pub fn offset(self, direction: Direction) -> Vec3I {
        self + direction.unit()
    }

    pub fn as_array(self) -> [i32; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[i32; 3]> for Vec3I {
    fn from(value: [i32; 3]) -> Self {
        Vec3I::new(value[0], value[1], value[2])
    }
}

impl From<Vec3I> for [i32; 3] {
    fn from(value: Vec3I) -> Self {
        value.as_array()
    }
}

impl Add for Vec3I {
    type Output = Vec3I;

    fn add(self, rhs: Self) -> Self::Output {
        Vec3I::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3I {
    type Output = Vec3I;

    fn sub(self, rhs: Self) -> Self::Output {
        Vec3I::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Vec3I {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Floating point entity coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3D {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Centre of the bottom face of a block, where rails and minecarts sit.
    pub fn block_floor_centre(block: Vec3I) -> Self {
        Vec3D::new(
            block.x as f64 + 0.5,
            block.y as f64,
            block.z as f64 + 0.5,
        )
    }

    pub fn floor(self) -> Vec3I {
        Vec3I::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.z.floor() as i32,
        )
    }

    pub fn ceil(self) -> Vec3I {
        Vec3I::new(
            self.x.ceil() as i32,
            self.y.ceil() as i32,
            self.z.ceil() as i32,
        )
    }
}

/// One of the six axis-aligned block faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Down,
    Up,
    North,
    South,
    West,
    East,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::Down,
        Direction::Up,
        Direction::North,
        Direction::South,
        Direction::West,
        Direction::East,
    ];

    pub fn unit(self) -> Vec3I {
        match self {
            Direction::Down => Vec3I::new(0, -1, 0),
            Direction::Up => Vec3I::new(0, 1, 0),
            Direction::North => Vec3I::new(0, 0, -1),
            Direction::South => Vec3I::new(0, 0, 1),
            Direction::West => Vec3I::new(-1, 0, 0),
            Direction::East => Vec3I::new(1, 0, 0),
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Down => Direction::Up,
            Direction::Up => Direction::Down,
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
            Direction::East => Direction::West,
        }
    }

    /// Name used in block state properties.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Down => "down",
            Direction::Up => "up",
            Direction::North => "north",
            Direction::South => "south",
            Direction::West => "west",
            Direction::East => "east",
        }
    }

    /// Direction of a single step from `from` to `to`, or `None` when the two
    /// coordinates are not face neighbours.
    pub fn between(from: Vec3I, to: Vec3I) -> Option<Direction> {
        let delta = to - from;
        Direction::ALL
            .into_iter()
            .find(|direction| direction.unit() == delta)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive axis-aligned box of block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Vec3I,
    pub max: Vec3I,
}

impl Bounds {
    /// Builds a box spanning both corners regardless of their order.
    pub fn new(a: Vec3I, b: Vec3I) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Edge lengths in blocks.
    pub fn size(&self) -> Vec3I {
        self.max - self.min + Vec3I::new(1, 1, 1)
    }

    pub fn volume(&self) -> usize {
        let size = self.size();
        size.x.max(0) as usize * size.y.max(0) as usize * size.z.max(0) as usize
    }

    pub fn contains(&self, point: Vec3I) -> bool {
        (self.min.x..=self.max.x).contains(&point.x)
            && (self.min.y..=self.max.y).contains(&point.y)
            && (self.min.z..=self.max.z).contains(&point.z)
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
            && self.min.z <= other.max.z
            && other.min.z <= self.max.z
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_between_neighbours() {
        let origin = Vec3I::new(4, 4, 4);
        for direction in Direction::ALL {
            assert_eq!(
                Direction::between(origin, origin.offset(direction)),
                Some(direction)
            );
            assert_eq!(direction.opposite().opposite(), direction);
        }
        assert_eq!(Direction::between(origin, origin), None);
        assert_eq!(Direction::between(origin, Vec3I::new(5, 5, 4)), None);
    }

    #[test]
    fn bounds_normalise_and_measure() {
        let bounds = Bounds::new(Vec3I::new(3, 0, 5), Vec3I::new(0, 1, 2));
        assert_eq!(bounds.min, Vec3I::new(0, 0, 2));
        assert_eq!(bounds.max, Vec3I::new(3, 1, 5));
        assert_eq!(bounds.size(), Vec3I::new(4, 2, 4));
        assert_eq!(bounds.volume(), 32);
        assert!(bounds.contains(Vec3I::new(3, 1, 5)));
        assert!(!bounds.contains(Vec3I::new(4, 1, 5)));
    }

    #[test]
    fn bounds_intersection() {
        let a = Bounds::new(Vec3I::new(0, 0, 0), Vec3I::new(2, 1, 0));
        let b = Bounds::new(Vec3I::new(0, 0, 1), Vec3I::new(7, 7, 4));
        let c = Bounds::new(Vec3I::new(2, 1, 0), Vec3I::new(4, 4, 4));
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
        assert_eq!(a.union(&b).max, Vec3I::new(7, 7, 4));
    }

    #[test]
    fn vec_serializes_as_array() {
        let json = serde_json::to_string(&Vec3I::new(1, -2, 3)).unwrap();
        assert_eq!(json, "[1,-2,3]");
        let parsed: Bounds = serde_json::from_str(r#"{"min":[0,0,1],"max":[7,7,4]}"#).unwrap();
        assert_eq!(parsed.volume(), 8 * 8 * 4);
    }

    #[test]
    fn entity_coordinates_round_outward() {
        let pos = Vec3D::new(2.5, 0.0625, -0.5);
        assert_eq!(pos.floor(), Vec3I::new(2, 0, -1));
        assert_eq!(pos.ceil(), Vec3I::new(3, 1, 0));
    }
}
