//! Core types for the rail simulation
//!
//! Identifiers, world coordinates and small angle helpers shared by every
//! component. None of these know about trains or track topology.

use glam::{Mat4, Vec3};
use std::f32::consts::PI;
use std::fmt;

/// Size of one world tile in metres. World locations are kept as a tile
/// index plus a local offset from the tile centre.
pub const TILE_SIZE_M: f32 = 2048.0;

/// Half a tile; a normalised location never strays further than this from
/// its tile centre.
pub const HALF_TILE_M: f32 = TILE_SIZE_M / 2.0;

/// Speed below which a train is taken to be stopped (m/s).
pub const MAX_STOPPED_MPS: f32 = 0.1;

/// Train number. The original player train always carries number 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrainId(pub u32);

/// Index of an item in the track item table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrItemId(pub usize);

impl fmt::Display for TrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of travel along a track node. The numeric values are part of
/// the save format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TravellerDirection {
    Backward = 0,
    Forward = 1,
}

impl TravellerDirection {
    pub fn reversed(self) -> Self {
        match self {
            TravellerDirection::Forward => TravellerDirection::Backward,
            TravellerDirection::Backward => TravellerDirection::Forward,
        }
    }

    /// +1 for forward, -1 for backward
    pub fn sign(self) -> f32 {
        match self {
            TravellerDirection::Forward => 1.0,
            TravellerDirection::Backward => -1.0,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        if value == 0 {
            TravellerDirection::Backward
        } else {
            TravellerDirection::Forward
        }
    }
}

/// A location in the world: a tile index plus metres from the tile centre.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WorldLocation {
    pub tile_x: i32,
    pub tile_z: i32,
    pub location: Vec3,
}

impl WorldLocation {
    pub fn new(tile_x: i32, tile_z: i32, x: f32, y: f32, z: f32) -> Self {
        Self {
            tile_x,
            tile_z,
            location: Vec3::new(x, y, z),
        }
    }

    /// Moves whole tiles between the tile index and the local offset until
    /// the offset lies within half a tile of the centre.
    pub fn normalize(&mut self) {
        while self.location.x >= HALF_TILE_M {
            self.location.x -= TILE_SIZE_M;
            self.tile_x += 1;
        }
        while self.location.x < -HALF_TILE_M {
            self.location.x += TILE_SIZE_M;
            self.tile_x -= 1;
        }
        while self.location.z >= HALF_TILE_M {
            self.location.z -= TILE_SIZE_M;
            self.tile_z += 1;
        }
        while self.location.z < -HALF_TILE_M {
            self.location.z += TILE_SIZE_M;
            self.tile_z -= 1;
        }
    }

    /// Re-expresses this location relative to the given tile.
    pub fn normalize_to(&mut self, tile_x: i32, tile_z: i32) {
        self.location.x += (self.tile_x - tile_x) as f32 * TILE_SIZE_M;
        self.location.z += (self.tile_z - tile_z) as f32 * TILE_SIZE_M;
        self.tile_x = tile_x;
        self.tile_z = tile_z;
    }

    pub fn normalized_to(mut self, tile_x: i32, tile_z: i32) -> Self {
        self.normalize_to(tile_x, tile_z);
        self
    }

    /// Offset of `other` from `self`, in metres, expressed in `self`'s tile.
    pub fn delta_to(&self, other: &WorldLocation) -> Vec3 {
        other.normalized_to(self.tile_x, self.tile_z).location - self.location
    }

    pub fn distance_squared(a: &WorldLocation, b: &WorldLocation) -> f32 {
        a.delta_to(b).length_squared()
    }

    /// True if the two locations are closer than `distance`.
    pub fn within(a: &WorldLocation, b: &WorldLocation, distance: f32) -> bool {
        Self::distance_squared(a, b) < distance * distance
    }
}

impl fmt::Display for WorldLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{TileX:{} TileZ:{} X:{} Y:{} Z:{}}}",
            self.tile_x, self.tile_z, self.location.x, self.location.y, self.location.z
        )
    }
}

/// A world transform anchored to a tile, used for cars and moving tables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldPosition {
    pub tile_x: i32,
    pub tile_z: i32,
    pub matrix: Mat4,
}

impl Default for WorldPosition {
    fn default() -> Self {
        Self {
            tile_x: 0,
            tile_z: 0,
            matrix: Mat4::IDENTITY,
        }
    }
}

impl WorldPosition {
    pub fn new(tile_x: i32, tile_z: i32, matrix: Mat4) -> Self {
        Self {
            tile_x,
            tile_z,
            matrix,
        }
    }

    pub fn translation(&self) -> Vec3 {
        self.matrix.w_axis.truncate()
    }

    pub fn world_location(&self) -> WorldLocation {
        let t = self.translation();
        WorldLocation::new(self.tile_x, self.tile_z, t.x, t.y, t.z)
    }

    /// Moves the translation so the position is expressed in another tile.
    pub fn normalize_to(&mut self, tile_x: i32, tile_z: i32) {
        let dx = (self.tile_x - tile_x) as f32 * TILE_SIZE_M;
        let dz = (self.tile_z - tile_z) as f32 * TILE_SIZE_M;
        self.matrix.w_axis.x += dx;
        self.matrix.w_axis.z += dz;
        self.tile_x = tile_x;
        self.tile_z = tile_z;
    }
}

/// Wraps an angle into `(-PI, PI]`.
pub fn wrap_angle(angle: f32) -> f32 {
    let mut a = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if a <= -PI {
        a += 2.0 * PI;
    }
    a
}

/// Unit heading vector on the ground plane for a yaw angle. Yaw 0 points
/// along +Z and increases clockwise seen from above.
pub fn heading(yaw: f32) -> (f32, f32) {
    (yaw.sin(), yaw.cos())
}

/// Unit vector to the right of a heading on the ground plane.
pub fn right_of(yaw: f32) -> (f32, f32) {
    (yaw.cos(), -yaw.sin())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_moves_whole_tiles() {
        let mut loc = WorldLocation::new(0, 0, 1500.0, 3.0, -2100.0);
        loc.normalize();
        assert_eq!(loc.tile_x, 1);
        assert_eq!(loc.tile_z, -1);
        assert!((loc.location.x - (1500.0 - 2048.0)).abs() < 1e-3);
        assert!((loc.location.z - (-2100.0 + 2048.0)).abs() < 1e-3);
    }

    #[test]
    fn within_crosses_tile_boundaries() {
        let a = WorldLocation::new(0, 0, 1023.0, 0.0, 0.0);
        let b = WorldLocation::new(1, 0, -1024.0, 0.0, 0.0);
        assert!(WorldLocation::within(&a, &b, 2.0));
        assert!(!WorldLocation::within(&a, &b, 0.5));
    }

    #[test]
    fn wrap_angle_stays_in_range() {
        assert!((wrap_angle(3.0 * PI - 0.1) - (PI - 0.1)).abs() < 1e-4);
        assert!((wrap_angle(-0.5) + 0.5).abs() < 1e-6);
        assert!((wrap_angle(2.0 * PI + 0.25) - 0.25).abs() < 1e-5);
    }
}
