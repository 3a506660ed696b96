//! Track traveller
//!
//! A [`Traveller`] is a cursor on the track network: a node, a vector section
//! within it, an offset into that section and a facing direction. Offsets are
//! metres on straight sections and radians on curved ones; everything
//! reported outward is in metres.
//!
//! World location and node length are derived lazily and cached until the
//! traveller moves.

use glam::Vec3;
use ordered_float::OrderedFloat;
use std::cell::Cell;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;

use super::save::{SaveReader, SaveWriter};
use super::track_db::{TrVectorSection, TrackDb, TrackSection, TrackShape};
use super::types::{wrap_angle, TravellerDirection, WorldLocation};

/// Distance beyond either end of a section still accepted when placing a
/// traveller.
pub const INIT_ERROR_MARGIN_M: f32 = 0.5;

/// Lateral distance from the centreline still accepted when placing a
/// traveller. Car overhang on curves pulls bogie locations off the centreline.
pub const MAXIMUM_CENTERLINE_OFFSET_M: f32 = 2.5;

/// Squared distance at which a junction matches a distance target.
const JUNCTION_MATCH_DISTANCE_SQ: f32 = 0.1;

/// Movement below this is treated as fully consumed.
const MOVE_EPSILON_M: f32 = 0.001;

/// Tilting trains do not lean below this speed (m/s).
const MIN_TILT_SPEED_MPS: f32 = 12.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TravellerError {
    #[error("{0} could not be found in the track database")]
    LocationNotFound(WorldLocation),
    #[error("Track node {0} could not be found in the track database")]
    UnknownTrackNode(usize),
    #[error("Track node {0} is not a vector node")]
    NotVectorNode(usize),
    #[error("Track node {0} has no vector sections")]
    NoVectorSections(usize),
    #[error("{location} is ({dx} > {limit} or {dz} > {limit}) outside the bounding area of track section {section}")]
    OutsideBoundingArea {
        location: WorldLocation,
        section: u32,
        limit: f32,
        dx: f32,
        dz: f32,
    },
    #[error("{location} is ({distance} > {limit}) from the centerline of track section {section}")]
    OutsideCenterline {
        location: WorldLocation,
        section: u32,
        limit: f32,
        distance: f32,
    },
    #[error("{location} is ({distance} < -{limit} or {distance} > {length} + {limit}) beyond the extents of track section {section}")]
    BeyondTrackLength {
        location: WorldLocation,
        section: u32,
        limit: f32,
        length: f32,
        distance: f32,
    },
}

/// Where a location projects onto a single section.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    node: usize,
    section: usize,
    lateral: f32,
    lon_m: f32,
    curved: bool,
}

/// Forward-facing placement of the cursor, cached between moves.
#[derive(Debug, Clone, Copy)]
struct Placement {
    location: WorldLocation,
    pitch: f32,
    yaw: f32,
}

/// Projects `loc` onto one section, returning the lateral distance from the
/// centreline and the distance along the section.
pub fn fit_section(
    tvs: &TrVectorSection,
    section: &TrackSection,
    loc: &WorldLocation,
) -> Result<(f32, f32), TravellerError> {
    let local = loc.normalized_to(tvs.tile_x, tvs.tile_z).location;
    let dx = local.x - tvs.x;
    let dz = local.z - tvs.z;
    let length = section.length_m();

    match section.shape {
        TrackShape::Straight { length_m } => {
            let bounding = length_m + MAXIMUM_CENTERLINE_OFFSET_M;
            if dx.abs() > bounding || dz.abs() > bounding {
                return Err(TravellerError::OutsideBoundingArea {
                    location: *loc,
                    section: section.index,
                    limit: bounding,
                    dx: dx.abs(),
                    dz: dz.abs(),
                });
            }
            let (sin, cos) = tvs.ay.sin_cos();
            let lat = dx * cos - dz * sin;
            let pitch_cos = tvs.ax.cos();
            let mut lon = dx * sin + dz * cos;
            if pitch_cos.abs() > f32::EPSILON {
                lon /= pitch_cos;
            }
            if lat.abs() > MAXIMUM_CENTERLINE_OFFSET_M {
                return Err(TravellerError::OutsideCenterline {
                    location: *loc,
                    section: section.index,
                    limit: MAXIMUM_CENTERLINE_OFFSET_M,
                    distance: lat.abs(),
                });
            }
            if lon < -INIT_ERROR_MARGIN_M || lon > length + INIT_ERROR_MARGIN_M {
                return Err(TravellerError::BeyondTrackLength {
                    location: *loc,
                    section: section.index,
                    limit: INIT_ERROR_MARGIN_M,
                    length,
                    distance: lon,
                });
            }
            Ok((lat.abs(), lon))
        }
        TrackShape::Curved {
            radius_m,
            angle_deg,
        } => {
            let bounding =
                radius_m * angle_deg.to_radians().abs().min(2.0) + MAXIMUM_CENTERLINE_OFFSET_M;
            if dx.abs() > bounding || dz.abs() > bounding {
                return Err(TravellerError::OutsideBoundingArea {
                    location: *loc,
                    section: section.index,
                    limit: bounding,
                    dx: dx.abs(),
                    dz: dz.abs(),
                });
            }
            // Rotate so the section starts out along +Z and curves towards +X.
            let (sin, cos) = tvs.ay.sin_cos();
            let mut lx = dx * cos - dz * sin;
            let lz = dx * sin + dz * cos;
            if angle_deg < 0.0 {
                lx = -lx;
            }
            let to_centre = lx - radius_m;
            let lat = (to_centre * to_centre + lz * lz).sqrt() - radius_m;
            if lat.abs() > MAXIMUM_CENTERLINE_OFFSET_M {
                return Err(TravellerError::OutsideCenterline {
                    location: *loc,
                    section: section.index,
                    limit: MAXIMUM_CENTERLINE_OFFSET_M,
                    distance: lat.abs(),
                });
            }
            let outside_quadrant = lz < -INIT_ERROR_MARGIN_M
                || lx > radius_m + INIT_ERROR_MARGIN_M
                || lz > radius_m + INIT_ERROR_MARGIN_M;
            let radians = if lz > radius_m {
                std::f32::consts::FRAC_PI_2
            } else {
                (lz / radius_m).asin()
            };
            let lon = radians * radius_m;
            if outside_quadrant || lon < -INIT_ERROR_MARGIN_M || lon > length + INIT_ERROR_MARGIN_M {
                return Err(TravellerError::BeyondTrackLength {
                    location: *loc,
                    section: section.index,
                    limit: INIT_ERROR_MARGIN_M,
                    length,
                    distance: lon,
                });
            }
            Ok((lat.abs(), lon))
        }
    }
}

/// Length of a section in offset units: radians for curves, metres otherwise.
fn offset_length(section: &TrackSection) -> f32 {
    match section.shape {
        TrackShape::Straight { length_m } => length_m,
        TrackShape::Curved { angle_deg, .. } => angle_deg.to_radians().abs(),
    }
}

/// Metres per offset unit.
fn offset_scale(section: Option<&TrackSection>) -> f32 {
    match section.map(|s| s.shape) {
        Some(TrackShape::Curved { radius_m, .. }) => radius_m,
        _ => 1.0,
    }
}

/// The section of `node` whose centreline passes closest to `loc`.
fn try_node(db: &TrackDb, node: usize, loc: &WorldLocation) -> Option<Candidate> {
    let vector = db.vector_node(node)?;
    vector
        .sections
        .iter()
        .enumerate()
        .filter_map(|(i, tvs)| {
            let shape = db.section(tvs.section_index)?;
            let (lateral, lon_m) = fit_section(tvs, shape, loc).ok()?;
            Some(Candidate {
                node,
                section: i,
                lateral,
                lon_m,
                curved: shape.is_curved(),
            })
        })
        .min_by_key(|c| OrderedFloat(c.lateral))
}

#[derive(Clone)]
pub struct Traveller {
    db: Arc<TrackDb>,
    direction: TravellerDirection,
    track_offset: f32,
    node: usize,
    section: Option<usize>,
    junction_entry_pin: Option<usize>,
    placement: Cell<Option<Placement>>,
    /// Node length and forward offset along the node, in metres.
    node_length: Cell<Option<(f32, f32)>>,
}

impl Traveller {
    fn bare(db: Arc<TrackDb>) -> Self {
        Self {
            db,
            direction: TravellerDirection::Forward,
            track_offset: 0.0,
            node: 0,
            section: None,
            junction_entry_pin: None,
            placement: Cell::new(None),
            node_length: Cell::new(None),
        }
    }

    /// Places a traveller at the nearest track to `location`, facing along
    /// the track node.
    pub fn from_location(db: &Arc<TrackDb>, location: &WorldLocation) -> Result<Self, TravellerError> {
        let best = (1..db.node_count())
            .filter_map(|n| try_node(db, n, location))
            .min_by_key(|c| OrderedFloat(c.lateral))
            .ok_or(TravellerError::LocationNotFound(*location))?;
        let mut traveller = Self::bare(Arc::clone(db));
        traveller.init_from_candidate(&best);
        Ok(traveller)
    }

    pub fn from_location_facing(
        db: &Arc<TrackDb>,
        location: &WorldLocation,
        direction: TravellerDirection,
    ) -> Result<Self, TravellerError> {
        let mut traveller = Self::from_location(db, location)?;
        traveller.set_direction(direction);
        Ok(traveller)
    }

    /// Places a traveller at the start of a vector node, facing forward.
    pub fn from_node(db: &Arc<TrackDb>, node: usize) -> Result<Self, TravellerError> {
        let track_node = db.node(node).ok_or(TravellerError::UnknownTrackNode(node))?;
        let vector = track_node.vector().ok_or(TravellerError::NotVectorNode(node))?;
        if vector.sections.is_empty() {
            return Err(TravellerError::NoVectorSections(node));
        }
        let mut traveller = Self::bare(Arc::clone(db));
        traveller.node = node;
        traveller.next_track_vector_section(0);
        Ok(traveller)
    }

    /// Places a traveller on `node` near `location`. When the location is not
    /// on the node the nearer end of the node is used.
    pub fn from_node_and_location(
        db: &Arc<TrackDb>,
        node: usize,
        location: &WorldLocation,
    ) -> Result<Self, TravellerError> {
        if db.node(node).is_none() {
            return Err(TravellerError::UnknownTrackNode(node));
        }
        if let Some(candidate) = try_node(db, node, location) {
            let mut traveller = Self::bare(Arc::clone(db));
            traveller.init_from_candidate(&candidate);
            return Ok(traveller);
        }

        let mut traveller = Self::from_node(db, node)?;
        let start_distance = traveller.distance_2d(location);
        let last = db.vector_node(node).map_or(0, |v| v.sections.len() - 1);
        traveller.set_direction(TravellerDirection::Backward);
        traveller.next_track_vector_section(last);
        let end_distance = traveller.distance_2d(location);
        if start_distance < end_distance {
            traveller.set_direction(TravellerDirection::Forward);
            traveller.next_track_vector_section(0);
        }
        Ok(traveller)
    }

    pub fn from_node_and_location_facing(
        db: &Arc<TrackDb>,
        node: usize,
        location: &WorldLocation,
        direction: TravellerDirection,
    ) -> Result<Self, TravellerError> {
        let mut traveller = Self::from_node_and_location(db, node, location)?;
        traveller.set_direction(direction);
        Ok(traveller)
    }

    /// A copy facing the other way.
    pub fn reversed(&self) -> Self {
        let mut copy = self.clone();
        copy.reverse_direction();
        copy
    }

    /// A copy facing `direction` relative to this one: `Backward` flips it.
    pub fn copy_with(&self, relative: TravellerDirection) -> Self {
        match relative {
            TravellerDirection::Forward => self.clone(),
            TravellerDirection::Backward => self.reversed(),
        }
    }

    fn distance_2d(&self, target: &WorldLocation) -> f32 {
        let d = self.world_location().delta_to(target);
        (d.x * d.x + d.z * d.z).sqrt()
    }

    fn init_from_candidate(&mut self, candidate: &Candidate) {
        self.node = candidate.node;
        self.section = Some(candidate.section);
        self.direction = TravellerDirection::Forward;
        self.track_offset = 0.0;
        self.invalidate();
        let length = self.shape().map_or(0.0, |s| s.length_m());
        let lon = candidate.lon_m.clamp(0.0, length);
        if candidate.curved {
            self.move_in_section_curved(lon);
        } else {
            self.move_in_section_straight(lon);
        }
    }

    /// Re-places the traveller within its current section. Leaves it
    /// untouched and returns false when the location is not on the section.
    fn init_in_current_section(&mut self, target: &WorldLocation) -> bool {
        let (Some(section), Some(shape)) = (self.section, self.shape()) else {
            return false;
        };
        let Some(tvs) = self.db.vector_section(self.node, section) else {
            return false;
        };
        match fit_section(tvs, &shape, target) {
            Ok((lateral, lon_m)) => {
                let candidate = Candidate {
                    node: self.node,
                    section,
                    lateral,
                    lon_m,
                    curved: shape.is_curved(),
                };
                self.init_from_candidate(&candidate);
                true
            }
            Err(_) => false,
        }
    }

    fn invalidate(&self) {
        self.placement.set(None);
        self.node_length.set(None);
    }

    pub fn track_db(&self) -> &Arc<TrackDb> {
        &self.db
    }

    pub fn direction(&self) -> TravellerDirection {
        self.direction
    }

    pub fn set_direction(&mut self, direction: TravellerDirection) {
        self.direction = direction;
    }

    pub fn reverse_direction(&mut self) {
        self.direction = self.direction.reversed();
    }

    pub fn track_node_index(&self) -> usize {
        self.node
    }

    pub fn track_vector_section_index(&self) -> Option<usize> {
        self.section
    }

    /// Raw offset into the current section: metres or radians.
    pub fn track_offset(&self) -> f32 {
        self.track_offset
    }

    /// Pin of the current node through which it was entered.
    pub fn junction_entry_pin(&self) -> Option<usize> {
        self.junction_entry_pin
    }

    pub fn is_track(&self) -> bool {
        self.db.node(self.node).is_some_and(|n| n.vector().is_some())
    }

    pub fn is_junction(&self) -> bool {
        self.db.node(self.node).is_some_and(|n| n.is_junction())
    }

    pub fn is_end(&self) -> bool {
        self.db.node(self.node).is_some_and(|n| n.is_end())
    }

    pub fn is_track_curved(&self) -> bool {
        self.is_track() && self.shape().is_some_and(|s| s.is_curved())
    }

    pub fn is_track_straight(&self) -> bool {
        self.is_track() && !self.shape().is_some_and(|s| s.is_curved())
    }

    pub fn current_vector_section(&self) -> Option<&TrVectorSection> {
        self.section
            .and_then(|s| self.db.vector_section(self.node, s))
    }

    fn shape(&self) -> Option<TrackSection> {
        let tvs = self.current_vector_section()?;
        self.db.section(tvs.section_index).copied()
    }

    fn placement(&self) -> Placement {
        if let Some(p) = self.placement.get() {
            return p;
        }
        let p = self.compute_placement();
        self.placement.set(Some(p));
        p
    }

    fn compute_placement(&self) -> Placement {
        let fallback = Placement {
            location: self.db.node(self.node).map(|n| n.location).unwrap_or_default(),
            pitch: 0.0,
            yaw: 0.0,
        };
        let (tvs, offset_m) = match self.current_vector_section() {
            Some(tvs) => {
                let scale = offset_scale(self.db.section(tvs.section_index));
                (tvs, self.track_offset * scale)
            }
            None => {
                // Junction and end nodes borrow the geometry of their first link.
                let Some(pin) = self.db.node(self.node).and_then(|n| n.pins.first()) else {
                    return fallback;
                };
                let Some(linked) = self.db.vector_node(pin.link) else {
                    return fallback;
                };
                let tvs = match pin.direction {
                    TravellerDirection::Forward => linked.sections.first(),
                    TravellerDirection::Backward => linked.sections.last(),
                };
                let Some(tvs) = tvs else {
                    return fallback;
                };
                let length = self.db.section(tvs.section_index).map_or(0.0, |s| s.length_m());
                let offset = match pin.direction {
                    TravellerDirection::Forward => -self.track_offset,
                    TravellerDirection::Backward => length + self.track_offset,
                };
                (tvs, offset)
            }
        };
        match self.db.section(tvs.section_index) {
            Some(shape) => {
                let (location, yaw) = tvs.point_at(shape, offset_m);
                Placement {
                    location,
                    pitch: tvs.ax,
                    yaw,
                }
            }
            None => Placement {
                location: tvs.start_location(),
                pitch: tvs.ax,
                yaw: tvs.ay,
            },
        }
    }

    pub fn world_location(&self) -> WorldLocation {
        self.placement().location
    }

    pub fn tile_x(&self) -> i32 {
        self.placement().location.tile_x
    }

    pub fn tile_z(&self) -> i32 {
        self.placement().location.tile_z
    }

    pub fn location(&self) -> Vec3 {
        self.placement().location.location
    }

    /// Heading in the direction of travel.
    pub fn yaw(&self) -> f32 {
        let yaw = self.placement().yaw;
        match self.direction {
            TravellerDirection::Forward => wrap_angle(yaw),
            TravellerDirection::Backward => wrap_angle(yaw + std::f32::consts::PI),
        }
    }

    pub fn pitch(&self) -> f32 {
        let pitch = self.placement().pitch;
        match self.direction {
            TravellerDirection::Forward => wrap_angle(pitch),
            TravellerDirection::Backward => wrap_angle(-pitch),
        }
    }

    fn lengths(&self) -> (f32, f32) {
        if let Some(l) = self.node_length.get() {
            return l;
        }
        let mut length = 0.0;
        let mut offset = 0.0;
        if let Some(vector) = self.db.vector_node(self.node) {
            for (i, tvs) in vector.sections.iter().enumerate() {
                let Some(shape) = self.db.section(tvs.section_index) else {
                    continue;
                };
                let section_length = shape.length_m();
                length += section_length;
                match self.section {
                    Some(current) if i < current => offset += section_length,
                    Some(current) if i == current => {
                        offset += self.track_offset * offset_scale(Some(shape))
                    }
                    _ => {}
                }
            }
        }
        self.node_length.set(Some((length, offset)));
        (length, offset)
    }

    /// Length of the current track node in metres.
    pub fn track_node_length(&self) -> f32 {
        self.lengths().0
    }

    /// Distance down the current node in metres, in the direction of travel.
    pub fn track_node_offset(&self) -> f32 {
        let (length, offset) = self.lengths();
        match self.direction {
            TravellerDirection::Forward => offset,
            TravellerDirection::Backward => length - offset,
        }
    }

    pub fn curve_radius(&self) -> f32 {
        self.shape().map_or(0.0, |s| s.radius_m())
    }

    /// Signed inverse radius; positive for right-hand curves.
    pub fn curvature(&self) -> f32 {
        match self.shape().map(|s| s.shape) {
            Some(TrackShape::Curved {
                radius_m,
                angle_deg,
            }) => angle_deg.signum() / radius_m,
            _ => 0.0,
        }
    }

    /// Super-elevation at the current point: a ramp from the curve ends to
    /// the maximum at mid-curve, unless the neighbouring curve carries it on.
    pub fn super_elevation(&self) -> f32 {
        let (Some(shape), Some(tvs)) = (self.shape(), self.current_vector_section()) else {
            return 0.0;
        };
        let TrackShape::Curved { angle_deg, .. } = shape.shape else {
            return 0.0;
        };
        let track_length = angle_deg.to_radians().abs();
        let sign = if (angle_deg > 0.0) ^ (self.direction == TravellerDirection::Backward) {
            -1.0
        } else {
            1.0
        };
        let elevation = tvs.max_elev * sign;
        if elevation.abs() < 0.001 {
            return 0.0;
        }
        if self.track_offset < track_length / 2.0 {
            if tvs.start_elev.abs() < 0.001 {
                return elevation * self.track_offset * 2.0 / track_length;
            }
            return elevation;
        }
        if tvs.end_elev.abs() < 0.001 {
            return elevation * (track_length - self.track_offset) * 2.0 / track_length;
        }
        elevation
    }

    /// Average of the super-elevation here and `smoothing_offset_m` ahead.
    pub fn super_elevation_smoothed(&self, smoothing_offset_m: f32) -> f32 {
        let mut ahead = self.clone();
        ahead.move_by(smoothing_offset_m);
        (self.super_elevation() + ahead.super_elevation()) / 2.0
    }

    /// Roll wanted by a tilting train on the current section.
    pub fn find_tilted_z(&self, speed_mps: f32) -> f32 {
        if speed_mps < MIN_TILT_SPEED_MPS {
            return 0.0;
        }
        let Some(TrackShape::Curved { angle_deg, .. }) = self.shape().map(|s| s.shape) else {
            return 0.0;
        };
        let max_roll = 0.14 * speed_mps / 40.0;
        let hand = -angle_deg.signum();
        if self.direction.sign() * hand > 0.0 {
            max_roll
        } else {
            -max_roll
        }
    }

    pub fn junction_node_ahead(&self) -> Option<usize> {
        self.next_junction_node(TravellerDirection::Forward)
    }

    pub fn junction_node_behind(&self) -> Option<usize> {
        self.next_junction_node(TravellerDirection::Backward)
    }

    fn next_junction_node(&self, relative: TravellerDirection) -> Option<usize> {
        let mut traveller = self.copy_with(relative);
        let mut steps = self.step_limit();
        while steps > 0 && traveller.next_section() {
            if traveller.is_junction() {
                return Some(traveller.node);
            }
            steps -= 1;
        }
        None
    }

    /// Upper bound on section steps for searches that may circle a loop.
    fn step_limit(&self) -> usize {
        self.db
            .nodes
            .iter()
            .flatten()
            .map(|n| n.vector().map_or(1, |v| v.sections.len()))
            .sum::<usize>()
            * 2
            + 2
    }

    /// Moves along the track, following junction settings. Negative distances
    /// move backwards. Returns the distance left over when the track ran out.
    pub fn move_by(&mut self, distance_m: f32) -> f32 {
        if distance_m.is_nan() || distance_m == 0.0 {
            return 0.0;
        }
        let backwards = distance_m < 0.0;
        let mut remaining = distance_m.abs();
        if backwards {
            self.reverse_direction();
        }
        loop {
            remaining = self.move_in_track_section(remaining);
            if remaining < MOVE_EPSILON_M || !self.next_section() {
                break;
            }
        }
        if backwards {
            self.reverse_direction();
            -remaining
        } else {
            remaining
        }
    }

    /// Moves within the current section only.
    pub fn move_in_section(&mut self, distance_m: f32) -> f32 {
        if distance_m.is_nan() || distance_m == 0.0 {
            return 0.0;
        }
        let backwards = distance_m < 0.0;
        if backwards {
            self.reverse_direction();
        }
        let remaining = self.move_in_track_section(distance_m.abs());
        if backwards {
            self.reverse_direction();
            -remaining
        } else {
            remaining
        }
    }

    fn move_in_track_section(&mut self, distance_m: f32) -> f32 {
        if !self.is_track() {
            return distance_m;
        }
        if self.is_track_curved() {
            self.move_in_section_curved(distance_m)
        } else {
            self.move_in_section_straight(distance_m)
        }
    }

    fn move_in_section_curved(&mut self, distance_m: f32) -> f32 {
        let Some(shape) = self.shape() else {
            return distance_m;
        };
        let radius = shape.radius_m();
        let section_radians = offset_length(&shape);
        let mut turn = distance_m / radius;
        let available = match self.direction {
            TravellerDirection::Forward => section_radians - self.track_offset,
            TravellerDirection::Backward => self.track_offset,
        };
        if turn > available {
            turn = available;
        }
        self.track_offset += self.direction.sign() * turn;
        self.invalidate();
        distance_m - turn * radius
    }

    fn move_in_section_straight(&mut self, distance_m: f32) -> f32 {
        let length = self.shape().map_or(0.0, |s| s.length_m());
        let available = match self.direction {
            TravellerDirection::Forward => length - self.track_offset,
            TravellerDirection::Backward => self.track_offset,
        };
        let step = distance_m.min(available.max(0.0));
        self.track_offset += self.direction.sign() * step;
        self.invalidate();
        distance_m - step
    }

    /// Moves to the next section, crossing into the next node when needed.
    pub fn next_section(&mut self) -> bool {
        if self.is_track() && self.next_vector_section() {
            return true;
        }
        self.next_track_node()
    }

    /// Follows the pin at the leading end of the current node.
    pub fn next_track_node(&mut self) -> bool {
        let db = Arc::clone(&self.db);
        let Some(node) = db.node(self.node) else {
            return false;
        };
        let forward = self.direction == TravellerDirection::Forward;
        let mut pin = if forward { node.inpins } else { 0 };
        if node.is_junction() && forward {
            pin += node.selected_route();
        }
        let Some(tr_pin) = node.pins.get(pin).copied() else {
            return false;
        };
        if tr_pin.link == 0 || tr_pin.link >= db.node_count() {
            return false;
        }
        let Some(next) = db.node(tr_pin.link) else {
            return false;
        };

        let old = self.node;
        self.direction = tr_pin.direction;
        self.track_offset = 0.0;
        self.node = tr_pin.link;
        self.section = None;
        self.invalidate();
        if let Some(vector) = next.vector() {
            if !vector.sections.is_empty() {
                match self.direction {
                    TravellerDirection::Forward => self.next_track_vector_section(0),
                    TravellerDirection::Backward => {
                        self.next_track_vector_section(vector.sections.len() - 1)
                    }
                };
            }
        }
        self.junction_entry_pin = next.pins.iter().rposition(|p| p.link == old);
        true
    }

    /// Moves to the next section of the current node, stopping at its end.
    pub fn next_vector_section(&mut self) -> bool {
        let Some(count) = self.db.vector_node(self.node).map(|v| v.sections.len()) else {
            return false;
        };
        let Some(current) = self.section else {
            return false;
        };
        match self.direction {
            TravellerDirection::Forward if current + 1 < count => {
                self.next_track_vector_section(current + 1)
            }
            TravellerDirection::Backward if current > 0 => self.next_track_vector_section(current - 1),
            _ => false,
        }
    }

    fn next_track_vector_section(&mut self, index: usize) -> bool {
        self.section = Some(index);
        self.invalidate();
        let Some(shape) = self.shape() else {
            self.track_offset = 0.0;
            return false;
        };
        self.track_offset = match self.direction {
            TravellerDirection::Forward => 0.0,
            TravellerDirection::Backward => offset_length(&shape),
        };
        true
    }

    /// Distance along the track to `target` in the direction of travel, or
    /// `-1.0` when it is not found ahead.
    pub fn distance_to(&self, target: &WorldLocation) -> f32 {
        Self::distance_along(self.clone(), None, target, f32::MAX)
    }

    /// As [`distance_to`](Self::distance_to), giving up beyond `max_distance_m`.
    pub fn distance_to_within(&self, target: &WorldLocation, max_distance_m: f32) -> f32 {
        Self::distance_along(self.clone(), None, target, max_distance_m)
    }

    /// As [`distance_to_within`](Self::distance_to_within), only matching
    /// the target on `node`.
    pub fn distance_to_on_node(&self, node: usize, target: &WorldLocation, max_distance_m: f32) -> f32 {
        Self::distance_along(self.clone(), Some(node), target, max_distance_m)
    }

    /// Distance ahead to `target`, or `None` when it is not found.
    pub fn try_distance_to(&self, target: &WorldLocation, max_distance_m: f32) -> Option<f32> {
        let distance = self.distance_to_within(target, max_distance_m);
        (distance >= 0.0).then_some(distance)
    }

    /// Distance ahead to `target` together with a traveller placed there.
    pub fn distance_to_with_destination(
        &self,
        target: &WorldLocation,
        max_distance_m: f32,
    ) -> Option<(f32, Traveller)> {
        let mut destination = self.clone();
        let distance = Self::walk_to(&mut destination, None, target, max_distance_m);
        (distance >= 0.0).then_some((distance, destination))
    }

    fn distance_along(
        mut traveller: Traveller,
        node: Option<usize>,
        target: &WorldLocation,
        max_distance_m: f32,
    ) -> f32 {
        Self::walk_to(&mut traveller, node, target, max_distance_m)
    }

    fn walk_to(
        traveller: &mut Traveller,
        node: Option<usize>,
        target: &WorldLocation,
        max_distance_m: f32,
    ) -> f32 {
        let mut accumulated = 0.0;
        let mut steps = traveller.step_limit();
        while accumulated < max_distance_m && steps > 0 {
            steps -= 1;
            if traveller.is_track() {
                let initial = traveller.track_offset;
                let shape = traveller.shape();
                let radius = offset_scale(shape.as_ref());
                if node.map_or(true, |n| n == traveller.node) {
                    let sign = traveller.direction.sign();
                    if traveller.init_in_current_section(target) {
                        if traveller.track_offset * sign < initial * sign {
                            break;
                        }
                        accumulated += (traveller.track_offset - initial) * sign * radius;
                        return accumulated;
                    }
                }
                let length = shape.as_ref().map_or(0.0, offset_length);
                accumulated += match traveller.direction {
                    TravellerDirection::Forward => length - initial,
                    TravellerDirection::Backward => initial,
                } * radius;
            }
            if !traveller.next_section() {
                break;
            }
            if traveller.is_junction() {
                if WorldLocation::distance_squared(&traveller.world_location(), target)
                    < JUNCTION_MATCH_DISTANCE_SQ
                {
                    return accumulated;
                }
                traveller.next_section();
            }
            if traveller.is_end() {
                break;
            }
        }
        -1.0
    }

    /// Signed gap between this traveller and `other` when they are within a
    /// metre of each other; negative means they overlap. Returns 1 when the
    /// two are too far apart to touch.
    pub fn overlap_distance_m(&self, other: &Traveller, rear: bool) -> f32 {
        let d = other.world_location().delta_to(&self.world_location());
        if d.x * d.x + d.z * d.z > 1.0 || d.y.abs() > 1.0 {
            return 1.0;
        }
        let (sin, cos) = self.yaw().sin_cos();
        let dot = d.x * sin + d.z * cos;
        if rear {
            dot
        } else {
            -dot
        }
    }

    /// Looser overlap test for remote trains whose positions jitter: both
    /// trains' far ends must be within their lengths before the near ends
    /// are compared.
    pub fn rough_overlap_distance_m(
        &self,
        other: &Traveller,
        far_me: &Traveller,
        far_other: &Traveller,
        length_me: f32,
        length_other: f32,
        rear: bool,
    ) -> f32 {
        let near = other.world_location().delta_to(&self.world_location());
        if near.y.abs() > 1.0 {
            return 1.0;
        }
        let far = other.world_location().delta_to(&far_me.world_location());
        if far.x * far.x + far.z * far.z > length_me * length_me {
            return 1.0;
        }
        let far = far_other.world_location().delta_to(&self.world_location());
        if far.x * far.x + far.z * far.z > length_other * length_other {
            return 1.0;
        }
        let diagonal = near.x * near.x + near.z * near.z;
        let combined = length_me + length_other;
        if diagonal < 200.0 && diagonal < combined * combined {
            let (sin, cos) = self.yaw().sin_cos();
            let dot = near.x * sin + near.z * cos;
            return if rear { dot } else { -dot };
        }
        1.0
    }

    /// True if the straight-line distance to `other` is under `distance_m`.
    pub fn within(&self, other: &WorldLocation, distance_m: f32) -> bool {
        WorldLocation::within(&self.world_location(), other, distance_m)
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> anyhow::Result<()> {
        out.write_u8(self.direction as u8)?;
        out.write_f32(self.track_offset)?;
        out.write_i32(self.node as i32)?;
        if self.is_track() {
            out.write_index(self.section)?;
        }
        Ok(())
    }

    pub fn restore<R: Read>(db: &Arc<TrackDb>, input: &mut SaveReader<R>) -> anyhow::Result<Self> {
        let mut traveller = Self::bare(Arc::clone(db));
        traveller.direction = TravellerDirection::from_u8(input.read_u8()?);
        traveller.track_offset = input.read_f32()?;
        let node = input.read_i32()?;
        if node <= 0 || db.node(node as usize).is_none() {
            anyhow::bail!("Saved traveller refers to missing track node {}", node);
        }
        traveller.node = node as usize;
        if traveller.is_track() {
            traveller.section = input.read_index()?;
        }
        Ok(traveller)
    }
}

/// Travellers compare equal when they sit at the same place facing the same
/// way, regardless of cached state.
impl PartialEq for Traveller {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.db, &other.db)
            && self.direction == other.direction
            && self.node == other.node
            && self.section == other.section
            && (self.track_offset - other.track_offset).abs() < 1e-4
    }
}

impl fmt::Debug for Traveller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Traveller{} {:?}", self, self.direction)
    }
}

impl fmt::Display for Traveller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{TN={} TS={} O={:.6}}}",
            self.node,
            self.section.map_or(-1, |s| s as i64),
            self.track_offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::track_db::TrackDbBuilder;

    fn straight_node() -> (Arc<TrackDb>, usize) {
        let mut b = TrackDbBuilder::new();
        let n = b.add_vector_node(
            WorldLocation::default(),
            0.0,
            &[TrackShape::Straight { length_m: 100.0 }],
        );
        (Arc::new(b.build()), n)
    }

    #[test]
    fn fit_reports_centerline_distance() {
        let (db, n) = straight_node();
        let tvs = db.vector_section(n, 0).unwrap();
        let shape = db.section(tvs.section_index).unwrap();
        let err = fit_section(tvs, shape, &WorldLocation::new(0, 0, 3.0, 0.0, 50.0)).unwrap_err();
        assert!(matches!(err, TravellerError::OutsideCenterline { .. }));
        let err = fit_section(tvs, shape, &WorldLocation::new(0, 0, 0.0, 0.0, 101.0)).unwrap_err();
        assert!(matches!(err, TravellerError::BeyondTrackLength { .. }));
        let err = fit_section(tvs, shape, &WorldLocation::new(0, 0, 0.0, 0.0, 500.0)).unwrap_err();
        assert!(matches!(err, TravellerError::OutsideBoundingArea { .. }));
    }

    #[test]
    fn placement_picks_nearest_section_of_node() {
        // Hairpin: out along +Z, a tight half circle, back alongside.
        let mut b = TrackDbBuilder::new();
        let n = b.add_vector_node(
            WorldLocation::default(),
            0.0,
            &[
                TrackShape::Straight { length_m: 50.0 },
                TrackShape::Curved {
                    radius_m: 2.0,
                    angle_deg: 180.0,
                },
                TrackShape::Straight { length_m: 50.0 },
            ],
        );
        let db = Arc::new(b.build());
        let back_x = db.vector_section(n, 2).unwrap().x;
        assert!((back_x.abs() - 4.0).abs() < 1e-3);

        // 2.2 m off the outbound leg, 1.8 m off the return leg.
        let t = Traveller::from_location(&db, &WorldLocation::new(0, 0, back_x * 0.55, 0.0, 25.0)).unwrap();
        assert_eq!(t.track_vector_section_index(), Some(2));
        let t = Traveller::from_location(&db, &WorldLocation::new(0, 0, back_x * 0.45, 0.0, 25.0)).unwrap();
        assert_eq!(t.track_vector_section_index(), Some(0));
    }

    #[test]
    fn display_names_node_section_and_offset() {
        let (db, n) = straight_node();
        let mut t = Traveller::from_node(&db, n).unwrap();
        t.move_by(12.5);
        assert_eq!(t.to_string(), format!("{{TN={} TS=0 O=12.500000}}", n));
    }
}
