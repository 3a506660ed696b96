//! Turntables and transfertables
//!
//! A moving table is a piece of track that turns (turntable) or slides
//! (transfertable) to line up with one of several fixed track ends. Motion
//! starts continuous, is narrowed down to a target end once the operator
//! lets go, and finishes by snapping onto that end.
//!
//! A train riding the table is detached from the track graph while it moves:
//! its cars keep a transform relative to the table and follow the table's
//! animation matrix. Once the table is exactly on target the train is put
//! back on the track of the connected end.

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::sync::Arc;

use super::confirmer::Confirmer;
use super::context::SimContext;
use super::save::{SaveReader, SaveWriter};
use super::track_db::TrackDb;
use super::train::{ControlMode, OutOfControlReason, Reverser, Train};
use super::traveller::Traveller;
use super::types::{wrap_angle, TrainId, TravellerDirection, WorldLocation, WorldPosition, MAX_STOPPED_MPS};

/// Angular distance at which a turning table locks onto a forward target.
pub const FORWARD_CONNECT_TOLERANCE_RAD: f32 = 0.005;
/// Same, for the rear end of the bridge.
pub const REAR_CONNECT_TOLERANCE_RAD: f32 = 0.0055;
/// Targets further than this when motion stops are not reachable without
/// another full sweep.
pub const TARGET_SEARCH_WINDOW_RAD: f32 = 0.1;
/// Candidate angles must lie inside this sweep.
const ANGLE_SEARCH_LIMIT_RAD: f32 = 3.5;
/// Forward and rear candidates closer than this are treated as a tie.
const TARGET_TIE_RAD: f32 = 0.01;
/// A sliding table only looks for ends within this distance ahead.
pub const OFFSET_SEARCH_WINDOW_M: f32 = 1.4;
pub const OFFSET_CONNECT_TOLERANCE_M: f32 = 0.005;

/// One fixed track end a table can line up with.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEnd {
    /// Yaw of the end for turntables, offset along the slide axis for
    /// transfertables.
    pub position: f32,
    pub track_node: Option<usize>,
    pub section: Option<usize>,
    /// True if the node's forward direction leads away from the table.
    pub forward_orientation: bool,
}

impl TableEnd {
    pub fn new(position: f32, track_node: usize, section: usize, forward_orientation: bool) -> Self {
        Self {
            position,
            track_node: Some(track_node),
            section: Some(section),
            forward_orientation,
        }
    }

    /// An end with no track behind it.
    pub fn unlinked(position: f32) -> Self {
        Self {
            position,
            track_node: None,
            section: None,
            forward_orientation: true,
        }
    }

    fn is_linked(&self) -> bool {
        self.track_node.is_some() && self.section.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainOnTable {
    pub train: TrainId,
    pub front_on_board: bool,
    pub back_on_board: bool,
}

impl TrainOnTable {
    pub fn new(train: TrainId) -> Self {
        Self {
            train,
            front_on_board: false,
            back_on_board: false,
        }
    }

    pub fn fully_on_board(&self) -> bool {
        self.front_on_board && self.back_on_board
    }

    pub fn partially_on_board(&self) -> bool {
        self.front_on_board ^ self.back_on_board
    }

    fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i32(self.train.0 as i32)?;
        out.write_bool(self.front_on_board)?;
        out.write_bool(self.back_on_board)
    }

    fn restore<R: Read>(input: &mut SaveReader<R>) -> Result<Self> {
        Ok(Self {
            train: TrainId(input.read_i32()? as u32),
            front_on_board: input.read_bool()?,
            back_on_board: input.read_bool()?,
        })
    }
}

/// State shared by both kinds of table.
#[derive(Debug, Clone)]
pub struct TableCommon {
    pub name: String,
    /// "turntable" or "transfertable", used in messages.
    pub kind: &'static str,
    /// Shape position of the table's pit.
    pub position: WorldPosition,
    /// Offset of the table's centre inside its shape.
    pub center_offset: Vec3,
    pub ends: Vec<TableEnd>,
    pub continuous: bool,
    pub go_to_target: bool,
    pub connected_track_end: Option<usize>,
    pub trains_on_table: Vec<TrainOnTable>,
    relative_car_positions: Vec<Mat4>,
    pub relative_front_location: Vec3,
    pub relative_rear_location: Vec3,
    pub final_front_location: Vec3,
    pub final_rear_location: Vec3,
    pub animation: Mat4,
}

impl TableCommon {
    fn new(name: &str, kind: &'static str, position: WorldPosition, center_offset: Vec3, ends: Vec<TableEnd>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            position,
            center_offset,
            ends,
            continuous: false,
            go_to_target: false,
            connected_track_end: Some(0),
            trains_on_table: Vec::new(),
            relative_car_positions: Vec::new(),
            relative_front_location: Vec3::ZERO,
            relative_rear_location: Vec3::ZERO,
            final_front_location: Vec3::ZERO,
            final_rear_location: Vec3::ZERO,
            animation: Mat4::IDENTITY,
        }
    }

    fn connected_end(&self) -> Option<&TableEnd> {
        self.connected_track_end.and_then(|i| self.ends.get(i))
    }

    fn connected_orientation(&self) -> bool {
        self.connected_end().map_or(true, |e| e.forward_orientation)
    }

    fn has_partial_train(&self) -> bool {
        self.trains_on_table.iter().any(TrainOnTable::partially_on_board)
    }

    /// The single train fully on board, if there is exactly one train.
    fn single_boarded(&self) -> Option<TrainId> {
        match self.trains_on_table.as_slice() {
            [only] if only.fully_on_board() => Some(only.train),
            _ => None,
        }
    }

    /// Refuses to move with more than one train, or with a train half on.
    fn occupancy_allows_motion(&self) -> bool {
        !(self.trains_on_table.len() > 1 || self.has_partial_train())
    }

    /// Checks the boarded train is safe to move. Returns false, with a
    /// warning, when it is not.
    fn train_ready(train: &Train, confirmer: &mut Confirmer, ctx: &SimContext, what: &str) -> bool {
        let lead_active = train
            .lead_locomotive()
            .map_or(false, |_| train.throttle_percent >= 1.0 || train.reverser != Reverser::Neutral);
        let mode_ok = matches!(
            train.control_mode,
            ControlMode::Manual | ControlMode::Turntable | ControlMode::Explorer | ControlMode::Undefined
        );
        if train.speed_mps.abs() > MAX_STOPPED_MPS || lead_active || !mode_ok {
            confirmer.warning(&ctx.get_stringf(
                "{0} can't start: check throttle, speed, direction and control mode",
                &[&what],
            ));
            return false;
        }
        true
    }

    /// Detaches a boarded train from the track: remembers each car and both
    /// train ends relative to the table.
    fn capture_train(&mut self, train: &mut Train) {
        let inv = self.animation.inverse();
        let (tile_x, tile_z) = (self.position.tile_x, self.position.tile_z);
        self.relative_car_positions = train
            .cars
            .iter_mut()
            .map(|car| {
                car.world_position.normalize_to(tile_x, tile_z);
                inv * car.world_position.matrix
            })
            .collect();
        let front = train.front.world_location().normalized_to(tile_x, tile_z);
        let rear = train.rear.world_location().normalized_to(tile_x, tile_z);
        self.relative_front_location = inv.transform_point3(front.location);
        self.relative_rear_location = inv.transform_point3(rear.location);
        train.control_mode = ControlMode::Turntable;
    }

    /// Carries the boarded train's cars along with the table.
    fn move_train(&mut self, animation: Mat4, moving: bool, trains: &mut [Train]) {
        self.animation = animation;
        let Some(id) = self.single_boarded() else {
            return;
        };
        if !(moving || self.go_to_target) {
            return;
        }
        let Some(train) = trains.iter_mut().find(|t| t.number == id) else {
            return;
        };
        if train.control_mode != ControlMode::Turntable {
            return;
        }
        for (car, relative) in train.cars.iter_mut().zip(&self.relative_car_positions) {
            car.world_position = WorldPosition::new(self.position.tile_x, self.position.tile_z, animation * *relative);
        }
    }

    fn recalculate_traveller_locations(&mut self) {
        self.final_front_location = self.animation.transform_point3(self.relative_front_location);
        self.final_rear_location = self.animation.transform_point3(self.relative_rear_location);
    }

    /// Puts the boarded train back on the track of the connected end.
    fn reenter_track(&self, direction: TravellerDirection, trains: &mut [Train]) -> Result<()> {
        let [only] = self.trains_on_table.as_slice() else {
            return Ok(());
        };
        let Some(train) = trains.iter_mut().find(|t| t.number == only.train) else {
            return Ok(());
        };
        if train.control_mode != ControlMode::Turntable {
            return Ok(());
        }
        let Some(node) = self.connected_end().and_then(|e| e.track_node) else {
            return Ok(());
        };
        let db: Arc<TrackDb> = Arc::clone(train.front.track_db());
        let (tile_x, tile_z) = (self.position.tile_x, self.position.tile_z);
        let at = |v: Vec3| {
            let mut loc = WorldLocation::new(tile_x, tile_z, v.x, v.y, v.z);
            loc.normalize();
            loc
        };
        train.front = Traveller::from_node_and_location_facing(&db, node, &at(self.final_front_location), direction)
            .with_context(|| format!("Placing train {} back on node {}", train.number, node))?;
        train.rear = Traveller::from_node_and_location_facing(&db, node, &at(self.final_rear_location), direction)
            .with_context(|| format!("Placing train {} back on node {}", train.number, node))?;
        train.control_mode = ControlMode::Manual;
        train.calculate_position_of_cars();
        info!("Train {} left {} on node {}", train.number, self.name, node);
        Ok(())
    }

    /// Whether a train arriving on the table meets track that is lined up
    /// with the one it is on.
    fn aligned_with(&self, connected: bool, train: &Train) -> bool {
        connected
            && self.connected_end().map_or(false, |end| {
                end.is_linked()
                    && end.track_node.map_or(false, |n| {
                        n == train.front.track_node_index() || n == train.rear.track_node_index()
                    })
            })
    }

    /// Tracks which ends of `train` are on the table. A train running onto a
    /// table that is not lined up with it is put out of control.
    fn check_train_on_table(
        &mut self,
        train: &mut Train,
        radius_m: f32,
        connected: bool,
        confirmer: &mut Confirmer,
        ctx: &SimContext,
    ) -> bool {
        let centre = self.center();
        let mut index = self.trains_on_table.iter().position(|t| t.train == train.number);

        for front in [true, false] {
            let end_location = if front {
                train.front.world_location()
            } else {
                train.rear.world_location()
            };
            let (here, there) = if front { ("front", "rear") } else { ("rear", "front") };
            let inside = WorldLocation::within(&end_location, &centre, radius_m);
            let on_board = |rec: &TrainOnTable| if front { rec.front_on_board } else { rec.back_on_board };

            if inside {
                if index.map_or(true, |i| !on_board(&self.trains_on_table[i])) {
                    let i = *index.get_or_insert_with(|| {
                        self.trains_on_table.push(TrainOnTable::new(train.number));
                        self.trains_on_table.len() - 1
                    });
                    let other_on = if front {
                        self.trains_on_table[i].back_on_board
                    } else {
                        self.trains_on_table[i].front_on_board
                    };
                    if !other_on && !self.aligned_with(connected, train) {
                        set_end(&mut self.trains_on_table[i], front, true);
                        confirmer.warning(&ctx.get_stringf("Train slipped into non aligned {0}", &[&self.kind]));
                        warn!("Train {} slipped into {} which is not aligned", train.number, self.name);
                        train.control_mode = ControlMode::OutOfControl;
                        train.out_of_control_reason = OutOfControlReason::SlippedIntoTurntable;
                        train.speed_mps = 0.0;
                        train.throttle_percent = 0.0;
                        return false;
                    }
                    confirmer.information(&ctx.get_stringf("Train {0} on {1}", &[&here, &self.kind]));
                }
                if let Some(i) = index {
                    set_end(&mut self.trains_on_table[i], front, true);
                }
            } else if let Some(i) = index {
                if on_board(&self.trains_on_table[i]) {
                    confirmer.information(&ctx.get_stringf("Train {0} outside {1}", &[&here, &self.kind]));
                    let other_on = if front {
                        self.trains_on_table[i].back_on_board
                    } else {
                        self.trains_on_table[i].front_on_board
                    };
                    if other_on {
                        set_end(&mut self.trains_on_table[i], front, false);
                    } else {
                        debug!("Train {} has left {} ({} end last)", train.number, self.name, there);
                        self.trains_on_table.remove(i);
                        index = None;
                    }
                }
            }
        }
        false
    }

    fn center(&self) -> WorldLocation {
        let t = self.position.matrix.transform_point3(self.center_offset);
        let mut loc = WorldLocation::new(self.position.tile_x, self.position.tile_z, t.x, t.y, t.z);
        loc.normalize();
        loc
    }

    /// Restored tables lose the cars' relative transforms; rebuild them from
    /// where the cars stand now.
    fn relink(&mut self, trains: &[Train]) {
        let Some(id) = self.single_boarded() else {
            return;
        };
        let Some(train) = trains.iter().find(|t| t.number == id) else {
            return;
        };
        if train.control_mode != ControlMode::Turntable {
            return;
        }
        let inv = self.animation.inverse();
        let (tile_x, tile_z) = (self.position.tile_x, self.position.tile_z);
        self.relative_car_positions = train
            .cars
            .iter()
            .map(|car| {
                let mut p = car.world_position;
                p.normalize_to(tile_x, tile_z);
                inv * p.matrix
            })
            .collect();
    }

    fn forget_train(&mut self, train: TrainId) {
        self.trains_on_table.retain(|t| t.train != train);
    }

    fn save_trains<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i32(self.trains_on_table.len() as i32)?;
        for t in &self.trains_on_table {
            t.save(out)?;
        }
        Ok(())
    }

    fn restore_trains<R: Read>(&mut self, input: &mut SaveReader<R>) -> Result<()> {
        let count = input.read_i32()?;
        self.trains_on_table = (0..count.max(0))
            .map(|_| TrainOnTable::restore(input))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn save_locations<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_vec3(self.relative_front_location)?;
        out.write_vec3(self.relative_rear_location)?;
        out.write_vec3(self.final_front_location)?;
        out.write_vec3(self.final_rear_location)
    }

    fn restore_locations<R: Read>(&mut self, input: &mut SaveReader<R>) -> Result<()> {
        self.relative_front_location = input.read_vec3()?;
        self.relative_rear_location = input.read_vec3()?;
        self.final_front_location = input.read_vec3()?;
        self.final_rear_location = input.read_vec3()?;
        Ok(())
    }
}

fn set_end(record: &mut TrainOnTable, front: bool, value: bool) {
    if front {
        record.front_on_board = value;
    } else {
        record.back_on_board = value;
    }
}

/// A rotating bridge. `y_angle` decreases while turning clockwise; an end at
/// angle `a` is lined up with the bridge's front when `y_angle == -a`.
#[derive(Debug, Clone)]
pub struct Turntable {
    pub common: TableCommon,
    pub diameter_m: f32,
    pub clockwise: bool,
    pub counterclockwise: bool,
    pub y_angle: f32,
    pub forward_connected: bool,
    pub rear_connected: bool,
    pub save_forward_connected: bool,
    pub save_rear_connected: bool,
    pub forward_connected_target: Option<usize>,
    pub rear_connected_target: Option<usize>,
    pub target_y: f32,
    /// True if the last connection was made by the bridge's front.
    pub last_connection: bool,
    /// The connection swapped ends since last time, so the train faces the
    /// other way.
    pub connection_toggled: bool,
}

impl Turntable {
    pub fn new(name: &str, position: WorldPosition, center_offset: Vec3, diameter_m: f32, ends: Vec<TableEnd>) -> Self {
        let mut table = Self {
            common: TableCommon::new(name, "turntable", position, center_offset, ends),
            diameter_m,
            clockwise: false,
            counterclockwise: false,
            y_angle: 0.0,
            forward_connected: true,
            rear_connected: false,
            save_forward_connected: true,
            save_rear_connected: false,
            forward_connected_target: None,
            rear_connected_target: None,
            target_y: 0.0,
            last_connection: true,
            connection_toggled: false,
        };
        table.common.animation = table.animation_matrix();
        table
    }

    pub fn animation_matrix(&self) -> Mat4 {
        self.common.position.matrix * Mat4::from_translation(self.common.center_offset) * Mat4::from_rotation_y(self.y_angle)
    }

    fn is_moving(&self) -> bool {
        self.clockwise || self.counterclockwise
    }

    /// Picks the end the table will stop at when continuous motion ends.
    pub fn compute_target(&mut self, clockwise: bool) {
        if !self.common.continuous {
            return;
        }
        self.common.continuous = false;
        self.common.go_to_target = false;
        self.clockwise = clockwise;
        self.counterclockwise = !clockwise;
        self.forward_connected = false;
        self.rear_connected = false;
        self.forward_connected_target = None;
        self.rear_connected_target = None;

        let sign = if clockwise { 1.0 } else { -1.0 };
        let mut forward_diff = ANGLE_SEARCH_LIMIT_RAD;
        let mut rear_diff = ANGLE_SEARCH_LIMIT_RAD;
        let candidates: Vec<usize> = if clockwise {
            (0..self.common.ends.len()).rev().collect()
        } else {
            (0..self.common.ends.len()).collect()
        };
        for i in candidates {
            let end = &self.common.ends[i];
            if !end.is_linked() {
                continue;
            }
            let diff = sign * wrap_angle(end.position + self.y_angle);
            if diff < forward_diff && diff >= 0.0 {
                self.forward_connected_target = Some(i);
                forward_diff = diff;
            }
            let diff = sign * wrap_angle(end.position + self.y_angle + std::f32::consts::PI);
            if diff < rear_diff && diff >= 0.0 {
                self.rear_connected_target = Some(i);
                rear_diff = diff;
            }
        }

        if forward_diff < TARGET_SEARCH_WINDOW_RAD || rear_diff < TARGET_SEARCH_WINDOW_RAD {
            let apart = (forward_diff - rear_diff).abs() > TARGET_TIE_RAD;
            if forward_diff < rear_diff && apart {
                self.rear_connected_target = None;
            } else if forward_diff > rear_diff && apart {
                self.forward_connected_target = None;
            }
        } else {
            self.clockwise = false;
            self.counterclockwise = false;
            self.forward_connected_target = None;
            self.rear_connected_target = None;
        }
    }

    /// Starts turning. Refused when a train is partly on the table, when
    /// more than one train is on it, or when the train on board is not
    /// stopped in neutral.
    pub fn start_continuous(&mut self, clockwise: bool, trains: &mut [Train], confirmer: &mut Confirmer, ctx: &SimContext) {
        if !self.common.occupancy_allows_motion() {
            self.clockwise = false;
            self.counterclockwise = false;
            self.common.continuous = false;
            confirmer.warning(&ctx.get_string("Train partially on turntable, can't rotate"));
            return;
        }
        if let Some(id) = self.common.single_boarded() {
            if let Some(train) = trains.iter_mut().find(|t| t.number == id) {
                if !TableCommon::train_ready(train, confirmer, ctx, "Rotation") {
                    return;
                }
                if matches!(
                    train.control_mode,
                    ControlMode::Manual | ControlMode::Explorer | ControlMode::Undefined
                ) {
                    self.save_forward_connected = self.forward_connected ^ !self.common.connected_orientation();
                    self.save_rear_connected = self.rear_connected;
                    self.common.animation = self.animation_matrix();
                    self.common.capture_train(train);
                }
                confirmer.information(&ctx.get_string("Turntable starting rotation with train"));
            }
        }
        self.clockwise = clockwise;
        self.counterclockwise = !clockwise;
        self.common.continuous = true;
        debug!("{} turning {}", self.common.name, if clockwise { "clockwise" } else { "counterclockwise" });
    }

    /// Connection bookkeeping. Returns true on the tick the table locks onto
    /// a track end.
    pub fn update(&mut self, confirmer: &mut Confirmer, ctx: &SimContext) -> bool {
        if self.common.has_partial_train() {
            self.clockwise = false;
            self.counterclockwise = false;
            self.common.continuous = false;
            return false;
        }
        if self.common.continuous {
            self.forward_connected = false;
            self.rear_connected = false;
            self.common.connected_track_end = None;
            self.common.go_to_target = false;
            return false;
        }
        if !self.is_moving() {
            return false;
        }
        self.forward_connected = false;
        self.rear_connected = false;

        if let Some(target) = self.forward_connected_target {
            let angle = self.common.ends[target].position;
            if wrap_angle(angle + self.y_angle).abs() < FORWARD_CONNECT_TOLERANCE_RAD {
                self.forward_connected = true;
                self.connect(target, -angle);
                self.connection_toggled = self.last_connection;
                self.last_connection = true;
                confirmer.information(&ctx.get_string("Turntable forward connected"));
                return true;
            }
        } else if let Some(target) = self.rear_connected_target {
            let angle = self.common.ends[target].position;
            if wrap_angle(angle + self.y_angle + std::f32::consts::PI).abs() < REAR_CONNECT_TOLERANCE_RAD {
                self.rear_connected = true;
                self.connect(target, -wrap_angle(angle + std::f32::consts::PI));
                self.connection_toggled = !self.last_connection;
                self.last_connection = false;
                confirmer.information(&ctx.get_string("Turntable backward connected"));
                return true;
            }
        }
        false
    }

    fn connect(&mut self, end: usize, target_y: f32) {
        self.clockwise = false;
        self.counterclockwise = false;
        self.common.connected_track_end = Some(end);
        self.common.go_to_target = true;
        self.target_y = target_y;
        info!("{} connected to end {}", self.common.name, end);
    }

    /// Remaining rotation before the current target lines up, in the
    /// direction of motion.
    fn remaining_to_target(&self) -> Option<f32> {
        let sign = if self.clockwise { 1.0 } else { -1.0 };
        if let Some(t) = self.forward_connected_target {
            return Some(sign * wrap_angle(self.common.ends[t].position + self.y_angle));
        }
        self.rear_connected_target
            .map(|t| sign * wrap_angle(self.common.ends[t].position + self.y_angle + std::f32::consts::PI))
    }

    /// Turns the bridge for `elapsed_s` seconds at `speed_rad_s` and carries
    /// any boarded train along.
    pub fn animate(&mut self, elapsed_s: f32, speed_rad_s: f32, trains: &mut [Train]) -> Result<()> {
        let moving = self.is_moving();
        if self.common.go_to_target {
            self.y_angle = self.target_y;
        } else if moving {
            let mut step = speed_rad_s * elapsed_s;
            if !self.common.continuous {
                if let Some(left) = self.remaining_to_target().filter(|l| *l >= 0.0) {
                    step = step.min(left);
                }
            }
            let sign = if self.clockwise { -1.0 } else { 1.0 };
            self.y_angle = wrap_angle(self.y_angle + sign * step);
        }
        self.perform_update_actions(self.animation_matrix(), moving, trains)
    }

    fn perform_update_actions(&mut self, animation: Mat4, moving: bool, trains: &mut [Train]) -> Result<()> {
        self.common.move_train(animation, moving, trains);
        let boarded_turning = self
            .common
            .single_boarded()
            .and_then(|id| trains.iter().find(|t| t.number == id))
            .map_or(false, |t| t.control_mode == ControlMode::Turntable);
        if self.common.go_to_target && boarded_turning {
            self.common.recalculate_traveller_locations();
        }
        if self.common.go_to_target {
            self.target_exactly_reached(trains)?;
        }
        Ok(())
    }

    fn target_exactly_reached(&mut self, trains: &mut [Train]) -> Result<()> {
        let mut direction = if self.forward_connected {
            TravellerDirection::Forward
        } else {
            TravellerDirection::Backward
        };
        if !(self.save_forward_connected ^ !self.common.connected_orientation()) {
            direction = direction.reversed();
        }
        self.common.go_to_target = false;
        self.common.reenter_track(direction, trains)
    }

    pub fn check_train_on_table(&mut self, train: &mut Train, confirmer: &mut Confirmer, ctx: &SimContext) -> bool {
        let connected = self.forward_connected || self.rear_connected;
        let radius = self.diameter_m / 2.0;
        self.common.check_train_on_table(train, radius, connected, confirmer, ctx)
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_bool(self.common.continuous)?;
        out.write_bool(self.clockwise)?;
        out.write_bool(self.counterclockwise)?;
        out.write_f32(self.y_angle)?;
        out.write_bool(self.forward_connected)?;
        out.write_bool(self.rear_connected)?;
        out.write_bool(self.save_forward_connected)?;
        out.write_bool(self.save_rear_connected)?;
        out.write_index(self.common.connected_track_end)?;
        out.write_index(self.forward_connected_target)?;
        out.write_index(self.rear_connected_target)?;
        out.write_bool(self.common.go_to_target)?;
        out.write_f32(self.target_y)?;
        self.common.save_trains(out)?;
        self.common.save_locations(out)?;
        out.write_bool(self.last_connection)?;
        out.write_bool(self.connection_toggled)
    }

    pub fn restore<R: Read>(&mut self, input: &mut SaveReader<R>) -> Result<()> {
        self.common.continuous = input.read_bool()?;
        self.clockwise = input.read_bool()?;
        self.counterclockwise = input.read_bool()?;
        self.y_angle = input.read_f32()?;
        self.forward_connected = input.read_bool()?;
        self.rear_connected = input.read_bool()?;
        self.save_forward_connected = input.read_bool()?;
        self.save_rear_connected = input.read_bool()?;
        self.common.connected_track_end = input.read_index()?;
        self.forward_connected_target = input.read_index()?;
        self.rear_connected_target = input.read_index()?;
        self.common.go_to_target = input.read_bool()?;
        self.target_y = input.read_f32()?;
        self.common.restore_trains(input)?;
        self.common.restore_locations(input)?;
        self.last_connection = input.read_bool()?;
        self.connection_toggled = input.read_bool()?;
        self.common.animation = self.animation_matrix();
        Ok(())
    }
}

/// A sliding bridge moving along its local X axis, or Y when the transfer is
/// vertical.
#[derive(Debug, Clone)]
pub struct Transfertable {
    pub common: TableCommon,
    pub length_m: f32,
    pub vertical: bool,
    pub forward: bool,
    pub reverse: bool,
    pub offset_pos: f32,
    pub connected: bool,
    pub save_connected: bool,
    pub connected_target: Option<usize>,
    pub target_offset: f32,
}

impl Transfertable {
    pub fn new(
        name: &str,
        position: WorldPosition,
        center_offset: Vec3,
        length_m: f32,
        vertical: bool,
        ends: Vec<TableEnd>,
    ) -> Self {
        let offset_pos = if vertical { center_offset.y } else { center_offset.x };
        let mut table = Self {
            common: TableCommon::new(name, "transfertable", position, center_offset, ends),
            length_m,
            vertical,
            forward: false,
            reverse: false,
            offset_pos,
            connected: true,
            save_connected: true,
            connected_target: None,
            target_offset: 0.0,
        };
        table.common.animation = table.animation_matrix();
        table
    }

    /// Distance between the first and the last end.
    pub fn span(&self) -> f32 {
        match (self.common.ends.first(), self.common.ends.last()) {
            (Some(a), Some(b)) => b.position - a.position,
            _ => 0.0,
        }
    }

    pub fn animation_matrix(&self) -> Mat4 {
        let mut offset = self.common.center_offset;
        if self.vertical {
            offset.y = self.offset_pos;
        } else {
            offset.x = self.offset_pos;
        }
        self.common.position.matrix * Mat4::from_translation(offset)
    }

    fn is_moving(&self) -> bool {
        self.forward || self.reverse
    }

    pub fn compute_target(&mut self, forward: bool) {
        if !self.common.continuous {
            return;
        }
        self.common.continuous = false;
        self.common.go_to_target = false;
        self.forward = forward;
        self.reverse = !forward;
        self.connected = false;
        self.connected_target = None;

        let order: Vec<usize> = if forward {
            (0..self.common.ends.len()).rev().collect()
        } else {
            (0..self.common.ends.len()).collect()
        };
        let mut found = false;
        for i in order {
            let end = &self.common.ends[i];
            if !end.is_linked() {
                continue;
            }
            let diff = end.position - self.offset_pos;
            let diff = if forward { diff } else { -diff };
            if diff < OFFSET_SEARCH_WINDOW_M && diff >= 0.0 {
                self.connected_target = Some(i);
                found = true;
                break;
            } else if diff < 0.0 {
                break;
            }
        }
        if !found {
            self.forward = false;
            self.reverse = false;
        }
    }

    pub fn start_continuous(&mut self, forward: bool, trains: &mut [Train], confirmer: &mut Confirmer, ctx: &SimContext) {
        if let Some(id) = self.common.single_boarded() {
            if let Some(train) = trains.iter().find(|t| t.number == id) {
                if !TableCommon::train_ready(train, confirmer, ctx, "Transfer") {
                    return;
                }
            }
        }
        if !self.common.occupancy_allows_motion() {
            self.forward = false;
            self.reverse = false;
            self.common.continuous = false;
            confirmer.warning(&ctx.get_string("Train partially on transfertable, can't transfer"));
            return;
        }
        if let Some(id) = self.common.single_boarded() {
            if let Some(train) = trains.iter_mut().find(|t| t.number == id) {
                if matches!(
                    train.control_mode,
                    ControlMode::Manual | ControlMode::Explorer | ControlMode::Undefined
                ) {
                    self.save_connected = self.connected ^ !self.common.connected_orientation();
                    self.common.animation = self.animation_matrix();
                    self.common.capture_train(train);
                }
                confirmer.information(&ctx.get_string("Transfertable starting transferring train"));
            }
        }
        self.forward = forward;
        self.reverse = !forward;
        self.common.continuous = true;
    }

    pub fn update(&mut self, confirmer: &mut Confirmer, ctx: &SimContext) -> bool {
        if self.common.has_partial_train() {
            self.forward = false;
            self.reverse = false;
            self.common.continuous = false;
            return false;
        }
        if self.common.continuous {
            self.connected = false;
            self.common.connected_track_end = None;
            self.common.go_to_target = false;
            return false;
        }
        if !self.is_moving() {
            return false;
        }
        self.connected = false;
        let Some(target) = self.connected_target else {
            return false;
        };
        let end = self.common.ends[target].position;
        let left = if self.forward { end - self.offset_pos } else { self.offset_pos - end };
        if left < OFFSET_CONNECT_TOLERANCE_M {
            self.connected = true;
            self.forward = false;
            self.reverse = false;
            self.common.connected_track_end = Some(target);
            self.common.go_to_target = true;
            self.target_offset = end;
            confirmer.information(&ctx.get_string("Transfertable connected"));
            info!("{} connected to end {}", self.common.name, target);
            return true;
        }
        false
    }

    pub fn animate(&mut self, elapsed_s: f32, speed_mps: f32, trains: &mut [Train]) -> Result<()> {
        let moving = self.is_moving();
        if self.common.go_to_target {
            self.offset_pos = self.target_offset;
        } else if moving {
            let mut step = speed_mps * elapsed_s;
            if !self.common.continuous {
                if let Some(t) = self.connected_target {
                    let end = self.common.ends[t].position;
                    let left = if self.forward { end - self.offset_pos } else { self.offset_pos - end };
                    step = step.min(left.max(0.0));
                }
            }
            self.offset_pos += if self.forward { step } else { -step };
        }
        let animation = self.animation_matrix();
        self.common.move_train(animation, moving, trains);
        let boarded_moving = self
            .common
            .single_boarded()
            .and_then(|id| trains.iter().find(|t| t.number == id))
            .map_or(false, |t| t.control_mode == ControlMode::Turntable);
        if self.common.go_to_target && boarded_moving {
            self.common.recalculate_traveller_locations();
        }
        if self.common.go_to_target {
            self.target_exactly_reached(trains)?;
        }
        Ok(())
    }

    fn target_exactly_reached(&mut self, trains: &mut [Train]) -> Result<()> {
        let mut direction = TravellerDirection::Forward;
        if !(self.save_connected ^ !self.common.connected_orientation()) {
            direction = direction.reversed();
        }
        self.common.go_to_target = false;
        self.common.reenter_track(direction, trains)
    }

    pub fn check_train_on_table(&mut self, train: &mut Train, confirmer: &mut Confirmer, ctx: &SimContext) -> bool {
        let radius = self.length_m / 2.0;
        let connected = self.connected;
        self.common.check_train_on_table(train, radius, connected, confirmer, ctx)
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_bool(self.common.continuous)?;
        out.write_bool(self.common.go_to_target)?;
        out.write_index(self.common.connected_track_end)?;
        self.common.save_trains(out)?;
        self.common.save_locations(out)?;
        out.write_bool(self.forward)?;
        out.write_bool(self.reverse)?;
        out.write_f32(self.offset_pos)?;
        out.write_bool(self.connected)?;
        out.write_bool(self.save_connected)?;
        out.write_index(self.connected_target)?;
        out.write_f32(self.target_offset)
    }

    pub fn restore<R: Read>(&mut self, input: &mut SaveReader<R>) -> Result<()> {
        self.common.continuous = input.read_bool()?;
        self.common.go_to_target = input.read_bool()?;
        self.common.connected_track_end = input.read_index()?;
        self.common.restore_trains(input)?;
        self.common.restore_locations(input)?;
        self.forward = input.read_bool()?;
        self.reverse = input.read_bool()?;
        self.offset_pos = input.read_f32()?;
        self.connected = input.read_bool()?;
        self.save_connected = input.read_bool()?;
        self.connected_target = input.read_index()?;
        self.target_offset = input.read_f32()?;
        self.common.animation = self.animation_matrix();
        Ok(())
    }
}

/// Either kind of table, as held by the simulator.
#[derive(Debug, Clone)]
pub enum MovingTable {
    Turntable(Turntable),
    Transfertable(Transfertable),
}

impl MovingTable {
    pub fn common(&self) -> &TableCommon {
        match self {
            MovingTable::Turntable(t) => &t.common,
            MovingTable::Transfertable(t) => &t.common,
        }
    }

    fn common_mut(&mut self) -> &mut TableCommon {
        match self {
            MovingTable::Turntable(t) => &mut t.common,
            MovingTable::Transfertable(t) => &mut t.common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    /// `positive` is clockwise for turntables and forward for
    /// transfertables.
    pub fn start_continuous(&mut self, positive: bool, trains: &mut [Train], confirmer: &mut Confirmer, ctx: &SimContext) {
        match self {
            MovingTable::Turntable(t) => t.start_continuous(positive, trains, confirmer, ctx),
            MovingTable::Transfertable(t) => t.start_continuous(positive, trains, confirmer, ctx),
        }
    }

    pub fn compute_target(&mut self, positive: bool) {
        match self {
            MovingTable::Turntable(t) => t.compute_target(positive),
            MovingTable::Transfertable(t) => t.compute_target(positive),
        }
    }

    /// One simulation step: connection checks, then motion. Returns the end
    /// the table connected to this tick, if any.
    pub fn advance(
        &mut self,
        elapsed_s: f32,
        turntable_speed_rad_s: f32,
        transfertable_speed_mps: f32,
        trains: &mut [Train],
        confirmer: &mut Confirmer,
        ctx: &SimContext,
    ) -> Result<Option<usize>> {
        let connected = match self {
            MovingTable::Turntable(t) => {
                let connected = t.update(confirmer, ctx);
                t.animate(elapsed_s, turntable_speed_rad_s, trains)?;
                connected
            }
            MovingTable::Transfertable(t) => {
                let connected = t.update(confirmer, ctx);
                t.animate(elapsed_s, transfertable_speed_mps, trains)?;
                connected
            }
        };
        Ok(if connected { self.common().connected_track_end } else { None })
    }

    pub fn check_train_on_table(&mut self, train: &mut Train, confirmer: &mut Confirmer, ctx: &SimContext) -> bool {
        match self {
            MovingTable::Turntable(t) => t.check_train_on_table(train, confirmer, ctx),
            MovingTable::Transfertable(t) => t.check_train_on_table(train, confirmer, ctx),
        }
    }

    pub fn is_train_on_board(&self, train: TrainId) -> bool {
        self.common().trains_on_table.iter().any(|t| t.train == train)
    }

    pub fn forget_train(&mut self, train: TrainId) {
        self.common_mut().forget_train(train);
    }

    pub fn relink(&mut self, trains: &[Train]) {
        self.common_mut().relink(trains);
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        match self {
            MovingTable::Turntable(t) => t.save(out),
            MovingTable::Transfertable(t) => t.save(out),
        }
    }

    pub fn restore<R: Read>(&mut self, input: &mut SaveReader<R>) -> Result<()> {
        let name = self.name().to_string();
        match self {
            MovingTable::Turntable(t) => t.restore(input),
            MovingTable::Transfertable(t) => t.restore(input),
        }
        .with_context(|| format!("Restoring moving table {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn table(ends: Vec<TableEnd>) -> Turntable {
        Turntable::new("tt", WorldPosition::default(), Vec3::ZERO, 20.0, ends)
    }

    #[test]
    fn clockwise_target_is_nearest_end_ahead() {
        let mut t = table(vec![TableEnd::new(0.0, 1, 0, true), TableEnd::new(FRAC_PI_2, 2, 0, true)]);
        t.y_angle = -FRAC_PI_2 + 0.05;
        t.common.continuous = true;
        t.compute_target(true);
        assert!(t.clockwise);
        assert_eq!(t.forward_connected_target, Some(1));
        assert_eq!(t.rear_connected_target, None);
    }

    #[test]
    fn no_end_in_window_stops_rotation() {
        let mut t = table(vec![TableEnd::new(0.0, 1, 0, true)]);
        t.y_angle = -1.0;
        t.common.continuous = true;
        t.compute_target(false);
        assert!(!t.counterclockwise);
        assert_eq!(t.forward_connected_target, None);
    }

    #[test]
    fn unlinked_ends_are_never_targets() {
        let mut t = table(vec![TableEnd::unlinked(0.0)]);
        t.y_angle = 0.02;
        t.common.continuous = true;
        t.compute_target(true);
        assert_eq!(t.forward_connected_target, None);
    }

    #[test]
    fn transfertable_finds_end_ahead() {
        let ends = vec![TableEnd::new(0.0, 1, 0, true), TableEnd::new(5.0, 2, 0, true)];
        let mut t = Transfertable::new("tf", WorldPosition::default(), Vec3::ZERO, 12.0, false, ends);
        t.offset_pos = 4.2;
        t.common.continuous = true;
        t.compute_target(true);
        assert!(t.forward);
        assert_eq!(t.connected_target, Some(1));
        assert_eq!(t.span(), 5.0);
    }
}
