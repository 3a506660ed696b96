//! Trains and cars
//!
//! The kernel's view of a train: an ordered car list, a front and a rear
//! traveller, a speed and a control mode. Traction and braking physics are
//! outside the kernel; [`Train::update`] only advances the travellers at the
//! current speed.

use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec3};
use log::warn;
use std::io::{Read, Write};
use std::sync::Arc;

use super::container::FreightSlot;
use super::save::{SaveReader, SaveWriter};
use super::track_db::{FuelKind, TrackDb};
use super::traveller::Traveller;
use super::types::{TrainId, TravellerDirection, WorldPosition, MAX_STOPPED_MPS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrainType {
    Static,
    Player,
    Ai,
    AiNotStarted,
    AiPlayerDriven,
    AiPlayerHosting,
    AiIncorporated,
    Remote,
}

impl TrainType {
    pub fn code(self) -> i32 {
        match self {
            TrainType::Static => 0,
            TrainType::Player => 1,
            TrainType::Ai => 2,
            TrainType::AiNotStarted => 3,
            TrainType::AiPlayerDriven => 4,
            TrainType::AiPlayerHosting => 5,
            TrainType::AiIncorporated => 6,
            TrainType::Remote => 7,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => TrainType::Static,
            1 => TrainType::Player,
            2 => TrainType::Ai,
            3 => TrainType::AiNotStarted,
            4 => TrainType::AiPlayerDriven,
            5 => TrainType::AiPlayerHosting,
            6 => TrainType::AiIncorporated,
            7 => TrainType::Remote,
            other => anyhow::bail!("Unknown train type {}", other),
        })
    }

    pub fn is_ai(self) -> bool {
        matches!(
            self,
            TrainType::Ai | TrainType::AiNotStarted | TrainType::AiPlayerHosting | TrainType::AiIncorporated
        )
    }

    /// Trains driven by the player, including player-driven AI services.
    pub fn is_player_driven(self) -> bool {
        matches!(self, TrainType::Player | TrainType::AiPlayerDriven)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMode {
    AutoSignal,
    AutoNode,
    Manual,
    Explorer,
    OutOfControl,
    Inactive,
    Turntable,
    Undefined,
}

impl ControlMode {
    pub fn code(self) -> i32 {
        match self {
            ControlMode::AutoSignal => 0,
            ControlMode::AutoNode => 1,
            ControlMode::Manual => 2,
            ControlMode::Explorer => 3,
            ControlMode::OutOfControl => 4,
            ControlMode::Inactive => 5,
            ControlMode::Turntable => 6,
            ControlMode::Undefined => 7,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => ControlMode::AutoSignal,
            1 => ControlMode::AutoNode,
            2 => ControlMode::Manual,
            3 => ControlMode::Explorer,
            4 => ControlMode::OutOfControl,
            5 => ControlMode::Inactive,
            6 => ControlMode::Turntable,
            7 => ControlMode::Undefined,
            other => anyhow::bail!("Unknown control mode {}", other),
        })
    }

    /// Signal-controlled modes.
    pub fn is_auto(self) -> bool {
        matches!(self, ControlMode::AutoSignal | ControlMode::AutoNode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutOfControlReason {
    #[default]
    None,
    SpadFront,
    SpadRear,
    MisalignedSwitch,
    OutOfAuthority,
    OutOfPath,
    SlippedIntoPath,
    SlippedToEndOfTrack,
    OutOfTrack,
    SlippedIntoTurntable,
}

impl OutOfControlReason {
    pub fn code(self) -> i32 {
        match self {
            OutOfControlReason::None => -1,
            OutOfControlReason::SpadFront => 0,
            OutOfControlReason::SpadRear => 1,
            OutOfControlReason::MisalignedSwitch => 2,
            OutOfControlReason::OutOfAuthority => 3,
            OutOfControlReason::OutOfPath => 4,
            OutOfControlReason::SlippedIntoPath => 5,
            OutOfControlReason::SlippedToEndOfTrack => 6,
            OutOfControlReason::OutOfTrack => 7,
            OutOfControlReason::SlippedIntoTurntable => 8,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => OutOfControlReason::SpadFront,
            1 => OutOfControlReason::SpadRear,
            2 => OutOfControlReason::MisalignedSwitch,
            3 => OutOfControlReason::OutOfAuthority,
            4 => OutOfControlReason::OutOfPath,
            5 => OutOfControlReason::SlippedIntoPath,
            6 => OutOfControlReason::SlippedToEndOfTrack,
            7 => OutOfControlReason::OutOfTrack,
            8 => OutOfControlReason::SlippedIntoTurntable,
            _ => OutOfControlReason::None,
        }
    }
}

/// Reverser position of the lead locomotive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reverser {
    Forward,
    #[default]
    Neutral,
    Reverse,
}

/// Fuel carried by a locomotive or tender.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuelLoad {
    pub kind: FuelKind,
    pub level: f32,
    pub capacity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainCar {
    /// `"{uid >> 16} - {uid & 0xFFFF}"` for consist cars.
    pub car_id: String,
    pub length_m: f32,
    pub mass_kg: f32,
    pub flipped: bool,
    pub is_locomotive: bool,
    pub fuel: Option<FuelLoad>,
    /// Container loading area, for container wagons.
    pub freight: Option<FreightSlot>,
    pub world_position: WorldPosition,
}

impl TrainCar {
    pub fn new(car_id: impl Into<String>, length_m: f32, mass_kg: f32) -> Self {
        Self {
            car_id: car_id.into(),
            length_m,
            mass_kg,
            flipped: false,
            is_locomotive: false,
            fuel: None,
            freight: None,
            world_position: WorldPosition::default(),
        }
    }

    pub fn locomotive(car_id: impl Into<String>, length_m: f32, mass_kg: f32) -> Self {
        Self {
            is_locomotive: true,
            ..Self::new(car_id, length_m, mass_kg)
        }
    }

    pub fn with_fuel(mut self, kind: FuelKind, level: f32, capacity: f32) -> Self {
        self.fuel = Some(FuelLoad {
            kind,
            level,
            capacity,
        });
        self
    }

    pub fn with_freight(mut self, slot: FreightSlot) -> Self {
        self.freight = Some(slot);
        self
    }

    /// Car id for a wagon uid as written in consist and activity files.
    pub fn wagon_id(uid: u32) -> String {
        format!("{} - {}", uid >> 16, uid & 0xFFFF)
    }

    fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_string(&self.car_id)?;
        out.write_f32(self.length_m)?;
        out.write_f32(self.mass_kg)?;
        out.write_bool(self.flipped)?;
        out.write_bool(self.is_locomotive)?;
        out.write_bool(self.freight.is_some())?;
        match &self.freight {
            Some(slot) => slot.save(out),
            None => Ok(()),
        }
    }

    fn restore<R: Read>(input: &mut SaveReader<R>) -> Result<Self> {
        let car_id = input.read_string()?;
        let length_m = input.read_f32()?;
        let mass_kg = input.read_f32()?;
        let flipped = input.read_bool()?;
        let is_locomotive = input.read_bool()?;
        let freight = if input.read_bool()? {
            Some(FreightSlot::restore(input)?)
        } else {
            None
        };
        Ok(Self {
            flipped,
            is_locomotive,
            freight,
            ..Self::new(car_id, length_m, mass_kg)
        })
    }
}

#[derive(Debug, Clone)]
pub struct Train {
    pub number: TrainId,
    pub name: String,
    pub train_type: TrainType,
    pub control_mode: ControlMode,
    pub out_of_control_reason: OutOfControlReason,
    pub speed_mps: f32,
    pub max_speed_mps: f32,
    pub throttle_percent: f32,
    pub reverser: Reverser,
    pub cars: Vec<TrainCar>,
    pub lead_locomotive_index: Option<usize>,
    pub uncoupled_from: Option<TrainId>,
    pub front: Traveller,
    pub rear: Traveller,
    pub is_tilting: bool,
    /// Seconds before a waiting train restarts, once asked to.
    pub restart_delay_s: Option<f32>,
}

impl Train {
    /// Builds a train whose front car sits at `front`; the rear traveller is
    /// placed the train's length behind it.
    pub fn new(number: TrainId, name: &str, train_type: TrainType, front: Traveller, cars: Vec<TrainCar>) -> Self {
        let lead_locomotive_index = cars.iter().position(|c| c.is_locomotive);
        let mut train = Self {
            number,
            name: name.to_string(),
            train_type,
            control_mode: match train_type {
                TrainType::Static => ControlMode::Undefined,
                TrainType::Player => ControlMode::Manual,
                _ => ControlMode::AutoSignal,
            },
            out_of_control_reason: OutOfControlReason::None,
            speed_mps: 0.0,
            max_speed_mps: 25.0,
            throttle_percent: 0.0,
            reverser: Reverser::Neutral,
            cars,
            lead_locomotive_index,
            uncoupled_from: None,
            rear: front.clone(),
            front,
            is_tilting: false,
            restart_delay_s: None,
        };
        train.reposition_rear_traveller();
        train
    }

    pub fn length_m(&self) -> f32 {
        self.cars.iter().map(|c| c.length_m).sum()
    }

    pub fn mass_kg(&self) -> f32 {
        self.cars.iter().map(|c| c.mass_kg).sum()
    }

    pub fn is_stopped(&self) -> bool {
        self.speed_mps.abs() <= MAX_STOPPED_MPS
    }

    pub fn is_static(&self) -> bool {
        self.train_type == TrainType::Static
    }

    pub fn lead_locomotive(&self) -> Option<&TrainCar> {
        self.lead_locomotive_index.and_then(|i| self.cars.get(i))
    }

    pub fn first_car(&self) -> Option<&TrainCar> {
        self.cars.first()
    }

    pub fn last_car(&self) -> Option<&TrainCar> {
        self.cars.last()
    }

    /// Puts the rear traveller one train length behind the front.
    pub fn reposition_rear_traveller(&mut self) {
        let mut rear = self.front.clone();
        rear.move_by(-self.length_m());
        self.rear = rear;
        self.calculate_position_of_cars();
    }

    /// Puts the front traveller one train length ahead of the rear.
    pub fn reposition_front_traveller(&mut self) {
        let mut front = self.rear.clone();
        front.move_by(self.length_m());
        self.front = front;
        self.calculate_position_of_cars();
    }

    /// Advances the train at its current speed. A train that runs out of
    /// track is brought to a stand against the buffers.
    pub fn update(&mut self, elapsed_s: f32) {
        if self.control_mode == ControlMode::Turntable || elapsed_s <= 0.0 {
            return;
        }
        let distance = self.speed_mps * elapsed_s;
        if distance == 0.0 {
            return;
        }
        self.move_by(distance);
    }

    /// Moves the whole train along the track by `distance_m`.
    pub fn move_by(&mut self, distance_m: f32) {
        let length = self.length_m();
        if distance_m > 0.0 {
            let left = self.front.move_by(distance_m);
            let mut rear = self.front.clone();
            rear.move_by(-length);
            self.rear = rear;
            if left.abs() > 0.01 {
                self.hit_buffers();
            }
        } else {
            let left = self.rear.move_by(distance_m);
            let mut front = self.rear.clone();
            front.move_by(length);
            self.front = front;
            if left.abs() > 0.01 {
                self.hit_buffers();
            }
        }
        self.calculate_position_of_cars();
    }

    fn hit_buffers(&mut self) {
        if self.speed_mps != 0.0 {
            warn!("Train {} ({}) ran out of track", self.number, self.name);
        }
        self.speed_mps = 0.0;
        self.throttle_percent = 0.0;
    }

    /// Recomputes every car's world transform from the front traveller.
    pub fn calculate_position_of_cars(&mut self) {
        let mut cursor = self.front.clone();
        for car in self.cars.iter_mut() {
            let half = car.length_m / 2.0;
            cursor.move_by(-half);
            let loc = cursor.world_location();
            let mut yaw = cursor.yaw();
            if car.flipped {
                yaw += std::f32::consts::PI;
            }
            let matrix = Mat4::from_rotation_translation(
                Quat::from_rotation_y(yaw),
                Vec3::new(loc.location.x, loc.location.y, loc.location.z),
            );
            car.world_position = WorldPosition::new(loc.tile_x, loc.tile_z, matrix);
            cursor.move_by(-half);
        }
    }

    /// Sets both trains to the mass-weighted mean speed. `other_mult` is +1
    /// when the two trains face the same way and -1 otherwise.
    pub fn set_couple_speed(&mut self, other: &mut Train, other_mult: f32) {
        let kg1 = self.mass_kg();
        let kg2 = other.mass_kg();
        let total = kg1 + kg2;
        if total <= 0.0 {
            return;
        }
        let speed = (kg1 * self.speed_mps + kg2 * other.speed_mps * other_mult) / total;
        self.speed_mps = speed;
        other.speed_mps = speed * other_mult;
    }

    /// True if the car ids match `wagons` in order, or in reverse order.
    pub fn matches_consist(&self, wagons: &[String]) -> bool {
        if self.cars.len() != wagons.len() {
            return false;
        }
        let forward = self.cars.iter().zip(wagons).all(|(c, w)| &c.car_id == w);
        let backward = self.cars.iter().rev().zip(wagons).all(|(c, w)| &c.car_id == w);
        forward || backward
    }

    /// True if the train holds exactly the listed wagons, in any order.
    pub fn matches_consist_no_order(&self, wagons: &[String]) -> bool {
        self.cars.len() == wagons.len() && self.includes_wagons(wagons)
    }

    pub fn includes_wagons(&self, wagons: &[String]) -> bool {
        wagons
            .iter()
            .all(|w| self.cars.iter().any(|c| &c.car_id == w))
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i32(self.number.0 as i32)?;
        out.write_string(&self.name)?;
        out.write_i32(self.train_type.code())?;
        out.write_i32(self.control_mode.code())?;
        out.write_f32(self.speed_mps)?;
        out.write_index(self.lead_locomotive_index)?;
        out.write_i32(self.uncoupled_from.map_or(-1, |t| t.0 as i32))?;
        out.write_i32(self.out_of_control_reason.code())?;
        out.write_i32(self.cars.len() as i32)?;
        for car in &self.cars {
            car.save(out)?;
        }
        self.rear.save(out)?;
        self.front.save(out)
    }

    pub fn restore<R: Read>(db: &Arc<TrackDb>, input: &mut SaveReader<R>) -> Result<Self> {
        let number = TrainId(input.read_i32()? as u32);
        let name = input.read_string()?;
        let train_type = TrainType::from_code(input.read_i32()?)?;
        let control_mode = ControlMode::from_code(input.read_i32()?)?;
        let speed_mps = input.read_f32()?;
        let lead_locomotive_index = input.read_index()?;
        let uncoupled = input.read_i32()?;
        let out_of_control_reason = OutOfControlReason::from_code(input.read_i32()?);
        let count = input.read_i32()?;
        let mut cars = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            cars.push(TrainCar::restore(input)?);
        }
        let rear = Traveller::restore(db, input)
            .with_context(|| format!("Restoring rear traveller of train {}", number))?;
        let front = Traveller::restore(db, input)
            .with_context(|| format!("Restoring front traveller of train {}", number))?;

        let mut train = Self {
            number,
            name,
            train_type,
            control_mode,
            out_of_control_reason,
            speed_mps,
            max_speed_mps: 25.0,
            throttle_percent: 0.0,
            reverser: Reverser::Neutral,
            cars,
            lead_locomotive_index,
            uncoupled_from: (uncoupled >= 0).then_some(TrainId(uncoupled as u32)),
            front,
            rear,
            is_tilting: false,
            restart_delay_s: None,
        };
        train.calculate_position_of_cars();
        Ok(train)
    }

    /// Reverses the train's notion of front: travellers swap and flip, cars
    /// are listed from the other end.
    pub fn reverse_formation(&mut self) {
        std::mem::swap(&mut self.front, &mut self.rear);
        self.front.reverse_direction();
        self.rear.reverse_direction();
        self.cars.reverse();
        for car in self.cars.iter_mut() {
            car.flipped = !car.flipped;
        }
        let count = self.cars.len();
        self.lead_locomotive_index = self.lead_locomotive_index.map(|i| count - 1 - i);
        self.speed_mps = -self.speed_mps;
        self.calculate_position_of_cars();
    }

    /// Direction the train's front traveller faces.
    pub fn direction(&self) -> TravellerDirection {
        self.front.direction()
    }
}
