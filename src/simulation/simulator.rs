//! Simulator
//!
//! Owns the world: the track database, every train and the managers that
//! react to them. [`Simulator::update`] runs the per-tick pipeline in a
//! fixed order; moving tables go before trains and coupling before signals.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use petgraph::algo::{connected_components, kosaraju_scc};
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use super::activity::{Activity, ActivityDef, ActivityEnv, ActivityRequest};
use super::ai::AiManager;
use super::confirmer::Confirmer;
use super::container::ContainerManager;
use super::context::SimContext;
use super::fuel::FuelManager;
use super::hazard::HazardManager;
use super::level_crossing::{HornRequest, LevelCrossings};
use super::moving_table::MovingTable;
use super::save::{SaveReader, SaveWriter};
use super::settings::SimSettings;
use super::signals::{NullSignals, SignalSystem};
use super::super_elevation::{SuperElevation, SuperElevationStandard};
use super::track_db::{TrackDb, TrackNodeKind};
use super::train::{ControlMode, Train, TrainCar, TrainType};
use super::traveller::Traveller;
use super::types::{TrainId, TravellerDirection, WorldLocation};

/// A train that was just uncoupled may not re-couple until the gap between
/// the two exceeds this.
pub const UNCOUPLE_SEPARATION_M: f32 = 0.5;
/// Couplings faster than this count against the player.
pub const OVERSPEED_COUPLING_MPS: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Season {
    Spring,
    #[default]
    Summer,
    Autumn,
    Winter,
}

impl Season {
    fn code(self) -> i32 {
        self as i32
    }

    fn from_code(code: i32) -> Self {
        match code {
            0 => Season::Spring,
            2 => Season::Autumn,
            3 => Season::Winter,
            _ => Season::Summer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Weather {
    #[default]
    Clear,
    Snow,
    Rain,
}

impl Weather {
    fn code(self) -> i32 {
        self as i32
    }

    fn from_code(code: i32) -> Self {
        match code {
            1 => Weather::Snow,
            2 => Weather::Rain,
            _ => Weather::Clear,
        }
    }
}

/// One consist entry. `car` is `None` when the wagon file failed to load.
#[derive(Debug, Clone)]
pub struct WagonRef {
    pub file: String,
    pub car: Option<TrainCar>,
}

impl WagonRef {
    pub fn loaded(file: &str, car: TrainCar) -> Self {
        Self {
            file: file.to_string(),
            car: Some(car),
        }
    }

    pub fn missing(file: &str) -> Self {
        Self {
            file: file.to_string(),
            car: None,
        }
    }
}

/// Where and what to spawn.
#[derive(Debug, Clone)]
pub struct TrainSetup {
    pub name: String,
    pub train_type: TrainType,
    /// Position of the front of the train.
    pub location: WorldLocation,
    pub direction: TravellerDirection,
    pub wagons: Vec<WagonRef>,
    pub speed_mps: f32,
}

/// What happens to the old player train when the player changes trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchMode {
    /// The old train keeps running under AI control.
    Keep,
    Suspend,
    ReturnToStatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingSwitch {
    target: TrainId,
    mode: SwitchMode,
}

/// Things that happened during a tick, for the caller to drain.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Coupled {
        survivor: TrainId,
        absorbed: TrainId,
        over_speed: bool,
    },
    Uncoupled {
        train: TrainId,
        detached: TrainId,
    },
    PlayerChanged {
        from: Option<TrainId>,
        to: TrainId,
    },
    TableConnected {
        table: usize,
        end: usize,
    },
    Horn(HornRequest),
    PermissionToDepart,
}

/// Stand-in for the viewer's "is this locomotive's model loaded" check.
pub type LocoLoaded = Box<dyn Fn(&Train) -> bool>;

pub struct Simulator {
    pub settings: SimSettings,
    pub ctx: SimContext,
    pub confirmer: Confirmer,
    db: Arc<TrackDb>,
    pub super_elevation: Option<SuperElevation>,
    /// Connected components of the track graph, counted at load.
    pub network_components: usize,

    pub game_time_s: f64,
    /// Time of day in seconds since midnight.
    pub clock_time_s: f64,
    pub season: Season,
    pub weather: Weather,
    pub user_weather_file: String,

    pub trains: Vec<Train>,
    pub player: Option<TrainId>,
    next_train_number: u32,

    pub signals: Box<dyn SignalSystem>,
    pub ai: AiManager,
    pub level_crossings: LevelCrossings,
    pub hazards: HazardManager,
    pub fuel: FuelManager,
    pub containers: ContainerManager,
    pub moving_tables: Vec<MovingTable>,
    pub active_moving_table: Option<usize>,
    pub activity: Option<Activity>,

    pending_switch: Option<PendingSwitch>,
    loco_loaded: LocoLoaded,
    events: Vec<SimEvent>,
    pub over_speed_couplings: u32,
}

impl Simulator {
    /// Builds the world around a player train. The player's first car
    /// failing to load is fatal.
    pub fn new(mut db: TrackDb, settings: SimSettings, ctx: SimContext, player: TrainSetup) -> Result<Self> {
        let super_elevation = settings.use_super_elevation.then(|| {
            SuperElevation::compute(
                &mut db,
                settings.super_elevation_gauge_m,
                &[SuperElevationStandard::default()],
            )
        });
        let network_components = log_network_components(&db);
        let db = Arc::new(db);

        let mut sim = Self {
            confirmer: Confirmer::new(settings.confirmation_duration_s, settings.suppress_confirmations)
                .with_catalog(ctx.catalog.clone()),
            level_crossings: LevelCrossings::new(&db),
            hazards: HazardManager::new(&db),
            fuel: FuelManager::new(&db),
            containers: ContainerManager::new(),
            settings,
            ctx,
            db,
            super_elevation,
            network_components,
            game_time_s: 0.0,
            clock_time_s: 0.0,
            season: Season::default(),
            weather: Weather::default(),
            user_weather_file: String::new(),
            trains: Vec::new(),
            player: None,
            next_train_number: 0,
            signals: Box::new(NullSignals::new()),
            ai: AiManager::new(),
            moving_tables: Vec::new(),
            active_moving_table: None,
            activity: None,
            pending_switch: None,
            loco_loaded: Box::new(|_| true),
            events: Vec::new(),
            over_speed_couplings: 0,
        };

        let player_name = player.name.clone();
        let player_id = sim
            .add_train(player)?
            .with_context(|| format!("Player train {} has no cars", player_name))?;
        sim.player = Some(player_id);
        info!(
            "Simulator created: {} track nodes, {} level crossing items, player train {}",
            sim.db.node_count(),
            sim.level_crossings.track_items.len(),
            player_id
        );
        Ok(sim)
    }

    pub fn with_signals(mut self, signals: Box<dyn SignalSystem>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_loco_loaded(mut self, loco_loaded: LocoLoaded) -> Self {
        self.loco_loaded = loco_loaded;
        self
    }

    pub fn track_db(&self) -> &Arc<TrackDb> {
        &self.db
    }

    /// Spawns a train. Wagons that failed to load are skipped with a
    /// warning, except the player's first car. Returns `None` when nothing
    /// of the consist loaded.
    pub fn add_train(&mut self, setup: TrainSetup) -> Result<Option<TrainId>> {
        let is_player = setup.train_type.is_player_driven();
        let mut cars = Vec::with_capacity(setup.wagons.len());
        for (i, wagon) in setup.wagons.into_iter().enumerate() {
            match wagon.car {
                Some(car) => cars.push(car),
                None if i == 0 && is_player => {
                    bail!("Could not load the first car {} of player train {}", wagon.file, setup.name)
                }
                None => warn!("Couldn't load wagon {} of train {}; skipped", wagon.file, setup.name),
            }
        }
        if cars.is_empty() {
            warn!("Train {} has no cars and is not created", setup.name);
            return Ok(None);
        }

        let front = Traveller::from_location_facing(&self.db, &setup.location, setup.direction)
            .with_context(|| format!("Placing train {}", setup.name))?;
        let number = self.next_number();
        let mut train = Train::new(number, &setup.name, setup.train_type, front, cars);
        train.speed_mps = setup.speed_mps;
        if train.train_type.is_ai() {
            self.ai.add(number);
        }
        if let Some(activity) = self.activity.as_mut() {
            activity.associate_events(&train, None);
        }
        debug!("Train {} ({}) created with {} cars", number, train.name, train.cars.len());
        self.trains.push(train);
        Ok(Some(number))
    }

    fn next_number(&mut self) -> TrainId {
        let id = TrainId(self.next_train_number);
        self.next_train_number += 1;
        id
    }

    pub fn add_moving_table(&mut self, table: MovingTable) -> usize {
        self.moving_tables.push(table);
        self.moving_tables.len() - 1
    }

    pub fn load_activity(&mut self, def: &ActivityDef) {
        let mut activity = Activity::new(def, &self.db);
        for train in &self.trains {
            activity.associate_events(train, None);
        }
        if self.clock_time_s == 0.0 {
            self.clock_time_s = def.start_time_s;
        }
        self.activity = Some(activity);
    }

    pub fn train(&self, id: TrainId) -> Option<&Train> {
        self.trains.iter().find(|t| t.number == id)
    }

    pub fn train_mut(&mut self, id: TrainId) -> Option<&mut Train> {
        self.trains.iter_mut().find(|t| t.number == id)
    }

    fn train_index(&self, id: TrainId) -> Option<usize> {
        self.trains.iter().position(|t| t.number == id)
    }

    pub fn player_train(&self) -> Option<&Train> {
        self.player.and_then(|id| self.train(id))
    }

    pub fn drain_events(&mut self) -> Vec<SimEvent> {
        std::mem::take(&mut self.events)
    }

    /// Clock seconds covered by `real_s` of wall time.
    pub fn elapsed_clock_seconds(&self, real_s: f64) -> f64 {
        if self.settings.paused {
            0.0
        } else {
            real_s * self.settings.game_speed as f64
        }
    }

    pub fn update(&mut self, real_elapsed_s: f64) -> Result<()> {
        let elapsed = self.elapsed_clock_seconds(real_elapsed_s);
        self.game_time_s += elapsed;
        self.clock_time_s += elapsed;
        let elapsed_s = elapsed as f32;

        if self.pending_switch.is_some() && !self.complete_player_switch() {
            return Ok(());
        }

        if let Some(index) = self.active_moving_table {
            if let Some(table) = self.moving_tables.get_mut(index) {
                let connected = table.advance(
                    elapsed_s,
                    self.settings.turntable_speed_rad_s,
                    self.settings.transfertable_speed_mps,
                    &mut self.trains,
                    &mut self.confirmer,
                    &self.ctx,
                )?;
                if let Some(end) = connected {
                    self.events.push(SimEvent::TableConnected { table: index, end });
                }
            }
        }

        let moving: Vec<TrainId> = self
            .trains
            .iter()
            .filter(|t| Some(t.number) == self.player || t.speed_mps != 0.0)
            .filter(|t| !(t.train_type.is_ai() && self.ai.contains(t.number)))
            .map(|t| t.number)
            .collect();
        for id in &moving {
            let Some(index) = self.train_index(*id) else {
                continue;
            };
            let train = &mut self.trains[index];
            train.update(elapsed_s);
            if let Some(table) = self.active_moving_table.and_then(|i| self.moving_tables.get_mut(i)) {
                table.check_train_on_table(train, &mut self.confirmer, &self.ctx);
            }
        }
        if self.settings.timetable_mode {
            self.ai.timetable_update(elapsed_s, &mut self.trains);
        } else {
            self.ai.activity_update(elapsed_s, &mut self.trains);
        }

        if self.settings.network_role.is_authoritative() {
            for id in &moving {
                self.check_for_coupling(*id);
            }
            self.signals.update(false, &self.trains);
        }

        self.remove_absorbed_ai_trains();

        for horn in self.level_crossings.update(&self.trains) {
            self.events.push(SimEvent::Horn(horn));
        }

        let requests = match self.activity.as_mut() {
            Some(activity) => {
                let env = ActivityEnv {
                    clock_time_s: self.clock_time_s,
                    game_time_s: self.game_time_s,
                    timetable_mode: self.settings.timetable_mode,
                    trains: &self.trains,
                    player: self.player,
                    signals: self.signals.as_ref(),
                    ctx: &self.ctx,
                };
                activity.update(&env)
            }
            None => Vec::new(),
        };
        for request in requests {
            match request {
                ActivityRequest::RestartWaitingTrain { name, delay_s } => self.restart_waiting_train(&name, delay_s),
                ActivityRequest::PermissionToDepart => self.events.push(SimEvent::PermissionToDepart),
            }
        }

        self.hazards.update(elapsed_s, &self.trains, &mut self.ctx);
        self.containers
            .update(elapsed_s, &mut self.trains, &mut self.confirmer, &self.ctx);

        if let Some(index) = self.player.and_then(|id| self.train_index(id)) {
            let train = &mut self.trains[index];
            if train.is_stopped() {
                if let Some(at) = self.fuel.nearest_pickup(train) {
                    self.fuel.refill(train, &at, elapsed_s);
                }
            }
        }
        Ok(())
    }

    /// AI trains swallowed by a coupling leave the AI list.
    fn remove_absorbed_ai_trains(&mut self) {
        let gone: Vec<TrainId> = self
            .ai
            .ai_trains
            .iter()
            .copied()
            .filter(|id| self.train_index(*id).is_none())
            .collect();
        if gone.is_empty() {
            return;
        }
        self.ai.trains_to_remove.extend(gone);
        self.ai.remove_pending();
    }

    /// Couples `id` to the first train its leading end has run into. Returns
    /// true if a coupling happened. A standing train couples nothing, and a
    /// pair still exempt after an uncouple is held at contact instead.
    pub fn check_for_coupling(&mut self, id: TrainId) -> bool {
        let Some(i) = self.train_index(id) else {
            return false;
        };
        let speed = self.trains[i].speed_mps;
        if speed == 0.0 {
            return false;
        }
        let forward = speed > 0.0;

        for j in 0..self.trains.len() {
            if j == i {
                continue;
            }
            let (train, other) = (&self.trains[i], &self.trains[j]);
            // (gap, other ends touching our front, other faces the same way)
            let contacts = if forward {
                [
                    (train.front.overlap_distance_m(&other.rear, false), true),
                    (train.front.overlap_distance_m(&other.front, false), false),
                ]
            } else {
                [
                    (train.rear.overlap_distance_m(&other.front, true), true),
                    (train.rear.overlap_distance_m(&other.rear, true), false),
                ]
            };
            let touching = contacts.iter().find(|(gap, _)| *gap < 0.0).copied();
            let uncoupled_pair = train.uncoupled_from == Some(other.number) || other.uncoupled_from == Some(train.number);
            if uncoupled_pair {
                if let Some((gap, same_way)) = touching {
                    self.hold_at_contact(i, j, gap, forward, same_way);
                    return false;
                }
                if end_gaps(train, other).iter().all(|gap| *gap > UNCOUPLE_SEPARATION_M) {
                    let other_number = other.number;
                    self.trains[i].uncoupled_from = None;
                    if self.trains[j].uncoupled_from == Some(id) {
                        self.trains[j].uncoupled_from = None;
                    }
                    debug!("Trains {} and {} separated", id, other_number);
                }
                continue;
            }
            if let Some((_, same_way)) = touching {
                self.couple(i, j, forward, same_way);
                return true;
            }
        }
        false
    }

    /// Backs train `i` out of the `gap` it overlaps train `j` by. When it was
    /// closing on `j`, it pushes `j` along at the shared speed.
    fn hold_at_contact(&mut self, i: usize, j: usize, gap: f32, forward: bool, same_way: bool) {
        let (train, other) = pair_mut(&mut self.trains, i, j);
        let mult = if same_way { 1.0 } else { -1.0 };
        let closing = if forward {
            train.speed_mps > other.speed_mps * mult
        } else {
            train.speed_mps < other.speed_mps * mult
        };
        if closing {
            train.set_couple_speed(other, mult);
        }
        train.move_by(if forward { gap } else { -gap });
    }

    /// Merges train `j` into train `i`. `ahead` is true when `j` is in front
    /// of `i`'s direction of travel.
    fn couple(&mut self, i: usize, j: usize, ahead: bool, same_way: bool) {
        let mut absorbed = self.trains[j].clone();
        let survivor = &mut self.trains[i];
        let mult = if same_way { 1.0 } else { -1.0 };

        let relative_speed = (survivor.speed_mps - absorbed.speed_mps * mult).abs();
        let over_speed = relative_speed > OVERSPEED_COUPLING_MPS;
        survivor.set_couple_speed(&mut absorbed, mult);

        let mut incoming = std::mem::take(&mut absorbed.cars);
        if !same_way {
            incoming.reverse();
            for car in incoming.iter_mut() {
                car.flipped = !car.flipped;
            }
        }
        if ahead {
            let added = incoming.len();
            survivor.front = if same_way {
                absorbed.front.clone()
            } else {
                absorbed.rear.reversed()
            };
            incoming.append(&mut survivor.cars);
            survivor.cars = incoming;
            survivor.lead_locomotive_index = survivor.lead_locomotive_index.map(|l| l + added);
        } else {
            survivor.rear = if same_way {
                absorbed.rear.clone()
            } else {
                absorbed.front.reversed()
            };
            survivor.cars.append(&mut incoming);
        }
        if survivor.lead_locomotive_index.is_none() {
            survivor.lead_locomotive_index = survivor.cars.iter().position(|c| c.is_locomotive);
        }
        survivor.uncoupled_from = None;
        survivor.calculate_position_of_cars();

        let survivor_id = survivor.number;
        let absorbed_id = absorbed.number;
        if self.player == Some(absorbed_id) {
            self.player = Some(survivor_id);
            self.trains[i].train_type = absorbed.train_type;
            self.trains[i].control_mode = absorbed.control_mode;
        }
        self.trains.remove(j);
        self.forget_train(absorbed_id);

        if over_speed {
            self.over_speed_couplings += 1;
            warn!("Train {} coupled at {:.1} m/s", survivor_id, relative_speed);
        }
        info!("Train {} coupled with train {}", survivor_id, absorbed_id);
        self.events.push(SimEvent::Coupled {
            survivor: survivor_id,
            absorbed: absorbed_id,
            over_speed,
        });
    }

    fn forget_train(&mut self, id: TrainId) {
        self.level_crossings.forget_train(id);
        for table in self.moving_tables.iter_mut() {
            table.forget_train(id);
        }
        if self.ai.contains(id) {
            self.ai.trains_to_remove.push(id);
        }
    }

    /// Splits train `id` behind car `car_index`. With `keep_front` the
    /// original number stays with the front part; the other part becomes a
    /// static train.
    pub fn uncouple_behind(&mut self, id: TrainId, car_index: usize, keep_front: bool) -> Result<TrainId> {
        let index = self
            .train_index(id)
            .with_context(|| format!("Train {} to uncouple not found", id))?;
        let count = self.trains[index].cars.len();
        if car_index + 1 >= count {
            bail!("Train {} has no car behind car {}", id, car_index);
        }
        let detached_number = self.next_number();
        let train = &mut self.trains[index];
        let rear_cars = train.cars.split_off(car_index + 1);
        let front_cars = std::mem::take(&mut train.cars);
        let front_length: f32 = front_cars.iter().map(|c| c.length_m).sum();

        let mut split_point = train.front.clone();
        split_point.move_by(-front_length);

        let (kept, detached_cars, detached_front) = if keep_front {
            (front_cars, rear_cars, split_point)
        } else {
            let front = train.front.clone();
            train.front = split_point;
            (rear_cars, front_cars, front)
        };
        train.cars = kept;
        train.lead_locomotive_index = train.cars.iter().position(|c| c.is_locomotive);
        train.reposition_rear_traveller();
        train.uncoupled_from = Some(detached_number);

        let mut detached = Train::new(
            detached_number,
            &format!("{} ({})", train.name, detached_number.0),
            TrainType::Static,
            detached_front,
            detached_cars,
        );
        detached.uncoupled_from = Some(id);
        info!(
            "Train {} uncoupled; {} cars left as static train {}",
            id,
            detached.cars.len(),
            detached_number
        );
        self.trains.push(detached);
        self.events.push(SimEvent::Uncoupled {
            train: id,
            detached: detached_number,
        });
        Ok(detached_number)
    }

    /// Asks a waiting train to restart after `delay_s`.
    pub fn restart_waiting_train(&mut self, name: &str, delay_s: f32) {
        match self.trains.iter_mut().find(|t| t.name.eq_ignore_ascii_case(name)) {
            Some(train) => {
                train.restart_delay_s = Some(delay_s);
                if train.train_type.is_ai() {
                    self.ai.add(train.number);
                }
                info!("Train {} will restart in {:.0}s", train.name, delay_s);
            }
            None => {
                let message = self.ctx.get_stringf("Train {0} to restart not found", &[&name]);
                warn!("{}", message);
                self.confirmer.warning(&message);
            }
        }
    }

    /// Stages a change of player train. Returns false when refused.
    pub fn start_player_switch(&mut self, target: TrainId, mode: SwitchMode) -> bool {
        if self.train_index(target).is_none() {
            warn!("Train {} to switch to not found", target);
            return false;
        }
        if let Some(current) = self.player_train() {
            let refusal = if self.settings.timetable_mode && current.control_mode == ControlMode::Manual {
                Some("Train can't be switched if in manual mode")
            } else if mode == SwitchMode::Suspend && !current.is_stopped() {
                Some("Train can't be suspended with speed not equal 0")
            } else if mode == SwitchMode::ReturnToStatic && !current.is_stopped() {
                Some("To return to static train speed must be = 0")
            } else {
                None
            };
            if let Some(text) = refusal {
                let message = self.ctx.get_string(text);
                self.confirmer.warning(&message);
                return false;
            }
        }
        self.pending_switch = Some(PendingSwitch { target, mode });
        true
    }

    /// Finishes a staged switch once the new locomotive is loaded. Returns
    /// false while still waiting.
    fn complete_player_switch(&mut self) -> bool {
        let Some(pending) = self.pending_switch else {
            return true;
        };
        let Some(target) = self.train_index(pending.target) else {
            warn!("Train {} vanished before the player switch completed", pending.target);
            self.pending_switch = None;
            return true;
        };
        if !(self.loco_loaded)(&self.trains[target]) {
            return false;
        }
        self.pending_switch = None;

        let previous = self.player;
        if let Some(old) = previous.and_then(|id| self.train_index(id)) {
            let old_train = &mut self.trains[old];
            match pending.mode {
                SwitchMode::Keep => {
                    old_train.train_type = TrainType::Ai;
                    old_train.control_mode = ControlMode::AutoSignal;
                    let number = old_train.number;
                    self.ai.add(number);
                }
                SwitchMode::Suspend => {
                    old_train.train_type = TrainType::AiNotStarted;
                    old_train.control_mode = ControlMode::Inactive;
                }
                SwitchMode::ReturnToStatic => {
                    old_train.train_type = TrainType::Static;
                    old_train.control_mode = ControlMode::Undefined;
                    old_train.speed_mps = 0.0;
                }
            }
        }

        let new_train = &mut self.trains[target];
        new_train.train_type = if new_train.train_type.is_ai() {
            TrainType::AiPlayerDriven
        } else {
            TrainType::Player
        };
        new_train.control_mode = ControlMode::Manual;
        let to = new_train.number;
        if self.ai.contains(to) {
            self.ai.trains_to_remove.push(to);
            self.ai.remove_pending();
        }
        self.player = Some(to);
        info!("Player switched to train {}", to);
        self.events.push(SimEvent::PlayerChanged { from: previous, to });
        true
    }

    /// Starts the given table moving and makes it the active one.
    pub fn start_moving_table(&mut self, index: usize, positive: bool) -> Result<()> {
        let table = self
            .moving_tables
            .get_mut(index)
            .with_context(|| format!("No moving table {}", index))?;
        table.start_continuous(positive, &mut self.trains, &mut self.confirmer, &self.ctx);
        self.active_moving_table = Some(index);
        Ok(())
    }

    /// Stops continuous motion; the table carries on to the nearest end.
    pub fn release_moving_table(&mut self, index: usize, positive: bool) -> Result<()> {
        let table = self
            .moving_tables
            .get_mut(index)
            .with_context(|| format!("No moving table {}", index))?;
        table.compute_target(positive);
        Ok(())
    }

    pub fn save(&self, sink: &mut dyn Write) -> Result<()> {
        let mut out = SaveWriter::new(sink);
        out.write_header()?;
        out.write_f64(self.clock_time_s)?;
        out.write_i32(self.season.code())?;
        out.write_i32(self.weather.code())?;
        out.write_bool(self.settings.timetable_mode)?;
        out.write_string(&self.user_weather_file)?;

        self.signals.save(&mut out).context("Saving signals")?;

        out.write_i32(self.trains.len() as i32)?;
        for train in &self.trains {
            train.save(&mut out)?;
        }
        out.write_i32(self.player.map_or(-1, |p| p.0 as i32))?;
        self.ai.save(&mut out)?;

        out.write_index(self.active_moving_table)?;
        for table in &self.moving_tables {
            table.save(&mut out)?;
        }

        match &self.activity {
            Some(activity) => {
                out.write_i32(1)?;
                activity.save(&mut out)?;
            }
            None => out.write_i32(-1)?,
        }
        self.containers.save(&mut out)?;
        debug!("Saved {} trains at clock {:.0}", self.trains.len(), self.clock_time_s);
        Ok(())
    }

    /// Restores a save over a simulator built from the same route and
    /// activity.
    pub fn restore(&mut self, source: &mut dyn Read) -> Result<()> {
        let mut input = SaveReader::new(source);
        input.read_header()?;
        self.clock_time_s = input.read_f64()?;
        self.season = Season::from_code(input.read_i32()?);
        self.weather = Weather::from_code(input.read_i32()?);
        self.settings.timetable_mode = input.read_bool()?;
        self.user_weather_file = input.read_string()?;

        self.signals.restore(&mut input).context("Restoring signals")?;

        let count = input.read_i32()?;
        let mut trains = Vec::with_capacity(count.max(0) as usize);
        for i in 0..count {
            trains.push(Train::restore(&self.db, &mut input).with_context(|| format!("Restoring train {}", i))?);
        }
        let player = input.read_i32()?;
        self.player = (player >= 0).then_some(TrainId(player as u32));
        self.next_train_number = trains.iter().map(|t| t.number.0 + 1).max().unwrap_or(0);
        for old in std::mem::replace(&mut self.trains, trains) {
            self.level_crossings.forget_train(old.number);
        }
        self.ai = AiManager::restore(&mut input)?;

        self.active_moving_table = input.read_index()?;
        for table in self.moving_tables.iter_mut() {
            table.restore(&mut input)?;
            table.relink(&self.trains);
        }

        match input.read_i32()? {
            -1 => self.activity = None,
            _ => {
                let activity = self
                    .activity
                    .as_mut()
                    .context("Save holds an activity but none is loaded")?;
                activity.restore(&self.db, &mut input).context("Restoring activity")?;
            }
        }
        self.containers.restore(&mut input).context("Restoring containers")?;

        self.signals.restore_trains(&self.trains);
        self.pending_switch = None;
        info!("Restored {} trains at clock {:.0}", self.trains.len(), self.clock_time_s);
        Ok(())
    }
}

/// Loads pin links into an undirected graph and logs its connectivity.
/// Returns the number of connected components.
fn log_network_components(db: &TrackDb) -> usize {
    let mut graph = UnGraph::<usize, ()>::new_undirected();
    let mut index: HashMap<usize, NodeIndex> = HashMap::new();
    for node in db.nodes.iter().flatten() {
        index.insert(node.index, graph.add_node(node.index));
    }
    for node in db.nodes.iter().flatten() {
        for pin in &node.pins {
            if let (Some(a), Some(b)) = (index.get(&node.index), index.get(&pin.link)) {
                if node.index < pin.link && graph.find_edge(*a, *b).is_none() {
                    graph.add_edge(*a, *b, ());
                }
            }
        }
    }

    let components = connected_components(&graph);
    let islands = kosaraju_scc(&graph)
        .into_iter()
        .filter(|c| {
            c.iter()
                .any(|n| matches!(db.node(graph[*n]).map(|t| &t.kind), Some(TrackNodeKind::Vector(_))))
        })
        .count();
    info!("Track network: {} nodes in {} components", graph.node_count(), components);
    if islands > 1 {
        warn!("Track network has {} unconnected islands of track", islands);
    }
    components
}

/// Gaps between every end of `train` and every end of `other`, as seen from
/// the end of `train` facing outward.
fn end_gaps(train: &Train, other: &Train) -> [f32; 4] {
    [
        train.front.overlap_distance_m(&other.rear, false),
        train.front.overlap_distance_m(&other.front, false),
        train.rear.overlap_distance_m(&other.front, true),
        train.rear.overlap_distance_m(&other.rear, true),
    ]
}

fn pair_mut(trains: &mut [Train], i: usize, j: usize) -> (&mut Train, &mut Train) {
    if i < j {
        let (head, tail) = trains.split_at_mut(j);
        (&mut head[i], &mut tail[0])
    } else {
        let (head, tail) = trains.split_at_mut(i);
        (&mut tail[0], &mut head[j])
    }
}
