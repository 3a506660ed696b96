//! Activity engine
//!
//! An activity is a scenario: an ordered list of passenger stops the player
//! has to make, plus scripted events that fire on train actions, locations
//! or elapsed time. Event outcomes can re-arm other events, end the activity
//! or restart a waiting AI train.
//!
//! Tasks and events only read the world. Anything that has to change it,
//! such as restarting a train, is handed back to the caller as an
//! [`ActivityRequest`].

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::context::SimContext;
use super::save::{SaveReader, SaveWriter};
use super::signals::SignalSystem;
use super::track_db::{TrackDb, TrackItemKind};
use super::train::{Train, TrainCar, TrainType};
use super::traveller::Traveller;
use super::types::{TrItemId, TrainId, WorldLocation, MAX_STOPPED_MPS};

/// .NET `DateTime` ticks per second, used by the save layout.
pub const TICKS_PER_SECOND: i64 = 10_000_000;
/// Player trains count as stopped below this speed.
pub const PLAYER_STOPPED_MPS: f32 = 0.2;
/// Location events flagged trigger-on-stop fire only below this speed.
pub const TRIGGER_ON_STOP_MPS: f32 = 0.032;
/// Search limit when locating platform and siding ends from a train.
pub const MAX_PLATFORM_OR_STATION_SIZE_M: f32 = 10_000.0;
/// A train this far past a platform has missed the stop.
pub const MISSED_PLATFORM_MARGIN_M: f32 = 200.0;
/// A signal at stop closer than this keeps a boarded train waiting.
pub const SIGNAL_HOLD_DISTANCE_M: f32 = 300.0;
/// Missed-station polling period while the train has not arrived.
pub const MISSED_STATION_POLL_S: f64 = 10.0;
/// Trains moving faster than this cannot pick up wagons.
const PICKUP_MAX_SPEED_MPS: f32 = 1.0;

fn to_ticks(seconds: f64) -> i64 {
    (seconds * TICKS_PER_SECOND as f64).round() as i64
}

fn from_ticks(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

/// `HH:mm:ss` of a clock time in seconds since midnight.
pub fn clock_string(seconds: f64) -> String {
    let s = seconds.max(0.0) as i64 % 86_400;
    format!("{:02}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
}

fn duration_string(seconds: f64) -> String {
    let s = seconds.abs().round() as i64;
    let text = format!("{:02}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60);
    if seconds < 0.0 {
        format!("-{}", text)
    } else {
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEventType {
    Timer,
    TrainStart,
    TrainStop,
    Couple,
    Uncouple,
}

/// Where a point lies relative to a traveller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceResult {
    Valid,
    Behind,
    OffPath,
}

/// Locates `target` ahead of `traveller`, then behind it. The distance is
/// returned alongside; it is meaningless for `OffPath`.
pub fn calculate_to_point(traveller: &Traveller, target: &WorldLocation) -> (DistanceResult, f32) {
    let ahead = traveller.distance_to_within(target, MAX_PLATFORM_OR_STATION_SIZE_M);
    if ahead > 0.0 {
        return (DistanceResult::Valid, ahead);
    }
    let behind = traveller
        .reversed()
        .distance_to_within(target, MAX_PLATFORM_OR_STATION_SIZE_M);
    if behind > 0.0 {
        return (DistanceResult::Behind, behind);
    }
    (DistanceResult::OffPath, -1.0)
}

/// True when one of the train's ends lies between `end1` and `end2`.
pub fn between_ends(front: &Traveller, rear: &Traveller, end1: &WorldLocation, end2: &WorldLocation) -> bool {
    [front, rear].into_iter().any(|t| {
        let (d1, _) = calculate_to_point(t, end1);
        let (d2, _) = calculate_to_point(t, end2);
        matches!(
            (d1, d2),
            (DistanceResult::Behind, DistanceResult::Valid) | (DistanceResult::Valid, DistanceResult::Behind)
        )
    })
}

/// Colour hint for the boarding countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskColor {
    #[default]
    White,
    Yellow,
    LightGreen,
}

/// One stop of the player's service, as read from the activity file.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStop {
    pub platform_start_id: TrItemId,
    pub arrival_s: f64,
    pub depart_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformEnd {
    pub id: TrItemId,
    pub station: String,
    pub min_waiting_s: f32,
    pub location: WorldLocation,
}

impl PlatformEnd {
    fn lookup(db: &TrackDb, id: TrItemId) -> Option<(Self, TrItemId)> {
        let item = db.item(id)?;
        match &item.kind {
            TrackItemKind::Platform {
                station,
                min_waiting_s,
                linked,
            } => Some((
                Self {
                    id,
                    station: station.clone(),
                    min_waiting_s: *min_waiting_s,
                    location: item.location,
                },
                *linked,
            )),
            _ => None,
        }
    }
}

/// Boarding time at a stop. `planned` is the scheduled dwell, `punctual`
/// the time left until scheduled departure on arrival.
///
/// A late train on a tight schedule (planned dwell below the platform
/// minimum) dwells as planned and stays late. Otherwise a late train gets at
/// least the platform minimum.
pub fn boarding_time_s(planned_s: f64, punctual_s: f64, platform_min_s: f64) -> f64 {
    if punctual_s >= planned_s {
        return punctual_s;
    }
    let tight_schedule = planned_s > 0.0 && planned_s < platform_min_s;
    if tight_schedule {
        planned_s
    } else {
        punctual_s.max(platform_min_s)
    }
}

/// A stop at a platform pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PassengerStopAt {
    pub sch_arrive_s: f64,
    pub sch_depart_s: f64,
    pub act_arrive_s: Option<f64>,
    pub act_depart_s: Option<f64>,
    pub platform_end1: PlatformEnd,
    pub platform_end2: PlatformEnd,
    pub boarding_s: f64,
    pub boarding_end_s: f64,
    timer_chk: i32,
    pub arrived: bool,
    pub may_depart: bool,
    pub distance_to_next_signal_m: f32,
    pub departed_before_boarding: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    PassengerStopAt(PassengerStopAt),
}

impl TaskKind {
    fn tag(&self) -> i32 {
        match self {
            TaskKind::PassengerStopAt(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityTask {
    /// `None` while pending; `Some(false)` for a failed task.
    pub is_completed: Option<bool>,
    pub completed_at_s: f64,
    pub display_message: String,
    pub display_color: TaskColor,
    pub kind: TaskKind,
}

/// What a task needs to know about the world this tick.
pub struct ActivityEnv<'a> {
    pub clock_time_s: f64,
    pub game_time_s: f64,
    pub timetable_mode: bool,
    pub trains: &'a [Train],
    pub player: Option<TrainId>,
    pub signals: &'a dyn SignalSystem,
    pub ctx: &'a SimContext,
}

impl ActivityEnv<'_> {
    pub fn player_train(&self) -> Option<&Train> {
        self.player
            .and_then(|id| self.trains.iter().find(|t| t.number == id))
    }

    fn train(&self, id: TrainId) -> Option<&Train> {
        self.trains.iter().find(|t| t.number == id)
    }
}

/// Something the activity wants the simulator to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityRequest {
    RestartWaitingTrain { name: String, delay_s: f32 },
    PermissionToDepart,
}

struct StationLog<'a> {
    path: Option<&'a Path>,
}

impl StationLog<'_> {
    fn append(&self, fields: &[&str]) {
        let Some(path) = self.path else {
            return;
        };
        let line = format!("{}\n", fields.join(","));
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            warn!("Cannot write station log {}: {}", path.display(), e);
        }
    }
}

impl ActivityTask {
    pub fn passenger_stop(sch_arrive_s: f64, sch_depart_s: f64, end1: PlatformEnd, end2: PlatformEnd) -> Self {
        Self {
            is_completed: None,
            completed_at_s: 0.0,
            display_message: String::new(),
            display_color: TaskColor::White,
            kind: TaskKind::PassengerStopAt(PassengerStopAt {
                sch_arrive_s,
                sch_depart_s,
                act_arrive_s: None,
                act_depart_s: None,
                platform_end1: end1,
                platform_end2: end2,
                boarding_s: 0.0,
                boarding_end_s: 0.0,
                timer_chk: 0,
                arrived: false,
                may_depart: false,
                distance_to_next_signal_m: -1.0,
                departed_before_boarding: false,
            }),
        }
    }

    pub fn passenger_stop_state(&self) -> &PassengerStopAt {
        match &self.kind {
            TaskKind::PassengerStopAt(stop) => stop,
        }
    }

    fn notify_event(
        &mut self,
        event: ActivityEventType,
        is_last: bool,
        env: &ActivityEnv,
        log: &StationLog,
        requests: &mut Vec<ActivityRequest>,
    ) {
        let Some(train) = env.player_train() else {
            return;
        };
        let now = env.clock_time_s;
        let TaskKind::PassengerStopAt(stop) = &mut self.kind;

        match event {
            ActivityEventType::TrainStop => {
                if !stop.is_at_station(train) {
                    return;
                }
                let act_arrive = *stop.act_arrive_s.get_or_insert(now);
                stop.arrived = true;
                let planned = stop.sch_depart_s - stop.sch_arrive_s;
                let punctual = stop.sch_depart_s - act_arrive;
                stop.boarding_s = boarding_time_s(planned, punctual, stop.platform_end1.min_waiting_s as f64);
                stop.boarding_end_s = now + stop.boarding_s - (now - act_arrive);
                stop.departed_before_boarding = false;
                stop.distance_to_next_signal_m = env.signals.next_signal(train).map_or(-1.0, |s| s.distance_m);
                debug!(
                    "Arrived at {} at {}, boarding {:.0}s",
                    stop.platform_end1.station,
                    clock_string(act_arrive),
                    stop.boarding_s
                );
            }
            ActivityEventType::TrainStart => {
                if !stop.arrived {
                    return;
                }
                stop.act_depart_s = Some(now);
                self.completed_at_s = now;
                self.is_completed = Some(stop.may_depart);
                if !stop.may_depart && !stop.departed_before_boarding {
                    stop.departed_before_boarding = true;
                    warn!("Train left {} before boarding completed", stop.platform_end1.station);
                }
                let delay = stop.act_depart_s.map_or(0.0, |d| d - stop.sch_depart_s);
                log.append(&[
                    &stop.platform_end1.station,
                    &clock_string(stop.sch_arrive_s),
                    &clock_string(stop.sch_depart_s),
                    &stop.act_arrive_s.map_or("-".to_string(), clock_string),
                    &stop.act_depart_s.map_or("-".to_string(), clock_string),
                    &duration_string(delay),
                    if stop.may_depart { "Completed" } else { "NotCompleted" },
                ]);
            }
            ActivityEventType::Timer => {
                if stop.arrived {
                    let remaining = (stop.boarding_end_s - now).ceil() as i64;
                    self.display_color = if remaining < 1 {
                        TaskColor::LightGreen
                    } else if remaining < 11 {
                        TaskColor::Yellow
                    } else {
                        TaskColor::White
                    };
                    if remaining > 0 {
                        self.display_message = env.ctx.get_stringf(
                            "Passenger boarding completes in {0:D2}:{1:D2}",
                            &[&(remaining / 60), &(remaining % 60)],
                        );
                    } else if !stop.may_depart {
                        let held = env.signals.next_signal(train).map_or(false, |s| s.holds_train());
                        let near = stop.distance_to_next_signal_m >= 0.0
                            && stop.distance_to_next_signal_m < SIGNAL_HOLD_DISTANCE_M;
                        if near && held {
                            self.display_message = env
                                .ctx
                                .get_string("Passenger boarding completed. Waiting for signal ahead to clear.");
                        } else {
                            stop.may_depart = true;
                            self.display_message =
                                env.ctx.get_string("Passenger boarding completed. You may depart now.");
                            requests.push(ActivityRequest::PermissionToDepart);
                        }
                        if is_last {
                            let delay = stop.act_arrive_s.map_or(0.0, |a| a - stop.sch_arrive_s);
                            log.append(&[
                                &stop.platform_end1.station,
                                &clock_string(stop.sch_arrive_s),
                                "-",
                                &stop.act_arrive_s.map_or("-".to_string(), clock_string),
                                "-",
                                &duration_string(delay),
                                "Final stop",
                            ]);
                            self.is_completed = Some(true);
                        }
                    }
                } else {
                    let slot = (now / MISSED_STATION_POLL_S) as i32;
                    if slot != stop.timer_chk {
                        stop.timer_chk = slot;
                        if stop.is_missed_station(train) {
                            warn!("Train {} missed the stop at {}", train.number, stop.platform_end1.station);
                            self.is_completed = Some(false);
                            log.append(&[
                                &stop.platform_end1.station,
                                &clock_string(stop.sch_arrive_s),
                                &clock_string(stop.sch_depart_s),
                                "-",
                                "-",
                                "-",
                                "Missed",
                            ]);
                        }
                    }
                }
            }
            ActivityEventType::Couple | ActivityEventType::Uncouple => {}
        }
    }

    fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i32(self.kind.tag())?;
        out.write_i32(match self.is_completed {
            None => -1,
            Some(false) => 0,
            Some(true) => 1,
        })?;
        out.write_i64(to_ticks(self.completed_at_s))?;
        out.write_string(&self.display_message)?;
        let TaskKind::PassengerStopAt(stop) = &self.kind;
        out.write_i64(to_ticks(stop.sch_arrive_s))?;
        out.write_i64(to_ticks(stop.sch_depart_s))?;
        out.write_i64(stop.act_arrive_s.map_or(-1, to_ticks))?;
        out.write_i64(stop.act_depart_s.map_or(-1, to_ticks))?;
        out.write_i32(stop.platform_end1.id.0 as i32)?;
        out.write_i32(stop.platform_end2.id.0 as i32)?;
        out.write_f64(stop.boarding_end_s)?;
        out.write_f64(stop.boarding_s)?;
        out.write_i32(stop.timer_chk)?;
        out.write_bool(stop.arrived)?;
        out.write_bool(stop.may_depart)?;
        out.write_f32(stop.distance_to_next_signal_m)
    }

    fn restore<R: Read>(db: &TrackDb, input: &mut SaveReader<R>) -> Result<Self> {
        let tag = input.read_i32()?;
        if tag != 1 {
            bail!("Unknown activity task tag {}", tag);
        }
        let is_completed = match input.read_i32()? {
            -1 => None,
            0 => Some(false),
            _ => Some(true),
        };
        let completed_at_s = from_ticks(input.read_i64()?);
        let display_message = input.read_string()?;
        let sch_arrive_s = from_ticks(input.read_i64()?);
        let sch_depart_s = from_ticks(input.read_i64()?);
        let act_arrive = input.read_i64()?;
        let act_depart = input.read_i64()?;
        let platform = |id: i32| {
            PlatformEnd::lookup(db, TrItemId(id.max(0) as usize))
                .map(|(end, _)| end)
                .with_context(|| format!("Platform {} of a saved stop is not in the track database", id))
        };
        let end1 = platform(input.read_i32()?)?;
        let end2 = platform(input.read_i32()?)?;
        let mut task = Self::passenger_stop(sch_arrive_s, sch_depart_s, end1, end2);
        task.is_completed = is_completed;
        task.completed_at_s = completed_at_s;
        task.display_message = display_message;
        let TaskKind::PassengerStopAt(stop) = &mut task.kind;
        stop.act_arrive_s = (act_arrive != -1).then(|| from_ticks(act_arrive));
        stop.act_depart_s = (act_depart != -1).then(|| from_ticks(act_depart));
        stop.boarding_end_s = input.read_f64()?;
        stop.boarding_s = input.read_f64()?;
        stop.timer_chk = input.read_i32()?;
        stop.arrived = input.read_bool()?;
        stop.may_depart = input.read_bool()?;
        stop.distance_to_next_signal_m = input.read_f32()?;
        Ok(task)
    }
}

impl PassengerStopAt {
    /// Stopped with one end of the train between the platform ends.
    pub fn is_at_station(&self, train: &Train) -> bool {
        between_ends(
            &train.front,
            &train.rear,
            &self.platform_end1.location,
            &self.platform_end2.location,
        )
    }

    /// Both platform ends are behind the train, the nearer one by more than
    /// [`MISSED_PLATFORM_MARGIN_M`].
    pub fn is_missed_station(&self, train: &Train) -> bool {
        let (r1, d1) = calculate_to_point(&train.rear, &self.platform_end1.location);
        let (r2, d2) = calculate_to_point(&train.rear, &self.platform_end2.location);
        r1 == DistanceResult::Behind && r2 == DistanceResult::Behind && d1.min(d2) > MISSED_PLATFORM_MARGIN_M
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    AllStops,
    AssembleTrain,
    AssembleTrainAtLocation,
    DropOffWagonsAtLocation,
    PickUpPassengers,
    PickUpWagons,
    ReachSpeed,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcomes {
    pub activate: Vec<u32>,
    pub restore_activation: Vec<u32>,
    pub increment_activation: Vec<u32>,
    pub decrement_activation: Vec<u32>,
    pub activity_success: bool,
    pub activity_fail: Option<String>,
    pub restart_waiting_train: Option<(String, f32)>,
    pub display_message: String,
}

/// The parsed payload of each event category.
#[derive(Debug, Clone, PartialEq)]
pub enum EventCategory {
    Action {
        action: ActionKind,
        siding: Option<TrItemId>,
        /// Wagon UIDs from the work order.
        wagons: Vec<u32>,
        speed_mps: f32,
    },
    Location {
        location: WorldLocation,
        radius_m: f32,
        trigger_on_stop: bool,
    },
    Time {
        seconds: i32,
    },
}

/// An event as read from the activity file.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDef {
    pub id: u32,
    pub name: String,
    pub activation_level: i32,
    pub reversible: bool,
    /// Service name a location event is bound to; empty for the player.
    pub train_service: String,
    pub train_starting_time: Option<i32>,
    pub outcomes: Outcomes,
    pub category: EventCategory,
}

/// Runtime state of one activity event.
#[derive(Debug, Clone)]
pub struct EventWrapper {
    pub def: EventDef,
    pub activation_level: i32,
    pub original_activation_level: i32,
    pub times_triggered: i32,
    pub is_disabled: bool,
    pub train: Option<TrainId>,
    siding_ends: Option<(WorldLocation, WorldLocation)>,
    wagon_ids: Vec<String>,
}

impl EventWrapper {
    pub fn new(def: EventDef, db: &TrackDb) -> Self {
        let mut siding_ends = None;
        let mut wagon_ids = Vec::new();
        if let EventCategory::Action { siding, wagons, .. } = &def.category {
            if let Some(id) = siding {
                siding_ends = Self::siding_ends(db, *id);
            }
            wagon_ids = wagons.iter().map(|uid| TrainCar::wagon_id(*uid)).collect();
        }
        Self {
            activation_level: def.activation_level,
            original_activation_level: def.activation_level,
            def,
            times_triggered: 0,
            is_disabled: false,
            train: None,
            siding_ends,
            wagon_ids,
        }
    }

    fn siding_ends(db: &TrackDb, id: TrItemId) -> Option<(WorldLocation, WorldLocation)> {
        let Some(first) = db.item(id) else {
            warn!("Siding {} is not in track database.", id.0);
            return None;
        };
        let TrackItemKind::Siding { linked } = &first.kind else {
            warn!("Item {} in track database is not a siding.", id.0);
            return None;
        };
        match db.item(*linked) {
            Some(second) if matches!(second.kind, TrackItemKind::Siding { .. }) => {
                Some((first.location, second.location))
            }
            Some(_) => {
                warn!("Item {} in track database is not a siding.", linked.0);
                None
            }
            None => {
                warn!("Siding {} is not in track database.", linked.0);
                None
            }
        }
    }

    /// A missing siding means "anywhere".
    fn at_siding(&self, train: &Train) -> bool {
        match &self.siding_ends {
            None => true,
            Some((a, b)) => between_ends(&train.front, &train.rear, a, b),
        }
    }

    fn triggered(&mut self, all_stops_done: bool, start_time_s: Option<i32>, env: &ActivityEnv) -> bool {
        match &self.def.category {
            EventCategory::Action { action, speed_mps, .. } => {
                let Some(player) = env.player_train() else {
                    return false;
                };
                match action {
                    ActionKind::AllStops => all_stops_done,
                    ActionKind::AssembleTrain => env.trains.iter().any(|t| t.matches_consist(&self.wagon_ids)),
                    ActionKind::AssembleTrainAtLocation => {
                        self.at_siding(player) && env.trains.iter().any(|t| t.matches_consist(&self.wagon_ids))
                    }
                    ActionKind::DropOffWagonsAtLocation => env
                        .trains
                        .iter()
                        .find(|t| t.includes_wagons(&self.wagon_ids))
                        .map_or(false, |t| t.train_type == TrainType::Static && self.at_siding(t)),
                    ActionKind::PickUpPassengers => false,
                    ActionKind::PickUpWagons => {
                        player.includes_wagons(&self.wagon_ids) && player.speed_mps.abs() <= PICKUP_MAX_SPEED_MPS
                    }
                    ActionKind::ReachSpeed => player.speed_mps.abs() >= *speed_mps,
                }
            }
            EventCategory::Location {
                location,
                radius_m,
                trigger_on_stop,
            } => {
                let mut train = env.player_train();
                if !self.def.train_service.is_empty() {
                    if let Some(bound) = self.train {
                        match env.train(bound) {
                            Some(t) => train = Some(t),
                            None => return false,
                        }
                    }
                }
                let Some(train) = train else {
                    return false;
                };
                self.train = Some(train.number);
                if *trigger_on_stop && train.speed_mps.abs() > TRIGGER_ON_STOP_MPS {
                    return false;
                }
                let mut target = *location;
                target.location.y = train.front.location().y;
                let mut ahead = train.front.clone();
                let mut distance = ahead.distance_to_within(&target, *radius_m);
                if distance == -1.0 {
                    ahead.reverse_direction();
                    distance = ahead.distance_to_within(&target, *radius_m);
                    if distance == -1.0 {
                        return false;
                    }
                }
                distance < *radius_m
            }
            EventCategory::Time { seconds } => {
                self.train = env.player;
                let started = start_time_s.unwrap_or(env.clock_time_s as i32);
                *seconds <= env.clock_time_s as i32 - started
            }
        }
    }

    fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i32(self.times_triggered)?;
        out.write_bool(self.is_disabled)?;
        out.write_i32(self.activation_level)
    }

    fn restore<R: Read>(&mut self, input: &mut SaveReader<R>) -> Result<()> {
        self.times_triggered = input.read_i32()?;
        self.is_disabled = input.read_bool()?;
        self.activation_level = input.read_i32()?;
        Ok(())
    }
}

/// Everything the activity file defines.
#[derive(Debug, Clone, Default)]
pub struct ActivityDef {
    /// Clock time the activity starts at, in seconds since midnight.
    pub start_time_s: f64,
    pub player_service: Vec<ServiceStop>,
    pub events: Vec<EventDef>,
}

#[derive(Debug, Clone)]
pub struct Activity {
    pub start_time_s: f64,
    pub tasks: Vec<ActivityTask>,
    pub current: Option<usize>,
    prev_train_speed: f64,
    pub events: Vec<EventWrapper>,
    pub is_complete: bool,
    pub is_successful: bool,
    /// Clock second the activity was first updated.
    pub start_time_clock_s: Option<i32>,
    /// Event waiting to be acknowledged by the activity window.
    pub triggered_event: Option<usize>,
    pub last_triggered_event: Option<usize>,
    pub is_activity_window_open: bool,
    pub reopen_activity_window: bool,
    pub is_activity_resumed: bool,
    pub msg_from_new_player: Option<String>,
    station_log: Option<PathBuf>,
    /// Stations the player left before boarding finished.
    pub departed_before_boarding: Vec<String>,
}

impl Activity {
    pub fn new(def: &ActivityDef, db: &TrackDb) -> Self {
        let mut tasks = Vec::new();
        for stop in &def.player_service {
            let Some((end1, linked)) = PlatformEnd::lookup(db, stop.platform_start_id) else {
                warn!("PlatformStartID {} is not present in TDB file", stop.platform_start_id.0);
                continue;
            };
            let Some((end2, _)) = PlatformEnd::lookup(db, linked) else {
                warn!("Platform {} has no linked platform item", stop.platform_start_id.0);
                continue;
            };
            tasks.push(ActivityTask::passenger_stop(stop.arrival_s, stop.depart_s, end1, end2));
        }
        let events = def
            .events
            .iter()
            .cloned()
            .map(|e| EventWrapper::new(e, db))
            .collect::<Vec<_>>();
        info!("Activity loaded with {} stops and {} events", tasks.len(), events.len());
        Self {
            start_time_s: def.start_time_s,
            current: (!tasks.is_empty()).then_some(0),
            tasks,
            prev_train_speed: -1.0,
            events,
            is_complete: false,
            is_successful: false,
            start_time_clock_s: None,
            triggered_event: None,
            last_triggered_event: None,
            is_activity_window_open: false,
            reopen_activity_window: false,
            is_activity_resumed: false,
            msg_from_new_player: None,
            station_log: None,
            departed_before_boarding: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&ActivityTask> {
        self.tasks.last()
    }

    pub fn current_task(&self) -> Option<&ActivityTask> {
        self.current.and_then(|i| self.tasks.get(i))
    }

    /// True once the last stop has a result, failed or not.
    pub fn is_finished(&self) -> bool {
        self.last().map_or(false, |t| t.is_completed.is_some())
    }

    pub fn event_by_id(&self, id: u32) -> Option<&EventWrapper> {
        self.events.iter().find(|e| e.def.id == id)
    }

    /// The activity window has shown the triggered event; evaluation resumes.
    pub fn acknowledge_triggered_event(&mut self) {
        self.triggered_event = None;
    }

    /// Binds service-specific location events to `train`.
    pub fn associate_events(&mut self, train: &Train, service_start_s: Option<i32>) {
        for event in self.events.iter_mut() {
            if !matches!(event.def.category, EventCategory::Location { .. }) || event.def.train_service.is_empty() {
                continue;
            }
            if !train.name.eq_ignore_ascii_case(&event.def.train_service) {
                continue;
            }
            if event.def.train_starting_time.is_none() || event.def.train_starting_time == service_start_s {
                event.train = Some(train.number);
            }
        }
    }

    pub fn start_station_logging(&mut self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Opening station log {}", path.display()))?;
        file.write_all(b"STATION,BOOKED ARR,BOOKED DEP,ACTUAL ARR,ACTUAL DEP,DELAY,STATE\n")?;
        self.station_log = Some(path.to_path_buf());
        Ok(())
    }

    pub fn update(&mut self, env: &ActivityEnv) -> Vec<ActivityRequest> {
        let mut requests = Vec::new();
        if self.start_time_clock_s.is_none() {
            self.start_time_clock_s = Some(env.clock_time_s as i32);
        }

        if !self.is_complete {
            self.update_events(env, &mut requests);
        }

        let Some(current) = self.current else {
            return requests;
        };
        self.notify_current(current, ActivityEventType::Timer, env, &mut requests);
        // Any result moves on, including a missed stop.
        self.advance_if_done();

        let Some(player) = env.player_train() else {
            return requests;
        };
        let speed = player.speed_mps.abs();
        let event = if player.train_type.is_player_driven() {
            if speed < PLAYER_STOPPED_MPS {
                (self.prev_train_speed.abs() >= PLAYER_STOPPED_MPS as f64).then(|| {
                    self.prev_train_speed = 0.0;
                    ActivityEventType::TrainStop
                })
            } else {
                (self.prev_train_speed.abs() < PLAYER_STOPPED_MPS as f64).then(|| {
                    self.prev_train_speed = player.speed_mps as f64;
                    ActivityEventType::TrainStart
                })
            }
        } else if speed <= MAX_STOPPED_MPS {
            (self.prev_train_speed != 0.0).then(|| {
                self.prev_train_speed = 0.0;
                ActivityEventType::TrainStop
            })
        } else {
            (self.prev_train_speed == 0.0 && speed > PLAYER_STOPPED_MPS).then(|| {
                self.prev_train_speed = player.speed_mps as f64;
                ActivityEventType::TrainStart
            })
        };
        if let (Some(event), Some(current)) = (event, self.current) {
            self.notify_current(current, event, env, &mut requests);
            self.advance_if_done();
        }
        requests
    }

    fn advance_if_done(&mut self) {
        if let Some(i) = self.current {
            if self.tasks[i].is_completed.is_some() {
                self.current = (i + 1 < self.tasks.len()).then_some(i + 1);
            }
        }
    }

    fn notify_current(
        &mut self,
        index: usize,
        event: ActivityEventType,
        env: &ActivityEnv,
        requests: &mut Vec<ActivityRequest>,
    ) {
        let is_last = index + 1 == self.tasks.len();
        let log = StationLog {
            path: self.station_log.as_deref(),
        };
        let task = &mut self.tasks[index];
        task.notify_event(event, is_last, env, &log, requests);
        let TaskKind::PassengerStopAt(stop) = &task.kind;
        if stop.departed_before_boarding && !self.departed_before_boarding.contains(&stop.platform_end1.station) {
            self.departed_before_boarding.push(stop.platform_end1.station.clone());
        }
    }

    fn update_events(&mut self, env: &ActivityEnv, requests: &mut Vec<ActivityRequest>) {
        let all_stops_done = self.is_finished();
        for i in 0..self.events.len() {
            if self.triggered_event.is_some() {
                break;
            }
            let event = &mut self.events[i];
            if event.activation_level <= 0 {
                continue;
            }
            if event.times_triggered >= 1 && !event.def.reversible {
                continue;
            }
            if event.triggered(all_stops_done, self.start_time_clock_s, env) {
                if !event.is_disabled {
                    event.times_triggered += 1;
                    debug!("Activity event {} ({}) triggered", event.def.id, event.def.name);
                    if self.fire_outcomes(i, requests) {
                        self.is_complete = true;
                        info!(
                            "Activity ended: {}",
                            if self.is_successful { "success" } else { "failure" }
                        );
                    }
                    self.triggered_event = Some(i);
                    self.last_triggered_event = Some(i);
                }
            } else if event.def.reversible {
                event.is_disabled = false;
            }
        }
    }

    /// Applies the outcomes of event `index`. Returns true if they end the
    /// activity.
    fn fire_outcomes(&mut self, index: usize, requests: &mut Vec<ActivityRequest>) -> bool {
        let event = &mut self.events[index];
        if event.def.reversible {
            event.is_disabled = true;
        } else {
            event.activation_level = 0;
        }
        if event.times_triggered > 1 {
            return false;
        }
        let outcomes = event.def.outcomes.clone();
        let mut adjust = |ids: &[u32], f: &dyn Fn(&mut EventWrapper)| {
            for id in ids {
                for e in self.events.iter_mut().filter(|e| e.def.id == *id) {
                    f(e);
                }
            }
        };
        adjust(&outcomes.activate, &|e| e.activation_level = 1);
        adjust(&outcomes.restore_activation, &|e| e.activation_level = e.original_activation_level);
        adjust(&outcomes.decrement_activation, &|e| e.activation_level -= 1);
        adjust(&outcomes.increment_activation, &|e| e.activation_level += 1);

        if outcomes.activity_fail.is_some() {
            self.is_successful = false;
            return true;
        }
        if outcomes.activity_success {
            self.is_successful = true;
            return true;
        }
        if let Some((name, delay_s)) = outcomes.restart_waiting_train {
            if !name.is_empty() {
                requests.push(ActivityRequest::RestartWaitingTrain { name, delay_s });
            }
        }
        false
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i64(to_ticks(self.start_time_s))?;
        out.write_i32(self.tasks.len() as i32)?;
        for task in &self.tasks {
            task.save(out)?;
        }
        out.write_index(self.current)?;
        out.write_f64(self.prev_train_speed)?;
        out.write_bool(self.is_complete)?;
        out.write_bool(self.is_successful)?;
        out.write_i32(self.start_time_clock_s.unwrap_or(0))?;
        for event in &self.events {
            event.save(out)?;
        }
        let marker = |out: &mut SaveWriter<W>, value: Option<usize>| -> Result<()> {
            out.write_bool(value.is_some())?;
            if let Some(i) = value {
                out.write_i32(i as i32)?;
            }
            Ok(())
        };
        marker(out, self.triggered_event)?;
        out.write_bool(self.is_activity_window_open)?;
        marker(out, self.last_triggered_event)?;
        out.write_bool(self.msg_from_new_player.is_some())?;
        if let Some(msg) = &self.msg_from_new_player {
            out.write_string(msg)?;
        }
        out.write_bool(self.is_activity_resumed)?;
        out.write_bool(self.station_log.is_some())?;
        if let Some(path) = &self.station_log {
            out.write_string(&path.to_string_lossy())?;
        }
        Ok(())
    }

    /// Restores runtime state over an activity freshly built from its
    /// definition, so event definitions are kept.
    pub fn restore<R: Read>(&mut self, db: &TrackDb, input: &mut SaveReader<R>) -> Result<()> {
        self.start_time_s = from_ticks(input.read_i64()?);
        let count = input.read_i32()?;
        self.tasks = (0..count.max(0))
            .map(|i| ActivityTask::restore(db, input).with_context(|| format!("Restoring activity task {}", i)))
            .collect::<Result<_>>()?;
        self.current = input.read_index()?.filter(|i| *i < self.tasks.len());
        self.prev_train_speed = input.read_f64()?;
        self.is_complete = input.read_bool()?;
        self.is_successful = input.read_bool()?;
        self.start_time_clock_s = Some(input.read_i32()?);
        for event in self.events.iter_mut() {
            event.restore(input)?;
        }
        let marker = |input: &mut SaveReader<R>| -> Result<Option<usize>> {
            Ok(if input.read_bool()? {
                Some(input.read_i32()?.max(0) as usize)
            } else {
                None
            })
        };
        self.triggered_event = marker(input)?;
        self.is_activity_window_open = input.read_bool()?;
        self.last_triggered_event = marker(input)?;
        self.msg_from_new_player = if input.read_bool()? {
            Some(input.read_string()?)
        } else {
            None
        };
        self.is_activity_resumed = input.read_bool()?;
        self.reopen_activity_window = self.is_activity_window_open;
        self.station_log = if input.read_bool()? {
            Some(PathBuf::from(input.read_string()?))
        } else {
            None
        };
        Ok(())
    }
}
