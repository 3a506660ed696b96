//! Hazards
//!
//! Animals and people standing near the track. Each one idles, turns to
//! look at an approaching train and bolts when a moving train gets close.

use log::debug;
use std::collections::BTreeMap;

use super::context::SimContext;
use super::track_db::{TrItemType, TrackDb, TrackItemKind};
use super::train::Train;
use super::types::{right_of, TrItemId, WorldLocation, MAX_STOPPED_MPS};

/// A moving train this close scares the hazard.
pub const SCARE_DISTANCE_M: f32 = 20.0;
/// A train this close catches the hazard's attention.
pub const LOOK_DISTANCE_M: f32 = 100.0;
/// How long a scared hazard keeps running.
pub const SCARED_TIME_S: f32 = 5.0;
pub const IDLE_VARIANTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardState {
    Idle,
    LookLeft,
    LookRight,
    Scared,
}

#[derive(Debug, Clone)]
pub struct Hazard {
    pub id: TrItemId,
    pub file_name: String,
    pub location: WorldLocation,
    pub state: HazardState,
    /// Animation picked while idle.
    pub idle_variant: usize,
    timer_s: f32,
}

impl Hazard {
    pub fn new(id: TrItemId, file_name: &str, location: WorldLocation) -> Self {
        Self {
            id,
            file_name: file_name.to_string(),
            location,
            state: HazardState::Idle,
            idle_variant: 0,
            timer_s: 0.0,
        }
    }

    fn update(&mut self, elapsed_s: f32, trains: &[Train], ctx: &mut SimContext) {
        self.timer_s -= elapsed_s;

        let mut nearest: Option<(f32, &Train, WorldLocation)> = None;
        for train in trains {
            for end in [&train.front, &train.rear] {
                let at = end.world_location();
                let d = WorldLocation::distance_squared(&self.location, &at).sqrt();
                if nearest.as_ref().map_or(true, |(best, _, _)| d < *best) {
                    nearest = Some((d, train, at));
                }
            }
        }

        if let Some((distance, train, at)) = nearest {
            if distance < SCARE_DISTANCE_M && !train.is_stopped() {
                if self.state != HazardState::Scared {
                    debug!("Hazard {} scared by train {}", self.id.0, train.number);
                }
                self.state = HazardState::Scared;
                self.timer_s = SCARED_TIME_S;
                return;
            }
            if self.state == HazardState::Scared && self.timer_s > 0.0 {
                return;
            }
            if distance < LOOK_DISTANCE_M && train.speed_mps.abs() > MAX_STOPPED_MPS {
                let d = at.delta_to(&self.location);
                let (rx, rz) = right_of(train.front.yaw());
                self.state = if d.x * rx + d.z * rz >= 0.0 {
                    HazardState::LookLeft
                } else {
                    HazardState::LookRight
                };
                return;
            }
        } else if self.state == HazardState::Scared && self.timer_s > 0.0 {
            return;
        }

        if self.state != HazardState::Idle || self.timer_s <= 0.0 {
            self.state = HazardState::Idle;
            self.idle_variant = ctx.random_index(IDLE_VARIANTS);
            self.timer_s = ctx.random_range(2.0..6.0);
        }
    }
}

#[derive(Debug, Default)]
pub struct HazardManager {
    pub hazards: BTreeMap<TrItemId, Hazard>,
}

impl HazardManager {
    pub fn new(db: &TrackDb) -> Self {
        let hazards = db
            .items_of_type(TrItemType::Hazard)
            .filter_map(|item| match &item.kind {
                TrackItemKind::Hazard { file_name } => {
                    Some((item.id, Hazard::new(item.id, file_name, item.location)))
                }
                _ => None,
            })
            .collect();
        Self { hazards }
    }

    pub fn update(&mut self, elapsed_s: f32, trains: &[Train], ctx: &mut SimContext) {
        for hazard in self.hazards.values_mut() {
            hazard.update(elapsed_s, trains, ctx);
        }
    }

    pub fn state(&self, id: TrItemId) -> Option<HazardState> {
        self.hazards.get(&id).map(|h| h.state)
    }
}
