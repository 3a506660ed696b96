//! Level crossings
//!
//! A crossing group pairs rail crossing items with road crossing items. Each
//! tick every train is tested against every grouped rail item and added to
//! or removed from the item's occupancy list. The decision ladder keeps the
//! legacy activation behaviour, thresholds included.
//!
//! Occupancy lists are published copy-on-write: a mutation builds a new list
//! and swaps the `Arc`, so a reader holding an earlier snapshot never sees a
//! half-updated list.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::track_db::{TrItemType, TrackDb};
use super::train::{Train, TrainType};
use super::traveller::Traveller;
use super::types::{TrItemId, TrainId, TravellerDirection, WorldLocation, MAX_STOPPED_MPS};

/// Below this speed gates are armed only once the train is close.
pub const MIN_ACTIVATION_SPEED_MPS: f32 = 5.0;
/// Extra approach distance granted to slow trains before arming.
pub const SLOW_APPROACH_MARGIN_M: f32 = 70.0;
/// A stopped train this far inside the minimum distance releases the gates.
pub const STOPPED_HYSTERESIS_M: f32 = 15.0;
/// A slowly reversing train clears the crossing once its front is this far
/// away.
pub const REVERSE_CLEAR_M: f32 = 2.5;
/// Upper bound on the distance at which an AI train sounds its horn.
pub const MAX_HORN_DISTANCE_M: f32 = 80.0;

const STATIC_ADJUST_LONG_M: f32 = 13.5;
const STATIC_ADJUST_SHORT_M: f32 = 6.5;
const STATIC_ADJUST_SPLIT_M: f32 = 20.0;

/// One rail or road point item belonging to a crossing.
#[derive(Debug, Clone)]
pub struct LevelCrossingItem {
    pub id: TrItemId,
    pub track_node: usize,
    pub location: WorldLocation,
    pub group: Option<usize>,
    trains: Arc<Vec<TrainId>>,
    static_consists: Arc<Vec<TrainId>>,
    horn_sounded: HashSet<TrainId>,
}

impl LevelCrossingItem {
    pub fn new(id: TrItemId, track_node: usize, location: WorldLocation) -> Self {
        Self {
            id,
            track_node,
            location,
            group: None,
            trains: Arc::new(Vec::new()),
            static_consists: Arc::new(Vec::new()),
            horn_sounded: HashSet::new(),
        }
    }

    /// Snapshot of the moving trains occupying the item.
    pub fn trains(&self) -> Arc<Vec<TrainId>> {
        Arc::clone(&self.trains)
    }

    /// Snapshot of the static consists occupying the item.
    pub fn static_consists(&self) -> Arc<Vec<TrainId>> {
        Arc::clone(&self.static_consists)
    }

    pub fn is_occupied(&self) -> bool {
        !self.trains.is_empty() || !self.static_consists.is_empty()
    }

    pub fn add_train(&mut self, train: &Train) {
        let list = if train.is_static() {
            &mut self.static_consists
        } else {
            &mut self.trains
        };
        if !list.contains(&train.number) {
            let mut next = Vec::with_capacity(list.len() + 1);
            next.extend_from_slice(list);
            next.push(train.number);
            *list = Arc::new(next);
        }
    }

    pub fn remove_train(&mut self, train: &Train) {
        self.horn_sounded.remove(&train.number);
        let list = if train.is_static() {
            &mut self.static_consists
        } else {
            &mut self.trains
        };
        if list.contains(&train.number) {
            let next: Vec<TrainId> = list.iter().copied().filter(|t| *t != train.number).collect();
            *list = Arc::new(next);
        }
    }

    /// Drops a train that no longer exists, whatever its type was.
    pub fn forget_train(&mut self, train: TrainId) {
        self.horn_sounded.remove(&train);
        for list in [&mut self.trains, &mut self.static_consists] {
            if list.contains(&train) {
                *list = Arc::new(list.iter().copied().filter(|t| *t != train).collect());
            }
        }
    }

    /// Track distance from `traveller` to the item, `-1.0` if it is not
    /// ahead within `max_distance_m`.
    pub fn distance_to(&self, traveller: &Traveller, max_distance_m: f32) -> f32 {
        traveller.distance_to_on_node(self.track_node, &self.location, max_distance_m)
    }
}

/// A group of crossing items that open and close together.
#[derive(Debug, Clone)]
pub struct LevelCrossing {
    pub name: String,
    pub items: Vec<TrItemId>,
    pub road_items: Vec<TrItemId>,
    pub warning_time_s: f32,
    pub minimum_distance_m: f32,
}

/// An AI train asking to sound its horn for a crossing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HornRequest {
    pub train: TrainId,
    pub crossing: TrItemId,
    pub distance_m: f32,
}

#[derive(Debug, Default)]
pub struct LevelCrossings {
    pub track_items: BTreeMap<TrItemId, LevelCrossingItem>,
    pub road_items: BTreeMap<TrItemId, LevelCrossingItem>,
    pub groups: Vec<LevelCrossing>,
    road_to_track: Vec<(TrItemId, TrItemId)>,
}

impl LevelCrossings {
    /// Indexes every crossing item found on the track and road networks.
    pub fn new(db: &TrackDb) -> Self {
        let mut track_items = BTreeMap::new();
        for node in db.nodes.iter().flatten() {
            let Some(vector) = node.vector() else { continue };
            for id in &vector.item_refs {
                if track_items.contains_key(id) {
                    continue;
                }
                if let Some(item) = db.item(*id) {
                    if item.item_type() == TrItemType::LevelCrossing {
                        track_items.insert(*id, LevelCrossingItem::new(*id, node.index, item.location));
                    }
                }
            }
        }
        let road_items = db
            .road_items
            .iter()
            .flatten()
            .filter(|item| item.item_type() == TrItemType::LevelCrossing)
            .map(|item| (item.id, LevelCrossingItem::new(item.id, item.node, item.location)))
            .collect();
        Self {
            track_items,
            road_items,
            groups: Vec::new(),
            road_to_track: Vec::new(),
        }
    }

    /// Groups rail and road items into one crossing. Returns the group index.
    pub fn create_level_crossing(
        &mut self,
        name: &str,
        track_ids: &[TrItemId],
        road_ids: &[TrItemId],
        warning_time_s: f32,
        minimum_distance_m: f32,
    ) -> Result<usize> {
        for id in track_ids {
            self.track_items
                .get(id)
                .with_context(|| format!("Level crossing {} refers to unknown rail item {}", name, id.0))?;
        }
        for id in road_ids {
            self.road_items
                .get(id)
                .with_context(|| format!("Level crossing {} refers to unknown road item {}", name, id.0))?;
        }
        if track_ids.len() != road_ids.len() {
            warn!(
                "{} level crossing contains {} rail and {} road items; expected them to match.",
                name,
                track_ids.len(),
                road_ids.len()
            );
        }
        if track_ids.len() >= road_ids.len() {
            for (road, track) in road_ids.iter().zip(track_ids) {
                if !self.road_to_track.iter().any(|(r, _)| r == road) {
                    self.road_to_track.push((*road, *track));
                }
            }
        }

        let group = self.groups.len();
        for id in track_ids {
            if let Some(item) = self.track_items.get_mut(id) {
                item.group = Some(group);
            }
        }
        for id in road_ids {
            if let Some(item) = self.road_items.get_mut(id) {
                item.group = Some(group);
            }
        }
        self.groups.push(LevelCrossing {
            name: name.to_string(),
            items: track_ids.to_vec(),
            road_items: road_ids.to_vec(),
            warning_time_s,
            minimum_distance_m,
        });
        debug!("Level crossing {} created with {} rail items", name, track_ids.len());
        Ok(group)
    }

    /// True if any rail item of the group is occupied.
    pub fn has_train(&self, group: usize) -> bool {
        self.groups.get(group).is_some_and(|g| {
            g.items
                .iter()
                .filter_map(|id| self.track_items.get(id))
                .any(LevelCrossingItem::is_occupied)
        })
    }

    /// Re-evaluates every grouped crossing against every train. Returns the
    /// horn requests raised by AI trains on approach.
    pub fn update(&mut self, trains: &[Train]) -> Vec<HornRequest> {
        let mut horns = Vec::new();
        for train in trains {
            self.update_crossings(train, &mut horns);
        }
        horns
    }

    /// Removes a train from every occupancy list.
    pub fn forget_train(&mut self, train: TrainId) {
        for item in self.track_items.values_mut() {
            item.forget_train(train);
        }
    }

    fn update_crossings(&mut self, train: &Train, horns: &mut Vec<HornRequest>) {
        let speed = train.speed_mps;
        let abs_speed = speed.abs();
        let length = train.length_m();
        let is_static = train.is_static();
        let front_location = train.front.world_location();
        let rear_location = train.rear.world_location();

        let ai_class = matches!(
            train.train_type,
            TrainType::Ai
                | TrainType::AiNotStarted
                | TrainType::AiPlayerDriven
                | TrainType::AiPlayerHosting
                | TrainType::AiIncorporated
        );
        let player = train.train_type == TrainType::Player;
        let remote = train.train_type == TrainType::Remote;

        for crossing in self.track_items.values_mut() {
            let Some(group) = crossing.group.and_then(|g| self.groups.get(g)) else {
                continue;
            };

            let predicted = group.warning_time_s * abs_speed;
            let max_predicted = group.warning_time_s * (train.max_speed_mps - abs_speed) / 2.0;
            let minimum_dist = group.minimum_distance_m;
            let total_dist = predicted + minimum_dist + 1.0;
            let total_max_dist = predicted + max_predicted + minimum_dist + 1.0;

            let near = |distance: f32| {
                WorldLocation::within(&crossing.location, &front_location, distance)
                    || WorldLocation::within(&crossing.location, &rear_location, distance)
            };

            let mut valid_train = false;
            let mut valid_static = false;
            let mut req_dist = 0.0;

            if is_static {
                if !near(minimum_dist + length / 2.0) {
                    continue;
                }
                valid_static = train.cars.iter().any(|car| {
                    WorldLocation::within(&crossing.location, &car.world_position.world_location(), minimum_dist)
                });
            } else if near(total_dist) {
                valid_train = true;
                req_dist = total_dist;
            } else if near(total_max_dist) {
                valid_train = true;
                req_dist = total_max_dist;
            }

            if is_static && !valid_static && !crossing.static_consists.contains(&train.number) {
                continue;
            }
            if !is_static && !valid_train && !crossing.trains.contains(&train.number) {
                continue;
            }

            let mut front_dist = crossing.distance_to(&train.front, req_dist);
            if front_dist < 0.0 && !is_static {
                let behind = train.front.copy_with(TravellerDirection::Backward);
                front_dist = -crossing.distance_to(&behind, req_dist + length);
                if front_dist > 0.0 {
                    crossing.remove_train(train);
                    continue;
                }
            }
            let mut rear_dist = -front_dist - length;

            if ai_class {
                let nearer = front_dist.min(rear_dist.abs());
                let horn_distance = (group.warning_time_s * abs_speed).min(MAX_HORN_DISTANCE_M);
                if abs_speed > MAX_STOPPED_MPS
                    && nearer > 0.0
                    && nearer <= horn_distance
                    && crossing.horn_sounded.insert(train.number)
                {
                    horns.push(HornRequest {
                        train: train.number,
                        crossing: crossing.id,
                        distance_m: nearer,
                    });
                }
            }

            if is_static && valid_static {
                if speed > 0.0 {
                    let f = crossing.distance_to(&train.front, minimum_dist);
                    let r = crossing.distance_to(&train.rear, minimum_dist);
                    if f < 0.0 && r < 0.0 {
                        crossing.remove_train(train);
                    }
                }
                let adjust = if minimum_dist >= STATIC_ADJUST_SPLIT_M {
                    minimum_dist - STATIC_ADJUST_LONG_M
                } else {
                    minimum_dist - STATIC_ADJUST_SHORT_M
                };
                front_dist = crossing.distance_to(&train.front, adjust);
                rear_dist = crossing.distance_to(&train.rear, adjust);
                if front_dist < 0.0 && rear_dist < 0.0 {
                    rear_dist = crossing.distance_to(&train.rear.copy_with(TravellerDirection::Backward), adjust);
                }

                if (front_dist > 0.0 && front_dist <= adjust)
                    || (front_dist < 0.0 && rear_dist > 0.0)
                    || (front_dist < 0.0 && rear_dist < 0.0)
                    || (rear_dist <= adjust && rear_dist > 0.0)
                {
                    crossing.add_train(train);
                } else {
                    crossing.remove_train(train);
                }
            } else if (ai_class || player || remote)
                && abs_speed <= MAX_STOPPED_MPS
                && front_dist <= req_dist
                && rear_dist <= minimum_dist
            {
                if front_dist > minimum_dist - STOPPED_HYSTERESIS_M {
                    crossing.remove_train(train);
                } else {
                    crossing.add_train(train);
                }
            } else if (ai_class || player || is_static || remote)
                && speed > 0.0
                && speed <= MIN_ACTIVATION_SPEED_MPS
                && front_dist <= req_dist
                && rear_dist <= minimum_dist
            {
                if front_dist <= minimum_dist + SLOW_APPROACH_MARGIN_M {
                    crossing.add_train(train);
                }
            } else if (ai_class || player)
                && speed < 0.0
                && abs_speed <= MIN_ACTIVATION_SPEED_MPS
                && rear_dist <= req_dist
                && front_dist <= minimum_dist
            {
                if front_dist > REVERSE_CLEAR_M {
                    crossing.remove_train(train);
                } else if rear_dist <= minimum_dist + SLOW_APPROACH_MARGIN_M {
                    crossing.add_train(train);
                }
            } else if (ai_class || player || remote)
                && speed < 0.0
                && abs_speed > MIN_ACTIVATION_SPEED_MPS
                && rear_dist <= req_dist
                && front_dist <= minimum_dist
            {
                crossing.add_train(train);
            } else if (ai_class || player || remote)
                && speed > MIN_ACTIVATION_SPEED_MPS
                && front_dist <= req_dist
                && rear_dist <= minimum_dist
            {
                crossing.add_train(train);
            } else {
                crossing.remove_train(train);
            }
        }
    }

    /// The road item paired with the first occupied crossing ahead of the
    /// train within `req_dist`, and its distance. Distance is `-1.0` when
    /// nothing qualifies.
    pub fn search_near_level_crossing(
        &self,
        train: &Train,
        req_dist: f32,
        forwards: bool,
    ) -> (Option<TrItemId>, f32) {
        let traveller = if forwards {
            train.front.clone()
        } else {
            train.rear.copy_with(TravellerDirection::Backward)
        };
        let mut front_dist = -1.0;
        for crossing in self.track_items.values().filter(|c| c.group.is_some()) {
            if !crossing.trains.contains(&train.number) {
                continue;
            }
            front_dist = crossing.distance_to(&traveller, req_dist);
            if front_dist > 0.0 && front_dist <= req_dist {
                if let Some((road, _)) = self.road_to_track.iter().find(|(_, t)| *t == crossing.id) {
                    return (Some(*road), front_dist);
                }
            }
        }
        (None, front_dist)
    }
}
