//! Fuel pickups
//!
//! Water columns, coal stages and diesel points placed on the track. A car
//! can take fuel when its centre is within [`PICKUP_REACH_M`] of a pickup of
//! the matching kind.

use log::{debug, info};
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;

use super::track_db::{FuelKind, TrItemType, TrackDb, TrackItemKind};
use super::train::Train;
use super::types::{TrItemId, WorldLocation};

/// How close a car has to stand to a pickup to take fuel.
pub const PICKUP_REACH_M: f32 = 3.0;

#[derive(Debug, Clone, PartialEq)]
pub struct FuelPickupItem {
    pub id: TrItemId,
    pub track_node: usize,
    pub location: WorldLocation,
    pub fuel: FuelKind,
    pub capacity: f32,
    pub feed_rate_per_s: f32,
}

/// A car standing at a pickup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickupMatch {
    pub pickup: TrItemId,
    pub car_index: usize,
    pub distance_m: f32,
}

#[derive(Debug, Default)]
pub struct FuelManager {
    pub pickups: BTreeMap<TrItemId, FuelPickupItem>,
}

impl FuelManager {
    pub fn new(db: &TrackDb) -> Self {
        let pickups = db
            .items_of_type(TrItemType::Pickup)
            .filter_map(|item| match item.kind {
                TrackItemKind::Pickup {
                    fuel,
                    capacity,
                    feed_rate_per_s,
                } => Some((
                    item.id,
                    FuelPickupItem {
                        id: item.id,
                        track_node: item.node,
                        location: item.location,
                        fuel,
                        capacity,
                        feed_rate_per_s,
                    },
                )),
                _ => None,
            })
            .collect::<BTreeMap<_, _>>();
        debug!("Indexed {} fuel pickups", pickups.len());
        Self { pickups }
    }

    /// The closest pickup to any fuel-carrying car of the train, if one is
    /// within reach.
    pub fn nearest_pickup(&self, train: &Train) -> Option<PickupMatch> {
        train
            .cars
            .iter()
            .enumerate()
            .filter_map(|(car_index, car)| car.fuel.map(|f| (car_index, car, f.kind)))
            .flat_map(|(car_index, car, kind)| {
                let at = car.world_position.world_location();
                self.pickups
                    .values()
                    .filter(move |p| p.fuel == kind)
                    .map(move |p| PickupMatch {
                        pickup: p.id,
                        car_index,
                        distance_m: WorldLocation::distance_squared(&at, &p.location).sqrt(),
                    })
            })
            .filter(|m| m.distance_m <= PICKUP_REACH_M)
            .min_by_key(|m| OrderedFloat(m.distance_m))
    }

    /// Feeds fuel from `pickup` into the matching car for `elapsed_s`
    /// seconds. Returns the amount transferred; zero once the car is full.
    pub fn refill(&self, train: &mut Train, at: &PickupMatch, elapsed_s: f32) -> f32 {
        let Some(pickup) = self.pickups.get(&at.pickup) else {
            return 0.0;
        };
        let Some(load) = train.cars.get_mut(at.car_index).and_then(|c| c.fuel.as_mut()) else {
            return 0.0;
        };
        if load.kind != pickup.fuel {
            return 0.0;
        }
        let room = (load.capacity - load.level).max(0.0);
        let amount = (pickup.feed_rate_per_s * elapsed_s).min(room).min(pickup.capacity);
        load.level += amount;
        if amount > 0.0 && load.level >= load.capacity {
            info!("Train {} refuelled at pickup {}", train.number, pickup.id.0);
        }
        amount
    }
}
