mod common;

use std::sync::Arc;

use rail_sim::simulation::{
    FuelKind, FuelManager, HazardManager, HazardState, LevelCrossings, SimContext, SuperElevation,
    SuperElevationStandard, TrackDb, TrackDbBuilder, TrackItemKind, TrackShape, Train, TrainCar, TrainId, TrainType,
    Traveller, WorldLocation, STANDARD_GAUGE_M,
};

use common::{at, straight_line, CROSSING_M};

fn curve(angle_deg: f32) -> TrackShape {
    TrackShape::Curved {
        radius_m: 500.0,
        angle_deg,
    }
}

/// Straight, two right-hand curves, one left-hand curve, straight.
fn reverse_curves() -> (TrackDb, usize) {
    let mut b = TrackDbBuilder::new();
    let node = b.add_vector_node(
        WorldLocation::new(0, 0, 0.0, 0.0, 0.0),
        0.0,
        &[
            TrackShape::Straight { length_m: 50.0 },
            curve(30.0),
            curve(30.0),
            curve(-30.0),
            TrackShape::Straight { length_m: 50.0 },
        ],
    );
    (b.build(), node)
}

fn engine_at(db: &Arc<TrackDb>, front_m: f32, car: TrainCar, speed_mps: f32) -> Train {
    let front = Traveller::from_location(db, &at(front_m)).unwrap();
    let mut train = Train::new(TrainId(3), "Light engine", TrainType::Player, front, vec![car]);
    train.speed_mps = speed_mps;
    train
}

#[test]
fn curve_runs_split_on_change_of_hand() {
    let (mut db, node) = reverse_curves();
    let result = SuperElevation::compute(&mut db, STANDARD_GAUGE_M, &[SuperElevationStandard::default()]);

    assert_eq!(result.curves.len(), 2);
    let right = &result.curves[0];
    assert_eq!(right.sections, vec![1, 2]);
    assert_eq!(right.hand, 1);
    assert!((right.max_elev_m - 0.395).abs() < 1e-3, "{}", right.max_elev_m);
    assert_eq!(result.curves[1].sections, vec![3]);
    assert_eq!(result.curves[1].hand, -1);

    let v = db.vector_node(node).unwrap();
    assert_eq!(v.sections[0].max_elev, 0.0);
    assert_eq!(v.sections[1].start_elev, 0.0);
    assert!((v.sections[1].end_elev - right.max_elev_m).abs() < 1e-6);
    assert_eq!(v.sections[2].end_elev, 0.0);
    assert_eq!(result.sections_for_tile(0, 0).len(), 3);
}

#[test]
fn traveller_reads_cant_and_tilt_on_curve() {
    let (mut db, node) = reverse_curves();
    let result = SuperElevation::compute(&mut db, STANDARD_GAUGE_M, &[SuperElevationStandard::default()]);
    let max_elev = result.curves[0].max_elev_m;
    let db = Arc::new(db);

    let mut t = Traveller::from_node(&db, node).unwrap();
    assert_eq!(t.super_elevation(), 0.0);
    assert_eq!(t.find_tilted_z(30.0), 0.0);

    // A quarter of the way into the second right-hand curve.
    let arc = 500.0 * 30f32.to_radians();
    t.move_by(50.0 + arc + arc / 4.0);
    assert!(t.is_track_curved());
    assert!((t.super_elevation().abs() - max_elev).abs() < 1e-4);
    assert!((t.find_tilted_z(30.0).abs() - 0.105).abs() < 1e-5);
    assert_eq!(t.find_tilted_z(10.0), 0.0);
}

#[test]
fn locomotive_takes_water_at_column() {
    let mut b = TrackDbBuilder::new();
    let node = b.add_vector_node(
        WorldLocation::new(0, 0, 0.0, 0.0, 0.0),
        0.0,
        &[TrackShape::Straight { length_m: 500.0 }],
    );
    let column = b
        .add_item(
            node,
            200.0,
            "Water column",
            TrackItemKind::Pickup {
                fuel: FuelKind::Water,
                capacity: 10_000.0,
                feed_rate_per_s: 50.0,
            },
        )
        .unwrap();
    let db = Arc::new(b.build());
    let fuel = FuelManager::new(&db);
    assert_eq!(fuel.pickups.len(), 1);

    let tank = TrainCar::locomotive("3 - 1", 20.0, 80_000.0).with_fuel(FuelKind::Water, 0.0, 120.0);
    let mut train = engine_at(&db, 210.0, tank, 0.0);
    let at_column = fuel.nearest_pickup(&train).unwrap();
    assert_eq!(at_column.pickup, column);
    assert_eq!(at_column.car_index, 0);
    assert!(at_column.distance_m < 0.1);

    assert_eq!(fuel.refill(&mut train, &at_column, 1.0), 50.0);
    assert_eq!(fuel.refill(&mut train, &at_column, 2.0), 70.0);
    assert_eq!(fuel.refill(&mut train, &at_column, 1.0), 0.0);
    assert_eq!(train.cars[0].fuel.unwrap().level, 120.0);

    let far = engine_at(&db, 250.0, TrainCar::locomotive("3 - 1", 20.0, 80_000.0).with_fuel(FuelKind::Water, 0.0, 120.0), 0.0);
    assert!(fuel.nearest_pickup(&far).is_none());

    let diesel = engine_at(&db, 210.0, TrainCar::locomotive("3 - 1", 20.0, 80_000.0).with_fuel(FuelKind::Diesel, 0.0, 500.0), 0.0);
    assert!(fuel.nearest_pickup(&diesel).is_none());
}

#[test]
fn hazard_reacts_to_approaching_train() {
    let mut b = TrackDbBuilder::new();
    let node = b.add_vector_node(
        WorldLocation::new(0, 0, 0.0, 0.0, 0.0),
        0.0,
        &[TrackShape::Straight { length_m: 500.0 }],
    );
    let cow = b
        .add_item(
            node,
            300.0,
            "Cow",
            TrackItemKind::Hazard {
                file_name: "cow.haz".to_string(),
            },
        )
        .unwrap();
    let db = Arc::new(b.build());
    let mut hazards = HazardManager::new(&db);
    let mut ctx = SimContext::new_with_seed(1);
    let engine = || TrainCar::locomotive("3 - 1", 20.0, 80_000.0);

    hazards.update(0.1, &[], &mut ctx);
    assert_eq!(hazards.state(cow), Some(HazardState::Idle));

    hazards.update(0.1, &[engine_at(&db, 230.0, engine(), 10.0)], &mut ctx);
    assert!(matches!(
        hazards.state(cow),
        Some(HazardState::LookLeft) | Some(HazardState::LookRight)
    ));

    hazards.update(0.1, &[engine_at(&db, 290.0, engine(), 10.0)], &mut ctx);
    assert_eq!(hazards.state(cow), Some(HazardState::Scared));

    // Still running a moment later even with the train gone.
    hazards.update(1.0, &[], &mut ctx);
    assert_eq!(hazards.state(cow), Some(HazardState::Scared));
    hazards.update(10.0, &[], &mut ctx);
    assert_eq!(hazards.state(cow), Some(HazardState::Idle));
}

#[test]
fn crossing_search_finds_road_ahead() {
    let (db, line) = straight_line();
    let mut crossings = LevelCrossings::new(&db);
    crossings
        .create_level_crossing("Mill Lane", &[line.crossing], &[line.crossing_road], 30.0, 60.0)
        .unwrap();
    let db = Arc::new(db);
    let train = engine_at(&db, CROSSING_M - 100.0, TrainCar::locomotive("3 - 1", 20.0, 80_000.0), 10.0);

    assert_eq!(crossings.search_near_level_crossing(&train, 150.0, true).0, None);

    crossings.update(std::slice::from_ref(&train));
    let (road, distance) = crossings.search_near_level_crossing(&train, 150.0, true);
    assert_eq!(road, Some(line.crossing_road));
    assert!((distance - 100.0).abs() < 0.1);

    let (road, _) = crossings.search_near_level_crossing(&train, 50.0, true);
    assert_eq!(road, None);
}
