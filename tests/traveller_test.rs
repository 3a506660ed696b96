mod common;

use std::sync::Arc;

use proptest::prelude::*;
use rail_sim::simulation::{
    TrackDb, TrackDbBuilder, TrackShape, Traveller, TravellerDirection, VectorEnd, WorldLocation,
};

use common::{at, straight_line, LINE_LENGTH_M};

fn line_db() -> (Arc<TrackDb>, usize) {
    let (db, line) = straight_line();
    (Arc::new(db), line.node)
}

fn curve_db(radius_m: f32, angle_deg: f32) -> (Arc<TrackDb>, usize) {
    let mut b = TrackDbBuilder::new();
    let node = b.add_vector_node(
        WorldLocation::new(0, 0, 10.0, 0.0, 10.0),
        0.3,
        &[TrackShape::Curved { radius_m, angle_deg }],
    );
    (Arc::new(b.build()), node)
}

fn planar_distance(a: &WorldLocation, b: &WorldLocation) -> f32 {
    let d = a.delta_to(b);
    (d.x * d.x + d.z * d.z).sqrt()
}

struct Junction {
    db: Arc<TrackDb>,
    junction: usize,
    main: usize,
    siding: usize,
    branch: usize,
}

/// 100 m of main line into a two-way junction: route 0 runs straight on to a
/// siding, route 1 curves off to a branch.
fn junction_db() -> Junction {
    let mut b = TrackDbBuilder::new();
    let origin = WorldLocation::new(0, 0, 0.0, 0.0, 0.0);
    let main = b.add_vector_node(origin, 0.0, &[TrackShape::Straight { length_m: 100.0 }]);
    let (split, yaw) = b.end_of(main, VectorEnd::End).unwrap();
    let junction = b.add_junction(split, 2);
    let siding = b.add_vector_node(split, yaw, &[TrackShape::Straight { length_m: 100.0 }]);
    let branch = b.add_vector_node(
        split,
        yaw,
        &[TrackShape::Curved {
            radius_m: 300.0,
            angle_deg: 20.0,
        }],
    );
    let start_buffer = b.add_end_node(origin);
    let (siding_end, _) = b.end_of(siding, VectorEnd::End).unwrap();
    let (branch_end, _) = b.end_of(branch, VectorEnd::End).unwrap();
    let siding_buffer = b.add_end_node(siding_end);
    let branch_buffer = b.add_end_node(branch_end);
    b.link_vector(main, VectorEnd::Start, start_buffer, 0).unwrap();
    b.link_vector(main, VectorEnd::End, junction, 0).unwrap();
    b.link_vector(siding, VectorEnd::Start, junction, 1).unwrap();
    b.link_vector(branch, VectorEnd::Start, junction, 2).unwrap();
    b.link_vector(siding, VectorEnd::End, siding_buffer, 0).unwrap();
    b.link_vector(branch, VectorEnd::End, branch_buffer, 0).unwrap();
    Junction {
        db: Arc::new(b.build()),
        junction,
        main,
        siding,
        branch,
    }
}

#[test]
fn traveller_follows_thrown_switch() {
    let j = junction_db();
    let start = Traveller::from_location(&j.db, &at(90.0)).unwrap();
    assert_eq!(start.track_node_index(), j.main);

    let mut t = start.clone();
    assert!(t.move_by(30.0).abs() < 0.01);
    assert_eq!(t.track_node_index(), j.siding);
    assert!((t.track_node_offset() - 20.0).abs() < 0.01);

    j.db.throw_switch(j.junction, 1).unwrap();
    assert_eq!(j.db.node(j.junction).unwrap().selected_route(), 1);
    let mut t = start.clone();
    assert!(t.move_by(30.0).abs() < 0.01);
    assert_eq!(t.track_node_index(), j.branch);
    assert!(t.is_track_curved());
    assert!((t.track_node_offset() - 20.0).abs() < 0.01);

    // Back to the straight road.
    j.db.throw_switch(j.junction, 0).unwrap();
    let mut t = start;
    t.move_by(30.0);
    assert_eq!(t.track_node_index(), j.siding);
}

#[test]
fn switch_refuses_missing_route_and_plain_track() {
    let j = junction_db();
    assert!(j.db.throw_switch(j.junction, 2).is_err());
    assert!(j.db.throw_switch(j.main, 0).is_err());
    assert_eq!(j.db.node(j.junction).unwrap().selected_route(), 0);
}

#[test]
fn placing_on_the_line_finds_offset() {
    let (db, node) = line_db();
    let t = Traveller::from_location(&db, &at(725.0)).unwrap();
    assert_eq!(t.track_node_index(), node);
    assert_eq!(t.direction(), TravellerDirection::Forward);
    assert!((t.track_node_offset() - 725.0).abs() < 0.01);
    assert!((t.track_node_length() - LINE_LENGTH_M).abs() < 0.01);
}

#[test]
fn running_off_the_end_returns_leftover() {
    let (db, _) = line_db();
    let mut t = Traveller::from_location(&db, &at(990.0)).unwrap();
    let left = t.move_by(25.0);
    assert!((left - 15.0).abs() < 0.01, "left over {}", left);

    let mut t = Traveller::from_location(&db, &at(10.0)).unwrap();
    let left = t.move_by(-25.0);
    assert!((left + 15.0).abs() < 0.01, "left over {}", left);
}

#[test]
fn target_behind_is_not_found() {
    let (db, _) = line_db();
    let t = Traveller::from_location(&db, &at(400.0)).unwrap();
    assert_eq!(t.distance_to(&at(100.0)), -1.0);
    assert_eq!(t.try_distance_to(&at(100.0), 2000.0), None);
    assert!((t.reversed().distance_to(&at(100.0)) - 300.0).abs() < 0.01);
}

#[test]
fn search_gives_up_beyond_limit() {
    let (db, _) = line_db();
    let t = Traveller::from_location(&db, &at(100.0)).unwrap();
    assert_eq!(t.distance_to_within(&at(900.0), 500.0), -1.0);
    assert!((t.distance_to_within(&at(900.0), 1000.0) - 800.0).abs() < 0.01);
}

#[test]
fn overlap_is_negative_once_ends_pass() {
    let (db, _) = line_db();
    let front = Traveller::from_location(&db, &at(200.0)).unwrap();
    let other_rear = Traveller::from_location(&db, &at(200.4)).unwrap();
    assert!(front.overlap_distance_m(&other_rear, false) > 0.0);
    let passed = Traveller::from_location(&db, &at(199.6)).unwrap();
    assert!(front.overlap_distance_m(&passed, false) < 0.0);
    let far = Traveller::from_location(&db, &at(250.0)).unwrap();
    assert_eq!(front.overlap_distance_m(&far, false), 1.0);
}

proptest! {
    #[test]
    fn move_and_move_back_returns_home(start in 5.0f32..995.0, step in 0.0f32..400.0) {
        let (db, _) = line_db();
        let step = step.min(995.0 - start);
        let mut t = Traveller::from_location(&db, &at(start)).unwrap();
        let home = t.world_location();
        prop_assert!(t.move_by(step).abs() < 0.01);
        prop_assert!(t.move_by(-step).abs() < 0.01);
        prop_assert!(planar_distance(&home, &t.world_location()) < 0.02);
    }

    #[test]
    fn distance_ahead_matches_distance_back(a in 5.0f32..490.0, gap in 1.0f32..500.0) {
        let (db, _) = line_db();
        let b = a + gap;
        let from_a = Traveller::from_location(&db, &at(a)).unwrap();
        let from_b = Traveller::from_location(&db, &at(b)).unwrap().reversed();
        let ahead = from_a.distance_to(&at(b));
        let back = from_b.distance_to(&at(a));
        prop_assert!((ahead - gap).abs() < 0.02);
        prop_assert!((ahead - back).abs() < 0.02);
    }

    #[test]
    fn curve_chord_never_exceeds_arc(radius in 80.0f32..600.0, travelled in 1.0f32..40.0) {
        let (db, node) = curve_db(radius, 30.0);
        let mut t = Traveller::from_node(&db, node).unwrap();
        let start = t.world_location();
        prop_assert!(t.move_by(travelled).abs() < 0.01);
        let chord = planar_distance(&start, &t.world_location());
        let expected = 2.0 * radius * (travelled / (2.0 * radius)).sin();
        prop_assert!(chord <= travelled + 0.01);
        prop_assert!((chord - expected).abs() < 0.05);
        prop_assert!(t.is_track_curved());
    }
}
