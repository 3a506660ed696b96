mod common;

use std::sync::Arc;

use rail_sim::simulation::{
    LevelCrossings, TrackDb, Train, TrainCar, TrainId, TrainType, Traveller, MIN_ACTIVATION_SPEED_MPS,
    STOPPED_HYSTERESIS_M,
};

use common::{at, straight_line, Line, CROSSING_M};

const WARNING_S: f32 = 30.0;
const MINIMUM_M: f32 = 60.0;

struct Fixture {
    db: Arc<TrackDb>,
    crossings: LevelCrossings,
    group: usize,
    line: Line,
}

fn fixture() -> Fixture {
    let (db, line) = straight_line();
    let mut crossings = LevelCrossings::new(&db);
    let group = crossings
        .create_level_crossing("Mill Lane", &[line.crossing], &[line.crossing_road], WARNING_S, MINIMUM_M)
        .unwrap();
    Fixture {
        db: Arc::new(db),
        crossings,
        group,
        line,
    }
}

fn train(f: &Fixture, train_type: TrainType, front_m: f32, speed_mps: f32) -> Train {
    let front = Traveller::from_location(&f.db, &at(front_m)).unwrap();
    let cars = vec![
        TrainCar::locomotive("1 - 1", 20.0, 100_000.0),
        TrainCar::new("1 - 2", 20.0, 40_000.0),
    ];
    let mut train = Train::new(TrainId(1), "Up goods", train_type, front, cars);
    train.speed_mps = speed_mps;
    train
}

fn closed(f: &mut Fixture, train: &Train) -> bool {
    f.crossings.update(std::slice::from_ref(train));
    f.crossings.has_train(f.group)
}

#[test]
fn groups_only_known_items() {
    let (db, line) = straight_line();
    let mut crossings = LevelCrossings::new(&db);
    assert_eq!(crossings.track_items.len(), 1);
    assert_eq!(crossings.road_items.len(), 1);
    assert!(crossings
        .create_level_crossing("Bad", &[line.platform], &[line.crossing_road], 30.0, 60.0)
        .is_err());
    assert!(crossings.groups.is_empty());
}

#[test]
fn fast_train_closes_crossing_well_ahead_and_clears_behind() {
    let mut f = fixture();
    let mut t = train(&f, TrainType::Player, CROSSING_M - 200.0, 10.0);
    assert!(closed(&mut f, &t));
    assert_eq!(
        f.crossings.track_items[&f.line.crossing].trains().as_slice(),
        &[TrainId(1)]
    );

    // Rear 50 m past: still inside the minimum distance.
    t.move_by(290.0);
    assert!(closed(&mut f, &t));

    t.move_by(30.0);
    assert!(!closed(&mut f, &t));
}

#[test]
fn slow_train_waits_until_close_before_closing() {
    let mut f = fixture();
    let slow = MIN_ACTIVATION_SPEED_MPS / 2.0;
    let t = train(&f, TrainType::Player, CROSSING_M - 200.0, slow);
    assert!(!closed(&mut f, &t));

    let t = train(&f, TrainType::Player, CROSSING_M - 120.0, slow);
    assert!(closed(&mut f, &t));
}

#[test]
fn stopped_train_opens_crossing_with_hysteresis() {
    let mut f = fixture();
    let open_at = MINIMUM_M - STOPPED_HYSTERESIS_M;

    let t = train(&f, TrainType::Player, CROSSING_M - open_at + 5.0, 0.0);
    assert!(closed(&mut f, &t));

    let t = train(&f, TrainType::Player, CROSSING_M - open_at - 5.0, 0.0);
    assert!(!closed(&mut f, &t));
}

#[test]
fn ai_train_sounds_horn_once() {
    let mut f = fixture();
    let mut t = train(&f, TrainType::Ai, CROSSING_M - 100.0, 10.0);
    let horns = f.crossings.update(std::slice::from_ref(&t));
    assert!(horns.is_empty());

    t.move_by(30.0);
    let horns = f.crossings.update(std::slice::from_ref(&t));
    assert_eq!(horns.len(), 1);
    assert_eq!(horns[0].crossing, f.line.crossing);
    assert!((horns[0].distance_m - 70.0).abs() < 0.1);

    t.move_by(5.0);
    assert!(f.crossings.update(std::slice::from_ref(&t)).is_empty());
}

#[test]
fn forgotten_train_releases_crossing() {
    let mut f = fixture();
    let t = train(&f, TrainType::Player, CROSSING_M - 100.0, 10.0);
    assert!(closed(&mut f, &t));
    f.crossings.forget_train(t.number);
    assert!(!f.crossings.has_train(f.group));
}
