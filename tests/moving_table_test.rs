mod common;

use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use rail_sim::simulation::{
    ConfirmLevel, Confirmer, ControlMode, MovingTable, OutOfControlReason, SimContext, TableEnd, Train, TrainCar,
    TrainId, TrainOnTable, Transfertable, Traveller, Turntable, WorldPosition,
};

use common::{at, straight_line};

fn turntable(centre: Vec3, ends: Vec<TableEnd>) -> Turntable {
    Turntable::new(
        "Shed turntable",
        WorldPosition::new(0, 0, Mat4::from_translation(centre)),
        Vec3::ZERO,
        24.0,
        ends,
    )
}

fn two_roads() -> Vec<TableEnd> {
    vec![TableEnd::new(0.0, 1, 0, true), TableEnd::new(FRAC_PI_2, 2, 0, true)]
}

fn boarded(id: u32) -> TrainOnTable {
    TrainOnTable {
        train: TrainId(id),
        front_on_board: true,
        back_on_board: true,
    }
}

fn quiet() -> (Confirmer, SimContext) {
    (Confirmer::new(3.0, ConfirmLevel::None), SimContext::new_with_seed(3))
}

#[test]
fn two_trains_on_board_keep_table_still() {
    let (mut confirmer, ctx) = quiet();
    let mut table = turntable(Vec3::ZERO, two_roads());
    table.common.trains_on_table = vec![boarded(1), boarded(2)];

    table.start_continuous(true, &mut [], &mut confirmer, &ctx);
    assert!(!table.common.continuous);
    assert!(!table.clockwise && !table.counterclockwise);
    assert!(confirmer.contains("Train partially on turntable, can't rotate"));

    table.animate(1.0, 0.1, &mut []).unwrap();
    assert_eq!(table.y_angle, 0.0);
}

#[test]
fn half_boarded_train_keeps_table_still() {
    let (mut confirmer, ctx) = quiet();
    let mut table = turntable(Vec3::ZERO, two_roads());
    let mut half = boarded(1);
    half.back_on_board = false;
    table.common.trains_on_table = vec![half];

    table.start_continuous(false, &mut [], &mut confirmer, &ctx);
    assert!(!table.common.continuous);
    assert!(!table.counterclockwise);
}

#[test]
fn moving_train_on_board_refuses_rotation() {
    let (db, _) = straight_line();
    let db = Arc::new(db);
    let front = Traveller::from_location(&db, &at(100.0)).unwrap();
    let mut train = Train::new(
        TrainId(4),
        "Light engine",
        rail_sim::simulation::TrainType::Player,
        front,
        vec![TrainCar::locomotive("4 - 1", 18.0, 90_000.0)],
    );
    train.speed_mps = 2.0;

    let (mut confirmer, ctx) = quiet();
    let mut table = turntable(Vec3::ZERO, two_roads());
    table.common.trains_on_table = vec![boarded(4)];
    table.start_continuous(true, std::slice::from_mut(&mut train), &mut confirmer, &ctx);

    assert!(!table.common.continuous);
    assert!(confirmer.contains("Rotation can't start"));
    assert_eq!(train.control_mode, ControlMode::Manual);
}

#[test]
fn released_table_stops_at_next_road() {
    let (mut confirmer, ctx) = quiet();
    let mut table = MovingTable::Turntable(turntable(Vec3::ZERO, two_roads()));
    table.start_continuous(true, &mut [], &mut confirmer, &ctx);

    for _ in 0..15 {
        let connected = table.advance(1.0, 0.1, 1.0, &mut [], &mut confirmer, &ctx).unwrap();
        assert_eq!(connected, None);
    }
    table.compute_target(true);

    let mut connected = None;
    for _ in 0..5 {
        if let Some(end) = table.advance(1.0, 0.1, 1.0, &mut [], &mut confirmer, &ctx).unwrap() {
            connected = Some(end);
            break;
        }
    }
    assert_eq!(connected, Some(1));
    let MovingTable::Turntable(t) = &table else {
        unreachable!()
    };
    assert!(t.forward_connected);
    assert!((t.y_angle + FRAC_PI_2).abs() < 1e-4);
    assert!(!t.clockwise);
    assert_eq!(t.common.connected_track_end, Some(1));
    assert!(confirmer.contains("Turntable forward connected"));
}

/// Three roads 6 m apart, with the bridge lined up on the first.
fn traverser() -> MovingTable {
    let ends = vec![
        TableEnd::new(0.0, 1, 0, true),
        TableEnd::new(6.0, 2, 0, true),
        TableEnd::new(12.0, 3, 0, true),
    ];
    MovingTable::Transfertable(Transfertable::new(
        "Works traverser",
        WorldPosition::default(),
        Vec3::ZERO,
        30.0,
        false,
        ends,
    ))
}

fn bridge(table: &MovingTable) -> &Transfertable {
    let MovingTable::Transfertable(t) = table else {
        unreachable!()
    };
    t
}

#[test]
fn transfertable_slides_to_next_road_and_back() {
    let (mut confirmer, ctx) = quiet();
    let mut table = traverser();
    assert_eq!(bridge(&table).span(), 12.0);

    table.start_continuous(true, &mut [], &mut confirmer, &ctx);
    for _ in 0..10 {
        let connected = table.advance(1.0, 0.1, 0.5, &mut [], &mut confirmer, &ctx).unwrap();
        assert_eq!(connected, None);
        assert!(!bridge(&table).connected);
    }
    assert!((bridge(&table).offset_pos - 5.0).abs() < 1e-4);

    table.compute_target(true);
    assert_eq!(bridge(&table).connected_target, Some(1));
    let mut connected = None;
    for _ in 0..5 {
        if let Some(end) = table.advance(1.0, 0.1, 0.5, &mut [], &mut confirmer, &ctx).unwrap() {
            connected = Some(end);
            break;
        }
    }
    assert_eq!(connected, Some(1));
    let t = bridge(&table);
    assert!(t.connected);
    assert!(!t.forward && !t.reverse);
    assert!((t.offset_pos - 6.0).abs() < 1e-4);
    assert!((t.common.animation.w_axis.x - 6.0).abs() < 1e-4);
    assert_eq!(t.common.connected_track_end, Some(1));
    assert!(confirmer.contains("Transfertable connected"));

    // Released with no road close enough ahead, it stops where it is.
    table.start_continuous(false, &mut [], &mut confirmer, &ctx);
    for _ in 0..5 {
        table.advance(1.0, 0.1, 0.5, &mut [], &mut confirmer, &ctx).unwrap();
    }
    table.compute_target(false);
    table.advance(1.0, 0.1, 0.5, &mut [], &mut confirmer, &ctx).unwrap();
    let t = bridge(&table);
    assert_eq!(t.connected_target, None);
    assert!(!t.forward && !t.reverse && !t.connected);
    assert!((t.offset_pos - 3.5).abs() < 1e-4);

    table.start_continuous(false, &mut [], &mut confirmer, &ctx);
    for _ in 0..5 {
        table.advance(1.0, 0.1, 0.5, &mut [], &mut confirmer, &ctx).unwrap();
    }
    table.compute_target(false);
    let mut connected = None;
    for _ in 0..5 {
        if let Some(end) = table.advance(1.0, 0.1, 0.5, &mut [], &mut confirmer, &ctx).unwrap() {
            connected = Some(end);
            break;
        }
    }
    assert_eq!(connected, Some(0));
    assert!(bridge(&table).offset_pos.abs() < 1e-4);
}

#[test]
fn half_boarded_train_keeps_transfertable_still() {
    let (mut confirmer, ctx) = quiet();
    let mut table = traverser();
    let mut half = boarded(1);
    half.front_on_board = false;
    if let MovingTable::Transfertable(t) = &mut table {
        t.common.trains_on_table = vec![half];
    }

    table.start_continuous(true, &mut [], &mut confirmer, &ctx);
    table.advance(1.0, 0.1, 0.5, &mut [], &mut confirmer, &ctx).unwrap();
    let t = bridge(&table);
    assert!(!t.common.continuous);
    assert_eq!(t.offset_pos, 0.0);
    assert!(confirmer.contains("Train partially on transfertable, can't transfer"));
}

#[test]
fn train_slips_into_table_lined_up_elsewhere() {
    let (db, line) = straight_line();
    let db = Arc::new(db);
    let front = Traveller::from_location(&db, &at(490.0)).unwrap();
    let mut train = Train::new(
        TrainId(5),
        "Light engine",
        rail_sim::simulation::TrainType::Player,
        front,
        vec![TrainCar::locomotive("5 - 1", 18.0, 90_000.0)],
    );
    train.speed_mps = 3.0;

    let (mut confirmer, ctx) = quiet();
    let other_road = line.node + 10;
    let mut table = MovingTable::Turntable(turntable(
        Vec3::new(0.0, 0.0, 500.0),
        vec![TableEnd::new(0.0, other_road, 0, true)],
    ));
    table.check_train_on_table(&mut train, &mut confirmer, &ctx);

    assert_eq!(train.control_mode, ControlMode::OutOfControl);
    assert_eq!(train.out_of_control_reason, OutOfControlReason::SlippedIntoTurntable);
    assert_eq!(train.speed_mps, 0.0);
    assert!(table.is_train_on_board(TrainId(5)));
    assert!(confirmer.contains("Train slipped into non aligned turntable"));
}
