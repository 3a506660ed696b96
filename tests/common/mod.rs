#![allow(dead_code)]

use rail_sim::simulation::{
    ActivityDef, ServiceStop, SimContext, SimSettings, Simulator, TrItemId, TrackDb, TrackDbBuilder, TrackItemKind,
    TrackShape, TrainCar, TrainSetup, TrainType, TravellerDirection, VectorEnd, WagonRef, WorldLocation,
};

pub const LINE_LENGTH_M: f32 = 1000.0;
pub const PLATFORM_START_M: f32 = 300.0;
pub const PLATFORM_END_M: f32 = 480.0;
pub const CROSSING_M: f32 = 600.0;
pub const STATION: &str = "Eastfield";

/// Item ids placed on the test line.
pub struct Line {
    pub node: usize,
    pub platform: TrItemId,
    pub crossing: TrItemId,
    pub crossing_road: TrItemId,
}

/// A kilometre of straight track running north from the origin, buffered at
/// both ends, with a platform pair and a level crossing on it.
pub fn straight_line() -> (TrackDb, Line) {
    let mut b = TrackDbBuilder::new();
    let origin = WorldLocation::new(0, 0, 0.0, 0.0, 0.0);
    let node = b.add_vector_node(
        origin,
        0.0,
        &[
            TrackShape::Straight { length_m: 500.0 },
            TrackShape::Straight { length_m: 500.0 },
        ],
    );
    let (far, _) = b.end_of(node, VectorEnd::End).unwrap();
    let start_buffer = b.add_end_node(origin);
    let end_buffer = b.add_end_node(far);
    b.link_vector(node, VectorEnd::Start, start_buffer, 0).unwrap();
    b.link_vector(node, VectorEnd::End, end_buffer, 0).unwrap();

    let platform_kind = || TrackItemKind::Platform {
        station: STATION.to_string(),
        min_waiting_s: 30.0,
        linked: TrItemId(0),
    };
    let platform = b.add_item(node, PLATFORM_START_M, "Eastfield 1", platform_kind()).unwrap();
    let platform_end = b.add_item(node, PLATFORM_END_M, "Eastfield 1", platform_kind()).unwrap();
    b.pair_items(platform, platform_end).unwrap();

    let crossing = b.add_item(node, CROSSING_M, "Mill Lane", TrackItemKind::LevelCrossing).unwrap();
    let crossing_road = b.add_road_item(at(CROSSING_M), "Mill Lane road", TrackItemKind::LevelCrossing);

    (
        b.build(),
        Line {
            node,
            platform,
            crossing,
            crossing_road,
        },
    )
}

/// The point `offset_m` metres up the test line.
pub fn at(offset_m: f32) -> WorldLocation {
    WorldLocation::new(0, 0, 0.0, 0.0, offset_m)
}

pub fn wagons(prefix: &str, count: usize, length_m: f32) -> Vec<WagonRef> {
    (1..=count)
        .map(|i| {
            WagonRef::loaded(
                "wagon.wag",
                TrainCar::new(format!("{} - {}", prefix, i), length_m, 30_000.0),
            )
        })
        .collect()
}

pub fn consist(name: &str, train_type: TrainType, front_m: f32, wagons: Vec<WagonRef>, speed_mps: f32) -> TrainSetup {
    TrainSetup {
        name: name.to_string(),
        train_type,
        location: at(front_m),
        direction: TravellerDirection::Forward,
        wagons,
        speed_mps,
    }
}

/// A 40 m player train: locomotive and one coach.
pub fn player_at(front_m: f32, speed_mps: f32) -> TrainSetup {
    let cars = vec![
        WagonRef::loaded("class66.eng", TrainCar::locomotive("0 - 1", 20.0, 120_000.0)),
        WagonRef::loaded("coach.wag", TrainCar::new("0 - 2", 20.0, 40_000.0)),
    ];
    consist("Player", TrainType::Player, front_m, cars, speed_mps)
}

pub fn simulator(player: TrainSetup) -> (Simulator, Line) {
    let (db, line) = straight_line();
    let sim = Simulator::new(db, SimSettings::default(), SimContext::new_with_seed(7), player).unwrap();
    (sim, line)
}

/// `stops` calls at the Eastfield platform, ten minutes apart. The first
/// arrives `arrive_after_s` and departs `depart_after_s` after an 08:00 start.
pub fn stop_activity(line: &Line, stops: usize, arrive_after_s: f64, depart_after_s: f64) -> ActivityDef {
    let start = 8.0 * 3600.0;
    ActivityDef {
        start_time_s: start,
        player_service: (0..stops)
            .map(|i| ServiceStop {
                platform_start_id: line.platform,
                arrival_s: start + arrive_after_s + i as f64 * 600.0,
                depart_s: start + depart_after_s + i as f64 * 600.0,
            })
            .collect(),
        events: Vec::new(),
    }
}

pub fn run(sim: &mut Simulator, ticks: u32, delta_s: f64) {
    for _ in 0..ticks {
        sim.update(delta_s).unwrap();
    }
}
