mod simulation;

use anyhow::{Context, Result};
use clap::Parser;
use glam::{Mat4, Vec3};
use log::info;
use std::f32::consts::FRAC_PI_2;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use simulation::{
    ActivityDef, MovingTable, ServiceStop, SimContext, SimSettings, Simulator, TableEnd, TrackDb,
    TrackDbBuilder, TrackItemKind, TrackShape, TrainCar, TrainSetup, TrainType, TravellerDirection, Turntable,
    VectorEnd, WagonRef, WorldLocation, WorldPosition,
};

#[derive(Parser)]
#[command(name = "rail_sim")]
#[command(about = "Headless train and track simulation")]
struct Cli {
    /// Number of simulation ticks to run
    #[arg(long, default_value = "600")]
    ticks: u32,

    /// Time delta per tick in seconds
    #[arg(long, default_value = "0.1")]
    delta: f64,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Clock multiplier
    #[arg(long, default_value = "1.0")]
    game_speed: f32,

    /// Save the world to this file at the end, then restore it
    #[arg(long)]
    save: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run_headless(&cli)
}

/// The demo route and where its interesting bits are.
struct DemoRoute {
    db: TrackDb,
    main_line: usize,
    siding: usize,
    branch_line: usize,
    spur: usize,
    turntable_centre: WorldLocation,
    platform: simulation::TrItemId,
    crossing: (simulation::TrItemId, simulation::TrItemId),
}

/// A main line leading to a junction. Route 0 runs on to a siding with a
/// static consist, route 1 curves off to a turntable with a short spur.
fn build_demo_route() -> Result<DemoRoute> {
    let mut b = TrackDbBuilder::new();
    let origin = WorldLocation::new(0, 0, 0.0, 0.0, 0.0);

    let main_line = b.add_vector_node(
        origin,
        0.0,
        &[
            TrackShape::Straight { length_m: 400.0 },
            TrackShape::Straight { length_m: 400.0 },
        ],
    );
    let (junction_at, yaw) = b.end_of(main_line, VectorEnd::End).context("main line end")?;
    let junction = b.add_junction(junction_at, 2);
    let siding = b.add_vector_node(junction_at, yaw, &[TrackShape::Straight { length_m: 600.0 }]);
    let branch_line = b.add_vector_node(
        junction_at,
        yaw,
        &[
            TrackShape::Curved {
                radius_m: 300.0,
                angle_deg: 20.0,
            },
            TrackShape::Straight { length_m: 100.0 },
        ],
    );
    let (table_entry, spur_yaw) = b.end_of(branch_line, VectorEnd::End).context("branch end")?;

    let start_buffer = b.add_end_node(origin);
    let (siding_end, _) = b.end_of(siding, VectorEnd::End).context("siding end")?;
    let siding_buffer = b.add_end_node(siding_end);
    let branch_buffer = b.add_end_node(table_entry);

    b.link_vector(main_line, VectorEnd::Start, start_buffer, 0)?;
    b.link_vector(main_line, VectorEnd::End, junction, 0)?;
    b.link_vector(siding, VectorEnd::Start, junction, 1)?;
    b.link_vector(branch_line, VectorEnd::Start, junction, 2)?;
    b.link_vector(siding, VectorEnd::End, siding_buffer, 0)?;
    b.link_vector(branch_line, VectorEnd::End, branch_buffer, 0)?;

    // The turntable's second road.
    let radius = 12.0;
    let (sin, cos) = spur_yaw.sin_cos();
    let mut turntable_centre = table_entry;
    turntable_centre.location += Vec3::new(sin * radius, 0.0, cos * radius);
    turntable_centre.normalize();
    let spur_yaw = spur_yaw - FRAC_PI_2;
    let (sin, cos) = spur_yaw.sin_cos();
    let mut spur_start = turntable_centre;
    spur_start.location += Vec3::new(sin * radius, 0.0, cos * radius);
    spur_start.normalize();
    let spur = b.add_vector_node(spur_start, spur_yaw, &[TrackShape::Straight { length_m: 40.0 }]);
    let (spur_end, _) = b.end_of(spur, VectorEnd::End).context("spur end")?;
    let spur_buffer = b.add_end_node(spur_end);
    b.link_vector(spur, VectorEnd::End, spur_buffer, 0)?;

    let crossing = b.add_item(main_line, 600.0, "Mill Lane", TrackItemKind::LevelCrossing)?;
    let crossing_at = b.db().item(crossing).map(|i| i.location).context("crossing item")?;
    let crossing_road = b.add_road_item(crossing_at, "Mill Lane road", TrackItemKind::LevelCrossing);

    let platform_kind = || TrackItemKind::Platform {
        station: "Eastfield".to_string(),
        min_waiting_s: 30.0,
        linked: simulation::TrItemId(0),
    };
    let platform = b.add_item(main_line, 300.0, "Eastfield 1", platform_kind())?;
    let platform_end = b.add_item(main_line, 480.0, "Eastfield 1", platform_kind())?;
    b.pair_items(platform, platform_end)?;

    Ok(DemoRoute {
        db: b.build(),
        main_line,
        siding,
        branch_line,
        spur,
        turntable_centre,
        platform,
        crossing: (crossing, crossing_road),
    })
}

fn run_headless(cli: &Cli) -> Result<()> {
    println!("Running rail simulation in headless mode...");
    println!("Ticks: {}, Delta: {}s", cli.ticks, cli.delta);

    let route = build_demo_route()?;
    let player_at = location_on(&route.db, route.main_line, 100.0)?;
    let static_at = location_on(&route.db, route.siding, 200.0)?;

    let settings = SimSettings {
        game_speed: cli.game_speed,
        ..SimSettings::default()
    };
    let ctx = match cli.seed {
        Some(seed) => SimContext::new_with_seed(seed),
        None => SimContext::new(),
    };
    let player = TrainSetup {
        name: "Eastbound local".to_string(),
        train_type: TrainType::Player,
        location: player_at,
        direction: TravellerDirection::Forward,
        wagons: vec![
            WagonRef::loaded("class66.eng", TrainCar::locomotive("0 - 1", 21.0, 126_000.0)),
            WagonRef::loaded("coach.wag", TrainCar::new("0 - 2", 20.0, 35_000.0)),
            WagonRef::missing("lost_coach.wag"),
        ],
        speed_mps: 8.0,
    };

    let mut sim = Simulator::new(route.db, settings, ctx, player)?;
    sim.add_train(TrainSetup {
        name: "Ballast rake".to_string(),
        train_type: TrainType::Static,
        location: static_at,
        direction: TravellerDirection::Forward,
        wagons: vec![
            WagonRef::loaded("hopper.wag", TrainCar::new("12 - 1", 12.0, 20_000.0)),
            WagonRef::loaded("hopper.wag", TrainCar::new("12 - 2", 12.0, 20_000.0)),
        ],
        speed_mps: 0.0,
    })?;

    sim.level_crossings
        .create_level_crossing("Mill Lane", &[route.crossing.0], &[route.crossing.1], 30.0, 60.0)?;

    let branch_last = 1;
    let table = Turntable::new(
        "Eastfield turntable",
        WorldPosition::new(
            route.turntable_centre.tile_x,
            route.turntable_centre.tile_z,
            Mat4::from_translation(route.turntable_centre.location),
        ),
        Vec3::ZERO,
        24.0,
        vec![
            TableEnd::new(0.0, route.branch_line, branch_last, false),
            TableEnd::new(FRAC_PI_2, route.spur, 0, true),
        ],
    );
    let table = sim.add_moving_table(MovingTable::Turntable(table));

    sim.load_activity(&ActivityDef {
        start_time_s: 8.0 * 3600.0,
        player_service: vec![ServiceStop {
            platform_start_id: route.platform,
            arrival_s: 8.0 * 3600.0 + 60.0,
            depart_s: 8.0 * 3600.0 + 120.0,
        }],
        events: Vec::new(),
    });

    let ticks_per_report = ((1.0 / cli.delta).ceil() as u32).max(1) * 10;
    sim.start_moving_table(table, true)?;
    for tick in 1..=cli.ticks {
        sim.update(cli.delta)?;
        if tick == 20 {
            sim.release_moving_table(table, true)?;
        }
        for event in sim.drain_events() {
            info!("Event: {:?}", event);
        }
        for message in sim.confirmer.drain() {
            println!("  [{:?}] {}", message.level, message.text);
        }
        if tick % ticks_per_report == 0 {
            print_summary(&sim, tick);
        }
    }

    if let Some(path) = &cli.save {
        {
            let file = File::create(path).with_context(|| format!("Creating {}", path.display()))?;
            let mut out = BufWriter::new(file);
            sim.save(&mut out)?;
            out.flush()?;
        }
        let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
        sim.restore(&mut BufReader::new(file))?;
        info!("Save round trip through {} complete", path.display());
    }

    println!("=== Final State ===");
    print_summary(&sim, cli.ticks);
    info!("SIMULATION COMPLETE");
    println!("SIMULATION COMPLETE");
    Ok(())
}

fn location_on(db: &TrackDb, node: usize, offset_m: f32) -> Result<WorldLocation> {
    let section = db
        .vector_section(node, 0)
        .with_context(|| format!("Track node {} has no sections", node))?;
    let shape = db
        .section(section.section_index)
        .with_context(|| format!("Track section {} missing", section.section_index))?;
    let (mut loc, _) = section.point_at(shape, offset_m.min(shape.length_m()));
    loc.normalize();
    Ok(loc)
}

fn print_summary(sim: &Simulator, tick: u32) {
    println!("--- After tick {} (clock {:.1}s) ---", tick, sim.clock_time_s);
    for train in &sim.trains {
        let at = train.front.world_location();
        println!(
            "  Train {} {:<16} {:?} cars={} speed={:.1} m/s front=({:.1}, {:.1})",
            train.number,
            train.name,
            train.train_type,
            train.cars.len(),
            train.speed_mps,
            at.location.x,
            at.location.z
        );
    }
    if let Some(task) = sim.activity.as_ref().and_then(|a| a.tasks.first()) {
        println!("  First stop completed: {:?}", task.is_completed);
    }
    println!("  Over-speed couplings: {}", sim.over_speed_couplings);
}
