mod common;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use rail_sim::simulation::{Season, Simulator, TrainType, Weather};

use common::{consist, player_at, run, simulator, stop_activity, wagons};

fn world() -> Simulator {
    let (mut sim, line) = simulator(player_at(400.0, 0.0));
    sim.add_train(consist("Rake", TrainType::Static, 800.0, wagons("12", 2, 10.0), 0.0))
        .unwrap();
    sim.load_activity(&stop_activity(&line, 2, 0.0, 120.0));
    sim
}

fn save_to(sim: &Simulator, path: &Path) {
    let mut out = BufWriter::new(File::create(path).unwrap());
    sim.save(&mut out).unwrap();
    out.flush().unwrap();
}

fn restore_from(sim: &mut Simulator, path: &Path) -> anyhow::Result<()> {
    let mut input = BufReader::new(File::open(path).unwrap());
    sim.restore(&mut input)
}

#[test]
fn restored_world_matches_saved_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eastfield.save");

    let mut before = world();
    before.season = Season::Autumn;
    before.weather = Weather::Rain;
    run(&mut before, 50, 0.1);
    save_to(&before, &path);

    let mut restored = world();
    restore_from(&mut restored, &path).unwrap();

    assert_eq!(restored.clock_time_s, before.clock_time_s);
    assert_eq!(restored.season, Season::Autumn);
    assert_eq!(restored.weather, Weather::Rain);
    assert_eq!(restored.player, before.player);
    assert_eq!(restored.trains.len(), 2);
    for (a, b) in before.trains.iter().zip(&restored.trains) {
        assert_eq!(a.number, b.number);
        assert_eq!(a.name, b.name);
        assert_eq!(a.train_type, b.train_type);
        let ids = |t: &rail_sim::simulation::Train| t.cars.iter().map(|c| c.car_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(a), ids(b));
        assert!((a.front.track_node_offset() - b.front.track_node_offset()).abs() < 1e-3);
        assert!((a.rear.track_node_offset() - b.rear.track_node_offset()).abs() < 1e-3);
    }

    let saved = before.activity.as_ref().unwrap();
    let loaded = restored.activity.as_ref().unwrap();
    assert_eq!(loaded.current, saved.current);
    let (a, b) = (saved.tasks[0].passenger_stop_state(), loaded.tasks[0].passenger_stop_state());
    assert!(b.arrived);
    assert_eq!(a.boarding_end_s, b.boarding_end_s);
    assert!((a.act_arrive_s.unwrap() - b.act_arrive_s.unwrap()).abs() < 1e-6);

    // Both worlds carry on the same way.
    run(&mut before, 1200, 0.1);
    run(&mut restored, 1200, 0.1);
    let a = before.activity.as_ref().unwrap().tasks[0].passenger_stop_state().may_depart;
    let b = restored.activity.as_ref().unwrap().tasks[0].passenger_stop_state().may_depart;
    assert!(a && b);
}

#[test]
fn foreign_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.save");
    std::fs::write(&path, b"this is not a save file").unwrap();

    let mut sim = world();
    assert!(restore_from(&mut sim, &path).is_err());
}

#[test]
fn activity_save_needs_activity_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("activity.save");
    save_to(&world(), &path);

    let (mut bare, _) = simulator(player_at(400.0, 0.0));
    let err = restore_from(&mut bare, &path).unwrap_err();
    assert!(format!("{:#}", err).contains("none is loaded"));
}

#[test]
fn new_trains_after_restore_get_fresh_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("numbers.save");
    save_to(&world(), &path);

    let (mut sim, line) = simulator(player_at(400.0, 0.0));
    sim.load_activity(&stop_activity(&line, 2, 0.0, 120.0));
    restore_from(&mut sim, &path).unwrap();
    let id = sim
        .add_train(consist("Late", TrainType::Static, 150.0, wagons("9", 1, 10.0), 0.0))
        .unwrap()
        .unwrap();
    assert_eq!(id.0, 2);
}
