mod common;

use rail_sim::simulation::{SimEvent, TrainId, TrainType, OVERSPEED_COUPLING_MPS};

use common::{consist, player_at, run, simulator, wagons};

fn car_ids(sim: &rail_sim::simulation::Simulator, id: TrainId) -> Vec<String> {
    sim.train(id).unwrap().cars.iter().map(|c| c.car_id.clone()).collect()
}

#[test]
fn player_runs_into_static_rake_and_couples() {
    let (mut sim, _) = simulator(player_at(100.0, 1.0));
    let rake = sim
        .add_train(consist("Rake", TrainType::Static, 160.0, wagons("12", 2, 10.0), 0.0))
        .unwrap()
        .unwrap();

    run(&mut sim, 500, 0.1);

    assert_eq!(sim.trains.len(), 1);
    assert!(sim.train(rake).is_none());
    let player = sim.player.unwrap();
    assert_eq!(car_ids(&sim, player), vec!["12 - 1", "12 - 2", "0 - 1", "0 - 2"]);
    let train = sim.player_train().unwrap();
    assert_eq!(train.lead_locomotive_index, Some(2));
    assert_eq!(train.train_type, TrainType::Player);
    assert!(train.speed_mps > 0.0 && train.speed_mps < 1.0);
    assert_eq!(sim.over_speed_couplings, 0);
    assert!(sim.drain_events().contains(&SimEvent::Coupled {
        survivor: player,
        absorbed: rake,
        over_speed: false,
    }));
}

#[test]
fn hard_coupling_is_counted() {
    let speed = OVERSPEED_COUPLING_MPS * 2.0;
    let (mut sim, _) = simulator(player_at(100.0, speed));
    sim.add_train(consist("Rake", TrainType::Static, 160.0, wagons("12", 2, 10.0), 0.0))
        .unwrap();

    run(&mut sim, 200, 0.1);

    assert_eq!(sim.trains.len(), 1);
    assert_eq!(sim.over_speed_couplings, 1);
    assert!(sim
        .drain_events()
        .iter()
        .any(|e| matches!(e, SimEvent::Coupled { over_speed: true, .. })));
}

#[test]
fn uncoupled_parts_stay_apart_until_separated() {
    let (mut sim, _) = simulator(player_at(300.0, 0.0));
    let player = sim.player.unwrap();

    let detached = sim.uncouple_behind(player, 0, true).unwrap();
    assert_eq!(car_ids(&sim, player), vec!["0 - 1"]);
    assert_eq!(car_ids(&sim, detached), vec!["0 - 2"]);
    assert_eq!(sim.train(detached).unwrap().train_type, TrainType::Static);
    let gap = sim
        .train(player)
        .unwrap()
        .rear
        .world_location()
        .delta_to(&sim.train(detached).unwrap().front.world_location());
    assert!(gap.length() < 0.01);

    // Backing into the part just left behind pushes it along without
    // picking it up or running through it.
    sim.train_mut(player).unwrap().speed_mps = -1.0;
    for _ in 0..100 {
        run(&mut sim, 1, 0.1);
        let rear_z = sim.train(player).unwrap().rear.world_location().location.z;
        let detached_front_z = sim.train(detached).unwrap().front.world_location().location.z;
        assert!(rear_z >= detached_front_z - 0.01, "{} ran into {}", rear_z, detached_front_z);
    }
    assert_eq!(sim.trains.len(), 2);
    assert_eq!(sim.train(player).unwrap().uncoupled_from, Some(detached));
    let rear_z = sim.train(player).unwrap().rear.world_location().location.z;
    assert!(rear_z < 275.0, "{}", rear_z);
    let pushed = sim.train(detached).unwrap();
    assert!(pushed.speed_mps < 0.0);
    assert!(pushed.front.world_location().location.z < 275.0);

    sim.train_mut(detached).unwrap().speed_mps = 0.0;
    sim.train_mut(player).unwrap().speed_mps = 1.0;
    run(&mut sim, 30, 0.1);
    assert_eq!(sim.trains.len(), 2);
    assert_eq!(sim.train(player).unwrap().uncoupled_from, None);

    sim.train_mut(player).unwrap().speed_mps = -1.0;
    run(&mut sim, 60, 0.1);
    assert_eq!(sim.trains.len(), 1);
    assert_eq!(car_ids(&sim, player), vec!["0 - 1", "0 - 2"]);
}

#[test]
fn standing_player_does_not_couple_to_touching_rake() {
    let (mut sim, _) = simulator(player_at(300.0, 0.0));
    // 20 m rake whose rear overlaps the player's front by 0.2 m.
    let rake = sim
        .add_train(consist("Rake", TrainType::Static, 319.8, wagons("12", 2, 10.0), 0.0))
        .unwrap()
        .unwrap();

    run(&mut sim, 10, 0.1);

    assert_eq!(sim.trains.len(), 2);
    assert!(sim.train(rake).is_some());
    assert_eq!(car_ids(&sim, sim.player.unwrap()), vec!["0 - 1", "0 - 2"]);
    assert!(!sim.drain_events().iter().any(|e| matches!(e, SimEvent::Coupled { .. })));
}

#[test]
fn uncoupling_behind_last_car_is_refused() {
    let (mut sim, _) = simulator(player_at(300.0, 0.0));
    let player = sim.player.unwrap();
    assert!(sim.uncouple_behind(player, 1, true).is_err());
    assert!(sim.uncouple_behind(TrainId(42), 0, true).is_err());
    assert_eq!(sim.trains.len(), 1);
}

#[test]
fn missing_wagons_are_skipped_but_missing_player_loco_is_fatal() {
    use rail_sim::simulation::WagonRef;

    let (mut sim, _) = simulator(player_at(300.0, 0.0));
    let mut rake = wagons("5", 2, 12.0);
    rake.insert(1, WagonRef::missing("lost.wag"));
    let id = sim
        .add_train(consist("Rake", TrainType::Static, 600.0, rake, 0.0))
        .unwrap()
        .unwrap();
    assert_eq!(car_ids(&sim, id), vec!["5 - 1", "5 - 2"]);

    let empty = sim
        .add_train(consist("Ghost", TrainType::Static, 800.0, vec![WagonRef::missing("a.wag")], 0.0))
        .unwrap();
    assert!(empty.is_none());

    let mut broken = player_at(100.0, 0.0);
    broken.wagons[0] = WagonRef::missing("class66.eng");
    let (db, _) = common::straight_line();
    let result = rail_sim::simulation::Simulator::new(
        db,
        Default::default(),
        rail_sim::simulation::SimContext::new_with_seed(1),
        broken,
    );
    assert!(result.is_err());
}
