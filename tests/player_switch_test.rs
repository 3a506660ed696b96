mod common;

use rail_sim::simulation::{ControlMode, SimEvent, SwitchMode, Train, TrainType};

use common::{consist, player_at, run, simulator, wagons};

#[test]
fn keep_hands_old_train_to_ai() {
    let (mut sim, _) = simulator(player_at(100.0, 0.0));
    let old = sim.player.unwrap();
    let target = sim
        .add_train(consist("Shunter", TrainType::Static, 700.0, wagons("3", 1, 15.0), 0.0))
        .unwrap()
        .unwrap();

    assert!(sim.start_player_switch(target, SwitchMode::Keep));
    run(&mut sim, 1, 0.1);

    assert_eq!(sim.player, Some(target));
    let new_train = sim.train(target).unwrap();
    assert_eq!(new_train.train_type, TrainType::Player);
    assert_eq!(new_train.control_mode, ControlMode::Manual);
    let old_train = sim.train(old).unwrap();
    assert_eq!(old_train.train_type, TrainType::Ai);
    assert_eq!(old_train.control_mode, ControlMode::AutoSignal);
    assert!(sim.ai.contains(old));
    assert!(sim.drain_events().contains(&SimEvent::PlayerChanged {
        from: Some(old),
        to: target
    }));
}

#[test]
fn return_to_static_needs_a_stopped_train() {
    let (mut sim, _) = simulator(player_at(100.0, 5.0));
    let target = sim
        .add_train(consist("Shunter", TrainType::Static, 700.0, wagons("3", 1, 15.0), 0.0))
        .unwrap()
        .unwrap();

    assert!(!sim.start_player_switch(target, SwitchMode::ReturnToStatic));
    assert!(sim.confirmer.contains("To return to static train speed must be = 0"));
    assert!(!sim.start_player_switch(target, SwitchMode::Suspend));
    assert!(sim.confirmer.contains("Train can't be suspended with speed not equal 0"));

    sim.train_mut(sim.player.unwrap()).unwrap().speed_mps = 0.0;
    assert!(sim.start_player_switch(target, SwitchMode::ReturnToStatic));
    let old = sim.player.unwrap();
    run(&mut sim, 1, 0.1);
    assert_eq!(sim.train(old).unwrap().train_type, TrainType::Static);
    assert_eq!(sim.player, Some(target));
}

#[test]
fn switch_waits_for_locomotive_to_load() {
    let (sim, _) = simulator(player_at(100.0, 0.0));
    let loaded = std::rc::Rc::new(std::cell::Cell::new(false));
    let flag = std::rc::Rc::clone(&loaded);
    let mut sim = sim.with_loco_loaded(Box::new(move |_: &Train| flag.get()));
    let old = sim.player.unwrap();
    let target = sim
        .add_train(consist("Shunter", TrainType::Static, 700.0, wagons("3", 1, 15.0), 0.0))
        .unwrap()
        .unwrap();

    assert!(sim.start_player_switch(target, SwitchMode::Suspend));
    run(&mut sim, 5, 0.1);
    assert_eq!(sim.player, Some(old));

    loaded.set(true);
    run(&mut sim, 1, 0.1);
    assert_eq!(sim.player, Some(target));
    assert_eq!(sim.train(old).unwrap().train_type, TrainType::AiNotStarted);
    assert_eq!(sim.train(old).unwrap().control_mode, ControlMode::Inactive);
}

#[test]
fn switching_to_unknown_train_is_refused() {
    let (mut sim, _) = simulator(player_at(100.0, 0.0));
    assert!(!sim.start_player_switch(rail_sim::simulation::TrainId(99), SwitchMode::Keep));
}
