mod common;

use rail_sim::simulation::{
    boarding_time_s, ActionKind, EventCategory, EventDef, Outcomes, SimEvent, TaskColor,
};

use common::{player_at, run, simulator, stop_activity, STATION};

fn event(id: u32, activation_level: i32, category: EventCategory, outcomes: Outcomes) -> EventDef {
    EventDef {
        id,
        name: format!("Event {}", id),
        activation_level,
        reversible: false,
        train_service: String::new(),
        train_starting_time: None,
        outcomes,
        category,
    }
}

#[test]
fn boarding_follows_schedule_and_platform_minimum() {
    assert_eq!(boarding_time_s(300.0, 270.0, 120.0), 270.0);
    assert_eq!(boarding_time_s(300.0, 90.0, 120.0), 120.0);
    assert_eq!(boarding_time_s(300.0, 350.0, 400.0), 350.0);
    // Tight schedule: a late train keeps its planned dwell.
    assert_eq!(boarding_time_s(60.0, 30.0, 120.0), 60.0);
    assert_eq!(boarding_time_s(300.0, 270.0, 400.0), 300.0);
    assert_eq!(boarding_time_s(0.0, 200.0, 60.0), 200.0);
}

#[test]
fn final_stop_completes_when_boarding_ends() {
    let (mut sim, line) = simulator(player_at(400.0, 0.0));
    sim.load_activity(&stop_activity(&line, 1, 0.0, 120.0));
    assert_eq!(sim.clock_time_s, 8.0 * 3600.0);

    run(&mut sim, 1, 0.1);
    let activity = sim.activity.as_ref().unwrap();
    let stop = activity.tasks[0].passenger_stop_state();
    assert!(stop.arrived);
    assert!((stop.boarding_s - 119.9).abs() < 1e-6);
    assert!((stop.boarding_end_s - (8.0 * 3600.0 + 120.0)).abs() < 1e-6);
    assert_eq!(activity.current, Some(0));

    run(&mut sim, 1200, 0.1);
    let activity = sim.activity.as_ref().unwrap();
    assert_eq!(activity.tasks[0].is_completed, Some(true));
    assert_eq!(activity.tasks[0].display_color, TaskColor::LightGreen);
    assert_eq!(activity.current, None);
    assert!(activity.is_finished());
    assert!(sim.drain_events().contains(&SimEvent::PermissionToDepart));
}

#[test]
fn leaving_early_fails_the_stop() {
    let (mut sim, line) = simulator(player_at(400.0, 0.0));
    sim.load_activity(&stop_activity(&line, 2, 0.0, 120.0));
    let log = tempfile::NamedTempFile::new().unwrap();
    sim.activity.as_mut().unwrap().start_station_logging(log.path()).unwrap();

    run(&mut sim, 1, 0.1);
    sim.train_mut(sim.player.unwrap()).unwrap().speed_mps = 5.0;
    run(&mut sim, 1, 0.1);

    let activity = sim.activity.as_ref().unwrap();
    assert_eq!(activity.tasks[0].is_completed, Some(false));
    assert!(activity.tasks[0].passenger_stop_state().departed_before_boarding);
    assert_eq!(activity.departed_before_boarding, vec![STATION.to_string()]);
    assert_eq!(activity.current, Some(1));

    let written = std::fs::read_to_string(log.path()).unwrap();
    let mut lines = written.lines();
    assert_eq!(
        lines.next(),
        Some("STATION,BOOKED ARR,BOOKED DEP,ACTUAL ARR,ACTUAL DEP,DELAY,STATE")
    );
    let row = lines.next().unwrap();
    assert!(row.starts_with("Eastfield,08:00:00,08:02:00,08:00:00,08:00:00,"), "{}", row);
    assert!(row.ends_with(",NotCompleted"), "{}", row);
}

#[test]
fn missed_stop_still_moves_on() {
    let (mut sim, line) = simulator(player_at(900.0, 5.0));
    sim.load_activity(&stop_activity(&line, 2, 0.0, 120.0));

    // Any outcome moves the activity on, a failed stop included. Whether a
    // failure should hold the activity back is left as it always behaved.
    run(&mut sim, 1, 0.1);
    let activity = sim.activity.as_ref().unwrap();
    assert_eq!(activity.tasks[0].is_completed, Some(false));
    assert_eq!(activity.current, Some(1));

    run(&mut sim, 1, 0.1);
    let activity = sim.activity.as_ref().unwrap();
    assert_eq!(activity.tasks[1].is_completed, Some(false));
    assert_eq!(activity.current, None);
    assert!(activity.is_finished());
}

#[test]
fn stop_just_passed_is_not_yet_missed() {
    let (mut sim, line) = simulator(player_at(600.0, 5.0));
    sim.load_activity(&stop_activity(&line, 1, 0.0, 120.0));

    run(&mut sim, 1, 0.1);
    let activity = sim.activity.as_ref().unwrap();
    assert_eq!(activity.tasks[0].is_completed, None);
    assert_eq!(activity.current, Some(0));
}

#[test]
fn time_event_fires_once() {
    let (mut sim, line) = simulator(player_at(100.0, 0.0));
    let mut def = stop_activity(&line, 1, 600.0, 700.0);
    def.events.push(event(
        1,
        1,
        EventCategory::Time { seconds: 30 },
        Outcomes {
            display_message: "Sound the whistle".to_string(),
            ..Default::default()
        },
    ));
    sim.load_activity(&def);

    run(&mut sim, 200, 0.1);
    assert_eq!(sim.activity.as_ref().unwrap().events[0].times_triggered, 0);

    run(&mut sim, 200, 0.1);
    let activity = sim.activity.as_mut().unwrap();
    assert_eq!(activity.events[0].times_triggered, 1);
    assert_eq!(activity.events[0].activation_level, 0);
    assert_eq!(activity.triggered_event, Some(0));
    activity.acknowledge_triggered_event();

    run(&mut sim, 400, 0.1);
    let activity = sim.activity.as_ref().unwrap();
    assert_eq!(activity.events[0].times_triggered, 1);
    assert!(!activity.is_complete);
}

#[test]
fn outcome_activates_follow_on_event() {
    let (mut sim, line) = simulator(player_at(100.0, 12.0));
    let mut def = stop_activity(&line, 1, 600.0, 700.0);
    def.events.push(event(
        1,
        1,
        EventCategory::Action {
            action: ActionKind::ReachSpeed,
            siding: None,
            wagons: Vec::new(),
            speed_mps: 10.0,
        },
        Outcomes {
            activate: vec![2],
            ..Default::default()
        },
    ));
    def.events.push(event(
        2,
        0,
        EventCategory::Time { seconds: 0 },
        Outcomes {
            activity_fail: Some("Too fast".to_string()),
            ..Default::default()
        },
    ));
    sim.load_activity(&def);

    run(&mut sim, 1, 0.1);
    let activity = sim.activity.as_mut().unwrap();
    assert_eq!(activity.triggered_event, Some(0));
    assert_eq!(activity.event_by_id(2).unwrap().activation_level, 1);
    assert!(!activity.is_complete);
    activity.acknowledge_triggered_event();

    run(&mut sim, 1, 0.1);
    let activity = sim.activity.as_ref().unwrap();
    assert!(activity.is_complete);
    assert!(!activity.is_successful);
    assert_eq!(activity.last_triggered_event, Some(1));
}

#[test]
fn success_outcome_ends_activity() {
    let (mut sim, line) = simulator(player_at(100.0, 0.0));
    let mut def = stop_activity(&line, 1, 600.0, 700.0);
    def.events.push(event(
        7,
        1,
        EventCategory::Time { seconds: 5 },
        Outcomes {
            activity_success: true,
            ..Default::default()
        },
    ));
    sim.load_activity(&def);

    run(&mut sim, 100, 0.1);
    let activity = sim.activity.as_ref().unwrap();
    assert!(activity.is_complete);
    assert!(activity.is_successful);
}
