//! End-to-end pipeline scenarios against the in-process API: real
//! conductors, real blocking reads, real threads.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use railyard::constants::{END, GRAND_CENTRAL_ID, NEW_HEAD};
use railyard::{
    Event, EventSystem, FlowMode, Modify, Priority, RestoreMode, SelectMode, StationConfig,
    SystemConfig, TransportError, WaitMode,
};

fn system_with(num_events: usize) -> Arc<EventSystem> {
    EventSystem::new(SystemConfig {
        num_events,
        event_size: 64,
        ..SystemConfig::default()
    })
    .expect("system start")
}

fn parallel_config(select_mode: SelectMode) -> StationConfig {
    StationConfig {
        flow_mode: FlowMode::Parallel,
        select_mode,
        ..StationConfig::default()
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let begin = Instant::now();
    while begin.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

const PATIENCE: Duration = Duration::from_secs(3);

#[test]
fn test_events_cycle_back_to_grand_central() {
    let system = system_with(10);
    let station = system
        .create_station("worker", StationConfig::default(), END, END)
        .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let consumer = system.attach(station, "localhost", -1).unwrap();

    let mut fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 4, 64, 0)
        .unwrap();
    assert_eq!(fresh.len(), 4);
    for (i, ev) in fresh.iter_mut().enumerate() {
        ev.buffer_mut()[0] = i as u8;
        ev.set_length(1).unwrap();
    }
    system.put_events(&producer, fresh).unwrap();

    let seen = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(2)),
            Modify::None,
            4,
        )
        .unwrap();
    assert_eq!(seen.len(), 4);
    let mut first_bytes: Vec<u8> = seen.iter().map(|ev| ev.payload()[0]).collect();
    first_bytes.sort_unstable();
    assert_eq!(first_bytes, vec![0, 1, 2, 3]);
    system.put_events(&consumer, seen).unwrap();

    // the ring wraps: everything drains back into the free pool
    assert!(wait_until(PATIENCE, || system.grand_central().input.len() == 10));
    system.close();
}

#[test]
fn test_conservation_across_stations_and_holders() {
    let system = system_with(12);
    let station = system
        .create_station("hold", StationConfig::default(), END, END)
        .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let consumer = system.attach(station, "localhost", -1).unwrap();

    let fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 5, 64, 0)
        .unwrap();
    system.put_events(&producer, fresh).unwrap();
    let held = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(2)),
            Modify::HeaderAndData,
            3,
        )
        .unwrap();

    assert!(wait_until(PATIENCE, || {
        let in_lists: usize = system
            .stations()
            .iter()
            .map(|s| s.input.len() + s.output.len())
            .sum();
        in_lists + held.len() == 12
    }));
    system.dump_events(&consumer, held).unwrap();
    assert!(wait_until(PATIENCE, || system.grand_central().input.len() == 12));
    system.close();
}

#[test]
fn test_round_robin_group_distribution() {
    let system = system_with(16);
    let head = system
        .create_station("rr1", parallel_config(SelectMode::RoundRobin), END, NEW_HEAD)
        .unwrap();
    let (pos, _) = system.station_position(head).unwrap();
    let second = system
        .create_station("rr2", parallel_config(SelectMode::RoundRobin), pos, END)
        .unwrap();
    let third = system
        .create_station("rr3", parallel_config(SelectMode::RoundRobin), pos, END)
        .unwrap();

    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 7, 64, 0)
        .unwrap();
    system.put_events(&producer, fresh).unwrap();

    let s1 = system.station_by_id(head).unwrap();
    let s2 = system.station_by_id(second).unwrap();
    let s3 = system.station_by_id(third).unwrap();
    assert!(wait_until(PATIENCE, || {
        s1.input.len() + s2.input.len() + s3.input.len() == 7
    }));
    assert_eq!(
        (s1.input.len(), s2.input.len(), s3.input.len()),
        (3, 2, 2),
        "seven events over three members, head first"
    );
    system.close();
}

#[test]
fn test_equal_cue_balances_toward_the_shortest_list() {
    let system = system_with(16);
    let head = system
        .create_station("eq1", parallel_config(SelectMode::EqualCue), END, NEW_HEAD)
        .unwrap();
    let (pos, _) = system.station_position(head).unwrap();
    let second = system
        .create_station("eq2", parallel_config(SelectMode::EqualCue), pos, END)
        .unwrap();

    let s1 = system.station_by_id(head).unwrap();
    let s2 = system.station_by_id(second).unwrap();
    // member one starts five events deep
    let preload: Vec<Event> = (100..105).map(|i| Event::new(i, 64, 1)).collect();
    s1.input.put_all(preload);

    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 6, 64, 0)
        .unwrap();
    system.put_events(&producer, fresh).unwrap();

    assert!(wait_until(PATIENCE, || {
        s1.input.len() + s2.input.len() == 11
    }));
    let (a, b) = (s1.input.len(), s2.input.len());
    assert!(a.abs_diff(b) <= 1, "lists end at {a} and {b}");
    system.close();
}

#[test]
fn test_wake_up_all_releases_sleeping_reader() {
    let system = system_with(8);
    let station = system
        .create_station("idle", StationConfig::default(), END, END)
        .unwrap();
    let consumer = system.attach(station, "localhost", -1).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let reader_system = system.clone();
    let reader_att = consumer.clone();
    let reader = thread::spawn(move || {
        let result = reader_system.get_events(&reader_att, WaitMode::Sleep, Modify::None, 1);
        let _ = tx.send(result);
    });
    let target = system.station_by_id(station).unwrap();
    assert!(wait_until(PATIENCE, || target.input.waiting_count() == 1));

    // the wakeup is cooperative: re-issue it until the reader reports back
    let begin = Instant::now();
    let result = loop {
        system.wake_up_all(station).unwrap();
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(result) => break result,
            Err(_) => assert!(begin.elapsed() < PATIENCE, "reader never woke"),
        }
    };
    reader.join().expect("reader panicked");
    assert!(matches!(result, Err(TransportError::WakeUp(_))));
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert!(!target.input.wake_all_pending());
    system.close();
}

#[test]
fn test_timed_get_times_out_on_quiet_station() {
    let system = system_with(8);
    let station = system
        .create_station("quiet", StationConfig::default(), END, END)
        .unwrap();
    let consumer = system.attach(station, "localhost", -1).unwrap();

    let begin = Instant::now();
    let result = system.get_events(
        &consumer,
        WaitMode::Timed(Duration::from_micros(200_000)),
        Modify::None,
        1,
    );
    let elapsed = begin.elapsed();
    assert!(matches!(result, Err(TransportError::Timeout)));
    assert!(elapsed >= Duration::from_millis(190), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "returned after {elapsed:?}");
    system.close();
}

#[test]
fn test_restore_to_grand_central_returns_held_events() {
    let system = system_with(10);
    let station = system
        .create_station(
            "fragile",
            StationConfig {
                restore_mode: RestoreMode::ToGrandCentral,
                ..StationConfig::default()
            },
            END,
            END,
        )
        .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let consumer = system.attach(station, "localhost", -1).unwrap();

    let fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 4, 64, 0)
        .unwrap();
    system.put_events(&producer, fresh).unwrap();
    let held = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(2)),
            Modify::HeaderAndData,
            4,
        )
        .unwrap();
    assert_eq!(held.len(), 4);
    let gc_before = system.grand_central().input.len();

    // the holder dies: its events are re-homed per the restore mode
    system.restore_events(&consumer, held).unwrap();
    system.detach(consumer.id()).unwrap();

    assert_eq!(system.grand_central().input.len(), gc_before + 4);
    let s = system.station_by_id(station).unwrap();
    assert_eq!(s.input.len(), 0);
    assert_eq!(s.output.len(), 0);
    system.close();
}

#[test]
fn test_restore_to_station_lands_ahead_of_peers() {
    let system = system_with(10);
    let station = system
        .create_station("careful", StationConfig::default(), END, END)
        .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let consumer = system.attach(station, "localhost", -1).unwrap();

    let fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 3, 64, 0)
        .unwrap();
    system.put_events(&producer, fresh).unwrap();
    let held = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(2)),
            Modify::HeaderAndData,
            2,
        )
        .unwrap();
    let held_ids: Vec<i32> = held.iter().map(|ev| ev.id()).collect();

    system.restore_events(&consumer, held).unwrap();
    let s = system.station_by_id(station).unwrap();
    assert_eq!(s.input.len(), 3);
    // restored events sit in front of the event that was never taken
    let front = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(1)),
            Modify::None,
            2,
        )
        .unwrap();
    let front_ids: Vec<i32> = front.iter().map(|ev| ev.id()).collect();
    assert_eq!(
        {
            let mut sorted = front_ids.clone();
            sorted.sort_unstable();
            sorted
        },
        {
            let mut sorted = held_ids.clone();
            sorted.sort_unstable();
            sorted
        }
    );
    system.put_events(&consumer, front).unwrap();
    system.close();
}

#[test]
fn test_restore_to_input_reenters_through_upstream_conductor() {
    let system = system_with(10);
    let station = system
        .create_station(
            "bounce",
            StationConfig {
                restore_mode: RestoreMode::ToInput,
                ..StationConfig::default()
            },
            END,
            END,
        )
        .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let consumer = system.attach(station, "localhost", -1).unwrap();

    let fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 3, 64, 0)
        .unwrap();
    system.put_events(&producer, fresh).unwrap();
    let held = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(2)),
            Modify::HeaderAndData,
            3,
        )
        .unwrap();
    assert_eq!(held.len(), 3);
    let mut held_ids: Vec<i32> = held.iter().map(|ev| ev.id()).collect();
    held_ids.sort_unstable();

    // restored into the upstream (GRAND_CENTRAL) output list; its conductor
    // carries them right back into this station's input
    system.restore_events(&consumer, held).unwrap();
    let s = system.station_by_id(station).unwrap();
    assert!(wait_until(PATIENCE, || s.input.len() == 3));
    assert_eq!(system.grand_central().input.len(), 7);

    let again = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(1)),
            Modify::None,
            3,
        )
        .unwrap();
    let mut again_ids: Vec<i32> = again.iter().map(|ev| ev.id()).collect();
    again_ids.sort_unstable();
    assert_eq!(again_ids, held_ids);
    system.put_events(&consumer, again).unwrap();
    system.close();
}

#[test]
fn test_redistribute_restore_spreads_across_the_group() {
    let system = system_with(12);
    let config = StationConfig {
        flow_mode: FlowMode::Parallel,
        select_mode: SelectMode::RoundRobin,
        restore_mode: RestoreMode::Redistribute,
        ..StationConfig::default()
    };
    let head = system
        .create_station("rd1", config.clone(), END, NEW_HEAD)
        .unwrap();
    let (pos, _) = system.station_position(head).unwrap();
    let second = system.create_station("rd2", config, pos, END).unwrap();

    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let consumer = system.attach(head, "localhost", -1).unwrap();

    let fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 4, 64, 0)
        .unwrap();
    system.put_events(&producer, fresh).unwrap();

    let s1 = system.station_by_id(head).unwrap();
    let s2 = system.station_by_id(second).unwrap();
    assert!(wait_until(PATIENCE, || {
        s1.input.len() + s2.input.len() == 4
    }));
    assert_eq!((s1.input.len(), s2.input.len()), (2, 2));

    let held = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(1)),
            Modify::HeaderAndData,
            2,
        )
        .unwrap();
    assert_eq!(held.len(), 2);

    // the group reabsorbs the dead holder's events, rotation pointer intact
    system.restore_events(&consumer, held).unwrap();
    assert_eq!(s1.input.len() + s2.input.len(), 4);
    assert_eq!((s1.input.len(), s2.input.len()), (1, 3));
    system.close();
}

#[test]
fn test_redistribute_restore_leftovers_return_to_pool() {
    let system = system_with(10);
    system
        .select_registry()
        .register("flagged", |ev, _| ev.control()[0] != 0);
    let config = StationConfig {
        flow_mode: FlowMode::Parallel,
        select_mode: SelectMode::User,
        select_function: Some("flagged".into()),
        restore_mode: RestoreMode::Redistribute,
        ..StationConfig::default()
    };
    let station = system
        .create_station("picky", config, END, NEW_HEAD)
        .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let holder = system.attach(station, "localhost", -1).unwrap();

    // a holder dies with unflagged events: the group re-offers them, its
    // predicate wants none of them, and they fall back into the free pool
    let orphans = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 3, 64, 0)
        .unwrap();
    assert_eq!(system.grand_central().input.len(), 7);
    system.restore_events(&holder, orphans).unwrap();

    let s = system.station_by_id(station).unwrap();
    assert_eq!(s.input.len(), 0);
    assert_eq!(system.grand_central().input.len(), 10);
    system.close();
}

#[test]
fn test_new_events_by_group_draws_only_that_group() {
    let system = EventSystem::new(SystemConfig {
        num_events: 10,
        event_size: 64,
        groups: vec![4, 6],
        ..SystemConfig::default()
    })
    .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();

    let batch = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 10, 64, 2)
        .unwrap();
    assert_eq!(batch.len(), 6);
    assert!(batch.iter().all(|ev| ev.group() == 2));

    let err = system
        .new_events(&producer, WaitMode::Async, 1, 64, 9)
        .unwrap_err();
    assert!(matches!(err, TransportError::General(_)));
    system.put_events(&producer, batch).unwrap();
    system.close();
}

#[test]
fn test_match_station_passes_only_matching_control() {
    let mut select = [0i32; 6];
    select[0] = 0b0100;
    let system = system_with(8);
    let station = system
        .create_station(
            "matcher",
            StationConfig {
                select_mode: SelectMode::Match,
                select,
                ..StationConfig::default()
            },
            END,
            END,
        )
        .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();

    let mut fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 4, 64, 0)
        .unwrap();
    for (i, ev) in fresh.iter_mut().enumerate() {
        let mut control = [0i32; 6];
        // every other event carries the selected bit
        control[0] = if i % 2 == 0 { 0b0100 } else { 0b0010 };
        ev.set_control(control);
    }
    system.put_events(&producer, fresh).unwrap();

    let s = system.station_by_id(station).unwrap();
    assert!(wait_until(PATIENCE, || s.input.len() == 2));
    // the rest wrapped around into the pool
    assert!(wait_until(PATIENCE, || {
        system.grand_central().input.len() == 6
    }));
    system.close();
}

#[test]
fn test_high_priority_events_overtake_lows_at_the_station() {
    let system = system_with(10);
    let station = system
        .create_station("sorted", StationConfig::default(), END, END)
        .unwrap();
    let producer = system.attach(GRAND_CENTRAL_ID, "localhost", -1).unwrap();
    let consumer = system.attach(station, "localhost", -1).unwrap();

    let mut fresh = system
        .new_events(&producer, WaitMode::Timed(Duration::from_secs(1)), 5, 64, 0)
        .unwrap();
    // L, H, L, H, L as published
    for (i, ev) in fresh.iter_mut().enumerate() {
        ev.set_priority(if i % 2 == 1 {
            Priority::High
        } else {
            Priority::Low
        });
    }
    let high_ids: Vec<i32> = fresh
        .iter()
        .filter(|ev| ev.priority() == Priority::High)
        .map(|ev| ev.id())
        .collect();
    system.put_events(&producer, fresh).unwrap();

    let seen = system
        .get_events(
            &consumer,
            WaitMode::Timed(Duration::from_secs(2)),
            Modify::None,
            5,
        )
        .unwrap();
    assert_eq!(seen.len(), 5);
    let head_ids: Vec<i32> = seen.iter().take(2).map(|ev| ev.id()).collect();
    assert_eq!(head_ids, high_ids);
    system.put_events(&consumer, seen).unwrap();
    system.close();
}
