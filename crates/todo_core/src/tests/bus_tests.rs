use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use super::*;

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().expect("log").clone()
}

fn recording(bus: &ActionBus<u32>, log: &Log, name: &'static str) -> Token {
    let log = Arc::clone(log);
    bus.register(move |action: &u32, _round: &Round<'_, u32>| {
        log.lock().expect("log").push(format!("{name}:{action}"));
        Ok(())
    })
}

#[test]
fn tokens_increase_monotonically() {
    let bus = ActionBus::<u32>::new().expect("bus");
    let first = bus.register(|_, _| Ok(()));
    let second = bus.register(|_, _| Ok(()));
    bus.unregister(first).expect("unregister");
    let third = bus.register(|_, _| Ok(()));

    assert!(first < second);
    assert!(second < third);
    assert_eq!(bus.handle().listener_count(), 2);
}

#[test]
fn every_listener_runs_once_in_token_order() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    recording(&bus, &log, "a");
    recording(&bus, &log, "b");
    recording(&bus, &log, "c");

    bus.dispatch_and_wait(7).expect("dispatch");
    bus.dispatch_and_wait(8).expect("dispatch");

    assert_eq!(
        entries(&log),
        vec!["a:7", "b:7", "c:7", "a:8", "b:8", "c:8"]
    );
}

#[test]
fn wait_for_runs_dependency_before_caller_resumes() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();

    let late = Arc::new(Mutex::new(None::<Token>));
    let first = {
        let log = Arc::clone(&log);
        let late = Arc::clone(&late);
        bus.register(move |_: &u32, round: &Round<'_, u32>| {
            assert_eq!(*round.action(), 1);
            log.lock().expect("log").push("first:start".into());
            let dependency = late.lock().expect("token").expect("late registered");
            round.wait_for(&[dependency])?;
            log.lock().expect("log").push("first:end".into());
            Ok(())
        })
    };
    recording(&bus, &log, "middle");
    let last = recording(&bus, &log, "last");
    *late.lock().expect("token") = Some(last);
    assert!(first < last);

    bus.dispatch_and_wait(1).expect("dispatch");

    assert_eq!(
        entries(&log),
        vec!["first:start", "last:1", "first:end", "middle:1"]
    );
}

#[test]
fn waiting_on_finished_listener_is_a_noop() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    let first = recording(&bus, &log, "first");
    {
        let log = Arc::clone(&log);
        bus.register(move |_: &u32, round: &Round<'_, u32>| {
            round.wait_for(&[first])?;
            round.wait_for(&[first])?;
            log.lock().expect("log").push("second".into());
            Ok(())
        });
    }

    bus.dispatch_and_wait(3).expect("dispatch");
    assert_eq!(entries(&log), vec!["first:3", "second"]);
}

#[test]
fn circular_wait_fails_fast_and_aborts_round() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    let tokens = Arc::new(Mutex::new(Vec::<Token>::new()));

    for name in ["a", "b"] {
        let registered = Arc::clone(&tokens);
        let log = Arc::clone(&log);
        let token = bus.register(move |_: &u32, round: &Round<'_, u32>| {
            log.lock().expect("log").push(format!("{name}:start"));
            let other = {
                let tokens = registered.lock().expect("tokens");
                if name == "a" {
                    tokens[1]
                } else {
                    tokens[0]
                }
            };
            round.wait_for(&[other])?;
            log.lock().expect("log").push(format!("{name}:end"));
            Ok(())
        });
        tokens.lock().expect("tokens").push(token);
    }
    recording(&bus, &log, "after");

    let outcome = bus.dispatch_and_wait(1);
    let a = tokens.lock().expect("tokens")[0];
    assert_eq!(outcome, Err(BusError::CircularDependency(a)));
    assert_eq!(entries(&log), vec!["a:start", "b:start"]);

    // the next round starts from clean bookkeeping
    log.lock().expect("log").clear();
    assert!(bus.dispatch_and_wait(2).is_err());
    assert_eq!(entries(&log), vec!["a:start", "b:start"]);
}

#[test]
fn swallowed_cycle_error_still_aborts_round() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    let own = Arc::new(Mutex::new(None::<Token>));
    {
        let slot = Arc::clone(&own);
        let token = bus.register(move |_: &u32, round: &Round<'_, u32>| {
            let me = slot.lock().expect("token").expect("registered");
            let _ = round.wait_for(&[me]);
            Ok(())
        });
        *own.lock().expect("token") = Some(token);
    }
    recording(&bus, &log, "after");

    let outcome = bus.dispatch_and_wait(1);
    assert!(matches!(outcome, Err(BusError::CircularDependency(_))));
    assert!(entries(&log).is_empty());
}

#[test]
fn unknown_tokens_are_rejected() {
    let bus = ActionBus::<u32>::new().expect("bus");
    let token = bus.register(|_, _| Ok(()));
    bus.unregister(token).expect("first unregister");
    assert_eq!(bus.unregister(token), Err(BusError::UnknownToken(token)));

    bus.register(move |_: &u32, round: &Round<'_, u32>| round.wait_for(&[token]));
    assert_eq!(
        bus.dispatch_and_wait(1),
        Err(BusError::UnknownToken(token))
    );
}

#[test]
fn unregistered_listener_misses_later_rounds() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    let gone = recording(&bus, &log, "gone");
    recording(&bus, &log, "kept");

    bus.dispatch_and_wait(1).expect("dispatch");
    bus.unregister(gone).expect("unregister");
    bus.dispatch_and_wait(2).expect("dispatch");

    assert_eq!(entries(&log), vec!["gone:1", "kept:1", "kept:2"]);
}

#[test]
fn dispatch_from_listener_is_deferred_not_nested() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    let handle = bus.handle();
    {
        let log = Arc::clone(&log);
        bus.register(move |action: &u32, _round: &Round<'_, u32>| {
            log.lock().expect("log").push(format!("start:{action}"));
            if *action == 1 {
                handle.dispatch(2)?;
                assert_eq!(handle.dispatch_and_wait(3), Err(BusError::Reentrant));
                assert_eq!(handle.flush_blocking(), Err(BusError::Reentrant));
            }
            log.lock().expect("log").push(format!("end:{action}"));
            Ok(())
        });
    }

    bus.dispatch(1).expect("dispatch");
    bus.flush_blocking().expect("flush");

    assert_eq!(entries(&log), vec!["start:1", "end:1", "start:2", "end:2"]);
}

#[test]
fn flush_covers_rounds_deferred_by_listeners() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    let handle = bus.handle();
    {
        let log = Arc::clone(&log);
        bus.register(move |action: &u32, _round: &Round<'_, u32>| {
            log.lock().expect("log").push(action.to_string());
            thread::sleep(Duration::from_millis(50));
            if *action == 1 {
                handle.dispatch(2)?;
            }
            Ok(())
        });
    }

    bus.dispatch(1).expect("dispatch");
    bus.dispatch(3).expect("dispatch");
    bus.flush_blocking().expect("flush");

    // the deferred round runs before the dispatch queued behind it
    assert_eq!(entries(&log), vec!["1", "2", "3"]);
}

#[test]
fn panicking_listener_aborts_round_but_not_bus() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    let bad = bus.register(|action: &u32, _round: &Round<'_, u32>| {
        if *action == 0 {
            panic!("listener failure");
        }
        Ok(())
    });
    recording(&bus, &log, "after");

    assert_eq!(
        bus.dispatch_and_wait(0),
        Err(BusError::ListenerPanicked(bad))
    );
    bus.dispatch_and_wait(1).expect("bus still running");
    assert_eq!(entries(&log), vec!["after:1"]);
}

#[test]
fn concurrent_registration_hands_out_distinct_tokens() {
    let bus = ActionBus::<u32>::new().expect("bus");
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let handle = bus.handle();
            thread::spawn(move || {
                (0..25)
                    .map(|_| handle.register(|_, _| Ok(())))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        for token in worker.join().expect("worker") {
            assert!(seen.insert(token), "token {token} handed out twice");
        }
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test]
async fn flush_waits_for_queued_rounds() {
    let bus = ActionBus::new().expect("bus");
    let log = new_log();
    recording(&bus, &log, "l");
    for action in 0..5 {
        bus.dispatch(action).expect("dispatch");
    }
    bus.flush().await.expect("flush");
    assert_eq!(entries(&log).len(), 5);
}

#[test]
fn shutdown_drains_queue_then_rejects() {
    let mut bus = ActionBus::new().expect("bus");
    let log = new_log();
    recording(&bus, &log, "l");
    let handle = bus.handle();
    bus.dispatch(1).expect("dispatch");
    bus.shutdown();

    assert_eq!(entries(&log), vec!["l:1"]);
    assert_eq!(handle.dispatch(2), Err(BusError::Closed));
}
