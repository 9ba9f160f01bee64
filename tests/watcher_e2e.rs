use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kyrowatch::location::source_hash;
use kyrowatch::{
    Action, CaptureKind, Condition, DispatchError, EventKind, FireOutcome, FunctionRef, HostRuntime,
    Identifier, Location, LocationSpec, MapFrame, MemoryCaptureSink, Outcome, ProgramImage, RegistrationError,
    RunOutcome, SimulatedHost, Step, Value, WatchConfig, WatchError, Watcher,
};

fn image() -> ProgramImage {
    ProgramImage::new()
        .function("shop", "f", 1, &["def f():", "    return 1"])
        .function(
            "shop",
            "check",
            8,
            &[
                "def check(x):",
                "    y = x",
                "    if x > 100:",
                "        raise ValueError(x)",
                "    return y",
            ],
        )
        .function("shop", "risky", 20, &["def risky():", "    raise RuntimeError('boom')"])
}

fn setup() -> (Arc<SimulatedHost>, Watcher) {
    let host = Arc::new(SimulatedHost::new(image()));
    let watcher = Watcher::new(host.clone());
    (host, watcher)
}

fn f() -> FunctionRef {
    FunctionRef::new("shop", "f")
}

fn check() -> FunctionRef {
    FunctionRef::new("shop", "check")
}

fn risky() -> FunctionRef {
    FunctionRef::new("shop", "risky")
}

fn call_f(host: &SimulatedHost, watcher: &Watcher) -> RunOutcome {
    host.run(watcher, &f(), &mut MapFrame::new(), |_, _| Step::Return(Value::Int(1)))
        .unwrap()
}

/// Runs `check(x)`, returning the outcome and the lines whose bodies executed.
fn call_check(host: &SimulatedHost, watcher: &Watcher, frame: &mut MapFrame) -> (RunOutcome, Vec<u32>) {
    let mut visited = Vec::new();
    let out = host
        .run(watcher, &check(), frame, |line, frame| {
            visited.push(line);
            match line {
                11 if frame.int("x").unwrap_or(0) > 100 => Step::Raise(Value::from("ValueError")),
                12 => Step::Return(frame.value("x").cloned().unwrap_or(Value::Null)),
                _ => Step::Next,
            }
        })
        .unwrap();
    (out, visited)
}

fn call_risky(host: &SimulatedHost, watcher: &Watcher) -> RunOutcome {
    host.run(watcher, &risky(), &mut MapFrame::new(), |_, _| {
        Step::Raise(Value::from("RuntimeError"))
    })
    .unwrap()
}

fn counting(hits: &Arc<AtomicUsize>) -> Action {
    let hits = Arc::clone(hits);
    Action::callback(move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::Continue)
    })
}

#[test]
fn entry_counter_stops_after_unregister() {
    let (host, watcher) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    let handle = watcher
        .register_at(Location::enter(f()), None, counting(&hits))
        .unwrap();

    for _ in 0..3 {
        assert_eq!(call_f(&host, &watcher), RunOutcome::Returned(Value::Int(1)));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    handle.remove();
    call_f(&host, &watcher);
    call_f(&host, &watcher);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn line_condition_raises_signal_only_when_it_holds() {
    let (host, watcher) = setup();
    watcher
        .when(Location::line("shop", 10))
        .condition_expr("x > 5")
        .then(Action::signal("x too large"))
        .register()
        .unwrap();

    let (out, visited) = call_check(&host, &watcher, &mut MapFrame::new().with("x", 3));
    assert_eq!(out, RunOutcome::Returned(Value::Int(3)));
    assert_eq!(visited, vec![9, 10, 11, 12]);

    let (out, visited) = call_check(&host, &watcher, &mut MapFrame::new().with("x", 10));
    match out {
        RunOutcome::Signalled { payload, .. } => assert_eq!(payload, Value::from("x too large")),
        other => panic!("expected a signal, got {other:?}"),
    }
    assert_eq!(visited, vec![9], "execution must halt at line 10");
}

#[test]
fn raise_triggers_fire_in_order_and_last_outcome_wins() {
    let (host, watcher) = setup();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first_order = Arc::clone(&order);
    watcher
        .register_at(
            Location::raise(risky()),
            None,
            Action::callback(move |_| {
                first_order.lock().unwrap().push("first");
                Ok(Outcome::Continue)
            }),
        )
        .unwrap();

    let second_order = Arc::clone(&order);
    let second = watcher
        .register_at(
            Location::raise(risky()),
            None,
            Action::callback(move |_| {
                second_order.lock().unwrap().push("second");
                Ok(Outcome::StopProgram)
            }),
        )
        .unwrap();

    let out = call_risky(&host, &watcher);
    assert_eq!(
        out,
        RunOutcome::Halted {
            trigger_id: second.ids()[0]
        }
    );
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn registration_order_is_deterministic_across_runs() {
    let (host, watcher) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..5 {
        let seen = Arc::clone(&seen);
        watcher
            .register_at(
                Location::line("shop", 9),
                None,
                Action::callback(move |_| {
                    seen.lock().unwrap().push(tag);
                    Ok(Outcome::Continue)
                }),
            )
            .unwrap();
    }

    for _ in 0..10 {
        seen.lock().unwrap().clear();
        call_check(&host, &watcher, &mut MapFrame::new().with("x", 1));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}

#[test]
fn unconditional_triggers_fire_once_per_reach() {
    let (host, watcher) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    watcher
        .register_at(Location::exit(check()), None, counting(&hits))
        .unwrap();
    for x in 0..7 {
        call_check(&host, &watcher, &mut MapFrame::new().with("x", x));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 7);
}

#[test]
fn always_false_condition_never_fires() {
    let (host, watcher) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    let feed = watcher.subscribe_feed();
    watcher
        .register_at(Location::enter(f()), Some(Condition::never()), counting(&hits))
        .unwrap();
    for _ in 0..100 {
        call_f(&host, &watcher);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(feed.drain().is_empty());
}

#[test]
fn disabling_all_triggers_stops_host_monitoring() {
    let (host, watcher) = setup();
    let a = watcher.register_at(Location::enter(f()), None, Action::noop()).unwrap();
    let b = watcher.register_at(Location::enter(f()), None, Action::noop()).unwrap();
    assert_eq!(host.hook_count(), 1);

    a.disable().unwrap();
    assert_eq!(host.hook_count(), 1);
    b.disable().unwrap();
    assert_eq!(host.hook_count(), 0);
    assert!(watcher.monitored_locations().is_empty());

    let delivered = host.delivered_events();
    for _ in 0..10 {
        call_f(&host, &watcher);
    }
    assert_eq!(host.delivered_events(), delivered);

    b.enable().unwrap();
    assert_eq!(host.hook_count(), 1);
    call_f(&host, &watcher);
    assert_eq!(host.delivered_events(), delivered + 1);
}

#[test]
fn removal_takes_effect_before_the_next_reach_on_the_same_thread() {
    let (host, watcher) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    let handle = watcher
        .register_at(Location::line("shop", 9), None, counting(&hits))
        .unwrap();
    call_check(&host, &watcher, &mut MapFrame::new().with("x", 1));
    handle.remove();

    let f = check();
    let directive = watcher.dispatch(&kyrowatch::HostEvent::line(&f, 9), &mut MapFrame::new());
    assert!(directive.is_continue());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn scoped_triggers_are_removed_on_every_exit_path() {
    fn instrumented(watcher: &Watcher, fail: bool) -> Result<(), String> {
        let _guard = watcher
            .when(f())
            .at_str("<start>")
            .register_scoped()
            .map_err(|e| e.to_string())?;
        if fail {
            return Err("early exit".to_string());
        }
        Ok(())
    }

    let (host, watcher) = setup();
    instrumented(&watcher, false).unwrap();
    assert_eq!(host.hook_count(), 0);
    instrumented(&watcher, true).unwrap_err();
    assert_eq!(host.hook_count(), 0);
    assert_eq!(watcher.trigger_count(), 0);
}

#[test]
fn writeback_changes_only_existing_bindings() {
    let (host, watcher) = setup();
    watcher
        .when(check())
        .at_str("<start>")
        .then(Action::assign("x", 42))
        .register()
        .unwrap();
    let mut frame = MapFrame::new().with("x", 1);
    let (out, _) = call_check(&host, &watcher, &mut frame);
    assert_eq!(out, RunOutcome::Returned(Value::Int(42)));
    assert!(frame.value("z").is_none());

    watcher.clear_all();
    watcher
        .when(check())
        .at_str("<start>")
        .then(Action::assign("z", 1))
        .register()
        .unwrap();
    let mut frame = MapFrame::new().with("x", 1);
    let (out, visited) = call_check(&host, &watcher, &mut frame);
    match out {
        RunOutcome::Failed(DispatchError::ActionExecution { .. }) => {}
        other => panic!("expected a fatal action error, got {other:?}"),
    }
    assert!(visited.is_empty());
    assert!(frame.value("z").is_none());
}

#[test]
fn goto_skips_lines() {
    let (host, watcher) = setup();
    watcher
        .when(check())
        .at(10)
        .then(Action::goto(12))
        .register()
        .unwrap();
    let (out, visited) = call_check(&host, &watcher, &mut MapFrame::new().with("x", 500));
    assert_eq!(out, RunOutcome::Returned(Value::Int(500)));
    assert_eq!(visited, vec![9, 12]);
}

#[test]
fn goto_resolves_a_source_prefix() {
    let (host, watcher) = setup();
    watcher
        .when(check())
        .at(10)
        .then(Action::goto(Identifier::Source("return".to_string())))
        .register()
        .unwrap();
    let (out, visited) = call_check(&host, &watcher, &mut MapFrame::new().with("x", 500));
    assert_eq!(out, RunOutcome::Returned(Value::Int(500)));
    assert_eq!(visited, vec![9, 12]);
}

#[test]
fn goto_to_a_non_executable_line_fails_the_action() {
    let (host, watcher) = setup();
    let feed = watcher.subscribe_feed();
    watcher
        .when(check())
        .at(10)
        .then(Action::goto(99))
        .register()
        .unwrap();

    let (out, visited) = call_check(&host, &watcher, &mut MapFrame::new().with("x", 1));
    match out {
        RunOutcome::Failed(DispatchError::ActionExecution { source, .. }) => {
            assert!(source.to_string().contains("no executable line"), "{source}");
        }
        other => panic!("expected a fatal action error, got {other:?}"),
    }
    assert_eq!(visited, vec![9]);

    let outcomes: Vec<FireOutcome> = feed.drain().into_iter().map(|r| r.outcome).collect();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], FireOutcome::ActionError { .. }));
}

#[test]
fn ambiguous_goto_follows_the_action_error_policy() {
    let host = Arc::new(SimulatedHost::new(ProgramImage::new().function(
        "shop",
        "tally",
        30,
        &[
            "def tally(n):",
            "    total = n",
            "    total += 1",
            "    total += 2",
            "    return total",
        ],
    )));
    let config = WatchConfig::from_json_str(r#"{"on_action_error": "continue"}"#).unwrap();
    let watcher = Watcher::builder(host.clone()).config(config).build();
    let feed = watcher.subscribe_feed();
    let tally = FunctionRef::new("shop", "tally");
    watcher
        .when(tally.clone())
        .at(31)
        .then(Action::goto(Identifier::Source("total +=".to_string())))
        .register()
        .unwrap();

    let mut visited = Vec::new();
    let out = host
        .run(&watcher, &tally, &mut MapFrame::new().with("n", 1), |line, _| {
            visited.push(line);
            match line {
                34 => Step::Return(Value::Int(4)),
                _ => Step::Next,
            }
        })
        .unwrap();
    assert_eq!(out, RunOutcome::Returned(Value::Int(4)));
    assert_eq!(visited, vec![31, 32, 33, 34]);

    let last = feed.drain().pop().unwrap();
    match last.outcome {
        FireOutcome::ActionError { message } => assert!(message.contains("ambiguous"), "{message}"),
        other => panic!("expected an action error record, got {other:?}"),
    }
}

#[test]
fn capture_requests_reach_the_sink() {
    let host = Arc::new(SimulatedHost::new(image()));
    let sink = Arc::new(MemoryCaptureSink::new());
    let watcher = Watcher::builder(host.clone()).capture_sink(sink.clone()).build();
    let feed = watcher.subscribe_feed();

    let handle = watcher
        .when(check())
        .at_str("<return>")
        .condition_expr("_retval >= 10")
        .then(Action::capture(CaptureKind::Snapshot))
        .register()
        .unwrap();

    let (out, _) = call_check(&host, &watcher, &mut MapFrame::new().with("x", 3));
    assert_eq!(out, RunOutcome::Returned(Value::Int(3)));
    assert!(sink.captures().is_empty());

    let (out, _) = call_check(&host, &watcher, &mut MapFrame::new().with("x", 12));
    assert_eq!(out, RunOutcome::Returned(Value::Int(12)));
    let captures = sink.captures();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].trigger_id, handle.ids()[0]);
    assert_eq!(captures[0].kind, CaptureKind::Snapshot);
    assert_eq!(captures[0].bindings, vec![("x".to_string(), Value::Int(12))]);

    let outcomes: Vec<FireOutcome> = feed.drain().into_iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            FireOutcome::Fired {
                outcome: Outcome::RequestCapture(CaptureKind::Snapshot)
            },
            FireOutcome::Captured {
                reference: captures[0].reference.clone()
            },
        ]
    );
}

#[test]
fn failing_capture_follows_the_action_error_policy() {
    let host = Arc::new(SimulatedHost::new(image()));
    let cfg = WatchConfig::from_json_str(r#"{"on_action_error": "continue"}"#).unwrap();
    let watcher = Watcher::builder(host.clone())
        .config(cfg)
        .capture_sink(Arc::new(MemoryCaptureSink::failing("disk full")))
        .build();
    let feed = watcher.subscribe_feed();
    watcher
        .when(f())
        .at_str("<start>")
        .then(Action::breakpoint())
        .register()
        .unwrap();

    assert_eq!(call_f(&host, &watcher), RunOutcome::Returned(Value::Int(1)));
    let last = feed.drain().pop().unwrap();
    match last.outcome {
        FireOutcome::ActionError { message } => assert!(message.contains("disk full")),
        other => panic!("expected an action error record, got {other:?}"),
    }
}

#[test]
fn condition_errors_are_observable_but_not_fatal() {
    let (host, watcher) = setup();
    let feed = watcher.subscribe_feed();
    let hits = Arc::new(AtomicUsize::new(0));
    let handle = watcher
        .when(check())
        .at(9)
        .condition_expr("undefined_name > 1")
        .then(counting(&hits))
        .register()
        .unwrap();

    for _ in 0..3 {
        let (out, _) = call_check(&host, &watcher, &mut MapFrame::new().with("x", 1));
        assert_eq!(out, RunOutcome::Returned(Value::Int(1)));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(handle.is_enabled(), "a bad evaluation must not disable the trigger");
    let records = feed.drain();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| matches!(r.outcome, FireOutcome::ConditionError { .. })));
}

#[test]
fn self_disabling_trigger_fires_once() {
    let (host, watcher) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let handle = watcher
        .register_at(
            Location::enter(f()),
            None,
            Action::callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::DisableTrigger)
            }),
        )
        .unwrap();

    for _ in 0..4 {
        call_f(&host, &watcher);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!handle.is_enabled());
    assert_eq!(host.hook_count(), 0);
}

#[test]
fn identifiers_resolve_to_executable_lines() {
    let (host, watcher) = setup();
    let by_source = watcher.when(check()).at_str("return").register().unwrap();
    assert_eq!(watcher.monitored_locations(), vec![Location::line("shop", 12)]);
    by_source.remove();

    let by_offset = watcher.when(check()).at_str("+2").register().unwrap();
    assert!(host.is_hooked(&Location::line("shop", 10)));
    by_offset.remove();

    let whole_module = watcher
        .when(LocationSpec::module("shop"))
        .at_str("<start>")
        .register()
        .unwrap();
    assert_eq!(whole_module.ids().len(), 3);
    assert!(host.is_hooked(&Location::enter(risky())));
}

#[test]
fn source_hash_guards_against_stale_code() {
    let (host, watcher) = setup();
    let code = host.code(&check()).unwrap();
    let hash = source_hash(&code);
    assert_eq!(hash.len(), 8);

    watcher
        .when(check())
        .at_str("<start>")
        .source_hash(hash)
        .register()
        .unwrap();

    let err = watcher
        .when(check())
        .at_str("<start>")
        .source_hash("00000000")
        .register()
        .unwrap_err();
    assert!(matches!(
        err,
        WatchError::Registration(RegistrationError::SourceHashMismatch { .. })
    ));
    assert_eq!(watcher.trigger_count(), 1);
}

#[test]
fn invalid_and_unsupported_locations_are_rejected() {
    let host = Arc::new(SimulatedHost::new(image()).without_event(EventKind::Raise));
    let watcher = Watcher::new(host.clone());

    let err = watcher
        .register_at(Location::line("shop", 3), None, Action::noop())
        .unwrap_err();
    assert!(matches!(
        err,
        WatchError::Registration(RegistrationError::InvalidLocation { .. })
    ));

    let err = watcher
        .when(FunctionRef::new("shop", "missing"))
        .register()
        .unwrap_err();
    assert!(matches!(
        err,
        WatchError::Registration(RegistrationError::InvalidLocation { .. })
    ));

    let err = watcher
        .register_at(Location::raise(risky()), None, Action::noop())
        .unwrap_err();
    assert!(matches!(
        err,
        WatchError::Registration(RegistrationError::UnsupportedLocation { .. })
    ));

    assert_eq!(watcher.trigger_count(), 0);
    assert_eq!(host.hook_count(), 0);
}

#[test]
fn triggers_survive_module_reload() {
    let (host, watcher) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    watcher
        .register_at(Location::enter(f()), None, counting(&hits))
        .unwrap();
    call_f(&host, &watcher);
    host.reload(image());
    call_f(&host, &watcher);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn feed_records_identify_trigger_and_location() {
    let (host, watcher) = setup();
    let feed = watcher.subscribe_feed();
    let handle = watcher
        .when(f())
        .at_str("<start>")
        .then(Action::stop())
        .register()
        .unwrap();

    let out = call_f(&host, &watcher);
    assert!(matches!(out, RunOutcome::Halted { .. }));

    let record = feed.try_recv().unwrap();
    assert_eq!(record.trigger_id, handle.ids()[0]);
    assert_eq!(record.location, Location::enter(f()));
    assert_eq!(
        record.outcome,
        FireOutcome::Fired {
            outcome: Outcome::StopProgram
        }
    );
    assert_eq!(watcher.dropped_records(), 0);
}
