use std::alloc::System;
use std::sync::Arc;

use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

use kyrowatch::{Action, Condition, FunctionRef, HostEvent, Location, MapFrame, ProgramImage, SimulatedHost, Watcher};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

const REACHES: usize = 1_000;

fn watcher() -> Watcher {
    let host = Arc::new(SimulatedHost::new(ProgramImage::new().function(
        "app",
        "hot",
        1,
        &["def hot(x):", "    y = x + 1", "    return y"],
    )));
    Watcher::new(host)
}

#[test]
fn idle_dispatch_allocation_budget() {
    let watcher = watcher();
    let hot = FunctionRef::new("app", "hot");
    let cold = FunctionRef::new("app", "cold");

    // Triggers whose conditions never hold.
    watcher
        .register_at(Location::enter(hot.clone()), Some(Condition::never()), Action::stop())
        .unwrap();
    watcher
        .register_at(
            Location::line("app", 2),
            Some(Condition::expr("x > 5").unwrap()),
            Action::stop(),
        )
        .unwrap();

    let mut frame = MapFrame::new().with("x", 1);
    let enter = HostEvent::enter(&hot, 1);
    let line = HostEvent::line(&hot, 2);
    let unwatched = HostEvent::enter(&cold, 1);

    // Warm up: thread-locals and logging callsites.
    for event in [&enter, &line, &unwatched] {
        assert!(watcher.dispatch(event, &mut frame).is_continue());
    }

    let region = Region::new(GLOBAL);
    for _ in 0..REACHES {
        assert!(watcher.dispatch(&unwatched, &mut frame).is_continue());
        assert!(watcher.dispatch(&enter, &mut frame).is_continue());
        assert!(watcher.dispatch(&line, &mut frame).is_continue());
    }
    let stats = region.change();

    // Idle reaches must not allocate per call; leave headroom for the test
    // harness thread.
    assert!(
        stats.allocations <= 16,
        "idle dispatch allocated per reach: {stats:?}"
    );
    assert!(
        stats.bytes_allocated <= 16 * 1024,
        "idle dispatch allocated too many bytes: {stats:?}"
    );
}
