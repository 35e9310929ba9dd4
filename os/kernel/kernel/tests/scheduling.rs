mod common;

use common::{Call, eventually};
use kernel::{KernelResult, ThreadState};
use kernel_info::scheduling::core_bit;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn better_priority_takes_the_core() {
    let (kernel, journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "priorities");

    let low = common::spawn(ctx, process, 10, 0);
    assert_eq!(ctx.current_thread(0), Some(low));
    let high = common::spawn(ctx, process, 5, 0);
    assert_eq!(ctx.current_thread(0), Some(high));

    assert_eq!(ctx.thread_info(low).unwrap().state, ThreadState::Ready);
    assert_eq!(ctx.thread_info(high).unwrap().state, ThreadState::Running);
    assert!(ctx.core_stats(1).is_idle());
    assert_eq!(ctx.core_stats(0).current_priority, 5);

    assert!(journal.wait_for(high, Call::Resume(0)));
    assert!(journal.wait_for(low, Call::Suspend));
}

#[test]
fn woken_waiters_are_selected_by_priority() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "fairness");
    let event = ctx.create_event(process).unwrap();

    let waiters: Vec<_> = [10, 5]
        .into_iter()
        .map(|priority| {
            let id = common::spawn(ctx, process, priority, 0);
            let guest = ctx.guest_thread(id).unwrap();
            let ctx = Arc::clone(ctx);
            let handle = event.readable_handle();
            let join = thread::spawn(move || ctx.svc(&guest).wait_synchronization(&[handle], -1));
            assert!(eventually(|| ctx_state(&kernel, id) == ThreadState::WaitingSync));
            (id, join)
        })
        .collect();
    assert!(ctx.core_stats(0).is_idle());

    event.signal().unwrap();
    assert_eq!(ctx.current_thread(0), Some(waiters[1].0));
    assert_eq!(ctx_state(&kernel, waiters[0].0), ThreadState::Ready);
    for (_, join) in waiters {
        assert_eq!(join.join().unwrap(), Ok(0));
    }
}

fn ctx_state(kernel: &kernel::Kernel, id: kernel::ThreadId) -> ThreadState {
    kernel.context().thread_info(id).unwrap().state
}

#[test]
fn preemption_tick_rotates_equal_priorities() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "round-robin");
    let threads: Vec<_> = (0..3).map(|_| common::spawn(ctx, process, 20, 1)).collect();
    let better = common::spawn(ctx, process, 30, 1);

    assert_eq!(ctx.current_thread(1), Some(threads[0]));
    let switches = ctx.core_stats(1).switches;
    for expected in [threads[1], threads[2], threads[0]] {
        ctx.preemption_tick();
        assert_eq!(ctx.current_thread(1), Some(expected));
    }
    assert_eq!(ctx.core_stats(1).switches, switches + 3);
    assert_eq!(ctx_state(&kernel, better), ThreadState::Ready);
}

#[test]
fn lone_thread_keeps_its_core_across_ticks() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "alone");
    let only = common::spawn(ctx, process, 20, 3);
    let switches = ctx.core_stats(3).switches;
    ctx.preemption_tick();
    ctx.preemption_tick();
    assert_eq!(ctx.current_thread(3), Some(only));
    assert_eq!(ctx.core_stats(3).switches, switches);
}

#[test]
fn sleeping_thread_hands_over_its_core() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "sleeper");
    let low = common::spawn(ctx, process, 30, 2);
    let high = common::spawn(ctx, process, 10, 2);
    assert_eq!(ctx.current_thread(2), Some(high));

    let guest = ctx.guest_thread(high).unwrap();
    let sleeper = {
        let ctx = Arc::clone(ctx);
        thread::spawn(move || {
            let started = Instant::now();
            ctx.sleep_thread(&guest, 50_000_000).map(|()| started.elapsed())
        })
    };
    assert!(eventually(|| ctx_state(&kernel, high) == ThreadState::WaitingTimer));
    assert_eq!(ctx.current_thread(2), Some(low));

    let slept = sleeper.join().unwrap().unwrap();
    assert!(slept >= Duration::from_millis(50));
    assert_eq!(ctx.current_thread(2), Some(high));
}

#[test]
fn yielding_moves_behind_peers() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "yield");
    let first = common::spawn(ctx, process, 20, 0);
    let second = common::spawn(ctx, process, 20, 0);

    let guest = ctx.guest_thread(first).unwrap();
    ctx.sleep_thread(&guest, 0).unwrap();
    assert_eq!(ctx.current_thread(0), Some(second));
    assert_eq!(ctx_state(&kernel, first), ThreadState::Ready);
}

#[test]
fn priority_change_reorders_the_queue() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "reprioritize");
    let running = common::spawn(ctx, process, 10, 0);
    let waiting = common::spawn(ctx, process, 40, 0);

    ctx.set_thread_priority(waiting, 2).unwrap();
    assert_eq!(ctx.current_thread(0), Some(waiting));
    ctx.set_thread_priority(running, 1).unwrap();
    assert_eq!(ctx.current_thread(0), Some(running));
    assert_eq!(ctx.set_thread_priority(running, 64), Err(KernelResult::InvalidPriority));
}

#[test]
fn core_mask_change_migrates_the_thread() {
    let (kernel, journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "migration");
    let id = common::spawn(ctx, process, 20, 0);

    ctx.set_thread_core_mask(id, 3, core_bit(3)).unwrap();
    assert_eq!(ctx.current_thread(3), Some(id));
    assert!(ctx.core_stats(0).is_idle());
    assert!(journal.wait_for(id, Call::Resume(3)));

    let info = ctx.thread_info(id).unwrap();
    assert_eq!((info.preferred_core, info.affinity, info.active_core), (3, 0b1000, 3));

    assert_eq!(ctx.set_thread_core_mask(id, 3, 0), Err(KernelResult::InvalidCombination));
    assert_eq!(ctx.set_thread_core_mask(id, 2, core_bit(1)), Err(KernelResult::InvalidCombination));
    assert_eq!(ctx.set_thread_core_mask(id, 4, core_bit(3)), Err(KernelResult::InvalidCoreId));
    assert_eq!(ctx.set_thread_core_mask(id, -1, core_bit(3)), Err(KernelResult::InvalidCoreId));
    assert_eq!(ctx.set_thread_core_mask(id, 3, 1 << 4), Err(KernelResult::InvalidCoreId));
}

#[test]
fn paused_threads_leave_the_queue() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "pause");
    let controller = common::spawn(ctx, process, 30, 1);
    let target = common::spawn(ctx, process, 10, 1);
    assert_eq!(ctx.current_thread(1), Some(target));

    ctx.set_thread_activity(controller, target, true).unwrap();
    assert_eq!(ctx_state(&kernel, target), ThreadState::Paused);
    assert_eq!(ctx.current_thread(1), Some(controller));
    assert_eq!(
        ctx.set_thread_activity(controller, target, true),
        Err(KernelResult::InvalidState)
    );

    ctx.set_thread_activity(controller, target, false).unwrap();
    assert_eq!(ctx.current_thread(1), Some(target));
    assert_eq!(
        ctx.set_thread_activity(target, target, true),
        Err(KernelResult::InvalidHandle)
    );
}

#[test]
fn preemption_thread_rotates_on_its_own() {
    kernel_log::HostLogger::try_init_for_tests();
    let kernel = kernel::Kernel::boot(
        kernel::KernelConfig::default().with_preemption_quantum(Duration::from_millis(2)),
        Arc::new(kernel::NullContextFactory),
    )
    .unwrap();
    let ctx = kernel.context();
    let process = common::process(ctx, "timesliced");
    let first = common::spawn(ctx, process, 20, 0);
    let _second = common::spawn(ctx, process, 20, 0);
    assert!(eventually(|| ctx.current_thread(0) != Some(first)));
}

#[test]
fn idle_core_pulls_over_a_waiting_thread() {
    let (kernel, journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "balance");
    let running = common::spawn(ctx, process, 10, 0);
    let waiting = common::spawn(ctx, process, 20, 0);
    assert_eq!(ctx_state(&kernel, waiting), ThreadState::Ready);

    ctx.set_thread_core_mask(waiting, 0, 0b0011).unwrap();
    assert_eq!(ctx.current_thread(0), Some(running));
    assert_eq!(ctx.current_thread(1), Some(waiting));
    assert_eq!(ctx.thread_info(waiting).unwrap().active_core, 1);
    assert!(journal.wait_for(waiting, Call::Resume(1)));
    assert!(ctx.audit().is_clean());
}

#[test]
fn running_thread_moves_when_its_core_has_more_work() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "hand-over");
    let mobile = common::spawn(ctx, process, 10, 0);
    ctx.set_thread_core_mask(mobile, 0, 0b0011).unwrap();
    assert_eq!(ctx.current_thread(0), Some(mobile));
    assert!(ctx.core_stats(1).is_idle());

    let pinned = common::spawn(ctx, process, 20, 0);
    assert_eq!(ctx.current_thread(0), Some(pinned));
    assert_eq!(ctx.current_thread(1), Some(mobile));
    assert_eq!(ctx_state(&kernel, mobile), ThreadState::Running);
    assert!(ctx.audit().is_clean());
}

#[test]
fn kernel_priorities_are_not_pulled_over() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "reserved");
    let _running = common::spawn(ctx, process, 0, 0);
    let waiting = common::spawn(ctx, process, 1, 0);
    ctx.set_thread_core_mask(waiting, 0, 0b0011).unwrap();
    assert!(ctx.core_stats(1).is_idle());
    assert_eq!(ctx.thread_info(waiting).unwrap().active_core, 0);
}

#[test]
fn preemption_tick_migrates_a_waiting_peer() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "tick-balance");
    let first = common::spawn(ctx, process, 20, 0);
    let second = common::spawn(ctx, process, 20, 1);
    let mobile = common::spawn(ctx, process, 20, 1);
    ctx.set_thread_core_mask(mobile, 1, 0b0011).unwrap();
    assert_eq!(ctx.current_thread(1), Some(second));

    ctx.preemption_tick();
    assert_eq!(ctx.thread_info(mobile).unwrap().active_core, 0);
    assert_eq!(ctx.current_thread(0), Some(first));
    assert_eq!(ctx.current_thread(1), Some(second));

    ctx.preemption_tick();
    assert_eq!(ctx.current_thread(0), Some(mobile));
    assert_eq!(ctx.current_thread(1), Some(second));
    assert!(ctx.audit().is_clean());
}

#[test]
fn load_balancing_yield_takes_a_thread_from_another_core() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "yield-balance");
    let caller = common::spawn(ctx, process, 20, 0);
    let busy = common::spawn(ctx, process, 5, 1);
    let waiting = common::spawn(ctx, process, 10, 1);
    ctx.set_thread_core_mask(waiting, 1, 0b0011).unwrap();
    assert_eq!(ctx.current_thread(1), Some(busy));

    let guest = ctx.guest_thread(caller).unwrap();
    ctx.sleep_thread(&guest, 0).unwrap();
    assert_eq!(ctx.current_thread(0), Some(caller));

    ctx.sleep_thread(&guest, -1).unwrap();
    assert_eq!(ctx.current_thread(0), Some(waiting));
    assert_eq!(ctx.thread_info(waiting).unwrap().active_core, 0);
    assert_eq!(ctx_state(&kernel, caller), ThreadState::Ready);
    assert!(ctx.audit().is_clean());
}

#[test]
fn yield_to_any_thread_leaves_the_core() {
    let (kernel, _journal) = common::boot();
    let ctx = kernel.context();
    let process = common::process(ctx, "yield-any");
    let caller = common::spawn(ctx, process, 20, 0);
    ctx.set_thread_core_mask(caller, 0, 0b0011).unwrap();
    let busy = common::spawn(ctx, process, 5, 1);
    let waiting = common::spawn(ctx, process, 40, 1);
    ctx.set_thread_core_mask(waiting, 1, 0b0011).unwrap();
    assert_eq!(ctx.current_thread(0), Some(caller));
    assert_eq!(ctx.current_thread(1), Some(busy));

    let guest = ctx.guest_thread(caller).unwrap();
    ctx.sleep_thread(&guest, -2).unwrap();
    assert_eq!(ctx.current_thread(0), Some(waiting));
    assert_eq!(ctx.current_thread(1), Some(busy));
    let info = ctx.thread_info(caller).unwrap();
    assert_eq!((info.active_core, info.state), (1, ThreadState::Ready));
    assert!(ctx.audit().is_clean());
}
