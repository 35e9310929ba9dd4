use kernel_sync::{CoreMask, CriticalSection, ReleaseHandler};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    before: AtomicUsize,
    after: AtomicUsize,
    last_requested: AtomicU64,
    notified: AtomicU64,
}

struct RecordingHandler(Arc<Recorder>);

impl ReleaseHandler<Vec<u32>> for RecordingHandler {
    fn before_release(&self, state: &mut Vec<u32>, requested: CoreMask) -> CoreMask {
        self.0.before.fetch_add(1, Ordering::SeqCst);
        self.0.last_requested.store(requested, Ordering::SeqCst);
        state.push(u32::try_from(requested).unwrap_or(u32::MAX));
        requested
    }

    fn after_release(&self, cores: CoreMask) {
        self.0.after.fetch_add(1, Ordering::SeqCst);
        self.0.notified.fetch_or(cores, Ordering::SeqCst);
    }
}

#[test]
fn reentrant_enter_on_same_thread() {
    let cs = CriticalSection::new(0_u32);
    let outer = cs.enter();
    assert_eq!(outer.depth(), 1);
    {
        let inner = cs.enter();
        assert_eq!(inner.depth(), 2);
        *inner.state() += 1;
    }
    assert_eq!(cs.held_depth(), 1);
    *outer.state() += 1;
    drop(outer);
    assert_eq!(cs.held_depth(), 0);
    assert_eq!(cs.with_lock(|v| *v), 2);
}

#[test]
fn release_handler_runs_once_for_outermost_leave() {
    let rec = Arc::new(Recorder::default());
    let cs = CriticalSection::with_release_handler(
        Vec::new(),
        Box::new(RecordingHandler(Arc::clone(&rec))),
    );

    {
        let outer = cs.enter();
        outer.request_reschedule(0b0001);
        {
            let inner = cs.enter();
            inner.request_reschedule(0b0100);
        }
        // nested leave must not trigger anything
        assert_eq!(rec.before.load(Ordering::SeqCst), 0);
        outer.request_reschedule(0b0001);
    }

    assert_eq!(rec.before.load(Ordering::SeqCst), 1);
    assert_eq!(rec.after.load(Ordering::SeqCst), 1);
    assert_eq!(rec.last_requested.load(Ordering::SeqCst), 0b0101);
    assert_eq!(rec.notified.load(Ordering::SeqCst), 0b0101);

    // pending cores are consumed by the release
    drop(cs.enter());
    assert_eq!(rec.before.load(Ordering::SeqCst), 2);
    assert_eq!(rec.last_requested.load(Ordering::SeqCst), 0);
    // an empty mask is never forwarded
    assert_eq!(rec.after.load(Ordering::SeqCst), 1);
    assert_eq!(cs.with_lock(|v| v.clone()), vec![0b0101, 0]);
}

#[test]
fn try_enter_fails_while_other_thread_owns() {
    let cs = Arc::new(CriticalSection::new(()));
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let owner = {
        let cs = Arc::clone(&cs);
        thread::spawn(move || {
            let _g = cs.enter();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
    };

    held_rx.recv().unwrap();
    assert!(cs.try_enter().is_none());
    assert_eq!(cs.held_depth(), 0);
    release_tx.send(()).unwrap();
    owner.join().unwrap();
    assert!(cs.try_enter().is_some());
}

#[test]
fn enter_blocks_until_owner_leaves() {
    let cs = Arc::new(CriticalSection::new(Vec::<&'static str>::new()));
    let (held_tx, held_rx) = mpsc::channel();

    let owner = {
        let cs = Arc::clone(&cs);
        thread::spawn(move || {
            let g = cs.enter();
            held_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(30));
            g.state().push("owner");
        })
    };

    held_rx.recv().unwrap();
    cs.with_lock(|v| v.push("waiter"));
    owner.join().unwrap();
    assert_eq!(cs.with_lock(|v| v.clone()), ["owner", "waiter"]);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 2_000;

    let cs = Arc::new(CriticalSection::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cs = Arc::clone(&cs);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    let g = cs.enter();
                    assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                    {
                        // reentrant levels must not break exclusion
                        let nested = cs.enter();
                        *nested.state() += 1;
                    }
                    assert_eq!(in_cs.fetch_sub(1, Ordering::SeqCst), 1);
                    drop(g);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(cs.with_lock(|v| *v), threads * iters);
}

#[test]
#[should_panic(expected = "borrowed twice")]
fn aliasing_borrows_are_fatal() {
    let cs = CriticalSection::new(0_u8);
    let outer = cs.enter();
    let _a = outer.state();
    let inner = cs.enter();
    let _b = inner.state();
}
