mod common;

use iomgr::interface::IoInterface;
use iomgr::reactor::ReactorInfo;
use iomgr::{IoManagerBuilder, IomgrError, IomgrState, StartOptions, ThreadRegex};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct CountingInterface {
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl IoInterface for CountingInterface {
    fn name(&self) -> &str {
        "counting"
    }

    fn on_reactor_start(&self, reactor: &ReactorInfo) {
        assert!(reactor.is_io_reactor());
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reactor_stop(&self, _reactor: &ReactorInfo) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_start_and_stop_various_sizes() {
    common::init_tracing();

    for n in [1, 2, 4] {
        let iomgr = IoManagerBuilder::new().build();
        assert_eq!(iomgr.state(), IomgrState::Stopped);
        assert!(!iomgr.is_ready());

        iomgr.start(StartOptions::new(n)).unwrap();
        assert_eq!(iomgr.state(), IomgrState::Running);
        assert_eq!(iomgr.live_reactor_count(), n);

        iomgr.stop().unwrap();
        assert_eq!(iomgr.state(), IomgrState::Stopped);
        assert_eq!(iomgr.live_reactor_count(), 0);
    }
}

#[test]
fn test_notifier_sees_every_reactor() {
    common::init_tracing();

    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));

    let iomgr = IoManagerBuilder::new().build();
    let opts = {
        let started = started.clone();
        let stopped = stopped.clone();
        StartOptions::new(3).thread_notifier(move |is_starting| {
            if is_starting {
                started.fetch_add(1, Ordering::SeqCst);
            } else {
                stopped.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    iomgr.start(opts).unwrap();
    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert_eq!(stopped.load(Ordering::SeqCst), 0);

    iomgr.stop().unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 3);
}

#[test]
fn test_wait_to_be_ready_from_another_thread() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();
    let waiter = {
        let iomgr = iomgr.clone();
        thread::spawn(move || {
            iomgr.wait_to_be_ready();
            (iomgr.state(), iomgr.live_reactor_count())
        })
    };

    thread::sleep(Duration::from_millis(20));
    iomgr.start(StartOptions::new(2)).unwrap();

    assert_eq!(waiter.join().unwrap(), (IomgrState::Running, 2));

    let stopped = {
        let iomgr = iomgr.clone();
        thread::spawn(move || iomgr.wait_to_be_stopped())
    };
    iomgr.stop().unwrap();
    stopped.join().unwrap();
}

#[test]
fn test_ensure_running_returns_when_running() {
    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(1)).unwrap();

    iomgr.ensure_running();
    iomgr.wait_for_state(IomgrState::Running);

    iomgr.stop().unwrap();
}

#[test]
fn test_restart_after_stop() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();

    for _ in 0..3 {
        iomgr.start(StartOptions::new(2)).unwrap();
        assert!(iomgr.generic_interface().is_some());
        assert_eq!(iomgr.interfaces().len(), 1);

        iomgr.stop().unwrap();
        assert!(iomgr.generic_interface().is_none());
        assert!(iomgr.interfaces().is_empty());
    }
}

#[test]
fn test_invalid_transitions_are_reported() {
    let iomgr = IoManagerBuilder::new().build();

    assert!(matches!(
        iomgr.stop(),
        Err(IomgrError::InvalidState {
            expected: IomgrState::Running,
            actual: IomgrState::Stopped,
        })
    ));

    iomgr.start(StartOptions::new(1)).unwrap();
    assert!(matches!(
        iomgr.start(StartOptions::new(1)),
        Err(IomgrError::InvalidState {
            expected: IomgrState::Stopped,
            actual: IomgrState::Running,
        })
    ));

    iomgr.stop().unwrap();
}

#[test]
fn test_interface_adder_runs_before_reactors() {
    common::init_tracing();

    let iface = Arc::new(CountingInterface::default());
    let seen_state = Arc::new(Mutex::new(None));

    let iomgr = IoManagerBuilder::new().build();
    let opts = {
        let iface = iface.clone();
        let seen_state = seen_state.clone();
        StartOptions::new(3).interface_adder(move |iomgr| {
            *seen_state.lock().unwrap() = Some(iomgr.state());
            iomgr.add_interface(iface);
        })
    };

    iomgr.start(opts).unwrap();
    assert_eq!(*seen_state.lock().unwrap(), Some(IomgrState::InterfaceInit));
    assert_eq!(iface.started.load(Ordering::SeqCst), 3);
    assert_eq!(iomgr.interfaces().len(), 2);

    iomgr.stop().unwrap();
    assert_eq!(iface.stopped.load(Ordering::SeqCst), 3);
}

#[test]
fn test_interface_added_while_running_reaches_every_reactor() {
    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(4)).unwrap();

    let iface = Arc::new(CountingInterface::default());
    iomgr.add_interface(iface.clone());

    // Hooks ran before add_interface returned.
    assert_eq!(iface.started.load(Ordering::SeqCst), 4);

    iomgr.stop().unwrap();
    assert_eq!(iface.stopped.load(Ordering::SeqCst), 4);
}

#[test]
fn test_capacity_error_leaves_manager_stopped() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().max_io_threads(2).build();

    assert!(matches!(
        iomgr.start(StartOptions::new(3)),
        Err(IomgrError::ThreadCapacity { max: 2 })
    ));
    assert_eq!(iomgr.state(), IomgrState::Stopped);
    assert_eq!(iomgr.live_reactor_count(), 0);

    iomgr.start(StartOptions::new(2)).unwrap();
    assert_eq!(iomgr.live_reactor_count(), 2);
    iomgr.stop().unwrap();
}

#[test]
fn test_zero_workers() {
    let iomgr = IoManagerBuilder::new().build();

    iomgr.start(StartOptions::new(0)).unwrap();
    assert!(iomgr.is_ready());
    assert_eq!(iomgr.run_on(ThreadRegex::AllIo, || {}, true), 0);

    iomgr.stop().unwrap();
}

#[test]
#[should_panic(expected = "max_io_threads must be > 0")]
fn test_builder_rejects_zero_threads() {
    let _ = IoManagerBuilder::new().max_io_threads(0);
}

/// Panics in the first `on_reactor_start` it sees.
#[derive(Default)]
struct FaultyInterface {
    tripped: std::sync::atomic::AtomicBool,
}

impl IoInterface for FaultyInterface {
    fn name(&self) -> &str {
        "faulty"
    }

    fn on_reactor_start(&self, _reactor: &ReactorInfo) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("reactor start hook failed");
        }
    }
}

#[test]
fn test_worker_dying_during_startup_fails_start() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();
    let opts = StartOptions::new(2).interface_adder(|iomgr| {
        iomgr.add_interface(Arc::new(FaultyInterface::default()));
    });

    let (tx, rx) = std::sync::mpsc::channel();
    {
        let iomgr = iomgr.clone();
        thread::spawn(move || {
            let _ = tx.send(iomgr.start(opts));
        });
    }

    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("start did not return");
    assert!(matches!(result, Err(IomgrError::WorkerStartup)));
    assert_eq!(iomgr.state(), IomgrState::Stopped);
    assert_eq!(iomgr.live_reactor_count(), 0);
    assert!(iomgr.interfaces().is_empty());

    // Nothing left behind: a clean start works.
    iomgr.start(StartOptions::new(2)).unwrap();
    assert_eq!(iomgr.run_on(ThreadRegex::AllWorker, || {}, true), 2);
    iomgr.stop().unwrap();
}
