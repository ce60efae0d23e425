mod common;

use iomgr::interface::{BackingDev, DeviceEvents, DeviceSelector, IoDevice};
use iomgr::{
    IoManager, IoManagerBuilder, IomgrError, IomgrState, StartOptions, ThreadRegex,
    ThreadStateNotifier,
};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Roles {
    io: bool,
    worker: bool,
    tight_loop: bool,
}

fn roles_on(iomgr: &Arc<IoManager>, regex: ThreadRegex) -> Vec<Roles> {
    let roles = Arc::new(Mutex::new(Vec::new()));

    {
        let roles = roles.clone();
        let me = iomgr.clone();
        iomgr.run_on(
            regex,
            move || {
                roles.lock().unwrap().push(Roles {
                    io: me.am_i_io_reactor(),
                    worker: me.am_i_worker_reactor(),
                    tight_loop: me.am_i_tight_loop_reactor(),
                });
            },
            true,
        );
    }

    let roles = roles.lock().unwrap().clone();
    roles
}

/// Runs a user reactor on a fresh thread; returns once it registered.
fn spawn_user_loop(
    iomgr: &Arc<IoManager>,
    tight_loop: bool,
    selector: Option<DeviceSelector>,
) -> JoinHandle<iomgr::Result<()>> {
    let before = iomgr.live_reactor_count();
    let started = Arc::new(AtomicUsize::new(0));

    let handle = {
        let iomgr = iomgr.clone();
        let started = started.clone();
        let notifier: ThreadStateNotifier = Arc::new(move |is_starting: bool| {
            if is_starting {
                started.fetch_add(1, Ordering::SeqCst);
            }
        });
        thread::spawn(move || iomgr.run_io_loop(tight_loop, selector, Some(notifier)))
    };

    assert!(common::wait_until(Duration::from_secs(5), || {
        started.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(iomgr.live_reactor_count(), before + 1);
    handle
}

#[test]
fn test_worker_roles() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(3)).unwrap();

    let expected = Roles {
        io: true,
        worker: true,
        tight_loop: false,
    };
    assert_eq!(roles_on(&iomgr, ThreadRegex::AllWorker), vec![expected; 3]);

    assert!(!iomgr.am_i_io_reactor());
    assert!(!iomgr.am_i_worker_reactor());
    assert_eq!(iomgr.iothread_self(), None);

    iomgr.stop().unwrap();
}

#[test]
fn test_polling_workers_are_tight_loop() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();
    iomgr
        .start(StartOptions::new(2).polling_backend(true))
        .unwrap();

    let expected = Roles {
        io: true,
        worker: true,
        tight_loop: true,
    };
    assert_eq!(roles_on(&iomgr, ThreadRegex::AllIo), vec![expected; 2]);

    iomgr.stop().unwrap();
}

#[test]
fn test_iothread_self_is_distinct_per_reactor() {
    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(4)).unwrap();

    let handles = Arc::new(Mutex::new(HashSet::new()));
    {
        let handles = handles.clone();
        let me = iomgr.clone();
        iomgr.run_on(
            ThreadRegex::AllIo,
            move || {
                handles.lock().unwrap().insert(me.iothread_self().unwrap());
            },
            true,
        );
    }

    assert_eq!(handles.lock().unwrap().len(), 4);
    iomgr.stop().unwrap();
}

#[test]
fn test_user_reactor_joins_and_leaves() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(2)).unwrap();

    let user = spawn_user_loop(&iomgr, false, None);

    let expected = Roles {
        io: true,
        worker: false,
        tight_loop: false,
    };
    assert_eq!(roles_on(&iomgr, ThreadRegex::AllUser), vec![expected]);
    assert_eq!(roles_on(&iomgr, ThreadRegex::AllIo).len(), 3);
    assert_eq!(roles_on(&iomgr, ThreadRegex::AllWorker).len(), 2);

    {
        let me = iomgr.clone();
        let reached = iomgr.run_on(
            ThreadRegex::AllUser,
            move || me.stop_io_loop().unwrap(),
            false,
        );
        assert_eq!(reached, 1);
    }

    user.join().unwrap().unwrap();
    assert_eq!(iomgr.live_reactor_count(), 2);
    assert_eq!(iomgr.run_on(ThreadRegex::AllUser, || {}, true), 0);

    iomgr.stop().unwrap();
}

#[test]
fn test_stop_releases_user_reactors() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(1)).unwrap();

    let users: Vec<_> = [false, true]
        .into_iter()
        .map(|tight| spawn_user_loop(&iomgr, tight, None))
        .collect();
    assert_eq!(iomgr.live_reactor_count(), 3);

    let tight = Roles {
        io: true,
        worker: false,
        tight_loop: true,
    };
    assert!(roles_on(&iomgr, ThreadRegex::AllUser).contains(&tight));

    iomgr.stop().unwrap();
    assert_eq!(iomgr.live_reactor_count(), 0);

    for user in users {
        user.join().unwrap().unwrap();
    }
}

#[test]
fn test_run_io_loop_needs_a_running_manager() {
    let iomgr = IoManagerBuilder::new().build();

    assert!(matches!(
        iomgr.run_io_loop(false, None, None),
        Err(IomgrError::InvalidState {
            actual: IomgrState::Stopped,
            ..
        })
    ));
    assert_eq!(iomgr.live_reactor_count(), 0);
}

#[test]
fn test_reactor_cannot_nest_a_loop() {
    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(1)).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    {
        let outcome = outcome.clone();
        let me = iomgr.clone();
        iomgr.run_on(
            ThreadRegex::AllWorker,
            move || {
                let nested = me.run_io_loop(false, None, None);
                *outcome.lock().unwrap() = Some(matches!(nested, Err(IomgrError::AlreadyAReactor)));
            },
            true,
        );
    }

    assert_eq!(*outcome.lock().unwrap(), Some(true));
    iomgr.stop().unwrap();
}

#[test]
fn test_user_reactor_respects_capacity() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().max_io_threads(2).build();
    iomgr.start(StartOptions::new(2)).unwrap();

    assert!(matches!(
        iomgr.run_io_loop(false, None, None),
        Err(IomgrError::ThreadCapacity { max: 2 })
    ));
    assert_eq!(iomgr.live_reactor_count(), 2);

    iomgr.stop().unwrap();
}

#[test]
fn test_device_selector_filters_adoption() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(1)).unwrap();

    let reject_all: DeviceSelector = Arc::new(|_dev: &IoDevice| false);
    let user = spawn_user_loop(&iomgr, false, Some(reject_all));

    let generic = iomgr.generic_interface().unwrap();
    let dev = Arc::new(IoDevice::new(BackingDev::Id(77), DeviceEvents::READ));

    // Only the worker takes it.
    assert_eq!(generic.add_io_device(dev.clone()).unwrap(), 1);
    assert_eq!(dev.owners().len(), 1);

    iomgr.stop().unwrap();
    user.join().unwrap().unwrap();
}
