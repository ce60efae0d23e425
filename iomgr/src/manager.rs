//! The I/O manager: lifecycle, reactor registry and every entry point.
//!
//! The manager owns no thread. Its methods run on whichever thread calls
//! them; reactor-side callbacks (`reactor_started`, `dispatch`, ...) run
//! on the reactor threads.

use crate::config::{IoManagerConfig, StartOptions, ThreadStateNotifier};
use crate::error::{IomgrError, Result};
use crate::interface::{
    BackingDev, DeviceEvents, DeviceSelector, DriveInterface, GenericIoInterface, IoDevice,
    IoInterface,
};
use crate::iobuf::{AlignedAllocator, IoBuffer, PinnedAllocator, SystemAllocator};
use crate::msg::{IomgrMsg, ModuleTable, MsgHandler, MsgModuleId, MsgType, Payload, SyncMsg};
use crate::reactor::{Reactor, ReactorFlags, ReactorShared, with_current};
use crate::state::{Countdown, IomgrState, StateMachine};
use crate::thread::{IoThread, ThreadRegex, ThreadSelector};
use crate::timer::{GlobalTimer, TimerHandle};
use crate::utils::Slab;

use parking_lot::{Mutex, RwLock};

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Module id of the manager's own message handler.
///
/// Registered at construction, so it always gets the first id.
pub const INTERNAL_MODULE: MsgModuleId = 0;

/// Live reactors, indexed by slot.
struct Registry {
    reactors: Slab<Arc<ReactorShared>>,
    /// Set once `stop` armed the shutdown latch: every reactor leaving
    /// from then on counts down, and no new reactor may register.
    draining: bool,
}

/// The I/O manager.
///
/// Created once per process by [`IoManagerBuilder`](crate::IoManagerBuilder)
/// and shared as an `Arc`. It can be started and stopped repeatedly.
pub struct IoManager {
    config: IoManagerConfig,
    me: Weak<IoManager>,

    state: StateMachine,
    start_latch: Countdown,
    stop_latch: Countdown,
    /// Set by a worker that died before reporting itself started.
    start_failed: AtomicBool,

    reactors: RwLock<Registry>,
    epoch: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,

    modules: ModuleTable,

    interfaces: RwLock<Vec<Arc<dyn IoInterface>>>,
    drive_interfaces: RwLock<Vec<Arc<dyn DriveInterface>>>,
    default_drive: RwLock<Option<Arc<dyn DriveInterface>>>,
    generic: RwLock<Option<Arc<GenericIoInterface>>>,
    devices: RwLock<HashMap<BackingDev, Arc<IoDevice>>>,

    allocator: RwLock<Arc<dyn AlignedAllocator>>,
    global_timer: GlobalTimer,
}

impl IoManager {
    /// Creates a stopped manager.
    ///
    /// # Panics
    ///
    /// Panics if `config.max_io_threads` is zero or
    /// `config.max_msg_modules` is below two.
    pub fn new(config: IoManagerConfig) -> Arc<Self> {
        assert!(config.max_io_threads > 0, "max_io_threads must be > 0");
        assert!(config.max_msg_modules > 1, "max_msg_modules must be > 1");
        assert!(config.inbox_batch > 0, "inbox_batch must be > 0");

        let iomgr = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: StateMachine::new(),
            start_latch: Countdown::new(),
            stop_latch: Countdown::new(),
            start_failed: AtomicBool::new(false),
            reactors: RwLock::new(Registry {
                reactors: Slab::with_capacity(config.max_io_threads),
                draining: false,
            }),
            epoch: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            modules: ModuleTable::new(config.max_msg_modules),
            interfaces: RwLock::new(Vec::new()),
            drive_interfaces: RwLock::new(Vec::new()),
            default_drive: RwLock::new(None),
            generic: RwLock::new(None),
            devices: RwLock::new(HashMap::new()),
            allocator: RwLock::new(Arc::new(SystemAllocator)),
            global_timer: GlobalTimer::new(),
            config,
        });

        let internal = iomgr.modules.register(Arc::new(handle_internal));
        debug_assert_eq!(internal.ok(), Some(INTERNAL_MODULE));

        iomgr
    }

    pub fn config(&self) -> &IoManagerConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Starts the worker reactors and blocks until all of them run.
    ///
    /// Registers the built-in generic interface, then runs the options'
    /// interface adder, then spawns the workers. Capacity, backend and
    /// spawn failures, as well as a worker dying during its startup, are
    /// returned after every reactor already started has been stopped
    /// again; the manager is back to `stopped` in that case.
    pub fn start(self: &Arc<Self>, opts: StartOptions) -> Result<()> {
        let StartOptions {
            num_threads,
            use_polling_backend,
            thread_notifier,
            interface_adder,
        } = opts;

        if !self.state.transition(IomgrState::Stopped, IomgrState::InterfaceInit) {
            return Err(IomgrError::InvalidState {
                expected: IomgrState::Stopped,
                actual: self.state(),
            });
        }
        tracing::info!(threads = num_threads, polling = use_polling_backend, "starting io manager");

        *self.allocator.write() = if use_polling_backend {
            Arc::new(PinnedAllocator)
        } else {
            Arc::new(SystemAllocator)
        };

        let generic = GenericIoInterface::new(self.me.clone());
        *self.generic.write() = Some(generic.clone());
        self.add_interface(generic);
        if let Some(adder) = interface_adder {
            adder(self.as_ref());
        }

        self.state.transition(IomgrState::InterfaceInit, IomgrState::ReactorInit);

        let mut flags = ReactorFlags::IO | ReactorFlags::WORKER;
        if use_polling_backend {
            flags |= ReactorFlags::TIGHT_LOOP;
        }
        let notifiers: Vec<ThreadStateNotifier> = thread_notifier.into_iter().collect();

        let mut reactors = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            match Reactor::new(self, flags, None, notifiers.clone()) {
                Ok(reactor) => reactors.push(reactor),
                Err(err) => {
                    tracing::error!(error = %err, "failed to create worker reactor");
                    for reactor in reactors {
                        self.release_io_thread(reactor.thread());
                    }
                    self.state.transition(IomgrState::ReactorInit, IomgrState::Stopping);
                    self.teardown();
                    self.state.transition(IomgrState::Stopping, IomgrState::Stopped);
                    return Err(err);
                }
            }
        }

        self.start_failed.store(false, Ordering::Release);
        self.start_latch.arm(num_threads);
        if num_threads == 0 {
            self.state.transition(IomgrState::ReactorInit, IomgrState::SysInit);
        }

        let mut spawn_err = None;
        {
            let mut workers = self.workers.lock();
            for reactor in reactors {
                let thread = reactor.thread();

                if spawn_err.is_some() {
                    drop(reactor);
                    self.abandon_worker(thread);
                    continue;
                }

                let iomgr = self.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", self.config.thread_name_prefix, thread.slot()))
                    .spawn(move || reactor.run(&iomgr));

                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(err) => {
                        self.abandon_worker(thread);
                        spawn_err = Some(err);
                    }
                }
            }
        }

        self.state.wait_until(|s| s == IomgrState::SysInit);

        let failure = match spawn_err {
            Some(err) => Some(IomgrError::Spawn(err)),
            None if self.start_failed.swap(false, Ordering::AcqRel) => Some(IomgrError::WorkerStartup),
            None => None,
        };
        if let Some(err) = failure {
            tracing::error!(error = %err, "io manager start aborted");
            self.state.transition(IomgrState::SysInit, IomgrState::Stopping);
            self.drain_reactors();
            self.teardown();
            self.state.transition(IomgrState::Stopping, IomgrState::Stopped);
            return Err(err);
        }

        self.state.transition(IomgrState::SysInit, IomgrState::Running);
        tracing::info!(reactors = self.live_reactor_count(), "io manager running");
        Ok(())
    }

    /// Stops every reactor, worker or user, and blocks until all are gone.
    ///
    /// Registries are cleared afterwards so the manager can be started
    /// again.
    ///
    /// # Panics
    ///
    /// Panics when called from a reactor thread, which would wait for
    /// itself.
    pub fn stop(&self) -> Result<()> {
        assert!(
            !self.am_i_io_reactor(),
            "IoManager::stop called from a reactor thread"
        );

        if !self.state.transition(IomgrState::Running, IomgrState::Stopping) {
            return Err(IomgrError::InvalidState {
                expected: IomgrState::Running,
                actual: self.state(),
            });
        }
        tracing::info!(reactors = self.live_reactor_count(), "stopping io manager");

        self.drain_reactors();
        self.teardown();

        self.state.transition(IomgrState::Stopping, IomgrState::Stopped);
        tracing::info!("io manager stopped");
        Ok(())
    }

    /// Turns the calling thread into a user reactor until
    /// [`stop_io_loop`](Self::stop_io_loop) runs on it or the manager stops.
    ///
    /// Only allowed while the manager is running.
    pub fn run_io_loop(
        self: &Arc<Self>,
        is_tight_loop: bool,
        device_selector: Option<DeviceSelector>,
        extra_notifier: Option<ThreadStateNotifier>,
    ) -> Result<()> {
        if self.am_i_io_reactor() {
            return Err(IomgrError::AlreadyAReactor);
        }

        let mut flags = ReactorFlags::IO;
        if is_tight_loop {
            flags |= ReactorFlags::TIGHT_LOOP;
        }

        let reactor = Reactor::new(self, flags, device_selector, extra_notifier.into_iter().collect())?;
        reactor.run(self);
        Ok(())
    }

    /// Makes the calling reactor leave its loop once the current message
    /// or callback returns.
    pub fn stop_io_loop(&self) -> Result<()> {
        with_current(|ctx| ctx.shared.request_stop()).ok_or(IomgrError::NotAReactor)
    }

    pub fn state(&self) -> IomgrState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == IomgrState::Running
    }

    pub fn wait_to_be_ready(&self) {
        self.wait_for_state(IomgrState::Running);
    }

    pub fn wait_to_be_stopped(&self) {
        self.wait_for_state(IomgrState::Stopped);
    }

    /// Blocks until the manager is in `expected`. No timeout.
    pub fn wait_for_state(&self, expected: IomgrState) {
        self.state.wait_until(|s| s == expected);
    }

    /// Returns at once if running, otherwise waits until it is.
    pub fn ensure_running(&self) {
        if !self.is_ready() {
            self.wait_to_be_ready();
        }
    }

    fn abandon_worker(&self, thread: IoThread) {
        self.release_io_thread(thread);
        self.count_down_start();
    }

    fn count_down_start(&self) {
        if self.start_latch.count_down() {
            self.state.transition(IomgrState::ReactorInit, IomgrState::SysInit);
        }
    }

    /// Asks every registered reactor to exit and waits until all did,
    /// then joins the worker threads.
    fn drain_reactors(&self) {
        let targets: Vec<Arc<ReactorShared>> = {
            let mut reg = self.reactors.write();
            reg.draining = true;
            self.stop_latch.arm(reg.reactors.len());
            reg.reactors.iter().map(|(_, r)| r.clone()).collect()
        };

        let shutdown = IomgrMsg::new(INTERNAL_MODULE, MsgType::Shutdown, Payload::Empty);
        for reactor in &targets {
            // A refused send means the reactor is already on its way out
            // and counts down by itself.
            reactor.send(shutdown.clone().into());
        }

        self.stop_latch.wait();

        let workers = mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("worker reactor panicked");
            }
        }
    }

    /// Drops everything registered during the last run.
    fn teardown(&self) {
        self.global_timer.clear();
        self.devices.write().clear();
        *self.default_drive.write() = None;
        self.drive_interfaces.write().clear();
        *self.generic.write() = None;
        self.interfaces.write().clear();
        self.reactors.write().draining = false;
    }

    // ---------------------------------------------------------------------
    // Reactor registry
    // ---------------------------------------------------------------------

    /// Reserves a registry slot for a new reactor.
    ///
    /// Workers register while the manager starts; user reactors only while
    /// it runs.
    pub(crate) fn make_io_thread(
        &self,
        flags: ReactorFlags,
        build: impl FnOnce(IoThread) -> ReactorShared,
    ) -> Result<Arc<ReactorShared>> {
        let mut reg = self.reactors.write();

        let state = self.state();
        let admitted = match state {
            IomgrState::Running => true,
            IomgrState::ReactorInit => flags.contains(ReactorFlags::WORKER),
            _ => false,
        };
        if !admitted || reg.draining {
            return Err(IomgrError::InvalidState {
                expected: IomgrState::Running,
                actual: state,
            });
        }

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let max = reg.reactors.capacity();

        let (_, shared) = reg
            .reactors
            .insert_with(|slot| Arc::new(build(IoThread { slot, epoch })))
            .map_err(|_| IomgrError::ThreadCapacity { max })?;

        tracing::debug!(slot = shared.thread.slot(), epoch, ?flags, "io thread registered");
        Ok(shared.clone())
    }

    /// Frees the slot of `thread`. Returns whether the shutdown latch
    /// expects this reactor.
    fn release_io_thread(&self, thread: IoThread) -> bool {
        let mut reg = self.reactors.write();

        let current = reg.reactors.get(thread.slot).is_some_and(|r| r.thread == thread);
        if current {
            reg.reactors.remove(thread.slot);
        }

        current && reg.draining
    }

    /// Called by a reactor once its loop is ready.
    pub(crate) fn reactor_started(&self, shared: &ReactorShared, notifiers: &[ThreadStateNotifier]) {
        for notify in notifiers {
            notify(true);
        }
        tracing::info!(slot = shared.thread.slot(), flags = ?shared.flags, "reactor started");

        if shared.flags.contains(ReactorFlags::WORKER) && self.state() == IomgrState::ReactorInit {
            self.count_down_start();
        }
    }

    /// Called by a reactor right before its thread leaves the loop.
    ///
    /// `started` is false when the reactor unwound before
    /// [`reactor_started`](Self::reactor_started); a worker doing so while
    /// the manager starts fails that start.
    pub(crate) fn reactor_stopped(
        &self,
        shared: &ReactorShared,
        notifiers: &[ThreadStateNotifier],
        started: bool,
    ) {
        if started {
            for notify in notifiers {
                notify(false);
            }
            tracing::info!(slot = shared.thread.slot(), "reactor stopped");
        } else {
            tracing::error!(slot = shared.thread.slot(), "reactor died during startup");
        }

        if self.release_io_thread(shared.thread) {
            self.stop_latch.count_down();
        }

        if !started && shared.flags.contains(ReactorFlags::WORKER) && self.state() == IomgrState::ReactorInit {
            self.start_failed.store(true, Ordering::Release);
            self.count_down_start();
        }
    }

    pub fn live_reactor_count(&self) -> usize {
        self.reactors.read().reactors.len()
    }

    /// Handle of the calling reactor.
    pub fn iothread_self(&self) -> Option<IoThread> {
        with_current(|ctx| ctx.shared.thread)
    }

    pub fn am_i_io_reactor(&self) -> bool {
        self.current_flags().contains(ReactorFlags::IO)
    }

    pub fn am_i_tight_loop_reactor(&self) -> bool {
        self.current_flags().contains(ReactorFlags::TIGHT_LOOP)
    }

    pub fn am_i_worker_reactor(&self) -> bool {
        self.current_flags().contains(ReactorFlags::WORKER)
    }

    fn current_flags(&self) -> ReactorFlags {
        with_current(|ctx| ctx.shared.flags).unwrap_or(ReactorFlags::empty())
    }

    /// Live reactors the selector designates right now, in slot order.
    fn resolve(&self, selector: ThreadSelector) -> Vec<Arc<ReactorShared>> {
        let reg = self.reactors.read();

        match selector {
            ThreadSelector::Thread(t) => reg
                .reactors
                .get(t.slot)
                .filter(|r| r.thread == t)
                .cloned()
                .into_iter()
                .collect(),
            ThreadSelector::Regex(regex) => {
                let live: Vec<&Arc<ReactorShared>> = reg.reactors.iter().map(|(_, r)| r).collect();

                regex
                    .resolve(&live, |r| r.flags, |r| r.outstanding())
                    .into_iter()
                    .map(|i| live[i].clone())
                    .collect()
            }
        }
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    /// Runs `work` on every reactor `selector` designates.
    ///
    /// Without `wait` the call returns once the work is queued, and every
    /// reactor counted will run it. With `wait` it returns once every
    /// targeted reactor has run it or gone away; the calling reactor, if
    /// targeted, runs it inline.
    ///
    /// Returns the number of reactors reached; with `wait`, the number
    /// that actually ran the work.
    pub fn run_on<F>(&self, selector: impl Into<ThreadSelector>, work: F, wait: bool) -> usize
    where
        F: Fn() + Send + Sync + 'static,
    {
        let work: Arc<dyn Fn() + Send + Sync> = Arc::new(work);

        if wait {
            self.multicast_msg_and_wait(selector, SyncMsg::run_method(INTERNAL_MODULE, work))
        } else {
            self.multicast_msg(selector, IomgrMsg::run_method(INTERNAL_MODULE, work))
        }
    }

    /// Queues `msg` to one reactor. Returns `false` if it is gone.
    pub fn send_msg(&self, thread: IoThread, msg: IomgrMsg) -> bool {
        self.multicast_msg(thread, msg) == 1
    }

    /// Delivers `msg` to one reactor and waits until it was handled.
    pub fn send_msg_and_wait(&self, thread: IoThread, msg: SyncMsg) -> bool {
        self.multicast_msg_and_wait(thread, msg) == 1
    }

    /// Queues a copy of `msg` to every reactor `selector` designates.
    pub fn multicast_msg(&self, selector: impl Into<ThreadSelector>, msg: IomgrMsg) -> usize {
        self.resolve(selector.into())
            .iter()
            .filter(|r| r.send(msg.clone().into()))
            .count()
    }

    /// Delivers `msg` to every reactor `selector` designates and waits
    /// until each of them handled it.
    ///
    /// Returns how many reactors ran the module handler. Copies lost to a
    /// reactor exiting or to an unregistered module are not counted.
    pub fn multicast_msg_and_wait(&self, selector: impl Into<ThreadSelector>, msg: SyncMsg) -> usize {
        let me = self.iothread_self();
        let mut inline = false;

        for reactor in self.resolve(selector.into()) {
            if Some(reactor.thread) == me {
                inline = true;
            } else {
                reactor.send(msg.copy_for_send());
            }
        }

        let mut executed = 0;
        if inline && self.dispatch(msg.msg()) {
            executed += 1;
        }

        executed + msg.wait()
    }

    /// Installs `handler` under the next free module id.
    pub fn register_msg_module(
        &self,
        handler: impl Fn(&IomgrMsg) + Send + Sync + 'static,
    ) -> Result<MsgModuleId> {
        let id = self.modules.register(Arc::new(handler))?;
        tracing::debug!(module_id = id, "message module registered");
        Ok(id)
    }

    pub fn get_msg_module(&self, id: MsgModuleId) -> Option<MsgHandler> {
        self.modules.get(id).cloned()
    }

    /// Hands `msg` to its module's handler on the calling reactor.
    ///
    /// Returns `false` if no handler is registered under its module id.
    pub(crate) fn dispatch(&self, msg: &IomgrMsg) -> bool {
        let Some(handler) = self.modules.get(msg.module_id()) else {
            tracing::error!(
                module_id = msg.module_id(),
                msg_type = ?msg.msg_type(),
                "message for unregistered module dropped"
            );
            return false;
        };

        handler(msg);
        true
    }

    // ---------------------------------------------------------------------
    // Interfaces and devices
    // ---------------------------------------------------------------------

    /// Registers an interface and runs its `on_reactor_start` hook on
    /// every live reactor before returning.
    pub fn add_interface(&self, iface: Arc<dyn IoInterface>) {
        tracing::info!(interface = iface.name(), "adding interface");
        self.interfaces.write().push(iface);

        let Some(iomgr) = self.me.upgrade() else {
            return;
        };
        self.run_on(
            ThreadRegex::AllIo,
            move || {
                let all = iomgr.interfaces();
                with_current(|ctx| ctx.sync_interfaces(all));
            },
            true,
        );
    }

    /// Registers a drive interface, optionally as the default one.
    pub fn add_drive_interface(&self, iface: Arc<dyn DriveInterface>, is_default: bool) -> Result<()> {
        if is_default && !iface.can_be_default() {
            return Err(IomgrError::InvalidConfig(format!(
                "drive interface {} cannot be the default",
                iface.name()
            )));
        }

        self.drive_interfaces.write().push(iface.clone());
        if is_default {
            *self.default_drive.write() = Some(iface.clone());
        }

        let io: Arc<dyn IoInterface> = iface;
        self.add_interface(io);
        Ok(())
    }

    pub fn interfaces(&self) -> Vec<Arc<dyn IoInterface>> {
        self.interfaces.read().clone()
    }

    pub fn drive_interfaces(&self) -> Vec<Arc<dyn DriveInterface>> {
        self.drive_interfaces.read().clone()
    }

    pub fn default_drive_interface(&self) -> Option<Arc<dyn DriveInterface>> {
        self.default_drive.read().clone()
    }

    /// The built-in interface for raw descriptors; present while started.
    pub fn generic_interface(&self) -> Option<Arc<GenericIoInterface>> {
        self.generic.read().clone()
    }

    /// Every registered device.
    pub fn devices(&self) -> Vec<Arc<IoDevice>> {
        self.devices.read().values().cloned().collect()
    }

    /// Registers `dev` on behalf of `iface` and has the reactors in its
    /// scope adopt it.
    ///
    /// Returns how many reactors adopted the device.
    pub fn add_io_device(&self, iface: &Arc<dyn IoInterface>, dev: Arc<IoDevice>) -> Result<usize> {
        let backing = dev.backing_dev();
        {
            let mut devices = self.devices.write();
            if devices.contains_key(&backing) {
                return Err(IomgrError::Device(format!("{backing:?} is already registered")));
            }
            dev.bind_interface(iface);
            devices.insert(backing, dev.clone());
        }

        let adopted = Arc::new(AtomicUsize::new(0));
        let work = {
            let dev = dev.clone();
            let adopted = adopted.clone();
            move || match with_current(|ctx| ctx.add_device(&dev)) {
                Some(Ok(true)) => {
                    adopted.fetch_add(1, Ordering::AcqRel);
                }
                Some(Err(err)) => {
                    tracing::warn!(device = ?dev.backing_dev(), error = %err, "device registration failed");
                }
                _ => {}
            }
        };
        self.run_on(dev.scope(), work, true);

        let adopted = adopted.load(Ordering::Acquire);
        tracing::debug!(device = ?backing, interface = iface.name(), adopted, "device added");
        Ok(adopted)
    }

    /// Unregisters `dev` and has every owning reactor release it.
    ///
    /// Returns how many reactors released the device.
    pub fn remove_io_device(&self, dev: &Arc<IoDevice>) -> Result<usize> {
        let backing = dev.backing_dev();
        if self.devices.write().remove(&backing).is_none() {
            return Err(IomgrError::Device(format!("{backing:?} is not registered")));
        }

        let released = Arc::new(AtomicUsize::new(0));
        for owner in dev.owners() {
            let dev = dev.clone();
            let released = released.clone();
            self.run_on(
                owner,
                move || {
                    if with_current(|ctx| ctx.remove_device(&dev)) == Some(true) {
                        released.fetch_add(1, Ordering::AcqRel);
                    }
                },
                true,
            );
        }

        Ok(released.load(Ordering::Acquire))
    }

    /// Re-arms `dev` for `events` on each reactor owning it.
    ///
    /// The change is applied by the owners themselves, on their own
    /// threads. Returns the number of owners reached.
    pub fn device_reschedule(&self, dev: &Arc<IoDevice>, events: DeviceEvents) -> usize {
        let msg = IomgrMsg::new(
            INTERNAL_MODULE,
            MsgType::Reschedule,
            Payload::Device {
                device: dev.clone(),
                events,
            },
        );

        dev.owners()
            .into_iter()
            .filter(|owner| self.send_msg(*owner, msg.clone()))
            .count()
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Arms a timer on the calling reactor; it fires on that same thread.
    pub fn schedule_thread_timer(
        &self,
        delay: Duration,
        recurring: bool,
        cookie: u64,
        callback: impl FnMut(u64) + 'static,
    ) -> Result<TimerHandle> {
        with_current(|ctx| {
            ctx.timer()
                .borrow_mut()
                .schedule(delay, recurring, cookie, Box::new(callback))
        })
        .ok_or(IomgrError::NotAReactor)
    }

    /// Arms a timer whose callback is dispatched through `selector` when
    /// it expires.
    pub fn schedule_global_timer(
        &self,
        delay: Duration,
        recurring: bool,
        cookie: u64,
        selector: impl Into<ThreadSelector>,
        callback: impl Fn(u64) + Send + Sync + 'static,
    ) -> TimerHandle {
        let (handle, earliest) =
            self.global_timer
                .schedule(delay, recurring, cookie, selector.into(), Arc::new(callback));

        if earliest {
            for (_, reactor) in self.reactors.read().reactors.iter() {
                reactor.wake();
            }
        }

        handle
    }

    /// Cancels a timer. Cancelling a fired one-shot timer does nothing.
    pub fn cancel_timer(&self, handle: &TimerHandle) {
        tracing::trace!(global = handle.is_global(), "timer cancelled");
        handle.cancel();
    }

    pub(crate) fn fire_global_timers(&self, now: Instant) {
        while let Some(entry) = self.global_timer.pop_due(now) {
            self.run_on(entry.selector, entry.work(), false);
        }
    }

    pub(crate) fn next_global_deadline(&self) -> Option<Instant> {
        self.global_timer.next_deadline()
    }

    // ---------------------------------------------------------------------
    // Buffers
    // ---------------------------------------------------------------------

    /// Allocates an aligned buffer from the allocator selected at start.
    pub fn iobuf_alloc(&self, align: usize, size: usize) -> Result<IoBuffer> {
        let allocator = self.allocator.read().clone();
        IoBuffer::alloc(allocator, align, size)
    }

    pub fn iobuf_free(&self, buf: IoBuffer) {
        drop(buf);
    }

    /// Resizes `buf`, keeping its leading `min(len, new_size)` bytes.
    ///
    /// On failure `buf` is left as it was.
    pub fn iobuf_realloc(&self, buf: &mut IoBuffer, align: usize, new_size: usize) -> Result<()> {
        buf.realloc(align, new_size)
    }
}

/// Handler of [`INTERNAL_MODULE`].
fn handle_internal(msg: &IomgrMsg) {
    match (msg.msg_type(), msg.payload()) {
        (MsgType::RunMethod, Payload::Method(work)) => work(),
        (MsgType::Reschedule, Payload::Device { device, events }) => {
            let rearmed = with_current(|ctx| ctx.reschedule(device, *events));
            if let Some(Err(err)) = rearmed {
                tracing::warn!(device = ?device.backing_dev(), error = %err, "device reschedule failed");
            }
        }
        (MsgType::Wakeup, _) => {}
        (MsgType::Shutdown, _) => {
            with_current(|ctx| ctx.shared.request_stop());
        }
        (msg_type, payload) => {
            tracing::error!(?msg_type, ?payload, "malformed internal message dropped");
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("state", &self.state())
            .field("reactors", &self.live_reactor_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::IoManagerBuilder;
    use crate::reactor::ReactorBackend;

    fn shared(flags: ReactorFlags) -> impl FnOnce(IoThread) -> ReactorShared {
        move |thread| {
            let (tx, _rx) = crossbeam_channel::unbounded();
            let waker = crate::reactor::PollingBackend::new().waker();
            ReactorShared::new(thread, flags, tx, waker)
        }
    }

    #[test]
    fn internal_module_takes_id_zero() {
        let iomgr = IoManagerBuilder::new().max_msg_modules(3).build();

        assert!(iomgr.get_msg_module(INTERNAL_MODULE).is_some());
        assert_eq!(iomgr.register_msg_module(|_| {}).unwrap(), 1);
        assert_eq!(iomgr.register_msg_module(|_| {}).unwrap(), 2);
        assert!(matches!(
            iomgr.register_msg_module(|_| {}),
            Err(IomgrError::ModuleCapacity { max: 3 })
        ));
    }

    #[test]
    fn slots_are_refused_while_stopped() {
        let iomgr = IoManagerBuilder::new().build();

        let err = iomgr
            .make_io_thread(ReactorFlags::IO, shared(ReactorFlags::IO))
            .unwrap_err();
        assert!(matches!(
            err,
            IomgrError::InvalidState {
                actual: IomgrState::Stopped,
                ..
            }
        ));
    }

    #[test]
    fn slot_capacity_and_stale_handles() {
        let iomgr = IoManagerBuilder::new().max_io_threads(2).build();
        iomgr.state.transition(IomgrState::Stopped, IomgrState::InterfaceInit);
        iomgr.state.transition(IomgrState::InterfaceInit, IomgrState::ReactorInit);

        let flags = ReactorFlags::IO | ReactorFlags::WORKER;
        let a = iomgr.make_io_thread(flags, shared(flags)).unwrap().thread;
        let _b = iomgr.make_io_thread(flags, shared(flags)).unwrap().thread;
        assert!(matches!(
            iomgr.make_io_thread(flags, shared(flags)),
            Err(IomgrError::ThreadCapacity { max: 2 })
        ));

        assert!(!iomgr.release_io_thread(a));
        let c = iomgr.make_io_thread(flags, shared(flags)).unwrap().thread;

        assert_eq!(c.slot(), a.slot());
        assert_ne!(c, a);
        assert!(iomgr.resolve(ThreadSelector::Thread(a)).is_empty());
        assert_eq!(iomgr.resolve(ThreadSelector::Thread(c)).len(), 1);
    }

    #[test]
    fn user_reactors_cannot_join_during_startup() {
        let iomgr = IoManagerBuilder::new().build();
        iomgr.state.transition(IomgrState::Stopped, IomgrState::InterfaceInit);
        iomgr.state.transition(IomgrState::InterfaceInit, IomgrState::ReactorInit);

        assert!(iomgr.make_io_thread(ReactorFlags::IO, shared(ReactorFlags::IO)).is_err());
    }

    #[test]
    fn role_predicates_are_false_off_reactor() {
        let iomgr = IoManagerBuilder::new().build();

        assert!(!iomgr.am_i_io_reactor());
        assert!(!iomgr.am_i_worker_reactor());
        assert!(!iomgr.am_i_tight_loop_reactor());
        assert_eq!(iomgr.iothread_self(), None);
        assert!(matches!(iomgr.stop_io_loop(), Err(IomgrError::NotAReactor)));
    }
}
