//! Pluggable I/O interfaces and the devices they own.
//!
//! An interface is a provider of I/O capability (a generic fd watcher, a
//! drive backend, ...). It gets per-reactor hooks so it can set up
//! thread-local state on every reactor, and device hooks fired on the
//! reactor that adopted the device.
//!
//! Devices are identified by their [`BackingDev`]. Raw backend handles
//! (`BackingDev::Id`) are opaque to the manager: it records and routes
//! them but never interprets them.

use crate::error::{IomgrError, Result};
use crate::manager::IoManager;
use crate::reactor::ReactorInfo;
use crate::thread::{IoThread, ThreadRegex, ThreadSelector};

use bitflags::bitflags;
use parking_lot::Mutex;

use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock, Weak};

bitflags! {
    /// Event interest of a device, and readiness reported for it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceEvents: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const ERROR = 0b100;
    }
}

/// Identity of the resource behind a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingDev {
    /// A descriptor watched by the reactor backend.
    Fd(RawFd),
    /// An opaque backend handle; the reactor keeps the registration but
    /// does not poll it.
    Id(u64),
}

/// Invoked on the owning reactor when the device becomes ready.
pub type DeviceCallback = Arc<dyn Fn(&IoDevice, DeviceEvents) + Send + Sync>;

/// Filter deciding whether a reactor adopts a device.
pub type DeviceSelector = Arc<dyn Fn(&IoDevice) -> bool + Send + Sync>;

/// A device registered with the manager.
pub struct IoDevice {
    backing: BackingDev,
    scope: ThreadSelector,
    events: Mutex<DeviceEvents>,
    callback: Option<DeviceCallback>,
    interface: OnceLock<Weak<dyn IoInterface>>,
    owners: Mutex<Vec<IoThread>>,
}

impl IoDevice {
    /// Creates a device watched for `events` by every I/O reactor.
    pub fn new(backing: BackingDev, events: DeviceEvents) -> Self {
        Self {
            backing,
            scope: ThreadSelector::Regex(ThreadRegex::AllIo),
            events: Mutex::new(events),
            callback: None,
            interface: OnceLock::new(),
            owners: Mutex::new(Vec::new()),
        }
    }

    /// Restricts the reactors that adopt the device.
    pub fn with_scope(mut self, scope: impl Into<ThreadSelector>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_callback(mut self, cb: impl Fn(&IoDevice, DeviceEvents) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(cb));
        self
    }

    pub fn backing_dev(&self) -> BackingDev {
        self.backing
    }

    pub fn scope(&self) -> ThreadSelector {
        self.scope
    }

    /// Current event interest.
    pub fn events(&self) -> DeviceEvents {
        *self.events.lock()
    }

    /// Reactors currently owning the device.
    pub fn owners(&self) -> Vec<IoThread> {
        self.owners.lock().clone()
    }

    /// The interface the device was registered through.
    pub fn interface(&self) -> Option<Arc<dyn IoInterface>> {
        self.interface.get()?.upgrade()
    }

    pub(crate) fn bind_interface(&self, iface: &Arc<dyn IoInterface>) {
        let _ = self.interface.set(Arc::downgrade(iface));
    }

    pub(crate) fn set_events(&self, events: DeviceEvents) {
        *self.events.lock() = events;
    }

    pub(crate) fn add_owner(&self, thread: IoThread) {
        let mut owners = self.owners.lock();
        if !owners.contains(&thread) {
            owners.push(thread);
        }
    }

    /// Takes ownership only if no reactor owns the device yet.
    pub(crate) fn try_claim(&self, thread: IoThread) -> bool {
        let mut owners = self.owners.lock();
        if owners.is_empty() {
            owners.push(thread);
            return true;
        }
        owners.contains(&thread)
    }

    pub(crate) fn remove_owner(&self, thread: IoThread) {
        self.owners.lock().retain(|t| *t != thread);
    }

    pub(crate) fn fire(&self, ready: DeviceEvents) {
        if let Some(cb) = &self.callback {
            cb(self, ready);
        }
    }
}

impl fmt::Debug for IoDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoDevice")
            .field("backing", &self.backing)
            .field("scope", &self.scope)
            .field("events", &self.events())
            .field("owners", &self.owners())
            .finish()
    }
}

/// A provider of I/O capability.
///
/// Every hook runs on the reactor thread it concerns.
pub trait IoInterface: Send + Sync {
    fn name(&self) -> &str;

    /// A reactor came up (or the interface was added while it was running).
    fn on_reactor_start(&self, _reactor: &ReactorInfo) {}

    /// A reactor is leaving its loop.
    fn on_reactor_stop(&self, _reactor: &ReactorInfo) {}

    /// `reactor` adopted `dev`.
    fn on_device_added(&self, _dev: &IoDevice, _reactor: &ReactorInfo) {}

    /// `reactor` released `dev`.
    fn on_device_removed(&self, _dev: &IoDevice, _reactor: &ReactorInfo) {}
}

/// An interface that owns block devices.
///
/// Concrete drive I/O lives in the implementations; the manager only
/// tracks which drive interface is the default one.
pub trait DriveInterface: IoInterface {
    /// Opens `devname` and registers the resulting device.
    fn open_dev(&self, iomgr: &IoManager, devname: &str) -> Result<Arc<IoDevice>>;

    fn close_dev(&self, iomgr: &IoManager, dev: &Arc<IoDevice>) -> Result<()>;

    /// Whether the interface may be installed as the default drive interface.
    fn can_be_default(&self) -> bool {
        true
    }
}

/// The built-in interface for raw descriptors.
///
/// Registered by [`IoManager::start`]; lets collaborators watch arbitrary
/// descriptors on reactors through a readiness callback.
pub struct GenericIoInterface {
    me: Weak<GenericIoInterface>,
    iomgr: Weak<IoManager>,
}

impl GenericIoInterface {
    pub(crate) fn new(iomgr: Weak<IoManager>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            iomgr,
        })
    }

    /// Registers `dev` and hands it to the reactors in its scope.
    ///
    /// Returns the number of reactors that adopted it.
    pub fn add_io_device(&self, dev: Arc<IoDevice>) -> Result<usize> {
        let (iomgr, me) = self.upgrade()?;
        iomgr.add_io_device(&me, dev)
    }

    /// Unregisters `dev` from every reactor owning it.
    pub fn remove_io_device(&self, dev: &Arc<IoDevice>) -> Result<usize> {
        let (iomgr, _) = self.upgrade()?;
        iomgr.remove_io_device(dev)
    }

    fn upgrade(&self) -> Result<(Arc<IoManager>, Arc<dyn IoInterface>)> {
        let iomgr = self
            .iomgr
            .upgrade()
            .ok_or_else(|| IomgrError::Device("io manager dropped".into()))?;
        let me: Arc<dyn IoInterface> = self
            .me
            .upgrade()
            .ok_or_else(|| IomgrError::Device("generic interface dropped".into()))?;

        Ok((iomgr, me))
    }
}

impl IoInterface for GenericIoInterface {
    fn name(&self) -> &str {
        "generic"
    }
}
