//! Cross-thread message envelope and the message-module table.
//!
//! A message is addressed to a module id; the receiving reactor looks up
//! the module's handler and invokes it on its own thread. Messages are
//! cheap to clone so a single logical message can be multicast: every
//! payload variant shares its contents through an `Arc`.

use crate::error::{IomgrError, Result};
use crate::interface::{DeviceEvents, IoDevice};

use parking_lot::{Condvar, Mutex};

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Identifier of a registered message module.
pub type MsgModuleId = u32;

/// Handler invoked on the addressed reactor for every message of its module.
pub type MsgHandler = Arc<dyn Fn(&IomgrMsg) + Send + Sync>;

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Invoke the closure carried in the payload.
    RunMethod,
    /// Re-arm a device's event interest on the receiving reactor.
    Reschedule,
    /// Only wake the reactor up.
    Wakeup,
    /// Ask the reactor to leave its loop.
    Shutdown,
    /// Module-defined message carrying a typed value.
    Custom,
}

/// Message payload, matched exhaustively by the handlers.
#[derive(Clone)]
pub enum Payload {
    Empty,
    Method(Arc<dyn Fn() + Send + Sync>),
    Device {
        device: Arc<IoDevice>,
        events: DeviceEvents,
    },
    Value(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("Empty"),
            Payload::Method(_) => f.write_str("Method(..)"),
            Payload::Device { device, events } => f
                .debug_struct("Device")
                .field("device", &device.backing_dev())
                .field("events", events)
                .finish(),
            Payload::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// Completion signal shared by every copy of a synchronous message.
///
/// The sender records one expected completion per reactor it queued the
/// message to and then blocks until every [`Ticket`] has been dropped.
/// Only tickets whose handler actually ran are counted as executed.
pub(crate) struct Completion {
    progress: Mutex<Progress>,
    cv: Condvar,
}

#[derive(Default)]
struct Progress {
    pending: usize,
    executed: usize,
}

impl Completion {
    fn new() -> Self {
        Self {
            progress: Mutex::new(Progress::default()),
            cv: Condvar::new(),
        }
    }

    fn expect_one(&self) {
        self.progress.lock().pending += 1;
    }

    fn done(&self, executed: bool) {
        let mut progress = self.progress.lock();
        assert!(progress.pending > 0, "sync message completed more often than sent");
        progress.pending -= 1;
        if executed {
            progress.executed += 1;
        }

        if progress.pending == 0 {
            self.cv.notify_all();
        }
    }

    /// Blocks until nothing is pending; returns how many copies ran.
    fn wait(&self) -> usize {
        let mut progress = self.progress.lock();
        while progress.pending > 0 {
            self.cv.wait(&mut progress);
        }
        progress.executed
    }
}

/// One outstanding delivery of a synchronous message.
///
/// Travels next to the message copy through the inbox and signals the
/// sender when dropped. A ticket dropped without [`executed`](Self::executed)
/// (failed send, panicking handler, unknown module) releases the sender
/// without counting as a delivery.
pub(crate) struct Ticket {
    completion: Arc<Completion>,
    executed: bool,
}

impl Ticket {
    /// Marks the copy as handled and releases it.
    pub(crate) fn executed(mut self) {
        self.executed = true;
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.completion.done(self.executed);
    }
}

/// What actually sits in a reactor inbox.
pub(crate) struct Envelope {
    pub(crate) msg: IomgrMsg,
    pub(crate) ticket: Option<Ticket>,
}

impl From<IomgrMsg> for Envelope {
    fn from(msg: IomgrMsg) -> Self {
        Self { msg, ticket: None }
    }
}

/// A unit of cross-thread work.
///
/// Immutable once built. Delivered once to each reactor it is sent to and
/// never retried.
#[derive(Clone)]
pub struct IomgrMsg {
    module_id: MsgModuleId,
    msg_type: MsgType,
    payload: Payload,
    sync: bool,
}

impl IomgrMsg {
    pub fn new(module_id: MsgModuleId, msg_type: MsgType, payload: Payload) -> Self {
        Self {
            module_id,
            msg_type,
            payload,
            sync: false,
        }
    }

    /// Builds a [`MsgType::Custom`] message carrying `value`.
    pub fn custom<T>(module_id: MsgModuleId, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self::new(module_id, MsgType::Custom, Payload::Value(Arc::new(value)))
    }

    pub(crate) fn run_method(module_id: MsgModuleId, f: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self::new(module_id, MsgType::RunMethod, Payload::Method(f))
    }

    pub fn module_id(&self) -> MsgModuleId {
        self.module_id
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns the typed value of a [`Payload::Value`] message.
    pub fn value<T: Any>(&self) -> Option<&T> {
        match &self.payload {
            Payload::Value(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Whether the sender is blocked until this message is processed.
    pub fn is_sync(&self) -> bool {
        self.sync
    }
}

impl fmt::Debug for IomgrMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IomgrMsg")
            .field("module_id", &self.module_id)
            .field("msg_type", &self.msg_type)
            .field("payload", &self.payload)
            .field("sync", &self.is_sync())
            .finish()
    }
}

/// A message whose sender waits for every receiver to process it.
///
/// One `SyncMsg` can be queued to many reactors; all copies share the
/// same completion signal.
pub struct SyncMsg {
    msg: IomgrMsg,
    completion: Arc<Completion>,
}

impl SyncMsg {
    pub fn new(module_id: MsgModuleId, msg_type: MsgType, payload: Payload) -> Self {
        let mut msg = IomgrMsg::new(module_id, msg_type, payload);
        msg.sync = true;

        Self {
            msg,
            completion: Arc::new(Completion::new()),
        }
    }

    pub(crate) fn run_method(module_id: MsgModuleId, f: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self::new(module_id, MsgType::RunMethod, Payload::Method(f))
    }

    pub fn msg(&self) -> &IomgrMsg {
        &self.msg
    }

    /// Produces the copy handed to one more receiver.
    pub(crate) fn copy_for_send(&self) -> Envelope {
        self.completion.expect_one();
        Envelope {
            msg: self.msg.clone(),
            ticket: Some(Ticket {
                completion: self.completion.clone(),
                executed: false,
            }),
        }
    }

    /// Blocks until every copy handed out so far has been consumed.
    /// Returns how many of them were handled.
    pub(crate) fn wait(&self) -> usize {
        self.completion.wait()
    }
}

/// Fixed-capacity table of message handlers.
///
/// Registration is serialized by a mutex; lookups are lock-free since a
/// slot is written exactly once.
pub(crate) struct ModuleTable {
    handlers: Box<[OnceLock<MsgHandler>]>,
    count: Mutex<usize>,
}

impl ModuleTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            handlers: (0..capacity).map(|_| OnceLock::new()).collect(),
            count: Mutex::new(0),
        }
    }

    pub(crate) fn register(&self, handler: MsgHandler) -> Result<MsgModuleId> {
        let mut count = self.count.lock();
        let id = *count;

        let Some(slot) = self.handlers.get(id) else {
            return Err(IomgrError::ModuleCapacity {
                max: self.handlers.len(),
            });
        };

        if slot.set(handler).is_err() {
            unreachable!("message module slot {id} registered twice");
        }
        *count += 1;

        Ok(id as MsgModuleId)
    }

    pub(crate) fn get(&self, id: MsgModuleId) -> Option<&MsgHandler> {
        self.handlers.get(id as usize)?.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    fn noop() -> MsgHandler {
        Arc::new(|_msg: &IomgrMsg| {})
    }

    #[test]
    fn table_rejects_registration_past_capacity() {
        let table = ModuleTable::new(2);

        assert_eq!(table.register(noop()).unwrap(), 0);
        assert_eq!(table.register(noop()).unwrap(), 1);
        assert!(matches!(
            table.register(noop()),
            Err(IomgrError::ModuleCapacity { max: 2 })
        ));
    }

    #[test]
    fn unregistered_id_has_no_handler() {
        let table = ModuleTable::new(4);
        table.register(noop()).unwrap();

        assert!(table.get(0).is_some());
        assert!(table.get(1).is_none());
        assert!(table.get(99).is_none());
    }

    #[test]
    fn custom_payload_downcasts() {
        let msg = IomgrMsg::custom(3, 42u64);

        assert_eq!(msg.msg_type(), MsgType::Custom);
        assert_eq!(msg.value::<u64>(), Some(&42));
        assert_eq!(msg.value::<u32>(), None);
        assert!(!msg.is_sync());
    }

    #[test]
    fn sync_msg_waits_for_every_copy() {
        let smsg = SyncMsg::new(0, MsgType::Wakeup, Payload::Empty);
        let copies: Vec<Envelope> = (0..3).map(|_| smsg.copy_for_send()).collect();
        assert!(copies.iter().all(|env| env.msg.is_sync()));

        let consumed = Arc::new(Mutex::new(0));
        let handle = {
            let consumed = consumed.clone();
            thread::spawn(move || {
                for copy in copies {
                    thread::sleep(Duration::from_millis(5));
                    *consumed.lock() += 1;
                    if let Some(ticket) = copy.ticket {
                        ticket.executed();
                    }
                }
            })
        };

        assert_eq!(smsg.wait(), 3);
        assert_eq!(*consumed.lock(), 3);
        handle.join().unwrap();
    }

    #[test]
    fn discarded_copy_does_not_block() {
        let smsg = SyncMsg::new(0, MsgType::Wakeup, Payload::Empty);
        let (tx, rx) = crossbeam_channel::unbounded::<Envelope>();

        tx.send(smsg.copy_for_send()).unwrap();
        drop(rx);

        assert_eq!(smsg.wait(), 0);
    }

    #[test]
    fn only_executed_copies_are_counted() {
        let smsg = SyncMsg::new(0, MsgType::Wakeup, Payload::Empty);
        let handled = smsg.copy_for_send();
        let dropped = smsg.copy_for_send();

        if let Some(ticket) = handled.ticket {
            ticket.executed();
        }
        drop(dropped);

        assert_eq!(smsg.wait(), 1);
    }

    #[test]
    fn async_envelope_has_no_ticket() {
        let env = Envelope::from(IomgrMsg::new(1, MsgType::Wakeup, Payload::Empty));

        assert!(env.ticket.is_none());
        assert!(!env.msg.is_sync());
    }

    proptest! {
        #[test]
        fn module_ids_are_unique_up_to_capacity(capacity in 1usize..64, extra in 0usize..8) {
            let table = ModuleTable::new(capacity);
            let mut ids = HashSet::new();

            for _ in 0..capacity {
                let id = table.register(noop()).unwrap();
                prop_assert!(ids.insert(id));
            }
            for _ in 0..extra {
                prop_assert!(table.register(noop()).is_err());
            }
        }
    }
}
