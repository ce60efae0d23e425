//! Per-reactor and global timers.
//!
//! Both flavours keep their entries in a min-heap ordered by deadline.
//! Cancellation never touches the heap: the handle flips a flag shared
//! with the entry and the owning timer drops the entry when it comes due.

use crate::thread::ThreadSelector;

use parking_lot::Mutex;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

/// Callback of a reactor-local timer. Runs on the reactor that armed it.
pub type ThreadTimerCallback = Box<dyn FnMut(u64)>;

/// Callback of a global timer. Dispatched to the reactors its selector
/// resolves to.
pub type GlobalTimerCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Shortest re-arm interval; keeps a zero-period recurring timer from
/// firing more than once per reactor iteration.
const MIN_PERIOD: Duration = Duration::from_nanos(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Thread,
    Global,
}

/// Cancellable reference to a scheduled timer.
#[derive(Clone)]
pub struct TimerHandle {
    kind: TimerKind,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Prevents every future firing. Idempotent; a no-op on a one-shot
    /// timer that already fired.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    pub fn is_global(&self) -> bool {
        self.kind == TimerKind::Global
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("kind", &self.kind)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Heap bookkeeping shared by both timer flavours.
struct Schedule {
    deadline: Instant,
    /// Insertion order; breaks deadline ties first-in first-out.
    seq: u64,
    period: Option<Duration>,
    cookie: u64,
    cancelled: Arc<AtomicBool>,
}

impl Schedule {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Moves a recurring deadline forward. Returns `false` for one-shot
    /// or cancelled timers.
    fn rearm(&mut self, now: Instant, seq: u64) -> bool {
        match self.period {
            Some(period) if !self.is_cancelled() => {
                self.deadline = now + period.max(MIN_PERIOD);
                self.seq = seq;
                true
            }
            _ => false,
        }
    }

    fn key(&self) -> (Instant, u64) {
        (self.deadline, self.seq)
    }
}

macro_rules! heap_order {
    ($entry:ty) => {
        impl Eq for $entry {}

        impl PartialEq for $entry {
            fn eq(&self, other: &Self) -> bool {
                self.schedule.key() == other.schedule.key()
            }
        }

        impl Ord for $entry {
            /// Reversed so that a `BinaryHeap` pops the earliest deadline.
            fn cmp(&self, other: &Self) -> Ordering {
                other.schedule.key().cmp(&self.schedule.key())
            }
        }

        impl PartialOrd for $entry {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
    };
}

/// An armed reactor-local timer.
pub(crate) struct ThreadTimerEntry {
    schedule: Schedule,
    callback: ThreadTimerCallback,
}

heap_order!(ThreadTimerEntry);

impl ThreadTimerEntry {
    pub(crate) fn fire(&mut self) {
        if !self.schedule.is_cancelled() {
            (self.callback)(self.schedule.cookie);
        }
    }
}

/// The timer instance owned by one reactor.
pub(crate) struct ThreadTimer {
    heap: BinaryHeap<ThreadTimerEntry>,
    seq: u64,
}

impl ThreadTimer {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn schedule(
        &mut self,
        delay: Duration,
        recurring: bool,
        cookie: u64,
        callback: ThreadTimerCallback,
    ) -> TimerHandle {
        let handle = TimerHandle::new(TimerKind::Thread);
        let seq = self.next_seq();

        self.heap.push(ThreadTimerEntry {
            schedule: Schedule {
                deadline: Instant::now() + delay,
                seq,
                period: recurring.then_some(delay),
                cookie,
                cancelled: handle.cancelled.clone(),
            },
            callback,
        });

        handle
    }

    /// Earliest deadline still armed.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if !top.schedule.is_cancelled() {
                return Some(top.schedule.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops one entry due at `now`, skipping cancelled ones.
    ///
    /// The caller fires it without borrowing the timer, then hands it back
    /// through [`rearm`](Self::rearm).
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<ThreadTimerEntry> {
        loop {
            let top = self.heap.peek()?;
            if top.schedule.deadline > now {
                return None;
            }

            let entry = self.heap.pop()?;
            if !entry.schedule.is_cancelled() {
                return Some(entry);
            }
        }
    }

    pub(crate) fn rearm(&mut self, mut entry: ThreadTimerEntry, now: Instant) {
        let seq = self.next_seq();
        if entry.schedule.rearm(now, seq) {
            self.heap.push(entry);
        }
    }
}

/// An armed global timer.
pub(crate) struct GlobalTimerEntry {
    schedule: Schedule,
    pub(crate) selector: ThreadSelector,
    callback: GlobalTimerCallback,
}

heap_order!(GlobalTimerEntry);

impl GlobalTimerEntry {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.schedule.is_cancelled()
    }

    /// Work to dispatch to the selector's reactors for this firing.
    pub(crate) fn work(&self) -> impl Fn() + Send + Sync + 'static {
        let callback = self.callback.clone();
        let cookie = self.schedule.cookie;
        let cancelled = self.schedule.cancelled.clone();

        move || {
            if !cancelled.load(AtomicOrdering::Acquire) {
                callback(cookie)
            }
        }
    }
}

/// Sentinel of [`GlobalTimer::earliest`] for an empty heap.
const NO_DEADLINE: u64 = u64::MAX;

/// Timers shared by every reactor.
///
/// There is no timer thread: each reactor iteration pops due entries, and
/// whichever reactor pops one dispatches it through the selector. The top
/// deadline is mirrored in an atomic so that iterations with nothing due
/// never take the lock.
pub(crate) struct GlobalTimer {
    heap: Mutex<BinaryHeap<GlobalTimerEntry>>,
    seq: AtomicU64,
    base: Instant,
    /// Nanoseconds from `base` to the top entry's deadline, rounded down.
    /// Only written with `heap` locked.
    earliest: AtomicU64,
}

impl GlobalTimer {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            base: Instant::now(),
            earliest: AtomicU64::new(NO_DEADLINE),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    fn offset(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.base).as_nanos();
        u64::try_from(nanos).unwrap_or(NO_DEADLINE - 1).min(NO_DEADLINE - 1)
    }

    fn publish(&self, heap: &BinaryHeap<GlobalTimerEntry>) {
        let next = heap
            .peek()
            .map_or(NO_DEADLINE, |top| self.offset(top.schedule.deadline));
        self.earliest.store(next, AtomicOrdering::Release);
    }

    /// Arms a global timer. Returns the handle and whether the new entry
    /// became the earliest one, in which case sleeping reactors must be
    /// woken to shorten their wait.
    pub(crate) fn schedule(
        &self,
        delay: Duration,
        recurring: bool,
        cookie: u64,
        selector: ThreadSelector,
        callback: GlobalTimerCallback,
    ) -> (TimerHandle, bool) {
        let handle = TimerHandle::new(TimerKind::Global);
        let deadline = Instant::now() + delay;
        let seq = self.next_seq();

        let mut heap = self.heap.lock();
        let earliest = heap.peek().is_none_or(|top| deadline < top.schedule.deadline);

        heap.push(GlobalTimerEntry {
            schedule: Schedule {
                deadline,
                seq,
                period: recurring.then_some(delay),
                cookie,
                cancelled: handle.cancelled.clone(),
            },
            selector,
            callback,
        });
        self.publish(&heap);

        (handle, earliest)
    }

    /// Earliest armed deadline, read without locking.
    ///
    /// May name a cancelled entry; it is discarded once due, so a reactor
    /// at worst wakes up for nothing.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match self.earliest.load(AtomicOrdering::Acquire) {
            NO_DEADLINE => None,
            nanos => Some(self.base + Duration::from_nanos(nanos)),
        }
    }

    /// Pops one due entry and, if recurring, re-arms a copy of it before
    /// releasing the lock so that no other reactor fires it twice.
    pub(crate) fn pop_due(&self, now: Instant) -> Option<GlobalTimerEntry> {
        let earliest = self.earliest.load(AtomicOrdering::Acquire);
        if earliest == NO_DEADLINE || self.offset(now) < earliest {
            return None;
        }

        let mut heap = self.heap.lock();
        let popped = Self::pop_locked(&mut heap, now, || self.next_seq());
        self.publish(&heap);
        popped
    }

    fn pop_locked(
        heap: &mut BinaryHeap<GlobalTimerEntry>,
        now: Instant,
        mut next_seq: impl FnMut() -> u64,
    ) -> Option<GlobalTimerEntry> {
        loop {
            let top = heap.peek()?;
            if top.schedule.deadline > now {
                return None;
            }

            let entry = heap.pop()?;
            if entry.is_cancelled() {
                continue;
            }

            if let Some(period) = entry.schedule.period {
                heap.push(GlobalTimerEntry {
                    schedule: Schedule {
                        deadline: now + period.max(MIN_PERIOD),
                        seq: next_seq(),
                        period: Some(period),
                        cookie: entry.schedule.cookie,
                        cancelled: entry.schedule.cancelled.clone(),
                    },
                    selector: entry.selector,
                    callback: entry.callback.clone(),
                });
            }

            return Some(entry);
        }
    }

    pub(crate) fn clear(&self) {
        let mut heap = self.heap.lock();
        heap.clear();
        self.publish(&heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::thread::ThreadRegex;

    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<u64>>>, impl Fn(u64) -> ThreadTimerCallback) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |_: u64| -> ThreadTimerCallback {
                let log = log.clone();
                Box::new(move |cookie| log.borrow_mut().push(cookie))
            }
        };
        (log, make)
    }

    fn drain(timer: &mut ThreadTimer, now: Instant) {
        while let Some(mut entry) = timer.pop_due(now) {
            entry.fire();
            timer.rearm(entry, now);
        }
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut timer = ThreadTimer::new();
        let (log, cb) = recorder();

        timer.schedule(Duration::from_millis(20), false, 2, cb(0));
        timer.schedule(Duration::from_millis(10), false, 1, cb(0));
        timer.schedule(Duration::from_millis(10), false, 3, cb(0));

        drain(&mut timer, Instant::now() + Duration::from_millis(50));

        assert_eq!(*log.borrow(), vec![1, 3, 2]);
        assert_eq!(timer.next_deadline(), None);
    }

    #[test]
    fn nothing_fires_before_deadline() {
        let mut timer = ThreadTimer::new();
        let (log, cb) = recorder();

        timer.schedule(Duration::from_secs(60), false, 1, cb(0));
        drain(&mut timer, Instant::now());

        assert!(log.borrow().is_empty());
        assert!(timer.next_deadline().is_some());
    }

    #[test]
    fn cancel_after_one_shot_fired_is_noop() {
        let mut timer = ThreadTimer::new();
        let (log, cb) = recorder();

        let handle = timer.schedule(Duration::ZERO, false, 7, cb(0));
        drain(&mut timer, Instant::now() + Duration::from_millis(1));
        handle.cancel();
        handle.cancel();

        assert_eq!(*log.borrow(), vec![7]);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn cancelled_recurring_timer_stops_firing() {
        let mut timer = ThreadTimer::new();
        let (log, cb) = recorder();

        let handle = timer.schedule(Duration::from_millis(1), true, 9, cb(0));
        let mut now = Instant::now();

        for _ in 0..3 {
            now += Duration::from_millis(2);
            drain(&mut timer, now);
        }
        assert_eq!(log.borrow().len(), 3);

        handle.cancel();
        now += Duration::from_millis(2);
        drain(&mut timer, now);

        assert_eq!(log.borrow().len(), 3);
        assert_eq!(timer.next_deadline(), None);
    }

    #[test]
    fn global_recurring_entry_is_rearmed_on_pop() {
        let timer = GlobalTimer::new();
        let (handle, earliest) = timer.schedule(
            Duration::from_millis(1),
            true,
            0,
            ThreadSelector::Regex(ThreadRegex::AllWorker),
            Arc::new(|_: u64| {}),
        );
        assert!(earliest);

        let now = Instant::now() + Duration::from_millis(5);
        assert!(timer.pop_due(now).is_some());
        assert!(timer.pop_due(now).is_none());
        assert!(timer.next_deadline().is_some());

        handle.cancel();
        assert!(timer.pop_due(now + Duration::from_secs(1)).is_none());
        assert!(timer.next_deadline().is_none());
    }

    #[test]
    fn idle_global_timer_is_checked_without_locking() {
        let timer = GlobalTimer::new();
        let selector = ThreadSelector::Regex(ThreadRegex::AllIo);

        let guard = timer.heap.lock();
        assert!(timer.pop_due(Instant::now()).is_none());
        assert!(timer.next_deadline().is_none());
        drop(guard);

        let before = Instant::now();
        timer.schedule(Duration::from_secs(5), false, 0, selector, Arc::new(|_: u64| {}));
        timer.schedule(Duration::from_millis(10), false, 0, selector, Arc::new(|_: u64| {}));

        let guard = timer.heap.lock();
        assert!(timer.pop_due(Instant::now()).is_none());
        let next = timer.next_deadline().unwrap();
        drop(guard);

        assert!(next >= before + Duration::from_millis(10) - Duration::from_nanos(1));
        assert!(next < before + Duration::from_secs(1));

        // Once due, the cached deadline moves on to the next entry.
        assert!(timer.pop_due(next + Duration::from_millis(1)).is_some());
        assert!(timer.next_deadline().unwrap() > before + Duration::from_secs(4));

        timer.clear();
        assert!(timer.next_deadline().is_none());
    }

    #[test]
    fn later_global_timer_is_not_earliest() {
        let timer = GlobalTimer::new();
        let selector = ThreadSelector::Regex(ThreadRegex::AllIo);

        let (_a, first) = timer.schedule(Duration::from_millis(5), false, 0, selector, Arc::new(|_: u64| {}));
        let (_b, second) = timer.schedule(Duration::from_secs(5), false, 0, selector, Arc::new(|_: u64| {}));
        let (_c, third) = timer.schedule(Duration::ZERO, false, 0, selector, Arc::new(|_: u64| {}));

        assert!(first);
        assert!(!second);
        assert!(third);
    }
}
