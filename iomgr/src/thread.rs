//! Reactor addressing: thread handles and the thread-selection algebra.

use crate::reactor::ReactorFlags;

use rand::Rng;

use std::fmt;

/// Opaque, copyable reference to a reactor.
///
/// The handle records the reactor's registry slot together with the
/// epoch the slot had when the reactor registered. Slots are reused once
/// a reactor is torn down; a handle to the previous owner then simply
/// stops resolving instead of addressing the newcomer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoThread {
    pub(crate) slot: usize,
    pub(crate) epoch: u64,
}

impl IoThread {
    /// Registry slot of the reactor.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl fmt::Display for IoThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "io_thread#{}.{}", self.slot, self.epoch)
    }
}

/// A named group of reactors, resolved against the live reactor set at
/// dispatch time.
///
/// Worker reactors are the ones spawned by [`IoManager::start`]; user
/// reactors are threads that entered [`IoManager::run_io_loop`]
/// themselves. Every reactor is an I/O reactor.
///
/// The `LeastBusy*` variants pick the reactor with the fewest messages
/// waiting in its inbox, ties going to the lowest slot.
///
/// [`IoManager::start`]: crate::IoManager::start
/// [`IoManager::run_io_loop`]: crate::IoManager::run_io_loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRegex {
    AllIo,
    LeastBusyIo,
    AllWorker,
    LeastBusyWorker,
    RandomWorker,
    AllUser,
    LeastBusyUser,
}

impl ThreadRegex {
    /// Whether a reactor with `flags` belongs to the group.
    pub(crate) fn admits(self, flags: ReactorFlags) -> bool {
        match self {
            ThreadRegex::AllIo | ThreadRegex::LeastBusyIo => flags.contains(ReactorFlags::IO),
            ThreadRegex::AllWorker | ThreadRegex::LeastBusyWorker | ThreadRegex::RandomWorker => {
                flags.contains(ReactorFlags::IO | ReactorFlags::WORKER)
            }
            ThreadRegex::AllUser | ThreadRegex::LeastBusyUser => {
                flags.contains(ReactorFlags::IO) && !flags.contains(ReactorFlags::WORKER)
            }
        }
    }

    /// Whether the regex addresses every member of its group rather than
    /// a single chosen one.
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            ThreadRegex::AllIo | ThreadRegex::AllWorker | ThreadRegex::AllUser
        )
    }

    /// Resolves the regex against `candidates`, which must be ordered by
    /// slot. Returns the positions of the chosen candidates.
    pub(crate) fn resolve<T>(
        self,
        candidates: &[T],
        flags: impl Fn(&T) -> ReactorFlags,
        load: impl Fn(&T) -> usize,
    ) -> Vec<usize> {
        let matching = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| self.admits(flags(*c)))
            .map(|(i, _)| i);

        match self {
            ThreadRegex::AllIo | ThreadRegex::AllWorker | ThreadRegex::AllUser => matching.collect(),

            ThreadRegex::LeastBusyIo
            | ThreadRegex::LeastBusyWorker
            | ThreadRegex::LeastBusyUser => matching
                .min_by_key(|&i| (load(&candidates[i]), i))
                .into_iter()
                .collect(),

            ThreadRegex::RandomWorker => {
                let pool: Vec<usize> = matching.collect();
                if pool.is_empty() {
                    return pool;
                }

                let pick = rand::thread_rng().gen_range(0..pool.len());
                vec![pool[pick]]
            }
        }
    }
}

/// Target of a dispatch: one specific reactor or a [`ThreadRegex`] group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadSelector {
    Thread(IoThread),
    Regex(ThreadRegex),
}

impl From<IoThread> for ThreadSelector {
    fn from(thread: IoThread) -> Self {
        ThreadSelector::Thread(thread)
    }
}

impl From<ThreadRegex> for ThreadSelector {
    fn from(regex: ThreadRegex) -> Self {
        ThreadSelector::Regex(regex)
    }
}
