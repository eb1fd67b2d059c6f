//! SPSC queue living in a POSIX shared memory object.
//!
//! Every van device owns two of these: the downlink (host writes, client
//! reads) and the uplink (client writes, host reads). The client creates both;
//! the host opens them.
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │ InitMarker      (one cache line)       │
//! ├────────────────────────────────────────┤
//! │ producer Side   (head, cached tail)    │
//! ├────────────────────────────────────────┤
//! │ consumer Side   (tail, cached head)    │
//! ├────────────────────────────────────────┤
//! │ slots: [T; N]                          │
//! └────────────────────────────────────────┘
//! ```
//!
//! An opener waits for the creator's [`InitMarker`] before touching the ring,
//! so a queue mapped mid-initialization is never used.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

use super::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmMode, ShmPath};
use crate::spsc::ring::{Local, Ring, Side, Slot};

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    #[default]
    Infinite,
    Duration(Duration),
}

impl Timeout {
    /// The instant this timeout expires, measured from now.
    #[must_use]
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(Instant::now() + d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Self::Infinite, Self::Duration)
    }
}

/// Spin-then-yield wait strategy for polling loops.
///
/// Busy-spins for the first few rounds to catch a peer that is about to
/// publish, then yields the CPU on every round.
#[derive(Debug, Default)]
pub struct Backoff {
    rounds: u32,
}

impl Backoff {
    const SPIN_ROUNDS: u32 = 64;

    #[must_use]
    pub const fn new() -> Self {
        Self { rounds: 0 }
    }

    pub fn snooze(&mut self) {
        if self.rounds < Self::SPIN_ROUNDS {
            self.rounds += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

/// Returns true once `deadline` has passed.
#[must_use]
pub fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|dl| Instant::now() >= dl)
}

const INIT_MAGIC: u64 = 0x5641_4E51_5545_5545; // "VANQUEUE"
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

unsafe impl<T: SharedMemorySafe> SharedMemorySafe for Local<T> {}
unsafe impl SharedMemorySafe for Side {}
unsafe impl<T: SharedMemorySafe> SharedMemorySafe for Slot<T> {}
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for Ring<T, N> {}

#[repr(C)]
#[repr(align(64))]
struct InitMarker(AtomicU64);

unsafe impl SharedMemorySafe for InitMarker {}

#[repr(C)]
struct IpcQueue<T, const N: usize> {
    init: InitMarker,
    ring: Ring<T, N>,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for IpcQueue<T, N> {}

impl<T: SharedMemorySafe, const N: usize> IpcQueue<T, N> {
    const NON_EMPTY: () = assert!(N > 0, "queue capacity must be greater than 0");

    /// Writes the ring sides in place and publishes the init marker last.
    /// Slots stay as the kernel handed them out (zeroed, never read before
    /// being written).
    fn init_in_place(uninit: &mut MaybeUninit<Self>) {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: ptr comes from a live, exclusively held mapping; only
        // fields are written, no reference to the whole value is formed.
        unsafe {
            addr_of_mut!((*ptr).init).write(InitMarker(AtomicU64::new(0)));
            addr_of_mut!((*ptr).ring.producer).write(Side::new());
            addr_of_mut!((*ptr).ring.consumer).write(Side::new());
            (*ptr).init.0.store(INIT_MAGIC, Ordering::Release);
        }
    }

    fn create(path: ShmPath) -> Result<Shm<Self, Creator>, ShmError> {
        let () = Self::NON_EMPTY;
        Shm::create(path, Self::init_in_place)
    }

    fn open(path: ShmPath) -> Result<Shm<Self, Opener>, ShmError> {
        let () = Self::NON_EMPTY;
        let shm = Shm::<Self, Opener>::open(path.clone())?;

        let deadline = Instant::now() + INIT_TIMEOUT;
        let mut backoff = Backoff::new();
        while shm.init.0.load(Ordering::Acquire) != INIT_MAGIC {
            if Instant::now() >= deadline {
                return Err(ShmError::InitTimeout { path: path.into() });
            }
            backoff.snooze();
        }
        Ok(shm)
    }
}

/// `Send` but not `Sync`: an endpoint may move between threads but never be
/// shared by two at once.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of a shared memory queue.
pub struct Producer<T: SharedMemorySafe, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

/// Read end of a shared memory queue.
pub struct Consumer<T: SharedMemorySafe, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: SharedMemorySafe, const N: usize> Producer<T, N, Creator> {
    /// Creates the queue; the name is removed when this end is dropped.
    ///
    /// # Errors
    ///
    /// See [`Shm::create`].
    pub fn create(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: IpcQueue::create(path)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize> Producer<T, N, Opener> {
    /// Opens a queue created elsewhere, waiting up to one second for it to be
    /// initialized.
    ///
    /// # Errors
    ///
    /// See [`Shm::open`]; [`ShmError::InitTimeout`] if the creator stalls.
    pub fn open(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: IpcQueue::open(path)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize> Consumer<T, N, Creator> {
    /// Creates the queue; the name is removed when this end is dropped.
    ///
    /// # Errors
    ///
    /// See [`Shm::create`].
    pub fn create(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: IpcQueue::create(path)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize> Consumer<T, N, Opener> {
    /// Opens a queue created elsewhere.
    ///
    /// # Errors
    ///
    /// See [`Producer::open`].
    pub fn open(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: IpcQueue::open(path)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize, Mode: ShmMode> Producer<T, N, Mode> {
    /// Pushes without waiting.
    ///
    /// # Errors
    ///
    /// Hands `item` back when the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: this endpoint is the only producer in this process and is
        // !Sync; the ring was initialized before create/open returned.
        unsafe { self.shm.ring.push(item) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shm.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: SharedMemorySafe, const N: usize, Mode: ShmMode> Consumer<T, N, Mode> {
    /// Pops without waiting.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: this endpoint is the only consumer in this process and is
        // !Sync; the ring was initialized before create/open returned.
        unsafe { self.shm.ring.pop() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shm.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    fn path(name: &str) -> ShmPath {
        let path = ShmPath::new(format!("/van-spsc-{}-{name}", std::process::id())).unwrap();
        path.unlink_stale();
        path
    }

    #[test]
    fn ring_starts_after_marker_line() {
        assert_eq!(size_of::<InitMarker>(), 64);
        assert_eq!(offset_of!(IpcQueue<u64, 4>, ring), 64);
    }

    #[test]
    fn creator_producer_opener_consumer() {
        let path = path("down");
        let producer = Producer::<u64, 4, _>::create(path.clone()).unwrap();
        let consumer = Consumer::<u64, 4, _>::open(path).unwrap();

        for i in 0..4 {
            producer.push(i).unwrap();
        }
        assert_eq!(producer.push(4), Err(4));
        assert_eq!(consumer.len(), 4);

        for i in 0..4 {
            assert_eq!(consumer.pop(), Some(i));
        }
        assert_eq!(consumer.pop(), None);
        assert!(producer.is_empty());
    }

    #[test]
    fn creator_consumer_opener_producer() {
        let path = path("up");
        let consumer = Consumer::<u64, 8, _>::create(path.clone()).unwrap();
        let producer = Producer::<u64, 8, _>::open(path).unwrap();

        producer.push(100).unwrap();
        producer.push(200).unwrap();
        assert_eq!(consumer.pop(), Some(100));
        assert_eq!(consumer.pop(), Some(200));
    }

    #[test]
    fn deadlines_expire() {
        assert!(!expired(Timeout::Infinite.deadline()));
        assert!(expired(Timeout::Duration(Duration::ZERO).deadline()));
        assert!(!expired(Timeout::Duration(Duration::from_secs(60)).deadline()));
    }

    #[test]
    fn opener_consumer_on_another_thread() {
        let path = path("thread");
        let producer = Producer::<u64, 1, _>::create(path.clone()).unwrap();
        let consumer = Consumer::<u64, 1, _>::open(path).unwrap();

        let drain = std::thread::spawn(move || {
            let mut backoff = Backoff::new();
            let mut seen = Vec::new();
            while seen.len() < 100 {
                match consumer.pop() {
                    Some(item) => seen.push(item),
                    None => backoff.snooze(),
                }
            }
            seen
        });

        let mut backoff = Backoff::new();
        for i in 0..100 {
            while producer.push(i).is_err() {
                backoff.snooze();
            }
        }
        assert_eq!(drain.join().unwrap(), (0..100).collect::<Vec<u64>>());
    }

    #[test]
    fn open_missing_queue_is_not_found() {
        let err = Consumer::<u64, 4, Opener>::open(path("missing")).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn timeout_from_option() {
        assert_eq!(Timeout::from(None), Timeout::Infinite);
        assert_eq!(
            Timeout::from(Some(Duration::from_millis(5))),
            Timeout::Duration(Duration::from_millis(5))
        );
        assert!(Timeout::Infinite.deadline().is_none());
    }
}
