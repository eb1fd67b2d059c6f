//! Devices: names, handles and the shared memory objects behind them.
//!
//! A device `/python` in namespace `van` is three shared memory objects:
//!
//! ```text
//! /van-python-dl    Frame queue, host → client   (client consumes)
//! /van-python-ul    Frame queue, client → host   (host consumes)
//! /van-python-ctl   DeviceControl: init marker, sequence counters, owner, host
//! ```
//!
//! The client creates all three when it opens the device and removes them when
//! it closes it. The host only ever opens them, and at most one host holds a
//! device at a time.

use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;

use crate::error::VanError;
use crate::frame::Frame;
use crate::ipc::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmPath};
use crate::ipc::spsc::{Backoff, Consumer, Producer};
use crate::session::{Owner, pid_alive};
use crate::trace::warn;

/// Frames each direction of a device can hold before `write` fails.
pub const DEVICE_QUEUE_CAPACITY: usize = 64;

/// Longest device name, not counting the leading `/`.
pub const MAX_NAME_LEN: usize = 64;

/// Handle returned by `Registry::open`. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A validated device name such as `/python`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceName(String);

impl DeviceName {
    /// Accepts `/` followed by 1..=64 characters from `[A-Za-z0-9_.-]`.
    ///
    /// # Errors
    ///
    /// [`VanError::InvalidName`] naming the broken rule.
    pub fn parse(name: &str) -> Result<Self, VanError> {
        let invalid = |reason| VanError::InvalidName {
            name: name.to_owned(),
            reason,
        };

        let Some(stem) = name.strip_prefix('/') else {
            return Err(invalid("name must start with '/'"));
        };
        if stem.is_empty() {
            return Err(invalid("name is empty"));
        }
        if stem.len() > MAX_NAME_LEN {
            return Err(invalid("name is longer than 64 characters"));
        }
        if !stem
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
        {
            return Err(invalid("name may only contain [A-Za-z0-9_.-] after the '/'"));
        }
        Ok(Self(name.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name without its leading `/`.
    #[must_use]
    pub fn stem(&self) -> &str {
        &self.0[1..]
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flags accepted by `Registry::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const NONE: Self = Self(0);
    /// Block in `open` until a host attached, bounded by the attach timeout.
    pub const WAIT_FOR_HOST: Self = Self(1);

    const KNOWN: u32 = Self::WAIT_FOR_HOST.0;

    /// # Errors
    ///
    /// [`VanError::InvalidFlags`] when unknown bits are set.
    pub const fn from_bits(bits: u32) -> Result<Self, VanError> {
        if bits & !Self::KNOWN != 0 {
            return Err(VanError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

const CONTROL_MAGIC: u64 = 0x5641_4E44_4556_4943; // "VANDEVIC"

/// Per-device control block shared by client and host.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct DeviceControl {
    init: AtomicU64,
    /// Highest downlink sequence number the client received with
    /// `sync_read`.
    pub(crate) acked: AtomicU64,
    /// Sequence number of the last frame any host pushed on the downlink.
    /// A newly attached host continues after it.
    pub(crate) last_sent: AtomicU64,
    owner_pid: AtomicU32,
    owner_nonce: AtomicU32,
    /// Pid of the attached host, 0 when there is none.
    host_pid: AtomicU32,
    pub(crate) client_open: AtomicBool,
}

unsafe impl SharedMemorySafe for DeviceControl {}

impl DeviceControl {
    fn init_in_place(uninit: &mut MaybeUninit<Self>, owner: Owner) {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: ptr comes from a fresh mapping nobody else reads until the
        // marker store below.
        unsafe {
            addr_of_mut!((*ptr).init).write(AtomicU64::new(0));
            addr_of_mut!((*ptr).acked).write(AtomicU64::new(0));
            addr_of_mut!((*ptr).last_sent).write(AtomicU64::new(0));
            addr_of_mut!((*ptr).owner_pid).write(AtomicU32::new(owner.pid));
            addr_of_mut!((*ptr).owner_nonce).write(AtomicU32::new(owner.nonce));
            addr_of_mut!((*ptr).host_pid).write(AtomicU32::new(0));
            addr_of_mut!((*ptr).client_open).write(AtomicBool::new(true));
            (*ptr).init.store(CONTROL_MAGIC, Ordering::Release);
        }
    }

    fn is_ready(&self) -> bool {
        self.init.load(Ordering::Acquire) == CONTROL_MAGIC
    }

    fn owner(&self) -> Owner {
        Owner {
            pid: self.owner_pid.load(Ordering::Relaxed),
            nonce: self.owner_nonce.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn has_host(&self) -> bool {
        self.host_pid.load(Ordering::Acquire) != 0
    }

    /// Marks this process as the device's host. A slot held by a process
    /// that no longer exists is taken over.
    fn claim_host(&self) -> bool {
        let me = std::process::id();
        let mut expected = 0;
        loop {
            match self
                .host_pid
                .compare_exchange(expected, me, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(holder) if holder == 0 || !pid_alive(holder) => expected = holder,
                Err(_) => return false,
            }
        }
    }

    fn release_host(&self) {
        self.host_pid.store(0, Ordering::Release);
    }
}

/// The shared memory names of one device.
#[derive(Debug, Clone)]
pub(crate) struct DevicePaths {
    pub(crate) downlink: ShmPath,
    pub(crate) uplink: ShmPath,
    pub(crate) control: ShmPath,
}

impl DevicePaths {
    pub(crate) fn new(namespace: &str, name: &DeviceName) -> Result<Self, ShmError> {
        let base = format!("/{namespace}-{}", name.stem());
        Ok(Self {
            downlink: ShmPath::new(format!("{base}-dl"))?,
            uplink: ShmPath::new(format!("{base}-ul"))?,
            control: ShmPath::new(format!("{base}-ctl"))?,
        })
    }
}

pub(crate) type Downlink<Mode> = Consumer<Frame, DEVICE_QUEUE_CAPACITY, Mode>;
pub(crate) type Uplink<Mode> = Producer<Frame, DEVICE_QUEUE_CAPACITY, Mode>;
pub(crate) type HostDownlink = Producer<Frame, DEVICE_QUEUE_CAPACITY, Opener>;
pub(crate) type HostUplink = Consumer<Frame, DEVICE_QUEUE_CAPACITY, Opener>;

/// Downlink consumer plus a frame held back by a rejected read.
pub(crate) struct Inbound {
    pub(crate) queue: Downlink<Creator>,
    pub(crate) pending: Option<Frame>,
}

impl Inbound {
    pub(crate) fn next(&mut self) -> Option<Frame> {
        self.pending.take().or_else(|| self.queue.pop())
    }
}

pub(crate) struct Outbound {
    pub(crate) queue: Uplink<Creator>,
    pub(crate) next_seq: u64,
}

/// An open device as the client session sees it.
///
/// Owns (and unlinks on drop) every shared memory object of the device. Reads
/// and writes lock `inbound` and `outbound` separately.
pub(crate) struct Device {
    pub(crate) id: DeviceId,
    pub(crate) name: DeviceName,
    pub(crate) flags: OpenFlags,
    closed: AtomicBool,
    pub(crate) inbound: Mutex<Inbound>,
    pub(crate) outbound: Mutex<Outbound>,
    pub(crate) control: Shm<DeviceControl, Creator>,
}

type DeviceObjects = (Downlink<Creator>, Uplink<Creator>, Shm<DeviceControl, Creator>);

/// Creates the queues first and the control block last, so a host that sees
/// the control block can open both queues.
fn create_objects(paths: &DevicePaths, owner: Owner) -> Result<DeviceObjects, ShmError> {
    let inbound = Downlink::create(paths.downlink.clone())?;
    let outbound = Uplink::create(paths.uplink.clone())?;
    let control = Shm::create(paths.control.clone(), |uninit| {
        DeviceControl::init_in_place(uninit, owner)
    })?;
    Ok((inbound, outbound, control))
}

/// Unlinks the device's objects when they were left by a session other than
/// `owner`'s that is gone. The caller holds the namespace, so objects with no
/// usable control block are leftovers too. Returns true if anything was
/// removed.
fn reclaim_stale(paths: &DevicePaths, owner: Owner) -> bool {
    let stale = match Shm::<DeviceControl, Opener>::open(paths.control.clone()) {
        Ok(control) if control.is_ready() => control.owner().is_stale(owner),
        Ok(_) => true,
        Err(err) => err.is_not_found() || matches!(err, ShmError::SizeMismatch { .. }),
    };
    if stale {
        for path in [&paths.downlink, &paths.uplink, &paths.control] {
            path.unlink_stale();
        }
    }
    stale
}

impl Device {
    /// Creates the device's objects. Objects of the same name left behind by
    /// a crashed session are removed first.
    pub(crate) fn create(
        id: DeviceId,
        name: DeviceName,
        flags: OpenFlags,
        paths: &DevicePaths,
        owner: Owner,
    ) -> Result<Self, ShmError> {
        let (inbound, outbound, control) = match create_objects(paths, owner) {
            Err(err) if err.is_already_exists() && reclaim_stale(paths, owner) => {
                warn!(device = %name, "removed objects left by a previous session");
                create_objects(paths, owner)?
            }
            result => result?,
        };
        Ok(Self {
            id,
            name,
            flags,
            closed: AtomicBool::new(false),
            inbound: Mutex::new(Inbound {
                queue: inbound,
                pending: None,
            }),
            outbound: Mutex::new(Outbound {
                queue: outbound,
                next_seq: 1,
            }),
            control,
        })
    }

    /// Invalidates the device for every caller, including readers blocked
    /// on it. The objects are unlinked once the last reference is gone.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.control.client_open.store(false, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until a host marks itself attached or `timeout` passes.
    pub(crate) fn wait_for_host(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        while !self.control.has_host() {
            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze();
        }
        true
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.control.client_open.store(false, Ordering::Release);
    }
}

/// Locks `mutex`, ignoring poison. Queue state lives in shared memory and
/// stays consistent across a panicking holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host side of a device. Dropping it detaches without removing anything.
pub(crate) struct HostEnd {
    pub(crate) outbound: HostDownlink,
    pub(crate) inbound: HostUplink,
    pub(crate) control: Shm<DeviceControl, Opener>,
}

impl HostEnd {
    /// Opens the device's objects, retrying until the client has created
    /// them or `timeout` passes, and claims the host slot.
    ///
    /// # Errors
    ///
    /// `Timeout` if the device does not appear in time, `HostAttached` if
    /// another live host holds it, `Shm` otherwise.
    pub(crate) fn open(
        paths: &DevicePaths,
        name: &DeviceName,
        timeout: Duration,
    ) -> Result<Self, VanError> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();

        let control = loop {
            match Shm::<DeviceControl, Opener>::open(paths.control.clone()) {
                Ok(control) if control.is_ready() => break control,
                Ok(_) => {}
                Err(err) if err.is_not_found() || matches!(err, ShmError::SizeMismatch { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            if Instant::now() >= deadline {
                return Err(VanError::Timeout);
            }
            backoff.snooze();
        };

        if !control.claim_host() {
            return Err(VanError::HostAttached(name.to_string()));
        }
        let queues = HostDownlink::open(paths.downlink.clone())
            .and_then(|outbound| Ok((outbound, HostUplink::open(paths.uplink.clone())?)));
        match queues {
            Ok((outbound, inbound)) => Ok(Self {
                outbound,
                inbound,
                control,
            }),
            Err(err) => {
                control.release_host();
                Err(err.into())
            }
        }
    }
}

impl Drop for HostEnd {
    fn drop(&mut self) {
        self.control.release_host();
    }
}
