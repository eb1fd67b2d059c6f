//! Session lifecycle: `init`, `set_trace`, `exit`.
//!
//! A [`Session`] is the context every other call hangs off. Registry and
//! transport handles are built from it and share its state, so closing the
//! session invalidates them without any process-global flag.
//!
//! ```text
//!   Uninitialized ──init──▶ Initialized ──exit──▶ ShutDown
//!                            │    ▲
//!                            └────┘ init (no-op)
//! ```
//!
//! While initialized, the session publishes a small block at
//! `/<namespace>-session` so a host can tell a live client from leftovers.
//! A block whose owning process is gone is removed by the next `init` in the
//! namespace.

use std::collections::BTreeMap;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rustix::io::Errno;
use rustix::process::{Pid, test_kill_process};

use crate::config::VanConfig;
use crate::device::{Device, DeviceId, lock};
use crate::error::{Result, VanError};
use crate::ipc::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmPath};
use crate::registry::Registry;
use crate::trace::{TraceLevel, debug, info, warn};
use crate::transport::Transport;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Initialized = 1,
    /// Terminal: a session that exited cannot be initialized again.
    ShutDown = 2,
}

impl SessionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            _ => Self::ShutDown,
        }
    }
}

pub(crate) const SESSION_MAGIC: u64 = 0x5641_4E53_4553_534E; // "VANSESSN"

/// Session presence block shared with hosts.
#[repr(C)]
pub(crate) struct SessionBlock {
    pub(crate) magic: AtomicU64,
    pub(crate) pid: AtomicU32,
    /// Random per session, distinguishes a restarted client reusing a pid.
    pub(crate) nonce: AtomicU32,
    pub(crate) trace_level: AtomicU32,
}

unsafe impl SharedMemorySafe for SessionBlock {}

impl SessionBlock {
    fn init_in_place(uninit: &mut MaybeUninit<Self>, owner: Owner, trace_level: u32) {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: fresh exclusive mapping; hosts only trust it after the
        // magic store.
        unsafe {
            addr_of_mut!((*ptr).magic).write(AtomicU64::new(0));
            addr_of_mut!((*ptr).pid).write(AtomicU32::new(owner.pid));
            addr_of_mut!((*ptr).nonce).write(AtomicU32::new(owner.nonce));
            addr_of_mut!((*ptr).trace_level).write(AtomicU32::new(trace_level));
            (*ptr).magic.store(SESSION_MAGIC, Ordering::Release);
        }
    }

    fn create(
        path: ShmPath,
        owner: Owner,
        trace_level: u32,
    ) -> std::result::Result<Shm<Self, Creator>, ShmError> {
        Shm::create(path, |uninit| Self::init_in_place(uninit, owner, trace_level))
    }

    /// Initialized by a client process that is still running.
    pub(crate) fn is_live(&self) -> bool {
        self.magic.load(Ordering::Acquire) == SESSION_MAGIC
            && pid_alive(self.pid.load(Ordering::Relaxed))
    }
}

/// Identity of the session that created a shared memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Owner {
    pub(crate) pid: u32,
    pub(crate) nonce: u32,
}

impl Owner {
    fn fresh() -> Self {
        Self {
            pid: std::process::id(),
            nonce: rand::random(),
        }
    }

    /// Whether an object owned by `self` was left behind, given that
    /// `current` holds the namespace now. Within one process only the current
    /// session's objects are live.
    pub(crate) fn is_stale(self, current: Owner) -> bool {
        if self.pid == current.pid {
            self.nonce != current.nonce
        } else {
            !pid_alive(self.pid)
        }
    }
}

/// Whether a process with this pid exists. Signal permission errors count as
/// alive.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Some(pid) = i32::try_from(pid).ok().and_then(Pid::from_raw) else {
        return false;
    };
    !matches!(test_kill_process(pid), Err(Errno::SRCH))
}

/// Removes the namespace's session block if the client that created it is
/// gone. Returns true when creating the block again may succeed.
fn reclaim_stale_session(path: &ShmPath) -> bool {
    let stale = match Shm::<SessionBlock, Opener>::open(path.clone()) {
        Ok(block) if block.magic.load(Ordering::Acquire) == SESSION_MAGIC => {
            let pid = block.pid.load(Ordering::Relaxed);
            let dead = !pid_alive(pid);
            if dead {
                warn!(path = %path, pid, "removing session block of a dead client");
            }
            dead
        }
        Ok(_) => false,
        Err(err) => err.is_not_found(),
    };
    if stale {
        path.unlink_stale();
    }
    stale
}

pub(crate) fn session_path(namespace: &str) -> std::result::Result<ShmPath, ShmError> {
    ShmPath::new(format!("/{namespace}-session"))
}

/// Open devices of a session.
pub(crate) struct DeviceTable {
    pub(crate) next_id: u32,
    pub(crate) open: BTreeMap<DeviceId, Arc<Device>>,
}

/// State shared by a session and every registry/transport built from it.
pub(crate) struct Shared {
    pub(crate) config: VanConfig,
    state: AtomicU8,
    trace: AtomicU32,
    /// Nonce of the session block while initialized.
    nonce: AtomicU32,
    devices: Mutex<DeviceTable>,
    block: Mutex<Option<Shm<SessionBlock, Creator>>>,
}

impl Shared {
    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Initialized => Ok(()),
            state => Err(VanError::NotReady { state }),
        }
    }

    pub(crate) fn trace_level(&self) -> TraceLevel {
        TraceLevel::new(self.trace.load(Ordering::Relaxed))
    }

    pub(crate) fn owner(&self) -> Owner {
        Owner {
            pid: std::process::id(),
            nonce: self.nonce.load(Ordering::Acquire),
        }
    }

    pub(crate) fn devices(&self) -> MutexGuard<'_, DeviceTable> {
        lock(&self.devices)
    }

    /// Looks up an open device, checking the session first.
    pub(crate) fn device(&self, id: DeviceId) -> Result<Arc<Device>> {
        self.ensure_ready()?;
        self.devices()
            .open
            .get(&id)
            .cloned()
            .ok_or(VanError::InvalidHandle(id))
    }
}

/// The client's connection to the van subsystem.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    #[must_use]
    pub fn new(config: VanConfig) -> Self {
        let trace = config.trace_level;
        Self {
            shared: Arc::new(Shared {
                config,
                state: AtomicU8::new(SessionState::Uninitialized as u8),
                trace: AtomicU32::new(trace),
                nonce: AtomicU32::new(0),
                devices: Mutex::new(DeviceTable {
                    next_id: 1,
                    open: BTreeMap::new(),
                }),
                block: Mutex::new(None),
            }),
        }
    }

    /// Brings the session up. Calling it again while initialized does
    /// nothing.
    ///
    /// # Errors
    ///
    /// [`VanError::Init`] when the session block cannot be created (treat as
    /// fatal), [`VanError::NotReady`] after [`Session::exit`].
    pub fn init(&self) -> Result<()> {
        let mut block = lock(&self.shared.block);
        match self.shared.state() {
            SessionState::Initialized => return Ok(()),
            SessionState::ShutDown => {
                return Err(VanError::NotReady {
                    state: SessionState::ShutDown,
                });
            }
            SessionState::Uninitialized => {}
        }

        let path = session_path(&self.shared.config.namespace).map_err(VanError::Init)?;
        let level = self.shared.trace_level().get();
        let owner = Owner::fresh();
        let shm = match SessionBlock::create(path.clone(), owner, level) {
            Err(err) if err.is_already_exists() && reclaim_stale_session(&path) => {
                SessionBlock::create(path, owner, level)
            }
            result => result,
        }
        .map_err(VanError::Init)?;
        *block = Some(shm);
        self.shared.nonce.store(owner.nonce, Ordering::Release);

        self.shared
            .state
            .store(SessionState::Initialized as u8, Ordering::Release);
        info!(namespace = %self.shared.config.namespace, "van session initialized");
        Ok(())
    }

    /// Sets the diagnostic trace level: 0 silences device events, 1 reports
    /// open/close/attach, 2 and above report every transfer.
    pub fn set_trace(&self, level: u32) {
        self.shared.trace.store(level, Ordering::Relaxed);
        if let Some(block) = lock(&self.shared.block).as_ref() {
            block.trace_level.store(level, Ordering::Relaxed);
        }
        debug!(level, "trace level changed");
    }

    /// Shuts the session down: every open device is closed (blocked readers
    /// wake with an error) and the session block is removed. Terminal.
    pub fn exit(&self) {
        let mut block = lock(&self.shared.block);
        let previous = self.shared.state();
        self.shared
            .state
            .store(SessionState::ShutDown as u8, Ordering::Release);

        let devices = std::mem::take(&mut self.shared.devices().open);
        for device in devices.values() {
            device.close();
        }
        let closed = devices.len();
        drop(devices);
        *block = None;

        if previous == SessionState::Initialized {
            info!(closed, "van session shut down");
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    #[must_use]
    pub fn trace_level(&self) -> TraceLevel {
        self.shared.trace_level()
    }

    #[must_use]
    pub fn config(&self) -> &VanConfig {
        &self.shared.config
    }

    /// Device registry bound to this session.
    #[must_use]
    pub fn registry(&self) -> Registry {
        Registry::new(self.shared.clone())
    }

    /// Transfer primitives bound to this session.
    #[must_use]
    pub fn transport(&self) -> Transport {
        Transport::new(self.shared.clone())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() == SessionState::Initialized {
            self.exit();
        }
    }
}
