//! Error types shared by the session, registry and transport.

use thiserror::Error;

use crate::device::DeviceId;
use crate::ipc::shmem::ShmError;
use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, VanError>;

/// Failure of a session, registry or transport call.
#[derive(Debug, Error)]
pub enum VanError {
    /// The session is not in the `Initialized` state.
    #[error("van session is not initialized (state: {state:?})")]
    NotReady { state: SessionState },
    /// The id was never returned by `open`, or was closed since.
    #[error("invalid device handle {0}")]
    InvalidHandle(DeviceId),
    #[error("invalid device name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("unsupported open flags {0:#x}")]
    InvalidFlags(u32),
    /// One client per device: the name is already open in this session.
    #[error("device `{0}` is already open")]
    AlreadyOpen(String),
    /// Another host holds the device; each direction has a single producer.
    #[error("device `{0}` already has a host attached")]
    HostAttached(String),
    #[error("device limit reached ({open} of {max} open)")]
    ResourceExhausted { open: usize, max: usize },
    /// The outbound queue has no free slot.
    #[error("device queue is full")]
    QueueFull,
    /// The pending message does not fit the caller's buffer and the session
    /// rejects truncation. The message stays queued.
    #[error("message of {len} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { len: usize, capacity: usize },
    #[error("timed out")]
    Timeout,
    /// The other end of the device went away.
    #[error("device peer is gone")]
    PeerGone,
    /// Creating the session block failed; the session cannot be used.
    #[error("van initialization failed: {0}")]
    Init(#[source] ShmError),
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
}

/// Coarse classification of a [`VanError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotReady,
    InvalidHandle,
    InvalidName,
    ResourceExhausted,
    /// Anything that went wrong moving bytes.
    Transport,
}

impl VanError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotReady { .. } | Self::Init(_) => ErrorKind::NotReady,
            Self::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Self::InvalidName { .. }
            | Self::InvalidFlags(_)
            | Self::AlreadyOpen(_)
            | Self::HostAttached(_) => ErrorKind::InvalidName,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::QueueFull
            | Self::BufferTooSmall { .. }
            | Self::Timeout
            | Self::PeerGone
            | Self::Shm(_) => ErrorKind::Transport,
        }
    }
}
