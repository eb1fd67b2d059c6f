//! The host end of a device.
//!
//! A [`Host`] attaches to a device some client session opened, feeds its
//! downlink and drains its uplink. It never creates or removes shared memory.

use std::sync::atomic::Ordering;
use std::time::Duration;

use minstant::Instant;

use crate::config::VanConfig;
use crate::device::{DeviceName, DevicePaths, HostEnd};
use crate::error::{Result, VanError};
use crate::frame::Frame;
use crate::ipc::shmem::{Opener, Shm};
use crate::ipc::spsc::{Backoff, Timeout, expired};
use crate::session::{SessionBlock, SessionState, session_path};
use crate::trace::{debug, trace};

/// Attached host end of one device.
pub struct Host {
    name: DeviceName,
    end: HostEnd,
    session: Shm<SessionBlock, Opener>,
    next_seq: u64,
}

impl Host {
    /// Attaches to `name` in `config.namespace`, waiting up to `timeout` for
    /// the client to open it.
    ///
    /// # Errors
    ///
    /// `NotReady` if no live session exists in the namespace, `InvalidName`,
    /// `Timeout` if the device does not appear in time, `HostAttached` if
    /// another host holds it, `Shm` otherwise.
    pub fn attach(config: &VanConfig, name: &str, timeout: Duration) -> Result<Self> {
        let name = DeviceName::parse(name)?;
        let not_ready = VanError::NotReady {
            state: SessionState::Uninitialized,
        };

        let session = match Shm::<SessionBlock, Opener>::open(session_path(&config.namespace)?) {
            Ok(block) if block.is_live() => block,
            Ok(_) => return Err(not_ready),
            Err(err) if err.is_not_found() => return Err(not_ready),
            Err(err) => return Err(err.into()),
        };

        let paths = DevicePaths::new(&config.namespace, &name)?;
        let end = HostEnd::open(&paths, &name, timeout)?;
        let next_seq = end.control.last_sent.load(Ordering::Acquire) + 1;

        debug!(
            device = %name,
            namespace = %config.namespace,
            client_pid = session.pid.load(Ordering::Relaxed),
            client_nonce = session.nonce.load(Ordering::Relaxed),
            "host attached"
        );
        Ok(Self {
            name,
            end,
            session,
            next_seq,
        })
    }

    #[must_use]
    pub fn name(&self) -> &DeviceName {
        &self.name
    }

    /// Whether the client still holds the device open.
    #[must_use]
    pub fn is_client_open(&self) -> bool {
        self.end.control.client_open.load(Ordering::Acquire)
    }

    fn transfers_traced(&self) -> bool {
        self.session.trace_level.load(Ordering::Relaxed) >= 2
    }

    fn ensure_client(&self) -> Result<()> {
        if self.is_client_open() {
            Ok(())
        } else {
            Err(VanError::PeerGone)
        }
    }

    /// Queues `bytes` for the client without waiting. Returns the frame's
    /// sequence number.
    ///
    /// # Errors
    ///
    /// `PeerGone` once the client closed the device, `QueueFull` if the
    /// downlink has no free slot.
    pub fn send(&mut self, bytes: &[u8]) -> Result<u64> {
        self.ensure_client()?;
        let frame = Frame::new(self.next_seq, bytes);
        self.end
            .outbound
            .push(frame)
            .map_err(|_| VanError::QueueFull)?;
        Ok(self.sent(&frame))
    }

    /// Queues `bytes`, waiting up to `timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// `PeerGone`, or `Timeout` if the client never drains the downlink.
    pub fn send_blocking(&mut self, bytes: &[u8], timeout: Timeout) -> Result<u64> {
        let mut frame = Frame::new(self.next_seq, bytes);
        let deadline = timeout.deadline();
        let mut backoff = Backoff::new();
        loop {
            self.ensure_client()?;
            match self.end.outbound.push(frame) {
                Ok(()) => return Ok(self.sent(&frame)),
                Err(back) => frame = back,
            }
            if expired(deadline) {
                return Err(VanError::Timeout);
            }
            backoff.snooze();
        }
    }

    /// Queues `bytes` and waits until the client took the frame with
    /// `sync_read`.
    ///
    /// # Errors
    ///
    /// `PeerGone`, or `Timeout` if no acknowledgement arrives in time.
    pub fn send_sync(&mut self, bytes: &[u8], timeout: Timeout) -> Result<()> {
        let deadline = timeout.deadline();
        let seq = self.send_blocking(bytes, timeout)?;

        let mut backoff = Backoff::new();
        while self.end.control.acked.load(Ordering::Acquire) < seq {
            self.ensure_client()?;
            if expired(deadline) {
                return Err(VanError::Timeout);
            }
            backoff.snooze();
        }
        Ok(())
    }

    fn sent(&mut self, frame: &Frame) -> u64 {
        self.next_seq += 1;
        self.end.control.last_sent.store(frame.seq, Ordering::Release);
        if self.transfers_traced() {
            trace!(device = %self.name, seq = frame.seq, len = frame.len(), "host send");
        }
        frame.seq
    }

    /// Takes the client's next message if there is one, copying as much as
    /// fits into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        let frame = self.end.inbound.pop()?;
        if self.transfers_traced() {
            trace!(device = %self.name, seq = frame.seq, len = frame.len(), "host recv");
        }
        Some(frame.copy_into(buf))
    }

    /// Waits up to `timeout` for the client's next message.
    ///
    /// # Errors
    ///
    /// `Timeout`, or `PeerGone` once the client closed the device and nothing
    /// is left to drain.
    pub fn recv_blocking(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        let deadline = timeout.deadline();
        let mut backoff = Backoff::new();
        loop {
            if let Some(n) = self.recv(buf) {
                return Ok(n);
            }
            self.ensure_client()?;
            if expired(deadline) {
                return Err(VanError::Timeout);
            }
            backoff.snooze();
        }
    }

    /// Whether the client has written anything not yet received.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.end.inbound.is_empty()
    }
}

/// Attaches, retrying while the session itself is not up yet.
///
/// # Errors
///
/// The last attach error once `timeout` passes.
pub fn attach_when_ready(config: &VanConfig, name: &str, timeout: Duration) -> Result<Host> {
    let start = Instant::now();
    let mut backoff = Backoff::new();
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        match Host::attach(config, name, remaining) {
            Err(VanError::NotReady { .. }) if !remaining.is_zero() => backoff.snooze(),
            result => return result,
        }
    }
}
