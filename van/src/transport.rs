//! Buffer transfer on open devices.
//!
//! Both receive calls share one path and differ only in [`AccessMode`]:
//!
//! - [`Transport::read`] (`Queued`) dequeues the next downlink frame.
//! - [`Transport::sync_read`] (`SingleShot`) does the same, then publishes the
//!   frame's sequence number in the device control block. A host blocked in
//!   `Host::send_sync` on that frame is released by it.
//!
//! Receives block until a frame arrives, the configured read timeout passes,
//! the device is closed or the session exits. `write` never blocks.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::config::TruncationPolicy;
use crate::device::{DeviceId, lock};
use crate::error::{Result, VanError};
use crate::frame::{Frame, MAX_MESSAGE_SIZE};
use crate::ipc::spsc::{Backoff, Timeout, expired};
use crate::session::Shared;
use crate::trace::{trace, warn};

/// Which receive convention a read follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Plain dequeue.
    Queued,
    /// Dequeue and acknowledge to the sender.
    SingleShot,
}

/// Transfer primitives of one session.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Enqueues `buf` for the host and returns at once. Messages longer than
    /// [`MAX_MESSAGE_SIZE`] are cut to it.
    ///
    /// # Errors
    ///
    /// `NotReady`, `InvalidHandle`, or `QueueFull` when the host has not
    /// drained the uplink.
    pub fn write(&self, id: DeviceId, buf: &[u8]) -> Result<()> {
        let device = self.shared.device(id)?;
        if buf.len() > MAX_MESSAGE_SIZE {
            warn!(
                device = %device.name,
                len = buf.len(),
                max = MAX_MESSAGE_SIZE,
                "message truncated"
            );
        }

        let mut outbound = lock(&device.outbound);
        if device.is_closed() {
            return Err(VanError::InvalidHandle(id));
        }
        let frame = Frame::new(outbound.next_seq, buf);
        outbound
            .queue
            .push(frame)
            .map_err(|_| VanError::QueueFull)?;
        outbound.next_seq += 1;

        if self.shared.trace_level().transfers() {
            trace!(device = %device.name, seq = frame.seq, len = frame.len(), "write");
        }
        Ok(())
    }

    /// Receives the next message into `buf`, returning the bytes placed.
    ///
    /// # Errors
    ///
    /// `NotReady`, `InvalidHandle`, `Timeout`, and `BufferTooSmall` under
    /// [`TruncationPolicy::Reject`].
    pub fn read(&self, id: DeviceId, buf: &mut [u8]) -> Result<usize> {
        self.receive(id, buf, AccessMode::Queued)
    }

    /// Like [`Transport::read`], and acknowledges the frame to its sender.
    ///
    /// # Errors
    ///
    /// Same as [`Transport::read`].
    pub fn sync_read(&self, id: DeviceId, buf: &mut [u8]) -> Result<usize> {
        self.receive(id, buf, AccessMode::SingleShot)
    }

    /// The receive path behind both entry points.
    ///
    /// # Errors
    ///
    /// See [`Transport::read`].
    pub(crate) fn receive(&self, id: DeviceId, buf: &mut [u8], mode: AccessMode) -> Result<usize> {
        let device = self.shared.device(id)?;
        let mut inbound = lock(&device.inbound);

        let deadline = Timeout::from(self.shared.config.read_timeout).deadline();
        let mut backoff = Backoff::new();
        let frame = loop {
            self.shared.ensure_ready()?;
            if device.is_closed() {
                return Err(VanError::InvalidHandle(id));
            }
            if let Some(frame) = inbound.next() {
                break frame;
            }
            if expired(deadline) {
                return Err(VanError::Timeout);
            }
            backoff.snooze();
        };

        if frame.len() > buf.len() && self.shared.config.truncation == TruncationPolicy::Reject {
            let len = frame.len();
            inbound.pending = Some(frame);
            return Err(VanError::BufferTooSmall {
                len,
                capacity: buf.len(),
            });
        }

        let n = frame.copy_into(buf);
        if mode == AccessMode::SingleShot {
            device.control.acked.fetch_max(frame.seq, Ordering::AcqRel);
        }

        if self.shared.trace_level().transfers() {
            trace!(device = %device.name, seq = frame.seq, len = n, ?mode, "read");
        }
        Ok(n)
    }
}
