//! Client side of the echo test.
//!
//! The host sends `"0"`, `"1"`, `"2"`, … and finally the sentinel
//! `That's it.`. The client checks that every counter is the one it expects
//! and writes each one back unchanged:
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//!     AwaitMessage ──read──▶ Validate ──counter == i──▶ Echo (write, i += 1)
//!                               │
//!                               ├──sentinel──▶ Terminate (report elapsed)
//!                               └──otherwise──▶ ProtocolViolation
//! ```
//!
//! A NUL byte ends the text of a message, since C hosts send terminated
//! strings. The echo carries the bytes exactly as received.

use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::device::DeviceId;
use crate::error::VanError;
use crate::frame::{MAX_MESSAGE_SIZE, until_nul};
use crate::transport::{AccessMode, Transport};
use crate::trace::{debug, info};

/// Payload that ends a run.
pub const SENTINEL: &[u8] = b"That's it.";

/// Receive buffer of the loop: one full device message.
pub const ECHO_BUFFER_SIZE: usize = MAX_MESSAGE_SIZE;

/// How the loop receives: `Queued` uses `read`, `SingleShot` uses
/// `sync_read`.
pub type ReadMode = AccessMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoState {
    AwaitMessage,
    Validate,
    Echo,
    Terminate,
}

/// Outcome of validating one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The counter matched; echo it back.
    Echo { value: u64 },
    /// The sentinel arrived.
    Terminate,
}

#[derive(Debug, Error)]
pub enum EchoError {
    #[error(transparent)]
    Transport(#[from] VanError),
    /// The host sent something other than the expected counter.
    #[error("protocol violation: expected {expected}, received `{received}`")]
    ProtocolViolation { expected: u64, received: String },
}

/// Result of a run that reached the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReport {
    /// Wall-clock time from the start of the loop to the sentinel.
    pub elapsed: Duration,
    /// Counters validated (and echoed, unless echoing is off).
    pub echoed: u64,
}

/// The echo loop bound to one device.
pub struct EchoLoop {
    transport: Transport,
    device: DeviceId,
    mode: ReadMode,
    echo: bool,
    expected: u64,
    state: EchoState,
}

impl EchoLoop {
    #[must_use]
    pub fn new(transport: Transport, device: DeviceId) -> Self {
        Self {
            transport,
            device,
            mode: ReadMode::Queued,
            echo: true,
            expected: 0,
            state: EchoState::AwaitMessage,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    /// With `false` the loop only validates and never writes back.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    #[must_use]
    pub fn state(&self) -> EchoState {
        self.state
    }

    /// The counter the next message must carry.
    #[must_use]
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Validates one received payload and advances the state machine.
    ///
    /// # Errors
    ///
    /// [`EchoError::ProtocolViolation`] if `payload` is neither the expected
    /// counter nor the sentinel. The counter does not advance.
    pub fn step(&mut self, payload: &[u8]) -> Result<Step, EchoError> {
        self.state = EchoState::Validate;
        let text = until_nul(payload);

        if text == SENTINEL {
            self.state = EchoState::Terminate;
            return Ok(Step::Terminate);
        }

        match parse_counter(text) {
            Some(value) if value == self.expected => {
                self.expected += 1;
                self.state = EchoState::Echo;
                Ok(Step::Echo { value })
            }
            _ => Err(EchoError::ProtocolViolation {
                expected: self.expected,
                received: String::from_utf8_lossy(text).into_owned(),
            }),
        }
    }

    /// Runs until the sentinel arrives or something fails.
    ///
    /// # Errors
    ///
    /// [`EchoError::ProtocolViolation`] before anything wrong is echoed, or
    /// [`EchoError::Transport`] when a read or write fails.
    pub fn run(&mut self) -> Result<EchoReport, EchoError> {
        let start = Instant::now();
        let mut buf = [0u8; ECHO_BUFFER_SIZE];
        debug!(device = %self.device, mode = ?self.mode, echo = self.echo, "echo loop started");

        loop {
            self.state = EchoState::AwaitMessage;
            let n = self.transport.receive(self.device, &mut buf, self.mode)?;

            match self.step(&buf[..n])? {
                Step::Terminate => {
                    let report = EchoReport {
                        elapsed: start.elapsed(),
                        echoed: self.expected,
                    };
                    info!(
                        echoed = report.echoed,
                        elapsed_us = report.elapsed.as_micros() as u64,
                        "echo run complete"
                    );
                    return Ok(report);
                }
                Step::Echo { .. } if self.echo => {
                    self.transport.write(self.device, &buf[..n])?;
                }
                Step::Echo { .. } => {}
            }
        }
    }
}

/// Non-negative decimal: ASCII digits only, no sign, no whitespace.
fn parse_counter(text: &[u8]) -> Option<u64> {
    if text.is_empty() || !text.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(text).ok()?.parse().ok()
}
