//! Host-side counter generator for the echo test.
//!
//! Attaches to a device, sends `"0"`, `"1"`, … `"cycles-1"` and then the
//! sentinel, checking each echo on the way. In sync mode every message is
//! NUL-terminated and sent with [`Host::send_sync`], so the generator only
//! moves on once the client took the frame with `sync_read`.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::config::VanConfig;
use crate::echo::SENTINEL;
use crate::error::VanError;
use crate::frame::MAX_MESSAGE_SIZE;
use crate::host::{Host, attach_when_ready};
use crate::ipc::spsc::Timeout;
use crate::trace::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Device to attach to, such as `/python`.
    pub device: String,
    /// Counters sent before the sentinel.
    pub cycles: u64,
    /// Terminate messages with NUL and wait for each acknowledgement.
    pub sync: bool,
    /// Read every echo back and compare it with what was sent.
    pub verify_echo: bool,
    /// Bound for attaching and for every single wait afterwards.
    pub timeout: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            device: "/python".to_owned(),
            cycles: 1000,
            sync: false,
            verify_echo: true,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Totals of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorReport {
    /// Messages sent, sentinel included.
    pub sent: u64,
    /// Echoes received (and verified, when verification is on).
    pub echoed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Van(#[from] VanError),
    /// The client echoed something other than what was sent.
    #[error("echo mismatch at {index}: sent `{sent}`, got `{received}`")]
    EchoMismatch {
        index: u64,
        sent: String,
        received: String,
    },
    #[error("failed to spawn generator thread: {0}")]
    Spawn(std::io::Error),
    #[error("generator thread panicked")]
    Panicked,
}

/// A generator running on its own thread.
pub struct Generator {
    handle: JoinHandle<Result<GeneratorReport, GeneratorError>>,
}

impl Generator {
    /// Starts a generator thread for `config.device` in the namespace of
    /// `session_config`. The client session may come up after this call.
    ///
    /// # Errors
    ///
    /// [`GeneratorError::Spawn`] if the thread cannot be created.
    pub fn spawn(session_config: VanConfig, config: GeneratorConfig) -> Result<Self, GeneratorError> {
        debug!(device = %config.device, cycles = config.cycles, sync = config.sync, "spawning generator");
        let handle = thread::Builder::new()
            .name("van-gen".into())
            .spawn(move || {
                let result = run(&session_config, &config);
                if let Err(err) = &result {
                    error!(error = %err, "generator failed");
                }
                result
            })
            .map_err(GeneratorError::Spawn)?;
        Ok(Self { handle })
    }

    /// Waits for the run to finish.
    ///
    /// # Errors
    ///
    /// Whatever the run failed with, or [`GeneratorError::Panicked`].
    pub fn join(self) -> Result<GeneratorReport, GeneratorError> {
        self.handle.join().map_err(|_| GeneratorError::Panicked)?
    }
}

/// Runs a generator on the calling thread.
///
/// # Errors
///
/// Attach and transfer errors as [`GeneratorError::Van`], or
/// [`GeneratorError::EchoMismatch`].
pub fn run(session_config: &VanConfig, config: &GeneratorConfig) -> Result<GeneratorReport, GeneratorError> {
    let mut host = attach_when_ready(session_config, &config.device, config.timeout)?;
    let timeout = Timeout::Duration(config.timeout);
    info!(device = %host.name(), cycles = config.cycles, sync = config.sync, "generator attached");

    let start = Instant::now();
    let mut sent = 0;
    let mut echoed = 0;
    let mut buf = [0u8; MAX_MESSAGE_SIZE];

    for index in 0..config.cycles {
        let message = encode(index.to_string().as_bytes(), config.sync);
        send(&mut host, &message, config.sync, timeout)?;
        sent += 1;

        if config.verify_echo {
            let n = host.recv_blocking(&mut buf, timeout)?;
            if buf[..n] != message[..] {
                return Err(GeneratorError::EchoMismatch {
                    index,
                    sent: String::from_utf8_lossy(&message).into_owned(),
                    received: String::from_utf8_lossy(&buf[..n]).into_owned(),
                });
            }
            echoed += 1;
        } else {
            while host.recv(&mut buf).is_some() {
                echoed += 1;
            }
        }
    }

    send(&mut host, &encode(SENTINEL, config.sync), config.sync, timeout)?;
    sent += 1;

    let report = GeneratorReport {
        sent,
        echoed,
        elapsed: start.elapsed(),
    };
    info!(
        sent = report.sent,
        echoed = report.echoed,
        elapsed_us = report.elapsed.as_micros() as u64,
        "generator finished"
    );
    Ok(report)
}

fn encode(text: &[u8], nul_terminated: bool) -> Vec<u8> {
    let mut message = text.to_vec();
    if nul_terminated {
        message.push(0);
    }
    message
}

fn send(host: &mut Host, message: &[u8], sync: bool, timeout: Timeout) -> Result<(), VanError> {
    if sync {
        host.send_sync(message, timeout)
    } else {
        host.send_blocking(message, timeout).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_messages_are_nul_terminated() {
        assert_eq!(encode(b"12", true), b"12\0");
        assert_eq!(encode(b"12", false), b"12");
    }

    #[test]
    fn join_reports_attach_failure() {
        let session_config = VanConfig {
            namespace: format!("gen{}-none", std::process::id()),
            ..VanConfig::default()
        };
        let config = GeneratorConfig {
            timeout: Duration::from_millis(20),
            ..GeneratorConfig::default()
        };
        let err = Generator::spawn(session_config, config).unwrap().join().unwrap_err();
        assert!(matches!(err, GeneratorError::Van(VanError::NotReady { .. })));
    }
}
