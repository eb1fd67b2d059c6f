//! Diagnostic output for van.
//!
//! Built on `tracing` when the `tracing` feature is enabled (the default).
//! Without it every macro below compiles to nothing.
//!
//! Two switches apply: the subscriber's `EnvFilter` (`RUST_LOG`) decides what
//! reaches the terminal, and the session trace level set with
//! [`Session::set_trace`](crate::Session::set_trace) decides which device
//! events are emitted at all. See [`TraceLevel`].

/// Installs a `tracing-subscriber` fmt layer filtered by `RUST_LOG`.
///
/// Defaults to `van=debug` when `RUST_LOG` is unset. Safe to call more than
/// once; later calls are ignored.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("van=debug"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

/// Runtime trace level of a session.
///
/// `0` is silent, `1` reports device lifecycle (open, close, attach), `2`
/// and above report every transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TraceLevel(u32);

impl TraceLevel {
    pub const OFF: Self = Self(0);
    pub const LIFECYCLE: Self = Self(1);
    pub const TRANSFER: Self = Self(2);

    #[must_use]
    pub const fn new(level: u32) -> Self {
        Self(level)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn lifecycle(self) -> bool {
        self.0 >= Self::LIFECYCLE.0
    }

    #[must_use]
    pub const fn transfers(self) -> bool {
        self.0 >= Self::TRANSFER.0
    }
}

impl From<u32> for TraceLevel {
    fn from(level: u32) -> Self {
        Self(level)
    }
}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! trace_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use info_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use trace_noop as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;
