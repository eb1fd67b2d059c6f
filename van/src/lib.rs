//! Named shared-memory device channels and the echo test that exercises them.
//!
//! A client [`Session`] opens devices by name through its [`Registry`] and
//! moves byte buffers over them with its [`Transport`]. The peer of every
//! device is a [`Host`], typically the counter [`Generator`] in another
//! process.
//!
//! ```no_run
//! use van::{EchoLoop, OpenFlags, Session, VanConfig};
//!
//! let session = Session::new(VanConfig::from_env()?);
//! session.init()?;
//! let id = session.registry().open("/python", OpenFlags::NONE)?;
//! let report = EchoLoop::new(session.transport(), id).run()?;
//! println!("{:?}", report.elapsed);
//! session.registry().close(id)?;
//! session.exit();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod trace;

pub mod config;
pub mod device;
pub mod echo;
pub mod error;
pub mod frame;
pub mod generator;
pub mod host;
pub mod ipc;
pub mod registry;
pub mod session;
pub(crate) mod spsc;
pub mod transport;

pub use config::{ConfigError, TruncationPolicy, VanConfig};
pub use device::{DeviceId, DeviceName, OpenFlags};
pub use echo::{EchoError, EchoLoop, EchoReport, ReadMode, SENTINEL};
pub use error::{ErrorKind, VanError};
pub use frame::MAX_MESSAGE_SIZE;
pub use generator::{Generator, GeneratorConfig, GeneratorError, GeneratorReport};
pub use host::Host;
pub use ipc::spsc::Timeout;
pub use registry::Registry;
pub use session::{Session, SessionState};
pub use trace::{TraceLevel, init_tracing};
pub use transport::{AccessMode, Transport};
