//! Device registry: names to handles.

use std::sync::Arc;

use crate::device::{Device, DeviceId, DeviceName, DevicePaths, OpenFlags};
use crate::error::{Result, VanError};
use crate::session::Shared;
use crate::trace::{info, warn};

/// Opens and closes devices of one session.
///
/// One device per name and one client per device: opening a name that is
/// already open fails with [`VanError::AlreadyOpen`].
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Opens the device `name` (such as `/python`) and returns a fresh id.
    ///
    /// With [`OpenFlags::WAIT_FOR_HOST`] the call waits up to the configured
    /// attach timeout for a host and fails with [`VanError::Timeout`] if none
    /// shows up.
    ///
    /// # Errors
    ///
    /// `NotReady`, `InvalidName`, `AlreadyOpen`, `ResourceExhausted` (device
    /// limit or kernel limits), `Timeout`, or `Shm` for other shared memory
    /// failures.
    pub fn open(&self, name: &str, flags: OpenFlags) -> Result<DeviceId> {
        self.shared.ensure_ready()?;
        let name = DeviceName::parse(name)?;
        let config = &self.shared.config;

        let device = {
            let mut table = self.shared.devices();
            let open = table.open.len();
            if open >= config.max_devices {
                return Err(VanError::ResourceExhausted {
                    open,
                    max: config.max_devices,
                });
            }
            if table.open.values().any(|d| d.name == name) {
                return Err(VanError::AlreadyOpen(name.to_string()));
            }

            let paths = DevicePaths::new(&config.namespace, &name)?;
            let id = DeviceId::new(table.next_id);
            let owner = self.shared.owner();
            let device = match Device::create(id, name.clone(), flags, &paths, owner) {
                Ok(device) => Arc::new(device),
                Err(err) if err.is_already_exists() => {
                    warn!(device = %name, "device objects exist outside this session");
                    return Err(VanError::AlreadyOpen(name.to_string()));
                }
                Err(err) if err.is_resource_limit() => {
                    warn!(device = %name, error = %err, "kernel refused device objects");
                    return Err(VanError::ResourceExhausted {
                        open,
                        max: config.max_devices,
                    });
                }
                Err(err) => return Err(err.into()),
            };

            table.next_id += 1;
            table.open.insert(id, device.clone());
            device
        };

        if flags.contains(OpenFlags::WAIT_FOR_HOST) && !device.wait_for_host(config.attach_timeout)
        {
            self.shared.devices().open.remove(&device.id);
            device.close();
            return Err(VanError::Timeout);
        }

        if self.shared.trace_level().lifecycle() {
            info!(device = %device.name, id = %device.id, flags = device.flags.bits(), "device opened");
        }
        Ok(device.id)
    }

    /// Closes `id`. Readers blocked on it wake with `InvalidHandle`.
    ///
    /// # Errors
    ///
    /// `NotReady`, or `InvalidHandle` for ids that are unknown or already
    /// closed.
    pub fn close(&self, id: DeviceId) -> Result<()> {
        self.shared.ensure_ready()?;
        let device = self
            .shared
            .devices()
            .open
            .remove(&id)
            .ok_or(VanError::InvalidHandle(id))?;
        device.close();

        if self.shared.trace_level().lifecycle() {
            info!(device = %device.name, id = %id, "device closed");
        }
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self, id: DeviceId) -> bool {
        self.shared.devices().open.contains_key(&id)
    }

    #[must_use]
    pub fn name_of(&self, id: DeviceId) -> Option<DeviceName> {
        self.shared.devices().open.get(&id).map(|d| d.name.clone())
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.shared.devices().open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VanConfig;
    use crate::ipc::shmem::{Opener, Shm, ShmPath};
    use crate::session::Session;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    fn session_with(max_devices: usize) -> Session {
        let session = Session::new(VanConfig {
            namespace: format!("reg{}x{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed)),
            max_devices,
            attach_timeout: Duration::from_millis(10),
            ..VanConfig::default()
        });
        session.init().unwrap();
        session
    }

    #[test]
    fn ids_are_fresh_and_never_reused() {
        let session = session_with(8);
        let registry = session.registry();

        let a = registry.open("/a", OpenFlags::NONE).unwrap();
        registry.close(a).unwrap();
        let a_again = registry.open("/a", OpenFlags::NONE).unwrap();
        let b = registry.open("/b", OpenFlags::NONE).unwrap();

        assert_ne!(a, a_again);
        assert!(a_again < b);
        assert!(!registry.is_open(a));
        assert_eq!(registry.name_of(b).unwrap().as_str(), "/b");
        assert_eq!(registry.open_count(), 2);
    }

    #[test]
    fn close_twice_is_invalid_handle() {
        let session = session_with(8);
        let registry = session.registry();
        let id = registry.open("/python", OpenFlags::NONE).unwrap();

        registry.close(id).unwrap();
        assert!(matches!(registry.close(id), Err(VanError::InvalidHandle(got)) if got == id));
        assert!(matches!(
            registry.close(DeviceId::new(999)),
            Err(VanError::InvalidHandle(_))
        ));
    }

    #[test]
    fn second_open_of_a_name_is_rejected() {
        let session = session_with(8);
        let registry = session.registry();
        registry.open("/python", OpenFlags::NONE).unwrap();
        assert!(matches!(
            registry.open("/python", OpenFlags::NONE),
            Err(VanError::AlreadyOpen(name)) if name == "/python"
        ));
    }

    #[test]
    fn device_limit() {
        let session = session_with(2);
        let registry = session.registry();
        registry.open("/one", OpenFlags::NONE).unwrap();
        registry.open("/two", OpenFlags::NONE).unwrap();
        assert!(matches!(
            registry.open("/three", OpenFlags::NONE),
            Err(VanError::ResourceExhausted { open: 2, max: 2 })
        ));
    }

    #[test]
    fn bad_names_are_rejected() {
        let session = session_with(8);
        let err = session.registry().open("python", OpenFlags::NONE).unwrap_err();
        assert!(matches!(err, VanError::InvalidName { .. }));
    }

    #[test]
    fn wait_for_host_times_out_and_releases_name() {
        let session = session_with(8);
        let registry = session.registry();
        assert!(matches!(
            registry.open("/lonely", OpenFlags::WAIT_FOR_HOST),
            Err(VanError::Timeout)
        ));
        assert_eq!(registry.open_count(), 0);
        registry.open("/lonely", OpenFlags::NONE).unwrap();
    }

    #[test]
    fn close_removes_shared_memory() {
        let session = session_with(8);
        let registry = session.registry();
        let id = registry.open("/gone", OpenFlags::NONE).unwrap();

        let ctl = ShmPath::new(format!("/{}-gone-ctl", session.config().namespace)).unwrap();
        assert!(Shm::<u8, Opener>::open(ctl.clone()).is_err_and(|e| !e.is_not_found()));

        registry.close(id).unwrap();
        assert!(Shm::<u8, Opener>::open(ctl).is_err_and(|e| e.is_not_found()));
    }
}
