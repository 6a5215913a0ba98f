//! Coordinated shutdown of all open tun devices.
//!
//! The [`ShutdownCoordinator`] is created once by the application and handed to every
//! [`TunDevice`](crate::device::TunDevice). Devices register themselves when they are opened and
//! unregister when they are closed, so the coordinator always knows exactly which devices are
//! open.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, info};

/// Identifier of a device registered with a [`ShutdownCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

/// A device which can be closed by the [`ShutdownCoordinator`].
pub(crate) trait Closable: Send + Sync {
    /// Name of the device.
    fn name(&self) -> String;
    /// Close the device. Must be idempotent.
    fn close(&self);
}

/// Tracks open devices and whether the application is shutting down.
pub struct ShutdownCoordinator {
    shutdown_requested: AtomicBool,
    next_id: AtomicU64,
    devices: Mutex<Vec<(DeviceId, Weak<dyn Closable>)>>,
}

impl ShutdownCoordinator {
    /// Create a new `ShutdownCoordinator`, ready to be shared between devices.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shutdown_requested: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            devices: Mutex::new(Vec::new()),
        })
    }

    /// Mark the application as shutting down. Once set, this can't be cleared.
    ///
    /// This only sets an atomic flag, it does not lock or allocate, so it can be called from a
    /// signal handler. Closing the devices has to be done by calling
    /// [`close_all`](Self::close_all) outside of the signal handler.
    #[inline]
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Whether [`request_shutdown`](Self::request_shutdown) has been called.
    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Close every device which is currently registered.
    pub fn close_all(&self) {
        // Devices unregister while closing, so don't hold the lock while doing so.
        let devices = self.snapshot();

        info!(count = devices.len(), "Closing registered tun devices");
        for device in devices {
            debug!(name = device.name(), "Closing tun device");
            device.close();
        }
    }

    /// The amount of devices which are currently open.
    pub fn active_devices(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The names of all devices which are currently open.
    pub fn device_names(&self) -> Vec<String> {
        // Getting the name locks the device, which must not happen with the registry locked.
        self.snapshot()
            .into_iter()
            .map(|device| device.name())
            .collect()
    }

    /// The devices which are currently registered and still alive.
    fn snapshot(&self) -> Vec<Arc<dyn Closable>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(_, device)| device.upgrade())
            .collect()
    }

    /// Allocate a new [`DeviceId`].
    pub(crate) fn next_id(&self) -> DeviceId {
        DeviceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a device to the set of open devices.
    pub(crate) fn register(&self, id: DeviceId, device: Weak<dyn Closable>) {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if !devices.iter().any(|(existing, _)| *existing == id) {
            devices.push((id, device));
        }
    }

    /// Remove a device from the set of open devices.
    pub(crate) fn unregister(&self, id: DeviceId) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }
}
