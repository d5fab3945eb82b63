/// Device context - owns or borrows the GPU device the engine runs on
///
/// A device handed in by the caller is borrowed: the context never shuts
/// it down. A device the context created itself is shut down exactly once,
/// on `release`. Creation failure is remembered until the next `release`,
/// so a machine without any usable driver is probed once, not every frame.
use std::sync::{MutexGuard, PoisonError};

use crate::backend::{CapabilityLevel, DeviceInfo, DeviceProvider, DriverKind, GpuDevice, SharedDevice};

pub struct DeviceContext {
    provider: Box<dyn DeviceProvider>,
    probe_order: Vec<DriverKind>,
    device: Option<SharedDevice>,
    owns_device: bool,
    failed: bool,
}

impl DeviceContext {
    pub fn new(provider: Box<dyn DeviceProvider>, probe_order: Vec<DriverKind>) -> Self {
        Self {
            provider,
            probe_order,
            device: None,
            owns_device: false,
            failed: false,
        }
    }

    /// Make a device available, borrowing `external` when given.
    ///
    /// Returns false when every driver failed; later calls return false
    /// without probing again until the context is released.
    pub fn acquire(&mut self, external: Option<SharedDevice>) -> bool {
        if let Some(device) = external {
            self.release();
            log::info!("Using caller supplied device");
            lock(&device).info().log_info();
            self.device = Some(device);
            self.owns_device = false;
            self.failed = false;
            return true;
        }
        if self.device.is_some() {
            return true;
        }
        if self.failed {
            return false;
        }

        for driver in &self.probe_order {
            match self.provider.create_device(*driver, &CapabilityLevel::DESCENDING) {
                Ok(device) => {
                    lock(&device).info().log_info();
                    self.device = Some(device);
                    self.owns_device = true;
                    return true;
                }
                Err(e) => log::warn!("{} driver unavailable: {}", driver, e),
            }
        }

        log::warn!("No GPU device could be created");
        self.failed = true;
        false
    }

    /// Drop the device; an owned one is shut down. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.failed = false;
        let Some(device) = self.device.take() else {
            return;
        };
        if self.owns_device {
            let mut device = lock(&device);
            let name = device.info().adapter_name.clone();
            device.shutdown();
            log::info!("Released device {}", name);
        }
        self.owns_device = false;
    }

    pub fn is_acquired(&self) -> bool {
        self.device.is_some()
    }

    pub fn owns_device(&self) -> bool {
        self.owns_device
    }

    pub fn shared(&self) -> Option<SharedDevice> {
        self.device.clone()
    }

    pub fn info(&self) -> Option<DeviceInfo> {
        self.device.as_ref().map(|d| lock(d).info().clone())
    }

    /// Exclusive access to the device for one operation
    pub fn lock(&self) -> Option<MutexGuard<'_, dyn GpuDevice + 'static>> {
        self.device.as_ref().map(lock)
    }
}

fn lock(device: &SharedDevice) -> MutexGuard<'_, dyn GpuDevice + 'static> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("acquired", &self.is_acquired())
            .field("owns_device", &self.owns_device)
            .field("failed", &self.failed)
            .finish()
    }
}
