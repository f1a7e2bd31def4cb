//! USB HID transport abstraction.
//!
//! The hub only needs device enumeration and raw report exchange, so that is
//! all this trait carries. The hidapi implementation lives behind the
//! `hardware-wallet` feature; tests drive the hub with scripted device
//! lists instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsbError {
    /// The transport does not work on this platform.
    #[error("unsupported platform")]
    Unsupported,

    #[error("device enumeration failed: {0}")]
    Enumerate(String),

    #[error("device open failed: {0}")]
    Open(String),

    #[error("device I/O failed: {0}")]
    Io(String),
}

/// Descriptor of one enumerated HID interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Platform device path, unique per attached interface.
    pub path: String,
    pub product_id: u16,
    /// HID usage page. macOS and Windows expose wallet interfaces through
    /// this field.
    pub usage_page: u16,
    /// Interface number. Linux exposes wallet interfaces through this one.
    pub interface: i32,
}

/// An open device handle exchanging raw HID reports.
pub trait UsbDevice: Send {
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, UsbError>;
}

/// Enumeration and open primitives of one USB transport.
pub trait UsbBus: Send + Sync {
    /// Whether the transport works on this platform at all.
    fn supported(&self) -> bool;

    /// List the attached devices of a vendor. A zero `product_id` matches
    /// every product.
    fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<Vec<DeviceInfo>, UsbError>;

    /// Open the device at the given enumeration path.
    fn open(&self, path: &str) -> Result<Box<dyn UsbDevice>, UsbError>;
}

#[cfg(feature = "hardware-wallet")]
mod hid {
    use std::ffi::CString;
    use std::sync::{Mutex, MutexGuard};

    use super::{DeviceInfo, UsbBus, UsbDevice, UsbError};

    /// hidapi backed transport. The context is not thread safe, so it lives
    /// behind a mutex.
    pub struct HidBus {
        api: Mutex<hidapi::HidApi>,
    }

    impl HidBus {
        pub fn new() -> Result<Self, UsbError> {
            let api = hidapi::HidApi::new().map_err(|err| UsbError::Open(err.to_string()))?;
            Ok(Self { api: Mutex::new(api) })
        }

        fn lock(&self) -> MutexGuard<'_, hidapi::HidApi> {
            self.api.lock().unwrap_or_else(|poison| poison.into_inner())
        }
    }

    impl UsbBus for HidBus {
        fn supported(&self) -> bool {
            true
        }

        fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<Vec<DeviceInfo>, UsbError> {
            let mut api = self.lock();
            api.refresh_devices()
                .map_err(|err| UsbError::Enumerate(err.to_string()))?;
            Ok(api
                .device_list()
                .filter(|device| {
                    device.vendor_id() == vendor_id
                        && (product_id == 0 || device.product_id() == product_id)
                })
                .map(|device| DeviceInfo {
                    path: device.path().to_string_lossy().into_owned(),
                    product_id: device.product_id(),
                    usage_page: device.usage_page(),
                    interface: device.interface_number(),
                })
                .collect())
        }

        fn open(&self, path: &str) -> Result<Box<dyn UsbDevice>, UsbError> {
            let api = self.lock();
            let path = CString::new(path).map_err(|err| UsbError::Open(err.to_string()))?;
            let device = api
                .open_path(&path)
                .map_err(|err| UsbError::Open(err.to_string()))?;
            Ok(Box::new(HidDevice { device }))
        }
    }

    struct HidDevice {
        device: hidapi::HidDevice,
    }

    impl UsbDevice for HidDevice {
        fn write(&mut self, data: &[u8]) -> Result<usize, UsbError> {
            self.device.write(data).map_err(|err| UsbError::Io(err.to_string()))
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, UsbError> {
            self.device.read(buf).map_err(|err| UsbError::Io(err.to_string()))
        }
    }
}

#[cfg(feature = "hardware-wallet")]
pub use hid::HidBus;
