//! USB hardware wallet backend for the Ember account manager.
//!
//! Discovers Ledger and Trezor devices, tracks their arrivals and
//! departures, and exposes each as a signing wallet. Vendor wire protocols
//! live behind the [`Driver`] trait and the HID transport behind [`UsbBus`],
//! with a hidapi implementation gated on the `hardware-wallet` feature.

pub mod bus;
pub mod driver;
pub mod hub;
pub mod wallet;

#[cfg(feature = "hardware-wallet")]
pub use bus::HidBus;
pub use bus::{DeviceInfo, UsbBus, UsbDevice, UsbError};
pub use driver::{Driver, DriverFactory};
pub use hub::{Hub, LEDGER_SCHEME, TREZOR_SCHEME};
pub use wallet::UsbWallet;
