//! Vendor-specific signing driver contract.
//!
//! A driver owns the wire protocol of one hardware wallet family. The hub
//! and wallet layers stay protocol agnostic: they hand the driver an open
//! device plus derivation paths and get addresses and signatures back.

use std::sync::Arc;

use ember_accounts::{AccountError, Address, DerivationPath, Transaction, Url};

use crate::bus::UsbDevice;

pub trait Driver: Send {
    /// Textual status of the driver, plus any failure it is in.
    fn status(&self) -> (String, Option<AccountError>);

    /// Take ownership of an open device and establish a session.
    ///
    /// Returns [`AccountError::AuthNeeded`] when the device requires a PIN
    /// or passphrase before the session is usable; the caller retries
    /// through the passphrase bearing open.
    fn open(&mut self, device: Box<dyn UsbDevice>, passphrase: &str) -> Result<(), AccountError>;

    /// Tear the session down. Safe to call on a driver that never opened.
    fn close(&mut self) -> Result<(), AccountError>;

    /// Derive the address sitting at the given derivation path.
    fn derive(&mut self, path: &DerivationPath) -> Result<Address, AccountError>;

    /// Sign a transaction with the key at the given path. Returns the signer
    /// address for verification alongside the signed copy.
    fn sign_tx(
        &mut self,
        path: &DerivationPath,
        tx: &Transaction,
        chain_id: Option<u64>,
    ) -> Result<(Address, Transaction), AccountError>;
}

/// Factory constructing a fresh driver for each discovered device. The
/// wallet URL provides the driver's logging context.
pub type DriverFactory = Arc<dyn Fn(&Url) -> Box<dyn Driver> + Send + Sync>;
