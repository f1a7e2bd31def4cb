//! Accounts, addresses, wallet events, and the signed-message digest.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tiny_keccak::{Hasher, Keccak};

use crate::error::AccountError;
use crate::url::Url;
use crate::wallet::Wallet;

/// Byte length of an account address.
pub const ADDRESS_LENGTH: usize = 20;

/// Mimetype of data signed on behalf of a validator.
pub const MIMETYPE_DATA_WITH_VALIDATOR: &str = "data/validator";
/// Mimetype of structured typed data.
pub const MIMETYPE_TYPED_DATA: &str = "data/typed";
/// Mimetype of a consensus seal header.
pub const MIMETYPE_SEAL_HEADER: &str = "application/x-seal-header";
/// Mimetype of plain text data.
pub const MIMETYPE_TEXT_PLAIN: &str = "text/plain";

/// A 20 byte account address derived from a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = AccountError;

    fn from_str(text: &str) -> Result<Self, AccountError> {
        let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
        let bytes = hex::decode(digits)
            .map_err(|_| AccountError::InvalidAddress(text.to_string()))?;
        let bytes: [u8; ADDRESS_LENGTH] = bytes
            .try_into()
            .map_err(|_| AccountError::InvalidAddress(text.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// An account located at a specific backend resource, identified by the
/// address derived from its key plus the locator URL its wallet assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub url: Url,
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut keccak = Keccak::v256();
    let mut output = [0u8; 32];
    keccak.update(data);
    keccak.finalize(&mut output);
    output
}

/// Digest of a message safe to calculate a signature from.
///
/// Computed as `keccak256("\x19Ethereum Signed Message:\n" + len(message) +
/// message)`, which gives context to the signed message and prevents signing
/// of transactions.
pub fn text_hash(data: &[u8]) -> [u8; 32] {
    text_and_hash(data).0
}

/// Like [`text_hash`], but also returns the exact prefixed string that was
/// hashed, for display to the user.
pub fn text_and_hash(data: &[u8]) -> ([u8; 32], String) {
    let mut message = format!("\x19Ethereum Signed Message:\n{}", data.len()).into_bytes();
    message.extend_from_slice(data);
    let hash = keccak256(&message);
    (hash, String::from_utf8_lossy(&message).into_owned())
}

/// The different event types fired by the wallet subscription subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletEventKind {
    /// A new wallet was detected, either over USB or via a filesystem event
    /// in the keystore.
    Arrived,
    /// A wallet was opened successfully, to start any background processes
    /// such as automatic key derivation.
    Opened,
    /// A wallet departed or stopped being tracked.
    Dropped,
}

/// Fired by an account backend when a wallet arrival or departure is
/// detected.
#[derive(Clone)]
pub struct WalletEvent {
    pub wallet: Arc<dyn Wallet>,
    pub kind: WalletEventKind,
}

impl fmt::Debug for WalletEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletEvent")
            .field("wallet", &self.wallet.url())
            .field("kind", &self.kind)
            .finish()
    }
}
