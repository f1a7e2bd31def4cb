//! Wallet and backend capability contracts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::account::{Account, Address, WalletEvent};
use crate::error::AccountError;
use crate::feed::{EventSink, Subscription};
use crate::hd::DerivationPath;
use crate::transaction::Transaction;
use crate::url::Url;

/// A software or hardware wallet that might contain one or more accounts
/// derived from the same seed.
pub trait Wallet: Send + Sync {
    /// Canonical path under which this wallet is reachable. Upper layers use
    /// it to define a sorting order over all wallets from multiple backends.
    fn url(&self) -> Url;

    /// Textual status to aid the user in the current state of the wallet,
    /// plus any failure the wallet encountered.
    fn status(&self) -> (String, Option<AccountError>);

    /// Initializes access to the wallet instance. Not meant to unlock or
    /// decrypt account keys, rather to establish a connection to hardware
    /// wallets and/or access derivation seeds.
    ///
    /// The passphrase may or may not be used by a particular implementation;
    /// there is no passwordless variant so wallet handling stays uniform
    /// across backends. An opened wallet must be closed to release its
    /// resources, especially for hardware wallets.
    fn open(&self, passphrase: &str) -> Result<(), AccountError>;

    /// Releases any resources held by an open wallet. Safe to call on a
    /// wallet that failed to open.
    fn close(&self) -> Result<(), AccountError>;

    /// The accounts the wallet is currently aware of. For hierarchical
    /// deterministic wallets the list is not exhaustive, only the accounts
    /// explicitly pinned during derivation.
    fn accounts(&self) -> Vec<Account>;

    /// Whether an account is part of this particular wallet.
    fn contains(&self, account: &Account) -> bool;

    /// Explicitly derive the account at the given path. With `pin` set, the
    /// derived account is added to the wallet's tracked account list.
    fn derive(&self, path: &DerivationPath, pin: bool) -> Result<Account, AccountError>;

    /// Arms automatic discovery of accounts with on-chain activity, starting
    /// from the given base paths. Some hardware wallets switched derivation
    /// schemes over time, so several bases can be supplied to also discover
    /// old user accounts. Passing `None` for the chain source disables
    /// discovery.
    fn self_derive(&self, bases: &[DerivationPath], chain: Option<Arc<dyn ChainStateReader>>);

    /// Sign the given hash with the requested account.
    ///
    /// If the wallet requires additional authentication (a password to
    /// decrypt the key, or a PIN to confirm on-device), an
    /// [`AccountError::AuthNeeded`] is returned describing what the user is
    /// expected to supply; retry through the passphrase bearing variant.
    fn sign_hash(&self, account: &Account, hash: &[u8; 32]) -> Result<Vec<u8>, AccountError>;

    /// Like `sign_hash`, but also takes the needed extra authentication.
    fn sign_hash_with_passphrase(
        &self,
        account: &Account,
        passphrase: &str,
        hash: &[u8; 32],
    ) -> Result<Vec<u8>, AccountError>;

    /// Sign the hash of arbitrary data of the given mimetype. The same
    /// [`AccountError::AuthNeeded`] convention as `sign_hash` applies.
    ///
    /// An erroneous call might swap the passphrase and mimetype arguments of
    /// the passphrase variant, so implementations must never echo the
    /// mimetype in an error response.
    fn sign_data(&self, account: &Account, mime_type: &str, data: &[u8]) -> Result<Vec<u8>, AccountError>;

    fn sign_data_with_passphrase(
        &self,
        account: &Account,
        passphrase: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<Vec<u8>, AccountError>;

    /// Sign the digest of a message prefixed by the signed-message scheme
    /// (see [`crate::account::text_hash`]). The signature is returned in
    /// canonical form, with v at 0 or 1.
    fn sign_text(&self, account: &Account, text: &[u8]) -> Result<Vec<u8>, AccountError>;

    fn sign_text_with_passphrase(
        &self,
        account: &Account,
        passphrase: &str,
        text: &[u8],
    ) -> Result<Vec<u8>, AccountError>;

    /// Sign the given transaction, returning the signed copy. The same
    /// [`AccountError::AuthNeeded`] convention as `sign_hash` applies.
    fn sign_tx(
        &self,
        account: &Account,
        tx: &Transaction,
        chain_id: Option<u64>,
    ) -> Result<Transaction, AccountError>;

    fn sign_tx_with_passphrase(
        &self,
        account: &Account,
        passphrase: &str,
        tx: &Transaction,
        chain_id: Option<u64>,
    ) -> Result<Transaction, AccountError>;
}

/// Chain state queries used by self-derivation to decide whether a derived
/// account has seen activity and is worth tracking.
pub trait ChainStateReader: Send + Sync {
    fn balance(&self, address: &Address) -> Result<u128, AccountError>;
    fn nonce(&self, address: &Address) -> Result<u64, AccountError>;
}

/// Closed set of backend implementations, used as the registry key for
/// looking up all backends of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Filesystem keystore watcher.
    Keystore,
    /// USB hardware wallet hub.
    UsbHub,
}

/// A wallet provider: a batch of wallets it can open and sign with on
/// request.
pub trait Backend: Send + Sync {
    /// Which registry slot this backend belongs to.
    fn kind(&self) -> BackendKind;

    /// The wallets the backend is currently aware of, sorted by their URL.
    ///
    /// Returned wallets are not opened: no seeds are decrypted and no device
    /// connections are established. Since wallets (especially hardware) come
    /// and go, the same wallet may appear at different positions in
    /// subsequent retrievals.
    fn wallets(&self) -> Vec<Arc<dyn Wallet>>;

    /// Async subscription receiving notifications when the backend detects
    /// the arrival or departure of a wallet.
    fn subscribe(&self, sink: Box<dyn EventSink<WalletEvent>>) -> Subscription;
}

/// Settings of the global account manager.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Config {
    /// Whether account unlocking in an insecure environment is allowed.
    /// Enforced by the callers exposing unlock operations, not here.
    #[serde(default)]
    pub allow_insecure_unlock: bool,
}
