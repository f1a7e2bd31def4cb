//! Account-domain error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    /// No backend provides the requested account.
    #[error("unknown account")]
    UnknownAccount,

    /// No backend provides the requested wallet.
    #[error("unknown wallet")]
    UnknownWallet,

    /// The backend does not support the requested operation.
    #[error("not supported")]
    NotSupported,

    /// A decryption operation received a bad passphrase.
    #[error("invalid password")]
    InvalidPassphrase,

    /// The wallet was asked to open a second time.
    #[error("wallet already open")]
    WalletAlreadyOpen,

    /// The operation needs an open wallet session.
    #[error("wallet closed")]
    WalletClosed,

    /// The user must provide further authentication before signing can
    /// succeed: usually a password, or a one time PIN code displayed by a
    /// hardware device. Not terminal, retry through the passphrase bearing
    /// call.
    #[error("authentication needed: {0}")]
    AuthNeeded(String),

    #[error("empty derivation path")]
    EmptyPath,

    #[error("ambiguous path: use 'm/' prefix for absolute paths, or no leading '/' for relative ones")]
    AmbiguousPath,

    #[error("invalid component: {0}")]
    InvalidComponent(String),

    #[error("component {value} out of allowed range [0, {max}]")]
    ComponentOutOfRange { value: String, max: u32 },

    #[error("component {value} out of allowed hardened range [0, {max}]")]
    HardenedComponentOutOfRange { value: String, max: u32 },

    /// A wallet or account URL without a `scheme://` prefix.
    #[error("protocol scheme missing")]
    MissingScheme,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("{0}")]
    Other(String),
}
