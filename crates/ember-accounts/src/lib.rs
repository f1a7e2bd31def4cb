//! Ember account and wallet management core.
//!
//! Presents a uniform view over heterogeneous account backends, software
//! keystores and USB hardware wallets alike: hierarchical derivation paths,
//! canonical wallet URLs, the wallet/backend capability contracts, the event
//! feed, and the multi-backend [`Manager`] aggregating everything into one
//! sorted catalog.

pub mod account;
pub mod error;
pub mod feed;
pub mod hd;
pub mod manager;
pub mod transaction;
pub mod url;
pub mod wallet;

pub use account::{text_and_hash, text_hash, Account, Address, WalletEvent, WalletEventKind};
pub use error::AccountError;
pub use feed::{EventSink, Feed, Subscription};
pub use hd::{default_iterator, ledger_live_iterator, DerivationPath, DerivationPathIterator};
pub use manager::Manager;
pub use transaction::{Signature, Transaction};
pub use url::Url;
pub use wallet::{Backend, BackendKind, ChainStateReader, Config, Wallet};
