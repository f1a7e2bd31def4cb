//! USB hardware wallet sessions.
//!
//! A [`UsbWallet`] wraps one enumerated device: it owns the vendor driver,
//! the open device session, the accounts pinned by derivation, and the
//! cursors for self-derivation. All session state sits behind one mutex, so
//! operations on a single wallet are serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use ember_accounts::{
    Account, AccountError, Address, ChainStateReader, DerivationPath, Transaction, Url, Wallet,
};

use crate::bus::{DeviceInfo, UsbBus};
use crate::driver::Driver;
use crate::hub::CommsTracker;

/// Minimum interval between self-derivation sweeps, to keep account queries
/// from hammering the device and the chain source.
const SELF_DERIVE_THROTTLE: Duration = Duration::from_secs(1);

/// A hardware wallet attached over USB.
pub struct UsbWallet {
    url: Url,
    info: DeviceInfo,
    bus: Arc<dyn UsbBus>,
    comms: Arc<CommsTracker>,
    state: Mutex<WalletState>,
}

struct WalletState {
    driver: Box<dyn Driver>,
    /// Whether a device session is established with the driver.
    session: bool,
    /// Accounts pinned by explicit or self derivation, in pin order.
    accounts: Vec<Account>,
    /// Known derivation paths per pinned address.
    paths: HashMap<Address, DerivationPath>,
    self_derivation: Option<SelfDerivation>,
}

struct SelfDerivation {
    /// One cursor per base path; each points at the next account to probe.
    next_paths: Vec<DerivationPath>,
    chain: Arc<dyn ChainStateReader>,
    last_sweep: Option<Instant>,
}

impl UsbWallet {
    pub(crate) fn new(
        url: Url,
        info: DeviceInfo,
        driver: Box<dyn Driver>,
        bus: Arc<dyn UsbBus>,
        comms: Arc<CommsTracker>,
    ) -> Self {
        Self {
            url,
            info,
            bus,
            comms,
            state: Mutex::new(WalletState {
                driver,
                session: false,
                accounts: Vec::new(),
                paths: HashMap::new(),
                self_derivation: None,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// One round of account discovery, if armed, the session is open, and
    /// the previous round is old enough.
    ///
    /// For each base cursor: derive sequentially, pin every account the
    /// chain has seen activity for, and stop at the first idle account.
    /// The cursor stays on it so a later round notices incoming funds.
    fn self_derive_sweep(&self) {
        let mut state = self.lock_state();
        let WalletState { session, driver, accounts, paths, self_derivation } = &mut *state;
        if !*session {
            return;
        }
        let Some(sd) = self_derivation.as_mut() else {
            return;
        };
        if let Some(last) = sd.last_sweep {
            if last.elapsed() < SELF_DERIVE_THROTTLE {
                return;
            }
        }
        let _op = self.comms.begin();
        for cursor in sd.next_paths.iter_mut() {
            if cursor.is_empty() {
                continue;
            }
            loop {
                let address = match driver.derive(cursor) {
                    Ok(address) => address,
                    Err(err) => {
                        warn!("self-derivation aborted: wallet={} err={}", self.url.terminal_string(), err);
                        sd.last_sweep = Some(Instant::now());
                        return;
                    }
                };
                let activity = sd.chain.balance(&address).and_then(|balance| {
                    sd.chain.nonce(&address).map(|nonce| balance > 0 || nonce > 0)
                });
                let active = match activity {
                    Ok(active) => active,
                    Err(err) => {
                        warn!("self-derivation chain query failed: wallet={} err={}", self.url.terminal_string(), err);
                        break;
                    }
                };
                if !active {
                    break;
                }
                if !paths.contains_key(&address) {
                    info!("self-derivation found active account: address={} path={}", address, cursor);
                    accounts.push(Account { address, url: self.url.clone() });
                    paths.insert(address, cursor.clone());
                }
                let mut components = cursor.components().to_vec();
                let last = components.len() - 1;
                components[last] = components[last].wrapping_add(1);
                *cursor = DerivationPath::from(components);
            }
        }
        sd.last_sweep = Some(Instant::now());
    }
}

impl Wallet for UsbWallet {
    fn url(&self) -> Url {
        self.url.clone()
    }

    fn status(&self) -> (String, Option<AccountError>) {
        let state = self.lock_state();
        if !state.session {
            return ("Closed".to_string(), None);
        }
        state.driver.status()
    }

    fn open(&self, passphrase: &str) -> Result<(), AccountError> {
        {
            let mut state = self.lock_state();
            if state.session {
                return Err(AccountError::WalletAlreadyOpen);
            }
            let device = self
                .bus
                .open(&self.info.path)
                .map_err(|err| AccountError::Other(err.to_string()))?;
            let _op = self.comms.begin();
            state.driver.open(device, passphrase)?;
            state.session = true;
        }
        debug!("USB wallet opened: url={}", self.url.terminal_string());
        self.self_derive_sweep();
        Ok(())
    }

    fn close(&self) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        let result = state.driver.close();
        state.session = false;
        result
    }

    fn accounts(&self) -> Vec<Account> {
        self.self_derive_sweep();
        self.lock_state().accounts.clone()
    }

    fn contains(&self, account: &Account) -> bool {
        self.lock_state().paths.contains_key(&account.address)
    }

    fn derive(&self, path: &DerivationPath, pin: bool) -> Result<Account, AccountError> {
        let mut state = self.lock_state();
        if !state.session {
            return Err(AccountError::WalletClosed);
        }
        let address = {
            let _op = self.comms.begin();
            state.driver.derive(path)?
        };
        let account = Account { address, url: self.url.clone() };
        if pin && !state.paths.contains_key(&address) {
            state.accounts.push(account.clone());
            state.paths.insert(address, path.clone());
        }
        Ok(account)
    }

    fn self_derive(&self, bases: &[DerivationPath], chain: Option<Arc<dyn ChainStateReader>>) {
        let mut state = self.lock_state();
        state.self_derivation = chain.map(|chain| SelfDerivation {
            next_paths: bases.to_vec(),
            chain,
            last_sweep: None,
        });
    }

    fn sign_hash(&self, _account: &Account, _hash: &[u8; 32]) -> Result<Vec<u8>, AccountError> {
        Err(AccountError::NotSupported)
    }

    fn sign_hash_with_passphrase(
        &self,
        account: &Account,
        _passphrase: &str,
        hash: &[u8; 32],
    ) -> Result<Vec<u8>, AccountError> {
        self.sign_hash(account, hash)
    }

    fn sign_data(&self, _account: &Account, _mime_type: &str, _data: &[u8]) -> Result<Vec<u8>, AccountError> {
        Err(AccountError::NotSupported)
    }

    fn sign_data_with_passphrase(
        &self,
        account: &Account,
        _passphrase: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<Vec<u8>, AccountError> {
        self.sign_data(account, mime_type, data)
    }

    fn sign_text(&self, _account: &Account, _text: &[u8]) -> Result<Vec<u8>, AccountError> {
        Err(AccountError::NotSupported)
    }

    fn sign_text_with_passphrase(
        &self,
        account: &Account,
        _passphrase: &str,
        text: &[u8],
    ) -> Result<Vec<u8>, AccountError> {
        self.sign_text(account, text)
    }

    fn sign_tx(
        &self,
        account: &Account,
        tx: &Transaction,
        chain_id: Option<u64>,
    ) -> Result<Transaction, AccountError> {
        let mut state = self.lock_state();
        if !state.session {
            return Err(AccountError::WalletClosed);
        }
        let path = state
            .paths
            .get(&account.address)
            .cloned()
            .ok_or(AccountError::UnknownAccount)?;
        let (signer, signed) = {
            let _op = self.comms.begin();
            state.driver.sign_tx(&path, tx, chain_id)?
        };
        if signer != account.address {
            return Err(AccountError::Other(format!(
                "signer mismatch: expected {}, signed with {}",
                account.address, signer
            )));
        }
        Ok(signed)
    }

    fn sign_tx_with_passphrase(
        &self,
        account: &Account,
        _passphrase: &str,
        tx: &Transaction,
        chain_id: Option<u64>,
    ) -> Result<Transaction, AccountError> {
        self.sign_tx(account, tx, chain_id)
    }
}
