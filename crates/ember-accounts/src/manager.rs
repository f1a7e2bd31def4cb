//! Multi-backend account manager.
//!
//! Aggregates the wallets of every configured backend into one sorted,
//! deduplicated catalog, keeps the catalog current from backend
//! arrival/departure events on a background thread, and re-broadcasts those
//! events to its own subscribers.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;

use log::debug;

use crate::account::{Account, Address, WalletEvent, WalletEventKind};
use crate::error::AccountError;
use crate::feed::{EventSink, Feed, Subscription};
use crate::url::Url;
use crate::wallet::{Backend, BackendKind, Config, Wallet};

/// Messages consumed by the manager's event loop.
enum ManagerMsg {
    /// A wallet event forwarded from one of the backend feeds.
    Event(WalletEvent),
    /// Terminate, acknowledging on the carried channel once done.
    Terminate(mpsc::SyncSender<()>),
}

/// Forwards backend wallet events into the manager's inbound queue.
struct EventForwarder(mpsc::SyncSender<ManagerMsg>);

impl EventSink<WalletEvent> for EventForwarder {
    fn deliver(&self, event: WalletEvent) -> bool {
        self.0.send(ManagerMsg::Event(event)).is_ok()
    }
}

/// Overarching account manager communicating with the wallets of multiple
/// backends.
pub struct Manager {
    config: Config,
    backends: HashMap<BackendKind, Vec<Arc<dyn Backend>>>,
    wallets: Arc<RwLock<Vec<Arc<dyn Wallet>>>>,
    feed: Feed<WalletEvent>,
    updates: mpsc::SyncSender<ManagerMsg>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Manager {
    /// Creates an account manager over the given backends: merges their
    /// wallet lists into the initial catalog, subscribes to every backend
    /// feed, and starts the event loop keeping the catalog current.
    pub fn new(config: Config, backends: Vec<Arc<dyn Backend>>) -> Self {
        // Retrieve the initial list of wallets and sort by URL.
        let mut wallets: Vec<Arc<dyn Wallet>> = Vec::new();
        for backend in &backends {
            wallets = merge(wallets, backend.wallets());
        }
        // Subscribe to wallet notifications from all backends.
        let (updates, inbox) = mpsc::sync_channel(4 * backends.len().max(1));
        let updaters: Vec<Subscription> = backends
            .iter()
            .map(|backend| backend.subscribe(Box::new(EventForwarder(updates.clone()))))
            .collect();

        let mut by_kind: HashMap<BackendKind, Vec<Arc<dyn Backend>>> = HashMap::new();
        for backend in backends {
            by_kind.entry(backend.kind()).or_default().push(backend);
        }

        let wallets = Arc::new(RwLock::new(wallets));
        let feed = Feed::new();

        let handle = thread::spawn({
            let wallets = Arc::clone(&wallets);
            let feed = feed.clone();
            move || update_loop(inbox, wallets, feed, updaters)
        });

        Self {
            config,
            backends: by_kind,
            wallets,
            feed,
            updates,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Terminates the internal notification processes and releases every
    /// backend subscription. Terminal: the manager cannot be restarted, and
    /// repeated calls are no-ops.
    pub fn close(&self) -> Result<(), AccountError> {
        let handle = {
            let mut handle = self.handle.lock().unwrap_or_else(|poison| poison.into_inner());
            match handle.take() {
                Some(handle) => handle,
                None => return Ok(()),
            }
        };
        let (ack, done) = mpsc::sync_channel(1);
        if self.updates.send(ManagerMsg::Terminate(ack)).is_ok() {
            let _ = done.recv();
        }
        handle
            .join()
            .map_err(|_| AccountError::Other("account manager event loop panicked".to_string()))
    }

    /// The manager's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// All backends registered under the given kind.
    pub fn backends(&self, kind: BackendKind) -> Vec<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned().unwrap_or_default()
    }

    /// Snapshot of all wallets registered under this manager, sorted by URL.
    pub fn wallets(&self) -> Vec<Arc<dyn Wallet>> {
        self.wallets
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    /// The wallet associated with a particular URL.
    pub fn wallet(&self, url: &str) -> Result<Arc<dyn Wallet>, AccountError> {
        let parsed: Url = url.parse()?;
        for wallet in self.wallets() {
            if wallet.url() == parsed {
                return Ok(wallet);
            }
        }
        Err(AccountError::UnknownWallet)
    }

    /// All account addresses of all wallets within the manager.
    pub fn accounts(&self) -> Vec<Address> {
        let wallets = self.wallets.read().unwrap_or_else(|poison| poison.into_inner());
        let mut addresses = Vec::new();
        for wallet in wallets.iter() {
            for account in wallet.accounts() {
                addresses.push(account.address);
            }
        }
        addresses
    }

    /// The wallet containing a specific account. Since accounts can be
    /// dynamically added to and removed from wallets, this runs linear in
    /// the number of wallets.
    pub fn find(&self, account: &Account) -> Result<Arc<dyn Wallet>, AccountError> {
        let wallets = self.wallets.read().unwrap_or_else(|poison| poison.into_inner());
        for wallet in wallets.iter() {
            if wallet.contains(account) {
                return Ok(Arc::clone(wallet));
            }
        }
        Err(AccountError::UnknownAccount)
    }

    /// Async subscription receiving notifications when the manager detects
    /// a wallet arriving at or departing from any of its backends.
    pub fn subscribe(&self, sink: Box<dyn EventSink<WalletEvent>>) -> Subscription {
        self.feed.subscribe(sink)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The wallet event loop: listens for backend notifications, updates the
/// catalog, and re-broadcasts each event to the manager's subscribers.
fn update_loop(
    inbox: mpsc::Receiver<ManagerMsg>,
    wallets: Arc<RwLock<Vec<Arc<dyn Wallet>>>>,
    feed: Feed<WalletEvent>,
    mut updaters: Vec<Subscription>,
) {
    loop {
        match inbox.recv() {
            Ok(ManagerMsg::Event(event)) => {
                {
                    let mut catalog = wallets.write().unwrap_or_else(|poison| poison.into_inner());
                    let list = std::mem::take(&mut *catalog);
                    *catalog = match event.kind {
                        WalletEventKind::Arrived => merge(list, vec![Arc::clone(&event.wallet)]),
                        WalletEventKind::Dropped => drop_wallets(list, vec![Arc::clone(&event.wallet)]),
                        WalletEventKind::Opened => list,
                    };
                }
                debug!("wallet {} {:?}", event.wallet.url().terminal_string(), event.kind);
                // Re-broadcast outside the catalog lock so a slow subscriber
                // cannot stall catalog updates.
                feed.send(event);
            }
            Ok(ManagerMsg::Terminate(ack)) => {
                for updater in updaters.drain(..) {
                    updater.unsubscribe();
                }
                let _ = ack.send(());
                return;
            }
            // All senders disconnected; nothing left to track.
            Err(_) => return,
        }
    }
}

/// Sorted analogue of append: inserts new wallets at their URL-ordered
/// position. An arrival for an already tracked URL replaces the entry
/// instead of duplicating it.
fn merge(mut slice: Vec<Arc<dyn Wallet>>, wallets: Vec<Arc<dyn Wallet>>) -> Vec<Arc<dyn Wallet>> {
    for wallet in wallets {
        match slice.binary_search_by(|probe| probe.url().cmp(&wallet.url())) {
            Ok(n) => slice[n] = wallet,
            Err(n) => slice.insert(n, wallet),
        }
    }
    slice
}

/// Counterpart of merge: removes the given wallets from the sorted cache.
/// Unknown URLs are ignored, which can happen during startup races.
fn drop_wallets(mut slice: Vec<Arc<dyn Wallet>>, wallets: Vec<Arc<dyn Wallet>>) -> Vec<Arc<dyn Wallet>> {
    for wallet in wallets {
        if let Ok(n) = slice.binary_search_by(|probe| probe.url().cmp(&wallet.url())) {
            slice.remove(n);
        }
    }
    slice
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;
    use std::time::Duration;

    use crate::hd::DerivationPath;
    use crate::transaction::Transaction;
    use crate::wallet::ChainStateReader;

    /// Inert wallet carrying a URL and a fixed account list.
    struct StubWallet {
        url: Url,
        accounts: Vec<Account>,
    }

    impl StubWallet {
        fn new(url: &str) -> Arc<dyn Wallet> {
            let url: Url = url.parse().unwrap();
            Arc::new(Self { url, accounts: Vec::new() })
        }

        fn with_account(url: &str, address: Address) -> Arc<dyn Wallet> {
            let url: Url = url.parse().unwrap();
            let account = Account { address, url: url.clone() };
            Arc::new(Self { url, accounts: vec![account] })
        }
    }

    impl Wallet for StubWallet {
        fn url(&self) -> Url {
            self.url.clone()
        }
        fn status(&self) -> (String, Option<AccountError>) {
            ("Closed".to_string(), None)
        }
        fn open(&self, _passphrase: &str) -> Result<(), AccountError> {
            Ok(())
        }
        fn close(&self) -> Result<(), AccountError> {
            Ok(())
        }
        fn accounts(&self) -> Vec<Account> {
            self.accounts.clone()
        }
        fn contains(&self, account: &Account) -> bool {
            self.accounts.iter().any(|a| a.address == account.address)
        }
        fn derive(&self, _path: &DerivationPath, _pin: bool) -> Result<Account, AccountError> {
            Err(AccountError::NotSupported)
        }
        fn self_derive(&self, _bases: &[DerivationPath], _chain: Option<Arc<dyn ChainStateReader>>) {}
        fn sign_hash(&self, _account: &Account, _hash: &[u8; 32]) -> Result<Vec<u8>, AccountError> {
            Err(AccountError::NotSupported)
        }
        fn sign_hash_with_passphrase(
            &self,
            _account: &Account,
            _passphrase: &str,
            _hash: &[u8; 32],
        ) -> Result<Vec<u8>, AccountError> {
            Err(AccountError::NotSupported)
        }
        fn sign_data(&self, _account: &Account, _mime: &str, _data: &[u8]) -> Result<Vec<u8>, AccountError> {
            Err(AccountError::NotSupported)
        }
        fn sign_data_with_passphrase(
            &self,
            _account: &Account,
            _passphrase: &str,
            _mime: &str,
            _data: &[u8],
        ) -> Result<Vec<u8>, AccountError> {
            Err(AccountError::NotSupported)
        }
        fn sign_text(&self, _account: &Account, _text: &[u8]) -> Result<Vec<u8>, AccountError> {
            Err(AccountError::NotSupported)
        }
        fn sign_text_with_passphrase(
            &self,
            _account: &Account,
            _passphrase: &str,
            _text: &[u8],
        ) -> Result<Vec<u8>, AccountError> {
            Err(AccountError::NotSupported)
        }
        fn sign_tx(
            &self,
            _account: &Account,
            _tx: &Transaction,
            _chain_id: Option<u64>,
        ) -> Result<Transaction, AccountError> {
            Err(AccountError::NotSupported)
        }
        fn sign_tx_with_passphrase(
            &self,
            _account: &Account,
            _passphrase: &str,
            _tx: &Transaction,
            _chain_id: Option<u64>,
        ) -> Result<Transaction, AccountError> {
            Err(AccountError::NotSupported)
        }
    }

    /// Backend with a scripted wallet list and a manually fired feed.
    struct StubBackend {
        kind: BackendKind,
        wallets: Vec<Arc<dyn Wallet>>,
        feed: Feed<WalletEvent>,
    }

    impl StubBackend {
        fn new(kind: BackendKind, wallets: Vec<Arc<dyn Wallet>>) -> Arc<Self> {
            Arc::new(Self { kind, wallets, feed: Feed::new() })
        }

        fn fire(&self, wallet: Arc<dyn Wallet>, kind: WalletEventKind) {
            self.feed.send(WalletEvent { wallet, kind });
        }
    }

    impl Backend for StubBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn wallets(&self) -> Vec<Arc<dyn Wallet>> {
            self.wallets.clone()
        }
        fn subscribe(&self, sink: Box<dyn EventSink<WalletEvent>>) -> Subscription {
            self.feed.subscribe(sink)
        }
    }

    fn urls(manager: &Manager) -> Vec<String> {
        manager.wallets().iter().map(|w| w.url().to_string()).collect()
    }

    /// Spin until the catalog matches, the event loop being asynchronous.
    fn wait_for_catalog(manager: &Manager, expected: &[&str]) {
        for _ in 0..200 {
            if urls(manager) == expected {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("catalog never reached {:?}, got {:?}", expected, urls(manager));
    }

    #[test]
    fn test_initial_catalog_merged_sorted() {
        let a = StubBackend::new(BackendKind::Keystore, vec![StubWallet::new("b://2")]);
        let b = StubBackend::new(BackendKind::UsbHub, vec![StubWallet::new("a://1")]);
        let manager = Manager::new(Config::default(), vec![a, b]);

        assert_eq!(urls(&manager), ["a://1", "b://2"]);
    }

    #[test]
    fn test_arrival_and_departure_events() {
        let backend_a = StubBackend::new(BackendKind::Keystore, vec![StubWallet::new("a://1")]);
        let backend_b = StubBackend::new(BackendKind::UsbHub, vec![StubWallet::new("b://2")]);
        let manager = Manager::new(
            Config::default(),
            vec![Arc::clone(&backend_a) as Arc<dyn Backend>, backend_b],
        );
        assert_eq!(urls(&manager), ["a://1", "b://2"]);

        backend_a.fire(StubWallet::new("a://0"), WalletEventKind::Arrived);
        wait_for_catalog(&manager, &["a://0", "a://1", "b://2"]);

        backend_a.fire(StubWallet::new("a://1"), WalletEventKind::Dropped);
        wait_for_catalog(&manager, &["a://0", "b://2"]);
    }

    #[test]
    fn test_duplicate_arrival_is_idempotent() {
        let backend = StubBackend::new(BackendKind::Keystore, vec![StubWallet::new("a://1")]);
        let manager = Manager::new(Config::default(), vec![Arc::clone(&backend) as Arc<dyn Backend>]);

        backend.fire(StubWallet::new("a://1"), WalletEventKind::Arrived);
        backend.fire(StubWallet::new("a://2"), WalletEventKind::Arrived);
        wait_for_catalog(&manager, &["a://1", "a://2"]);
    }

    #[test]
    fn test_dropping_unknown_wallet_is_ignored() {
        let backend = StubBackend::new(BackendKind::Keystore, vec![StubWallet::new("a://1")]);
        let manager = Manager::new(Config::default(), vec![Arc::clone(&backend) as Arc<dyn Backend>]);

        backend.fire(StubWallet::new("a://9"), WalletEventKind::Dropped);
        backend.fire(StubWallet::new("a://2"), WalletEventKind::Arrived);
        wait_for_catalog(&manager, &["a://1", "a://2"]);
    }

    #[test]
    fn test_wallet_lookup_by_url() {
        let backend = StubBackend::new(BackendKind::Keystore, vec![StubWallet::new("a://1")]);
        let manager = Manager::new(Config::default(), vec![backend as Arc<dyn Backend>]);

        assert_eq!(manager.wallet("a://1").unwrap().url().to_string(), "a://1");
        assert!(matches!(manager.wallet("a://2"), Err(AccountError::UnknownWallet)));
        assert!(matches!(manager.wallet("not-a-url"), Err(AccountError::MissingScheme)));
    }

    #[test]
    fn test_accounts_and_find() {
        let address = Address([0x11; 20]);
        let other = Address([0x22; 20]);
        let backend = StubBackend::new(
            BackendKind::Keystore,
            vec![StubWallet::with_account("a://1", address)],
        );
        let manager = Manager::new(Config::default(), vec![backend as Arc<dyn Backend>]);

        assert_eq!(manager.accounts(), vec![address]);

        let account = Account { address, url: "a://1".parse().unwrap() };
        assert_eq!(manager.find(&account).unwrap().url().to_string(), "a://1");

        let missing = Account { address: other, url: "a://1".parse().unwrap() };
        assert!(matches!(manager.find(&missing), Err(AccountError::UnknownAccount)));
    }

    #[test]
    fn test_backends_indexed_by_kind() {
        let keystore = StubBackend::new(BackendKind::Keystore, vec![]);
        let hub = StubBackend::new(BackendKind::UsbHub, vec![]);
        let manager = Manager::new(
            Config::default(),
            vec![keystore as Arc<dyn Backend>, hub as Arc<dyn Backend>],
        );

        assert_eq!(manager.backends(BackendKind::Keystore).len(), 1);
        assert_eq!(manager.backends(BackendKind::UsbHub).len(), 1);
    }

    #[test]
    fn test_events_rebroadcast_to_subscribers() {
        let backend = StubBackend::new(BackendKind::Keystore, vec![]);
        let manager = Manager::new(Config::default(), vec![Arc::clone(&backend) as Arc<dyn Backend>]);

        let (tx, rx) = sync_channel(4);
        let _sub = manager.subscribe(Box::new(tx));

        backend.fire(StubWallet::new("a://1"), WalletEventKind::Arrived);
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.kind, WalletEventKind::Arrived);
        assert_eq!(event.wallet.url().to_string(), "a://1");
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        let backend = StubBackend::new(BackendKind::Keystore, vec![StubWallet::new("a://1")]);
        let manager = Manager::new(Config::default(), vec![Arc::clone(&backend) as Arc<dyn Backend>]);

        manager.close().unwrap();
        manager.close().unwrap();

        // The backend subscription was released with the event loop.
        assert_eq!(backend.feed.subscriber_count(), 0);

        // Events after close no longer reach the catalog.
        backend.fire(StubWallet::new("a://0"), WalletEventKind::Arrived);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(urls(&manager), ["a://1"]);
    }

    #[test]
    fn test_merge_preserves_order_and_uniqueness() {
        let mut catalog: Vec<Arc<dyn Wallet>> = Vec::new();
        for url in ["c://3", "a://1", "b://2", "a://1"] {
            catalog = merge(catalog, vec![StubWallet::new(url)]);
        }
        let urls: Vec<String> = catalog.iter().map(|w| w.url().to_string()).collect();
        assert_eq!(urls, ["a://1", "b://2", "c://3"]);

        let catalog = drop_wallets(catalog, vec![StubWallet::new("b://2")]);
        let urls: Vec<String> = catalog.iter().map(|w| w.url().to_string()).collect();
        assert_eq!(urls, ["a://1", "c://3"]);
    }

    #[test]
    fn test_config_accessor() {
        let manager = Manager::new(Config { allow_insecure_unlock: true }, vec![]);
        assert!(manager.config().allow_insecure_unlock);
    }
}
