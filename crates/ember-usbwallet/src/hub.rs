//! Hot-pluggable USB hardware wallet hub.
//!
//! A hub tracks the connected devices of one vendor/protocol family. Every
//! refresh re-enumerates the bus and reconciles the result against the
//! tracked wallet list with a sorted merge, firing arrival and departure
//! events for the differences. Enumeration is throttled and circuit-broken:
//! USB stacks do not appreciate being hammered, and a broken one is not
//! worth retrying every cycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};

use ember_accounts::feed::{EventSink, Feed, Subscription};
use ember_accounts::{Backend, BackendKind, Url, Wallet, WalletEvent, WalletEventKind};

use crate::bus::{UsbBus, UsbError};
use crate::driver::DriverFactory;
use crate::wallet::UsbWallet;

/// Protocol scheme prefixing Ledger wallet and account URLs.
pub const LEDGER_SCHEME: &str = "ledger";

/// Protocol scheme prefixing Trezor wallet and account URLs.
pub const TREZOR_SCHEME: &str = "trezor";

/// Maximum time between wallet refreshes: USB hotplug notifications are not
/// reliable everywhere, so the updater polls.
const REFRESH_CYCLE: Duration = Duration::from_secs(1);

/// Minimum time between wallet refreshes to avoid USB thrashing.
const REFRESH_THROTTLE: Duration = Duration::from_millis(500);

/// Consecutive enumeration failures after which refreshes stop attempting
/// the bus, until a success resets the counter.
const MAX_ENUM_FAILURES: u32 = 2;

/// Counted guard serializing device communication against enumeration.
///
/// hidapi on Linux opens devices while enumerating, which breaks a protocol
/// exchange waiting on user confirmation. Exchanges register here, and the
/// hub skips any refresh while one is pending.
pub(crate) struct CommsTracker {
    pending: Mutex<u32>,
}

impl CommsTracker {
    pub(crate) fn new() -> Self {
        Self { pending: Mutex::new(0) }
    }

    fn lock_pending(&self) -> MutexGuard<'_, u32> {
        self.pending.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Register an in-flight device exchange for the lifetime of the
    /// returned token.
    pub(crate) fn begin(self: &Arc<Self>) -> CommsOp {
        *self.lock_pending() += 1;
        CommsOp { tracker: Arc::clone(self) }
    }
}

/// Token of one in-flight device exchange.
pub(crate) struct CommsOp {
    tracker: Arc<CommsTracker>,
}

impl Drop for CommsOp {
    fn drop(&mut self) {
        let mut pending = self.tracker.lock_pending();
        *pending = pending.saturating_sub(1);
    }
}

/// An account backend finding and handling generic USB hardware wallets.
pub struct Hub {
    /// Protocol scheme prefixing account and wallet URLs.
    scheme: &'static str,
    /// USB vendor identifier used for device discovery.
    vendor_id: u16,
    /// USB product identifiers accepted during discovery.
    product_ids: Vec<u16>,
    /// HID usage page identifier, the discovery criterion on macOS and
    /// Windows.
    usage_id: u16,
    /// Interface number, the discovery criterion on Linux.
    interface_id: i32,
    /// Factory constructing a vendor specific driver per device.
    make_driver: DriverFactory,
    bus: Arc<dyn UsbBus>,
    comms: Arc<CommsTracker>,
    /// Number of consecutive enumeration failures.
    enum_fails: AtomicU32,
    state: RwLock<HubState>,
    /// Feed notifying wallet additions and removals.
    feed: Feed<WalletEvent>,
    weak: Weak<Hub>,
}

struct HubState {
    /// When the wallet list was last refreshed.
    refreshed: Option<Instant>,
    /// USB wallet devices currently tracked, sorted by URL.
    wallets: Vec<Arc<dyn Wallet>>,
    /// Whether the event notification loop is running.
    updating: bool,
}

impl Hub {
    /// Hardware wallet hub for Ledger devices.
    pub fn ledger(bus: Arc<dyn UsbBus>, make_driver: DriverFactory) -> Result<Arc<Self>, UsbError> {
        Self::with_bus(
            LEDGER_SCHEME,
            0x2c97,
            vec![
                0x0000, // Ledger Blue
                0x0001, // Ledger Nano S
                0x0004, // Ledger Nano X
                0x0015, // HID + U2F + WebUSB Ledger Blue
                0x1015, // HID + U2F + WebUSB Ledger Nano S
                0x4015, // HID + U2F + WebUSB Ledger Nano X
                0x0011, // HID + WebUSB Ledger Blue
                0x1011, // HID + WebUSB Ledger Nano S
                0x4011, // HID + WebUSB Ledger Nano X
            ],
            0xffa0,
            0,
            bus,
            make_driver,
        )
    }

    /// Hardware wallet hub for Trezor devices exposed over HID.
    pub fn trezor_hid(bus: Arc<dyn UsbBus>, make_driver: DriverFactory) -> Result<Arc<Self>, UsbError> {
        Self::with_bus(TREZOR_SCHEME, 0x534c, vec![0x0001], 0xff00, 0, bus, make_driver)
    }

    /// Hardware wallet hub for Trezor devices with firmware newer than
    /// 1.8.0, which switched to WebUSB.
    pub fn trezor_webusb(bus: Arc<dyn UsbBus>, make_driver: DriverFactory) -> Result<Arc<Self>, UsbError> {
        // No usage page on WebUSB; 0xffff avoids matching unset fields.
        Self::with_bus(TREZOR_SCHEME, 0x1209, vec![0x53c1], 0xffff, 0, bus, make_driver)
    }

    /// Hub over an arbitrary transport and driver family.
    pub fn with_bus(
        scheme: &'static str,
        vendor_id: u16,
        product_ids: Vec<u16>,
        usage_id: u16,
        interface_id: i32,
        bus: Arc<dyn UsbBus>,
        make_driver: DriverFactory,
    ) -> Result<Arc<Self>, UsbError> {
        if !bus.supported() {
            return Err(UsbError::Unsupported);
        }
        let hub = Arc::new_cyclic(|weak| Hub {
            scheme,
            vendor_id,
            product_ids,
            usage_id,
            interface_id,
            make_driver,
            bus,
            comms: Arc::new(CommsTracker::new()),
            enum_fails: AtomicU32::new(0),
            state: RwLock::new(HubState {
                refreshed: None,
                wallets: Vec::new(),
                updating: false,
            }),
            feed: Feed::new(),
            weak: weak.clone(),
        });
        hub.refresh_wallets();
        Ok(hub)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, HubState> {
        self.state.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, HubState> {
        self.state.write().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Scans the USB devices attached to the machine and updates the tracked
    /// wallet list based on what was found, firing arrival and departure
    /// events for the difference.
    pub fn refresh_wallets(&self) {
        // Don't scan the USB like crazy if the user fetches wallets in a
        // loop.
        {
            let state = self.read_state();
            if let Some(refreshed) = state.refreshed {
                if refreshed.elapsed() < REFRESH_THROTTLE {
                    return;
                }
            }
        }
        // If enumeration keeps failing, don't keep trying indefinitely.
        if self.enum_fails.load(Ordering::Relaxed) > MAX_ENUM_FAILURES {
            return;
        }
        // hidapi on Linux opens the device during enumeration, breaking any
        // exchange waiting on user confirmation. Hold the comms guard across
        // the enumeration, and skip the refresh outright while an exchange
        // is pending.
        let mut comms_guard = None;
        if cfg!(target_os = "linux") {
            let pending = self.comms.lock_pending();
            if *pending > 0 {
                return;
            }
            comms_guard = Some(pending);
        }
        let infos = match self.bus.enumerate(self.vendor_id, 0) {
            Ok(infos) => infos,
            Err(err) => {
                let failures = self.enum_fails.fetch_add(1, Ordering::Relaxed) + 1;
                drop(comms_guard);
                error!(
                    "failed to enumerate USB devices: hub={} vendor={:#06x} failures={} err={}",
                    self.scheme, self.vendor_id, failures, err
                );
                return;
            }
        };
        self.enum_fails.store(0, Ordering::Relaxed);

        // Keep the devices whose product id is accepted and whose HID
        // metadata matches; platforms disagree on whether the usage page or
        // the interface number carries the wallet interface, so both are
        // checked.
        let mut devices = Vec::new();
        for info in infos {
            if self.product_ids.contains(&info.product_id)
                && (info.usage_page == self.usage_id || info.interface == self.interface_id)
            {
                devices.push(info);
            }
        }
        drop(comms_guard);

        // Transform the current list of wallets into the new one.
        let mut state = self.write_state();
        let mut tracked: VecDeque<Arc<dyn Wallet>> = std::mem::take(&mut state.wallets).into();
        let mut wallets: Vec<Arc<dyn Wallet>> = Vec::with_capacity(devices.len());
        let mut events: Vec<WalletEvent> = Vec::new();

        for device in devices {
            let url = Url::new(self.scheme, device.path.clone());

            // Drop failed wallets sorting in front of the device; healthy
            // ones stay until enumeration stops reporting them.
            while let Some(head) = tracked.front() {
                let (_, failure) = head.status();
                if head.url() >= url || failure.is_none() {
                    break;
                }
                if let Some(stale) = tracked.pop_front() {
                    debug!("dropping stale USB wallet: url={}", stale.url().terminal_string());
                    events.push(WalletEvent { wallet: stale, kind: WalletEventKind::Dropped });
                }
            }
            // If there are no more wallets, or the device sorts before the
            // next tracked one, wrap it in a fresh wallet.
            let head_url = tracked.front().map(|wallet| wallet.url());
            if head_url.as_ref().map_or(true, |head| *head > url) {
                let driver = (self.make_driver)(&url);
                let wallet: Arc<dyn Wallet> = Arc::new(UsbWallet::new(
                    url.clone(),
                    device,
                    driver,
                    Arc::clone(&self.bus),
                    Arc::clone(&self.comms),
                ));
                debug!("USB wallet arrived: url={}", url.terminal_string());
                events.push(WalletEvent { wallet: Arc::clone(&wallet), kind: WalletEventKind::Arrived });
                wallets.push(wallet);
                continue;
            }
            // If the device matches the head wallet, keep the existing
            // session.
            if head_url.as_ref() == Some(&url) {
                if let Some(existing) = tracked.pop_front() {
                    wallets.push(existing);
                }
            }
            // Otherwise a healthy tracked wallet still sorts first; both are
            // revisited on the next refresh.
        }
        // Drop any leftover wallets and swap in the new batch.
        for wallet in tracked {
            debug!("USB wallet departed: url={}", wallet.url().terminal_string());
            events.push(WalletEvent { wallet, kind: WalletEventKind::Dropped });
        }
        state.refreshed = Some(Instant::now());
        state.wallets = wallets;
        drop(state);

        // Fire all wallet events outside the state lock.
        for event in events {
            self.feed.send(event);
        }
    }

    /// Maintains an up-to-date wallet list while subscribers exist, firing
    /// addition/removal events along the way.
    fn updater(self: Arc<Self>) {
        loop {
            // TODO: react to USB hotplug events once the transport surfaces
            // them, instead of polling.
            thread::sleep(REFRESH_CYCLE);
            self.refresh_wallets();

            // Check for subscribers only after the sleep: one may have
            // arrived while we were waiting.
            let mut state = self.write_state();
            if self.feed.subscriber_count() == 0 {
                state.updating = false;
                return;
            }
        }
    }
}

impl Backend for Hub {
    fn kind(&self) -> BackendKind {
        BackendKind::UsbHub
    }

    /// All currently tracked USB devices that appear to be hardware wallets.
    fn wallets(&self) -> Vec<Arc<dyn Wallet>> {
        // Make sure the list of wallets is up to date.
        self.refresh_wallets();
        self.read_state().wallets.clone()
    }

    /// Subscribes to wallet arrival/departure notifications, starting the
    /// notification loop if it is not yet running.
    fn subscribe(&self, sink: Box<dyn EventSink<WalletEvent>>) -> Subscription {
        let subscription = self.feed.subscribe(sink);

        let mut state = self.write_state();
        if !state.updating {
            state.updating = true;
            if let Some(hub) = self.weak.upgrade() {
                thread::spawn(move || hub.updater());
            }
        }
        subscription
    }
}
