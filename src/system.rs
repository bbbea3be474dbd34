//! Host services the engine depends on: clock, network state and wake-holds.
//!
//! Workers never read the wall clock or probe the network directly; they ask a
//! [`SystemFacade`]. [`HostSystem`] is the default implementation and can be
//! reconfigured at runtime, which is how tests simulate network changes.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

/// Kind of the active network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    Wifi,
    Mobile,
    Ethernet,
    Other,
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Wifi => "wifi",
            Self::Mobile => "mobile",
            Self::Ethernet => "ethernet",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Snapshot of the active network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub class: NetworkClass,
    /// Billed by volume.
    pub metered: bool,
    pub roaming: bool,
    /// Carrier access-point name on mobile networks.
    pub access_point: Option<String>,
}

impl NetworkInfo {
    /// An unmetered wired link.
    #[must_use]
    pub fn ethernet() -> Self {
        Self {
            class: NetworkClass::Ethernet,
            metered: false,
            roaming: false,
            access_point: None,
        }
    }

    /// An unmetered wifi link.
    #[must_use]
    pub fn wifi() -> Self {
        Self {
            class: NetworkClass::Wifi,
            metered: false,
            roaming: false,
            access_point: None,
        }
    }

    /// A metered mobile link through `access_point`.
    #[must_use]
    pub fn mobile(access_point: Option<&str>) -> Self {
        Self {
            class: NetworkClass::Mobile,
            metered: true,
            roaming: false,
            access_point: access_point.map(str::to_string),
        }
    }

    /// Marks the link as roaming.
    #[must_use]
    pub fn roaming(mut self) -> Self {
        self.roaming = true;
        self
    }
}

/// Keeps the host awake while held. Released on drop.
pub trait WakeHold: Send + Sync {}

/// Clock, network and wake-hold services.
pub trait SystemFacade: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// The active network, `None` when offline.
    fn active_network(&self) -> Option<NetworkInfo>;

    /// Acquires a wake-hold tagged for diagnostics.
    fn acquire_wake_hold(&self, tag: &str) -> Box<dyn WakeHold>;
}

/// Default facade backed by the system clock.
///
/// Network state is whatever was last configured (an unmetered wired link by
/// default). Wake-holds are counted so callers can observe outstanding holds.
#[derive(Debug)]
pub struct HostSystem {
    network: RwLock<Option<NetworkInfo>>,
    clock_offset_ms: AtomicI64,
    active_holds: Arc<AtomicUsize>,
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::with_network(Some(NetworkInfo::ethernet()))
    }

    #[must_use]
    pub fn with_network(network: Option<NetworkInfo>) -> Self {
        Self {
            network: RwLock::new(network),
            clock_offset_ms: AtomicI64::new(0),
            active_holds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replaces the reported network.
    pub fn set_network(&self, network: Option<NetworkInfo>) {
        debug!(network = ?network, "network changed");
        match self.network.write() {
            Ok(mut guard) => *guard = network,
            Err(poisoned) => *poisoned.into_inner() = network,
        }
    }

    /// Shifts the reported clock forward by `delta_ms`.
    pub fn advance_clock(&self, delta_ms: i64) {
        self.clock_offset_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Number of wake-holds currently held.
    #[must_use]
    pub fn active_holds(&self) -> usize {
        self.active_holds.load(Ordering::SeqCst)
    }
}

impl SystemFacade for HostSystem {
    fn now_ms(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        wall.saturating_add(self.clock_offset_ms.load(Ordering::SeqCst))
    }

    fn active_network(&self) -> Option<NetworkInfo> {
        match self.network.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn acquire_wake_hold(&self, tag: &str) -> Box<dyn WakeHold> {
        self.active_holds.fetch_add(1, Ordering::SeqCst);
        trace!(tag, "wake-hold acquired");
        Box::new(CountedHold {
            tag: tag.to_string(),
            counter: Arc::clone(&self.active_holds),
        })
    }
}

struct CountedHold {
    tag: String,
    counter: Arc<AtomicUsize>,
}

impl WakeHold for CountedHold {}

impl Drop for CountedHold {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        trace!(tag = %self.tag, "wake-hold released");
    }
}
