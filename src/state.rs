// state.rs

use crate::*;

use tokio::sync::{Mutex, RwLock};

pub type SharedState = Arc<Pin<Box<MyState>>>;

/// The firmware sink plus whether an image has been committed this boot.
/// Both live under one lock so an upload queued behind a successful one
/// sees the commit.
pub struct FirmwareSlot {
    pub sink: Box<dyn FirmwareSink>,
    pub committed: bool,
}

/// Process-wide context shared by the coordinator and the control surface.
///
/// `wifi_connect_status`, `ota_update_status` and `local_time_set` have a
/// single writer (the HTTP monitor task); readers may see a stale value.
/// `sta_config` is written by the credential-update handler strictly before
/// it posts the connect message, and by the coordinator when it loads saved
/// credentials.
pub struct MyState {
    pub config: MyConfig,
    pub bus: Bus,
    pub api_cnt: AtomicU32,

    pub wifi_connect_status: AtomicU8,
    pub ota_update_status: AtomicI8,
    pub local_time_set: AtomicBool,

    pub sta_config: RwLock<StationConfig>,
    pub retries: RetryCounter,
    pub sensor: RwLock<SensorReading>,

    pub radio: Arc<dyn RadioDriver>,
    pub firmware: Mutex<FirmwareSlot>,
    pub clock: Arc<dyn TimeSource>,
}

impl MyState {
    pub fn new(
        config: MyConfig,
        bus: Bus,
        radio: Arc<dyn RadioDriver>,
        firmware: Box<dyn FirmwareSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let retries = RetryCounter::new(config.max_connection_retries);
        Self {
            config,
            bus,
            api_cnt: AtomicU32::new(0),
            wifi_connect_status: AtomicU8::new(WifiConnectStatus::None.code()),
            ota_update_status: AtomicI8::new(OtaUpdateStatus::Pending.code()),
            local_time_set: AtomicBool::new(false),
            sta_config: RwLock::new(StationConfig::default()),
            retries,
            sensor: RwLock::new(SensorReading::default()),
            radio,
            firmware: Mutex::new(FirmwareSlot {
                sink: firmware,
                committed: false,
            }),
            clock,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Box::pin(self))
    }

    pub fn wifi_connect_status(&self) -> WifiConnectStatus {
        WifiConnectStatus::from_code(self.wifi_connect_status.load(Ordering::Acquire))
    }

    pub fn set_wifi_connect_status(&self, status: WifiConnectStatus) {
        self.wifi_connect_status.store(status.code(), Ordering::Release);
    }

    pub fn ota_update_status(&self) -> OtaUpdateStatus {
        OtaUpdateStatus::from_code(self.ota_update_status.load(Ordering::Acquire))
    }

    pub fn set_ota_update_status(&self, status: OtaUpdateStatus) {
        self.ota_update_status.store(status.code(), Ordering::Release);
    }

    pub fn next_api_cnt(&self) -> u32 {
        self.api_cnt.fetch_add(1, Ordering::Relaxed)
    }
}

// EOF
