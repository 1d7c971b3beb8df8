// radio.rs

use crate::*;

use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Weak;

/// Station link details, as reported by `/wifiConnectInfo.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gw: Ipv4Addr,
    pub ap: String,
}

pub type RadioEventHandler = Box<dyn Fn(RadioEvent) + Send + Sync>;

/// The WiFi radio in AP+STA mode.
///
/// Event callbacks are delivered on the driver's own context, never on the
/// async runtime.
pub trait RadioDriver: Send + Sync {
    fn set_event_handler(&self, handler: RadioEventHandler);

    fn set_station_config(&self, conf: &StationConfig) -> anyhow::Result<()>;
    fn connect(&self) -> anyhow::Result<()>;
    fn disconnect(&self) -> anyhow::Result<()>;

    /// Reconnect with the configuration already applied.
    /// Called from the driver event context.
    fn reconnect(&self) -> anyhow::Result<()> {
        self.connect()
    }

    fn sta_info(&self) -> anyhow::Result<Option<ConnectionInfo>>;
    fn ap_ssid(&self) -> anyhow::Result<String>;
}

pub trait StatusIndicator: Send + Sync {
    fn set_status(&self, status: LedStatus);
}

/// Connection retry budget, shared between the driver event context (which
/// spends it) and the coordinator (which resets or exhausts it).
#[derive(Clone, Debug)]
pub struct RetryCounter {
    count: Arc<AtomicU32>,
    max: u32,
}

impl RetryCounter {
    pub fn new(max: u32) -> Self {
        Self {
            count: Arc::new(AtomicU32::new(0)),
            max,
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    /// Make the next disconnect terminal.
    pub fn exhaust(&self) {
        self.count.store(self.max, Ordering::SeqCst);
    }

    /// Spend one retry, false if none are left.
    pub fn try_take(&self) -> bool {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn get(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// First layer of disconnect handling, run inside the driver callback.
///
/// Retries are issued straight back to the radio while the budget lasts; only
/// the terminal disconnect is queued to the coordinator.
pub struct DriverEvents {
    radio: Weak<dyn RadioDriver>,
    retries: RetryCounter,
    wifi: MsgSender<WifiMsg>,
}

impl DriverEvents {
    pub fn new(
        radio: &Arc<dyn RadioDriver>,
        retries: RetryCounter,
        wifi: MsgSender<WifiMsg>,
    ) -> Self {
        Self {
            radio: Arc::downgrade(radio),
            retries,
            wifi,
        }
    }

    /// Hook this handler into the radio's event callback.
    pub fn install(self, radio: &Arc<dyn RadioDriver>) {
        radio.set_event_handler(Box::new(move |ev| self.handle(ev)));
    }

    pub fn handle(&self, event: RadioEvent) {
        match event {
            RadioEvent::StaDisconnected { reason } => {
                info!("WIFI_EVENT_STA_DISCONNECTED, reason code {reason}");
                if self.retries.try_take() {
                    info!(
                        "Reconnecting, attempt {}/{}",
                        self.retries.get(),
                        self.retries.max()
                    );
                    if let Some(radio) = self.radio.upgrade() {
                        if let Err(e) = radio.reconnect() {
                            error!("Reconnect failed: {e:#}");
                        }
                    }
                } else {
                    self.post(WifiMsg::StaDisconnected);
                }
            }
            RadioEvent::StaGotIp => {
                info!("IP_EVENT_STA_GOT_IP");
                self.retries.reset();
                self.post(WifiMsg::StaConnectedGotIp);
            }
            other => info!("Radio event {other:?}"),
        }
    }

    fn post(&self, msg: WifiMsg) {
        if let Err(e) = self.wifi.blocking_send(msg) {
            error!("{e:#}");
        }
    }
}

// EOF
