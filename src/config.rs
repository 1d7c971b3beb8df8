// config.rs

pub use anyhow::{anyhow, bail, Context};
pub use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicU8, Ordering};
pub use tokio::time::{sleep, Duration};
pub use tracing::{debug, error, info, warn};

use std::net::Ipv4Addr;

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMPILE_TIME: &str = match option_env!("BUILD_TIME") {
    Some(t) => t,
    None => "unknown",
};
pub const COMPILE_DATE: &str = match option_env!("BUILD_DATE") {
    Some(d) => d,
    None => "unknown",
};

const DEFAULT_AP_SSID: &str = match option_env!("WIFI_AP_SSID") {
    Some(s) => s,
    None => "ESP32_AP",
};
const DEFAULT_AP_PASSWORD: &str = match option_env!("WIFI_AP_PASSWORD") {
    Some(s) => s,
    None => "password",
};

#[derive(Clone, Debug)]
pub struct MyConfig {
    pub ap_ssid: String,
    pub ap_password: String,
    pub ap_channel: u8,
    pub ap_ssid_hidden: bool,
    pub ap_max_connections: u16,
    pub ap_beacon_interval: u16,
    pub ap_ip: Ipv4Addr,
    pub ap_gateway: Ipv4Addr,
    pub ap_netmask: Ipv4Addr,

    pub api_port: u16,

    /// Driver-level reconnects before a disconnect is reported as terminal.
    pub max_connection_retries: u32,
    pub queue_depth: usize,

    pub ota_chunk_size: usize,
    pub ota_read_timeout_ms: u64,
    pub restart_delay_ms: u64,

    pub sensor_poll_secs: u64,
}

impl Default for MyConfig {
    fn default() -> Self {
        Self {
            ap_ssid: DEFAULT_AP_SSID.into(),
            ap_password: DEFAULT_AP_PASSWORD.into(),
            ap_channel: 1,
            ap_ssid_hidden: false,
            ap_max_connections: 5,
            ap_beacon_interval: 100,
            ap_ip: Ipv4Addr::new(192, 168, 0, 1),
            ap_gateway: Ipv4Addr::new(192, 168, 0, 1),
            ap_netmask: Ipv4Addr::new(255, 255, 255, 0),

            api_port: 80,

            max_connection_retries: 5,
            queue_depth: 3,

            ota_chunk_size: 1024,
            ota_read_timeout_ms: 10_000,
            restart_delay_ms: 8_000,

            sensor_poll_secs: 4,
        }
    }
}

impl MyConfig {
    pub fn ota_read_timeout(&self) -> Duration {
        Duration::from_millis(self.ota_read_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn sensor_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sensor_poll_secs)
    }
}

// EOF
