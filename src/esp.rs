// esp.rs
//
// ESP-IDF implementations of the driver seams.

use crate::*;

use chrono::{DateTime, Local};
use embedded_svc::io::Write;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    ipv4::{self, Mask, RouterConfiguration, Subnet},
    netif::{EspNetif, IpEvent, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::{EspOta, EspOtaUpdate},
    sntp::{EspSntp, SyncStatus},
    wifi::{
        AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi,
        WifiEvent,
    },
};
use esp_idf_sys::{self as sys, esp};
use std::{
    net::Ipv4Addr,
    sync::{Mutex, RwLock},
};

const NVS_NAMESPACE: &str = "sta_creds";
const NVS_CREDS_KEY: &str = "creds";

type HandlerSlot = Arc<RwLock<Option<RadioEventHandler>>>;

/// The ESP32 radio in AP+STA mode.
pub struct EspRadio {
    wifi: Mutex<EspWifi<'static>>,
    ap_ssid: String,
    handler: HandlerSlot,
    _subs: Mutex<Vec<EspSubscription<'static, System>>>,
}

impl EspRadio {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        config: &MyConfig,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sysloop.clone(), Some(nvs))?;

        let mask = Mask::try_from(config.ap_netmask)
            .map_err(|_| anyhow!("invalid AP netmask {}", config.ap_netmask))?;
        let ap_netif = EspNetif::new_with_conf(&NetifConfiguration {
            ip_configuration: Some(ipv4::Configuration::Router(RouterConfiguration {
                subnet: Subnet {
                    gateway: config.ap_ip,
                    mask,
                },
                dhcp_enabled: true,
                dns: None,
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        })?;
        wifi.swap_netif_ap(ap_netif)?;

        let ap = AccessPointConfiguration {
            ssid: config
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("AP SSID too long"))?,
            password: config
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("AP password too long"))?,
            auth_method: AuthMethod::WPA2Personal,
            channel: config.ap_channel,
            ssid_hidden: config.ap_ssid_hidden,
            max_connections: config.ap_max_connections.into(),
            ..Default::default()
        };
        wifi.set_configuration(&Configuration::Mixed(ClientConfiguration::default(), ap))?;

        let handler: HandlerSlot = Arc::new(RwLock::new(None));
        let subs = vec![
            subscribe_wifi(&sysloop, handler.clone())?,
            subscribe_ip(&sysloop, handler.clone())?,
        ];

        info!(
            "Starting WiFi, AP {:?} on channel {}",
            config.ap_ssid, config.ap_channel
        );
        wifi.start()?;
        esp!(unsafe { sys::esp_wifi_set_ps(sys::wifi_ps_type_t_WIFI_PS_NONE) })?;

        Ok(Self {
            wifi: Mutex::new(wifi),
            ap_ssid: config.ap_ssid.clone(),
            handler,
            _subs: Mutex::new(subs),
        })
    }

    fn wifi(&self) -> anyhow::Result<std::sync::MutexGuard<'_, EspWifi<'static>>> {
        self.wifi.lock().map_err(|_| anyhow!("wifi driver poisoned"))
    }
}

fn dispatch(slot: &HandlerSlot, ev: RadioEvent) {
    if let Ok(h) = slot.read() {
        if let Some(h) = h.as_ref() {
            h(ev);
        }
    }
}

fn subscribe_wifi(
    sysloop: &EspSystemEventLoop,
    slot: HandlerSlot,
) -> anyhow::Result<EspSubscription<'static, System>> {
    Ok(sysloop.subscribe::<WifiEvent, _>(move |event| {
        let ev = match event {
            WifiEvent::ApStarted => RadioEvent::ApStart,
            WifiEvent::ApStopped => RadioEvent::ApStop,
            WifiEvent::ApStaConnected(_) => RadioEvent::ApStaConnected,
            WifiEvent::ApStaDisconnected(_) => RadioEvent::ApStaDisconnected,
            WifiEvent::StaStarted => RadioEvent::StaStart,
            WifiEvent::StaConnected(_) => RadioEvent::StaConnected,
            WifiEvent::StaDisconnected(d) => RadioEvent::StaDisconnected {
                reason: d.reason(),
            },
            _ => return,
        };
        dispatch(&slot, ev);
    })?)
}

fn subscribe_ip(
    sysloop: &EspSystemEventLoop,
    slot: HandlerSlot,
) -> anyhow::Result<EspSubscription<'static, System>> {
    Ok(sysloop.subscribe::<IpEvent, _>(move |event| {
        if let IpEvent::DhcpIpAssigned(_) = event {
            dispatch(&slot, RadioEvent::StaGotIp);
        }
    })?)
}

impl RadioDriver for EspRadio {
    fn set_event_handler(&self, handler: RadioEventHandler) {
        if let Ok(mut h) = self.handler.write() {
            *h = Some(handler);
        }
    }

    fn set_station_config(&self, conf: &StationConfig) -> anyhow::Result<()> {
        let mut wifi = self.wifi()?;
        let ap = match wifi.get_configuration()? {
            Configuration::Mixed(_, ap) | Configuration::AccessPoint(ap) => ap,
            _ => bail!("radio is not in AP+STA mode"),
        };
        let client = ClientConfiguration {
            ssid: conf
                .ssid()
                .try_into()
                .map_err(|_| anyhow!("SSID too long"))?,
            password: conf
                .password()
                .try_into()
                .map_err(|_| anyhow!("password too long"))?,
            auth_method: if conf.password().is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        };
        wifi.set_configuration(&Configuration::Mixed(client, ap))?;
        Ok(())
    }

    fn connect(&self) -> anyhow::Result<()> {
        Ok(self.wifi()?.connect()?)
    }

    fn disconnect(&self) -> anyhow::Result<()> {
        Ok(self.wifi()?.disconnect()?)
    }

    // runs on the event loop task, so keep clear of the driver mutex
    fn reconnect(&self) -> anyhow::Result<()> {
        esp!(unsafe { sys::esp_wifi_connect() })?;
        Ok(())
    }

    fn sta_info(&self) -> anyhow::Result<Option<ConnectionInfo>> {
        let wifi = self.wifi()?;
        if !wifi.is_connected()? {
            return Ok(None);
        }
        let ip = wifi.sta_netif().get_ip_info()?;
        let ap = match wifi.get_configuration()? {
            Configuration::Mixed(client, _) | Configuration::Client(client) => {
                client.ssid.to_string()
            }
            _ => String::new(),
        };
        Ok(Some(ConnectionInfo {
            ip: ip.ip,
            netmask: Ipv4Addr::from(ip.subnet.mask),
            gw: ip.subnet.gateway,
            ap,
        }))
    }

    fn ap_ssid(&self) -> anyhow::Result<String> {
        Ok(self.ap_ssid.clone())
    }
}

/// Station credentials in their own NVS namespace.
pub struct NvsCredentialStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsCredentialStore {
    pub fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .with_context(|| format!("Could not open nvs namespace {NVS_NAMESPACE}"))?;
        info!("Got namespace {NVS_NAMESPACE:?} from default partition");
        Ok(Self { nvs })
    }
}

impl CredentialStore for NvsCredentialStore {
    fn load(&mut self) -> anyhow::Result<Option<StationCredentials>> {
        let mut buf = [0u8; 128];
        Ok(self
            .nvs
            .get_blob(NVS_CREDS_KEY, &mut buf)?
            .and_then(StationCredentials::from_blob))
    }

    fn save(&mut self, creds: &StationCredentials) -> anyhow::Result<()> {
        self.nvs.set_blob(NVS_CREDS_KEY, &creds.to_blob()?)?;
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.nvs.remove(NVS_CREDS_KEY)?;
        Ok(())
    }
}

/// Writes into the next OTA partition.
pub struct EspOtaSink {
    ota: EspOta,
}

impl EspOtaSink {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self { ota: EspOta::new()? })
    }
}

impl FirmwareSink for EspOtaSink {
    fn begin(&mut self) -> anyhow::Result<Box<dyn FirmwareUpdate + '_>> {
        let update = self
            .ota
            .initiate_update()
            .context("Failed to initiate OTA update")?;
        Ok(Box::new(EspOtaWriter { update }))
    }
}

struct EspOtaWriter<'a> {
    update: EspOtaUpdate<'a>,
}

impl FirmwareUpdate for EspOtaWriter<'_> {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.update
            .write_all(data)
            .map_err(|e| anyhow!("OTA write failed: {e:?}"))
    }

    fn complete(self: Box<Self>) -> anyhow::Result<()> {
        self.update
            .complete()
            .context("Failed to complete OTA update")?;
        info!("OTA image validated, set as boot partition");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        if let Err(e) = self.update.abort() {
            error!("OTA abort failed: {e:?}");
        }
    }
}

pub struct EspRestarter;

impl Restarter for EspRestarter {
    fn restart(&self) {
        esp_idf_hal::reset::restart();
    }
}

/// SNTP backed wall clock.
#[derive(Default)]
pub struct EspClock {
    sntp: Mutex<Option<EspSntp<'static>>>,
}

impl TimeSource for EspClock {
    fn start(&self) -> anyhow::Result<()> {
        let mut sntp = self.sntp.lock().map_err(|_| anyhow!("sntp poisoned"))?;
        if sntp.is_none() {
            info!("Starting SNTP");
            *sntp = Some(EspSntp::new_default()?);
        }
        Ok(())
    }

    fn is_synced(&self) -> bool {
        self.sntp
            .lock()
            .ok()
            .and_then(|s| {
                s.as_ref()
                    .map(|s| s.get_sync_status() == SyncStatus::Completed)
            })
            .unwrap_or(false)
    }

    fn local_time(&self) -> DateTime<Local> {
        Local::now()
    }
}

// EOF
