// sim.rs
//
// Host-side stand-ins for the device drivers.

use crate::*;

use chrono::{DateTime, Local};
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{mpsc, Mutex, RwLock},
    thread,
};

const REASON_NO_AP_FOUND: u16 = 201;
const REASON_ASSOC_LEAVE: u16 = 8;
const REASON_BEACON_TIMEOUT: u16 = 200;

enum RadioCmd {
    Connect(String, String),
    Disconnect,
    DropLink,
}

#[derive(Default)]
struct SimRadioShared {
    handler: RwLock<Option<RadioEventHandler>>,
    networks: Mutex<HashMap<String, String>>,
    link: Mutex<Option<String>>,
    connects: AtomicU32,
}

impl SimRadioShared {
    fn emit(&self, ev: RadioEvent) {
        match self.handler.read() {
            Ok(h) => {
                if let Some(h) = h.as_ref() {
                    h(ev)
                }
            }
            Err(_) => error!("SimRadio handler poisoned"),
        }
    }

    fn set_link(&self, ssid: Option<String>) -> Option<String> {
        match self.link.lock() {
            Ok(mut l) => std::mem::replace(&mut *l, ssid),
            Err(_) => None,
        }
    }
}

/// Simulated AP+STA radio. Events are delivered from a worker thread, like
/// the real driver's event task.
pub struct SimRadio {
    ap_ssid: String,
    shared: Arc<SimRadioShared>,
    sta: Mutex<(String, String)>,
    cmd: Mutex<mpsc::Sender<RadioCmd>>,
}

impl SimRadio {
    pub fn new(ap_ssid: &str) -> Self {
        let shared = Arc::new(SimRadioShared::default());
        let (tx, rx) = mpsc::channel();
        let worker = shared.clone();
        thread::spawn(move || radio_worker(worker, rx));
        Self {
            ap_ssid: ap_ssid.to_string(),
            shared,
            sta: Mutex::new(Default::default()),
            cmd: Mutex::new(tx),
        }
    }

    pub fn with_network(self, ssid: &str, password: &str) -> Self {
        self.add_network(ssid, password);
        self
    }

    pub fn add_network(&self, ssid: &str, password: &str) {
        if let Ok(mut n) = self.shared.networks.lock() {
            n.insert(ssid.to_string(), password.to_string());
        }
    }

    pub fn remove_network(&self, ssid: &str) {
        if let Ok(mut n) = self.shared.networks.lock() {
            n.remove(ssid);
        }
    }

    /// Simulate losing the AP, e.g. after it has been powered off.
    pub fn drop_link(&self) {
        let _ = self.command(RadioCmd::DropLink);
    }

    pub fn connects(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    fn command(&self, cmd: RadioCmd) -> anyhow::Result<()> {
        self.cmd
            .lock()
            .map_err(|_| anyhow!("SimRadio command channel poisoned"))?
            .send(cmd)
            .map_err(|_| anyhow!("SimRadio worker gone"))
    }
}

fn radio_worker(shared: Arc<SimRadioShared>, rx: mpsc::Receiver<RadioCmd>) {
    shared.emit(RadioEvent::ApStart);
    shared.emit(RadioEvent::StaStart);
    while let Ok(cmd) = rx.recv() {
        // association time
        thread::sleep(std::time::Duration::from_millis(5));
        match cmd {
            RadioCmd::Connect(ssid, pwd) => {
                shared.connects.fetch_add(1, Ordering::SeqCst);
                let known = shared
                    .networks
                    .lock()
                    .map(|n| n.get(&ssid) == Some(&pwd))
                    .unwrap_or(false);
                if known {
                    shared.set_link(Some(ssid));
                    shared.emit(RadioEvent::StaConnected);
                    shared.emit(RadioEvent::StaGotIp);
                } else {
                    shared.set_link(None);
                    shared.emit(RadioEvent::StaDisconnected {
                        reason: REASON_NO_AP_FOUND,
                    });
                }
            }
            RadioCmd::Disconnect => {
                if shared.set_link(None).is_some() {
                    shared.emit(RadioEvent::StaDisconnected {
                        reason: REASON_ASSOC_LEAVE,
                    });
                }
            }
            RadioCmd::DropLink => {
                if let Some(ssid) = shared.set_link(None) {
                    if let Ok(mut n) = shared.networks.lock() {
                        n.remove(&ssid);
                    }
                    shared.emit(RadioEvent::StaDisconnected {
                        reason: REASON_BEACON_TIMEOUT,
                    });
                }
            }
        }
    }
}

impl RadioDriver for SimRadio {
    fn set_event_handler(&self, handler: RadioEventHandler) {
        if let Ok(mut h) = self.shared.handler.write() {
            *h = Some(handler);
        }
    }

    fn set_station_config(&self, conf: &StationConfig) -> anyhow::Result<()> {
        let mut sta = self
            .sta
            .lock()
            .map_err(|_| anyhow!("SimRadio config poisoned"))?;
        *sta = (conf.ssid().to_string(), conf.password().to_string());
        Ok(())
    }

    fn connect(&self) -> anyhow::Result<()> {
        let (ssid, pwd) = self
            .sta
            .lock()
            .map_err(|_| anyhow!("SimRadio config poisoned"))?
            .clone();
        self.command(RadioCmd::Connect(ssid, pwd))
    }

    fn disconnect(&self) -> anyhow::Result<()> {
        self.command(RadioCmd::Disconnect)
    }

    fn sta_info(&self) -> anyhow::Result<Option<ConnectionInfo>> {
        let link = self
            .shared
            .link
            .lock()
            .map_err(|_| anyhow!("SimRadio link poisoned"))?;
        Ok(link.as_ref().map(|ap| ConnectionInfo {
            ip: Ipv4Addr::new(192, 168, 1, 50),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gw: Ipv4Addr::new(192, 168, 1, 1),
            ap: ap.clone(),
        }))
    }

    fn ap_ssid(&self) -> anyhow::Result<String> {
        Ok(self.ap_ssid.clone())
    }
}

#[derive(Default)]
struct MemStoreInner {
    blob: Option<Vec<u8>>,
    saves: u32,
    clears: u32,
}

/// Credential store keeping the encoded blob in memory. Clones share it.
#[derive(Clone, Default)]
pub struct MemCredentialStore {
    inner: Arc<Mutex<MemStoreInner>>,
}

impl MemCredentialStore {
    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, MemStoreInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("credential store poisoned"))
    }

    /// Seed the store without counting a save.
    pub fn put(&self, creds: &StationCredentials) {
        if let (Ok(blob), Ok(mut inner)) = (creds.to_blob(), self.lock()) {
            inner.blob = Some(blob);
        }
    }

    pub fn stored(&self) -> Option<StationCredentials> {
        let inner = self.lock().ok()?;
        inner.blob.as_deref().and_then(StationCredentials::from_blob)
    }

    pub fn saves(&self) -> u32 {
        self.lock().map(|i| i.saves).unwrap_or_default()
    }

    pub fn clears(&self) -> u32 {
        self.lock().map(|i| i.clears).unwrap_or_default()
    }
}

impl CredentialStore for MemCredentialStore {
    fn load(&mut self) -> anyhow::Result<Option<StationCredentials>> {
        Ok(self
            .lock()?
            .blob
            .as_deref()
            .and_then(StationCredentials::from_blob))
    }

    fn save(&mut self, creds: &StationCredentials) -> anyhow::Result<()> {
        let blob = creds.to_blob()?;
        let mut inner = self.lock()?;
        inner.blob = Some(blob);
        inner.saves += 1;
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        inner.blob = None;
        inner.clears += 1;
        Ok(())
    }
}

#[derive(Default)]
struct MemSinkInner {
    committed: Option<Vec<u8>>,
    fail_validation: bool,
    aborts: u32,
}

/// Firmware sink writing into memory. Clones share the same partition.
#[derive(Clone, Default)]
pub struct MemFirmwareSink {
    inner: Arc<Mutex<MemSinkInner>>,
}

impl MemFirmwareSink {
    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, MemSinkInner>> {
        self.inner.lock().map_err(|_| anyhow!("firmware sink poisoned"))
    }

    /// The image selected for the next boot, if any.
    pub fn committed(&self) -> Option<Vec<u8>> {
        self.lock().ok()?.committed.clone()
    }

    /// Make completion reject every image, like a failed validation.
    pub fn fail_validation(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_validation = fail;
        }
    }

    pub fn aborts(&self) -> u32 {
        self.lock().map(|i| i.aborts).unwrap_or_default()
    }
}

struct MemUpdate {
    sink: MemFirmwareSink,
    image: Vec<u8>,
}

impl FirmwareSink for MemFirmwareSink {
    fn begin(&mut self) -> anyhow::Result<Box<dyn FirmwareUpdate + '_>> {
        Ok(Box::new(MemUpdate {
            sink: self.clone(),
            image: Vec::new(),
        }))
    }
}

impl FirmwareUpdate for MemUpdate {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.image.extend_from_slice(data);
        Ok(())
    }

    fn complete(self: Box<Self>) -> anyhow::Result<()> {
        let mut inner = self.sink.lock()?;
        if inner.fail_validation {
            bail!("image validation failed");
        }
        if self.image.is_empty() {
            bail!("empty image");
        }
        inner.committed = Some(self.image);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        if let Ok(mut inner) = self.sink.lock() {
            inner.aborts += 1;
        }
    }
}

/// Counts restart requests instead of restarting.
#[derive(Default)]
pub struct RecordingRestarter {
    count: AtomicU32,
}

impl RecordingRestarter {
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Restarter for RecordingRestarter {
    fn restart(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Host "restart": exit and let the supervisor start us again.
pub struct ProcessRestarter;

impl Restarter for ProcessRestarter {
    fn restart(&self) {
        warn!("Restarting process");
        std::process::exit(0);
    }
}

/// Records the last status shown.
#[derive(Default)]
pub struct RecordingIndicator {
    seen: Mutex<Vec<LedStatus>>,
}

impl RecordingIndicator {
    pub fn last(&self) -> Option<LedStatus> {
        self.seen.lock().ok()?.last().copied()
    }
}

impl StatusIndicator for RecordingIndicator {
    fn set_status(&self, status: LedStatus) {
        if let Ok(mut s) = self.seen.lock() {
            s.push(status);
        }
    }
}

/// Host clock. The default one only reports sync when told to.
#[derive(Default)]
pub struct SimClock {
    starts: AtomicU32,
    synced: AtomicBool,
    sync_on_start: bool,
}

impl SimClock {
    /// Trusts the host clock as soon as it is started.
    pub fn system() -> Self {
        Self {
            sync_on_start: true,
            ..Default::default()
        }
    }

    pub fn is_started(&self) -> bool {
        self.starts() > 0
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }
}

impl TimeSource for SimClock {
    fn start(&self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.sync_on_start {
            self.set_synced(true);
        }
        Ok(())
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn local_time(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Sensor drifting up one degree per read.
pub struct SimSensor {
    temperature: i32,
    humidity: i32,
}

impl SimSensor {
    pub fn new(temperature: i32, humidity: i32) -> Self {
        Self {
            temperature,
            humidity,
        }
    }
}

impl SensorReader for SimSensor {
    fn read(&mut self) -> SensorReading {
        let r = SensorReading {
            status: SensorStatus::Ok,
            temperature: self.temperature,
            humidity: self.humidity,
        };
        self.temperature += 1;
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rig {
        state: SharedState,
        radio: Arc<SimRadio>,
        store: MemCredentialStore,
        wifi: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.wifi.abort();
        }
    }

    fn rig(store: MemCredentialStore) -> Rig {
        let (bus, rx) = Bus::new(3);
        let radio = Arc::new(SimRadio::new("ESP32_AP").with_network("HomeNet", "secret"));
        let dyn_radio: Arc<dyn RadioDriver> = radio.clone();
        let config = MyConfig {
            api_port: 0,
            ..Default::default()
        };
        let state = MyState::new(
            config,
            bus,
            dyn_radio.clone(),
            Box::new(MemFirmwareSink::default()),
            Arc::new(SimClock::default()),
        )
        .shared();
        DriverEvents::new(&dyn_radio, state.retries.clone(), state.bus.wifi.clone())
            .install(&dyn_radio);

        let http = HttpServer::new(
            state.clone(),
            rx.http,
            Arc::new(RecordingRestarter::default()),
        );
        let wifi = WifiLoop::new(
            state.clone(),
            rx.wifi,
            Box::new(store.clone()),
            Arc::new(LogIndicator),
            Box::new(http),
        );
        Rig {
            state,
            radio,
            store,
            wifi: tokio::spawn(wifi.run()),
        }
    }

    async fn wait_status(state: &SharedState, want: WifiConnectStatus) {
        for _ in 0..500 {
            if state.wifi_connect_status() == want {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("status {:?}, wanted {want:?}", state.wifi_connect_status());
    }

    async fn connect_via_http(state: &SharedState, ssid: &str, pwd: &str) {
        state
            .sta_config
            .write()
            .await
            .overwrite(Some(ssid), Some(pwd));
        state
            .bus
            .wifi
            .send(WifiMsg::ConnectingFromHttpServer)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn saved_credentials_reconnect_at_boot() {
        let store = MemCredentialStore::default();
        store.put(&StationCredentials::new("HomeNet", "secret").unwrap());
        let r = rig(store);

        wait_status(&r.state, WifiConnectStatus::ConnectSuccess).await;
        assert!(r.state.bus.connected.is_set());
        assert_eq!(r.radio.connects(), 1);
        let info = r.state.radio.sta_info().unwrap().unwrap();
        assert_eq!(info.ap, "HomeNet");
    }

    #[tokio::test]
    async fn unknown_network_spends_all_retries_then_fails() {
        let r = rig(MemCredentialStore::default());
        connect_via_http(&r.state, "Nowhere", "pw").await;

        wait_status(&r.state, WifiConnectStatus::ConnectFailed).await;
        assert_eq!(r.radio.connects(), 1 + r.state.config.max_connection_retries);
        assert!(!r.state.bus.connected.is_set());
        assert_eq!(r.store.saves(), 0);
    }

    #[tokio::test]
    async fn http_connect_persists_and_user_disconnect_clears() {
        let r = rig(MemCredentialStore::default());
        connect_via_http(&r.state, "HomeNet", "secret").await;
        wait_status(&r.state, WifiConnectStatus::ConnectSuccess).await;
        assert_eq!(
            r.store.stored(),
            Some(StationCredentials::new("HomeNet", "secret").unwrap())
        );

        r.state
            .bus
            .wifi
            .send(WifiMsg::UserRequestedStaDisconnect)
            .await
            .unwrap();
        wait_status(&r.state, WifiConnectStatus::Disconnected).await;
        assert_eq!(r.store.stored(), None);
        // no reconnect after a user disconnect
        assert_eq!(r.radio.connects(), 1);
    }

    #[tokio::test]
    async fn lost_link_is_retried_then_reported() {
        let r = rig(MemCredentialStore::default());
        connect_via_http(&r.state, "HomeNet", "secret").await;
        wait_status(&r.state, WifiConnectStatus::ConnectSuccess).await;

        r.radio.drop_link();
        wait_status(&r.state, WifiConnectStatus::Disconnected).await;
        assert!(!r.state.bus.connected.is_set());
        assert_eq!(r.radio.connects(), 1 + r.state.config.max_connection_retries);
    }
}
// EOF
