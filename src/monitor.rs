// monitor.rs

use crate::*;

use tokio::sync::Mutex;

pub trait Restarter: Send + Sync {
    fn restart(&self);
}

/// One-shot deferred restart, armed only after a confirmed firmware update.
/// Once armed it cannot be cancelled or re-armed.
pub struct RestartTimer {
    armed: AtomicBool,
    delay: Duration,
    restarter: Arc<dyn Restarter>,
}

impl RestartTimer {
    pub fn new(delay: Duration, restarter: Arc<dyn Restarter>) -> Self {
        Self {
            armed: AtomicBool::new(false),
            delay,
            restarter,
        }
    }

    /// Returns false if the timer was already armed.
    pub fn arm(&self) -> bool {
        if self.armed.swap(true, Ordering::SeqCst) {
            warn!("Restart timer already armed");
            return false;
        }
        let delay = self.delay;
        let restarter = self.restarter.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            info!("Firmware update reset timer timed out, restarting the device");
            restarter.restart();
        });
        true
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

/// The control surface's own task: applies status messages to the shared
/// state fields it is the sole writer of.
pub struct HttpMonitor {
    state: SharedState,
    rx: Arc<Mutex<MsgReceiver<HttpMsg>>>,
    restart: Arc<RestartTimer>,
}

impl HttpMonitor {
    pub fn new(
        state: SharedState,
        rx: Arc<Mutex<MsgReceiver<HttpMsg>>>,
        restart: Arc<RestartTimer>,
    ) -> Self {
        Self { state, rx, restart }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut rx = self.rx.lock().await;
        info!("HTTP server monitor running");
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
        }
        bail!("{} queue closed", rx.name())
    }

    pub fn handle(&self, msg: HttpMsg) {
        info!("{msg:?}");
        let state = &self.state;
        match msg {
            HttpMsg::WifiConnectInit => {
                state.set_wifi_connect_status(WifiConnectStatus::Connecting)
            }
            HttpMsg::WifiConnectSuccess => {
                state.set_wifi_connect_status(WifiConnectStatus::ConnectSuccess)
            }
            HttpMsg::WifiConnectFail => {
                state.set_wifi_connect_status(WifiConnectStatus::ConnectFailed)
            }
            HttpMsg::WifiUserDisconnect | HttpMsg::WifiLinkLost => {
                state.set_wifi_connect_status(WifiConnectStatus::Disconnected)
            }

            HttpMsg::OtaUpdateSuccessful | HttpMsg::OtaUpdateFailed
                if state.ota_update_status() == OtaUpdateStatus::Successful =>
            {
                warn!("Firmware already updated, restart pending");
            }
            HttpMsg::OtaUpdateSuccessful => {
                state.set_ota_update_status(OtaUpdateStatus::Successful);
                info!("FW update successful, starting FW update reset timer");
                self.restart.arm();
            }
            HttpMsg::OtaUpdateFailed => {
                info!("FW update unsuccessful");
                state.set_ota_update_status(OtaUpdateStatus::Failed);
            }

            HttpMsg::TimeServiceInitialized => state.local_time_set.store(true, Ordering::Release),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SharedState, Arc<RecordingRestarter>, HttpMonitor) {
        let (bus, rx) = Bus::new(8);
        let state = MyState::new(
            MyConfig::default(),
            bus,
            Arc::new(SimRadio::new("ESP32_AP")),
            Box::new(MemFirmwareSink::default()),
            Arc::new(SimClock::default()),
        )
        .shared();
        let restarter = Arc::new(RecordingRestarter::default());
        let timer = Arc::new(RestartTimer::new(
            state.config.restart_delay(),
            restarter.clone(),
        ));
        let monitor = HttpMonitor::new(state.clone(), Arc::new(Mutex::new(rx.http)), timer);
        (state, restarter, monitor)
    }

    #[tokio::test]
    async fn wifi_messages_drive_connect_status() {
        let (state, _r, monitor) = setup();
        assert_eq!(state.wifi_connect_status(), WifiConnectStatus::None);

        let steps = [
            (HttpMsg::WifiConnectInit, WifiConnectStatus::Connecting),
            (HttpMsg::WifiConnectSuccess, WifiConnectStatus::ConnectSuccess),
            (HttpMsg::WifiUserDisconnect, WifiConnectStatus::Disconnected),
            (HttpMsg::WifiConnectInit, WifiConnectStatus::Connecting),
            (HttpMsg::WifiConnectFail, WifiConnectStatus::ConnectFailed),
        ];
        for (msg, expect) in steps {
            monitor.handle(msg);
            assert_eq!(state.wifi_connect_status(), expect);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_update_restarts_once_after_delay() {
        let (state, restarter, monitor) = setup();
        monitor.handle(HttpMsg::OtaUpdateSuccessful);
        assert_eq!(state.ota_update_status(), OtaUpdateStatus::Successful);

        // later results do not touch the status or the timer
        monitor.handle(HttpMsg::OtaUpdateFailed);
        monitor.handle(HttpMsg::OtaUpdateSuccessful);
        assert_eq!(state.ota_update_status(), OtaUpdateStatus::Successful);

        sleep(Duration::from_millis(7_900)).await;
        assert_eq!(restarter.count(), 0);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(restarter.count(), 1);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(restarter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_never_restarts() {
        let (state, restarter, monitor) = setup();
        monitor.handle(HttpMsg::OtaUpdateFailed);
        assert_eq!(state.ota_update_status(), OtaUpdateStatus::Failed);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(restarter.count(), 0);

        // a retry after a failure may still succeed
        monitor.handle(HttpMsg::OtaUpdateSuccessful);
        assert_eq!(state.ota_update_status(), OtaUpdateStatus::Successful);
        sleep(Duration::from_secs(9)).await;
        assert_eq!(restarter.count(), 1);
    }

    #[tokio::test]
    async fn timer_arms_only_once() {
        let r = Arc::new(RecordingRestarter::default());
        let t = RestartTimer::new(Duration::from_secs(1), r);
        assert!(!t.is_armed());
        assert!(t.arm());
        assert!(!t.arm());
        assert!(t.is_armed());
    }

    #[tokio::test]
    async fn time_service_flag() {
        let (state, _r, monitor) = setup();
        assert!(!state.local_time_set.load(Ordering::Acquire));
        monitor.handle(HttpMsg::TimeServiceInitialized);
        assert!(state.local_time_set.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn run_consumes_queue_in_order() {
        let (state, _r, monitor) = setup();
        let tx = state.bus.http.clone();
        let task = tokio::spawn(monitor.run());
        tx.send(HttpMsg::WifiConnectInit).await.unwrap();
        tx.send(HttpMsg::WifiConnectSuccess).await.unwrap();
        for _ in 0..100 {
            if state.wifi_connect_status() == WifiConnectStatus::ConnectSuccess {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(state.wifi_connect_status(), WifiConnectStatus::ConnectSuccess);
        task.abort();
    }
}
// EOF
