// wifi.rs

use crate::*;

use std::collections::VecDeque;

pub type ConnectedCallback = Box<dyn Fn() + Send + Sync>;

/// Coarse connection phase derived from intent, link and retry budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WifiPhase {
    Idle,
    Connecting,
    Connected,
    RetryPending,
}

/// The network coordinator: single task owning the connection intent.
///
/// Radio events reach it only after the driver layer has spent its retry
/// budget, see [`DriverEvents`].
pub struct WifiLoop {
    state: SharedState,
    rx: MsgReceiver<WifiMsg>,
    followups: VecDeque<WifiMsg>,
    store: Box<dyn CredentialStore>,
    led: Arc<dyn StatusIndicator>,
    http: Box<dyn ControlSurface>,
    intent: ConnectIntent,
    on_connected: Option<ConnectedCallback>,
}

impl WifiLoop {
    pub fn new(
        state: SharedState,
        rx: MsgReceiver<WifiMsg>,
        store: Box<dyn CredentialStore>,
        led: Arc<dyn StatusIndicator>,
        http: Box<dyn ControlSurface>,
    ) -> Self {
        Self {
            state,
            rx,
            followups: VecDeque::new(),
            store,
            led,
            http,
            intent: ConnectIntent::None,
            on_connected: None,
        }
    }

    pub fn set_connected_callback(&mut self, cb: ConnectedCallback) {
        self.on_connected = Some(cb);
    }

    pub fn intent(&self) -> ConnectIntent {
        self.intent
    }

    pub fn phase(&self) -> WifiPhase {
        match self.intent {
            _ if self.state.bus.connected.is_set() => WifiPhase::Connected,
            ConnectIntent::SavedCredentials | ConnectIntent::FromHttpServer => {
                if self.state.retries.get() > 0 {
                    WifiPhase::RetryPending
                } else {
                    WifiPhase::Connecting
                }
            }
            _ => WifiPhase::Idle,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Starting wifi application");
        self.led.set_status(LedStatus::WifiAppStarted);
        self.followups.push_back(WifiMsg::LoadSavedCredentials);

        loop {
            let msg = match self.followups.pop_front() {
                Some(m) => m,
                None => match self.rx.recv().await {
                    Some(m) => m,
                    None => bail!("{} queue closed", self.rx.name()),
                },
            };
            self.handle(msg).await?;
        }
    }

    /// Process one message. Only a closed queue is an error.
    pub async fn handle(&mut self, msg: WifiMsg) -> anyhow::Result<()> {
        info!("{msg:?}");
        match msg {
            WifiMsg::LoadSavedCredentials => {
                match self.store.load() {
                    Ok(Some(creds)) => {
                        info!("Loaded station configuration for {:?}", creds.ssid.as_str());
                        self.state.sta_config.write().await.load_credentials(&creds);
                        self.start_connect(ConnectIntent::SavedCredentials).await?;
                    }
                    Ok(None) => info!("Unable to load station configuration"),
                    Err(e) => error!("Credential store read failed: {e:#}"),
                }
                // the control surface comes up either way
                self.followups.push_back(WifiMsg::StartHttpServer);
            }

            WifiMsg::StartHttpServer => {
                if self.http.start() {
                    info!("HTTP server started");
                }
                self.led.set_status(LedStatus::HttpServerStarted);
            }

            WifiMsg::ConnectingFromHttpServer => {
                self.start_connect(ConnectIntent::FromHttpServer).await?;
            }

            WifiMsg::StaConnectedGotIp => self.on_got_ip().await?,

            WifiMsg::UserRequestedStaDisconnect => {
                if !self.state.bus.connected.is_set() {
                    info!("Not connected, nothing to disconnect");
                    return Ok(());
                }
                self.intent = ConnectIntent::UserDisconnect;
                self.state.retries.exhaust();
                if let Err(e) = self.state.radio.disconnect() {
                    error!("Disconnect failed: {e:#}");
                }
                if let Err(e) = self.store.clear() {
                    error!("Credential store clear failed: {e:#}");
                }
                self.led.set_status(LedStatus::HttpServerStarted);
            }

            WifiMsg::StaDisconnected => self.on_disconnected().await?,
        }
        Ok(())
    }

    async fn start_connect(&mut self, intent: ConnectIntent) -> anyhow::Result<()> {
        self.intent = intent;
        self.state.retries.reset();
        self.state.bus.http.send(HttpMsg::WifiConnectInit).await?;

        let conf = self.state.sta_config.read().await.clone();
        info!("Connecting to {:?}", conf.ssid());
        let radio = &self.state.radio;
        if let Err(e) = radio.set_station_config(&conf).and_then(|_| radio.connect()) {
            error!("Connect failed: {e:#}");
            // the driver refused, so the link state is unchanged
            self.end_attempt(false).await?;
        }
        Ok(())
    }

    async fn on_got_ip(&mut self) -> anyhow::Result<()> {
        let intent = self.intent;
        if matches!(
            intent,
            ConnectIntent::SavedCredentials | ConnectIntent::FromHttpServer
        ) {
            self.intent = ConnectIntent::None;
        }
        self.state.bus.connected.set(true);
        self.led.set_status(LedStatus::WifiConnected);

        // credentials reloaded from the store are never written back
        if intent == ConnectIntent::FromHttpServer {
            let saved = self
                .state
                .sta_config
                .read()
                .await
                .to_credentials()
                .and_then(|c| self.store.save(&c));
            match saved {
                Ok(()) => info!("Station credentials saved"),
                Err(e) => error!("Credential store write failed: {e:#}"),
            }
        }
        self.state.bus.http.send(HttpMsg::WifiConnectSuccess).await?;

        if let Some(cb) = &self.on_connected {
            cb();
        }
        Ok(())
    }

    async fn on_disconnected(&mut self) -> anyhow::Result<()> {
        let was_connected = self.state.bus.connected.is_set();
        self.state.bus.connected.set(false);
        self.end_attempt(was_connected).await
    }

    /// Terminal outcome for the current intent.
    async fn end_attempt(&mut self, was_connected: bool) -> anyhow::Result<()> {
        let link_up = self.state.bus.connected.is_set();
        let idle_led = |led: &Arc<dyn StatusIndicator>| {
            if !link_up {
                led.set_status(LedStatus::HttpServerStarted);
            }
        };

        match std::mem::take(&mut self.intent) {
            ConnectIntent::SavedCredentials => {
                info!("Station disconnected: attempt using saved credentials failed");
                if let Err(e) = self.store.clear() {
                    error!("Credential store clear failed: {e:#}");
                }
                idle_led(&self.led);
                self.state.bus.http.send(HttpMsg::WifiConnectFail).await?;
            }
            ConnectIntent::FromHttpServer => {
                info!("Station disconnected: attempt from the http server failed");
                idle_led(&self.led);
                self.state.bus.http.send(HttpMsg::WifiConnectFail).await?;
            }
            ConnectIntent::UserDisconnect => {
                info!("Station disconnected: user requested disconnection");
                self.state.bus.http.send(HttpMsg::WifiUserDisconnect).await?;
            }
            ConnectIntent::None if was_connected => {
                info!("Station disconnected: link lost and retries exhausted");
                idle_led(&self.led);
                self.state.bus.http.send(HttpMsg::WifiLinkLost).await?;
            }
            ConnectIntent::None => {
                info!("Station disconnected: attempt failed, check WiFi access point availability");
            }
        }
        Ok(())
    }
}

// EOF
