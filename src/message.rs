// message.rs

/// Messages consumed by the network coordinator task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WifiMsg {
    LoadSavedCredentials,
    StartHttpServer,
    ConnectingFromHttpServer,
    StaConnectedGotIp,
    UserRequestedStaDisconnect,
    StaDisconnected,
}

/// Messages consumed by the HTTP server monitor task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMsg {
    WifiConnectInit,
    WifiConnectSuccess,
    WifiConnectFail,
    WifiUserDisconnect,
    WifiLinkLost,
    OtaUpdateSuccessful,
    OtaUpdateFailed,
    TimeServiceInitialized,
}

/// Why a station connection attempt is in flight. At most one reason at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectIntent {
    #[default]
    None,
    SavedCredentials,
    FromHttpServer,
    UserDisconnect,
}

/// Station status as seen by the control surface. Codes are part of the JSON API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum WifiConnectStatus {
    #[default]
    None = 0,
    Connecting = 1,
    ConnectFailed = 2,
    ConnectSuccess = 3,
    Disconnected = 4,
}

impl WifiConnectStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Connecting,
            2 => Self::ConnectFailed,
            3 => Self::ConnectSuccess,
            4 => Self::Disconnected,
            _ => Self::None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(i8)]
pub enum OtaUpdateStatus {
    #[default]
    Pending = 0,
    Successful = 1,
    Failed = -1,
}

impl OtaUpdateStatus {
    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn from_code(code: i8) -> Self {
        match code {
            1 => Self::Successful,
            -1 => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Status indicator states, driven by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedStatus {
    WifiAppStarted,
    HttpServerStarted,
    WifiConnected,
}

/// Events surfaced by the radio driver's own callback context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioEvent {
    ApStart,
    ApStop,
    ApStaConnected,
    ApStaDisconnected,
    StaStart,
    StaConnected,
    StaDisconnected { reason: u16 },
    StaGotIp,
}

// EOF
