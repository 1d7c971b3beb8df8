// timesync.rs

use crate::*;

use chrono::{DateTime, Local};

const TIME_FORMAT: &str = "%I:%M:%S %p, %b %d %Y";

/// Wall clock kept in sync over the station link.
pub trait TimeSource: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;
    fn is_synced(&self) -> bool;
    fn local_time(&self) -> DateTime<Local>;
}

pub fn format_local_time(t: &DateTime<Local>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Waits for the station to come up, then starts the clock and reports the
/// first successful sync to the control surface.
pub async fn run_time_sync(state: SharedState) -> anyhow::Result<()> {
    state.bus.connected.wait().await;
    info!("Station connected, initializing time service");
    state.clock.start()?;

    let mut polls = 0u32;
    while !state.clock.is_synced() {
        polls += 1;
        if polls % 10 == 0 {
            info!("Waiting for time sync ({polls})");
        }
        sleep(Duration::from_secs(2)).await;
    }
    info!(
        "Time synchronized: {}",
        format_local_time(&state.clock.local_time())
    );
    state.bus.http.send(HttpMsg::TimeServiceInitialized).await
}


// EOF
