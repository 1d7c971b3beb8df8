// led.rs

use crate::*;

use embedded_hal::digital::{OutputPin, PinState};
use std::sync::Mutex;

/// Common-cathode RGB status LED on three GPIOs.
pub struct RgbLed<R, G, B> {
    pins: Mutex<(R, G, B)>,
}

impl<R, G, B> RgbLed<R, G, B>
where
    R: OutputPin + Send,
    G: OutputPin + Send,
    B: OutputPin + Send,
{
    pub fn new(red: R, green: G, blue: B) -> Self {
        Self {
            pins: Mutex::new((red, green, blue)),
        }
    }

    fn set_rgb(&self, r: bool, g: bool, b: bool) {
        let Ok(mut pins) = self.pins.lock() else {
            error!("LED pins poisoned");
            return;
        };
        let (red, green, blue) = &mut *pins;
        let res = [
            red.set_state(PinState::from(r)).map_err(|e| format!("{e:?}")),
            green.set_state(PinState::from(g)).map_err(|e| format!("{e:?}")),
            blue.set_state(PinState::from(b)).map_err(|e| format!("{e:?}")),
        ];
        for e in res.into_iter().filter_map(Result::err) {
            warn!("LED pin write failed: {e}");
        }
    }
}

impl<R, G, B> StatusIndicator for RgbLed<R, G, B>
where
    R: OutputPin + Send,
    G: OutputPin + Send,
    B: OutputPin + Send,
{
    fn set_status(&self, status: LedStatus) {
        debug!("LED: {status:?}");
        match status {
            LedStatus::WifiAppStarted => self.set_rgb(true, false, true),
            LedStatus::HttpServerStarted => self.set_rgb(true, true, false),
            LedStatus::WifiConnected => self.set_rgb(false, true, true),
        }
    }
}

/// Indicator for boards without an LED.
pub struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn set_status(&self, status: LedStatus) {
        info!("Status: {status:?}");
    }
}

// EOF
