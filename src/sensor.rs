// sensor.rs

use crate::*;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SensorStatus {
    Ok,
    CrcError,
    TimeoutError,
    #[default]
    Unknown,
}

impl SensorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::CrcError => "CRC Error",
            Self::TimeoutError => "Timeout Error",
            Self::Unknown => "Unknown Status",
        }
    }
}

/// Latest temperature/humidity sample, whole units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SensorReading {
    pub status: SensorStatus,
    pub temperature: i32,
    pub humidity: i32,
}

pub trait SensorReader: Send {
    fn read(&mut self) -> SensorReading;
}

/// Stand-in for boards without a sensor attached.
pub struct NoSensor;

impl SensorReader for NoSensor {
    fn read(&mut self) -> SensorReading {
        SensorReading::default()
    }
}

pub async fn poll_sensor(
    state: SharedState,
    mut sensor: Box<dyn SensorReader>,
) -> anyhow::Result<()> {
    let interval = state.config.sensor_poll_interval();
    info!("Sensor poll every {interval:?}");
    loop {
        let reading = sensor.read();
        if reading.status != SensorStatus::Ok {
            debug!("Sensor read: {}", reading.status.as_str());
        }
        *state.sensor.write().await = reading;
        sleep(interval).await;
    }
}

// EOF
