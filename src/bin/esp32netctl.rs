// bin/esp32netctl.rs

#![warn(clippy::large_futures)]

use esp32netctl::*;

#[cfg(all(target_os = "espidf", feature = "esp32c3", feature = "esp32s"))]
compile_error!("Select only one hardware feature: `esp32c3` or `esp32s`");
#[cfg(all(target_os = "espidf", not(any(feature = "esp32c3", feature = "esp32s"))))]
compile_error!("Select a hardware feature: `esp32c3` or `esp32s`");

struct Drivers {
    radio: Arc<dyn RadioDriver>,
    store: Box<dyn CredentialStore>,
    firmware: Box<dyn FirmwareSink>,
    clock: Arc<dyn TimeSource>,
    restarter: Arc<dyn Restarter>,
    led: Arc<dyn StatusIndicator>,
    sensor: Box<dyn SensorReader>,
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_hal::{delay::FreeRtos, gpio::PinDriver, prelude::Peripherals};
    use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs, ota::EspOta};
    use esp_idf_sys::esp;

    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    // eventfd is needed by the tokio/mio reactor
    #[allow(clippy::needless_update)]
    let eventfd_config = esp_idf_sys::esp_vfs_eventfd_config_t {
        max_fds: 1,
        ..Default::default()
    };
    esp! { unsafe { esp_idf_sys::esp_vfs_eventfd_register(&eventfd_config) } }?;

    info!("Hello.");
    info!("Starting up, firmware version {FW_VERSION} built {COMPILE_DATE} {COMPILE_TIME}");
    {
        let mut ota = EspOta::new()?;
        let running_slot = ota.get_running_slot()?;
        ota.mark_running_slot_valid()?;
        info!("OTA slot: {} ({:?})", &running_slot.label, running_slot.state);
    }

    let config = MyConfig::default();
    info!("My config:\n{config:#?}");

    let sysloop = EspSystemEventLoop::take()?;
    let nvs_default_partition = nvs::EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    #[cfg(feature = "esp32c3")]
    let led = RgbLed::new(
        PinDriver::output(pins.gpio3)?,
        PinDriver::output(pins.gpio4)?,
        PinDriver::output(pins.gpio5)?,
    );

    #[cfg(feature = "esp32s")]
    let led = RgbLed::new(
        PinDriver::output(pins.gpio21)?,
        PinDriver::output(pins.gpio22)?,
        PinDriver::output(pins.gpio23)?,
    );

    let radio = EspRadio::new(
        peripherals.modem,
        sysloop,
        nvs_default_partition.clone(),
        &config,
    )?;
    let drivers = Drivers {
        radio: Arc::new(radio),
        store: Box::new(NvsCredentialStore::new(nvs_default_partition)?),
        firmware: Box::new(EspOtaSink::new()?),
        clock: Arc::new(EspClock::default()),
        restarter: Arc::new(EspRestarter),
        led: Arc::new(led),
        sensor: Box::new(NoSensor),
    };

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(Box::pin(run(config, drivers)));

    // not actually returning from main() but we reboot instead!
    info!("main() finished, reboot.");
    FreeRtos::delay_ms(3000);
    esp_idf_hal::reset::restart();
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting up simulator, firmware version {FW_VERSION}");
    let mut config = MyConfig::default();
    if let Some(port) = std::env::var("API_PORT").ok().and_then(|p| p.parse().ok()) {
        config.api_port = port;
    }
    info!("My config:\n{config:#?}");

    let radio = SimRadio::new(&config.ap_ssid);
    if let (Ok(ssid), Ok(pwd)) = (
        std::env::var("SIM_STA_SSID"),
        std::env::var("SIM_STA_PASSWORD"),
    ) {
        info!("Simulated network {ssid:?} available");
        radio.add_network(&ssid, &pwd);
    }

    let drivers = Drivers {
        radio: Arc::new(radio),
        store: Box::new(MemCredentialStore::default()),
        firmware: Box::new(MemFirmwareSink::default()),
        clock: Arc::new(SimClock::system()),
        restarter: Arc::new(ProcessRestarter),
        led: Arc::new(LogIndicator),
        sensor: Box::new(SimSensor::new(21, 45)),
    };

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(Box::pin(run(config, drivers)));

    info!("main() finished.");
    Ok(())
}

async fn run(config: MyConfig, drivers: Drivers) {
    let Drivers {
        radio,
        store,
        firmware,
        clock,
        restarter,
        led,
        sensor,
    } = drivers;

    let (bus, rx) = Bus::new(config.queue_depth);
    let state = MyState::new(config, bus, radio.clone(), firmware, clock).shared();
    DriverEvents::new(&radio, state.retries.clone(), state.bus.wifi.clone()).install(&radio);

    let http = HttpServer::new(state.clone(), rx.http, restarter);
    let mut wifi_loop = WifiLoop::new(state.clone(), rx.wifi, store, led, Box::new(http));
    let cb_radio = radio.clone();
    wifi_loop.set_connected_callback(Box::new(move || match cb_radio.sta_info() {
        Ok(Some(info)) => info!("Station up: ip {} gw {} ap {:?}", info.ip, info.gw, info.ap),
        Ok(None) => warn!("Station up but no link info"),
        Err(e) => error!("Cannot read station info: {e:#}"),
    }));

    let time_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = run_time_sync(time_state).await {
            error!("run_time_sync() ended: {e:#}");
        }
    });

    info!("Entering main loop...");
    tokio::select! {
        r = Box::pin(wifi_loop.run()) => { error!("wifi_loop() ended: {r:?}"); }
        r = Box::pin(poll_sensor(state.clone(), sensor)) => {
            error!("poll_sensor() ended: {r:?}");
        }
    };
}

// EOF
