// lib.rs
#![warn(clippy::large_futures)]

pub use std::{pin::Pin, sync::Arc};

mod config;
pub use config::*;

mod message;
pub use message::*;

mod bus;
pub use bus::*;

mod creds;
pub use creds::*;

mod radio;
pub use radio::*;

mod state;
pub use state::*;

mod ota;
pub use ota::*;

mod monitor;
pub use monitor::*;

mod apiserver;
pub use apiserver::*;

mod wifi;
pub use wifi::*;

mod sensor;
pub use sensor::*;

mod timesync;
pub use timesync::*;

mod led;
pub use led::*;

#[cfg(target_os = "espidf")]
mod esp;
#[cfg(target_os = "espidf")]
pub use esp::*;

#[cfg(not(target_os = "espidf"))]
mod sim;
#[cfg(not(target_os = "espidf"))]
pub use sim::*;

// EOF
