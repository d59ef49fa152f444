//! DFAGB: dumper/flasher for GBA cartridges over the serial link.
//!
//! The device half (`fsm`, `worker` and the cartridge drivers) is `no_std`
//! and allocation free. The host half (`host`, `sim`) is behind the `host`
//! feature.
#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
mod fmt;

#[cfg(feature = "host")]
extern crate alloc;

pub mod backup;
pub mod buffer;
pub mod cart;
pub mod config;
pub mod context;
pub mod crc32;
pub mod fsm;
pub mod protocol;
pub mod strata_flash;
pub mod worker;

#[cfg(feature = "host")]
pub mod host;
#[cfg(feature = "host")]
pub mod sim;

pub use buffer::Buffer;
pub use cart::CartBus;
pub use context::{DeviceContext, DeviceState};
pub use protocol::Command;
pub use worker::{Worker, WorkerConfig};
