//! Host-side driver for an FX3 USB 3.0 bridge fronting an NT1065 GNSS RF front-end.
//!
//! The FX3 shows up in one of two personalities: the ROM bootloader, which accepts a firmware
//! image over vendor request `0xA0`, and the streaming firmware, which exposes the front-end
//! registers, a handful of GPIO lines and one or more data endpoints carrying raw samples.
//!
//! [`bringup::BringUp`] walks a device from whatever is on the bus to a [`device::Fx3Device`]
//! ready to stream. [`device::Fx3Device::start_read`] then keeps a queue of bulk or isochronous
//! transfers in flight on a dedicated worker thread and hands every completed transfer to a
//! [`stream::DeviceDataHandler`].

pub mod bringup;
pub mod config;
pub mod device;
pub mod driver_interface;
pub mod endpoint;
pub mod error;
pub mod image;
pub mod nt1065;
pub mod nusb_backend;
pub mod registers;
pub mod script;
pub mod stream;
pub mod telemetry;

#[cfg(test)]
mod mock;

pub use crate::bringup::{BringUp, BringUpState};
pub use crate::config::Fx3Config;
pub use crate::device::Fx3Device;
pub use crate::driver_interface::*;
pub use crate::endpoint::{EndpDirection, EndpointDescriptor, EndpointTy, Fx3Ids};
pub use crate::error::{ErrorCode, FirmwareLoadOutcome, Fx3Error};
pub use crate::registers::RegisterAccess;
pub use crate::stream::{DeviceDataHandler, StreamParams, StreamStats};
pub use crate::telemetry::DeviceErrorSnapshot;
