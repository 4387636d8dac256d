//! USB full-speed device engine for small microcontrollers.
//!
//! The whole stack runs from the USB interrupt handler: [`UsbDevice::interrupt_handler`]
//! decodes the peripheral status, drives the endpoint-0 control state machine and
//! routes every other endpoint completion to the interface that owns it. Interfaces
//! (CDC-ACM, HID and bulk-only mass storage) are a closed set held in a fixed array,
//! so the topology is decided when the device value is built and never changes.
//!
//! Nothing here allocates. Multi-step transfers are driven by small completion
//! tokens stored in the endpoints; the next transfer-complete interrupt hands the
//! token back to the owner, which decides what happens next.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod class;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod endpoint;
mod error;
pub mod hw;
pub mod interface;
pub mod msc;
pub mod setup;
#[cfg(any(test, feature = "hosted"))]
pub mod sim;
#[cfg(feature = "stm32-fs")]
pub mod stm32;


pub use config::{ConfigurationInfo, DeviceInfo, InquiryInfo};
pub use control::ControlState;
pub use device::UsbDevice;
pub use endpoint::{Endpoint, EndpointConfig, EndpointDirection, TransferType};
pub use error::Error;
pub use hw::{Direction, Istr, UsbPeripheral};
pub use interface::{ControlAction, Interface};
pub use setup::SetupRequest;

mod logging {
    pub use log::{debug, warn};

    #[cfg(feature = "verbose-debug")]
    pub use log::info as trace_usb_control;
    #[cfg(feature = "verbose-debug")]
    pub use log::info as trace_bot_states;
    #[cfg(feature = "verbose-debug")]
    pub use log::info as trace_bot_headers;
    #[cfg(feature = "verbose-debug")]
    pub use log::info as trace_bot_bytes;
    #[cfg(feature = "verbose-debug")]
    pub use log::info as trace_scsi_command;

    #[cfg(not(feature = "verbose-debug"))]
    pub use log::trace as trace_usb_control;
    #[cfg(not(feature = "verbose-debug"))]
    pub use log::trace as trace_bot_states;
    #[cfg(not(feature = "verbose-debug"))]
    pub use log::trace as trace_bot_headers;
    #[cfg(not(feature = "verbose-debug"))]
    pub use log::trace as trace_bot_bytes;
    #[cfg(not(feature = "verbose-debug"))]
    pub use log::trace as trace_scsi_command;
}
