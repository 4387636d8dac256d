//! Communication and human-interface functions. Mass storage lives in [`crate::msc`].

mod cdc;
mod hid;

pub use cdc::{CdcComm, CdcData, CdcStep, LineCoding, CDC_QUEUE_LEN};
pub use cdc::{CDC_PROTOCOL_NONE, CDC_SUBCLASS_ACM, USB_CLASS_CDC, USB_CLASS_CDC_DATA};
pub use hid::{HidInterface, HidStep, HID_REPORT_MAX, USB_CLASS_HID};
