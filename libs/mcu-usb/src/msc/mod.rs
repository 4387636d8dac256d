//! USB mass storage, Bulk-Only Transport with the SCSI transparent command set.
//!
//! [Bulk Only Transport 1.0](https://www.usb.org/document-library/mass-storage-bulk-only-10)
//!
//! # Glossary
//! * CBW: command block wrapper, the 31 byte header the host sends on bulk OUT
//! * CSW: command status wrapper, the 13 byte trailer the device sends on bulk IN
//! * LUN: logical unit, one addressable disk behind the interface
//! * Residue: bytes the host asked for in the CBW minus bytes that actually moved

mod cbw;
mod lun;
mod scsi;
mod transport;

pub use cbw::{
    CbwError, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, DataDirection, CBW_SIGNATURE, CSW_SIGNATURE,
};
pub use lun::{BlockDevice, BlockDeviceError, Lun, RamDisk, MAX_BLOCK_SIZE};
pub use scsi::{OpCode, Sense, SenseKey};
pub use transport::{BotState, BotStep, BulkTransferState, ScsiBulkTransport, MAX_LUNS};

/// bInterfaceClass for mass storage
pub const USB_CLASS_MASS_STORAGE: u8 = 0x08;

/// Section 2 [USB Mass Storage Class Overview](https://www.usb.org/document-library/mass-storage-class-specification-overview-14)
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum InterfaceSubclass {
    /// SCSI command set not reported. De facto use
    ScsiCommandSetNotReported = 0x00,
    /// Allocated by USB-IF for SCSI. SCSI standards are defined outside of USB
    ScsiTransparentCommandSet = 0x06,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum InterfaceProtocol {
    /// Control/Bulk/Interrupt with command completion interrupt
    Cbi = 0x00,
    BulkOnlyTransport = 0x50,
}

pub const REQ_GET_MAX_LUN: u8 = 0xFE;
pub const REQ_BULK_ONLY_RESET: u8 = 0xFF;
