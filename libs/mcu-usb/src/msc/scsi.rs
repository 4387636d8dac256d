//! SCSI transparent command set: opcodes, sense data and the fixed-layout responses.
//! All multi-byte fields are big endian.

use num_derive::FromPrimitive;

use super::lun::{BlockDeviceError, Lun};
use crate::config::InquiryInfo;

/// SCSI op codes as defined by SPC-3 / SBC-2, limited to the ones a USB disk is asked
#[derive(Clone, Copy, Eq, PartialEq, Debug, FromPrimitive)]
pub enum OpCode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    StartStopUnit = 0x1B,
    PreventAllowMediumRemoval = 0x1E,
    ReadFormatCapacities = 0x23,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    ModeSense10 = 0x5A,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
#[repr(u8)]
pub enum SenseKey {
    /// No specific sense key information to be reported
    #[default]
    NoSense = 0x0,
    RecoveredError = 0x1,
    /// The logical unit is not accessible
    NotReady = 0x2,
    /// Non-recovered error probably caused by a flaw in the medium or the recorded data
    MediumError = 0x3,
    HardwareError = 0x4,
    /// Bad LUN, or an illegal parameter in the CDB
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    /// A read or write was attempted on a block that is protected
    DataProtect = 0x7,
    AbortedCommand = 0xB,
}

/// Sense key with its additional sense code and qualifier.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self { Sense { key, asc, ascq } }

    pub const NONE: Sense = Sense::new(SenseKey::NoSense, 0, 0);
    pub const INVALID_COMMAND: Sense = Sense::new(SenseKey::IllegalRequest, 0x20, 0);
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(SenseKey::IllegalRequest, 0x21, 0);
    pub const INVALID_FIELD_IN_CDB: Sense = Sense::new(SenseKey::IllegalRequest, 0x24, 0);
    pub const LUN_NOT_SUPPORTED: Sense = Sense::new(SenseKey::IllegalRequest, 0x25, 0);
    pub const MEDIUM_NOT_PRESENT: Sense = Sense::new(SenseKey::NotReady, 0x3A, 0);
    pub const WRITE_PROTECTED: Sense = Sense::new(SenseKey::DataProtect, 0x27, 0);
    pub const UNRECOVERED_READ_ERROR: Sense = Sense::new(SenseKey::MediumError, 0x11, 0);
    pub const WRITE_FAULT: Sense = Sense::new(SenseKey::MediumError, 0x03, 0);
    pub const HARDWARE_FAILURE: Sense = Sense::new(SenseKey::HardwareError, 0x44, 0);
}

impl From<BlockDeviceError> for Sense {
    fn from(e: BlockDeviceError) -> Sense {
        match e {
            BlockDeviceError::HardwareError => Sense::HARDWARE_FAILURE,
            BlockDeviceError::WriteError | BlockDeviceError::EraseError => Sense::WRITE_FAULT,
            BlockDeviceError::InvalidAddress => Sense::LBA_OUT_OF_RANGE,
            BlockDeviceError::NotReady => Sense::MEDIUM_NOT_PRESENT,
            BlockDeviceError::WriteProtected => Sense::WRITE_PROTECTED,
        }
    }
}

pub(crate) const INQUIRY_LEN: usize = 36;
pub(crate) const REQUEST_SENSE_LEN: usize = 18;

/// Standard INQUIRY data: direct access block device, SPC-2, response format 2.
pub(crate) fn inquiry(info: &InquiryInfo, buf: &mut [u8]) -> usize {
    let out = &mut buf[..INQUIRY_LEN];
    out.fill(0);
    out[1] = if info.removable { 0x80 } else { 0 };
    out[2] = 0x04;
    out[3] = 0x02;
    out[4] = (INQUIRY_LEN - 5) as u8;
    out[8..16].copy_from_slice(&info.vendor);
    out[16..32].copy_from_slice(&info.product);
    out[32..36].copy_from_slice(&info.revision);
    INQUIRY_LEN
}

const SUPPORTED_VPD_PAGES: [u8; 3] = [0x00, 0x80, 0x83];

/// Vital product data page, or `None` for a page we don't have.
pub(crate) fn vpd_page(page: u8, lun: &Lun<'_>, buf: &mut [u8]) -> Option<usize> {
    buf[0] = 0;
    buf[1] = page;
    buf[2] = 0;
    let body = match page {
        0x00 => {
            buf[4..4 + SUPPORTED_VPD_PAGES.len()].copy_from_slice(&SUPPORTED_VPD_PAGES);
            SUPPORTED_VPD_PAGES.len()
        }
        0x80 => {
            const HEX: &[u8; 16] = b"0123456789ABCDEF";
            buf[4] = HEX[(lun.number() >> 4) as usize];
            buf[5] = HEX[(lun.number() & 0xF) as usize];
            2
        }
        // device identification with no designators
        0x83 => 0,
        _ => return None,
    };
    buf[3] = body as u8;
    Some(4 + body)
}

/// READ CAPACITY (10): last LBA and block length.
pub(crate) fn read_capacity(lun: &Lun<'_>, buf: &mut [u8]) -> usize {
    let last_lba = lun.block_count().saturating_sub(1);
    buf[0..4].copy_from_slice(&last_lba.to_be_bytes());
    buf[4..8].copy_from_slice(&(lun.block_size() as u32).to_be_bytes());
    8
}

/// READ FORMAT CAPACITIES: list header plus one current/maximum capacity descriptor.
pub(crate) fn read_format_capacities(lun: &Lun<'_>, buf: &mut [u8]) -> usize {
    buf[0..4].copy_from_slice(&[0, 0, 0, 8]);
    buf[4..8].copy_from_slice(&lun.block_count().to_be_bytes());
    // formatted media
    buf[8] = 0x02;
    buf[9..12].copy_from_slice(&(lun.block_size() as u32).to_be_bytes()[1..4]);
    12
}

/// MODE SENSE (6) header with no block descriptors and no pages.
pub(crate) fn mode_sense6(write_protected: bool, buf: &mut [u8]) -> usize {
    buf[0] = 3;
    buf[1] = 0;
    buf[2] = if write_protected { 0x80 } else { 0 };
    buf[3] = 0;
    4
}

pub(crate) fn mode_sense10(write_protected: bool, buf: &mut [u8]) -> usize {
    buf[..8].fill(0);
    buf[1] = 6;
    buf[3] = if write_protected { 0x80 } else { 0 };
    8
}

/// Fixed format sense data, current errors.
pub(crate) fn request_sense(sense: &Sense, buf: &mut [u8]) -> usize {
    let out = &mut buf[..REQUEST_SENSE_LEN];
    out.fill(0);
    out[0] = 0x70;
    out[2] = sense.key as u8;
    out[7] = (REQUEST_SENSE_LEN - 8) as u8;
    out[12] = sense.asc;
    out[13] = sense.ascq;
    REQUEST_SENSE_LEN
}

/// LBA and transfer length of READ (10), WRITE (10) and VERIFY (10).
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) struct Rw10 {
    pub lba: u32,
    pub count: u32,
}

impl Rw10 {
    pub fn parse(cb: &[u8; 16]) -> Self {
        Rw10 {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            count: u16::from_be_bytes([cb[7], cb[8]]) as u32,
        }
    }
}

/// Allocation length of the 6 byte commands (byte 4).
pub(crate) fn allocation_length6(cb: &[u8; 16]) -> usize { cb[4] as usize }

/// Allocation length of INQUIRY (bytes 3-4).
pub(crate) fn allocation_length_inquiry(cb: &[u8; 16]) -> usize { u16::from_be_bytes([cb[3], cb[4]]) as usize }

/// Allocation length of the 10 byte commands (bytes 7-8).
pub(crate) fn allocation_length10(cb: &[u8; 16]) -> usize { u16::from_be_bytes([cb[7], cb[8]]) as usize }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msc::RamDisk;
    use num_traits::FromPrimitive;

    #[test]
    fn test_inquiry_layout() {
        let info = InquiryInfo::new("Acme", "RAM disk", "1.0");
        let mut buf = [0xFFu8; 64];
        assert_eq!(inquiry(&info, &mut buf), 36);
        assert_eq!(&buf[..8], &[0x00, 0x80, 0x04, 0x02, 31, 0, 0, 0]);
        assert_eq!(&buf[8..16], b"Acme    ");
        assert_eq!(&buf[32..36], b"1.0 ");
    }

    #[test]
    fn test_capacity_is_big_endian() {
        let mut backing = [0u8; 512 * 120];
        let mut disk = RamDisk::new(&mut backing, 512);
        let lun = Lun::new(0, &mut disk);
        let mut buf = [0u8; 16];
        assert_eq!(read_capacity(&lun, &mut buf), 8);
        assert_eq!(&buf[..8], &[0, 0, 0, 119, 0, 0, 0x02, 0x00]);
        assert_eq!(read_format_capacities(&lun, &mut buf), 12);
        assert_eq!(&buf[..12], &[0, 0, 0, 8, 0, 0, 0, 120, 0x02, 0, 0x02, 0x00]);
    }

    #[test]
    fn test_vpd_pages() {
        let mut backing = [0u8; 512];
        let mut disk = RamDisk::new(&mut backing, 512);
        let lun = Lun::new(1, &mut disk);
        let mut buf = [0u8; 32];
        assert_eq!(vpd_page(0x00, &lun, &mut buf), Some(7));
        assert_eq!(&buf[..7], &[0, 0, 0, 3, 0x00, 0x80, 0x83]);
        assert_eq!(vpd_page(0x80, &lun, &mut buf), Some(6));
        assert_eq!(&buf[..6], &[0, 0x80, 0, 2, b'0', b'1']);
        assert_eq!(vpd_page(0xB0, &lun, &mut buf), None);
    }

    #[test]
    fn test_sense_and_rw10() {
        let mut buf = [0u8; 18];
        request_sense(&Sense::LBA_OUT_OF_RANGE, &mut buf);
        assert_eq!(buf[0], 0x70);
        assert_eq!(buf[2], 0x05);
        assert_eq!(buf[7], 10);
        assert_eq!(buf[12], 0x21);

        let mut cb = [0u8; 16];
        cb[..10].copy_from_slice(&[0x28, 0, 0x00, 0x01, 0x02, 0x03, 0, 0x00, 0x3C, 0]);
        assert_eq!(Rw10::parse(&cb), Rw10 { lba: 0x0001_0203, count: 60 });
        assert_eq!(OpCode::from_u8(cb[0]), Some(OpCode::Read10));
        assert_eq!(OpCode::from_u8(0xA0), None);
        assert_eq!(Sense::from(BlockDeviceError::WriteProtected), Sense::WRITE_PROTECTED);
    }
}
