/// Signature that identifies a packet as CBW ("USBC")
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as CSW ("USBS")
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// Why a CBW was rejected. Any of these leaves the transport waiting for reset recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbwError {
    /// A CBW must arrive as exactly 31 bytes
    Length(usize),
    Signature(u32),
    /// bCBWCBLength outside 1..=16
    CommandLength(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// OUT in USB parlance
    HostToDevice,
    /// IN in USB parlance
    DeviceToHost,
}

/// A wrapper that identifies a command sent from the host to the
/// device on the OUT endpoint. Describes the data transfer IN or OUT
/// that should happen immediately after this wrapper is received.
/// Little Endian
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct CommandBlockWrapper {
    /// Must contain 0x43425355
    pub signature: u32,
    /// Tag sent by the host. Echoed back in the tag field of the command status
    /// wrapper so the host can pair the CSW with this CBW
    pub tag: u32,
    /// Number of bytes of data that the host expects to move on the IN or OUT
    /// endpoint during the execution of this command. Zero means no data stage
    pub data_transfer_length: u32,
    /// Bit 7 of bmCBWFlags; the other bits are reserved
    pub direction: DataDirection,
    /// The LUN the command is for. Devices with a single LUN still check it
    pub lun: u8,
    /// The number of valid bytes in `data`
    pub data_length: u8,
    /// The SCSI command block
    pub data: [u8; 16],
}

impl Default for CommandBlockWrapper {
    fn default() -> Self {
        Self {
            signature: CBW_SIGNATURE,
            tag: 0,
            data_transfer_length: 0,
            direction: DataDirection::HostToDevice,
            lun: 0,
            data_length: 0,
            data: [0; 16],
        }
    }
}

impl CommandBlockWrapper {
    pub const BYTES: usize = 31;

    /// Validate and decode a CBW. The host must send it as a transfer of exactly 31 bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, CbwError> {
        if buf.len() != Self::BYTES {
            return Err(CbwError::Length(buf.len()));
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CBW_SIGNATURE {
            return Err(CbwError::Signature(signature));
        }
        let data_length = buf[14] & 0x1F;
        if data_length == 0 || data_length > 16 {
            return Err(CbwError::CommandLength(data_length));
        }
        let mut data = [0u8; 16];
        data.copy_from_slice(&buf[15..31]);
        Ok(CommandBlockWrapper {
            signature,
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_transfer_length: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            direction: if buf[12] & 0x80 != 0 { DataDirection::DeviceToHost } else { DataDirection::HostToDevice },
            lun: buf[13] & 0x0F,
            data_length,
            data,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        out[0..4].copy_from_slice(&self.signature.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        out[12] = match self.direction {
            DataDirection::DeviceToHost => 0x80,
            DataDirection::HostToDevice => 0x00,
        };
        out[13] = self.lun;
        out[14] = self.data_length;
        out[15..31].copy_from_slice(&self.data);
        out
    }

    pub fn opcode(&self) -> u8 { self.data[0] }

    /// The valid part of the command block.
    pub fn command(&self) -> &[u8] { &self.data[..self.data_length as usize] }

    /// Build a CBW the way a host does; used by the simulated host.
    pub fn new(tag: u32, data_transfer_length: u32, direction: DataDirection, lun: u8, command: &[u8]) -> Self {
        let len = command.len().min(16);
        let mut data = [0u8; 16];
        data[..len].copy_from_slice(&command[..len]);
        CommandBlockWrapper {
            signature: CBW_SIGNATURE,
            tag,
            data_transfer_length,
            direction,
            lun,
            data_length: len as u8,
            data,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum CommandStatus {
    CommandOk = 0x00,
    CommandError = 0x01,
    /// Causes the host to perform a reset recovery
    PhaseError = 0x02,
}

/// The status trailer sent on bulk IN once the data stage, if any, is over.
/// Little Endian
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct CommandStatusWrapper {
    /// Must contain 0x53425355
    pub signature: u32,
    /// Copied from the CBW tag field
    pub tag: u32,
    /// Difference between data_transfer_length from the CBW and the amount of
    /// data actually sent or received. Never greater than data_transfer_length
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl Default for CommandStatusWrapper {
    fn default() -> Self {
        Self { signature: CSW_SIGNATURE, tag: 0, data_residue: 0, status: CommandStatus::CommandOk }
    }
}

impl CommandStatusWrapper {
    pub const BYTES: usize = 13;

    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        out[0..4].copy_from_slice(&self.signature.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        out[12] = self.status as u8;
        out
    }

    /// Host side decode. `None` unless the buffer is a well formed 13 byte CSW.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::BYTES {
            return None;
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let status = match buf[12] {
            0 => CommandStatus::CommandOk,
            1 => CommandStatus::CommandError,
            2 => CommandStatus::PhaseError,
            _ => return None,
        };
        if signature != CSW_SIGNATURE {
            return None;
        }
        Some(CommandStatusWrapper {
            signature,
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inquiry_cbw() -> [u8; 31] {
        let mut raw = [0u8; 31];
        raw[0..4].copy_from_slice(b"USBC");
        raw[4..8].copy_from_slice(&7u32.to_le_bytes());
        raw[8..12].copy_from_slice(&36u32.to_le_bytes());
        raw[12] = 0x80;
        raw[14] = 6;
        raw[15] = 0x12;
        raw[19] = 36;
        raw
    }

    #[test]
    fn test_parse_inquiry_cbw() {
        let cbw = CommandBlockWrapper::parse(&inquiry_cbw()).unwrap();
        assert_eq!(cbw.tag, 7);
        assert_eq!(cbw.data_transfer_length, 36);
        assert_eq!(cbw.direction, DataDirection::DeviceToHost);
        assert_eq!(cbw.opcode(), 0x12);
        assert_eq!(cbw.command(), &[0x12, 0, 0, 0, 36, 0]);
        assert_eq!(cbw.to_bytes(), inquiry_cbw());
    }

    #[test]
    fn test_rejects_malformed_cbw() {
        let mut raw = inquiry_cbw();
        assert_eq!(CommandBlockWrapper::parse(&raw[..30]), Err(CbwError::Length(30)));
        raw[14] = 0;
        assert_eq!(CommandBlockWrapper::parse(&raw), Err(CbwError::CommandLength(0)));
        raw[0] = b'X';
        assert_eq!(CommandBlockWrapper::parse(&raw), Err(CbwError::Signature(0x43425358)));
    }

    #[test]
    fn test_csw_layout() {
        let csw = CommandStatusWrapper { tag: 9, data_residue: 0x100, status: CommandStatus::CommandError, ..Default::default() };
        let bytes = csw.to_bytes();
        assert_eq!(&bytes, &[0x55, 0x53, 0x42, 0x53, 9, 0, 0, 0, 0, 1, 0, 0, 1]);
        assert_eq!(CommandStatusWrapper::parse(&bytes), Some(csw));
        assert_eq!(CommandStatusWrapper::parse(&bytes[..12]), None);
    }
}
