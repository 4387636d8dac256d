use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::hw::Direction;
use crate::Error;

pub const USB_REQ_GET_STATUS: u8 = 0x00;
pub const USB_REQ_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQ_SET_FEATURE: u8 = 0x03;
pub const USB_REQ_SET_ADDRESS: u8 = 0x05;
pub const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQ_GET_CONFIGURATION: u8 = 0x08;
pub const USB_REQ_SET_CONFIGURATION: u8 = 0x09;
pub const USB_REQ_GET_INTERFACE: u8 = 0x0A;
pub const USB_REQ_SET_INTERFACE: u8 = 0x0B;

/// Feature selectors
pub const USB_ENDPOINT_HALT: u16 = 0x00;
pub const USB_DEVICE_REMOTE_WAKEUP: u16 = 0x01;

pub const USB_DIR_IN: u8 = 0x80;
pub const USB_TYPE_STANDARD: u8 = 0x00 << 5;
pub const USB_TYPE_CLASS: u8 = 0x01 << 5;
pub const USB_TYPE_VENDOR: u8 = 0x02 << 5;
pub const USB_RECIP_DEVICE: u8 = 0x00;
pub const USB_RECIP_INTERFACE: u8 = 0x01;
pub const USB_RECIP_ENDPOINT: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// The 8-byte SETUP packet. Decoded afresh for every control transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SetupRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupRequest {
    pub const BYTES: usize = 8;

    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        SetupRequest { request_type, request, value, index, length }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::BYTES {
            return Err(Error::ShortPacket(buf.len()));
        }
        Ok(SetupRequest {
            request_type: buf[0],
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn recipient(&self) -> Recipient {
        // values 4..=31 are reserved; treat them like "other" so they end up stalled
        Recipient::from_u8(self.request_type & 0x1F).unwrap_or(Recipient::Other)
    }

    pub fn kind(&self) -> RequestType {
        RequestType::from_u8((self.request_type >> 5) & 0x03).unwrap_or(RequestType::Reserved)
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & USB_DIR_IN != 0 { Direction::In } else { Direction::Out }
    }

    pub fn descriptor_type(&self) -> u8 { (self.value >> 8) as u8 }

    pub fn descriptor_index(&self) -> u8 { self.value as u8 }

    pub fn interface_number(&self) -> u8 { self.index as u8 }

    pub fn endpoint_address(&self) -> u8 { self.index as u8 }

    pub fn is_standard(&self, recipient: Recipient, request: u8) -> bool {
        self.kind() == RequestType::Standard && self.recipient() == recipient && self.request == request
    }
}
