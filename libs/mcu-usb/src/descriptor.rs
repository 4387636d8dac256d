use crate::config::{
    ConfigurationInfo, DeviceInfo, STRING_CONFIGURATION, STRING_MANUFACTURER, STRING_PRODUCT, STRING_SERIAL,
};
use crate::endpoint::EndpointConfig;
use crate::interface::Interface;
use crate::Error;

pub const USB_DT_DEVICE: u8 = 0x01;
pub const USB_DT_CONFIG: u8 = 0x02;
pub const USB_DT_STRING: u8 = 0x03;
pub const USB_DT_INTERFACE: u8 = 0x04;
pub const USB_DT_ENDPOINT: u8 = 0x05;
pub const USB_DT_DEVICE_QUALIFIER: u8 = 0x06;
pub const USB_DT_OTHER_SPEED_CONFIG: u8 = 0x07;
pub const USB_DT_INTERFACE_ASSOCIATION: u8 = 0x0B;
pub const USB_DT_HID: u8 = 0x21;
pub const USB_DT_HID_REPORT: u8 = 0x22;
pub const USB_DT_CS_INTERFACE: u8 = 0x24;

pub const LANGUAGE_ID_EN_US: u16 = 0x0409;

/// USB 2.0 table 9-8
pub struct DeviceDescriptor {
    pub b_cd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub b_cd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub const BYTES: usize = 18;

    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let usb = self.b_cd_usb.to_le_bytes();
        let vid = self.id_vendor.to_le_bytes();
        let pid = self.id_product.to_le_bytes();
        let rel = self.b_cd_device.to_le_bytes();
        [
            Self::BYTES as u8,
            USB_DT_DEVICE,
            usb[0],
            usb[1],
            self.b_device_class,
            self.b_device_sub_class,
            self.b_device_protocol,
            self.b_max_packet_size0,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            rel[0],
            rel[1],
            self.i_manufacturer,
            self.i_product,
            self.i_serial_number,
            self.b_num_configurations,
        ]
    }
}

/// USB 2.0 table 9-10
pub struct ConfigDescriptor {
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

impl ConfigDescriptor {
    pub const BYTES: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let total = self.w_total_length.to_le_bytes();
        [
            Self::BYTES as u8,
            USB_DT_CONFIG,
            total[0],
            total[1],
            self.b_num_interfaces,
            self.b_configuration_value,
            self.i_configuration,
            self.bm_attributes,
            self.b_max_power,
        ]
    }
}

/// USB 2.0 table 9-12
pub struct InterfaceDescriptor {
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub const BYTES: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        [
            Self::BYTES as u8,
            USB_DT_INTERFACE,
            self.b_interface_number,
            self.b_alternate_setting,
            self.b_num_endpoints,
            self.b_interface_class,
            self.b_interface_sub_class,
            self.b_interface_protocol,
            self.i_interface,
        ]
    }
}

/// USB 2.0 table 9-13
pub struct EndpointDescriptor {
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub const BYTES: usize = 7;

    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mps = self.w_max_packet_size.to_le_bytes();
        [Self::BYTES as u8, USB_DT_ENDPOINT, self.b_endpoint_address, self.bm_attributes, mps[0], mps[1], self.b_interval]
    }
}

impl From<&EndpointConfig> for EndpointDescriptor {
    fn from(config: &EndpointConfig) -> Self {
        EndpointDescriptor {
            b_endpoint_address: config.address(),
            bm_attributes: config.transfer_type as u8,
            w_max_packet_size: config.max_packet_size,
            b_interval: config.interval,
        }
    }
}

/// Interface association descriptor (USB ECN, 8 bytes)
pub struct IadDescriptor {
    pub b_first_interface: u8,
    pub b_interface_count: u8,
    pub b_function_class: u8,
    pub b_function_sub_class: u8,
    pub b_function_protocol: u8,
    pub i_function: u8,
}

impl IadDescriptor {
    pub const BYTES: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        [
            Self::BYTES as u8,
            USB_DT_INTERFACE_ASSOCIATION,
            self.b_first_interface,
            self.b_interface_count,
            self.b_function_class,
            self.b_function_sub_class,
            self.b_function_protocol,
            self.i_function,
        ]
    }
}

/// Serializes descriptors into a caller-provided buffer.
///
/// Every method appends at the current position and returns the number of bytes it
/// wrote; running out of room is reported as [`Error::BufferTooSmall`] and leaves the
/// position where it was.
pub struct DescriptorWriter<'b> {
    buf: &'b mut [u8],
    position: usize,
}

impl<'b> DescriptorWriter<'b> {
    pub fn new(buf: &'b mut [u8]) -> Self { DescriptorWriter { buf, position: 0 } }

    pub fn position(&self) -> usize { self.position }

    pub fn written(&self) -> &[u8] { &self.buf[..self.position] }

    pub fn raw(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        let end = self.position + bytes.len();
        if end > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buf[self.position..end].copy_from_slice(bytes);
        self.position = end;
        Ok(bytes.len())
    }

    pub fn device(&mut self, info: &DeviceInfo, num_configurations: u8) -> Result<usize, Error> {
        let index = |s: Option<&str>, i: u8| if s.is_some() { i } else { 0 };
        let descriptor = DeviceDescriptor {
            b_cd_usb: info.usb_version,
            b_device_class: info.class,
            b_device_sub_class: info.subclass,
            b_device_protocol: info.protocol,
            b_max_packet_size0: info.max_packet_size_0,
            id_vendor: info.vendor_id,
            id_product: info.product_id,
            b_cd_device: info.release,
            i_manufacturer: index(info.manufacturer, STRING_MANUFACTURER),
            i_product: index(info.product, STRING_PRODUCT),
            i_serial_number: index(info.serial_number, STRING_SERIAL),
            b_num_configurations: num_configurations,
        };
        self.raw(&descriptor.to_bytes())
    }

    /// The configuration header followed by every interface's descriptors, with
    /// wTotalLength patched once the size is known.
    pub fn configuration(&mut self, config: &ConfigurationInfo, interfaces: &[Interface<'_>]) -> Result<usize, Error> {
        let start = self.position;
        let header = ConfigDescriptor {
            w_total_length: 0,
            b_num_interfaces: interfaces.len() as u8,
            b_configuration_value: config.value,
            i_configuration: if config.name.is_some() { STRING_CONFIGURATION } else { 0 },
            bm_attributes: config.attributes(),
            b_max_power: config.max_power_units(),
        };
        self.raw(&header.to_bytes())?;
        for interface in interfaces {
            if let Err(e) = interface.fill_descriptor(self) {
                self.position = start;
                return Err(e);
            }
        }
        let total = self.position - start;
        self.buf[start + 2..start + 4].copy_from_slice(&(total as u16).to_le_bytes());
        Ok(total)
    }

    pub fn interface(
        &mut self,
        number: u8,
        num_endpoints: u8,
        class: u8,
        sub_class: u8,
        protocol: u8,
    ) -> Result<usize, Error> {
        let descriptor = InterfaceDescriptor {
            b_interface_number: number,
            b_alternate_setting: 0,
            b_num_endpoints: num_endpoints,
            b_interface_class: class,
            b_interface_sub_class: sub_class,
            b_interface_protocol: protocol,
            i_interface: 0,
        };
        self.raw(&descriptor.to_bytes())
    }

    pub fn endpoint(&mut self, config: &EndpointConfig) -> Result<usize, Error> {
        self.raw(&EndpointDescriptor::from(config).to_bytes())
    }

    pub fn interface_association(
        &mut self,
        first_interface: u8,
        interface_count: u8,
        class: u8,
        sub_class: u8,
        protocol: u8,
    ) -> Result<usize, Error> {
        let descriptor = IadDescriptor {
            b_first_interface: first_interface,
            b_interface_count: interface_count,
            b_function_class: class,
            b_function_sub_class: sub_class,
            b_function_protocol: protocol,
            i_function: 0,
        };
        self.raw(&descriptor.to_bytes())
    }

    /// HID class descriptor (HID 1.11 section 6.2.1) announcing one report descriptor.
    pub fn hid(&mut self, report_descriptor_len: u16) -> Result<usize, Error> {
        let len = report_descriptor_len.to_le_bytes();
        self.raw(&[9, USB_DT_HID, 0x11, 0x01, 0x00, 0x01, USB_DT_HID_REPORT, len[0], len[1]])
    }

    pub fn cdc_header(&mut self, bcd_cdc: u16) -> Result<usize, Error> {
        let bcd = bcd_cdc.to_le_bytes();
        self.raw(&[5, USB_DT_CS_INTERFACE, 0x00, bcd[0], bcd[1]])
    }

    pub fn cdc_call_management(&mut self, capabilities: u8, data_interface: u8) -> Result<usize, Error> {
        self.raw(&[5, USB_DT_CS_INTERFACE, 0x01, capabilities, data_interface])
    }

    pub fn cdc_acm(&mut self, capabilities: u8) -> Result<usize, Error> {
        self.raw(&[4, USB_DT_CS_INTERFACE, 0x02, capabilities])
    }

    pub fn cdc_union(&mut self, control_interface: u8, subordinate_interface: u8) -> Result<usize, Error> {
        self.raw(&[5, USB_DT_CS_INTERFACE, 0x06, control_interface, subordinate_interface])
    }

    /// String descriptor zero: the supported language ids.
    pub fn language_ids(&mut self) -> Result<usize, Error> {
        let id = LANGUAGE_ID_EN_US.to_le_bytes();
        self.raw(&[4, USB_DT_STRING, id[0], id[1]])
    }

    /// A UTF-16LE string descriptor.
    pub fn string(&mut self, s: &str) -> Result<usize, Error> {
        let len = 2 + 2 * s.encode_utf16().count();
        if len > u8::MAX as usize || self.position + len > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.raw(&[len as u8, USB_DT_STRING])?;
        for unit in s.encode_utf16() {
            self.raw(&unit.to_le_bytes())?;
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::HidInterface;
    use crate::msc::{Lun, RamDisk, ScsiBulkTransport};
    use crate::InquiryInfo;

    #[test]
    fn test_device_descriptor_layout() {
        let info = DeviceInfo::new(0x1209, 0x3613).release(0x0102).manufacturer("Acme").product("Disk");
        let mut buf = [0u8; 64];
        let mut w = DescriptorWriter::new(&mut buf);
        assert_eq!(w.device(&info, 1), Ok(18));
        assert_eq!(
            w.written(),
            &[18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x09, 0x12, 0x13, 0x36, 0x02, 0x01, 1, 2, 0, 1]
        );
    }

    #[test]
    fn test_string_descriptors() {
        let mut buf = [0u8; 64];
        let mut w = DescriptorWriter::new(&mut buf);
        assert_eq!(w.language_ids(), Ok(4));
        assert_eq!(w.string("Ab"), Ok(6));
        assert_eq!(w.written(), &[4, 3, 0x09, 0x04, 6, 3, b'A', 0, b'b', 0]);
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut buf = [0u8; 10];
        let mut w = DescriptorWriter::new(&mut buf);
        assert_eq!(w.device(&DeviceInfo::new(1, 2), 1), Err(Error::BufferTooSmall));
        assert_eq!(w.position(), 0);
        assert_eq!(w.string("this does not fit"), Err(Error::BufferTooSmall));
    }

    #[test]
    fn test_configuration_total_length() {
        const REPORT: [u8; 4] = [0x06, 0x00, 0xFF, 0xC0];
        let mut disk = [0u8; 512 * 4];
        let mut ram = RamDisk::new(&mut disk, 512);
        let interfaces = [
            Interface::Msc(ScsiBulkTransport::new(
                0,
                1,
                1,
                64,
                InquiryInfo::new("Acme", "Disk", "1"),
                [Lun::new(0, &mut ram)],
            )),
            Interface::Hid(HidInterface::new(1, 2, 8, 10, &REPORT)),
        ];
        let mut buf = [0u8; 128];
        let mut w = DescriptorWriter::new(&mut buf);
        let total = w.configuration(&ConfigurationInfo::new(1), &interfaces).unwrap();
        // header + MSC (interface + 2 endpoints) + HID (interface + class + endpoint)
        assert_eq!(total, 9 + (9 + 7 + 7) + (9 + 9 + 7));
        let bytes = w.written();
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]) as usize, total);
        assert_eq!(bytes[4], 2);
        // MSC interface: class 8, SCSI transparent, bulk-only
        assert_eq!(&bytes[9..18], &[9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0]);
        assert_eq!(&bytes[18..25], &[7, 5, 0x81, 2, 64, 0, 0]);
        assert_eq!(&bytes[25..32], &[7, 5, 0x01, 2, 64, 0, 0]);
        // HID class descriptor carries the report length
        assert_eq!(&bytes[41..50], &[9, 0x21, 0x11, 0x01, 0, 1, 0x22, 4, 0]);
    }
}
