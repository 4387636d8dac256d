//! Build-time device identity. Everything here is `const`-constructible so a firmware
//! image can declare its whole USB personality as statics.

pub const STRING_MANUFACTURER: u8 = 1;
pub const STRING_PRODUCT: u8 = 2;
pub const STRING_SERIAL: u8 = 3;
pub const STRING_CONFIGURATION: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub release: u16,
    pub manufacturer: Option<&'static str>,
    pub product: Option<&'static str>,
    pub serial_number: Option<&'static str>,
}

impl DeviceInfo {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        DeviceInfo {
            usb_version: 0x0200,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size_0: 64,
            vendor_id,
            product_id,
            release: 0x0100,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    pub const fn class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.class = class;
        self.subclass = subclass;
        self.protocol = protocol;
        self
    }

    /// Miscellaneous device class with interface association descriptors; needed
    /// whenever a function spans more than one interface (CDC-ACM) next to others.
    pub const fn composite(self) -> Self { self.class(0xEF, 0x02, 0x01) }

    pub const fn max_packet_size_0(mut self, size: u8) -> Self {
        self.max_packet_size_0 = size;
        self
    }

    pub const fn release(mut self, bcd: u16) -> Self {
        self.release = bcd;
        self
    }

    pub const fn manufacturer(mut self, s: &'static str) -> Self {
        self.manufacturer = Some(s);
        self
    }

    pub const fn product(mut self, s: &'static str) -> Self {
        self.product = Some(s);
        self
    }

    pub const fn serial_number(mut self, s: &'static str) -> Self {
        self.serial_number = Some(s);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigurationInfo {
    pub value: u8,
    pub max_power_ma: u16,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    pub name: Option<&'static str>,
}

impl ConfigurationInfo {
    pub const fn new(value: u8) -> Self {
        ConfigurationInfo { value, max_power_ma: 100, self_powered: false, remote_wakeup: false, name: None }
    }

    pub const fn max_power(mut self, ma: u16) -> Self {
        self.max_power_ma = ma;
        self
    }

    pub const fn self_powered(mut self, on: bool) -> Self {
        self.self_powered = on;
        self
    }

    pub const fn remote_wakeup(mut self, on: bool) -> Self {
        self.remote_wakeup = on;
        self
    }

    pub const fn name(mut self, s: &'static str) -> Self {
        self.name = Some(s);
        self
    }

    /// bmAttributes; bit 7 is reserved and must be set.
    pub const fn attributes(&self) -> u8 {
        0x80 | (if self.self_powered { 0x40 } else { 0 }) | (if self.remote_wakeup { 0x20 } else { 0 })
    }

    /// bMaxPower, in 2 mA units.
    pub const fn max_power_units(&self) -> u8 {
        let units = self.max_power_ma / 2;
        if units > 250 { 250 } else { units as u8 }
    }
}

/// Identity reported by the SCSI INQUIRY command. Strings are space padded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InquiryInfo {
    pub vendor: [u8; 8],
    pub product: [u8; 16],
    pub revision: [u8; 4],
    pub removable: bool,
}

const fn pad<const L: usize>(s: &str) -> [u8; L] {
    let bytes = s.as_bytes();
    let mut out = [b' '; L];
    let mut i = 0;
    while i < L && i < bytes.len() {
        out[i] = bytes[i];
        i += 1;
    }
    out
}

impl InquiryInfo {
    pub const fn new(vendor: &str, product: &str, revision: &str) -> Self {
        InquiryInfo { vendor: pad(vendor), product: pad(product), revision: pad(revision), removable: true }
    }

    pub const fn removable(mut self, removable: bool) -> Self {
        self.removable = removable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_attributes() {
        let cfg = ConfigurationInfo::new(1);
        assert_eq!(cfg.attributes(), 0x80);
        assert_eq!(cfg.max_power_units(), 50);
        let cfg = cfg.self_powered(true).remote_wakeup(true).max_power(900);
        assert_eq!(cfg.attributes(), 0xE0);
        assert_eq!(cfg.max_power_units(), 250);
    }

    #[test]
    fn test_inquiry_padding() {
        const INFO: InquiryInfo = InquiryInfo::new("Acme", "RAM disk", "1.0");
        assert_eq!(&INFO.vendor, b"Acme    ");
        assert_eq!(&INFO.product, b"RAM disk        ");
        assert_eq!(&INFO.revision, b"1.0 ");
        let long = InquiryInfo::new("a vendor that is too long", "p", "r");
        assert_eq!(&long.vendor, b"a vendor");
    }
}
