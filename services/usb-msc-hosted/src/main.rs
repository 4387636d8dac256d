//! Runs a composite device (CDC-ACM, HID mouse, mass storage) on the simulated
//! peripheral and exercises it the way a host driver would.

use std::env;
use std::process;

use mcu_usb::class::{CdcComm, CdcData, HidInterface};
use mcu_usb::descriptor::USB_DT_STRING;
use mcu_usb::msc::{CommandBlockWrapper, CommandStatus, DataDirection, Lun, RamDisk, ScsiBulkTransport};
use mcu_usb::sim::{Handshake, MscTarget, SimHost, SimPeripheral};
use mcu_usb::{ConfigurationInfo, DeviceInfo, InquiryInfo, Interface, UsbDevice};

const BLOCK_SIZE: usize = 512;
const BLOCKS: usize = 128;
const DEVICE_ADDRESS: u8 = 9;

const MSC: MscTarget = MscTarget { interface: 3, ep_in: 4, ep_out: 4 };

const MOUSE_REPORT: [u8; 50] = [
    0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, 0x09, 0x01, 0xA1, 0x00, 0x05, 0x09, 0x19, 0x01, 0x29, 0x03, 0x15,
    0x00, 0x25, 0x01, 0x95, 0x03, 0x75, 0x01, 0x81, 0x02, 0x95, 0x01, 0x75, 0x05, 0x81, 0x01, 0x05, 0x01,
    0x09, 0x30, 0x09, 0x31, 0x15, 0x81, 0x25, 0x7F, 0x75, 0x08, 0x95, 0x02, 0x81, 0x06, 0xC0, 0xC0,
];

type Device<'a> = UsbDevice<'a, SimPeripheral, 4>;

#[derive(Debug)]
enum Failure {
    Bus(Handshake),
    Status(u32, Option<CommandStatus>),
    Mismatch(&'static str),
}

impl From<Handshake> for Failure {
    fn from(h: Handshake) -> Self { Failure::Bus(h) }
}

fn scsi(
    host: &mut SimHost,
    dev: &mut Device<'_>,
    tag: u32,
    direction: DataDirection,
    length: u32,
    cb: &[u8],
    data_out: &[u8],
) -> Result<Vec<u8>, Failure> {
    let cbw = CommandBlockWrapper::new(tag, length, direction, 0, cb);
    let response = host.mass_storage_command(dev, MSC, &cbw, data_out)?;
    match response.status {
        Some(csw) if csw.tag == tag && csw.status == CommandStatus::CommandOk => Ok(response.data),
        other => Err(Failure::Status(tag, other.map(|csw| csw.status))),
    }
}

/// UTF-16LE string descriptor body to a String.
fn decode_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .get(2..)
        .unwrap_or(&[])
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn rw10(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
    let lba = lba.to_be_bytes();
    let count = blocks.to_be_bytes();
    [opcode, 0, lba[0], lba[1], lba[2], lba[3], 0, count[0], count[1], 0]
}

fn run(host: &mut SimHost, dev: &mut Device<'_>) -> Result<(), Failure> {
    let (device, config) = host.enumerate(dev, DEVICE_ADDRESS)?;
    log::info!(
        "enumerated at address {}: {:04x}:{:04x}, configuration {} bytes",
        dev.address(),
        u16::from_le_bytes([device[8], device[9]]),
        u16::from_le_bytes([device[10], device[11]]),
        config.len()
    );

    for (index, what) in [(1, "manufacturer"), (2, "product"), (4, "configuration")] {
        let raw = host.get_descriptor(dev, USB_DT_STRING, index, 255)?;
        log::info!("{}: {:?}", what, decode_string(&raw));
    }

    let max_lun = host.get_max_lun(dev, MSC)?;
    log::info!("max LUN {}", max_lun);

    let inquiry = scsi(host, dev, 1, DataDirection::DeviceToHost, 36, &[0x12, 0, 0, 0, 36, 0], &[])?;
    log::info!(
        "inquiry: '{}' '{}'",
        String::from_utf8_lossy(&inquiry[8..16]).trim_end(),
        String::from_utf8_lossy(&inquiry[16..32]).trim_end()
    );

    scsi(host, dev, 2, DataDirection::HostToDevice, 0, &[0x00, 0, 0, 0, 0, 0], &[])?;

    let capacity = scsi(host, dev, 3, DataDirection::DeviceToHost, 8, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], &[])?;
    let last_lba = u32::from_be_bytes([capacity[0], capacity[1], capacity[2], capacity[3]]);
    let block_size = u32::from_be_bytes([capacity[4], capacity[5], capacity[6], capacity[7]]);
    log::info!("capacity: {} blocks of {} bytes", last_lba + 1, block_size);
    if last_lba as usize + 1 != BLOCKS || block_size as usize != BLOCK_SIZE {
        return Err(Failure::Mismatch("read capacity"));
    }

    let payload: Vec<u8> = (0..BLOCK_SIZE * 8).map(|i| (i * 13 + 5) as u8).collect();
    scsi(host, dev, 4, DataDirection::HostToDevice, payload.len() as u32, &rw10(0x2A, 100, 8), &payload)?;
    let readback = scsi(host, dev, 5, DataDirection::DeviceToHost, payload.len() as u32, &rw10(0x28, 100, 8), &[])?;
    if readback != payload {
        return Err(Failure::Mismatch("read back after write"));
    }
    log::info!("wrote and read back {} bytes at LBA 100", payload.len());

    let sent = dev.with_interface(1, |iface, hw| match iface {
        Interface::CdcData(data) => data.write(hw, b"hello from the device\r\n").ok(),
        _ => None,
    });
    if sent.flatten().is_none() {
        return Err(Failure::Mismatch("CDC write"));
    }
    let serial = host.bulk_in(dev, 2, 64)?;
    log::info!("CDC in: {:?}", String::from_utf8_lossy(&serial));

    host.bulk_out(dev, 2, b"ping")?;
    let mut line = [0u8; 16];
    let n = dev
        .with_interface(1, |iface, hw| match iface {
            Interface::CdcData(data) => data.read(hw, &mut line),
            _ => 0,
        })
        .unwrap_or(0);
    if &line[..n] != b"ping" {
        return Err(Failure::Mismatch("CDC read"));
    }
    log::info!("CDC out: {:?}", String::from_utf8_lossy(&line[..n]));

    let queued = dev.with_interface(2, |iface, hw| match iface {
        Interface::Hid(hid) => hid.send_report(hw, &[0x00, 0x10, 0xF0]).is_ok(),
        _ => false,
    });
    if queued != Some(true) {
        return Err(Failure::Mismatch("HID report"));
    }
    let report = host.in_packet(dev, 3)?;
    log::info!("HID report {:x?}", report);

    Ok(())
}

fn main() {
    if env::var(env_logger::DEFAULT_FILTER_ENV).is_err() {
        env::set_var(env_logger::DEFAULT_FILTER_ENV, "info");
    }
    env_logger::init();

    let mut backing = vec![0u8; BLOCK_SIZE * BLOCKS];
    for (i, b) in backing.iter_mut().enumerate() {
        *b = (i / BLOCK_SIZE) as u8 ^ (i as u8);
    }
    let mut disk = RamDisk::new(&mut backing, BLOCK_SIZE);

    let msc = ScsiBulkTransport::new(
        MSC.interface,
        MSC.ep_in,
        MSC.ep_out,
        64,
        InquiryInfo::new("Hosted", "RAM disk", "0.1"),
        [Lun::new(0, &mut disk)],
    );
    let mut dev = UsbDevice::new(
        SimPeripheral::new(),
        DeviceInfo::new(0x1209, 0x5AB1).manufacturer("mcu-usb").product("Hosted composite").serial_number("0001").composite(),
        ConfigurationInfo::new(1).max_power(100).name("CDC + HID + MSC"),
        [
            Interface::CdcComm(CdcComm::new(0, 1, 1)),
            Interface::CdcData(CdcData::new(1, 2, 2, 64)),
            Interface::Hid(HidInterface::new(2, 3, 8, 10, &MOUSE_REPORT)),
            Interface::Msc(msc),
        ],
    );
    dev.enable();

    let mut host = SimHost::new();
    match run(&mut host, &mut dev) {
        Ok(()) => log::info!("all transfers completed, {} hardware errors", dev.hardware_errors()),
        Err(e) => {
            log::error!("session failed: {:?}", e);
            process::exit(1);
        }
    }
}
