use heapless::Vec;

use crate::descriptor::{DescriptorWriter, USB_DT_HID, USB_DT_HID_REPORT};
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::hw::{Direction, UsbPeripheral};
use crate::interface::ControlAction;
use crate::logging::*;
use crate::setup::{SetupRequest, USB_REQ_GET_DESCRIPTOR};
use crate::Error;

pub const USB_CLASS_HID: u8 = 0x03;

const HID_REQ_GET_REPORT: u8 = 0x01;
const HID_REQ_GET_IDLE: u8 = 0x02;
const HID_REQ_GET_PROTOCOL: u8 = 0x03;
const HID_REQ_SET_REPORT: u8 = 0x09;
const HID_REQ_SET_IDLE: u8 = 0x0A;
const HID_REQ_SET_PROTOCOL: u8 = 0x0B;

/// Largest report, in either direction, the interface buffers.
pub const HID_REPORT_MAX: usize = 64;

const HID_DESCRIPTOR_LEN: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HidStep {
    ReportSent,
}

/// A HID function with one interrupt IN endpoint. Output reports arrive through
/// SET_REPORT on the control pipe.
pub struct HidInterface {
    number: u8,
    ep: Endpoint<HidStep, HID_REPORT_MAX>,
    report_descriptor: &'static [u8],
    subclass: u8,
    protocol: u8,
    idle_rate: u8,
    /// 0: boot protocol, 1: report protocol
    protocol_mode: u8,
    last_report: Vec<u8, HID_REPORT_MAX>,
    output_report: Vec<u8, HID_REPORT_MAX>,
    configured: bool,
}

impl HidInterface {
    pub fn new(number: u8, ep: u8, max_packet_size: u16, interval: u8, report_descriptor: &'static [u8]) -> Self {
        assert!(max_packet_size as usize <= HID_REPORT_MAX);
        HidInterface {
            number,
            ep: Endpoint::new(EndpointConfig::interrupt_in(ep, max_packet_size, interval)),
            report_descriptor,
            subclass: 0,
            protocol: 0,
            idle_rate: 0,
            protocol_mode: 1,
            last_report: Vec::new(),
            output_report: Vec::new(),
            configured: false,
        }
    }

    /// Advertise the boot interface subclass; `protocol` is 1 for a keyboard, 2 for a mouse.
    pub fn boot_device(mut self, protocol: u8) -> Self {
        self.subclass = 1;
        self.protocol = protocol;
        self
    }

    pub fn number(&self) -> u8 { self.number }

    pub fn endpoint(&self) -> EndpointConfig { *self.ep.config() }

    pub fn report_descriptor(&self) -> &'static [u8] { self.report_descriptor }

    pub fn idle_rate(&self) -> u8 { self.idle_rate }

    pub fn protocol_mode(&self) -> u8 { self.protocol_mode }

    /// The last output report the host delivered with SET_REPORT.
    pub fn output_report(&self) -> &[u8] { &self.output_report }

    /// Queue an input report on the interrupt endpoint.
    pub fn send_report<P: UsbPeripheral>(&mut self, hw: &mut P, report: &[u8]) -> Result<(), Error> {
        if !self.configured {
            return Err(Error::NotConfigured);
        }
        if report.len() > HID_REPORT_MAX {
            return Err(Error::BufferTooSmall);
        }
        self.ep.send(hw, report, Some(HidStep::ReportSent))?;
        self.last_report.clear();
        self.last_report.extend_from_slice(report).map_err(|_| Error::BufferTooSmall)?;
        Ok(())
    }

    pub(crate) fn fill_descriptor(&self, w: &mut DescriptorWriter<'_>) -> Result<(), Error> {
        w.interface(self.number, 1, USB_CLASS_HID, self.subclass, self.protocol)?;
        w.hid(self.report_descriptor.len() as u16)?;
        w.endpoint(self.ep.config())?;
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.ep.reset();
        self.idle_rate = 0;
        self.protocol_mode = 1;
        self.last_report.clear();
        self.output_report.clear();
        self.configured = false;
    }

    pub(crate) fn configure<P: UsbPeripheral>(&mut self, hw: &mut P) {
        self.reset();
        self.ep.configure(hw);
        self.configured = true;
    }

    /// GET_DESCRIPTOR for the HID and report descriptors, which the host asks the interface for.
    pub(crate) fn standard_request(&mut self, req: &SetupRequest, buf: &mut [u8]) -> ControlAction {
        if req.request != USB_REQ_GET_DESCRIPTOR {
            return ControlAction::Unhandled;
        }
        match req.descriptor_type() {
            USB_DT_HID => {
                let mut w = DescriptorWriter::new(buf);
                match w.hid(self.report_descriptor.len() as u16) {
                    Ok(_) => ControlAction::DataIn(HID_DESCRIPTOR_LEN),
                    Err(_) => ControlAction::Stall,
                }
            }
            USB_DT_HID_REPORT if self.report_descriptor.len() <= buf.len() => {
                let len = self.report_descriptor.len();
                buf[..len].copy_from_slice(self.report_descriptor);
                ControlAction::DataIn(len)
            }
            USB_DT_HID_REPORT => {
                warn!("hid{}: report descriptor larger than the control buffer", self.number);
                ControlAction::Stall
            }
            _ => ControlAction::Unhandled,
        }
    }

    pub(crate) fn class_request(&mut self, req: &SetupRequest, buf: &mut [u8]) -> ControlAction {
        match req.request {
            HID_REQ_GET_REPORT => {
                let len = self.last_report.len();
                buf[..len].copy_from_slice(&self.last_report);
                ControlAction::DataIn(len)
            }
            HID_REQ_GET_IDLE => {
                buf[0] = self.idle_rate;
                ControlAction::DataIn(1)
            }
            HID_REQ_GET_PROTOCOL => {
                buf[0] = self.protocol_mode;
                ControlAction::DataIn(1)
            }
            HID_REQ_SET_REPORT if req.length as usize <= HID_REPORT_MAX => ControlAction::DataOut,
            HID_REQ_SET_REPORT => ControlAction::Stall,
            HID_REQ_SET_IDLE => {
                self.idle_rate = (req.value >> 8) as u8;
                ControlAction::Ack
            }
            HID_REQ_SET_PROTOCOL if req.value <= 1 => {
                self.protocol_mode = req.value as u8;
                ControlAction::Ack
            }
            HID_REQ_SET_PROTOCOL => ControlAction::Stall,
            _ => ControlAction::Unhandled,
        }
    }

    pub(crate) fn control_out(&mut self, req: &SetupRequest, data: &[u8]) -> ControlAction {
        if req.request != HID_REQ_SET_REPORT {
            return ControlAction::Stall;
        }
        self.output_report.clear();
        match self.output_report.extend_from_slice(data) {
            Ok(()) => {
                debug!("hid{}: output report {:x?}", self.number, data);
                ControlAction::Ack
            }
            Err(_) => ControlAction::Stall,
        }
    }

    pub(crate) fn set_halt<P: UsbPeripheral>(&mut self, hw: &mut P, _address: u8, halt: bool) {
        if halt {
            self.ep.set_stall_in(hw);
        } else {
            self.ep.clear_stall(hw, Direction::In);
        }
    }

    pub(crate) fn endpoint_event<P: UsbPeripheral>(&mut self, hw: &mut P, dir: Direction) {
        if dir == Direction::In && self.ep.tx_complete(hw) == Some(HidStep::ReportSent) {
            trace_usb_control!("hid{}: report sent", self.number);
        }
    }
}
