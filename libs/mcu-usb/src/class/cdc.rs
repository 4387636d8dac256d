use heapless::Deque;

use crate::descriptor::DescriptorWriter;
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::hw::{Direction, UsbPeripheral};
use crate::interface::{direction_of, ControlAction};
use crate::logging::*;
use crate::setup::SetupRequest;
use crate::Error;

pub const USB_CLASS_CDC: u8 = 0x02;
pub const USB_CLASS_CDC_DATA: u8 = 0x0A;
pub const CDC_SUBCLASS_ACM: u8 = 0x02;
pub const CDC_PROTOCOL_NONE: u8 = 0x00;

const CDC_SET_LINE_CODING: u8 = 0x20;
const CDC_GET_LINE_CODING: u8 = 0x21;
const CDC_SET_CONTROL_LINE_STATE: u8 = 0x22;
const CDC_SEND_BREAK: u8 = 0x23;

/// ACM capabilities: line coding and serial state requests are supported.
const ACM_CAPABILITIES: u8 = 0x02;
const NOTIFY_PACKET_SIZE: usize = 16;

pub const CDC_QUEUE_LEN: usize = 256;
const DATA_PACKET_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineCoding {
    pub data_rate: u32,
    /// 0: 1 stop bit, 1: 1.5, 2: 2
    pub stop_bits: u8,
    /// 0: none, 1: odd, 2: even, 3: mark, 4: space
    pub parity: u8,
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self { LineCoding { data_rate: 115_200, stop_bits: 0, parity: 0, data_bits: 8 } }
}

impl LineCoding {
    pub const BYTES: usize = 7;

    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let rate = self.data_rate.to_le_bytes();
        [rate[0], rate[1], rate[2], rate[3], self.stop_bits, self.parity, self.data_bits]
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::BYTES {
            return None;
        }
        Some(LineCoding {
            data_rate: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            stop_bits: data[4],
            parity: data[5],
            data_bits: data[6],
        })
    }
}

/// Communication-class half of a CDC-ACM function. Owns the notification endpoint
/// and answers the line coding requests; the payload moves through [`CdcData`].
pub struct CdcComm {
    number: u8,
    data_interface: u8,
    notify: Endpoint<(), NOTIFY_PACKET_SIZE>,
    line_coding: LineCoding,
    control_line_state: u16,
}

impl CdcComm {
    pub fn new(number: u8, data_interface: u8, notify_ep: u8) -> Self {
        CdcComm {
            number,
            data_interface,
            notify: Endpoint::new(EndpointConfig::interrupt_in(notify_ep, NOTIFY_PACKET_SIZE as u16, 255)),
            line_coding: LineCoding::default(),
            control_line_state: 0,
        }
    }

    pub fn number(&self) -> u8 { self.number }

    pub fn notify_endpoint(&self) -> EndpointConfig { *self.notify.config() }

    pub fn line_coding(&self) -> LineCoding { self.line_coding }

    pub fn dtr(&self) -> bool { self.control_line_state & 0x1 != 0 }

    pub fn rts(&self) -> bool { self.control_line_state & 0x2 != 0 }

    pub(crate) fn fill_descriptor(&self, w: &mut DescriptorWriter<'_>) -> Result<(), Error> {
        w.interface_association(self.number, 2, USB_CLASS_CDC, CDC_SUBCLASS_ACM, CDC_PROTOCOL_NONE)?;
        w.interface(self.number, 1, USB_CLASS_CDC, CDC_SUBCLASS_ACM, CDC_PROTOCOL_NONE)?;
        w.cdc_header(0x0110)?;
        w.cdc_call_management(0, self.data_interface)?;
        w.cdc_acm(ACM_CAPABILITIES)?;
        w.cdc_union(self.number, self.data_interface)?;
        w.endpoint(self.notify.config())?;
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.notify.reset();
        self.line_coding = LineCoding::default();
        self.control_line_state = 0;
    }

    pub(crate) fn configure<P: UsbPeripheral>(&mut self, hw: &mut P) { self.notify.configure(hw); }

    pub(crate) fn class_request(&mut self, req: &SetupRequest, buf: &mut [u8]) -> ControlAction {
        match req.request {
            CDC_SET_LINE_CODING if req.length as usize == LineCoding::BYTES => ControlAction::DataOut,
            CDC_GET_LINE_CODING => {
                buf[..LineCoding::BYTES].copy_from_slice(&self.line_coding.to_bytes());
                ControlAction::DataIn(LineCoding::BYTES)
            }
            CDC_SET_CONTROL_LINE_STATE => {
                self.control_line_state = req.value;
                debug!("cdc{}: dtr {} rts {}", self.number, self.dtr(), self.rts());
                ControlAction::Ack
            }
            CDC_SEND_BREAK => ControlAction::Ack,
            _ => ControlAction::Unhandled,
        }
    }

    pub(crate) fn control_out(&mut self, req: &SetupRequest, data: &[u8]) -> ControlAction {
        match (req.request, LineCoding::parse(data)) {
            (CDC_SET_LINE_CODING, Some(coding)) => {
                debug!("cdc{}: line coding {:?}", self.number, coding);
                self.line_coding = coding;
                ControlAction::Ack
            }
            _ => ControlAction::Stall,
        }
    }

    pub(crate) fn set_halt<P: UsbPeripheral>(&mut self, hw: &mut P, _address: u8, halt: bool) {
        if halt {
            self.notify.set_stall_in(hw);
        } else {
            self.notify.clear_stall(hw, Direction::In);
        }
    }

    pub(crate) fn endpoint_event<P: UsbPeripheral>(&mut self, hw: &mut P, dir: Direction) {
        if dir == Direction::In {
            self.notify.tx_complete(hw);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CdcStep {
    Sent,
    Received,
}

/// Data-class half of a CDC-ACM function: a byte pipe in each direction.
pub struct CdcData {
    number: u8,
    ep_in: Endpoint<CdcStep, DATA_PACKET_SIZE>,
    ep_out: Endpoint<CdcStep, DATA_PACKET_SIZE>,
    rx: Deque<u8, CDC_QUEUE_LEN>,
    tx: Deque<u8, CDC_QUEUE_LEN>,
    configured: bool,
    /// the receive queue had no room for another packet, so OUT is left NAKing
    rx_paused: bool,
}

impl CdcData {
    pub fn new(number: u8, ep_in: u8, ep_out: u8, max_packet_size: u16) -> Self {
        assert!(max_packet_size as usize <= DATA_PACKET_SIZE);
        CdcData {
            number,
            ep_in: Endpoint::new(EndpointConfig::bulk_in(ep_in, max_packet_size)),
            ep_out: Endpoint::new(EndpointConfig::bulk_out(ep_out, max_packet_size)),
            rx: Deque::new(),
            tx: Deque::new(),
            configured: false,
            rx_paused: false,
        }
    }

    pub fn number(&self) -> u8 { self.number }

    pub fn endpoints(&self) -> (EndpointConfig, EndpointConfig) { (*self.ep_in.config(), *self.ep_out.config()) }

    pub fn bytes_available(&self) -> usize { self.rx.len() }

    /// Queue bytes for the host. Returns how many fit in the transmit queue.
    pub fn write<P: UsbPeripheral>(&mut self, hw: &mut P, data: &[u8]) -> Result<usize, Error> {
        if !self.configured {
            return Err(Error::NotConfigured);
        }
        let mut queued = 0;
        for &b in data {
            if self.tx.push_back(b).is_err() {
                break;
            }
            queued += 1;
        }
        self.flush(hw);
        Ok(queued)
    }

    pub fn read<P: UsbPeripheral>(&mut self, hw: &mut P, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(b) => buf[n] = b,
                None => break,
            }
            n += 1;
        }
        if self.rx_paused && self.rx_room() >= self.ep_out.max_packet_size() {
            self.rx_paused = false;
            self.arm_rx(hw);
        }
        n
    }

    fn rx_room(&self) -> usize { self.rx.capacity() - self.rx.len() }

    fn arm_rx<P: UsbPeripheral>(&mut self, hw: &mut P) {
        if let Err(e) = self.ep_out.receive(hw, self.ep_out.max_packet_size(), CdcStep::Received) {
            warn!("cdc{}: can't arm OUT: {:?}", self.number, e);
        }
    }

    fn flush<P: UsbPeripheral>(&mut self, hw: &mut P) {
        if !self.configured || !self.ep_in.is_ready() || self.tx.is_empty() {
            return;
        }
        let mps = self.ep_in.max_packet_size();
        let buf = self.ep_in.buffer_mut();
        let mut n = 0;
        while n < mps {
            match self.tx.pop_front() {
                Some(b) => buf[n] = b,
                None => break,
            }
            n += 1;
        }
        // a full last packet needs a ZLP behind it or the host keeps waiting
        let zlp = self.tx.is_empty();
        if let Err(e) = self.ep_in.send_buffered(hw, n, zlp, Some(CdcStep::Sent)) {
            warn!("cdc{}: can't send: {:?}", self.number, e);
        }
    }

    pub(crate) fn fill_descriptor(&self, w: &mut DescriptorWriter<'_>) -> Result<(), Error> {
        w.interface(self.number, 2, USB_CLASS_CDC_DATA, 0, 0)?;
        w.endpoint(self.ep_out.config())?;
        w.endpoint(self.ep_in.config())?;
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.ep_in.reset();
        self.ep_out.reset();
        self.rx.clear();
        self.tx.clear();
        self.configured = false;
        self.rx_paused = false;
    }

    pub(crate) fn configure<P: UsbPeripheral>(&mut self, hw: &mut P) {
        self.reset();
        self.ep_in.configure(hw);
        self.ep_out.configure(hw);
        self.configured = true;
        self.arm_rx(hw);
    }

    pub(crate) fn set_halt<P: UsbPeripheral>(&mut self, hw: &mut P, address: u8, halt: bool) {
        let dir = direction_of(address);
        let ep = if dir == Direction::In { &mut self.ep_in } else { &mut self.ep_out };
        if halt {
            ep.set_stall(hw, dir);
        } else {
            ep.clear_stall(hw, dir);
        }
        if !halt && dir == Direction::Out && self.ep_out.is_ready() && !self.rx_paused {
            self.arm_rx(hw);
        }
    }

    pub(crate) fn endpoint_event<P: UsbPeripheral>(&mut self, hw: &mut P, dir: Direction) {
        match dir {
            Direction::In => {
                if self.ep_in.tx_complete(hw).is_some() {
                    self.flush(hw);
                }
            }
            Direction::Out => {
                if self.ep_out.rx_complete(hw).is_none() {
                    return;
                }
                for &b in self.ep_out.received() {
                    if self.rx.push_back(b).is_err() {
                        warn!("cdc{}: receive queue overflow", self.number);
                        break;
                    }
                }
                if self.rx_room() >= self.ep_out.max_packet_size() {
                    self.arm_rx(hw);
                } else {
                    self.rx_paused = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::{USB_DIR_IN, USB_RECIP_INTERFACE, USB_TYPE_CLASS};

    #[test]
    fn test_line_coding_requests() {
        let mut comm = CdcComm::new(0, 1, 3);
        let mut buf = [0u8; 16];
        let get = SetupRequest::new(USB_DIR_IN | USB_TYPE_CLASS | USB_RECIP_INTERFACE, CDC_GET_LINE_CODING, 0, 0, 7);
        assert_eq!(comm.class_request(&get, &mut buf), ControlAction::DataIn(7));
        assert_eq!(&buf[..7], &[0x00, 0xC2, 0x01, 0x00, 0, 0, 8]);

        let set = SetupRequest::new(USB_TYPE_CLASS | USB_RECIP_INTERFACE, CDC_SET_LINE_CODING, 0, 0, 7);
        assert_eq!(comm.class_request(&set, &mut buf), ControlAction::DataOut);
        let coding = LineCoding { data_rate: 9600, stop_bits: 2, parity: 1, data_bits: 7 };
        assert_eq!(comm.control_out(&set, &coding.to_bytes()), ControlAction::Ack);
        assert_eq!(comm.line_coding(), coding);
        assert_eq!(comm.control_out(&set, &[1, 2]), ControlAction::Stall);

        let state = SetupRequest::new(USB_TYPE_CLASS | USB_RECIP_INTERFACE, CDC_SET_CONTROL_LINE_STATE, 3, 0, 0);
        assert_eq!(comm.class_request(&state, &mut buf), ControlAction::Ack);
        assert!(comm.dtr() && comm.rts());
    }

    #[test]
    fn test_write_before_configuration_fails() {
        let mut hw = crate::sim::SimPeripheral::new();
        let mut data = CdcData::new(1, 2, 2, 64);
        assert_eq!(data.write(&mut hw, b"hi"), Err(Error::NotConfigured));
    }
}
