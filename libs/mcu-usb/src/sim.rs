//! A software USB peripheral and a host that drives it.
//!
//! [`SimPeripheral`] implements [`UsbPeripheral`] with the same NAK/STALL/ACK
//! semantics as the full-speed device block; the host side pokes tokens at it.
//! [`SimHost`] wraps that into control and bulk transfers against a [`UsbDevice`],
//! running the device's interrupt handler after every transaction.

use std::vec::Vec;

use crate::endpoint::{EndpointConfig, EndpointDirection};
use crate::hw::{Direction, Istr, UsbPeripheral};
use crate::msc::{CommandBlockWrapper, CommandStatusWrapper, DataDirection};
use crate::setup::*;
use crate::UsbDevice;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
    /// Nobody answered: wrong address, endpoint not enabled, or device detached
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
    Setup,
    In,
    Out,
}

/// One bus transaction as seen by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub token: Token,
    pub address: u8,
    pub endpoint: u8,
    pub data: Vec<u8>,
    pub handshake: Handshake,
}

#[derive(Clone, Debug, Default)]
struct SimEndpoint {
    in_enabled: bool,
    out_enabled: bool,
    max_packet_size: usize,
    tx: Option<Vec<u8>>,
    rx_armed: bool,
    rx: Vec<u8>,
    setup: bool,
    stall_in: bool,
    stall_out: bool,
    ctr_in: bool,
    ctr_out: bool,
}

pub struct SimPeripheral {
    enabled: bool,
    address: u8,
    endpoints: [SimEndpoint; 16],
    events: u32,
    log: Vec<Transaction>,
}

impl Default for SimPeripheral {
    fn default() -> Self { Self::new() }
}

impl SimPeripheral {
    pub fn new() -> Self {
        SimPeripheral {
            enabled: false,
            address: 0,
            endpoints: Default::default(),
            events: 0,
            log: Vec::new(),
        }
    }

    /// Address the peripheral currently answers on.
    pub fn address(&self) -> u8 { self.address }

    pub fn transactions(&self) -> &[Transaction] { &self.log }

    pub fn clear_transactions(&mut self) { self.log.clear(); }

    /// Host drives SE0: the device sees RESET on its next interrupt.
    pub fn bus_reset(&mut self) {
        let mut flags = Istr::from_bits(0);
        flags.set_reset(true);
        self.raise(flags);
    }

    /// Flag a packet-level error, as a CRC or bit-stuffing failure would.
    pub fn raise_error(&mut self) {
        let mut flags = Istr::from_bits(0);
        flags.set_err(true);
        self.raise(flags);
    }

    /// Set any of the non-transfer status flags.
    pub fn raise(&mut self, flags: Istr) { self.events |= flags.events().bits(); }

    fn record(&mut self, token: Token, address: u8, endpoint: u8, data: &[u8], handshake: Handshake) -> Handshake {
        self.log.push(Transaction { token, address, endpoint, data: data.to_vec(), handshake });
        handshake
    }

    fn reachable(&self, address: u8, ep: u8, dir: Direction) -> bool {
        let Some(endpoint) = self.endpoints.get(ep as usize) else {
            return false;
        };
        let enabled = match dir {
            Direction::In => endpoint.in_enabled,
            Direction::Out => endpoint.out_enabled,
        };
        self.enabled && address == self.address && enabled
    }

    /// SETUP to endpoint 0. Always acknowledged when the device is reachable, whatever the endpoint state.
    pub fn setup(&mut self, address: u8, packet: [u8; 8]) -> Handshake {
        if !self.reachable(address, 0, Direction::Out) {
            return self.record(Token::Setup, address, 0, &packet, Handshake::Timeout);
        }
        let ep0 = &mut self.endpoints[0];
        ep0.rx = packet.to_vec();
        ep0.rx_armed = false;
        ep0.setup = true;
        ep0.ctr_out = true;
        ep0.tx = None;
        ep0.ctr_in = false;
        self.record(Token::Setup, address, 0, &packet, Handshake::Ack)
    }

    pub fn in_token(&mut self, address: u8, ep: u8) -> Result<Vec<u8>, Handshake> {
        if !self.reachable(address, ep, Direction::In) {
            self.record(Token::In, address, ep, &[], Handshake::Timeout);
            return Err(Handshake::Timeout);
        }
        let endpoint = &mut self.endpoints[ep as usize];
        let result = if endpoint.stall_in {
            Err(Handshake::Stall)
        } else if endpoint.ctr_in {
            // the device hasn't consumed the previous completion yet
            Err(Handshake::Nak)
        } else {
            match endpoint.tx.take() {
                Some(packet) => {
                    endpoint.ctr_in = true;
                    Ok(packet)
                }
                None => Err(Handshake::Nak),
            }
        };
        match &result {
            Ok(packet) => {
                let packet = packet.clone();
                self.record(Token::In, address, ep, &packet, Handshake::Ack);
            }
            Err(handshake) => {
                self.record(Token::In, address, ep, &[], *handshake);
            }
        }
        result
    }

    pub fn out_token(&mut self, address: u8, ep: u8, data: &[u8]) -> Handshake {
        if !self.reachable(address, ep, Direction::Out) {
            return self.record(Token::Out, address, ep, data, Handshake::Timeout);
        }
        let endpoint = &mut self.endpoints[ep as usize];
        let handshake = if endpoint.stall_out {
            Handshake::Stall
        } else if !endpoint.rx_armed || endpoint.ctr_out {
            Handshake::Nak
        } else {
            endpoint.rx = data.to_vec();
            endpoint.rx_armed = false;
            endpoint.setup = false;
            endpoint.ctr_out = true;
            Handshake::Ack
        };
        self.record(Token::Out, address, ep, data, handshake)
    }

    /// Max packet size the device programmed for an endpoint.
    pub fn max_packet_size(&self, ep: u8) -> usize { self.endpoints[ep as usize].max_packet_size }
}

impl UsbPeripheral for SimPeripheral {
    fn enable(&mut self) { self.enabled = true; }

    fn reset(&mut self) {
        self.address = 0;
        self.endpoints = Default::default();
    }

    fn set_address(&mut self, address: u8) { self.address = address; }

    fn configure_endpoint(&mut self, config: &EndpointConfig) {
        let endpoint = &mut self.endpoints[config.number as usize];
        endpoint.max_packet_size = config.max_packet_size as usize;
        if matches!(config.direction, EndpointDirection::In | EndpointDirection::Bidirectional) {
            endpoint.in_enabled = true;
            endpoint.tx = None;
            endpoint.stall_in = false;
            endpoint.ctr_in = false;
        }
        if matches!(config.direction, EndpointDirection::Out | EndpointDirection::Bidirectional) {
            endpoint.out_enabled = true;
            endpoint.rx_armed = false;
            endpoint.stall_out = false;
            endpoint.ctr_out = false;
        }
    }

    fn interrupt_status(&self) -> Istr {
        let mut istr = Istr::from_bits(self.events);
        if let Some((n, endpoint)) = self.endpoints.iter().enumerate().find(|(_, e)| e.ctr_in || e.ctr_out) {
            istr.set_ctr(true);
            istr.set_ep_id(n as u8);
            istr.set_dir(endpoint.ctr_out);
        }
        istr
    }

    fn clear_interrupts(&mut self, flags: Istr) { self.events &= !flags.events().bits(); }

    fn ack_transfer(&mut self, ep: u8, dir: Direction) {
        let endpoint = &mut self.endpoints[ep as usize];
        match dir {
            Direction::In => endpoint.ctr_in = false,
            Direction::Out => endpoint.ctr_out = false,
        }
    }

    fn is_setup(&self, ep: u8) -> bool { self.endpoints[ep as usize].setup }

    fn write_packet(&mut self, ep: u8, data: &[u8]) { self.endpoints[ep as usize].tx = Some(data.to_vec()); }

    fn read_packet(&mut self, ep: u8, buf: &mut [u8]) -> usize {
        let rx = &self.endpoints[ep as usize].rx;
        let n = rx.len().min(buf.len());
        buf[..n].copy_from_slice(&rx[..n]);
        rx.len()
    }

    fn arm_rx(&mut self, ep: u8) { self.endpoints[ep as usize].rx_armed = true; }

    fn set_stall(&mut self, ep: u8, dir: Direction, stall: bool) {
        let endpoint = &mut self.endpoints[ep as usize];
        match dir {
            Direction::In => {
                endpoint.stall_in = stall;
                endpoint.tx = None;
            }
            Direction::Out => {
                endpoint.stall_out = stall;
                endpoint.rx_armed = false;
            }
        }
    }

    fn is_stalled(&self, ep: u8, dir: Direction) -> bool {
        let endpoint = &self.endpoints[ep as usize];
        match dir {
            Direction::In => endpoint.stall_in,
            Direction::Out => endpoint.stall_out,
        }
    }
}

/// How many NAKs a host transfer tolerates before giving up with `Handshake::Nak`.
const NAK_LIMIT: usize = 64;

/// The host end of the bus. Tracks the address it assigned and the endpoint-0 packet size.
pub struct SimHost {
    address: u8,
    ep0_max_packet: usize,
}

impl Default for SimHost {
    fn default() -> Self { Self::new() }
}

impl SimHost {
    pub fn new() -> Self { SimHost { address: 0, ep0_max_packet: 64 } }

    pub fn address(&self) -> u8 { self.address }

    /// Reset the bus and let the device process it. The device is back at address 0.
    pub fn bus_reset<const N: usize>(&mut self, dev: &mut UsbDevice<'_, SimPeripheral, N>) {
        dev.peripheral_mut().bus_reset();
        dev.interrupt_handler();
        self.address = 0;
        // until the device descriptor says otherwise
        self.ep0_max_packet = 64;
    }

    /// Endpoint-0 packet size to use from now on (normally learned from the device descriptor).
    pub fn set_ep0_max_packet(&mut self, size: usize) { self.ep0_max_packet = size; }

    /// One IN transaction, retrying while the device NAKs.
    pub fn in_packet<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        ep: u8,
    ) -> Result<Vec<u8>, Handshake> {
        for _ in 0..NAK_LIMIT {
            match dev.peripheral_mut().in_token(self.address, ep) {
                Ok(packet) => {
                    dev.interrupt_handler();
                    return Ok(packet);
                }
                Err(Handshake::Nak) => dev.interrupt_handler(),
                Err(e) => return Err(e),
            }
        }
        Err(Handshake::Nak)
    }

    /// One OUT transaction, retrying while the device NAKs.
    pub fn out_packet<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        ep: u8,
        data: &[u8],
    ) -> Result<(), Handshake> {
        for _ in 0..NAK_LIMIT {
            match dev.peripheral_mut().out_token(self.address, ep, data) {
                Handshake::Ack => {
                    dev.interrupt_handler();
                    return Ok(());
                }
                Handshake::Nak => dev.interrupt_handler(),
                e => return Err(e),
            }
        }
        Err(Handshake::Nak)
    }

    fn send_setup<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        req: &SetupRequest,
    ) -> Result<(), Handshake> {
        match dev.peripheral_mut().setup(self.address, req.to_bytes()) {
            Handshake::Ack => {
                dev.interrupt_handler();
                Ok(())
            }
            e => Err(e),
        }
    }

    /// Control read: SETUP, IN data stage until a short packet or wLength, OUT status.
    pub fn control_in<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        req: SetupRequest,
    ) -> Result<Vec<u8>, Handshake> {
        self.send_setup(dev, &req)?;
        let mut data = Vec::new();
        while data.len() < req.length as usize {
            let packet = self.in_packet(dev, 0)?;
            let short = packet.len() < self.ep0_max_packet;
            data.extend_from_slice(&packet);
            if short {
                break;
            }
        }
        self.out_packet(dev, 0, &[])?;
        Ok(data)
    }

    /// Control write: SETUP, optional OUT data stage, IN status.
    pub fn control_out<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        req: SetupRequest,
        data: &[u8],
    ) -> Result<(), Handshake> {
        self.send_setup(dev, &req)?;
        for chunk in data.chunks(self.ep0_max_packet) {
            self.out_packet(dev, 0, chunk)?;
        }
        if !data.is_empty() && data.len() % self.ep0_max_packet == 0 && data.len() < req.length as usize {
            self.out_packet(dev, 0, &[])?;
        }
        let status = self.in_packet(dev, 0)?;
        if status.is_empty() { Ok(()) } else { Err(Handshake::Stall) }
    }

    pub fn get_descriptor<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        kind: u8,
        index: u8,
        length: u16,
    ) -> Result<Vec<u8>, Handshake> {
        let value = ((kind as u16) << 8) | index as u16;
        let req = SetupRequest::new(USB_DIR_IN, USB_REQ_GET_DESCRIPTOR, value, 0, length);
        self.control_in(dev, req)
    }

    /// SET_ADDRESS, then switch to the new address once the status stage is done.
    pub fn set_address<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        address: u8,
    ) -> Result<(), Handshake> {
        let req = SetupRequest::new(0, USB_REQ_SET_ADDRESS, address as u16, 0, 0);
        self.control_out(dev, req, &[])?;
        self.address = address;
        Ok(())
    }

    pub fn set_configuration<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        value: u8,
    ) -> Result<(), Handshake> {
        let req = SetupRequest::new(0, USB_REQ_SET_CONFIGURATION, value as u16, 0, 0);
        self.control_out(dev, req, &[])
    }

    /// The usual enumeration: 8 byte device descriptor, reset, address, full descriptors, configuration 1.
    /// Returns the device and configuration descriptors.
    pub fn enumerate<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        address: u8,
    ) -> Result<(Vec<u8>, Vec<u8>), Handshake> {
        self.bus_reset(dev);
        let head = self.get_descriptor(dev, crate::descriptor::USB_DT_DEVICE, 0, 64)?;
        if head.len() < 8 {
            return Err(Handshake::Timeout);
        }
        self.bus_reset(dev);
        self.set_ep0_max_packet(head[7] as usize);
        self.set_address(dev, address)?;
        let device = self.get_descriptor(dev, crate::descriptor::USB_DT_DEVICE, 0, 18)?;
        let head = self.get_descriptor(dev, crate::descriptor::USB_DT_CONFIG, 0, 9)?;
        let total = u16::from_le_bytes([head[2], head[3]]);
        let config = self.get_descriptor(dev, crate::descriptor::USB_DT_CONFIG, 0, total)?;
        self.set_configuration(dev, 1)?;
        Ok((device, config))
    }

    /// Read a bulk IN transfer of up to `len` bytes; stops early on a short packet.
    pub fn bulk_in<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        ep: u8,
        len: usize,
    ) -> Result<Vec<u8>, Handshake> {
        let mps = dev.peripheral().max_packet_size(ep);
        if mps == 0 {
            return Err(Handshake::Timeout);
        }
        let mut data = Vec::new();
        while data.len() < len {
            let packet = self.in_packet(dev, ep)?;
            let short = packet.len() < mps;
            data.extend_from_slice(&packet);
            if short {
                break;
            }
        }
        Ok(data)
    }

    pub fn bulk_out<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        ep: u8,
        data: &[u8],
    ) -> Result<(), Handshake> {
        let mps = dev.peripheral().max_packet_size(ep);
        if mps == 0 {
            return Err(Handshake::Timeout);
        }
        for chunk in data.chunks(mps) {
            self.out_packet(dev, ep, chunk)?;
        }
        Ok(())
    }

    /// Clear a halt on an endpoint address.
    pub fn clear_halt<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        endpoint_address: u8,
    ) -> Result<(), Handshake> {
        let req = SetupRequest::new(
            USB_RECIP_ENDPOINT,
            USB_REQ_CLEAR_FEATURE,
            USB_ENDPOINT_HALT,
            endpoint_address as u16,
            0,
        );
        self.control_out(dev, req, &[])
    }
}

/// Result of one bulk-only command as seen by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MscResponse {
    pub data: Vec<u8>,
    /// `None` if the CSW never arrived (e.g. the device stalled it)
    pub status: Option<CommandStatusWrapper>,
    /// A stage ended in a STALL and the host cleared it
    pub stalled: bool,
}

/// The mass-storage interface of a device: its interface number and bulk endpoint numbers.
#[derive(Clone, Copy, Debug)]
pub struct MscTarget {
    pub interface: u8,
    pub ep_in: u8,
    pub ep_out: u8,
}

impl SimHost {
    /// Run one command through the bulk-only transport the way a host driver would:
    /// CBW out, data stage in either direction, CSW in, clearing halts where the device
    /// stalled a stage.
    pub fn mass_storage_command<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        target: MscTarget,
        cbw: &CommandBlockWrapper,
        data_out: &[u8],
    ) -> Result<MscResponse, Handshake> {
        self.bulk_out(dev, target.ep_out, &cbw.to_bytes())?;
        let mut response = MscResponse { data: Vec::new(), status: None, stalled: false };
        let expected = cbw.data_transfer_length as usize;

        if expected > 0 {
            if cbw.direction == DataDirection::DeviceToHost {
                match self.bulk_in(dev, target.ep_in, expected) {
                    Ok(data) => response.data = data,
                    Err(Handshake::Stall) => {
                        response.stalled = true;
                        self.clear_halt(dev, 0x80 | target.ep_in)?;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                match self.bulk_out(dev, target.ep_out, &data_out[..expected.min(data_out.len())]) {
                    Ok(()) => {}
                    Err(Handshake::Stall) => {
                        response.stalled = true;
                        self.clear_halt(dev, target.ep_out)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let csw = match self.bulk_in(dev, target.ep_in, CommandStatusWrapper::BYTES) {
            Ok(csw) => csw,
            Err(Handshake::Stall) => {
                // a stalled CSW gets one retry after clearing the halt
                response.stalled = true;
                self.clear_halt(dev, 0x80 | target.ep_in)?;
                self.bulk_in(dev, target.ep_in, CommandStatusWrapper::BYTES)?
            }
            Err(e) => return Err(e),
        };
        response.status = CommandStatusWrapper::parse(&csw);
        Ok(response)
    }

    /// Bulk-Only Mass Storage Reset followed by clearing both halts.
    pub fn reset_recovery<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        target: MscTarget,
    ) -> Result<(), Handshake> {
        let req = SetupRequest::new(
            USB_TYPE_CLASS | USB_RECIP_INTERFACE,
            crate::msc::REQ_BULK_ONLY_RESET,
            0,
            target.interface as u16,
            0,
        );
        self.control_out(dev, req, &[])?;
        self.clear_halt(dev, 0x80 | target.ep_in)?;
        self.clear_halt(dev, target.ep_out)
    }

    pub fn get_max_lun<const N: usize>(
        &mut self,
        dev: &mut UsbDevice<'_, SimPeripheral, N>,
        target: MscTarget,
    ) -> Result<u8, Handshake> {
        let req = SetupRequest::new(
            USB_DIR_IN | USB_TYPE_CLASS | USB_RECIP_INTERFACE,
            crate::msc::REQ_GET_MAX_LUN,
            0,
            target.interface as u16,
            1,
        );
        let data = self.control_in(dev, req)?;
        data.first().copied().ok_or(Handshake::Timeout)
    }
}
