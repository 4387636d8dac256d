//! Endpoint 0: the control transfer state machine and the standard device requests.

use crate::config::{STRING_CONFIGURATION, STRING_MANUFACTURER, STRING_PRODUCT, STRING_SERIAL};
use crate::descriptor::*;
use crate::device::UsbDevice;
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::hw::{Direction, UsbPeripheral};
use crate::interface::ControlAction;
use crate::logging::*;
use crate::setup::*;

/// Largest control transfer data stage, in either direction.
pub const EP0_BUFFER_LEN: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    /// Waiting for a SETUP packet
    Idle,
    /// SETUP decoded, request being dispatched
    SetupReceived,
    /// Reply going out on IN
    DataStageIn,
    /// Request data coming in on OUT
    DataStageOut,
    /// No data stage; our ZLP is the status stage
    StatusStageOnly,
    /// Data stage done, waiting for the status stage to complete
    StatusStage,
}

/// Completion tokens for endpoint 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Ep0Step {
    DataSent,
    StatusSent,
    /// The status ZLP of SET_ADDRESS; the new address is only valid once the host has it
    CommitAddress(u8),
    DataReceived,
    StatusReceived,
}

pub(crate) struct ControlPipe {
    pub(crate) ep0: Endpoint<Ep0Step, EP0_BUFFER_LEN>,
    pub(crate) state: ControlState,
    pub(crate) request: SetupRequest,
    pub(crate) pending_address: Option<u8>,
}

impl ControlPipe {
    pub(crate) fn new(max_packet_size: u8) -> Self {
        ControlPipe {
            ep0: Endpoint::new(EndpointConfig::control(max_packet_size as u16)),
            state: ControlState::Idle,
            request: SetupRequest::default(),
            pending_address: None,
        }
    }

    fn set_state(&mut self, state: ControlState) {
        trace_usb_control!("USB_CONTROL> {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Bus reset: program endpoint 0 and wait for a SETUP.
    pub(crate) fn reset<P: UsbPeripheral>(&mut self, hw: &mut P) {
        self.ep0.configure(hw);
        self.pending_address = None;
        self.finish(hw);
    }

    fn finish<P: UsbPeripheral>(&mut self, hw: &mut P) {
        self.ep0.reset();
        self.set_state(ControlState::Idle);
        hw.arm_rx(0);
    }
}

impl<'a, P: UsbPeripheral, const N: usize> UsbDevice<'a, P, N> {
    /// A transfer completed on endpoint 0.
    pub(crate) fn ep0_event(&mut self, dir: Direction) {
        match dir {
            Direction::Out => {
                // SETUP is only stable until the transfer flag is cleared
                let setup = self.hw.is_setup(0);
                self.hw.ack_transfer(0, Direction::Out);
                if setup {
                    self.setup_received();
                } else {
                    self.ep0_out_complete();
                }
            }
            Direction::In => {
                self.hw.ack_transfer(0, Direction::In);
                self.ep0_in_complete();
            }
        }
    }

    fn setup_received(&mut self) {
        let mut raw = [0u8; SetupRequest::BYTES];
        let count = self.hw.read_packet(0, &mut raw);

        // a new SETUP aborts whatever was in progress and lifts the endpoint 0 halt
        self.control.ep0.reset();
        self.control.ep0.clear_stall(&mut self.hw, Direction::In);
        self.control.ep0.clear_stall(&mut self.hw, Direction::Out);
        self.control.pending_address = None;

        let parsed = if count == SetupRequest::BYTES {
            SetupRequest::parse(&raw)
        } else {
            Err(crate::Error::ShortPacket(count))
        };
        let req = match parsed {
            Ok(req) => req,
            Err(e) => {
                warn!("USB_CONTROL> bad SETUP packet: {:?}", e);
                self.control.request = SetupRequest::new(USB_DIR_IN, 0, 0, 0, 0);
                return self.control_stall();
            }
        };
        trace_usb_control!("USB_CONTROL> SETUP {:x?}", req);
        self.control.request = req;
        self.control.set_state(ControlState::SetupReceived);

        let mut buf = [0u8; EP0_BUFFER_LEN];
        let action = self.dispatch_setup(&req, &mut buf);
        self.control_respond(action, &buf);
    }

    fn dispatch_setup(&mut self, req: &SetupRequest, buf: &mut [u8]) -> ControlAction {
        match (req.recipient(), req.kind()) {
            (Recipient::Device, RequestType::Standard) => self.device_request(req, buf),
            (Recipient::Interface, _) => {
                if !self.configured {
                    return ControlAction::Stall;
                }
                match self.interfaces.iter_mut().find(|i| i.number() == req.interface_number()) {
                    Some(interface) => interface.handle_setup(&mut self.hw, req, buf),
                    None => ControlAction::Stall,
                }
            }
            (Recipient::Endpoint, RequestType::Standard) => self.endpoint_request(req, buf),
            _ => ControlAction::Unhandled,
        }
    }

    fn device_request(&mut self, req: &SetupRequest, buf: &mut [u8]) -> ControlAction {
        match req.request {
            USB_REQ_GET_STATUS => {
                buf[0] = (self.configuration.self_powered as u8) | ((self.remote_wakeup as u8) << 1);
                buf[1] = 0;
                ControlAction::DataIn(2)
            }
            USB_REQ_CLEAR_FEATURE | USB_REQ_SET_FEATURE if req.value == USB_DEVICE_REMOTE_WAKEUP => {
                if !self.configuration.remote_wakeup {
                    return ControlAction::Stall;
                }
                self.remote_wakeup = req.request == USB_REQ_SET_FEATURE;
                debug!("USB_CONTROL> remote wakeup {}", self.remote_wakeup);
                ControlAction::Ack
            }
            USB_REQ_SET_ADDRESS if req.value <= 127 && req.length == 0 => {
                self.control.pending_address = Some(req.value as u8);
                ControlAction::Ack
            }
            USB_REQ_GET_DESCRIPTOR => self.descriptor_request(req, buf),
            USB_REQ_GET_CONFIGURATION => {
                buf[0] = if self.configured { self.configuration.value } else { 0 };
                ControlAction::DataIn(1)
            }
            USB_REQ_SET_CONFIGURATION => self.set_configuration(req.value),
            _ => ControlAction::Unhandled,
        }
    }

    fn descriptor_request(&mut self, req: &SetupRequest, buf: &mut [u8]) -> ControlAction {
        let mut w = DescriptorWriter::new(buf);
        let index = req.descriptor_index();
        let written = match req.descriptor_type() {
            USB_DT_DEVICE => w.device(&self.info, 1),
            USB_DT_CONFIG if index == 0 => w.configuration(&self.configuration, &self.interfaces),
            USB_DT_STRING => {
                let s = match index {
                    0 => return write_reply(w.language_ids()),
                    STRING_MANUFACTURER => self.info.manufacturer,
                    STRING_PRODUCT => self.info.product,
                    STRING_SERIAL => self.info.serial_number,
                    STRING_CONFIGURATION => self.configuration.name,
                    _ => None,
                };
                match s {
                    Some(s) => w.string(s),
                    None => {
                        debug!("USB_CONTROL> no string {}", index);
                        return ControlAction::Stall;
                    }
                }
            }
            USB_DT_HID_REPORT => match self.interfaces.iter().find_map(|i| i.hid_report_descriptor()) {
                Some(report) => w.raw(report),
                None => return ControlAction::Stall,
            },
            // full speed only
            USB_DT_DEVICE_QUALIFIER | USB_DT_OTHER_SPEED_CONFIG => return ControlAction::Stall,
            _ => return ControlAction::Unhandled,
        };
        write_reply(written)
    }

    fn set_configuration(&mut self, value: u16) -> ControlAction {
        if value == 0 {
            debug!("USB_CONTROL> deconfigured");
            self.configured = false;
            for interface in self.interfaces.iter_mut() {
                interface.reset();
            }
            return ControlAction::Ack;
        }
        if value != self.configuration.value as u16 {
            return ControlAction::Stall;
        }
        for interface in self.interfaces.iter_mut() {
            interface.configure(&mut self.hw);
        }
        self.configured = true;
        debug!("USB_CONTROL> configuration {} selected", value);
        ControlAction::Ack
    }

    fn endpoint_request(&mut self, req: &SetupRequest, buf: &mut [u8]) -> ControlAction {
        let address = req.endpoint_address();
        if address & 0x0F == 0 {
            return match req.request {
                USB_REQ_GET_STATUS => {
                    buf[..2].fill(0);
                    ControlAction::DataIn(2)
                }
                USB_REQ_CLEAR_FEATURE | USB_REQ_SET_FEATURE if req.value == USB_ENDPOINT_HALT => ControlAction::Ack,
                _ => ControlAction::Unhandled,
            };
        }
        if !self.configured {
            return ControlAction::Stall;
        }
        match self.owner_of(address) {
            Some(i) => self.interfaces[i].handle_setup(&mut self.hw, req, buf),
            None => ControlAction::Stall,
        }
    }

    fn control_respond(&mut self, action: ControlAction, buf: &[u8]) {
        let req = self.control.request;
        let requested = req.length as usize;
        match action {
            // wLength 0: no data stage, the ZLP is the status stage
            ControlAction::DataIn(_) if req.direction() == Direction::In && requested == 0 => {
                self.control.set_state(ControlState::StatusStageOnly);
                if let Err(e) = self.control.ep0.send_zlp(&mut self.hw, Some(Ep0Step::StatusSent)) {
                    warn!("USB_CONTROL> can't send status: {:?}", e);
                }
            }
            ControlAction::DataIn(len) if req.direction() == Direction::In => {
                let n = len.min(requested).min(EP0_BUFFER_LEN);
                self.control.ep0.buffer_mut()[..n].copy_from_slice(&buf[..n]);
                self.control.set_state(ControlState::DataStageIn);
                // a reply shorter than wLength must end with a short packet
                let sent = self.control.ep0.send_buffered(&mut self.hw, n, n < requested, Some(Ep0Step::DataSent));
                let armed = self.control.ep0.receive(&mut self.hw, 0, Ep0Step::StatusReceived);
                if let Err(e) = sent.and(armed) {
                    warn!("USB_CONTROL> can't start data stage: {:?}", e);
                }
            }
            ControlAction::DataOut
                if req.direction() == Direction::Out && requested > 0 && requested <= EP0_BUFFER_LEN =>
            {
                self.control.set_state(ControlState::DataStageOut);
                if let Err(e) = self.control.ep0.receive(&mut self.hw, requested, Ep0Step::DataReceived) {
                    warn!("USB_CONTROL> can't receive data stage: {:?}", e);
                }
            }
            ControlAction::Ack => {
                let step = match self.control.pending_address.take() {
                    Some(address) => Ep0Step::CommitAddress(address),
                    None => Ep0Step::StatusSent,
                };
                let state = if self.control.state == ControlState::DataStageOut {
                    ControlState::StatusStage
                } else {
                    ControlState::StatusStageOnly
                };
                self.control.set_state(state);
                if let Err(e) = self.control.ep0.send_zlp(&mut self.hw, Some(step)) {
                    warn!("USB_CONTROL> can't send status: {:?}", e);
                }
            }
            _ => self.control_stall(),
        }
    }

    fn control_stall(&mut self) {
        let req = self.control.request;
        debug!("USB_CONTROL> STALL {:x?}", req);
        self.control.ep0.set_stall_in(&mut self.hw);
        if req.direction() == Direction::Out && req.length > 0 {
            self.control.ep0.set_stall_out(&mut self.hw);
        }
        self.control.set_state(ControlState::Idle);
    }

    fn ep0_in_complete(&mut self) {
        match self.control.ep0.tx_complete(&mut self.hw) {
            Some(Ep0Step::DataSent) => self.control.set_state(ControlState::StatusStage),
            Some(Ep0Step::StatusSent) => self.control.finish(&mut self.hw),
            Some(Ep0Step::CommitAddress(address)) => {
                self.hw.set_address(address);
                self.address = address;
                debug!("USB_CONTROL> address {}", address);
                self.control.finish(&mut self.hw);
            }
            _ => {}
        }
    }

    fn ep0_out_complete(&mut self) {
        match self.control.ep0.rx_complete(&mut self.hw) {
            Some(Ep0Step::StatusReceived) => self.control.finish(&mut self.hw),
            Some(Ep0Step::DataReceived) => {
                let req = self.control.request;
                let action = match self.interfaces.iter_mut().find(|i| i.number() == req.interface_number()) {
                    Some(interface) if req.recipient() == Recipient::Interface => {
                        interface.control_out(&req, self.control.ep0.received())
                    }
                    _ => ControlAction::Stall,
                };
                let action = if action == ControlAction::Ack { ControlAction::Ack } else { ControlAction::Stall };
                self.control_respond(action, &[]);
            }
            _ => {}
        }
    }
}

fn write_reply(written: Result<usize, crate::Error>) -> ControlAction {
    match written {
        Ok(n) => ControlAction::DataIn(n),
        Err(e) => {
            warn!("USB_CONTROL> descriptor does not fit: {:?}", e);
            ControlAction::Stall
        }
    }
}
