use crate::class::{CdcComm, CdcData, HidInterface};
use crate::descriptor::DescriptorWriter;
use crate::endpoint::EndpointConfig;
use crate::hw::{Direction, UsbPeripheral};
use crate::msc::ScsiBulkTransport;
use crate::setup::*;
use crate::Error;

/// What an interface wants the control engine to do with the request it was handed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlAction {
    /// Reply with this many bytes from the buffer passed to the handler.
    DataIn(usize),
    /// Receive wLength bytes, then call `control_out` with them.
    DataOut,
    /// Acknowledge with a zero length status stage.
    Ack,
    Stall,
    /// Not a request this interface knows; the engine stalls it.
    Unhandled,
}

/// The closed set of functions a configuration can carry.
pub enum Interface<'a> {
    CdcComm(CdcComm),
    CdcData(CdcData),
    Hid(HidInterface),
    Msc(ScsiBulkTransport<'a>),
}

impl<'a> Interface<'a> {
    pub fn number(&self) -> u8 {
        match self {
            Interface::CdcComm(i) => i.number(),
            Interface::CdcData(i) => i.number(),
            Interface::Hid(i) => i.number(),
            Interface::Msc(i) => i.number(),
        }
    }

    /// Endpoints other than endpoint 0 owned by this interface.
    pub fn endpoint_configs(&self) -> [Option<EndpointConfig>; 2] {
        match self {
            Interface::CdcComm(i) => [Some(i.notify_endpoint()), None],
            Interface::CdcData(i) => {
                let (ep_in, ep_out) = i.endpoints();
                [Some(ep_in), Some(ep_out)]
            }
            Interface::Hid(i) => [Some(i.endpoint()), None],
            Interface::Msc(i) => {
                let (ep_in, ep_out) = i.endpoints();
                [Some(ep_in), Some(ep_out)]
            }
        }
    }

    pub fn owns_endpoint(&self, address: u8) -> bool {
        self.endpoint_configs().iter().flatten().any(|config| config.address() == address)
    }

    pub fn fill_descriptor(&self, w: &mut DescriptorWriter<'_>) -> Result<(), Error> {
        match self {
            Interface::CdcComm(i) => i.fill_descriptor(w),
            Interface::CdcData(i) => i.fill_descriptor(w),
            Interface::Hid(i) => i.fill_descriptor(w),
            Interface::Msc(i) => i.fill_descriptor(w),
        }
    }

    /// Bus reset or de-configuration: drop all transfer state.
    pub fn reset(&mut self) {
        match self {
            Interface::CdcComm(i) => i.reset(),
            Interface::CdcData(i) => i.reset(),
            Interface::Hid(i) => i.reset(),
            Interface::Msc(i) => i.reset(),
        }
    }

    /// SetConfiguration selected us: program the endpoints and start listening.
    pub fn configure<P: UsbPeripheral>(&mut self, hw: &mut P) {
        match self {
            Interface::CdcComm(i) => i.configure(hw),
            Interface::CdcData(i) => i.configure(hw),
            Interface::Hid(i) => i.configure(hw),
            Interface::Msc(i) => i.configure(hw),
        }
    }

    /// Handle a SETUP addressed to this interface or to one of its endpoints. Replies are
    /// written to `buf`, which is the endpoint-0 transfer buffer.
    pub fn handle_setup<P: UsbPeripheral>(&mut self, hw: &mut P, req: &SetupRequest, buf: &mut [u8]) -> ControlAction {
        match (req.recipient(), req.kind()) {
            (Recipient::Endpoint, RequestType::Standard) => self.standard_endpoint_request(hw, req, buf),
            (Recipient::Interface, RequestType::Standard) => match req.request {
                USB_REQ_GET_STATUS => {
                    buf[..2].fill(0);
                    ControlAction::DataIn(2)
                }
                USB_REQ_GET_INTERFACE => {
                    // no alternate settings anywhere
                    buf[0] = 0;
                    ControlAction::DataIn(1)
                }
                USB_REQ_SET_INTERFACE if req.value == 0 => {
                    self.configure(hw);
                    ControlAction::Ack
                }
                USB_REQ_SET_INTERFACE => ControlAction::Stall,
                _ => match self {
                    Interface::Hid(i) => i.standard_request(req, buf),
                    _ => ControlAction::Unhandled,
                },
            },
            (Recipient::Interface, RequestType::Class) => match self {
                Interface::CdcComm(i) => i.class_request(req, buf),
                Interface::CdcData(_) => ControlAction::Unhandled,
                Interface::Hid(i) => i.class_request(req, buf),
                Interface::Msc(i) => i.class_request(hw, req, buf),
            },
            _ => ControlAction::Unhandled,
        }
    }

    /// Data stage of a host-to-device request that `handle_setup` accepted with `DataOut`.
    pub fn control_out(&mut self, req: &SetupRequest, data: &[u8]) -> ControlAction {
        match self {
            Interface::CdcComm(i) => i.control_out(req, data),
            Interface::Hid(i) => i.control_out(req, data),
            _ => ControlAction::Stall,
        }
    }

    fn standard_endpoint_request<P: UsbPeripheral>(
        &mut self,
        hw: &mut P,
        req: &SetupRequest,
        buf: &mut [u8],
    ) -> ControlAction {
        let address = req.endpoint_address();
        if !self.owns_endpoint(address) {
            return ControlAction::Stall;
        }
        match req.request {
            USB_REQ_GET_STATUS => {
                buf[0] = hw.is_stalled(address & 0x0F, direction_of(address)) as u8;
                buf[1] = 0;
                ControlAction::DataIn(2)
            }
            USB_REQ_CLEAR_FEATURE if req.value == USB_ENDPOINT_HALT => {
                self.set_halt(hw, address, false);
                ControlAction::Ack
            }
            USB_REQ_SET_FEATURE if req.value == USB_ENDPOINT_HALT => {
                self.set_halt(hw, address, true);
                ControlAction::Ack
            }
            _ => ControlAction::Unhandled,
        }
    }

    /// SetFeature/ClearFeature(ENDPOINT_HALT) on one of our endpoints.
    pub fn set_halt<P: UsbPeripheral>(&mut self, hw: &mut P, address: u8, halt: bool) {
        match self {
            Interface::CdcComm(i) => i.set_halt(hw, address, halt),
            Interface::CdcData(i) => i.set_halt(hw, address, halt),
            Interface::Hid(i) => i.set_halt(hw, address, halt),
            Interface::Msc(i) => i.set_halt(hw, address, halt),
        }
    }

    /// A transfer completed on one of our endpoints.
    pub fn endpoint_event<P: UsbPeripheral>(&mut self, hw: &mut P, ep: u8, dir: Direction) {
        match self {
            Interface::CdcComm(i) => i.endpoint_event(hw, dir),
            Interface::CdcData(i) => i.endpoint_event(hw, dir),
            Interface::Hid(i) => i.endpoint_event(hw, dir),
            Interface::Msc(i) => i.endpoint_event(hw, ep, dir),
        }
    }

    pub fn hid_report_descriptor(&self) -> Option<&'static [u8]> {
        match self {
            Interface::Hid(i) => Some(i.report_descriptor()),
            _ => None,
        }
    }
}

pub(crate) fn direction_of(address: u8) -> Direction {
    if address & 0x80 != 0 { Direction::In } else { Direction::Out }
}
