use crate::config::{ConfigurationInfo, DeviceInfo};
use crate::control::{ControlPipe, ControlState};
use crate::hw::{Direction, Istr, UsbPeripheral};
use crate::interface::Interface;
use crate::logging::*;

const NUM_ENDPOINTS: usize = 16;

/// A USB device: one peripheral, one configuration and the `N` interfaces it carries.
///
/// Nothing runs outside of [`UsbDevice::interrupt_handler`]; call it from the USB
/// interrupt (or poll it) and the device enumerates and serves its interfaces.
pub struct UsbDevice<'a, P: UsbPeripheral, const N: usize> {
    pub(crate) hw: P,
    pub(crate) info: DeviceInfo,
    pub(crate) configuration: ConfigurationInfo,
    pub(crate) interfaces: [Interface<'a>; N],
    pub(crate) control: ControlPipe,
    /// interface index owning each endpoint, by number then direction (IN, OUT)
    endpoint_map: [[Option<u8>; 2]; NUM_ENDPOINTS],
    pub(crate) address: u8,
    pub(crate) configured: bool,
    pub(crate) remote_wakeup: bool,
    hardware_errors: u32,
}

fn slot(dir: Direction) -> usize {
    match dir {
        Direction::In => 0,
        Direction::Out => 1,
    }
}

impl<'a, P: UsbPeripheral, const N: usize> UsbDevice<'a, P, N> {
    /// Panics if two interfaces claim the same endpoint, an interface claims endpoint 0,
    /// or two interfaces share an interface number.
    pub fn new(hw: P, info: DeviceInfo, configuration: ConfigurationInfo, interfaces: [Interface<'a>; N]) -> Self {
        assert!(matches!(info.max_packet_size_0, 8 | 16 | 32 | 64));
        assert!(N <= u8::MAX as usize);
        let mut endpoint_map = [[None; 2]; NUM_ENDPOINTS];
        for (index, interface) in interfaces.iter().enumerate() {
            assert!(
                interfaces[..index].iter().all(|other| other.number() != interface.number()),
                "duplicate interface number {}",
                interface.number()
            );
            for config in interface.endpoint_configs().iter().flatten() {
                let number = config.number as usize;
                assert!(number != 0 && number < NUM_ENDPOINTS, "bad endpoint number {}", number);
                let entry = &mut endpoint_map[number][slot(crate::interface::direction_of(config.address()))];
                assert!(entry.is_none(), "endpoint {:#x} claimed twice", config.address());
                *entry = Some(index as u8);
            }
        }
        UsbDevice {
            hw,
            info,
            configuration,
            interfaces,
            control: ControlPipe::new(info.max_packet_size_0),
            endpoint_map,
            address: 0,
            configured: false,
            remote_wakeup: false,
            hardware_errors: 0,
        }
    }

    /// Attach to the bus and start listening on endpoint 0.
    pub fn enable(&mut self) {
        self.hw.enable();
        self.reset();
    }

    /// Back to the Default state: address 0, unconfigured, every interface idle.
    pub fn reset(&mut self) {
        self.hw.reset();
        self.address = 0;
        self.configured = false;
        self.remote_wakeup = false;
        for interface in self.interfaces.iter_mut() {
            interface.reset();
        }
        self.control.reset(&mut self.hw);
    }

    pub fn is_configured(&self) -> bool { self.configured }

    pub fn address(&self) -> u8 { self.address }

    pub fn control_state(&self) -> ControlState { self.control.state }

    /// Host enabled remote wakeup with SET_FEATURE.
    pub fn remote_wakeup_enabled(&self) -> bool { self.remote_wakeup }

    /// ERR and PMAOVR events seen since the device was built.
    pub fn hardware_errors(&self) -> u32 { self.hardware_errors }

    pub fn interface(&self, index: usize) -> Option<&Interface<'a>> { self.interfaces.get(index) }

    pub fn interface_mut(&mut self, index: usize) -> Option<&mut Interface<'a>> { self.interfaces.get_mut(index) }

    /// Run `f` with an interface and the peripheral, e.g. to queue data on a class endpoint.
    pub fn with_interface<R>(&mut self, index: usize, f: impl FnOnce(&mut Interface<'a>, &mut P) -> R) -> Option<R> {
        let interface = self.interfaces.get_mut(index)?;
        Some(f(interface, &mut self.hw))
    }

    pub fn peripheral(&self) -> &P { &self.hw }

    pub fn peripheral_mut(&mut self) -> &mut P { &mut self.hw }

    /// Service everything the peripheral has flagged. Bus events are handled first, then
    /// every pending endpoint completion, lowest endpoint first as the hardware reports them.
    pub fn interrupt_handler(&mut self) {
        let status = self.hw.interrupt_status();
        if status.reset() {
            self.hw.clear_interrupts(status.events());
            debug!("USB> bus reset");
            self.reset();
            return;
        }
        let mut handled = Istr::from_bits(0);
        if status.err() || status.pmaovr() {
            self.hardware_errors = self.hardware_errors.wrapping_add(1);
            warn!("USB> hardware error: {:?}", status);
            handled.set_err(status.err());
            handled.set_pmaovr(status.pmaovr());
        }
        if status.susp() {
            debug!("USB> suspend");
            handled.set_susp(true);
        }
        if status.wkup() {
            debug!("USB> wakeup");
            handled.set_wkup(true);
        }
        handled.set_sof(status.sof());
        handled.set_esof(status.esof());
        if handled.bits() != 0 {
            self.hw.clear_interrupts(handled);
        }

        loop {
            let status = self.hw.interrupt_status();
            if !status.ctr() {
                break;
            }
            let ep = status.ep_id();
            let dir = status.direction();
            if ep == 0 {
                self.ep0_event(dir);
                continue;
            }
            self.hw.ack_transfer(ep, dir);
            match self.endpoint_map[ep as usize][slot(dir)] {
                Some(index) if self.configured => {
                    self.interfaces[index as usize].endpoint_event(&mut self.hw, ep, dir)
                }
                _ => debug!("USB> stray transfer on ep {} {:?}", ep, dir),
            }
        }
    }

    /// Index of the interface owning an endpoint address, if any.
    pub(crate) fn owner_of(&self, address: u8) -> Option<usize> {
        let number = (address & 0x0F) as usize;
        self.endpoint_map[number][slot(crate::interface::direction_of(address))].map(|i| i as usize)
    }
}
