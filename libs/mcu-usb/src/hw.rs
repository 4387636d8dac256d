use bitfield::bitfield;

use crate::endpoint::EndpointConfig;

/// Data direction as seen from the host: `In` is device-to-host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

bitfield! {
    /// Interrupt status, in the layout of the ISTR register of the full-speed device block.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Istr(u32);
    impl Debug;
    pub u8, ep_id, set_ep_id: 3, 0;
    // 0: an IN transfer completed, 1: an OUT or SETUP transfer completed
    pub dir, set_dir: 4;
    pub esof, set_esof: 8;
    pub sof, set_sof: 9;
    pub reset, set_reset: 10;
    pub susp, set_susp: 11;
    pub wkup, set_wkup: 12;
    pub err, set_err: 13;
    pub pmaovr, set_pmaovr: 14;
    pub ctr, set_ctr: 15;
}

impl Istr {
    pub const fn from_bits(bits: u32) -> Self { Istr(bits) }

    pub fn bits(&self) -> u32 { self.0 }

    pub fn direction(&self) -> Direction { if self.dir() { Direction::Out } else { Direction::In } }

    /// Status flags that software acknowledges by clearing them; CTR is cleared per endpoint.
    pub fn events(&self) -> Istr { Istr(self.0 & 0x7F00) }
}

/// Register boundary of the USB device peripheral.
///
/// Everything above this trait is hardware independent. An implementation owns the
/// packet memory and the endpoint registers; endpoint numbers are 0-15.
pub trait UsbPeripheral {
    /// Power up the transceiver, enable interrupts and attach to the bus.
    fn enable(&mut self);
    /// Return every endpoint to its post-bus-reset state and answer on address 0.
    fn reset(&mut self);
    fn set_address(&mut self, address: u8);
    /// Allocate packet memory for the endpoint and program its type. Both directions start out NAKing.
    fn configure_endpoint(&mut self, config: &EndpointConfig);

    fn interrupt_status(&self) -> Istr;
    /// Clear the non-transfer flags set in `flags`.
    fn clear_interrupts(&mut self, flags: Istr);
    /// Clear the correct-transfer flag of one endpoint direction.
    fn ack_transfer(&mut self, ep: u8, dir: Direction);
    /// Whether the last OUT-direction transaction on `ep` was a SETUP.
    fn is_setup(&self, ep: u8) -> bool;

    /// Load one packet (at most the endpoint's max packet size) and mark it valid for the next IN token.
    fn write_packet(&mut self, ep: u8, data: &[u8]);
    /// Copy the last received packet into `buf`. Returns the packet length, which may exceed `buf.len()`.
    fn read_packet(&mut self, ep: u8, buf: &mut [u8]) -> usize;
    /// Accept the next OUT packet.
    fn arm_rx(&mut self, ep: u8);

    /// Halt or resume one direction. Resuming resets the data toggle and leaves the direction NAKing.
    fn set_stall(&mut self, ep: u8, dir: Direction, stall: bool);
    fn is_stalled(&self, ep: u8, dir: Direction) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_istr_fields() {
        let istr = Istr(0x8000 | 0x0010 | 0x3);
        assert!(istr.ctr());
        assert_eq!(istr.ep_id(), 3);
        assert_eq!(istr.direction(), Direction::Out);
        assert!(!istr.reset());

        let mut istr = Istr(0);
        istr.set_reset(true);
        istr.set_ep_id(5);
        assert_eq!(istr.0, 0x0405);
        assert_eq!(istr.direction(), Direction::In);
    }

    #[test]
    fn test_events_mask_excludes_transfer_bits() {
        let istr = Istr(0xFFFF);
        let events = istr.events();
        assert!(!events.ctr());
        assert_eq!(events.ep_id(), 0);
        assert!(events.reset() && events.err() && events.pmaovr() && events.susp());
    }
}
