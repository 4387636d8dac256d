use crate::hw::{Direction, UsbPeripheral};
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointDirection {
    In,
    Out,
    /// Only endpoint 0 (control) uses both directions.
    Bidirectional,
}

/// Transfer type, encoded as in bmAttributes of the endpoint descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub number: u8,
    pub direction: EndpointDirection,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    /// Polling interval in frames; only meaningful for interrupt endpoints.
    pub interval: u8,
}

impl EndpointConfig {
    pub const fn control(max_packet_size: u16) -> Self {
        EndpointConfig {
            number: 0,
            direction: EndpointDirection::Bidirectional,
            transfer_type: TransferType::Control,
            max_packet_size,
            interval: 0,
        }
    }

    pub const fn bulk_in(number: u8, max_packet_size: u16) -> Self {
        EndpointConfig {
            number,
            direction: EndpointDirection::In,
            transfer_type: TransferType::Bulk,
            max_packet_size,
            interval: 0,
        }
    }

    pub const fn bulk_out(number: u8, max_packet_size: u16) -> Self {
        EndpointConfig {
            number,
            direction: EndpointDirection::Out,
            transfer_type: TransferType::Bulk,
            max_packet_size,
            interval: 0,
        }
    }

    pub const fn interrupt_in(number: u8, max_packet_size: u16, interval: u8) -> Self {
        EndpointConfig {
            number,
            direction: EndpointDirection::In,
            transfer_type: TransferType::Interrupt,
            max_packet_size,
            interval,
        }
    }

    /// bEndpointAddress: the number with bit 7 set for IN endpoints.
    pub const fn address(&self) -> u8 {
        match self.direction {
            EndpointDirection::In => 0x80 | (self.number & 0x0F),
            _ => self.number & 0x0F,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct TxProgress {
    len: usize,
    sent: usize,
    /// size of the packet currently loaded in the peripheral
    chunk: usize,
    /// terminate with a zero length packet if the data ends on a packet boundary
    zlp: bool,
    busy: bool,
    /// loaded while the direction was halted; goes out when the halt clears
    deferred: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct RxProgress {
    expected: usize,
    received: usize,
    overrun: bool,
    busy: bool,
    deferred: bool,
}

/// One logical endpoint with its own transfer buffer.
///
/// `C` is the owner's completion token. A transfer started with a token hands it back
/// from [`Endpoint::tx_complete`] / [`Endpoint::rx_complete`] once the last packet has
/// moved, which is how the owner chains the next step without closures or a scheduler.
/// Each direction holds at most one transfer, so completions come back in the order
/// the transfers were started.
pub struct Endpoint<C, const N: usize> {
    config: EndpointConfig,
    buffer: [u8; N],
    tx: TxProgress,
    rx: RxProgress,
    tx_done: Option<C>,
    rx_done: Option<C>,
}

impl<C: Copy, const N: usize> Endpoint<C, N> {
    pub const fn new(config: EndpointConfig) -> Self {
        Endpoint {
            config,
            buffer: [0; N],
            tx: TxProgress { len: 0, sent: 0, chunk: 0, zlp: false, busy: false, deferred: false },
            rx: RxProgress { expected: 0, received: 0, overrun: false, busy: false, deferred: false },
            tx_done: None,
            rx_done: None,
        }
    }

    pub fn config(&self) -> &EndpointConfig { &self.config }

    pub fn number(&self) -> u8 { self.config.number }

    pub fn max_packet_size(&self) -> usize { self.config.max_packet_size as usize }

    pub fn capacity(&self) -> usize { N }

    /// Staging area for [`Endpoint::send_buffered`]. Must not be touched while a transfer is in flight.
    pub fn buffer_mut(&mut self) -> &mut [u8] { &mut self.buffer }

    /// Program the peripheral for this endpoint and drop any transfer state.
    pub fn configure<P: UsbPeripheral>(&mut self, hw: &mut P) {
        hw.configure_endpoint(&self.config);
        self.reset();
    }

    /// Forget in-flight transfers and their tokens. Does not touch the hardware.
    pub fn reset(&mut self) {
        self.tx = TxProgress::default();
        self.rx = RxProgress::default();
        self.tx_done = None;
        self.rx_done = None;
    }

    pub fn is_ready(&self) -> bool {
        match self.config.direction {
            EndpointDirection::In => !self.tx.busy,
            EndpointDirection::Out => !self.rx.busy,
            EndpointDirection::Bidirectional => !self.tx.busy && !self.rx.busy,
        }
    }

    /// Copy `data` into the endpoint buffer and start an IN transfer.
    pub fn send<P: UsbPeripheral>(&mut self, hw: &mut P, data: &[u8], on_complete: Option<C>) -> Result<(), Error> {
        if data.len() > N {
            return Err(Error::BufferTooSmall);
        }
        if self.tx.busy {
            return Err(Error::Busy);
        }
        self.buffer[..data.len()].copy_from_slice(data);
        self.send_buffered(hw, data.len(), false, on_complete)
    }

    pub fn send_zlp<P: UsbPeripheral>(&mut self, hw: &mut P, on_complete: Option<C>) -> Result<(), Error> {
        self.send_buffered(hw, 0, false, on_complete)
    }

    /// Start an IN transfer of the first `len` bytes already staged in [`Endpoint::buffer_mut`].
    ///
    /// With `zlp` set, a transfer whose length is a non-zero multiple of the max packet
    /// size is terminated with a zero length packet so the host sees a short transfer.
    pub fn send_buffered<P: UsbPeripheral>(
        &mut self,
        hw: &mut P,
        len: usize,
        zlp: bool,
        on_complete: Option<C>,
    ) -> Result<(), Error> {
        if len > N {
            return Err(Error::BufferTooSmall);
        }
        if self.tx.busy {
            return Err(Error::Busy);
        }
        self.tx = TxProgress { len, sent: 0, chunk: 0, zlp, busy: true, deferred: false };
        self.tx_done = on_complete;
        if hw.is_stalled(self.config.number, Direction::In) {
            self.tx.deferred = true;
        } else {
            self.load_packet(hw);
        }
        Ok(())
    }

    fn load_packet<P: UsbPeripheral>(&mut self, hw: &mut P) {
        let start = self.tx.sent;
        let chunk = (self.tx.len - start).min(self.max_packet_size());
        self.tx.chunk = chunk;
        hw.write_packet(self.config.number, &self.buffer[start..start + chunk]);
    }

    /// Account for an IN packet the host just took. Returns the token once the whole transfer is out.
    pub fn tx_complete<P: UsbPeripheral>(&mut self, hw: &mut P) -> Option<C> {
        if !self.tx.busy || self.tx.deferred {
            return None;
        }
        self.tx.sent += self.tx.chunk;
        if self.tx.sent < self.tx.len {
            self.load_packet(hw);
            return None;
        }
        if self.tx.zlp && self.tx.chunk == self.max_packet_size() {
            self.tx.zlp = false;
            self.tx.chunk = 0;
            hw.write_packet(self.config.number, &[]);
            return None;
        }
        self.tx.busy = false;
        self.tx_done.take()
    }

    /// Arm an OUT transfer of up to `len` bytes. Completes when `len` bytes arrived or a short packet ends it.
    pub fn receive<P: UsbPeripheral>(&mut self, hw: &mut P, len: usize, on_complete: C) -> Result<(), Error> {
        if len > N {
            return Err(Error::BufferTooSmall);
        }
        if self.rx.busy {
            return Err(Error::Busy);
        }
        self.rx = RxProgress { expected: len, received: 0, overrun: false, busy: true, deferred: false };
        self.rx_done = Some(on_complete);
        if hw.is_stalled(self.config.number, Direction::Out) {
            self.rx.deferred = true;
        } else {
            hw.arm_rx(self.config.number);
        }
        Ok(())
    }

    /// Pull the packet that just arrived into the buffer. Returns the token once the transfer is complete.
    pub fn rx_complete<P: UsbPeripheral>(&mut self, hw: &mut P) -> Option<C> {
        if !self.rx.busy || self.rx.deferred {
            return None;
        }
        let mps = self.max_packet_size();
        let start = self.rx.received;
        let end = (start + mps).min(N);
        let count = hw.read_packet(self.config.number, &mut self.buffer[start..end]);
        let room = self.rx.expected - start;
        if count > room {
            self.rx.overrun = true;
        }
        self.rx.received += count.min(room).min(end - start);
        if count < mps || self.rx.received >= self.rx.expected {
            self.rx.busy = false;
            return self.rx_done.take();
        }
        hw.arm_rx(self.config.number);
        None
    }

    /// Bytes gathered by the last completed OUT transfer.
    pub fn received(&self) -> &[u8] { &self.buffer[..self.rx.received] }

    /// The host sent more than the armed length; the excess was dropped.
    pub fn rx_overrun(&self) -> bool { self.rx.overrun }

    pub fn set_stall_in<P: UsbPeripheral>(&mut self, hw: &mut P) { self.set_stall(hw, Direction::In) }

    pub fn set_stall_out<P: UsbPeripheral>(&mut self, hw: &mut P) { self.set_stall(hw, Direction::Out) }

    /// Halt one direction. A transfer in flight in that direction is dropped.
    pub fn set_stall<P: UsbPeripheral>(&mut self, hw: &mut P, dir: Direction) {
        hw.set_stall(self.config.number, dir, true);
        match dir {
            Direction::In => {
                self.tx = TxProgress::default();
                self.tx_done = None;
            }
            Direction::Out => {
                self.rx = RxProgress::default();
                self.rx_done = None;
            }
        }
    }

    /// Lift a halt and reset the data toggle. The hardware direction is left NAKing, so a
    /// transfer that was deferred or in flight is handed to the hardware again.
    pub fn clear_stall<P: UsbPeripheral>(&mut self, hw: &mut P, dir: Direction) {
        hw.set_stall(self.config.number, dir, false);
        match dir {
            Direction::In if self.tx.busy => {
                self.tx.deferred = false;
                self.load_packet(hw);
            }
            Direction::Out if self.rx.busy => {
                self.rx.deferred = false;
                hw.arm_rx(self.config.number);
            }
            _ => {}
        }
    }

    pub fn is_stalled<P: UsbPeripheral>(&self, hw: &P, dir: Direction) -> bool {
        hw.is_stalled(self.config.number, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPeripheral;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Step {
        Done,
    }

    fn bulk_in(hw: &mut SimPeripheral) -> Endpoint<Step, 256> {
        let mut ep = Endpoint::new(EndpointConfig::bulk_in(1, 64));
        hw.enable();
        ep.configure(hw);
        ep
    }

    #[test]
    fn test_address_encoding() {
        assert_eq!(EndpointConfig::bulk_in(1, 64).address(), 0x81);
        assert_eq!(EndpointConfig::bulk_out(2, 64).address(), 0x02);
        assert_eq!(EndpointConfig::control(64).address(), 0x00);
    }

    #[test]
    fn test_send_splits_into_packets() {
        let mut hw = SimPeripheral::new();
        let mut ep = bulk_in(&mut hw);
        let data: Vec<u8> = (0..150u32).map(|i| i as u8).collect();
        ep.send(&mut hw, &data, Some(Step::Done)).unwrap();
        assert!(!ep.is_ready());

        let mut got = Vec::new();
        let mut token = None;
        while token.is_none() {
            let packet = hw.in_token(0, 1).unwrap();
            assert!(packet.len() <= 64);
            got.extend_from_slice(&packet);
            hw.ack_transfer(1, Direction::In);
            token = ep.tx_complete(&mut hw);
        }
        assert_eq!(token, Some(Step::Done));
        assert_eq!(got, data);
        assert!(ep.is_ready());
    }

    #[test]
    fn test_zlp_only_on_packet_boundary() {
        let mut hw = SimPeripheral::new();
        let mut ep = bulk_in(&mut hw);
        ep.send_buffered(&mut hw, 64, true, Some(Step::Done)).unwrap();
        assert_eq!(hw.in_token(0, 1).unwrap().len(), 64);
        hw.ack_transfer(1, Direction::In);
        assert_eq!(ep.tx_complete(&mut hw), None);
        assert_eq!(hw.in_token(0, 1).unwrap().len(), 0);
        hw.ack_transfer(1, Direction::In);
        assert_eq!(ep.tx_complete(&mut hw), Some(Step::Done));

        ep.send_buffered(&mut hw, 10, true, Some(Step::Done)).unwrap();
        assert_eq!(hw.in_token(0, 1).unwrap().len(), 10);
        hw.ack_transfer(1, Direction::In);
        assert_eq!(ep.tx_complete(&mut hw), Some(Step::Done));
    }

    #[test]
    fn test_send_while_busy_is_refused() {
        let mut hw = SimPeripheral::new();
        let mut ep = bulk_in(&mut hw);
        ep.send(&mut hw, &[1, 2, 3], None).unwrap();
        assert_eq!(ep.send(&mut hw, &[4], None), Err(Error::Busy));
        assert_eq!(ep.send(&mut hw, &[0u8; 300], None), Err(Error::BufferTooSmall));
    }

    #[test]
    fn test_send_while_halted_waits_for_clear() {
        let mut hw = SimPeripheral::new();
        let mut ep = bulk_in(&mut hw);
        ep.set_stall_in(&mut hw);
        ep.send(&mut hw, &[9, 9], Some(Step::Done)).unwrap();
        assert_eq!(hw.in_token(0, 1), Err(crate::sim::Handshake::Stall));
        ep.clear_stall(&mut hw, Direction::In);
        assert_eq!(hw.in_token(0, 1).unwrap(), vec![9, 9]);
    }

    #[test]
    fn test_receive_accumulates_until_short_packet() {
        let mut hw = SimPeripheral::new();
        hw.enable();
        let mut ep: Endpoint<Step, 64> = Endpoint::new(EndpointConfig::bulk_out(2, 8));
        ep.configure(&mut hw);
        ep.receive(&mut hw, 31, Step::Done).unwrap();
        let mut token = None;
        let chunks: [&[u8]; 4] = [&[1; 8], &[2; 8], &[3; 8], &[4; 7]];
        for chunk in chunks {
            assert_eq!(hw.out_token(0, 2, chunk), crate::sim::Handshake::Ack);
            hw.ack_transfer(2, Direction::Out);
            token = ep.rx_complete(&mut hw);
        }
        assert_eq!(token, Some(Step::Done));
        assert_eq!(ep.received().len(), 31);
        assert_eq!(ep.received()[30], 4);
        assert!(!ep.rx_overrun());
    }

    #[test]
    fn test_receive_flags_overrun() {
        let mut hw = SimPeripheral::new();
        hw.enable();
        let mut ep: Endpoint<Step, 64> = Endpoint::new(EndpointConfig::bulk_out(2, 64));
        ep.configure(&mut hw);
        ep.receive(&mut hw, 31, Step::Done).unwrap();
        hw.out_token(0, 2, &[0u8; 40]);
        hw.ack_transfer(2, Direction::Out);
        assert_eq!(ep.rx_complete(&mut hw), Some(Step::Done));
        assert_eq!(ep.received().len(), 31);
        assert!(ep.rx_overrun());
    }
}
