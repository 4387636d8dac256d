//! [`UsbPeripheral`] for the STM32 full-speed device block (F0/L0/L4/G4 style, 1x16-bit
//! packet memory access).
//!
//! Endpoint registers have three kinds of bits: plain read/write, toggle-on-write-1
//! (STAT and DTOG) and clear-on-write-0 (CTR). Every write goes through
//! [`epr_value`] so untouched fields survive the read-modify-write.

use vcell::VolatileCell;

use crate::endpoint::{EndpointConfig, EndpointDirection};
use crate::hw::{Direction, Istr, UsbPeripheral};
use crate::logging::*;

#[repr(C)]
pub struct RegisterBlock {
    pub epr: [VolatileCell<u32>; 8],
    _reserved: [VolatileCell<u32>; 8],
    pub cntr: VolatileCell<u32>,
    pub istr: VolatileCell<u32>,
    pub fnr: VolatileCell<u32>,
    pub daddr: VolatileCell<u32>,
    pub btable: VolatileCell<u32>,
    pub lpmcsr: VolatileCell<u32>,
    pub bcdr: VolatileCell<u32>,
}

const EA_MASK: u32 = 0x000F;
const STAT_TX_MASK: u32 = 0x0030;
const DTOG_TX: u32 = 0x0040;
const CTR_TX: u32 = 0x0080;
const EP_KIND: u32 = 0x0100;
const EP_TYPE_MASK: u32 = 0x0600;
const SETUP: u32 = 0x0800;
const STAT_RX_MASK: u32 = 0x3000;
const DTOG_RX: u32 = 0x4000;
const CTR_RX: u32 = 0x8000;
/// bits that read back what was written
const EPREG_MASK: u32 = CTR_RX | SETUP | EP_TYPE_MASK | EP_KIND | CTR_TX | EA_MASK;

const STAT_DISABLED: u32 = 0;
const STAT_STALL: u32 = 1;
const STAT_NAK: u32 = 2;
const STAT_VALID: u32 = 3;

const CNTR_FRES: u32 = 1 << 0;
const CNTR_RESETM: u32 = 1 << 10;
const CNTR_SUSPM: u32 = 1 << 11;
const CNTR_WKUPM: u32 = 1 << 12;
const CNTR_ERRM: u32 = 1 << 13;
const CNTR_PMAOVRM: u32 = 1 << 14;
const CNTR_CTRM: u32 = 1 << 15;

const DADDR_EF: u32 = 0x80;
const BCDR_DPPU: u32 = 1 << 15;

const NUM_EPR: usize = 8;
/// 8 buffer descriptor entries of 4 half-words each
const BTABLE_BYTES: usize = NUM_EPR * 8;

/// Value to write to an endpoint register so that STAT_TX / STAT_RX end up in the
/// requested states. `None` leaves a field alone; both CTR flags are left set.
pub(crate) fn epr_value(current: u32, stat_tx: Option<u32>, stat_rx: Option<u32>) -> u32 {
    let mut value = (current & EPREG_MASK) | CTR_RX | CTR_TX;
    if let Some(stat) = stat_tx {
        value |= (current ^ (stat << 4)) & STAT_TX_MASK;
    }
    if let Some(stat) = stat_rx {
        value |= (current ^ (stat << 12)) & STAT_RX_MASK;
    }
    value
}

/// COUNTn_RX allocation field for a receive buffer of at least `size` bytes.
pub(crate) const fn rx_count_field(size: u16) -> u16 {
    if size <= 62 {
        ((size + 1) / 2) << 10
    } else {
        0x8000 | (((size + 31) / 32 - 1) << 10)
    }
}

/// Bytes actually reserved for a receive buffer of `size`.
const fn rx_buffer_size(size: u16) -> u16 {
    if size <= 62 {
        (size + 1) & !1
    } else {
        (size + 31) & !31
    }
}

fn ep_type_bits(config: &EndpointConfig) -> u32 {
    use crate::endpoint::TransferType::*;
    let kind = match config.transfer_type {
        Bulk => 0,
        Control => 1,
        Isochronous => 2,
        Interrupt => 3,
    };
    kind << 9
}

pub struct Stm32Usb {
    regs: &'static RegisterBlock,
    pma: &'static [VolatileCell<u16>],
    next_free: usize,
}

impl Stm32Usb {
    pub fn new(regs: &'static RegisterBlock, pma: &'static [VolatileCell<u16>]) -> Self {
        Stm32Usb { regs, pma, next_free: BTABLE_BYTES }
    }

    /// # Safety
    /// `regs` must be the address of the USB register block and `pma` that of its packet
    /// memory, `pma_bytes` long, both mapped for the lifetime of the program and not
    /// used by anything else.
    pub unsafe fn from_addresses(regs: usize, pma: usize, pma_bytes: usize) -> Self {
        let regs = &*(regs as *const RegisterBlock);
        let pma = core::slice::from_raw_parts(pma as *const VolatileCell<u16>, pma_bytes / 2);
        Self::new(regs, pma)
    }

    fn epr(&self, ep: u8) -> &VolatileCell<u32> { &self.regs.epr[ep as usize] }

    fn update(&self, ep: u8, stat_tx: Option<u32>, stat_rx: Option<u32>) {
        let epr = self.epr(ep);
        epr.set(epr_value(epr.get(), stat_tx, stat_rx));
    }

    /// Buffer descriptor half-word: 0 ADDR_TX, 1 COUNT_TX, 2 ADDR_RX, 3 COUNT_RX.
    fn descriptor(&self, ep: u8, field: usize) -> &VolatileCell<u16> {
        &self.pma[ep as usize * 4 + field]
    }

    fn allocate(&mut self, size: usize) -> Option<u16> {
        let start = self.next_free;
        if start + size > self.pma.len() * 2 {
            return None;
        }
        self.next_free += size;
        Some(start as u16)
    }
}

impl UsbPeripheral for Stm32Usb {
    fn enable(&mut self) {
        // power up with the core held in reset, then release it
        self.regs.cntr.set(CNTR_FRES);
        self.regs.cntr.set(0);
        self.regs.istr.set(0);
        self.regs.cntr.set(CNTR_CTRM | CNTR_RESETM | CNTR_ERRM | CNTR_PMAOVRM | CNTR_SUSPM | CNTR_WKUPM);
        self.regs.bcdr.set(self.regs.bcdr.get() | BCDR_DPPU);
        debug!("USB> attached, cntr {:#06x}", self.regs.cntr.get());
    }

    fn reset(&mut self) {
        self.regs.btable.set(0);
        self.next_free = BTABLE_BYTES;
        for ep in 0..NUM_EPR as u8 {
            let epr = self.epr(ep);
            let current = epr.get();
            let value = epr_value(current, Some(STAT_DISABLED), Some(STAT_DISABLED)) & !(EP_TYPE_MASK | EA_MASK);
            epr.set(value | (current & (DTOG_TX | DTOG_RX)));
        }
        self.regs.daddr.set(DADDR_EF);
    }

    fn set_address(&mut self, address: u8) { self.regs.daddr.set(DADDR_EF | (address as u32 & 0x7F)); }

    fn configure_endpoint(&mut self, config: &EndpointConfig) {
        let ep = config.number;
        assert!((ep as usize) < NUM_EPR, "endpoint {} has no register, the peripheral has {}", ep, NUM_EPR);
        let mps = config.max_packet_size;
        let tx = matches!(config.direction, EndpointDirection::In | EndpointDirection::Bidirectional);
        let rx = matches!(config.direction, EndpointDirection::Out | EndpointDirection::Bidirectional);

        if tx {
            let Some(addr) = self.allocate(((mps + 1) & !1) as usize) else {
                warn!("USB> packet memory exhausted configuring ep {} IN", ep);
                return;
            };
            self.descriptor(ep, 0).set(addr);
            self.descriptor(ep, 1).set(0);
        }
        if rx {
            let Some(addr) = self.allocate(rx_buffer_size(mps) as usize) else {
                warn!("USB> packet memory exhausted configuring ep {} OUT", ep);
                return;
            };
            self.descriptor(ep, 2).set(addr);
            self.descriptor(ep, 3).set(rx_count_field(mps));
        }

        let epr = self.epr(ep);
        let current = epr.get();
        let mut value = (current & EPREG_MASK & !(EP_TYPE_MASK | EA_MASK | EP_KIND))
            | ep_type_bits(config)
            | (ep as u32 & EA_MASK)
            | CTR_RX
            | CTR_TX;
        if tx {
            value |= (current ^ (STAT_NAK << 4)) & STAT_TX_MASK;
            value |= current & DTOG_TX;
        }
        if rx {
            value |= (current ^ (STAT_NAK << 12)) & STAT_RX_MASK;
            value |= current & DTOG_RX;
        }
        epr.set(value);
    }

    fn interrupt_status(&self) -> Istr { Istr::from_bits(self.regs.istr.get()) }

    fn clear_interrupts(&mut self, flags: Istr) { self.regs.istr.set(!flags.events().bits() & 0xFFFF); }

    fn ack_transfer(&mut self, ep: u8, dir: Direction) {
        let epr = self.epr(ep);
        let keep = (epr.get() & EPREG_MASK) | CTR_RX | CTR_TX;
        let clear = match dir {
            Direction::In => CTR_TX,
            Direction::Out => CTR_RX,
        };
        epr.set(keep & !clear);
    }

    fn is_setup(&self, ep: u8) -> bool { self.epr(ep).get() & SETUP != 0 }

    fn write_packet(&mut self, ep: u8, data: &[u8]) {
        let base = self.descriptor(ep, 0).get() as usize / 2;
        for (i, pair) in data.chunks(2).enumerate() {
            let word = pair[0] as u16 | (pair.get(1).copied().unwrap_or(0) as u16) << 8;
            self.pma[base + i].set(word);
        }
        self.descriptor(ep, 1).set(data.len() as u16);
        self.update(ep, Some(STAT_VALID), None);
    }

    fn read_packet(&mut self, ep: u8, buf: &mut [u8]) -> usize {
        let base = self.descriptor(ep, 2).get() as usize / 2;
        let count = (self.descriptor(ep, 3).get() & 0x03FF) as usize;
        let n = count.min(buf.len());
        for i in 0..n {
            let word = self.pma[base + i / 2].get();
            buf[i] = if i % 2 == 0 { word as u8 } else { (word >> 8) as u8 };
        }
        count
    }

    fn arm_rx(&mut self, ep: u8) { self.update(ep, None, Some(STAT_VALID)); }

    fn set_stall(&mut self, ep: u8, dir: Direction, stall: bool) {
        let stat = if stall { STAT_STALL } else { STAT_NAK };
        let epr = self.epr(ep);
        let current = epr.get();
        let value = match dir {
            Direction::In => epr_value(current, Some(stat), None) | if stall { 0 } else { current & DTOG_TX },
            Direction::Out => epr_value(current, None, Some(stat)) | if stall { 0 } else { current & DTOG_RX },
        };
        epr.set(value);
    }

    fn is_stalled(&self, ep: u8, dir: Direction) -> bool {
        let current = self.epr(ep).get();
        match dir {
            Direction::In => (current & STAT_TX_MASK) >> 4 == STAT_STALL,
            Direction::Out => (current & STAT_RX_MASK) >> 12 == STAT_STALL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake() -> Stm32Usb {
        let regs: &'static RegisterBlock = Box::leak(Box::new(RegisterBlock {
            epr: [(); 8].map(|_| VolatileCell::new(0)),
            _reserved: [(); 8].map(|_| VolatileCell::new(0)),
            cntr: VolatileCell::new(0),
            istr: VolatileCell::new(0),
            fnr: VolatileCell::new(0),
            daddr: VolatileCell::new(0),
            btable: VolatileCell::new(0),
            lpmcsr: VolatileCell::new(0),
            bcdr: VolatileCell::new(0),
        }));
        let pma: std::vec::Vec<VolatileCell<u16>> = (0..512).map(|_| VolatileCell::new(0)).collect();
        Stm32Usb::new(regs, Box::leak(pma.into_boxed_slice()))
    }

    #[test]
    fn test_register_offsets() {
        assert_eq!(core::mem::size_of::<RegisterBlock>(), 0x5C);
    }

    #[test]
    fn test_epr_toggle_writes() {
        // STAT_TX NAK -> VALID toggles only bit 4; CTR flags are written as 1
        let current = CTR_RX | (STAT_NAK << 4) | (STAT_NAK << 12) | 0x0201;
        let value = epr_value(current, Some(STAT_VALID), None);
        assert_eq!(value & STAT_TX_MASK, 0x0010);
        assert_eq!(value & STAT_RX_MASK, 0);
        assert_eq!(value & (CTR_RX | CTR_TX), CTR_RX | CTR_TX);
        assert_eq!(value & (EP_TYPE_MASK | EA_MASK), 0x0201);
        // STALL -> NAK on the receive side toggles both STAT_RX bits
        let current = STAT_STALL << 12;
        assert_eq!(epr_value(current, None, Some(STAT_NAK)) & STAT_RX_MASK, 0x3000);
    }

    #[test]
    fn test_rx_count_encoding() {
        assert_eq!(rx_count_field(8), 0x1000);
        assert_eq!(rx_count_field(62), 31 << 10);
        assert_eq!(rx_count_field(64), 0x8400);
        assert_eq!(rx_count_field(512), 0xBC00);
        assert_eq!(rx_buffer_size(7), 8);
        assert_eq!(rx_buffer_size(64), 64);
    }

    #[test]
    fn test_packet_memory_layout() {
        let mut usb = fake();
        usb.reset();
        usb.configure_endpoint(&EndpointConfig::control(64));
        usb.configure_endpoint(&EndpointConfig::bulk_in(1, 64));
        assert_eq!(usb.descriptor(0, 0).get(), 64);
        assert_eq!(usb.descriptor(0, 2).get(), 128);
        assert_eq!(usb.descriptor(0, 3).get(), 0x8400);
        assert_eq!(usb.descriptor(1, 0).get(), 192);
        assert_eq!(usb.regs.epr[1].get() & (EP_TYPE_MASK | EA_MASK), 0x0001);
        assert_eq!(usb.regs.epr[0].get() & EP_TYPE_MASK, 0x0200);

        usb.write_packet(1, &[1, 2, 3]);
        assert_eq!(usb.pma[96].get(), 0x0201);
        assert_eq!(usb.pma[97].get(), 0x0003);
        assert_eq!(usb.descriptor(1, 1).get(), 3);

        // pretend the host sent 5 bytes to ep0
        usb.pma[64].set(0x2211);
        usb.pma[65].set(0x4433);
        usb.pma[66].set(0x0055);
        usb.descriptor(0, 3).set(0x8400 | 5);
        let mut buf = [0u8; 4];
        assert_eq!(usb.read_packet(0, &mut buf), 5);
        assert_eq!(buf, [0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_address_and_interrupt_clear() {
        let mut usb = fake();
        usb.set_address(0x2A);
        assert_eq!(usb.regs.daddr.get(), 0xAA);
        let mut flags = Istr::from_bits(0);
        flags.set_reset(true);
        usb.clear_interrupts(flags);
        assert_eq!(usb.regs.istr.get(), 0xFBFF);
    }

    #[test]
    #[should_panic(expected = "has no register")]
    fn test_endpoint_beyond_register_file_rejected() {
        let mut usb = fake();
        usb.reset();
        // endpoint 9 would otherwise alias endpoint 1
        usb.configure_endpoint(&EndpointConfig::bulk_in(9, 64));
    }
}
