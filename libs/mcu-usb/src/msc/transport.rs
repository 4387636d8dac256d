use heapless::Vec;
use num_traits::FromPrimitive;

use super::cbw::{CommandBlockWrapper, CommandStatus, CommandStatusWrapper, DataDirection};
use super::lun::{BlockDeviceError, Lun, MAX_BLOCK_SIZE};
use super::scsi::{self, OpCode, Rw10, Sense};
use super::{InterfaceProtocol, InterfaceSubclass, REQ_BULK_ONLY_RESET, REQ_GET_MAX_LUN, USB_CLASS_MASS_STORAGE};
use crate::config::InquiryInfo;
use crate::descriptor::DescriptorWriter;
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::hw::{Direction, UsbPeripheral};
use crate::interface::{direction_of, ControlAction};
use crate::logging::*;
use crate::setup::SetupRequest;
use crate::Error;

pub const MAX_LUNS: usize = 4;

const BULK_BUFFER_LEN: usize = MAX_BLOCK_SIZE;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum BotState {
    /// Waiting for a command block wrapper on bulk OUT. This is the only state in
    /// which OUT data is parsed as a CBW
    AwaitingCbw,
    /// WRITE (10) data stage. OUT packets go to the LUN until the announced
    /// length is consumed, then the CSW follows
    ReceivingCommandData,
    /// Data IN stage and/or CSW in flight. Moves to AwaitingCbw once the CSW
    /// has been taken by the host
    AwaitingResult,
}

/// Completion tokens carried by the two bulk endpoints.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum BotStep {
    Cbw,
    DataOut,
    DataIn,
    /// one block of a READ (10) went out and more follow
    ReadBlocks,
    Csw,
}

/// Per-command bookkeeping. Reset for every CBW.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct BulkTransferState {
    /// bytes that arrived for the last CBW
    pub cbw_received: usize,
    pub lun: usize,
    pub lba: u32,
    pub blocks_remaining: u32,
    /// WRITE (10) bytes still expected from the host
    pub bytes_remaining: usize,
    /// size of the OUT transfer currently armed for write data
    pub chunk: usize,
    /// data stage bytes moved so far, in either direction
    pub transferred: u32,
    /// OUT data belongs to the current command, not to the next CBW
    pub need_receive: bool,
}

/// # USB Bulk Only Transport with the SCSI transparent command set
///
/// ## Functionality overview
/// 1. Reading CBWs, also when the bulk packet size is smaller than a CBW
/// 1. Running the SCSI command against the addressed LUN
/// 1. Streaming READ (10) block by block and feeding WRITE (10) data to the LUN in buffer sized chunks
/// 1. Terminating short IN data stages with a short packet or ZLP
/// 1. Sending the CSW with the tag echoed and the correct data residue
/// 1. Stalling bulk endpoints for the error cases of the thirteen host/device cases
/// 1. Responding to class specific control requests (bulk only reset and get max lun)
///
/// A CBW that fails validation leaves the transport desynchronized: both bulk
/// endpoints stay halted, ClearFeature is ignored, and only a Bulk-Only Mass
/// Storage Reset followed by ClearFeature on both endpoints brings it back.
pub struct ScsiBulkTransport<'a> {
    number: u8,
    ep_in: Endpoint<BotStep, BULK_BUFFER_LEN>,
    ep_out: Endpoint<BotStep, BULK_BUFFER_LEN>,
    inquiry: InquiryInfo,
    luns: Vec<Lun<'a>, MAX_LUNS>,

    /// Are we waiting, receiving or finishing a command
    state: BotState,
    transfer: BulkTransferState,

    /// The most recent CBW. Not valid in AwaitingCbw
    command_block_wrapper: CommandBlockWrapper,

    /// The current or previous command's CSW
    command_status_wrapper: CommandStatusWrapper,

    /// Reported by REQUEST SENSE, cleared by the next command
    sense: Sense,

    /// An invalid CBW arrived; waiting for reset recovery
    desynced: bool,
}

impl<'a> ScsiBulkTransport<'a> {
    /// LUNs must be numbered 0, 1, ... in array order. Every LUN's block size must be a
    /// multiple of `max_packet_size`, since each block goes out as its own IN transfer and
    /// only the last packet of a data stage may be short.
    pub fn new<const L: usize>(
        number: u8,
        ep_in: u8,
        ep_out: u8,
        max_packet_size: u16,
        inquiry: InquiryInfo,
        luns: [Lun<'a>; L],
    ) -> Self {
        assert!(L >= 1 && L <= MAX_LUNS);
        assert!(max_packet_size as usize <= BULK_BUFFER_LEN);
        for (i, lun) in luns.iter().enumerate() {
            assert_eq!(lun.number() as usize, i);
            assert!(
                max_packet_size > 0 && lun.block_size() % max_packet_size as usize == 0,
                "LUN {} block size {} is not a multiple of the {} byte bulk packet",
                i,
                lun.block_size(),
                max_packet_size
            );
        }
        // L <= MAX_LUNS, so extend can't overflow
        let mut list = Vec::new();
        list.extend(luns);
        ScsiBulkTransport {
            number,
            ep_in: Endpoint::new(EndpointConfig::bulk_in(ep_in, max_packet_size)),
            ep_out: Endpoint::new(EndpointConfig::bulk_out(ep_out, max_packet_size)),
            inquiry,
            luns: list,
            state: BotState::AwaitingCbw,
            transfer: BulkTransferState::default(),
            command_block_wrapper: CommandBlockWrapper::default(),
            command_status_wrapper: CommandStatusWrapper::default(),
            sense: Sense::NONE,
            desynced: false,
        }
    }

    pub fn number(&self) -> u8 { self.number }

    pub fn endpoints(&self) -> (EndpointConfig, EndpointConfig) { (*self.ep_in.config(), *self.ep_out.config()) }

    pub fn state(&self) -> BotState { self.state }

    pub fn transfer_state(&self) -> &BulkTransferState { &self.transfer }

    pub fn sense(&self) -> Sense { self.sense }

    pub fn is_desynced(&self) -> bool { self.desynced }

    pub fn lun_count(&self) -> usize { self.luns.len() }

    pub fn lun(&self, index: usize) -> Option<&Lun<'a>> { self.luns.get(index) }

    pub fn lun_mut(&mut self, index: usize) -> Option<&mut Lun<'a>> { self.luns.get_mut(index) }

    /// The CSW of the command in progress, or of the last one.
    pub fn last_status(&self) -> &CommandStatusWrapper { &self.command_status_wrapper }

    pub(crate) fn fill_descriptor(&self, w: &mut DescriptorWriter<'_>) -> Result<(), Error> {
        w.interface(
            self.number,
            2,
            USB_CLASS_MASS_STORAGE,
            InterfaceSubclass::ScsiTransparentCommandSet as u8,
            InterfaceProtocol::BulkOnlyTransport as u8,
        )?;
        w.endpoint(self.ep_in.config())?;
        w.endpoint(self.ep_out.config())?;
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        trace_usb_control!("USB_CONTROL> msc{} reset", self.number);
        self.ep_in.reset();
        self.ep_out.reset();
        self.transfer = BulkTransferState::default();
        self.command_status_wrapper = CommandStatusWrapper::default();
        self.sense = Sense::NONE;
        self.desynced = false;
        self.change_state(BotState::AwaitingCbw);
    }

    pub(crate) fn configure<P: UsbPeripheral>(&mut self, hw: &mut P) {
        self.reset();
        self.ep_in.configure(hw);
        self.ep_out.configure(hw);
        self.arm_cbw(hw);
    }

    pub(crate) fn class_request<P: UsbPeripheral>(
        &mut self,
        hw: &mut P,
        req: &SetupRequest,
        buf: &mut [u8],
    ) -> ControlAction {
        match req.request {
            REQ_GET_MAX_LUN if req.value == 0 && req.length >= 1 => {
                buf[0] = (self.luns.len() - 1) as u8;
                trace_usb_control!("USB_CONTROL> Get max lun. Response: {}", buf[0]);
                ControlAction::DataIn(1)
            }
            REQ_BULK_ONLY_RESET if req.value == 0 && req.length == 0 => {
                self.bulk_only_reset(hw);
                ControlAction::Ack
            }
            REQ_GET_MAX_LUN | REQ_BULK_ONLY_RESET => ControlAction::Stall,
            _ => ControlAction::Unhandled,
        }
    }

    /// Drop the command in progress and wait for a new CBW. Endpoint halts are
    /// left alone; the host clears them next.
    fn bulk_only_reset<P: UsbPeripheral>(&mut self, hw: &mut P) {
        trace_usb_control!("USB_CONTROL> Bulk only mass storage reset");
        self.ep_in.reset();
        self.ep_out.reset();
        self.transfer = BulkTransferState::default();
        self.desynced = false;
        self.change_state(BotState::AwaitingCbw);
        self.arm_cbw(hw);
    }

    pub(crate) fn set_halt<P: UsbPeripheral>(&mut self, hw: &mut P, address: u8, halt: bool) {
        let dir = direction_of(address);
        let ep = if dir == Direction::In { &mut self.ep_in } else { &mut self.ep_out };
        if halt {
            ep.set_stall(hw, dir);
            return;
        }
        if self.desynced {
            debug!("msc{}: halt on {:#04x} kept until reset recovery", self.number, address);
            return;
        }
        ep.clear_stall(hw, dir);
        if dir == Direction::Out && self.state == BotState::AwaitingCbw && self.ep_out.is_ready() {
            self.arm_cbw(hw);
        }
    }

    pub(crate) fn endpoint_event<P: UsbPeripheral>(&mut self, hw: &mut P, _ep: u8, dir: Direction) {
        match dir {
            Direction::Out => match self.ep_out.rx_complete(hw) {
                Some(BotStep::Cbw) => self.cbw_received(hw),
                Some(BotStep::DataOut) => self.data_out_received(hw),
                _ => {}
            },
            Direction::In => match self.ep_in.tx_complete(hw) {
                Some(BotStep::DataIn) => self.command_done(hw),
                Some(BotStep::ReadBlocks) => self.read_next_block(hw),
                Some(BotStep::Csw) => {
                    self.change_state(BotState::AwaitingCbw);
                    self.arm_cbw(hw);
                }
                _ => {}
            },
        }
    }

    fn change_state(&mut self, new_state: BotState) {
        trace_bot_states!("STATE> {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
    }

    fn arm_cbw<P: UsbPeripheral>(&mut self, hw: &mut P) {
        self.transfer.need_receive = false;
        self.transfer.cbw_received = 0;
        // one byte of slack so an oversized CBW shows up as a length error
        if let Err(e) = self.ep_out.receive(hw, CommandBlockWrapper::BYTES + 1, BotStep::Cbw) {
            warn!("msc{}: can't arm CBW reception: {:?}", self.number, e);
        }
    }

    fn cbw_received<P: UsbPeripheral>(&mut self, hw: &mut P) {
        self.transfer.cbw_received = self.ep_out.received().len();
        trace_bot_bytes!("BYTES> Read {} bytes for command", self.transfer.cbw_received);
        match CommandBlockWrapper::parse(self.ep_out.received()) {
            Ok(cbw) => self.handle_command(hw, cbw),
            Err(e) => {
                warn!("msc{}: invalid CBW ({:?}), stalling until reset recovery", self.number, e);
                self.desynced = true;
                self.ep_in.set_stall_in(hw);
                self.ep_out.set_stall_out(hw);
            }
        }
    }

    // Updates the command status wrapper in readiness to execute the provided command.
    // Copies the tag across, sets data_residue to the requested bytes and sets the
    // status to OK.
    fn prepare_for_command(&mut self, cbw: &CommandBlockWrapper) {
        self.command_status_wrapper.tag = cbw.tag;
        self.command_status_wrapper.data_residue = cbw.data_transfer_length;
        self.command_status_wrapper.status = CommandStatus::CommandOk;
        self.transfer = BulkTransferState { cbw_received: self.transfer.cbw_received, ..Default::default() };
    }

    fn handle_command<P: UsbPeripheral>(&mut self, hw: &mut P, cbw: CommandBlockWrapper) {
        trace_bot_headers!("HEADER> CommandBlockWrapper: {:X?}", cbw);
        self.prepare_for_command(&cbw);
        self.command_block_wrapper = cbw;
        self.change_state(BotState::AwaitingResult);

        let op = OpCode::from_u8(cbw.opcode());
        if op != Some(OpCode::RequestSense) {
            self.sense = Sense::NONE;
        }
        let lun = cbw.lun as usize;
        if lun >= self.luns.len() {
            return self.fail_command(hw, Sense::LUN_NOT_SUPPORTED);
        }
        self.transfer.lun = lun;
        trace_scsi_command!("SCSI> lun {} {:?} {:02x?}", lun, op, cbw.command());

        let cb = cbw.data;
        match op {
            Some(OpCode::TestUnitReady) => {
                if self.luns[lun].is_ready() {
                    self.command_done(hw)
                } else {
                    self.fail_command(hw, Sense::MEDIUM_NOT_PRESENT)
                }
            }
            Some(OpCode::StartStopUnit) | Some(OpCode::PreventAllowMediumRemoval) => self.command_done(hw),
            Some(OpCode::RequestSense) => {
                let len = scsi::request_sense(&self.sense, self.ep_in.buffer_mut());
                self.sense = Sense::NONE;
                self.respond(hw, len, scsi::allocation_length6(&cb))
            }
            Some(OpCode::Inquiry) => {
                let evpd = cb[1] & 0x01 != 0;
                let alloc = scsi::allocation_length_inquiry(&cb);
                if evpd {
                    match scsi::vpd_page(cb[2], &self.luns[lun], self.ep_in.buffer_mut()) {
                        Some(len) => self.respond(hw, len, alloc),
                        None => self.fail_command(hw, Sense::INVALID_FIELD_IN_CDB),
                    }
                } else if cb[2] != 0 {
                    self.fail_command(hw, Sense::INVALID_FIELD_IN_CDB)
                } else {
                    let len = scsi::inquiry(&self.inquiry, self.ep_in.buffer_mut());
                    self.respond(hw, len, alloc)
                }
            }
            Some(OpCode::ModeSense6) => {
                let len = scsi::mode_sense6(self.luns[lun].is_read_only(), self.ep_in.buffer_mut());
                self.respond(hw, len, scsi::allocation_length6(&cb))
            }
            Some(OpCode::ModeSense10) => {
                let len = scsi::mode_sense10(self.luns[lun].is_read_only(), self.ep_in.buffer_mut());
                self.respond(hw, len, scsi::allocation_length10(&cb))
            }
            Some(OpCode::ReadCapacity10) => {
                if !self.luns[lun].is_ready() {
                    return self.fail_command(hw, Sense::MEDIUM_NOT_PRESENT);
                }
                let len = scsi::read_capacity(&self.luns[lun], self.ep_in.buffer_mut());
                self.respond(hw, len, usize::MAX)
            }
            Some(OpCode::ReadFormatCapacities) => {
                let len = scsi::read_format_capacities(&self.luns[lun], self.ep_in.buffer_mut());
                self.respond(hw, len, scsi::allocation_length10(&cb))
            }
            Some(OpCode::Read10) => self.start_read(hw, Rw10::parse(&cb)),
            Some(OpCode::Write10) => self.start_write(hw, Rw10::parse(&cb)),
            Some(OpCode::Verify10) => {
                let rw = Rw10::parse(&cb);
                if self.luns[lun].contains(rw.lba, rw.count) {
                    self.command_done(hw)
                } else {
                    self.fail_command(hw, Sense::LBA_OUT_OF_RANGE)
                }
            }
            Some(OpCode::SynchronizeCache10) => match self.luns[lun].storage().flush() {
                Ok(()) => self.command_done(hw),
                Err(e) => self.fail_command(hw, e.into()),
            },
            None => {
                debug!("msc{}: unsupported opcode {:#04x}", self.number, cbw.opcode());
                self.fail_command(hw, Sense::INVALID_COMMAND)
            }
        }
    }

    /// Send the first `len` bytes of the IN buffer as the data stage, cut down to the
    /// allocation length and to what the host asked for.
    fn respond<P: UsbPeripheral>(&mut self, hw: &mut P, len: usize, allocation_length: usize) {
        let dl = self.command_block_wrapper.data_transfer_length as usize;
        if dl > 0 && self.command_block_wrapper.direction == DataDirection::HostToDevice {
            return self.phase_error(hw);
        }
        let n = len.min(allocation_length).min(dl);
        if n == 0 {
            return self.command_done(hw);
        }
        self.transfer.transferred = n as u32;
        trace_bot_bytes!("BYTES> Sending {} of {} bytes. Host asked for {}", n, len, dl);
        if let Err(e) = self.ep_in.send_buffered(hw, n, n < dl, Some(BotStep::DataIn)) {
            warn!("msc{}: can't send data: {:?}", self.number, e);
        }
    }

    /// Checks shared by READ (10) and WRITE (10). Returns the byte count when the command may go ahead.
    fn check_rw10<P: UsbPeripheral>(&mut self, hw: &mut P, rw: Rw10, direction: DataDirection) -> Option<u64> {
        let cbw = self.command_block_wrapper;
        let lun = &self.luns[self.transfer.lun];
        let bytes = rw.count as u64 * lun.block_size() as u64;
        let (ready, read_only, in_range) = (lun.is_ready(), lun.is_read_only(), lun.contains(rw.lba, rw.count));
        let dl = cbw.data_transfer_length as u64;
        if (dl > 0 && cbw.direction != direction) || bytes > dl {
            self.phase_error(hw);
            return None;
        }
        let sense = if !ready {
            Sense::MEDIUM_NOT_PRESENT
        } else if direction == DataDirection::HostToDevice && read_only {
            Sense::WRITE_PROTECTED
        } else if !in_range {
            Sense::LBA_OUT_OF_RANGE
        } else {
            return Some(bytes);
        };
        self.fail_command(hw, sense);
        None
    }

    fn start_read<P: UsbPeripheral>(&mut self, hw: &mut P, rw: Rw10) {
        let Some(bytes) = self.check_rw10(hw, rw, DataDirection::DeviceToHost) else {
            return;
        };
        trace_scsi_command!("SCSI> Read10 lba {} count {} ({} bytes)", rw.lba, rw.count, bytes);
        if rw.count == 0 {
            return self.command_done(hw);
        }
        self.transfer.lba = rw.lba;
        self.transfer.blocks_remaining = rw.count;
        self.read_next_block(hw);
    }

    fn read_next_block<P: UsbPeripheral>(&mut self, hw: &mut P) {
        let lun = self.transfer.lun;
        let block_size = self.luns[lun].block_size();
        let lba = self.transfer.lba;
        let result = self.luns[lun].storage().read_block(lba, &mut self.ep_in.buffer_mut()[..block_size]);
        if let Err(e) = result {
            warn!("msc{}: read of lba {} failed: {:?}", self.number, lba, e);
            let sense = match e {
                BlockDeviceError::HardwareError | BlockDeviceError::WriteError | BlockDeviceError::EraseError => {
                    Sense::UNRECOVERED_READ_ERROR
                }
                e => e.into(),
            };
            return self.fail_command(hw, sense);
        }
        self.transfer.lba += 1;
        self.transfer.blocks_remaining -= 1;
        self.transfer.transferred += block_size as u32;
        let last = self.transfer.blocks_remaining == 0;
        let zlp = last && self.transfer.transferred < self.command_block_wrapper.data_transfer_length;
        let step = if last { BotStep::DataIn } else { BotStep::ReadBlocks };
        trace_bot_bytes!("BYTES> Sending lba {}, {} blocks left", lba, self.transfer.blocks_remaining);
        if let Err(e) = self.ep_in.send_buffered(hw, block_size, zlp, Some(step)) {
            warn!("msc{}: can't send block: {:?}", self.number, e);
        }
    }

    fn start_write<P: UsbPeripheral>(&mut self, hw: &mut P, rw: Rw10) {
        let Some(bytes) = self.check_rw10(hw, rw, DataDirection::HostToDevice) else {
            return;
        };
        trace_scsi_command!("SCSI> Write10 lba {} count {} ({} bytes)", rw.lba, rw.count, bytes);
        if rw.count == 0 {
            return self.command_done(hw);
        }
        if let Err(e) = self.luns[self.transfer.lun].storage().begin_write(rw.lba, rw.count) {
            return self.fail_command(hw, e.into());
        }
        self.transfer.lba = rw.lba;
        self.transfer.blocks_remaining = rw.count;
        self.transfer.bytes_remaining = bytes as usize;
        self.transfer.need_receive = true;
        self.change_state(BotState::ReceivingCommandData);
        self.arm_data_out(hw);
    }

    fn arm_data_out<P: UsbPeripheral>(&mut self, hw: &mut P) {
        let chunk = self.transfer.bytes_remaining.min(BULK_BUFFER_LEN);
        self.transfer.chunk = chunk;
        if let Err(e) = self.ep_out.receive(hw, chunk, BotStep::DataOut) {
            warn!("msc{}: can't arm data reception: {:?}", self.number, e);
        }
    }

    fn data_out_received<P: UsbPeripheral>(&mut self, hw: &mut P) {
        let n = self.ep_out.received().len();
        let result = self.luns[self.transfer.lun].storage().write_data(self.ep_out.received());
        self.transfer.transferred += n as u32;
        self.transfer.bytes_remaining = self.transfer.bytes_remaining.saturating_sub(n);
        trace_bot_bytes!("BYTES> Read {} bytes. {} to go", n, self.transfer.bytes_remaining);
        if let Err(e) = result {
            warn!("msc{}: write failed: {:?}", self.number, e);
            let sense = match e {
                BlockDeviceError::HardwareError => Sense::WRITE_FAULT,
                e => e.into(),
            };
            return self.fail_command(hw, sense);
        }
        if self.transfer.bytes_remaining == 0 {
            self.transfer.need_receive = false;
            self.change_state(BotState::AwaitingResult);
            self.command_done(hw);
        } else if n < self.transfer.chunk {
            // the host ended its data stage before the blocks it announced
            self.phase_error(hw);
        } else {
            self.arm_data_out(hw);
        }
    }

    /// Successful end of a command: halt the data pipe if the host still expects to move
    /// data on it, then send the CSW.
    fn command_done<P: UsbPeripheral>(&mut self, hw: &mut P) {
        let cbw = self.command_block_wrapper;
        let transferred = self.transfer.transferred;
        if transferred < cbw.data_transfer_length
            && (cbw.direction == DataDirection::HostToDevice || transferred == 0)
        {
            self.halt_data_stage(hw);
        }
        self.send_csw(hw);
    }

    fn fail_command<P: UsbPeripheral>(&mut self, hw: &mut P, sense: Sense) {
        debug!("msc{}: command {:#04x} failed: {:?}", self.number, self.command_block_wrapper.opcode(), sense);
        self.sense = sense;
        self.command_status_wrapper.status = CommandStatus::CommandError;
        self.halt_data_stage(hw);
        self.send_csw(hw);
    }

    fn phase_error<P: UsbPeripheral>(&mut self, hw: &mut P) {
        warn!("msc{}: phase error on command {:#04x}", self.number, self.command_block_wrapper.opcode());
        self.command_status_wrapper.status = CommandStatus::PhaseError;
        self.halt_data_stage(hw);
        self.send_csw(hw);
    }

    /// Stall the pipe the host is moving data stage bytes on, if it expects more.
    fn halt_data_stage<P: UsbPeripheral>(&mut self, hw: &mut P) {
        self.transfer.need_receive = false;
        if self.transfer.transferred >= self.command_block_wrapper.data_transfer_length {
            return;
        }
        match self.command_block_wrapper.direction {
            DataDirection::DeviceToHost => self.ep_in.set_stall_in(hw),
            DataDirection::HostToDevice => self.ep_out.set_stall_out(hw),
        }
    }

    /// Queue the CSW. Held back by the endpoint while bulk IN is halted.
    fn send_csw<P: UsbPeripheral>(&mut self, hw: &mut P) {
        let dl = self.command_block_wrapper.data_transfer_length;
        self.command_status_wrapper.data_residue = dl.saturating_sub(self.transfer.transferred);
        trace_bot_headers!("HEADER> CommandStatusWrapper: {:X?}", self.command_status_wrapper);
        self.change_state(BotState::AwaitingResult);
        let bytes = self.command_status_wrapper.to_bytes();
        if let Err(e) = self.ep_in.send(hw, &bytes, Some(BotStep::Csw)) {
            warn!("msc{}: can't send CSW: {:?}", self.number, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msc::RamDisk;
    use crate::setup::{USB_DIR_IN, USB_RECIP_INTERFACE, USB_TYPE_CLASS};
    use crate::sim::{Handshake, SimPeripheral};

    fn push_out(hw: &mut SimPeripheral, msc: &mut ScsiBulkTransport<'_>, data: &[u8]) -> Handshake {
        let handshake = hw.out_token(0, 1, data);
        if handshake == Handshake::Ack {
            hw.ack_transfer(1, Direction::Out);
            msc.endpoint_event(hw, 1, Direction::Out);
        }
        handshake
    }

    fn pull_in(hw: &mut SimPeripheral, msc: &mut ScsiBulkTransport<'_>) -> Result<std::vec::Vec<u8>, Handshake> {
        let packet = hw.in_token(0, 1)?;
        hw.ack_transfer(1, Direction::In);
        msc.endpoint_event(hw, 1, Direction::In);
        Ok(packet)
    }

    #[test]
    fn test_get_max_lun_counts_luns() {
        let (mut a, mut b) = ([0u8; 1024], [0u8; 1024]);
        let (mut disk_a, mut disk_b) = (RamDisk::new(&mut a, 512), RamDisk::new(&mut b, 512));
        let mut msc = ScsiBulkTransport::new(
            0,
            1,
            1,
            64,
            InquiryInfo::new("Acme", "Disk", "1"),
            [Lun::new(0, &mut disk_a), Lun::new(1, &mut disk_b)],
        );
        let mut hw = SimPeripheral::new();
        let mut buf = [0u8; 8];
        let req = SetupRequest::new(USB_DIR_IN | USB_TYPE_CLASS | USB_RECIP_INTERFACE, REQ_GET_MAX_LUN, 0, 0, 1);
        assert_eq!(msc.class_request(&mut hw, &req, &mut buf), ControlAction::DataIn(1));
        assert_eq!(buf[0], 1);
        let bad = SetupRequest::new(USB_TYPE_CLASS | USB_RECIP_INTERFACE, REQ_BULK_ONLY_RESET, 1, 0, 0);
        assert_eq!(msc.class_request(&mut hw, &bad, &mut buf), ControlAction::Stall);
    }

    #[test]
    fn test_short_cbw_desyncs_until_reset() {
        let mut backing = [0u8; 2048];
        let mut disk = RamDisk::new(&mut backing, 512);
        let mut msc = ScsiBulkTransport::new(0, 1, 1, 64, InquiryInfo::new("Acme", "Disk", "1"), [Lun::new(0, &mut disk)]);
        let mut hw = SimPeripheral::new();
        hw.enable();
        msc.configure(&mut hw);

        assert_eq!(push_out(&mut hw, &mut msc, b"USBC too short"), Handshake::Ack);
        assert!(msc.is_desynced());
        assert_eq!(pull_in(&mut hw, &mut msc), Err(Handshake::Stall));
        assert_eq!(push_out(&mut hw, &mut msc, &[0u8; 31]), Handshake::Stall);

        // ClearFeature alone does not recover
        msc.set_halt(&mut hw, 0x81, false);
        msc.set_halt(&mut hw, 0x01, false);
        assert_eq!(pull_in(&mut hw, &mut msc), Err(Handshake::Stall));

        let reset = SetupRequest::new(USB_TYPE_CLASS | USB_RECIP_INTERFACE, REQ_BULK_ONLY_RESET, 0, 0, 0);
        let mut buf = [0u8; 8];
        assert_eq!(msc.class_request(&mut hw, &reset, &mut buf), ControlAction::Ack);
        msc.set_halt(&mut hw, 0x81, false);
        msc.set_halt(&mut hw, 0x01, false);
        assert!(!msc.is_desynced());

        let cbw = CommandBlockWrapper::new(3, 0, DataDirection::HostToDevice, 0, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(push_out(&mut hw, &mut msc, &cbw.to_bytes()), Handshake::Ack);
        let csw = CommandStatusWrapper::parse(&pull_in(&mut hw, &mut msc).unwrap()).unwrap();
        assert_eq!(csw.tag, 3);
        assert_eq!(csw.status, CommandStatus::CommandOk);
        assert_eq!(msc.state(), BotState::AwaitingCbw);
    }

    #[test]
    fn test_cbw_split_across_small_packets() {
        let mut backing = [0u8; 2048];
        let mut disk = RamDisk::new(&mut backing, 512);
        let mut msc = ScsiBulkTransport::new(0, 1, 1, 8, InquiryInfo::new("Acme", "Disk", "1"), [Lun::new(0, &mut disk)]);
        let mut hw = SimPeripheral::new();
        hw.enable();
        msc.configure(&mut hw);

        let cbw = CommandBlockWrapper::new(11, 8, DataDirection::DeviceToHost, 0, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        for chunk in cbw.to_bytes().chunks(8) {
            assert_eq!(push_out(&mut hw, &mut msc, chunk), Handshake::Ack);
        }
        assert_eq!(msc.transfer_state().cbw_received, 31);
        assert_eq!(pull_in(&mut hw, &mut msc).unwrap(), vec![0, 0, 0, 3, 0, 0, 2, 0]);
        // a full last packet with nothing missing needs no ZLP; the CSW comes in two packets
        let mut csw = pull_in(&mut hw, &mut msc).unwrap();
        csw.extend(pull_in(&mut hw, &mut msc).unwrap());
        let csw = CommandStatusWrapper::parse(&csw).unwrap();
        assert_eq!((csw.tag, csw.data_residue), (11, 0));
    }

    #[test]
    #[should_panic(expected = "not a multiple")]
    fn test_block_size_must_fill_whole_packets() {
        // 100 byte blocks would end every block in a short packet on a 64 byte endpoint
        let mut backing = [0u8; 200];
        let mut disk = RamDisk::new(&mut backing, 100);
        let _ = ScsiBulkTransport::new(0, 1, 1, 64, InquiryInfo::new("Acme", "Disk", "1"), [Lun::new(0, &mut disk)]);
    }

    #[test]
    fn test_block_size_multiple_of_packet_accepted() {
        let mut backing = [0u8; 256 * 4];
        let mut disk = RamDisk::new(&mut backing, 256);
        let msc = ScsiBulkTransport::new(0, 1, 1, 64, InquiryInfo::new("Acme", "Disk", "1"), [Lun::new(0, &mut disk)]);
        assert_eq!(msc.endpoints().0.max_packet_size, 64);
    }
}
