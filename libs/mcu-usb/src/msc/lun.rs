/// Largest block a LUN may use; one block has to fit the bulk transfer buffer.
pub const MAX_BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeviceError {
    /// Hardware didn't behave as expected, unrecoverable
    HardwareError,

    /// Error during writing; most likely value read back after write was wrong
    WriteError,

    /// Error during erase
    EraseError,

    /// Address is invalid or out of range
    InvalidAddress,

    /// No medium, or the medium is still coming up
    NotReady,

    WriteProtected,
}

/// Storage behind one LUN.
///
/// Reads are per block. Writes are announced with `begin_write` and then streamed
/// in with `write_data` as the bulk OUT packets arrive; chunks never straddle the
/// range given to `begin_write`.
pub trait BlockDevice {
    /// The number of bytes per block. This determines the size of the buffer passed
    /// to `read_block`
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u32;

    fn is_ready(&self) -> bool { true }

    fn is_read_only(&self) -> bool { false }

    /// Read the block indicated by `lba` into the provided buffer
    fn read_block(&mut self, lba: u32, block: &mut [u8]) -> Result<(), BlockDeviceError>;

    /// Prepare to receive `count` blocks starting at `lba`
    fn begin_write(&mut self, lba: u32, count: u32) -> Result<(), BlockDeviceError>;

    /// Next piece of the data announced by `begin_write`
    fn write_data(&mut self, data: &[u8]) -> Result<(), BlockDeviceError>;

    /// Commit anything cached. Called for SYNCHRONIZE CACHE.
    fn flush(&mut self) -> Result<(), BlockDeviceError> { Ok(()) }
}

/// One logical unit: a LUN number and the storage that answers for it.
pub struct Lun<'a> {
    number: u8,
    storage: &'a mut dyn BlockDevice,
}

impl<'a> Lun<'a> {
    pub fn new(number: u8, storage: &'a mut dyn BlockDevice) -> Self {
        let block_size = storage.block_size();
        assert!(block_size > 0 && block_size <= MAX_BLOCK_SIZE);
        Lun { number, storage }
    }

    pub fn number(&self) -> u8 { self.number }

    pub fn block_size(&self) -> usize { self.storage.block_size() }

    pub fn block_count(&self) -> u32 { self.storage.block_count() }

    pub fn is_ready(&self) -> bool { self.storage.is_ready() }

    pub fn is_read_only(&self) -> bool { self.storage.is_read_only() }

    /// `lba..lba + count` lies on the medium.
    pub fn contains(&self, lba: u32, count: u32) -> bool {
        (lba as u64) + (count as u64) <= self.block_count() as u64
    }

    pub fn storage(&mut self) -> &mut dyn BlockDevice { &mut *self.storage }
}

/// A block device over a borrowed byte slice.
pub struct RamDisk<'a> {
    data: &'a mut [u8],
    block_size: usize,
    read_only: bool,
    present: bool,
    write_cursor: usize,
    write_end: usize,
}

impl<'a> RamDisk<'a> {
    /// Trailing bytes that don't fill a whole block are not used.
    pub fn new(data: &'a mut [u8], block_size: usize) -> Self {
        assert!(block_size > 0);
        RamDisk { data, block_size, read_only: false, present: true, write_cursor: 0, write_end: 0 }
    }

    pub fn set_read_only(&mut self, read_only: bool) { self.read_only = read_only; }

    /// Simulate removing or inserting the medium.
    pub fn set_present(&mut self, present: bool) { self.present = present; }

    pub fn data(&self) -> &[u8] { &self.data[..] }

    fn block_range(&self, lba: u32, count: u32) -> Result<(usize, usize), BlockDeviceError> {
        if (lba as u64) + (count as u64) > self.block_count() as u64 {
            return Err(BlockDeviceError::InvalidAddress);
        }
        let start = lba as usize * self.block_size;
        Ok((start, start + count as usize * self.block_size))
    }
}

impl BlockDevice for RamDisk<'_> {
    fn block_size(&self) -> usize { self.block_size }

    fn block_count(&self) -> u32 { (self.data.len() / self.block_size) as u32 }

    fn is_ready(&self) -> bool { self.present }

    fn is_read_only(&self) -> bool { self.read_only }

    fn read_block(&mut self, lba: u32, block: &mut [u8]) -> Result<(), BlockDeviceError> {
        if !self.present {
            return Err(BlockDeviceError::NotReady);
        }
        let (start, end) = self.block_range(lba, 1)?;
        block[..self.block_size].copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn begin_write(&mut self, lba: u32, count: u32) -> Result<(), BlockDeviceError> {
        if !self.present {
            return Err(BlockDeviceError::NotReady);
        }
        if self.read_only {
            return Err(BlockDeviceError::WriteProtected);
        }
        let (start, end) = self.block_range(lba, count)?;
        self.write_cursor = start;
        self.write_end = end;
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<(), BlockDeviceError> {
        let end = self.write_cursor + data.len();
        if end > self.write_end {
            return Err(BlockDeviceError::InvalidAddress);
        }
        self.data[self.write_cursor..end].copy_from_slice(data);
        self.write_cursor = end;
        Ok(())
    }
}
