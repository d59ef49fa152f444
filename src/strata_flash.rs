/// Intel StrataFlash (28FxxxJ3) operations on the cartridge ROM bus.
///
/// All commands are 16-bit writes to an address inside the target block; the
/// status register is read back from the same block. Every status poll is
/// bounded by `poll_limit` reads; a poll that runs out returns the last status
/// seen, with the ready bit (SR.7) clear.
use crate::buffer::Buffer;
use crate::cart::CartBus;
use crate::config::{self, BUFFER_SIZE, J3_SR_READY, J3_WRITE_BUFFER_WORDS};

pub struct StrataFlash<'a, C: CartBus> {
    bus: &'a mut C,
    poll_limit: u32,
}

impl<'a, C: CartBus> StrataFlash<'a, C> {
    pub fn new(bus: &'a mut C, poll_limit: u32) -> Self {
        Self { bus, poll_limit }
    }

    // =========================================================================
    // Command helpers
    // =========================================================================

    #[inline]
    fn command(&mut self, addr: u32, cmd: u16) {
        self.bus.rom_write(addr, cmd);
    }

    #[inline]
    fn read_array(&mut self, addr: u32) {
        self.command(addr, config::J3_READ_ARRAY);
    }

    /// Clear error bits unless the operation ended cleanly, then go back to
    /// read-array mode.
    fn finish(&mut self, addr: u32, status: u8) -> u8 {
        if status != J3_SR_READY {
            self.command(addr, config::J3_CLEAR_STATUS);
        }
        self.read_array(addr);
        status
    }

    /// True when a whole buffer starting at `addr` fits in the address space.
    fn block_fits(addr: u32) -> bool {
        let fits = addr.checked_add(BUFFER_SIZE as u32).is_some();
        if !fits {
            error!("block @0x{:08x} runs past the address space", addr);
        }
        fits
    }

    /// Poll the status register until the write state machine is ready.
    fn poll_ready(&mut self, addr: u32) -> Result<u8, u8> {
        let mut status = 0;
        for _ in 0..self.poll_limit {
            status = self.bus.rom_read(addr) as u8;
            if status & J3_SR_READY != 0 {
                return Ok(status);
            }
        }
        warn!("flash @0x{:08x} not ready, status 0x{:02x}", addr, status);
        Err(status)
    }

    // =========================================================================
    // Identification
    // =========================================================================

    /// `(manufacturer << 16) | device` read in identifier mode.
    pub fn read_id(&mut self, addr: u32) -> u32 {
        self.command(addr, config::J3_READ_ID);
        let manufacturer = self.bus.rom_read(addr);
        let device = self.bus.rom_read(addr.wrapping_add(2));
        self.read_array(addr);
        ((manufacturer as u32) << 16) | device as u32
    }

    pub fn read_status(&mut self, addr: u32) -> u8 {
        self.command(addr, config::J3_READ_STATUS);
        let status = self.bus.rom_read(addr) as u8;
        self.read_array(addr);
        status
    }

    // =========================================================================
    // Lock bits / erase
    // =========================================================================

    /// Clear all block lock bits (0x60, 0xD0).
    pub fn clear_lock_bits(&mut self, addr: u32) -> u8 {
        self.command(addr, config::J3_LOCK_SETUP);
        self.command(addr, config::J3_CONFIRM);
        let status = self.poll_ready(addr).unwrap_or_else(|status| status);
        self.finish(addr, status)
    }

    /// Erase the block containing `addr` (0x20, 0xD0).
    pub fn erase_block(&mut self, addr: u32) -> u8 {
        self.command(addr, config::J3_BLOCK_ERASE);
        self.command(addr, config::J3_CONFIRM);
        let status = self.poll_ready(addr).unwrap_or_else(|status| status);
        self.finish(addr, status)
    }

    // =========================================================================
    // Program
    // =========================================================================

    /// Program the whole buffer starting at `addr`, one write-buffer chunk at
    /// a time. Stops at the first chunk that never reaches ready.
    pub fn program(&mut self, addr: u32, data: &Buffer) -> u8 {
        if !Self::block_fits(addr) {
            return 0;
        }
        let mut status = J3_SR_READY;
        let chunk_bytes = J3_WRITE_BUFFER_WORDS * 2;
        for (index, chunk) in data.as_bytes().chunks(chunk_bytes).enumerate() {
            let chunk_addr = addr + (index * chunk_bytes) as u32;
            status = self.program_chunk(chunk_addr, chunk);
            if status & J3_SR_READY == 0 {
                error!("program aborted at 0x{:08x}", chunk_addr);
                break;
            }
        }
        self.finish(addr, status)
    }

    /// One write-to-buffer sequence:
    ///   1. Wait for the previous operation to finish
    ///   2. Request the write buffer (0xE8) until XSR.7 reports it available
    ///   3. Word count minus one, then the data
    ///   4. Confirm (0xD0) and wait for completion
    fn program_chunk(&mut self, addr: u32, chunk: &[u8]) -> u8 {
        self.command(addr, config::J3_READ_STATUS);
        if let Err(status) = self.poll_ready(addr) {
            return status;
        }

        let mut xsr = 0;
        let mut available = false;
        for _ in 0..self.poll_limit {
            self.command(addr, config::J3_WRITE_BUFFER);
            xsr = self.bus.rom_read(addr) as u8;
            if xsr & J3_SR_READY != 0 {
                available = true;
                break;
            }
        }
        if !available {
            warn!("write buffer @0x{:08x} unavailable", addr);
            return xsr;
        }

        let words = chunk.len() / 2;
        self.command(addr, (words as u16).wrapping_sub(1));
        for (i, pair) in chunk.chunks_exact(2).enumerate() {
            self.bus
                .rom_write(addr + (i * 2) as u32, u16::from_le_bytes([pair[0], pair[1]]));
        }
        self.command(addr, config::J3_CONFIRM);

        match self.poll_ready(addr) {
            Ok(status) | Err(status) => status,
        }
    }

    // =========================================================================
    // Read back
    // =========================================================================

    /// Copy one buffer-sized block of ROM into `out`.
    pub fn dump(&mut self, addr: u32, out: &mut Buffer) {
        if !Self::block_fits(addr) {
            return;
        }
        self.read_array(addr);
        for i in 0..BUFFER_SIZE / 2 {
            let value = self.bus.rom_read(addr + (i * 2) as u32);
            out.set_halfword(i, value);
        }
    }

    /// Number of halfwords in the block at `addr` that differ from `data`.
    /// A block that does not fit counts as entirely different.
    pub fn verify(&mut self, addr: u32, data: &Buffer) -> u32 {
        if !Self::block_fits(addr) {
            return (BUFFER_SIZE / 2) as u32;
        }
        self.read_array(addr);
        let mut mismatches = 0;
        for i in 0..BUFFER_SIZE / 2 {
            if Some(self.bus.rom_read(addr + (i * 2) as u32)) != data.halfword(i) {
                mismatches += 1;
            }
        }
        mismatches
    }
}

/// Part name for a recognized identifier code.
pub fn chip_name(id: u32) -> Option<&'static str> {
    config::KNOWN_FLASH_CHIPS
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, name)| *name)
}
