use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use embedded_hal::delay::DelayNs;

use super::{HostError, Link, WordTransport};
use crate::config::{BLOCK_SIZE, DEFAULT_FLASH_ID, J3_SR_READY, STATUS_TIMEOUT};
use crate::crc32::crc32;
use crate::protocol::{block_param, Command};

// =============================================================================
// Save types
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveType {
    /// 256 Kbit battery SRAM.
    Sram32K,
    /// 512 Kbit battery SRAM.
    Sram64K,
    /// 64 Kbit EEPROM, 14-bit addressing.
    Eeprom8K,
    /// 4 Kbit EEPROM, 6-bit addressing.
    Eeprom512,
    /// 512 Kbit backup flash, one bank.
    Flash64K,
    /// 1 Mbit backup flash, two banks.
    Flash128K,
}

impl SaveType {
    pub fn size(self) -> usize {
        match self {
            SaveType::Sram32K => 0x8000,
            SaveType::Sram64K | SaveType::Flash64K => 0x1_0000,
            SaveType::Eeprom8K => 0x2000,
            SaveType::Eeprom512 => 0x200,
            SaveType::Flash128K => 0x2_0000,
        }
    }

    pub fn read_command(self) -> Command {
        let len = self.size() as u32;
        match self {
            SaveType::Sram32K | SaveType::Sram64K => Command::ReadSram { len },
            SaveType::Eeprom8K | SaveType::Eeprom512 => Command::ReadEeprom { len },
            SaveType::Flash64K | SaveType::Flash128K => Command::ReadFlash { len },
        }
    }

    pub fn write_command(self) -> Command {
        let len = self.size() as u32;
        match self {
            SaveType::Sram32K | SaveType::Sram64K => Command::WriteSram { len },
            SaveType::Eeprom8K | SaveType::Eeprom512 => Command::WriteEeprom { len },
            SaveType::Flash64K | SaveType::Flash128K => Command::WriteFlash { len },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveTypeError;

impl fmt::Display for SaveTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid save type")
    }
}

impl core::error::Error for SaveTypeError {}

impl FromStr for SaveType {
    type Err = SaveTypeError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "sram256" | "sram32" => Ok(SaveType::Sram32K),
            "sram512" | "sram64" => Ok(SaveType::Sram64K),
            "eeprom64" | "eeprom8" => Ok(SaveType::Eeprom8K),
            "eeprom4" | "eeprom0.5" | "eeprom512" => Ok(SaveType::Eeprom512),
            "flash512" | "flash64" => Ok(SaveType::Flash64K),
            "flash1m" | "flash128" => Ok(SaveType::Flash128K),
            _ => Err(SaveTypeError),
        }
    }
}

// =============================================================================
// ROM flashing
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashOptions {
    /// Identifier the cartridge must report before anything is written.
    pub expected_id: u32,
    /// Upload attempts per block beyond the first; `None` retries forever.
    pub crc_retries: Option<u32>,
    /// Erase/program attempts per block beyond the first; `None` retries forever.
    pub program_retries: Option<u32>,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            expected_id: DEFAULT_FLASH_ID,
            crc_retries: None,
            program_retries: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlashReport {
    /// Blocks in the (padded) image.
    pub total_blocks: usize,
    /// Blocks erased and programmed.
    pub programmed: usize,
    /// Blocks that already matched and were left alone.
    pub skipped: usize,
    pub crc_retries: u32,
    pub program_retries: u32,
}

fn retry_allowed(attempts: u32, cap: Option<u32>) -> bool {
    cap.map_or(true, |cap| attempts <= cap)
}

impl<T: WordTransport, D: DelayNs> Link<T, D> {
    /// Write `image` to the cartridge ROM, starting at block `start_block`
    /// (zero-based; out of range starts over at 0).
    pub fn flash_rom(
        &mut self,
        image: &[u8],
        start_block: usize,
        options: &FlashOptions,
    ) -> Result<FlashReport, HostError<T::Error>> {
        let id = self.worker(Command::Id { block: 0 }.encode())?;
        if id != options.expected_id {
            error!("sorry, unsupported flash 0x{:08x}", id);
            return Err(HostError::UnsupportedCart { id });
        }
        if image.is_empty() {
            return Err(HostError::InvalidLength { len: 0 });
        }

        let unlock = Command::Unlock { block: 0 }.encode();
        let status = self.worker(unlock)?;
        if status != J3_SR_READY as u32 {
            error!("clearing lock bits failed, status 0x{:08x}", status);
            return Err(HostError::DeviceStatus {
                command: unlock,
                status,
            });
        }

        let total = image.len().div_ceil(BLOCK_SIZE);
        let start = if start_block < total { start_block } else { 0 };
        info!("needs {} upload/erase/program cycles", total - start);

        let mut report = FlashReport {
            total_blocks: total,
            ..FlashReport::default()
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        for index in start..total {
            info!(" === {} / {} ===", index + 1, total);
            let chunk = &image[index * BLOCK_SIZE..image.len().min((index + 1) * BLOCK_SIZE)];
            block[..chunk.len()].copy_from_slice(chunk);
            block[chunk.len()..].fill(0);

            self.upload_checked(&block, index, options.crc_retries, &mut report.crc_retries)?;

            let param = block_param(index);
            if self.worker(Command::Verify { block: param }.encode())? == 0 {
                info!("identical block, skipped");
                report.skipped += 1;
                continue;
            }

            let mut attempts = 0;
            loop {
                let erase = self.worker(Command::Erase { block: param }.encode())?;
                let status = if erase == J3_SR_READY as u32 {
                    self.worker(Command::Program { block: param }.encode())?
                } else {
                    erase
                };
                if status == J3_SR_READY as u32 {
                    break;
                }
                warn!("block {} erase/program status 0x{:08x}, retrying", index, status);
                attempts += 1;
                report.program_retries += 1;
                if !retry_allowed(attempts, options.program_retries) {
                    return Err(HostError::RetriesExhausted { block: index });
                }
            }
            report.programmed += 1;
        }
        Ok(report)
    }

    /// Upload `data` until the device CRC matches the local one.
    fn upload_checked(
        &mut self,
        data: &[u8],
        index: usize,
        cap: Option<u32>,
        retries: &mut u32,
    ) -> Result<(), HostError<T::Error>> {
        let expected = crc32(data);
        let mut attempts = 0;
        loop {
            self.upload(data)?;
            let actual = self.remote_crc32(data.len() as u32)?;
            if actual == expected {
                debug!("CRC match, 0x{:08x} == 0x{:08x}", expected, actual);
                return Ok(());
            }
            warn!("CRC mismatch, 0x{:08x} != 0x{:08x}", expected, actual);
            attempts += 1;
            *retries += 1;
            if !retry_allowed(attempts, cap) {
                return Err(HostError::RetriesExhausted { block: index });
            }
        }
    }

    // =========================================================================
    // ROM dump
    // =========================================================================

    /// Read `len` bytes of cartridge ROM, rounded up to whole blocks.
    pub fn dump_rom(&mut self, len: usize) -> Result<Vec<u8>, HostError<T::Error>> {
        if len == 0 {
            return Err(HostError::InvalidLength { len });
        }
        let total = len.div_ceil(BLOCK_SIZE);
        let mut image = vec![0u8; total * BLOCK_SIZE];
        for (index, block) in image.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            info!(" === {} / {} ===", index + 1, total);
            self.worker(Command::Dump { block: block_param(index) }.encode())?;
            let expected = self.remote_crc32(BLOCK_SIZE as u32)?;
            self.download(block)?;
            let actual = crc32(block);
            if actual != expected {
                error!("CRC mismatch, 0x{:08x} != 0x{:08x}", expected, actual);
                return Err(HostError::CrcMismatch { expected, actual });
            }
        }
        Ok(image)
    }

    // =========================================================================
    // Save memory
    // =========================================================================

    /// Write `data` to the cartridge save chip. Short data is zero padded,
    /// long data truncated to the save size.
    pub fn write_save(&mut self, kind: SaveType, data: &[u8]) -> Result<(), HostError<T::Error>> {
        let size = kind.size();
        let mut save = vec![0u8; size];
        let len = data.len().min(size);
        save[..len].copy_from_slice(&data[..len]);

        let expected = crc32(&save);
        self.upload(&save)?;
        let actual = self.remote_crc32(size as u32)?;
        if actual != expected {
            error!("CRC mismatch, 0x{:08x} != 0x{:08x}", expected, actual);
            return Err(HostError::CrcMismatch { expected, actual });
        }

        let command = kind.write_command().encode();
        let status = self.worker(command)?;
        if status == STATUS_TIMEOUT {
            error!("save write timed out");
            return Err(HostError::DeviceStatus { command, status });
        }
        info!("{} save bytes written", size);
        Ok(())
    }

    /// Read the whole save chip.
    pub fn read_save(&mut self, kind: SaveType) -> Result<Vec<u8>, HostError<T::Error>> {
        let size = kind.size();
        self.worker(kind.read_command().encode())?;
        let expected = self.remote_crc32(size as u32)?;

        let mut save = vec![0u8; size];
        self.download(&mut save)?;
        let actual = crc32(&save);
        if actual != expected {
            error!("CRC mismatch, 0x{:08x} != 0x{:08x}", expected, actual);
            return Err(HostError::CrcMismatch { expected, actual });
        }
        Ok(save)
    }

    /// Buffer loopback check: upload `data`, compare CRCs, download it back.
    pub fn buffer_test(&mut self, data: &[u8]) -> Result<(), HostError<T::Error>> {
        let expected = crc32(data);
        self.upload(data)?;
        let remote = self.remote_crc32(data.len() as u32)?;
        if remote != expected {
            return Err(HostError::CrcMismatch {
                expected,
                actual: remote,
            });
        }
        let mut back = vec![0u8; data.len()];
        self.download(&mut back)?;
        let actual = crc32(&back);
        if actual != expected {
            return Err(HostError::CrcMismatch { expected, actual });
        }
        info!("buffer test passed, CRC32 0x{:08x}", expected);
        Ok(())
    }
}
