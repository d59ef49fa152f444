/// Save memory transfers: battery SRAM, backup flash and EEPROM.
///
/// The worker clamps lengths to the buffer before calling in here.
use crate::cart::CartBus;
use crate::config::{
    BACKUP_FLASH_BANK_SIZE, BACKUP_FLASH_CMD_ADDR, BACKUP_FLASH_ENABLE_1,
    BACKUP_FLASH_ENABLE_2, BACKUP_FLASH_ENABLE_ADDR, BACKUP_FLASH_ERASE,
    BACKUP_FLASH_ERASED, BACKUP_FLASH_ERASE_SECTOR, BACKUP_FLASH_SECTOR_SIZE,
    BACKUP_FLASH_SWITCH_BANK, BACKUP_FLASH_WRITE, EEPROM_BLOCK_SIZE, EEPROM_LARGE_ADDR_BITS,
    EEPROM_SMALL_ADDR_BITS, EEPROM_SMALL_SIZE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SaveError {
    /// The chip never confirmed the write/erase at this byte offset.
    Timeout { offset: u32 },
}

// =============================================================================
// SRAM
// =============================================================================

pub fn read_sram<C: CartBus>(bus: &mut C, out: &mut [u8]) {
    for (offset, byte) in out.iter_mut().enumerate() {
        *byte = bus.save_read(offset as u32);
    }
}

pub fn write_sram<C: CartBus>(bus: &mut C, data: &[u8]) {
    for (offset, &byte) in data.iter().enumerate() {
        bus.save_write(offset as u32, byte);
    }
}

// =============================================================================
// Backup flash (64 KiB banks, 4 KiB sectors)
// =============================================================================

fn flash_command<C: CartBus>(bus: &mut C, command: u8) {
    bus.save_write(BACKUP_FLASH_CMD_ADDR, BACKUP_FLASH_ENABLE_1);
    bus.save_write(BACKUP_FLASH_ENABLE_ADDR, BACKUP_FLASH_ENABLE_2);
    bus.save_write(BACKUP_FLASH_CMD_ADDR, command);
}

fn switch_bank<C: CartBus>(bus: &mut C, bank: u8) {
    flash_command(bus, BACKUP_FLASH_SWITCH_BANK);
    bus.save_write(0, bank);
}

fn wait_for_byte<C: CartBus>(bus: &mut C, offset: u32, expected: u8, poll_limit: u32) -> bool {
    (0..poll_limit).any(|_| bus.save_read(offset) == expected)
}

/// Iterate `(offset in bank, absolute offset)` and switch banks when the
/// transfer is larger than one bank. A banked transfer always leaves bank 0
/// selected, even when it stops early.
fn for_each_banked<C: CartBus>(
    bus: &mut C,
    len: usize,
    mut f: impl FnMut(&mut C, u32, usize) -> Result<(), SaveError>,
) -> Result<(), SaveError> {
    let banked = len > BACKUP_FLASH_BANK_SIZE;
    let result = (0..len).try_for_each(|offset| {
        let in_bank = offset % BACKUP_FLASH_BANK_SIZE;
        if banked && in_bank == 0 {
            switch_bank(bus, (offset / BACKUP_FLASH_BANK_SIZE) as u8);
        }
        f(bus, in_bank as u32, offset)
    });
    if banked {
        switch_bank(bus, 0);
    }
    result
}

pub fn read_flash<C: CartBus>(bus: &mut C, out: &mut [u8]) {
    let len = out.len();
    // Reads cannot fail.
    let _ = for_each_banked(bus, len, |bus, in_bank, offset| {
        out[offset] = bus.save_read(in_bank);
        Ok(())
    });
}

pub fn write_flash<C: CartBus>(bus: &mut C, data: &[u8], poll_limit: u32) -> Result<(), SaveError> {
    for_each_banked(bus, data.len(), |bus, in_bank, offset| {
        if in_bank as usize % BACKUP_FLASH_SECTOR_SIZE == 0 {
            flash_command(bus, BACKUP_FLASH_ERASE);
            bus.save_write(BACKUP_FLASH_CMD_ADDR, BACKUP_FLASH_ENABLE_1);
            bus.save_write(BACKUP_FLASH_ENABLE_ADDR, BACKUP_FLASH_ENABLE_2);
            bus.save_write(in_bank, BACKUP_FLASH_ERASE_SECTOR);
            if !wait_for_byte(bus, in_bank, BACKUP_FLASH_ERASED, poll_limit) {
                return Err(SaveError::Timeout {
                    offset: offset as u32,
                });
            }
        }

        let byte = data[offset];
        if byte == BACKUP_FLASH_ERASED {
            return Ok(());
        }
        flash_command(bus, BACKUP_FLASH_WRITE);
        bus.save_write(in_bank, byte);
        if wait_for_byte(bus, in_bank, byte, poll_limit) {
            Ok(())
        } else {
            Err(SaveError::Timeout {
                offset: offset as u32,
            })
        }
    })
}

// =============================================================================
// EEPROM (64-bit blocks)
// =============================================================================

fn eeprom_addr_bits(len: usize) -> u8 {
    if len <= EEPROM_SMALL_SIZE {
        EEPROM_SMALL_ADDR_BITS
    } else {
        EEPROM_LARGE_ADDR_BITS
    }
}

pub fn read_eeprom<C: CartBus>(bus: &mut C, out: &mut [u8]) {
    let bits = eeprom_addr_bits(out.len());
    for (block, chunk) in out.chunks_mut(EEPROM_BLOCK_SIZE).enumerate() {
        let data = bus.eeprom_read(block as u16, bits);
        chunk.copy_from_slice(&data[..chunk.len()]);
    }
}

pub fn write_eeprom<C: CartBus>(bus: &mut C, data: &[u8], poll_limit: u32) -> Result<(), SaveError> {
    let bits = eeprom_addr_bits(data.len());
    for (block, chunk) in data.chunks(EEPROM_BLOCK_SIZE).enumerate() {
        let mut raw = [0u8; EEPROM_BLOCK_SIZE];
        raw[..chunk.len()].copy_from_slice(chunk);
        bus.eeprom_write(block as u16, bits, &raw);
        if !(0..poll_limit).any(|_| bus.eeprom_ready()) {
            return Err(SaveError::Timeout {
                offset: (block * EEPROM_BLOCK_SIZE) as u32,
            });
        }
    }
    Ok(())
}
