// DFAGB serial protocol: command words and their decoding.
//
// Every host word is `[cmd:8][param:24]`. The device only looks at the top
// byte to pick a command; the low 24 bits are a length or a block offset.

// =============================================================================
// Command tags (top byte)
// =============================================================================

pub const CMD_MASK: u32 = 0xff00_0000;
pub const PARAM_MASK: u32 = 0x00ff_ffff;

/// Full-word probe used for polling. Its top byte (0x00) is reserved.
pub const CMD_NOP: u32 = 0x0050_4f4e;
/// Multiboot handshake word a host sends when it thinks the BIOS is listening.
pub const MULTIBOOT_PING: u32 = 0x0000_6202;

pub const CMD_UPLOAD: u8 = 0x01;
pub const CMD_DOWNLOAD: u8 = 0x02;
pub const CMD_READ: u8 = 0x03;
pub const CMD_CRC32: u8 = 0x10;
pub const CMD_READ_SRAM: u8 = 0x20;
pub const CMD_WRITE_SRAM: u8 = 0x21;
pub const CMD_READ_FLASH: u8 = 0x22;
pub const CMD_WRITE_FLASH: u8 = 0x23;
pub const CMD_READ_EEPROM: u8 = 0x24;
pub const CMD_WRITE_EEPROM: u8 = 0x25;
pub const CMD_DUMP: u8 = 0x30;
pub const CMD_VERIFY: u8 = 0x31;
pub const CMD_ID: u8 = 0x40;
pub const CMD_UNLOCK: u8 = 0x41;
pub const CMD_ERASE: u8 = 0x42;
pub const CMD_PROGRAM: u8 = 0x43;

// =============================================================================
// Decoded commands
// =============================================================================

/// A host word decoded once from its top byte.
///
/// Lengths are in 32-bit words for `Upload`/`Download` and in bytes for the
/// checksum and save commands. `block` is a ROM offset in 256-byte units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Nop,
    MultibootPing,
    Upload { words: u32 },
    Download { words: u32 },
    Read,
    Crc32 { len: u32 },
    ReadSram { len: u32 },
    WriteSram { len: u32 },
    ReadFlash { len: u32 },
    WriteFlash { len: u32 },
    ReadEeprom { len: u32 },
    WriteEeprom { len: u32 },
    Dump { block: u32 },
    Verify { block: u32 },
    Id { block: u32 },
    Unlock { block: u32 },
    Erase { block: u32 },
    Program { block: u32 },
    Unknown(u32),
}

impl Command {
    pub fn decode(word: u32) -> Self {
        let param = word & PARAM_MASK;
        match (word >> 24) as u8 {
            0x00 => match word {
                CMD_NOP => Command::Nop,
                MULTIBOOT_PING => Command::MultibootPing,
                _ => Command::Unknown(word),
            },
            CMD_UPLOAD => Command::Upload { words: param },
            CMD_DOWNLOAD => Command::Download { words: param },
            CMD_READ => Command::Read,
            CMD_CRC32 => Command::Crc32 { len: param },
            CMD_READ_SRAM => Command::ReadSram { len: param },
            CMD_WRITE_SRAM => Command::WriteSram { len: param },
            CMD_READ_FLASH => Command::ReadFlash { len: param },
            CMD_WRITE_FLASH => Command::WriteFlash { len: param },
            CMD_READ_EEPROM => Command::ReadEeprom { len: param },
            CMD_WRITE_EEPROM => Command::WriteEeprom { len: param },
            CMD_DUMP => Command::Dump { block: param },
            CMD_VERIFY => Command::Verify { block: param },
            CMD_ID => Command::Id { block: param },
            CMD_UNLOCK => Command::Unlock { block: param },
            CMD_ERASE => Command::Erase { block: param },
            CMD_PROGRAM => Command::Program { block: param },
            _ => Command::Unknown(word),
        }
    }

    /// Encode back to a wire word. Parameters are truncated to 24 bits.
    pub fn encode(self) -> u32 {
        let tagged = |tag: u8, param: u32| ((tag as u32) << 24) | (param & PARAM_MASK);
        match self {
            Command::Nop => CMD_NOP,
            Command::MultibootPing => MULTIBOOT_PING,
            Command::Upload { words } => tagged(CMD_UPLOAD, words),
            Command::Download { words } => tagged(CMD_DOWNLOAD, words),
            Command::Read => tagged(CMD_READ, 0),
            Command::Crc32 { len } => tagged(CMD_CRC32, len),
            Command::ReadSram { len } => tagged(CMD_READ_SRAM, len),
            Command::WriteSram { len } => tagged(CMD_WRITE_SRAM, len),
            Command::ReadFlash { len } => tagged(CMD_READ_FLASH, len),
            Command::WriteFlash { len } => tagged(CMD_WRITE_FLASH, len),
            Command::ReadEeprom { len } => tagged(CMD_READ_EEPROM, len),
            Command::WriteEeprom { len } => tagged(CMD_WRITE_EEPROM, len),
            Command::Dump { block } => tagged(CMD_DUMP, block),
            Command::Verify { block } => tagged(CMD_VERIFY, block),
            Command::Id { block } => tagged(CMD_ID, block),
            Command::Unlock { block } => tagged(CMD_UNLOCK, block),
            Command::Erase { block } => tagged(CMD_ERASE, block),
            Command::Program { block } => tagged(CMD_PROGRAM, block),
            Command::Unknown(word) => word,
        }
    }

    /// Commands the FSM hands over to the worker.
    pub fn is_worker(self) -> bool {
        matches!(
            self,
            Command::Crc32 { .. }
                | Command::ReadSram { .. }
                | Command::WriteSram { .. }
                | Command::ReadFlash { .. }
                | Command::WriteFlash { .. }
                | Command::ReadEeprom { .. }
                | Command::WriteEeprom { .. }
                | Command::Dump { .. }
                | Command::Verify { .. }
                | Command::Id { .. }
                | Command::Unlock { .. }
                | Command::Erase { .. }
                | Command::Program { .. }
        )
    }
}

/// Byte address in ROM space of a block-offset parameter.
pub fn block_address(block: u32) -> u32 {
    block << crate::config::BLOCK_OFFSET_SHIFT
}

/// Block-offset parameter for the `index`-th erase block.
pub fn block_param(index: usize) -> u32 {
    ((index * crate::config::BLOCK_SIZE) >> crate::config::BLOCK_OFFSET_SHIFT) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_is_not_a_tagged_command() {
        assert_eq!(Command::decode(CMD_NOP), Command::Nop);
        assert_eq!(Command::decode(CMD_NOP ^ 1), Command::Unknown(CMD_NOP ^ 1));
        assert_eq!(Command::decode(MULTIBOOT_PING), Command::MultibootPing);
    }

    #[test]
    fn decodes_parameter_from_low_bits() {
        assert_eq!(
            Command::decode(0x0100_0004),
            Command::Upload { words: 4 }
        );
        assert_eq!(
            Command::decode(0x1002_0000),
            Command::Crc32 { len: 0x2_0000 }
        );
        assert_eq!(
            Command::decode(0x4300_0200),
            Command::Program { block: 0x200 }
        );
        assert_eq!(Command::decode(0x03ab_cdef), Command::Read);
    }

    #[test]
    fn unknown_tags_are_preserved() {
        assert_eq!(Command::decode(0x7700_0001), Command::Unknown(0x7700_0001));
        assert!(!Command::decode(0x7700_0001).is_worker());
    }

    #[test]
    fn worker_set_matches_protocol() {
        for tag in [
            CMD_CRC32,
            CMD_READ_SRAM,
            CMD_WRITE_SRAM,
            CMD_READ_FLASH,
            CMD_WRITE_FLASH,
            CMD_READ_EEPROM,
            CMD_WRITE_EEPROM,
            CMD_DUMP,
            CMD_VERIFY,
            CMD_ID,
            CMD_UNLOCK,
            CMD_ERASE,
            CMD_PROGRAM,
        ] {
            assert!(Command::decode((tag as u32) << 24).is_worker());
        }
        for tag in [CMD_UPLOAD, CMD_DOWNLOAD, CMD_READ] {
            assert!(!Command::decode((tag as u32) << 24).is_worker());
        }
    }

    #[test]
    fn block_params() {
        assert_eq!(block_param(0), 0);
        assert_eq!(block_param(3), 0x600);
        assert_eq!(block_address(block_param(3)), 0x6_0000);
    }
}
