// Buffer geometry, wire sentinels and cartridge hardware constants.

// =============================================================================
// Device buffer
// =============================================================================

/// Size of the device-side working buffer (EWRAM on the GBA).
pub const BUFFER_SIZE: usize = 0x2_0000;

/// Buffer size in 32-bit words, the unit of UPLOAD/DOWNLOAD lengths.
pub const BUFFER_WORDS: usize = BUFFER_SIZE / 4;

/// Erase/program/dump unit. The 28F128J3 block size happens to match the buffer.
pub const BLOCK_SIZE: usize = BUFFER_SIZE;

/// Block offsets travel in the command parameter in units of 256 bytes.
pub const BLOCK_OFFSET_SHIFT: u32 = 8;

/// Game Pak ROM window (0x0800_0000..0x0A00_0000). Block commands must stay inside it.
pub const ROM_WINDOW_SIZE: u32 = 0x0200_0000;

// =============================================================================
// Wire sentinels
// =============================================================================

/// "IDLE": the device has nothing in flight.
pub const STATE_IDLE: u32 = 0x454c_4449;

/// "BUSY": a worker command is still running.
pub const STATE_BUSY: u32 = 0x5953_5542;

/// "TIME": written to the result register when a save write never completed.
pub const STATUS_TIMEOUT: u32 = 0x454d_4954;

// =============================================================================
// Intel StrataFlash (28FxxxJ3) command set, 16-bit bus
// =============================================================================

pub const J3_READ_ARRAY: u16 = 0xff;
pub const J3_READ_ID: u16 = 0x90;
pub const J3_READ_STATUS: u16 = 0x70;
pub const J3_CLEAR_STATUS: u16 = 0x50;
pub const J3_BLOCK_ERASE: u16 = 0x20;
pub const J3_LOCK_SETUP: u16 = 0x60;
pub const J3_WRITE_BUFFER: u16 = 0xe8;
pub const J3_CONFIRM: u16 = 0xd0;

/// Write state machine ready (SR.7).
pub const J3_SR_READY: u8 = 0x80;

/// Halfwords per write-buffer program (32 bytes on the J3 family).
pub const J3_WRITE_BUFFER_WORDS: usize = 16;

/// Intel manufacturer code.
pub const INTEL_MANUFACTURER_ID: u16 = 0x0089;

/// Supported flash chips, keyed by `(manufacturer << 16) | device`.
pub const KNOWN_FLASH_CHIPS: &[(u32, &str)] = &[
    (0x0089_0016, "28F320J3"),
    (0x0089_0017, "28F640J3"),
    (0x0089_0018, "28F128J3"),
];

/// Chip the host expects by default when flashing.
pub const DEFAULT_FLASH_ID: u32 = 0x0089_0018;

// =============================================================================
// Save memory
// =============================================================================

/// Backup flash is addressed through 64 KiB banks.
pub const BACKUP_FLASH_BANK_SIZE: usize = 0x1_0000;

/// Backup flash erase sector.
pub const BACKUP_FLASH_SECTOR_SIZE: usize = 0x1000;

pub const BACKUP_FLASH_CMD_ADDR: u32 = 0x5555;
pub const BACKUP_FLASH_ENABLE_ADDR: u32 = 0x2aaa;
pub const BACKUP_FLASH_ENABLE_1: u8 = 0xaa;
pub const BACKUP_FLASH_ENABLE_2: u8 = 0x55;
pub const BACKUP_FLASH_ERASE: u8 = 0x80;
pub const BACKUP_FLASH_ERASE_SECTOR: u8 = 0x30;
pub const BACKUP_FLASH_WRITE: u8 = 0xa0;
pub const BACKUP_FLASH_SWITCH_BANK: u8 = 0xb0;
pub const BACKUP_FLASH_ERASED: u8 = 0xff;

/// EEPROM transfers are made of 64-bit blocks.
pub const EEPROM_BLOCK_SIZE: usize = 8;

/// 4 Kbit parts use 6 address bits, 64 Kbit parts use 14.
pub const EEPROM_SMALL_SIZE: usize = 0x200;
pub const EEPROM_SMALL_ADDR_BITS: u8 = 6;
pub const EEPROM_LARGE_ADDR_BITS: u8 = 14;

// =============================================================================
// Timing
// =============================================================================

/// Host NOP polling cadence while the worker is busy (1/16 s).
pub const HOST_POLL_INTERVAL_US: u32 = 62_500;

/// Host NOP polls before a worker command is declared timed out (~64 s).
pub const HOST_POLL_LIMIT: u32 = 1024;

/// Status reads before a device-side hardware poll gives up.
pub const DEVICE_POLL_LIMIT: u32 = 0x10_0000;
