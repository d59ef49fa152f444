/// Host-side simulation of the cartridge and the serial link.
///
/// [`SimCart`] models a 28FxxxJ3 ROM with its command state machine plus a
/// save chip. [`Loopback`] runs the device FSM and worker in-process behind the
/// [`WordTransport`] trait so host operations can be exercised end to end.
use alloc::vec;
use alloc::vec::Vec;
use core::convert::Infallible;

use crate::cart::CartBus;
use crate::config::{
    BACKUP_FLASH_BANK_SIZE, BACKUP_FLASH_CMD_ADDR, BACKUP_FLASH_ENABLE_1, BACKUP_FLASH_ENABLE_2,
    BACKUP_FLASH_ENABLE_ADDR, BACKUP_FLASH_ERASE, BACKUP_FLASH_ERASED, BACKUP_FLASH_ERASE_SECTOR,
    BACKUP_FLASH_SECTOR_SIZE, BACKUP_FLASH_SWITCH_BANK, BACKUP_FLASH_WRITE, BLOCK_SIZE,
    BUFFER_SIZE, DEFAULT_FLASH_ID, EEPROM_BLOCK_SIZE, J3_SR_READY, STATE_IDLE,
};
use crate::config::{
    J3_BLOCK_ERASE, J3_CLEAR_STATUS, J3_CONFIRM, J3_LOCK_SETUP, J3_READ_ARRAY, J3_READ_ID,
    J3_READ_STATUS, J3_WRITE_BUFFER,
};
use crate::context::{DeviceContext, DeviceState};
use crate::fsm;
use crate::host::WordTransport;
use crate::protocol::Command;
use crate::worker::{Worker, WorkerConfig};

// Status register error bits.
const SR_ERASE_ERROR: u8 = 0x20;
const SR_PROGRAM_ERROR: u8 = 0x10;
const SR_LOCKED: u8 = 0x02;

const EEPROM_SIZE: usize = 0x2000;

/// Save chip fitted to the simulated cartridge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackupKind {
    /// Plain byte-addressed memory.
    #[default]
    Sram,
    /// Command-driven backup flash with 64 KiB banks.
    Flash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum RomMode {
    ReadArray,
    ReadId,
    ReadStatus,
    EraseSetup,
    LockSetup,
    BufferCount,
    BufferData { remaining: u32, writes: Vec<(u32, u16)> },
    BufferConfirm { writes: Vec<(u32, u16)> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlashSeq {
    Ready,
    Unlock1,
    Unlock2,
    EraseArmed,
    EraseUnlock1,
    EraseUnlock2,
    WriteByte,
    SwitchBank,
}

pub struct SimCart {
    rom: Vec<u16>,
    locked: Vec<bool>,
    mode: RomMode,
    status: u8,
    id: u32,
    stuck_busy: bool,
    lock_clear_fails: bool,
    erase_failures: u32,
    erase_count: u32,
    program_count: u32,

    backup: BackupKind,
    save: Vec<u8>,
    bank: usize,
    flash_seq: FlashSeq,
    eeprom: Vec<u8>,
    eeprom_addr_bits: u8,
}

impl SimCart {
    /// Erased cartridge with `blocks` 128 KiB flash blocks.
    pub fn new(blocks: usize) -> Self {
        Self {
            rom: vec![0xffff; blocks * BLOCK_SIZE / 2],
            locked: vec![false; blocks],
            mode: RomMode::ReadArray,
            status: J3_SR_READY,
            id: DEFAULT_FLASH_ID,
            stuck_busy: false,
            lock_clear_fails: false,
            erase_failures: 0,
            erase_count: 0,
            program_count: 0,
            backup: BackupKind::default(),
            save: vec![BACKUP_FLASH_ERASED; BUFFER_SIZE],
            bank: 0,
            flash_seq: FlashSeq::Ready,
            eeprom: vec![0xff; EEPROM_SIZE],
            eeprom_addr_bits: 0,
        }
    }

    pub fn with_backup(mut self, kind: BackupKind) -> Self {
        self.backup = kind;
        self
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn lock_all(&mut self) {
        self.locked.fill(true);
    }

    /// Make every status poll report busy, and backup flash never complete.
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Make clear-lock-bits end with an erase error and leave the locks set.
    pub fn fail_lock_clear(&mut self, fail: bool) {
        self.lock_clear_fails = fail;
    }

    /// Fail the next `count` block erases with an erase error.
    pub fn fail_next_erases(&mut self, count: u32) {
        self.erase_failures = count;
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    /// Completed write-buffer programs.
    pub fn program_count(&self) -> u32 {
        self.program_count
    }

    pub fn rom_halfword(&self, index: usize) -> u16 {
        self.rom.get(index).copied().unwrap_or(0)
    }

    pub fn rom_bytes(&self) -> Vec<u8> {
        self.rom.iter().flat_map(|h| h.to_le_bytes()).collect()
    }

    /// Preload ROM contents starting at byte offset 0.
    pub fn load_rom(&mut self, image: &[u8]) {
        for (slot, pair) in self.rom.iter_mut().zip(image.chunks(2)) {
            let hi = pair.get(1).copied().unwrap_or(0xff);
            *slot = u16::from_le_bytes([pair[0], hi]);
        }
    }

    pub fn save_bytes(&self) -> &[u8] {
        &self.save
    }

    pub fn load_save(&mut self, data: &[u8]) {
        let len = data.len().min(self.save.len());
        self.save[..len].copy_from_slice(&data[..len]);
    }

    pub fn eeprom_bytes(&self) -> &[u8] {
        &self.eeprom
    }

    pub fn last_eeprom_addr_bits(&self) -> u8 {
        self.eeprom_addr_bits
    }

    fn block_of(&self, addr: u32) -> Option<usize> {
        let block = addr as usize / BLOCK_SIZE;
        (block < self.locked.len()).then_some(block)
    }

    fn reported_status(&self) -> u16 {
        if self.stuck_busy {
            (self.status & !J3_SR_READY) as u16
        } else {
            self.status as u16
        }
    }

    fn erase(&mut self, addr: u32) {
        match self.block_of(addr) {
            Some(block) if self.locked[block] => self.status |= SR_ERASE_ERROR | SR_LOCKED,
            Some(_) if self.erase_failures > 0 => {
                self.erase_failures -= 1;
                self.status |= SR_ERASE_ERROR;
            }
            Some(block) => {
                let half = BLOCK_SIZE / 2;
                self.rom[block * half..(block + 1) * half].fill(0xffff);
                self.erase_count += 1;
            }
            None => self.status |= SR_ERASE_ERROR,
        }
    }

    fn program(&mut self, writes: &[(u32, u16)]) {
        for &(addr, value) in writes {
            match self.block_of(addr) {
                Some(block) if self.locked[block] => {
                    self.status |= SR_PROGRAM_ERROR | SR_LOCKED;
                    return;
                }
                Some(_) => self.rom[addr as usize / 2] &= value,
                None => {
                    self.status |= SR_PROGRAM_ERROR;
                    return;
                }
            }
        }
        self.program_count += 1;
    }

    fn flash_write(&mut self, offset: u32, value: u8) {
        let seq = self.flash_seq;
        self.flash_seq = FlashSeq::Ready;
        match seq {
            FlashSeq::WriteByte => {
                let index = self.bank * BACKUP_FLASH_BANK_SIZE + offset as usize;
                if !self.stuck_busy {
                    if let Some(byte) = self.save.get_mut(index) {
                        *byte &= value;
                    }
                }
            }
            FlashSeq::SwitchBank => {
                if offset == 0 {
                    self.bank = value as usize & 1;
                }
            }
            FlashSeq::Ready if offset == BACKUP_FLASH_CMD_ADDR && value == BACKUP_FLASH_ENABLE_1 => {
                self.flash_seq = FlashSeq::Unlock1
            }
            FlashSeq::EraseArmed
                if offset == BACKUP_FLASH_CMD_ADDR && value == BACKUP_FLASH_ENABLE_1 =>
            {
                self.flash_seq = FlashSeq::EraseUnlock1
            }
            FlashSeq::Unlock1 if offset == BACKUP_FLASH_ENABLE_ADDR && value == BACKUP_FLASH_ENABLE_2 => {
                self.flash_seq = FlashSeq::Unlock2
            }
            FlashSeq::EraseUnlock1
                if offset == BACKUP_FLASH_ENABLE_ADDR && value == BACKUP_FLASH_ENABLE_2 =>
            {
                self.flash_seq = FlashSeq::EraseUnlock2
            }
            FlashSeq::Unlock2 if offset == BACKUP_FLASH_CMD_ADDR => {
                self.flash_seq = match value {
                    BACKUP_FLASH_ERASE => FlashSeq::EraseArmed,
                    BACKUP_FLASH_WRITE => FlashSeq::WriteByte,
                    BACKUP_FLASH_SWITCH_BANK => FlashSeq::SwitchBank,
                    _ => FlashSeq::Ready,
                }
            }
            FlashSeq::EraseUnlock2 if value == BACKUP_FLASH_ERASE_SECTOR => {
                if !self.stuck_busy {
                    let sector = offset as usize / BACKUP_FLASH_SECTOR_SIZE * BACKUP_FLASH_SECTOR_SIZE;
                    let start = self.bank * BACKUP_FLASH_BANK_SIZE + sector;
                    if let Some(bytes) = self.save.get_mut(start..start + BACKUP_FLASH_SECTOR_SIZE) {
                        bytes.fill(BACKUP_FLASH_ERASED);
                    }
                }
            }
            _ => {}
        }
    }
}

impl CartBus for SimCart {
    fn rom_read(&mut self, addr: u32) -> u16 {
        match self.mode {
            RomMode::ReadArray => self.rom_halfword(addr as usize / 2),
            RomMode::ReadId => match (addr as usize % BLOCK_SIZE) / 2 {
                0 => (self.id >> 16) as u16,
                1 => self.id as u16,
                2 => self.block_of(addr).map_or(0, |b| self.locked[b] as u16),
                _ => 0,
            },
            // Extended status: the write buffer is free whenever the chip is.
            RomMode::BufferCount => {
                if self.stuck_busy {
                    0
                } else {
                    J3_SR_READY as u16
                }
            }
            _ => self.reported_status(),
        }
    }

    fn rom_write(&mut self, addr: u32, value: u16) {
        match core::mem::replace(&mut self.mode, RomMode::ReadStatus) {
            RomMode::EraseSetup => {
                if value == J3_CONFIRM {
                    self.erase(addr);
                } else {
                    self.status |= SR_ERASE_ERROR | SR_PROGRAM_ERROR;
                }
                return;
            }
            RomMode::LockSetup => {
                if value != J3_CONFIRM {
                    self.status |= SR_ERASE_ERROR | SR_PROGRAM_ERROR;
                } else if self.lock_clear_fails {
                    self.status |= SR_ERASE_ERROR;
                } else {
                    self.locked.fill(false);
                }
                return;
            }
            RomMode::BufferCount => {
                self.mode = RomMode::BufferData {
                    remaining: value as u32 + 1,
                    writes: Vec::new(),
                };
                return;
            }
            RomMode::BufferData {
                remaining,
                mut writes,
            } => {
                writes.push((addr, value));
                self.mode = if remaining > 1 {
                    RomMode::BufferData {
                        remaining: remaining - 1,
                        writes,
                    }
                } else {
                    RomMode::BufferConfirm { writes }
                };
                return;
            }
            RomMode::BufferConfirm { writes } => {
                if value == J3_CONFIRM {
                    self.program(&writes);
                } else {
                    self.status |= SR_ERASE_ERROR | SR_PROGRAM_ERROR;
                }
                return;
            }
            previous => self.mode = previous,
        }

        match value {
            J3_READ_ARRAY => self.mode = RomMode::ReadArray,
            J3_READ_ID => self.mode = RomMode::ReadId,
            J3_READ_STATUS => self.mode = RomMode::ReadStatus,
            J3_CLEAR_STATUS => self.status = J3_SR_READY,
            J3_BLOCK_ERASE => self.mode = RomMode::EraseSetup,
            J3_LOCK_SETUP => self.mode = RomMode::LockSetup,
            J3_WRITE_BUFFER if !self.stuck_busy => self.mode = RomMode::BufferCount,
            J3_WRITE_BUFFER => self.mode = RomMode::ReadStatus,
            _ => {}
        }
    }

    fn save_read(&mut self, offset: u32) -> u8 {
        match self.backup {
            BackupKind::Sram => self.save.get(offset as usize).copied().unwrap_or(0),
            BackupKind::Flash if self.stuck_busy => 0,
            BackupKind::Flash => {
                let index = self.bank * BACKUP_FLASH_BANK_SIZE + offset as usize;
                self.save.get(index).copied().unwrap_or(0)
            }
        }
    }

    fn save_write(&mut self, offset: u32, value: u8) {
        match self.backup {
            BackupKind::Sram => {
                if let Some(byte) = self.save.get_mut(offset as usize) {
                    *byte = value;
                }
            }
            BackupKind::Flash => self.flash_write(offset, value),
        }
    }

    fn eeprom_read(&mut self, block: u16, addr_bits: u8) -> [u8; 8] {
        self.eeprom_addr_bits = addr_bits;
        let start = block as usize * EEPROM_BLOCK_SIZE;
        let mut out = [0u8; EEPROM_BLOCK_SIZE];
        if let Some(bytes) = self.eeprom.get(start..start + EEPROM_BLOCK_SIZE) {
            out.copy_from_slice(bytes);
        }
        out
    }

    fn eeprom_write(&mut self, block: u16, addr_bits: u8, data: &[u8; 8]) {
        self.eeprom_addr_bits = addr_bits;
        let start = block as usize * EEPROM_BLOCK_SIZE;
        if let Some(bytes) = self.eeprom.get_mut(start..start + EEPROM_BLOCK_SIZE) {
            bytes.copy_from_slice(data);
        }
    }

    fn eeprom_ready(&mut self) -> bool {
        !self.stuck_busy
    }
}

// =============================================================================
// Loopback link
// =============================================================================

/// In-process serial link: every exchange runs the device FSM, and the worker
/// gets to run after `worker_latency` BUSY exchanges.
pub struct Loopback<'c, 'b, C: CartBus> {
    ctx: &'c DeviceContext<'b>,
    worker: Worker<C>,
    /// Word preloaded for the host's next exchange.
    pending: u32,
    worker_latency: u32,
    busy_exchanges: u32,
    corrupt_uploads: u32,
    corrupt_downloads: u32,
    exchanges: u64,
    commands: Vec<u32>,
}

impl<'c, 'b, C: CartBus> Loopback<'c, 'b, C> {
    pub fn new(ctx: &'c DeviceContext<'b>, cart: C) -> Self {
        Self::with_worker(ctx, Worker::new(cart, WorkerConfig { poll_limit: 256 }))
    }

    pub fn with_worker(ctx: &'c DeviceContext<'b>, worker: Worker<C>) -> Self {
        Self {
            ctx,
            worker,
            pending: STATE_IDLE,
            worker_latency: 0,
            busy_exchanges: 0,
            corrupt_uploads: 0,
            corrupt_downloads: 0,
            exchanges: 0,
            commands: Vec::new(),
        }
    }

    /// Let the worker run only after this many exchanges seen BUSY.
    pub fn set_worker_latency(&mut self, exchanges: u32) {
        self.worker_latency = exchanges;
    }

    /// Flip a bit in the next `count` uploaded payload words.
    pub fn corrupt_uploads(&mut self, count: u32) {
        self.corrupt_uploads = count;
    }

    /// Flip a bit in the next `count` downloaded payload words.
    pub fn corrupt_downloads(&mut self, count: u32) {
        self.corrupt_downloads = count;
    }

    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// Worker command words the device latched, in order.
    pub fn worker_commands(&self) -> &[u32] {
        &self.commands
    }

    pub fn cart(&mut self) -> &mut C {
        self.worker.cart()
    }

    pub fn into_cart(self) -> C {
        self.worker.into_cart()
    }
}

impl<C: CartBus> WordTransport for Loopback<'_, '_, C> {
    type Error = Infallible;

    fn exchange_word(&mut self, out: u32) -> Result<u32, Infallible> {
        self.exchanges += 1;
        let before = self.ctx.state();

        let mut word = out;
        if matches!(before, DeviceState::Uploading { .. }) && self.corrupt_uploads > 0 {
            self.corrupt_uploads -= 1;
            word ^= 1;
        }
        if before == DeviceState::Idle && Command::decode(word).is_worker() {
            self.commands.push(word);
        }

        let mut next = fsm::on_word(self.ctx, word);
        if matches!(before, DeviceState::Downloading { .. }) && self.corrupt_downloads > 0 {
            self.corrupt_downloads -= 1;
            next ^= 1;
        }
        let reply = core::mem::replace(&mut self.pending, next);

        if self.ctx.state() == DeviceState::WorkerBusy {
            if self.busy_exchanges >= self.worker_latency {
                self.busy_exchanges = 0;
                self.worker.poll(self.ctx);
            } else {
                self.busy_exchanges += 1;
            }
        }
        Ok(reply)
    }
}

/// Delay that returns immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDelay;

impl embedded_hal::delay::DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::config::STATE_BUSY;

    #[test]
    fn id_mode_and_back() {
        let mut cart = SimCart::new(1).with_id(0x0089_0017);
        cart.rom_write(0, J3_READ_ID);
        assert_eq!(cart.rom_read(0), 0x0089);
        assert_eq!(cart.rom_read(2), 0x0017);
        cart.rom_write(0, J3_READ_ARRAY);
        assert_eq!(cart.rom_read(0), 0xffff);
    }

    #[test]
    fn status_errors_are_sticky_until_cleared() {
        let mut cart = SimCart::new(1);
        cart.fail_next_erases(1);
        cart.rom_write(0, J3_BLOCK_ERASE);
        cart.rom_write(0, J3_CONFIRM);
        assert_eq!(cart.rom_read(0) as u8, J3_SR_READY | SR_ERASE_ERROR);
        cart.rom_write(0, J3_BLOCK_ERASE);
        cart.rom_write(0, J3_CONFIRM);
        assert_eq!(cart.rom_read(0) as u8, J3_SR_READY | SR_ERASE_ERROR);
        cart.rom_write(0, J3_CLEAR_STATUS);
        assert_eq!(cart.rom_read(0) as u8, J3_SR_READY);
        assert_eq!(cart.erase_count(), 1);
    }

    #[test]
    fn loopback_lags_one_word() {
        let mut buf = Buffer::new();
        buf.set_word(0, 0x0102_0304);
        let ctx = DeviceContext::new(&mut buf);
        let mut link = Loopback::new(&ctx, SimCart::new(1));

        let download = Command::Download { words: 1 }.encode();
        assert_eq!(link.exchange_word(download), Ok(STATE_IDLE));
        assert_eq!(link.exchange_word(0), Ok(0x0102_0304));
        assert_eq!(link.exchanges(), 2);
    }

    #[test]
    fn worker_latency_shows_busy() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let mut link = Loopback::new(&ctx, SimCart::new(1));
        link.set_worker_latency(2);

        let id = Command::Id { block: 0 }.encode();
        link.exchange_word(id).unwrap();
        assert_eq!(link.exchange_word(0), Ok(STATE_BUSY));
        assert_eq!(link.exchange_word(0), Ok(STATE_BUSY));
        assert_eq!(link.exchange_word(0), Ok(STATE_BUSY));
        assert_eq!(link.exchange_word(0), Ok(STATE_IDLE));
        assert_eq!(link.worker_commands(), &[id]);
    }
}
