/// Runs the long operations latched by the serial FSM.
///
/// The FSM keeps answering BUSY while a job runs. The worker takes the buffer
/// out of the device context for the whole job, then hands it back together
/// with the result in one critical section.
use crate::backup::{self, SaveError};
use crate::buffer::Buffer;
use crate::cart::CartBus;
use crate::config::{
    BLOCK_SIZE, BUFFER_SIZE, DEVICE_POLL_LIMIT, INTEL_MANUFACTURER_ID, ROM_WINDOW_SIZE,
    STATUS_TIMEOUT,
};
use crate::context::DeviceContext;
use crate::crc32::crc32;
use crate::protocol::{block_address, Command};
use crate::strata_flash::{chip_name, StrataFlash};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WorkerConfig {
    /// Upper bound on status reads for any single hardware wait.
    pub poll_limit: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_limit: DEVICE_POLL_LIMIT,
        }
    }
}

pub struct Worker<C: CartBus> {
    cart: C,
    config: WorkerConfig,
}

impl<C: CartBus> Worker<C> {
    pub fn new(cart: C, config: WorkerConfig) -> Self {
        Self { cart, config }
    }

    pub fn cart(&mut self) -> &mut C {
        &mut self.cart
    }

    pub fn into_cart(self) -> C {
        self.cart
    }

    /// Run the pending job, if any. Returns whether a job ran.
    ///
    /// Call from the main loop (e.g. after every VBlank wait) or let
    /// [`Worker::run`] drive it.
    pub fn poll(&mut self, ctx: &DeviceContext<'_>) -> bool {
        let Some(word) = ctx.pending_job() else {
            return false;
        };

        // The FSM never touches the buffer while WorkerBusy, so it is here.
        let Some(buffer) = ctx.take_buffer() else {
            error!("buffer not available for worker command 0x{:08x}", word);
            return false;
        };

        let result = self.execute(word, buffer);
        ctx.finish_job(buffer, result);
        true
    }

    /// Worker task body: sleep until the FSM latches a command, then run it.
    pub async fn run(&mut self, ctx: &DeviceContext<'_>) {
        loop {
            ctx.worker_signal().wait().await;
            while self.poll(ctx) {}
        }
    }

    /// Execute one command word against `buffer`; returns the new register
    /// value.
    pub fn execute(&mut self, word: u32, buffer: &mut Buffer) -> u32 {
        let poll_limit = self.config.poll_limit;
        let command = Command::decode(word);
        if let Some(block) = rom_block(command) {
            if !in_rom_window(block) {
                error!("block 0x{:06x} outside the ROM window", block);
                return match command {
                    Command::Dump { .. } => word,
                    Command::Verify { .. } => (BUFFER_SIZE / 2) as u32,
                    // Status / ID with SR.7 clear.
                    _ => 0,
                };
            }
        }

        match command {
            Command::Crc32 { len } => {
                let crc = crc32(&buffer.as_bytes()[..Buffer::clamp_len(len)]);
                info!("CRC32(0x{:06x}): 0x{:08x}", len, crc);
                crc
            }

            Command::Id { block } => {
                let id = self.flash().read_id(block_address(block));
                match chip_name(id) {
                    Some(name) => info!("flash ID 0x{:08x}: {}", id, name),
                    None if (id >> 16) as u16 == INTEL_MANUFACTURER_ID => {
                        warn!("flash ID 0x{:08x}: unsupported Intel part", id)
                    }
                    None => warn!("flash ID 0x{:08x}: unsupported", id),
                }
                id
            }
            Command::Unlock { block } => {
                let status = self.flash().clear_lock_bits(block_address(block));
                info!("clear lock bits @0x{:06x}: 0x{:02x}", block, status);
                status as u32
            }
            Command::Erase { block } => {
                let status = self.flash().erase_block(block_address(block));
                info!("erase @0x{:06x}: 0x{:02x}", block, status);
                status as u32
            }
            Command::Program { block } => {
                let status = self.flash().program(block_address(block), buffer);
                info!("program @0x{:06x}: 0x{:02x}", block, status);
                status as u32
            }
            Command::Verify { block } => {
                let mismatches = self.flash().verify(block_address(block), buffer);
                info!("verify @0x{:06x}: {} halfwords differ", block, mismatches);
                mismatches
            }
            Command::Dump { block } => {
                self.flash().dump(block_address(block), buffer);
                info!("dump @0x{:06x} done", block);
                word
            }

            Command::ReadSram { len } => {
                backup::read_sram(&mut self.cart, save_slice(buffer, len));
                word
            }
            Command::WriteSram { len } => {
                backup::write_sram(&mut self.cart, save_slice(buffer, len));
                word
            }
            Command::ReadFlash { len } => {
                backup::read_flash(&mut self.cart, save_slice(buffer, len));
                word
            }
            Command::WriteFlash { len } => {
                let result = backup::write_flash(&mut self.cart, save_slice(buffer, len), poll_limit);
                save_status(word, result)
            }
            Command::ReadEeprom { len } => {
                backup::read_eeprom(&mut self.cart, save_slice(buffer, len));
                word
            }
            Command::WriteEeprom { len } => {
                let result = backup::write_eeprom(&mut self.cart, save_slice(buffer, len), poll_limit);
                save_status(word, result)
            }

            _ => {
                warn!("invalid worker command 0x{:08x}", word);
                word
            }
        }
    }

    fn flash(&mut self) -> StrataFlash<'_, C> {
        StrataFlash::new(&mut self.cart, self.config.poll_limit)
    }
}

/// Block parameter of commands that address cartridge ROM.
fn rom_block(command: Command) -> Option<u32> {
    match command {
        Command::Id { block }
        | Command::Unlock { block }
        | Command::Erase { block }
        | Command::Program { block }
        | Command::Verify { block }
        | Command::Dump { block } => Some(block),
        _ => None,
    }
}

/// Whether a whole erase block at `block` fits in the ROM window.
fn in_rom_window(block: u32) -> bool {
    block_address(block)
        .checked_add(BLOCK_SIZE as u32)
        .is_some_and(|end| end <= ROM_WINDOW_SIZE)
}

fn save_slice(buffer: &mut Buffer, len: u32) -> &mut [u8] {
    &mut buffer.as_bytes_mut()[..Buffer::clamp_len(len)]
}

fn save_status(word: u32, result: Result<(), SaveError>) -> u32 {
    match result {
        Ok(()) => word,
        Err(SaveError::Timeout { offset }) => {
            error!("save write timed out at 0x{:06x}", offset);
            STATUS_TIMEOUT
        }
    }
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::config::{BLOCK_SIZE, DEFAULT_FLASH_ID, J3_SR_READY, STATE_BUSY, STATE_IDLE};
    use crate::context::DeviceState;
    use crate::fsm::on_word;
    use crate::protocol::block_param;
    use crate::sim::SimCart;

    fn worker(cart: &mut SimCart) -> Worker<&mut SimCart> {
        Worker::new(cart, WorkerConfig { poll_limit: 64 })
    }

    #[test]
    fn idle_context_has_no_job() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let mut cart = SimCart::new(1);
        assert!(!worker(&mut cart).poll(&ctx));
    }

    #[test]
    fn crc_job_publishes_result_and_idles() {
        let mut buf = Buffer::new();
        for (i, w) in [0x1111_1111u32, 0x2222_2222, 0x3333_3333, 0x4444_4444]
            .into_iter()
            .enumerate()
        {
            buf.set_word(i, w);
        }
        let expected = crc32(&buf.as_bytes()[..16]);
        let ctx = DeviceContext::new(&mut buf);
        let mut cart = SimCart::new(1);
        let mut worker = worker(&mut cart);

        assert_eq!(on_word(&ctx, Command::Crc32 { len: 16 }.encode()), STATE_BUSY);
        assert_eq!(on_word(&ctx, 0), STATE_BUSY);
        assert!(worker.poll(&ctx));

        assert_eq!(ctx.state(), DeviceState::Idle);
        assert_eq!(ctx.register(), expected);
        assert!(!worker.poll(&ctx));
    }

    #[test]
    fn run_waits_for_signal() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let mut cart = SimCart::new(1);
        let mut worker = worker(&mut cart);

        on_word(&ctx, Command::Id { block: 0 }.encode());
        assert!(embassy_futures::poll_once(worker.run(&ctx)).is_pending());
        assert_eq!(ctx.register(), DEFAULT_FLASH_ID);
        assert_eq!(on_word(&ctx, 0), STATE_IDLE);
    }

    #[test]
    fn erase_program_verify_cycle() {
        let mut data = Buffer::new();
        data.as_bytes_mut().fill(0x5a);
        let mut cart = SimCart::new(2);
        let mut worker = worker(&mut cart);
        let block = block_param(1);

        assert_ne!(worker.execute(Command::Verify { block }.encode(), &mut data), 0);
        assert_eq!(
            worker.execute(Command::Erase { block }.encode(), &mut data),
            J3_SR_READY as u32
        );
        assert_eq!(
            worker.execute(Command::Program { block }.encode(), &mut data),
            J3_SR_READY as u32
        );
        assert_eq!(worker.execute(Command::Verify { block }.encode(), &mut data), 0);

        let mut out = Buffer::new();
        let dump = Command::Dump { block }.encode();
        assert_eq!(worker.execute(dump, &mut out), dump);
        assert_eq!(out.as_bytes(), data.as_bytes());
        assert_eq!(cart.rom_halfword(BLOCK_SIZE / 2), 0x5a5a);
    }

    #[test]
    fn save_write_timeout_is_reported() {
        let mut data = Buffer::new();
        let mut cart = SimCart::new(1);
        cart.set_stuck_busy(true);
        let mut worker = worker(&mut cart);
        let result = worker.execute(Command::WriteEeprom { len: 0x200 }.encode(), &mut data);
        assert_eq!(result, STATUS_TIMEOUT);
    }

    #[test]
    fn sram_copy_leaves_register_as_command() {
        let mut data = Buffer::new();
        data.as_bytes_mut()[..4].copy_from_slice(b"SAVE");
        let mut cart = SimCart::new(1);
        let mut worker = worker(&mut cart);
        let cmd = Command::WriteSram { len: 0x8000 }.encode();
        assert_eq!(worker.execute(cmd, &mut data), cmd);
        assert_eq!(&cart.save_bytes()[..4], b"SAVE");
    }

    #[test]
    fn blocks_outside_rom_window_are_rejected() {
        let mut data = Buffer::new();
        data.as_bytes_mut().fill(0x5a);
        let mut cart = SimCart::new(1);
        let mut worker = worker(&mut cart);

        for block in [0x00ff_ffff, block_param(ROM_WINDOW_SIZE as usize / BLOCK_SIZE)] {
            let status = worker.execute(Command::Program { block }.encode(), &mut data);
            assert_eq!(status & J3_SR_READY as u32, 0);
            let status = worker.execute(Command::Erase { block }.encode(), &mut data);
            assert_eq!(status & J3_SR_READY as u32, 0);
            assert_ne!(worker.execute(Command::Verify { block }.encode(), &mut data), 0);

            let mut out = Buffer::new();
            let dump = Command::Dump { block }.encode();
            assert_eq!(worker.execute(dump, &mut out), dump);
            assert!(out.as_bytes().iter().all(|&b| b == 0));
        }
        assert_eq!(cart.program_count(), 0);
        assert_eq!(cart.erase_count(), 0);
        assert_eq!(cart.rom_halfword(0), 0xffff);
    }

    #[test]
    fn last_block_in_window_is_accepted() {
        let mut data = Buffer::new();
        let mut cart = SimCart::new(1);
        let last = block_param(ROM_WINDOW_SIZE as usize / BLOCK_SIZE - 1);
        // Nothing is fitted there, but the command reaches the chip.
        let status = worker(&mut cart).execute(Command::Erase { block: last }.encode(), &mut data);
        assert_ne!(status & J3_SR_READY as u32, 0);
    }

    #[test]
    fn unknown_command_leaves_register() {
        let mut data = Buffer::new();
        let mut cart = SimCart::new(1);
        assert_eq!(worker(&mut cart).execute(0x7700_0000, &mut data), 0x7700_0000);
    }
}
