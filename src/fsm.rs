/// Serial word handler: the per-exchange state machine.
///
/// `on_word` is called from the SIO interrupt with the word the host just
/// clocked in. It returns the word to preload into the data register, which
/// the host receives on its *next* exchange. Every branch runs in bounded time.
use crate::buffer::Buffer;
use crate::config::{STATE_BUSY, STATE_IDLE};
use crate::context::{DeviceContext, DeviceState, Shared};
use crate::protocol::Command;

pub fn on_word(ctx: &DeviceContext<'_>, incoming: u32) -> u32 {
    let (reply, wake_worker) = ctx.with_locked(|shared, buffer| {
        let state = shared.state;
        match state {
            DeviceState::Idle => idle(shared, buffer, incoming),
            DeviceState::Uploading { len, offset } => {
                (uploading(shared, buffer, incoming, len, offset), false)
            }
            DeviceState::Downloading { len, offset } => {
                (downloading(shared, buffer, len, offset), false)
            }
            DeviceState::Reading => {
                shared.state = DeviceState::Idle;
                (STATE_IDLE, false)
            }
            DeviceState::WorkerBusy => (STATE_BUSY, false),
        }
    });

    if wake_worker {
        ctx.worker_signal().signal(());
    }
    reply
}

// =============================================================================
// Idle: decode a new command
// =============================================================================

fn idle(shared: &mut Shared, buffer: Option<&mut Buffer>, incoming: u32) -> (u32, bool) {
    let command = Command::decode(incoming);
    match command {
        Command::Upload { words } => {
            debug!("uploading {} bytes", words << 2);
            shared.state = DeviceState::Uploading {
                len: words,
                offset: 0,
            };
            (STATE_IDLE, false)
        }
        Command::Download { words } => {
            debug!("downloading {} bytes", words << 2);
            // The reply slot is free now, so prefetch the first word.
            let first = read_word(buffer, 0);
            shared.state = DeviceState::Downloading {
                len: words,
                offset: 1,
            };
            (first, false)
        }
        Command::Read => {
            shared.state = DeviceState::Reading;
            (shared.register, false)
        }
        Command::Nop => (STATE_IDLE, false),
        Command::MultibootPing => {
            info!("multiboot ping ignored, flasher is running");
            (STATE_IDLE, false)
        }
        cmd if cmd.is_worker() => {
            trace!("worker command: 0x{:08x}", incoming);
            shared.register = incoming;
            shared.state = DeviceState::WorkerBusy;
            (STATE_BUSY, true)
        }
        _ => {
            warn!("invalid command 0x{:08x}", incoming);
            (STATE_IDLE, false)
        }
    }
}

// =============================================================================
// Transfers
// =============================================================================

fn uploading(
    shared: &mut Shared,
    buffer: Option<&mut Buffer>,
    incoming: u32,
    len: u32,
    mut offset: u32,
) -> u32 {
    if offset < len {
        write_word(buffer, offset, incoming);
        offset += 1;
    }
    shared.state = if offset >= len {
        debug!("upload complete");
        DeviceState::Idle
    } else {
        DeviceState::Uploading { len, offset }
    };
    STATE_IDLE
}

fn downloading(shared: &mut Shared, buffer: Option<&mut Buffer>, len: u32, offset: u32) -> u32 {
    if offset < len {
        shared.state = DeviceState::Downloading {
            len,
            offset: offset + 1,
        };
        read_word(buffer, offset)
    } else {
        debug!("download complete");
        shared.state = DeviceState::Idle;
        STATE_IDLE
    }
}

fn read_word(buffer: Option<&mut Buffer>, offset: u32) -> u32 {
    match buffer.and_then(|buf| buf.word(offset as usize)) {
        Some(word) => word,
        None => {
            warn!("download offset {} outside buffer", offset);
            0
        }
    }
}

fn write_word(buffer: Option<&mut Buffer>, offset: u32, value: u32) {
    let stored = buffer.is_some_and(|buf| buf.set_word(offset as usize, value));
    if !stored {
        warn!("upload offset {} outside buffer, word dropped", offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BUFFER_WORDS;
    use crate::protocol::{CMD_NOP, MULTIBOOT_PING};

    fn upload_cmd(words: u32) -> u32 {
        Command::Upload { words }.encode()
    }

    fn download_cmd(words: u32) -> u32 {
        Command::Download { words }.encode()
    }

    #[test]
    fn upload_stores_words_and_returns_idle() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);

        assert_eq!(on_word(&ctx, upload_cmd(2)), STATE_IDLE);
        assert_eq!(
            ctx.state(),
            DeviceState::Uploading { len: 2, offset: 0 }
        );
        assert_eq!(on_word(&ctx, 0xaaaa_aaaa), STATE_IDLE);
        assert_eq!(
            ctx.state(),
            DeviceState::Uploading { len: 2, offset: 1 }
        );
        assert_eq!(on_word(&ctx, 0xbbbb_bbbb), STATE_IDLE);
        assert_eq!(ctx.state(), DeviceState::Idle);

        let words = ctx.with_buffer(|b| (b.word(0), b.word(1), b.word(2))).unwrap();
        assert_eq!(words, (Some(0xaaaa_aaaa), Some(0xbbbb_bbbb), Some(0)));
    }

    #[test]
    fn zero_length_upload_consumes_nothing() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);

        on_word(&ctx, upload_cmd(0));
        assert_eq!(on_word(&ctx, 0x1234_5678), STATE_IDLE);
        assert_eq!(ctx.state(), DeviceState::Idle);
        assert_eq!(ctx.with_buffer(|b| b.word(0)), Some(Some(0)));
    }

    #[test]
    fn download_prefetches_first_word() {
        let mut buf = Buffer::new();
        buf.set_word(0, 0x1111_1111);
        buf.set_word(1, 0x2222_2222);
        let ctx = DeviceContext::new(&mut buf);

        assert_eq!(on_word(&ctx, download_cmd(2)), 0x1111_1111);
        assert_eq!(on_word(&ctx, CMD_NOP), 0x2222_2222);
        assert_eq!(
            ctx.state(),
            DeviceState::Downloading { len: 2, offset: 2 }
        );
        // The host's second read consumes the reply above; this exchange ends it.
        assert_eq!(on_word(&ctx, CMD_NOP), STATE_IDLE);
        assert_eq!(ctx.state(), DeviceState::Idle);
    }

    #[test]
    fn out_of_range_transfers_do_not_panic() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let words = BUFFER_WORDS as u32 + 1;

        on_word(&ctx, upload_cmd(words));
        for i in 0..words {
            on_word(&ctx, i);
        }
        assert_eq!(ctx.state(), DeviceState::Idle);

        on_word(&ctx, download_cmd(words));
        let mut last = STATE_IDLE;
        for _ in 1..words {
            last = on_word(&ctx, CMD_NOP);
        }
        // Word index BUFFER_WORDS does not exist and reads back as zero.
        assert_eq!(last, 0);
    }

    #[test]
    fn read_returns_register_then_idles() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        ctx.with_locked(|shared, _| shared.register = 0xcafe_f00d);

        assert_eq!(on_word(&ctx, Command::Read.encode()), 0xcafe_f00d);
        assert_eq!(ctx.state(), DeviceState::Reading);
        assert_eq!(on_word(&ctx, 0xffff_ffff), STATE_IDLE);
        assert_eq!(ctx.state(), DeviceState::Idle);
    }

    #[test]
    fn worker_command_latches_and_blocks() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let cmd = Command::Crc32 { len: 16 }.encode();

        assert_eq!(on_word(&ctx, cmd), STATE_BUSY);
        assert_eq!(ctx.state(), DeviceState::WorkerBusy);
        assert_eq!(ctx.register(), cmd);
        assert!(ctx.worker_signal().signaled());

        // A second worker command is refused while the first is in flight.
        let other = Command::Erase { block: 0 }.encode();
        assert_eq!(on_word(&ctx, other), STATE_BUSY);
        assert_eq!(ctx.register(), cmd);
    }

    #[test]
    fn nop_ping_and_garbage_keep_idle() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);

        for word in [CMD_NOP, MULTIBOOT_PING, 0x7f00_0000, 0x0000_0001] {
            assert_eq!(on_word(&ctx, word), STATE_IDLE);
            assert_eq!(ctx.state(), DeviceState::Idle);
        }
        assert!(!ctx.worker_signal().signaled());
    }
}
