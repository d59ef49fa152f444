use embedded_hal::delay::DelayNs;

use super::{HostError, WordTransport};
use crate::config::{BUFFER_SIZE, HOST_POLL_INTERVAL_US, HOST_POLL_LIMIT, STATE_IDLE};
use crate::protocol::{Command, CMD_NOP};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    /// Pause between NOP polls while the device is busy.
    pub poll_interval_us: u32,
    /// NOP polls before [`HostError::Timeout`].
    pub poll_limit: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: HOST_POLL_INTERVAL_US,
            poll_limit: HOST_POLL_LIMIT,
        }
    }
}

/// Host end of the serial link.
pub struct Link<T: WordTransport, D: DelayNs> {
    transport: T,
    delay: D,
    config: LinkConfig,
}

impl<T: WordTransport, D: DelayNs> Link<T, D> {
    pub fn new(transport: T, delay: D, config: LinkConfig) -> Self {
        Self {
            transport,
            delay,
            config,
        }
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> (T, D) {
        (self.transport, self.delay)
    }

    pub fn exchange(&mut self, word: u32) -> Result<u32, HostError<T::Error>> {
        self.transport
            .exchange_word(word)
            .map_err(HostError::Transport)
    }

    /// Stream `data` into the device buffer starting at offset 0.
    pub fn upload(&mut self, data: &[u8]) -> Result<(), HostError<T::Error>> {
        let words = transfer_words(data.len())?;
        debug!("uploading {} bytes", data.len());
        self.exchange(Command::Upload { words }.encode())?;
        for chunk in data.chunks_exact(4) {
            self.exchange(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))?;
        }
        Ok(())
    }

    /// Fill `out` from the device buffer starting at offset 0.
    pub fn download(&mut self, out: &mut [u8]) -> Result<(), HostError<T::Error>> {
        let words = transfer_words(out.len())?;
        debug!("downloading {} bytes", out.len());
        self.exchange(Command::Download { words }.encode())?;
        for chunk in out.chunks_exact_mut(4) {
            let word = self.exchange(CMD_NOP)?;
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// Send NOPs until the device answers IDLE.
    pub fn wait_idle(&mut self) -> Result<(), HostError<T::Error>> {
        for _ in 0..self.config.poll_limit {
            let reply = self.exchange(CMD_NOP)?;
            if reply == STATE_IDLE {
                return Ok(());
            }
            trace!("waiting, response: 0x{:08x}", reply);
            self.delay.delay_us(self.config.poll_interval_us);
        }
        error!("device still busy after {} polls", self.config.poll_limit);
        Err(HostError::Timeout)
    }

    /// Run one worker command and return its register result.
    pub fn worker(&mut self, command: u32) -> Result<u32, HostError<T::Error>> {
        self.exchange(command)?;
        self.wait_idle()?;
        self.exchange(Command::Read.encode())?;
        let result = self.exchange(CMD_NOP)?;
        debug!("command 0x{:08x}, response: 0x{:08x}", command, result);
        Ok(result)
    }

    /// CRC-32 of the first `len` bytes of the device buffer.
    pub fn remote_crc32(&mut self, len: u32) -> Result<u32, HostError<T::Error>> {
        self.worker(Command::Crc32 { len }.encode())
    }
}

fn transfer_words<E>(len: usize) -> Result<u32, HostError<E>> {
    if len == 0 || len % 4 != 0 || len > BUFFER_SIZE {
        return Err(HostError::InvalidLength { len });
    }
    Ok((len / 4) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::context::{DeviceContext, DeviceState};
    use crate::crc32::crc32;
    use crate::sim::{Loopback, NoDelay, SimCart};

    fn link<'c, 'b>(
        ctx: &'c DeviceContext<'b>,
    ) -> Link<Loopback<'c, 'b, SimCart>, NoDelay> {
        Link::new(Loopback::new(ctx, SimCart::new(1)), NoDelay, LinkConfig::default())
    }

    #[test]
    fn upload_then_download() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let mut link = link(&ctx);

        let data: Vec<u8> = (0..64u8).collect();
        link.upload(&data).unwrap();
        assert_eq!(ctx.state(), DeviceState::Idle);

        let mut out = vec![0; 64];
        link.download(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(ctx.state(), DeviceState::Idle);
    }

    #[test]
    fn rejects_bad_lengths() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let mut link = link(&ctx);

        for len in [0, 3, BUFFER_SIZE + 4] {
            let err = link.upload(&vec![0; len]).unwrap_err();
            assert_eq!(err, HostError::InvalidLength { len });
        }
        assert_eq!(link.transport().exchanges(), 0);
    }

    #[test]
    fn worker_reads_result_after_busy() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let mut link = link(&ctx);
        link.transport().set_worker_latency(5);

        let data = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        link.upload(&data).unwrap();
        assert_eq!(link.remote_crc32(8).unwrap(), crc32(&data));
        assert_eq!(ctx.state(), DeviceState::Idle);
    }

    #[test]
    fn stuck_worker_times_out() {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let config = LinkConfig {
            poll_interval_us: 0,
            poll_limit: 4,
        };
        let mut link = Link::new(Loopback::new(&ctx, SimCart::new(1)), NoDelay, config);
        link.transport().set_worker_latency(100);

        assert_eq!(link.remote_crc32(4), Err(HostError::Timeout));
        assert_eq!(HostError::<()>::Timeout.exit_code(), -3);
    }
}
