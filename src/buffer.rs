/// The 128 KiB working buffer shared by the serial FSM and the worker.
use core::ops::Range;

use crate::config::BUFFER_SIZE;

#[repr(C, align(4))]
pub struct Buffer {
    bytes: [u8; BUFFER_SIZE],
}

impl Buffer {
    pub const fn new() -> Self {
        Self {
            bytes: [0; BUFFER_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn span(index: usize, width: usize) -> Option<Range<usize>> {
        let start = index.checked_mul(width)?;
        Some(start..start.checked_add(width)?)
    }

    /// 32-bit word at `index` (little-endian), `None` past the end.
    pub fn word(&self, index: usize) -> Option<u32> {
        let raw = self.bytes.get(Self::span(index, 4)?)?;
        Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Store a 32-bit word; returns `false` if `index` is past the end.
    pub fn set_word(&mut self, index: usize, value: u32) -> bool {
        match Self::span(index, 4).and_then(|span| self.bytes.get_mut(span)) {
            Some(raw) => {
                raw.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn halfword(&self, index: usize) -> Option<u16> {
        let raw = self.bytes.get(Self::span(index, 2)?)?;
        Some(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn set_halfword(&mut self, index: usize, value: u16) -> bool {
        match Self::span(index, 2).and_then(|span| self.bytes.get_mut(span)) {
            Some(raw) => {
                raw.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Clamp a host-supplied byte length to the buffer capacity.
    pub fn clamp_len(len: u32) -> usize {
        (len as usize).min(BUFFER_SIZE)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
