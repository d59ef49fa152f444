/// CRC-32 shared by both ends of the link (reflected 0xEDB88320, complemented
/// init and output). The lookup table is built at compile time.
use crc::{Crc, CRC_32_ISO_HDLC};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}
