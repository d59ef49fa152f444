/// Game Pak bus as seen by the worker.
///
/// Implemented by the firmware on top of the cartridge address space (ROM at
/// 0x0800_0000, SRAM/backup flash at 0x0E00_0000, EEPROM over DMA) and by
/// [`crate::sim::SimCart`] on the host. Addresses are offsets from the start of
/// each region.
pub trait CartBus {
    /// 16-bit read from ROM space. `addr` is a byte offset.
    fn rom_read(&mut self, addr: u32) -> u16;

    /// 16-bit write to ROM space; used to issue flash commands and data.
    fn rom_write(&mut self, addr: u32, value: u16);

    /// 8-bit read from the save (SRAM / backup flash) space.
    fn save_read(&mut self, offset: u32) -> u8;

    /// 8-bit write to the save (SRAM / backup flash) space.
    fn save_write(&mut self, offset: u32, value: u8);

    /// Read one 64-bit EEPROM block using `addr_bits` wide addressing.
    fn eeprom_read(&mut self, block: u16, addr_bits: u8) -> [u8; 8];

    /// Start writing one 64-bit EEPROM block. Completion is polled with
    /// [`CartBus::eeprom_ready`].
    fn eeprom_write(&mut self, block: u16, addr_bits: u8, data: &[u8; 8]);

    /// True once the last EEPROM write has completed.
    fn eeprom_ready(&mut self) -> bool;
}

impl<T: CartBus + ?Sized> CartBus for &mut T {
    fn rom_read(&mut self, addr: u32) -> u16 {
        (**self).rom_read(addr)
    }

    fn rom_write(&mut self, addr: u32, value: u16) {
        (**self).rom_write(addr, value)
    }

    fn save_read(&mut self, offset: u32) -> u8 {
        (**self).save_read(offset)
    }

    fn save_write(&mut self, offset: u32, value: u8) {
        (**self).save_write(offset, value)
    }

    fn eeprom_read(&mut self, block: u16, addr_bits: u8) -> [u8; 8] {
        (**self).eeprom_read(block, addr_bits)
    }

    fn eeprom_write(&mut self, block: u16, addr_bits: u8, data: &[u8; 8]) {
        (**self).eeprom_write(block, addr_bits, data)
    }

    fn eeprom_ready(&mut self) -> bool {
        (**self).eeprom_ready()
    }
}
