// https://wiki.osdev.org/Paging

// Frame numbers are 20 bits wide on the 32-bit platforms we support, so the
// conversions below cannot truncate real addresses.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user-mode entry pointing at the frame containing `phys_addr`,
    /// which must be below 4 GiB.
    ///
    /// The accessed and dirty bits start out clear, as they do when the kernel
    /// writes a fresh entry and before the processor touches the page.
    pub fn user_mapping(phys_addr: usize, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new((phys_addr / PAGE_FRAME_SIZE) as u32))
    }

    /// Physical address of the frame this entry points at.
    pub fn phys_addr(&self) -> usize {
        self.page_frame_address().value() as usize * PAGE_FRAME_SIZE
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    /// Keeps only the low 32 bits of `addr`; callers on wider hosts must
    /// check the range first.
    pub fn new(addr: usize) -> Self {
        Self::new_with_raw_value(addr as u32)
    }

    /// Virtual page number: the directory and table indices taken together.
    pub fn page_number(&self) -> usize {
        (self.raw_value() / PAGE_FRAME_SIZE as u32) as usize
    }
}
