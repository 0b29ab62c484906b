//! DMA-coherent memory access.
//!
//! Everything the controller hardware walks (frame list, queue heads, transfer
//! descriptors) lives in DMA-visible physical memory reached through
//! [`MemoryBus`]. The driver never holds Rust references into this memory;
//! descriptors are read and written field-at-a-time so that single-word updates
//! remain the only mutations performed while the hardware may be traversing the
//! schedule concurrently.

/// Physical memory shared with the controller.
///
/// In production this is the platform's DMA window; in tests it is a plain
/// buffer that the test doubles as "hardware" by flipping status words in.
pub trait MemoryBus {
    fn read_physical(&mut self, paddr: u32, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u32, buf: &[u8]);

    fn read_u32(&mut self, paddr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u32(&mut self, paddr: u32, value: u32) {
        self.write_physical(paddr, &value.to_le_bytes());
    }
}
