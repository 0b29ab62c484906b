//! Fixed-size pool of DMA-visible TD and QH slots.
//!
//! The pool carves one DMA-coherent region into 16-byte QH slots followed by
//! 16-byte TD slots, so every handle maps to a deterministic physical address
//! usable in hardware link words. Handles are stable indices; the pool itself
//! never touches descriptor contents.

use crate::error::{HcdError, Result};

/// Hardware descriptors are 16 bytes and must be 16-byte aligned.
pub const DESC_SIZE: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TdHandle(pub u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QhHandle(pub u16);

pub struct DescriptorPool {
    base: u32,
    qh_count: u16,
    td_count: u16,
    free_qhs: Vec<u16>,
    free_tds: Vec<u16>,
}

impl DescriptorPool {
    /// `base` must be 16-byte aligned and the region must span
    /// `(qh_count + td_count) * 16` bytes of DMA-coherent memory.
    pub fn new(base: u32, qh_count: u16, td_count: u16) -> Self {
        debug_assert_eq!(base % DESC_SIZE, 0, "pool base must be 16-byte aligned");
        Self {
            base,
            qh_count,
            td_count,
            free_qhs: (0..qh_count).rev().collect(),
            free_tds: (0..td_count).rev().collect(),
        }
    }

    pub fn alloc_qh(&mut self) -> Result<QhHandle> {
        self.free_qhs
            .pop()
            .map(QhHandle)
            .ok_or(HcdError::PoolExhausted)
    }

    pub fn alloc_td(&mut self) -> Result<TdHandle> {
        self.free_tds
            .pop()
            .map(TdHandle)
            .ok_or(HcdError::PoolExhausted)
    }

    pub fn free_qh(&mut self, qh: QhHandle) {
        debug_assert!(qh.0 < self.qh_count);
        debug_assert!(!self.free_qhs.contains(&qh.0), "QH double free");
        self.free_qhs.push(qh.0);
    }

    pub fn free_td(&mut self, td: TdHandle) {
        debug_assert!(td.0 < self.td_count);
        debug_assert!(!self.free_tds.contains(&td.0), "TD double free");
        self.free_tds.push(td.0);
    }

    pub fn qh_phys(&self, qh: QhHandle) -> u32 {
        self.base + u32::from(qh.0) * DESC_SIZE
    }

    pub fn td_phys(&self, td: TdHandle) -> u32 {
        self.base + (u32::from(self.qh_count) + u32::from(td.0)) * DESC_SIZE
    }

    pub fn tds_available(&self) -> usize {
        self.free_tds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_physical_addresses() {
        let pool = DescriptorPool::new(0x1000, 4, 8);
        assert_eq!(pool.qh_phys(QhHandle(0)), 0x1000);
        assert_eq!(pool.qh_phys(QhHandle(3)), 0x1030);
        assert_eq!(pool.td_phys(TdHandle(0)), 0x1040);
        assert_eq!(pool.td_phys(TdHandle(7)), 0x10b0);
    }

    #[test]
    fn exhaustion_is_a_submission_error() {
        let mut pool = DescriptorPool::new(0x1000, 1, 2);
        pool.alloc_td().unwrap();
        pool.alloc_td().unwrap();
        assert!(matches!(pool.alloc_td(), Err(HcdError::PoolExhausted)));

        pool.alloc_qh().unwrap();
        assert!(matches!(pool.alloc_qh(), Err(HcdError::PoolExhausted)));
    }

    #[test]
    fn free_returns_slots() {
        let mut pool = DescriptorPool::new(0, 1, 1);
        let td = pool.alloc_td().unwrap();
        pool.free_td(td);
        assert_eq!(pool.alloc_td().unwrap(), td);
    }
}
