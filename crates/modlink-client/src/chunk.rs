//! Splitting of long reads and writes into protocol-sized requests.
//!
//! Offsets advance in elementary units (registers or bits), never in values.
//! For values `width` registers wide each request carries
//! `floor(limit / width) * width` units, so no value straddles two requests.

use crate::ClientError;
use modlink_core::pdu::ADDRESS_SPACE;

/// Registers per FC03/FC04 request.
pub const READ_REGISTER_LIMIT: usize = 124;
/// Registers per FC16 request.
pub const WRITE_REGISTER_LIMIT: usize = 123;
/// Bits per FC01/FC02 request.
pub const READ_BIT_LIMIT: usize = 2000;
/// Coils per FC15 request.
pub const WRITE_COIL_LIMIT: usize = 1968;

/// One sub-request of a [`ChunkPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub address: u16,
    /// Position of the chunk's first unit in the caller's buffer.
    pub offset: usize,
    pub units: u16,
}

impl Chunk {
    /// The caller's buffer range this chunk covers.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + usize::from(self.units)
    }
}

/// Iterator over the sub-requests needed to move `total` units starting at
/// `address`.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    address: u16,
    total: usize,
    step: usize,
    next: usize,
}

impl ChunkPlan {
    pub fn new(address: u16, total: usize, limit: usize, width: usize) -> Result<Self, ClientError> {
        if width == 0 || width > limit {
            return Err(ClientError::Validation("value width exceeds the per-request limit"));
        }
        if total == 0 {
            return Err(ClientError::Validation("quantity must be at least one"));
        }
        if usize::from(address) + total > ADDRESS_SPACE as usize {
            return Err(ClientError::Validation("address range runs past 65535"));
        }
        Ok(Self {
            address,
            total,
            step: limit / width * width,
            next: 0,
        })
    }

    /// Units per full chunk.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn chunk_count(&self) -> usize {
        self.total.div_ceil(self.step)
    }
}

impl Iterator for ChunkPlan {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.total {
            return None;
        }
        let units = (self.total - self.next).min(self.step);
        // address + offset stays below ADDRESS_SPACE, checked in `new`.
        let chunk = Chunk {
            address: self.address.wrapping_add(self.next as u16),
            offset: self.next,
            units: units as u16,
        };
        self.next += units;
        Some(chunk)
    }
}
