use crate::codec::bit_of;

/// Coil states as they travel on the wire: LSB-first packed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBits<'a> {
    quantity: usize,
    bytes: &'a [u8],
}

impl<'a> PackedBits<'a> {
    /// `quantity` is clamped to the bits actually present.
    pub fn new(bytes: &'a [u8], quantity: usize) -> Self {
        Self {
            quantity: quantity.min(bytes.len() * 8),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.quantity
    }

    pub fn is_empty(&self) -> bool {
        self.quantity == 0
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn get(&self, index: usize) -> Option<bool> {
        if index >= self.quantity {
            return None;
        }
        Some(bit_of(u16::from(self.bytes[index / 8]), (index % 8) as u8))
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + 'a {
        let bytes = self.bytes;
        (0..self.quantity).map(move |i| bytes[i / 8] & (1 << (i % 8)) != 0)
    }
}

/// Register values as big-endian byte pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireWords<'a> {
    bytes: &'a [u8],
}

impl<'a> WireWords<'a> {
    /// A trailing odd byte is ignored.
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub const fn len(&self) -> usize {
        self.bytes.len() / 2
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn get(&self, index: usize) -> Option<u16> {
        let offset = index.checked_mul(2)?;
        let pair = self.bytes.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([pair[0], pair[1]]))
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + 'a {
        self.bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }

    /// Copy as many words as fit into `out`; returns the count copied.
    pub fn copy_to(&self, out: &mut [u16]) -> usize {
        let mut copied = 0;
        for (slot, word) in out.iter_mut().zip(self.iter()) {
            *slot = word;
            copied += 1;
        }
        copied
    }
}
