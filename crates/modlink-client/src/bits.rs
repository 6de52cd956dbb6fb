//! Access to individual bits inside holding and input registers.
//!
//! A bit position is `(address, bit)` with bit 0 the least significant bit
//! of the word; runs continue into the following registers.

use crate::{ClientError, ModbusClient};
use modlink_core::codec::{bit_of, with_bit};
use modlink_core::pdu::{Table, ADDRESS_SPACE};
use modlink_datalink::DataLink;

const WORD_BITS: usize = 16;

fn check_bit(bit: u8) -> Result<(), ClientError> {
    if usize::from(bit) >= WORD_BITS {
        return Err(ClientError::Validation("bit index must be 0-15"));
    }
    Ok(())
}

/// Registers touched by `count` bits starting at `bit`.
fn registers_spanned(address: u16, bit: u8, count: usize) -> Result<usize, ClientError> {
    check_bit(bit)?;
    if count == 0 {
        return Err(ClientError::Validation("quantity must be at least one"));
    }
    let registers = (usize::from(bit) + count).div_ceil(WORD_BITS);
    if usize::from(address) + registers > ADDRESS_SPACE as usize {
        return Err(ClientError::Validation("address range runs past 65535"));
    }
    Ok(registers)
}

fn pack_word(bits: &[bool]) -> u16 {
    bits.iter()
        .enumerate()
        .fold(0, |word, (i, bit)| with_bit(word, i as u8, *bit))
}

/// FC22 masks that set `bits` at `start` and keep everything else.
fn masks_for(start: u8, bits: &[bool]) -> (u16, u16) {
    let mut and_mask = u16::MAX;
    let mut or_mask = 0;
    for (i, bit) in bits.iter().enumerate() {
        let index = start + i as u8;
        and_mask = with_bit(and_mask, index, false);
        or_mask = with_bit(or_mask, index, *bit);
    }
    (and_mask, or_mask)
}

impl<D: DataLink> ModbusClient<D> {
    pub async fn read_bit(&self, address: u16, bit: u8, input: bool) -> Result<bool, ClientError> {
        self.read_register_bits(address, bit, 1, input)
            .await?
            .first()
            .copied()
            .ok_or(ClientError::InvalidResponse("empty register payload"))
    }

    /// `quantity` bits starting at bit `bit` of register `address`.
    pub async fn read_register_bits(
        &self,
        address: u16,
        bit: u8,
        quantity: usize,
        input: bool,
    ) -> Result<Vec<bool>, ClientError> {
        let registers = registers_spanned(address, bit, quantity)?;
        let words = self
            .read_words_aligned(Table::select(false, input), address, registers, 1)
            .await?;
        Ok((0..quantity)
            .map(|i| {
                let position = usize::from(bit) + i;
                bit_of(words[position / WORD_BITS], (position % WORD_BITS) as u8)
            })
            .collect())
    }

    pub async fn write_bit(&self, address: u16, bit: u8, value: bool) -> Result<(), ClientError> {
        self.write_register_bits(address, bit, &[value]).await
    }

    /// Write a run of bits starting at bit `bit` of holding register `address`.
    ///
    /// A leading partial register is mask-written over its upper bits,
    /// whole registers in between are written in bulk and a trailing
    /// partial register is mask-written over its lower bits. Bits outside
    /// the run keep their value.
    pub async fn write_register_bits(&self, address: u16, bit: u8, values: &[bool]) -> Result<(), ClientError> {
        registers_spanned(address, bit, values.len())?;

        let mut consumed = 0;
        let mut register = address;
        let start = usize::from(bit);
        if start != 0 || values.len() < WORD_BITS {
            let take = (WORD_BITS - start).min(values.len());
            let (and_mask, or_mask) = masks_for(bit, &values[..take]);
            self.mask_write_register(register, and_mask, or_mask)
                .await?;
            consumed = take;
            register = register.wrapping_add(1);
        }

        let whole = (values.len() - consumed) / WORD_BITS;
        if whole > 0 {
            let end = consumed + whole * WORD_BITS;
            let words: Vec<u16> = values[consumed..end]
                .chunks_exact(WORD_BITS)
                .map(pack_word)
                .collect();
            self.write_words(register, &words).await?;
            consumed = end;
            register = register.wrapping_add(whole as u16);
        }

        if consumed < values.len() {
            let (and_mask, or_mask) = masks_for(0, &values[consumed..]);
            self.mask_write_register(register, and_mask, or_mask)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{masks_for, pack_word};
    use crate::tests::MockLink;
    use crate::{ClientConfig, ClientError, ModbusClient};

    #[test]
    fn masks_cover_only_the_run() {
        assert_eq!(masks_for(3, &[true]), (0xFFF7, 0x0008));
        assert_eq!(masks_for(14, &[false, true]), (0x3FFF, 0x8000));
        assert_eq!(pack_word(&[true, false, true]), 0b101);
    }

    #[tokio::test]
    async fn reads_bit_inside_register() {
        let link = MockLink::with_responses(vec![Ok(vec![0x04, 0x02, 0x80, 0x01])]);
        let probe = link.clone();
        let client = ModbusClient::new(link);

        assert!(client.read_bit(7, 15, true).await.unwrap());
        assert_eq!(probe.requests(), vec![vec![0x04, 0x00, 0x07, 0x00, 0x01]]);
    }

    #[tokio::test]
    async fn bit_run_crossing_a_boundary_reads_two_registers() {
        let link = MockLink::with_responses(vec![Ok(vec![0x03, 0x04, 0xC0, 0x00, 0x00, 0x01])]);
        let client = ModbusClient::new(link);
        let bits = client.read_register_bits(0, 14, 3, false).await.unwrap();
        assert_eq!(bits, vec![true, true, true]);
    }

    #[tokio::test]
    async fn out_of_range_bit_index_is_a_validation_error() {
        let link = MockLink::default();
        let probe = link.clone();
        let client = ModbusClient::new(link);
        let err = client.write_bit(0, 16, true).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(probe.call_count(), 0);
    }

    #[tokio::test]
    async fn single_bit_write_uses_mask_write() {
        let link = MockLink::with_responses(vec![Ok(vec![0x16, 0x00, 0x02, 0xFF, 0xDF, 0x00, 0x20])]);
        let probe = link.clone();
        let client = ModbusClient::new(link);

        client.write_bit(2, 5, true).await.unwrap();
        assert_eq!(probe.requests(), vec![vec![0x16, 0x00, 0x02, 0xFF, 0xDF, 0x00, 0x20]]);
    }

    #[tokio::test]
    async fn run_splits_into_head_body_and_tail() {
        // 24 bits from bit 10 of register 0: bits 10-15 of 0, all of 1, bits 0-1 of 2.
        let link = MockLink::with_responses(vec![
            Ok(vec![0x16, 0x00, 0x00, 0x03, 0xFF, 0xFC, 0x00]),
            Ok(vec![0x10, 0x00, 0x01, 0x00, 0x01]),
            Ok(vec![0x16, 0x00, 0x02, 0xFF, 0xFC, 0x00, 0x03]),
        ]);
        let probe = link.clone();
        let client = ModbusClient::new(link);

        client.write_register_bits(0, 10, &[true; 24]).await.unwrap();
        assert_eq!(
            probe.requests(),
            vec![
                vec![0x16, 0x00, 0x00, 0x03, 0xFF, 0xFC, 0x00],
                vec![0x10, 0x00, 0x01, 0x00, 0x01, 0x02, 0xFF, 0xFF],
                vec![0x16, 0x00, 0x02, 0xFF, 0xFC, 0x00, 0x03],
            ]
        );
    }

    #[tokio::test]
    async fn aligned_run_has_no_head() {
        let link = MockLink::with_responses(vec![Ok(vec![0x10, 0x00, 0x04, 0x00, 0x01])]);
        let probe = link.clone();
        let client = ModbusClient::with_config(link, ClientConfig::default());

        let mut values = [false; 16];
        values[0] = true;
        client.write_register_bits(4, 0, &values).await.unwrap();
        assert_eq!(
            probe.requests(),
            vec![vec![0x10, 0x00, 0x04, 0x00, 0x01, 0x02, 0x00, 0x01]]
        );
    }
}
