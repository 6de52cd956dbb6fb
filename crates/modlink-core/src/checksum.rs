//! Frame checksums: CRC16 for RTU and LRC for ASCII.

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const CRC16_TABLE: [u16; 256] = build_crc16_table();

/// Byte order of the two CRC bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CrcOrder {
    /// Low byte first, as RTU frames carry it.
    #[default]
    LowHigh,
    HighLow,
}

/// Modbus CRC16 (reflected polynomial 0xA001, seed 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, byte| {
        let idx = usize::from((crc ^ u16::from(*byte)) as u8);
        (crc >> 8) ^ CRC16_TABLE[idx]
    })
}

pub fn crc16_bytes(data: &[u8], order: CrcOrder) -> [u8; 2] {
    let crc = crc16(data);
    match order {
        CrcOrder::LowHigh => crc.to_le_bytes(),
        CrcOrder::HighLow => crc.to_be_bytes(),
    }
}

/// Check `frame` whose last two bytes are its CRC.
pub fn verify_crc16(frame: &[u8], order: CrcOrder) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (payload, tail) = frame.split_at(frame.len() - 2);
    crc16_bytes(payload, order) == [tail[0], tail[1]]
}

/// Two's complement of the modulo-256 byte sum.
pub fn lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1)
}

/// Check `frame` whose last byte is its LRC.
pub fn verify_lrc(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((check, payload)) => lrc(payload) == *check,
        None => false,
    }
}
