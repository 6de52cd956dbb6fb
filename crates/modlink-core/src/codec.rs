//! Conversion between 16-bit register words and typed values.
//!
//! Multi-word numbers are assembled by laying the words out in [`WordOrder`],
//! splitting each word low byte first and reading the result as a
//! little-endian number. Text is the exception: it uses the wire's natural
//! big-endian byte order per word and ignores the word order entirely.

use crate::{DecodeError, EncodeError};
use core::fmt;
use core::str::FromStr;

/// Order of the 16-bit words that make up a multi-register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum WordOrder {
    /// Least significant word at the lowest address.
    #[default]
    LowHigh,
    /// Most significant word at the lowest address.
    HighLow,
}

impl FromStr for WordOrder {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low-high" | "lowhigh" | "lh" => Ok(Self::LowHigh),
            "high-low" | "highlow" | "hl" => Ok(Self::HighLow),
            _ => Err(DecodeError::Message("word order must be low-high or high-low")),
        }
    }
}

fn gather(words: &[u16], order: WordOrder, bytes: &mut [u8]) -> Result<(), DecodeError> {
    let count = bytes.len() / 2;
    if words.len() < count {
        return Err(DecodeError::InvalidLength);
    }
    for (i, pair) in bytes.chunks_exact_mut(2).enumerate() {
        let word = match order {
            WordOrder::LowHigh => words[i],
            WordOrder::HighLow => words[count - 1 - i],
        };
        pair.copy_from_slice(&word.to_le_bytes());
    }
    Ok(())
}

fn scatter(bytes: &[u8], order: WordOrder, out: &mut [u16]) -> Result<(), EncodeError> {
    let count = bytes.len() / 2;
    if out.len() < count {
        return Err(EncodeError::BufferTooSmall);
    }
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let word = u16::from_le_bytes([pair[0], pair[1]]);
        match order {
            WordOrder::LowHigh => out[i] = word,
            WordOrder::HighLow => out[count - 1 - i] = word,
        }
    }
    Ok(())
}

/// A fixed-width number stored in one or more consecutive registers.
pub trait RegisterValue: Copy + PartialEq + fmt::Debug {
    /// Registers occupied by one value.
    const WORDS: usize;
    const KIND: ScalarKind;

    fn from_words(words: &[u16], order: WordOrder) -> Result<Self, DecodeError>;

    fn write_words(self, order: WordOrder, out: &mut [u16]) -> Result<(), EncodeError>;
}

macro_rules! register_value {
    ($ty:ty, $words:literal, $kind:ident) => {
        impl RegisterValue for $ty {
            const WORDS: usize = $words;
            const KIND: ScalarKind = ScalarKind::$kind;

            fn from_words(words: &[u16], order: WordOrder) -> Result<Self, DecodeError> {
                let mut bytes = [0u8; $words * 2];
                gather(words, order, &mut bytes)?;
                Ok(<$ty>::from_le_bytes(bytes))
            }

            fn write_words(self, order: WordOrder, out: &mut [u16]) -> Result<(), EncodeError> {
                scatter(&self.to_le_bytes(), order, out)
            }
        }
    };
}

register_value!(u16, 1, U16);
register_value!(i16, 1, I16);
register_value!(u32, 2, U32);
register_value!(i32, 2, I32);
register_value!(u64, 4, U64);
register_value!(i64, 4, I64);
register_value!(f32, 2, F32);
register_value!(f64, 4, F64);

/// Decode `out.len()` consecutive values from `words`.
pub fn decode_values<T: RegisterValue>(
    words: &[u16],
    order: WordOrder,
    out: &mut [T],
) -> Result<(), DecodeError> {
    if words.len() < out.len() * T::WORDS {
        return Err(DecodeError::InvalidLength);
    }
    for (value, chunk) in out.iter_mut().zip(words.chunks_exact(T::WORDS)) {
        *value = T::from_words(chunk, order)?;
    }
    Ok(())
}

/// Encode `values` back to back into `out`.
pub fn encode_values<T: RegisterValue>(
    values: &[T],
    order: WordOrder,
    out: &mut [u16],
) -> Result<(), EncodeError> {
    if out.len() < values.len() * T::WORDS {
        return Err(EncodeError::BufferTooSmall);
    }
    for (value, chunk) in values.iter().zip(out.chunks_exact_mut(T::WORDS)) {
        value.write_words(order, chunk)?;
    }
    Ok(())
}

/// Closed set of value kinds a register or point can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ScalarKind {
    Bit,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Text,
}

impl ScalarKind {
    /// Registers per value, `None` for bits and variable-length text.
    pub const fn words(self) -> Option<usize> {
        match self {
            Self::Bit | Self::Text => None,
            Self::I16 | Self::U16 => Some(1),
            Self::I32 | Self::U32 | Self::F32 => Some(2),
            Self::I64 | Self::U64 | Self::F64 => Some(4),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bit => "bit",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScalarKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bit" | "bool" => Self::Bit,
            "i16" => Self::I16,
            "u16" => Self::U16,
            "i32" => Self::I32,
            "u32" => Self::U32,
            "i64" => Self::I64,
            "u64" => Self::U64,
            "f32" => Self::F32,
            "f64" => Self::F64,
            "text" | "string" => Self::Text,
            _ => return Err(DecodeError::Message("unknown scalar kind")),
        })
    }
}

/// Bit `index` (0 = least significant) of `word`.
pub const fn bit_of(word: u16, index: u8) -> bool {
    index < 16 && (word >> index) & 1 != 0
}

pub const fn with_bit(word: u16, index: u8, value: bool) -> u16 {
    if index >= 16 {
        return word;
    }
    if value {
        word | (1 << index)
    } else {
        word & !(1 << index)
    }
}

/// Apply an FC22 mask: bits set in `and_mask` keep their current value,
/// the rest are taken from `or_mask`.
pub const fn apply_mask(current: u16, and_mask: u16, or_mask: u16) -> u16 {
    (current & and_mask) | (or_mask & !and_mask)
}

/// Pack bits least significant first; returns the number of bytes used.
pub fn pack_bits(bits: &[bool], out: &mut [u8]) -> Result<usize, EncodeError> {
    let used = bits.len().div_ceil(8);
    if out.len() < used {
        return Err(EncodeError::BufferTooSmall);
    }
    out[..used].fill(0);
    for (i, _) in bits.iter().enumerate().filter(|(_, bit)| **bit) {
        out[i / 8] |= 1 << (i % 8);
    }
    Ok(used)
}

/// Unpack `out.len()` bits from LSB-first packed bytes.
pub fn unpack_bits(packed: &[u8], out: &mut [bool]) -> Result<(), DecodeError> {
    if packed.len() * 8 < out.len() {
        return Err(DecodeError::InvalidLength);
    }
    for (i, bit) in out.iter_mut().enumerate() {
        *bit = packed[i / 8] & (1 << (i % 8)) != 0;
    }
    Ok(())
}

#[cfg(feature = "alloc")]
mod value {
    use super::{RegisterValue, ScalarKind, WordOrder};
    use crate::{DecodeError, EncodeError};
    use alloc::string::{String, ToString};
    use alloc::vec;
    use alloc::vec::Vec;
    use core::fmt;

    /// A decoded register or point value.
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[cfg_attr(feature = "serde", serde(untagged))]
    pub enum Value {
        Bit(bool),
        I16(i16),
        U16(u16),
        I32(i32),
        U32(u32),
        I64(i64),
        U64(u64),
        F32(f32),
        F64(f64),
        Text(String),
    }

    fn one<T: RegisterValue>(words: &[u16], order: WordOrder) -> Result<T, DecodeError> {
        T::from_words(words, order)
    }

    fn words_of<T: RegisterValue>(value: T, order: WordOrder) -> Result<Vec<u16>, EncodeError> {
        let mut out = vec![0u16; T::WORDS];
        value.write_words(order, &mut out)?;
        Ok(out)
    }

    impl Value {
        pub fn kind(&self) -> ScalarKind {
            match self {
                Self::Bit(_) => ScalarKind::Bit,
                Self::I16(_) => ScalarKind::I16,
                Self::U16(_) => ScalarKind::U16,
                Self::I32(_) => ScalarKind::I32,
                Self::U32(_) => ScalarKind::U32,
                Self::I64(_) => ScalarKind::I64,
                Self::U64(_) => ScalarKind::U64,
                Self::F32(_) => ScalarKind::F32,
                Self::F64(_) => ScalarKind::F64,
                Self::Text(_) => ScalarKind::Text,
            }
        }

        /// Decode a register-backed value. Text consumes every word given.
        pub fn from_words(
            kind: ScalarKind,
            words: &[u16],
            order: WordOrder,
        ) -> Result<Self, DecodeError> {
            Ok(match kind {
                ScalarKind::Bit => return Err(DecodeError::Unsupported),
                ScalarKind::I16 => Self::I16(one(words, order)?),
                ScalarKind::U16 => Self::U16(one(words, order)?),
                ScalarKind::I32 => Self::I32(one(words, order)?),
                ScalarKind::U32 => Self::U32(one(words, order)?),
                ScalarKind::I64 => Self::I64(one(words, order)?),
                ScalarKind::U64 => Self::U64(one(words, order)?),
                ScalarKind::F32 => Self::F32(one(words, order)?),
                ScalarKind::F64 => Self::F64(one(words, order)?),
                ScalarKind::Text => Self::Text(decode_text(words)),
            })
        }

        /// Register words for this value. Bits have no register form.
        pub fn to_words(&self, order: WordOrder) -> Result<Vec<u16>, EncodeError> {
            match self {
                Self::Bit(_) => Err(EncodeError::Unsupported),
                Self::I16(v) => words_of(*v, order),
                Self::U16(v) => words_of(*v, order),
                Self::I32(v) => words_of(*v, order),
                Self::U32(v) => words_of(*v, order),
                Self::I64(v) => words_of(*v, order),
                Self::U64(v) => words_of(*v, order),
                Self::F32(v) => words_of(*v, order),
                Self::F64(v) => words_of(*v, order),
                Self::Text(text) => {
                    let mut out = vec![0u16; text.len().div_ceil(2)];
                    encode_text(text, &mut out);
                    Ok(out)
                }
            }
        }

        /// Parse user input as a value of `kind`.
        pub fn parse(kind: ScalarKind, input: &str) -> Result<Self, DecodeError> {
            let input = input.trim();
            let bad = DecodeError::Message("value does not parse as the requested kind");
            Ok(match kind {
                ScalarKind::Bit => Self::Bit(match input {
                    "1" | "true" | "on" => true,
                    "0" | "false" | "off" => false,
                    _ => return Err(bad),
                }),
                ScalarKind::I16 => Self::I16(input.parse().map_err(|_| bad)?),
                ScalarKind::U16 => Self::U16(input.parse().map_err(|_| bad)?),
                ScalarKind::I32 => Self::I32(input.parse().map_err(|_| bad)?),
                ScalarKind::U32 => Self::U32(input.parse().map_err(|_| bad)?),
                ScalarKind::I64 => Self::I64(input.parse().map_err(|_| bad)?),
                ScalarKind::U64 => Self::U64(input.parse().map_err(|_| bad)?),
                ScalarKind::F32 => Self::F32(input.parse().map_err(|_| bad)?),
                ScalarKind::F64 => Self::F64(input.parse().map_err(|_| bad)?),
                ScalarKind::Text => Self::Text(input.to_string()),
            })
        }
    }

    impl fmt::Display for Value {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Bit(v) => write!(f, "{}", u8::from(*v)),
                Self::I16(v) => write!(f, "{v}"),
                Self::U16(v) => write!(f, "{v}"),
                Self::I32(v) => write!(f, "{v}"),
                Self::U32(v) => write!(f, "{v}"),
                Self::I64(v) => write!(f, "{v}"),
                Self::U64(v) => write!(f, "{v}"),
                Self::F32(v) => write!(f, "{v}"),
                Self::F64(v) => write!(f, "{v}"),
                Self::Text(v) => f.write_str(v),
            }
        }
    }

    /// Words as big-endian byte pairs, UTF-8 with trailing NULs removed.
    pub fn decode_text(words: &[u16]) -> String {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let end = bytes
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |last| last + 1);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    /// Fill `out` with `text`, truncating or zero padding to fit.
    pub fn encode_text(text: &str, out: &mut [u16]) {
        let bytes = text.as_bytes();
        for (i, word) in out.iter_mut().enumerate() {
            let hi = bytes.get(i * 2).copied().unwrap_or(0);
            let lo = bytes.get(i * 2 + 1).copied().unwrap_or(0);
            *word = u16::from_be_bytes([hi, lo]);
        }
    }
}

#[cfg(feature = "alloc")]
pub use value::{decode_text, encode_text, Value};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_high_puts_least_significant_word_first() {
        let mut words = [0u16; 2];
        0x1234_5678u32.write_words(WordOrder::LowHigh, &mut words).unwrap();
        assert_eq!(words, [0x5678, 0x1234]);
        0x1234_5678u32.write_words(WordOrder::HighLow, &mut words).unwrap();
        assert_eq!(words, [0x1234, 0x5678]);
    }

    #[test]
    fn decodes_floats_in_both_orders() {
        // 1.5f32 = 0x3FC0_0000
        assert_eq!(f32::from_words(&[0x0000, 0x3FC0], WordOrder::LowHigh).unwrap(), 1.5);
        assert_eq!(f32::from_words(&[0x3FC0, 0x0000], WordOrder::HighLow).unwrap(), 1.5);
    }

    #[test]
    fn sixty_four_bit_word_layout() {
        let mut words = [0u16; 4];
        (-2i64).write_words(WordOrder::HighLow, &mut words).unwrap();
        assert_eq!(words, [0xFFFF, 0xFFFF, 0xFFFF, 0xFFFE]);
        assert_eq!(i64::from_words(&words, WordOrder::HighLow).unwrap(), -2);
    }

    #[test]
    fn too_few_words_is_an_error() {
        assert_eq!(
            u32::from_words(&[1], WordOrder::LowHigh).unwrap_err(),
            DecodeError::InvalidLength
        );
        let mut out = [0u16; 1];
        assert_eq!(
            1.0f64.write_words(WordOrder::LowHigh, &mut out).unwrap_err(),
            EncodeError::BufferTooSmall
        );
    }

    #[test]
    fn value_slices_roundtrip() {
        let values = [1i32, -1, i32::MAX];
        let mut words = [0u16; 6];
        encode_values(&values, WordOrder::HighLow, &mut words).unwrap();
        let mut back = [0i32; 3];
        decode_values(&words, WordOrder::HighLow, &mut back).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn bit_helpers() {
        assert!(bit_of(0x8001, 0));
        assert!(bit_of(0x8001, 15));
        assert!(!bit_of(0x8001, 1));
        assert!(!bit_of(0xFFFF, 16));
        assert_eq!(with_bit(0x0000, 3, true), 0x0008);
        assert_eq!(with_bit(0xFFFF, 3, false), 0xFFF7);
    }

    #[test]
    fn mask_keeps_bits_set_in_and_mask() {
        // Example from the Modbus application protocol (FC22).
        assert_eq!(apply_mask(0x0012, 0x00F2, 0x0025), 0x0017);
        assert_eq!(apply_mask(0xABCD, 0xFFFF, 0x0000), 0xABCD);
        assert_eq!(apply_mask(0xABCD, 0x0000, 0x1234), 0x1234);
    }

    #[test]
    fn bits_pack_lsb_first() {
        let bits = [true, false, true, true, false, false, true, false, true];
        let mut packed = [0xFFu8; 4];
        assert_eq!(pack_bits(&bits, &mut packed).unwrap(), 2);
        assert_eq!(&packed[..2], &[0b0100_1101, 0b0000_0001]);

        let mut back = [false; 9];
        unpack_bits(&packed[..2], &mut back).unwrap();
        assert_eq!(back, bits);

        let mut too_many = [false; 17];
        assert_eq!(
            unpack_bits(&packed[..2], &mut too_many).unwrap_err(),
            DecodeError::InvalidLength
        );
    }

    #[test]
    fn scalar_kind_parsing() {
        assert_eq!("f32".parse::<ScalarKind>().unwrap(), ScalarKind::F32);
        assert_eq!("string".parse::<ScalarKind>().unwrap(), ScalarKind::Text);
        assert!("u8".parse::<ScalarKind>().is_err());
        assert_eq!(ScalarKind::U64.words(), Some(4));
        assert_eq!(ScalarKind::Bit.words(), None);
        assert_eq!("high-low".parse::<WordOrder>().unwrap(), WordOrder::HighLow);
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn text_is_big_endian_per_word() {
        let mut words = [0u16; 3];
        encode_text("ABC", &mut words);
        assert_eq!(words, [0x4142, 0x4300, 0x0000]);
        assert_eq!(decode_text(&words), "ABC");
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn dynamic_values_dispatch_by_kind() {
        let value = Value::parse(ScalarKind::F32, "2.5").unwrap();
        let words = value.to_words(WordOrder::LowHigh).unwrap();
        assert_eq!(words, [0x0000, 0x4020]);
        assert_eq!(
            Value::from_words(ScalarKind::F32, &words, WordOrder::LowHigh).unwrap(),
            Value::F32(2.5)
        );
        assert_eq!(
            Value::from_words(ScalarKind::Bit, &words, WordOrder::LowHigh).unwrap_err(),
            DecodeError::Unsupported
        );
        assert_eq!(Value::parse(ScalarKind::Bit, "on").unwrap(), Value::Bit(true));
        assert_eq!(Value::U16(7).to_string(), "7");
    }
}
