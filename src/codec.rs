//! Conversion between raw Modbus register words and typed values.
//!
//! Each register contributes two bytes, ordered by [`ByteOrder`]. Values wider
//! than one register take their registers in [`WordOrder`], applied per value.
//! The assembled bytes of a value are then read most significant first.

use std::fmt;
use std::str::FromStr;

pub type Word = u16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown data type '{0}' (expected int8, int16, int32 or float32)")]
    UnknownDataType(String),
    #[error("unknown byte/word order '{0}' (expected big or little)")]
    UnknownOrder(String),
    #[error("byte length {byte_length} is not a multiple of the {data_type} width")]
    Misaligned {
        data_type: DataType,
        byte_length: usize,
    },
    #[error("insufficient data: {needed} registers required, {available} supplied")]
    InsufficientData { needed: usize, available: usize },
}

/// Order of the two bytes inside one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Order of the registers making up one multi-register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    Big,
    Little,
}

fn parse_order(s: &str) -> Result<bool, DecodeError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "big" => Ok(true),
        "little" => Ok(false),
        _ => Err(DecodeError::UnknownOrder(s.to_string())),
    }
}

impl FromStr for ByteOrder {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if parse_order(s)? { Self::Big } else { Self::Little })
    }
}

impl FromStr for WordOrder {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if parse_order(s)? { Self::Big } else { Self::Little })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Float32,
}

impl DataType {
    /// Width of one value in bytes.
    pub const fn width(self) -> usize {
        match self {
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 | DataType::Float32 => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
        }
    }

    const fn words_per_value(self) -> usize {
        match self {
            DataType::Int8 | DataType::Int16 => 1,
            DataType::Int32 | DataType::Float32 => 2,
        }
    }

    // `bytes` is exactly `self.width()` long
    fn read(self, bytes: &[u8]) -> DecodedValue {
        match self {
            DataType::Int8 => DecodedValue::I8(i8::from_be_bytes([bytes[0]])),
            DataType::Int16 => DecodedValue::I16(i16::from_be_bytes([bytes[0], bytes[1]])),
            DataType::Int32 => {
                DecodedValue::I32(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            DataType::Float32 => {
                DecodedValue::F32(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
        }
    }
}

impl FromStr for DataType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int8" => Ok(DataType::Int8),
            "int16" => Ok(DataType::Int16),
            "int32" => Ok(DataType::Int32),
            "float32" => Ok(DataType::Float32),
            _ => Err(DecodeError::UnknownDataType(s.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedValue {
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
}

impl DecodedValue {
    pub fn data_type(&self) -> DataType {
        match self {
            DecodedValue::I8(_) => DataType::Int8,
            DecodedValue::I16(_) => DataType::Int16,
            DecodedValue::I32(_) => DataType::Int32,
            DecodedValue::F32(_) => DataType::Float32,
        }
    }

    fn to_be_bytes(self) -> Vec<u8> {
        match self {
            DecodedValue::I8(v) => v.to_be_bytes().to_vec(),
            DecodedValue::I16(v) => v.to_be_bytes().to_vec(),
            DecodedValue::I32(v) => v.to_be_bytes().to_vec(),
            DecodedValue::F32(v) => v.to_be_bytes().to_vec(),
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::I8(v) => write!(f, "{v}"),
            DecodedValue::I16(v) => write!(f, "{v}"),
            DecodedValue::I32(v) => write!(f, "{v}"),
            DecodedValue::F32(v) => write!(f, "{v}"),
        }
    }
}

fn word_bytes(word: Word, byte_order: ByteOrder) -> [u8; 2] {
    match byte_order {
        ByteOrder::Big => word.to_be_bytes(),
        ByteOrder::Little => word.to_le_bytes(),
    }
}

/// Decode `byte_length` bytes worth of `data_type` values from `words`.
///
/// Returns exactly `byte_length / data_type.width()` values. Fails if the
/// length is not a whole number of values or if `words` is too short; extra
/// trailing words are ignored.
pub fn decode(
    words: &[Word],
    data_type: DataType,
    byte_order: ByteOrder,
    word_order: WordOrder,
    byte_length: usize,
) -> Result<Vec<DecodedValue>, DecodeError> {
    let width = data_type.width();
    if byte_length % width != 0 {
        return Err(DecodeError::Misaligned {
            data_type,
            byte_length,
        });
    }

    let needed = byte_length.div_ceil(2);
    if words.len() < needed {
        return Err(DecodeError::InsufficientData {
            needed,
            available: words.len(),
        });
    }

    let mut bytes = Vec::with_capacity(needed * 2);
    for group in words[..needed].chunks(data_type.words_per_value()) {
        match word_order {
            WordOrder::Big => group
                .iter()
                .for_each(|&w| bytes.extend_from_slice(&word_bytes(w, byte_order))),
            WordOrder::Little => group
                .iter()
                .rev()
                .for_each(|&w| bytes.extend_from_slice(&word_bytes(w, byte_order))),
        }
    }

    Ok(bytes[..byte_length]
        .chunks_exact(width)
        .map(|chunk| data_type.read(chunk))
        .collect())
}

/// Encode values into register words, the inverse of [`decode`].
///
/// Values are expected to share one data type. A trailing odd int8 is padded
/// with a zero byte.
pub fn encode(values: &[DecodedValue], byte_order: ByteOrder, word_order: WordOrder) -> Vec<Word> {
    let mut bytes = Vec::new();
    for value in values {
        let be = value.to_be_bytes();
        if word_order == WordOrder::Little && value.data_type().words_per_value() > 1 {
            be.chunks(2)
                .rev()
                .for_each(|pair| bytes.extend_from_slice(pair));
        } else {
            bytes.extend_from_slice(&be);
        }
    }
    if bytes.len() % 2 == 1 {
        bytes.push(0);
    }

    bytes
        .chunks_exact(2)
        .map(|pair| match byte_order {
            ByteOrder::Big => Word::from_be_bytes([pair[0], pair[1]]),
            ByteOrder::Little => Word::from_le_bytes([pair[0], pair[1]]),
        })
        .collect()
}

/// How a register block is turned into one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    pub word_order: WordOrder,
    pub byte_length: usize,
}

impl RegisterLayout {
    pub fn decode(&self, words: &[Word]) -> Result<Vec<DecodedValue>, DecodeError> {
        decode(
            words,
            self.data_type,
            self.byte_order,
            self.word_order,
            self.byte_length,
        )
    }

    /// Number of values one decode yields.
    pub fn value_count(&self) -> usize {
        self.byte_length / self.data_type.width()
    }
}
