//! Channel sample data types

use serde::{Deserialize, Serialize};

/// Byte order of multi-byte fields on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Sample data types announced by the instrument.
/// Discriminants match the DataStream data type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    /// Packed three-byte signed integer
    Int24,
    /// Packed three-byte unsigned integer
    UInt24,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl SampleType {
    /// Returns the size in bytes of one sample of this type.
    pub const fn size(&self) -> usize {
        match self {
            SampleType::Int8 | SampleType::UInt8 => 1,
            SampleType::Int16 | SampleType::UInt16 => 2,
            SampleType::Int24 | SampleType::UInt24 => 3,
            SampleType::Int32 | SampleType::UInt32 | SampleType::Float32 => 4,
            SampleType::Int64 | SampleType::UInt64 | SampleType::Float64 => 8,
        }
    }

    /// Map a wire data type code to a sample type.
    ///
    /// Codes 12 and 13 (complex) and anything above are not supported.
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => SampleType::Int8,
            1 => SampleType::UInt8,
            2 => SampleType::Int16,
            3 => SampleType::UInt16,
            4 => SampleType::Int24,
            5 => SampleType::UInt24,
            6 => SampleType::Int32,
            7 => SampleType::UInt32,
            8 => SampleType::Int64,
            9 => SampleType::UInt64,
            10 => SampleType::Float32,
            11 => SampleType::Float64,
            _ => return None,
        })
    }

    /// Wire data type code.
    pub const fn code(&self) -> u32 {
        match self {
            SampleType::Int8 => 0,
            SampleType::UInt8 => 1,
            SampleType::Int16 => 2,
            SampleType::UInt16 => 3,
            SampleType::Int24 => 4,
            SampleType::UInt24 => 5,
            SampleType::Int32 => 6,
            SampleType::UInt32 => 7,
            SampleType::Int64 => 8,
            SampleType::UInt64 => 9,
            SampleType::Float32 => 10,
            SampleType::Float64 => 11,
        }
    }

    /// Decode one sample from the front of `bytes`.
    ///
    /// Returns `None` if fewer than [`SampleType::size`] bytes are available.
    pub fn decode(&self, bytes: &[u8], order: ByteOrder) -> Option<SampleValue> {
        let raw = bytes.get(..self.size())?;

        macro_rules! read {
            ($ty:ty) => {{
                let array = raw.try_into().ok()?;
                match order {
                    ByteOrder::Little => <$ty>::from_le_bytes(array),
                    ByteOrder::Big => <$ty>::from_be_bytes(array),
                }
            }};
        }

        Some(match self {
            SampleType::Int8 => SampleValue::Int8(raw[0] as i8),
            SampleType::UInt8 => SampleValue::UInt8(raw[0]),
            SampleType::Int16 => SampleValue::Int16(read!(i16)),
            SampleType::UInt16 => SampleValue::UInt16(read!(u16)),
            SampleType::Int24 => {
                let unsigned = read_u24(raw, order);
                // Sign-extend from bit 23
                SampleValue::Int24(((unsigned << 8) as i32) >> 8)
            }
            SampleType::UInt24 => SampleValue::UInt24(read_u24(raw, order)),
            SampleType::Int32 => SampleValue::Int32(read!(i32)),
            SampleType::UInt32 => SampleValue::UInt32(read!(u32)),
            SampleType::Int64 => SampleValue::Int64(read!(i64)),
            SampleType::UInt64 => SampleValue::UInt64(read!(u64)),
            SampleType::Float32 => SampleValue::Float32(read!(f32)),
            SampleType::Float64 => SampleValue::Float64(read!(f64)),
        })
    }
}

fn read_u24(raw: &[u8], order: ByteOrder) -> u32 {
    match order {
        ByteOrder::Little => u32::from(raw[0]) | u32::from(raw[1]) << 8 | u32::from(raw[2]) << 16,
        ByteOrder::Big => u32::from(raw[2]) | u32::from(raw[1]) << 8 | u32::from(raw[0]) << 16,
    }
}

/// A decoded sample, keeping the channel's wire type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int24(i32),
    UInt24(u32),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl SampleValue {
    /// Widen the value to `f64`.
    ///
    /// 64-bit integers above 2^53 lose precision.
    pub fn as_f64(&self) -> f64 {
        match *self {
            SampleValue::Int8(v) => v.into(),
            SampleValue::UInt8(v) => v.into(),
            SampleValue::Int16(v) => v.into(),
            SampleValue::UInt16(v) => v.into(),
            SampleValue::Int24(v) | SampleValue::Int32(v) => v.into(),
            SampleValue::UInt24(v) | SampleValue::UInt32(v) => v.into(),
            SampleValue::Int64(v) => v as f64,
            SampleValue::UInt64(v) => v as f64,
            SampleValue::Float32(v) => v.into(),
            SampleValue::Float64(v) => v,
        }
    }

    /// The sample type this value was decoded as.
    pub fn sample_type(&self) -> SampleType {
        match self {
            SampleValue::Int8(_) => SampleType::Int8,
            SampleValue::UInt8(_) => SampleType::UInt8,
            SampleValue::Int16(_) => SampleType::Int16,
            SampleValue::UInt16(_) => SampleType::UInt16,
            SampleValue::Int24(_) => SampleType::Int24,
            SampleValue::UInt24(_) => SampleType::UInt24,
            SampleValue::Int32(_) => SampleType::Int32,
            SampleValue::UInt32(_) => SampleType::UInt32,
            SampleValue::Int64(_) => SampleType::Int64,
            SampleValue::UInt64(_) => SampleType::UInt64,
            SampleValue::Float32(_) => SampleType::Float32,
            SampleValue::Float64(_) => SampleType::Float64,
        }
    }
}
