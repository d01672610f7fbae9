use crate::error::DecodeError;
use super::{ByteOrder, DataType, RegisterSpec};

/// Register content before scaling
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    Integer(i128),
    Float(f64),
}

/// Bring the words into big-endian byte order (ABCD)
pub fn to_bytes(words: &[u16], order: ByteOrder) -> Vec<u8> {
    let mut words = words.to_vec();
    if order.swaps_words() {
        words.reverse();
    }

    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        let word = if order.swaps_bytes() { word.swap_bytes() } else { word };
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    return bytes;
}

fn be_value(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b))
}

pub fn combine(words: &[u16], spec: &RegisterSpec) -> Result<RawValue, DecodeError> {
    if spec.length != spec.data_type.words() {
        return Err(DecodeError::WidthMismatch { data_type: spec.data_type, length: spec.length });
    }
    if words.len() != usize::from(spec.length) {
        return Err(DecodeError::LengthMismatch { expected: usize::from(spec.length), actual: words.len() });
    }

    let v = be_value(&to_bytes(words, spec.byte_order()));

    let raw = match spec.data_type {
        DataType::Int16 => RawValue::Integer(i128::from(v as u16 as i16)),
        DataType::Int32 => RawValue::Integer(i128::from(v as u32 as i32)),
        DataType::Int64 => RawValue::Integer(i128::from(v as i64)),
        DataType::Uint16 | DataType::Uint32 | DataType::Uint64
            | DataType::Bitfield16 | DataType::Bitfield32 => RawValue::Integer(i128::from(v)),
        DataType::Float32 => RawValue::Float(f64::from(f32::from_bits(v as u32))),
        DataType::Float64 => RawValue::Float(f64::from_bits(v)),
    };
    Ok(raw)
}

/// Scales like 0.1 or 0.001 are applied as a division so 2300 * 0.1 stays 230.0
pub fn apply_scale(value: f64, scale: f64) -> f64 {
    if scale == 1.0 {
        return value;
    }
    if scale != 0.0 && scale.abs() < 1.0 {
        let divisor = 1.0 / scale;
        if (divisor - divisor.round()).abs() < 1e-9 {
            return value / divisor.round();
        }
    }
    value * scale
}

/// Turn the raw words of a register into its value
pub fn decode(words: &[u16], spec: &RegisterSpec) -> Result<f64, DecodeError> {
    let value = match combine(words, spec)? {
        RawValue::Integer(v) if spec.data_type.is_bitfield() => return Ok(v as f64),
        RawValue::Integer(v) => apply_scale(v as f64, spec.scale),
        RawValue::Float(v) => apply_scale(v, spec.scale),
    };

    if value == 0.0 {
        if let Some(zero) = spec.zero_value {
            return Ok(zero);
        }
    }
    Ok(value)
}
