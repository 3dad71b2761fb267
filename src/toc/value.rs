use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};

/// The types of variables a vehicle exposes, both for logging and for parameters. On the wire,
///  all values are little endian. The numeric ids used to encode types differ between subsystems,
///  so they are kept with the subsystems.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ValueType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// IEEE 754 half precision float
    F16,
    F32,
}

impl ValueType {
    pub const ALL: [ValueType; 10] = [
        ValueType::U8, ValueType::U16, ValueType::U32, ValueType::U64,
        ValueType::I8, ValueType::I16, ValueType::I32, ValueType::I64,
        ValueType::F16, ValueType::F32,
    ];

    pub fn size(self) -> usize {
        match self {
            ValueType::U8 | ValueType::I8 => 1,
            ValueType::U16 | ValueType::I16 | ValueType::F16 => 2,
            ValueType::U32 | ValueType::I32 | ValueType::F32 => 4,
            ValueType::U64 | ValueType::I64 => 8,
        }
    }

    /// the type's name in the vehicle's C code
    pub fn c_name(self) -> &'static str {
        match self {
            ValueType::U8 => "uint8_t",
            ValueType::U16 => "uint16_t",
            ValueType::U32 => "uint32_t",
            ValueType::U64 => "uint64_t",
            ValueType::I8 => "int8_t",
            ValueType::I16 => "int16_t",
            ValueType::I32 => "int32_t",
            ValueType::I64 => "int64_t",
            ValueType::F16 => "FP16",
            ValueType::F32 => "float",
        }
    }

    pub fn try_decode(self, buf: &mut impl Buf) -> anyhow::Result<Value> {
        if buf.remaining() < self.size() {
            bail!("{} bytes are not enough for a {}", buf.remaining(), self.c_name());
        }

        let value = match self {
            ValueType::U8 => Value::U8(buf.get_u8()),
            ValueType::U16 => Value::U16(buf.get_u16_le()),
            ValueType::U32 => Value::U32(buf.get_u32_le()),
            ValueType::U64 => Value::U64(buf.get_u64_le()),
            ValueType::I8 => Value::I8(buf.get_i8()),
            ValueType::I16 => Value::I16(buf.get_i16_le()),
            ValueType::I32 => Value::I32(buf.get_i32_le()),
            ValueType::I64 => Value::I64(buf.get_i64_le()),
            ValueType::F16 => Value::F16(f16_bits_to_f32(buf.get_u16_le())),
            ValueType::F32 => Value::F32(buf.get_f32_le()),
        };
        Ok(value)
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.c_name())
    }
}

impl FromStr for ValueType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ValueType::ALL.iter()
            .find(|t| t.c_name() == s)
            .copied()
            .ok_or_else(|| anyhow!("unknown value type {:?}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F16(f32),
    F32(f32),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::U8(_) => ValueType::U8,
            Value::U16(_) => ValueType::U16,
            Value::U32(_) => ValueType::U32,
            Value::U64(_) => ValueType::U64,
            Value::I8(_) => ValueType::I8,
            Value::I16(_) => ValueType::I16,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F16(_) => ValueType::F16,
            Value::F32(_) => ValueType::F32,
        }
    }

    /// NB: this is lossy for 64 bit integers with big absolute values
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::U8(v) => v.into(),
            Value::U16(v) => v.into(),
            Value::U32(v) => v.into(),
            Value::U64(v) => v as f64,
            Value::I8(v) => v.into(),
            Value::I16(v) => v.into(),
            Value::I32(v) => v.into(),
            Value::I64(v) => v as f64,
            Value::F16(v) | Value::F32(v) => v.into(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match *self {
            Value::U8(v) => buf.put_u8(v),
            Value::U16(v) => buf.put_u16_le(v),
            Value::U32(v) => buf.put_u32_le(v),
            Value::U64(v) => buf.put_u64_le(v),
            Value::I8(v) => buf.put_i8(v),
            Value::I16(v) => buf.put_i16_le(v),
            Value::I32(v) => buf.put_i32_le(v),
            Value::I64(v) => buf.put_i64_le(v),
            Value::F16(v) => buf.put_u16_le(f32_to_f16_bits(v)),
            Value::F32(v) => buf.put_f32_le(v),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F16(v) | Value::F32(v) => write!(f, "{}", v),
        }
    }
}

fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exponent = ((bits >> 10) & 0x1F) as u32;
    let mantissa = (bits & 0x3FF) as u32;

    let result = match (exponent, mantissa) {
        (0, 0) => sign,
        (0, _) => {
            // subnormal: normalize into an f32 exponent
            let mut exponent: u32 = 127 - 15 + 1;
            let mut mantissa = mantissa;
            while mantissa & 0x400 == 0 {
                mantissa <<= 1;
                exponent -= 1;
            }
            sign | (exponent << 23) | ((mantissa & 0x3FF) << 13)
        }
        (0x1F, 0) => sign | 0x7F80_0000,
        (0x1F, _) => sign | 0x7FC0_0000,
        _ => sign | ((exponent + 127 - 15) << 23) | (mantissa << 13),
    };
    f32::from_bits(result)
}

/// rounds towards zero
fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x7F_FFFF;

    if exponent == 0xFF {
        return if mantissa == 0 { sign | 0x7C00 } else { sign | 0x7E00 };
    }

    let exponent = exponent - 127 + 15;
    if exponent >= 0x1F {
        return sign | 0x7C00;
    }
    if exponent <= 0 {
        if exponent < -10 {
            return sign;
        }
        let mantissa = (mantissa | 0x80_0000) >> (14 - exponent);
        return sign | mantissa as u16;
    }
    sign | ((exponent as u16) << 10) | (mantissa >> 13) as u16
}
