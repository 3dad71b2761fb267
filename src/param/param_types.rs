use anyhow::bail;

use crate::toc::value::ValueType;

pub const CHANNEL_TOC: u8 = 0;
pub const CHANNEL_READ: u8 = 1;
pub const CHANNEL_WRITE: u8 = 2;

const READ_ONLY_FLAG: u8 = 0x40;

/// Parameter types are encoded as `0x08` for unsigned, plus the size as a power of two in the
///  low bits. Floats have their own ids.
pub fn param_type_id(value_type: ValueType) -> u8 {
    match value_type {
        ValueType::I8 => 0x00,
        ValueType::I16 => 0x01,
        ValueType::I32 => 0x02,
        ValueType::I64 => 0x03,
        ValueType::F16 => 0x05,
        ValueType::F32 => 0x06,
        ValueType::U8 => 0x08,
        ValueType::U16 => 0x09,
        ValueType::U32 => 0x0A,
        ValueType::U64 => 0x0B,
    }
}

pub fn decode_param_toc_type(type_byte: u8) -> anyhow::Result<(ValueType, bool)> {
    let value_type = match type_byte & 0x0F {
        0x00 => ValueType::I8,
        0x01 => ValueType::I16,
        0x02 => ValueType::I32,
        0x03 => ValueType::I64,
        0x05 => ValueType::F16,
        0x06 => ValueType::F32,
        0x08 => ValueType::U8,
        0x09 => ValueType::U16,
        0x0A => ValueType::U32,
        0x0B => ValueType::U64,
        _ => bail!("unknown parameter type 0x{:02X}", type_byte),
    };
    Ok((value_type, type_byte & READ_ONLY_FLAG != 0))
}

pub fn encode_param_toc_type(value_type: ValueType, read_only: bool) -> u8 {
    if read_only {
        param_type_id(value_type) | READ_ONLY_FLAG
    }
    else {
        param_type_id(value_type)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(0x08, Some((ValueType::U8, false)))]
    #[case(0x48, Some((ValueType::U8, true)))]
    #[case(0x06, Some((ValueType::F32, false)))]
    #[case(0x43, Some((ValueType::I64, true)))]
    #[case(0x04, None)]
    #[case(0x0F, None)]
    fn test_decode_param_toc_type(#[case] type_byte: u8, #[case] expected: Option<(ValueType, bool)>) {
        assert_eq!(decode_param_toc_type(type_byte).ok(), expected);
    }

    #[test]
    fn test_type_ids_are_consistent() {
        for value_type in ValueType::ALL {
            for read_only in [false, true] {
                assert_eq!(decode_param_toc_type(encode_param_toc_type(value_type, read_only)).unwrap(), (value_type, read_only));
            }
        }
    }
}
