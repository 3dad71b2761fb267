use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::toc::value::ValueType;

pub const CHANNEL_TOC: u8 = 0;
pub const CHANNEL_SETTINGS: u8 = 1;
pub const CHANNEL_LOGDATA: u8 = 2;

/// The maximum number of sample bytes in a single log data packet, i.e. the maximum encoded size
///  of all variables in a block
pub const MAX_LOG_DATA_PACKET_SIZE: usize = 30;

/// Commands on the settings channel. Replies echo the command byte, followed by the block id and
///  a status code (0 for success, an `errno` value otherwise).
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum LogCommand {
    CreateBlock = 0,
    AppendBlock = 1,
    DeleteBlock = 2,
    StartLogging = 3,
    StopLogging = 4,
    ResetLogging = 5,
}

pub fn log_type_id(value_type: ValueType) -> u8 {
    match value_type {
        ValueType::U8 => 1,
        ValueType::U16 => 2,
        ValueType::U32 => 3,
        ValueType::I8 => 4,
        ValueType::I16 => 5,
        ValueType::I32 => 6,
        ValueType::F32 => 7,
        ValueType::F16 => 8,
        ValueType::U64 => 9,
        ValueType::I64 => 10,
    }
}

pub fn value_type_from_log_id(id: u8) -> anyhow::Result<ValueType> {
    let value_type = match id {
        1 => ValueType::U8,
        2 => ValueType::U16,
        3 => ValueType::U32,
        4 => ValueType::I8,
        5 => ValueType::I16,
        6 => ValueType::I32,
        7 => ValueType::F32,
        8 => ValueType::F16,
        9 => ValueType::U64,
        10 => ValueType::I64,
        _ => bail!("unknown log type id {}", id),
    };
    Ok(value_type)
}

/// The type byte of log TOC elements carries the type id in its low nibble. Log variables are
///  never writable.
pub fn decode_log_toc_type(type_byte: u8) -> anyhow::Result<(ValueType, bool)> {
    Ok((value_type_from_log_id(type_byte & 0x0F)?, true))
}
