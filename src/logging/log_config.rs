use anyhow::{anyhow, bail};
use bytes::BufMut;

use crate::crtp::packet::MAX_PAYLOAD_SIZE;
use crate::logging::log_types::{log_type_id, MAX_LOG_DATA_PACKET_SIZE};
use crate::toc::toc::Toc;
use crate::toc::value::ValueType;

/// A variable in a [LogConfig]: either a TOC variable that is referenced by its complete name,
///  or a raw memory location on the vehicle.
#[derive(Debug, Clone, PartialEq)]
pub enum LogVariable {
    Toc {
        name: String,
        /// defaults to the TOC element's type
        fetch_as: Option<ValueType>,
    },
    Memory {
        name: String,
        address: u32,
        stored_as: ValueType,
        fetch_as: ValueType,
    },
}

impl LogVariable {
    pub fn toc(name: &str) -> LogVariable {
        LogVariable::Toc { name: name.to_string(), fetch_as: None }
    }

    pub fn toc_as(name: &str, fetch_as: ValueType) -> LogVariable {
        LogVariable::Toc { name: name.to_string(), fetch_as: Some(fetch_as) }
    }

    pub fn memory(name: &str, address: u32, stored_as: ValueType, fetch_as: ValueType) -> LogVariable {
        LogVariable::Memory { name: name.to_string(), address, stored_as, fetch_as }
    }

    pub fn name(&self) -> &str {
        match self {
            LogVariable::Toc { name, .. } => name,
            LogVariable::Memory { name, .. } => name,
        }
    }

    fn resolve(&self, toc: &Toc) -> anyhow::Result<ResolvedVariable> {
        match self {
            LogVariable::Toc { name, fetch_as } => {
                let element = toc.get(name)
                    .ok_or_else(|| anyhow!("{} is not in the log TOC", name))?;
                Ok(ResolvedVariable {
                    name: name.clone(),
                    fetch_as: fetch_as.unwrap_or(element.value_type),
                    location: VariableLocation::Toc { id: element.id },
                })
            }
            LogVariable::Memory { name, address, stored_as, fetch_as } => {
                Ok(ResolvedVariable {
                    name: name.clone(),
                    fetch_as: *fetch_as,
                    location: VariableLocation::Memory { address: *address, stored_as: *stored_as },
                })
            }
        }
    }
}

/// A logging configuration: a set of variables that are sampled together at a fixed period.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub name: String,
    pub period_ms: u32,
    pub variables: Vec<LogVariable>,
    /// hints for displaying the data, not used for logging
    pub data_range_min: Option<f64>,
    pub data_range_max: Option<f64>,
}

impl LogConfig {
    pub fn new(name: &str, period_ms: u32) -> LogConfig {
        LogConfig {
            name: name.to_string(),
            period_ms,
            variables: Vec::new(),
            data_range_min: None,
            data_range_max: None,
        }
    }

    pub fn with_variable(mut self, variable: LogVariable) -> LogConfig {
        self.variables.push(variable);
        self
    }

    pub fn with_data_range(mut self, min: f64, max: f64) -> LogConfig {
        self.data_range_min = Some(min);
        self.data_range_max = Some(max);
        self
    }

    /// The period on the wire is in units of 10ms
    pub fn wire_period(&self) -> anyhow::Result<u8> {
        match u8::try_from(self.period_ms / 10) {
            Ok(period) if period > 0 => Ok(period),
            _ => bail!("log config {}: period of {}ms is outside the supported range 10..2559", self.name, self.period_ms),
        }
    }

    /// Resolves all variables against a TOC and checks that their samples fit into a single
    ///  log data packet, and their definitions into a single 'create block' command.
    pub fn resolve(&self, toc: &Toc) -> anyhow::Result<Vec<ResolvedVariable>> {
        if self.variables.is_empty() {
            bail!("log config {} has no variables", self.name);
        }

        let resolved = self.variables.iter()
            .map(|v| v.resolve(toc))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let size: usize = resolved.iter()
            .map(|v| v.fetch_as.size())
            .sum();
        if size > MAX_LOG_DATA_PACKET_SIZE {
            bail!("log config {}: {} bytes of data exceed the maximum of {}", self.name, size, MAX_LOG_DATA_PACKET_SIZE);
        }

        let create_size: usize = CREATE_BLOCK_HEADER_SIZE + resolved.iter()
            .map(|v| v.create_size())
            .sum::<usize>();
        if create_size > MAX_PAYLOAD_SIZE {
            bail!("log config {}: block definition of {} bytes exceeds the maximum of {}", self.name, create_size, MAX_PAYLOAD_SIZE);
        }
        Ok(resolved)
    }
}

/// command and block id
const CREATE_BLOCK_HEADER_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VariableLocation {
    Toc { id: u8 },
    Memory { address: u32, stored_as: ValueType },
}

/// A [LogVariable] with all information needed to create a block on the vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedVariable {
    pub name: String,
    pub fetch_as: ValueType,
    pub location: VariableLocation,
}

impl ResolvedVariable {
    /// `stored_as` in the high nibble, `fetch_as` in the low nibble. TOC variables have no
    ///  stored type.
    pub fn type_byte(&self) -> u8 {
        let fetch_as = log_type_id(self.fetch_as);
        match self.location {
            VariableLocation::Toc { .. } => fetch_as,
            VariableLocation::Memory { stored_as, .. } => (log_type_id(stored_as) << 4) | fetch_as,
        }
    }

    /// number of bytes [ResolvedVariable::ser] writes
    pub fn create_size(&self) -> usize {
        match self.location {
            VariableLocation::Toc { .. } => 2,
            VariableLocation::Memory { .. } => 5,
        }
    }

    /// the variable's part of a 'create block' command
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.type_byte());
        match self.location {
            VariableLocation::Toc { id } => buf.put_u8(id),
            VariableLocation::Memory { address, .. } => buf.put_u32_le(address),
        }
    }
}
