use std::sync::Mutex;

use bytes::BufMut;
use rustc_hash::FxHashMap;

use crate::crtp::packet::{ports, Packet};
use crate::logging::log_types::{log_type_id, LogCommand, CHANNEL_LOGDATA, CHANNEL_SETTINGS};
use crate::param::param_types::{encode_param_toc_type, CHANNEL_READ, CHANNEL_WRITE};
use crate::test_util::link::PacketResponder;
use crate::toc::toc::TocElement;
use crate::toc::toc_fetcher::{CMD_TOC_ELEMENT, CMD_TOC_INFO, TOC_CHANNEL};
use crate::toc::value::{Value, ValueType};

#[derive(Default)]
struct VehicleState {
    param_values: FxHashMap<u8, Value>,
    /// create block payloads by block id
    blocks: FxHashMap<u8, Vec<u8>>,
    started_blocks: Vec<u8>,
    create_status: u8,
}

/// A simulated vehicle for tests: it answers TOC requests for logging and parameters, keeps track
///  of log blocks and parameter values, and acknowledges log settings commands.
#[derive(Default)]
pub struct SimulatedVehicle {
    log_toc: Vec<TocElement>,
    param_toc: Vec<TocElement>,
    state: Mutex<VehicleState>,
}

impl SimulatedVehicle {
    pub fn new() -> SimulatedVehicle {
        Default::default()
    }

    pub fn with_log_variable(mut self, group: &str, name: &str, value_type: ValueType) -> SimulatedVehicle {
        let id = self.log_toc.len() as u8;
        self.log_toc.push(TocElement {
            id,
            group: group.to_string(),
            name: name.to_string(),
            value_type,
            read_only: true,
        });
        self
    }

    pub fn with_param(mut self, group: &str, name: &str, value: Value, read_only: bool) -> SimulatedVehicle {
        let id = self.param_toc.len() as u8;
        self.param_toc.push(TocElement {
            id,
            group: group.to_string(),
            name: name.to_string(),
            value_type: value.value_type(),
            read_only,
        });
        self.state.lock().unwrap().param_values.insert(id, value);
        self
    }

    /// status code for subsequent 'create block' replies
    pub fn set_create_status(&self, status: u8) {
        self.state.lock().unwrap().create_status = status;
    }

    /// the 'create block' payloads the vehicle accepted, by block id
    pub fn block_definition(&self, block_id: u8) -> Option<Vec<u8>> {
        self.state.lock().unwrap().blocks.get(&block_id).cloned()
    }

    pub fn is_started(&self, block_id: u8) -> bool {
        self.state.lock().unwrap().started_blocks.contains(&block_id)
    }

    pub fn param_value(&self, id: u8) -> Option<Value> {
        self.state.lock().unwrap().param_values.get(&id).copied()
    }

    /// builds a log data packet the way the vehicle sends it
    pub fn log_data_packet(block_id: u8, timestamp: u32, values: &[Value]) -> Packet {
        let mut payload = vec![block_id];
        payload.put_u32_le(timestamp);
        for value in values {
            value.ser(&mut payload);
        }
        Packet::new(ports::LOGGING, CHANNEL_LOGDATA, payload).unwrap()
    }

    fn toc_response(port: u8, toc: &[TocElement], request: &[u8], encode_type: impl Fn(&TocElement) -> u8) -> Vec<Packet> {
        let payload = match request {
            [CMD_TOC_INFO] => vec![CMD_TOC_INFO, toc.len() as u8],
            [CMD_TOC_ELEMENT, index] => match toc.get(*index as usize) {
                Some(element) => {
                    let mut payload = vec![CMD_TOC_ELEMENT];
                    payload.extend_from_slice(&element.ser(encode_type(element)));
                    payload
                }
                None => return vec![],
            },
            _ => return vec![],
        };
        vec![Packet::new(port, TOC_CHANNEL, payload).unwrap()]
    }

    fn on_log_settings(&self, request: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        match request {
            [cmd, block_id, ..] if *cmd == u8::from(LogCommand::CreateBlock) => {
                let status = state.create_status;
                if status == 0 {
                    state.blocks.insert(*block_id, request.to_vec());
                }
                vec![*cmd, *block_id, status]
            }
            [cmd, block_id, _period] if *cmd == u8::from(LogCommand::StartLogging) => {
                if state.blocks.contains_key(block_id) {
                    state.started_blocks.push(*block_id);
                    vec![*cmd, *block_id, 0]
                }
                else {
                    vec![*cmd, *block_id, 2]
                }
            }
            [cmd, block_id] if *cmd == u8::from(LogCommand::StopLogging) => {
                state.started_blocks.retain(|id| id != block_id);
                vec![*cmd, *block_id, 0]
            }
            [cmd, block_id] if *cmd == u8::from(LogCommand::DeleteBlock) => {
                state.started_blocks.retain(|id| id != block_id);
                state.blocks.remove(block_id);
                vec![*cmd, *block_id, 0]
            }
            [cmd] if *cmd == u8::from(LogCommand::ResetLogging) => {
                state.blocks.clear();
                state.started_blocks.clear();
                vec![]
            }
            _ => vec![],
        }
    }

    fn on_param_access(&self, channel: u8, request: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        let id = match request.first() {
            Some(id) => *id,
            None => return vec![],
        };
        let element = match self.param_toc.get(id as usize) {
            Some(element) => element,
            None => return vec![],
        };

        if channel == CHANNEL_WRITE && !element.read_only {
            let mut buf = &request[1..];
            if let Ok(value) = element.value_type.try_decode(&mut buf) {
                state.param_values.insert(id, value);
            }
        }

        let mut payload = vec![id];
        if let Some(value) = state.param_values.get(&id) {
            value.ser(&mut payload);
        }
        payload
    }
}

impl PacketResponder for SimulatedVehicle {
    fn respond(&self, packet: &Packet) -> Vec<Packet> {
        match (packet.port(), packet.channel()) {
            (ports::LOGGING, TOC_CHANNEL) => Self::toc_response(ports::LOGGING, &self.log_toc, packet.data(), |e| log_type_id(e.value_type)),
            (ports::PARAM, TOC_CHANNEL) => Self::toc_response(ports::PARAM, &self.param_toc, packet.data(), |e| encode_param_toc_type(e.value_type, e.read_only)),
            (ports::LOGGING, CHANNEL_SETTINGS) => {
                let payload = self.on_log_settings(packet.data());
                if payload.is_empty() {
                    vec![]
                }
                else {
                    vec![Packet::new(ports::LOGGING, CHANNEL_SETTINGS, payload).unwrap()]
                }
            }
            (ports::PARAM, channel @ (CHANNEL_READ | CHANNEL_WRITE)) => {
                let payload = self.on_param_access(channel, packet.data());
                if payload.is_empty() {
                    vec![]
                }
                else {
                    vec![Packet::new(ports::PARAM, channel, payload).unwrap()]
                }
            }
            _ => vec![],
        }
    }
}
