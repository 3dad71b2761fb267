use std::sync::Arc;

use anyhow::bail;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace, warn};

use crate::crtp::ack_sender::AckSender;
use crate::crtp::packet::{ports, Packet};
use crate::logging::log_config::{LogConfig, ResolvedVariable};
use crate::logging::log_types::{LogCommand, CHANNEL_SETTINGS};
use crate::toc::value::Value;

/// One decoded sample of a log block
#[derive(Debug, Clone, PartialEq)]
pub struct LogData {
    pub block_id: u8,
    /// the vehicle's timestamp, passed through without interpretation
    pub timestamp: u32,
    /// values in the order of the block's variables
    pub values: Vec<(String, Value)>,
}

impl LogData {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, Default)]
struct BlockState {
    created: bool,
    started: bool,
    closed: bool,
}

/// A [LogConfig] that was registered with the [crate::logging::log::Log] engine and has a block
///  id. The block is created on the vehicle the first time it is started.
pub struct LogBlock {
    id: u8,
    config: LogConfig,
    variables: Vec<ResolvedVariable>,
    wire_period: u8,
    state: Mutex<BlockState>,
    ack_sender: Arc<AckSender>,
    data_sender: broadcast::Sender<LogData>,
}

impl LogBlock {
    pub(crate) fn new(id: u8, config: LogConfig, variables: Vec<ResolvedVariable>, wire_period: u8, ack_sender: Arc<AckSender>, data_channel_capacity: usize) -> LogBlock {
        let (data_sender, _) = broadcast::channel(data_channel_capacity);
        LogBlock {
            id,
            config,
            variables,
            wire_period,
            state: Default::default(),
            ack_sender,
            data_sender,
        }
    }

    /// The block's id, or `None` after the block was closed
    pub async fn id(&self) -> Option<u8> {
        if self.state.lock().await.closed {
            None
        }
        else {
            Some(self.id)
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub async fn is_created(&self) -> bool {
        self.state.lock().await.created
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    /// Decoded samples of this block are published to subscribers
    pub fn subscribe(&self) -> broadcast::Receiver<LogData> {
        self.data_sender.subscribe()
    }

    /// Starts logging. The first call creates the block on the vehicle, which starts logging
    ///  once the vehicle acknowledged the creation. Subsequent calls start a stopped block
    ///  without creating it again.
    ///
    /// If there is no active link, nothing is sent and the block remains uncreated.
    pub async fn start(&self) {
        // held while sending: the creation's acknowledgment must see the flag
        let mut state = self.state.lock().await;
        if state.closed {
            warn!("starting log block {} after it was closed - ignoring", self.id);
            return;
        }

        if state.created {
            debug!("block {} is already created, starting logging", self.id);
            self.send_settings(vec![LogCommand::StartLogging.into(), self.id, self.wire_period]).await;
        }
        else {
            debug!("first time block {} is started - creating it", self.id);
            state.created = self.send_settings(self.create_block_payload()).await;
            if !state.created {
                warn!("block {} was not created on the vehicle", self.id);
            }
        }
    }

    fn create_block_payload(&self) -> Vec<u8> {
        let mut payload = vec![LogCommand::CreateBlock.into(), self.id];
        for variable in &self.variables {
            trace!("adding {:?} to block {}", variable, self.id);
            variable.ser(&mut payload);
        }
        payload
    }

    pub async fn stop(&self) {
        if self.state.lock().await.closed {
            warn!("stopping log block {} after it was closed - ignoring", self.id);
            return;
        }
        debug!("stopping logging for block {}", self.id);
        self.send_settings(vec![LogCommand::StopLogging.into(), self.id]).await;
    }

    /// Deletes the block on the vehicle. The block can not be used after that.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                warn!("closing log block {} which is already closed - ignoring", self.id);
                return;
            }
            state.closed = true;
            state.started = false;
        }
        debug!("deleting block {}", self.id);
        self.send_settings(vec![LogCommand::DeleteBlock.into(), self.id]).await;
    }

    /// `false` if the command was not sent
    async fn send_settings(&self, payload: Vec<u8>) -> bool {
        match Packet::new(ports::LOGGING, CHANNEL_SETTINGS, payload) {
            Ok(packet) => self.ack_sender.send(packet, false).await,
            Err(e) => {
                warn!("invalid settings packet for log block {}: {}", self.id, e);
                false
            }
        }
    }

    /// Decodes the samples of a log data packet, walking the block's variables in order
    pub fn unpack(&self, mut buf: &[u8]) -> anyhow::Result<Vec<(String, Value)>> {
        let mut values = Vec::with_capacity(self.variables.len());
        for variable in &self.variables {
            values.push((variable.name.clone(), variable.fetch_as.try_decode(&mut buf)?));
        }
        if !buf.is_empty() {
            bail!("{} extra bytes in log data for block {}", buf.len(), self.id);
        }
        Ok(values)
    }

    pub(crate) fn on_log_data(&self, timestamp: u32, samples: &[u8]) -> anyhow::Result<()> {
        let values = self.unpack(samples)?;
        trace!("log data for block {}: {:?}", self.id, values);

        // no subscribers is fine
        let _ = self.data_sender.send(LogData {
            block_id: self.id,
            timestamp,
            values,
        });
        Ok(())
    }

    pub(crate) async fn on_create_result(&self, success: bool) {
        let mut state = self.state.lock().await;
        if !success {
            // creating it again is the only way to recover
            state.created = false;
        }
    }

    pub(crate) async fn on_started(&self, started: bool) {
        self.state.lock().await.started = started;
    }

    /// The vehicle no longer knows this block, e.g. after the connection was lost. Nothing is
    ///  sent, and the handle can not be used after that.
    pub(crate) async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.started = false;
    }
}
