use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Buf;
use num_enum::TryFromPrimitive;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::config::CrazyflieConfig;
use crate::crtp::ack_sender::AckSender;
use crate::crtp::dispatcher::PacketHandler;
use crate::crtp::packet::{ports, Packet};
use crate::logging::log_block::LogBlock;
use crate::logging::log_config::LogConfig;
use crate::logging::log_types::{decode_log_toc_type, LogCommand, CHANNEL_LOGDATA, CHANNEL_SETTINGS, CHANNEL_TOC};
use crate::toc::toc::{Toc, TocCache};
use crate::toc::toc_fetcher::TocFetcher;
use crate::util::errno::error_description;

/// The log engine: it fetches the log TOC, turns [LogConfig]s into [LogBlock]s on the vehicle,
///  and decodes the log data the vehicle sends for them.
///
/// It is registered as the handler for the logging port.
pub struct Log {
    config: Arc<CrazyflieConfig>,
    ack_sender: Arc<AckSender>,
    toc_fetcher: TocFetcher,
    blocks: RwLock<Vec<Arc<LogBlock>>>,
    /// Block ids are never reused, not even across connections, so that a late reply for an old
    ///  block can not be mistaken for a reply for a new block
    block_id_counter: AtomicU32,
}

impl Log {
    pub fn new(config: Arc<CrazyflieConfig>, ack_sender: Arc<AckSender>, toc_cache: Arc<TocCache>) -> Log {
        Log {
            config,
            ack_sender: ack_sender.clone(),
            toc_fetcher: TocFetcher::new(ports::LOGGING, decode_log_toc_type, ack_sender, toc_cache),
            blocks: Default::default(),
            block_id_counter: AtomicU32::new(1),
        }
    }

    /// Resets logging on the vehicle and fetches the log TOC from scratch. All existing blocks
    ///  are discarded. The returned receiver completes when the TOC is complete.
    pub async fn refresh_toc(&self) -> oneshot::Receiver<Arc<Toc>> {
        self.discard_blocks().await;

        match Packet::new(ports::LOGGING, CHANNEL_SETTINGS, vec![LogCommand::ResetLogging.into()]) {
            Ok(packet) => {
                self.ack_sender.send(packet, false).await;
            }
            Err(e) => warn!("invalid reset packet: {}", e),
        }

        self.toc_fetcher.refresh().await
    }

    pub async fn toc(&self) -> Arc<Toc> {
        self.toc_fetcher.toc().await
    }

    /// Discards TOC and blocks, e.g. when the connection is lost
    pub async fn reset(&self) {
        self.toc_fetcher.clear().await;
        self.discard_blocks().await;
    }

    /// Handles of discarded blocks stay usable, but they refer to blocks the vehicle no longer
    ///  knows, so they are invalidated
    async fn discard_blocks(&self) {
        let blocks = std::mem::take(&mut *self.blocks.write().await);
        for block in blocks {
            block.invalidate().await;
        }
    }

    /// Validates a config against the current TOC and registers a block for it. Nothing is sent
    ///  to the vehicle until the block is started.
    pub async fn register_config(&self, config: LogConfig) -> anyhow::Result<Arc<LogBlock>> {
        let wire_period = config.wire_period()?;
        let variables = config.resolve(self.toc().await.as_ref())?;

        let id = self.block_id_counter.fetch_add(1, Ordering::Relaxed);
        let id = u8::try_from(id)
            .map_err(|_| anyhow!("no more log block ids available"))?;

        debug!("registering log config {} as block {}", config.name, id);
        let block = Arc::new(LogBlock::new(id, config, variables, wire_period, self.ack_sender.clone(), self.config.log_data_channel_capacity));
        self.blocks.write().await.push(block.clone());
        Ok(block)
    }

    /// all registered blocks, including closed blocks
    pub async fn blocks(&self) -> Vec<Arc<LogBlock>> {
        self.blocks.read().await.clone()
    }

    /// the block with a given id, if it exists and is not closed
    pub async fn block(&self, id: u8) -> Option<Arc<LogBlock>> {
        let blocks = self.blocks.read().await.clone();
        for block in blocks {
            if block.id().await == Some(id) {
                return Some(block);
            }
        }
        None
    }

    async fn on_settings(&self, mut buf: &[u8]) -> anyhow::Result<()> {
        let cmd = LogCommand::try_from_primitive(buf.try_get_u8()?)?;
        if cmd == LogCommand::ResetLogging {
            debug!("logging was reset on the vehicle");
            return Ok(());
        }

        let block_id = buf.try_get_u8()?;
        let status = buf.try_get_u8()?;

        let block = match self.block(block_id).await {
            Some(block) => block,
            None => {
                if cmd != LogCommand::DeleteBlock {
                    warn!("{:?} reply for unknown block {}", cmd, block_id);
                }
                return Ok(());
            }
        };

        match (cmd, status) {
            (LogCommand::CreateBlock, 0) => {
                debug!("block {} was created - starting logging", block_id);
                block.on_create_result(true).await;
                let packet = Packet::new(ports::LOGGING, CHANNEL_SETTINGS, vec![LogCommand::StartLogging.into(), block_id, self.config.log_start_period])?;
                self.ack_sender.send(packet, false).await;
            }
            (LogCommand::CreateBlock, status) => {
                error!("error creating block {}: {}", block_id, error_description(status));
                block.on_create_result(false).await;
            }
            (LogCommand::StartLogging, 0) => {
                info!("started logging for block {}", block_id);
                block.on_started(true).await;
            }
            (LogCommand::StopLogging, 0) => {
                debug!("stopped logging for block {}", block_id);
                block.on_started(false).await;
            }
            (LogCommand::AppendBlock, 0) => {
                debug!("appended to block {}", block_id);
            }
            (cmd, status) => {
                warn!("{:?} for block {} failed: {}", cmd, block_id, error_description(status));
            }
        }
        Ok(())
    }

    async fn on_log_data(&self, mut buf: &[u8]) -> anyhow::Result<()> {
        let block_id = buf.try_get_u8()?;
        let timestamp = buf.try_get_u32_le()?;

        match self.block(block_id).await {
            Some(block) => block.on_log_data(timestamp, buf),
            None => {
                warn!("received log data for unknown block {} - dropping", block_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PacketHandler for Log {
    async fn on_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        trace!("log packet {:?}", packet);
        match packet.channel() {
            CHANNEL_TOC => self.toc_fetcher.on_packet(packet).await,
            CHANNEL_SETTINGS => self.on_settings(packet.data()).await,
            CHANNEL_LOGDATA => self.on_log_data(packet.data()).await,
            channel => bail!("unsupported log channel {}", channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::logging::log_config::LogVariable;
    use crate::test_util::link::TrackingMockLink;
    use crate::toc::toc_fetcher::{CMD_TOC_ELEMENT, CMD_TOC_INFO};
    use crate::toc::value::Value;
    use super::*;

    async fn log() -> (Log, Arc<TrackingMockLink>) {
        let config = Arc::new(CrazyflieConfig::new());
        let ack_sender = Arc::new(AckSender::new(config.clone()));
        let link = Arc::new(TrackingMockLink::new());
        ack_sender.set_link(Some(link.clone())).await;
        (Log::new(config, ack_sender, Arc::new(TocCache::new())), link)
    }

    fn packet(channel: u8, payload: &[u8]) -> Packet {
        Packet::new(ports::LOGGING, channel, payload.to_vec()).unwrap()
    }

    fn element(id: u8, type_id: u8, group: &str, name: &str) -> Packet {
        let mut payload = vec![CMD_TOC_ELEMENT, id, type_id];
        payload.extend_from_slice(format!("{}\0{}\0", group, name).as_bytes());
        packet(CHANNEL_TOC, &payload)
    }

    /// fetches a TOC with 'pm.state' (u8), 'acc.x' (float), 'gyro.x' (float), 'motor.m1' (u16)
    async fn log_with_toc() -> (Log, Arc<TrackingMockLink>) {
        let (log, link) = log().await;
        let result = log.refresh_toc().await;
        log.on_packet(&packet(CHANNEL_TOC, &[CMD_TOC_INFO, 4])).await.unwrap();
        log.on_packet(&element(0, 1, "pm", "state")).await.unwrap();
        log.on_packet(&element(1, 7, "acc", "x")).await.unwrap();
        log.on_packet(&element(2, 7, "gyro", "x")).await.unwrap();
        log.on_packet(&element(3, 2, "motor", "m1")).await.unwrap();
        assert_eq!(result.await.unwrap().len(), 4);
        link.clear_sent().await;
        (log, link)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_toc_resets_logging() {
        let (log, link) = log().await;

        let _result = log.refresh_toc().await;
        assert_eq!(link.sent_packets().await, vec![
            packet(CHANNEL_SETTINGS, &[5]),
            packet(CHANNEL_TOC, &[CMD_TOC_INFO]),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_start() {
        let (log, link) = log_with_toc().await;

        let block = log.register_config(LogConfig::new("motor", 100).with_variable(LogVariable::toc("motor.m1"))).await.unwrap();
        let id = block.id().await.unwrap();
        assert!(link.sent_packets().await.is_empty());

        block.start().await;
        assert_eq!(link.sent_packets().await, vec![packet(CHANNEL_SETTINGS, &[0, id, 2, 3])]);

        log.on_packet(&packet(CHANNEL_SETTINGS, &[0, id, 0])).await.unwrap();
        assert_eq!(link.sent_packets().await.last(), Some(&packet(CHANNEL_SETTINGS, &[3, id, 10])));

        log.on_packet(&packet(CHANNEL_SETTINGS, &[3, id, 0])).await.unwrap();
        assert!(block.is_started().await);

        block.stop().await;
        log.on_packet(&packet(CHANNEL_SETTINGS, &[4, id, 0])).await.unwrap();
        assert!(!block.is_started().await);

        block.start().await;
        assert_eq!(link.sent_packets().await.last(), Some(&packet(CHANNEL_SETTINGS, &[3, id, 10])));
        assert_eq!(link.sent_packets().await.iter().filter(|p| p.data()[0] == 0).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_allows_recreation() {
        let (log, link) = log_with_toc().await;

        let block = log.register_config(LogConfig::new("acc", 10).with_variable(LogVariable::toc("acc.x"))).await.unwrap();
        let id = block.id().await.unwrap();
        block.start().await;
        log.on_packet(&packet(CHANNEL_SETTINGS, &[0, id, 12])).await.unwrap();
        assert!(!block.is_created().await);

        block.start().await;
        assert_eq!(link.sent_packets().await, vec![
            packet(CHANNEL_SETTINGS, &[0, id, 7, 1]),
            packet(CHANNEL_SETTINGS, &[0, id, 7, 1]),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_configs() {
        let (log, link) = log_with_toc().await;

        let mut too_big = LogConfig::new("too big", 100);
        for _ in 0..7 {
            too_big = too_big.with_variable(LogVariable::toc("acc.x"));
        }
        too_big = too_big.with_variable(LogVariable::toc("motor.m1"));
        too_big = too_big.with_variable(LogVariable::toc("pm.state"));
        assert!(log.register_config(too_big).await.is_err());

        // 15 bytes of data, but a 32 byte 'create block' command
        let mut too_many_variables = LogConfig::new("too many variables", 100);
        for _ in 0..15 {
            too_many_variables = too_many_variables.with_variable(LogVariable::toc("pm.state"));
        }
        assert!(log.register_config(too_many_variables).await.is_err());

        let unresolved = LogConfig::new("unresolved", 100)
            .with_variable(LogVariable::toc("acc.x"))
            .with_variable(LogVariable::toc("acc.y"));
        assert!(log.register_config(unresolved).await.is_err());

        let bad_period = LogConfig::new("bad period", 5).with_variable(LogVariable::toc("acc.x"));
        assert!(log.register_config(bad_period).await.is_err());

        assert!(log.blocks().await.is_empty());
        assert!(link.sent_packets().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_ids_are_not_reused() {
        let (log, _link) = log_with_toc().await;
        let config = LogConfig::new("a", 100).with_variable(LogVariable::toc("pm.state"));

        let first = log.register_config(config.clone()).await.unwrap().id().await.unwrap();
        log.reset().await;
        let second = log.register_config(config.clone()).await;
        assert!(second.is_err(), "TOC is gone after reset");

        let _result = log.refresh_toc().await;
        log.on_packet(&packet(CHANNEL_TOC, &[CMD_TOC_INFO, 1])).await.unwrap();
        log.on_packet(&element(0, 1, "pm", "state")).await.unwrap();
        let third = log.register_config(config).await.unwrap().id().await.unwrap();
        assert!(third > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_data() {
        let (log, _link) = log_with_toc().await;

        let block = log.register_config(LogConfig::new("a", 100)
            .with_variable(LogVariable::toc("pm.state"))
            .with_variable(LogVariable::toc("acc.x"))
        ).await.unwrap();
        let id = block.id().await.unwrap();
        let mut subscriber = block.subscribe();

        let mut payload = vec![id, 0x10, 0x27, 0, 0, 200];
        payload.extend_from_slice(&3.14f32.to_le_bytes());
        log.on_packet(&packet(CHANNEL_LOGDATA, &payload)).await.unwrap();

        let data = subscriber.recv().await.unwrap();
        assert_eq!(data.timestamp, 10_000);
        assert_eq!(data.get("pm.state"), Some(Value::U8(200)));
        match data.get("acc.x") {
            Some(Value::F32(v)) => assert!((v - 3.14).abs() < 1e-6),
            other => panic!("unexpected value {:?}", other),
        }

        // unknown block: dropped
        log.on_packet(&packet(CHANNEL_LOGDATA, &[id + 1, 0, 0, 0, 0, 1])).await.unwrap();

        // closed block: dropped
        block.close().await;
        log.on_packet(&packet(CHANNEL_LOGDATA, &payload)).await.unwrap();
        assert!(subscriber.try_recv().is_err());

        assert!(log.on_packet(&packet(CHANNEL_LOGDATA, &[id, 0, 0])).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_settings_reply() {
        let (log, _link) = log_with_toc().await;

        assert!(log.on_packet(&packet(CHANNEL_SETTINGS, &[9, 1, 0])).await.is_err());
        assert!(log.on_packet(&packet(CHANNEL_SETTINGS, &[0, 1])).await.is_err());
        assert!(log.on_packet(&packet(CHANNEL_SETTINGS, &[5])).await.is_ok());
        assert!(log.on_packet(&packet(3, &[0])).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_invalidates_block_handles() {
        let (log, link) = log_with_toc().await;

        let block = log.register_config(LogConfig::new("a", 100).with_variable(LogVariable::toc("pm.state"))).await.unwrap();
        let id = block.id().await.unwrap();
        block.start().await;
        log.on_packet(&packet(CHANNEL_SETTINGS, &[0, id, 0])).await.unwrap();
        log.on_packet(&packet(CHANNEL_SETTINGS, &[3, id, 0])).await.unwrap();
        assert!(block.is_started().await);

        log.reset().await;
        link.clear_sent().await;
        assert_eq!(block.id().await, None);
        assert!(!block.is_started().await);

        block.start().await;
        block.stop().await;
        block.close().await;
        assert!(link.sent_packets().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_invalidates_block_handles() {
        let (log, link) = log_with_toc().await;

        let block = log.register_config(LogConfig::new("a", 100).with_variable(LogVariable::toc("motor.m1"))).await.unwrap();
        let _result = log.refresh_toc().await;
        link.clear_sent().await;

        block.start().await;
        assert_eq!(block.id().await, None);
        assert!(log.blocks().await.is_empty());
        assert!(link.sent_packets().await.is_empty());
    }
}
