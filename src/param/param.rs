use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Buf;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, oneshot, RwLock};
use tracing::{debug, trace};

use crate::config::CrazyflieConfig;
use crate::crtp::ack_sender::AckSender;
use crate::crtp::dispatcher::PacketHandler;
use crate::crtp::packet::{ports, Packet};
use crate::param::param_types::{decode_param_toc_type, CHANNEL_READ, CHANNEL_TOC, CHANNEL_WRITE};
use crate::toc::toc::{Toc, TocCache, TocElement};
use crate::toc::toc_fetcher::TocFetcher;
use crate::toc::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ParamUpdate {
    pub name: String,
    pub value: Value,
}

/// Access to the vehicle's parameters, i.e. variables that can be read and (unless they are read
///  only) written by name. Values are cached locally when the vehicle reports them, either in
///  reply to a read request or to confirm a write.
pub struct Param {
    ack_sender: Arc<AckSender>,
    toc_fetcher: TocFetcher,
    values: RwLock<FxHashMap<String, Value>>,
    update_sender: broadcast::Sender<ParamUpdate>,
}

impl Param {
    pub fn new(config: Arc<CrazyflieConfig>, ack_sender: Arc<AckSender>, toc_cache: Arc<TocCache>) -> Param {
        let (update_sender, _) = broadcast::channel(config.event_channel_capacity);
        Param {
            ack_sender: ack_sender.clone(),
            toc_fetcher: TocFetcher::new(ports::PARAM, decode_param_toc_type, ack_sender, toc_cache),
            values: Default::default(),
            update_sender,
        }
    }

    /// Fetches the parameter TOC from scratch, discarding all known values
    pub async fn refresh_toc(&self) -> oneshot::Receiver<Arc<Toc>> {
        self.values.write().await.clear();
        self.toc_fetcher.refresh().await
    }

    pub async fn toc(&self) -> Arc<Toc> {
        self.toc_fetcher.toc().await
    }

    pub async fn reset(&self) {
        self.toc_fetcher.clear().await;
        self.values.write().await.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ParamUpdate> {
        self.update_sender.subscribe()
    }

    /// the last value the vehicle reported for a parameter
    pub async fn value(&self, name: &str) -> Option<Value> {
        self.values.read().await
            .get(name)
            .copied()
    }

    async fn element(&self, name: &str) -> anyhow::Result<TocElement> {
        self.toc().await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("{} is not in the parameter TOC", name))
    }

    /// Asks the vehicle for a parameter's current value. The value is available through
    ///  [Param::value] and published to subscribers once the reply arrives.
    pub async fn request_value(&self, name: &str) -> anyhow::Result<()> {
        let element = self.element(name).await?;
        debug!("requesting value of parameter {}", name);
        self.ack_sender.send(Packet::new(ports::PARAM, CHANNEL_READ, vec![element.id])?, true).await;
        Ok(())
    }

    pub async fn set_value(&self, name: &str, value: Value) -> anyhow::Result<()> {
        let element = self.element(name).await?;
        if element.read_only {
            bail!("parameter {} is read only", name);
        }
        if element.value_type != value.value_type() {
            bail!("parameter {} has type {}, not {}", name, element.value_type, value.value_type());
        }

        debug!("setting parameter {} to {}", name, value);
        let mut payload = vec![element.id];
        value.ser(&mut payload);
        self.ack_sender.send(Packet::new(ports::PARAM, CHANNEL_WRITE, payload)?, true).await;
        Ok(())
    }

    async fn on_value(&self, mut buf: &[u8]) -> anyhow::Result<()> {
        let id = buf.try_get_u8()?;
        let toc = self.toc().await;
        let element = toc.get_by_id(id)
            .ok_or_else(|| anyhow!("value for unknown parameter id {}", id))?;
        let value = element.value_type.try_decode(&mut buf)?;

        let name = element.complete_name();
        trace!("parameter {} = {}", name, value);
        self.values.write().await.insert(name.clone(), value);
        let _ = self.update_sender.send(ParamUpdate { name, value });
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for Param {
    async fn on_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        match packet.channel() {
            CHANNEL_TOC => self.toc_fetcher.on_packet(packet).await,
            CHANNEL_READ | CHANNEL_WRITE => self.on_value(packet.data()).await,
            channel => bail!("unsupported parameter channel {}", channel),
        }
    }
}
