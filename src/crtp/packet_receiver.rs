use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tracing::debug;

use crate::crtp::dispatcher::{HeaderFilter, PacketDispatcher, PacketHandler};
use crate::crtp::packet::Packet;

/// Queues the packets matching a [HeaderFilter] so that code outside the receive loop can wait
///  for them, e.g. for a request / response exchange on a port without a built-in subsystem.
pub struct PacketReceiver {
    filter: HeaderFilter,
    sender: mpsc::UnboundedSender<Packet>,
    receiver: Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl PacketReceiver {
    pub async fn register(dispatcher: &PacketDispatcher, filter: HeaderFilter) -> Arc<PacketReceiver> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let result = Arc::new(PacketReceiver {
            filter,
            sender,
            receiver: Mutex::new(receiver),
        });
        dispatcher.add_handler(filter, result.clone()).await;
        result
    }

    /// all channels of a port
    pub async fn for_port(dispatcher: &PacketDispatcher, port: u8) -> Arc<PacketReceiver> {
        Self::register(dispatcher, HeaderFilter::port(port)).await
    }

    /// The next queued packet, or `None` if none arrived before the timeout expired
    pub async fn receive(&self, timeout: Duration) -> Option<Packet> {
        let mut receiver = self.receiver.lock().await;
        time::timeout(timeout, receiver.recv()).await
            .ok()
            .flatten()
    }

    pub async fn deregister(self: &Arc<Self>, dispatcher: &PacketDispatcher) {
        let handler: Arc<dyn PacketHandler> = self.clone();
        if !dispatcher.remove_handler(self.filter.port, &handler).await {
            debug!("packet receiver for {:?} was not registered", self.filter);
        }
    }
}

#[async_trait]
impl PacketHandler for PacketReceiver {
    async fn on_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        // the receiver lives as long as self
        let _ = self.sender.send(packet.clone());
        Ok(())
    }
}
