use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::time;

use crate::crtp::dispatcher::PacketHandler;
use crate::crtp::link::{Link, LinkDriver, LinkEventSender};
use crate::crtp::packet::Packet;

/// Something that plays the vehicle's part in a conversation: it is called for every packet
///  sent on a [TrackingMockLink] and returns the packets the vehicle sends in response.
pub trait PacketResponder: Send + Sync + 'static {
    fn respond(&self, packet: &Packet) -> Vec<Packet>;
}

/// A [Link] for testing: it records all packets that are sent, and it allows test code to
///  inject packets that are then 'received'.
pub struct TrackingMockLink {
    sent: RwLock<Vec<Packet>>,
    incoming_sender: mpsc::UnboundedSender<Packet>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    responder: Option<Arc<dyn PacketResponder>>,
    is_closed: AtomicBool,
}

impl Default for TrackingMockLink {
    fn default() -> Self {
        TrackingMockLink::new()
    }
}

impl TrackingMockLink {
    pub fn new() -> TrackingMockLink {
        Self::create(None)
    }

    pub fn with_responder(responder: Arc<dyn PacketResponder>) -> TrackingMockLink {
        Self::create(Some(responder))
    }

    fn create(responder: Option<Arc<dyn PacketResponder>>) -> TrackingMockLink {
        let (incoming_sender, incoming) = mpsc::unbounded_channel();
        TrackingMockLink {
            sent: Default::default(),
            incoming_sender,
            incoming: tokio::sync::Mutex::new(incoming),
            responder,
            is_closed: AtomicBool::new(false),
        }
    }

    /// make the link 'receive' a packet
    pub fn inject(&self, packet: Packet) {
        let _ = self.incoming_sender.send(packet);
    }

    pub async fn sent_packets(&self) -> Vec<Packet> {
        self.sent.read().await.clone()
    }

    /// sent packets on a given port and channel
    pub async fn sent_on(&self, port: u8, channel: u8) -> Vec<Packet> {
        self.sent.read().await
            .iter()
            .filter(|p| p.port() == port && p.channel() == channel)
            .cloned()
            .collect()
    }

    pub async fn clear_sent(&self) {
        self.sent.write().await.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Link for TrackingMockLink {
    async fn send(&self, packet: &Packet) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("link is closed");
        }

        self.sent.write().await.push(packet.clone());
        if let Some(responder) = &self.responder {
            for response in responder.respond(packet) {
                self.inject(response);
            }
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<Packet>> {
        let mut incoming = self.incoming.lock().await;
        match time::timeout(timeout, incoming.recv()).await {
            Ok(packet) => Ok(packet),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        self.is_closed.store(true, Ordering::Release);
    }
}

struct OpenedLink {
    uri: String,
    link: Arc<TrackingMockLink>,
    events: LinkEventSender,
}

/// A [LinkDriver] handing out [TrackingMockLink]s, keeping track of them so tests can inject
///  packets and link events
pub struct TrackingMockDriver {
    scheme: String,
    responder: Option<Arc<dyn PacketResponder>>,
    failure: Option<String>,
    opened: Mutex<Vec<OpenedLink>>,
}

impl TrackingMockDriver {
    pub fn new(scheme: &str) -> TrackingMockDriver {
        TrackingMockDriver {
            scheme: scheme.to_string(),
            responder: None,
            failure: None,
            opened: Default::default(),
        }
    }

    pub fn with_responder(scheme: &str, responder: Arc<dyn PacketResponder>) -> TrackingMockDriver {
        TrackingMockDriver {
            responder: Some(responder),
            ..Self::new(scheme)
        }
    }

    /// a driver that fails to open links
    pub fn failing(scheme: &str, message: &str) -> TrackingMockDriver {
        TrackingMockDriver {
            failure: Some(message.to_string()),
            ..Self::new(scheme)
        }
    }

    pub fn opened_uris(&self) -> Vec<String> {
        self.opened.lock().unwrap()
            .iter()
            .map(|o| o.uri.clone())
            .collect()
    }

    pub fn last_link(&self) -> Option<Arc<TrackingMockLink>> {
        self.opened.lock().unwrap()
            .last()
            .map(|o| o.link.clone())
    }

    pub fn last_events(&self) -> Option<LinkEventSender> {
        self.opened.lock().unwrap()
            .last()
            .map(|o| o.events.clone())
    }
}

#[async_trait]
impl LinkDriver for TrackingMockDriver {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn open(&self, uri: &str, events: LinkEventSender) -> anyhow::Result<Arc<dyn Link>> {
        if let Some(failure) = &self.failure {
            bail!("{}", failure);
        }

        let link = Arc::new(match &self.responder {
            Some(responder) => TrackingMockLink::with_responder(responder.clone()),
            None => TrackingMockLink::new(),
        });

        self.opened.lock().unwrap()
            .push(OpenedLink {
                uri: uri.to_string(),
                link: link.clone(),
                events,
            });
        Ok(link)
    }
}

/// A [PacketHandler] that records all packets it is called for
#[derive(Default)]
pub struct RecordingHandler {
    received: RwLock<Vec<Packet>>,
}
impl RecordingHandler {
    pub fn new() -> RecordingHandler {
        Default::default()
    }

    pub async fn received(&self) -> Vec<Packet> {
        self.received.read().await.clone()
    }
}

#[async_trait]
impl PacketHandler for RecordingHandler {
    async fn on_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        self.received.write().await.push(packet.clone());
        Ok(())
    }
}
