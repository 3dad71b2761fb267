use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::crtp::packet::Packet;
use crate::crtp::udp_driver::UdpLinkDriver;

/// Asynchronous notifications a [Link] emits about its own health.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LinkEvent {
    /// link quality as a percentage between 0 and 100
    Quality(u8),
    /// The link broke down and will not recover. This is how a link signals teardown: `receive()`
    ///  failing is treated as a transient problem.
    Error(String),
}

/// This is the handle a [LinkDriver] gets for reporting [LinkEvent]s for a link it opened.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    sender: mpsc::UnboundedSender<LinkEvent>,
}
impl LinkEventSender {
    pub fn new(sender: mpsc::UnboundedSender<LinkEvent>) -> LinkEventSender {
        LinkEventSender { sender }
    }

    pub fn on_quality(&self, percentage: u8) {
        let _ = self.sender.send(LinkEvent::Quality(percentage.min(100)));
    }

    pub fn on_error(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("link error: {}", message);
        // the receiving side is gone after the connection was closed, which is fine
        let _ = self.sender.send(LinkEvent::Error(message));
    }
}

/// The physical link to a vehicle, e.g. a radio dongle or a USB connection. It transports raw
///  packets in both directions.
///
/// A link is owned by the connection facade, and only a single link is open at any given time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn send(&self, packet: &Packet) -> anyhow::Result<()>;

    /// Wait for the next packet, returning `None` if none arrived before the timeout expired.
    async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<Packet>>;

    async fn close(&self);
}

/// A [LinkDriver] creates [Link]s for URIs with a given scheme, e.g. `udp://127.0.0.1:19850`.
#[async_trait]
pub trait LinkDriver: Send + Sync + 'static {
    fn scheme(&self) -> &str;

    async fn open(&self, uri: &str, events: LinkEventSender) -> anyhow::Result<Arc<dyn Link>>;
}

/// The registry of all available link drivers, selecting a driver based on a URI's scheme.
pub struct LinkDriverRegistry {
    drivers: Vec<Arc<dyn LinkDriver>>,
}
impl Default for LinkDriverRegistry {
    fn default() -> Self {
        let mut result = LinkDriverRegistry::empty();
        result.register(Arc::new(UdpLinkDriver));
        result
    }
}
impl LinkDriverRegistry {
    pub fn empty() -> LinkDriverRegistry {
        LinkDriverRegistry {
            drivers: Vec::new(),
        }
    }

    /// Drivers registered later take precedence over previously registered drivers for the same
    ///  scheme
    pub fn register(&mut self, driver: Arc<dyn LinkDriver>) {
        debug!("registering link driver for scheme {:?}", driver.scheme());
        self.drivers.insert(0, driver);
    }

    pub async fn open(&self, uri: &str, events: LinkEventSender) -> anyhow::Result<Arc<dyn Link>> {
        let scheme = uri_scheme(uri)
            .ok_or_else(|| anyhow!("malformed link URI {:?}: expected <scheme>://<address>", uri))?;

        let driver = self.drivers.iter()
            .find(|d| d.scheme() == scheme)
            .ok_or_else(|| anyhow!("no link driver for scheme {:?} (URI {:?})", scheme, uri))?;

        info!("opening link {:?}", uri);
        driver.open(uri, events).await
    }
}

pub fn uri_scheme(uri: &str) -> Option<&str> {
    uri.split_once("://")
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
}

/// The part of a URI after the `<scheme>://` prefix
pub fn uri_address(uri: &str) -> Option<&str> {
    uri.split_once("://")
        .map(|(_, address)| address)
}
