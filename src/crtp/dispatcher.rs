use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, info, span, trace, warn, Instrument, Level};

use crate::config::CrazyflieConfig;
use crate::crtp::link::Link;
use crate::crtp::packet::Packet;

/// Handlers are registered with the [PacketDispatcher] and called for received packets. They are
///  identified by `Arc` identity, i.e. deregistration requires the same `Arc` that was registered.
///
/// This is called on the receive loop, holding it up until it returns. Handlers should not do
///  blocking work.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn on_packet(&self, packet: &Packet) -> anyhow::Result<()>;
}

/// Selects the packets a handler is interested in, based on their header. A packet matches if
///  `packet.port & port_mask == port & port_mask` and the same for the channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeaderFilter {
    pub port: u8,
    pub channel: u8,
    pub port_mask: u8,
    pub channel_mask: u8,
}
impl HeaderFilter {
    pub fn new(port: u8, channel: u8, port_mask: u8, channel_mask: u8) -> HeaderFilter {
        HeaderFilter { port, channel, port_mask, channel_mask }
    }

    /// all channels of a given port
    pub fn port(port: u8) -> HeaderFilter {
        Self::new(port, 0, 0xFF, 0)
    }

    pub fn port_and_channel(port: u8, channel: u8) -> HeaderFilter {
        Self::new(port, channel, 0xFF, 0xFF)
    }

    /// matches all packets
    pub fn any() -> HeaderFilter {
        Self::new(0, 0, 0, 0)
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        (packet.port() & self.port_mask) == (self.port & self.port_mask) &&
            (packet.channel() & self.channel_mask) == (self.channel & self.channel_mask)
    }

    /// A wildcard filter matches all ports. Packets delivered to a wildcard handler only do not
    ///  count as handled.
    pub fn is_wildcard(&self) -> bool {
        self.port_mask & 0x0F == 0
    }
}

#[derive(Clone)]
struct Registration {
    filter: HeaderFilter,
    handler: Arc<dyn PacketHandler>,
}

/// The [PacketDispatcher] routes every received packet, first to all registered packet
///  observers (which see every packet regardless of its header), then to the handlers whose
///  [HeaderFilter] matches the packet.
///
/// Handlers are called in registration order. A handler returning an error does not affect other
///  handlers or subsequent packets.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: RwLock<Vec<Registration>>,
    packet_observers: RwLock<Vec<Arc<dyn PacketHandler>>>,
}

impl PacketDispatcher {
    pub fn new() -> PacketDispatcher {
        Default::default()
    }

    pub async fn add_handler(&self, filter: HeaderFilter, handler: Arc<dyn PacketHandler>) {
        debug!("adding packet handler for {:?}", filter);
        self.handlers.write().await
            .push(Registration { filter, handler });
    }

    pub async fn add_port_handler(&self, port: u8, handler: Arc<dyn PacketHandler>) {
        self.add_handler(HeaderFilter::port(port), handler).await
    }

    /// Removes the first registration for the given port and handler, returning `false` if
    ///  there was none
    pub async fn remove_handler(&self, port: u8, handler: &Arc<dyn PacketHandler>) -> bool {
        let mut handlers = self.handlers.write().await;
        match handlers.iter().position(|r| r.filter.port == port && Arc::ptr_eq(&r.handler, handler)) {
            Some(idx) => {
                debug!("removing packet handler for {:?}", handlers[idx].filter);
                handlers.remove(idx);
                true
            }
            None => {
                debug!("no packet handler registered for port {} - nothing to remove", port);
                false
            }
        }
    }

    pub async fn add_packet_observer(&self, observer: Arc<dyn PacketHandler>) {
        self.packet_observers.write().await
            .push(observer);
    }

    pub async fn remove_packet_observer(&self, observer: &Arc<dyn PacketHandler>) -> bool {
        let mut observers = self.packet_observers.write().await;
        let len_before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != len_before
    }

    pub async fn dispatch(&self, packet: &Packet) {
        trace!("dispatching {:?}", packet);

        // handlers may (de)register handlers, so they are called on a snapshot without holding a lock
        let observers = self.packet_observers.read().await.clone();
        for observer in observers {
            if let Err(e) = observer.on_packet(packet).await {
                warn!("error in packet observer for {:?}: {}", packet, e);
            }
        }

        let handlers = self.handlers.read().await.clone();
        let mut was_handled = false;
        for registration in handlers.iter().filter(|r| r.filter.matches(packet)) {
            if let Err(e) = registration.handler.on_packet(packet).await {
                warn!("error in packet handler on port {}: {}", packet.port(), e);
            }
            if !registration.filter.is_wildcard() {
                was_handled = true;
            }
        }

        if !was_handled {
            debug!("received packet on ({},{}) but there is no handler for it", packet.port(), packet.channel());
        }
    }
}

/// This is the receive loop, dispatching all packets received on a link. It runs until it is
///  cancelled: the link's going down is signalled as a link event and not through errors in
///  `receive()`, so receive errors are considered transient.
pub async fn run_receive_loop(link: Arc<dyn Link>, dispatcher: Arc<PacketDispatcher>, config: Arc<CrazyflieConfig>) {
    info!("starting receive loop");

    loop {
        match link.receive(config.receive_timeout).await {
            Ok(Some(packet)) => {
                let span = span!(Level::TRACE, "packet_received", port = packet.port(), channel = packet.channel());
                dispatcher.dispatch(&packet)
                    .instrument(span)
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                debug!("error receiving from link: {}", e);
                time::sleep(config.receive_error_backoff).await;
            }
        }
    }
}
