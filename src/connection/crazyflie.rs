use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, span, warn, Instrument, Level};

use crate::commander::Commander;
use crate::config::CrazyflieConfig;
use crate::connection::connection_events::{ConnectionEvent, ConnectionEventNotifier};
use crate::connection::connection_state::ConnectionState;
use crate::crtp::ack_sender::AckSender;
use crate::crtp::dispatcher::{run_receive_loop, PacketDispatcher, PacketHandler};
use crate::crtp::link::{Link, LinkDriverRegistry, LinkEvent, LinkEventSender};
use crate::crtp::packet::{ports, Packet};
use crate::crtp::packet_receiver::PacketReceiver;
use crate::logging::log::Log;
use crate::param::param::Param;
use crate::toc::toc::TocCache;

/// The tasks and resources belonging to a single open link
struct ActiveLink {
    connection_id: u64,
    uri: String,
    link: Arc<dyn Link>,
    first_packet_watch: Arc<dyn PacketHandler>,
    receive_loop: JoinHandle<()>,
    link_events: JoinHandle<()>,
    setup: JoinHandle<()>,
}

#[derive(Default)]
struct Connection {
    state: ConnectionState,
    active_link: Option<ActiveLink>,
}

/// The facade for talking to a vehicle. It owns the link (at most one at a time), drives the
///  connection lifecycle, and gives access to the subsystems ([Log], [Param], [Commander]).
///
/// Connection lifecycle changes are published as [ConnectionEvent]s.
///
/// NB: An open link's background tasks hold a reference to the [Crazyflie], so it must be
///  `close()`d to be dropped.
pub struct Crazyflie {
    config: Arc<CrazyflieConfig>,
    drivers: LinkDriverRegistry,
    dispatcher: Arc<PacketDispatcher>,
    ack_sender: Arc<AckSender>,
    log: Arc<Log>,
    param: Arc<Param>,
    commander: Commander,
    events: ConnectionEventNotifier,
    connection: Mutex<Connection>,
    connection_counter: AtomicU64,
}

impl Crazyflie {
    /// A [Crazyflie] with the built-in link drivers
    pub async fn new(config: CrazyflieConfig) -> anyhow::Result<Arc<Crazyflie>> {
        Self::with_drivers(config, LinkDriverRegistry::default()).await
    }

    pub async fn with_drivers(config: CrazyflieConfig, drivers: LinkDriverRegistry) -> anyhow::Result<Arc<Crazyflie>> {
        config.validate()?;
        let config = Arc::new(config);

        let dispatcher = Arc::new(PacketDispatcher::new());
        let ack_sender = Arc::new(AckSender::new(config.clone()));
        let toc_cache = Arc::new(TocCache::new());
        let log = Arc::new(Log::new(config.clone(), ack_sender.clone(), toc_cache.clone()));
        let param = Arc::new(Param::new(config.clone(), ack_sender.clone(), toc_cache));

        dispatcher.add_packet_observer(ack_sender.clone()).await;
        dispatcher.add_port_handler(ports::LOGGING, log.clone()).await;
        dispatcher.add_port_handler(ports::PARAM, param.clone()).await;

        Ok(Arc::new(Crazyflie {
            events: ConnectionEventNotifier::new(config.event_channel_capacity),
            commander: Commander::new(ack_sender.clone()),
            config,
            drivers,
            dispatcher,
            ack_sender,
            log,
            param,
            connection: Default::default(),
            connection_counter: AtomicU64::new(0),
        }))
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn param(&self) -> &Arc<Param> {
        &self.param
    }

    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    /// for registering additional handlers, e.g. for ports without a built-in subsystem
    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    /// a queue for all packets received on a port
    pub async fn packet_receiver(&self, port: u8) -> Arc<PacketReceiver> {
        PacketReceiver::for_port(&self.dispatcher, port).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.lock().await.state
    }

    pub async fn uri(&self) -> Option<String> {
        self.connection.lock().await
            .active_link.as_ref()
            .map(|a| a.uri.clone())
    }

    /// Sends a packet on the open link. Packets sent while no link is open are dropped, and
    ///  `false` is returned.
    pub async fn send_packet(&self, packet: Packet, expect_answer: bool) -> bool {
        self.ack_sender.send(packet, expect_answer).await
    }

    /// Opens a link to a vehicle, closing a previously opened link. Setup (fetching log and
    ///  parameter TOCs) starts immediately, and progress is reported through
    ///  [ConnectionEvent]s.
    ///
    /// If the link can not be opened, [ConnectionEvent::ConnectionFailed] is published in
    ///  addition to the error being returned.
    pub async fn open(self: &Arc<Self>, uri: &str) -> anyhow::Result<()> {
        if self.connection.lock().await.active_link.is_some() {
            debug!("closing previous link before opening {}", uri);
            self.close().await;
        }

        let connection_id = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!("connecting to {}", uri);
        self.events.send_event(ConnectionEvent::ConnectionInitiated { uri: uri.to_string() });

        let mut connection = self.connection.lock().await;
        connection.state = ConnectionState::Initialized;

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let link = match self.drivers.open(uri, LinkEventSender::new(event_sender)).await {
            Ok(link) => link,
            Err(e) => {
                warn!("error opening link {}: {}", uri, e);
                connection.state = ConnectionState::Disconnected;
                self.events.send_event(ConnectionEvent::ConnectionFailed { uri: uri.to_string(), message: e.to_string() });
                return Err(e);
            }
        };

        self.ack_sender.set_link(Some(link.clone())).await;

        let first_packet_watch: Arc<dyn PacketHandler> = Arc::new(FirstPacketWatch {
            crazyflie: Arc::downgrade(self),
            connection_id,
            has_fired: AtomicBool::new(false),
        });
        self.dispatcher.add_packet_observer(first_packet_watch.clone()).await;

        // the tasks need the connection lock to act, so they see the active link
        let span = span!(Level::INFO, "link", id = connection_id);
        let receive_loop = tokio::spawn(
            run_receive_loop(link.clone(), self.dispatcher.clone(), self.config.clone())
                .instrument(span.clone())
        );
        let link_events = tokio::spawn(
            run_link_events(Arc::downgrade(self), connection_id, event_receiver)
                .instrument(span.clone())
        );
        let setup = tokio::spawn(
            run_setup(Arc::downgrade(self), connection_id)
                .instrument(span)
        );

        connection.active_link = Some(ActiveLink {
            connection_id,
            uri: uri.to_string(),
            link,
            first_packet_watch,
            receive_loop,
            link_events,
            setup,
        });
        Ok(())
    }

    /// Closes the link if one is open, stopping the motors first. This always publishes
    ///  [ConnectionEvent::Disconnected].
    pub async fn close(&self) {
        let mut connection = self.connection.lock().await;

        let uri = match connection.active_link.take() {
            Some(active_link) => {
                info!("closing link to {}", active_link.uri);
                if let Err(e) = self.commander.send_stop_setpoint().await {
                    warn!("error stopping the motors: {}", e);
                }
                active_link.link_events.abort();
                let uri = active_link.uri.clone();
                self.teardown(active_link).await;
                Some(uri)
            }
            None => None,
        };
        connection.state = ConnectionState::Disconnected;
        drop(connection);

        self.events.send_event(ConnectionEvent::Disconnected { uri });
    }

    /// releases everything belonging to a link except the link event task
    async fn teardown(&self, active_link: ActiveLink) {
        active_link.receive_loop.abort();
        active_link.setup.abort();
        self.dispatcher.remove_packet_observer(&active_link.first_packet_watch).await;

        self.ack_sender.set_link(None).await;
        self.ack_sender.cancel_all().await;
        active_link.link.close().await;

        self.log.reset().await;
        self.param.reset().await;
    }

    async fn on_first_packet(&self, connection_id: u64) {
        let mut connection = self.connection.lock().await;
        let connection = &mut *connection;

        let active_link = match &connection.active_link {
            Some(active_link) if active_link.connection_id == connection_id => active_link,
            _ => return,
        };
        self.dispatcher.remove_packet_observer(&active_link.first_packet_watch).await;

        if connection.state == ConnectionState::Initialized {
            info!("connected to {}", active_link.uri);
            connection.state = ConnectionState::Connected;
            self.events.send_event(ConnectionEvent::Connected { uri: active_link.uri.clone() });
        }
    }

    async fn on_setup_finished(&self, connection_id: u64) {
        let mut connection = self.connection.lock().await;
        let connection = &mut *connection;

        let active_link = match &connection.active_link {
            Some(active_link) if active_link.connection_id == connection_id => active_link,
            _ => return,
        };

        if connection.state == ConnectionState::Connected {
            info!("setup finished for {}", active_link.uri);
            connection.state = ConnectionState::SetupFinished;
            self.events.send_event(ConnectionEvent::SetupFinished { uri: active_link.uri.clone() });
        }
        else {
            warn!("setup finished in state {} - ignoring", connection.state);
        }
    }

    async fn on_link_event(&self, connection_id: u64, event: LinkEvent) {
        match event {
            LinkEvent::Quality(percentage) => {
                if self.is_active(connection_id).await {
                    self.events.send_event(ConnectionEvent::LinkQuality(percentage));
                }
            }
            LinkEvent::Error(message) => {
                let mut connection = self.connection.lock().await;
                let active_link = match connection.active_link.take() {
                    Some(active_link) if active_link.connection_id == connection_id => active_link,
                    other => {
                        connection.active_link = other;
                        debug!("error for a link that is no longer active: {}", message);
                        return;
                    }
                };

                warn!("link {} failed: {}", active_link.uri, message);
                let previous_state = connection.state;
                let uri = active_link.uri.clone();
                self.teardown(active_link).await;
                connection.state = ConnectionState::Disconnected;
                drop(connection);

                for event in previous_state.link_error_events(&uri, &message) {
                    self.events.send_event(event);
                }
            }
        }
    }

    async fn is_active(&self, connection_id: u64) -> bool {
        self.connection.lock().await
            .active_link.as_ref()
            .map(|a| a.connection_id == connection_id)
            .unwrap_or(false)
    }
}

/// Registered as a packet observer for a newly opened link, this moves the connection to
///  'connected' when the first packet arrives, and then removes itself.
struct FirstPacketWatch {
    crazyflie: Weak<Crazyflie>,
    connection_id: u64,
    has_fired: AtomicBool,
}

#[async_trait]
impl PacketHandler for FirstPacketWatch {
    async fn on_packet(&self, _packet: &Packet) -> anyhow::Result<()> {
        if self.has_fired.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(crazyflie) = self.crazyflie.upgrade() {
            crazyflie.on_first_packet(self.connection_id).await;
        }
        Ok(())
    }
}

async fn run_link_events(crazyflie: Weak<Crazyflie>, connection_id: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let is_error = matches!(event, LinkEvent::Error(_));
        match crazyflie.upgrade() {
            Some(crazyflie) => crazyflie.on_link_event(connection_id, event).await,
            None => return,
        }
        if is_error {
            return;
        }
    }
}

/// Fetches the log TOC, then the parameter TOC. A fetch that stalls or is abandoned (because the
///  link went away) leaves the connection without 'setup finished'.
async fn run_setup(crazyflie: Weak<Crazyflie>, connection_id: u64) {
    let log = match crazyflie.upgrade() {
        Some(crazyflie) => crazyflie.log.clone(),
        None => return,
    };
    if log.refresh_toc().await.await.is_err() {
        debug!("log TOC fetch was abandoned");
        return;
    }

    let param = match crazyflie.upgrade() {
        Some(crazyflie) => crazyflie.param.clone(),
        None => return,
    };
    if param.refresh_toc().await.await.is_err() {
        debug!("param TOC fetch was abandoned");
        return;
    }

    if let Some(crazyflie) = crazyflie.upgrade() {
        crazyflie.on_setup_finished(connection_id).await;
    }
}
