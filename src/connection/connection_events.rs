use tokio::sync::broadcast;
use tracing::trace;

#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// `open()` was called, and the link is being opened
    ConnectionInitiated { uri: String },
    /// the first packet arrived on a new link
    Connected { uri: String },
    /// Both log and parameter TOCs were fetched, the vehicle is ready for use
    SetupFinished { uri: String },
    /// The link could not be opened, or it broke down before it was connected
    ConnectionFailed { uri: String, message: String },
    /// An established connection broke down. This follows a [ConnectionEvent::Disconnected].
    ConnectionLost { uri: String, message: String },
    /// `uri` is `None` if the connection was closed while no link was open
    Disconnected { uri: Option<String> },
    /// link quality as a percentage
    LinkQuality(u8),
}

pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}
impl ConnectionEventNotifier {
    pub fn new(capacity: usize) -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        ConnectionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
