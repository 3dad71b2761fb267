use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::config::CrazyflieConfig;
use crate::crtp::dispatcher::PacketHandler;
use crate::crtp::link::Link;
use crate::crtp::packet::Packet;

struct PendingAnswer {
    timer_id: u64,
    timer: JoinHandle<()>,
}

/// All outgoing packets go through the [AckSender], which holds the currently active link (if
///  any).
///
/// Packets can be sent with 'expect answer', meaning that the sender expects the vehicle to
///  respond with a packet on the same port. For these packets, a timer is armed, and the packet
///  is re-sent if no packet arrives on that port before the timer expires. After the configured
///  number of retries, the request is abandoned.
///
/// NB: Answers are matched by port only. Any packet received on a port counts as the answer to
///  the pending request on that port, so there must be at most one request per port in flight.
///  Arming a second timer for a port replaces the first one and is logged as a warning.
pub struct AckSender {
    config: Arc<CrazyflieConfig>,
    link: RwLock<Option<Arc<dyn Link>>>,
    pending_answers: Mutex<FxHashMap<u8, PendingAnswer>>,
    timer_id_counter: AtomicU64,
}

impl AckSender {
    pub fn new(config: Arc<CrazyflieConfig>) -> AckSender {
        AckSender {
            config,
            link: Default::default(),
            pending_answers: Default::default(),
            timer_id_counter: AtomicU64::new(0),
        }
    }

    pub async fn set_link(&self, link: Option<Arc<dyn Link>>) {
        *self.link.write().await = link;
    }

    pub async fn is_link_up(&self) -> bool {
        self.link.read().await.is_some()
    }

    /// Sends a packet on the active link, returning `false` if it was dropped because no link
    ///  is active.
    ///
    /// The answer timer is armed before the packet goes out, so an answer arriving while `send`
    ///  is still in progress cancels it.
    pub async fn send(self: &Arc<Self>, packet: Packet, expect_answer: bool) -> bool {
        if !expect_answer {
            return self.do_send(&packet).await;
        }

        if !self.is_link_up().await {
            debug!("no active link - dropping {:?}", packet);
            return false;
        }

        let port = packet.port();
        let timer_id = self.arm_answer_timer(packet.clone()).await;
        if self.do_send(&packet).await {
            true
        }
        else {
            self.cancel_timer(port, timer_id).await;
            false
        }
    }

    async fn do_send(&self, packet: &Packet) -> bool {
        let link = match self.link.read().await.as_ref() {
            Some(link) => link.clone(),
            None => {
                debug!("no active link - dropping {:?}", packet);
                return false;
            }
        };

        trace!("sending {:?}", packet);
        if let Err(e) = link.send(packet).await {
            // the link reports its own breakdown, so this is treated like a lost packet
            warn!("error sending {:?}: {}", packet, e);
        }
        true
    }

    async fn arm_answer_timer(self: &Arc<Self>, packet: Packet) -> u64 {
        let port = packet.port();
        debug!("expecting answer on port {}", port);

        let timer_id = self.timer_id_counter.fetch_add(1, Ordering::Relaxed);

        // the timer task needs this lock to act, so it can not fire before it is registered
        let mut pending_answers = self.pending_answers.lock().await;

        let cloned_self = self.clone();
        let timer = tokio::spawn(async move {
            cloned_self.run_answer_timer(timer_id, packet).await
        });

        if let Some(previous) = pending_answers.insert(port, PendingAnswer { timer_id, timer }) {
            previous.timer.abort();
            warn!("an older answer timer was still armed for port {} - a request was sent before the previous request's answer arrived, which may cause lost packets", port);
        }
        timer_id
    }

    async fn run_answer_timer(&self, timer_id: u64, packet: Packet) {
        let port = packet.port();

        for retry in 1..=self.config.answer_retries {
            time::sleep(self.config.answer_timeout).await;
            if !self.is_pending(port, timer_id).await {
                return;
            }

            debug!("no answer on port {} - retry #{}", port, retry);
            if !self.do_send(&packet).await {
                self.clear_pending(port, timer_id).await;
                return;
            }
        }

        time::sleep(self.config.answer_timeout).await;
        if self.clear_pending(port, timer_id).await {
            warn!("no answer on port {} after {} retries - giving up on {:?}", port, self.config.answer_retries, packet);
        }
    }

    async fn is_pending(&self, port: u8, timer_id: u64) -> bool {
        self.pending_answers.lock().await
            .get(&port)
            .map(|p| p.timer_id == timer_id)
            .unwrap_or(false)
    }

    async fn clear_pending(&self, port: u8, timer_id: u64) -> bool {
        let mut pending_answers = self.pending_answers.lock().await;
        if pending_answers.get(&port).map(|p| p.timer_id) == Some(timer_id) {
            pending_answers.remove(&port);
            true
        }
        else {
            false
        }
    }

    async fn cancel_timer(&self, port: u8, timer_id: u64) {
        let mut pending_answers = self.pending_answers.lock().await;
        if pending_answers.get(&port).map(|p| p.timer_id) == Some(timer_id) {
            if let Some(pending) = pending_answers.remove(&port) {
                pending.timer.abort();
            }
        }
    }

    /// Called for every received packet: it is the answer to a pending request on its port
    pub async fn on_answer(&self, port: u8) {
        if let Some(pending) = self.pending_answers.lock().await.remove(&port) {
            trace!("got answer on port {} - cancelling timer", port);
            pending.timer.abort();
        }
    }

    /// cancel all answer timers, e.g. when the link goes away
    pub async fn cancel_all(&self) {
        for (_, pending) in self.pending_answers.lock().await.drain() {
            pending.timer.abort();
        }
    }

    pub async fn has_pending_answer(&self, port: u8) -> bool {
        self.pending_answers.lock().await
            .contains_key(&port)
    }
}

#[async_trait]
impl PacketHandler for AckSender {
    async fn on_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        self.on_answer(packet.port()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::time::Duration;
    use crate::test_util::link::TrackingMockLink;
    use super::*;

    /// a link whose answers are dispatched before `send()` returns
    struct InstantAnswerLink {
        ack_sender: RwLock<Weak<AckSender>>,
        num_sent: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Link for InstantAnswerLink {
        async fn send(&self, packet: &Packet) -> anyhow::Result<()> {
            self.num_sent.fetch_add(1, Ordering::AcqRel);
            if let Some(ack_sender) = self.ack_sender.read().await.upgrade() {
                ack_sender.on_packet(packet).await?;
            }
            Ok(())
        }

        async fn receive(&self, _timeout: Duration) -> anyhow::Result<Option<Packet>> {
            Ok(None)
        }

        async fn close(&self) {}
    }

    async fn sender_with_link() -> (Arc<AckSender>, Arc<TrackingMockLink>) {
        let sender = Arc::new(AckSender::new(Arc::new(CrazyflieConfig::new())));
        let link = Arc::new(TrackingMockLink::new());
        sender.set_link(Some(link.clone())).await;
        (sender, link)
    }

    fn request(port: u8, payload: u8) -> Packet {
        Packet::new(port, 0, vec![payload]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_answer() {
        let (sender, link) = sender_with_link().await;

        sender.send(request(3, 1), false).await;
        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(link.sent_packets().await, vec![request(3, 1)]);
        assert!(!sender.has_pending_answer(3).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_retry_without_answer() {
        let (sender, link) = sender_with_link().await;

        sender.send(request(5, 7), true).await;
        assert!(sender.has_pending_answer(5).await);

        time::sleep(Duration::from_millis(900)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 7)]);

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 7), request(5, 7)]);
        assert!(sender.has_pending_answer(5).await);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 7), request(5, 7)]);
        assert!(!sender.has_pending_answer(5).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_cancels_retry() {
        let (sender, link) = sender_with_link().await;

        sender.send(request(5, 7), true).await;
        time::sleep(Duration::from_millis(500)).await;
        sender.on_packet(&Packet::new(5, 1, vec![1, 2, 3]).unwrap()).await.unwrap();
        assert!(!sender.has_pending_answer(5).await);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_on_other_port_does_not_cancel() {
        let (sender, link) = sender_with_link().await;

        sender.send(request(5, 7), true).await;
        time::sleep(Duration::from_millis(500)).await;
        sender.on_answer(2).await;

        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 7), request(5, 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_after_retry_cancels_timer() {
        let (sender, link) = sender_with_link().await;

        sender.send(request(2, 1), true).await;
        time::sleep(Duration::from_millis(1500)).await;
        sender.on_answer(2).await;

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.sent_packets().await, vec![request(2, 1), request(2, 1)]);
        assert!(!sender.has_pending_answer(2).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_replaces_timer() {
        let (sender, link) = sender_with_link().await;

        sender.send(request(5, 1), true).await;
        time::sleep(Duration::from_millis(500)).await;
        sender.send(request(5, 2), true).await;

        time::sleep(Duration::from_millis(700)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 1), request(5, 2)]);

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 1), request(5, 2), request(5, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_after_link_removal_is_a_noop() {
        let (sender, link) = sender_with_link().await;

        sender.send(request(5, 1), true).await;
        sender.set_link(None).await;

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 1)]);
        assert!(!sender.has_pending_answer(5).await);

        sender.send(request(5, 2), true).await;
        assert!(!sender.has_pending_answer(5).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (sender, link) = sender_with_link().await;

        sender.send(request(5, 1), true).await;
        sender.send(request(2, 1), true).await;
        sender.cancel_all().await;

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.sent_packets().await, vec![request(5, 1), request(2, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_during_send_cancels_timer() {
        let sender = Arc::new(AckSender::new(Arc::new(CrazyflieConfig::new())));
        let link = Arc::new(InstantAnswerLink {
            ack_sender: RwLock::new(Arc::downgrade(&sender)),
            num_sent: Default::default(),
        });
        sender.set_link(Some(link.clone())).await;

        assert!(sender.send(request(5, 1), true).await);
        assert!(!sender.has_pending_answer(5).await);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.num_sent.load(Ordering::Acquire), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reports_dropped_packets() {
        let (sender, _link) = sender_with_link().await;
        assert!(sender.send(request(5, 1), false).await);

        sender.set_link(None).await;
        assert!(!sender.send(request(5, 2), false).await);
        assert!(!sender.send(request(5, 3), true).await);
        assert!(!sender.has_pending_answer(5).await);
    }
}
