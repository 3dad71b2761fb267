use std::sync::Arc;

use anyhow::bail;
use bytes::Buf;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::crtp::ack_sender::AckSender;
use crate::crtp::packet::Packet;
use crate::toc::toc::{Toc, TocCache, TocElement, TypeDecoder};

/// All subsystems with a TOC use channel 0 of their port for fetching it
pub const TOC_CHANNEL: u8 = 0;

pub const CMD_TOC_ELEMENT: u8 = 0;
pub const CMD_TOC_INFO: u8 = 1;

enum FetchState {
    Idle,
    AwaitingInfo {
        completion: oneshot::Sender<Arc<Toc>>,
    },
    AwaitingElements {
        toc: Toc,
        count: u8,
        next_index: u8,
        completion: oneshot::Sender<Arc<Toc>>,
    },
}

/// Downloads the TOC of one subsystem (identified by its port). Fetching is done in two phases:
///  * first, a 'get info' request is sent which is answered with the number of elements (and
///    optionally a CRC of the TOC's contents)
///  * then elements are requested one at a time by index, each request being sent after the
///    previous request's answer arrived
///
/// All requests are sent with 'expect answer' so lost packets are retried. If retries are
///  exhausted, the fetch stalls and never completes.
pub struct TocFetcher {
    port: u8,
    decode_type: TypeDecoder,
    ack_sender: Arc<AckSender>,
    cache: Arc<TocCache>,
    state: Mutex<FetchState>,
    toc: RwLock<Arc<Toc>>,
}

impl TocFetcher {
    pub fn new(port: u8, decode_type: TypeDecoder, ack_sender: Arc<AckSender>, cache: Arc<TocCache>) -> TocFetcher {
        TocFetcher {
            port,
            decode_type,
            ack_sender,
            cache,
            state: Mutex::new(FetchState::Idle),
            toc: Default::default(),
        }
    }

    /// Discards the current TOC and starts fetching it from scratch. The returned receiver
    ///  completes when the fetch is finished; it is dropped without a value if the fetch is
    ///  restarted or cleared before that.
    pub async fn refresh(&self) -> oneshot::Receiver<Arc<Toc>> {
        let (completion, result) = oneshot::channel();

        *self.toc.write().await = Default::default();
        *self.state.lock().await = FetchState::AwaitingInfo { completion };

        debug!("fetching TOC for port {}", self.port);
        self.send_request(vec![CMD_TOC_INFO]).await;
        result
    }

    /// abandons a running fetch and discards the TOC
    pub async fn clear(&self) {
        *self.state.lock().await = FetchState::Idle;
        *self.toc.write().await = Default::default();
    }

    pub async fn toc(&self) -> Arc<Toc> {
        self.toc.read().await.clone()
    }

    pub async fn is_fetching(&self) -> bool {
        !matches!(*self.state.lock().await, FetchState::Idle)
    }

    async fn send_request(&self, payload: Vec<u8>) {
        match Packet::new(self.port, TOC_CHANNEL, payload) {
            Ok(packet) => {
                self.ack_sender.send(packet, true).await;
            }
            Err(e) => debug!("invalid TOC request: {}", e),
        }
    }

    /// Called for every packet received on the TOC channel of this fetcher's port
    pub async fn on_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        let mut buf = packet.data();
        if buf.is_empty() {
            bail!("empty TOC response on port {}", self.port);
        }

        let mut state = self.state.lock().await;
        let previous_state = std::mem::replace(&mut *state, FetchState::Idle);
        match (buf.get_u8(), previous_state) {
            (CMD_TOC_INFO, FetchState::AwaitingInfo { completion }) => {
                if buf.is_empty() {
                    *state = FetchState::AwaitingInfo { completion };
                    bail!("TOC info on port {} has no element count", self.port);
                }
                let count = buf.get_u8();
                let crc = if buf.remaining() >= 4 { Some(buf.get_u32_le()) } else { None };
                debug!("TOC info for port {}: {} elements, CRC {:?}", self.port, count, crc);

                if let Some(crc) = crc {
                    if let Some(cached) = self.cache.get(self.port, crc).await {
                        if cached.len() == count as usize {
                            debug!("using cached TOC for port {}", self.port);
                            self.complete(cached, completion).await;
                            return Ok(());
                        }
                    }
                }

                if count == 0 {
                    self.complete(Arc::new(Toc::new(crc)), completion).await;
                    return Ok(());
                }

                *state = FetchState::AwaitingElements {
                    toc: Toc::new(crc),
                    count,
                    next_index: 0,
                    completion,
                };
                self.send_request(vec![CMD_TOC_ELEMENT, 0]).await;
            }
            (CMD_TOC_ELEMENT, FetchState::AwaitingElements { mut toc, count, next_index, completion }) => {
                let element = match TocElement::parse(buf, self.decode_type) {
                    Ok(element) => element,
                    Err(e) => {
                        *state = FetchState::AwaitingElements { toc, count, next_index, completion };
                        return Err(e);
                    }
                };

                if element.id != next_index {
                    trace!("received TOC element {} while waiting for {} - ignoring", element.id, next_index);
                    *state = FetchState::AwaitingElements { toc, count, next_index, completion };
                    return Ok(());
                }

                trace!("TOC element for port {}: {:?}", self.port, element);
                toc.insert(element);

                let next_index = next_index + 1;
                if next_index == count {
                    let toc = Arc::new(toc);
                    self.cache.insert(self.port, toc.clone()).await;
                    self.complete(toc, completion).await;
                }
                else {
                    *state = FetchState::AwaitingElements { toc, count, next_index, completion };
                    self.send_request(vec![CMD_TOC_ELEMENT, next_index]).await;
                }
            }
            (cmd, previous_state) => {
                trace!("unexpected TOC response with command {} on port {} - ignoring", cmd, self.port);
                *state = previous_state;
            }
        }
        Ok(())
    }

    async fn complete(&self, toc: Arc<Toc>, completion: oneshot::Sender<Arc<Toc>>) {
        info!("TOC for port {} complete with {} elements", self.port, toc.len());
        *self.toc.write().await = toc.clone();
        let _ = completion.send(toc);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time;
    use crate::config::CrazyflieConfig;
    use crate::test_util::link::TrackingMockLink;
    use crate::toc::value::ValueType;
    use super::*;

    const PORT: u8 = 5;

    fn decode_type(b: u8) -> anyhow::Result<(ValueType, bool)> {
        match b {
            1 => Ok((ValueType::U8, false)),
            7 => Ok((ValueType::F32, false)),
            _ => bail!("unknown type {}", b),
        }
    }

    async fn fetcher() -> (TocFetcher, Arc<TrackingMockLink>) {
        let ack_sender = Arc::new(AckSender::new(Arc::new(CrazyflieConfig::new())));
        let link = Arc::new(TrackingMockLink::new());
        ack_sender.set_link(Some(link.clone())).await;
        (TocFetcher::new(PORT, decode_type, ack_sender, Arc::new(TocCache::new())), link)
    }

    fn response(payload: &[u8]) -> Packet {
        Packet::new(PORT, TOC_CHANNEL, payload.to_vec()).unwrap()
    }

    fn request(payload: &[u8]) -> Packet {
        Packet::new(PORT, TOC_CHANNEL, payload.to_vec()).unwrap()
    }

    fn element_response(id: u8, type_byte: u8, group: &str, name: &str) -> Packet {
        let mut payload = vec![CMD_TOC_ELEMENT, id, type_byte];
        payload.extend_from_slice(group.as_bytes());
        payload.push(0);
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        response(&payload)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch() {
        let (fetcher, link) = fetcher().await;

        let mut result = fetcher.refresh().await;
        assert_eq!(link.sent_packets().await, vec![request(&[CMD_TOC_INFO])]);

        fetcher.on_packet(&response(&[CMD_TOC_INFO, 3])).await.unwrap();
        fetcher.on_packet(&element_response(0, 1, "acc", "x")).await.unwrap();
        fetcher.on_packet(&element_response(1, 7, "gyro", "x")).await.unwrap();
        assert!(result.try_recv().is_err());
        fetcher.on_packet(&element_response(2, 1, "pm", "state")).await.unwrap();

        let toc = result.await.unwrap();
        assert_eq!(toc.len(), 3);
        assert_eq!(toc.get("acc.x").unwrap().id, 0);
        assert_eq!(toc.get("gyro.x").unwrap().value_type, ValueType::F32);
        assert_eq!(fetcher.toc().await.len(), 3);
        assert!(!fetcher.is_fetching().await);

        assert_eq!(link.sent_packets().await, vec![
            request(&[CMD_TOC_INFO]),
            request(&[CMD_TOC_ELEMENT, 0]),
            request(&[CMD_TOC_ELEMENT, 1]),
            request(&[CMD_TOC_ELEMENT, 2]),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_toc() {
        let (fetcher, link) = fetcher().await;

        let result = fetcher.refresh().await;
        fetcher.on_packet(&response(&[CMD_TOC_INFO, 0])).await.unwrap();

        assert!(result.await.unwrap().is_empty());
        assert_eq!(link.sent_packets().await, vec![request(&[CMD_TOC_INFO])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_element_is_ignored() {
        let (fetcher, link) = fetcher().await;

        let result = fetcher.refresh().await;
        fetcher.on_packet(&response(&[CMD_TOC_INFO, 1])).await.unwrap();
        fetcher.on_packet(&element_response(4, 1, "a", "b")).await.unwrap();
        assert!(fetcher.is_fetching().await);

        fetcher.on_packet(&element_response(0, 1, "a", "c")).await.unwrap();
        let toc = result.await.unwrap();
        assert_eq!(toc.len(), 1);
        assert!(toc.get("a.c").is_some());
        assert_eq!(link.sent_on(PORT, TOC_CHANNEL).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_element_keeps_fetching() {
        let (fetcher, _link) = fetcher().await;

        let result = fetcher.refresh().await;
        fetcher.on_packet(&response(&[CMD_TOC_INFO, 1])).await.unwrap();
        assert!(fetcher.on_packet(&element_response(0, 99, "a", "b")).await.is_err());
        assert!(fetcher.is_fetching().await);

        fetcher.on_packet(&element_response(0, 1, "a", "b")).await.unwrap();
        assert_eq!(result.await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_when_idle_is_ignored() {
        let (fetcher, link) = fetcher().await;

        fetcher.on_packet(&response(&[CMD_TOC_INFO, 3])).await.unwrap();
        fetcher.on_packet(&element_response(0, 1, "a", "b")).await.unwrap();

        assert!(link.sent_packets().await.is_empty());
        assert!(fetcher.toc().await.is_empty());
        assert!(!fetcher.is_fetching().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_answer_is_retried() {
        let (fetcher, link) = fetcher().await;

        let _result = fetcher.refresh().await;
        time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(link.sent_packets().await, vec![request(&[CMD_TOC_INFO]), request(&[CMD_TOC_INFO])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_discards_previous_fetch() {
        let (fetcher, _link) = fetcher().await;

        let first = fetcher.refresh().await;
        fetcher.on_packet(&response(&[CMD_TOC_INFO, 0])).await.unwrap();
        assert!(first.await.is_ok());

        let second = fetcher.refresh().await;
        assert!(fetcher.toc().await.is_empty());
        let third = fetcher.refresh().await;
        assert!(second.await.is_err());

        fetcher.clear().await;
        assert!(third.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_toc() {
        let (fetcher, link) = fetcher().await;

        let result = fetcher.refresh().await;
        fetcher.on_packet(&response(&[CMD_TOC_INFO, 1, 0x78, 0x56, 0x34, 0x12])).await.unwrap();
        fetcher.on_packet(&element_response(0, 1, "a", "b")).await.unwrap();
        assert_eq!(result.await.unwrap().crc(), Some(0x1234_5678));

        link.clear_sent().await;
        let result = fetcher.refresh().await;
        fetcher.on_packet(&response(&[CMD_TOC_INFO, 1, 0x78, 0x56, 0x34, 0x12])).await.unwrap();
        assert!(result.await.unwrap().get("a.b").is_some());
        assert_eq!(link.sent_packets().await, vec![request(&[CMD_TOC_INFO])]);

        // different CRC: full fetch
        link.clear_sent().await;
        let _result = fetcher.refresh().await;
        fetcher.on_packet(&response(&[CMD_TOC_INFO, 1, 0, 0, 0, 0])).await.unwrap();
        assert_eq!(link.sent_packets().await, vec![request(&[CMD_TOC_INFO]), request(&[CMD_TOC_ELEMENT, 0])]);
    }
}
