use crate::config::{FlowConfig, MAX_PACKET_PAYLOAD};
use crate::end_point::DrainCallback;
use crate::event_dispatcher::EventDispatcher;
use crate::packet_header::{PacketHeader, PacketKind, HEADER_LEN};
use crate::safe_converter::PrecheckedCast;
use crate::send_pipeline::SendPipeline;
use crate::session_table::SessionTable;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, trace};

/// Pull-based source of packed PSH packets for one transfer. The first
///  advance yields the opening window; every later advance packs exactly the
///  sequences handed in (the suppression-filtered request set). Fragments are
///  packed at emission time, not up front, so a request costs memory only for
///  what is actually re-sent.
pub(crate) struct FragmentGenerator {
    data: Bytes,
    transfer_id: u32,
    total_count: u16,
    /// Burst window carried in every PSH as the receiver's batching hint.
    window_hint: u16,
    opening_window: u16,
    started: bool,
    packed_count: u64,
}

impl FragmentGenerator {
    pub(crate) fn new(
        data: Bytes,
        transfer_id: u32,
        total_count: u16,
        window_hint: u16,
        opening_window: u16,
    ) -> FragmentGenerator {
        FragmentGenerator {
            data,
            transfer_id,
            total_count,
            window_hint,
            opening_window,
            started: false,
            packed_count: 0,
        }
    }

    pub(crate) fn next(&mut self, requested: Option<&[u16]>) -> Vec<(u16, Bytes)> {
        let seqs: Vec<u16> = match requested {
            None if !self.started => {
                self.started = true;
                (0..self.opening_window).collect()
            }
            None => Vec::new(),
            Some(requested) => requested.iter()
                .copied()
                .filter(|&seq| {
                    if seq >= self.total_count {
                        debug!("request for sequence {} beyond total {} of transfer {} - ignoring",
                            seq, self.total_count, self.transfer_id);
                        return false;
                    }
                    true
                })
                .collect(),
        };

        seqs.into_iter()
            .map(|seq| (seq, self.pack(seq)))
            .collect()
    }

    fn pack(&mut self, seq: u16) -> Bytes {
        self.packed_count += 1;

        let start = seq as usize * MAX_PACKET_PAYLOAD;
        let end = (start + MAX_PACKET_PAYLOAD).min(self.data.len());

        let mut buf = BytesMut::with_capacity(HEADER_LEN + 6 + (end - start));
        PacketHeader::new(self.transfer_id, PacketKind::Push {
            seq,
            single_total: self.window_hint,
            total_count: self.total_count,
        }).ser(&mut buf);
        buf.put_slice(&self.data[start..end]);
        buf.freeze()
    }

    /// Packed fragments over the transfer's fragment count - 1.0 for a
    ///  loss-free transfer, higher the more was re-sent.
    pub(crate) fn repeat_rate(&self) -> f64 {
        self.packed_count as f64 / self.total_count as f64
    }
}


struct SendSessionInner {
    transfer_id: u32,
    peer_addr: SocketAddr,

    config: Arc<FlowConfig>,
    pipeline: Arc<SendPipeline>,

    generator: FragmentGenerator,
    /// Packed PSH packets awaiting the next pacing tick, keyed by sequence.
    outbound_queue: BTreeMap<u16, Bytes>,
    /// Sequences of the most recent REQ; echoed duplicates within one RTT are
    ///  subtracted against this set.
    last_request_seqs: BTreeSet<u16>,
    /// Packets of the last pacing burst, kept for the stall re-send.
    last_burst: Vec<Bytes>,

    pacing_handle: Option<JoinHandle<()>>,
    stall_handle: Option<JoinHandle<()>>,
    suppression_handle: Option<JoinHandle<()>>,

    drain_callback: Option<DrainCallback>,
    closed: bool,
}

impl SendSessionInner {
    fn cancel_timers(&mut self) {
        for handle in [
            self.pacing_handle.take(),
            self.stall_handle.take(),
            self.suppression_handle.take(),
        ].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// One transfer being sent. Fragments drain from the outbound queue on the
///  pacing interval; REQ packets from the peer re-queue exactly the missing
///  sequences; FIN from the peer completes the transfer. A drained queue with
///  a silent peer triggers the escalating stall re-send, and after the
///  configured rounds the transfer is abandoned with a timeout event.
#[derive(Clone)]
pub(crate) struct SendSession {
    inner: Arc<RwLock<SendSessionInner>>,
    dispatcher: Arc<dyn EventDispatcher>,
    table: Arc<RwLock<SessionTable<SendSession>>>,
}

impl SendSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transfer_id: u32,
        peer_addr: SocketAddr,
        payload: Bytes,
        config: Arc<FlowConfig>,
        pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn EventDispatcher>,
        table: Arc<RwLock<SessionTable<SendSession>>>,
        drain_callback: Option<DrainCallback>,
    ) -> SendSession {
        let total_count: u16 = payload.len().div_ceil(MAX_PACKET_PAYLOAD).prechecked_cast();
        let window_hint = config.parallel_count.min(total_count);
        let opening_window = (window_hint as u32 * config.burst_frequency())
            .min(total_count as u32) as u16;

        let mut generator = FragmentGenerator::new(
            payload, transfer_id, total_count, window_hint, opening_window);
        let outbound_queue: BTreeMap<u16, Bytes> = generator.next(None).into_iter().collect();

        debug!("sending transfer {} to {:?}: {} fragments, opening window {}",
            transfer_id, peer_addr, total_count, opening_window);

        SendSession {
            inner: Arc::new(RwLock::new(SendSessionInner {
                transfer_id,
                peer_addr,
                config,
                pipeline,
                generator,
                outbound_queue,
                last_request_seqs: BTreeSet::new(),
                last_burst: Vec::new(),
                pacing_handle: None,
                stall_handle: None,
                suppression_handle: None,
                drain_callback,
                closed: false,
            })),
            dispatcher,
            table,
        }
    }

    pub(crate) async fn spawn_pacing(&self) {
        let period = self.inner.read().await.config.pacing_interval();

        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tick.tick().await;
                if !session.on_pacing_tick().await {
                    return;
                }
            }
        });
        self.inner.write().await.pacing_handle = Some(handle);
    }

    /// Drains one burst from the outbound queue; with nothing left to send,
    ///  arms the stall escalation instead. Returns false once the session is
    ///  closed and the pacing loop should end.
    async fn on_pacing_tick(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return false;
        }

        if inner.outbound_queue.is_empty() {
            if inner.stall_handle.is_none() {
                self.arm_stall_escalation(&mut inner);
            }
            return true;
        }

        let burst_limit = inner.config.parallel_count as usize;
        let mut burst = Vec::with_capacity(burst_limit.min(inner.outbound_queue.len()));
        while burst.len() < burst_limit {
            match inner.outbound_queue.pop_first() {
                Some((_, packet)) => burst.push(packet),
                None => break,
            }
        }

        trace!("pacing tick: {} fragments of transfer {} to {:?}, {} queued",
            burst.len(), inner.transfer_id, inner.peer_addr, inner.outbound_queue.len());
        for packet in &burst {
            inner.pipeline.seal_and_send(inner.peer_addr, packet).await;
        }
        inner.last_burst = burst;
        true
    }

    /// Handles a REQ from the peer: subtracts the previous request's
    ///  sequences (duplicate REQs within one RTT are echoes, not news) and
    ///  re-queues the remainder through the generator.
    pub(crate) async fn on_request(&self, requested: Vec<u16>) {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return;
        }

        // the peer is alive - stop any stall escalation
        if let Some(handle) = inner.stall_handle.take() {
            handle.abort();
        }

        let fresh: Vec<u16> = requested.iter()
            .copied()
            .filter(|seq| !inner.last_request_seqs.contains(seq))
            .collect();
        if fresh.is_empty() {
            trace!("REQ for transfer {} from {:?} carries no new sequences - suppressed",
                inner.transfer_id, inner.peer_addr);
            return;
        }

        inner.last_request_seqs = requested.into_iter().collect();
        self.arm_suppression_clear(&mut inner);

        let packed = inner.generator.next(Some(&fresh));
        trace!("re-queueing {} fragments of transfer {} for {:?}",
            packed.len(), inner.transfer_id, inner.peer_addr);
        for (seq, packet) in packed {
            inner.outbound_queue.insert(seq, packet);
        }
    }

    fn arm_suppression_clear(&self, inner: &mut SendSessionInner) {
        if let Some(handle) = inner.suppression_handle.take() {
            handle.abort();
        }

        let delay = inner.config.effective_rtt();
        let session = self.clone();
        inner.suppression_handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            let mut inner = session.inner.write().await;
            inner.suppression_handle = None;
            inner.last_request_seqs.clear();
        }));
    }

    fn arm_stall_escalation(&self, inner: &mut SendSessionInner) {
        let session = self.clone();
        inner.stall_handle = Some(tokio::spawn(async move {
            session.stall_escalation().await;
        }));
    }

    /// Escalating re-send of the last burst while the peer stays silent;
    ///  aborted by any REQ or FIN. After the final silent wait the transfer
    ///  is abandoned.
    async fn stall_escalation(&self) {
        let (base, rounds) = {
            let inner = self.inner.read().await;
            (inner.config.effective_rtt() + Duration::from_secs(1), inner.config.stall_rounds)
        };

        let mut delay = base;
        for round in 1..=rounds {
            sleep(delay).await;

            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }

            if round == rounds {
                // this task holds the stall slot - clear it so the teardown
                //  does not abort the code below
                inner.stall_handle = None;
                drop(inner);
                self.abandon().await;
                return;
            }

            debug!("no word from {:?} about transfer {} - re-sending last burst of {} packets (round {})",
                inner.peer_addr, inner.transfer_id, inner.last_burst.len(), round);
            for packet in &inner.last_burst {
                inner.pipeline.seal_and_send(inner.peer_addr, packet).await;
            }
            drop(inner);

            delay = delay.mul_f64(1.8);
        }
    }

    async fn abandon(&self) {
        let key = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.cancel_timers();
            inner.drain_callback = None;
            debug!("transfer {} to {:?} timed out with {} fragments still queued",
                inner.transfer_id, inner.peer_addr, inner.outbound_queue.len());
            (inner.peer_addr, inner.transfer_id)
        };

        self.table.write().await.remove(&key);
        self.dispatcher.on_timeout(key.1, key.0).await;
    }

    /// Handles FIN from the peer: the transfer is complete. Confirms with
    ///  ACK(FIN), fires the drain notifications and leaves the session dead;
    ///  the caller has already taken it out of the table.
    pub(crate) async fn on_finish(&self) {
        let (key, pipeline, callback) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.cancel_timers();
            debug!("transfer {} to {:?} drained - repeat rate {:.2}",
                inner.transfer_id, inner.peer_addr, inner.generator.repeat_rate());
            (
                (inner.peer_addr, inner.transfer_id),
                inner.pipeline.clone(),
                inner.drain_callback.take(),
            )
        };

        let ack = PacketHeader::new(key.1, PacketKind::Ack { acked: PacketKind::FINISH }).to_packet();
        pipeline.seal_and_send(key.0, &ack).await;

        self.dispatcher.on_drain(key.1, key.0).await;
        if let Some(callback) = callback {
            callback(key.1, key.0);
        }
    }

    /// Stops the session without any notification - the sweep and close path.
    pub(crate) async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        inner.closed = true;
        inner.cancel_timers();
        inner.drain_callback = None;
        debug!("sending session {} for {:?} torn down, {} fragments still queued",
            inner.transfer_id, inner.peer_addr, inner.outbound_queue.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope;
    use crate::event_dispatcher::MockEventDispatcher;
    use crate::send_pipeline::MockSendSocket;
    use rstest::rstest;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PEER: ([u8; 4], u16) = ([127, 0, 0, 1], 9);

    fn small_config() -> FlowConfig {
        let mut config = FlowConfig::default_ipv4(0);
        // 3 fragments per burst, pacing interval of 1s, opening factor 1
        config.parallel_count = 3;
        config.bandwidth = 3 * MAX_PACKET_PAYLOAD as u64;
        config
    }

    fn test_session(
        socket: MockSendSocket,
        dispatcher: MockEventDispatcher,
        payload_len: usize,
        config: FlowConfig,
    ) -> SendSession {
        SendSession::new(
            7,
            SocketAddr::from(PEER),
            Bytes::from(vec![0xabu8; payload_len]),
            Arc::new(config),
            Arc::new(SendPipeline::new(Arc::new(socket))),
            Arc::new(dispatcher),
            Arc::new(RwLock::new(SessionTable::new())),
            None,
        )
    }

    #[rstest]
    #[case::opening_window_packs_prefix(5, 3, vec![0, 1, 2])]
    #[case::opening_window_clamped_to_total(2, 4, vec![0, 1])]
    fn test_generator_opening_window(
        #[case] total_count: u16,
        #[case] opening_window: u16,
        #[case] expected_seqs: Vec<u16>,
    ) {
        let data = Bytes::from(vec![1u8; MAX_PACKET_PAYLOAD * (total_count as usize - 1) + 5]);
        let mut generator = FragmentGenerator::new(
            data, 7, total_count, 3, opening_window.min(total_count));

        let packed = generator.next(None);
        let seqs: Vec<u16> = packed.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, expected_seqs);

        // a second unsolicited advance yields nothing
        assert!(generator.next(None).is_empty());
    }

    #[test]
    fn test_generator_packs_header_and_slice() {
        let mut data = vec![5u8; MAX_PACKET_PAYLOAD];
        data.extend_from_slice(&[1, 2, 3]);
        let mut generator = FragmentGenerator::new(Bytes::from(data), 9, 2, 3, 2);

        let packed = generator.next(None);

        let (seq, packet) = &packed[1];
        assert_eq!(*seq, 1);
        let mut parse_buf = &packet[..];
        let header = PacketHeader::deser(&mut parse_buf).unwrap();
        assert_eq!(header, PacketHeader::new(9, PacketKind::Push {
            seq: 1,
            single_total: 3,
            total_count: 2,
        }));
        assert_eq!(parse_buf, &[1, 2, 3]);

        let (_, first) = &packed[0];
        assert_eq!(first.len(), HEADER_LEN + 6 + MAX_PACKET_PAYLOAD);
    }

    #[test]
    fn test_generator_ignores_sequences_beyond_total() {
        let mut generator = FragmentGenerator::new(Bytes::from(vec![1u8; 10]), 7, 1, 1, 1);
        generator.next(None);

        let packed = generator.next(Some(&[0, 1, 500]));
        let seqs: Vec<u16> = packed.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![0]);
    }

    #[test]
    fn test_generator_repeat_rate() {
        let mut generator = FragmentGenerator::new(
            Bytes::from(vec![1u8; MAX_PACKET_PAYLOAD * 4]), 7, 4, 4, 4);
        generator.next(None);
        generator.next(Some(&[1, 2]));

        assert!((generator.repeat_rate() - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_pacing_tick_sends_at_most_one_window() {
        let sent = Arc::new(AtomicUsize::new(0));
        let sent_probe = sent.clone();

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .returning(move |_, _| { sent_probe.fetch_add(1, Ordering::SeqCst); });

        // 7 fragments, parallel_count 3, bandwidth high enough that the
        //  opening window covers the whole transfer
        let mut config = small_config();
        config.bandwidth = 100 * MAX_PACKET_PAYLOAD as u64;
        let session = test_session(
            socket, MockEventDispatcher::new(), MAX_PACKET_PAYLOAD * 7, config);

        assert!(session.on_pacing_tick().await);
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert_eq!(session.inner.read().await.last_burst.len(), 3);

        assert!(session.on_pacing_tick().await);
        assert!(session.on_pacing_tick().await);
        assert_eq!(sent.load(Ordering::SeqCst), 7);
        assert_eq!(session.inner.read().await.last_burst.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_tick_arms_the_stall_escalation() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().return_const(());

        let session = test_session(
            socket, MockEventDispatcher::new(), 10, small_config());

        assert!(session.on_pacing_tick().await);
        assert!(session.inner.read().await.stall_handle.is_none());

        assert!(session.on_pacing_tick().await);
        assert!(session.inner.read().await.stall_handle.is_some());
    }

    #[tokio::test]
    async fn test_request_requeues_only_fresh_sequences() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().return_const(());

        let session = test_session(
            socket, MockEventDispatcher::new(), MAX_PACKET_PAYLOAD * 5, small_config());
        // drain the opening window out of the queue
        session.on_pacing_tick().await;

        session.on_request(vec![0, 2]).await;
        {
            let inner = session.inner.read().await;
            let queued: Vec<u16> = inner.outbound_queue.keys().copied().collect();
            assert_eq!(queued, vec![0, 2]);
        }

        // an echoed duplicate of the same REQ brings nothing new
        session.on_request(vec![0, 2]).await;
        // a partially fresh REQ adds only the fresh sequence
        session.on_request(vec![2, 4]).await;

        let inner = session.inner.read().await;
        let queued: Vec<u16> = inner.outbound_queue.keys().copied().collect();
        assert_eq!(queued, vec![0, 2, 4]);
        assert_eq!(inner.generator.packed_count, 3 + 3);
    }

    #[tokio::test]
    async fn test_request_cancels_the_stall_escalation() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().return_const(());

        let session = test_session(
            socket, MockEventDispatcher::new(), 10, small_config());
        session.on_pacing_tick().await;
        session.on_pacing_tick().await;
        assert!(session.inner.read().await.stall_handle.is_some());

        session.on_request(vec![0]).await;
        assert!(session.inner.read().await.stall_handle.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppression_window_clears_after_one_rtt() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().return_const(());

        let config = small_config();
        let rtt = config.effective_rtt();
        let session = test_session(
            socket, MockEventDispatcher::new(), MAX_PACKET_PAYLOAD * 3, config);
        session.on_pacing_tick().await;

        session.on_request(vec![1]).await;
        assert!(!session.inner.read().await.last_request_seqs.is_empty());

        tokio::time::sleep(rtt + Duration::from_millis(5)).await;
        assert!(session.inner.read().await.last_request_seqs.is_empty());

        // the same sequence is fresh again after the window cleared
        let packed_before = session.inner.read().await.generator.packed_count;
        session.on_request(vec![1]).await;
        let inner = session.inner.read().await;
        assert!(inner.outbound_queue.contains_key(&1));
        assert_eq!(inner.generator.packed_count, packed_before + 1);
    }

    #[tokio::test]
    async fn test_finish_acks_drains_and_runs_callback() {
        let expected_ack = envelope::seal(
            &PacketHeader::new(7, PacketKind::Ack { acked: PacketKind::FINISH }).to_packet());
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .once()
            .withf(move |addr, buf|
                addr == &SocketAddr::from(PEER) && buf == expected_ack.as_slice())
            .return_const(());

        let mut dispatcher = MockEventDispatcher::new();
        dispatcher.expect_on_drain()
            .once()
            .withf(|id, peer| *id == 7 && peer == &SocketAddr::from(PEER))
            .return_const(());

        let callback_ran = Arc::new(StdMutex::new(None));
        let callback_probe = callback_ran.clone();

        let session = SendSession::new(
            7,
            SocketAddr::from(PEER),
            Bytes::from(vec![1u8; 10]),
            Arc::new(small_config()),
            Arc::new(SendPipeline::new(Arc::new(socket))),
            Arc::new(dispatcher),
            Arc::new(RwLock::new(SessionTable::new())),
            Some(Box::new(move |id, peer| {
                *callback_probe.lock().unwrap() = Some((id, peer));
            })),
        );

        session.on_finish().await;

        assert_eq!(*callback_ran.lock().unwrap(), Some((7, SocketAddr::from(PEER))));
        assert!(session.inner.read().await.closed);

        // a duplicate FIN against the dead session is inert
        session.on_finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_escalation_times_out_after_three_rounds() {
        let resends = Arc::new(AtomicUsize::new(0));
        let resend_probe = resends.clone();

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .returning(move |_, _| { resend_probe.fetch_add(1, Ordering::SeqCst); });

        let mut dispatcher = MockEventDispatcher::new();
        dispatcher.expect_on_timeout()
            .once()
            .withf(|id, peer| *id == 7 && peer == &SocketAddr::from(PEER))
            .return_const(());

        let config = small_config();
        let base = config.effective_rtt() + Duration::from_secs(1);
        let session = test_session(socket, MockEventDispatcher::new(), 10, config);
        let session = SendSession {
            dispatcher: Arc::new(dispatcher),
            ..session
        };
        session.table.write().await.insert((SocketAddr::from(PEER), 7), session.clone());

        // one fragment sent, then the queue is empty and the stall arms
        session.on_pacing_tick().await;
        let after_initial = resends.load(Ordering::SeqCst);
        session.on_pacing_tick().await;
        assert!(session.inner.read().await.stall_handle.is_some());

        // two re-send rounds, then the abandon round
        tokio::time::sleep(base + Duration::from_millis(5)).await;
        assert_eq!(resends.load(Ordering::SeqCst), after_initial + 1);
        tokio::time::sleep(base.mul_f64(1.8) + Duration::from_millis(5)).await;
        assert_eq!(resends.load(Ordering::SeqCst), after_initial + 2);
        tokio::time::sleep(base.mul_f64(1.8 * 1.8) + Duration::from_millis(5)).await;

        assert!(session.inner.read().await.closed);
        assert!(!session.table.read().await.contains(&(SocketAddr::from(PEER), 7)));
    }
}
