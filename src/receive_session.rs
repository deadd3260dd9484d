use crate::config::{FlowConfig, LATENCY, MAX_PACKET_PAYLOAD};
use crate::event_dispatcher::EventDispatcher;
use crate::packet_header::{PacketHeader, PacketKind};
use crate::safe_converter::SafeCast;
use crate::seq_list;
use crate::send_pipeline::SendPipeline;
use crate::session_table::{SessionKey, SessionTable};
use bytes::{BufMut, Bytes};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

/// Completed transfers whose FIN has not been acknowledged yet, with the
///  number of retries spent so far. Shared between the receiving sessions
///  (which enqueue) and the endpoint's retry loop (which re-sends and
///  expires), and drained by ACK(FIN) from the peer.
pub(crate) type FinishNotifySet = Arc<Mutex<FxHashMap<SessionKey, u32>>>;

struct ReceiveSessionInner {
    transfer_id: u32,
    peer_addr: SocketAddr,

    config: Arc<FlowConfig>,
    pipeline: Arc<SendPipeline>,

    /// Reassembly buffer, indexed by fragment sequence number. Sized on the
    ///  first PSH and cleared again on delivery; the `delivered` flag keeps
    ///  late duplicates out afterwards.
    fragments: Vec<Option<Bytes>>,
    received_count: usize,
    /// Authoritative once the first PSH has been seen.
    total_count: u16,
    /// The sender's burst window hint - bounds the number of holes requested
    ///  per REQ.
    single_total: u16,

    /// Forward pointer of the hole scan; everything below it is known filled.
    last_scan_index: usize,
    /// Hole-scan rounds since the last stored fragment.
    retry_count: u32,
    duplicate_count: u64,

    delivered: bool,
    delivered_at: Option<Instant>,

    hole_check_handle: Option<JoinHandle<()>>,
    closed: bool,
}

impl ReceiveSessionInner {
    /// Walks forward from `last_scan_index`, collecting up to `single_total`
    ///  empty slots, and advances `last_scan_index` to the first hole found
    ///  (or past the end if there is none).
    fn scan_holes(&mut self) -> Vec<u16> {
        let limit: usize = self.single_total.max(1).safe_cast();
        let total: usize = self.total_count.safe_cast();

        let mut holes = Vec::new();
        let mut first_hole = None;
        for i in self.last_scan_index..total {
            if holes.len() >= limit {
                break;
            }
            if self.fragments[i].is_none() {
                first_hole.get_or_insert(i);
                holes.push(i as u16);
            }
        }
        self.last_scan_index = first_hole.unwrap_or(total);
        holes
    }

    fn is_complete(&self) -> bool {
        self.total_count > 0 && self.received_count == self.total_count.safe_cast()
    }

    fn assemble_payload(&mut self) -> Vec<u8> {
        let len = self.fragments.iter()
            .flatten()
            .map(|fragment| fragment.len())
            .sum();

        let mut payload = Vec::with_capacity(len);
        for fragment in self.fragments.drain(..).flatten() {
            payload.extend_from_slice(&fragment);
        }
        payload
    }

    async fn send_request(&mut self, holes: &[u16]) {
        let encoded = seq_list::zip(holes)
            .expect("fragment sequence numbers are 15-bit by construction");

        let mut packet = PacketHeader::new(self.transfer_id, PacketKind::Request).to_packet();
        for value in encoded {
            packet.put_u16(value);
        }

        trace!("requesting {} missing fragments of transfer {} from {:?}",
            holes.len(), self.transfer_id, self.peer_addr);
        self.pipeline.seal_and_send(self.peer_addr, &packet).await;
    }
}

/// One transfer being received and reassembled. The session is driven by two
///  inputs: PSH packets stored into the reassembly buffer, and a hole-check
///  delay that is (re)armed by every PSH and decides between completion, a
///  retransmission request, and giving up.
#[derive(Clone)]
pub(crate) struct ReceiveSession {
    inner: Arc<RwLock<ReceiveSessionInner>>,
    dispatcher: Arc<dyn EventDispatcher>,
    table: Arc<RwLock<SessionTable<ReceiveSession>>>,
    finish_notify: FinishNotifySet,
}

enum HoleCheckOutcome {
    Deliver(Vec<u8>),
    GiveUp,
    Requested,
    Settled,
}

impl ReceiveSession {
    pub(crate) fn new(
        transfer_id: u32,
        peer_addr: SocketAddr,
        config: Arc<FlowConfig>,
        pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn EventDispatcher>,
        table: Arc<RwLock<SessionTable<ReceiveSession>>>,
        finish_notify: FinishNotifySet,
    ) -> ReceiveSession {
        ReceiveSession {
            inner: Arc::new(RwLock::new(ReceiveSessionInner {
                transfer_id,
                peer_addr,
                config,
                pipeline,
                fragments: Vec::new(),
                received_count: 0,
                total_count: 0,
                single_total: 1,
                last_scan_index: 0,
                retry_count: 0,
                duplicate_count: 0,
                delivered: false,
                delivered_at: None,
                hole_check_handle: None,
                closed: false,
            })),
            dispatcher,
            table,
            finish_notify,
        }
    }

    /// Stores one fragment and (re)arms the hole check. Duplicates are
    ///  counted and dropped; malformed fragments are dropped outright.
    pub(crate) async fn on_push(&self, seq: u16, single_total: u16, total_count: u16, payload: Bytes) {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return;
        }

        if total_count == 0 {
            warn!("PSH from {:?} declares a zero-fragment transfer - dropping", inner.peer_addr);
            return;
        }

        if inner.total_count == 0 {
            inner.total_count = total_count;
            inner.fragments = vec![None; total_count as usize];
        }
        else if total_count != inner.total_count {
            debug!("PSH for transfer {} from {:?} declares total {} but {} is on record - keeping the record",
                inner.transfer_id, inner.peer_addr, total_count, inner.total_count);
        }
        inner.single_total = single_total.max(1);

        if seq >= inner.total_count {
            warn!("PSH from {:?} carries sequence {} beyond total {} - dropping",
                inner.peer_addr, seq, inner.total_count);
            return;
        }

        let index = seq as usize;
        if inner.delivered || inner.fragments[index].is_some() {
            inner.duplicate_count += 1;
            trace!("duplicate fragment {} of transfer {} from {:?}", seq, inner.transfer_id, inner.peer_addr);
        }
        else {
            let is_last = index + 1 == inner.total_count as usize;
            if payload.len() > MAX_PACKET_PAYLOAD || (!is_last && payload.len() != MAX_PACKET_PAYLOAD) {
                warn!("fragment {} of transfer {} from {:?} has invalid length {} - dropping",
                    seq, inner.transfer_id, inner.peer_addr, payload.len());
                return;
            }

            inner.fragments[index] = Some(payload);
            inner.received_count += 1;
            inner.retry_count = 0;
        }

        self.arm_hole_check(&mut inner, LATENCY);
    }

    fn arm_hole_check(&self, inner: &mut ReceiveSessionInner, delay: Duration) {
        if let Some(handle) = inner.hole_check_handle.take() {
            handle.abort();
        }

        let session = self.clone();
        inner.hole_check_handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            session.hole_check().await;
        }));
    }

    /// Decides what the reassembly buffer needs: announce completion, request
    ///  the first batch of missing fragments, or give the transfer up after
    ///  too many fruitless rounds.
    async fn hole_check(&self) {
        let outcome = {
            let mut inner = self.inner.write().await;
            // the armed handle is this task
            inner.hole_check_handle = None;

            if inner.closed || inner.delivered {
                HoleCheckOutcome::Settled
            }
            else if inner.is_complete() {
                let payload = inner.assemble_payload();
                inner.delivered = true;
                inner.delivered_at = Some(Instant::now());
                debug!("transfer {} from {:?} complete: {} bytes, {} duplicate fragments",
                    inner.transfer_id, inner.peer_addr, payload.len(), inner.duplicate_count);

                let fin = PacketHeader::new(inner.transfer_id, PacketKind::Finish).to_packet();
                inner.pipeline.seal_and_send(inner.peer_addr, &fin).await;

                HoleCheckOutcome::Deliver(payload)
            }
            else if inner.retry_count > inner.config.hole_scan_retry_limit {
                inner.closed = true;
                debug!("giving up on partial transfer {} from {:?} after {} request rounds ({}/{} fragments)",
                    inner.transfer_id, inner.peer_addr, inner.retry_count,
                    inner.received_count, inner.total_count);
                HoleCheckOutcome::GiveUp
            }
            else {
                let holes = inner.scan_holes();
                inner.send_request(&holes).await;
                inner.retry_count += 1;

                let delay = inner.config.effective_rtt();
                self.arm_hole_check(&mut inner, delay);
                HoleCheckOutcome::Requested
            }
        };

        match outcome {
            HoleCheckOutcome::Deliver(payload) => {
                let (peer_addr, transfer_id) = self.identity().await;
                self.finish_notify.lock().await.insert((peer_addr, transfer_id), 0);
                self.dispatcher.on_message(payload, peer_addr, transfer_id).await;
            }
            HoleCheckOutcome::GiveUp => {
                let key = self.identity().await;
                self.table.write().await.remove(&key);
            }
            HoleCheckOutcome::Requested | HoleCheckOutcome::Settled => {}
        }
    }

    async fn identity(&self) -> SessionKey {
        let inner = self.inner.read().await;
        (inner.peer_addr, inner.transfer_id)
    }

    /// True iff this entry finished its transfer long enough ago that the
    ///  peer may legitimately be reusing the id for a fresh transfer.
    pub(crate) async fn is_recyclable(&self) -> bool {
        let inner = self.inner.read().await;
        match (inner.delivered, inner.delivered_at) {
            (true, Some(at)) => at.elapsed() > inner.config.delivered_recycle_after,
            _ => false,
        }
    }

    /// Stops the session: cancels the hole check and blocks all further
    ///  input. Removal from the table is the caller's business.
    pub(crate) async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        inner.closed = true;
        if let Some(handle) = inner.hole_check_handle.take() {
            handle.abort();
        }
        debug!("receiving session {} for {:?} torn down ({}/{} fragments, {} duplicates)",
            inner.transfer_id, inner.peer_addr, inner.received_count,
            inner.total_count, inner.duplicate_count);
    }
}
