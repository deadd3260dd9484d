use crate::config::{FlowConfig, MAX_BUFFER_SIZE};
use crate::envelope;
use crate::errors::SendError;
use crate::event_dispatcher::EventDispatcher;
use crate::packet_header::{PacketHeader, PacketKind, ERR_ID_NOT_FOUND};
use crate::receive_session::{FinishNotifySet, ReceiveSession};
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::send_session::SendSession;
use crate::seq_list;
use crate::session_table::{IdAllocator, SessionKey, SessionTable};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

/// Per-send completion hook: runs once when the peer has acknowledged the
///  whole transfer. Destroying the sending session releases the closure.
pub type DrainCallback = Box<dyn FnOnce(u32, SocketAddr) + Send + Sync + 'static>;

/// EndPoint is the place where all other parts of the protocol come together:
///  it listens on a UdpSocket, dispatches incoming packets to the session the
///  packet kind belongs to, and has the API for application code to send
///  transfers.
///
/// All background work (receive loop, FIN retry loop, table sweeps, per-session
///  timers) lives in spawned tasks owned by this endpoint or its sessions;
///  `close` tears all of it down and must be called before the endpoint is
///  discarded.
pub struct EndPoint {
    config: Arc<FlowConfig>,
    pipeline: Arc<SendPipeline>,
    dispatcher: Arc<dyn EventDispatcher>,

    send_sessions: Arc<RwLock<SessionTable<SendSession>>>,
    recv_sessions: Arc<RwLock<SessionTable<ReceiveSession>>>,
    id_allocator: StdMutex<IdAllocator>,
    finish_notify: FinishNotifySet,

    local_addr: SocketAddr,
    closed: AtomicBool,
    background_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        for handle in self.background_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl EndPoint {
    /// Binds a fresh UDP socket per the config and starts the endpoint.
    pub async fn bind(
        config: Arc<FlowConfig>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> anyhow::Result<Arc<EndPoint>> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("bound receive socket to {:?}", socket.local_addr());
        Self::with_socket(socket, config, dispatcher)
    }

    /// Runs the endpoint on an externally created socket.
    pub fn with_socket(
        socket: Arc<UdpSocket>,
        config: Arc<FlowConfig>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> anyhow::Result<Arc<EndPoint>> {
        Self::with_sockets(socket.clone(), Arc::new(socket), config, dispatcher)
    }

    /// Full seam: a receive socket plus a separately injected outbound
    ///  [`SendSocket`] (which tests use for loss injection).
    pub fn with_sockets(
        receive_socket: Arc<UdpSocket>,
        outbound: Arc<dyn SendSocket>,
        config: Arc<FlowConfig>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;
        let local_addr = receive_socket.local_addr();

        let endpoint = Arc::new(EndPoint {
            config,
            pipeline: Arc::new(SendPipeline::new(outbound)),
            dispatcher,
            send_sessions: Arc::new(RwLock::new(SessionTable::new())),
            recv_sessions: Arc::new(RwLock::new(SessionTable::new())),
            id_allocator: StdMutex::new(IdAllocator::new()),
            finish_notify: Arc::new(Mutex::new(FxHashMap::default())),
            local_addr,
            closed: AtomicBool::new(false),
            background_tasks: StdMutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(endpoint.clone().recv_loop(receive_socket)),
            tokio::spawn(endpoint.clone().finish_notify_loop()),
            tokio::spawn(endpoint.clone().sweep_send_sessions()),
            tokio::spawn(endpoint.clone().sweep_recv_sessions()),
        ];
        *endpoint.background_tasks.lock().unwrap() = tasks;

        Ok(endpoint)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts sending `payload` to `peer` (or the configured default peer)
    ///  and returns the allocated transfer id; empty input is a no-op.
    ///  Completion is reported through the dispatcher's `on_drain` (and the
    ///  optional per-send callback), abandonment through `on_timeout`.
    pub async fn send(
        &self,
        payload: &[u8],
        peer: Option<SocketAddr>,
        on_drain: Option<DrainCallback>,
    ) -> Result<Option<u32>, SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        if payload.is_empty() {
            return Ok(None);
        }
        if payload.len() > MAX_BUFFER_SIZE {
            return Err(SendError::PayloadTooLarge { actual: payload.len(), max: MAX_BUFFER_SIZE });
        }
        let peer = peer.or(self.config.default_peer).ok_or(SendError::NoDestination)?;

        let transfer_id = self.id_allocator.lock().unwrap().alloc(peer);
        let session = SendSession::new(
            transfer_id,
            peer,
            Bytes::copy_from_slice(payload),
            self.config.clone(),
            self.pipeline.clone(),
            self.dispatcher.clone(),
            self.send_sessions.clone(),
            on_drain,
        );

        let replaced = self.send_sessions.write().await
            .insert((peer, transfer_id), session.clone());
        if let Some(replaced) = replaced {
            // the id counter wrapped around onto a transfer that never finished
            debug!("transfer id {} for {:?} reused while still live - dropping the stale session", transfer_id, peer);
            replaced.shutdown().await;
        }

        session.spawn_pacing().await;
        Ok(Some(transfer_id))
    }

    /// Tears the endpoint down: stops all background loops, destroys every
    ///  session (cancelling its timers) and empties the FIN retry set.
    ///  Idempotent; all later operations fail with [`SendError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing endpoint {:?}", self.local_addr);

        for handle in self.background_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }

        let sending = self.send_sessions.write().await.drain_all();
        for (_, session) in sending {
            session.shutdown().await;
        }
        let receiving = self.recv_sessions.write().await.drain_all();
        for (_, session) in receiving {
            session.shutdown().await;
        }
        self.finish_notify.lock().await.clear();
    }

    async fn recv_loop(self: Arc<EndPoint>, socket: Arc<UdpSocket>) {
        info!("starting receive loop");

        // sealed packets never exceed the packet MTU; some headroom on top
        let mut buf = [0u8; 2048];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => {
                    x
                }
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let inner_packet = match envelope::open(&mut buf[..num_read]) {
                Some(inner_packet) => inner_packet,
                None => {
                    debug!("received packet with invalid checksum from {:?} - dropping", from);
                    continue;
                }
            };

            let mut parse_buf = inner_packet;
            let header = match PacketHeader::deser(&mut parse_buf) {
                Ok(header) => {
                    header
                },
                Err(e) => {
                    warn!("received packet with unparsable header from {:?} - dropping: {:#}", from, e);
                    continue;
                },
            };

            trace!("received {:?} for transfer {} from {:?}", header.kind, header.transfer_id, from);

            let key = (from, header.transfer_id);
            match header.kind {
                PacketKind::Push { seq, single_total, total_count } => {
                    let payload = Bytes::copy_from_slice(parse_buf);
                    self.handle_push(key, seq, single_total, total_count, payload).await;
                }
                PacketKind::Request => {
                    let requested = Self::parse_request_payload(parse_buf);
                    self.handle_request(key, requested).await;
                }
                PacketKind::Finish => self.handle_finish(key).await,
                PacketKind::Ack { acked } => self.handle_ack(key, acked).await,
                PacketKind::Error { code } => self.handle_error(key, code).await,
            }
        }
    }

    /// Inflates a REQ payload back into the plain set of requested sequences.
    fn parse_request_payload(mut payload: &[u8]) -> Vec<u16> {
        let mut entries = Vec::with_capacity(payload.len() / 2);
        while payload.len() >= 2 {
            entries.push(u16::from_be_bytes([payload[0], payload[1]]));
            payload = &payload[2..];
        }
        if !payload.is_empty() {
            debug!("REQ payload has a trailing odd byte - ignoring it");
        }
        seq_list::unzip(&entries)
    }

    async fn handle_push(&self, key: SessionKey, seq: u16, single_total: u16, total_count: u16, payload: Bytes) {
        let session = self.get_or_create_receive_session(key).await;
        session.on_push(seq, single_total, total_count, payload).await;
    }

    async fn get_or_create_receive_session(&self, key: SessionKey) -> ReceiveSession {
        let mut table = self.recv_sessions.write().await;

        if let Some(existing) = table.get(&key) {
            let existing = existing.clone();
            if !existing.is_recyclable().await {
                return existing;
            }
            // the peer is reusing the id of a long-delivered transfer
            debug!("transfer id {} from {:?} reused - recycling the delivered session", key.1, key.0);
            table.remove(&key);
            existing.shutdown().await;
        }
        else {
            debug!("initializing receiving session {} for {:?}", key.1, key.0);
        }

        let session = ReceiveSession::new(
            key.1,
            key.0,
            self.config.clone(),
            self.pipeline.clone(),
            self.dispatcher.clone(),
            self.recv_sessions.clone(),
            self.finish_notify.clone(),
        );
        table.insert(key, session.clone());
        session
    }

    async fn handle_request(&self, key: SessionKey, requested: Vec<u16>) {
        let session = self.send_sessions.write().await.get(&key).cloned();
        match session {
            Some(session) => session.on_request(requested).await,
            None => {
                debug!("REQ for unknown transfer {} from {:?} - notifying the peer", key.1, key.0);
                let err = PacketHeader::new(key.1, PacketKind::Error { code: ERR_ID_NOT_FOUND }).to_packet();
                self.pipeline.seal_and_send(key.0, &err).await;
            }
        }
    }

    async fn handle_finish(&self, key: SessionKey) {
        let session = self.send_sessions.write().await.remove(&key);
        match session {
            Some(session) => session.on_finish().await,
            None => {
                // the peer retries FIN until it sees ACK; the session may be
                //  long gone when a retry arrives
                debug!("FIN for unknown transfer {} from {:?} - re-acknowledging", key.1, key.0);
                let ack = PacketHeader::new(key.1, PacketKind::Ack { acked: PacketKind::FINISH }).to_packet();
                self.pipeline.seal_and_send(key.0, &ack).await;
            }
        }
    }

    async fn handle_ack(&self, key: SessionKey, acked: u8) {
        if acked != PacketKind::FINISH {
            debug!("ACK for packet type {:#04x} from {:?} has no meaning - dropping", acked, key.0);
            return;
        }
        if self.finish_notify.lock().await.remove(&key).is_some() {
            trace!("peer confirmed completion of transfer {} from {:?}", key.1, key.0);
        }
    }

    async fn handle_error(&self, key: SessionKey, code: u16) {
        if code != ERR_ID_NOT_FOUND {
            warn!("ERR with unknown code {:#06x} from {:?} - dropping", code, key.0);
            return;
        }

        let session = self.recv_sessions.write().await.remove(&key);
        if let Some(session) = session {
            debug!("peer has no memory of transfer {} - dropping the receiving session", key.1);
            session.shutdown().await;
        }
        self.finish_notify.lock().await.remove(&key);
    }

    /// Re-sends FIN for every completed transfer the peer has not confirmed
    ///  yet, up to the configured retry limit per transfer.
    async fn finish_notify_loop(self: Arc<EndPoint>) {
        let mut tick = interval(self.config.finish_notify_period);
        // skip the interval's immediate first tick - retries start one full
        //  period after completion
        tick.tick().await;

        loop {
            tick.tick().await;

            let due: Vec<SessionKey> = {
                let mut pending = self.finish_notify.lock().await;
                let limit = self.config.finish_notify_limit;
                pending.retain(|key, retries| {
                    if *retries >= limit {
                        debug!("giving up on FIN for transfer {} to {:?} after {} retries", key.1, key.0, retries);
                        false
                    }
                    else {
                        *retries += 1;
                        true
                    }
                });
                pending.keys().copied().collect()
            };

            for key in due {
                trace!("re-sending FIN for transfer {} to {:?}", key.1, key.0);
                let fin = PacketHeader::new(key.1, PacketKind::Finish).to_packet();
                self.pipeline.seal_and_send(key.0, &fin).await;
            }
        }
    }

    async fn sweep_send_sessions(self: Arc<EndPoint>) {
        let mut tick = interval(self.config.sweep_interval);
        loop {
            tick.tick().await;
            let expired = self.send_sessions.write().await.sweep_expired(self.config.session_ttl);
            for (key, session) in expired {
                debug!("sending session {} for {:?} expired", key.1, key.0);
                session.shutdown().await;
            }
        }
    }

    async fn sweep_recv_sessions(self: Arc<EndPoint>) {
        let mut tick = interval(self.config.sweep_interval);
        loop {
            tick.tick().await;
            let expired = self.recv_sessions.write().await.sweep_expired(self.config.session_ttl);
            for (key, session) in expired {
                debug!("receiving session {} for {:?} expired", key.1, key.0);
                session.shutdown().await;
            }
        }
    }
}
