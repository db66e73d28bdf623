//! Protocol manager.
//!
//! Owns the peer lifecycle: handshake, registration, the per-peer read
//! loop feeding a bounded worker pool, dispatch by message code, and the
//! broadcast fan-outs. The consensus engine's handler gets first refusal
//! on every inbound message. Protocol faults (decode errors, oversized
//! frames, skip-overflow queries) terminate only the offending connection.

use super::messages::{
    BlockHashNumber, GetBlockHeadersData, HashOrNumber, Msg, PeerRole, StatusData,
    MAX_BODIES_FETCH, MAX_HEADERS_FETCH, MAX_NODE_DATA_FETCH, MAX_RECEIPTS_FETCH,
    PROTOCOL_VERSION, SOFT_RESPONSE_LIMIT,
};
use super::peer::{handshake, HandshakeError, Peer};
use super::peerset::{PeerError, PeerSet};
use super::transport::{FramedConn, MsgReader, NetError};
use crate::consensus::{Broadcaster, Engine, EngineError};
use crate::events::EVENT_CHANNEL_CAPACITY;
use crate::metrics::Metrics;
use crate::txpool::TxPool;
use crate::types::{header_hash, Block, BlockBody, BlockNumber, Hash32, Header, Receipt, Tx};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Bounded concurrency per peer: workers draining the inbound queue.
pub const PEER_MSG_WORKERS: usize = 3;
pub const PEER_MSG_QUEUE: usize = 64;

// Empirical fan-out constants; tunable, no derived formula.
pub const CN_TX_FANOUT_DENOM: usize = 2;
pub const MIN_TX_BROADCAST_PEERS: usize = 2;

/// Block propagation subset: ⌈√n⌉, never 0 for n > 0.
pub fn sqrt_fanout(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        (n as f64).sqrt().ceil() as usize
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("unexpected status message after handshake")]
    UnexpectedStatus,
    #[error("header query skip overflow")]
    SkipOverflow,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Chain access the manager needs to serve requests and import blocks.
pub trait ChainDataSource: Send + Sync {
    fn current_header(&self) -> Header;
    fn total_difficulty(&self) -> u128;
    fn genesis_hash(&self) -> Hash32;
    fn header_by_hash(&self, hash: &Hash32) -> Option<Header>;
    fn header_by_number(&self, number: BlockNumber) -> Option<Header>;
    fn body_by_hash(&self, hash: &Hash32) -> Option<BlockBody>;
    fn receipts_by_hash(&self, hash: &Hash32) -> Option<Vec<Receipt>>;
    fn node_data(&self, hash: &Hash32) -> Option<Vec<u8>>;
    fn has_block(&self, hash: &Hash32) -> bool;
    /// Returns true when the block was new to the chain.
    fn import_block(&self, block: &Block, td: u128) -> Result<bool, String>;
}

/// Responses forwarded to whoever runs chain sync (the downloader sits
/// outside this core).
#[derive(Clone, Debug)]
pub enum SyncResponse {
    Headers { peer: String, headers: Vec<Header> },
    Bodies { peer: String, bodies: Vec<BlockBody> },
    NodeData { peer: String, items: Vec<Vec<u8>> },
    Receipts { peer: String, receipts: Vec<Vec<Receipt>> },
}

pub struct ProtocolManager {
    network_id: u64,
    node_id: String,
    role: PeerRole,
    chain: Arc<dyn ChainDataSource>,
    pool: Arc<TxPool>,
    engine: Arc<dyn Engine>,
    peers: Arc<PeerSet>,
    metrics: Arc<Metrics>,
    sync_feed: broadcast::Sender<SyncResponse>,
}

impl ProtocolManager {
    pub fn new(
        network_id: u64,
        node_id: String,
        role: PeerRole,
        chain: Arc<dyn ChainDataSource>,
        pool: Arc<TxPool>,
        engine: Arc<dyn Engine>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (sync_feed, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pm = Arc::new(Self {
            network_id,
            node_id,
            role,
            chain,
            pool,
            engine,
            peers: Arc::new(PeerSet::new()),
            metrics,
            sync_feed,
        });
        if let Some(h) = pm.engine.handler() {
            h.set_broadcaster(pm.clone());
        }
        pm
    }

    pub fn peer_set(&self) -> Arc<PeerSet> {
        self.peers.clone()
    }

    pub fn subscribe_sync_responses(&self) -> broadcast::Receiver<SyncResponse> {
        self.sync_feed.subscribe()
    }

    pub fn local_status(&self) -> StatusData {
        StatusData {
            protocol_version: PROTOCOL_VERSION,
            network_id: self.network_id,
            td: self.chain.total_difficulty(),
            head: header_hash(&self.chain.current_header()),
            genesis: self.chain.genesis_hash(),
            node_id: self.node_id.clone(),
            role: self.role,
        }
    }

    /// Drive one connection to completion: handshake, register, serve.
    /// Returns when the peer disconnects or commits a protocol fault; the
    /// peer is unregistered and its writer joined either way.
    pub async fn run_peer<S>(
        self: Arc<Self>,
        mut conn: FramedConn<S>,
        remote_addr: Option<String>,
    ) -> Result<(), HandlerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let status = handshake(&mut conn, self.local_status()).await?;
        let (reader, writer) = conn.split();
        let (peer, writer_task) = Peer::new(&status, writer, remote_addr);

        if let Err(e) = self.peers.register(peer.clone()) {
            peer.disconnect();
            let _ = writer_task.await;
            return Err(e.into());
        }
        self.metrics.p2p_peers.set(self.peers.len() as i64);
        info!(peer = %peer.id, role = ?peer.role, version = peer.version, "peer registered");

        let result = self.clone().read_loop(peer.clone(), reader).await;

        let _ = self.peers.unregister(&peer.id);
        peer.disconnect();
        let _ = writer_task.await;
        self.metrics.p2p_peers.set(self.peers.len() as i64);
        if result.is_err() {
            self.metrics.peer_disconnects.inc();
        }
        info!(peer = %peer.id, ok = result.is_ok(), "peer removed");
        result
    }

    /// Single blocking read loop feeding a bounded channel drained by a
    /// fixed worker pool. Backpressure: when all workers are busy and the
    /// queue is full, the read loop itself waits.
    async fn read_loop(
        self: Arc<Self>,
        peer: Arc<Peer>,
        mut reader: Box<dyn MsgReader>,
    ) -> Result<(), HandlerError> {
        let (work_tx, work_rx) = mpsc::channel::<Msg>(PEER_MSG_QUEUE);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut workers = Vec::with_capacity(PEER_MSG_WORKERS);
        for _ in 0..PEER_MSG_WORKERS {
            let pm = self.clone();
            let p = peer.clone();
            let rx = work_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let msg = { rx.lock().await.recv().await };
                    let Some(msg) = msg else { break };
                    if let Err(e) = pm.handle_msg(&p, msg).await {
                        warn!(peer = %p.id, "dropping peer: {e}");
                        p.disconnect();
                        break;
                    }
                }
            }));
        }

        let mut closed = peer.closed_signal();
        let result = loop {
            tokio::select! {
                biased;
                _ = closed.changed() => break Ok(()),
                read = reader.read_msg() => match read {
                    Ok(msg) => {
                        if work_tx.send(msg).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(NetError::Closed) => break Ok(()),
                    Err(e) => break Err(HandlerError::Net(e)),
                },
            }
        };

        drop(work_tx);
        for w in workers {
            let _ = w.await;
        }
        result
    }

    async fn handle_msg(&self, peer: &Arc<Peer>, msg: Msg) -> Result<(), HandlerError> {
        self.metrics.msgs_received.inc();

        // The consensus engine sees everything first.
        if let Some(h) = self.engine.handler() {
            if h.handle_msg(&peer.id, &msg)? {
                return Ok(());
            }
        }

        match msg {
            Msg::Status(_) => Err(HandlerError::UnexpectedStatus),
            Msg::GetBlockHeaders(query) => self.serve_headers(peer, query).await,
            Msg::GetBlockBodies(hashes) => self.serve_bodies(peer, hashes).await,
            Msg::GetNodeData(hashes) => self.serve_node_data(peer, hashes).await,
            Msg::GetReceipts(hashes) => self.serve_receipts(peer, hashes).await,
            Msg::BlockHeaders(headers) => {
                let _ = self.sync_feed.send(SyncResponse::Headers { peer: peer.id.clone(), headers });
                Ok(())
            }
            Msg::BlockBodies(bodies) => {
                let _ = self.sync_feed.send(SyncResponse::Bodies { peer: peer.id.clone(), bodies });
                Ok(())
            }
            Msg::NodeData(items) => {
                let _ = self.sync_feed.send(SyncResponse::NodeData { peer: peer.id.clone(), items });
                Ok(())
            }
            Msg::Receipts(receipts) => {
                let _ = self.sync_feed.send(SyncResponse::Receipts { peer: peer.id.clone(), receipts });
                Ok(())
            }
            Msg::NewBlockHashes(anns) => {
                for ann in anns {
                    peer.mark_block(ann.hash);
                    if !self.chain.has_block(&ann.hash) {
                        // Pull the announced header; the sync layer takes it
                        // from there.
                        peer.request(Msg::GetBlockHeaders(GetBlockHeadersData {
                            origin: HashOrNumber::Hash(ann.hash),
                            amount: 1,
                            skip: 0,
                            reverse: false,
                        }));
                    }
                }
                Ok(())
            }
            Msg::NewBlock { block, td } => self.handle_new_block(peer, block, td),
            Msg::Transactions(txs) => {
                for tx in &txs {
                    peer.mark_tx(tx.hash());
                }
                let results = self.pool.add_remotes(txs);
                let rejected = results.iter().filter(|r| r.is_err()).count();
                if rejected > 0 {
                    debug!(peer = %peer.id, rejected, "some relayed transactions rejected");
                }
                Ok(())
            }
            Msg::Consensus(_) => {
                debug!(peer = %peer.id, "consensus message with no engine handler; dropped");
                Ok(())
            }
        }
    }

    fn handle_new_block(&self, peer: &Arc<Peer>, block: Block, td: u128) -> Result<(), HandlerError> {
        let hash = block.id();
        peer.mark_block(hash);
        peer.set_head(hash, td);

        // Propagate to a √n subset before import so the block keeps moving
        // even while we execute it.
        self.broadcast_block(&block, td, true);
        match self.chain.import_block(&block, td) {
            Ok(true) => {
                self.broadcast_block(&block, td, false);
            }
            Ok(false) => {}
            Err(e) => debug!(peer = %peer.id, %hash, "block import rejected: {e}"),
        }
        Ok(())
    }

    // ── Serving fetch requests ────────────────────────────────────────────

    async fn serve_headers(&self, peer: &Arc<Peer>, query: GetBlockHeadersData) -> Result<(), HandlerError> {
        let amount = (query.amount as usize).min(MAX_HEADERS_FETCH);
        let step = query.skip.checked_add(1).ok_or(HandlerError::SkipOverflow)?;

        let mut headers = Vec::new();
        let mut bytes = 0usize;
        let mut cursor = match query.origin {
            HashOrNumber::Hash(h) => self.chain.header_by_hash(&h).map(|h| h.number),
            HashOrNumber::Number(n) => Some(n),
        };
        while headers.len() < amount {
            let Some(number) = cursor else { break };
            let Some(header) = self.chain.header_by_number(number) else { break };
            bytes += bincode::serialized_size(&header).unwrap_or(0) as usize;
            headers.push(header);
            if bytes >= SOFT_RESPONSE_LIMIT {
                break;
            }
            cursor = if query.reverse {
                number.checked_sub(step)
            } else {
                // Overflow here means a malformed query, not a miss.
                Some(number.checked_add(step).ok_or(HandlerError::SkipOverflow)?)
            };
        }
        peer.send_reply(Msg::BlockHeaders(headers)).await?;
        Ok(())
    }

    async fn serve_bodies(&self, peer: &Arc<Peer>, hashes: Vec<Hash32>) -> Result<(), HandlerError> {
        let mut bodies = Vec::new();
        let mut bytes = 0usize;
        for hash in hashes.into_iter().take(MAX_BODIES_FETCH) {
            if let Some(body) = self.chain.body_by_hash(&hash) {
                bytes += bincode::serialized_size(&body).unwrap_or(0) as usize;
                bodies.push(body);
                if bytes >= SOFT_RESPONSE_LIMIT {
                    break;
                }
            }
        }
        peer.send_reply(Msg::BlockBodies(bodies)).await?;
        Ok(())
    }

    async fn serve_node_data(&self, peer: &Arc<Peer>, hashes: Vec<Hash32>) -> Result<(), HandlerError> {
        let mut items = Vec::new();
        let mut bytes = 0usize;
        for hash in hashes.into_iter().take(MAX_NODE_DATA_FETCH) {
            if let Some(data) = self.chain.node_data(&hash) {
                bytes += data.len();
                items.push(data);
                if bytes >= SOFT_RESPONSE_LIMIT {
                    break;
                }
            }
        }
        peer.send_reply(Msg::NodeData(items)).await?;
        Ok(())
    }

    async fn serve_receipts(&self, peer: &Arc<Peer>, hashes: Vec<Hash32>) -> Result<(), HandlerError> {
        let mut receipts = Vec::new();
        let mut bytes = 0usize;
        for hash in hashes.into_iter().take(MAX_RECEIPTS_FETCH) {
            if let Some(rs) = self.chain.receipts_by_hash(&hash) {
                bytes += bincode::serialized_size(&rs).unwrap_or(0) as usize;
                receipts.push(rs);
                if bytes >= SOFT_RESPONSE_LIMIT {
                    break;
                }
            }
        }
        peer.send_reply(Msg::Receipts(receipts)).await?;
        Ok(())
    }

    // ── Broadcast fan-out ─────────────────────────────────────────────────

    /// Propagate (full block, √n random subset) or announce (hash, every
    /// peer that lacks it). Best-effort: full queues drop.
    pub fn broadcast_block(&self, block: &Block, td: u128, propagate: bool) {
        let hash = block.id();
        let candidates = self.peers.peers_without_block(&hash);
        if candidates.is_empty() {
            return;
        }
        if propagate {
            let n = sqrt_fanout(candidates.len());
            let mut rng = rand::thread_rng();
            for peer in candidates.choose_multiple(&mut rng, n) {
                if peer.send_new_block(block.clone(), td) {
                    self.metrics.blocks_propagated.inc();
                }
            }
            debug!(%hash, fanout = n, "block propagated");
        } else {
            let ann = BlockHashNumber { hash, number: block.header.number };
            for peer in &candidates {
                if peer.send_new_block_hashes(vec![ann]) {
                    self.metrics.blocks_announced.inc();
                }
            }
            debug!(%hash, peers = candidates.len(), "block announced");
        }
    }

    /// Role-dependent transaction fan-out with duplicate suppression.
    pub fn broadcast_txs(&self, txs: &[Tx]) {
        self.broadcast_txs_inner(txs, false);
    }

    /// Recovery path for transactions that silently failed to propagate:
    /// same targeting, but the known-tx suppression is bypassed.
    pub fn rebroadcast_txs(&self, txs: &[Tx]) {
        self.broadcast_txs_inner(txs, true);
    }

    fn broadcast_txs_inner(&self, txs: &[Tx], bypass_known: bool) {
        let mut per_peer: HashMap<String, (Arc<Peer>, Vec<Tx>)> = HashMap::new();
        for tx in txs {
            let hash = tx.hash();
            for peer in self.tx_targets(&hash, bypass_known) {
                per_peer
                    .entry(peer.id.clone())
                    .or_insert_with(|| (peer.clone(), Vec::new()))
                    .1
                    .push(tx.clone());
            }
        }
        for (_, (peer, batch)) in per_peer {
            let count = batch.len() as u64;
            if peer.send_transactions(batch) {
                self.metrics.txs_broadcast.inc_by(count);
            }
        }
    }

    fn tx_targets(&self, hash: &Hash32, bypass_known: bool) -> Vec<Arc<Peer>> {
        let lacks = |p: &Arc<Peer>| bypass_known || !p.knows_tx(hash);
        match self.role {
            // Consensus nodes gossip among themselves: roughly half the
            // consensus peers, with a small floor.
            PeerRole::Consensus => {
                let cns: Vec<Arc<Peer>> = self.peers.cn_peers().into_iter().filter(lacks).collect();
                let want = (cns.len() / CN_TX_FANOUT_DENOM).max(MIN_TX_BROADCAST_PEERS).min(cns.len());
                let mut rng = rand::thread_rng();
                cns.choose_multiple(&mut rng, want).cloned().collect()
            }
            // Other roles relay to every non-consensus peer that lacks the
            // tx, and additionally toward the designated bridge peers (the
            // route into the consensus core) regardless of the suppression
            // set; bridges dedupe on their side.
            _ => {
                let mut targets: Vec<Arc<Peer>> = self
                    .peers
                    .all_peers()
                    .into_iter()
                    .filter(|p| p.role != PeerRole::Consensus && p.role != PeerRole::Bridge)
                    .filter(lacks)
                    .collect();
                targets.extend(self.peers.bridge_peers());
                targets
            }
        }
    }
}

impl Broadcaster for ProtocolManager {
    fn send_consensus(&self, peer_id: &str, payload: Vec<u8>) {
        if let Some(peer) = self.peers.peer(peer_id) {
            peer.request(Msg::Consensus(payload));
        }
    }

    fn broadcast_consensus(&self, payload: Vec<u8>) {
        for peer in self.peers.cn_peers() {
            peer.request(Msg::Consensus(payload.clone()));
        }
    }
}
