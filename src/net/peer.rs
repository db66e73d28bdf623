//! One connected peer.
//!
//! A peer owns bounded outbound queues (transactions, block propagations,
//! hash announcements, request/response replies) drained by a single
//! writer task, the only place allowed to block on the wire. Enqueueing is
//! always non-blocking: a full queue drops the newest item. Known-set LRUs
//! bound re-broadcast and memory per peer.

use super::messages::{BlockHashNumber, Msg, PeerRole, StatusData, SUPPORTED_VERSIONS};
use super::transport::{FramedConn, MsgWriter, NetError};
use crate::types::{Block, Hash32, Tx};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Cap on remembered hashes a peer is known to have.
pub const MAX_KNOWN_TXS: usize = 32_768;
pub const MAX_KNOWN_BLOCKS: usize = 1_024;

/// Outbound queue capacities. Small on purpose: a slow peer sheds load
/// instead of backing the node up.
pub const MAX_QUEUED_TXS: usize = 128;
pub const MAX_QUEUED_PROPS: usize = 4;
pub const MAX_QUEUED_ANNS: usize = 4;
pub const MAX_QUEUED_REPLIES: usize = 16;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("first message was not a status")]
    NonStatusMessage,
    #[error("protocol version {theirs} not supported")]
    ProtocolVersionMismatch { theirs: u32 },
    #[error("network id mismatch: ours {ours}, theirs {theirs}")]
    NetworkIdMismatch { ours: u64, theirs: u64 },
    #[error("genesis mismatch: ours {ours}, theirs {theirs}")]
    GenesisMismatch { ours: Hash32, theirs: Hash32 },
}

/// Exchange status messages and validate the remote's. Returns the remote
/// status on success; any mismatch is connection-fatal.
pub async fn handshake<S: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
    conn: &mut FramedConn<S>,
    local: StatusData,
) -> Result<StatusData, HandshakeError> {
    let ours = local.clone();
    let exchanged = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        conn.write_msg(&Msg::Status(local)).await?;
        conn.read_msg().await
    })
    .await
    .map_err(|_| HandshakeError::Timeout)??;

    let Msg::Status(theirs) = exchanged else {
        return Err(HandshakeError::NonStatusMessage);
    };
    if !SUPPORTED_VERSIONS.contains(&theirs.protocol_version) {
        return Err(HandshakeError::ProtocolVersionMismatch { theirs: theirs.protocol_version });
    }
    if theirs.network_id != ours.network_id {
        return Err(HandshakeError::NetworkIdMismatch { ours: ours.network_id, theirs: theirs.network_id });
    }
    if theirs.genesis != ours.genesis {
        return Err(HandshakeError::GenesisMismatch { ours: ours.genesis, theirs: theirs.genesis });
    }
    Ok(theirs)
}

#[derive(Debug)]
pub struct Peer {
    pub id: String,
    pub version: u32,
    pub role: PeerRole,
    pub remote_addr: Option<String>,

    head: Mutex<(Hash32, u128)>,
    known_txs: Mutex<LruCache<Hash32, ()>>,
    known_blocks: Mutex<LruCache<Hash32, ()>>,

    queued_txs: mpsc::Sender<Vec<Tx>>,
    queued_props: mpsc::Sender<(Block, u128)>,
    queued_anns: mpsc::Sender<Vec<BlockHashNumber>>,
    queued_replies: mpsc::Sender<Msg>,

    close: watch::Sender<bool>,
}

impl Peer {
    /// Build the peer from a completed handshake and spawn its writer task.
    pub fn new(status: &StatusData, writer: Box<dyn MsgWriter>, remote_addr: Option<String>) -> (Arc<Peer>, JoinHandle<()>) {
        let (tx_s, tx_r) = mpsc::channel(MAX_QUEUED_TXS);
        let (prop_s, prop_r) = mpsc::channel(MAX_QUEUED_PROPS);
        let (ann_s, ann_r) = mpsc::channel(MAX_QUEUED_ANNS);
        let (reply_s, reply_r) = mpsc::channel(MAX_QUEUED_REPLIES);
        let (close_s, close_r) = watch::channel(false);

        let known_cap = |n: usize| NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);
        let peer = Arc::new(Peer {
            id: status.node_id.clone(),
            version: status.protocol_version,
            role: status.role,
            remote_addr,
            head: Mutex::new((status.head, status.td)),
            known_txs: Mutex::new(LruCache::new(known_cap(MAX_KNOWN_TXS))),
            known_blocks: Mutex::new(LruCache::new(known_cap(MAX_KNOWN_BLOCKS))),
            queued_txs: tx_s,
            queued_props: prop_s,
            queued_anns: ann_s,
            queued_replies: reply_s,
            close: close_s,
        });
        let task = tokio::spawn(broadcast_writer(
            peer.id.clone(),
            writer,
            tx_r,
            prop_r,
            ann_r,
            reply_r,
            close_r,
        ));
        (peer, task)
    }

    pub fn head(&self) -> (Hash32, u128) {
        *self.head.lock()
    }

    pub fn set_head(&self, hash: Hash32, td: u128) {
        let mut h = self.head.lock();
        if td > h.1 {
            *h = (hash, td);
        }
    }

    pub fn knows_block(&self, hash: &Hash32) -> bool {
        self.known_blocks.lock().contains(hash)
    }

    pub fn knows_tx(&self, hash: &Hash32) -> bool {
        self.known_txs.lock().contains(hash)
    }

    pub fn mark_block(&self, hash: Hash32) {
        self.known_blocks.lock().put(hash, ());
    }

    pub fn mark_tx(&self, hash: Hash32) {
        self.known_txs.lock().put(hash, ());
    }

    /// Queue transactions for this peer. Never blocks; a full queue drops
    /// the batch (returns false). The hashes are marked known either way so
    /// the next broadcast cycle does not retry forever.
    pub fn send_transactions(&self, txs: Vec<Tx>) -> bool {
        for tx in &txs {
            self.mark_tx(tx.hash());
        }
        match self.queued_txs.try_send(txs) {
            Ok(()) => true,
            Err(_) => {
                debug!(peer = %self.id, "tx broadcast queue full; dropping");
                false
            }
        }
    }

    /// Queue a full-block propagation; drop-if-full.
    pub fn send_new_block(&self, block: Block, td: u128) -> bool {
        self.mark_block(block.id());
        match self.queued_props.try_send((block, td)) {
            Ok(()) => true,
            Err(_) => {
                debug!(peer = %self.id, "block propagation queue full; dropping");
                false
            }
        }
    }

    /// Queue hash announcements; drop-if-full.
    pub fn send_new_block_hashes(&self, anns: Vec<BlockHashNumber>) -> bool {
        for ann in &anns {
            self.mark_block(ann.hash);
        }
        match self.queued_anns.try_send(anns) {
            Ok(()) => true,
            Err(_) => {
                debug!(peer = %self.id, "announcement queue full; dropping");
                false
            }
        }
    }

    /// Queue a request/response reply. Backpressure is async here: replies
    /// are solicited, so the handler worker may wait for a slot.
    pub async fn send_reply(&self, msg: Msg) -> Result<(), NetError> {
        self.queued_replies.send(msg).await.map_err(|_| NetError::Closed)
    }

    /// Best-effort sync request toward this peer (drop-if-full).
    pub fn request(&self, msg: Msg) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.queued_replies.try_send(msg) {
            debug!(peer = %self.id, "request queue full; dropping");
        }
    }

    /// Idempotent: signals the writer task and every read/dispatch loop.
    pub fn disconnect(&self) {
        let _ = self.close.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }
}

/// The peer's broadcast writer: sole owner of the wire's write half.
/// Replies and propagations win over announcements and transactions.
async fn broadcast_writer(
    peer_id: String,
    mut writer: Box<dyn MsgWriter>,
    mut txs: mpsc::Receiver<Vec<Tx>>,
    mut props: mpsc::Receiver<(Block, u128)>,
    mut anns: mpsc::Receiver<Vec<BlockHashNumber>>,
    mut replies: mpsc::Receiver<Msg>,
    mut close: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = close.changed() => break,
            Some(m) = replies.recv() => m,
            Some((block, td)) = props.recv() => Msg::NewBlock { block, td },
            Some(a) = anns.recv() => Msg::NewBlockHashes(a),
            Some(t) = txs.recv() => Msg::Transactions(t),
            else => break,
        };
        if let Err(e) = writer.write_msg(&msg).await {
            warn!(peer = %peer_id, "peer write failed: {e}");
            break;
        }
        trace!(peer = %peer_id, code = ?msg.code(), "sent");
    }
    debug!(peer = %peer_id, "broadcast writer stopped");
}
