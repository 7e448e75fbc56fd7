//! Header-first chain synchronization for a light wallet.
//!
//! [`SyncManager`] owns the validated header chain and plans the downloads.
//! It does no I/O: the engine feeds it handshakes, headers and blocks, then
//! executes the [`SyncAction`]s returned by [`SyncManager::next_actions`].
//!
//! Blocks may arrive in any order and from any peer. They are buffered by
//! height and released through [`SyncManager::take_connectable`] strictly in
//! height order, one past the last applied block.

use crate::config::NetworkConfig;
use crate::protocol::MAX_LOCATOR_SIZE;
use libp2p::PeerId;
use satchel_core::types::{Block, BlockHeader, Hash256};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Failed or timed-out requests tolerated before a peer is dropped.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Locator entries taken one by one before the step starts doubling.
const LOCATOR_DENSE_ENTRIES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub request_timeout: Duration,
    pub max_in_flight: usize,
    pub max_failures: u32,
}

impl SyncConfig {
    pub fn from_network_config(config: &NetworkConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            max_in_flight: config.max_in_flight.max(1),
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_network_config(&NetworkConfig::default())
    }
}

/// Work the engine should carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    RequestHeaders { peer: PeerId, locator: Vec<Hash256> },
    RequestBlock { peer: PeerId, hash: Hash256 },
    /// The peer exhausted its failure budget and has been forgotten.
    DropPeer { peer: PeerId, reason: String },
    /// Every known block is applied. Emitted once per catch-up.
    SyncComplete { height: Option<u64> },
}

/// Result of feeding a headers response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadersOutcome {
    /// `count` new headers appended starting at `from_height`.
    Extended { from_height: u64, count: usize },
    /// Nothing new.
    UpToDate,
    /// The batch does not extend our chain. The peer is penalised.
    NonLinking,
}

/// Result of feeding a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    /// Buffered for connection at `height`.
    Accepted { height: u64 },
    /// Already applied or buffered.
    Duplicate,
    /// Unusable. A solicited block is queued again for download.
    Rejected { reason: String },
    /// Does not belong to or extend our header chain.
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    WaitingForPeers,
    Headers,
    Blocks,
    Synced,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingForPeers => "waiting_for_peers",
            Self::Headers => "headers",
            Self::Blocks => "blocks",
            Self::Synced => "synced",
        }
    }
}

/// Snapshot of sync progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// Height of the last block applied to the wallet.
    pub applied_height: Option<u64>,
    /// Height of the last validated header.
    pub header_height: Option<u64>,
    /// Highest height any ready peer has announced.
    pub best_height: Option<u64>,
    pub blocks_remaining: u64,
    pub peers: usize,
}

#[derive(Debug, Clone)]
struct PeerSync {
    best_height: Option<u64>,
    in_flight: HashMap<Hash256, Instant>,
    failures: u32,
}

/// Chain synchronization planner.
#[derive(Debug)]
pub struct SyncManager {
    config: SyncConfig,
    headers: Vec<BlockHeader>,
    hashes: Vec<Hash256>,
    index: HashMap<Hash256, u64>,
    applied: Option<u64>,
    peers: HashMap<PeerId, PeerSync>,
    headers_request: Option<(PeerId, Instant)>,
    /// Heights waiting to be requested.
    queue: BTreeSet<u64>,
    /// Downloaded blocks waiting for their turn.
    buffered: BTreeMap<u64, Block>,
    catching_up: bool,
}

impl SyncManager {
    /// Start from a persisted header chain and the height the wallet has applied.
    ///
    /// The restored chain is truncated at the first broken link.
    pub fn new(config: SyncConfig, headers: Vec<BlockHeader>, applied: Option<u64>) -> Self {
        let mut mgr = Self {
            config,
            headers: Vec::with_capacity(headers.len()),
            hashes: Vec::with_capacity(headers.len()),
            index: HashMap::with_capacity(headers.len()),
            applied: None,
            peers: HashMap::new(),
            headers_request: None,
            queue: BTreeSet::new(),
            buffered: BTreeMap::new(),
            catching_up: true,
        };
        for header in headers {
            if !header.links_to(&mgr.tip_hash()) {
                warn!(height = mgr.headers.len(), "stored header chain broken, truncating");
                break;
            }
            mgr.push_header(header);
        }
        mgr.applied = match (applied, mgr.header_height()) {
            (Some(a), Some(h)) => Some(a.min(h)),
            _ => None,
        };
        let first_missing = mgr.applied.map_or(0, |a| a.saturating_add(1));
        mgr.queue = (first_missing..mgr.headers.len() as u64).collect();
        mgr
    }

    fn push_header(&mut self, header: BlockHeader) -> u64 {
        let height = self.headers.len() as u64;
        let hash = header.hash();
        self.headers.push(header);
        self.hashes.push(hash);
        self.index.insert(hash, height);
        height
    }

    fn tip_hash(&self) -> Hash256 {
        self.hashes.last().copied().unwrap_or(Hash256::ZERO)
    }

    pub fn header_height(&self) -> Option<u64> {
        (self.headers.len() as u64).checked_sub(1)
    }

    pub fn applied_height(&self) -> Option<u64> {
        self.applied
    }

    pub fn header_at(&self, height: u64) -> Option<&BlockHeader> {
        self.headers.get(usize::try_from(height).ok()?)
    }

    /// Headers from `height` to the tip, for persistence.
    pub fn headers_from(&self, height: u64) -> &[BlockHeader] {
        let start = usize::try_from(height).unwrap_or(usize::MAX).min(self.headers.len());
        &self.headers[start..]
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u64> {
        self.index.get(hash).copied()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Highest height any peer has announced.
    pub fn best_height(&self) -> Option<u64> {
        self.peers.values().filter_map(|p| p.best_height).max()
    }

    /// A peer finished its handshake. `best_height` is `None` for an empty chain.
    pub fn on_peer_ready(&mut self, peer: PeerId, best_height: Option<u64>) {
        debug!(%peer, ?best_height, "sync: peer ready");
        self.peers.insert(peer, PeerSync { best_height, in_flight: HashMap::new(), failures: 0 });
        if best_height > self.header_height() {
            self.catching_up = true;
        }
    }

    /// Forget a peer and queue its outstanding blocks again.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        let Some(state) = self.peers.remove(peer) else {
            return;
        };
        for hash in state.in_flight.keys() {
            self.requeue(hash);
        }
        if self.headers_request.is_some_and(|(p, _)| p == *peer) {
            self.headers_request = None;
        }
        debug!(%peer, requeued = state.in_flight.len(), "sync: peer removed");
    }

    /// Raise a peer's announced height after it relays something newer.
    pub fn observe_peer_height(&mut self, peer: &PeerId, height: u64) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.best_height = state.best_height.max(Some(height));
        }
    }

    fn penalise(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.failures += 1;
        }
    }

    fn requeue(&mut self, hash: &Hash256) {
        if let Some(height) = self.height_of(hash) {
            let applied = self.applied.is_some_and(|a| height <= a);
            if !applied && !self.buffered.contains_key(&height) {
                self.queue.insert(height);
            }
        }
    }

    fn clear_in_flight(&mut self, peer: &PeerId, hash: &Hash256) -> bool {
        self.peers
            .get_mut(peer)
            .is_some_and(|state| state.in_flight.remove(hash).is_some())
    }

    /// A headers request to `peer` failed before any response arrived.
    pub fn on_headers_failed(&mut self, peer: &PeerId) {
        if self.headers_request.is_some_and(|(p, _)| p == *peer) {
            self.headers_request = None;
        }
        self.penalise(peer);
    }

    /// A block request to `peer` failed or the peer did not have the block.
    pub fn on_block_failed(&mut self, peer: &PeerId, hash: &Hash256) {
        if self.clear_in_flight(peer, hash) {
            self.penalise(peer);
            self.requeue(hash);
        }
    }

    /// Whether `peer` has a request outstanding.
    pub fn is_busy(&self, peer: &PeerId) -> bool {
        self.headers_request.is_some_and(|(p, _)| p == *peer)
            || self.peers.get(peer).is_some_and(|s| !s.in_flight.is_empty())
    }

    /// Feed a headers response from `peer`.
    ///
    /// Leading headers we already have are skipped. The rest must extend our
    /// tip and link to each other.
    pub fn on_headers(&mut self, peer: &PeerId, headers: Vec<BlockHeader>) -> HeadersOutcome {
        if self.headers_request.is_some_and(|(p, _)| p == *peer) {
            self.headers_request = None;
        }

        let first_new = headers.iter().position(|h| !self.index.contains_key(&h.hash()));
        let Some(first_new) = first_new else {
            // The peer has nothing beyond what we know.
            let ours = self.header_height();
            if let Some(state) = self.peers.get_mut(peer) {
                state.best_height = state.best_height.min(ours);
            }
            return HeadersOutcome::UpToDate;
        };

        let new = &headers[first_new..];
        let links = new[0].links_to(&self.tip_hash())
            && new.windows(2).all(|w| w[1].links_to(&w[0].hash()));
        if !links {
            warn!(%peer, count = new.len(), "sync: non-linking headers rejected");
            self.penalise(peer);
            return HeadersOutcome::NonLinking;
        }

        let count = new.len();
        let from_height = self.headers.len() as u64;
        for header in headers.into_iter().skip(first_new) {
            let height = self.push_header(header);
            self.queue.insert(height);
        }
        let tip = self.header_height();
        if let Some(state) = self.peers.get_mut(peer) {
            state.best_height = state.best_height.max(tip);
        }
        self.catching_up = true;
        info!(%peer, from_height, count, "sync: headers extended");
        HeadersOutcome::Extended { from_height, count }
    }

    /// Feed a block. `requested` is the hash we asked `peer` for, `None` for gossip.
    pub fn on_block(&mut self, peer: &PeerId, block: Block, requested: Option<Hash256>) -> BlockVerdict {
        let hash = block.hash();

        if let Some(requested) = requested {
            self.clear_in_flight(peer, &requested);
            if hash != requested {
                warn!(%peer, %requested, got = %hash, "sync: peer returned a different block");
                self.penalise(peer);
                self.requeue(&requested);
                return BlockVerdict::Rejected { reason: "block does not match request".into() };
            }
        }

        let height = match self.height_of(&hash) {
            Some(height) => height,
            None if requested.is_none() && block.header.links_to(&self.tip_hash()) => {
                // A fresh announcement extending our header tip.
                if block.compute_merkle_root() != block.header.merkle_root {
                    self.penalise(peer);
                    return BlockVerdict::Rejected { reason: "merkle root mismatch".into() };
                }
                let height = self.push_header(block.header.clone());
                self.observe_peer_height(peer, height);
                self.buffered.insert(height, block);
                return BlockVerdict::Accepted { height };
            }
            None => {
                // Unknown ancestry: the peer is ahead of our headers.
                let next = self.header_height().map_or(0, |h| h.saturating_add(1));
                self.observe_peer_height(peer, next);
                return BlockVerdict::Orphan;
            }
        };

        if self.applied.is_some_and(|a| height <= a) || self.buffered.contains_key(&height) {
            return BlockVerdict::Duplicate;
        }

        if block.compute_merkle_root() != block.header.merkle_root {
            warn!(%peer, %hash, height, "sync: merkle root mismatch");
            self.penalise(peer);
            self.requeue(&hash);
            return BlockVerdict::Rejected { reason: "merkle root mismatch".into() };
        }

        self.queue.remove(&height);
        self.buffered.insert(height, block);
        BlockVerdict::Accepted { height }
    }

    /// Next block to apply, if it has arrived.
    pub fn take_connectable(&mut self) -> Option<(u64, Block)> {
        let next = self.applied.map_or(0, |a| a.saturating_add(1));
        self.buffered.remove(&next).map(|block| (next, block))
    }

    /// The wallet applied the block at `height`.
    pub fn block_applied(&mut self, height: u64) {
        self.applied = Some(height);
    }

    /// The wallet refused the block at `height`; fetch it again.
    pub fn block_failed(&mut self, height: u64) {
        if let Some(hash) = self.hashes.get(height as usize).copied() {
            self.requeue(&hash);
        }
    }

    /// Compact list of header hashes, dense near the tip and sparse further back.
    pub fn locator(&self) -> Vec<Hash256> {
        let mut locator = Vec::new();
        let Some(mut height) = self.header_height() else {
            return locator;
        };
        let mut step = 1u64;
        loop {
            locator.push(self.hashes[height as usize]);
            if height == 0 || locator.len() >= MAX_LOCATOR_SIZE - 1 {
                break;
            }
            if locator.len() >= LOCATOR_DENSE_ENTRIES {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step);
        }
        if locator.last() != self.hashes.first() {
            locator.extend(self.hashes.first().copied());
        }
        locator
    }

    fn expire_requests(&mut self, now: Instant) {
        let timeout = self.config.request_timeout;
        let mut expired: Vec<(PeerId, Hash256)> = Vec::new();
        for (peer, state) in &self.peers {
            for (hash, sent) in &state.in_flight {
                if now.saturating_duration_since(*sent) >= timeout {
                    expired.push((*peer, *hash));
                }
            }
        }
        for (peer, hash) in expired {
            warn!(%peer, %hash, "sync: block request timed out");
            self.clear_in_flight(&peer, &hash);
            self.penalise(&peer);
            self.requeue(&hash);
        }

        if let Some((peer, sent)) = self.headers_request {
            if now.saturating_duration_since(sent) >= timeout {
                warn!(%peer, "sync: headers request timed out");
                self.headers_request = None;
                self.penalise(&peer);
            }
        }
    }

    fn has_more(&self, state: &PeerSync) -> bool {
        state.best_height > self.header_height()
    }

    /// Plan the next round of requests.
    pub fn next_actions(&mut self, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        self.expire_requests(now);

        let exhausted: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| s.failures >= self.config.max_failures)
            .map(|(p, _)| *p)
            .collect();
        for peer in exhausted {
            warn!(%peer, "sync: dropping peer after repeated failures");
            self.on_peer_disconnected(&peer);
            actions.push(SyncAction::DropPeer { peer, reason: "too many failed requests".into() });
        }

        if self.headers_request.is_none() {
            let source = self
                .peers
                .iter()
                .filter(|(_, s)| self.has_more(s))
                .max_by(|(a_id, a), (b_id, b)| {
                    a.best_height
                        .cmp(&b.best_height)
                        .then(b.failures.cmp(&a.failures))
                        .then(b_id.cmp(a_id))
                })
                .map(|(p, _)| *p);
            if let Some(peer) = source {
                self.headers_request = Some((peer, now));
                actions.push(SyncAction::RequestHeaders { peer, locator: self.locator() });
            }
        }

        self.assign_blocks(now, &mut actions);

        if self.catching_up && self.is_caught_up() {
            self.catching_up = false;
            actions.push(SyncAction::SyncComplete { height: self.applied });
        }
        actions
    }

    fn assign_blocks(&mut self, now: Instant, actions: &mut Vec<SyncAction>) {
        let max_in_flight = self.config.max_in_flight;
        let heights: Vec<u64> = self.queue.iter().copied().collect();
        for height in heights {
            let candidate = self
                .peers
                .iter()
                .filter(|(_, s)| s.in_flight.len() < max_in_flight && s.best_height >= Some(height))
                .min_by(|(a_id, a), (b_id, b)| {
                    a.in_flight
                        .len()
                        .cmp(&b.in_flight.len())
                        .then(a.failures.cmp(&b.failures))
                        .then(a_id.cmp(b_id))
                })
                .map(|(p, _)| *p);
            let Some(peer) = candidate else {
                continue;
            };
            let hash = self.hashes[height as usize];
            self.queue.remove(&height);
            if let Some(state) = self.peers.get_mut(&peer) {
                state.in_flight.insert(hash, now);
            }
            actions.push(SyncAction::RequestBlock { peer, hash });
        }
    }

    fn is_caught_up(&self) -> bool {
        !self.peers.is_empty()
            && self.headers_request.is_none()
            && self.queue.is_empty()
            && self.buffered.is_empty()
            && self.peers.values().all(|s| s.in_flight.is_empty() && !self.has_more(s))
            && self.applied == self.header_height()
    }

    /// Blocks known to exist that the wallet has not applied yet.
    pub fn blocks_remaining(&self) -> u64 {
        let target = self.best_height().max(self.header_height()).map_or(0, |h| h.saturating_add(1));
        let applied = self.applied.map_or(0, |a| a.saturating_add(1));
        target.saturating_sub(applied)
    }

    pub fn progress(&self) -> SyncProgress {
        let in_flight = self.peers.values().any(|s| !s.in_flight.is_empty());
        let phase = if self.peers.is_empty() {
            SyncPhase::WaitingForPeers
        } else if self.headers_request.is_some() || self.peers.values().any(|s| self.has_more(s)) {
            SyncPhase::Headers
        } else if !self.queue.is_empty() || !self.buffered.is_empty() || in_flight {
            SyncPhase::Blocks
        } else {
            SyncPhase::Synced
        };
        SyncProgress {
            phase,
            applied_height: self.applied,
            header_height: self.header_height(),
            best_height: self.best_height(),
            blocks_remaining: self.blocks_remaining(),
            peers: self.peers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_core::types::{OutPoint, Script, Transaction, TxInput, TxOutput, merkle_root};

    fn coinbase(height: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput::unsigned(OutPoint::null())],
            outputs: vec![TxOutput { value: 50, script_pubkey: Script::p2pkh(&[height as u8; 20]) }],
            lock_time: height as u32,
        }
    }

    fn make_block(height: u64, prev_hash: Hash256) -> Block {
        let transactions = vec![coinbase(height)];
        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: merkle_root(&txids),
                timestamp: 1_700_000_000 + height * 600,
                bits: 0x207f_ffff,
                nonce: height as u32,
            },
            transactions,
        }
    }

    fn chain(len: u64) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        for h in 0..len {
            let prev = blocks.last().map_or(Hash256::ZERO, Block::hash);
            blocks.push(make_block(h, prev));
        }
        blocks
    }

    fn headers(blocks: &[Block]) -> Vec<BlockHeader> {
        blocks.iter().map(|b| b.header.clone()).collect()
    }

    fn config() -> SyncConfig {
        SyncConfig { request_timeout: Duration::from_secs(10), max_in_flight: 2, max_failures: 3 }
    }

    fn requested_blocks(actions: &[SyncAction]) -> Vec<(PeerId, Hash256)> {
        actions
            .iter()
            .filter_map(|a| match a {
                SyncAction::RequestBlock { peer, hash } => Some((*peer, *hash)),
                _ => None,
            })
            .collect()
    }

    /// Drive one peer through a full catch-up, answering every request from `blocks`.
    fn sync_all(mgr: &mut SyncManager, peer: PeerId, blocks: &[Block], now: Instant) -> Vec<SyncAction> {
        let mut completions = Vec::new();
        for _ in 0..100 {
            let actions = mgr.next_actions(now);
            if actions.is_empty() {
                break;
            }
            for action in actions {
                match action {
                    SyncAction::RequestHeaders { .. } => {
                        mgr.on_headers(&peer, headers(blocks));
                    }
                    SyncAction::RequestBlock { hash, .. } => {
                        let block = blocks.iter().find(|b| b.hash() == hash).unwrap().clone();
                        mgr.on_block(&peer, block, Some(hash));
                    }
                    other => completions.push(other),
                }
            }
            while let Some((height, _)) = mgr.take_connectable() {
                mgr.block_applied(height);
            }
        }
        completions
    }

    #[test]
    fn requests_headers_from_peer_ahead() {
        let mut mgr = SyncManager::new(config(), vec![], None);
        let peer = PeerId::random();
        mgr.on_peer_ready(peer, Some(5));
        let actions = mgr.next_actions(Instant::now());
        assert_eq!(actions, vec![SyncAction::RequestHeaders { peer, locator: vec![] }]);
        assert_eq!(mgr.progress().phase, SyncPhase::Headers);
        // Only one outstanding headers request.
        assert!(mgr.next_actions(Instant::now()).is_empty());
    }

    #[test]
    fn full_catch_up_completes_once() {
        let blocks = chain(6);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), vec![], None);
        mgr.on_peer_ready(peer, Some(5));
        let now = Instant::now();

        let completions = sync_all(&mut mgr, peer, &blocks, now);
        assert_eq!(completions, vec![SyncAction::SyncComplete { height: Some(5) }]);
        assert_eq!(mgr.applied_height(), Some(5));
        assert_eq!(mgr.blocks_remaining(), 0);
        assert_eq!(mgr.progress().phase, SyncPhase::Synced);
        assert!(mgr.next_actions(now).is_empty());
    }

    #[test]
    fn already_synced_peer_completes_immediately() {
        let blocks = chain(3);
        let mut mgr = SyncManager::new(config(), headers(&blocks), Some(2));
        let peer = PeerId::random();
        mgr.on_peer_ready(peer, Some(2));
        assert_eq!(
            mgr.next_actions(Instant::now()),
            vec![SyncAction::SyncComplete { height: Some(2) }]
        );
    }

    #[test]
    fn no_completion_without_peers() {
        let mut mgr = SyncManager::new(config(), vec![], None);
        assert!(mgr.next_actions(Instant::now()).is_empty());
        assert_eq!(mgr.progress().phase, SyncPhase::WaitingForPeers);
    }

    #[test]
    fn blocks_released_in_height_order() {
        let blocks = chain(3);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&blocks), None);
        mgr.on_peer_ready(peer, Some(2));

        assert_eq!(
            mgr.on_block(&peer, blocks[2].clone(), None),
            BlockVerdict::Accepted { height: 2 }
        );
        assert!(mgr.take_connectable().is_none());
        mgr.on_block(&peer, blocks[0].clone(), None);
        mgr.on_block(&peer, blocks[1].clone(), None);

        let mut order = Vec::new();
        while let Some((height, block)) = mgr.take_connectable() {
            assert_eq!(block.hash(), blocks[height as usize].hash());
            order.push(height);
            mgr.block_applied(height);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn non_linking_headers_rejected_and_penalised() {
        let ours = chain(3);
        let other = {
            let mut c = chain(1);
            c.push(make_block(99, Hash256([9; 32])));
            c
        };
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&ours), Some(2));
        mgr.on_peer_ready(peer, Some(10));
        assert_eq!(mgr.on_headers(&peer, headers(&other)), HeadersOutcome::NonLinking);
        assert_eq!(mgr.header_height(), Some(2));
    }

    #[test]
    fn known_prefix_is_skipped() {
        let blocks = chain(5);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&blocks[..3]), Some(2));
        mgr.on_peer_ready(peer, Some(4));
        assert_eq!(
            mgr.on_headers(&peer, headers(&blocks)),
            HeadersOutcome::Extended { from_height: 3, count: 2 }
        );
        assert_eq!(mgr.on_headers(&peer, headers(&blocks)), HeadersOutcome::UpToDate);
    }

    #[test]
    fn wrong_block_is_rejected_and_requeued() {
        let blocks = chain(3);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&blocks), Some(0));
        mgr.on_peer_ready(peer, Some(2));
        let now = Instant::now();
        let asked = requested_blocks(&mgr.next_actions(now));
        assert_eq!(asked.len(), 2);
        let (_, first) = asked[0];
        assert_eq!(first, blocks[1].hash());

        let verdict = mgr.on_block(&peer, blocks[2].clone(), Some(first));
        assert!(matches!(verdict, BlockVerdict::Rejected { .. }));
        // Height 1 goes back to the queue and is requested again.
        let again = requested_blocks(&mgr.next_actions(now));
        assert_eq!(again, vec![(peer, blocks[1].hash())]);
    }

    #[test]
    fn tampered_block_rejected() {
        let blocks = chain(2);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&blocks), Some(0));
        mgr.on_peer_ready(peer, Some(1));
        let hash = blocks[1].hash();
        let mut tampered = blocks[1].clone();
        tampered.transactions[0].outputs[0].value = 1_000_000;
        let verdict = mgr.on_block(&peer, tampered, Some(hash));
        assert_eq!(verdict, BlockVerdict::Rejected { reason: "merkle root mismatch".into() });
        assert_eq!(mgr.take_connectable(), None);
    }

    #[test]
    fn duplicate_blocks_across_peers() {
        let blocks = chain(2);
        let (a, b) = (PeerId::random(), PeerId::random());
        let mut mgr = SyncManager::new(config(), headers(&blocks), None);
        mgr.on_peer_ready(a, Some(1));
        mgr.on_peer_ready(b, Some(1));
        assert_eq!(mgr.on_block(&a, blocks[0].clone(), None), BlockVerdict::Accepted { height: 0 });
        assert_eq!(mgr.on_block(&b, blocks[0].clone(), None), BlockVerdict::Duplicate);
        let (height, _) = mgr.take_connectable().unwrap();
        mgr.block_applied(height);
        assert_eq!(mgr.on_block(&b, blocks[0].clone(), None), BlockVerdict::Duplicate);
    }

    #[test]
    fn gossip_extending_tip_is_accepted() {
        let blocks = chain(4);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&blocks[..3]), Some(2));
        mgr.on_peer_ready(peer, Some(2));
        assert_eq!(mgr.on_block(&peer, blocks[3].clone(), None), BlockVerdict::Accepted { height: 3 });
        assert_eq!(mgr.header_height(), Some(3));
        assert_eq!(mgr.take_connectable().map(|(h, _)| h), Some(3));
    }

    #[test]
    fn gossip_orphan_triggers_header_request() {
        let blocks = chain(5);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&blocks[..2]), Some(1));
        mgr.on_peer_ready(peer, Some(1));
        let now = Instant::now();
        assert_eq!(mgr.next_actions(now), vec![SyncAction::SyncComplete { height: Some(1) }]);

        assert_eq!(mgr.on_block(&peer, blocks[4].clone(), None), BlockVerdict::Orphan);
        let actions = mgr.next_actions(now);
        assert!(matches!(actions.as_slice(), [SyncAction::RequestHeaders { .. }]));
    }

    #[test]
    fn work_spreads_across_peers_with_capacity() {
        let blocks = chain(6);
        let (a, b) = (PeerId::random(), PeerId::random());
        let mut mgr = SyncManager::new(config(), headers(&blocks), None);
        mgr.on_peer_ready(a, Some(5));
        mgr.on_peer_ready(b, Some(5));
        let asked = requested_blocks(&mgr.next_actions(Instant::now()));
        // Two peers, two slots each.
        assert_eq!(asked.len(), 4);
        assert_eq!(asked.iter().filter(|(p, _)| *p == a).count(), 2);
        assert_eq!(asked.iter().filter(|(p, _)| *p == b).count(), 2);
        let hashes: Vec<Hash256> = asked.iter().map(|(_, h)| *h).collect();
        let expected: Vec<Hash256> = blocks[..4].iter().map(Block::hash).collect();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn disconnect_requeues_in_flight() {
        let blocks = chain(2);
        let (a, b) = (PeerId::random(), PeerId::random());
        let mut mgr = SyncManager::new(config(), headers(&blocks), None);
        mgr.on_peer_ready(a, Some(1));
        let now = Instant::now();
        assert_eq!(requested_blocks(&mgr.next_actions(now)).len(), 2);

        mgr.on_peer_disconnected(&a);
        mgr.on_peer_ready(b, Some(1));
        let asked = requested_blocks(&mgr.next_actions(now));
        assert_eq!(asked, vec![(b, blocks[0].hash()), (b, blocks[1].hash())]);
    }

    #[test]
    fn timeouts_requeue_and_eventually_drop_peer() {
        let blocks = chain(1);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&blocks), None);
        mgr.on_peer_ready(peer, Some(0));
        let start = Instant::now();
        let mut now = start;
        let mut dropped = false;
        for _ in 0..5 {
            let actions = mgr.next_actions(now);
            if actions.iter().any(|a| matches!(a, SyncAction::DropPeer { .. })) {
                dropped = true;
                break;
            }
            assert_eq!(requested_blocks(&actions).len(), 1);
            now += Duration::from_secs(11);
        }
        assert!(dropped);
        assert_eq!(mgr.peer_count(), 0);
        assert_eq!(mgr.progress().phase, SyncPhase::WaitingForPeers);
    }

    #[test]
    fn failed_block_request_is_requeued() {
        let blocks = chain(1);
        let (a, b) = (PeerId::random(), PeerId::random());
        let mut mgr = SyncManager::new(config(), headers(&blocks), None);
        mgr.on_peer_ready(a, Some(0));
        let now = Instant::now();
        let asked = requested_blocks(&mgr.next_actions(now));
        assert_eq!(asked, vec![(a, blocks[0].hash())]);
        assert!(mgr.is_busy(&a));

        mgr.on_block_failed(&a, &blocks[0].hash());
        assert!(!mgr.is_busy(&a));
        mgr.on_peer_ready(b, Some(0));
        let again = requested_blocks(&mgr.next_actions(now));
        // `a` now carries a failure, so the fresh peer is preferred.
        assert_eq!(again, vec![(b, blocks[0].hash())]);
    }

    #[test]
    fn failed_headers_request_is_retried() {
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), vec![], None);
        mgr.on_peer_ready(peer, Some(3));
        let now = Instant::now();
        assert_eq!(mgr.next_actions(now).len(), 1);
        assert!(mgr.is_busy(&peer));
        mgr.on_headers_failed(&peer);
        assert!(matches!(mgr.next_actions(now).as_slice(), [SyncAction::RequestHeaders { .. }]));
    }

    #[test]
    fn restore_truncates_broken_chain() {
        let mut hs = headers(&chain(4));
        hs[2].prev_hash = Hash256([7; 32]);
        let mgr = SyncManager::new(config(), hs, Some(3));
        assert_eq!(mgr.header_height(), Some(1));
        assert_eq!(mgr.applied_height(), Some(1));
    }

    #[test]
    fn locator_is_bounded_and_ends_at_genesis() {
        let blocks = chain(300);
        let mgr = SyncManager::new(config(), headers(&blocks), None);
        let locator = mgr.locator();
        assert!(locator.len() <= MAX_LOCATOR_SIZE);
        assert_eq!(locator[0], blocks[299].hash());
        assert_eq!(locator[1], blocks[298].hash());
        assert_eq!(*locator.last().unwrap(), blocks[0].hash());
    }

    #[test]
    fn progress_counts_remaining_blocks() {
        let blocks = chain(10);
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), headers(&blocks[..4]), Some(1));
        mgr.on_peer_ready(peer, Some(9));
        let progress = mgr.progress();
        assert_eq!(progress.blocks_remaining, 8);
        assert_eq!(progress.best_height, Some(9));
        assert_eq!(progress.header_height, Some(3));
        assert_eq!(progress.peers, 1);
    }

    #[test]
    fn remaining_blocks_saturate_at_top_height() {
        let peer = PeerId::random();
        let mut mgr = SyncManager::new(config(), vec![], None);
        mgr.on_peer_ready(peer, Some(u64::MAX));
        assert_eq!(mgr.blocks_remaining(), u64::MAX);
        let progress = mgr.progress();
        assert_eq!(progress.best_height, Some(u64::MAX));
        assert_eq!(progress.phase, SyncPhase::Headers);
    }
}
