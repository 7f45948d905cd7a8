use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    time::{Duration, Instant},
};
use crate::{
    block::{Block, BlockInfo},
    piece::Piece,
    Bitfield,
};

// Cap on requests outstanding across all peers, bounds buffered memory.
const MAX_PENDING_REQUESTS: usize = 50;

// A request with no answer for this long may be re-issued to another peer.
const REQUEST_STALE_TIMEOUT: Duration = Duration::from_secs(2);

// An outstanding request issued to a peer.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {

    block: BlockInfo,

    // The peer the request was issued to.
    peer: SocketAddr,

    issued_at: Instant,

}

// Outcome of feeding a received block to the requester.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockReceipt {

    // Unsolicited, duplicate or out of range; dropped.
    Discarded,

    // Stored, piece not yet complete.
    Accepted,

    // Final block arrived; the assembled data is ready for the disk task to
    // hash-verify and write.
    PieceComplete { idx: usize, data: Vec<u8> },

    // The piece was torn down after an inconsistent block; its blocks will
    // be re-fetched.
    PieceFailed { idx: usize },

}

// Decides which block to ask which peer for next.
//
// A single requester is shared by every peer session of the torrent; it is
// the only mutator of availability and request state. Strategy is plain
// sequential: lowest piece index first, lowest offset first.
#[derive(Debug)]
pub struct Requester {

    // For each piece index, the set of peers known to have it.
    piece_peer_map: Vec<HashSet<SocketAddr>>,

    // Inverse index; ordered so request issue order is deterministic.
    peer_piece_map: HashMap<SocketAddr, BTreeSet<usize>>,

    // In-flight requests, at most one per (piece, offset) pair.
    pending: Vec<PendingRequest>,

    // Piece aggregates, indexed like the metainfo hashes.
    pieces: Vec<Piece>,

}

impl Requester {

    pub fn new(piece_len: usize, last_piece_len: usize, num_pieces: usize) -> Self {
        let pieces = (0..num_pieces)
            .map(|idx| {
                let len = if idx == num_pieces - 1 { last_piece_len } else { piece_len };
                Piece::new(idx, len)
            })
            .collect();

        Self {
            piece_peer_map: vec![HashSet::new(); num_pieces],
            peer_piece_map: HashMap::new(),
            pending: Vec::new(),
            pieces,
        }
    }

    // Called when a peer advertises a piece with a have message.
    pub fn add_available_piece(&mut self, peer: SocketAddr, idx: usize) {
        if idx >= self.pieces.len() {
            tracing::warn!("peer advertised piece {} beyond torrent bounds", idx);
            return;
        }
        self.piece_peer_map[idx].insert(peer);
        self.peer_piece_map.entry(peer).or_default().insert(idx);
    }

    pub fn add_peer_bitfield(&mut self, peer: SocketAddr, bitfield: &Bitfield) {
        for idx in bitfield.iter_ones() {
            self.add_available_piece(peer, idx);
        }
    }

    // Forgets a peer entirely: availability and any in-flight requests, so
    // other peers may pick its blocks up.
    pub fn remove_peer(&mut self, peer: SocketAddr) {
        if let Some(indices) = self.peer_piece_map.remove(&peer) {
            for idx in indices {
                self.piece_peer_map[idx].remove(&peer);
            }
        }
        self.pending.retain(|r| r.peer != peer);
    }

    // A choking peer won't answer requests, but may unchoke later, so its
    // availability is kept.
    pub fn peer_choked(&mut self, peer: SocketAddr) {
        self.pending.retain(|r| r.peer != peer);
    }

    // Produces the next request for the peer, or None if the peer has
    // nothing we need, the torrent is complete, or the global cap is hit.
    pub fn next_request(&mut self, peer: SocketAddr, now: Instant) -> Option<BlockInfo> {

        if self.pending.len() >= MAX_PENDING_REQUESTS || self.is_complete() {
            return None;
        }

        let indices = self.peer_piece_map.get(&peer)?;
        for &idx in indices.iter() {
            let piece = &self.pieces[idx];
            if piece.is_complete() {
                continue;
            }

            for slot in 0..piece.num_blocks() {
                if piece.has_block(slot) {
                    continue;
                }
                let offset = piece.block_offset(slot);
                if self.pending.iter().any(|r| r.block.piece_idx == idx && r.block.offset == offset) {
                    continue;
                }

                let block = BlockInfo { piece_idx: idx, offset, len: piece.block_len(slot) };
                self.pending.push(PendingRequest { block, peer, issued_at: now });
                return Some(block);
            }
        }

        None
    }

    // Issues requests until the peer has `pipeline` outstanding.
    pub fn fill_requests(&mut self, peer: SocketAddr, pipeline: usize, now: Instant) -> Vec<BlockInfo> {
        let outstanding = self.pending.iter().filter(|r| r.peer == peer).count();
        let mut requests = Vec::new();
        for _ in outstanding..pipeline {
            match self.next_request(peer, now) {
                Some(block) => requests.push(block),
                None => break,
            }
        }
        requests
    }

    // Feeds a block received from a peer into its piece. Assembled pieces
    // are handed back unverified; hashing them is slow and belongs to the
    // disk task, not the scheduler's critical section.
    pub fn received_block(&mut self, peer: SocketAddr, block: Block) -> BlockReceipt {

        let idx = block.piece_idx;
        if idx >= self.pieces.len() {
            tracing::warn!("block for piece {} beyond torrent bounds", idx);
            return BlockReceipt::Discarded;
        }

        // The peer evidently has this piece, solicited or not.
        self.add_available_piece(peer, idx);

        if self.pieces[idx].is_complete() || self.pieces[idx].is_written() {
            tracing::debug!("block for already complete piece {}", idx);
            return BlockReceipt::Discarded;
        }

        // Only blocks with a live request are admitted; anything else was
        // either never asked for or already satisfied elsewhere.
        if !self.remove_pending(idx, block.offset) {
            tracing::debug!("unsolicited block for piece {} offset {}", idx, block.offset);
            return BlockReceipt::Discarded;
        }

        let piece = &mut self.pieces[idx];
        if let Err(e) = piece.add_block(block) {
            tracing::warn!("{}, resetting piece", e);
            piece.reset();
            self.remove_requests_for_piece(idx);
            return BlockReceipt::PieceFailed { idx };
        }

        if !piece.is_complete() {
            tracing::trace!("piece {} has {} bytes remaining", idx, piece.remaining());
            return BlockReceipt::Accepted;
        }

        self.remove_requests_for_piece(idx);
        let data = self.pieces[idx].data();
        tracing::info!("piece {} assembled", idx);
        BlockReceipt::PieceComplete { idx, data }
    }

    // Marks a piece as verified and flushed to disk, freeing its buffers.
    pub fn mark_piece_written(&mut self, idx: usize) {
        debug_assert!(!self.pending.iter().any(|r| r.block.piece_idx == idx));
        self.pieces[idx].mark_written();
    }

    // Tears a piece down after it failed hash verification; its blocks
    // become requestable again.
    pub fn reset_piece(&mut self, idx: usize) {
        tracing::warn!("piece {} reset, re-fetching its blocks", idx);
        self.pieces[idx].reset();
        self.remove_requests_for_piece(idx);
    }

    // Drops requests that have gone unanswered; their blocks become
    // requestable again. The slow peer is not penalised.
    pub fn drop_stale(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending
            .retain(|r| now.saturating_duration_since(r.issued_at) < REQUEST_STALE_TIMEOUT);
        if self.pending.len() < before {
            tracing::debug!("dropped {} stale requests", before - self.pending.len());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.is_written())
    }

    pub fn bytes_left(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|p| !p.is_written())
            .map(|p| p.length as u64)
            .sum()
    }

    pub fn num_pieces_written(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_written()).count()
    }

    fn remove_pending(&mut self, idx: usize, offset: usize) -> bool {
        let before = self.pending.len();
        self.pending
            .retain(|r| !(r.block.piece_idx == idx && r.block.offset == offset));
        self.pending.len() < before
    }

    fn remove_requests_for_piece(&mut self, idx: usize) {
        self.pending.retain(|r| r.block.piece_idx != idx);
    }
}
