use crate::BLOCK_SIZE;

// A block received from a peer, with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    // Index of the piece that the block is contained in.
    pub piece_idx: usize,

    // Offset in bytes of the block within the piece.
    pub offset: usize,

    // Data of the block.
    pub data: Vec<u8>,
}

// Identifies a block within the torrent, the unit of requests to peers.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> usize {
    (piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE
}
