use crate::{
    block::{block_len, num_blocks, Block},
    BLOCK_SIZE,
};

#[derive(Debug, thiserror::Error)]
pub enum BlockError {

    #[error("block offset {offset} does not address a free slot of piece {piece_idx}")]
    NonSequential { piece_idx: usize, offset: usize },

}

// A piece under assembly. Block payloads are held in their slots until the
// piece is verified and written, after which they are freed.
#[derive(Debug)]
pub struct Piece {

    // Index of the piece within the torrent.
    pub index: usize,

    // Length of the piece in bytes.
    pub length: usize,

    // Number of payload bytes received so far.
    present: usize,

    // Whether the piece has been flushed to disk.
    written: bool,

    // One slot per block, filled as payloads arrive.
    blocks: Vec<Option<Vec<u8>>>,

}

impl Piece {

    pub fn new(index: usize, length: usize) -> Self {
        Self {
            index,
            length,
            present: 0,
            written: false,
            blocks: vec![None; num_blocks(length)],
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn block_offset(&self, slot: usize) -> usize {
        slot * BLOCK_SIZE
    }

    #[inline]
    pub fn block_len(&self, slot: usize) -> usize {
        block_len(self.length, slot)
    }

    pub fn has_block(&self, slot: usize) -> bool {
        self.blocks[slot].is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.present == self.length
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn remaining(&self) -> usize {
        self.length - self.present
    }

    // Stores a block payload in its slot. The offset must address an empty
    // slot on a block boundary and the payload must fill the slot exactly.
    pub fn add_block(&mut self, block: Block) -> Result<(), BlockError> {
        debug_assert_eq!(block.piece_idx, self.index);

        let slot = block.offset / BLOCK_SIZE;
        if block.offset % BLOCK_SIZE != 0
            || slot >= self.blocks.len()
            || self.blocks[slot].is_some()
            || block.data.len() != self.block_len(slot)
        {
            return Err(BlockError::NonSequential {
                piece_idx: block.piece_idx,
                offset: block.offset,
            });
        }

        self.present += block.data.len();
        self.blocks[slot] = Some(block.data);
        Ok(())
    }

    // Concatenated piece data, ready for the completion sink to hash-verify
    // and write. Only meaningful once complete and not yet flushed; callers
    // check `is_complete` first.
    pub fn data(&self) -> Vec<u8> {
        debug_assert!(self.is_complete() && !self.written);
        let mut data = Vec::with_capacity(self.length);
        for block in self.blocks.iter().flatten() {
            data.extend_from_slice(block);
        }
        data
    }

    // Frees the block buffers once the piece is safely on disk.
    pub fn mark_written(&mut self) {
        self.present = self.length;
        self.written = true;
        self.blocks.clear();
    }

    // Returns the piece to its initial empty state, used on hash mismatch.
    pub fn reset(&mut self) {
        self.present = 0;
        self.written = false;
        self.blocks = vec![None; num_blocks(self.length)];
    }
}
