mod block;
mod config;
mod de;
mod disk;
mod metainfo;
mod p2p;
mod piece;
mod requester;
mod store;
mod torrent;
mod tracker;

// Size of a block, the unit of transfer between peers.
const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use config::TorrentConfig;
pub use metainfo::{MetaInfo, MetaInfoError};
pub use torrent::{Torrent, TorrentError};
