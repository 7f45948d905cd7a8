use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, Bitfield};
use super::PeerError;

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {

    // The keep alive message advises peers not to close the connection,
    // even if they haven't received a message in some time.
    KeepAlive,

    // A choke message tells a peer that no further requests will be satisfied.
    Choke,

    // Conversely unchoke signifies that requests from the peer will be served.
    Unchoke,

    // Notifies a peer that the client is interested in making requests for blocks.
    Interested,

    // Notifies a peer the client is no longer interested in requesting blocks.
    NotInterested,

    // Tells a peer that the client has a piece, referenced by the piece index.
    Have { idx: u32 },

    // The bitfield message is a short form method of communicating to a peer
    // what pieces a client has, sent directly after the handshake.
    Bitfield(Bitfield),

    // When a client wants to request data, they reference the index of the
    // piece, the offset of the block within the piece, and the block length.
    Request(block::BlockInfo),

    // Clients send blocks in the piece message, referencing piece index and
    // block offset.
    Block(block::Block),

    // The cancel message is sent to cancel a request for a block.
    Cancel(block::BlockInfo),

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // keep-alive: <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // choke: <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // unchoke: <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // interested: <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // not interested: <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_raw_slice();
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bytes);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.remaining() < 4 { return Ok(None); }

        let mut peeker = std::io::Cursor::new(&src);
        let msg_len: usize = peeker.get_u32() as usize;

        if src.remaining() >= 4 + msg_len {
            src.advance(4);
            if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }
        } else {
            // Haven't received all of message.
            return Ok(None);
        }

        let msg = match src.get_u8() {
            id @ 0..=3 => {
                if msg_len != 1 {
                    return Err(PeerError::InvalidMessage);
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            },
            4 => {
                if msg_len != 5 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Have { idx: src.get_u32() }
            },
            5 => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            6 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(block::BlockInfo { piece_idx, offset, len })
            },
            7 => {
                if msg_len < 9 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Block(block::Block { piece_idx, offset, data })
            },
            8 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(block::BlockInfo { piece_idx, offset, len })
            },
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
        }
    }
}
