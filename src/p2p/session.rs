use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use crate::{
    block::BlockInfo,
    disk::CommandToDisk,
    requester::BlockReceipt,
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield,
};
use super::{*, handshake::*, message::*, state::*};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// Send a keep-alive when nothing else has gone out for this long.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

// Maximum requests in flight to a single peer.
const REQUEST_PIPELINE: usize = 5;

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

#[derive(Debug)]
pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Context is a read-only state accessible by all peers.
    ctx: Arc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Pending block requests from the client to the peer.
    requests_out: HashSet<BlockInfo>,

    // Bitfield of pieces the peer currently has.
    bitfield: Bitfield,

    state: SessionState,

    // Time the last message was written to the socket.
    last_send: Instant,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, ctx.info.num_pieces);

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                bitfield,
                state: SessionState::default(),
                requests_out: HashSet::new(),
                last_send: Instant::now(),
            },
            peer_tx,
        )
    }

    pub async fn start_session(&mut self) -> Result<()> {

        self.state.conn_state = ConnState::Connecting;
        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
            .await
            .map_err(|_| PeerError::Timeout)??;
        tracing::trace!("outbound connection successful");

        let mut socket = Framed::new(stream, HandshakeCodec);
        self.exchange_handshake(&mut socket).await?;

        // Switch to the message codec, keeping any bytes the peer sent
        // straight after its handshake.
        let old_parts = socket.into_parts();
        let mut parts = FramedParts::new(old_parts.io, MessageCodec);
        parts.read_buf = old_parts.read_buf;
        let socket = Framed::from_parts(parts);

        self.run(socket).await
    }

    // Tells the requester and torrent the peer is gone. Runs exactly once,
    // after the session ends for any reason.
    pub async fn disconnect(&mut self) {
        tracing::debug!(
            "closing session: choking {}, interested {}, peer choking {}, peer interested {}",
            self.state.choking,
            self.state.interested,
            self.state.peer_choking,
            self.state.peer_interested,
        );
        self.state.conn_state = ConnState::Disconnected;
        self.ctx.requester.lock().await.remove_peer(self.address);
        self.ctx.torrent_tx
            .send(CommandToTorrent::PeerDisconnected { address: self.address })
            .ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>) -> Result<()> {

        self.state.conn_state = ConnState::Handshaking;
        tracing::info!("send handshake");
        socket.send(Handshake::new(self.ctx.info_hash, self.ctx.client_id)).await?;

        tracing::trace!("waiting for handshake");
        let handshake = match time::timeout(HANDSHAKE_TIMEOUT, socket.next())
            .await
            .map_err(|_| PeerError::Timeout)?
        {
            Some(handshake) => handshake?,
            None => return Err(PeerError::NoHandshake),
        };

        if handshake.protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }
        if handshake.info_hash != self.ctx.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }

        // Adopt the peer id the handshake carried.
        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
            address: self.address,
            id: handshake.peer_id,
        })?;

        tracing::info!("handshake successful, peer connected");
        Ok(())
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.conn_state = ConnState::Introducing;
        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(Duration::from_secs(1));

        // A downloader is interested in every peer; say so up front.
        self.send_message(&mut sink, Message::Interested).await?;

        loop { tokio::select! {

            // Message from peer.
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(msg) => self.handle_msg(&mut sink, msg?).await?,
                    None => {
                        tracing::info!("peer closed connection");
                        break;
                    },
                }
            }

            // Command from elsewhere in the application.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,

                    PeerCommand::Shutdown => {
                        tracing::info!("session shutdown");
                        break;
                    },

                }
            }

            _ = ticker.tick() => {
                if self.last_send.elapsed() >= KEEP_ALIVE_INTERVAL {
                    self.send_message(&mut sink, Message::KeepAlive).await?;
                }
                // Top the pipeline back up, covers requests that went stale.
                self.make_requests(&mut sink).await?;
            }

        }}

        Ok(())
    }

    // Logs a message, tracks our side of the choke/interest state, sends.
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        match &msg {
            Message::Choke => self.state.choking = true,
            Message::Unchoke => self.state.choking = false,
            Message::Interested => self.state.interested = true,
            Message::NotInterested => self.state.interested = false,
            _ => {},
        }
        tracing::info!("send: {}", msg);
        self.last_send = Instant::now();
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("read: {}", msg);

        match msg {

            // Bitfield can only be sent directly after the handshake.
            Message::Bitfield(bitfield) => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_bitfield(bitfield).await?;
                } else {
                    tracing::error!("unexpected bitfield");
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    // Free pending requests for other peers.
                    self.ctx.requester.lock().await.peer_choked(self.address);
                    self.requests_out.clear();
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    self.make_requests(sink).await?;
                }
            },

            Message::Interested => self.state.peer_interested = true,

            Message::NotInterested => self.state.peer_interested = false,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Block(block) => self.handle_block(sink, block).await?,

            // This client downloads only; peer requests go unserved.
            Message::Request(request) => tracing::debug!("ignoring peer request: {:?}", request),

            Message::Cancel(block) => tracing::debug!("ignoring peer cancel: {:?}", block),

        }

        if self.state.conn_state == ConnState::Introducing {
            self.state.conn_state = ConnState::Connected;
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, mut bitfield: Bitfield) -> Result<()> {
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), self.ctx.info.num_pieces);

        // One bit per piece, trailing padding bits zero.
        if bitfield.len() < self.ctx.info.num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        bitfield.resize(self.ctx.info.num_pieces, false);

        self.ctx.requester.lock().await.add_peer_bitfield(self.address, &bitfield);
        self.bitfield = bitfield;
        Ok(())
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        // If idx is not valid, disconnect.
        if idx as usize >= self.ctx.info.num_pieces {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        // Peer already has piece.
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.ctx.requester.lock().await.add_available_piece(self.address, idx as usize);

        if !self.state.peer_choking {
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    async fn handle_block(&mut self, sink: &mut MessageSink, block: crate::block::Block) -> Result<()> {

        let request = BlockInfo {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        };
        self.requests_out.remove(&request);

        let receipt = self.ctx.requester.lock().await.received_block(self.address, block);
        match receipt {

            // Assembled piece goes to the disk task to be verified and
            // written; the torrent broadcasts the have once the write lands.
            BlockReceipt::PieceComplete { idx, data } => {
                self.ctx.disk_tx.send(CommandToDisk::WritePiece { idx, data })?;
            },

            // Piece was torn down; our queued requests for it died with it.
            BlockReceipt::PieceFailed { idx } => {
                self.requests_out.retain(|b| b.piece_idx != idx);
            },

            BlockReceipt::Accepted | BlockReceipt::Discarded => {},
        }

        self.make_requests(sink).await
    }

    // When a piece is written to disk, let the peer know we have it and
    // cancel any of our requests the write made redundant.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        let stray: Vec<BlockInfo> = self
            .requests_out
            .iter()
            .filter(|b| b.piece_idx == idx)
            .copied()
            .collect();
        for block in stray {
            self.requests_out.remove(&block);
            self.send_message(sink, Message::Cancel(block)).await?;
        }

        self.send_message(sink, Message::Have { idx: idx as u32 }).await
    }

    // Queue requests up to the pipeline depth.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.interested {
            return Ok(());
        }

        let requests = self
            .ctx
            .requester
            .lock()
            .await
            .fill_requests(self.address, REQUEST_PIPELINE, Instant::now());

        for block in requests {
            self.requests_out.insert(block);
            self.send_message(sink, Message::Request(block)).await?;
        }

        Ok(())
    }
}
