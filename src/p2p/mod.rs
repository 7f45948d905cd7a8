use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::torrent::TorrentContext;

mod handshake;
mod message;
mod session;
mod state;

pub use session::PeerSession;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent after introduction")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection timeout")]
    Timeout,

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer session.
pub enum PeerCommand {

    // A piece was verified and written; announce it and cancel stray requests.
    PieceWritten(usize),

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the peer session.
    pub peer_tx: PeerTx,

    // Handle to the peer session task.
    pub session_handle: JoinHandle<()>,

    // Peer id adopted from the handshake, once known.
    pub id: Option<[u8; 20]>,

}

impl PeerHandle {
    pub fn start_session(address: SocketAddr, ctx: Arc<TorrentContext>) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            if let Err(e) = session.start_session().await {
                tracing::warn!("session error: {}", e);
            }
            session.disconnect().await;
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle,
            id: None,
        }
    }
}
