use std::{collections::VecDeque, net::SocketAddr, time::Duration};
use tokio::{sync::{mpsc, watch}, task::JoinHandle, time};
use tracing::Instrument;
use url::Url;

mod http;

use http::AnnounceParams;

pub type Result<T> = std::result::Result<T, TrackerError>;
pub type TrackerTx = mpsc::UnboundedSender<TrackerCommand>;
type TrackerRx = mpsc::UnboundedReceiver<TrackerCommand>;
pub type PeersTx = mpsc::Sender<Vec<SocketAddr>>;
pub type PeersRx = mpsc::Receiver<Vec<SocketAddr>>;

// In cases where the tracker doesn't give us an interval.
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

// How long a single announce may take before its URL is given up on.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

// Endpoints buffered for the torrent before refills get dropped.
const PEER_QUEUE_LEN: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("error deserializing response: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("announce timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("announce url list exhausted")]
    NoTrackers,

}

// Commands that can be sent to the tracker task.
pub enum TrackerCommand {

    // The torrent finished; make a final completed announce and stop.
    Completed,

    // Make a final stopped announce and stop.
    Shutdown,

}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {

    Started,

    Completed,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

// Byte counters reported with each announce, updated by the torrent.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {

    pub uploaded: u64,

    pub downloaded: u64,

    pub left: u64,

}

// Recurring announce task. Keeps a deduplicated round-robin of announce
// URLs; a URL that fails an announce is dropped from the rotation, and an
// empty rotation is fatal to the torrent.
pub struct TrackerSession {

    client: reqwest::Client,

    urls: VecDeque<Url>,

    info_hash: [u8; 20],

    client_id: [u8; 20],

    // Port reported in announces.
    port: u16,

    interval: Duration,

    // Fresh endpoints for the torrent to drain.
    peers_tx: PeersTx,

    stats_rx: watch::Receiver<TransferStats>,

    cmd_rx: TrackerRx,

}

// Sets up and spawns the tracker task.
pub fn spawn(
    urls: Vec<Url>,
    info_hash: [u8; 20],
    client_id: [u8; 20],
    port: u16,
    stats_rx: watch::Receiver<TransferStats>,
) -> (JoinHandle<Result<()>>, TrackerTx, PeersRx) {

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (peers_tx, peers_rx) = mpsc::channel(PEER_QUEUE_LEN);

    let mut session = TrackerSession {
        client: reqwest::Client::new(),
        urls: urls.into_iter().collect(),
        info_hash,
        client_id,
        port,
        interval: DEFAULT_ANNOUNCE_INTERVAL,
        peers_tx,
        stats_rx,
        cmd_rx,
    };

    let handle = tokio::spawn(async move {
        session.run().await
    }.instrument(tracing::info_span!("tracker")));

    (handle, cmd_tx, peers_rx)
}

impl TrackerSession {

    async fn run(&mut self) -> Result<()> {

        let mut event = Some(Event::Started);
        loop {

            let peers = self.announce_rotate(event).await?;
            if !peers.is_empty() {
                tracing::info!("tracker sent {} peers", peers.len());
                // A full queue means the torrent has endpoints to spare;
                // this refill can be dropped.
                self.peers_tx.try_send(peers).ok();
            }
            event = None;

            tokio::select! {

                _ = time::sleep(self.interval) => {},

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(TrackerCommand::Completed) => {
                            self.final_announce(Event::Completed).await;
                            return Ok(());
                        },
                        Some(TrackerCommand::Shutdown) | None => {
                            self.final_announce(Event::Stopped).await;
                            return Ok(());
                        },
                    }
                }

            }
        }
    }

    // Announces to the first URL in the rotation that answers. Failed URLs
    // leave the rotation; the next is tried immediately.
    async fn announce_rotate(&mut self, event: Option<Event>) -> Result<Vec<SocketAddr>> {

        while let Some(url) = self.urls.pop_front() {

            let stats = *self.stats_rx.borrow();
            let params = AnnounceParams {
                info_hash: self.info_hash,
                client_id: self.client_id,
                port: self.port,
                uploaded: stats.uploaded,
                downloaded: stats.downloaded,
                left: stats.left,
                event,
            };

            let resp = time::timeout(
                ANNOUNCE_TIMEOUT,
                http::announce(&self.client, &url, &params),
            ).await;

            match resp {
                Ok(Ok(resp)) => {
                    self.interval = resp.interval();
                    // The URL answered, it stays at the head of the rotation.
                    self.urls.push_front(url);
                    return Ok(resp.peers);
                },
                Ok(Err(e)) => {
                    tracing::warn!("dropping tracker {}: {}", url, e);
                },
                Err(e) => {
                    tracing::warn!("dropping tracker {}: {}", url, TrackerError::from(e));
                },
            }
        }

        tracing::error!("no responsive trackers remain");
        Err(TrackerError::NoTrackers)
    }

    // Best-effort goodbye; failures only get logged.
    async fn final_announce(&mut self, event: Event) {
        tracing::info!("final {} announce", event);
        if let Err(e) = self.announce_rotate(Some(event)).await {
            tracing::warn!("final announce failed: {}", e);
        }
    }
}
