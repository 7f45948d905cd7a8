use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time,
};
use url::Url;
use crate::{
    config::TorrentConfig,
    disk::{self, CommandToDisk, DiskTx},
    metainfo::MetaInfo,
    p2p::{PeerCommand, PeerHandle},
    requester::Requester,
    store::StoreInfo,
    tracker::{self, Event, PeersRx, TrackerCommand, TrackerError, TrackerTx, TransferStats},
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("disk error: {0}")]
    Disk(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

}

impl From<disk::DiskError> for TorrentError {
    fn from(e: disk::DiskError) -> Self {
        TorrentError::Disk(e.to_string())
    }
}

// Type aliases.
pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Commands that can be sent to a torrent from other tasks.
pub enum CommandToTorrent {

    // Sent by a peer task when its handshake succeeds.
    PeerConnected { address: SocketAddr, id: [u8; 20] },

    // Sent by a peer task when its session ends.
    PeerDisconnected { address: SocketAddr },

    // Sent by the disk task once a piece has been verified; valid means it
    // matched its hash and is on disk.
    PieceWritten { idx: usize, valid: bool },

    // Sent by the disk task when a write fails; fatal.
    DiskFailure { error: String },

    // Sent when announcing can't continue; fatal.
    TrackerFailed { error: TrackerError },

    // External request to stop the torrent.
    Shutdown,

}

// Read-only state shared with every peer session.
#[derive(Debug)]
pub struct TorrentContext {

    // The info hash for this torrent.
    pub info_hash: [u8; 20],

    // The id this client presents to the swarm.
    pub client_id: [u8; 20],

    // Decides which blocks to request from which peers. Single mutex, the
    // critical sections are short.
    pub requester: Mutex<Requester>,

    // Commands to the torrent.
    pub torrent_tx: TorrentTx,

    // Commands to the disk task.
    pub disk_tx: DiskTx,

    // Torrent storage information.
    pub info: StoreInfo,

}

pub struct Torrent {

    // Context is read-only state shared with peer sessions.
    ctx: Arc<TorrentContext>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Announce URLs in rotation order.
    urls: Vec<Url>,

    // Frozen piece hashes from the metainfo, for resume verification.
    piece_hashes: Vec<[u8; 20]>,

    // Receiver for commands.
    torrent_rx: TorrentRx,

    // Transfer counters the tracker task reads at each announce.
    stats_tx: watch::Sender<TransferStats>,

    // Commands to the tracker task, once running.
    tracker_tx: Option<TrackerTx>,

    // Option is for moving out of the handle behind a mutable ref.
    tracker_handle: Option<JoinHandle<()>>,

    disk_handle: Option<JoinHandle<disk::Result<()>>>,

    config: TorrentConfig,

    // Time when the torrent started.
    start_time: Option<Instant>,

}

impl Torrent {

    pub fn new(metainfo: MetaInfo, config: TorrentConfig) -> Result<Self> {

        let info = StoreInfo::new(&metainfo, config.output_dir.clone());
        let piece_hashes = metainfo.piece_hashes();
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (disk_handle, disk_tx) = disk::spawn(info.clone(), piece_hashes.clone(), torrent_tx.clone())?;
        let requester = Requester::new(info.piece_len, info.last_piece_len, info.num_pieces);
        let (stats_tx, _) = watch::channel(TransferStats {
            uploaded: 0,
            downloaded: 0,
            left: info.total_len,
        });

        Ok(Torrent {
            ctx: Arc::new(TorrentContext {
                info_hash: metainfo.info_hash(),
                client_id: config.client_id,
                requester: Mutex::new(requester),
                torrent_tx,
                disk_tx,
                info,
            }),
            peers: HashMap::new(),
            urls: metainfo.announce_urls(),
            piece_hashes,
            torrent_rx,
            stats_tx,
            tracker_tx: None,
            tracker_handle: None,
            disk_handle: Some(disk_handle),
            config,
            start_time: None,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());

        // See what a previous run left on disk before asking anyone for data.
        let verified = {
            let info = self.ctx.info.clone();
            let hashes = self.piece_hashes.clone();
            tokio::task::spawn_blocking(move || disk::verify_on_disk(&info, &hashes))
                .await
                .expect("verification task panicked")?
        };
        {
            let mut requester = self.ctx.requester.lock().await;
            for idx in verified.iter_ones() {
                requester.mark_piece_written(idx);
            }
            let left = requester.bytes_left();
            let total = self.ctx.info.total_len;
            self.stats_tx.send_modify(|s| {
                s.downloaded = total - left;
                s.left = left;
            });
        }
        if verified.any() {
            tracing::info!(
                "resume: {}/{} pieces already on disk",
                verified.count_ones(),
                self.ctx.info.num_pieces,
            );
        }

        // Start announcing. A fatal tracker error is forwarded to the
        // command loop; the watcher task owns the tracker handle.
        let (tracker_handle, tracker_tx, peers_rx) = tracker::spawn(
            self.urls.clone(),
            self.ctx.info_hash,
            self.ctx.client_id,
            self.config.port,
            self.stats_tx.subscribe(),
        );
        let torrent_tx = self.ctx.torrent_tx.clone();
        self.tracker_handle = Some(tokio::spawn(async move {
            match tracker_handle.await {
                Ok(Ok(())) => {},
                Ok(Err(error)) => {
                    torrent_tx.send(CommandToTorrent::TrackerFailed { error }).ok();
                },
                Err(e) => tracing::warn!("tracker task join error: {}", e),
            }
        }));
        self.tracker_tx = Some(tracker_tx);

        self.run(peers_rx).await
    }

    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self, mut peers_rx: PeersRx) -> Result<()> {

        if self.ctx.requester.lock().await.is_complete() {
            tracing::info!("torrent already complete on disk");
            return self.shutdown(Event::Completed).await;
        }

        let mut ticker = time::interval(Duration::from_secs(1));

        // Top level torrent loop.
        loop { tokio::select! {

            Some(endpoints) = peers_rx.recv() => self.connect_to_peers(endpoints),

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {

                    CommandToTorrent::PeerConnected { address, id } => {
                        if let Some(peer) = self.peers.get_mut(&address) {
                            peer.id = Some(id);
                        }
                    },

                    CommandToTorrent::PeerDisconnected { address } => {
                        if let Some(peer) = self.peers.remove(&address) {
                            match peer.id {
                                Some(id) => tracing::debug!("peer {} ({}) gone", address, String::from_utf8_lossy(&id)),
                                None => tracing::debug!("peer {} gone before handshake", address),
                            }
                        }
                    },

                    CommandToTorrent::PieceWritten { idx, valid } => {
                        if self.handle_piece_write(idx, valid).await {
                            tracing::info!("torrent download complete");
                            return self.shutdown(Event::Completed).await;
                        }
                    },

                    CommandToTorrent::DiskFailure { error } => {
                        tracing::error!("disk failure: {}", error);
                        self.shutdown(Event::Stopped).await.ok();
                        return Err(TorrentError::Disk(error));
                    },

                    CommandToTorrent::TrackerFailed { error } => {
                        tracing::error!("tracker failure: {}", error);
                        self.shutdown(Event::Stopped).await.ok();
                        return Err(error.into());
                    },

                    CommandToTorrent::Shutdown => {
                        return self.shutdown(Event::Stopped).await;
                    },
                }
            }

            // Requests nobody answered go back into the pool.
            _ = ticker.tick() => {
                self.ctx.requester.lock().await.drop_stale(Instant::now());
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                return self.shutdown(Event::Stopped).await;
            }

        }}
    }

    fn connect_to_peers(&mut self, endpoints: Vec<SocketAddr>) {
        for address in endpoints {
            if self.peers.len() >= self.config.max_peers {
                tracing::debug!("at peer connection cap");
                break;
            }
            if self.peers.contains_key(&address) {
                continue;
            }
            tracing::info!("connecting to peer {}", address);
            self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone()));
        }
    }

    // Marks the piece written, refreshes announce stats and tells every
    // session. Returns whether the torrent is now complete. An invalid
    // piece is torn down instead so its blocks get re-fetched.
    async fn handle_piece_write(&mut self, idx: usize, valid: bool) -> bool {

        if !valid {
            self.ctx.requester.lock().await.reset_piece(idx);
            return false;
        }

        let (left, complete, num_written) = {
            let mut requester = self.ctx.requester.lock().await;
            requester.mark_piece_written(idx);
            (requester.bytes_left(), requester.is_complete(), requester.num_pieces_written())
        };
        tracing::info!("piece {} written, {}/{} pieces on disk", idx, num_written, self.ctx.info.num_pieces);

        let total = self.ctx.info.total_len;
        self.stats_tx.send_modify(|s| {
            s.downloaded = total - left;
            s.left = left;
        });

        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
        }

        complete
    }

    async fn shutdown(&mut self, event: Event) -> Result<()> {

        tracing::info!("disconnecting from {} peers", self.peers.len());

        // The tracker's goodbye announce runs while peer sessions drain.
        if let Some(tx) = &self.tracker_tx {
            let cmd = if event == Event::Completed {
                TrackerCommand::Completed
            } else {
                TrackerCommand::Shutdown
            };
            tx.send(cmd).ok();
        }

        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for (_, peer) in self.peers.drain() {
            if let Err(e) = peer.session_handle.await {
                tracing::warn!("session join error: {}", e);
            }
        }

        if let Some(handle) = self.tracker_handle.take() {
            handle.await.ok();
        }

        self.ctx.disk_tx.send(CommandToDisk::Shutdown).ok();
        if let Some(handle) = self.disk_handle.take() {
            match handle.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => tracing::warn!("disk join error: {}", e),
            }
        }

        if let Some(start) = self.start_time {
            tracing::info!("torrent session ended after {:?}", start.elapsed());
        }
        Ok(())
    }
}
