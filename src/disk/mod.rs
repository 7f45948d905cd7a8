use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, RwLock},
};
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};
use crate::{
    store::{FileInfo, StoreInfo},
    torrent::{CommandToTorrent, TorrentTx},
    Bitfield,
};


#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("short write: expected {expected} bytes, wrote {actual}")]
    WriteSize { expected: usize, actual: usize },

    #[error("sync error: {0}")]
    SyncError(String),

}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::SyncError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<CommandToDisk>;
pub type DiskRx = mpsc::UnboundedReceiver<CommandToDisk>;

pub enum CommandToDisk {

    // An assembled piece to verify against its hash and write at its offsets.
    WritePiece {
        idx: usize,
        data: Vec<u8>,
    },

    // Flush and stop the disk task.
    Shutdown,

}

#[derive(Debug)]
pub struct TorrentFile {

    // Information about the file.
    pub info: FileInfo,

    // File handle for access.
    pub handle: fs::File,

}

impl TorrentFile {
    pub fn new(dir: &Path, info: FileInfo) -> Result<Self> {

        let path = dir.join(&info.path);
        // Create sub-directories if they don't exist.
        if let Some(subdir) = path.parent() {
            if !subdir.exists() {
                tracing::info!("creating sub-directory: {:?}", subdir);
                fs::create_dir_all(subdir)?;
            }
        }
        tracing::info!("opening file: {:?}", &path);

        // Open the file with read/write permissions, keeping existing data.
        let handle = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self { info, handle })
    }
}

// The disk task verifies assembled pieces and writes them out. Hashing and
// file I/O run on blocking threads so the async loop only routes commands.
#[derive(Debug)]
pub struct Disk {

    // Storage information we need for writing to disk.
    info: StoreInfo,

    // Piece hashes from the metainfo, the verification reference.
    piece_hashes: Vec<[u8; 20]>,

    // Channel to receive commands from other tasks.
    disk_rx: DiskRx,

    // State shared with the blocking write closures.
    ctx: Arc<Ctx>,

}

// Ctx involves data needed by the blocking threads.
#[derive(Debug)]
struct Ctx {

    // Files to write to, ordered by offset.
    files: Vec<RwLock<TorrentFile>>,

    // Channel to send commands to the torrent task.
    torrent_tx: TorrentTx,

}

// Sets up and spawns the disk task.
pub fn spawn(
    info: StoreInfo,
    piece_hashes: Vec<[u8; 20]>,
    torrent_tx: TorrentTx,
) -> Result<(task::JoinHandle<Result<()>>, DiskTx)> {
    tracing::info!("spawning disk task");
    let (mut disk, disk_tx) = Disk::new(info, piece_hashes, torrent_tx)?;
    let handle = task::spawn(async move { disk.run().await });
    Ok((handle, disk_tx))
}

impl Disk {

    pub fn new(info: StoreInfo, piece_hashes: Vec<[u8; 20]>, torrent_tx: TorrentTx) -> Result<(Self, DiskTx)> {

        // Create the output directory if it doesn't exist.
        if !info.output_dir.is_dir() {
            fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        debug_assert!(!info.files.is_empty());
        let files = info
            .files
            .iter()
            .map(|file| TorrentFile::new(&info.output_dir, file.clone()).map(RwLock::new))
            .collect::<Result<Vec<_>>>()?;

        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                info,
                piece_hashes,
                disk_rx,
                ctx: Arc::new(Ctx {
                    files,
                    torrent_tx,
                }),
            },
            disk_tx,
        ))
    }

    #[tracing::instrument(name = "disk", skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("starting disk");
        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {

                CommandToDisk::WritePiece { idx, data } => self.write_piece(idx, data),

                CommandToDisk::Shutdown => {
                    tracing::info!("disk shutdown");
                    break;
                },

            }
        }

        for file in self.ctx.files.iter() {
            if let Ok(f) = file.read() {
                f.handle.sync_all().ok();
            }
        }
        Ok(())
    }

    // Verifies a piece against its metainfo hash and, if it matches, writes
    // it at its absolute offset. Both are slow, so they run on a blocking
    // thread; the torrent learns the outcome through a PieceWritten command.
    fn write_piece(&mut self, idx: usize, data: Vec<u8>) {
        tracing::trace!("verifying piece {} ({} bytes)", idx, data.len());
        debug_assert_eq!(data.len(), self.info.piece_length(idx));

        let expected = self.piece_hashes[idx];
        let offset = self.info.piece_offset(idx);
        let file_range = self.info.piece_file_range(idx);
        let ctx = Arc::clone(&self.ctx);

        task::spawn_blocking(move || {

            let hash: [u8; 20] = Sha1::digest(&data).into();
            if hash != expected {
                tracing::warn!("piece {} failed hash verification", idx);
                ctx.torrent_tx
                    .send(CommandToTorrent::PieceWritten { idx, valid: false })
                    .ok();
                return;
            }

            match write_range(offset, &data, &ctx.files[file_range]) {
                Ok(()) => {
                    tracing::trace!("piece {} written at offset {}", idx, offset);
                    ctx.torrent_tx
                        .send(CommandToTorrent::PieceWritten { idx, valid: true })
                        .ok();
                },
                Err(e) => {
                    tracing::error!("failed to write piece {}: {}", idx, e);
                    ctx.torrent_tx
                        .send(CommandToTorrent::DiskFailure { error: e.to_string() })
                        .ok();
                },
            }
        });
    }
}

// Writes contiguous bytes at an absolute offset, spanning files as needed.
fn write_range(piece_offset: usize, data: &[u8], files: &[RwLock<TorrentFile>]) -> Result<()> {

    let mut offset = piece_offset;
    let mut written = 0;

    for file in files {
        let mut f = file.write()?;

        let byte_range = f.info.byte_range();
        let file_offset = offset - byte_range.start;
        let n = (data.len() - written).min(byte_range.end - offset);

        f.handle.seek(SeekFrom::Start(file_offset as u64))?;
        f.handle.write_all(&data[written..written + n])?;

        written += n;
        offset += n;
    }

    if written != data.len() {
        return Err(DiskError::WriteSize { expected: data.len(), actual: written });
    }
    Ok(())
}

// Re-verifies existing data on disk, piece by piece. A piece counts only if
// every byte of it could be read and its SHA-1 matches; missing files and
// short reads just leave bits unset.
pub fn verify_on_disk(info: &StoreInfo, piece_hashes: &[[u8; 20]]) -> std::io::Result<Bitfield> {

    let mut verified = Bitfield::repeat(false, piece_hashes.len());

    let mut handles: Vec<Option<fs::File>> = info
        .files
        .iter()
        .map(|f| fs::File::open(info.output_dir.join(&f.path)).ok())
        .collect();

    let mut buf = vec![0u8; info.piece_len];
    for (idx, hash) in piece_hashes.iter().enumerate() {

        let piece_len = info.piece_length(idx);
        let mut offset = info.piece_offset(idx);
        let mut read = 0;

        let Some((first_file, _)) = info.locate(offset) else {
            break;
        };

        for file_idx in first_file..info.files.len() {
            if read == piece_len {
                break;
            }
            let Some(handle) = handles[file_idx].as_mut() else {
                break;
            };

            let byte_range = info.files[file_idx].byte_range();
            let want = (piece_len - read).min(byte_range.end - offset);

            handle.seek(SeekFrom::Start((offset - byte_range.start) as u64))?;
            let n = read_full(handle, &mut buf[read..read + want])?;

            read += n;
            offset += n;
            if n < want {
                // File is shorter than the layout says; piece can't verify.
                break;
            }
        }

        if read == piece_len && Sha1::digest(&buf[..piece_len]).as_slice() == hash {
            verified.set(idx, true);
        }
    }

    Ok(verified)
}

// Reads until the buffer is full or EOF; returns bytes read.
fn read_full(f: &mut fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        let r = f.read(&mut buf[n..])?;
        if r == 0 {
            break;
        }
        n += r;
    }
    Ok(n)
}
