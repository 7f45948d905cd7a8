// End-to-end downloads against stub peers and stub trackers speaking just
// enough of the protocol.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    time,
};
use opal::{MetaInfo, Torrent, TorrentConfig};

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn bstr(s: &str) -> Vec<u8> {
    format!("{}:{}", s.len(), s).into_bytes()
}

fn piece_hashes(data: &[u8], piece_len: usize) -> Vec<u8> {
    let mut pieces = Vec::new();
    for chunk in data.chunks(piece_len) {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }
    pieces
}

// Bencoded info dictionary for a single-file torrent.
fn single_file_info(name: &str, piece_len: usize, data: &[u8]) -> Vec<u8> {
    let pieces = piece_hashes(data, piece_len);
    let mut info = Vec::new();
    info.extend_from_slice(b"d");
    info.extend_from_slice(format!("6:lengthi{}e", data.len()).as_bytes());
    info.extend_from_slice(b"4:name");
    info.extend_from_slice(&bstr(name));
    info.extend_from_slice(format!("12:piece lengthi{}e", piece_len).as_bytes());
    info.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
    info.extend_from_slice(&pieces);
    info.extend_from_slice(b"e");
    info
}

// Bencoded info dictionary for a multi-file torrent; `data` is the full
// concatenated content.
fn multi_file_info(dir_name: &str, piece_len: usize, files: &[(&str, usize)], data: &[u8]) -> Vec<u8> {
    let pieces = piece_hashes(data, piece_len);
    let mut info = Vec::new();
    info.extend_from_slice(b"d5:filesl");
    for (name, len) in files {
        info.extend_from_slice(format!("d6:lengthi{}e4:pathl", len).as_bytes());
        info.extend_from_slice(&bstr(name));
        info.extend_from_slice(b"ee");
    }
    info.extend_from_slice(b"e4:name");
    info.extend_from_slice(&bstr(dir_name));
    info.extend_from_slice(format!("12:piece lengthi{}e", piece_len).as_bytes());
    info.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
    info.extend_from_slice(&pieces);
    info.extend_from_slice(b"e");
    info
}

fn info_hash(info: &[u8]) -> [u8; 20] {
    Sha1::digest(info).into()
}

fn torrent_bytes(announce: &str, tiers: Option<&[&str]>, info: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"d8:announce");
    out.extend_from_slice(&bstr(announce));
    if let Some(tiers) = tiers {
        out.extend_from_slice(b"13:announce-listl");
        for url in tiers {
            out.extend_from_slice(b"l");
            out.extend_from_slice(&bstr(url));
            out.extend_from_slice(b"e");
        }
        out.extend_from_slice(b"e");
    }
    out.extend_from_slice(b"4:info");
    out.extend_from_slice(info);
    out.extend_from_slice(b"e");
    out
}

// Splits content into per-piece payloads for a seed; `None` marks pieces
// this seed pretends not to have.
fn seed_pieces(data: &[u8], piece_len: usize, have: impl Fn(usize) -> bool) -> Vec<Option<Vec<u8>>> {
    data.chunks(piece_len)
        .enumerate()
        .map(|(i, c)| if have(i) { Some(c.to_vec()) } else { None })
        .collect()
}

// Minimal HTTP tracker: answers every announce with a fixed bencoded
// response and records the request lines it saw.
async fn spawn_tracker(
    peers: Vec<SocketAddr>,
    failure: Option<&str>,
    requests: Arc<Mutex<Vec<String>>>,
) -> Result<String> {

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let body = match failure {
        Some(reason) => {
            let mut body = b"d14:failure reason".to_vec();
            body.extend_from_slice(&bstr(reason));
            body.extend_from_slice(b"e");
            body
        }
        None => {
            let mut compact = Vec::new();
            for peer in &peers {
                match peer {
                    SocketAddr::V4(v4) => {
                        compact.extend_from_slice(&v4.ip().octets());
                        compact.extend_from_slice(&v4.port().to_be_bytes());
                    }
                    SocketAddr::V6(_) => panic!("stub tracker only handles v4"),
                }
            }
            let mut body = b"d8:intervali1800e".to_vec();
            body.extend_from_slice(format!("5:peers{}:", compact.len()).as_bytes());
            body.extend_from_slice(&compact);
            body.extend_from_slice(b"e");
            body
        }
    };

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            let mut req = Vec::new();
            let mut buf = [0u8; 2048];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        req.extend_from_slice(&buf[..n]);
                        if req.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            requests.lock().unwrap().push(String::from_utf8_lossy(&req).to_string());

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len(),
            );
            sock.write_all(head.as_bytes()).await.ok();
            sock.write_all(&body).await.ok();
            sock.flush().await.ok();
        }
    });

    Ok(format!("http://{}/announce", addr))
}

// Minimal seed: handshake, bitfield, unchoke, then answers requests for the
// pieces it holds.
async fn spawn_seed(info_hash: [u8; 20], pieces: Vec<Option<Vec<u8>>>) -> Result<SocketAddr> {

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let pieces = Arc::new(pieces);

    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else { break };
            let pieces = pieces.clone();
            tokio::spawn(async move {
                serve_peer(sock, info_hash, &pieces).await.ok();
            });
        }
    });

    Ok(addr)
}

async fn serve_peer(
    mut sock: tokio::net::TcpStream,
    info_hash: [u8; 20],
    pieces: &[Option<Vec<u8>>],
) -> Result<()> {

    let mut handshake = [0u8; 68];
    sock.read_exact(&mut handshake).await?;
    assert_eq!(handshake[0], 19);
    assert_eq!(&handshake[28..48], &info_hash);

    // Handshake, bitfield and unchoke in one burst.
    let mut out = Vec::new();
    out.push(19);
    out.extend_from_slice(b"BitTorrent protocol");
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&info_hash);
    out.extend_from_slice(b"-ST0001-000000000000");

    let mut bits = vec![0u8; (pieces.len() + 7) / 8];
    for (i, piece) in pieces.iter().enumerate() {
        if piece.is_some() {
            bits[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out.extend_from_slice(&((1 + bits.len()) as u32).to_be_bytes());
    out.push(5);
    out.extend_from_slice(&bits);

    out.extend_from_slice(&1u32.to_be_bytes());
    out.push(1);
    sock.write_all(&out).await?;

    loop {
        let mut len_buf = [0u8; 4];
        if sock.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }
        let mut body = vec![0u8; len];
        sock.read_exact(&mut body).await?;

        // Only requests need answering.
        if body[0] == 6 {
            let idx = u32::from_be_bytes(body[1..5].try_into()?) as usize;
            let begin = u32::from_be_bytes(body[5..9].try_into()?) as usize;
            let length = u32::from_be_bytes(body[9..13].try_into()?) as usize;

            let Some(Some(piece)) = pieces.get(idx) else { continue };
            let chunk = &piece[begin..begin + length];

            let mut msg = Vec::with_capacity(13 + chunk.len());
            msg.extend_from_slice(&((9 + chunk.len()) as u32).to_be_bytes());
            msg.push(7);
            msg.extend_from_slice(&(idx as u32).to_be_bytes());
            msg.extend_from_slice(&(begin as u32).to_be_bytes());
            msg.extend_from_slice(chunk);
            sock.write_all(&msg).await?;
        }
    }
}

fn test_config(output_dir: std::path::PathBuf) -> TorrentConfig {
    TorrentConfig {
        output_dir,
        ..TorrentConfig::default()
    }
}

// One peer, one 16 KiB piece: the whole pipeline end to end.
#[tokio::test]
async fn test_single_peer_single_piece() -> Result<()> {

    let dir = tempfile::tempdir()?;
    let data: Vec<u8> = (0..16_384usize).map(|i| (i % 251) as u8).collect();

    let info = single_file_info("data.bin", 16_384, &data);
    let hash = info_hash(&info);

    let seed = spawn_seed(hash, seed_pieces(&data, 16_384, |_| true)).await?;
    let requests = Arc::new(Mutex::new(Vec::new()));
    let announce = spawn_tracker(vec![seed], None, requests.clone()).await?;

    let torrent_path = dir.path().join("single.torrent");
    std::fs::write(&torrent_path, torrent_bytes(&announce, None, &info))?;

    let metainfo = MetaInfo::new(&torrent_path)?;
    assert_eq!(metainfo.info_hash(), hash);

    let out = dir.path().join("out");
    let mut torrent = Torrent::new(metainfo, test_config(out.clone()))?;
    time::timeout(TEST_TIMEOUT, torrent.start()).await??;

    assert_eq!(std::fs::read(out.join("data.bin"))?, data);

    let requests = requests.lock().unwrap();
    assert!(requests.iter().any(|r| r.contains("event=started")));
    assert!(requests.iter().any(|r| r.contains("event=completed")));
    Ok(())
}

// A piece spanning two files is split across them at the right offsets.
#[tokio::test]
async fn test_multi_file_span() -> Result<()> {

    let dir = tempfile::tempdir()?;
    let data: Vec<u8> = (0..16u8).collect();

    let info = multi_file_info("multi", 16, &[("a.bin", 10), ("b.bin", 6)], &data);
    let hash = info_hash(&info);

    let seed = spawn_seed(hash, seed_pieces(&data, 16, |_| true)).await?;
    let requests = Arc::new(Mutex::new(Vec::new()));
    let announce = spawn_tracker(vec![seed], None, requests.clone()).await?;

    let torrent_path = dir.path().join("multi.torrent");
    std::fs::write(&torrent_path, torrent_bytes(&announce, None, &info))?;

    let metainfo = MetaInfo::new(&torrent_path)?;
    assert!(metainfo.is_multi_file());

    let out = dir.path().join("out");
    let mut torrent = Torrent::new(metainfo, test_config(out.clone()))?;
    time::timeout(TEST_TIMEOUT, torrent.start()).await??;

    assert_eq!(std::fs::read(out.join("multi").join("a.bin"))?, data[..10]);
    assert_eq!(std::fs::read(out.join("multi").join("b.bin"))?, data[10..]);
    Ok(())
}

// The first tracker only fails; the second one serves two seeds, each
// holding half the torrent, and the download still completes.
#[tokio::test]
async fn test_tracker_rotation() -> Result<()> {

    let dir = tempfile::tempdir()?;
    let piece_len = 16_384;
    let data: Vec<u8> = (0..2 * piece_len).map(|i| (i % 239) as u8).collect();

    let info = single_file_info("rotate.bin", piece_len, &data);
    let hash = info_hash(&info);

    let seed_a = spawn_seed(hash, seed_pieces(&data, piece_len, |i| i == 0)).await?;
    let seed_b = spawn_seed(hash, seed_pieces(&data, piece_len, |i| i == 1)).await?;

    let failing_reqs = Arc::new(Mutex::new(Vec::new()));
    let good_reqs = Arc::new(Mutex::new(Vec::new()));
    let failing = spawn_tracker(vec![], Some("down for maintenance"), failing_reqs.clone()).await?;
    let good = spawn_tracker(vec![seed_a, seed_b], None, good_reqs.clone()).await?;

    let torrent_path = dir.path().join("rotate.torrent");
    let tiers = [failing.as_str(), good.as_str()];
    std::fs::write(&torrent_path, torrent_bytes(&failing, Some(&tiers), &info))?;

    let metainfo = MetaInfo::new(&torrent_path)?;
    assert_eq!(metainfo.announce_urls().len(), 2);

    let out = dir.path().join("out");
    let mut torrent = Torrent::new(metainfo, test_config(out.clone()))?;
    time::timeout(TEST_TIMEOUT, torrent.start()).await??;

    assert_eq!(std::fs::read(out.join("rotate.bin"))?, data);
    // Both trackers were consulted; only the second kept answering.
    assert!(!failing_reqs.lock().unwrap().is_empty());
    assert!(!good_reqs.lock().unwrap().is_empty());
    Ok(())
}

// A complete on-disk copy resumes straight to done: no peers contacted,
// completed announce sent, files untouched.
#[tokio::test]
async fn test_resume_idempotence() -> Result<()> {

    let dir = tempfile::tempdir()?;
    let data: Vec<u8> = (0..40_000usize).map(|i| (i % 241) as u8).collect();

    let info = single_file_info("resume.bin", 16_384, &data);
    let hash = info_hash(&info);

    // No peers on offer; resume has to carry the whole thing.
    let requests = Arc::new(Mutex::new(Vec::new()));
    let announce = spawn_tracker(vec![], None, requests.clone()).await?;

    let torrent_path = dir.path().join("resume.torrent");
    std::fs::write(&torrent_path, torrent_bytes(&announce, None, &info))?;

    let out = dir.path().join("out");
    std::fs::create_dir_all(&out)?;
    std::fs::write(out.join("resume.bin"), &data)?;

    let metainfo = MetaInfo::new(&torrent_path)?;
    assert_eq!(metainfo.info_hash(), hash);

    let mut torrent = Torrent::new(metainfo, test_config(out.clone()))?;
    time::timeout(TEST_TIMEOUT, torrent.start()).await??;

    assert_eq!(std::fs::read(out.join("resume.bin"))?, data);
    let requests = requests.lock().unwrap();
    assert!(requests.iter().any(|r| r.contains("event=completed")));
    assert!(requests.iter().any(|r| r.contains("left=0")));
    Ok(())
}
