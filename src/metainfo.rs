use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;
use crate::store::FileInfo;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid pieces length, must be non-empty and divisible by 20")]
    InvalidPiecesLength,

    #[error("piece length and total length are inconsistent")]
    InvalidLength,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    pub path: Vec<String>,

    pub length: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // Single-file: the file name. Multi-file: the content directory name.
    pub name: String,

    // Concatenation of all 20-byte SHA-1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // Length of the file in bytes, present for single-file torrents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    // A list of dictionaries, one per file, present for multi-file torrents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // If set to 1, peers may only be obtained via the trackers in the
    // metainfo, never through DHT or peer exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

    #[serde(default, rename = "root hash", skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,

}

impl Info {
    // SHA-1 over the canonical bencoding of the info dictionary; identifies
    // the torrent on the network.
    fn info_hash(&self) -> Result<[u8; 20], MetaInfoError> {
        let info_data = serde_bencode::to_bytes(&self)?;
        Ok(Sha1::digest(info_data).into())
    }
}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

    // The announce URL of the tracker.
    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: Url,

    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,

    // SHA-1 hash of the info dict.
    #[serde(skip)]
    info_hash: [u8; 20],

    // (optional) the string encoding format used to generate the pieces part
    // of the info dictionary.
    #[serde(default)]
    pub encoding: Option<String>,

    // (optional) tiers of announce URLs, used in preference to `announce`.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<Url>>>,

    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    // (optional) free-form textual comments of the author.
    #[serde(default)]
    pub comment: Option<String>,

    // (optional) name and version of the program used to create the .torrent.
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(&std::fs::read(path)?)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        metainfo.validate_lengths()?;

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    // The piece grid must tile the content exactly: the last piece holds
    // between 1 and piece_length bytes.
    fn validate_lengths(&self) -> Result<(), MetaInfoError> {
        if let Some(files) = &self.info.files {
            if files.iter().any(|f| f.length == 0) {
                return Err(MetaInfoError::FileNoSize);
            }
            if files.iter().any(|f| f.path.is_empty() || f.path.iter().any(|p| p.is_empty())) {
                return Err(MetaInfoError::FileEmptyPath);
            }
        }

        let total = self.total_len();
        let piece_len = self.info.piece_length as u64;
        let num_pieces = self.num_pieces() as u64;
        if piece_len == 0
            || total == 0
            || total <= piece_len * (num_pieces - 1)
            || total > piece_len * num_pieces
        {
            return Err(MetaInfoError::InvalidLength);
        }
        Ok(())
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as we have already checked length is a multiple of 20, in new.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Announce URLs in tier order, deduplicated, for round-robin use.
    pub fn announce_urls(&self) -> Vec<Url> {
        let mut urls: Vec<Url> = Vec::new();
        if let Some(tiers) = &self.announce_list {
            for url in tiers.iter().flatten() {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        } else {
            urls.push(self.announce.clone());
        }
        urls
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let file_info = FileInfo {
                    path: f.path.iter().collect(),
                    length: f.length as usize,
                    offset,
                };
                offset += f.length as usize;
                file_info
            }).collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0) as usize,
                offset: 0,
            }]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if size <= 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = next;
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            // Change urls to strings for printing.
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v|
                        v.as_str()
                    ).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("md5sum", &self.md5sum)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .field("root_hash", &self.root_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::io::Write;

    // Builds a minimal single-file .torrent on disk and returns its path
    // along with the raw info dictionary bytes.
    fn write_torrent(dir: &std::path::Path, piece_len: u32, data: &[u8]) -> (std::path::PathBuf, Vec<u8>) {
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }

        let mut info = Vec::new();
        info.extend_from_slice(format!("d6:lengthi{}e4:name8:data.bin12:piece lengthi{}e6:pieces{}:", data.len(), piece_len, pieces.len()).as_bytes());
        info.extend_from_slice(&pieces);
        info.extend_from_slice(b"e");

        let mut torrent = Vec::new();
        torrent.extend_from_slice(b"d8:announce27:http://127.0.0.1:1/announce4:info");
        torrent.extend_from_slice(&info);
        torrent.extend_from_slice(b"e");

        let path = dir.join("test.torrent");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&torrent).unwrap();
        (path, info)
    }

    #[test]
    fn test_metainfo_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![3u8; 40_000];
        let (path, info) = write_torrent(dir.path(), 16_384, &data);

        let metainfo = MetaInfo::new(&path).unwrap();
        assert_eq!(metainfo.num_pieces(), 3);
        assert_eq!(metainfo.piece_len(), 16_384);
        assert_eq!(metainfo.total_len(), 40_000);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.name(), "data.bin");
        assert_eq!(metainfo.announce_urls().len(), 1);

        // The canonical re-encoding of the info dict must reproduce its
        // on-disk bytes, so the info hash matches other clients.
        let expected: [u8; 20] = Sha1::digest(&info).into();
        assert_eq!(metainfo.info_hash(), expected);
        assert_eq!(metainfo.info_hash(), hex!("5f909fef609af3d08102df67733a233ea5de2e4e"));
        assert_eq!(metainfo.info_hash_hex(), "5f909fef609af3d08102df67733a233ea5de2e4e");

        let files = metainfo.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].length, 40_000);
        assert_eq!(files[0].offset, 0);
    }

    #[test]
    fn test_metainfo_rejects_bad_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.torrent");
        // pieces is 19 bytes, not a multiple of 20.
        std::fs::write(
            &path,
            b"d8:announce27:http://127.0.0.1:1/announce4:infod6:lengthi100e4:name1:a12:piece lengthi100e6:pieces19:0000000000000000000ee",
        )
        .unwrap();
        assert!(matches!(MetaInfo::new(&path), Err(MetaInfoError::InvalidPiecesLength)));
    }

    #[test]
    fn test_metainfo_rejects_extension() {
        assert!(matches!(MetaInfo::new("foo.txt"), Err(MetaInfoError::InvalidExtension)));
    }

    #[test]
    fn test_metainfo_rejects_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.torrent");
        // One piece hash for two pieces worth of data.
        std::fs::write(
            &path,
            b"d8:announce27:http://127.0.0.1:1/announce4:infod6:lengthi300e4:name1:a12:piece lengthi100e6:pieces20:00000000000000000000ee",
        )
        .unwrap();
        assert!(matches!(MetaInfo::new(&path), Err(MetaInfoError::InvalidLength)));
    }
}
