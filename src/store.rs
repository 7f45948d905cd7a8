use std::{ops::Range, path::PathBuf};
use crate::metainfo::MetaInfo;

// A file contained in the torrent.
#[derive(Debug, Clone)]
pub struct FileInfo {

    // Path relative to the output directory.
    pub path: PathBuf,

    // Length of the file in bytes.
    pub length: usize,

    // Offset in bytes from the start of the torrent when viewed as a single
    // contiguous byte array.
    pub offset: usize,

}

impl FileInfo {
    // Half-open byte range the file occupies within the torrent.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }
}

// General information on torrent storage layout.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of the torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, in (0, piece_len].
    pub last_piece_len: usize,

    // Number of pieces in the torrent.
    pub num_pieces: usize,

    // Files contained in the torrent, ordered by offset.
    pub files: Vec<FileInfo>,

    // Directory the downloaded files are placed in.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let files = metainfo.files();
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir,
        }
    }

    // Returns the length of a piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> usize {
        idx * self.piece_len
    }

    // Maps an absolute torrent offset to (file index, offset within file).
    pub fn locate(&self, offset: usize) -> Option<(usize, usize)> {
        if offset >= self.total_len as usize {
            return None;
        }
        let idx = self.files.partition_point(|f| f.byte_range().end <= offset);
        Some((idx, offset - self.files[idx].offset))
    }

    // Indices of the files a piece intersects.
    pub fn piece_file_range(&self, idx: usize) -> Range<usize> {
        debug_assert!(idx < self.num_pieces, "piece index out of bounds");
        let start = self.piece_offset(idx);
        let end = start + self.piece_length(idx);
        let first = self.files.partition_point(|f| f.byte_range().end <= start);
        let last = self.files.partition_point(|f| f.offset < end);
        first..last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(file_lens: &[usize], piece_len: usize) -> StoreInfo {
        let mut offset = 0;
        let files = file_lens
            .iter()
            .enumerate()
            .map(|(i, &length)| {
                let file = FileInfo { path: format!("file_{}", i).into(), length, offset };
                offset += length;
                file
            })
            .collect::<Vec<_>>();

        let total_len = offset as u64;
        let num_pieces = (offset + piece_len - 1) / piece_len;
        StoreInfo {
            total_len,
            piece_len,
            last_piece_len: offset - piece_len * (num_pieces - 1),
            num_pieces,
            files,
            output_dir: "downloads".into(),
        }
    }

    #[test]
    fn test_locate() {
        let info = store(&[10, 6, 20], 16);
        assert_eq!(info.locate(0), Some((0, 0)));
        assert_eq!(info.locate(9), Some((0, 9)));
        assert_eq!(info.locate(10), Some((1, 0)));
        assert_eq!(info.locate(15), Some((1, 5)));
        assert_eq!(info.locate(16), Some((2, 0)));
        assert_eq!(info.locate(35), Some((2, 19)));
        assert_eq!(info.locate(36), None);
    }

    #[test]
    fn test_piece_file_range() {
        let info = store(&[10, 6, 20], 16);
        // Piece 0 covers bytes 0..16: spans the first two files.
        assert_eq!(info.piece_file_range(0), 0..2);
        // Piece 1 covers bytes 16..32: contained in the third file.
        assert_eq!(info.piece_file_range(1), 2..3);
        // Last piece covers bytes 32..36.
        assert_eq!(info.piece_length(2), 4);
        assert_eq!(info.piece_file_range(2), 2..3);
    }

    #[test]
    fn test_single_file_spans() {
        let info = store(&[100], 32);
        assert_eq!(info.num_pieces, 4);
        assert_eq!(info.last_piece_len, 4);
        for idx in 0..info.num_pieces {
            assert_eq!(info.piece_file_range(idx), 0..1);
        }
    }
}
