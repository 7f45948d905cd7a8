use std::path::PathBuf;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    // Unique 20-byte identifier for this client.
    pub client_id: [u8; 20],

    // Port reported to trackers in announces.
    pub port: u16,

    // Maximum number of concurrent peer sessions.
    pub max_peers: usize,

    // Path where the torrent will write files.
    pub output_dir: PathBuf,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: gen_client_id(),
            port: 6881,
            max_peers: 50,
            output_dir: PathBuf::from("downloads"),
        }
    }
}

// Azureus-style client id: fixed prefix followed by random digits.
pub fn gen_client_id() -> [u8; 20] {
    let mut id = *b"-OP0100-000000000000";
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}
