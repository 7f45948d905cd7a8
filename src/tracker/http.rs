use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use super::{Event, Result, TrackerError, DEFAULT_ANNOUNCE_INTERVAL};

#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {

    // Hash of the info dict.
    pub info_hash: [u8; 20],

    // 20-byte id identifying this client to the swarm.
    pub client_id: [u8; 20],

    // Port this client reports to the swarm.
    pub port: u16,

    // Total bytes uploaded so far, in base ten ASCII.
    pub uploaded: u64,

    // Total bytes of verified content downloaded so far, in base ten ASCII.
    pub downloaded: u64,

    // Bytes still needed for a complete torrent, in base ten ASCII.
    pub left: u64,

    // One of started, completed, stopped; absent for the regular
    // interval announces.
    pub event: Option<Event>,

}

// Makes a GET announce to the tracker and decodes the bencoded response.
// A response carrying a failure reason is an error.
pub async fn announce(client: &reqwest::Client, url: &Url, params: &AnnounceParams) -> Result<AnnounceResponse> {

    let mut url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        url.as_str(),
        urlencoding::encode_binary(&params.info_hash),
        urlencoding::encode_binary(&params.client_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    if let Some(event) = params.event {
        url.push_str(&format!("&event={}", event));
    }
    tracing::debug!("announce url: {}", url);

    let raw_resp = client
        .get(url)
        .send()
        .await?
        .bytes()
        .await?;

    let resp: AnnounceResponse = serde_bencode::from_bytes(&raw_resp)?;
    tracing::debug!("announce response: {:#?}", resp);

    if let Some(failure) = resp.failure_reason {
        return Err(TrackerError::Failure(failure));
    }
    if let Some(warning) = &resp.warning_message {
        tracing::warn!("tracker warning: {}", warning);
    }

    Ok(resp)
}

#[derive(Deserialize, Debug, Default)]
pub struct AnnounceResponse {

    // If present, then no other keys may be present.
    // The value is a human-readable error message as to why the request failed.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    // Similar to failure reason, but the response still gets processed normally.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    // Interval in seconds that the client should wait between sending regular
    // requests to the tracker.
    pub interval: Option<u64>,

    // Minimum announce interval. If present clients must not reannounce more
    // frequently than this.
    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,

    // Number of peers with the entire file, i.e. seeders.
    pub complete: Option<u64>,

    // Number of non-seeder peers, aka "leechers".
    pub incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    // The effective re-announce interval; a min interval wins over a
    // longer regular one.
    pub fn interval(&self) -> Duration {
        let default = DEFAULT_ANNOUNCE_INTERVAL.as_secs();
        let interval = self.interval.unwrap_or(default);
        let min_interval = self.min_interval.unwrap_or(interval);
        Duration::from_secs(interval.min(min_interval))
    }
}

// The tracker can either return a dictionary model or a compacted string.
// This is based on the value of the "compact" parameter.
// However, even if we request a compacted string, the tracker can still
// return a dictionary model.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // String model.
        // Each peer is 6 bytes: 4 for the IP address, 2 for the port number.
        // All in network (big-endian) byte order.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {

            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(
                    SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                        v.get_u16(),
                    )
                )
            }

            Ok(peers)
        }

        // Dictionary model.
        // The dictionary model is a list of dictionaries, each with the keys
        // "ip" and "port".
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => continue,
                }
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}
