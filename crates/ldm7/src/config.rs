//! Session configuration.

use pq::FeedType;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default LDM service port.
pub const DEFAULT_PORT: u16 = 388;

/// Upstream (sending) side configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// TCP listen address for subscriptions and backstop requests.
    pub bind: SocketAddr,
    /// Feed this server multicasts.
    pub feed: FeedType,
    /// Product queue backing file.
    pub pq_path: PathBuf,
    /// Product-index map backing file.
    pub index_map_path: PathBuf,
    /// Multicast group literal handed to subscribers ("addr:port").
    pub group: String,
    /// FMTP server endpoint literal handed to subscribers.
    pub fmtp_endpoint: String,
    /// Retransmission timeout the transport enforces.
    pub retx_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            feed: FeedType::ANY,
            pq_path: PathBuf::from("ldm.pq"),
            index_map_path: PathBuf::from("ldm.pim"),
            group: "233.0.1.9:38800".into(),
            fmtp_endpoint: "0.0.0.0:38800".into(),
            retx_timeout: Duration::from_secs(60),
        }
    }
}

/// Deterministic backstop exercise: delete a seeded fraction of freshly
/// received products and re-request them by index, indistinguishable from
/// true multicast loss.
#[derive(Debug, Clone, Copy)]
pub struct BackstopTest {
    /// Fraction of products to delete, in [0, 1].
    pub request_rate: f64,
    /// RNG seed for the deletion schedule.
    pub seed: u64,
}

/// Downstream (receiving) side configuration.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    /// Upstream server address.
    pub upstream: SocketAddr,
    /// Identity of the upstream peer, used for session-memory naming.
    pub peer_id: String,
    /// Feed to subscribe to.
    pub feed: FeedType,
    /// Receiver product queue backing file.
    pub pq_path: PathBuf,
    pub pq_slots: u64,
    pub pq_bytes: u64,
    /// Directory for per-(peer, feed) session memory files.
    pub memory_dir: PathBuf,
    /// Nap between session attempts; interruptible by shutdown.
    pub restart_nap: Duration,
    /// Interval between connection-liveness probes.
    pub probe_interval: Duration,
    /// Maximum queue residence time; bounds the backlog time-offset.
    pub max_residence: Duration,
    /// Optional deterministic backstop exercise.
    pub backstop_test: Option<BackstopTest>,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        DownstreamConfig {
            upstream: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            peer_id: "upstream".into(),
            feed: FeedType::ANY,
            pq_path: PathBuf::from("ldm-rcv.pq"),
            pq_slots: 1024,
            pq_bytes: 64 << 20,
            memory_dir: PathBuf::from("."),
            restart_nap: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
            max_residence: Duration::from_secs(3600),
            backstop_test: None,
        }
    }
}
