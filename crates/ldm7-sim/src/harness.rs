//! Shared pairing plumbing: one upstream, any number of downstream
//! sessions, all over loopback TCP and the in-process multicast channel.

use async_trait::async_trait;
use ldm7::{
    Acl, BackstopTest, ChannelTransport, DownstreamConfig, DownstreamLdm7, HaltFlag, McastInfo,
    McastJoiner, McastReceiver, McastSender, UpstreamConfig, UpstreamLdm7,
};
use pq::{FeedType, Pq};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

/// Joiner backed by the in-process transport.
pub struct SimJoiner {
    transport: ChannelTransport,
}

#[async_trait]
impl McastJoiner for SimJoiner {
    async fn join(&self, _info: &McastInfo) -> ldm7::Result<Box<dyn McastReceiver>> {
        Ok(Box::new(self.transport.subscribe()))
    }
}

/// A running upstream plus the fixtures a downstream needs to pair with it.
pub struct Pair {
    pub dir: tempfile::TempDir,
    pub transport: ChannelTransport,
    pub sender_pq: Arc<Pq>,
    pub receiver_pq_path: PathBuf,
    pub memory_dir: PathBuf,
    pub upstream_addr: std::net::SocketAddr,
    pub halt: HaltFlag,
}

/// Sender-side queue geometry used by the scenarios.
pub const SENDER_SLOTS: u64 = 100;
pub const SENDER_BYTES: u64 = 16 << 20;

impl Pair {
    /// Starts an upstream over a fresh queue.
    pub async fn start() -> Pair {
        Self::start_with(|transport| Arc::new(transport) as Arc<dyn McastSender>).await
    }

    /// Starts an upstream whose multicast sender is derived from the
    /// pair's channel transport, e.g. wrapped in a loss injector.
    pub async fn start_with<F>(wrap: F) -> Pair
    where
        F: FnOnce(ChannelTransport) -> Arc<dyn McastSender>,
    {
        let dir = tempfile::tempdir().expect("simulation tempdir");
        let transport = ChannelTransport::new(1400);
        let up_cfg = UpstreamConfig {
            pq_path: dir.path().join("snd.pq"),
            index_map_path: dir.path().join("snd.pim"),
            feed: FeedType::ANY,
            ..UpstreamConfig::default()
        };
        let sender_pq = Arc::new(
            Pq::create(&up_cfg.pq_path, SENDER_SLOTS, SENDER_BYTES, 0o600)
                .expect("sender queue"),
        );
        let mcast: Arc<dyn McastSender> = wrap(transport.clone());
        let upstream = Arc::new(
            UpstreamLdm7::new(
                up_cfg,
                Arc::clone(&sender_pq),
                Arc::new(Acl::allow_all()),
                mcast,
            )
            .expect("upstream"),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let upstream_addr = listener.local_addr().expect("local addr");
        let halt = HaltFlag::new();
        tokio::spawn({
            let halt = halt.clone();
            async move { upstream.serve_with(listener, halt).await }
        });

        Pair {
            receiver_pq_path: dir.path().join("rcv.pq"),
            memory_dir: dir.path().join("mem"),
            dir,
            transport,
            sender_pq,
            upstream_addr,
            halt,
        }
    }

    /// Downstream configuration pointed at this upstream.
    pub fn downstream_config(&self, backstop: Option<BackstopTest>) -> DownstreamConfig {
        DownstreamConfig {
            upstream: self.upstream_addr,
            peer_id: "sim-upstream".into(),
            feed: FeedType::ANY,
            pq_path: self.receiver_pq_path.clone(),
            pq_slots: 256,
            pq_bytes: 32 << 20,
            memory_dir: self.memory_dir.clone(),
            restart_nap: Duration::from_millis(100),
            probe_interval: Duration::from_secs(60),
            max_residence: Duration::from_secs(3600),
            backstop_test: backstop,
        }
    }

    /// Builds a downstream joined to this pair's transport.
    pub fn downstream(&self, backstop: Option<BackstopTest>) -> Arc<DownstreamLdm7> {
        Arc::new(DownstreamLdm7::new(
            self.downstream_config(backstop),
            Arc::new(SimJoiner {
                transport: self.transport.clone(),
            }),
        ))
    }
}

/// Polls `probe` until it holds or the deadline passes.
pub async fn wait_until(
    what: &str,
    deadline: Duration,
    mut probe: impl FnMut() -> bool,
) -> Result<(), String> {
    timeout(deadline, async {
        while !probe() {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .map_err(|_| format!("timed out waiting for {what}"))
}
