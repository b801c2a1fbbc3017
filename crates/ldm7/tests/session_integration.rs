//! End-to-end upstream/downstream sessions over loopback TCP with the
//! in-process multicast transport.

use async_trait::async_trait;
use ldm7::{
    Acl, BackstopTest, ChannelTransport, DownstreamConfig, DownstreamLdm7, HaltFlag, McastInfo,
    McastJoiner, McastReceiver, UpstreamConfig, UpstreamLdm7,
};
use pq::{DataProduct, FeedType, OpenMode, Pq};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

struct TestJoiner {
    transport: ChannelTransport,
}

#[async_trait]
impl McastJoiner for TestJoiner {
    async fn join(&self, _info: &McastInfo) -> ldm7::Result<Box<dyn McastReceiver>> {
        Ok(Box::new(self.transport.subscribe()))
    }
}

fn product(n: u32, size: usize) -> DataProduct {
    let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
    DataProduct::new("sender.host", FeedType::EXP, n, format!("e2e {n}"), data)
}

struct Harness {
    _dir: tempfile::TempDir,
    sender_pq: Arc<Pq>,
    receiver_pq_path: std::path::PathBuf,
    downstream: Arc<DownstreamLdm7>,
    halt: HaltFlag,
}

async fn start_pair(backstop: Option<BackstopTest>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mcast = ChannelTransport::new(1400);

    let up_cfg = UpstreamConfig {
        pq_path: dir.path().join("snd.pq"),
        index_map_path: dir.path().join("snd.pim"),
        feed: FeedType::ANY,
        ..UpstreamConfig::default()
    };
    let sender_pq = Arc::new(Pq::create(&up_cfg.pq_path, 100, 1 << 20, 0o600).unwrap());
    let upstream = Arc::new(
        UpstreamLdm7::new(
            up_cfg,
            Arc::clone(&sender_pq),
            Arc::new(Acl::allow_all()),
            Arc::new(mcast.clone()),
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let halt = HaltFlag::new();
    tokio::spawn({
        let halt = halt.clone();
        async move { upstream.serve_with(listener, halt).await }
    });

    let receiver_pq_path = dir.path().join("rcv.pq");
    let down_cfg = DownstreamConfig {
        upstream: addr,
        peer_id: "test-upstream".into(),
        feed: FeedType::ANY,
        pq_path: receiver_pq_path.clone(),
        pq_slots: 256,
        pq_bytes: 32 << 20,
        memory_dir: dir.path().join("mem"),
        restart_nap: Duration::from_millis(100),
        probe_interval: Duration::from_secs(60),
        max_residence: Duration::from_secs(3600),
        backstop_test: backstop,
    };
    let joiner = Arc::new(TestJoiner { transport: mcast });
    let downstream = Arc::new(DownstreamLdm7::new(down_cfg, joiner));
    tokio::spawn({
        let downstream = Arc::clone(&downstream);
        let halt = halt.clone();
        async move { downstream.run(halt).await }
    });

    Harness {
        _dir: dir,
        sender_pq,
        receiver_pq_path,
        downstream,
        halt,
    }
}

async fn wait_for(mut probe: impl FnMut() -> bool, what: &str) {
    timeout(Duration::from_secs(20), async {
        while !probe() {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_product_round_trip() {
    let h = start_pair(None).await;
    let stats = h.downstream.stats();

    // Give the subscription a moment, then publish.
    sleep(Duration::from_millis(200)).await;
    let p = product(0, 100_000);
    h.sender_pq.insert(&p).unwrap();

    wait_for(
        || stats.mcast_products.load(Ordering::Relaxed) == 1,
        "multicast delivery",
    )
    .await;

    let rcv = Pq::open(&h.receiver_pq_path, OpenMode::ReadOnly).unwrap();
    let got = rcv.find_by_signature(&p.info.signature).unwrap().unwrap();
    assert_eq!(got.info, p.info);
    assert_eq!(got.data, p.data);
    assert_eq!(rcv.stats().unwrap().n_products, 1);

    h.halt.trigger();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backstop_recovers_deleted_products() {
    let h = start_pair(Some(BackstopTest {
        request_rate: 0.5,
        seed: 0x5EED_1234,
    }))
    .await;
    let stats = h.downstream.stats();

    sleep(Duration::from_millis(200)).await;
    let prods: Vec<_> = (0..20).map(|n| product(n, 10_000)).collect();
    for p in &prods {
        h.sender_pq.insert(p).unwrap();
        sleep(Duration::from_millis(10)).await;
    }

    wait_for(
        || stats.mcast_products.load(Ordering::Relaxed) == 20,
        "all multicast deliveries",
    )
    .await;
    // The deletion for the final product happens just after its commit is
    // counted; give the schedule a moment to settle.
    sleep(Duration::from_millis(200)).await;
    let deleted = stats.deleted_for_test.load(Ordering::Relaxed);
    assert!(deleted > 0, "the seeded schedule must delete something");

    wait_for(
        || stats.backstop_products.load(Ordering::Relaxed) == deleted,
        "backstop recovery",
    )
    .await;

    let rcv = Pq::open(&h.receiver_pq_path, OpenMode::ReadOnly).unwrap();
    assert_eq!(rcv.stats().unwrap().n_products, 20);
    for p in &prods {
        let got = rcv.find_by_signature(&p.info.signature).unwrap().unwrap();
        assert_eq!(got.data, p.data);
    }

    h.halt.trigger();
}
