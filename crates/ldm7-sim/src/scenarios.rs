//! The end-to-end conformance scenarios.
//!
//! Each scenario builds its own runtime and fixtures, drives a full
//! sender/receiver pairing (or the queue alone), and returns a failure
//! description instead of panicking so the harness can count outcomes.

use crate::harness::{wait_until, Pair};
use crate::loss::{expected_deletions, seed_from_triple, LossyTransport};
use ldm7::{BackstopTest, HaltFlag, SessionMemory};
use noaaport::frames::{CAT_TEXT, STREAM_NWSTG};
use pq::{
    CursorMode, DataProduct, FeedType, Inserted, OpenMode, Pq, PqError, ProductClass, Seq,
};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// One runnable scenario.
pub struct Scenario {
    pub name: &'static str,
    pub run: fn() -> Result<(), String>,
}

/// Every scenario, in documentation order.
pub fn all() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "single-product-round-trip",
            run: || block_on(single_product_round_trip()),
        },
        Scenario {
            name: "loss-and-backstop",
            run: || block_on(loss_and_backstop()),
        },
        Scenario {
            name: "restart-with-backlog",
            run: || block_on(restart_with_backlog()),
        },
        Scenario {
            name: "eviction",
            run: eviction,
        },
        Scenario {
            name: "frame-assembler-loss",
            run: || block_on(frame_assembler_loss()),
        },
        Scenario {
            name: "duplicate-delivery-noop",
            run: duplicate_delivery_noop,
        },
    ]
}

fn block_on<F: std::future::Future<Output = Result<(), String>>>(f: F) -> Result<(), String> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .map_err(|e| format!("runtime: {e}"))?
        .block_on(f)
}

fn check(cond: bool, msg: impl Into<String>) -> Result<(), String> {
    if cond {
        Ok(())
    } else {
        Err(msg.into())
    }
}

fn product(seqno: u32, size: usize) -> DataProduct {
    let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
    DataProduct::new(
        "sim-sender.example.net",
        FeedType::EXP,
        seqno,
        format!("SIM PRODUCT {seqno}"),
        data,
    )
}

/// Distinct payloads per product (the uniform ramp would make them all
/// duplicates of each other).
fn distinct_product(seqno: u32, size: usize) -> DataProduct {
    let data: Vec<u8> = (0..size)
        .map(|i| ((i + seqno as usize * 31) % 256) as u8)
        .collect();
    DataProduct::new(
        "sim-sender.example.net",
        FeedType::EXP,
        seqno,
        format!("SIM PRODUCT {seqno}"),
        data,
    )
}

// -----------------------------------------------------------------------------
// 1. Single product round-trip.
// -----------------------------------------------------------------------------
async fn single_product_round_trip() -> Result<(), String> {
    let pair = Pair::start().await;
    let down = pair.downstream(None);
    let stats = down.stats();
    let halt = HaltFlag::new();
    tokio::spawn({
        let down = Arc::clone(&down);
        let halt = halt.clone();
        async move { down.run(halt).await }
    });

    wait_until("subscription", Duration::from_secs(10), || {
        pair.transport.subscriber_count() >= 1
    })
    .await?;

    let p1 = product(0, 100_000);
    pair.sender_pq
        .insert(&p1)
        .map_err(|e| format!("insert: {e}"))?;

    wait_until("multicast delivery", Duration::from_secs(20), || {
        stats.mcast_products.load(Ordering::Relaxed) == 1
    })
    .await?;

    let rcv = Pq::open(&pair.receiver_pq_path, OpenMode::ReadOnly)
        .map_err(|e| format!("open receiver queue: {e}"))?;
    let got = rcv
        .find_by_signature(&p1.info.signature)
        .map_err(|e| format!("lookup: {e}"))?
        .ok_or("product missing from receiver queue")?;
    check(got.info == p1.info, "metadata differs across the transfer")?;
    check(got.data == p1.data, "payload differs across the transfer")?;
    check(
        rcv.stats().map_err(|e| e.to_string())?.n_products == 1,
        "receiver queue should hold exactly one product",
    )?;

    halt.trigger();
    pair.halt.trigger();
    Ok(())
}

// -----------------------------------------------------------------------------
// 2. Loss plus backstop at a seeded request rate.
// -----------------------------------------------------------------------------
async fn loss_and_backstop() -> Result<(), String> {
    let seed = seed_from_triple(1_234_567_890, 9_876_543_210, 1_029_384_756);
    let rate = 0.1;
    let pair = Pair::start().await;
    let down = pair.downstream(Some(BackstopTest {
        request_rate: rate,
        seed,
    }));
    let stats = down.stats();
    let halt = HaltFlag::new();
    tokio::spawn({
        let down = Arc::clone(&down);
        let halt = halt.clone();
        async move { down.run(halt).await }
    });

    wait_until("subscription", Duration::from_secs(10), || {
        pair.transport.subscriber_count() >= 1
    })
    .await?;

    let prods: Vec<_> = (0..100).map(|n| distinct_product(n, 100_000)).collect();
    for p in &prods {
        pair.sender_pq.insert(p).map_err(|e| format!("insert: {e}"))?;
        sleep(Duration::from_millis(10)).await;
    }

    wait_until("all multicast deliveries", Duration::from_secs(60), || {
        stats.mcast_products.load(Ordering::Relaxed) == 100
    })
    .await?;

    let expected = expected_deletions(seed, rate, 100);
    check(expected > 0, "seeded schedule should delete at least one")?;
    wait_until("deletion schedule", Duration::from_secs(10), || {
        stats.deleted_for_test.load(Ordering::Relaxed) == expected
    })
    .await
    .map_err(|_| {
        format!(
            "deletion schedule diverged: {} observed, {expected} expected",
            stats.deleted_for_test.load(Ordering::Relaxed)
        )
    })?;

    wait_until("backstop recovery", Duration::from_secs(60), || {
        stats.backstop_products.load(Ordering::Relaxed) == expected
    })
    .await?;

    let rcv = Pq::open(&pair.receiver_pq_path, OpenMode::ReadOnly)
        .map_err(|e| format!("open receiver queue: {e}"))?;
    check(
        rcv.stats().map_err(|e| e.to_string())?.n_products == 100,
        "receiver queue should hold all 100 products",
    )?;
    for p in &prods {
        let got = rcv
            .find_by_signature(&p.info.signature)
            .map_err(|e| format!("lookup: {e}"))?;
        check(
            got.is_some_and(|g| g.data == p.data),
            format!("product {} missing or damaged", p.info.seqno),
        )?;
    }

    halt.trigger();
    pair.halt.trigger();
    Ok(())
}

// -----------------------------------------------------------------------------
// 3. Restart with backlog.
// -----------------------------------------------------------------------------
async fn restart_with_backlog() -> Result<(), String> {
    let pair = Pair::start().await;
    let prods: Vec<_> = (1..=51).map(|n| distinct_product(n, 20_000)).collect();

    // First session: products 1..=25.
    let d1 = pair.downstream(None);
    let s1_stats = d1.stats();
    let h1 = HaltFlag::new();
    let s1 = tokio::spawn({
        let d1 = Arc::clone(&d1);
        let h1 = h1.clone();
        async move { d1.run_session(&h1).await }
    });
    wait_until("first subscription", Duration::from_secs(10), || {
        pair.transport.subscriber_count() >= 1
    })
    .await?;
    for p in &prods[..25] {
        pair.sender_pq.insert(p).map_err(|e| format!("insert: {e}"))?;
        sleep(Duration::from_millis(5)).await;
    }
    wait_until("first 25 deliveries", Duration::from_secs(30), || {
        s1_stats.mcast_products.load(Ordering::Relaxed) == 25
    })
    .await?;
    h1.trigger();
    let _ = s1.await;

    // Session memory must point at product 25.
    let mem = SessionMemory::open(&pair.memory_dir, "sim-upstream", FeedType::ANY)
        .map_err(|e| format!("session memory: {e}"))?;
    check(
        mem.last_mcast() == Some(prods[24].info.signature),
        "session memory should record product 25 at restart",
    )?;
    drop(mem);

    // Receiver is down; products 26..=50 go out unheard.
    for p in &prods[25..50] {
        pair.sender_pq.insert(p).map_err(|e| format!("insert: {e}"))?;
    }
    wait_until("old subscriber pruned", Duration::from_secs(10), || {
        pair.transport.subscriber_count() == 0
    })
    .await?;

    // Second session: the next multicast product triggers the backlog.
    let d2 = pair.downstream(None);
    let s2_stats = d2.stats();
    let h2 = HaltFlag::new();
    let s2 = tokio::spawn({
        let d2 = Arc::clone(&d2);
        let h2 = h2.clone();
        async move { d2.run_session(&h2).await }
    });
    wait_until("second subscription", Duration::from_secs(10), || {
        pair.transport.subscriber_count() >= 1
    })
    .await?;
    pair.sender_pq
        .insert(&prods[50])
        .map_err(|e| format!("insert trigger: {e}"))?;

    wait_until("backlog completion", Duration::from_secs(30), || {
        s2_stats.backlog_done.load(Ordering::Acquire)
    })
    .await?;
    wait_until("backlog deliveries", Duration::from_secs(30), || {
        s2_stats.backlog_products.load(Ordering::Relaxed) == 25
    })
    .await?;

    let rcv = Pq::open(&pair.receiver_pq_path, OpenMode::ReadOnly)
        .map_err(|e| format!("open receiver queue: {e}"))?;
    for p in &prods[25..] {
        check(
            rcv.find_by_signature(&p.info.signature)
                .map_err(|e| e.to_string())?
                .is_some(),
            format!("product {} should be present after backlog", p.info.seqno),
        )?;
    }
    // Exactly products 26..=50 were redelivered, not 1..=25.
    check(
        s2_stats.backlog_products.load(Ordering::Relaxed) == 25,
        "backlog must not redeliver the first session's products",
    )?;

    h2.trigger();
    let _ = s2.await;
    pair.halt.trigger();
    Ok(())
}

// -----------------------------------------------------------------------------
// 4. Eviction under both capacity limits.
// -----------------------------------------------------------------------------
fn eviction() -> Result<(), String> {
    let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
    let pq = Pq::create(&dir.path().join("evict.pq"), 10, 2_000_000, 0o600)
        .map_err(|e| e.to_string())?;

    let prods: Vec<_> = (1..=11).map(|n| distinct_product(n, 150_000)).collect();
    for p in &prods {
        match pq.insert(p) {
            Ok(Inserted::New) => {}
            Ok(Inserted::Duplicate) => return Err("unexpected duplicate".into()),
            Err(e) => return Err(format!("insert: {e}")),
        }
    }

    let stats = pq.stats().map_err(|e| e.to_string())?;
    check(stats.n_products == 10, "ten products should remain live")?;
    check(
        stats.n_bytes_used == 150_000 * 10,
        format!("bytes used {} != 1_500_000", stats.n_bytes_used),
    )?;
    check(stats.evict_count == 1, "exactly the first product is evicted")?;
    check(
        pq.find_by_signature(&prods[0].info.signature)
            .map_err(|e| e.to_string())?
            .is_none(),
        "product 1 should be gone",
    )?;

    let mut seen = Vec::new();
    pq.rewind();
    while pq
        .sequence(CursorMode::Gt, &ProductClass::everything(), |info, _| {
            seen.push(info.seqno);
        })
        .map_err(|e| e.to_string())?
        == Seq::Advanced
    {}
    check(
        seen == (2..=11).collect::<Vec<u32>>(),
        format!("cursor order {seen:?} != products 2..=11"),
    )?;
    Ok(())
}

// -----------------------------------------------------------------------------
// 5. Frame-assembler loss with backstop recovery.
// -----------------------------------------------------------------------------
async fn frame_assembler_loss() -> Result<(), String> {
    use noaaport::{AssemblerConfig, Ingester, ProductSpec, StreamBuilder};

    fn text_payload(n: u32) -> Vec<u8> {
        let mut out = format!("\x01\r\r\n{:03} \r\r\n", n % 1000).into_bytes();
        out.extend_from_slice(format!("SDUS53 KARX {:06}\r\r\n", n).as_bytes());
        out.extend((0..600).map(|i| b'A' + ((i + n as usize) % 26) as u8));
        out
    }
    fn spec(n: u32) -> ProductSpec {
        ProductSpec {
            prod_seqno: n,
            stream: STREAM_NWSTG,
            category: CAT_TEXT,
            payload: text_payload(n),
            fragments: 3,
            compressed: false,
            with_ccb: false,
        }
    }

    // Frame-level loss: block #2 of product #7 never arrives, so the
    // assembler delivers 19 of 20 and names #7 for retransmission.
    {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let scratch =
            Pq::create(&dir.path().join("frames.pq"), 64, 1 << 20, 0o600).map_err(|e| e.to_string())?;
        let mut b = StreamBuilder::new(1);
        let mut stream = Vec::new();
        for n in 0..20 {
            for (i, frame) in b.product_frames(&spec(n)).into_iter().enumerate() {
                if n == 7 && i == 1 {
                    continue;
                }
                stream.extend_from_slice(&frame);
            }
        }
        let aborted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut ingester = Ingester::new(&scratch, stream.as_slice(), AssemblerConfig::default());
        {
            let aborted = Arc::clone(&aborted);
            ingester
                .assembler
                .on_abort_retransmit(move |seqno| aborted.lock().unwrap().push(seqno));
        }
        ingester.run().map_err(|e| format!("ingest: {e}"))?;
        check(ingester.inserted == 19, "19 of 20 products reach the queue")?;
        check(
            ingester.assembler.stats.missed_frames == 1,
            "one frame gap is logged",
        )?;
        check(
            *aborted.lock().unwrap() == vec![7],
            "retransmission is requested for product 7",
        )?;
    }

    // Transport-level loss of the same product index, repaired by the
    // unicast backstop: the receiver still ends complete.
    let pair = Pair::start_with(|transport| {
        Arc::new(LossyTransport::new(transport, HashSet::from([7u32])))
    })
    .await;

    let down = pair.downstream(None);
    let stats = down.stats();
    let halt = HaltFlag::new();
    tokio::spawn({
        let down = Arc::clone(&down);
        let halt = halt.clone();
        async move { down.run(halt).await }
    });
    wait_until("subscription", Duration::from_secs(10), || {
        pair.transport.subscriber_count() >= 1
    })
    .await?;

    // Twenty complete products ingested from a NOAAPort stream.
    {
        let mut b = StreamBuilder::new(2);
        for n in 0..20 {
            b.push_product(&spec(n));
        }
        let stream = b.finish();
        let pq = Arc::clone(&pair.sender_pq);
        tokio::task::spawn_blocking(move || {
            let mut ingester = Ingester::new(&pq, stream.as_slice(), AssemblerConfig::default());
            ingester.run().map(|()| ingester.inserted)
        })
        .await
        .map_err(|e| format!("ingest task: {e}"))?
        .map_err(|e| format!("ingest: {e}"))?;
    }

    wait_until("multicast deliveries", Duration::from_secs(30), || {
        stats.mcast_products.load(Ordering::Relaxed) == 19
    })
    .await?;
    wait_until("backstop recovery", Duration::from_secs(30), || {
        stats.backstop_products.load(Ordering::Relaxed) == 1
    })
    .await?;

    let rcv = Pq::open(&pair.receiver_pq_path, OpenMode::ReadOnly)
        .map_err(|e| format!("open receiver queue: {e}"))?;
    check(
        rcv.stats().map_err(|e| e.to_string())?.n_products == 20,
        "receiver queue ends with all 20 products",
    )?;

    halt.trigger();
    pair.halt.trigger();
    Ok(())
}


// -----------------------------------------------------------------------------
// 6. Duplicate delivery is a no-op.
// -----------------------------------------------------------------------------
fn duplicate_delivery_noop() -> Result<(), String> {
    let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
    let pq = Pq::create(&dir.path().join("dup.pq"), 8, 1 << 20, 0o600).map_err(|e| e.to_string())?;
    let p = distinct_product(1, 50_000);

    match pq.insert(&p) {
        Ok(Inserted::New) => {}
        other => return Err(format!("first insert: {other:?}")),
    }
    match pq.insert(&p) {
        Ok(Inserted::Duplicate) => {}
        other => return Err(format!("second insert: {other:?}")),
    }

    let stats = pq.stats().map_err(|e| e.to_string())?;
    check(stats.n_products == 1, "n_products incremented exactly once")?;
    check(stats.insert_count == 1, "insert counter unchanged by the duplicate")?;
    check(stats.dup_count == 1, "duplicate counter incremented")?;
    // A third call behaves identically.
    match pq.insert(&p) {
        Ok(Inserted::Duplicate) => Ok(()),
        other => Err(format!("third insert: {other:?}")),
    }
    .and_then(|()| {
        check(
            matches!(pq.insert(&p), Ok(Inserted::Duplicate) | Err(PqError::Duplicate)),
            "duplicate outcome is stable",
        )
    })
}
