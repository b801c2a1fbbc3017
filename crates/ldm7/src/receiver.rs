//! Downstream LDM-7: subscription, three concurrent receivers, and the
//! one-shot backlog requester, all supervised with first-error-wins.
//!
//! Session lifecycle: `Idle → Connecting → Subscribed → Running → Stopping
//! → Idle`, with an interruptible nap between attempts. The multicast
//! receiver streams products into queue regions; losses flow through the
//! missed/requested FIFOs to the unicast backstop; a restart requests the
//! backlog between the previous session's last product and this session's
//! first.

use crate::config::DownstreamConfig;
use crate::error::{Ldm7Error, Result};
use crate::exec::HaltFlag;
use crate::fmtp::{McastEvent, McastReceiver};
use crate::queues::IndexQueue;
use crate::session_mem::SessionMemory;
use crate::supervisor::Supervisor;
use crate::wire::{self, BacklogSpec, McastInfo, Message, STATUS_OK};
use async_trait::async_trait;
use pq::{DataProduct, OpenMode, Pq, PqError, Signature};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout, Duration};

/// Upper bound on waiting for the subscription reply.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Joins the multicast group named by a subscription reply.
#[async_trait]
pub trait McastJoiner: Send + Sync {
    async fn join(&self, info: &McastInfo) -> Result<Box<dyn McastReceiver>>;
}

/// Real UDP joiner: binds the group port on `interface` and joins the
/// group from the subscription reply.
pub struct UdpJoiner {
    pub interface: std::net::IpAddr,
}

#[async_trait]
impl McastJoiner for UdpJoiner {
    async fn join(&self, info: &McastInfo) -> Result<Box<dyn McastReceiver>> {
        let group = info.group_addr()?;
        let rx = crate::fmtp::UdpReceiver::join(group, self.interface).await?;
        Ok(Box::new(rx))
    }
}

/// Counters a harness can watch while a session runs.
#[derive(Debug, Default)]
pub struct DownstreamStats {
    /// Products committed from the multicast path.
    pub mcast_products: AtomicU64,
    /// Products recovered through the unicast backstop.
    pub backstop_products: AtomicU64,
    /// Products delivered by a backlog stream.
    pub backlog_products: AtomicU64,
    /// Products deliberately deleted by the backstop exercise.
    pub deleted_for_test: AtomicU64,
    /// Set when `end_backlog` has been received this session.
    pub backlog_done: AtomicBool,
}

/// The downstream (receiving) half of an LDM-7 pairing.
pub struct DownstreamLdm7 {
    cfg: DownstreamConfig,
    joiner: Arc<dyn McastJoiner>,
    stats: Arc<DownstreamStats>,
}

impl DownstreamLdm7 {
    pub fn new(cfg: DownstreamConfig, joiner: Arc<dyn McastJoiner>) -> DownstreamLdm7 {
        DownstreamLdm7 {
            cfg,
            joiner,
            stats: Arc::new(DownstreamStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DownstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Runs sessions until halted, napping between attempts.
    pub async fn run(self: Arc<Self>, halt: HaltFlag) -> Result<()> {
        loop {
            if halt.is_triggered() {
                return Ok(());
            }
            match self.run_session(&halt).await {
                Ok(()) => tracing::info!("session ended"),
                Err(e) if e.is_shutdown() => tracing::info!("session shut down"),
                Err(e) => tracing::warn!(error = %e, "session failed"),
            }
            tokio::select! {
                () = halt.cancelled() => return Ok(()),
                () = sleep(self.cfg.restart_nap) => {}
            }
        }
    }

    /// One full `Connecting → … → Stopping` pass.
    pub async fn run_session(&self, halt: &HaltFlag) -> Result<()> {
        tracing::info!(upstream = %self.cfg.upstream, "connecting");
        let stream = TcpStream::connect(self.cfg.upstream).await?;
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));

        send(&writer, &Message::Subscribe { feed: self.cfg.feed }).await?;
        let reply = timeout(SUBSCRIBE_TIMEOUT, wire::read_message(&mut reader))
            .await
            .map_err(|_| Ldm7Error::Timeout("no subscription reply".into()))??;
        let mcast_info = match reply {
            Some(Message::SubscriptionReply {
                status: STATUS_OK,
                mcast: Some(info),
                ..
            }) => info,
            Some(Message::SubscriptionReply { status, .. }) => {
                return Err(Ldm7Error::Refused(format!(
                    "subscription refused with status {status}"
                )));
            }
            other => {
                return Err(Ldm7Error::Invalid(format!(
                    "expected subscription reply, got {other:?}"
                )));
            }
        };
        tracing::info!(group = %mcast_info.group, feed = %mcast_info.feed, "subscribed");
        // The group literal must parse and sit inside the allowed range
        // before any joiner sees it.
        mcast_info.group_addr()?;
        let mcast_rx = self.joiner.join(&mcast_info).await?;

        let pq = self.open_receiver_queue()?;
        let memory = SessionMemory::open(&self.cfg.memory_dir, &self.cfg.peer_id, self.cfg.feed)?;
        let prev_last = memory.last_mcast();
        let memory = Arc::new(StdMutex::new(memory));

        let missed = Arc::new(IndexQueue::new());
        let requested = Arc::new(IndexQueue::new());
        let (first_tx, first_rx) = oneshot::channel::<Signature>();
        let last_ack = Arc::new(StdMutex::new(Instant::now()));

        let mut sup = Supervisor::new();

        // External halt folds into the supervision set as a task whose
        // completion carries Shutdown. It needs its own cancel hook too,
        // or terminate_tasks could never drain it.
        {
            let flag = HaltFlag::new();
            let session_halt = halt.clone();
            let observed = flag.clone();
            sup.start_task(
                "halt-watch",
                async move {
                    tokio::select! {
                        () = session_halt.cancelled() => {}
                        () = observed.cancelled() => {}
                    }
                    Err(Ldm7Error::Shutdown)
                },
                move || flag.trigger(),
            );
        }

        {
            let flag = HaltFlag::new();
            let task = mcast_receiver_task(
                mcast_rx,
                Arc::clone(&pq),
                Arc::clone(&memory),
                Arc::clone(&missed),
                first_tx,
                Arc::clone(&self.stats),
                self.cfg.backstop_test,
                flag.clone(),
            );
            sup.start_task("mcast-receiver", task, {
                let flag = flag.clone();
                move || flag.trigger()
            });
        }

        {
            let flag = HaltFlag::new();
            let task = missed_requester_task(
                Arc::clone(&missed),
                Arc::clone(&requested),
                Arc::clone(&writer),
                flag.clone(),
            );
            sup.start_task("missed-requester", task, {
                let missed = Arc::clone(&missed);
                let flag = flag.clone();
                move || {
                    missed.shutdown();
                    flag.trigger();
                }
            });
        }

        {
            let flag = HaltFlag::new();
            let task = unicast_receiver_task(
                reader,
                Arc::clone(&pq),
                Arc::clone(&requested),
                Arc::clone(&self.stats),
                Arc::clone(&last_ack),
                flag.clone(),
            );
            sup.start_task("unicast-receiver", task, {
                let flag = flag.clone();
                move || flag.trigger()
            });
        }

        {
            let flag = HaltFlag::new();
            let task = backlog_requester_task(
                first_rx,
                Arc::clone(&writer),
                prev_last,
                self.cfg.max_residence,
                flag.clone(),
            );
            sup.start_oneshot("backlog-requester", task, {
                let flag = flag.clone();
                move || flag.trigger()
            });
        }

        {
            let flag = HaltFlag::new();
            let task = prober_task(
                Arc::clone(&writer),
                Arc::clone(&last_ack),
                self.cfg.probe_interval,
                flag.clone(),
            );
            sup.start_task("prober", task, {
                let flag = flag.clone();
                move || flag.trigger()
            });
        }

        let done = sup.wait_on_tasks().await;
        if let Some(done) = &done {
            tracing::info!(task = done.future.name(), ok = done.result.is_ok(), "stopping session");
        }

        // Stopping: drain the backstop pipeline, then halt and join.
        missed.shutdown();
        requested.shutdown();
        sup.terminate_tasks().await;

        match sup.take_first_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Opens the receiver queue, recreating it when missing or damaged.
    fn open_receiver_queue(&self) -> Result<Arc<Pq>> {
        match Pq::open(&self.cfg.pq_path, OpenMode::ReadWrite) {
            Ok(pq) => match pq.stats() {
                Ok(_) => return Ok(Arc::new(pq)),
                Err(e) => {
                    tracing::error!(error = %e, "receiver queue damaged, recreating");
                }
            },
            Err(PqError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(error = %e, "receiver queue unusable, recreating");
            }
        }
        let pq = Pq::create(
            &self.cfg.pq_path,
            self.cfg.pq_slots,
            self.cfg.pq_bytes,
            0o600,
        )?;
        Ok(Arc::new(pq))
    }
}

// =============================================================================
// SESSION TASKS
// =============================================================================

/// Consumes multicast deliveries: reserves a region per product, streams
/// blocks into the arena, commits on the final block, records the last
/// signature, and reports index gaps to the missed queue.
#[allow(clippy::too_many_arguments)]
async fn mcast_receiver_task(
    mut rx: Box<dyn McastReceiver>,
    pq: Arc<Pq>,
    memory: Arc<StdMutex<SessionMemory>>,
    missed: Arc<IndexQueue>,
    first_tx: oneshot::Sender<Signature>,
    stats: Arc<DownstreamStats>,
    backstop_test: Option<crate::config::BackstopTest>,
    halt: HaltFlag,
) -> Result<()> {
    let pq_ref: &Pq = &pq;
    let mut open: HashMap<u32, (pq::Region<'_>, pq::ProductInfo)> = HashMap::new();
    let mut next_expected: Option<u32> = None;
    let mut first_tx = Some(first_tx);
    let mut rng = backstop_test.map(|b| SmallRng::seed_from_u64(b.seed));

    loop {
        let event = tokio::select! {
            () = halt.cancelled() => return Err(Ldm7Error::Shutdown),
            ev = rx.recv() => ev?,
        };
        let Some(event) = event else {
            return Err(Ldm7Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "multicast transport closed",
            )));
        };
        match event {
            McastEvent::Missed { index } => {
                tracing::debug!(index, "transport reported loss");
                // The explicit report supersedes gap detection for this
                // index, or the next delivery would request it again.
                if next_expected == Some(index) {
                    next_expected = Some(index.wrapping_add(1));
                }
                missed.push(index);
            }
            McastEvent::Block {
                index,
                info,
                data,
                is_start,
                is_end,
            } => {
                if is_start {
                    if let Some(expected) = next_expected {
                        let delta = index.wrapping_sub(expected);
                        if delta >= 1 << 31 {
                            tracing::debug!(index, expected, "retrograde product index ignored");
                            continue;
                        }
                        if delta > 0 {
                            tracing::debug!(expected, index, gap = delta, "multicast gap");
                            for i in 0..delta {
                                missed.push(expected.wrapping_add(i));
                            }
                        }
                    }
                    next_expected = Some(index.wrapping_add(1));

                    match pq_ref.reserve(info.size) {
                        Ok(region) => {
                            open.insert(index, (region, info.clone()));
                        }
                        Err(e @ (PqError::TooBig { .. } | PqError::System(_))) => {
                            tracing::warn!(index, error = %e, "cannot stage product");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                let Some((region, _)) = open.get_mut(&index) else {
                    // Tail of a product whose start was never staged.
                    continue;
                };
                region.write(&data)?;
                if is_end {
                    let (region, info) = open.remove(&index).expect("region staged above");
                    match region.commit(&info)? {
                        pq::Inserted::New => {
                            stats.mcast_products.fetch_add(1, Ordering::Relaxed);
                        }
                        pq::Inserted::Duplicate => {
                            tracing::debug!(index, "duplicate multicast product");
                        }
                    }
                    {
                        let mut mem = memory
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        mem.set_last_mcast(&info.signature)?;
                    }
                    if let Some(tx) = first_tx.take() {
                        let _ = tx.send(info.signature);
                    }
                    // Deterministic backstop exercise: delete and re-request
                    // a seeded fraction, exactly as a multicast loss looks.
                    if let (Some(test), Some(rng)) = (backstop_test.as_ref(), rng.as_mut()) {
                        if rng.gen::<f64>() < test.request_rate {
                            if pq_ref.delete_by_signature(&info.signature)? {
                                stats.deleted_for_test.fetch_add(1, Ordering::Relaxed);
                                missed.push(index);
                                tracing::debug!(index, "backstop exercise deleted product");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Moves indices missed → requested in strict FIFO order and asks the
/// upstream for each.
async fn missed_requester_task(
    missed: Arc<IndexQueue>,
    requested: Arc<IndexQueue>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    halt: HaltFlag,
) -> Result<()> {
    loop {
        let index = tokio::select! {
            () = halt.cancelled() => return Err(Ldm7Error::Shutdown),
            head = missed.peek_wait() => head?,
        };
        missed.remove(index);
        requested.push(index);
        send(&writer, &Message::RequestProduct { index }).await?;
        tracing::debug!(index, "requested missed product");
    }
}

/// Serves unicast deliveries from the upstream: backstop products (which
/// must match the head of the requested queue), backlog products, the
/// end-of-backlog mark, and probe acknowledgements.
async fn unicast_receiver_task(
    mut reader: OwnedReadHalf,
    pq: Arc<Pq>,
    requested: Arc<IndexQueue>,
    stats: Arc<DownstreamStats>,
    last_ack: Arc<StdMutex<Instant>>,
    halt: HaltFlag,
) -> Result<()> {
    loop {
        let msg = tokio::select! {
            () = halt.cancelled() => return Err(Ldm7Error::Shutdown),
            msg = wire::read_message(&mut reader) => msg?,
        };
        let Some(msg) = msg else {
            return Err(Ldm7Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "upstream closed the unicast channel",
            )));
        };
        match msg {
            Message::DeliverMissed { index, product } => {
                // FIFO discipline: a delivery that is not the head of the
                // requested queue means the channel is out of step; the only
                // safe recovery is a reconnect.
                if requested.peek() != Some(index) {
                    return Err(Ldm7Error::Invalid(format!(
                        "missed delivery {index} does not match requested head {:?}",
                        requested.peek()
                    )));
                }
                requested.remove(index);
                insert_ignoring_duplicate(&pq, &product)?;
                stats.backstop_products.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(index, "backstop product recovered");
            }
            Message::DeliverBacklog { product } => {
                insert_ignoring_duplicate(&pq, &product)?;
                stats.backlog_products.fetch_add(1, Ordering::Relaxed);
            }
            Message::EndBacklog => {
                stats.backlog_done.store(true, Ordering::Release);
                tracing::info!("backlog complete");
            }
            Message::TestAck => {
                *last_ack
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
            }
            other => {
                return Err(Ldm7Error::Invalid(format!(
                    "unexpected {other:?} on unicast channel"
                )));
            }
        }
    }
}

fn insert_ignoring_duplicate(pq: &Pq, product: &DataProduct) -> Result<()> {
    match pq.insert(product) {
        Ok(_) => Ok(()),
        Err(e @ PqError::TooBig { .. }) => {
            tracing::warn!(error = %e, "dropping oversized unicast product");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// One-shot: once the first multicast product of this session is known,
/// request everything between the previous session's last product and it.
async fn backlog_requester_task(
    first_rx: oneshot::Receiver<Signature>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    prev_last: Option<Signature>,
    max_residence: Duration,
    halt: HaltFlag,
) -> Result<()> {
    let first = tokio::select! {
        () = halt.cancelled() => return Err(Ldm7Error::Shutdown),
        first = first_rx => match first {
            Ok(sig) => sig,
            Err(_) => return Err(Ldm7Error::Shutdown),
        },
    };
    let spec = BacklogSpec {
        after: prev_last,
        before: first,
        time_offset: max_residence.as_secs().min(u64::from(u32::MAX)) as u32,
    };
    tracing::info!(?spec, "requesting backlog");
    send(&writer, &Message::RequestBacklog(spec)).await
}

/// Liveness probe: a periodic no-op; two consecutive unacknowledged probes
/// force a reconnect.
async fn prober_task(
    writer: Arc<Mutex<OwnedWriteHalf>>,
    last_ack: Arc<StdMutex<Instant>>,
    interval: Duration,
    halt: HaltFlag,
) -> Result<()> {
    let mut last_probe: Option<Instant> = None;
    let mut consecutive_misses = 0u32;
    loop {
        tokio::select! {
            () = halt.cancelled() => return Err(Ldm7Error::Shutdown),
            () = sleep(interval) => {}
        }
        if let Some(probed_at) = last_probe {
            let acked = *last_ack
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if acked < probed_at {
                consecutive_misses += 1;
                tracing::warn!(consecutive_misses, "probe unacknowledged");
                if consecutive_misses >= 2 {
                    return Err(Ldm7Error::Timeout(
                        "two consecutive connection probes unacknowledged".into(),
                    ));
                }
            } else {
                consecutive_misses = 0;
            }
        }
        send(&writer, &Message::TestConnection).await?;
        last_probe = Some(Instant::now());
    }
}

async fn send(writer: &Arc<Mutex<OwnedWriteHalf>>, msg: &Message) -> Result<()> {
    let mut guard = writer.lock().await;
    wire::write_message(&mut *guard, msg).await
}
