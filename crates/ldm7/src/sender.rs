//! Upstream LDM-7: subscription server, multicast pump, and backstop
//! responder.
//!
//! One task accepts TCP connections and spawns a per-client handler; a
//! second pumps the product queue's cursor into the multicast transport,
//! recording each send in the product-index map. Per-client state is
//! isolated; the multicast path has a single writer; each client's unicast
//! path has a single writer behind a mutex.

use crate::acl::Acl;
use crate::config::UpstreamConfig;
use crate::error::{Ldm7Error, Result};
use crate::exec::HaltFlag;
use crate::fmtp::McastSender;
use crate::wire::{
    self, BacklogSpec, McastInfo, Message, VcEndPoint, STATUS_OK, STATUS_UNAUTH,
    STATUS_UNSUPPORTED,
};
use pq::{CursorMode, DataProduct, OpenMode, Pq, ProductClass, ProductIndexMap, Seq};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task;

/// The upstream (sending) half of an LDM-7 pairing.
pub struct UpstreamLdm7 {
    cfg: UpstreamConfig,
    pq: Arc<Pq>,
    pim: Arc<ProductIndexMap>,
    acl: Arc<Acl>,
    transport: Arc<dyn McastSender>,
    /// Sender run nonce; a fresh run restarts the product-index sequence,
    /// so the map from the previous run is cleared.
    run: u16,
}

impl UpstreamLdm7 {
    pub fn new(
        cfg: UpstreamConfig,
        pq: Arc<Pq>,
        acl: Arc<Acl>,
        transport: Arc<dyn McastSender>,
    ) -> Result<UpstreamLdm7> {
        let capacity = pq.slot_capacity().min(u64::from(u32::MAX)) as u32;
        let pim = ProductIndexMap::open_or_create(&cfg.index_map_path, cfg.feed, capacity)?;
        pim.delete_all(cfg.feed)?;
        let run: u16 = rand::random();
        tracing::info!(run, feed = %cfg.feed, "upstream starting a fresh run");
        Ok(UpstreamLdm7 {
            cfg,
            pq,
            pim: Arc::new(pim),
            acl,
            transport,
            run,
        })
    }

    pub fn run_id(&self) -> u16 {
        self.run
    }

    /// Binds the configured listen address and serves until halted.
    pub async fn serve(self: Arc<Self>, halt: HaltFlag) -> Result<()> {
        let listener = TcpListener::bind(self.cfg.bind).await?;
        self.serve_with(listener, halt).await
    }

    /// Serves on an already-bound listener; lets callers bind port 0 and
    /// learn the address first.
    pub async fn serve_with(self: Arc<Self>, listener: TcpListener, halt: HaltFlag) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(%local, "upstream listening");

        let pump = {
            let this = Arc::clone(&self);
            let halt = halt.clone();
            tokio::spawn(async move { this.mcast_pump(halt).await })
        };

        loop {
            tokio::select! {
                () = halt.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let this = Arc::clone(&self);
                    let halt = halt.clone();
                    tokio::spawn(async move {
                        match this.serve_connection(stream, peer, halt).await {
                            Ok(()) | Err(Ldm7Error::Shutdown) => {
                                tracing::debug!(%peer, "connection closed");
                            }
                            Err(e) => tracing::warn!(%peer, error = %e, "connection failed"),
                        }
                    });
                }
            }
        }

        match pump.await {
            Ok(Ok(())) | Ok(Err(Ldm7Error::Shutdown)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Ldm7Error::Logic(format!("pump task panicked: {e}"))),
        }
    }

    // ---------------------------------------------------------------------
    // MULTICAST PUMP
    // ---------------------------------------------------------------------

    /// Walks the queue cursor from "now" onward, multicasting each product
    /// and recording its index in send order.
    async fn mcast_pump(&self, halt: HaltFlag) -> Result<()> {
        let class = ProductClass::for_feed(self.cfg.feed);
        {
            let pq = Arc::clone(&self.pq);
            task::spawn_blocking(move || pq.set_cursor_to_time(SystemTime::now()))
                .await
                .map_err(|e| Ldm7Error::Logic(format!("pump seek panicked: {e}")))??;
        }

        let mut index: u32 = 0;
        loop {
            if halt.is_triggered() {
                return Err(Ldm7Error::Shutdown);
            }
            let pq = Arc::clone(&self.pq);
            let class = class.clone();
            let got = task::spawn_blocking(move || -> Result<Option<DataProduct>> {
                let mut found = None;
                let out = pq.sequence(CursorMode::Gt, &class, |info, data| {
                    found = Some(DataProduct {
                        info: info.clone(),
                        data: data.to_vec(),
                    });
                })?;
                Ok(match out {
                    Seq::Advanced => found,
                    Seq::End => None,
                })
            })
            .await
            .map_err(|e| Ldm7Error::Logic(format!("pump step panicked: {e}")))??;

            match got {
                Some(product) => {
                    self.transport.send(index, &product.info, &product.data).await?;
                    self.pim.put(index, &product.info.signature)?;
                    tracing::trace!(index, signature = %product.info.signature, "multicast");
                    index = index.wrapping_add(1);
                }
                None => {
                    // Sleep until a commit broadcast; the one-second bound
                    // keeps the halt check responsive.
                    let pq = Arc::clone(&self.pq);
                    task::spawn_blocking(move || pq.suspend_and_unblock(Duration::from_secs(1)))
                        .await
                        .map_err(|e| Ldm7Error::Logic(format!("pump wait panicked: {e}")))?;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // PER-CLIENT SERVICE
    // ---------------------------------------------------------------------

    async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        halt: HaltFlag,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let mut streaming = false;

        loop {
            let msg = tokio::select! {
                () = halt.cancelled() => return Err(Ldm7Error::Shutdown),
                msg = wire::read_message(&mut reader) => msg?,
            };
            let Some(msg) = msg else {
                // Disconnect deregisters this client; multicast continues.
                return Ok(());
            };
            match msg {
                Message::Subscribe { feed } => {
                    streaming = self.handle_subscribe(&writer, peer, feed).await?;
                }
                Message::RequestProduct { index } if streaming => {
                    self.handle_request_product(&writer, index).await?;
                }
                Message::RequestBacklog(spec) if streaming => {
                    self.stream_backlog(&writer, spec).await?;
                }
                Message::TestConnection => {
                    send(&writer, &Message::TestAck).await?;
                }
                other => {
                    return Err(Ldm7Error::Invalid(format!(
                        "unexpected {other:?} from {peer} (streaming={streaming})"
                    )));
                }
            }
        }
    }

    async fn handle_subscribe(
        &self,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        peer: SocketAddr,
        feed: pq::FeedType,
    ) -> Result<bool> {
        let host = peer.ip().to_string();
        match self.acl.check(&host, feed.intersect(self.cfg.feed)) {
            Ok(granted) => {
                tracing::info!(%peer, feed = %granted, "subscription accepted");
                let reply = Message::SubscriptionReply {
                    status: STATUS_OK,
                    mcast: Some(McastInfo {
                        feed: granted,
                        group: self.cfg.group.clone(),
                        fmtp: self.cfg.fmtp_endpoint.clone(),
                    }),
                    vc: Some(VcEndPoint::default()),
                };
                send(writer, &reply).await?;
                Ok(true)
            }
            Err(e) => {
                let status = match &e {
                    Ldm7Error::Unauth(_) => STATUS_UNAUTH,
                    _ => STATUS_UNSUPPORTED,
                };
                tracing::warn!(%peer, error = %e, "subscription refused");
                send(
                    writer,
                    &Message::SubscriptionReply {
                        status,
                        mcast: None,
                        vc: None,
                    },
                )
                .await?;
                Ok(false)
            }
        }
    }

    /// Backstop: look the index up in the send-order map, then the queue.
    /// Not-found is dropped silently on the wire, per protocol.
    async fn handle_request_product(
        &self,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        index: u32,
    ) -> Result<()> {
        let Some(sig) = self.pim.get(index)? else {
            tracing::debug!(index, "backstop request for unknown index");
            return Ok(());
        };
        let pq = Arc::clone(&self.pq);
        let product = task::spawn_blocking(move || pq.find_by_signature(&sig))
            .await
            .map_err(|e| Ldm7Error::Logic(format!("lookup panicked: {e}")))??;
        match product {
            Some(product) => {
                tracing::debug!(index, signature = %sig, "serving backstop request");
                send(writer, &Message::DeliverMissed { index, product }).await
            }
            None => {
                tracing::debug!(index, signature = %sig, "backstop product already evicted");
                Ok(())
            }
        }
    }

    /// Streams every queued product in `(after ∨ now − offset, before)` in
    /// arrival order, then `end_backlog`. Runs on its own queue handle so
    /// its cursor cannot disturb the pump's.
    async fn stream_backlog(
        &self,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        spec: BacklogSpec,
    ) -> Result<()> {
        tracing::info!(?spec, "streaming backlog");
        let path = self.cfg.pq_path.clone();
        let pq = task::spawn_blocking(move || Pq::open(&path, OpenMode::ReadOnly))
            .await
            .map_err(|e| Ldm7Error::Logic(format!("backlog open panicked: {e}")))??;
        let pq = Arc::new(pq);

        let mut mode = CursorMode::Ge;
        let positioned = match spec.after {
            Some(sig) => {
                let pq = Arc::clone(&pq);
                task::spawn_blocking(move || pq.set_cursor_to_signature(&sig))
                    .await
                    .map_err(|e| Ldm7Error::Logic(format!("backlog seek panicked: {e}")))??
            }
            None => false,
        };
        if positioned {
            mode = CursorMode::Gt;
        } else {
            let start = SystemTime::now() - Duration::from_secs(u64::from(spec.time_offset));
            let pq2 = Arc::clone(&pq);
            task::spawn_blocking(move || pq2.set_cursor_to_time(start))
                .await
                .map_err(|e| Ldm7Error::Logic(format!("backlog seek panicked: {e}")))??;
        }

        let class = ProductClass::for_feed(self.cfg.feed);
        let mut sent = 0u64;
        loop {
            let pq2 = Arc::clone(&pq);
            let class2 = class.clone();
            let got = task::spawn_blocking(move || -> Result<Option<DataProduct>> {
                let mut found = None;
                let out = pq2.sequence(mode, &class2, |info, data| {
                    found = Some(DataProduct {
                        info: info.clone(),
                        data: data.to_vec(),
                    });
                })?;
                Ok(match out {
                    Seq::Advanced => found,
                    Seq::End => None,
                })
            })
            .await
            .map_err(|e| Ldm7Error::Logic(format!("backlog step panicked: {e}")))??;
            mode = CursorMode::Gt;

            let Some(product) = got else { break };
            if product.info.signature == spec.before {
                break;
            }
            send(writer, &Message::DeliverBacklog { product }).await?;
            sent += 1;
        }
        send(writer, &Message::EndBacklog).await?;
        tracing::info!(sent, "backlog complete");
        Ok(())
    }
}

async fn send(writer: &Arc<Mutex<OwnedWriteHalf>>, msg: &Message) -> Result<()> {
    let mut guard = writer.lock().await;
    wire::write_message(&mut *guard, msg).await
}

/// Convenience for harnesses: create the sender queue, insert nothing, and
/// wrap it for an upstream instance.
pub fn open_sender_queue(cfg: &UpstreamConfig, slots: u64, bytes: u64) -> Result<Arc<Pq>> {
    let pq = match Pq::open(&cfg.pq_path, OpenMode::ReadWrite) {
        Ok(pq) => pq,
        Err(pq::PqError::Io(_)) | Err(pq::PqError::Corrupt(_)) => {
            Pq::create(&cfg.pq_path, slots, bytes, 0o600)?
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Arc::new(pq))
}

/// Signature helper used when answering backlog requests for peers with no
/// prior session: everything since `offset` seconds ago qualifies.
pub fn backlog_floor(offset: u32) -> SystemTime {
    SystemTime::now() - Duration::from_secs(u64::from(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_floor_is_in_the_past() {
        let floor = backlog_floor(3600);
        assert!(floor < SystemTime::now());
    }

    #[test]
    fn sender_queue_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = UpstreamConfig {
            pq_path: dir.path().join("snd.pq"),
            index_map_path: dir.path().join("snd.pim"),
            ..UpstreamConfig::default()
        };
        let pq = open_sender_queue(&cfg, 32, 1 << 20).unwrap();
        assert_eq!(pq.slot_capacity(), 32);
        // Second call opens the same store.
        let again = open_sender_queue(&cfg, 32, 1 << 20).unwrap();
        assert_eq!(again.data_capacity(), 1 << 20);
    }
}
