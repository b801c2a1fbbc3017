//! Reliable-multicast transport abstraction.
//!
//! The session engine depends only on these traits: the concrete transport
//! may be UDP-with-NACK, IP multicast with FEC, or an in-process channel.
//! Delivery is product-framed: each product arrives as one or more blocks
//! carrying the product index, with `is_start`/`is_end` markers. Indices
//! may arrive out of order; each index is delivered at most once per
//! session. Loss surfaces either as an explicit [`McastEvent::Missed`] or
//! as a gap in delivered indices.

use crate::error::{Ldm7Error, Result};
use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use pq::ProductInfo;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// One delivery-side event.
#[derive(Debug, Clone)]
pub enum McastEvent {
    /// A block of a product. `info` accompanies every block so a receiver
    /// can reserve queue space on the first one.
    Block {
        index: u32,
        info: ProductInfo,
        data: Vec<u8>,
        is_start: bool,
        is_end: bool,
    },
    /// The transport determined that `index` will never be delivered.
    Missed { index: u32 },
}

/// Sending side: hands a whole product to the transport.
#[async_trait]
pub trait McastSender: Send + Sync {
    /// Returns after handoff; the transport owns retransmission within its
    /// configured timeout.
    async fn send(&self, index: u32, info: &ProductInfo, data: &[u8]) -> Result<()>;
}

/// Receiving side: a stream of delivery events.
#[async_trait]
pub trait McastReceiver: Send {
    /// `Ok(None)` means the transport closed.
    async fn recv(&mut self) -> Result<Option<McastEvent>>;
}

// =============================================================================
// IN-PROCESS CHANNEL TRANSPORT
// =============================================================================

/// In-process multicast: events fan out to every current subscriber, and a
/// send with no subscribers vanishes into the void exactly like a
/// datagram on an unjoined group. Used by tests and the deterministic
/// simulator; semantics match the trait contract exactly.
#[derive(Clone)]
pub struct ChannelTransport {
    subscribers: Arc<std::sync::Mutex<Vec<mpsc::UnboundedSender<McastEvent>>>>,
    block_size: usize,
}

impl ChannelTransport {
    pub fn new(block_size: usize) -> ChannelTransport {
        ChannelTransport {
            subscribers: Arc::new(std::sync::Mutex::new(Vec::new())),
            block_size: block_size.max(1),
        }
    }

    /// Joins the "group": a fresh receiver that sees every later event.
    pub fn subscribe(&self) -> ChannelReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        ChannelReceiver { rx }
    }

    /// Injects a loss notification, as a transport's NACK timeout would.
    pub fn inject_missed(&self, index: u32) {
        self.broadcast(&McastEvent::Missed { index });
    }

    /// Live subscribers; departed ones linger until the next broadcast
    /// prunes them.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.lock();
        subs.retain(|tx| !tx.is_closed());
        subs.len()
    }

    fn broadcast(&self, event: &McastEvent) {
        // Departed subscribers are pruned as their channels close.
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<McastEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl McastSender for ChannelTransport {
    async fn send(&self, index: u32, info: &ProductInfo, data: &[u8]) -> Result<()> {
        let total = data.len();
        let mut off = 0;
        loop {
            let end = (off + self.block_size).min(total);
            self.broadcast(&McastEvent::Block {
                index,
                info: info.clone(),
                data: data[off..end].to_vec(),
                is_start: off == 0,
                is_end: end == total,
            });
            if end == total {
                return Ok(());
            }
            off = end;
        }
    }
}

pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<McastEvent>,
}

#[async_trait]
impl McastReceiver for ChannelReceiver {
    async fn recv(&mut self) -> Result<Option<McastEvent>> {
        Ok(self.rx.recv().await)
    }
}

// =============================================================================
// UDP MULTICAST TRANSPORT
// =============================================================================
//
// A deliberately thin datagram transport: one block per datagram, no FEC
// and no NACK machinery. A product with any lost block is reported as
// missed, which is exactly what drives the unicast backstop.

const UDP_MAGIC: u32 = 0x464D_5450;
const UDP_FLAG_START: u8 = 0x01;
const UDP_FLAG_END: u8 = 0x02;

/// Payload bytes per datagram, leaving room for headers under typical MTU.
pub const UDP_BLOCK_SIZE: usize = 1400;

pub struct UdpSender {
    socket: UdpSocket,
    group: SocketAddr,
}

impl UdpSender {
    /// Binds a sender socket and points it at the multicast group.
    pub async fn new(group: SocketAddr, ttl: u32) -> Result<UdpSender> {
        let bind: SocketAddr = match group.ip() {
            IpAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            IpAddr::V6(_) => "[::]:0".parse().unwrap(),
        };
        let socket = UdpSocket::bind(bind).await?;
        if group.ip().is_ipv4() {
            socket.set_multicast_ttl_v4(ttl)?;
        }
        Ok(UdpSender { socket, group })
    }

    fn encode_block(
        index: u32,
        block_no: u16,
        flags: u8,
        info: &ProductInfo,
        chunk: &[u8],
    ) -> Vec<u8> {
        let mut dgram = Vec::with_capacity(chunk.len() + 96);
        dgram.write_u32::<BigEndian>(UDP_MAGIC).unwrap();
        dgram.write_u32::<BigEndian>(index).unwrap();
        dgram.write_u16::<BigEndian>(block_no).unwrap();
        dgram.push(flags);
        dgram.push(0);
        let mut info_wire = Vec::with_capacity(64);
        info.encode(&mut info_wire);
        dgram.write_u16::<BigEndian>(info_wire.len() as u16).unwrap();
        dgram.extend_from_slice(&info_wire);
        dgram.extend_from_slice(chunk);
        dgram
    }
}

#[async_trait]
impl McastSender for UdpSender {
    async fn send(&self, index: u32, info: &ProductInfo, data: &[u8]) -> Result<()> {
        let total = data.len();
        let mut off = 0;
        let mut block_no: u16 = 0;
        loop {
            let end = (off + UDP_BLOCK_SIZE).min(total);
            let mut flags = 0;
            if off == 0 {
                flags |= UDP_FLAG_START;
            }
            if end == total {
                flags |= UDP_FLAG_END;
            }
            let dgram = Self::encode_block(index, block_no, flags, info, &data[off..end]);
            self.socket.send_to(&dgram, self.group).await?;
            if end == total {
                return Ok(());
            }
            off = end;
            block_no = block_no.wrapping_add(1);
        }
    }
}

pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    /// Per-index next expected block number; a skip means the product is
    /// unrecoverable over multicast.
    expected_block: HashMap<u32, u16>,
    buf: Vec<u8>,
}

impl UdpReceiver {
    /// Binds to the group port and joins the multicast group.
    pub async fn join(group: SocketAddr, interface: IpAddr) -> Result<UdpReceiver> {
        let bind: SocketAddr = match group.ip() {
            IpAddr::V4(_) => format!("0.0.0.0:{}", group.port()).parse().unwrap(),
            IpAddr::V6(_) => format!("[::]:{}", group.port()).parse().unwrap(),
        };
        let socket = UdpSocket::bind(bind).await?;
        match (group.ip(), interface) {
            (IpAddr::V4(grp), IpAddr::V4(ifc)) => socket.join_multicast_v4(grp, ifc)?,
            (IpAddr::V6(grp), _) => socket.join_multicast_v6(&grp, 0)?,
            _ => {
                return Err(Ldm7Error::Invalid(
                    "multicast group and interface families differ".into(),
                ));
            }
        }
        Ok(UdpReceiver {
            socket: Arc::new(socket),
            expected_block: HashMap::new(),
            buf: vec![0u8; 65536],
        })
    }

    fn decode(dgram: &[u8]) -> Result<(u32, u16, u8, ProductInfo, Vec<u8>)> {
        let mut src = dgram;
        if src.read_u32::<BigEndian>()? != UDP_MAGIC {
            return Err(Ldm7Error::Invalid("bad datagram magic".into()));
        }
        let index = src.read_u32::<BigEndian>()?;
        let block_no = src.read_u16::<BigEndian>()?;
        let flags = src.read_u8()?;
        let _reserved = src.read_u8()?;
        let info_len = src.read_u16::<BigEndian>()? as usize;
        if info_len > src.len() {
            return Err(Ldm7Error::Invalid("truncated datagram".into()));
        }
        let (info_wire, payload) = src.split_at(info_len);
        let info = ProductInfo::decode(&mut &*info_wire).map_err(Ldm7Error::from)?;
        Ok((index, block_no, flags, info, payload.to_vec()))
    }
}

#[async_trait]
impl McastReceiver for UdpReceiver {
    async fn recv(&mut self) -> Result<Option<McastEvent>> {
        loop {
            let n = self.socket.recv(&mut self.buf).await?;
            let (index, block_no, flags, info, data) = match Self::decode(&self.buf[..n]) {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::debug!(error = %e, "discarding undecodable datagram");
                    continue;
                }
            };
            let is_start = flags & UDP_FLAG_START != 0;
            let is_end = flags & UDP_FLAG_END != 0;

            // Intra-product continuity: a skipped block makes the product
            // unrecoverable here, so report it missed once.
            let expected = if is_start {
                0
            } else {
                match self.expected_block.get(&index) {
                    Some(&e) => e,
                    None => continue, // tail of a product whose start we missed
                }
            };
            if block_no != expected {
                self.expected_block.remove(&index);
                return Ok(Some(McastEvent::Missed { index }));
            }
            if is_end {
                self.expected_block.remove(&index);
            } else {
                self.expected_block.insert(index, block_no.wrapping_add(1));
            }
            return Ok(Some(McastEvent::Block {
                index,
                info,
                data,
                is_start,
                is_end,
            }));
        }
    }
}
