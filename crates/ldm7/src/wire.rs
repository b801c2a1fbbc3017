//! LDM-7 request/response wire protocol.
//!
//! Framed messages over a reliable byte stream, all numeric fields
//! big-endian:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     body length (op + payload)
//! 4       2     op code
//! 6       ..    payload
//! ```
//!
//! Strings and socket-address literals are length-prefixed (`u16`).
//! Products travel as the canonical product-info encoding followed by
//! exactly `info.size` payload bytes.

use crate::error::{Ldm7Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use pq::{DataProduct, FeedType, ProductInfo, Signature};
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on a frame body; larger frames mean a desynchronized or
/// hostile peer.
pub const MAX_FRAME: u32 = 256 * 1024 * 1024;

pub const OP_SUBSCRIBE: u16 = 1;
pub const OP_SUBSCRIPTION_REPLY: u16 = 2;
pub const OP_REQUEST_PRODUCT: u16 = 3;
pub const OP_DELIVER_MISSED: u16 = 4;
pub const OP_REQUEST_BACKLOG: u16 = 5;
pub const OP_DELIVER_BACKLOG: u16 = 6;
pub const OP_END_BACKLOG: u16 = 7;
pub const OP_TEST_CONNECTION: u16 = 8;
pub const OP_TEST_ACK: u16 = 9;

/// Subscription status codes.
pub const STATUS_OK: u32 = 0;
pub const STATUS_UNAUTH: u32 = 1;
pub const STATUS_UNSUPPORTED: u32 = 2;

/// Multicast stream coordinates returned by a successful subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McastInfo {
    pub feed: FeedType,
    /// Multicast group, as a dotted-quad or IPv6 literal with port.
    pub group: String,
    /// FMTP server endpoint for this stream.
    pub fmtp: String,
}

impl McastInfo {
    /// Parses and validates the group address. IPv4 groups must fall in
    /// 224.0.1.0–238.255.255.255.
    pub fn group_addr(&self) -> Result<SocketAddr> {
        let addr: SocketAddr = self
            .group
            .parse()
            .map_err(|e| Ldm7Error::Invalid(format!("bad multicast group literal: {e}")))?;
        if let IpAddr::V4(v4) = addr.ip() {
            if v4 < Ipv4Addr::new(224, 0, 1, 0) || v4 > Ipv4Addr::new(238, 255, 255, 255) {
                return Err(Ldm7Error::Invalid(format!(
                    "multicast group {v4} outside 224.0.1.0-238.255.255.255"
                )));
            }
        }
        Ok(addr)
    }
}

/// Virtual-circuit endpoint for layer-2 provisioning; opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcEndPoint {
    pub vlan_id: u32,
    pub switch_port: String,
}

/// Backlog request bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogSpec {
    /// Start after this signature when set; otherwise fall back to
    /// `now - time_offset`.
    pub after: Option<Signature>,
    /// Stream products up to and excluding this signature.
    pub before: Signature,
    /// Time fallback in seconds for a receiver with no prior session.
    pub time_offset: u32,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Subscribe {
        feed: FeedType,
    },
    SubscriptionReply {
        status: u32,
        mcast: Option<McastInfo>,
        vc: Option<VcEndPoint>,
    },
    RequestProduct {
        index: u32,
    },
    DeliverMissed {
        index: u32,
        product: DataProduct,
    },
    RequestBacklog(BacklogSpec),
    DeliverBacklog {
        product: DataProduct,
    },
    EndBacklog,
    TestConnection,
    TestAck,
}

impl Message {
    fn op(&self) -> u16 {
        match self {
            Message::Subscribe { .. } => OP_SUBSCRIBE,
            Message::SubscriptionReply { .. } => OP_SUBSCRIPTION_REPLY,
            Message::RequestProduct { .. } => OP_REQUEST_PRODUCT,
            Message::DeliverMissed { .. } => OP_DELIVER_MISSED,
            Message::RequestBacklog(_) => OP_REQUEST_BACKLOG,
            Message::DeliverBacklog { .. } => OP_DELIVER_BACKLOG,
            Message::EndBacklog => OP_END_BACKLOG,
            Message::TestConnection => OP_TEST_CONNECTION,
            Message::TestAck => OP_TEST_ACK,
        }
    }

    /// Encodes the message body (op excluded).
    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Message::Subscribe { feed } => {
                WriteBytesExt::write_u32::<BigEndian>(out, feed.0).unwrap();
            }
            Message::SubscriptionReply { status, mcast, vc } => {
                WriteBytesExt::write_u32::<BigEndian>(out, *status).unwrap();
                match mcast {
                    Some(m) => {
                        out.push(1);
                        WriteBytesExt::write_u32::<BigEndian>(out, m.feed.0).unwrap();
                        write_string(out, &m.group);
                        write_string(out, &m.fmtp);
                    }
                    None => out.push(0),
                }
                match vc {
                    Some(v) => {
                        out.push(1);
                        WriteBytesExt::write_u32::<BigEndian>(out, v.vlan_id).unwrap();
                        write_string(out, &v.switch_port);
                    }
                    None => out.push(0),
                }
            }
            Message::RequestProduct { index } => {
                WriteBytesExt::write_u32::<BigEndian>(out, *index).unwrap();
            }
            Message::DeliverMissed { index, product } => {
                WriteBytesExt::write_u32::<BigEndian>(out, *index).unwrap();
                write_product(out, product);
            }
            Message::RequestBacklog(spec) => {
                match spec.after {
                    Some(sig) => {
                        out.push(1);
                        out.extend_from_slice(sig.as_bytes());
                    }
                    None => out.push(0),
                }
                out.extend_from_slice(spec.before.as_bytes());
                WriteBytesExt::write_u32::<BigEndian>(out, spec.time_offset).unwrap();
            }
            Message::DeliverBacklog { product } => {
                write_product(out, product);
            }
            Message::EndBacklog | Message::TestConnection | Message::TestAck => {}
        }
    }

    /// Decodes a message from an op code and its body.
    fn decode(op: u16, body: &[u8]) -> Result<Message> {
        let mut src = body;
        let msg = match op {
            OP_SUBSCRIBE => Message::Subscribe {
                feed: FeedType(ReadBytesExt::read_u32::<BigEndian>(&mut src)?),
            },
            OP_SUBSCRIPTION_REPLY => {
                let status = ReadBytesExt::read_u32::<BigEndian>(&mut src)?;
                let mcast = if ReadBytesExt::read_u8(&mut src)? == 1 {
                    Some(McastInfo {
                        feed: FeedType(ReadBytesExt::read_u32::<BigEndian>(&mut src)?),
                        group: read_string(&mut src)?,
                        fmtp: read_string(&mut src)?,
                    })
                } else {
                    None
                };
                let vc = if ReadBytesExt::read_u8(&mut src)? == 1 {
                    Some(VcEndPoint {
                        vlan_id: ReadBytesExt::read_u32::<BigEndian>(&mut src)?,
                        switch_port: read_string(&mut src)?,
                    })
                } else {
                    None
                };
                Message::SubscriptionReply { status, mcast, vc }
            }
            OP_REQUEST_PRODUCT => Message::RequestProduct {
                index: ReadBytesExt::read_u32::<BigEndian>(&mut src)?,
            },
            OP_DELIVER_MISSED => Message::DeliverMissed {
                index: ReadBytesExt::read_u32::<BigEndian>(&mut src)?,
                product: read_product(&mut src)?,
            },
            OP_REQUEST_BACKLOG => {
                let after = if ReadBytesExt::read_u8(&mut src)? == 1 {
                    Some(read_signature(&mut src)?)
                } else {
                    None
                };
                let before = read_signature(&mut src)?;
                let time_offset = ReadBytesExt::read_u32::<BigEndian>(&mut src)?;
                Message::RequestBacklog(BacklogSpec {
                    after,
                    before,
                    time_offset,
                })
            }
            OP_DELIVER_BACKLOG => Message::DeliverBacklog {
                product: read_product(&mut src)?,
            },
            OP_END_BACKLOG => Message::EndBacklog,
            OP_TEST_CONNECTION => Message::TestConnection,
            OP_TEST_ACK => Message::TestAck,
            other => {
                return Err(Ldm7Error::Invalid(format!("unknown op code {other}")));
            }
        };
        Ok(msg)
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    WriteBytesExt::write_u16::<BigEndian>(out, s.len() as u16).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn read_string<R: Read>(src: &mut R) -> Result<String> {
    let len = src.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| Ldm7Error::Invalid(format!("non-UTF-8 string: {e}")))
}

fn read_signature<R: Read>(src: &mut R) -> Result<Signature> {
    let mut bytes = [0u8; 16];
    src.read_exact(&mut bytes)?;
    Ok(Signature(bytes))
}

fn write_product(out: &mut Vec<u8>, product: &DataProduct) {
    product.info.encode(out);
    out.extend_from_slice(&product.data);
}

fn read_product<R: Read>(src: &mut R) -> Result<DataProduct> {
    let info = ProductInfo::decode(src).map_err(Ldm7Error::from)?;
    let mut data = vec![0u8; info.size as usize];
    src.read_exact(&mut data)?;
    Ok(DataProduct { info, data })
}

/// Writes one framed message.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut body = Vec::with_capacity(64);
    msg.encode_body(&mut body);
    let mut frame = Vec::with_capacity(body.len() + 6);
    WriteBytesExt::write_u32::<BigEndian>(&mut frame, body.len() as u32 + 2).unwrap();
    WriteBytesExt::write_u16::<BigEndian>(&mut frame, msg.op()).unwrap();
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message. `Ok(None)` means the peer closed cleanly at a
/// frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len < 2 || len > MAX_FRAME {
        return Err(Ldm7Error::Invalid(format!("bad frame length {len}")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let op = u16::from_be_bytes([body[0], body[1]]);
    Ok(Some(Message::decode(op, &body[2..])?))
}
