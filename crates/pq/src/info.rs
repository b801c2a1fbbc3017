//! Product metadata: feed-type bitmasks, product info, and its canonical
//! text and wire encodings.

use crate::error::{PqError, Result};
use crate::sig::Signature;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum length of a product identifier, in bytes.
pub const MAX_IDENT_LEN: usize = 255;

/// Maximum length of an origin hostname we persist, in bytes.
pub const MAX_ORIGIN_LEN: usize = 64;

/// A 32-bit feed-type bitmask used as a subscription filter.
///
/// Feed types form a set algebra: a subscription for `HDS | IDS` matches any
/// product whose feed intersects that mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedType(pub u32);

impl FeedType {
    pub const NONE: FeedType = FeedType(0);
    /// Public Products Service.
    pub const PPS: FeedType = FeedType(0x0000_0001);
    /// Domestic Data Service.
    pub const DDS: FeedType = FeedType(0x0000_0002);
    /// International Data Service.
    pub const IDS: FeedType = FeedType(0x0000_0004);
    /// High-resolution Data Service (model output).
    pub const HDS: FeedType = FeedType(0x0000_0008);
    /// NOAAPort gridded products.
    pub const NGRID: FeedType = FeedType(0x0000_0010);
    /// GOES satellite imagery.
    pub const NIMAGE: FeedType = FeedType(0x0000_0020);
    /// NOAAPort "other" stream.
    pub const NOTHER: FeedType = FeedType(0x0000_0040);
    /// All NWSTG text/binary streams.
    pub const NWSTG: FeedType = FeedType(0x0000_0007);
    /// Experimental feed.
    pub const EXP: FeedType = FeedType(0x4000_0000);
    /// Every feed.
    pub const ANY: FeedType = FeedType(0xFFFF_FFFF);

    #[inline]
    pub fn union(self, other: FeedType) -> FeedType {
        FeedType(self.0 | other.0)
    }

    #[inline]
    pub fn intersect(self, other: FeedType) -> FeedType {
        FeedType(self.0 & other.0)
    }

    #[inline]
    pub fn complement(self) -> FeedType {
        FeedType(!self.0)
    }

    /// Returns `true` if any bit of `other` is present in `self`.
    #[inline]
    pub fn matches(self, other: FeedType) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FeedType {
    type Output = FeedType;
    fn bitor(self, rhs: FeedType) -> FeedType {
        self.union(rhs)
    }
}

impl std::ops::BitAnd for FeedType {
    type Output = FeedType;
    fn bitand(self, rhs: FeedType) -> FeedType {
        self.intersect(rhs)
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FeedType::NONE => f.write_str("NONE"),
            FeedType::ANY => f.write_str("ANY"),
            FeedType::EXP => f.write_str("EXP"),
            other => write!(f, "{:#010x}", other.0),
        }
    }
}

/// Metadata describing one data-product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    /// Content digest; set before the product enters the queue.
    pub signature: Signature,
    /// Arrival time at the origin.
    pub arrival: SystemTime,
    /// Hostname of the origin site.
    pub origin: String,
    /// Feed-type bitmask of the product.
    pub feed: FeedType,
    /// Per-feed sequence number assigned by the origin.
    pub seqno: u32,
    /// Product identifier, at most [`MAX_IDENT_LEN`] bytes.
    pub ident: String,
    /// Payload size in bytes.
    pub size: u64,
}

impl ProductInfo {
    /// Validates the length limits this queue persists.
    pub fn validate(&self) -> Result<()> {
        if self.ident.len() > MAX_IDENT_LEN {
            return Err(PqError::Invalid(format!(
                "identifier of {} bytes exceeds {MAX_IDENT_LEN}",
                self.ident.len()
            )));
        }
        if self.origin.len() > MAX_ORIGIN_LEN {
            return Err(PqError::Invalid(format!(
                "origin of {} bytes exceeds {MAX_ORIGIN_LEN}",
                self.origin.len()
            )));
        }
        Ok(())
    }

    /// Formats the metadata in its canonical single-line text form:
    ///
    /// ```text
    /// <size> <secs>.<nanos> <feed> <seqno> <origin> <signature> <ident>
    /// ```
    ///
    /// The identifier is last and consumes the remainder of the line, so it
    /// may contain spaces. `parse` inverts this exactly.
    pub fn format(&self) -> String {
        let (secs, nanos) = split_time(self.arrival);
        format!(
            "{} {}.{:09} {:#010x} {} {} {} {}",
            self.size, secs, nanos, self.feed.0, self.seqno, self.origin, self.signature, self.ident
        )
    }

    /// Parses the canonical text form produced by [`ProductInfo::format`].
    pub fn parse(line: &str) -> Result<ProductInfo> {
        let mut fields = line.splitn(7, ' ');
        let size = next_field(&mut fields, "size")?
            .parse::<u64>()
            .map_err(|e| PqError::Invalid(format!("bad size: {e}")))?;
        let when = next_field(&mut fields, "arrival")?;
        let (secs, nanos) = when
            .split_once('.')
            .ok_or_else(|| PqError::Invalid("bad arrival time".into()))?;
        let secs = secs
            .parse::<u64>()
            .map_err(|e| PqError::Invalid(format!("bad arrival seconds: {e}")))?;
        let nanos = nanos
            .parse::<u32>()
            .map_err(|e| PqError::Invalid(format!("bad arrival nanos: {e}")))?;
        let feed = next_field(&mut fields, "feed")?;
        let feed = feed
            .strip_prefix("0x")
            .unwrap_or(feed)
            .trim_start_matches('0');
        let feed = if feed.is_empty() {
            0
        } else {
            u32::from_str_radix(feed, 16)
                .map_err(|e| PqError::Invalid(format!("bad feed mask: {e}")))?
        };
        let seqno = next_field(&mut fields, "seqno")?
            .parse::<u32>()
            .map_err(|e| PqError::Invalid(format!("bad seqno: {e}")))?;
        let origin = next_field(&mut fields, "origin")?.to_owned();
        let signature = next_field(&mut fields, "signature")?
            .parse::<Signature>()
            .map_err(|e| PqError::Invalid(e.to_string()))?;
        let ident = fields.next().unwrap_or("").to_owned();

        Ok(ProductInfo {
            signature,
            arrival: UNIX_EPOCH + Duration::new(secs, nanos),
            origin,
            feed: FeedType(feed),
            seqno,
            ident,
            size,
        })
    }

    /// Encodes the metadata in its canonical big-endian wire form.
    ///
    /// ```text
    /// Offset  Size  Field
    /// 0       16    signature
    /// 16      8     arrival seconds since epoch
    /// 24      4     arrival nanoseconds
    /// 28      4     feed mask
    /// 32      4     sequence number
    /// 36      8     payload size
    /// 44      1     origin length, then origin bytes
    /// ..      1     ident length, then ident bytes
    /// ```
    pub fn encode(&self, out: &mut Vec<u8>) {
        let (secs, nanos) = split_time(self.arrival);
        out.extend_from_slice(self.signature.as_bytes());
        out.write_u64::<BigEndian>(secs).unwrap();
        out.write_u32::<BigEndian>(nanos).unwrap();
        out.write_u32::<BigEndian>(self.feed.0).unwrap();
        out.write_u32::<BigEndian>(self.seqno).unwrap();
        out.write_u64::<BigEndian>(self.size).unwrap();
        out.push(self.origin.len() as u8);
        out.extend_from_slice(self.origin.as_bytes());
        out.push(self.ident.len().min(MAX_IDENT_LEN) as u8);
        out.extend_from_slice(&self.ident.as_bytes()[..self.ident.len().min(MAX_IDENT_LEN)]);
    }

    /// Decodes the wire form written by [`ProductInfo::encode`].
    pub fn decode<R: Read>(src: &mut R) -> Result<ProductInfo> {
        let mut sig = [0u8; 16];
        src.read_exact(&mut sig)?;
        let secs = src.read_u64::<BigEndian>()?;
        let nanos = src.read_u32::<BigEndian>()?;
        let feed = src.read_u32::<BigEndian>()?;
        let seqno = src.read_u32::<BigEndian>()?;
        let size = src.read_u64::<BigEndian>()?;
        let origin = read_short_string(src)?;
        let ident = read_short_string(src)?;
        Ok(ProductInfo {
            signature: Signature(sig),
            arrival: UNIX_EPOCH + Duration::new(secs, nanos),
            origin,
            feed: FeedType(feed),
            seqno,
            ident,
            size,
        })
    }
}

fn next_field<'a>(fields: &mut std::str::SplitN<'a, char>, name: &str) -> Result<&'a str> {
    fields
        .next()
        .ok_or_else(|| PqError::Invalid(format!("missing {name} field")))
}

fn read_short_string<R: Read>(src: &mut R) -> Result<String> {
    let mut len = [0u8; 1];
    src.read_exact(&mut len)?;
    let mut buf = vec![0u8; len[0] as usize];
    src.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| PqError::Invalid(format!("non-UTF-8 string field: {e}")))
}

pub(crate) fn split_time(t: SystemTime) -> (u64, u32) {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    (d.as_secs(), d.subsec_nanos())
}

/// A complete data-product: metadata plus an owned contiguous payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataProduct {
    pub info: ProductInfo,
    pub data: Vec<u8>,
}

impl DataProduct {
    /// Builds a product around a payload, computing its signature and size.
    pub fn new(
        origin: impl Into<String>,
        feed: FeedType,
        seqno: u32,
        ident: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let info = ProductInfo {
            signature: Signature::digest(&data),
            arrival: SystemTime::now(),
            origin: origin.into(),
            feed,
            seqno,
            ident: ident.into(),
            size: data.len() as u64,
        };
        DataProduct { info, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ProductInfo {
        ProductInfo {
            signature: Signature::digest(b"payload"),
            arrival: UNIX_EPOCH + Duration::new(1_690_000_000, 123_456_789),
            origin: "origin.example.net".into(),
            feed: FeedType::HDS | FeedType::IDS,
            seqno: 4021,
            ident: "SDUS53 KARX 221853 N0RARX".into(),
            size: 7,
        }
    }

    #[test]
    fn text_round_trip() {
        let info = sample_info();
        assert_eq!(ProductInfo::parse(&info.format()).unwrap(), info);
    }

    #[test]
    fn text_round_trip_with_empty_ident() {
        let mut info = sample_info();
        info.ident = String::new();
        assert_eq!(ProductInfo::parse(&info.format()).unwrap(), info);
    }

    #[test]
    fn wire_round_trip() {
        let info = sample_info();
        let mut buf = Vec::new();
        info.encode(&mut buf);
        let back = ProductInfo::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn feed_set_operations() {
        let sub = FeedType::HDS | FeedType::NGRID;
        assert!(sub.matches(FeedType::HDS));
        assert!(!sub.matches(FeedType::EXP));
        assert!(FeedType::ANY.matches(FeedType::EXP));
        assert_eq!(sub.intersect(FeedType::HDS), FeedType::HDS);
        assert!(!sub.complement().matches(FeedType::NGRID));
    }

    #[test]
    fn oversize_ident_rejected() {
        let mut info = sample_info();
        info.ident = "x".repeat(MAX_IDENT_LEN + 1);
        assert!(info.validate().is_err());
    }
}
