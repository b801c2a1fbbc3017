//! NOAAPort frame header layers, bit-exact.
//!
//! Per-frame structure on the wire:
//!
//! ```text
//! SBN (16 B, starts with the 0xFF sentinel byte)
//! PDH (16 B)
//! PSH (28 B, present when the PDH transfer type says so)
//! data block (PDH data_block_size bytes; may begin with a CCB)
//! ```
//!
//! SBN layout (all multi-byte fields big-endian):
//!
//! ```text
//! Offset  Size  Field
//! 0       1     address (the 0xFF frame sentinel)
//! 1       1     control
//! 2       1     version (high nibble) | header length / 4 (low nibble)
//! 3       1     control2
//! 4       1     command           (3 = DATA, 5 = TIME)
//! 5       1     data stream
//! 6       1     source
//! 7       1     destination
//! 8       4     sequence number
//! 12      2     run number
//! 14      2     checksum = sum(bytes[0..14]) & 0xFFFF
//! ```

use crate::error::{FrameError, Result};
use byteorder::{BigEndian, ByteOrder};

/// Frame sentinel: the SBN address byte.
pub const SBN_SENTINEL: u8 = 0xFF;
pub const SBN_SIZE: usize = 16;
pub const PDH_SIZE: usize = 16;
pub const PSH_SIZE: usize = 28;

/// SBN commands.
pub const CMD_DATA: u8 = 3;
pub const CMD_TIME: u8 = 5;

/// PDH transfer-type bits.
pub const XFR_START: u8 = 0x01;
pub const XFR_END: u8 = 0x04;
pub const XFR_ERROR: u8 = 0x08;
pub const XFR_COMPRESSED: u8 = 0x10;
pub const XFR_ABORT: u8 = 0x20;
pub const XFR_HAS_PSH: u8 = 0x40;

/// SBN data-stream identifiers.
pub const STREAM_NWSTG: u8 = 1;
pub const STREAM_GOES: u8 = 2;
pub const STREAM_NGRID: u8 = 3;
pub const STREAM_NOTHER: u8 = 4;

/// PSH product categories.
pub const CAT_TEXT: u8 = 1;
pub const CAT_OTHER: u8 = 2;
pub const CAT_IMAGE: u8 = 3;
pub const CAT_GRID: u8 = 4;
/// Bump added when a "text"/"other" product turns out to be binary.
pub const CAT_BINARY_BUMP: u8 = 100;

/// Satellite Broadcast Network frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sbn {
    pub control: u8,
    pub version: u8,
    pub control2: u8,
    pub command: u8,
    pub datastream: u8,
    pub source: u8,
    pub destination: u8,
    pub seqno: u32,
    pub runno: u16,
}

impl Sbn {
    /// Parses and validates 16 bytes starting at the sentinel.
    pub fn parse(buf: &[u8; SBN_SIZE]) -> Result<Sbn> {
        if buf[0] != SBN_SENTINEL {
            return Err(FrameError::Malformed("missing frame sentinel".into()));
        }
        let version = buf[2] >> 4;
        let hdr_len = usize::from(buf[2] & 0x0F) * 4;
        if hdr_len != SBN_SIZE {
            return Err(FrameError::Malformed(format!(
                "SBN header length {hdr_len} is not {SBN_SIZE}"
            )));
        }
        let checksum = BigEndian::read_u16(&buf[14..16]);
        let sum: u32 = buf[..14].iter().map(|&b| u32::from(b)).sum();
        if checksum != (sum & 0xFFFF) as u16 {
            return Err(FrameError::Malformed(format!(
                "SBN checksum {checksum:#06x} != {:#06x}",
                sum & 0xFFFF
            )));
        }
        let command = buf[4];
        if command != CMD_DATA && command != CMD_TIME {
            return Err(FrameError::Unsupported(format!("SBN command {command}")));
        }
        if version != 1 {
            return Err(FrameError::Unsupported(format!("SBN version {version}")));
        }
        Ok(Sbn {
            control: buf[1],
            version,
            control2: buf[3],
            command: buf[4],
            datastream: buf[5],
            source: buf[6],
            destination: buf[7],
            seqno: BigEndian::read_u32(&buf[8..12]),
            runno: BigEndian::read_u16(&buf[12..14]),
        })
    }

    /// Serializes, computing the checksum. Used by stream builders.
    pub fn encode(&self) -> [u8; SBN_SIZE] {
        let mut out = [0u8; SBN_SIZE];
        out[0] = SBN_SENTINEL;
        out[1] = self.control;
        out[2] = (self.version << 4) | ((SBN_SIZE / 4) as u8);
        out[3] = self.control2;
        out[4] = self.command;
        out[5] = self.datastream;
        out[6] = self.source;
        out[7] = self.destination;
        BigEndian::write_u32(&mut out[8..12], self.seqno);
        BigEndian::write_u16(&mut out[12..14], self.runno);
        let sum: u32 = out[..14].iter().map(|&b| u32::from(b)).sum();
        BigEndian::write_u16(&mut out[14..16], (sum & 0xFFFF) as u16);
        out
    }

    #[inline]
    pub fn is_time_sync(&self) -> bool {
        self.command == CMD_TIME
    }
}

/// Product-definition header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pdh {
    pub version: u8,
    pub transfer_type: u8,
    /// PDH + PSH length in bytes.
    pub total_size: u16,
    pub block_number: u16,
    pub data_block_offset: u16,
    pub data_block_size: u16,
    pub recs_per_block: u8,
    pub blocks_per_rec: u8,
    pub prod_seqno: u32,
}

impl Pdh {
    pub fn parse(buf: &[u8; PDH_SIZE]) -> Result<Pdh> {
        let version = buf[0] >> 4;
        let hdr_len = usize::from(buf[0] & 0x0F) * 4;
        if hdr_len != PDH_SIZE {
            return Err(FrameError::Malformed(format!(
                "PDH header length {hdr_len} is not {PDH_SIZE}"
            )));
        }
        let total_size = BigEndian::read_u16(&buf[2..4]);
        if usize::from(total_size) < PDH_SIZE {
            return Err(FrameError::Malformed(format!(
                "PDH total size {total_size} smaller than the PDH itself"
            )));
        }
        Ok(Pdh {
            version,
            transfer_type: buf[1],
            total_size,
            block_number: BigEndian::read_u16(&buf[4..6]),
            data_block_offset: BigEndian::read_u16(&buf[6..8]),
            data_block_size: BigEndian::read_u16(&buf[8..10]),
            recs_per_block: buf[10],
            blocks_per_rec: buf[11],
            prod_seqno: BigEndian::read_u32(&buf[12..16]),
        })
    }

    pub fn encode(&self) -> [u8; PDH_SIZE] {
        let mut out = [0u8; PDH_SIZE];
        out[0] = (self.version << 4) | ((PDH_SIZE / 4) as u8);
        out[1] = self.transfer_type;
        BigEndian::write_u16(&mut out[2..4], self.total_size);
        BigEndian::write_u16(&mut out[4..6], self.block_number);
        BigEndian::write_u16(&mut out[6..8], self.data_block_offset);
        BigEndian::write_u16(&mut out[8..10], self.data_block_size);
        out[10] = self.recs_per_block;
        out[11] = self.blocks_per_rec;
        BigEndian::write_u32(&mut out[12..16], self.prod_seqno);
        out
    }

    #[inline]
    pub fn has(&self, bit: u8) -> bool {
        self.transfer_type & bit != 0
    }

    /// PSH length implied by the total size.
    #[inline]
    pub fn psh_len(&self) -> usize {
        usize::from(self.total_size) - PDH_SIZE
    }
}

/// Product-specific header; present on the first frame of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Psh {
    pub opt_field_number: u8,
    pub opt_field_type: u8,
    pub opt_field_length: u16,
    pub version: u8,
    /// Bit 0x01: the data block begins with a CCB.
    pub flag: u8,
    pub awips_data_len: u16,
    pub bytes_per_record: u16,
    pub ptype: u8,
    pub pcategory: u8,
    pub pcode: u16,
    pub num_fragments: u16,
    pub next_head_off: u16,
    pub source: u8,
    pub seqno: u32,
    pub receive_time: u32,
}

/// PSH flag bit: data block starts with a CCB.
pub const PSH_FLAG_CCB: u8 = 0x01;

impl Psh {
    pub fn parse(buf: &[u8]) -> Result<Psh> {
        if buf.len() < PSH_SIZE {
            return Err(FrameError::Malformed(format!(
                "PSH of {} bytes is shorter than {PSH_SIZE}",
                buf.len()
            )));
        }
        Ok(Psh {
            opt_field_number: buf[0],
            opt_field_type: buf[1],
            opt_field_length: BigEndian::read_u16(&buf[2..4]),
            version: buf[4],
            flag: buf[5],
            awips_data_len: BigEndian::read_u16(&buf[6..8]),
            bytes_per_record: BigEndian::read_u16(&buf[8..10]),
            ptype: buf[10],
            pcategory: buf[11],
            pcode: BigEndian::read_u16(&buf[12..14]),
            num_fragments: BigEndian::read_u16(&buf[14..16]),
            next_head_off: BigEndian::read_u16(&buf[16..18]),
            source: buf[18],
            seqno: BigEndian::read_u32(&buf[20..24]),
            receive_time: BigEndian::read_u32(&buf[24..28]),
        })
    }

    pub fn encode(&self) -> [u8; PSH_SIZE] {
        let mut out = [0u8; PSH_SIZE];
        out[0] = self.opt_field_number;
        out[1] = self.opt_field_type;
        BigEndian::write_u16(&mut out[2..4], self.opt_field_length);
        out[4] = self.version;
        out[5] = self.flag;
        BigEndian::write_u16(&mut out[6..8], self.awips_data_len);
        BigEndian::write_u16(&mut out[8..10], self.bytes_per_record);
        out[10] = self.ptype;
        out[11] = self.pcategory;
        BigEndian::write_u16(&mut out[12..14], self.pcode);
        BigEndian::write_u16(&mut out[14..16], self.num_fragments);
        BigEndian::write_u16(&mut out[16..18], self.next_head_off);
        out[18] = self.source;
        BigEndian::write_u32(&mut out[20..24], self.seqno);
        BigEndian::write_u32(&mut out[24..28], self.receive_time);
        out
    }
}

/// Communications Control Block length, decoded from its first two bytes
/// and counted in 16-bit words.
pub fn ccb_len_of(head: &[u8; 2]) -> Option<usize> {
    let words = usize::from(head[0] & 0x3F) << 8 | usize::from(head[1]);
    let len = words * 2;
    (len >= 2).then_some(len)
}

/// CCB length validated against the buffer that should contain it.
pub fn ccb_len(data: &[u8]) -> Option<usize> {
    if data.len() < 2 {
        return None;
    }
    let len = ccb_len_of(&[data[0], data[1]])?;
    (len <= data.len()).then_some(len)
}

/// Encodes a CCB of `len` bytes (must be even, ≥ 2) with zero body.
pub fn encode_ccb(len: usize) -> Vec<u8> {
    assert!(len >= 2 && len % 2 == 0, "CCB length must be an even count >= 2");
    let words = len / 2;
    let mut out = vec![0u8; len];
    out[0] = ((words >> 8) & 0x3F) as u8;
    out[1] = (words & 0xFF) as u8;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sbn() -> Sbn {
        Sbn {
            control: 0,
            version: 1,
            control2: 0,
            command: CMD_DATA,
            datastream: STREAM_NWSTG,
            source: 1,
            destination: 0,
            seqno: 1000,
            runno: 7,
        }
    }

    #[test]
    fn sbn_round_trips_with_valid_checksum() {
        let sbn = sample_sbn();
        let bytes = sbn.encode();
        assert_eq!(Sbn::parse(&bytes).unwrap(), sbn);
    }

    #[test]
    fn sbn_rejects_bad_checksum() {
        let mut bytes = sample_sbn().encode();
        bytes[14] ^= 0xFF;
        assert!(matches!(Sbn::parse(&bytes), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn sbn_rejects_unknown_command() {
        let mut sbn = sample_sbn();
        sbn.command = 9;
        let bytes = sbn.encode();
        assert!(matches!(Sbn::parse(&bytes), Err(FrameError::Unsupported(_))));
    }

    #[test]
    fn pdh_round_trips() {
        let pdh = Pdh {
            version: 1,
            transfer_type: XFR_START | XFR_HAS_PSH,
            total_size: (PDH_SIZE + PSH_SIZE) as u16,
            block_number: 0,
            data_block_offset: 0,
            data_block_size: 4000,
            recs_per_block: 1,
            blocks_per_rec: 1,
            prod_seqno: 42,
        };
        let bytes = pdh.encode();
        let back = Pdh::parse(&bytes).unwrap();
        assert_eq!(back, pdh);
        assert_eq!(back.psh_len(), PSH_SIZE);
        assert!(back.has(XFR_START));
        assert!(!back.has(XFR_END));
    }

    #[test]
    fn psh_round_trips() {
        let psh = Psh {
            opt_field_number: 0,
            opt_field_type: 0,
            opt_field_length: PSH_SIZE as u16,
            version: 1,
            flag: PSH_FLAG_CCB,
            awips_data_len: 0,
            bytes_per_record: 4000,
            ptype: 1,
            pcategory: CAT_TEXT,
            pcode: 0,
            num_fragments: 3,
            next_head_off: 0,
            source: 1,
            seqno: 42,
            receive_time: 0,
        };
        assert_eq!(Psh::parse(&psh.encode()).unwrap(), psh);
    }

    #[test]
    fn ccb_length_encoding() {
        let ccb = encode_ccb(24);
        assert_eq!(ccb_len(&ccb), Some(24));
        assert_eq!(ccb_len(&[0, 1]), Some(2));
        assert_eq!(ccb_len(&[0x3F, 0xFF]), None); // longer than the buffer
        assert_eq!(ccb_len(&[]), None);
    }
}
