//! Sentinel-synchronized frame scanning.
//!
//! Frames arrive on a byte stream with no out-of-band framing: the only
//! handle is the 0xFF sentinel that starts every SBN header. On any parse
//! failure the scanner advances byte-by-byte to the next sentinel and
//! tries again, logging the first failure of an episode and the eventual
//! recovery rather than every attempt.

use crate::error::{FrameError, Result};
use crate::frames::{Pdh, Psh, Sbn, PDH_SIZE, PSH_SIZE, SBN_SENTINEL, SBN_SIZE};
use std::io::Read;

/// Byte-source capability supplied by the collaborator (shared-memory FIFO
/// or file).
pub trait FrameSource {
    /// Reads up to `dst.len()` bytes; 0 means end of stream.
    fn read_bytes(&mut self, dst: &mut [u8]) -> std::io::Result<usize>;
}

impl<R: Read> FrameSource for R {
    fn read_bytes(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        self.read(dst)
    }
}

/// One parsed frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Time-synchronization frame; carries no product data.
    Time(Sbn),
    /// Product-data frame.
    Data(DataFrame),
}

impl Frame {
    pub fn sbn(&self) -> &Sbn {
        match self {
            Frame::Time(sbn) => sbn,
            Frame::Data(f) => &f.sbn,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataFrame {
    pub sbn: Sbn,
    pub pdh: Pdh,
    pub psh: Option<Psh>,
    /// Communications Control Block, when the PSH flags one.
    pub ccb: Option<Vec<u8>>,
    /// The data block, exactly `pdh.data_block_size` bytes.
    pub block: Vec<u8>,
}

const READ_CHUNK: usize = 8192;

/// Buffered scanner over a [`FrameSource`].
pub struct FrameScanner<S> {
    src: S,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    resyncing: bool,
    /// Bytes skipped while hunting for a sentinel.
    pub skipped_bytes: u64,
    /// Frames rejected for checksum/command/version reasons.
    pub rejected_frames: u64,
}

impl<S: FrameSource> FrameScanner<S> {
    pub fn new(src: S) -> FrameScanner<S> {
        FrameScanner {
            src,
            buf: Vec::with_capacity(READ_CHUNK * 2),
            pos: 0,
            eof: false,
            resyncing: false,
            skipped_bytes: 0,
            rejected_frames: 0,
        }
    }

    /// Returns the next well-formed frame, or `None` at end of stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if !self.seek_sentinel()? {
                return Ok(None);
            }
            match self.try_parse() {
                Ok(Some(frame)) => {
                    if self.resyncing {
                        tracing::info!(skipped = self.skipped_bytes, "frame sync recovered");
                        self.resyncing = false;
                    }
                    return Ok(Some(frame));
                }
                Ok(None) => return Ok(None), // stream ended mid-frame
                Err(e @ (FrameError::Malformed(_) | FrameError::Unsupported(_))) => {
                    self.rejected_frames += 1;
                    if !self.resyncing {
                        tracing::warn!(error = %e, "frame parse failed, resynchronizing");
                        self.resyncing = true;
                    }
                    // Step past this sentinel and hunt for the next.
                    self.pos += 1;
                    self.skipped_bytes += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Advances to the next sentinel byte. Returns `false` at end of
    /// stream.
    fn seek_sentinel(&mut self) -> Result<bool> {
        loop {
            while self.pos < self.buf.len() {
                if self.buf[self.pos] == SBN_SENTINEL {
                    self.compact();
                    return Ok(true);
                }
                self.pos += 1;
                self.skipped_bytes += 1;
                if !self.resyncing {
                    tracing::warn!("skipping bytes in search of a frame sentinel");
                    self.resyncing = true;
                }
            }
            if !self.fill()? {
                return Ok(false);
            }
        }
    }

    /// Attempts to parse a whole frame at the cursor (which sits on a
    /// sentinel). `Ok(None)` means the stream ended before the frame
    /// completed.
    fn try_parse(&mut self) -> Result<Option<Frame>> {
        let Some(sbn_bytes) = self.peek_array::<SBN_SIZE>(0)? else {
            return Ok(None);
        };
        let sbn = Sbn::parse(&sbn_bytes)?;
        if sbn.is_time_sync() {
            self.consume(SBN_SIZE);
            return Ok(Some(Frame::Time(sbn)));
        }

        let Some(pdh_bytes) = self.peek_array::<PDH_SIZE>(SBN_SIZE)? else {
            return Ok(None);
        };
        let pdh = Pdh::parse(&pdh_bytes)?;
        let psh_len = pdh.psh_len();
        if !self.ensure(SBN_SIZE + PDH_SIZE + psh_len)? {
            return Ok(None);
        }

        let psh = if psh_len > 0 {
            if psh_len < PSH_SIZE {
                return Err(FrameError::Malformed(format!(
                    "PSH length {psh_len} shorter than {PSH_SIZE}"
                )));
            }
            let start = self.pos + SBN_SIZE + PDH_SIZE;
            Some(Psh::parse(&self.buf[start..start + psh_len])?)
        } else {
            None
        };

        // A CCB sits between the PSH and the data block when flagged; its
        // length is self-describing.
        let mut ccb_bytes = 0usize;
        let mut ccb = None;
        if psh.is_some_and(|p| p.flag & crate::frames::PSH_FLAG_CCB != 0) {
            let ccb_start = SBN_SIZE + PDH_SIZE + psh_len;
            let Some(head) = self.peek_array::<2>(ccb_start)? else {
                return Ok(None);
            };
            let Some(len) = crate::frames::ccb_len_of(&head) else {
                return Err(FrameError::Malformed("bad CCB length".into()));
            };
            if !self.ensure(ccb_start + len)? {
                return Ok(None);
            }
            let start = self.pos + ccb_start;
            ccb = Some(self.buf[start..start + len].to_vec());
            ccb_bytes = len;
        }

        let frame_len =
            SBN_SIZE + PDH_SIZE + psh_len + ccb_bytes + usize::from(pdh.data_block_size);
        if !self.ensure(frame_len)? {
            return Ok(None);
        }
        let data_start = self.pos + SBN_SIZE + PDH_SIZE + psh_len + ccb_bytes;
        let block = self.buf[data_start..data_start + usize::from(pdh.data_block_size)].to_vec();
        self.consume(frame_len);
        Ok(Some(Frame::Data(DataFrame {
            sbn,
            pdh,
            psh,
            ccb,
            block,
        })))
    }

    fn peek_array<const N: usize>(&mut self, offset: usize) -> Result<Option<[u8; N]>> {
        if !self.ensure(offset + N)? {
            return Ok(None);
        }
        let start = self.pos + offset;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[start..start + N]);
        Ok(Some(out))
    }

    /// Ensures `n` bytes are buffered past the cursor.
    fn ensure(&mut self, n: usize) -> Result<bool> {
        while self.buf.len() - self.pos < n {
            if !self.fill()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let old_len = self.buf.len();
        self.buf.resize(old_len + READ_CHUNK, 0);
        let n = self.src.read_bytes(&mut self.buf[old_len..])?;
        self.buf.truncate(old_len + n);
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        Ok(true)
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
        self.compact();
    }

    fn compact(&mut self) {
        if self.pos >= READ_CHUNK {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{CMD_DATA, CMD_TIME, STREAM_NWSTG, XFR_END, XFR_START};

    fn data_frame_bytes(seqno: u32, prod_seqno: u32, payload: &[u8]) -> Vec<u8> {
        let sbn = Sbn {
            control: 0,
            version: 1,
            control2: 0,
            command: CMD_DATA,
            datastream: STREAM_NWSTG,
            source: 1,
            destination: 0,
            seqno,
            runno: 1,
        };
        let pdh = Pdh {
            version: 1,
            transfer_type: XFR_START | XFR_END,
            total_size: PDH_SIZE as u16,
            block_number: 0,
            data_block_offset: 0,
            data_block_size: payload.len() as u16,
            recs_per_block: 1,
            blocks_per_rec: 1,
            prod_seqno,
        };
        let mut out = Vec::new();
        out.extend_from_slice(&sbn.encode());
        out.extend_from_slice(&pdh.encode());
        out.extend_from_slice(payload);
        out
    }

    fn time_frame_bytes(seqno: u32) -> Vec<u8> {
        let sbn = Sbn {
            control: 0,
            version: 1,
            control2: 0,
            command: CMD_TIME,
            datastream: STREAM_NWSTG,
            source: 1,
            destination: 0,
            seqno,
            runno: 1,
        };
        sbn.encode().to_vec()
    }

    #[test]
    fn scans_consecutive_frames() {
        let mut stream = Vec::new();
        stream.extend(data_frame_bytes(1, 100, b"alpha"));
        stream.extend(time_frame_bytes(2));
        stream.extend(data_frame_bytes(3, 101, b"beta"));

        let mut scanner = FrameScanner::new(stream.as_slice());
        match scanner.next_frame().unwrap().unwrap() {
            Frame::Data(f) => assert_eq!(f.block, b"alpha"),
            Frame::Time(_) => panic!("expected data"),
        }
        assert!(matches!(scanner.next_frame().unwrap().unwrap(), Frame::Time(_)));
        match scanner.next_frame().unwrap().unwrap() {
            Frame::Data(f) => assert_eq!(f.block, b"beta"),
            Frame::Time(_) => panic!("expected data"),
        }
        assert!(scanner.next_frame().unwrap().is_none());
        assert_eq!(scanner.skipped_bytes, 0);
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut stream = vec![0x11, 0x22, 0x33];
        stream.extend(data_frame_bytes(1, 100, b"good"));

        let mut scanner = FrameScanner::new(stream.as_slice());
        match scanner.next_frame().unwrap().unwrap() {
            Frame::Data(f) => assert_eq!(f.block, b"good"),
            Frame::Time(_) => panic!("expected data"),
        }
        assert_eq!(scanner.skipped_bytes, 3);
    }

    #[test]
    fn resyncs_after_partial_frame_within_fifteen_bytes() {
        // A sentinel followed by a corrupt SBN, then a valid frame: the
        // scanner must find the real frame without consuming it.
        let mut stream = vec![SBN_SENTINEL];
        stream.extend(std::iter::repeat(0u8).take(10));
        stream.extend(data_frame_bytes(1, 100, b"recovered"));

        let mut scanner = FrameScanner::new(stream.as_slice());
        match scanner.next_frame().unwrap().unwrap() {
            Frame::Data(f) => assert_eq!(f.block, b"recovered"),
            Frame::Time(_) => panic!("expected data"),
        }
        assert!(scanner.skipped_bytes <= 15);
        assert!(scanner.rejected_frames >= 1);
    }

    #[test]
    fn corrupted_checksum_frame_is_skipped() {
        let mut bad = data_frame_bytes(1, 100, b"bad");
        bad[10] ^= 0xA5; // corrupt the SBN body, invalidating the checksum
        let mut stream = bad;
        stream.extend(data_frame_bytes(2, 101, b"ok"));

        let mut scanner = FrameScanner::new(stream.as_slice());
        match scanner.next_frame().unwrap().unwrap() {
            Frame::Data(f) => assert_eq!(f.block, b"ok"),
            Frame::Time(_) => panic!("expected data"),
        }
    }
}
