//! Product reassembly.
//!
//! Frames fragment products by `block_number` within `prod_seqno`. The
//! assembler enforces strict block continuity, runs the per-product zlib
//! stream for compressed transfers, normalizes non-GOES trailers,
//! reclassifies NWSTG text that turns out to be binary, optionally
//! synthesizes missing GOES scan lines, and emits a finished
//! [`DataProduct`] with its signature computed. Assembly errors abort the
//! current product, never the pipeline.

use crate::error::{FrameError, Result};
use crate::frames::{
    CAT_BINARY_BUMP, CAT_GRID, CAT_OTHER, CAT_TEXT, STREAM_GOES, STREAM_NGRID, STREAM_NOTHER,
    STREAM_NWSTG, XFR_ABORT, XFR_COMPRESSED, XFR_END, XFR_ERROR, XFR_START,
};
use crate::scanner::{DataFrame, Frame};
use flate2::{Decompress, FlushDecompress, Status};
use pq::{DataProduct, FeedType, ProductInfo, Signature};
use std::io::Write;
use std::time::SystemTime;

/// Non-GOES heap sizing unit: the historical NWSTG maximum block.
pub const NWSTG_BLOCK_SIZE: usize = 4015;

/// Non-GOES product trailer.
pub const TRAILER: [u8; 4] = [0x0D, 0x0D, 0x0A, 0x03];

/// Length of the FOS prefix excluded from NWSTG signatures.
pub const FOS_PREFIX_LEN: usize = 11;

/// Bytes examined at each end of a payload for the ASCII check.
const ASCII_PROBE: usize = 100;

/// Assembly policy knobs.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Origin hostname recorded in product metadata.
    pub origin: String,
    /// Synthesize missing GOES blocks so imagery keeps its geometry.
    pub goes_fill: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        AssemblerConfig {
            origin: "noaaport".into(),
            goes_fill: false,
        }
    }
}

/// Counters exposed to harnesses and logs.
#[derive(Debug, Default, Clone)]
pub struct AssemblerStats {
    pub products: u64,
    pub missed_frames: u64,
    pub retrograde_frames: u64,
    pub aborted_products: u64,
    pub filled_products: u64,
}

struct OpenProduct {
    prod_seqno: u32,
    next_block: u16,
    num_fragments: u16,
    stream: u8,
    category: u8,
    compressed: bool,
    inflater: Option<Decompress>,
    heap: Vec<u8>,
    ident: Option<String>,
    block_size: usize,
}

/// The per-channel reassembly state machine.
pub struct Assembler {
    cfg: AssemblerConfig,
    current: Option<OpenProduct>,
    last_seqno: Option<u32>,
    last_runno: Option<u16>,
    retrograde_episode: bool,
    /// Invoked with the product sequence number of an aborted product so a
    /// collaborator can request retransmission.
    retransmit: Option<Box<dyn FnMut(u32) + Send>>,
    pub stats: AssemblerStats,
}

impl Assembler {
    pub fn new(cfg: AssemblerConfig) -> Assembler {
        Assembler {
            cfg,
            current: None,
            last_seqno: None,
            last_runno: None,
            retrograde_episode: false,
            retransmit: None,
            stats: AssemblerStats::default(),
        }
    }

    /// Installs the retransmission-request hook.
    pub fn on_abort_retransmit(&mut self, hook: impl FnMut(u32) + Send + 'static) {
        self.retransmit = Some(Box::new(hook));
    }

    /// Feeds one frame; returns a finished product when one completes.
    pub fn handle_frame(&mut self, frame: &Frame) -> Result<Option<DataProduct>> {
        let sbn = frame.sbn();

        // A run-number change resets the sequence baseline.
        if self.last_runno != Some(sbn.runno) {
            if self.last_runno.is_some() {
                tracing::info!(runno = sbn.runno, "SBN run change, sequence reset");
            }
            self.last_runno = Some(sbn.runno);
            self.last_seqno = None;
        }

        // Gap and retrograde accounting over the SBN sequence space.
        if let Some(last) = self.last_seqno {
            let delta = sbn.seqno.wrapping_sub(last);
            if delta == 0 || delta >= 1 << 31 {
                if !self.retrograde_episode {
                    tracing::warn!(seqno = sbn.seqno, last, "retrograde frame sequence");
                    self.retrograde_episode = true;
                }
                self.stats.retrograde_frames += 1;
                return Ok(None);
            }
            self.retrograde_episode = false;
            if delta > 1 && matches!(frame, Frame::Data(_)) {
                // Gaps that close on a SYNC frame are not data loss.
                self.stats.missed_frames += u64::from(delta - 1);
                tracing::debug!(lost = delta - 1, "frame gap");
            }
        }
        self.last_seqno = Some(sbn.seqno);

        let Frame::Data(data) = frame else {
            return Ok(None);
        };
        self.handle_data_frame(data)
    }

    fn handle_data_frame(&mut self, f: &DataFrame) -> Result<Option<DataProduct>> {
        if f.pdh.has(XFR_ABORT) || f.pdh.has(XFR_ERROR) {
            self.abort_current("sender flagged error/abort");
            return Ok(None);
        }

        if f.pdh.has(XFR_START) && f.pdh.block_number == 0 {
            if self.current.is_some() {
                self.abort_current("new product began mid-assembly");
            }
            self.begin_product(f);
        } else {
            let matches = self
                .current
                .as_ref()
                .is_some_and(|c| c.prod_seqno == f.pdh.prod_seqno && c.next_block == f.pdh.block_number);
            if !matches {
                if self.current.is_some() {
                    self.abort_current("block continuity broken");
                }
                // Mid-product fragments with nothing open are remnants of a
                // product whose start was lost; drop them quietly.
                return Ok(None);
            }
            self.append_block(&f.block);
        }

        if f.pdh.has(XFR_END) {
            return self.finish_product();
        }
        Ok(None)
    }

    fn begin_product(&mut self, f: &DataFrame) {
        let Some(psh) = f.psh else {
            tracing::warn!(prod_seqno = f.pdh.prod_seqno, "product start without a PSH");
            return;
        };
        let compressed = f.pdh.has(XFR_COMPRESSED);
        // GOES geometry is measured in plaintext scan lines: prefer the
        // PSH record size, which stays meaningful when the wire blocks are
        // compressed; the data-block size only matches it uncompressed.
        let block_size = if f.sbn.datastream == STREAM_GOES {
            match usize::from(psh.bytes_per_record) {
                0 => usize::from(f.pdh.data_block_size).max(1),
                per_record => per_record,
            }
        } else {
            NWSTG_BLOCK_SIZE
        };
        let heap_hint = usize::from(psh.num_fragments).max(1) * block_size;

        // The CCB was peeled off by the scanner; for uncompressed text the
        // block now begins with the (FOS-prefixed) WMO heading.
        let ident = if compressed {
            None
        } else {
            parse_wmo_heading(&f.block)
        };

        let mut product = OpenProduct {
            prod_seqno: f.pdh.prod_seqno,
            next_block: 0,
            num_fragments: psh.num_fragments,
            stream: f.sbn.datastream,
            category: psh.pcategory,
            compressed,
            inflater: compressed.then(|| Decompress::new(true)),
            heap: Vec::with_capacity(heap_hint),
            ident,
            block_size,
        };
        match append_to_heap(&mut product, &f.block) {
            Ok(()) => {
                product.next_block = 1;
                self.current = Some(product);
            }
            Err(e) => {
                tracing::warn!(prod_seqno = f.pdh.prod_seqno, error = %e, "first block unusable");
                self.stats.aborted_products += 1;
                self.request_retransmit(f.pdh.prod_seqno);
            }
        }
    }

    fn append_block(&mut self, block: &[u8]) {
        let appended = match self.current.as_mut() {
            Some(current) => match append_to_heap(current, block) {
                Ok(()) => {
                    current.next_block += 1;
                    true
                }
                Err(e) => {
                    tracing::warn!(error = %e, "block append failed");
                    false
                }
            },
            None => true,
        };
        if !appended {
            self.abort_current("zlib stream error");
        }
    }

    fn finish_product(&mut self) -> Result<Option<DataProduct>> {
        let Some(mut p) = self.current.take() else {
            return Ok(None);
        };

        if let Some(mut inflater) = p.inflater.take() {
            if let Err(e) = inflate_finish(&mut inflater, &mut p.heap) {
                self.stats.aborted_products += 1;
                self.request_retransmit(p.prod_seqno);
                tracing::warn!(prod_seqno = p.prod_seqno, error = %e, "inflate finish failed");
                return Ok(None);
            }
        }

        // GOES fill: keep imagery geometry when the product ended early.
        let received = u32::from(p.next_block);
        let expected = u32::from(p.num_fragments);
        if p.stream == STREAM_GOES && self.cfg.goes_fill && received < expected {
            fill_goes_blocks(&mut p, expected - received);
            self.stats.filled_products += 1;
        }

        if p.stream != STREAM_GOES {
            normalize_trailer(&mut p.heap);
        }

        // Text that is not ASCII is binary in disguise; bump the category.
        if (p.stream == STREAM_NWSTG || p.stream == STREAM_NOTHER)
            && (p.category == CAT_TEXT || p.category == CAT_OTHER)
            && !payload_is_ascii(&p.heap)
        {
            tracing::debug!(prod_seqno = p.prod_seqno, "non-ASCII text product reclassified");
            p.category += CAT_BINARY_BUMP;
        }

        let signed_region = if p.stream == STREAM_NWSTG && p.heap.len() >= FOS_PREFIX_LEN {
            &p.heap[FOS_PREFIX_LEN..]
        } else {
            &p.heap[..]
        };
        let signature = Signature::digest(signed_region);

        let ident = p
            .ident
            .clone()
            .unwrap_or_else(|| format!("NOAAPORT seq {}", p.prod_seqno));
        let info = ProductInfo {
            signature,
            arrival: SystemTime::now(),
            origin: self.cfg.origin.clone(),
            feed: feed_for(p.stream, p.category),
            seqno: p.prod_seqno,
            ident,
            size: p.heap.len() as u64,
        };
        self.stats.products += 1;
        Ok(Some(DataProduct { info, data: p.heap }))
    }

    fn abort_current(&mut self, why: &str) {
        if let Some(p) = self.current.take() {
            tracing::warn!(prod_seqno = p.prod_seqno, why, "aborting product assembly");
            self.stats.aborted_products += 1;
            self.request_retransmit(p.prod_seqno);
        }
    }

    fn request_retransmit(&mut self, prod_seqno: u32) {
        if let Some(hook) = self.retransmit.as_mut() {
            hook(prod_seqno);
        }
    }
}

fn append_to_heap(p: &mut OpenProduct, block: &[u8]) -> Result<()> {
    match p.inflater.as_mut() {
        Some(inflater) => inflate_chunk(inflater, block, &mut p.heap),
        None => {
            p.heap.extend_from_slice(block);
            Ok(())
        }
    }
}

fn inflate_chunk(d: &mut Decompress, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut consumed = 0usize;
    while consumed < input.len() {
        if out.capacity() == out.len() {
            out.reserve(8192);
        }
        let before = d.total_in();
        let status = d
            .decompress_vec(&input[consumed..], out, FlushDecompress::None)
            .map_err(|e| FrameError::Compress(e.to_string()))?;
        consumed += (d.total_in() - before) as usize;
        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok => {}
            Status::BufError => {
                if out.capacity() == out.len() {
                    out.reserve(8192);
                } else if consumed < input.len() && d.total_in() == before {
                    return Err(FrameError::Compress("inflate made no progress".into()));
                }
            }
        }
    }
    Ok(())
}

fn inflate_finish(d: &mut Decompress, out: &mut Vec<u8>) -> Result<()> {
    loop {
        if out.capacity() == out.len() {
            out.reserve(8192);
        }
        let before_out = d.total_out();
        let status = d
            .decompress_vec(&[], out, FlushDecompress::Finish)
            .map_err(|e| FrameError::Compress(e.to_string()))?;
        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                if d.total_out() == before_out {
                    // Nothing more is coming; treat the stream as complete.
                    return Ok(());
                }
            }
        }
    }
}

/// Compresses bytes into a zlib stream; used by stream builders and the
/// GOES fill path.
pub fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(bytes).expect("writing to a Vec cannot fail");
    enc.finish().expect("finishing a Vec-backed encoder cannot fail")
}

fn fill_goes_blocks(p: &mut OpenProduct, missing: u32) {
    tracing::info!(prod_seqno = p.prod_seqno, missing, "synthesizing GOES fill blocks");
    if p.compressed {
        // The heap holds inflated bytes by the time fill runs, so the
        // synthesized blocks land as plaintext too: one zero scan line,
        // then one sentinel-pattern scan line.
        p.heap.extend(std::iter::repeat(0u8).take(p.block_size));
        p.heap
            .extend((0..p.block_size).map(|i| if i % 2 == 0 { 0xFF } else { 0x00 }));
    } else {
        p.heap.extend(std::iter::repeat(0u8).take(missing as usize * p.block_size));
    }
}

/// Strips every trailing `CR CR LF ETX` run, then appends exactly one.
pub fn normalize_trailer(heap: &mut Vec<u8>) {
    while heap.ends_with(&TRAILER) {
        let new_len = heap.len() - TRAILER.len();
        heap.truncate(new_len);
    }
    heap.extend_from_slice(&TRAILER);
}

/// ASCII probe over the first and last [`ASCII_PROBE`] payload bytes.
pub fn payload_is_ascii(heap: &[u8]) -> bool {
    let head = &heap[..heap.len().min(ASCII_PROBE)];
    let tail = &heap[heap.len().saturating_sub(ASCII_PROBE)..];
    head.iter().chain(tail).all(|&b| b.is_ascii())
}

/// Pulls a WMO-style heading ("TTAAii CCCC ...") out of the leading bytes
/// of a text product, skipping any FOS prefix.
pub fn parse_wmo_heading(block: &[u8]) -> Option<String> {
    let probe = &block[..block.len().min(64)];
    let mut start = None;
    for (i, &b) in probe.iter().enumerate() {
        if b.is_ascii_uppercase() {
            start = Some(i);
            break;
        }
        if !(b == 0x01 || b == 0x0D || b == 0x0A || b == b' ' || b.is_ascii_digit()) {
            return None;
        }
    }
    let start = start?;
    let end = probe[start..]
        .iter()
        .position(|&b| b == 0x0D || b == 0x0A)
        .map_or(probe.len(), |p| start + p);
    let line = std::str::from_utf8(&probe[start..end]).ok()?.trim();
    (line.len() >= 6).then(|| line.to_owned())
}

/// Maps (data stream, product category) to a feed type.
pub fn feed_for(stream: u8, category: u8) -> FeedType {
    match stream {
        STREAM_GOES => FeedType::NIMAGE,
        STREAM_NGRID => FeedType::NGRID,
        STREAM_NWSTG | STREAM_NOTHER => {
            if category >= CAT_BINARY_BUMP {
                FeedType::HDS
            } else {
                match category {
                    CAT_TEXT => FeedType::IDS,
                    CAT_GRID => FeedType::HDS,
                    CAT_OTHER => FeedType::NOTHER,
                    _ => FeedType::NOTHER,
                }
            }
        }
        _ => FeedType::NOTHER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{Pdh, Psh, Sbn, CMD_DATA, PDH_SIZE, PSH_SIZE, XFR_HAS_PSH};

    fn data_frame(
        seqno: u32,
        prod_seqno: u32,
        block_number: u16,
        flags: u8,
        num_fragments: u16,
        stream: u8,
        block: &[u8],
    ) -> Frame {
        let with_psh = block_number == 0;
        let sbn = Sbn {
            control: 0,
            version: 1,
            control2: 0,
            command: CMD_DATA,
            datastream: stream,
            source: 1,
            destination: 0,
            seqno,
            runno: 1,
        };
        let psh = with_psh.then_some(Psh {
            opt_field_number: 0,
            opt_field_type: 0,
            opt_field_length: PSH_SIZE as u16,
            version: 1,
            flag: 0,
            awips_data_len: 0,
            bytes_per_record: 0,
            ptype: 1,
            pcategory: CAT_TEXT,
            pcode: 0,
            num_fragments,
            next_head_off: 0,
            source: 1,
            seqno: prod_seqno,
            receive_time: 0,
        });
        let pdh = Pdh {
            version: 1,
            transfer_type: flags | if with_psh { XFR_HAS_PSH } else { 0 },
            total_size: (PDH_SIZE + if with_psh { PSH_SIZE } else { 0 }) as u16,
            block_number,
            data_block_offset: 0,
            data_block_size: block.len() as u16,
            recs_per_block: 1,
            blocks_per_rec: 1,
            prod_seqno,
        };
        Frame::Data(DataFrame {
            sbn,
            pdh,
            psh,
            ccb: None,
            block: block.to_vec(),
        })
    }

    fn nwstg_payload(body: &[u8]) -> Vec<u8> {
        // FOS prefix (11 bytes), then a WMO heading line, then the body.
        let mut out = b"\x01\r\r\n001 \r\r\n".to_vec();
        assert_eq!(out.len(), FOS_PREFIX_LEN);
        out.extend_from_slice(b"SDUS53 KARX 221853\r\r\n");
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn single_frame_product_assembles() {
        let mut asm = Assembler::new(AssemblerConfig::default());
        let payload = nwstg_payload(b"THE PRODUCT BODY");
        let product = asm
            .handle_frame(&data_frame(1, 500, 0, XFR_START | XFR_END, 1, STREAM_NWSTG, &payload))
            .unwrap()
            .unwrap();
        assert_eq!(product.info.seqno, 500);
        assert_eq!(product.info.ident, "SDUS53 KARX 221853");
        assert_eq!(product.info.feed, FeedType::IDS);
        // Trailer appended exactly once.
        assert!(product.data.ends_with(&TRAILER));
        assert!(!product.data[..product.data.len() - 4].ends_with(&TRAILER));
        // Signature excludes the FOS prefix.
        assert_eq!(
            product.info.signature,
            Signature::digest(&product.data[FOS_PREFIX_LEN..])
        );
    }

    #[test]
    fn multi_frame_product_concatenates_blocks() {
        let mut asm = Assembler::new(AssemblerConfig::default());
        let head = nwstg_payload(b"PART ONE ");
        assert!(asm
            .handle_frame(&data_frame(1, 7, 0, XFR_START, 3, STREAM_NWSTG, &head))
            .unwrap()
            .is_none());
        assert!(asm
            .handle_frame(&data_frame(2, 7, 1, 0, 3, STREAM_NWSTG, b"PART TWO "))
            .unwrap()
            .is_none());
        let product = asm
            .handle_frame(&data_frame(3, 7, 2, XFR_END, 3, STREAM_NWSTG, b"PART THREE"))
            .unwrap()
            .unwrap();
        let mut expected = head.clone();
        expected.extend_from_slice(b"PART TWO PART THREE");
        normalize_trailer(&mut expected);
        assert_eq!(product.data, expected);
    }

    #[test]
    fn block_discontinuity_aborts_and_requests_retransmission() {
        let mut asm = Assembler::new(AssemblerConfig::default());
        let requested = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let requested = std::sync::Arc::clone(&requested);
            asm.on_abort_retransmit(move |seqno| requested.lock().unwrap().push(seqno));
        }
        asm.handle_frame(&data_frame(1, 7, 0, XFR_START, 3, STREAM_NWSTG, b"\x01ONE"))
            .unwrap();
        // Block 1 lost; block 2 arrives.
        let out = asm
            .handle_frame(&data_frame(3, 7, 2, XFR_END, 3, STREAM_NWSTG, b"THREE"))
            .unwrap();
        assert!(out.is_none());
        assert_eq!(asm.stats.aborted_products, 1);
        assert_eq!(*requested.lock().unwrap(), vec![7]);
    }

    #[test]
    fn retrograde_frames_are_ignored() {
        let mut asm = Assembler::new(AssemblerConfig::default());
        let p = nwstg_payload(b"A");
        asm.handle_frame(&data_frame(100, 1, 0, XFR_START | XFR_END, 1, STREAM_NWSTG, &p))
            .unwrap();
        // Same sequence number again: retrograde.
        let out = asm
            .handle_frame(&data_frame(100, 2, 0, XFR_START | XFR_END, 1, STREAM_NWSTG, &p))
            .unwrap();
        assert!(out.is_none());
        assert_eq!(asm.stats.retrograde_frames, 1);
    }

    #[test]
    fn sequence_wrap_is_a_small_forward_delta() {
        let mut asm = Assembler::new(AssemblerConfig::default());
        let p = nwstg_payload(b"A");
        asm.handle_frame(&data_frame(u32::MAX - 1, 1, 0, XFR_START | XFR_END, 1, STREAM_NWSTG, &p))
            .unwrap();
        let out = asm
            .handle_frame(&data_frame(0, 2, 0, XFR_START | XFR_END, 1, STREAM_NWSTG, &p))
            .unwrap();
        assert!(out.is_some());
        // Forward delta of 2: one frame lost, not a retrograde.
        assert_eq!(asm.stats.retrograde_frames, 0);
        assert_eq!(asm.stats.missed_frames, 1);
    }

    #[test]
    fn binary_text_product_is_reclassified() {
        let mut asm = Assembler::new(AssemblerConfig::default());
        let mut payload = nwstg_payload(b"BINARY FOLLOWS ");
        payload.extend_from_slice(&[0x80, 0x81, 0x82, 0xFE]);
        let product = asm
            .handle_frame(&data_frame(1, 9, 0, XFR_START | XFR_END, 1, STREAM_NWSTG, &payload))
            .unwrap()
            .unwrap();
        assert_eq!(product.info.feed, FeedType::HDS);
    }

    #[test]
    fn compressed_product_inflates() {
        let mut asm = Assembler::new(AssemblerConfig::default());
        let body: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let packed = deflate(&body);
        let product = asm
            .handle_frame(&data_frame(
                1,
                11,
                0,
                XFR_START | XFR_END | XFR_COMPRESSED,
                1,
                STREAM_NGRID,
                &packed,
            ))
            .unwrap()
            .unwrap();
        let mut expected = body;
        normalize_trailer(&mut expected);
        assert_eq!(product.data, expected);
        assert_eq!(product.info.feed, FeedType::NGRID);
    }

    #[test]
    fn goes_fill_preserves_geometry() {
        let mut asm = Assembler::new(AssemblerConfig {
            goes_fill: true,
            ..AssemblerConfig::default()
        });
        let block = vec![0x42u8; 100];
        asm.handle_frame(&data_frame(1, 13, 0, XFR_START, 4, STREAM_GOES, &block))
            .unwrap();
        // Product ends after 2 of 4 blocks.
        let product = asm
            .handle_frame(&data_frame(2, 13, 1, XFR_END, 4, STREAM_GOES, &block))
            .unwrap()
            .unwrap();
        // Two real blocks plus two zero-filled blocks of the same size.
        assert_eq!(product.data.len(), 400);
        assert!(product.data[200..].iter().all(|&b| b == 0));
        assert_eq!(asm.stats.filled_products, 1);
    }

    #[test]
    fn compressed_goes_fill_lands_as_plaintext() {
        // Scan lines are 100 plaintext bytes; the wire carries one deflate
        // stream split across two frames, and the product ends two of four
        // blocks short.
        let mut asm = Assembler::new(AssemblerConfig {
            goes_fill: true,
            ..AssemblerConfig::default()
        });
        let plain = vec![0x42u8; 200];
        let packed = deflate(&plain);
        let split = packed.len() / 2;

        let with_record_size = |mut frame: Frame| {
            if let Frame::Data(df) = &mut frame {
                if let Some(psh) = df.psh.as_mut() {
                    psh.bytes_per_record = 100;
                }
            }
            frame
        };
        asm.handle_frame(&with_record_size(data_frame(
            1,
            17,
            0,
            XFR_START | XFR_COMPRESSED,
            4,
            STREAM_GOES,
            &packed[..split],
        )))
        .unwrap();
        let product = asm
            .handle_frame(&data_frame(
                2,
                17,
                1,
                XFR_END | XFR_COMPRESSED,
                4,
                STREAM_GOES,
                &packed[split..],
            ))
            .unwrap()
            .unwrap();

        // The heap stays in whole plaintext scan lines: the inflated bytes
        // plus one zero block and one sentinel block.
        assert_eq!(product.data.len(), 400);
        assert_eq!(product.data.len() % 100, 0);
        assert_eq!(&product.data[..200], &plain[..]);
        assert!(product.data[200..300].iter().all(|&b| b == 0));
        assert!(product.data[300..]
            .iter()
            .enumerate()
            .all(|(i, &b)| b == if i % 2 == 0 { 0xFF } else { 0x00 }));
        assert_eq!(asm.stats.filled_products, 1);
    }

    #[test]
    fn trailer_normalization_strips_repeats() {
        let mut heap = b"BODY".to_vec();
        heap.extend_from_slice(&TRAILER);
        heap.extend_from_slice(&TRAILER);
        heap.extend_from_slice(&TRAILER);
        normalize_trailer(&mut heap);
        assert_eq!(&heap[..4], b"BODY");
        assert_eq!(heap.len(), 4 + TRAILER.len());
    }
}
