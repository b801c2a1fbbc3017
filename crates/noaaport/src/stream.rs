//! NOAAPort stream construction.
//!
//! Builds byte streams frame-by-frame for loopback testing and for the
//! deterministic simulator: channel captures are not always at hand, and a
//! builder that speaks the exact frame format keeps fixtures honest.

use crate::assembler::deflate;
use crate::frames::{
    encode_ccb, Pdh, Psh, Sbn, CMD_DATA, CMD_TIME, PDH_SIZE, PSH_FLAG_CCB, PSH_SIZE, XFR_COMPRESSED,
    XFR_END, XFR_HAS_PSH, XFR_START,
};

/// Describes one product to serialize.
#[derive(Debug, Clone)]
pub struct ProductSpec {
    pub prod_seqno: u32,
    pub stream: u8,
    pub category: u8,
    pub payload: Vec<u8>,
    pub fragments: usize,
    pub compressed: bool,
    pub with_ccb: bool,
}

/// Frame-accurate stream builder with a running SBN sequence number.
pub struct StreamBuilder {
    out: Vec<u8>,
    seqno: u32,
    runno: u16,
}

impl StreamBuilder {
    pub fn new(runno: u16) -> StreamBuilder {
        StreamBuilder {
            out: Vec::new(),
            seqno: 0,
            runno,
        }
    }

    /// Starts numbering at an arbitrary point, e.g. near the wrap.
    pub fn with_start_seqno(mut self, seqno: u32) -> StreamBuilder {
        self.seqno = seqno;
        self
    }

    fn next_sbn(&mut self, command: u8, datastream: u8) -> Sbn {
        let sbn = Sbn {
            control: 0,
            version: 1,
            control2: 0,
            command,
            datastream,
            source: 1,
            destination: 0,
            seqno: self.seqno,
            runno: self.runno,
        };
        self.seqno = self.seqno.wrapping_add(1);
        sbn
    }

    /// Appends a time-synchronization frame.
    pub fn push_time_frame(&mut self) {
        let sbn = self.next_sbn(CMD_TIME, 0);
        self.out.extend_from_slice(&sbn.encode());
    }

    /// Appends arbitrary bytes (noise, partial frames) for resync tests.
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Serializes a whole product and appends its frames.
    pub fn push_product(&mut self, spec: &ProductSpec) {
        for frame in self.product_frames(spec) {
            self.out.extend_from_slice(&frame);
        }
    }

    /// Serializes a product into individual frames so callers can drop or
    /// reorder them.
    pub fn product_frames(&mut self, spec: &ProductSpec) -> Vec<Vec<u8>> {
        let body = if spec.compressed {
            deflate(&spec.payload)
        } else {
            spec.payload.clone()
        };
        let fragments = spec.fragments.max(1);
        let block_size = body.len().div_ceil(fragments).max(1);

        let mut frames = Vec::with_capacity(fragments);
        for (number, chunk) in chunks_padded(&body, block_size, fragments).into_iter().enumerate() {
            let first = number == 0;
            let last = number == fragments - 1;
            let mut transfer_type = 0;
            if first {
                transfer_type |= XFR_START | XFR_HAS_PSH;
            }
            if last {
                transfer_type |= XFR_END;
            }
            if spec.compressed {
                transfer_type |= XFR_COMPRESSED;
            }

            let psh = first.then_some(Psh {
                opt_field_number: 0,
                opt_field_type: 0,
                opt_field_length: PSH_SIZE as u16,
                version: 1,
                flag: if spec.with_ccb { PSH_FLAG_CCB } else { 0 },
                awips_data_len: 0,
                bytes_per_record: block_size as u16,
                ptype: 1,
                pcategory: spec.category,
                pcode: 0,
                num_fragments: fragments as u16,
                next_head_off: 0,
                source: 1,
                seqno: spec.prod_seqno,
                receive_time: 0,
            });
            let pdh = Pdh {
                version: 1,
                transfer_type,
                total_size: (PDH_SIZE + if first { PSH_SIZE } else { 0 }) as u16,
                block_number: number as u16,
                data_block_offset: 0,
                data_block_size: chunk.len() as u16,
                recs_per_block: 1,
                blocks_per_rec: 1,
                prod_seqno: spec.prod_seqno,
            };

            let sbn = self.next_sbn(CMD_DATA, spec.stream);
            let mut frame = Vec::with_capacity(64 + chunk.len());
            frame.extend_from_slice(&sbn.encode());
            frame.extend_from_slice(&pdh.encode());
            if let Some(psh) = psh {
                frame.extend_from_slice(&psh.encode());
            }
            if first && spec.with_ccb {
                frame.extend_from_slice(&encode_ccb(8));
            }
            frame.extend_from_slice(&chunk);
            frames.push(frame);
        }
        frames
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

fn chunks_padded(body: &[u8], block_size: usize, fragments: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(fragments);
    for i in 0..fragments {
        let start = (i * block_size).min(body.len());
        let end = ((i + 1) * block_size).min(body.len());
        out.push(body[start..end].to_vec());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{Frame, FrameScanner};

    #[test]
    fn built_stream_scans_back() {
        let mut b = StreamBuilder::new(3);
        b.push_time_frame();
        b.push_product(&ProductSpec {
            prod_seqno: 1,
            stream: crate::frames::STREAM_NWSTG,
            category: crate::frames::CAT_TEXT,
            payload: b"\x01\r\r\n001 \r\r\nSDUS53 KARX 221853\r\r\nBODY".to_vec(),
            fragments: 2,
            compressed: false,
            with_ccb: false,
        });
        let stream = b.finish();

        let mut scanner = FrameScanner::new(stream.as_slice());
        assert!(matches!(scanner.next_frame().unwrap().unwrap(), Frame::Time(_)));
        let mut data_frames = 0;
        while let Some(frame) = scanner.next_frame().unwrap() {
            assert!(matches!(frame, Frame::Data(_)));
            data_frames += 1;
        }
        assert_eq!(data_frames, 2);
    }

    #[test]
    fn ccb_products_scan_back_with_ccb() {
        let mut b = StreamBuilder::new(1);
        b.push_product(&ProductSpec {
            prod_seqno: 9,
            stream: crate::frames::STREAM_NWSTG,
            category: crate::frames::CAT_TEXT,
            payload: b"\x01\r\r\n002 \r\r\nFTUS43 KDMX 010000\r\r\nFORECAST".to_vec(),
            fragments: 1,
            compressed: false,
            with_ccb: true,
        });
        let stream = b.finish();
        let mut scanner = FrameScanner::new(stream.as_slice());
        match scanner.next_frame().unwrap().unwrap() {
            Frame::Data(f) => {
                assert!(f.ccb.is_some());
                assert_eq!(f.ccb.unwrap().len(), 8);
            }
            Frame::Time(_) => panic!("expected data"),
        }
    }
}
