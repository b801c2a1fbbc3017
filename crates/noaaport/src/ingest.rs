//! Scanner → assembler → product queue plumbing.

use crate::assembler::{Assembler, AssemblerConfig};
use crate::error::Result;
use crate::scanner::{FrameScanner, FrameSource};
use pq::{Inserted, Pq, PqError};

/// Drives a frame source to exhaustion, inserting every assembled product
/// into the queue.
pub struct Ingester<'a, S> {
    pq: &'a Pq,
    scanner: FrameScanner<S>,
    pub assembler: Assembler,
    pub inserted: u64,
    pub duplicates: u64,
}

impl<'a, S: FrameSource> Ingester<'a, S> {
    pub fn new(pq: &'a Pq, src: S, cfg: AssemblerConfig) -> Ingester<'a, S> {
        Ingester {
            pq,
            scanner: FrameScanner::new(src),
            assembler: Assembler::new(cfg),
            inserted: 0,
            duplicates: 0,
        }
    }

    /// Processes frames until the source ends. Assembly failures abort the
    /// affected product only; queue corruption is the one fatal outcome.
    pub fn run(&mut self) -> Result<()> {
        while let Some(frame) = self.scanner.next_frame()? {
            let Some(product) = self.assembler.handle_frame(&frame)? else {
                continue;
            };
            match self.pq.insert(&product) {
                Ok(Inserted::New) => {
                    self.inserted += 1;
                    tracing::debug!(
                        ident = %product.info.ident,
                        size = product.info.size,
                        "product queued"
                    );
                }
                Ok(Inserted::Duplicate) => {
                    self.duplicates += 1;
                    tracing::info!(ident = %product.info.ident, "duplicate product");
                }
                Err(e @ (PqError::TooBig { .. } | PqError::System(_))) => {
                    tracing::warn!(ident = %product.info.ident, error = %e, "product dropped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
