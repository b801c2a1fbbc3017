//! Per-(peer, feed) persistent session memory.
//!
//! Holds the signature of the last product received via multicast in the
//! previous session, so a restarted receiver can request exactly the
//! backlog it missed. One small file per session, rewritten atomically
//! (write-temp then rename); last writer wins.

use crate::error::{Ldm7Error, Result};
use pq::{FeedType, Signature};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryRecord {
    /// Lowercase hex of the last multicast signature.
    last_mcast: Option<String>,
}

/// Durable memory of one (peer, feed) session.
pub struct SessionMemory {
    path: PathBuf,
    record: MemoryRecord,
}

impl SessionMemory {
    /// File path for a (peer, feed) pair under `dir`.
    pub fn path_for(dir: &Path, peer: &str, feed: FeedType) -> PathBuf {
        let peer = peer.replace(['/', ':'], "_");
        dir.join(format!("{peer}_{:08x}.yaml", feed.0))
    }

    /// Opens (or starts fresh) the memory for a (peer, feed) pair.
    pub fn open(dir: &Path, peer: &str, feed: FeedType) -> Result<SessionMemory> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, peer, feed);
        let record = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Ldm7Error::Corrupt(format!("session memory unreadable: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryRecord::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(SessionMemory { path, record })
    }

    /// Signature of the last product received via multicast in the prior
    /// session, if any was recorded.
    pub fn last_mcast(&self) -> Option<Signature> {
        self.record
            .last_mcast
            .as_deref()
            .and_then(|hex| hex.parse().ok())
    }

    /// Records the most recent multicast signature and persists it.
    pub fn set_last_mcast(&mut self, sig: &Signature) -> Result<()> {
        self.record.last_mcast = Some(sig.to_string());
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let body = serde_json::to_vec_pretty(&self.record)
            .map_err(|e| Ldm7Error::Logic(format!("session memory serialization: {e}")))?;
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the persistent record for a (peer, feed) pair.
    pub fn delete(dir: &Path, peer: &str, feed: FeedType) -> Result<()> {
        match fs::remove_file(Self::path_for(dir, peer, feed)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_memory_has_no_signature() {
        let dir = tempfile::tempdir().unwrap();
        let mem = SessionMemory::open(dir.path(), "up.example.net", FeedType::EXP).unwrap();
        assert_eq!(mem.last_mcast(), None);
    }

    #[test]
    fn set_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sig = Signature::digest(b"last product");
        {
            let mut mem = SessionMemory::open(dir.path(), "up.example.net", FeedType::EXP).unwrap();
            mem.set_last_mcast(&sig).unwrap();
        }
        let mem = SessionMemory::open(dir.path(), "up.example.net", FeedType::EXP).unwrap();
        assert_eq!(mem.last_mcast(), Some(sig));
    }

    #[test]
    fn last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let a = Signature::digest(b"a");
        let b = Signature::digest(b"b");
        let mut mem = SessionMemory::open(dir.path(), "peer", FeedType::HDS).unwrap();
        mem.set_last_mcast(&a).unwrap();
        mem.set_last_mcast(&b).unwrap();
        let back = SessionMemory::open(dir.path(), "peer", FeedType::HDS).unwrap();
        assert_eq!(back.last_mcast(), Some(b));
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = SessionMemory::open(dir.path(), "peer", FeedType::EXP).unwrap();
        mem.set_last_mcast(&Signature::digest(b"x")).unwrap();
        let path = mem.path().to_owned();
        assert!(path.exists());
        SessionMemory::delete(dir.path(), "peer", FeedType::EXP).unwrap();
        assert!(!path.exists());
        // Deleting again is fine.
        SessionMemory::delete(dir.path(), "peer", FeedType::EXP).unwrap();
    }

    #[test]
    fn feeds_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = SessionMemory::path_for(dir.path(), "peer", FeedType::EXP);
        let p2 = SessionMemory::path_for(dir.path(), "peer", FeedType::HDS);
        assert_ne!(p1, p2);
    }
}
