//! Caller-address access control.
//!
//! Each entry pairs a host pattern with the feed mask that host may
//! subscribe to. A subscription is granted the intersection of what it
//! asked for and what the matching entries allow.

use crate::error::{Ldm7Error, Result};
use pq::FeedType;
use regex::Regex;

struct AclEntry {
    host: Regex,
    allowed: FeedType,
}

/// Host-pattern → allowed-feed access list.
#[derive(Default)]
pub struct Acl {
    entries: Vec<AclEntry>,
}

impl Acl {
    pub fn new() -> Acl {
        Acl::default()
    }

    /// An ACL that grants every host every feed; for tests and closed
    /// networks.
    pub fn allow_all() -> Acl {
        let mut acl = Acl::new();
        acl.allow(Regex::new(".*").expect("static pattern"), FeedType::ANY);
        acl
    }

    /// Grants hosts matching `pattern` the feeds in `allowed`.
    pub fn allow(&mut self, pattern: Regex, allowed: FeedType) -> &mut Acl {
        self.entries.push(AclEntry {
            host: pattern,
            allowed,
        });
        self
    }

    /// Resolves a subscription request from `host` for `requested`.
    ///
    /// Fails `Unauth` when no entry matches the host at all, `Unsupported`
    /// when entries match but allow none of the requested feeds.
    pub fn check(&self, host: &str, requested: FeedType) -> Result<FeedType> {
        let mut allowed = FeedType::NONE;
        let mut host_known = false;
        for entry in &self.entries {
            if entry.host.is_match(host) {
                host_known = true;
                allowed = allowed.union(entry.allowed);
            }
        }
        if !host_known {
            return Err(Ldm7Error::Unauth(format!("no ACL entry for {host}")));
        }
        let granted = requested.intersect(allowed);
        if granted.is_empty() {
            return Err(Ldm7Error::Unsupported(format!(
                "host {host} may not subscribe to {requested}"
            )));
        }
        Ok(granted)
    }
}
