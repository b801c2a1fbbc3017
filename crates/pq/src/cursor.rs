//! Cursor traversal types: match classes and cursor modes.

use crate::info::{FeedType, ProductInfo};
use regex::Regex;

/// Cursor comparison mode for [`crate::Pq::sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// Strictly newer than the cursor position.
    Gt,
    /// At or after the cursor position.
    Ge,
}

/// Filter over product metadata: feed-type intersection plus an optional
/// identifier pattern.
#[derive(Debug, Clone)]
pub struct ProductClass {
    pub feed: FeedType,
    pub pattern: Option<Regex>,
}

impl ProductClass {
    /// Matches every product.
    pub fn everything() -> ProductClass {
        ProductClass {
            feed: FeedType::ANY,
            pattern: None,
        }
    }

    /// Matches products of any feed bit in `feed`.
    pub fn for_feed(feed: FeedType) -> ProductClass {
        ProductClass {
            feed,
            pattern: None,
        }
    }

    /// Adds an identifier pattern.
    pub fn with_pattern(mut self, pattern: Regex) -> ProductClass {
        self.pattern = Some(pattern);
        self
    }

    /// Returns `true` if `info` satisfies both filter dimensions.
    pub fn matches(&self, info: &ProductInfo) -> bool {
        if !self.feed.matches(info.feed) {
            return false;
        }
        match &self.pattern {
            Some(re) => re.is_match(&info.ident),
            None => true,
        }
    }
}

/// Outcome of one cursor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seq {
    /// A matching product was visited and the cursor advanced.
    Advanced,
    /// No matching product beyond the cursor; callers typically suspend and
    /// re-query.
    End,
}

/// Why a suspended caller woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A new product was committed since the caller went to sleep.
    NewProduct,
    /// The timeout elapsed.
    Timeout,
    /// An [`crate::Unblocker`] fired.
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig::Signature;
    use std::time::SystemTime;

    fn info(feed: FeedType, ident: &str) -> ProductInfo {
        ProductInfo {
            signature: Signature::digest(ident.as_bytes()),
            arrival: SystemTime::now(),
            origin: "test".into(),
            feed,
            seqno: 0,
            ident: ident.into(),
            size: 0,
        }
    }

    #[test]
    fn feed_and_pattern_both_apply() {
        let class = ProductClass::for_feed(FeedType::HDS)
            .with_pattern(Regex::new("^SDUS").unwrap());
        assert!(class.matches(&info(FeedType::HDS, "SDUS53 KARX")));
        assert!(!class.matches(&info(FeedType::HDS, "FTUS43 KDMX")));
        assert!(!class.matches(&info(FeedType::EXP, "SDUS53 KARX")));
    }

    #[test]
    fn everything_matches_everything() {
        assert!(ProductClass::everything().matches(&info(FeedType::EXP, "")));
    }
}
