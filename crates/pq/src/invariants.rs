//! Debug assertion macros for queue invariants.
//!
//! Active only in debug builds; release builds pay nothing. The predicates
//! cover the quiescent-point rules every mutation must restore: bounded
//! occupancy, signature-table cardinality, and arrival-list integrity.

// =============================================================================
// INV-CAP-01: Bounded Data Occupancy
// =============================================================================

/// Assert `data_used ≤ data_capacity` after a mutation.
macro_rules! debug_assert_data_bounded {
    ($used:expr, $capacity:expr) => {
        debug_assert!(
            $used <= $capacity,
            "INV-CAP-01 violated: data_used {} exceeds data_capacity {}",
            $used,
            $capacity
        )
    };
}

// =============================================================================
// INV-CAP-02: Bounded Slot Occupancy
// =============================================================================

/// Assert `slots_used ≤ slot_capacity` after a mutation.
macro_rules! debug_assert_slots_bounded {
    ($used:expr, $capacity:expr) => {
        debug_assert!(
            $used <= $capacity,
            "INV-CAP-02 violated: slots_used {} exceeds slot_capacity {}",
            $used,
            $capacity
        )
    };
}

// =============================================================================
// INV-SIG-01: Signature Table Cardinality
// =============================================================================

/// Assert the signature table indexes exactly the live records.
macro_rules! debug_assert_sig_cardinality {
    ($table_live:expr, $live_count:expr) => {
        debug_assert!(
            $table_live == $live_count,
            "INV-SIG-01 violated: table holds {} entries for {} live records",
            $table_live,
            $live_count
        )
    };
}

// =============================================================================
// INV-ARN-01: Free Pool Abuts The Head
// =============================================================================

/// Assert a freed extent starts exactly at the arena head.
macro_rules! debug_assert_frees_prefix {
    ($offset:expr, $head:expr) => {
        debug_assert!(
            $offset == $head,
            "INV-ARN-01 violated: freeing extent at {} but arena head is {}",
            $offset,
            $head
        )
    };
}

pub(crate) use {
    debug_assert_data_bounded, debug_assert_frees_prefix, debug_assert_sig_cardinality,
    debug_assert_slots_bounded,
};
