//! Dispatch strategies: which pooled connections receive a message.
//!
//! Selection is pure index arithmetic against a snapshot of the pool taken
//! at the instant of the call; it never suspends, so the pool cannot change
//! length mid-selection. Callers guarantee a non-empty pool (the producer
//! converts an empty pool into `ClientError::NoConnections` before selection
//! is ever reached).
//!
//! The strategy set is a closed enum matched exhaustively: adding a new
//! strategy is a compile-time-checked extension rather than a runtime lookup.

/// How `produce()` routes a message across the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One connection per call, cycling through the pool.
    RoundRobin,
    /// Every call publishes to a window of the pool (the whole pool unless
    /// `max_fanout_nodes` bounds it).
    FanOut,
    /// Always the connection at index 0; used in single-daemon direct mode.
    Direct,
}

impl Strategy {
    /// Select the pool indices that receive this publish.
    ///
    /// `cursor` is the pre-increment dispatch counter; the caller increments
    /// it by one per call regardless of outcome, for round-robin and fan-out
    /// alike. `pool_len` must be non-zero.
    ///
    /// Fan-out selects a contiguous wrap-around window of
    /// `min(max_fanout_nodes, pool_len)` starting at `cursor % pool_len`,
    /// so a bounded fan-out rotates which subset of nodes each publish hits.
    pub fn select(&self, pool_len: usize, cursor: u64, max_fanout_nodes: Option<usize>) -> Vec<usize> {
        debug_assert!(pool_len > 0, "selection against an empty pool");

        match self {
            Strategy::RoundRobin => vec![(cursor % pool_len as u64) as usize],
            Strategy::FanOut => {
                let start = (cursor % pool_len as u64) as usize;
                let window = max_fanout_nodes.unwrap_or(pool_len);
                partial_window(window, start, pool_len)
            }
            Strategy::Direct => vec![0],
        }
    }
}

/// Wrap-around window of `len` indices starting at `start`, clamped to the
/// pool length.
fn partial_window(len: usize, start: usize, pool_len: usize) -> Vec<usize> {
    let len = len.min(pool_len);
    (0..len).map(|i| (start + i) % pool_len).collect()
}
