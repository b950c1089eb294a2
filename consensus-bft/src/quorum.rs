//! Quorum arithmetic and primary selection.
//!
//! Pure functions shared by every node: all validators must agree on `f`,
//! the quorum size and who the primary is for any (height, view) pair.

/// Maximum number of faulty validators tolerated by a set of `n`.
///
/// `f = (n - 1) / 3`, and zero for an empty set.
pub fn fault_tolerance(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Minimum number of votes (`n - f`) that completes a phase.
pub fn quorum(n: usize) -> usize {
    n.saturating_sub(fault_tolerance(n))
}

/// Ordinal of the primary for the given height and view.
///
/// # Algorithm
///
/// `primary = (height + view) mod n`. Leadership rotates every view and
/// every height, so a single Byzantine leader cannot stall the chain.
///
/// Returns `None` for an empty validator set.
pub fn primary_index(height: u32, view: u8, n: usize) -> Option<usize> {
    if n == 0 {
        return None;
    }
    let seed = u64::from(height).wrapping_add(u64::from(view));
    usize::try_from(seed % n as u64).ok()
}

/// Check whether `index` is the primary for the given height and view.
pub fn is_primary(index: usize, height: u32, view: u8, n: usize) -> bool {
    primary_index(height, view, n) == Some(index)
}
