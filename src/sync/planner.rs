//! Splitting the delta into bounded batches.

use super::graph::first_parent_positions;
use super::model::{Batch, Commit};
use crate::error::SyncError;

/// Partition `delta` into `ceil(len / batch_size)` ordered batches.
///
/// Each batch is pushed by moving the destination to its frontier.  A batch
/// ending on the head's first-parent line uses its last commit; otherwise the
/// frontier is the latest first-parent commit inside the batch past the
/// previous frontier, or failing that the next one after the batch.  When the
/// previous frontier already lies at or beyond the end of a batch, the batch
/// is marked `carried` and needs no push of its own.
pub fn plan(delta: &[Commit], batch_size: usize) -> Result<Vec<Batch>, SyncError> {
    if batch_size == 0 {
        return Err(SyncError::Configuration(
            "batch size must be at least 1".to_string(),
        ));
    }
    if delta.is_empty() {
        return Ok(Vec::new());
    }

    let mainline = first_parent_positions(delta);
    let mut batches = Vec::with_capacity(delta.len().div_ceil(batch_size));
    let mut previous: Option<usize> = None;

    for (index, chunk) in delta.chunks(batch_size).enumerate() {
        let start = index * batch_size;
        let end = start + chunk.len() - 1;

        let frontier = match previous {
            Some(prev) if prev >= end => prev,
            _ => mainline
                .iter()
                .rev()
                .copied()
                .find(|&m| m <= end && previous.map_or(true, |prev| m > prev))
                .or_else(|| mainline.iter().copied().find(|&m| m > end))
                .unwrap_or(delta.len() - 1),
        };

        batches.push(Batch {
            index,
            commits: chunk.to_vec(),
            frontier: delta[frontier].clone(),
            frontier_position: frontier,
            carried: previous == Some(frontier),
        });
        previous = Some(frontier);
    }

    Ok(batches)
}
