// Staleness decision for file records

use super::FileRecord;

/// Decide whether `incoming` can be skipped because `existing` is at least as fresh.
///
/// Disk time and edit stamp must both be covered by the stored record. An
/// incoming disk-only record (stamp 0) never overrides a stored in-memory edit,
/// so a disk reload racing a newer edit is re-indexed rather than skipped.
pub fn should_skip(existing: Option<&FileRecord>, incoming: &FileRecord) -> bool {
    let Some(existing) = existing else {
        return false;
    };

    existing.last_modified >= incoming.last_modified
        && existing.modification_stamp >= incoming.modification_stamp
        && (incoming.modification_stamp != 0 || existing.modification_stamp == 0)
}
