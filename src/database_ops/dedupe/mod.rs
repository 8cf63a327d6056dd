//! Dedupe sweeps. Each sweep finds duplicate groups under the same
//! canonicalization the ingest path uses, picks a winner, repoints foreign
//! keys inside one transaction, writes an audit row, and deletes the loser.

pub mod platforms;
pub mod titles;
pub mod video_games;

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupeStats {
    pub groups: u64,
    pub merged: u64,
}
