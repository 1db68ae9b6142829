//! Leader-side replication progress for a single follower.

use tokio::time::Instant;

/// State of replication to a target node.
///
/// A new leader starts every follower in `Probe`, sending one batch at a time
/// until the first success locates the match point. `Pipeline` streams batches
/// at line rate. `Snapshot` means the follower is so far behind that the
/// needed entries are compacted and a snapshot must be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Probe,
    Pipeline,
    Snapshot,
}

/// Per-follower replication progress.
#[derive(Debug, Clone)]
pub struct Progress {
    pub state: ProgressState,
    /// The next log index to send.
    pub next_index: u64,
    /// The highest index known to be replicated on the target.
    pub match_index: u64,
}

impl Progress {
    /// Fresh progress for a new leadership term.
    pub fn new(last_index: u64) -> Self {
        Self {
            state: ProgressState::Probe,
            next_index: last_index + 1,
            match_index: 0,
        }
    }

    /// A successful AppendEntries result acknowledged entries up to `index`.
    pub fn update_success(&mut self, index: u64) {
        if index > self.match_index {
            self.match_index = index;
        }
        self.next_index = self.match_index + 1;
        if self.state == ProgressState::Probe {
            self.state = ProgressState::Pipeline;
        }
    }

    /// The follower rejected `prev = rejected` and reported its own
    /// `last_log_index`.
    ///
    /// `next_index` backs off by one, or jumps directly past the follower's
    /// last entry when that is nearer, and never drops below
    /// `match_index + 1`.
    pub fn update_rejected(&mut self, rejected: u64, follower_last: u64) {
        debug_assert!(rejected > 0);
        let mut next = self.next_index.saturating_sub(1).min(follower_last + 1);
        if next < self.match_index + 1 {
            next = self.match_index + 1;
        }
        self.next_index = next.max(1);
        self.state = ProgressState::Probe;
    }

    /// The entries at `next_index` are compacted away; switch to snapshot
    /// installation.
    pub fn begin_snapshot(&mut self) {
        self.state = ProgressState::Snapshot;
    }

    /// A snapshot with the given last index was installed on the target.
    pub fn snapshot_installed(&mut self, snapshot_last_index: u64) {
        if snapshot_last_index > self.match_index {
            self.match_index = snapshot_last_index;
        }
        self.next_index = self.match_index + 1;
        self.state = ProgressState::Probe;
    }
}

/// One catch-up round for a server being promoted to voter.
///
/// The promotion commits once a round completes within the election timeout
/// window: the promotee replicated everything the leader had when the round
/// started, fast enough that it will not stall the cluster as a voter.
#[derive(Debug, Clone)]
pub struct CatchUpRound {
    pub number: u64,
    /// The leader's last index when the round started.
    pub index: u64,
    pub start: Instant,
}

impl CatchUpRound {
    pub fn first(last_index: u64) -> Self {
        Self {
            number: 1,
            index: last_index,
            start: Instant::now(),
        }
    }

    /// Has the promotee replicated everything this round asked for?
    pub fn is_completed(&self, match_index: u64) -> bool {
        match_index >= self.index
    }

    /// Begin the next round against the leader's current last index.
    pub fn next(&self, last_index: u64) -> Self {
        Self {
            number: self.number + 1,
            index: last_index,
            start: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_progress_probes_from_last_plus_one() {
        let p = Progress::new(10);
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 11);
        assert_eq!(p.match_index, 0);
    }

    #[test]
    fn test_success_promotes_probe_to_pipeline() {
        let mut p = Progress::new(10);
        p.update_success(10);
        assert_eq!(p.state, ProgressState::Pipeline);
        assert_eq!(p.match_index, 10);
        assert_eq!(p.next_index, 11);

        // A stale success must not regress the match index.
        p.update_success(4);
        assert_eq!(p.match_index, 10);
        assert_eq!(p.next_index, 11);
    }

    #[test]
    fn test_rejection_backs_off_and_uses_follower_hint() {
        let mut p = Progress::new(100);
        // Follower reports only 20 entries: jump straight past its last.
        p.update_rejected(100, 20);
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 21);

        // A plain conflict backs off linearly.
        p.update_rejected(20, 20);
        assert_eq!(p.next_index, 20);
    }

    #[test]
    fn test_next_never_drops_below_match_plus_one() {
        let mut p = Progress::new(10);
        p.update_success(8);
        p.update_rejected(9, 2);
        assert_eq!(p.next_index, 9);
        assert_eq!(p.match_index, 8);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut p = Progress::new(200);
        p.update_rejected(200, 5);
        p.begin_snapshot();
        assert_eq!(p.state, ProgressState::Snapshot);
        p.snapshot_installed(150);
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.match_index, 150);
        assert_eq!(p.next_index, 151);
    }

    #[tokio::test]
    async fn test_catch_up_round_completion() {
        let round = CatchUpRound::first(50);
        assert!(!round.is_completed(49));
        assert!(round.is_completed(50));

        let next = round.next(75);
        assert_eq!(next.number, 2);
        assert_eq!(next.index, 75);
    }
}
