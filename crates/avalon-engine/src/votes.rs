//! Ballot collection for party, quest, and assassination votes.
//!
//! The legacy server funneled concurrent ballots through a hand-rolled
//! promise queue to avoid losing votes that arrived in the same tick.
//! Here the collector is plain data owned by the room actor, so ballots
//! are serialized by the actor's mailbox and the queue disappears.

use std::collections::{BTreeMap, BTreeSet};

use avalon_protocol::UserId;

/// What happened to a cast ballot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BallotOutcome {
    /// Dropped: the voter is not eligible, already voted, or the
    /// collection already completed.
    Ignored,
    /// Recorded; more ballots are still outstanding.
    Recorded,
    /// This ballot was the last one. The full tally is handed over
    /// exactly once; the collector is spent afterwards.
    Complete(BTreeMap<UserId, bool>),
}

/// Collects one yes/no ballot per eligible voter.
///
/// First ballot per voter wins, strangers and repeats are ignored, and
/// completion fires exactly once no matter what arrives afterwards.
#[derive(Debug)]
pub struct VoteCollector {
    eligible: BTreeSet<UserId>,
    ballots: BTreeMap<UserId, bool>,
    closed: bool,
}

impl VoteCollector {
    /// Creates a collector expecting one ballot from each given voter.
    pub fn new(eligible: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            eligible: eligible.into_iter().collect(),
            ballots: BTreeMap::new(),
            closed: false,
        }
    }

    /// Records a ballot. Returns [`BallotOutcome::Complete`] with the
    /// full tally when the final eligible voter has voted.
    pub fn cast(&mut self, voter: &UserId, vote: bool) -> BallotOutcome {
        if self.closed || !self.eligible.contains(voter) || self.ballots.contains_key(voter) {
            return BallotOutcome::Ignored;
        }
        self.ballots.insert(voter.clone(), vote);
        if self.ballots.len() == self.eligible.len() {
            self.closed = true;
            BallotOutcome::Complete(std::mem::take(&mut self.ballots))
        } else {
            BallotOutcome::Recorded
        }
    }

    /// Number of ballots recorded so far.
    pub fn count(&self) -> usize {
        self.ballots.len()
    }

    pub fn has_voted(&self, voter: &UserId) -> bool {
        self.ballots.contains_key(voter)
    }

    pub fn is_complete(&self) -> bool {
        self.closed
    }
}
