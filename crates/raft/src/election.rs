//! Vote counting for one candidacy.

use std::collections::HashSet;

use conductor_transport::MemberId;

use crate::Quorum;

/// Result of an election so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Votes are still outstanding
    Pending,
    /// A majority granted its vote
    Elected,
    /// The candidacy is over without a win
    SteppedDown,
}

/// A candidacy in `term`. The candidate's own vote is counted on start and
/// every other voter is counted at most once.
#[derive(Debug, Clone)]
pub struct Election {
    term: u64,
    quorum: Quorum,
    voters: HashSet<MemberId>,
}

impl Election {
    /// Start an election among `member_count` members
    pub fn start(term: u64, candidate: &MemberId, member_count: usize) -> Self {
        let mut quorum = Quorum::new(member_count);
        quorum.succeed();
        Self {
            term,
            quorum,
            voters: HashSet::from([candidate.clone()]),
        }
    }

    /// Term of the candidacy
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Count the answer of `voter`; repeated answers are ignored
    pub fn record(&mut self, voter: &MemberId, granted: bool) -> ElectionOutcome {
        if !self.quorum.is_complete() && self.voters.insert(voter.clone()) {
            if granted {
                self.quorum.succeed();
            } else {
                self.quorum.fail();
            }
        }
        self.outcome()
    }

    /// Abandon the candidacy after observing a higher term
    pub fn step_down(&mut self) -> ElectionOutcome {
        self.quorum.step_down();
        self.outcome()
    }

    /// Current outcome
    pub fn outcome(&self) -> ElectionOutcome {
        if self.quorum.is_elected() {
            ElectionOutcome::Elected
        } else if self.quorum.is_complete() {
            ElectionOutcome::SteppedDown
        } else {
            ElectionOutcome::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> MemberId {
        MemberId::new(id)
    }

    #[test]
    fn test_duplicate_votes_count_once() {
        let mut election = Election::start(2, &member("a"), 5);
        assert_eq!(election.record(&member("b"), true), ElectionOutcome::Pending);
        assert_eq!(election.record(&member("b"), true), ElectionOutcome::Pending);
        assert_eq!(election.record(&member("a"), true), ElectionOutcome::Pending);
        assert_eq!(election.record(&member("c"), true), ElectionOutcome::Elected);
    }

    #[test]
    fn test_majority_of_rejections_loses() {
        let mut election = Election::start(1, &member("a"), 3);
        assert_eq!(election.record(&member("b"), false), ElectionOutcome::Pending);
        assert_eq!(
            election.record(&member("c"), false),
            ElectionOutcome::SteppedDown
        );
    }

    #[test]
    fn test_step_down_discards_votes() {
        let mut election = Election::start(1, &member("a"), 3);
        assert_eq!(election.step_down(), ElectionOutcome::SteppedDown);
        assert_eq!(
            election.record(&member("b"), true),
            ElectionOutcome::SteppedDown
        );
    }

    #[test]
    fn test_single_member_is_elected_immediately() {
        let election = Election::start(1, &member("a"), 1);
        assert_eq!(election.outcome(), ElectionOutcome::Elected);
    }
}
