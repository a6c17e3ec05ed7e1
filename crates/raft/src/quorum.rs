//! Majority counting for elections and replication.

/// Tally of answers from the members of a partition.
///
/// The quorum is complete once a majority succeeded, a majority failed, or
/// the owner stepped down. A tie is never a win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quorum {
    required: usize,
    succeeded: usize,
    failed: usize,
    stepped_down: bool,
}

impl Quorum {
    /// Quorum over `member_count` members, the local member included
    pub fn new(member_count: usize) -> Self {
        Self {
            required: member_count / 2 + 1,
            succeeded: 0,
            failed: 0,
            stepped_down: false,
        }
    }

    /// Answers needed for a majority
    pub fn required(&self) -> usize {
        self.required
    }

    /// Positive answers so far
    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    /// Negative answers so far
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Whether the owner stepped down
    pub fn stepped_down(&self) -> bool {
        self.stepped_down
    }

    /// Count a positive answer
    pub fn succeed(&mut self) {
        self.succeeded += 1;
    }

    /// Count a negative answer
    pub fn fail(&mut self) {
        self.failed += 1;
    }

    /// Abandon the quorum, for example after seeing a higher term
    pub fn step_down(&mut self) {
        self.stepped_down = true;
    }

    /// No further answer can change the outcome
    pub fn is_complete(&self) -> bool {
        self.succeeded >= self.required || self.failed >= self.required || self.stepped_down
    }

    /// A majority succeeded and the owner did not step down
    pub fn is_elected(&self) -> bool {
        self.is_complete() && !self.stepped_down && self.succeeded >= self.required
    }
}
