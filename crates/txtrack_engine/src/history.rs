//! Bounded history of recently applied transactions.

use std::collections::VecDeque;
use txtrack_protocol::Transaction;

/// Fixed-capacity FIFO of recently seen transactions.
///
/// Only used to recognise stale repeats across overlapping fetch windows;
/// it is never a source of truth for what the index holds.
#[derive(Debug, Clone)]
pub struct BoundedHistory {
    entries: VecDeque<Transaction>,
    capacity: usize,
}

impl BoundedHistory {
    /// Creates an empty history holding at most `capacity` transactions.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Appends a transaction, evicting the oldest when full.
    pub fn push(&mut self, tx: Transaction) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(tx);
    }

    /// Returns the most recently pushed transaction.
    pub fn last(&self) -> Option<&Transaction> {
        self.entries.back()
    }

    /// Returns the number of transactions held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been pushed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `tx` is held.
    pub fn contains(&self, tx: &Transaction) -> bool {
        self.entries.contains(tx)
    }

    /// Returns true if `txs` is a stale repeat of what was already seen.
    ///
    /// A single transaction is a repeat when it is the newest entry; a larger
    /// set is a repeat when every member is held.
    pub fn already_found(&self, txs: &[Transaction]) -> bool {
        let Some(last) = self.last() else {
            return false;
        };
        match txs {
            [] => false,
            [single] => single.id == last.id,
            many => many.iter().all(|tx| self.contains(tx)),
        }
    }

    /// Commit time the next window should start at, falling back to `default`.
    pub fn next_start(&self, default: u64) -> u64 {
        self.last().map_or(default, |tx| tx.commit_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: u64) -> Transaction {
        Transaction::new(id, id * 10, 1, 0)
    }

    #[test]
    fn evicts_oldest() {
        let mut history = BoundedHistory::new(2);
        history.push(tx(1));
        history.push(tx(2));
        history.push(tx(3));

        assert_eq!(history.len(), 2);
        assert!(!history.contains(&tx(1)));
        assert_eq!(history.last(), Some(&tx(3)));
    }

    #[test]
    fn already_found_rules() {
        let mut history = BoundedHistory::new(100);
        assert!(!history.already_found(&[tx(1)]));

        history.push(tx(1));
        history.push(tx(2));

        assert!(history.already_found(&[tx(2)]));
        assert!(!history.already_found(&[tx(1)]));
        assert!(history.already_found(&[tx(1), tx(2)]));
        assert!(!history.already_found(&[tx(2), tx(3)]));
        assert!(!history.already_found(&[]));
    }

    #[test]
    fn next_start_follows_last() {
        let mut history = BoundedHistory::new(4);
        assert_eq!(history.next_start(77), 77);
        history.push(tx(5));
        assert_eq!(history.next_start(77), 50);
    }
}
