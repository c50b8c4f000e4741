//! Matchmaking queue and pairing policy.
//!
//! [`MatchQueue`] is a plain data structure mutated only by the registry
//! actor, so pairing, cancellation, and expiry are serialized by
//! construction: an entry claimed by [`MatchQueue::try_match`] can never
//! also be returned by [`MatchQueue::expire`], and vice versa.
//!
//! # Pairing policy
//!
//! Entries are partitioned by call kind (and by topic tag for topic
//! calls). Within a partition, entries are scanned in ascending
//! `queued_at` order and the earliest same-level pair wins. Two
//! cross-level fallbacks bound the wait:
//!
//! - at match time, when the scan window was truncated (more entries
//!   waiting than a non-zero scan depth), the two longest-waiting
//!   entries pair regardless of level;
//! - at the deadline, an expiring entry pairs with the longest-waiting
//!   other entry in its partition regardless of level
//!   ([`MatchQueue::match_expiring`]), so co-waiting users are never
//!   both expired. Only an entry alone in its partition runs out its
//!   deadline.

use super::messages::{CallKind, Level};

use tokio::time::Instant;

/// A waiting participant's matching record.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Opaque user identifier, stable across reconnects.
    pub user_id: String,
    /// The user's live connection at enqueue time.
    pub connection_id: String,
    pub kind: CallKind,
    pub level: Level,
    /// Topic tag; only significant for `CallKind::Topic`.
    pub topic: Option<String>,
    pub queued_at: Instant,
    /// When `MatchTimeout` fires if the entry is still unclaimed.
    pub deadline: Instant,
}

/// The waiting queue. Entries are kept in ascending `queued_at` order.
#[derive(Debug, Default)]
pub struct MatchQueue {
    entries: Vec<QueueEntry>,
}

impl MatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.iter().any(|e| e.user_id == user_id)
    }

    /// Insert an entry, replacing any previous entry for the same user
    /// (idempotent re-enqueue).
    pub fn enqueue(&mut self, entry: QueueEntry) {
        self.entries.retain(|e| e.user_id != entry.user_id);
        self.entries.push(entry);
    }

    /// Remove a user's entry if present. `None` means the entry was
    /// already claimed, expired, or never existed.
    pub fn cancel(&mut self, user_id: &str) -> Option<QueueEntry> {
        let idx = self.entries.iter().position(|e| e.user_id == user_id)?;
        Some(self.entries.remove(idx))
    }

    /// Deadline fallback: pair every entry whose deadline has passed
    /// with the longest-waiting other entry in its partition, regardless
    /// of level. Match quality gives way once the wait budget is spent.
    ///
    /// Entries alone in their partition are left in place for
    /// [`MatchQueue::expire`].
    pub fn match_expiring(&mut self, now: Instant) -> Vec<(QueueEntry, QueueEntry)> {
        let mut pairs = Vec::new();
        let mut lone: Vec<String> = Vec::new();

        loop {
            let found = self.entries.iter().enumerate().find_map(|(i, entry)| {
                if entry.deadline > now || lone.iter().any(|u| u == &entry.user_id) {
                    return None;
                }
                let partner = self
                    .entries
                    .iter()
                    .enumerate()
                    .find(|(j, other)| *j != i && same_partition(entry, other))
                    .map(|(j, _)| j);
                Some((i, partner, entry.user_id.clone()))
            });

            match found {
                Some((i, Some(j), _)) => {
                    let (first_idx, second_idx) = if i < j { (i, j) } else { (j, i) };
                    let second = self.entries.remove(second_idx);
                    let first = self.entries.remove(first_idx);
                    pairs.push((first, second));
                }
                Some((_, None, user_id)) => lone.push(user_id),
                None => break,
            }
        }

        pairs
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<QueueEntry> {
        let (keep, expired): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.deadline > now);
        self.entries = keep;
        expired
    }

    /// Apply the pairing policy, removing matched entries from the queue.
    ///
    /// Repeats until no further pair can be formed, so a single call
    /// drains every matchable pair.
    pub fn try_match(&mut self, scan_depth: usize) -> Vec<(QueueEntry, QueueEntry)> {
        let mut pairs = Vec::new();
        while let Some((i, j)) = self.find_pair(scan_depth) {
            // j > i, so remove the later index first
            let second = self.entries.remove(j);
            let first = self.entries.remove(i);
            pairs.push((first, second));
        }
        pairs
    }

    /// Find the next pair to form, as indices into `entries` (i < j).
    fn find_pair(&self, scan_depth: usize) -> Option<(usize, usize)> {
        let mut seen: Vec<(CallKind, Option<&str>)> = Vec::new();

        for entry in &self.entries {
            let key = partition_key(entry);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);

            // Partition indices, already in queued order.
            let members: Vec<usize> = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| partition_key(e) == key)
                .map(|(idx, _)| idx)
                .collect();

            if members.len() < 2 {
                continue;
            }

            let window: Vec<usize> = if scan_depth == 0 {
                members.clone()
            } else {
                members.iter().copied().take(scan_depth).collect()
            };

            // Earliest same-level pair within the window.
            for (pos, &a_idx) in window.iter().enumerate() {
                for &b_idx in window.iter().skip(pos + 1) {
                    if let (Some(a), Some(b)) =
                        (self.entries.get(a_idx), self.entries.get(b_idx))
                    {
                        if a.level == b.level {
                            return Some((a_idx, b_idx));
                        }
                    }
                }
            }

            // Scan was truncated: bounded wait takes precedence over match
            // quality, pair the two longest-waiting entries regardless of
            // level.
            if scan_depth > 0 && members.len() > scan_depth {
                if let (Some(&first), Some(&second)) = (members.first(), members.get(1)) {
                    return Some((first, second));
                }
            }
        }

        None
    }
}

fn same_partition(a: &QueueEntry, b: &QueueEntry) -> bool {
    partition_key(a) == partition_key(b)
}

/// Entries only ever pair within the same partition: same kind, and for
/// topic calls the same topic tag.
fn partition_key(entry: &QueueEntry) -> (CallKind, Option<&str>) {
    let topic = match entry.kind {
        CallKind::Topic => entry.topic.as_deref(),
        _ => None,
    };
    (entry.kind, topic)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(user_id: &str, kind: CallKind, level: Level, topic: Option<&str>) -> QueueEntry {
        let now = Instant::now();
        QueueEntry {
            user_id: user_id.to_string(),
            connection_id: format!("conn-{user_id}"),
            kind,
            level,
            topic: topic.map(str::to_string),
            queued_at: now,
            deadline: now + Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn test_same_level_pair_preferred_over_arrival_order() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::OneOnOne, Level::Beginner, None));
        queue.enqueue(entry("c", CallKind::OneOnOne, Level::Advanced, None));
        queue.enqueue(entry("b", CallKind::OneOnOne, Level::Beginner, None));

        let pairs = queue.try_match(0);
        assert_eq!(pairs.len(), 1);
        let (first, second) = pairs.into_iter().next().unwrap();
        assert_eq!(first.user_id, "a");
        assert_eq!(second.user_id, "b");

        // c stays queued: no same-level partner, and cross-level pairing
        // only happens once a deadline is reached
        assert!(queue.contains("c"));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_no_cross_level_pair_at_match_time() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::OneOnOne, Level::Beginner, None));
        queue.enqueue(entry("c", CallKind::OneOnOne, Level::Advanced, None));

        // Before any deadline, differently-leveled entries wait for a
        // same-level partner instead of pairing immediately.
        assert!(queue.try_match(0).is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_pairs_co_waiting_entries_across_levels() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::OneOnOne, Level::Beginner, None));
        queue.enqueue(entry("c", CallKind::OneOnOne, Level::Advanced, None));

        tokio::time::advance(Duration::from_secs(121)).await;

        // The wait budget is spent: the two waiters pair anyway and
        // nothing is left to expire.
        let pairs = queue.match_expiring(Instant::now());
        assert_eq!(pairs.len(), 1);
        let (first, second) = pairs.into_iter().next().unwrap();
        assert_eq!(first.user_id, "a");
        assert_eq!(second.user_id, "c");
        assert!(queue.expire(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_partition_entry_still_expires() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::OneOnOne, Level::Beginner, None));
        queue.enqueue(entry("t", CallKind::Topic, Level::Beginner, Some("food")));

        tokio::time::advance(Duration::from_secs(121)).await;

        // Different partitions never pair, not even at the deadline
        assert!(queue.match_expiring(Instant::now()).is_empty());
        let expired = queue.expire(Instant::now());
        assert_eq!(expired.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiring_entry_takes_longest_waiting_partner() {
        let mut queue = MatchQueue::new();
        let mut old = entry("old", CallKind::Free, Level::Beginner, None);
        old.deadline = Instant::now() + Duration::from_secs(10);
        queue.enqueue(old);
        queue.enqueue(entry("mid", CallKind::Free, Level::Advanced, None));
        queue.enqueue(entry("new", CallKind::Free, Level::Intermediate, None));

        tokio::time::advance(Duration::from_secs(11)).await;

        let pairs = queue.match_expiring(Instant::now());
        assert_eq!(pairs.len(), 1);
        let (first, second) = pairs.into_iter().next().unwrap();
        assert_eq!(first.user_id, "old");
        assert_eq!(second.user_id, "mid");
        assert!(queue.contains("new"));
    }

    #[tokio::test]
    async fn test_truncated_scan_falls_back_to_longest_waiting() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::Free, Level::Beginner, None));
        queue.enqueue(entry("b", CallKind::Free, Level::Advanced, None));
        queue.enqueue(entry("c", CallKind::Free, Level::Intermediate, None));

        // Window of 2 holds {a, b}: no same-level pair, and the queue is
        // longer than the window, so the two longest-waiting pair anyway.
        let pairs = queue.try_match(2);
        assert_eq!(pairs.len(), 1);
        let (first, second) = pairs.into_iter().next().unwrap();
        assert_eq!(first.user_id, "a");
        assert_eq!(second.user_id, "b");
        assert!(queue.contains("c"));
    }

    #[tokio::test]
    async fn test_window_covering_whole_queue_waits_for_deadline() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::Free, Level::Beginner, None));
        queue.enqueue(entry("b", CallKind::Free, Level::Advanced, None));

        // Depth 2 covers both entries: the scan was exhaustive and
        // nothing beyond the window is waiting, so the pair is deferred
        // to the deadline fallback rather than formed immediately.
        assert!(queue.try_match(2).is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_topic_entries_only_pair_within_topic() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::Topic, Level::Beginner, Some("travel")));
        queue.enqueue(entry("b", CallKind::Topic, Level::Beginner, Some("food")));
        assert!(queue.try_match(0).is_empty());

        queue.enqueue(entry("c", CallKind::Topic, Level::Beginner, Some("travel")));
        let pairs = queue.try_match(0);
        assert_eq!(pairs.len(), 1);
        let (first, second) = pairs.into_iter().next().unwrap();
        assert_eq!(first.user_id, "a");
        assert_eq!(second.user_id, "c");
    }

    #[tokio::test]
    async fn test_kinds_do_not_mix() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::OneOnOne, Level::Beginner, None));
        queue.enqueue(entry("b", CallKind::Free, Level::Beginner, None));

        assert!(queue.try_match(0).is_empty());
    }

    #[tokio::test]
    async fn test_multiple_pairs_drained_in_one_call() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::Free, Level::Beginner, None));
        queue.enqueue(entry("b", CallKind::Free, Level::Beginner, None));
        queue.enqueue(entry("c", CallKind::Free, Level::Advanced, None));
        queue.enqueue(entry("d", CallKind::Free, Level::Advanced, None));

        let pairs = queue.try_match(0);
        assert_eq!(pairs.len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_re_enqueue_replaces_entry() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::OneOnOne, Level::Beginner, None));
        queue.enqueue(entry("a", CallKind::OneOnOne, Level::Advanced, None));

        assert_eq!(queue.len(), 1);

        // The surviving entry carries the newer level
        queue.enqueue(entry("b", CallKind::OneOnOne, Level::Advanced, None));
        let pairs = queue.try_match(0);
        assert_eq!(pairs.len(), 1);
        let (first, _) = pairs.into_iter().next().unwrap();
        assert_eq!(first.user_id, "a");
        assert_eq!(first.level, Level::Advanced);
    }

    #[tokio::test]
    async fn test_cancel_reports_presence() {
        let mut queue = MatchQueue::new();
        queue.enqueue(entry("a", CallKind::OneOnOne, Level::Beginner, None));

        assert!(queue.cancel("a").is_some());
        assert!(queue.cancel("a").is_none());
        assert!(queue.cancel("never-queued").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_removes_only_past_deadline() {
        let mut queue = MatchQueue::new();
        let mut early = entry("a", CallKind::OneOnOne, Level::Beginner, None);
        early.deadline = Instant::now() + Duration::from_secs(10);
        let mut late = entry("b", CallKind::OneOnOne, Level::Advanced, None);
        late.deadline = Instant::now() + Duration::from_secs(300);
        queue.enqueue(early);
        queue.enqueue(late);

        tokio::time::advance(Duration::from_secs(11)).await;

        let expired = queue.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired.first().unwrap().user_id, "a");
        assert!(queue.contains("b"));
    }

    #[tokio::test]
    async fn test_claimed_entry_cannot_expire() {
        let mut queue = MatchQueue::new();
        let mut a = entry("a", CallKind::OneOnOne, Level::Beginner, None);
        a.deadline = Instant::now();
        let mut b = entry("b", CallKind::OneOnOne, Level::Beginner, None);
        b.deadline = Instant::now();
        queue.enqueue(a);
        queue.enqueue(b);

        // Pairing claims both entries; the subsequent sweep finds nothing.
        let pairs = queue.try_match(0);
        assert_eq!(pairs.len(), 1);
        assert!(queue.expire(Instant::now() + Duration::from_secs(1)).is_empty());
    }
}
