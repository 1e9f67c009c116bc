//! Bounded FIFO buffer with drop policies.
//!
//! The buffer never holds more than `capacity` items. Overflow is
//! resolved at insert time according to the buffer's `DropPolicy`:
//!
//! | Policy   | Full buffer        |
//! |----------|--------------------|
//! | `Oldest` | evict head, insert |
//! | `Newest` | discard incoming   |
//! | `Reject` | discard incoming   |
//!
//! Items already accepted are never displaced under `Newest` or `Reject`.

use std::collections::VecDeque;

use super::DropPolicy;

/// Result of offering an item to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Inserted without displacing anything.
    Accepted,
    /// Inserted after evicting the head (`Oldest` policy).
    EvictedOldest,
    /// Incoming item discarded (`Newest` policy).
    DroppedIncoming,
    /// Incoming item discarded (`Reject` policy).
    Rejected,
}

impl Admission {
    /// Whether the offered item is now in the buffer.
    #[must_use]
    pub const fn is_admitted(self) -> bool {
        matches!(self, Self::Accepted | Self::EvictedOldest)
    }

    /// Whether some item (head or incoming) was lost.
    #[must_use]
    pub const fn lost_item(self) -> bool {
        !matches!(self, Self::Accepted)
    }
}

/// Bounded FIFO buffer.
#[derive(Debug)]
pub struct BoundedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    policy: DropPolicy,
}

impl<T> BoundedBuffer<T> {
    /// Create a buffer. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            policy,
        }
    }

    /// Offer an item, resolving overflow with the drop policy.
    pub fn offer(&mut self, item: T) -> Admission {
        if self.items.len() < self.capacity {
            self.items.push_back(item);
            return Admission::Accepted;
        }

        match self.policy {
            DropPolicy::Oldest => {
                self.items.pop_front();
                self.items.push_back(item);
                Admission::EvictedOldest
            }
            DropPolicy::Newest => Admission::DroppedIncoming,
            DropPolicy::Reject => Admission::Rejected,
        }
    }

    /// Take the head item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Discard everything, returning how many items were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured drop policy.
    #[must_use]
    pub const fn policy(&self) -> DropPolicy {
        self.policy
    }

    /// Fill ratio in `[0, 1]`.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.items.len() as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn filled(capacity: usize, policy: DropPolicy) -> BoundedBuffer<u32> {
        let mut buffer = BoundedBuffer::new(capacity, policy);
        for i in 0..capacity as u32 {
            assert_eq!(buffer.offer(i), Admission::Accepted);
        }
        buffer
    }

    #[test_case(DropPolicy::Oldest, Admission::EvictedOldest, &[1, 2, 99] ; "oldest evicts head")]
    #[test_case(DropPolicy::Newest, Admission::DroppedIncoming, &[0, 1, 2] ; "newest keeps buffer")]
    #[test_case(DropPolicy::Reject, Admission::Rejected, &[0, 1, 2] ; "reject keeps buffer")]
    fn overflow(policy: DropPolicy, expected: Admission, contents: &[u32]) {
        let mut buffer = filled(3, policy);

        assert_eq!(buffer.offer(99), expected);
        assert_eq!(buffer.len(), 3);
        let drained: Vec<_> = std::iter::from_fn(|| buffer.pop()).collect();
        assert_eq!(drained, contents);
    }

    #[test]
    fn fifo_order() {
        let mut buffer = filled(4, DropPolicy::Oldest);
        let drained: Vec<_> = std::iter::from_fn(|| buffer.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }

    #[test]
    fn zero_capacity_is_raised() {
        let buffer = BoundedBuffer::<u32>::new(0, DropPolicy::Oldest);
        assert_eq!(buffer.capacity(), 1);
    }

    #[test]
    fn clear_reports_count() {
        let mut buffer = filled(5, DropPolicy::Reject);
        assert_eq!(buffer.clear(), 5);
        assert!(buffer.is_empty());
        assert_eq!(buffer.utilization(), 0.0);
    }

    #[test]
    fn admission_flags() {
        assert!(Admission::EvictedOldest.is_admitted());
        assert!(!Admission::DroppedIncoming.is_admitted());
        assert!(!Admission::Rejected.is_admitted());
        assert!(!Admission::Accepted.lost_item());
        assert!(Admission::EvictedOldest.lost_item());
    }

    fn policy_strategy() -> impl Strategy<Value = DropPolicy> {
        prop_oneof![
            Just(DropPolicy::Oldest),
            Just(DropPolicy::Newest),
            Just(DropPolicy::Reject),
        ]
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(
            capacity in 1usize..32,
            policy in policy_strategy(),
            count in 0usize..200,
        ) {
            let mut buffer = BoundedBuffer::new(capacity, policy);
            for i in 0..count {
                let before = buffer.len();
                let head = buffer.items.front().copied();
                let admission = buffer.offer(i);
                prop_assert!(buffer.len() <= capacity);
                if before == capacity {
                    prop_assert_eq!(buffer.len(), capacity);
                    match policy {
                        DropPolicy::Oldest => {
                            prop_assert_eq!(admission, Admission::EvictedOldest);
                        }
                        DropPolicy::Newest | DropPolicy::Reject => {
                            prop_assert!(!admission.is_admitted());
                            prop_assert_eq!(buffer.items.front().copied(), head);
                        }
                    }
                } else {
                    prop_assert_eq!(admission, Admission::Accepted);
                }
            }
        }

        #[test]
        fn survivors_keep_push_order(
            capacity in 1usize..16,
            policy in policy_strategy(),
            count in 0usize..100,
        ) {
            let mut buffer = BoundedBuffer::new(capacity, policy);
            for i in 0..count {
                buffer.offer(i);
            }
            let drained: Vec<_> = std::iter::from_fn(|| buffer.pop()).collect();
            prop_assert!(drained.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
