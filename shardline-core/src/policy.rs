//! Write acknowledgement policies

use crate::mailbox::PeerId;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Predicate over the set of peers that acknowledged a write
pub type AckPredicate = Arc<dyn Fn(&BTreeSet<PeerId>) -> bool + Send + Sync>;

/// Decides whether a set of acknowledgements makes a write durable enough.
///
/// The broadcaster's own peer is part of the set once its local store has
/// applied the write. Policies are evaluated against growing ack sets and are
/// also checked once against every peer a write was dispatched to, so a
/// policy that rejects that full set fails the write without waiting.
#[derive(Clone)]
pub enum AckPolicy {
    /// At least this many peers
    AtLeast(usize),
    /// A strict majority of `replicas` peers
    Majority {
        /// Size of the replica set
        replicas: usize,
    },
    /// A strict majority of the peers known when the write was dispatched:
    /// the broadcaster plus every joined listener
    MajorityOfKnown,
    /// Never satisfied; every write fails after dispatch
    Never,
    /// Arbitrary predicate.
    ///
    /// Must be monotone: once a set is accepted, every superset must be too.
    /// A predicate such as "exactly one ack" is rejected up front whenever
    /// more peers than that were reachable.
    Custom(AckPredicate),
}

impl AckPolicy {
    /// Policy backed by a closure
    pub fn custom(predicate: impl Fn(&BTreeSet<PeerId>) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    /// Check an ack set; `known` counts the peers the write could have
    /// reached, the broadcaster included
    pub fn is_acceptable(&self, acks: &BTreeSet<PeerId>, known: usize) -> bool {
        match self {
            Self::AtLeast(count) => acks.len() >= *count,
            Self::Majority { replicas } => acks.len() * 2 > *replicas,
            Self::MajorityOfKnown => acks.len() * 2 > known,
            Self::Never => false,
            Self::Custom(predicate) => predicate(acks),
        }
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::AtLeast(1)
    }
}

impl fmt::Debug for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtLeast(count) => write!(f, "AtLeast({})", count),
            Self::Majority { replicas } => write!(f, "Majority {{ replicas: {} }}", replicas),
            Self::MajorityOfKnown => write!(f, "MajorityOfKnown"),
            Self::Never => write!(f, "Never"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> BTreeSet<PeerId> {
        (0..n).map(|_| PeerId::new()).collect()
    }

    #[test]
    fn test_at_least() {
        let policy = AckPolicy::AtLeast(2);
        assert!(!policy.is_acceptable(&peers(1), 5));
        assert!(policy.is_acceptable(&peers(2), 5));
        assert!(policy.is_acceptable(&peers(3), 5));
    }

    #[test]
    fn test_majority() {
        let policy = AckPolicy::Majority { replicas: 3 };
        assert!(!policy.is_acceptable(&peers(1), 10));
        assert!(policy.is_acceptable(&peers(2), 10));

        let even = AckPolicy::Majority { replicas: 4 };
        assert!(!even.is_acceptable(&peers(2), 10));
        assert!(even.is_acceptable(&peers(3), 10));
    }

    #[test]
    fn test_majority_of_known_follows_membership() {
        let policy = AckPolicy::MajorityOfKnown;
        assert!(policy.is_acceptable(&peers(1), 1));
        assert!(!policy.is_acceptable(&peers(1), 2));
        assert!(policy.is_acceptable(&peers(2), 3));
        assert!(!policy.is_acceptable(&peers(2), 4));
        assert!(policy.is_acceptable(&peers(3), 4));
    }

    #[test]
    fn test_never() {
        assert!(!AckPolicy::Never.is_acceptable(&peers(10), 10));
    }

    #[test]
    fn test_custom_predicate() {
        let required = PeerId::new();
        let policy = AckPolicy::custom(move |acks| acks.contains(&required));
        assert!(!policy.is_acceptable(&peers(5), 6));
        let mut acks = peers(1);
        acks.insert(required);
        assert!(policy.is_acceptable(&acks, 6));
        assert_eq!(format!("{:?}", policy), "Custom(..)");
    }
}
