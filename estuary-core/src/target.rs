use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, opaque identity of a backend target.
///
/// The configuration layer owns the registry mapping real backends to
/// these IDs; the core only compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target-{}", self.0)
    }
}

/// The forwarding destination an address range currently resolves to.
///
/// `Unassigned` is a distinguished sentinel that never compares equal to
/// any concrete target. `Transitional` exists only for the duration of a
/// migration window, while connections drain from `previous` to `next`;
/// migrations from or to `Unassigned` need no window and stay plain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Unassigned,
    Concrete(TargetId),
    Transitional { previous: TargetId, next: TargetId },
}

impl Target {
    pub fn is_unassigned(&self) -> bool {
        matches!(self, Target::Unassigned)
    }

    /// The concrete identity, if any. A transitional target resolves to
    /// the identity new connections are steered to.
    pub fn concrete(&self) -> Option<TargetId> {
        match self {
            Target::Unassigned => None,
            Target::Concrete(id) => Some(*id),
            Target::Transitional { next, .. } => Some(*next),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Unassigned => write!(f, "unassigned"),
            Target::Concrete(id) => write!(f, "{}", id),
            Target::Transitional { previous, next } => write!(f, "{}->{}", previous, next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_never_equals_concrete() {
        assert_ne!(Target::Unassigned, Target::Concrete(TargetId(0)));
        assert_eq!(Target::Concrete(TargetId(3)), Target::Concrete(TargetId(3)));
        assert_ne!(Target::Concrete(TargetId(3)), Target::Concrete(TargetId(4)));
    }

    #[test]
    fn transitional_resolves_to_next() {
        let t = Target::Transitional {
            previous: TargetId(1),
            next: TargetId(2),
        };
        assert_eq!(t.concrete(), Some(TargetId(2)));
        assert_eq!(Target::Unassigned.concrete(), None);
    }
}
