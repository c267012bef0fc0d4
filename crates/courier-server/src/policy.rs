//! What each operation does when the durable store fails.
//!
//! | operation          | degraded store | other store error |
//! |--------------------|----------------|-------------------|
//! | membership check   | fail open      | fail closed       |
//! | profile lookup     | degrade        | degrade           |
//! | append message     | degrade        | propagate         |
//! | receipt / reaction | degrade        | propagate         |
//! | snapshot subscribe | degrade        | degrade           |
//!
//! "Degraded" means permission-denied or unavailable, see
//! [`StoreError::is_degraded`].

use courier_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    MembershipCheck,
    ProfileLookup,
    AppendMessage,
    Receipt,
    Reaction,
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Treat the check as passed.
    FailOpen,
    /// Treat the check as failed.
    FailClosed,
    /// Log at warn and continue with a local fallback.
    Degrade,
    /// Report a store failure to the client and log at error.
    Propagate,
}

pub fn on_store_error(op: Operation, err: &StoreError) -> FailurePolicy {
    let degraded = err.is_degraded();
    match op {
        Operation::MembershipCheck if degraded => FailurePolicy::FailOpen,
        Operation::MembershipCheck => FailurePolicy::FailClosed,
        Operation::ProfileLookup | Operation::Subscribe => FailurePolicy::Degrade,
        Operation::AppendMessage | Operation::Receipt | Operation::Reaction if degraded => {
            FailurePolicy::Degrade
        }
        Operation::AppendMessage | Operation::Receipt | Operation::Reaction => {
            FailurePolicy::Propagate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_policy() {
        let denied = StoreError::PermissionDenied("rules".into());
        let broken = StoreError::Migration("schema".into());
        assert_eq!(
            on_store_error(Operation::MembershipCheck, &denied),
            FailurePolicy::FailOpen
        );
        assert_eq!(
            on_store_error(Operation::MembershipCheck, &broken),
            FailurePolicy::FailClosed
        );
    }

    #[test]
    fn test_write_policy() {
        let unavailable = StoreError::Unavailable("timeout".into());
        for op in [Operation::AppendMessage, Operation::Receipt, Operation::Reaction] {
            assert_eq!(on_store_error(op, &unavailable), FailurePolicy::Degrade);
            assert_eq!(
                on_store_error(op, &StoreError::NotFound),
                FailurePolicy::Propagate
            );
        }
        assert_eq!(
            on_store_error(Operation::ProfileLookup, &StoreError::NotFound),
            FailurePolicy::Degrade
        );
    }
}
