//! Migration task status transitions
//!
//! ```text
//! Pending --> InProgress --> Completed
//! Pending/InProgress --> Failed
//! InProgress --> RolledBack
//! ```
//!
//! Completed, Failed and RolledBack are terminal.

use crate::types::MigrationStatus;

/// Illegal status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct IllegalTransition {
    /// Current status
    pub from: MigrationStatus,
    /// Requested status
    pub to: MigrationStatus,
}

/// Validate a status transition
pub fn validate_transition(
    from: MigrationStatus,
    to: MigrationStatus,
) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: MigrationStatus) -> &'static [MigrationStatus] {
    use MigrationStatus::{Completed, Failed, InProgress, Pending, RolledBack};
    match from {
        Pending => &[InProgress, Failed],
        InProgress => &[Completed, Failed, RolledBack],
        Completed | Failed | RolledBack => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use MigrationStatus::{Completed, Failed, InProgress, Pending, RolledBack};

    fn any_status() -> impl Strategy<Value = MigrationStatus> {
        prop_oneof![
            Just(Pending),
            Just(InProgress),
            Just(Completed),
            Just(Failed),
            Just(RolledBack),
        ]
    }

    #[test]
    fn pending_transitions() {
        assert!(validate_transition(Pending, InProgress).is_ok());
        assert!(validate_transition(Pending, Failed).is_ok());

        assert!(validate_transition(Pending, Completed).is_err());
        assert!(validate_transition(Pending, RolledBack).is_err());
    }

    #[test]
    fn in_progress_transitions() {
        assert!(validate_transition(InProgress, Completed).is_ok());
        assert!(validate_transition(InProgress, Failed).is_ok());
        assert!(validate_transition(InProgress, RolledBack).is_ok());
        assert!(validate_transition(InProgress, Pending).is_err());
    }

    proptest! {
        #[test]
        fn terminal_statuses_never_transition(from in any_status(), to in any_status()) {
            if from.is_terminal() {
                prop_assert!(validate_transition(from, to).is_err());
            }
        }

        #[test]
        fn validation_agrees_with_allowed_set(from in any_status(), to in any_status()) {
            let ok = validate_transition(from, to).is_ok();
            prop_assert_eq!(ok, allowed_transitions(from).contains(&to));
        }
    }
}
