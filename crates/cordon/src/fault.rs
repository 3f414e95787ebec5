//! Contract-violation reporting.
//!
//! The harness trusts the operating system for resources it just created;
//! an unexpected failure there, or a broken internal invariant, is a bug in
//! the harness or its environment, not a test outcome. Such faults abort
//! the process with a diagnostic instead of flowing through the protocol.

/// Aborts the process with a harness diagnostic.
pub(crate) fn contract_violation(detail: &str) -> ! {
    panic!("harness contract violation: {detail}");
}

/// Asserts a harness invariant, aborting with a diagnostic when it does not
/// hold.
pub(crate) fn contract(condition: bool, detail: &str) {
    if !condition {
        contract_violation(detail);
    }
}
