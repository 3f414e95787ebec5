#![allow(dead_code)]
//! Assertions for use in the functional-test `main` functions, where the
//! harness under test cannot be trusted to report its own failures.

use std::process::exit;

pub fn require(condition: bool, message: &str) {
    if !condition {
        eprintln!("functional test failed: {message}");
        exit(1);
    }
}

pub fn require_eq_str(actual: &str, expected: &str, what: &str) {
    if actual != expected {
        eprintln!("functional test failed: unexpected {what}");
        eprintln!("  expected: {expected:?}");
        eprintln!("  actual:   {actual:?}");
        exit(1);
    }
}

pub fn require_eq_bytes(actual: &[u8], expected: &[u8], what: &str) {
    if actual != expected {
        eprintln!(
            "functional test failed: unexpected {what} ({} bytes, expected {})",
            actual.len(),
            expected.len()
        );
        exit(1);
    }
}
