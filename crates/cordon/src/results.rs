//! Aggregate run outcome exposed to the entry point.
//!
//! Everything here is immutable after construction: the supervisor builds
//! one [`TestOutcome`] per registered test plus any harness-level error
//! strings, and hands the caller a [`Results`] to interrogate.

use std::fmt;

use crate::fault;

/// Exact harness error recorded when a [`TestRun`](crate::TestRun) is
/// executed a second time.
pub(crate) const REUSE_ERROR: &str = "Instance of TestRun cannot be reused";

/// Terminal status of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    /// The body finished and every assertion passed.
    Passed,
    /// The body finished with at least one failed assertion, or unwound
    /// before finishing.
    Failed,
    /// The runner died before emitting the test's terminal frame.
    Crashed,
    /// Reserved: per-test wall-clock timeouts are not part of the core.
    TimedOut,
}

impl TestStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
            Self::TimedOut => "timed-out",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single assertion, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionOutcome {
    passed: bool,
    index: u64,
    message: Option<String>,
}

impl AssertionOutcome {
    pub(crate) fn new(passed: bool, index: u64, message: Option<String>) -> Self {
        Self {
            passed,
            index,
            message,
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.passed
    }

    /// Dense per-test index: `0, 1, …` in emission order.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Diagnostic attached to the assertion, when one was provided.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Everything the supervisor observed about one test.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    test_name: String,
    group_name: String,
    std_out: Vec<u8>,
    std_err: Vec<u8>,
    assertions: Vec<AssertionOutcome>,
    status: TestStatus,
}

impl TestOutcome {
    pub(crate) fn new(
        test_name: String,
        group_name: String,
        std_out: Vec<u8>,
        std_err: Vec<u8>,
        assertions: Vec<AssertionOutcome>,
        status: TestStatus,
    ) -> Self {
        Self {
            test_name,
            group_name,
            std_out,
            std_err,
            assertions,
            status,
        }
    }

    /// Outcome for a test the runner never finished (or never reached,
    /// when an earlier test took the runner down).
    pub(crate) fn crashed(test_name: String, group_name: String) -> Self {
        Self::new(
            test_name,
            group_name,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            TestStatus::Crashed,
        )
    }

    #[must_use]
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    #[must_use]
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Bytes the test body wrote to descriptor 1, in order.
    #[must_use]
    pub fn std_out(&self) -> &[u8] {
        &self.std_out
    }

    /// Bytes the test body wrote to descriptor 2, in order.
    #[must_use]
    pub fn std_err(&self) -> &[u8] {
        &self.std_err
    }

    #[must_use]
    pub fn assertions(&self) -> &[AssertionOutcome] {
        &self.assertions
    }

    #[must_use]
    pub fn status(&self) -> TestStatus {
        self.status
    }
}

/// Aggregate outcome of a whole run.
#[derive(Debug)]
pub struct Results {
    outcomes: Vec<TestOutcome>,
    harness_errors: Vec<String>,
}

impl Results {
    pub(crate) fn new(outcomes: Vec<TestOutcome>, harness_errors: Vec<String>) -> Self {
        Self {
            outcomes,
            harness_errors,
        }
    }

    pub(crate) fn reuse_rejection() -> Self {
        Self::new(Vec::new(), vec![REUSE_ERROR.to_string()])
    }

    /// True iff every test passed and no harness-level error was recorded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.harness_errors.is_empty()
            && self
                .outcomes
                .iter()
                .all(|outcome| outcome.status() == TestStatus::Passed)
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.harness_errors.len()
    }

    /// The `i`-th harness error. Out-of-range access is a contract
    /// violation.
    #[must_use]
    pub fn error(&self, i: usize) -> &str {
        self.harness_errors
            .get(i)
            .map(String::as_str)
            .unwrap_or_else(|| fault::contract_violation("harness error index out of range"))
    }

    /// Number of registered tests — not the executed count: tests the
    /// runner never reached still have (crashed) outcomes here.
    #[must_use]
    pub fn test_count(&self) -> usize {
        self.outcomes.len()
    }

    /// The `i`-th test outcome, in registration order. Out-of-range access
    /// is a contract violation.
    #[must_use]
    pub fn test_outcome(&self, i: usize) -> &TestOutcome {
        self.outcomes
            .get(i)
            .unwrap_or_else(|| fault::contract_violation("test outcome index out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing(name: &str) -> TestOutcome {
        TestOutcome::new(
            name.to_string(),
            "group".to_string(),
            b"out".to_vec(),
            Vec::new(),
            vec![AssertionOutcome::new(true, 0, None)],
            TestStatus::Passed,
        )
    }

    fn failing(name: &str) -> TestOutcome {
        TestOutcome::new(
            name.to_string(),
            "group".to_string(),
            Vec::new(),
            Vec::new(),
            vec![AssertionOutcome::new(false, 0, Some("nope".to_string()))],
            TestStatus::Failed,
        )
    }

    #[test]
    fn empty_run_succeeds() {
        let results = Results::new(Vec::new(), Vec::new());
        assert!(results.success());
        assert_eq!(results.error_count(), 0);
        assert_eq!(results.test_count(), 0);
    }

    #[test]
    fn all_passing_is_success() {
        let results = Results::new(vec![passing("a"), passing("b")], Vec::new());
        assert!(results.success());
        assert_eq!(results.test_count(), 2);
        assert_eq!(results.test_outcome(1).test_name(), "b");
    }

    #[test]
    fn one_failure_fails_the_run() {
        let results = Results::new(vec![passing("a"), failing("b")], Vec::new());
        assert!(!results.success());
        assert_eq!(results.test_outcome(1).status(), TestStatus::Failed);
        assert_eq!(
            results.test_outcome(1).assertions()[0].message(),
            Some("nope")
        );
    }

    #[test]
    fn harness_errors_fail_the_run_even_with_passing_tests() {
        let results = Results::new(
            vec![passing("a")],
            vec!["test runner exited abnormally (signal 9)".to_string()],
        );
        assert!(!results.success());
        assert_eq!(results.error_count(), 1);
        assert!(results.error(0).contains("signal 9"));
    }

    #[test]
    fn reuse_rejection_carries_the_exact_error_string() {
        let results = Results::reuse_rejection();
        assert!(!results.success());
        assert_eq!(results.error_count(), 1);
        assert_eq!(results.error(0), "Instance of TestRun cannot be reused");
        assert_eq!(results.test_count(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_outcome_access_is_a_contract_violation() {
        let results = Results::new(Vec::new(), Vec::new());
        let _ = results.test_outcome(0);
    }

    #[test]
    fn crashed_outcome_has_empty_captures() {
        let outcome = TestOutcome::crashed("t".to_string(), "g".to_string());
        assert_eq!(outcome.status(), TestStatus::Crashed);
        assert!(outcome.std_out().is_empty());
        assert!(outcome.std_err().is_empty());
        assert!(outcome.assertions().is_empty());
    }

    #[test]
    fn status_strings_are_stable() {
        assert_eq!(TestStatus::Passed.as_str(), "passed");
        assert_eq!(TestStatus::Failed.as_str(), "failed");
        assert_eq!(TestStatus::Crashed.as_str(), "crashed");
        assert_eq!(TestStatus::TimedOut.as_str(), "timed-out");
    }
}
