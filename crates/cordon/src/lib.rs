#![deny(unsafe_code)]
//! Process-isolating unit-test harness.
//!
//! Every declared test case runs in a child process of the test binary
//! itself, so crashes, memory corruption, and fatal assertions are isolated
//! from the parent and from sibling tests. The parent ("supervisor") drives
//! tests one at a time, streaming each test's stdout and stderr through
//! dedicated pipes and receiving structured per-assertion responses over a
//! control pipe. One binary, two modes: supervisor mode (the default) and
//! runner mode (the re-executed child, selected by an internal environment
//! marker).
//!
//! # Usage
//!
//! Tests are declared with [`suite!`] and executed by [`run_all_tests`]:
//!
//! ```no_run
//! cordon::suite!(|t| {
//!     let g = t.group("arithmetic");
//!     t.test(g, "addition holds").run(|ctx| {
//!         ctx.assert(1 + 1 == 2);
//!     });
//! });
//!
//! cordon::main!();
//! ```
//!
//! A custom entry point works the same way; the runner-mode dispatch lives
//! inside [`run_all_tests`], so any `main` that calls it satisfies the
//! self-invocation contract:
//!
//! ```no_run
//! fn main() -> std::process::ExitCode {
//!     let t = cordon::TestRun::create();
//!     let results = cordon::run_all_tests(&t);
//!     if results.success() {
//!         std::process::ExitCode::SUCCESS
//!     } else {
//!         std::process::ExitCode::from(1)
//!     }
//! }
//! ```
//!
//! # Platform
//!
//! POSIX-like systems only: the launcher relies on `pipe`/`fork`/`execve`,
//! the multiplexer on `epoll`, and self-re-execution on a canonicalized
//! `/proc/self/exe`.

mod fault;
pub(crate) mod pipe;
pub(crate) mod poll;
pub(crate) mod process;
pub(crate) mod wire;

pub mod registry;
pub mod report;
pub mod results;
pub mod runner;
pub mod supervisor;

pub use registry::{Group, Registration, TestBuilder, TestRun};
pub use report::{EvidenceCollector, RunEvidence, TestEvidence};
pub use results::{AssertionOutcome, Results, TestOutcome, TestStatus};
pub use runner::Context;
pub use supervisor::run_all_tests;

// Re-exported for the `suite!` macro expansion; not part of the public API
// surface proper.
#[doc(hidden)]
pub use inventory;

/// Default entry-point body: create the [`TestRun`], execute it, and map the
/// aggregate outcome to an exit code. Exit code is 1 if any harness error was
/// recorded or any test did not pass, 0 otherwise.
pub fn harness_main() -> std::process::ExitCode {
    let t = TestRun::create();
    let results = run_all_tests(&t);

    if results.error_count() > 0 {
        return std::process::ExitCode::from(1);
    }
    if !results.success() {
        return std::process::ExitCode::from(1);
    }

    std::process::ExitCode::SUCCESS
}

/// Expands to a `main` function delegating to [`harness_main`].
///
/// The stand-in for a weak-symbol default entry point: test binaries that
/// need no custom setup declare their suites and invoke this once.
#[macro_export]
macro_rules! main {
    () => {
        fn main() -> ::std::process::ExitCode {
            $crate::harness_main()
        }
    };
}

/// Declares a registration function that runs during [`run_all_tests`] in
/// both the supervisor and the runner, so parent and child build identical
/// registries.
///
/// ```no_run
/// cordon::suite!(|t| {
///     let g = t.group("io");
///     t.test(g, "reads back what it wrote").run(|ctx| {
///         ctx.assert(true);
///     });
/// });
/// ```
#[macro_export]
macro_rules! suite {
    (|$t:ident| $body:block) => {
        $crate::inventory::submit! {
            $crate::Registration {
                register: |$t: &$crate::TestRun| $body,
            }
        }
    };
}
