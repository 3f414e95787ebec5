//! Test declaration and the process-wide registry.
//!
//! Suites register through the [`suite!`](crate::suite) macro, which
//! submits a [`Registration`] at link time. [`run_all_tests`] runs every
//! registration function exactly once against the [`TestRun`] and then
//! seals the registry. The same pass runs in the supervisor and in the
//! re-executed runner, which is what makes test ids agree on both sides of
//! the protocol: ids are assigned densely, starting at 0, in registration
//! order, and registration order is link order — identical within one
//! binary image.
//!
//! [`run_all_tests`]: crate::run_all_tests

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::fault;
use crate::runner::Context;

/// A link-time registration entry. Declared by [`suite!`](crate::suite);
/// collected and invoked by the harness.
pub struct Registration {
    /// Called once per run with the registry handle.
    pub register: fn(&TestRun),
}

inventory::collect!(Registration);

/// Handle to a named group of tests.
///
/// Obtained from [`TestRun::group`]; copyable so one handle can anchor any
/// number of test declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Group {
    index: usize,
}

pub(crate) struct TestCase {
    pub(crate) id: u64,
    pub(crate) group: Group,
    pub(crate) name: String,
    pub(crate) body: Box<dyn Fn(&Context)>,
}

struct GroupEntry {
    name: String,
}

#[derive(Default)]
struct Registry {
    groups: Vec<GroupEntry>,
    tests: Vec<TestCase>,
    sealed: bool,
}

/// Supervisor-side snapshot of one registered test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlanEntry {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) group_name: String,
}

/// Process-wide registry handle, created exactly once per run via
/// [`TestRun::create`] and handed to every registration function.
///
/// Registration happens in a single, non-reentrant phase driven by
/// [`run_all_tests`](crate::run_all_tests); afterwards the registry is
/// read-only. A `TestRun` may be executed at most once — a second
/// execution yields a failed [`Results`](crate::Results) carrying the
/// harness error `"Instance of TestRun cannot be reused"`.
pub struct TestRun {
    inner: RefCell<Registry>,
    consumed: Cell<bool>,
}

impl TestRun {
    /// Creates an empty registry handle.
    pub fn create() -> Self {
        Self {
            inner: RefCell::new(Registry::default()),
            consumed: Cell::new(false),
        }
    }

    /// Opens a named group. Groups appear in registration order; names are
    /// not deduplicated.
    pub fn group(&self, name: &str) -> Group {
        let mut inner = self.inner.borrow_mut();
        fault::contract(!inner.sealed, "test registration phase is over");

        let index = inner.groups.len();
        inner.groups.push(GroupEntry {
            name: name.to_string(),
        });
        Group { index }
    }

    /// Starts declaring a test under `group`. The declaration takes effect
    /// when the returned builder's [`run`](TestBuilder::run) is called with
    /// the test body.
    pub fn test(&self, group: Group, name: &str) -> TestBuilder<'_> {
        {
            let inner = self.inner.borrow();
            fault::contract(!inner.sealed, "test registration phase is over");
            fault::contract(group.index < inner.groups.len(), "unknown test group");
        }
        TestBuilder {
            run: self,
            group,
            name: name.to_string(),
        }
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.consumed.get()
    }

    pub(crate) fn mark_consumed(&self) {
        self.consumed.set(true);
    }

    /// Runs every collected registration function, then seals the registry.
    pub(crate) fn run_registrations(&self) {
        for registration in inventory::iter::<Registration> {
            (registration.register)(self);
        }
        self.inner.borrow_mut().sealed = true;
    }

    /// Ordered supervisor-side view of the registered tests.
    pub(crate) fn plan(&self) -> Vec<PlanEntry> {
        let inner = self.inner.borrow();
        inner
            .tests
            .iter()
            .map(|case| PlanEntry {
                id: case.id,
                name: case.name.clone(),
                group_name: inner.groups[case.group.index].name.clone(),
            })
            .collect()
    }

    /// Invokes a test body, catching unwinds so the runner can emit the
    /// aborted terminal frame instead of tearing the protocol down.
    pub(crate) fn invoke_body(&self, test_id: u64, ctx: &Context) -> std::thread::Result<()> {
        let inner = self.inner.borrow();
        let case = inner
            .tests
            .iter()
            .find(|case| case.id == test_id)
            .unwrap_or_else(|| {
                fault::contract_violation(&format!("command names unknown test id {test_id}"))
            });
        catch_unwind(AssertUnwindSafe(|| (case.body)(ctx)))
    }
}

/// In-flight test declaration; completes on [`run`](Self::run).
pub struct TestBuilder<'run> {
    run: &'run TestRun,
    group: Group,
    name: String,
}

impl TestBuilder<'_> {
    /// Registers the test body. Ids are assigned densely in call order.
    pub fn run(self, body: impl Fn(&Context) + 'static) {
        let mut inner = self.run.inner.borrow_mut();
        fault::contract(!inner.sealed, "test registration phase is over");

        let id = inner.tests.len() as u64;
        inner.tests.push(TestCase {
            id,
            group: self.group,
            name: self.name,
            body: Box::new(body),
        });
    }
}
