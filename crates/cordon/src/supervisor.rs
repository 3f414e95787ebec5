//! Supervisor driver: spawns the runner and drives the whole run.
//!
//! One child serves every test in the run. Per test, the supervisor sends
//! a command frame and then services whichever child → parent pipe is
//! ready until the test's terminal frame arrives — draining stdout and
//! stderr opportunistically so the child never blocks on pipe
//! back-pressure, however much a body writes. A response frame acts as a
//! barrier (the runner flushes before emitting it), so servicing the
//! standard streams ahead of a simultaneously-ready response keeps every
//! captured byte attributed to the test that wrote it.

use tracing::{debug, warn};

use crate::fault;
use crate::pipe::{OutputEnd, ReadStatus};
use crate::poll::{PipeSignal, PollGuard};
use crate::process::{self, ChildProcess};
use crate::registry::{PlanEntry, TestRun};
use crate::results::{AssertionOutcome, Results, TestOutcome, TestStatus};
use crate::runner;
use crate::wire::{self, ResponseCode, ResponseFrame, ResponseHeader, RESPONSE_HEADER_LEN};

/// Read size for one stdout/stderr drain step.
const CAPTURE_CHUNK: usize = 4096;

/// Executes every registered test and aggregates the outcomes.
///
/// Must be reached by the binary's entry point before any other user code
/// touches the harness: the runner-mode dispatch lives here, so in the
/// re-executed child this function becomes the runner loop and never
/// returns.
///
/// A [`TestRun`] is single-use. A second call with the same instance
/// executes nothing and returns a [`Results`] whose only harness error is
/// `"Instance of TestRun cannot be reused"`.
pub fn run_all_tests(run: &TestRun) -> Results {
    if let Some((command_source, response_sink)) = process::runner_endpoints() {
        run.run_registrations();
        runner::serve(run, command_source, response_sink);
        std::process::exit(0);
    }

    if run.is_consumed() {
        return Results::reuse_rejection();
    }
    run.mark_consumed();

    run.run_registrations();
    let plan = run.plan();
    debug!(tests = plan.len(), "registry sealed");

    let mut child = ChildProcess::spawn().unwrap_or_else(|err| {
        fault::contract_violation(&format!("failed to start the test runner: {err}"))
    });
    let guard = PollGuard::new(&child.response, &child.std_out, &child.std_err);

    let mut outcomes = Vec::with_capacity(plan.len());
    let mut crashed_during: Option<String> = None;

    for entry in &plan {
        // The single runner is gone; nothing after the crash can execute.
        if crashed_during.is_some() {
            outcomes.push(TestOutcome::crashed(
                entry.name.clone(),
                entry.group_name.clone(),
            ));
            continue;
        }

        debug!(test = %entry.name, id = entry.id, "dispatching");
        child.command().write_all(&wire::encode_command(entry.id));

        let outcome = drive_test(
            &guard,
            &child.response,
            &child.std_out,
            &child.std_err,
            entry,
        );
        if outcome.status() == TestStatus::Crashed {
            warn!(test = %entry.name, "test runner lost mid-test");
            crashed_during = Some(entry.name.clone());
        }
        outcomes.push(outcome);
    }

    // EOF on the command pipe is the runner's clean-shutdown signal.
    child.command = None;
    drain_to_exit(&guard, &child.response, &child.std_out, &child.std_err);

    let status = child
        .wait()
        .unwrap_or_else(|err| fault::contract_violation(&err.to_string()));

    let mut harness_errors = Vec::new();
    if let Some(test_name) = &crashed_during {
        harness_errors.push(format!(
            "test runner terminated unexpectedly while running test `{test_name}` ({status})"
        ));
    } else if !status.is_clean_exit() {
        harness_errors.push(format!("test runner exited abnormally ({status})"));
    }

    Results::new(outcomes, harness_errors)
}

/// Services the three pipes until this test's terminal frame, or until the
/// poll guard reports the child gone.
fn drive_test(
    guard: &PollGuard<'_>,
    response: &OutputEnd,
    std_out: &OutputEnd,
    std_err: &OutputEnd,
    entry: &PlanEntry,
) -> TestOutcome {
    let mut out_bytes = Vec::new();
    let mut err_bytes = Vec::new();
    let mut assertions: Vec<AssertionOutcome> = Vec::new();
    let mut chunk = [0u8; CAPTURE_CHUNK];

    let status = 'drain: loop {
        let Some(ready) = guard.poll() else {
            break 'drain TestStatus::Crashed;
        };

        for signal in ready {
            match signal {
                PipeSignal::StdOutput => {
                    let n = std_out.read_at_most(&mut chunk);
                    out_bytes.extend_from_slice(&chunk[..n]);
                }
                PipeSignal::StdError => {
                    let n = std_err.read_at_most(&mut chunk);
                    err_bytes.extend_from_slice(&chunk[..n]);
                }
                PipeSignal::Response => {
                    let Some(frame) = read_response(response) else {
                        break 'drain TestStatus::Crashed;
                    };
                    fault::contract(
                        frame.test_id == entry.id,
                        "response frame names a test that is not running",
                    );

                    match frame.code {
                        ResponseCode::AssertionResult => {
                            assertions.push(AssertionOutcome::new(
                                frame.assertion_passed,
                                frame.assertion_index,
                                frame.message,
                            ));
                        }
                        ResponseCode::TestFinished => {
                            break 'drain finished_status(&assertions);
                        }
                        ResponseCode::TestAbortedBeforeFinish => {
                            break 'drain TestStatus::Failed;
                        }
                    }
                }
            }
        }
    };

    // Trailing output written before the terminal frame is already
    // buffered; pull it now so it cannot bleed into the next test.
    drain_residual(guard, std_out, std_err, &mut out_bytes, &mut err_bytes);

    TestOutcome::new(
        entry.name.clone(),
        entry.group_name.clone(),
        out_bytes,
        err_bytes,
        assertions,
        status,
    )
}

fn finished_status(assertions: &[AssertionOutcome]) -> TestStatus {
    if assertions.iter().all(AssertionOutcome::passed) {
        TestStatus::Passed
    } else {
        TestStatus::Failed
    }
}

/// Reads one complete response frame; `None` means the peer hung up
/// mid-protocol.
fn read_response(response: &OutputEnd) -> Option<ResponseFrame> {
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    if response.read_exactly(&mut header) == ReadStatus::PipeClosed {
        return None;
    }
    let header = ResponseHeader::decode(&header)
        .unwrap_or_else(|err| fault::contract_violation(&format!("malformed response frame: {err}")));

    let message = if header.message_len > 0 {
        let mut payload = vec![0u8; header.message_len as usize];
        if response.read_exactly(&mut payload) == ReadStatus::PipeClosed {
            return None;
        }
        let text = String::from_utf8(payload).unwrap_or_else(|_| {
            fault::contract_violation("response frame message is not valid UTF-8")
        });
        Some(text)
    } else {
        None
    };

    Some(ResponseFrame::from_parts(header, message))
}

/// Zero-timeout drain of the standard streams between tests. The child is
/// alive and idle here, so "nothing ready" means done, not "wait".
fn drain_residual(
    guard: &PollGuard<'_>,
    std_out: &OutputEnd,
    std_err: &OutputEnd,
    out_bytes: &mut Vec<u8>,
    err_bytes: &mut Vec<u8>,
) {
    let mut chunk = [0u8; CAPTURE_CHUNK];
    loop {
        let Some(ready) = guard.poll_now() else {
            return;
        };

        let mut drained = false;
        for signal in ready {
            let (end, sink) = match signal {
                PipeSignal::StdOutput => (std_out, &mut *out_bytes),
                PipeSignal::StdError => (std_err, &mut *err_bytes),
                // A ready response here belongs to the next exchange; it is
                // never consumed between tests.
                PipeSignal::Response => continue,
            };
            let n = end.read_at_most(&mut chunk);
            if n > 0 {
                sink.extend_from_slice(&chunk[..n]);
                drained = true;
            }
        }
        if !drained {
            return;
        }
    }
}

/// Final drain after the command pipe is closed: pulls everything until
/// the poll guard reports the child gone. Bytes arriving here were written
/// after the last terminal frame and belong to no test; they are counted
/// and dropped.
fn drain_to_exit(
    guard: &PollGuard<'_>,
    response: &OutputEnd,
    std_out: &OutputEnd,
    std_err: &OutputEnd,
) {
    let mut chunk = [0u8; CAPTURE_CHUNK];
    let mut discarded = 0usize;

    while let Some(ready) = guard.poll() {
        for signal in ready {
            let end = match signal {
                PipeSignal::StdOutput => std_out,
                PipeSignal::StdError => std_err,
                PipeSignal::Response => response,
            };
            discarded += end.read_at_most(&mut chunk);
        }
    }

    if discarded > 0 {
        debug!(bytes = discarded, "discarded unattributable output after the final test");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe;

    fn entry(id: u64, name: &str) -> PlanEntry {
        PlanEntry {
            id,
            name: name.to_string(),
            group_name: "scripted".to_string(),
        }
    }

    struct ScriptedRunner {
        response: (pipe::OutputEnd, pipe::InputEnd),
        std_out: (pipe::OutputEnd, pipe::InputEnd),
        std_err: (pipe::OutputEnd, pipe::InputEnd),
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                response: pipe::create(),
                std_out: pipe::create(),
                std_err: pipe::create(),
            }
        }

        fn drive(&self, entry: &PlanEntry) -> TestOutcome {
            let guard = PollGuard::new(&self.response.0, &self.std_out.0, &self.std_err.0);
            drive_test(
                &guard,
                &self.response.0,
                &self.std_out.0,
                &self.std_err.0,
                entry,
            )
        }
    }

    #[test]
    fn passing_exchange_is_captured_and_attributed() {
        let runner = ScriptedRunner::new();
        runner.std_out.1.write_all(b"a1\n");
        runner
            .response
            .1
            .write_all(&ResponseFrame::assertion(0, true, 0, None).encode());
        runner.std_out.1.write_all(b"a2\n");
        runner
            .response
            .1
            .write_all(&ResponseFrame::finished(0).encode());

        let outcome = runner.drive(&entry(0, "first"));
        assert_eq!(outcome.status(), TestStatus::Passed);
        assert_eq!(outcome.std_out(), b"a1\na2\n");
        assert_eq!(outcome.std_err(), b"");
        assert_eq!(outcome.assertions().len(), 1);
        assert!(outcome.assertions()[0].passed());
    }

    #[test]
    fn failed_assertion_message_reaches_the_outcome() {
        let runner = ScriptedRunner::new();
        runner
            .response
            .1
            .write_all(&ResponseFrame::assertion(2, false, 0, Some("expected 4, got 5")).encode());
        runner
            .response
            .1
            .write_all(&ResponseFrame::finished(2).encode());

        let outcome = runner.drive(&entry(2, "arith"));
        assert_eq!(outcome.status(), TestStatus::Failed);
        assert_eq!(outcome.assertions()[0].message(), Some("expected 4, got 5"));
        assert_eq!(outcome.assertions()[0].index(), 0);
    }

    #[test]
    fn aborted_terminal_frame_fails_the_test() {
        let runner = ScriptedRunner::new();
        runner.std_err.1.write_all(b"panicked\n");
        runner
            .response
            .1
            .write_all(&ResponseFrame::aborted(1).encode());

        let outcome = runner.drive(&entry(1, "gives up"));
        assert_eq!(outcome.status(), TestStatus::Failed);
        assert_eq!(outcome.std_err(), b"panicked\n");
    }

    #[test]
    fn torn_frame_marks_the_test_crashed() {
        let runner = ScriptedRunner::new();
        runner.std_out.1.write_all(b"before the end\n");
        let frame = ResponseFrame::assertion(0, true, 0, None).encode();
        runner.response.1.write_all(&frame[..10]);

        drop(runner.response.1);
        let guard = PollGuard::new(&runner.response.0, &runner.std_out.0, &runner.std_err.0);
        let outcome = drive_test(
            &guard,
            &runner.response.0,
            &runner.std_out.0,
            &runner.std_err.0,
            &entry(0, "torn"),
        );

        assert_eq!(outcome.status(), TestStatus::Crashed);
        // Output that made it into the pipe is still attributed.
        assert_eq!(outcome.std_out(), b"before the end\n");
    }

    #[test]
    fn vanished_peer_marks_the_test_crashed() {
        let runner = ScriptedRunner::new();
        let guard = PollGuard::new(&runner.response.0, &runner.std_out.0, &runner.std_err.0);

        drop(runner.response.1);
        drop(runner.std_out.1);
        drop(runner.std_err.1);

        let outcome = drive_test(
            &guard,
            &runner.response.0,
            &runner.std_out.0,
            &runner.std_err.0,
            &entry(0, "vanished"),
        );
        assert_eq!(outcome.status(), TestStatus::Crashed);
    }

    #[test]
    fn trailing_output_before_the_terminal_frame_is_not_lost() {
        let runner = ScriptedRunner::new();
        runner
            .response
            .1
            .write_all(&ResponseFrame::assertion(0, true, 0, None).encode());
        runner.std_out.1.write_all(b"written after the last assertion\n");
        runner.std_err.1.write_all(b"and on stderr too\n");
        runner
            .response
            .1
            .write_all(&ResponseFrame::finished(0).encode());

        let outcome = runner.drive(&entry(0, "trailing"));
        assert_eq!(outcome.status(), TestStatus::Passed);
        assert_eq!(outcome.std_out(), b"written after the last assertion\n");
        assert_eq!(outcome.std_err(), b"and on stderr too\n");
    }

    #[test]
    fn second_execution_of_a_test_run_is_rejected() {
        let run = TestRun::create();
        run.mark_consumed();

        let results = run_all_tests(&run);
        assert!(!results.success());
        assert_eq!(results.error_count(), 1);
        assert_eq!(results.error(0), "Instance of TestRun cannot be reused");
        assert_eq!(results.test_count(), 0);
    }
}
