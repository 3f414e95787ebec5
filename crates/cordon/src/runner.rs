//! Child side of the protocol: command dispatch and assertion reporting.
//!
//! The runner reads one command frame at a time, executes the named test
//! body, and answers with assertion frames plus a terminal frame. Stdout
//! and stderr are flushed before every frame, which makes each frame a
//! barrier: all output the body produced before the frame is already in
//! its pipe when the supervisor reads the frame, so captures attribute
//! bytes to the right test.
//!
//! The runner itself never writes to descriptors 1 or 2 — in runner mode
//! they are the captured test streams.

use std::io::{self, Write};
use std::rc::Rc;

use crate::fault;
use crate::pipe::{InputEnd, OutputEnd, ReadStatus};
use crate::registry::TestRun;
use crate::wire::{self, ResponseFrame};

/// Per-test handle given to the body: the gateway for assertions.
///
/// Assertion indices are dense, starting at 0, in emission order.
pub struct Context {
    test_id: u64,
    assertions: std::cell::Cell<u64>,
    sink: Rc<InputEnd>,
}

impl Context {
    pub(crate) fn new(test_id: u64, sink: Rc<InputEnd>) -> Self {
        Self {
            test_id,
            assertions: std::cell::Cell::new(0),
            sink,
        }
    }

    /// Records one assertion outcome.
    pub fn assert(&self, condition: bool) {
        self.emit(condition, None);
    }

    /// Records one assertion outcome with a diagnostic. The message is
    /// attached to the frame only when the assertion fails.
    pub fn assert_msg(&self, condition: bool, message: &str) {
        self.emit(condition, Some(message));
    }

    fn emit(&self, passed: bool, message: Option<&str>) {
        flush_std_streams();

        let index = self.assertions.get();
        self.assertions.set(index + 1);

        let diagnostic = if passed { None } else { message };
        let frame = ResponseFrame::assertion(self.test_id, passed, index, diagnostic);
        self.sink.write_all(&frame.encode());
    }
}

/// Flushes both standard streams so frame emission acts as an output
/// barrier.
fn flush_std_streams() {
    if io::stdout().flush().is_err() {
        fault::contract_violation("failed to flush captured stdout");
    }
    if io::stderr().flush().is_err() {
        fault::contract_violation("failed to flush captured stderr");
    }
}

/// Runner loop: executes commands until the supervisor closes the command
/// pipe, which is the clean-shutdown signal.
pub(crate) fn serve(run: &TestRun, command: OutputEnd, response: InputEnd) {
    let response = Rc::new(response);

    loop {
        let mut frame = [0u8; wire::COMMAND_FRAME_LEN];
        match command.read_exactly(&mut frame) {
            ReadStatus::PipeClosed => return,
            ReadStatus::Complete => {}
        }
        let test_id = wire::decode_command(&frame);

        let ctx = Context::new(test_id, Rc::clone(&response));
        let body_result = run.invoke_body(test_id, &ctx);

        flush_std_streams();
        let terminal = match body_result {
            Ok(()) => ResponseFrame::finished(test_id),
            // The unwind payload already went to the captured stderr via
            // the panic hook; the frame only has to name the ending.
            Err(_) => ResponseFrame::aborted(test_id),
        };
        response.write_all(&terminal.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe;
    use crate::wire::{ResponseCode, ResponseHeader, RESPONSE_HEADER_LEN};

    fn read_frame(end: &pipe::OutputEnd) -> ResponseFrame {
        let mut header = [0u8; RESPONSE_HEADER_LEN];
        assert_eq!(end.read_exactly(&mut header), ReadStatus::Complete);
        let header = ResponseHeader::decode(&header).expect("header");

        let message = if header.message_len > 0 {
            let mut payload = vec![0u8; header.message_len as usize];
            assert_eq!(end.read_exactly(&mut payload), ReadStatus::Complete);
            Some(String::from_utf8(payload).expect("utf-8"))
        } else {
            None
        };
        ResponseFrame::from_parts(header, message)
    }

    #[test]
    fn assertion_indices_are_dense_in_emission_order() {
        let (read_end, write_end) = pipe::create();
        let ctx = Context::new(4, Rc::new(write_end));

        ctx.assert(true);
        ctx.assert_msg(false, "left != right");
        ctx.assert(true);

        for (expected_index, expected_passed) in [(0, true), (1, false), (2, true)] {
            let frame = read_frame(&read_end);
            assert_eq!(frame.code, ResponseCode::AssertionResult);
            assert_eq!(frame.test_id, 4);
            assert_eq!(frame.assertion_index, expected_index);
            assert_eq!(frame.assertion_passed, expected_passed);
        }
    }

    #[test]
    fn diagnostics_travel_only_on_failure() {
        let (read_end, write_end) = pipe::create();
        let ctx = Context::new(0, Rc::new(write_end));

        ctx.assert_msg(true, "not interesting when passing");
        ctx.assert_msg(false, "expected 4, got 5");

        assert_eq!(read_frame(&read_end).message, None);
        assert_eq!(
            read_frame(&read_end).message.as_deref(),
            Some("expected 4, got 5")
        );
    }

    #[test]
    fn serve_answers_a_command_and_exits_on_eof() {
        let run = TestRun::create();
        let g = run.group("in-process");
        run.test(g, "one passing assertion").run(|ctx| {
            ctx.assert(true);
        });
        run.run_registrations();

        let (cmd_read, cmd_write) = pipe::create();
        let (resp_read, resp_write) = pipe::create();

        cmd_write.write_all(&wire::encode_command(0));
        drop(cmd_write);
        serve(&run, cmd_read, resp_write);

        let assertion = read_frame(&resp_read);
        assert_eq!(assertion.code, ResponseCode::AssertionResult);
        assert!(assertion.assertion_passed);

        let terminal = read_frame(&resp_read);
        assert_eq!(terminal.code, ResponseCode::TestFinished);
        assert_eq!(terminal.test_id, 0);
    }

    #[test]
    fn serve_reports_an_unwound_body_as_aborted() {
        let run = TestRun::create();
        let g = run.group("in-process");
        run.test(g, "panics midway").run(|ctx| {
            ctx.assert(true);
            panic!("body gave up");
        });
        run.run_registrations();

        let (cmd_read, cmd_write) = pipe::create();
        let (resp_read, resp_write) = pipe::create();

        cmd_write.write_all(&wire::encode_command(0));
        drop(cmd_write);
        serve(&run, cmd_read, resp_write);

        let assertion = read_frame(&resp_read);
        assert_eq!(assertion.code, ResponseCode::AssertionResult);

        let terminal = read_frame(&resp_read);
        assert_eq!(terminal.code, ResponseCode::TestAbortedBeforeFinish);
    }
}
