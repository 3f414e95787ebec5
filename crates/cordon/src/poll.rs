//! Readiness multiplexing over the three child → parent pipes.
//!
//! The supervisor must distinguish "child still alive, nothing yet" from
//! "child gone, nothing more ever". The termination signal is the
//! conjunction: no endpoint has readable data AND all three report
//! peer-hang-up. Any other state keeps the drain loop going.

use std::os::fd::AsFd;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::fault;
use crate::pipe::OutputEnd;

/// Identifies which endpoint has data ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeSignal {
    StdOutput,
    StdError,
    Response,
}

const RESPONSE_TOKEN: u64 = 0;
const STD_OUT_TOKEN: u64 = 1;
const STD_ERR_TOKEN: u64 = 2;
const WATCHED_ENDS: usize = 3;

/// Multiplexer over the response, stdout, and stderr read ends.
///
/// Holds the three endpoints by reference for the duration of a run; the
/// epoll registration is keyed by descriptor and dies with the guard.
pub(crate) struct PollGuard<'ends> {
    epoll: Epoll,
    _response: &'ends OutputEnd,
    _std_out: &'ends OutputEnd,
    _std_err: &'ends OutputEnd,
}

impl<'ends> PollGuard<'ends> {
    pub(crate) fn new(
        response: &'ends OutputEnd,
        std_out: &'ends OutputEnd,
        std_err: &'ends OutputEnd,
    ) -> Self {
        let epoll = Epoll::new(EpollCreateFlags::empty())
            .unwrap_or_else(|err| fault::contract_violation(&format!("epoll_create1 failed: {err}")));

        let interest = EpollFlags::EPOLLIN
            | EpollFlags::EPOLLERR
            | EpollFlags::EPOLLHUP
            | EpollFlags::EPOLLRDHUP;
        for (end, token) in [
            (response, RESPONSE_TOKEN),
            (std_out, STD_OUT_TOKEN),
            (std_err, STD_ERR_TOKEN),
        ] {
            epoll
                .add(end.as_fd(), EpollEvent::new(interest, token))
                .unwrap_or_else(|err| {
                    fault::contract_violation(&format!("epoll_ctl add failed: {err}"))
                });
        }

        Self {
            epoll,
            _response: response,
            _std_out: std_out,
            _std_err: std_err,
        }
    }

    /// Blocks until at least one endpoint is ready.
    ///
    /// Returns `None` when the final drain is complete: nothing readable
    /// anywhere and all three peers hung up. Otherwise returns the
    /// endpoints with readable data, stdout/stderr ordered ahead of the
    /// response end so output produced before a frame is attributed first.
    pub(crate) fn poll(&self) -> Option<Vec<PipeSignal>> {
        self.poll_with(EpollTimeout::NONE)
    }

    /// Non-blocking variant for residual drains between tests: the child
    /// is alive and idle, so an empty ready-set means "nothing buffered",
    /// not "come back later".
    pub(crate) fn poll_now(&self) -> Option<Vec<PipeSignal>> {
        self.poll_with(EpollTimeout::ZERO)
    }

    fn poll_with(&self, timeout: EpollTimeout) -> Option<Vec<PipeSignal>> {
        let mut events = [EpollEvent::empty(); WATCHED_ENDS];
        let ready = self
            .epoll
            .wait(&mut events, timeout)
            .unwrap_or_else(|err| fault::contract_violation(&format!("epoll_wait failed: {err}")));

        let mut readable = [false; WATCHED_ENDS];
        let mut hung_up = [false; WATCHED_ENDS];
        for event in &events[..ready] {
            let token = event.data() as usize;
            fault::contract(token < WATCHED_ENDS, "epoll produced an unknown token");
            readable[token] |= event.events().contains(EpollFlags::EPOLLIN);
            hung_up[token] |= event.events().contains(EpollFlags::EPOLLHUP);
        }

        if !readable.iter().any(|r| *r) && hung_up.iter().all(|h| *h) {
            return None;
        }

        let mut signals = Vec::with_capacity(WATCHED_ENDS);
        if readable[STD_OUT_TOKEN as usize] {
            signals.push(PipeSignal::StdOutput);
        }
        if readable[STD_ERR_TOKEN as usize] {
            signals.push(PipeSignal::StdError);
        }
        if readable[RESPONSE_TOKEN as usize] {
            signals.push(PipeSignal::Response);
        }
        Some(signals)
    }
}
