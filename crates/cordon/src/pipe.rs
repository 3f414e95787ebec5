//! Owned pipe endpoints with blocking byte I/O.
//!
//! Every pipe end has exactly one owner at any time: an [`InputEnd`] or
//! [`OutputEnd`] holds the descriptor and closes it on drop. Forking hands
//! ends across the process boundary by duplication followed by selective
//! close, never by sharing.
//!
//! EOF is a meaningful protocol event (the peer is gone) and surfaces as
//! [`ReadStatus::PipeClosed`]. Any other error from a pipe the harness just
//! created is a contract violation and aborts.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::unistd;

use crate::fault;

/// Outcome of an exact-length read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// The buffer was filled completely.
    Complete,
    /// The peer closed its end before enough bytes arrived.
    PipeClosed,
}

/// The writable end of a pipe.
#[derive(Debug)]
pub(crate) struct InputEnd {
    fd: OwnedFd,
}

impl InputEnd {
    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub(crate) fn as_raw(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// Writes the whole buffer, resuming short writes. No partial success
    /// is observable to the caller.
    pub(crate) fn write_all(&self, mut buf: &[u8]) {
        while !buf.is_empty() {
            match unistd::write(&self.fd, buf) {
                Ok(written) => buf = &buf[written..],
                Err(Errno::EINTR) => {}
                Err(err) => {
                    fault::contract_violation(&format!("write to harness pipe failed: {err}"))
                }
            }
        }
    }
}

/// The readable end of a pipe.
#[derive(Debug)]
pub(crate) struct OutputEnd {
    fd: OwnedFd,
}

impl OutputEnd {
    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Reads until the buffer is full, or reports [`ReadStatus::PipeClosed`]
    /// if the peer hangs up first. Used for frames, where a short read can
    /// only mean the runner died mid-protocol.
    pub(crate) fn read_exactly(&self, buf: &mut [u8]) -> ReadStatus {
        let mut filled = 0;
        while filled < buf.len() {
            match unistd::read(self.fd.as_raw_fd(), &mut buf[filled..]) {
                Ok(0) => return ReadStatus::PipeClosed,
                Ok(n) => filled += n,
                Err(Errno::EINTR) => {}
                Err(err) => {
                    fault::contract_violation(&format!("read from harness pipe failed: {err}"))
                }
            }
        }
        ReadStatus::Complete
    }

    /// A single underlying read of at most `buf.len()` bytes; returns the
    /// byte count, 0 on EOF. Used for streaming stdout/stderr drains.
    pub(crate) fn read_at_most(&self, buf: &mut [u8]) -> usize {
        loop {
            match unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(n) => return n,
                Err(Errno::EINTR) => {}
                Err(err) => {
                    fault::contract_violation(&format!("read from harness pipe failed: {err}"))
                }
            }
        }
    }
}

impl AsFd for OutputEnd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Creates an anonymous pipe as an owned `(read, write)` endpoint pair.
pub(crate) fn create() -> (OutputEnd, InputEnd) {
    let (read_fd, write_fd) = unistd::pipe()
        .unwrap_or_else(|err| fault::contract_violation(&format!("pipe creation failed: {err}")));
    (OutputEnd::from_owned(read_fd), InputEnd::from_owned(write_fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_all_then_read_exactly_round_trips() {
        let (reader, writer) = create();
        writer.write_all(b"abcdef");

        let mut buf = [0u8; 6];
        assert_eq!(reader.read_exactly(&mut buf), ReadStatus::Complete);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn read_exactly_reports_closed_peer() {
        let (reader, writer) = create();
        writer.write_all(b"ab");
        drop(writer);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read_exactly(&mut buf), ReadStatus::PipeClosed);
    }

    #[test]
    fn read_at_most_returns_available_bytes() {
        let (reader, writer) = create();
        writer.write_all(b"xy");

        let mut buf = [0u8; 64];
        let n = reader.read_at_most(&mut buf);
        assert_eq!(&buf[..n], b"xy");
    }

    #[test]
    fn read_at_most_sees_eof_as_zero() {
        let (reader, writer) = create();
        drop(writer);

        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at_most(&mut buf), 0);
    }

    #[test]
    fn large_transfers_resume_short_writes() {
        // Bigger than a pipe buffer; a reader thread keeps the pipe moving
        // so the blocking writer can finish.
        let (reader, writer) = create();
        let payload: Vec<u8> = (0..256u32).cycle().take(256 * 1024).map(|b| b as u8).collect();
        let expected = payload.clone();

        let drain = std::thread::spawn(move || {
            let mut collected = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = reader.read_at_most(&mut buf);
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            collected
        });

        writer.write_all(&payload);
        drop(writer);
        assert_eq!(drain.join().expect("drain thread"), expected);
    }
}
