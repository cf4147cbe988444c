//! Request/response exchange over a [`Transport`].

use crate::error::{Error, ErrorCode, Result};
use crate::transport::{ReadPoll, Transport};
use log::{debug, trace};
use std::thread;
use std::time::{Duration, Instant};

/// Default number of read polls before a transfer gives up.
pub const DEFAULT_MAX_POLLS: u32 = 100;

/// Polling policy of [`transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Incomplete polls tolerated before failing.
    pub max_polls: u32,
    /// Pause between two polls.
    pub poll_interval: Duration,
    /// Wall-clock limit for collecting one response.
    pub deadline: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_polls: DEFAULT_MAX_POLLS,
            poll_interval: Duration::ZERO,
            deadline: None,
        }
    }
}

impl TransferConfig {
    /// Set the poll bound.
    #[must_use]
    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls;
        self
    }

    /// Set the pause between polls.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the wall-clock limit.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Write `request` and collect a response of `response_len` bytes.
///
/// With `response_len == None` nothing is read and an empty buffer is
/// returned. Write failures are reported as communication errors without
/// reading. Otherwise the transport is polled until a complete response
/// arrives, `max_polls` polls came back incomplete, or the deadline passed;
/// the last poll's outcome is then reported with the bytes received so far.
pub fn transfer<T: Transport + ?Sized>(
    transport: &mut T,
    request: &[u8],
    response_len: Option<usize>,
    config: &TransferConfig,
) -> Result<Vec<u8>> {
    transport
        .write(request)
        .map_err(Error::into_comm)?;

    let Some(expected) = response_len else {
        return Ok(Vec::new());
    };

    let started = Instant::now();
    let mut last = Error::comm(ErrorCode::Unknown, "no read attempted");

    for poll in 1..=config.max_polls.max(1) {
        match transport.read(expected) {
            Ok(ReadPoll::Complete(response)) => {
                trace!("Response after {poll} poll(s)");
                return Ok(response);
            },
            Ok(ReadPoll::Incomplete { code, received }) => {
                last = Error::Comm {
                    code,
                    message: format!("received {} of {expected} bytes", received.len()),
                    received,
                };
            },
            Err(e) => last = e.into_comm(),
        }

        if config
            .deadline
            .is_some_and(|d| started.elapsed() >= d)
        {
            debug!("Transfer deadline passed after {poll} poll(s)");
            break;
        }
        if !config.poll_interval.is_zero() {
            thread::sleep(config.poll_interval);
        }
    }

    debug!("No complete response: {last}");
    Err(last)
}
