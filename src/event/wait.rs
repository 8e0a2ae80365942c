use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::{Events, Poll, Token, unix::SourceFd};
use serde::Serialize;

use super::EdgeMonitor;
use super::pins::Observer;
use super::worker::EDGE_INTEREST;
use crate::backend::GpioBackend;
use crate::config::{Direction, Edge, Level};
use crate::error::GpioError;

const WAIT_TOKEN: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "level", rename_all = "kebab-case")]
pub enum WaitOutcome {
    Edge(Level),
    TimedOut,
}

impl<B: GpioBackend + 'static> EdgeMonitor<B> {
    /// Blocks until `line` sees an edge, on a private multiplexer. `None` waits forever.
    pub fn blocking_wait_for_edge(
        &self,
        line: u32,
        edge: Edge,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, GpioError> {
        debug!("line {line}: blocking wait for {edge} edge");
        let mut poll = Poll::new().map_err(|e| GpioError::mux(line, "create", e))?;

        let fd = {
            let mut state = self.shared.state.lock();
            if state.pins.is_observed(line) {
                return Err(GpioError::AlreadyObserving { line });
            }
            let backend = self.shared.backend.as_ref();
            backend.set_direction(line, Direction::In)?;
            backend.set_edge(line, edge)?;
            let fd = state.pins.ensure_value_handle(line, backend)?;
            state.pins.claim(line, Observer::Wait);
            state.pins.arm(line);
            fd
        };

        let result = self.wait_registered(&mut poll, line, fd, timeout);
        self.shared.state.lock().pins.unclaim(line);
        result
    }

    fn wait_registered(
        &self,
        poll: &mut Poll,
        line: u32,
        fd: RawFd,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, GpioError> {
        poll.registry()
            .register(&mut SourceFd(&fd), WAIT_TOKEN, EDGE_INTEREST)
            .map_err(|e| GpioError::mux(line, "register", e))?;

        let result = self.await_second_notification(poll, line, timeout);

        if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
            warn!("line {line}: could not deregister from wait multiplexer: {e}");
        }
        result
    }

    fn await_second_notification(
        &self,
        poll: &mut Poll,
        line: u32,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, GpioError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut events = Events::with_capacity(1);
        let mut notifications = 0;

        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("line {line}: blocking wait timed out");
                        return Ok(WaitOutcome::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            match poll.poll(&mut events, remaining) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(GpioError::mux(line, "wait", e)),
            }
            if !events.iter().any(|event| event.token() == WAIT_TOKEN) {
                continue;
            }

            notifications += 1;
            let mut state = self.shared.state.lock();
            if notifications == 1 {
                state.pins.mark_seen(line);
                debug!("line {line}: discarding initial notification");
                continue;
            }
            let level = state.pins.read_level(line)?;
            debug!("line {line}: blocking wait triggered at {level:?}");
            return Ok(WaitOutcome::Edge(level));
        }
    }
}
