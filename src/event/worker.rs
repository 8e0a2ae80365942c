use std::io::{self, ErrorKind};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, error, warn};
use mio::{Events, Interest, Poll, Registry, Token, Waker, unix::SourceFd};
use parking_lot::Mutex;
use serde::Serialize;

use super::Shared;
use super::pins::Observer;
use super::callbacks::invoke;
use crate::backend::GpioBackend;
use crate::error::GpioError;

const EVENTS_CAPACITY: usize = 16;
const WAKE_TOKEN: Token = Token(usize::MAX);

// sysfs value attributes signal edges as priority data
pub(crate) const EDGE_INTEREST: Interest = Interest::READABLE.add(Interest::PRIORITY);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Stopped,
    Running,
}

/// Value handles are registered under a token equal to their descriptor.
pub(crate) struct Multiplexer {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    shutdown: AtomicBool,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn register(&self, fd: RawFd) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), fd_token(fd)?, EDGE_INTEREST)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("could not wake polling worker: {e}");
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn fd_token(fd: RawFd) -> io::Result<Token> {
    usize::try_from(fd)
        .map(Token)
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "negative descriptor"))
}

struct StopOnExit<B: GpioBackend> {
    shared: Weak<Shared<B>>,
    mux: Arc<Multiplexer>,
}

impl<B: GpioBackend> Drop for StopOnExit<B> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            if state
                .mux
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &self.mux))
            {
                state.worker = WorkerState::Stopped;
            }
        }
        debug!("polling worker exited");
    }
}

pub(crate) fn spawn<B: GpioBackend + 'static>(
    shared: &Arc<Shared<B>>,
    mux: Arc<Multiplexer>,
) -> io::Result<()> {
    let shared = Arc::downgrade(shared);
    thread::Builder::new()
        .name("gpio-edge-poll".into())
        .spawn(move || run(shared, mux))
        .map(drop)
}

fn run<B: GpioBackend>(shared: Weak<Shared<B>>, mux: Arc<Multiplexer>) {
    let _exit = StopOnExit {
        shared: shared.clone(),
        mux: mux.clone(),
    };
    let mut poll = mux.poll.lock();
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    debug!("polling worker started");

    while !mux.is_shut_down() {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!("polling worker stopping, wait failed: {e}");
            return;
        }

        for event in events.iter() {
            if mux.is_shut_down() {
                return;
            }
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if let Err(e) = handle_notification(&shared, &mux, event.token()) {
                error!("polling worker stopping: {e}");
                return;
            }
        }
    }
}

/// The first notification after registration only reports the level the line
/// already had and is dropped.
fn handle_notification<B: GpioBackend>(
    shared: &Shared<B>,
    mux: &Arc<Multiplexer>,
    token: Token,
) -> Result<(), GpioError> {
    let Ok(fd) = RawFd::try_from(token.0) else {
        return Ok(());
    };

    let (line, calls) = {
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        // cleanup replaced or dropped the multiplexer while this batch was pending
        if !state.mux.as_ref().is_some_and(|current| Arc::ptr_eq(current, mux)) {
            return Ok(());
        }
        let Some(line) = state.pins.lookup_line(fd) else {
            debug!("notification for fd {fd} with no line, ignoring");
            return Ok(());
        };
        if state.pins.observer(line) != Some(Observer::Worker) {
            debug!("line {line}: notification after removal, ignoring");
            return Ok(());
        }

        state.pins.read_byte(line)?;
        if state.pins.first_event_pending(line) {
            state.pins.mark_seen(line);
            debug!("line {line}: discarding initial notification");
            return Ok(());
        }

        state.latched.set(line, true);
        let pins = &mut state.pins;
        let calls = state.callbacks.dispatch(line, || pins.read_level(line));
        (line, calls)
    };

    invoke(line, calls);
    Ok(())
}
