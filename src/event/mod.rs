//! Known limitations, kept on purpose:
//! - removing the last observed line leaves the worker parked in its wait;
//! - a failure part way through [`EdgeMonitor::add_edge_detect`] leaves the
//!   steps already taken in place (direction, edge mode, open handle, the
//!   observation claim). [`EdgeMonitor::remove_edge_detect`] clears them.

mod callbacks;
mod latch;
mod pins;
mod wait;
mod worker;

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::backend::GpioBackend;
use crate::config::{Direction, Edge, Level};
use crate::error::GpioError;

pub use callbacks::{EdgeHandler, EventHandler};
pub use wait::WaitOutcome;
pub use worker::WorkerState;

use callbacks::CallbackRegistry;
use latch::LatchedFlags;
use pins::{Observer, PinRegistry};
use worker::Multiplexer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddOutcome {
    Added,
    AlreadyAdded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineStatus {
    pub observed: bool,
    pub armed: bool,
    pub callbacks: usize,
}

struct EdgeState {
    pins: PinRegistry,
    callbacks: CallbackRegistry,
    latched: LatchedFlags,
    exported: Vec<u32>,
    worker: WorkerState,
    mux: Option<Arc<Multiplexer>>,
}

pub(crate) struct Shared<B: GpioBackend> {
    backend: Arc<B>,
    state: Mutex<EdgeState>,
}

impl<B: GpioBackend> Drop for Shared<B> {
    fn drop(&mut self) {
        if let Some(mux) = self.state.get_mut().mux.take() {
            mux.shutdown();
        }
    }
}

pub struct EdgeMonitor<B: GpioBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: GpioBackend> Clone for EdgeMonitor<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: GpioBackend + 'static> EdgeMonitor<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                state: Mutex::new(EdgeState {
                    pins: PinRegistry::default(),
                    callbacks: CallbackRegistry::default(),
                    latched: LatchedFlags::default(),
                    exported: Vec::new(),
                    worker: WorkerState::Stopped,
                    mux: None,
                }),
            }),
        }
    }

    pub fn export(&self, line: u32) -> Result<(), GpioError> {
        debug!("line {line}: export");
        self.shared.backend.export(line)?;
        let mut state = self.shared.state.lock();
        if !state.exported.contains(&line) {
            state.exported.push(line);
        }
        Ok(())
    }

    pub fn unexport(&self, line: u32) -> Result<(), GpioError> {
        debug!("line {line}: unexport");
        let mut state = self.shared.state.lock();
        if state.pins.observer(line) == Some(Observer::Wait) {
            return Err(GpioError::AlreadyObserving { line });
        }
        state.pins.release(line);
        state.callbacks.remove_all(line);
        state.latched.set(line, false);
        self.shared.backend.unexport(line)?;
        state.exported.retain(|exported| *exported != line);
        Ok(())
    }

    pub fn set_direction(&self, line: u32, direction: Direction) -> Result<(), GpioError> {
        self.shared.backend.set_direction(line, direction)
    }

    pub fn direction(&self, line: u32) -> Result<Direction, GpioError> {
        self.shared.backend.direction(line)
    }

    pub fn edge(&self, line: u32) -> Result<Edge, GpioError> {
        let mut state = self.shared.state.lock();
        match state.callbacks.read_edge(line) {
            Some(edge) => edge,
            None => self.shared.backend.edge(line),
        }
    }

    pub fn read_value(&self, line: u32) -> Result<Level, GpioError> {
        let mut state = self.shared.state.lock();
        state
            .pins
            .ensure_value_handle(line, self.shared.backend.as_ref())?;
        state.pins.read_level(line)
    }

    pub fn write_value(&self, line: u32, level: Level) -> Result<(), GpioError> {
        let mut state = self.shared.state.lock();
        state
            .pins
            .ensure_value_handle(line, self.shared.backend.as_ref())?;
        state.pins.write_level(line, level)
    }

    // at most 32 samples, LSB first
    pub fn sample_bits(&self, line: u32, bits: u32) -> Result<u32, GpioError> {
        let mut state = self.shared.state.lock();
        state
            .pins
            .ensure_value_handle(line, self.shared.backend.as_ref())?;

        let mut value = 0;
        for bit in 0..bits.min(u32::BITS) {
            if state.pins.read_level(line)? == Level::High {
                value |= 1 << bit;
            }
        }
        Ok(value)
    }

    pub fn line_status(&self, line: u32) -> Option<LineStatus> {
        let state = self.shared.state.lock();
        state.pins.contains(line).then(|| LineStatus {
            observed: state.pins.is_observed(line),
            armed: !state.pins.first_event_pending(line),
            callbacks: state.callbacks.count(line),
        })
    }

    pub fn worker_state(&self) -> WorkerState {
        self.shared.state.lock().worker
    }

    /// Assumes the line is exported.
    pub fn add_edge_detect(&self, line: u32, edge: Edge) -> Result<AddOutcome, GpioError> {
        debug!("line {line}: add edge detect ({edge})");
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if state.pins.is_observed(line) {
            debug!("line {line}: already observed");
            return Ok(AddOutcome::AlreadyAdded);
        }

        let backend = self.shared.backend.as_ref();
        backend.set_direction(line, Direction::In)?;
        backend.set_edge(line, edge)?;
        let fd = state.pins.ensure_value_handle(line, backend)?;
        state.pins.claim(line, Observer::Worker);
        state.pins.arm(line);

        let mux = match &state.mux {
            Some(mux) => mux.clone(),
            None => {
                let mux = Arc::new(Multiplexer::new().map_err(|e| GpioError::mux(line, "create", e))?);
                state.mux = Some(mux.clone());
                mux
            }
        };
        mux.register(fd)
            .map_err(|e| GpioError::mux(line, "register", e))?;

        if state.worker == WorkerState::Stopped {
            worker::spawn(&self.shared, mux).map_err(|e| GpioError::mux(line, "spawn", e))?;
            state.worker = WorkerState::Running;
        }
        Ok(AddOutcome::Added)
    }

    /// Fails with [`GpioError::AlreadyObserving`] while a blocking wait holds the line.
    pub fn remove_edge_detect(&self, line: u32) -> Result<(), GpioError> {
        debug!("line {line}: remove edge detect");
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.pins.observer(line) == Some(Observer::Wait) {
            return Err(GpioError::AlreadyObserving { line });
        }

        state.callbacks.remove_all(line);
        if let Some(mux) = &state.mux
            && let Some(fd) = state.pins.raw_fd(line)
            && let Err(e) = mux.deregister(fd)
        {
            debug!("line {line}: not registered with the worker: {e}");
        }
        let reset = self.shared.backend.set_edge(line, Edge::None);
        state.pins.unclaim(line);
        state.latched.set(line, false);
        reset
    }

    pub fn register_callback(
        &self,
        line: u32,
        edge: Edge,
        handler: impl EdgeHandler + 'static,
    ) -> Result<(), GpioError> {
        self.register_handler(line, edge, Arc::new(handler))
    }

    pub fn register_handler(
        &self,
        line: u32,
        edge: Edge,
        handler: EventHandler,
    ) -> Result<(), GpioError> {
        let mut state = self.shared.state.lock();
        state
            .callbacks
            .register(line, edge, handler, self.shared.backend.as_ref())
    }

    pub fn event_detected(&self, line: u32) -> bool {
        self.shared.state.lock().latched.get_and_clear(line)
    }

    /// Does not join the worker thread. Returns the first unexport failure.
    pub fn cleanup(&self) -> Result<(), GpioError> {
        debug!("cleanup");
        let exported = {
            let mut state = self.shared.state.lock();
            state.worker = WorkerState::Stopped;
            if let Some(mux) = state.mux.take() {
                mux.shutdown();
            }
            state.callbacks.clear();
            state.latched.clear();
            state.pins.release_all();
            std::mem::take(&mut state.exported)
        };

        let mut result = Ok(());
        for line in exported {
            if let Err(e) = self.shared.backend.unexport(line) {
                warn!("cleanup: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
