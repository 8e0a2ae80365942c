use std::sync::Arc;

use log::{debug, warn};

use crate::backend::{AttrHandle, GpioBackend, attr_text, parse_edge};
use crate::config::{Edge, Level};
use crate::error::GpioError;

pub trait EdgeHandler: Send + Sync {
    fn on_edge(&self, line: u32, level: Level);
}

impl<F> EdgeHandler for F
where
    F: Fn(u32, Level) + Send + Sync,
{
    fn on_edge(&self, line: u32, level: Level) {
        self(line, level)
    }
}

pub type EventHandler = Arc<dyn EdgeHandler>;

struct CallbackEntry {
    line: u32,
    edge: Edge,
    handler: EventHandler,
    edge_handle: Box<dyn AttrHandle>,
}

pub(crate) struct PendingCall {
    handler: EventHandler,
    level: Level,
}

#[derive(Default)]
pub(crate) struct CallbackRegistry {
    entries: Vec<CallbackEntry>,
}

impl CallbackRegistry {
    pub fn register(
        &mut self,
        line: u32,
        edge: Edge,
        handler: EventHandler,
        backend: &dyn GpioBackend,
    ) -> Result<(), GpioError> {
        let edge_handle = backend.open_edge(line)?;
        debug!("line {line}: callback #{} registered for {edge}", self.count(line) + 1);
        self.entries.push(CallbackEntry {
            line,
            edge,
            handler,
            edge_handle,
        });
        Ok(())
    }

    pub fn dispatch(
        &self,
        line: u32,
        mut read_level: impl FnMut() -> Result<Level, GpioError>,
    ) -> Vec<PendingCall> {
        let mut calls = Vec::new();
        for entry in self.entries.iter().filter(|entry| entry.line == line) {
            let level = match read_level() {
                Ok(level) => level,
                Err(e) => {
                    warn!("line {line}: skipping {} callback: {e}", entry.edge);
                    continue;
                }
            };
            if entry.edge.admits(level) {
                calls.push(PendingCall {
                    handler: entry.handler.clone(),
                    level,
                });
            }
        }
        calls
    }

    pub fn remove_all(&mut self, line: u32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.line != line);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("line {line}: removed {removed} callbacks");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn count(&self, line: u32) -> usize {
        self.entries.iter().filter(|entry| entry.line == line).count()
    }

    pub fn read_edge(&mut self, line: u32) -> Option<Result<Edge, GpioError>> {
        let entry = self.entries.iter_mut().find(|entry| entry.line == line)?;
        let mut buf = [0u8; 16];
        Some(match entry.edge_handle.read_attr(&mut buf) {
            Ok(len) => parse_edge(line, &attr_text(&buf[..len])),
            Err(e) => Err(GpioError::io(line, "edge", entry.edge_handle.path(), e)),
        })
    }
}

pub(crate) fn invoke(line: u32, calls: Vec<PendingCall>) {
    for call in calls {
        debug!("line {line}: running callback at level {:?}", call.level);
        call.handler.on_edge(line, call.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGpioBackend;
    use parking_lot::Mutex;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> EventHandler {
        let log = log.clone();
        Arc::new(move |_line: u32, _level: Level| log.lock().push(name))
    }

    fn backend_with(lines: &[u32]) -> MockGpioBackend {
        let backend = MockGpioBackend::default();
        for line in lines {
            backend.export(*line).unwrap();
        }
        backend
    }

    #[test]
    fn filters_select_by_current_level_in_order() {
        let backend = backend_with(&[1]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();
        registry.register(1, Edge::Both, recording(&log, "both"), &backend).unwrap();
        registry.register(1, Edge::Rising, recording(&log, "rising"), &backend).unwrap();
        registry.register(1, Edge::Falling, recording(&log, "falling"), &backend).unwrap();
        registry.register(1, Edge::None, recording(&log, "none"), &backend).unwrap();

        invoke(1, registry.dispatch(1, || Ok(Level::Low)));
        assert_eq!(*log.lock(), vec!["both", "falling"]);

        log.lock().clear();
        invoke(1, registry.dispatch(1, || Ok(Level::High)));
        assert_eq!(*log.lock(), vec!["both", "rising"]);
    }

    #[test]
    fn reads_once_per_entry_on_the_line() {
        let backend = backend_with(&[1, 2]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();
        registry.register(1, Edge::Both, recording(&log, "a"), &backend).unwrap();
        registry.register(2, Edge::Both, recording(&log, "other"), &backend).unwrap();
        registry.register(1, Edge::Both, recording(&log, "b"), &backend).unwrap();

        let mut reads = 0;
        let calls = registry.dispatch(1, || {
            reads += 1;
            Ok(Level::High)
        });
        assert_eq!(reads, 2);
        invoke(1, calls);
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn failed_read_skips_entry() {
        let backend = backend_with(&[1]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();
        registry.register(1, Edge::Both, recording(&log, "a"), &backend).unwrap();

        let calls = registry.dispatch(1, || Err(GpioError::protocol(1, "value", "x")));
        assert!(calls.is_empty());
    }

    #[test]
    fn remove_all_drops_every_entry_for_line() {
        let backend = backend_with(&[1, 2]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();
        registry.register(1, Edge::Both, recording(&log, "a"), &backend).unwrap();
        registry.register(1, Edge::Rising, recording(&log, "b"), &backend).unwrap();
        registry.register(2, Edge::Both, recording(&log, "c"), &backend).unwrap();

        assert_eq!(registry.remove_all(1), 2);
        assert_eq!(registry.count(1), 0);
        assert_eq!(registry.count(2), 1);
        assert_eq!(registry.remove_all(1), 0);
    }

    #[test]
    fn registration_needs_an_edge_attribute() {
        let backend = backend_with(&[]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();

        assert!(matches!(
            registry.register(3, Edge::Both, recording(&log, "a"), &backend),
            Err(GpioError::Io { line: 3, attr: "edge", .. })
        ));
        assert_eq!(registry.count(3), 0);
    }

    #[test]
    fn edge_is_read_through_callback_handle() {
        let backend = backend_with(&[1]);
        backend.set_edge(1, Edge::Rising).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();

        assert!(registry.read_edge(1).is_none());
        registry.register(1, Edge::Both, recording(&log, "a"), &backend).unwrap();
        assert_eq!(registry.read_edge(1).unwrap().unwrap(), Edge::Rising);
    }
}
