use std::os::fd::RawFd;

use log::debug;
use rustc_hash::FxHashMap;

use crate::backend::{AttrHandle, GpioBackend};
use crate::config::Level;
use crate::error::GpioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Observer {
    Worker,
    Wait,
}

pub(crate) struct MonitoredLine {
    handle: Box<dyn AttrHandle>,
    first_event_pending: bool,
    observer: Option<Observer>,
}

#[derive(Default)]
pub(crate) struct PinRegistry {
    lines: FxHashMap<u32, MonitoredLine>,
}

impl PinRegistry {
    pub fn ensure_value_handle(
        &mut self,
        line: u32,
        backend: &dyn GpioBackend,
    ) -> Result<RawFd, GpioError> {
        if let Some(entry) = self.lines.get(&line) {
            return Ok(entry.handle.raw_fd());
        }

        let handle = backend.open_value(line)?;
        let fd = handle.raw_fd();
        debug!("line {line}: value handle opened as fd {fd}");
        self.lines.insert(
            line,
            MonitoredLine {
                handle,
                first_event_pending: true,
                observer: None,
            },
        );
        Ok(fd)
    }

    pub fn lookup_line(&self, fd: RawFd) -> Option<u32> {
        self.lines
            .iter()
            .find(|(_, entry)| entry.handle.raw_fd() == fd)
            .map(|(line, _)| *line)
    }

    pub fn raw_fd(&self, line: u32) -> Option<RawFd> {
        self.lines.get(&line).map(|entry| entry.handle.raw_fd())
    }

    pub fn mark_seen(&mut self, line: u32) {
        if let Some(entry) = self.lines.get_mut(&line) {
            entry.first_event_pending = false;
        }
    }

    pub fn arm(&mut self, line: u32) {
        if let Some(entry) = self.lines.get_mut(&line) {
            entry.first_event_pending = true;
        }
    }

    pub fn first_event_pending(&self, line: u32) -> bool {
        self.lines
            .get(&line)
            .is_some_and(|entry| entry.first_event_pending)
    }

    pub fn observer(&self, line: u32) -> Option<Observer> {
        self.lines.get(&line).and_then(|entry| entry.observer)
    }

    pub fn is_observed(&self, line: u32) -> bool {
        self.observer(line).is_some()
    }

    pub fn claim(&mut self, line: u32, observer: Observer) {
        if let Some(entry) = self.lines.get_mut(&line) {
            entry.observer = Some(observer);
        }
    }

    pub fn unclaim(&mut self, line: u32) {
        if let Some(entry) = self.lines.get_mut(&line) {
            entry.observer = None;
        }
    }

    pub fn contains(&self, line: u32) -> bool {
        self.lines.contains_key(&line)
    }

    pub fn release(&mut self, line: u32) {
        if self.lines.remove(&line).is_some() {
            debug!("line {line}: value handle closed");
        }
    }

    pub fn release_all(&mut self) {
        self.lines.clear();
    }

    pub fn read_byte(&mut self, line: u32) -> Result<u8, GpioError> {
        let entry = self.entry_mut(line)?;
        let mut buf = [0u8; 1];
        match entry.handle.read_attr(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(GpioError::protocol(line, "value", "")),
            Err(e) => Err(GpioError::io(line, "value", entry.handle.path(), e)),
        }
    }

    pub fn read_level(&mut self, line: u32) -> Result<Level, GpioError> {
        let byte = self.read_byte(line)?;
        Level::from_byte(byte)
            .ok_or_else(|| GpioError::protocol(line, "value", char::from(byte).to_string()))
    }

    pub fn write_level(&mut self, line: u32, level: Level) -> Result<(), GpioError> {
        let entry = self.entry_mut(line)?;
        entry
            .handle
            .write_attr(&[level.as_byte()])
            .map_err(|e| GpioError::io(line, "value", entry.handle.path(), e))
    }

    fn entry_mut(&mut self, line: u32) -> Result<&mut MonitoredLine, GpioError> {
        self.lines.get_mut(&line).ok_or_else(|| {
            GpioError::io(
                line,
                "value",
                format!("gpio{line}/value"),
                std::io::Error::new(std::io::ErrorKind::NotFound, "value handle not open"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGpioBackend;

    fn exported(lines: &[u32]) -> MockGpioBackend {
        let backend = MockGpioBackend::default();
        for line in lines {
            backend.export(*line).unwrap();
        }
        backend
    }

    #[test]
    fn handle_is_reused_and_resolvable() {
        let backend = exported(&[4, 5]);
        let mut pins = PinRegistry::default();

        let fd = pins.ensure_value_handle(4, &backend).unwrap();
        assert_eq!(pins.ensure_value_handle(4, &backend).unwrap(), fd);
        let other = pins.ensure_value_handle(5, &backend).unwrap();

        assert_eq!(pins.lookup_line(fd), Some(4));
        assert_eq!(pins.lookup_line(other), Some(5));
        assert_eq!(pins.lookup_line(-1), None);
    }

    #[test]
    fn new_handles_start_with_first_event_pending() {
        let backend = exported(&[4]);
        let mut pins = PinRegistry::default();

        pins.ensure_value_handle(4, &backend).unwrap();
        assert!(pins.first_event_pending(4));
        assert!(!pins.is_observed(4));

        pins.mark_seen(4);
        assert!(!pins.first_event_pending(4));
        pins.arm(4);
        assert!(pins.first_event_pending(4));
    }

    #[test]
    fn missing_line_fails_with_io_error() {
        let backend = exported(&[]);
        let mut pins = PinRegistry::default();

        assert!(matches!(
            pins.ensure_value_handle(8, &backend),
            Err(GpioError::Io { line: 8, attr: "value", .. })
        ));
        assert!(!pins.contains(8));
    }

    #[test]
    fn release_is_idempotent() {
        let backend = exported(&[4]);
        let mut pins = PinRegistry::default();

        pins.ensure_value_handle(4, &backend).unwrap();
        pins.claim(4, Observer::Worker);
        pins.release(4);
        pins.release(4);

        assert!(!pins.contains(4));
        assert!(!pins.is_observed(4));
    }

    #[test]
    fn claim_records_its_owner() {
        let backend = exported(&[4]);
        let mut pins = PinRegistry::default();

        pins.claim(4, Observer::Wait);
        assert_eq!(pins.observer(4), None);

        pins.ensure_value_handle(4, &backend).unwrap();
        pins.claim(4, Observer::Wait);
        assert_eq!(pins.observer(4), Some(Observer::Wait));
        assert!(pins.is_observed(4));

        pins.unclaim(4);
        assert_eq!(pins.observer(4), None);
    }

    #[test]
    fn levels_go_through_the_open_handle() {
        let backend = exported(&[6]);
        let mut pins = PinRegistry::default();
        pins.ensure_value_handle(6, &backend).unwrap();

        assert_eq!(pins.read_level(6).unwrap(), Level::Low);
        pins.write_level(6, Level::High).unwrap();
        assert_eq!(backend.level(6), Some(Level::High));
        assert_eq!(pins.read_level(6).unwrap(), Level::High);
    }
}
