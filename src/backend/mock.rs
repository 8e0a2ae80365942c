use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::{AttrHandle, GpioBackend};
use crate::config::{Direction, Edge, Level};
use crate::error::GpioError;

/// In-memory lines that notify like sysfs attributes do.
///
/// Every opened `value` handle is backed by a socket pair. The read side keeps
/// one unread byte from the moment it is opened, so an edge-triggered
/// registration reports readiness once straight away, and every transition
/// accepted by the line's edge mode queues one more byte and thus one more
/// notification.
#[derive(Default)]
pub struct MockGpioBackend {
    lines: RwLock<FxHashMap<u32, Arc<Mutex<MockLineState>>>>, // keyed by line number
}

struct MockLineState {
    direction: Direction,
    edge: Edge,
    level: Level,
    failing_reads: bool,
    notifiers: Vec<UnixStream>,
}

impl Default for MockLineState {
    fn default() -> Self {
        Self {
            direction: Direction::In,
            edge: Edge::None,
            level: Level::Low,
            failing_reads: false,
            notifiers: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MockAttrKind {
    Value,
    Edge,
}

struct MockAttr {
    kind: MockAttrKind,
    state: Arc<Mutex<MockLineState>>,
    readiness: UnixStream,
    path: PathBuf,
}

fn mock_path(line: u32, attr: &str) -> PathBuf {
    PathBuf::from(format!("mock/gpio{line}/{attr}"))
}

impl AttrHandle for MockAttr {
    fn read_attr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let text = {
            let state = self.state.lock();
            if state.failing_reads {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line read failure"));
            }
            match self.kind {
                MockAttrKind::Value => format!("{}\n", char::from(state.level.as_byte())),
                MockAttrKind::Edge => format!("{}\n", state.edge),
            }
        };
        let len = text.len().min(buf.len());
        buf[..len].copy_from_slice(&text.as_bytes()[..len]);
        Ok(len)
    }

    fn write_attr(&mut self, data: &[u8]) -> io::Result<()> {
        if self.kind != MockAttrKind::Value {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "attribute opened read-only",
            ));
        }
        let level = data
            .first()
            .copied()
            .and_then(Level::from_byte)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "value must be 0 or 1"))?;
        self.state.lock().level = level;
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.readiness.as_raw_fd()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl MockGpioBackend {
    fn line(&self, line: u32, attr: &'static str) -> Result<Arc<Mutex<MockLineState>>, GpioError> {
        self.lines.read().get(&line).cloned().ok_or_else(|| {
            GpioError::io(
                line,
                attr,
                mock_path(line, attr),
                io::Error::new(io::ErrorKind::NotFound, "line not exported"),
            )
        })
    }

    fn open(&self, line: u32, kind: MockAttrKind) -> Result<Box<dyn AttrHandle>, GpioError> {
        let attr = match kind {
            MockAttrKind::Value => "value",
            MockAttrKind::Edge => "edge",
        };
        let state = self.line(line, attr)?;
        let path = mock_path(line, attr);
        let io_err = |e| GpioError::io(line, attr, mock_path(line, attr), e);

        let (mut notifier, readiness) = UnixStream::pair().map_err(io_err)?;
        if kind == MockAttrKind::Value {
            notifier.set_nonblocking(true).map_err(io_err)?;
            notifier.write_all(&[0]).map_err(io_err)?;
            state.lock().notifiers.push(notifier);
        }

        Ok(Box::new(MockAttr {
            kind,
            state,
            readiness,
            path,
        }))
    }

    /// Moves a line to `level` the way external hardware would, notifying every
    /// open value handle when the transition matches the line's edge mode.
    pub fn drive(&self, line: u32, level: Level) -> Result<(), GpioError> {
        let state = self.line(line, "value")?;
        let mut state = state.lock();

        let previous = state.level;
        state.level = level;
        if previous == level || !state.edge.admits(level) {
            return Ok(());
        }

        state.notifiers.retain_mut(|notifier| match notifier.write(&[1]) {
            Ok(_) => true,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        });
        Ok(())
    }

    /// Makes every read through the line's open handles fail until reset.
    pub fn fail_reads(&self, line: u32, failing: bool) -> Result<(), GpioError> {
        self.line(line, "value")?.lock().failing_reads = failing;
        Ok(())
    }

    pub fn level(&self, line: u32) -> Option<Level> {
        self.lines.read().get(&line).map(|state| state.lock().level)
    }

    pub fn is_exported(&self, line: u32) -> bool {
        self.lines.read().contains_key(&line)
    }
}

impl GpioBackend for MockGpioBackend {
    fn export(&self, line: u32) -> Result<(), GpioError> {
        let mut lines = self.lines.write();
        if lines.contains_key(&line) {
            return Err(GpioError::io(
                line,
                "export",
                "mock/export",
                io::Error::new(io::ErrorKind::ResourceBusy, "line already exported"),
            ));
        }
        lines.insert(line, Arc::new(Mutex::new(MockLineState::default())));
        Ok(())
    }

    fn unexport(&self, line: u32) -> Result<(), GpioError> {
        match self.lines.write().remove(&line) {
            Some(_) => Ok(()),
            None => Err(GpioError::io(
                line,
                "unexport",
                "mock/unexport",
                io::Error::new(io::ErrorKind::InvalidInput, "line not exported"),
            )),
        }
    }

    fn set_direction(&self, line: u32, direction: Direction) -> Result<(), GpioError> {
        self.line(line, "direction")?.lock().direction = direction;
        Ok(())
    }

    fn direction(&self, line: u32) -> Result<Direction, GpioError> {
        Ok(self.line(line, "direction")?.lock().direction)
    }

    fn set_edge(&self, line: u32, edge: Edge) -> Result<(), GpioError> {
        self.line(line, "edge")?.lock().edge = edge;
        Ok(())
    }

    fn edge(&self, line: u32) -> Result<Edge, GpioError> {
        Ok(self.line(line, "edge")?.lock().edge)
    }

    fn open_value(&self, line: u32) -> Result<Box<dyn AttrHandle>, GpioError> {
        self.open(line, MockAttrKind::Value)
    }

    fn open_edge(&self, line: u32) -> Result<Box<dyn AttrHandle>, GpioError> {
        self.open(line, MockAttrKind::Edge)
    }
}
