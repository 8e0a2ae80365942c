use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::debug;

use super::{AttrHandle, GpioBackend, attr_text, parse_direction, parse_edge};
use crate::config::{Direction, Edge};
use crate::error::GpioError;

/// Line access through the legacy `/sys/class/gpio` interface.
pub struct SysfsBackend {
    root: PathBuf,
}

struct SysfsAttr {
    file: File,
    path: PathBuf,
}

impl AttrHandle for SysfsAttr {
    fn read_attr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read(buf)
    }

    fn write_attr(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(data)
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl SysfsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn attr_path(&self, line: u32, attr: &str) -> PathBuf {
        self.root.join(format!("gpio{line}")).join(attr)
    }

    fn write_file(line: u32, attr: &'static str, path: &Path, data: &str) -> Result<(), GpioError> {
        debug!("writing {data:?} to {}", path.display());
        // sysfs attributes are never created from userspace
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| GpioError::io(line, attr, path, e))?;
        file.write_all(data.as_bytes())
            .map_err(|e| GpioError::io(line, attr, path, e))
    }

    fn read_file(line: u32, attr: &'static str, path: &Path) -> Result<String, GpioError> {
        let raw = fs::read(path).map_err(|e| GpioError::io(line, attr, path, e))?;
        Ok(attr_text(&raw))
    }

    fn open_attr(
        &self,
        line: u32,
        attr: &'static str,
        writable: bool,
    ) -> Result<Box<dyn AttrHandle>, GpioError> {
        let path = self.attr_path(line, attr);
        debug!("opening {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| GpioError::io(line, attr, &path, e))?;
        Ok(Box::new(SysfsAttr { file, path }))
    }
}

impl GpioBackend for SysfsBackend {
    fn export(&self, line: u32) -> Result<(), GpioError> {
        Self::write_file(line, "export", &self.root.join("export"), &line.to_string())
    }

    fn unexport(&self, line: u32) -> Result<(), GpioError> {
        Self::write_file(line, "unexport", &self.root.join("unexport"), &line.to_string())
    }

    fn set_direction(&self, line: u32, direction: Direction) -> Result<(), GpioError> {
        let path = self.attr_path(line, "direction");
        Self::write_file(line, "direction", &path, direction.as_str())
    }

    fn direction(&self, line: u32) -> Result<Direction, GpioError> {
        let text = Self::read_file(line, "direction", &self.attr_path(line, "direction"))?;
        parse_direction(line, &text)
    }

    fn set_edge(&self, line: u32, edge: Edge) -> Result<(), GpioError> {
        let path = self.attr_path(line, "edge");
        Self::write_file(line, "edge", &path, edge.as_str())
    }

    fn edge(&self, line: u32) -> Result<Edge, GpioError> {
        let text = Self::read_file(line, "edge", &self.attr_path(line, "edge"))?;
        parse_edge(line, &text)
    }

    fn open_value(&self, line: u32) -> Result<Box<dyn AttrHandle>, GpioError> {
        self.open_attr(line, "value", true)
    }

    fn open_edge(&self, line: u32) -> Result<Box<dyn AttrHandle>, GpioError> {
        self.open_attr(line, "edge", false)
    }
}
