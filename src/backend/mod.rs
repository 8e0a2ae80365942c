#[cfg(feature = "hardware-gpio")]
pub mod sysfs;
pub mod mock;

use std::io;
use std::os::fd::RawFd;
use std::path::Path;

use crate::config::{Direction, Edge};
use crate::error::GpioError;

#[cfg(feature = "hardware-gpio")]
pub use sysfs::SysfsBackend;
pub use mock::MockGpioBackend;

/// An open attribute of one line, kept around for repeated access.
pub trait AttrHandle: Send {
    /// Rewinds to the start of the attribute and reads its current contents.
    fn read_attr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_attr(&mut self, data: &[u8]) -> io::Result<()>;
    /// Descriptor handed to the multiplexer.
    fn raw_fd(&self) -> RawFd;
    fn path(&self) -> &Path;
}

/// Per-line attribute access, the way the kernel exposes it under sysfs.
pub trait GpioBackend: Send + Sync {
    fn export(&self, line: u32) -> Result<(), GpioError>;
    fn unexport(&self, line: u32) -> Result<(), GpioError>;
    fn set_direction(&self, line: u32, direction: Direction) -> Result<(), GpioError>;
    fn direction(&self, line: u32) -> Result<Direction, GpioError>;
    fn set_edge(&self, line: u32, edge: Edge) -> Result<(), GpioError>;
    fn edge(&self, line: u32) -> Result<Edge, GpioError>;
    fn open_value(&self, line: u32) -> Result<Box<dyn AttrHandle>, GpioError>;
    fn open_edge(&self, line: u32) -> Result<Box<dyn AttrHandle>, GpioError>;
}

/// Trims the trailing newlines sysfs appends to attribute text.
pub(crate) fn attr_text(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf).trim_end_matches('\n').to_string()
}

pub(crate) fn parse_edge(line: u32, text: &str) -> Result<Edge, GpioError> {
    text.parse()
        .map_err(|value: String| GpioError::protocol(line, "edge", value))
}

pub(crate) fn parse_direction(line: u32, text: &str) -> Result<Direction, GpioError> {
    text.parse()
        .map_err(|value: String| GpioError::protocol(line, "direction", value))
}
