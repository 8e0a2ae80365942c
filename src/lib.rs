pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod gpio;
pub mod routes;

pub use config::{AppConfig, Direction, Edge, HttpConfig, Level, LineConfig};
pub use error::{AppError, GpioError};
pub use event::{AddOutcome, EdgeHandler, EdgeMonitor, EventHandler, LineStatus, WaitOutcome, WorkerState};
pub use gpio::{EdgeEvent, GpioManager, LineDescriptor};
pub use routes::{AppState, api_scope};

pub use backend::{AttrHandle, GpioBackend, MockGpioBackend};
#[cfg(feature = "hardware-gpio")]
pub use backend::SysfsBackend;
