use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use actix_web::web;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::backend::GpioBackend;
use crate::config::{AppConfig, Direction, Edge, Level, LineConfig};
use crate::error::AppError;
use crate::event::{AddOutcome, EdgeHandler, EdgeMonitor, LineStatus, WaitOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub line: u32,
    pub edge: Edge,
    pub level: Level,
    pub timestamp_ms: u64,
}

/// Forwards edges seen by the polling worker to every event subscriber.
pub struct EventBroadcaster {
    event_tx: broadcast::Sender<EdgeEvent>,
}

impl EdgeHandler for EventBroadcaster {
    fn on_edge(&self, line: u32, level: Level) {
        // no subscribers is fine
        let _ = self.event_tx.send(EdgeEvent {
            line,
            edge: level.edge(),
            level,
            timestamp_ms: epoch_millis(),
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LineDescriptor {
    pub info: LineConfig,
    pub direction: Option<Direction>,
    pub edge: Option<Edge>,
    pub status: Option<LineStatus>,
}

pub struct GpioManager<B: GpioBackend> {
    config: Arc<AppConfig>,
    monitor: EdgeMonitor<B>,
    broadcaster: Arc<EventBroadcaster>,
}

impl<B: GpioBackend + 'static> GpioManager<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity);

        Self {
            config,
            monitor: EdgeMonitor::new(backend),
            broadcaster: Arc::new(EventBroadcaster { event_tx }),
        }
    }

    pub fn monitor(&self) -> &EdgeMonitor<B> {
        &self.monitor
    }

    fn line_config(&self, line: u32) -> Result<&LineConfig, AppError> {
        self.config
            .lines
            .get(&line)
            .ok_or(AppError::NotFoundLine(line))
    }

    /// Exports every configured line and enables the edge detection the
    /// configuration asks for. Failures are logged and skipped.
    pub fn init(&self) {
        for (line, cfg) in &self.config.lines {
            if let Err(e) = self.monitor.export(*line) {
                warn!("could not export line {line} ({}): {e}", cfg.name);
            }
            if cfg.edge == Edge::None {
                continue;
            }
            match self.enable_edge_detect(*line, cfg.edge) {
                Ok(_) => info!("watching line {line} ({}) for {} edges", cfg.name, cfg.edge),
                Err(e) => warn!("could not watch line {line} ({}): {e}", cfg.name),
            }
        }
    }

    fn describe(&self, line: u32, info: &LineConfig) -> LineDescriptor {
        LineDescriptor {
            info: info.clone(),
            direction: self.monitor.direction(line).ok(),
            edge: self.monitor.edge(line).ok(),
            status: self.monitor.line_status(line),
        }
    }

    pub async fn list_lines(&self) -> HashMap<u32, LineDescriptor> {
        self.config
            .lines
            .iter()
            .map(|(line, cfg)| (*line, self.describe(*line, cfg)))
            .collect()
    }

    pub async fn get_line_descriptor(&self, line: u32) -> Result<LineDescriptor, AppError> {
        let cfg = self.line_config(line)?;
        Ok(self.describe(line, cfg))
    }

    pub async fn export(&self, line: u32) -> Result<(), AppError> {
        self.line_config(line)?;
        Ok(self.monitor.export(line)?)
    }

    pub async fn unexport(&self, line: u32) -> Result<(), AppError> {
        self.line_config(line)?;
        Ok(self.monitor.unexport(line)?)
    }

    pub async fn get_direction(&self, line: u32) -> Result<Direction, AppError> {
        self.line_config(line)?;
        Ok(self.monitor.direction(line)?)
    }

    pub async fn set_direction(&self, line: u32, direction: Direction) -> Result<(), AppError> {
        self.line_config(line)?;
        Ok(self.monitor.set_direction(line, direction)?)
    }

    pub async fn read_value(&self, line: u32) -> Result<u8, AppError> {
        self.line_config(line)?;
        Ok(self.monitor.read_value(line)?.as_u8())
    }

    pub async fn write_value(&self, line: u32, value: u8) -> Result<(), AppError> {
        let level = match value {
            0 => Level::Low,
            1 => Level::High,
            _ => return Err(AppError::InvalidValue("Value must be 0 or 1".into())),
        };

        self.line_config(line)?;
        self.monitor.write_value(line, level)?;

        Ok(())
    }

    /// Watches the line on the polling worker and forwards its edges to
    /// subscribers. A line that is already watched is left untouched.
    pub fn enable_edge_detect(&self, line: u32, edge: Edge) -> Result<AddOutcome, AppError> {
        self.line_config(line)?;
        if edge == Edge::None {
            return Err(AppError::InvalidValue(
                "Edge detection needs rising, falling or both".into(),
            ));
        }

        let outcome = self.monitor.add_edge_detect(line, edge)?;
        if outcome == AddOutcome::Added {
            self.monitor
                .register_handler(line, edge, self.broadcaster.clone())?;
        }
        Ok(outcome)
    }

    pub async fn disable_edge_detect(&self, line: u32) -> Result<(), AppError> {
        self.line_config(line)?;
        Ok(self.monitor.remove_edge_detect(line)?)
    }

    pub async fn event_detected(&self, line: u32) -> Result<bool, AppError> {
        self.line_config(line)?;
        Ok(self.monitor.event_detected(line))
    }

    /// Waits for one edge on the blocking pool. Without an explicit timeout the
    /// HTTP timeout from the configuration applies.
    pub async fn wait_for_edge(
        &self,
        line: u32,
        edge: Edge,
        timeout_ms: Option<u64>,
    ) -> Result<WaitOutcome, AppError> {
        self.line_config(line)?;
        if edge == Edge::None {
            return Err(AppError::InvalidValue(
                "Waiting needs rising, falling or both".into(),
            ));
        }

        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.config.http.timeout));
        let monitor = self.monitor.clone();

        let outcome = web::block(move || monitor.blocking_wait_for_edge(line, edge, Some(timeout)))
            .await
            .map_err(|e| AppError::Runtime(format!("blocking wait: {e}")))??;
        Ok(outcome)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.broadcaster.event_tx.subscribe()
    }

    pub fn cleanup(&self) -> Result<(), AppError> {
        Ok(self.monitor.cleanup()?)
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
