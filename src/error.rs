use std::{io, path::PathBuf};

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("line {line}: cannot access {attr} at {}: {source}", path.display())]
    Io {
        line: u32,
        attr: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: already observed for edge events")]
    AlreadyObserving { line: u32 },
    #[error("line {line}: multiplexer {op} failed: {source}")]
    Mux {
        line: u32,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: unexpected {value:?} read from {attr}")]
    Protocol {
        line: u32,
        attr: &'static str,
        value: String,
    },
}

impl GpioError {
    pub(crate) fn io(line: u32, attr: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        GpioError::Io {
            line,
            attr,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn mux(line: u32, op: &'static str, source: io::Error) -> Self {
        GpioError::Mux { line, op, source }
    }

    pub(crate) fn protocol(line: u32, attr: &'static str, value: impl Into<String>) -> Self {
        GpioError::Protocol {
            line,
            attr,
            value: value.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Line not found: {0}")]
    NotFoundLine(u32),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFoundLine(_) => StatusCode::NOT_FOUND,
            AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::Gpio(GpioError::AlreadyObserving { .. }) => StatusCode::CONFLICT,
            AppError::Config(_) | AppError::Runtime(_) | AppError::Gpio(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
