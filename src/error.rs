use std::fmt;

use thiserror::Error;

use crate::engine::EngineError;

/// Error taxonomy surfaced by the harness.
///
/// Variants carry owned strings so a single failure (for example a shared
/// prefix that could not be encoded) can be reported against every task it
/// affects.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HarnessError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cannot create device handle: {0}")]
    HandleCreation(String),

    #[error("cannot create runtime: {0}")]
    RuntimeCreation(String),

    #[error("cannot load model: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("unsupported inference mode '{0}' (expected 'normal' or 'share')")]
    UnsupportedMode(String),

    #[error("device {device} is still owned by a loaded model instance")]
    DeviceBusy { device: u32 },

    #[error("invalid device set: {0}")]
    InvalidDeviceSet(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(String),
}

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Skip the current task, keep going with the next one.
    Task,
    /// Abandon the current model instance and move to the next model.
    Model,
    /// Stop before any model runs.
    Run,
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::HandleCreation(_) => ErrorKind::HandleCreation,
            Self::RuntimeCreation(_) => ErrorKind::RuntimeCreation,
            Self::ModelLoad(_) => ErrorKind::ModelLoad,
            Self::Inference(_) => ErrorKind::Inference,
            Self::Encoding(_) => ErrorKind::Encoding,
            Self::UnsupportedMode(_) => ErrorKind::UnsupportedMode,
            Self::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            Self::InvalidDeviceSet(_) => ErrorKind::InvalidDeviceSet,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::InvalidInput(_)
            | Self::Inference(_)
            | Self::Encoding(_)
            | Self::UnsupportedMode(_) => Severity::Task,
            Self::HandleCreation(_)
            | Self::RuntimeCreation(_)
            | Self::ModelLoad(_)
            | Self::DeviceBusy { .. }
            | Self::InvalidDeviceSet(_) => Severity::Model,
            Self::Config(_) | Self::Io(_) => Severity::Run,
        }
    }

    pub fn is_model_fatal(&self) -> bool {
        self.severity() != Severity::Task
    }
}

impl From<EngineError> for HarnessError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidInput(msg) => Self::InvalidInput(msg),
            EngineError::HandleCreation(msg) => Self::HandleCreation(msg),
            EngineError::RuntimeCreation(msg) => Self::RuntimeCreation(msg),
            EngineError::ModelLoad(msg) => Self::ModelLoad(msg),
            EngineError::Inference(msg) => Self::Inference(msg),
            EngineError::Unknown { code, detail } => {
                Self::Inference(format!("engine returned code {}: {}", code, detail))
            }
        }
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Stable, serializable label for a [`HarnessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    HandleCreation,
    RuntimeCreation,
    ModelLoad,
    Inference,
    Encoding,
    UnsupportedMode,
    DeviceBusy,
    InvalidDeviceSet,
    Config,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InvalidInput => "invalid_input",
            Self::HandleCreation => "handle_creation",
            Self::RuntimeCreation => "runtime_creation",
            Self::ModelLoad => "model_load",
            Self::Inference => "inference",
            Self::Encoding => "encoding",
            Self::UnsupportedMode => "unsupported_mode",
            Self::DeviceBusy => "device_busy",
            Self::InvalidDeviceSet => "invalid_device_set",
            Self::Config => "config",
            Self::Io => "io",
        };
        f.write_str(label)
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_codes_map_to_taxonomy() {
        let cases = [
            (-1, ErrorKind::InvalidInput, Severity::Task),
            (-2, ErrorKind::HandleCreation, Severity::Model),
            (-3, ErrorKind::RuntimeCreation, Severity::Model),
            (-4, ErrorKind::ModelLoad, Severity::Model),
            (-5, ErrorKind::Inference, Severity::Task),
        ];
        for (code, kind, severity) in cases {
            let err: HarnessError = EngineError::from_code(code, "detail").into();
            assert_eq!(err.kind(), kind, "code {}", code);
            assert_eq!(err.severity(), severity, "code {}", code);
        }
    }

    #[test]
    fn unknown_engine_code_is_task_scoped() {
        let err: HarnessError = EngineError::from_code(-42, "weird").into();
        assert_eq!(err.kind(), ErrorKind::Inference);
        assert!(err.to_string().contains("-42"));
    }

    #[test]
    fn device_busy_is_model_fatal() {
        let err = HarnessError::DeviceBusy { device: 3 };
        assert!(err.is_model_fatal());
        assert_eq!(err.kind().to_string(), "device_busy");
    }
}
