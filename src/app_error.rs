use crate::error::HubError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    RunFailed = 1,
    Usage = 2,
    Internal = 3,
}

/// Error surfaced by the command line, classified by process exit code.
#[derive(Debug)]
pub struct AppError {
    code: ExitCode,
    message: String,
}

impl AppError {
    pub fn usage<T: Into<String>>(message: T) -> Self {
        Self {
            code: ExitCode::Usage,
            message: message.into(),
        }
    }

    pub fn run_failed<T: Into<String>>(message: T) -> Self {
        Self {
            code: ExitCode::RunFailed,
            message: message.into(),
        }
    }

    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self {
            code: ExitCode::Internal,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code as i32
    }
}

impl From<HubError> for AppError {
    fn from(err: HubError) -> Self {
        let code = match &err {
            HubError::Configuration(_) | HubError::Parse(_) | HubError::NotFound(_) => {
                ExitCode::Usage
            }
            HubError::Busy { .. } => ExitCode::RunFailed,
            HubError::Storage(_) | HubError::Unpersisted { .. } => ExitCode::Internal,
        };

        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}
