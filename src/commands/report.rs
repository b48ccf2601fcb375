use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    /// Nothing failed, but the command did not do what was asked (e.g. already stopped).
    Attention,
    Failure,
}

/// One line of feedback produced while executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub level: Level,
    pub message: String,
}

impl Report {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: Level::Success,
            message: message.into(),
        }
    }

    pub fn attention(message: impl Into<String>) -> Self {
        Self {
            level: Level::Attention,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            level: Level::Failure,
            message: message.into(),
        }
    }

    /// Mirror the report to the application logs.
    pub(crate) fn trace(&self) {
        match self.level {
            Level::Success => tracing::info!("{}", self.message),
            Level::Attention => tracing::warn!("{}", self.message),
            Level::Failure => tracing::error!("{}", self.message),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            Level::Success => "SUCCESS",
            Level::Attention => "ATTENTION",
            Level::Failure => "FAILURE",
        };
        write!(f, "[{level}] {}", self.message)
    }
}
