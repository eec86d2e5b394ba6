//! Protocol error taxonomy. Every variant's message is what the sender
//! sees after `error: `.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    // Parse / validation
    #[error("Expected command letter")]
    ExpectedCommandLetter,
    #[error("Bad number format")]
    BadNumberFormat,
    #[error("Unsupported statement")]
    UnsupportedStatement,
    #[error("Invalid statement")]
    InvalidStatement,
    #[error("Modal group violation")]
    ModalGroupViolation,
    #[error("Undefined feed rate")]
    UndefinedFeedRate,
    #[error("Line overflow")]
    LineOverflow,

    // Settings
    #[error("Invalid setting")]
    InvalidSetting,
    #[error("Setting value out of range")]
    SettingOutOfRange,
    #[error("Step pulse must be >= 3 microseconds")]
    StepPulseTooShort,
    #[error("Setting disabled")]
    SettingDisabled,

    // Runtime
    #[error("Alarm lock")]
    AlarmLock,
    #[error("Busy or queued")]
    Busy,
}
