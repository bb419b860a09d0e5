use thiserror::Error;

/// Engine error kinds. Validation and argument errors surface immediately;
/// `ToolFailure` is collected per family so one bad external run never takes
/// down its siblings.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed file, unknown field, non-integer threshold, unknown
    /// filter variable, argument-type mismatch.
    #[error("input error: {0}")]
    Input(String),

    /// Mutually-incompatible options.
    #[error("argument error: {0}")]
    Argument(String),

    /// No strains loaded, no distances available, fewer members than the
    /// operation requires.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Non-zero exit, timeout, or unparsable output from an external binary.
    #[error("tool failure: {tool}: {message}")]
    ToolFailure {
        tool: String,
        message: String,
        stdout: String,
        stderr: String,
        status: Option<i32>,
    },

    /// Internal invariant broken. Fatal.
    #[error("consistency error: {0}")]
    Consistency(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// --------------------------------------------------
impl Error {
    pub fn input(msg: impl Into<String>) -> Self {
        Error::Input(msg.into())
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        Error::Argument(msg.into())
    }

    pub fn empty(msg: impl Into<String>) -> Self {
        Error::EmptyInput(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Error::Consistency(msg.into())
    }

    /// True for the per-family recoverable kind.
    pub fn is_tool_failure(&self) -> bool {
        matches!(self, Error::ToolFailure { .. })
    }
}
