//! Error types for sub-interpreter operations

use std::path::PathBuf;

use thiserror::Error;
use vmp_bytecode::BytecodeError;

#[derive(Error, Debug)]
pub enum VmpError {
    #[error("sub-interpreter is closed")]
    Closed,

    /// Compile error inside the sub-interpreter
    #[error("{0}")]
    Load(String),

    /// Error raised while running code inside the sub-interpreter
    #[error("{0}")]
    Runtime(String),

    #[error("module '{name}' not loaded: {message}")]
    Module { name: String, message: String },

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

pub type Result<T> = std::result::Result<T, VmpError>;

impl From<VmpError> for mlua::Error {
    fn from(err: VmpError) -> Self {
        match err {
            VmpError::Lua(err) => err,
            other => mlua::Error::RuntimeError(other.to_string()),
        }
    }
}

/// The message a Lua error carries, without mlua's decoration
pub fn error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => error_message(cause),
        other => other.to_string(),
    }
}
