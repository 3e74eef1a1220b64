use std::io::Write;

pub mod chunk;
pub mod compiler;
pub mod config;
pub mod heap;
pub mod natives;
pub mod scanner;
pub mod value;
pub mod vm;

pub use config::VmConfig;
pub use value::Value;
pub use vm::{InterpretError, InterpretResult, RuntimeError, RuntimeFailure, Vm};

/// Runs `source` on a fresh [`Vm`], writing `type` output to `write`.
pub fn interpret<W: Write>(source: &str, write: &mut W) -> Result<(), InterpretError> {
    Vm::new(write).run(source)
}
