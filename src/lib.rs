//! codebox library
//!
//! Run untrusted, model-generated code in isolated, time-bounded containers.

pub mod audit;
pub mod backend;
pub mod code_block;
pub mod config;
pub mod error;
pub mod executor;
pub mod tool;
pub mod validation;

pub use code_block::{CodeBlock, Language};
pub use config::Config;
pub use error::ExecutorError;
pub use executor::{ExecutionResult, SandboxExecutor, SessionState};
pub use tool::{PythonCodeExecutionTool, Tool, ToolOutput};
