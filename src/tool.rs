//! Tool adapter exposing the executor to an agent framework.
//!
//! The agent calls the tool with JSON arguments (`{"code": "..."}`) and
//! gets back `{"output": "...", "success": bool}`. Execution failures are
//! part of the output so the model can read the traceback and try again.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::code_block::CodeBlock;
use crate::error::ExecutorError;
use crate::executor::SandboxExecutor;

/// A callable tool as seen by the agent framework
#[async_trait]
pub trait Tool: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments
    fn parameters(&self) -> Value;

    /// Definition in the shape tool-calling clients list
    fn definition(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "inputSchema": self.parameters(),
        })
    }

    async fn call(&mut self, args: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeExecutionInput {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: String,
    pub success: bool,
}

/// Runs python source in a started [`SandboxExecutor`]
pub struct PythonCodeExecutionTool<'a> {
    executor: &'a mut SandboxExecutor,
}

impl<'a> PythonCodeExecutionTool<'a> {
    pub fn new(executor: &'a mut SandboxExecutor) -> Self {
        Self { executor }
    }

    /// Execute one python block. Lifecycle and runtime errors propagate;
    /// failures of the code itself come back as an unsuccessful output.
    pub async fn run(&mut self, input: CodeExecutionInput) -> Result<ToolOutput, ExecutorError> {
        let result = self
            .executor
            .execute(&[CodeBlock::python(input.code)])
            .await?;

        let mut output = result.output().to_string();
        if result.timed_out() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str("Timeout");
        }

        Ok(ToolOutput {
            output,
            success: result.success(),
        })
    }
}

#[async_trait]
impl<'a> Tool for PythonCodeExecutionTool<'a> {
    fn name(&self) -> &str {
        "CodeExecutor"
    }

    fn description(&self) -> &str {
        "Execute Python code blocks. The code runs in an isolated container; \
         files written to the current directory persist between calls."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The contents of the Python code block that should be executed"
                }
            },
            "required": ["code"]
        })
    }

    async fn call(&mut self, args: Value) -> Result<Value> {
        let input: CodeExecutionInput =
            serde_json::from_value(args).context("Invalid arguments for CodeExecutor")?;
        let output = self.run(input).await?;
        Ok(serde_json::to_value(output)?)
    }
}
