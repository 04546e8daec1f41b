//! External command execution.
//!
//! Collaborators never spawn processes themselves: they describe a command as
//! a [`ToolSpec`] and hand it to a [`CommandRunner`]. Marker matching on the
//! returned [`ToolOutput`] stays in the collaborator that issued the command.

pub mod tool_runner;

pub use tool_runner::{
    duration_ms, ToolConfig, ToolError, ToolOutput, ToolRunner, ToolRunnerBuilder, ToolSpec,
};

/// Executes one external command to completion.
pub trait CommandRunner {
    fn run(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError>;
}

impl CommandRunner for ToolRunner {
    fn run(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError> {
        self.execute(spec)
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError> {
        (**self).run(spec)
    }
}
