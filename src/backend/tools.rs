//! External assembler / simulator subprocess wrappers.
//!
//! Both tools are opaque: the assembler takes a source path and produces an
//! exit code (plus diagnostics on stderr), the simulator takes an assembled
//! image and produces the program's stdout.  A nonzero exit becomes a
//! [`ToolError`] carrying the tool's stderr — reported, never swallowed.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// The external M32 assembler.
pub struct Assembler {
    program: PathBuf,
}

impl Assembler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Assemble `source` into `image`.
    pub fn assemble(&self, source: &Path, image: &Path) -> Result<(), ToolError> {
        let output = Command::new(&self.program)
            .arg(source)
            .arg("-o")
            .arg(image)
            .output()
            .map_err(|e| ToolError::Launch {
                tool: self.program.display().to_string(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: self.program.display().to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// The external M32 hardware simulator.
pub struct Simulator {
    program: PathBuf,
}

impl Simulator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run an assembled image and capture the program's stdout.
    pub fn run(&self, image: &Path) -> Result<String, ToolError> {
        let output = Command::new(&self.program)
            .arg(image)
            .output()
            .map_err(|e| ToolError::Launch {
                tool: self.program.display().to_string(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: self.program.display().to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
