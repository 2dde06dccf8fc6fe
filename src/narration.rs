//! Invocation of the external narration generator

use crate::{Error, RecorderConfig, Result};
use log::{debug, info};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// The generator command line
#[derive(Debug, Clone)]
pub struct NarrationCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl NarrationCommand {
    /// Bare program names (`python3`) are left for `PATH` lookup; anything
    /// with a directory part is resolved against the project root.
    pub fn from_config(config: &RecorderConfig) -> Self {
        let program = if config.narration_program.components().count() == 1 {
            config.narration_program.clone()
        } else {
            config.resolve(&config.narration_program)
        };
        Self {
            program,
            args: config.narration_args.clone(),
            working_dir: config.root.clone(),
        }
    }

    /// Run the generator to completion with the operator's terminal attached.
    pub async fn run(&self) -> Result<()> {
        debug!(
            "spawning narration generator {} {:?} in {}",
            self.program.display(),
            self.args,
            self.working_dir.display()
        );

        let status = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| Error::ProcessSpawn {
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            info!("✅ Narration audio generated");
            Ok(())
        } else {
            Err(Error::ProcessFailure { code: status.code() })
        }
    }
}
