use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::*;

/// Outcome of one compilation step
#[derive(Debug, Clone, Default)]
pub struct CompileResult {
    pub return_code: i32,
    /// Compiler diagnostics (stderr followed by stdout)
    pub stderr: Vec<u8>,
    pub time: f64,
}

impl CompileResult {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

impl<R: SandboxRunner> Judge<R> {
    /// Compiles the trusted checker
    ///
    /// A non-zero return code is a problem setup failure, to be reported as
    /// `Fail` rather than blamed on the contestant.
    pub async fn compile_checker(&mut self) -> Result<CompileResult> {
        let (source, artifact) = self.checker_paths();
        let result = self
            .compile(
                &self.options.checker_language,
                &self.checker_source,
                &source,
                &artifact,
            )
            .await?;

        self.checker_ready = result.success();
        if !self.checker_ready {
            log::error!(
                "Checker failed to compile (code {}): {}",
                result.return_code,
                String::from_utf8_lossy(&result.stderr)
            );
        }
        Ok(result)
    }

    /// Compiles the submission; a non-zero return code means CE
    pub async fn compile_source(&mut self) -> Result<CompileResult> {
        let (source, artifact) = self.source_paths();
        let result = self
            .compile(&self.language, &self.source, &source, &artifact)
            .await?;

        self.source_ready = result.success();
        log::debug!(
            "Source compiled with code {} in {:.3}s",
            result.return_code,
            result.time
        );
        Ok(result)
    }

    async fn compile(
        &self,
        profile: &LanguageProfile,
        text: &str,
        source: &Path,
        artifact: &Path,
    ) -> Result<CompileResult> {
        fs::write(source, text)
            .with_context(|| format!("Failed to write {}", source.display()))?;

        let Some(command) = profile.compile_command(source, artifact, self.dir()) else {
            // Interpreted: nothing to build
            return Ok(CompileResult::default());
        };
        let command = command?;

        let exec = self
            .runner
            .safe_run(&command, self.options.compile_time_limit, true)
            .await?;

        let mut diagnostics = exec.stderr;
        diagnostics.extend_from_slice(&exec.stdout);
        if exec.tle {
            diagnostics.extend_from_slice(
                format!(
                    "\ncompilation exceeded {}s and was killed\n",
                    self.options.compile_time_limit
                )
                .as_bytes(),
            );
        }

        Ok(CompileResult {
            return_code: if exec.tle { -1 } else { exec.return_code },
            stderr: diagnostics,
            time: exec.time,
        })
    }
}
