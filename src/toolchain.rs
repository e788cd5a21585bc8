//! Compiles the backend source into a runnable artifact

use crate::config::{AppConfig, BuildCommand};
use crate::diagnostic::strip_build_banner;
use crate::error::SupervisorError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;
use tracing::{debug, info, warn};

const ARTIFACT_PREFIX: &str = "hotgate-app";

/// Runs the configured build command, one fresh artifact per build
pub struct Toolchain {
    command: BuildCommand,
    main: PathBuf,
    build_dir: PathBuf,
    sequence: AtomicU64,
}

impl Toolchain {
    pub fn new(command: BuildCommand, main: PathBuf, build_dir: PathBuf) -> Self {
        Self {
            command,
            main,
            build_dir,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.build_command()?,
            config.main_path(),
            config.build_dir(),
        ))
    }

    /// A path no earlier build of this run has used
    pub fn next_artifact(&self) -> PathBuf {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{}-{}-{}{}",
            ARTIFACT_PREFIX,
            chrono::Utc::now().timestamp_millis(),
            seq,
            std::env::consts::EXE_SUFFIX
        );
        self.build_dir.join(name)
    }

    /// Build a new artifact. Any toolchain output counts as a failure.
    pub async fn build(&self) -> Result<PathBuf, SupervisorError> {
        let artifact = self.next_artifact();
        let args = self.command.render_args(&artifact, &self.main);

        if !self.build_dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(&self.build_dir).await?;
        }

        info!(main = %self.main.display(), artifact = %artifact.display(), "Building");
        debug!(program = %self.command.program, ?args, "Build command");

        let output = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                SupervisorError::Build(format!(
                    "failed to run '{}': {}",
                    self.command.program, e
                ))
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let message = strip_build_banner(&combined).trim_end().to_string();

        if !message.is_empty() || !output.status.success() {
            remove_artifact(&artifact).await;
            let message = if message.is_empty() {
                format!("build command exited with {}", output.status)
            } else {
                message
            };
            warn!(main = %self.main.display(), "Build failed");
            return Err(SupervisorError::Build(message));
        }

        if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            return Err(SupervisorError::Build(format!(
                "build command did not produce {}",
                artifact.display()
            )));
        }

        info!(artifact = %artifact.display(), "Build succeeded");
        Ok(artifact)
    }
}

/// Delete an artifact, ignoring one that is already gone
pub async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(artifact = %path.display(), "Removed artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(artifact = %path.display(), error = %e, "Failed to remove artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain(dir: &Path, command: &str) -> Toolchain {
        Toolchain::new(
            BuildCommand::parse(command).unwrap(),
            dir.join("main.go"),
            dir.join("build"),
        )
    }

    #[test]
    fn test_artifact_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = toolchain(dir.path(), "true {output}");

        let a = toolchain.next_artifact();
        let b = toolchain.next_artifact();
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path().join("build")));
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("hotgate-app-"));
    }

    #[tokio::test]
    async fn test_build_success() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
        let toolchain = toolchain(dir.path(), r#"sh -c 'cp "$1" "$0"' {output} {main}"#);

        let artifact = toolchain.build().await.unwrap();
        assert!(artifact.exists());
        assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "package main\n");
    }

    #[tokio::test]
    async fn test_build_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = toolchain(
            dir.path(),
            r##"sh -c 'touch "$0"; printf "# command-line-arguments\n./main.go:3: syntax error\n"' {output}"##,
        );

        let err = toolchain.build().await.unwrap_err();
        assert_eq!(
            err,
            SupervisorError::Build("./main.go:3: syntax error".to_string())
        );

        // The partial artifact is cleaned up
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("build"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_build_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = toolchain(dir.path(), "sh -c 'exit 3' {output}");

        match toolchain.build().await {
            Err(SupervisorError::Build(message)) => assert!(message.contains("exited with")),
            other => panic!("expected build failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_toolchain_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = toolchain(dir.path(), "hotgate-no-such-compiler {output}");

        match toolchain.build().await {
            Err(SupervisorError::Build(message)) => assert!(message.contains("failed to run")),
            other => panic!("expected build failure, got {:?}", other),
        }
    }
}
