use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::ConverterCommand;
use crate::domain::{OwnerId, Project, ProjectId};
use crate::error::VaultError;
use crate::intake::StagedUpload;
use crate::store::Store;

/// Turns a staged point-cloud file into a streamable artifact tree.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, input: &Path, output_dir: &Path) -> Result<(), VaultError>;
}

/// Runs the external converter binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessConverter {
    command: ConverterCommand,
}

impl ProcessConverter {
    pub fn new(command: ConverterCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Converter for ProcessConverter {
    async fn convert(&self, input: &Path, output_dir: &Path) -> Result<(), VaultError> {
        let program = &self.command.program;
        // Paths travel as discrete argv entries; nothing goes through a shell.
        let output = Command::new(program)
            .args(&self.command.leading_args)
            .arg(input)
            .arg("-o")
            .arg(output_dir)
            .arg("--overwrite")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| VaultError::ConverterLaunch {
                program: program.display().to_string(),
                message: err.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let message = if stderr.trim().is_empty() {
            format!("{} exited with {}", program.display(), output.status)
        } else {
            stderr
        };
        Err(VaultError::Conversion(message))
    }
}

/// Result of a successful conversion, handed to the completion stage.
#[derive(Debug, Clone)]
pub struct ConvertedUpload {
    pub project_id: ProjectId,
    pub owner_id: OwnerId,
    pub original_name: String,
    pub byte_size: u64,
    pub artifact_dir: Utf8PathBuf,
}

/// Handle to an in-flight conversion. Dropping it does not stop the converter.
#[derive(Debug)]
pub struct PendingConversion {
    project_id: ProjectId,
    outcome: oneshot::Receiver<Result<Project, VaultError>>,
}

impl PendingConversion {
    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub async fn wait(self) -> Result<Project, VaultError> {
        self.outcome.await.map_err(|_| {
            VaultError::Task(format!(
                "conversion of {} ended without reporting",
                self.project_id
            ))
        })?
    }
}

pub struct Orchestrator<C> {
    store: Store,
    converter: Arc<C>,
}

impl<C> Clone for Orchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            converter: Arc::clone(&self.converter),
        }
    }
}

impl<C: Converter + 'static> Orchestrator<C> {
    pub fn new(store: Store, converter: Arc<C>) -> Self {
        Self { store, converter }
    }

    /// Allocates a project directory and converts `staged` into it on a
    /// background task.
    ///
    /// On success `finish` runs on the same task and its result is reported
    /// through the returned handle, exactly once. The staged file is removed
    /// whatever happens; a project directory that never received a
    /// descriptor is removed too.
    pub async fn start<F, Fut>(
        &self,
        staged: StagedUpload,
        finish: F,
    ) -> Result<PendingConversion, VaultError>
    where
        F: FnOnce(ConvertedUpload) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Project, VaultError>> + Send + 'static,
    {
        let project_id = ProjectId::generate();
        let store = self.store.clone();
        let id = project_id.clone();
        let created = tokio::task::spawn_blocking(move || store.create_project_dir(&id))
            .await
            .map_err(VaultError::from)
            .and_then(|created| created);
        let artifact_dir = match created {
            Ok(dir) => dir,
            Err(err) => {
                discard_staged(staged);
                return Err(err);
            }
        };

        let (tx, rx) = oneshot::channel();
        let orchestrator = self.clone();
        let id = project_id.clone();
        tokio::spawn(async move {
            let outcome = orchestrator.run(id.clone(), artifact_dir, staged, finish).await;
            if tx.send(outcome).is_err() {
                debug!(project_id = %id, "conversion finished after caller went away");
            }
        });

        Ok(PendingConversion {
            project_id,
            outcome: rx,
        })
    }

    async fn run<F, Fut>(
        &self,
        project_id: ProjectId,
        artifact_dir: Utf8PathBuf,
        staged: StagedUpload,
        finish: F,
    ) -> Result<Project, VaultError>
    where
        F: FnOnce(ConvertedUpload) -> Fut,
        Fut: Future<Output = Result<Project, VaultError>>,
    {
        info!(
            project_id = %project_id,
            owner_id = %staged.owner_id,
            bytes = staged.byte_size,
            "conversion started"
        );
        let start = Instant::now();
        let converted = self
            .converter
            .convert(staged.path(), artifact_dir.as_std_path())
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let upload = ConvertedUpload {
            project_id: project_id.clone(),
            owner_id: staged.owner_id.clone(),
            original_name: staged.original_name.clone(),
            byte_size: staged.byte_size,
            artifact_dir,
        };
        discard_staged(staged);

        let outcome = match converted {
            Ok(()) => {
                info!(project_id = %project_id, elapsed_ms, "conversion finished");
                finish(upload).await
            }
            Err(err) => {
                error!(project_id = %project_id, elapsed_ms, error = %err, "conversion failed");
                Err(err)
            }
        };

        if outcome.is_err() {
            self.remove_incomplete(project_id).await;
        }
        outcome
    }

    async fn remove_incomplete(&self, project_id: ProjectId) {
        let store = self.store.clone();
        let id = project_id.clone();
        let removed = tokio::task::spawn_blocking(move || {
            if store.descriptor_path(&id).as_std_path().exists() {
                return Ok(());
            }
            store.remove_project_dir(&id)
        })
        .await;
        match removed {
            Ok(Ok(())) => debug!(project_id = %project_id, "removed incomplete project directory"),
            Ok(Err(err)) => {
                warn!(project_id = %project_id, error = %err, "incomplete project directory left for sweep")
            }
            Err(err) => {
                warn!(project_id = %project_id, error = %err, "incomplete project directory left for sweep")
            }
        }
    }
}

fn discard_staged(staged: StagedUpload) {
    if let Err(err) = staged.discard() {
        error!(error = %err, "failed to remove staged upload");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script_converter(dir: &Path, body: &str) -> ProcessConverter {
        let script = dir.join("convert.sh");
        std::fs::write(&script, body).unwrap();
        ProcessConverter::new(ConverterCommand {
            program: "/bin/sh".into(),
            leading_args: vec![script.display().to_string()],
        })
    }

    #[tokio::test]
    async fn process_converter_passes_discrete_arguments() {
        let temp = tempfile::tempdir().unwrap();
        let converter = script_converter(
            temp.path(),
            "[ \"$2\" = \"-o\" ] && [ \"$4\" = \"--overwrite\" ] || exit 9\n\
             cp \"$1\" \"$3/metadata.json\"\n",
        );
        let input = temp.path().join("it's $(odd) name.las");
        std::fs::write(&input, b"points").unwrap();
        let output = temp.path().join("out");
        std::fs::create_dir(&output).unwrap();

        converter.convert(&input, &output).await.unwrap();
        assert_eq!(std::fs::read(output.join("metadata.json")).unwrap(), b"points");
    }

    #[tokio::test]
    async fn process_converter_surfaces_stderr() {
        let temp = tempfile::tempdir().unwrap();
        let converter = script_converter(temp.path(), "echo 'invalid LAS header' >&2\nexit 3\n");
        let input = temp.path().join("scan.las");
        std::fs::write(&input, b"points").unwrap();

        let err = converter.convert(&input, temp.path()).await.unwrap_err();
        match err {
            VaultError::Conversion(message) => assert_eq!(message, "invalid LAS header\n"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_converter_binary_is_a_launch_error() {
        let converter = ProcessConverter::new(ConverterCommand {
            program: "/nonexistent/PotreeConverter".into(),
            leading_args: Vec::new(),
        });
        let err = converter
            .convert(Path::new("/tmp/scan.las"), Path::new("/tmp/out"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::ConverterLaunch { .. }));
    }
}
