//! The black-box training seam.
//!
//! The controller never trains in-process: a [`TrainStep`] implementation
//! consumes a dataset window and must leave the model and checkpoint
//! artifacts at the provided (hidden) output paths. The controller performs
//! the final renames, so a crashed trainer never publishes a partial model.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use super::window::TrainWindow;
use crate::Generation;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("failed to spawn trainer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("trainer exited with status {status}: {stderr_tail}")]
    Failed { status: i32, stderr_tail: String },

    #[error("trainer produced unparseable stats: {0}")]
    BadStats(#[source] serde_json::Error),

    #[error("trainer did not write {0}")]
    MissingArtifact(PathBuf),

    #[error("no trainer command configured")]
    NoTrainer,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One train-step request.
#[derive(Debug, Clone)]
pub struct TrainJob {
    /// Generation being produced.
    pub gen: Generation,
    pub snapshot_steps: u32,
    pub minibatch_size: u32,
    pub window: TrainWindow,
    /// Root of the self-play data tree the trainer samples from.
    pub data_dir: PathBuf,
    /// Checkpoint to resume from, when one exists.
    pub resume_checkpoint: Option<PathBuf>,
    /// Hidden destination for the jit-compiled model.
    pub model_out: PathBuf,
    /// Hidden destination for the checkpoint.
    pub checkpoint_out: PathBuf,
    pub cuda_device: String,
}

/// Per-head training statistics, as accumulated by the trainer.
#[derive(Debug, Clone, Deserialize)]
pub struct HeadStats {
    pub head: String,
    pub accuracy_num: f64,
    pub loss_num: f64,
    pub den: u64,
}

impl HeadStats {
    pub fn accuracy(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.accuracy_num / self.den as f64
        }
    }

    pub fn loss(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.loss_num / self.den as f64
        }
    }
}

/// Result of a completed train step.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainOutcome {
    pub minibatches: u32,
    pub total_loss: f64,
    pub heads: Vec<HeadStats>,
}

/// A single snapshot's worth of minibatch updates.
#[async_trait]
pub trait TrainStep: Send + Sync {
    async fn execute(&self, job: &TrainJob) -> Result<TrainOutcome, TrainError>;
}

/// Runs an external trainer command.
///
/// The command receives the job as flags and must print a single JSON
/// object with the [`TrainOutcome`] shape as the last line of stdout.
pub struct SubprocessTrainer {
    command: PathBuf,
}

impl SubprocessTrainer {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TrainStep for SubprocessTrainer {
    async fn execute(&self, job: &TrainJob) -> Result<TrainOutcome, TrainError> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg("--gen")
            .arg(job.gen.to_string())
            .arg("--data-dir")
            .arg(&job.data_dir)
            .arg("--window")
            .arg(job.window.n_window.to_string())
            .arg("--snapshot-steps")
            .arg(job.snapshot_steps.to_string())
            .arg("--minibatch-size")
            .arg(job.minibatch_size.to_string())
            .arg("--model-out")
            .arg(&job.model_out)
            .arg("--checkpoint-out")
            .arg(&job.checkpoint_out)
            .arg("--cuda-device")
            .arg(&job.cuda_device)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ckpt) = &job.resume_checkpoint {
            cmd.arg("--resume").arg(ckpt);
        }

        tracing::info!(gen = job.gen, command = %self.command.display(), "launching trainer");
        let mut child = cmd.spawn().map_err(TrainError::Spawn)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout).await?;
        }
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr).await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(TrainError::Failed {
                status: status.code().unwrap_or(-1),
                stderr_tail: tail,
            });
        }

        let last_line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("");
        let outcome: TrainOutcome =
            serde_json::from_str(last_line).map_err(TrainError::BadStats)?;

        for artifact in [&job.model_out, &job.checkpoint_out] {
            if !artifact.is_file() {
                return Err(TrainError::MissingArtifact(artifact.clone()));
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::window::TrainWindow;

    fn job(dir: &std::path::Path) -> TrainJob {
        TrainJob {
            gen: 1,
            snapshot_steps: 4,
            minibatch_size: 8,
            window: TrainWindow {
                n_total: 100,
                n_window: 100,
                slices: vec![],
            },
            data_dir: dir.join("self-play-data"),
            resume_checkpoint: None,
            model_out: dir.join(".gen-1.model"),
            checkpoint_out: dir.join(".gen-1.ckpt"),
            cuda_device: "cuda:0".into(),
        }
    }

    #[tokio::test]
    async fn subprocess_trainer_parses_stats_line() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("trainer.sh");
        std::fs::write(
            &script,
            r#"#!/bin/sh
while [ "$#" -gt 0 ]; do
  case "$1" in
    --model-out) model="$2"; shift 2 ;;
    --checkpoint-out) ckpt="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "epoch done"
printf 'weights' > "$model"
printf 'state' > "$ckpt"
echo '{"minibatches":4,"total_loss":1.25,"heads":[{"head":"policy","accuracy_num":3.0,"loss_num":5.0,"den":4}]}'
"#,
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let trainer = SubprocessTrainer::new(script);
        let outcome = trainer.execute(&job(dir.path())).await.unwrap();
        assert_eq!(outcome.minibatches, 4);
        assert_eq!(outcome.heads.len(), 1);
        assert!((outcome.heads[0].accuracy() - 0.75).abs() < 1e-9);
        assert!(dir.path().join(".gen-1.model").is_file());
    }

    #[tokio::test]
    async fn missing_artifacts_fail_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("trainer.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"minibatches\":0,\"total_loss\":0.0,\"heads\":[]}'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let trainer = SubprocessTrainer::new(script);
        let err = trainer.execute(&job(dir.path())).await.unwrap_err();
        assert!(matches!(err, TrainError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("trainer.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'cuda OOM' >&2\nexit 3\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let trainer = SubprocessTrainer::new(script);
        match trainer.execute(&job(dir.path())).await.unwrap_err() {
            TrainError::Failed {
                status,
                stderr_tail,
            } => {
                assert_eq!(status, 3);
                assert!(stderr_tail.contains("cuda OOM"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
