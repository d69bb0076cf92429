//! Folding snapshots together.
//!
//! The fold itself is opaque: given snapshots in order it produces one
//! snapshot. Inputs are always passed strictly left to right, oldest last.
//! Folding in batches across runs matches folding everything at once only
//! for an associative fold; nothing here relies on that.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::config::FoldSettings;
use crate::error::{MergeError, Result};

/// Combine two or more snapshots into one.
#[async_trait]
pub trait Fold: Send + Sync {
    /// Fold `inputs` (at least two, oldest first) into a new file at `output`.
    async fn fold(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
}

#[async_trait]
impl<F: Fold + ?Sized> Fold for &F {
    async fn fold(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        (**self).fold(inputs, output).await
    }
}

/// How a run turns its inputs into the snapshot it publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// No checkpoint and no extractions; nothing is published.
    Nothing,
    /// First run with a single extraction; it is published as-is.
    Promote,
    /// Several inputs folded together.
    Fold,
    /// Checkpoint exists but nothing is new; the current snapshot is
    /// published again under the same checkpoint.
    Republish,
}

impl MergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nothing => "nothing",
            Self::Promote => "promote",
            Self::Fold => "fold",
            Self::Republish => "republish",
        }
    }
}

/// Fold inputs for one run, decided from the prior snapshot and the
/// downloaded candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldPlan {
    Nothing,
    Promote(PathBuf),
    Republish(PathBuf),
    /// Inputs in fold order: the prior snapshot (if any), then candidates
    /// oldest first.
    Fold(Vec<PathBuf>),
}

impl FoldPlan {
    /// `candidates` must already be oldest first.
    pub fn new(prior: Option<&Path>, candidates: &[PathBuf]) -> Self {
        match (prior, candidates) {
            (None, []) => Self::Nothing,
            (None, [only]) => Self::Promote(only.clone()),
            (None, _) => Self::Fold(candidates.to_vec()),
            (Some(prior), []) => Self::Republish(prior.to_path_buf()),
            (Some(prior), _) => Self::Fold(
                std::iter::once(prior.to_path_buf())
                    .chain(candidates.iter().cloned())
                    .collect(),
            ),
        }
    }

    pub fn mode(&self) -> MergeMode {
        match self {
            Self::Nothing => MergeMode::Nothing,
            Self::Promote(_) => MergeMode::Promote,
            Self::Republish(_) => MergeMode::Republish,
            Self::Fold(_) => MergeMode::Fold,
        }
    }

    /// Carry out the plan.
    ///
    /// Returns the snapshot to publish, or `None` for [`FoldPlan::Nothing`].
    /// Only [`FoldPlan::Fold`] writes `output`.
    pub async fn execute<F: Fold + ?Sized>(
        self,
        fold: &F,
        output: &Path,
    ) -> Result<Option<PathBuf>> {
        match self {
            Self::Nothing => Ok(None),
            Self::Promote(path) | Self::Republish(path) => Ok(Some(path)),
            Self::Fold(inputs) => {
                prepare_output(output).await?;
                tracing::info!(
                    inputs = inputs.len(),
                    output = %output.display(),
                    "folding snapshots"
                );
                fold.fold(&inputs, output).await?;
                verify_output(output).await?;
                Ok(Some(output.to_path_buf()))
            }
        }
    }
}

async fn prepare_output(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MergeError::io(format!("creating {}", parent.display()), e))?;
    }
    match tokio::fs::remove_file(output).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MergeError::io(format!("removing stale {}", output.display()), e)),
    }
}

/// A fold that reports success must leave a non-empty file behind.
async fn verify_output(output: &Path) -> Result<()> {
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => Err(MergeError::fold(format!(
            "fold output {} is empty",
            output.display()
        ))),
        Err(e) => Err(MergeError::fold_with_source(
            format!("fold produced no output at {}", output.display()),
            e,
        )),
    }
}

/// Fold by running `hyaline merge documentation`.
#[derive(Debug, Clone)]
pub struct CommandFold {
    program: String,
    prefix_args: Vec<String>,
    debug: bool,
    timeout: Option<Duration>,
}

impl CommandFold {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            debug: false,
            timeout: None,
        }
    }

    pub fn from_settings(settings: &FoldSettings) -> Self {
        Self {
            program: settings.program.clone(),
            prefix_args: settings.args.clone(),
            debug: settings.debug,
            timeout: match settings.timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// Arguments passed ahead of everything else.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn merge_args(&self, inputs: &[PathBuf], output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(inputs.len() * 2 + 5);
        if self.debug {
            args.push("--debug".into());
        }
        args.push("merge".into());
        args.push("documentation".into());
        for input in inputs {
            args.push("--input".into());
            args.push(input.as_os_str().to_owned());
        }
        args.push("--output".into());
        args.push(output.as_os_str().to_owned());
        args
    }

    /// Report the fold tool's version, e.g. for the run log.
    pub async fn version(&self) -> Result<String> {
        let output = self.run(&[OsString::from("version")]).await?;
        if !output.status.success() {
            return Err(MergeError::fold(format!(
                "`{} version` failed with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, args: &[OsString]) -> Result<std::process::Output> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let spawned = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| {
                    MergeError::fold(format!(
                        "{} timed out after {}s",
                        self.program,
                        limit.as_secs()
                    ))
                })?,
            None => command.output().await,
        };

        spawned.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MergeError::config(format!("fold program not found: {}", self.program))
            } else {
                MergeError::fold_with_source(format!("failed to run {}", self.program), e)
            }
        })
    }
}

#[async_trait]
impl Fold for CommandFold {
    async fn fold(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let args = self.merge_args(inputs, output);
        tracing::debug!(program = %self.program, ?args, "running fold command");

        let result = self.run(&args).await?;
        for line in String::from_utf8_lossy(&result.stdout).lines() {
            tracing::debug!(target: "hyaline_merge::fold::stdout", "{line}");
        }

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(MergeError::fold(format!(
                "`{} merge documentation` exited with {}: {}",
                self.program,
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn plan_covers_every_case() {
        let prior = p("/w/current/documentation.db");
        let a = p("/w/extracted/1-1/documentation.db");
        let b = p("/w/extracted/2-2/documentation.db");

        assert_eq!(FoldPlan::new(None, &[]), FoldPlan::Nothing);
        assert_eq!(FoldPlan::new(None, &[a.clone()]), FoldPlan::Promote(a.clone()));
        assert_eq!(
            FoldPlan::new(None, &[a.clone(), b.clone()]),
            FoldPlan::Fold(vec![a.clone(), b.clone()])
        );
        assert_eq!(
            FoldPlan::new(Some(&prior), &[]),
            FoldPlan::Republish(prior.clone())
        );
        assert_eq!(
            FoldPlan::new(Some(&prior), &[a.clone()]),
            FoldPlan::Fold(vec![prior.clone(), a.clone()])
        );
        assert_eq!(
            FoldPlan::new(Some(&prior), &[a.clone(), b.clone()]).mode(),
            MergeMode::Fold
        );
    }

    #[test]
    fn merge_args_put_prior_first_and_output_last() {
        let fold = CommandFold::new("hyaline").with_debug(true);
        let args = fold.merge_args(&[p("prior.db"), p("new.db")], Path::new("out.db"));
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "--debug",
                "merge",
                "documentation",
                "--input",
                "prior.db",
                "--input",
                "new.db",
                "--output",
                "out.db"
            ]
        );
    }

    /// Records its inputs and writes a fixed body.
    struct Recording {
        calls: Mutex<Vec<Vec<PathBuf>>>,
        body: &'static str,
    }

    #[async_trait]
    impl Fold for Recording {
        async fn fold(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(inputs.to_vec());
            tokio::fs::write(output, self.body).await.unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn promote_and_republish_never_invoke_the_fold() {
        let fold = Recording {
            calls: Mutex::new(Vec::new()),
            body: "x",
        };
        let out = Path::new("/nonexistent/out.db");

        let promoted = FoldPlan::Promote(p("a.db")).execute(&fold, out).await.unwrap();
        assert_eq!(promoted, Some(p("a.db")));
        let republished = FoldPlan::Republish(p("c.db")).execute(&fold, out).await.unwrap();
        assert_eq!(republished, Some(p("c.db")));
        assert_eq!(FoldPlan::Nothing.execute(&fold, out).await.unwrap(), None);
        assert!(fold.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_fold_output_is_a_fold_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("merged").join("documentation.db");
        let fold = Recording {
            calls: Mutex::new(Vec::new()),
            body: "",
        };

        let err = FoldPlan::Fold(vec![p("a.db"), p("b.db")])
            .execute(&fold, &out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fold);
    }

    #[tokio::test]
    async fn stale_output_from_an_earlier_attempt_is_removed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("documentation.db");
        std::fs::write(&out, "stale").unwrap();

        /// Succeeds without writing anything.
        struct Lazy;
        #[async_trait]
        impl Fold for Lazy {
            async fn fold(&self, _inputs: &[PathBuf], _output: &Path) -> Result<()> {
                Ok(())
            }
        }

        let err = FoldPlan::Fold(vec![p("a.db"), p("b.db")])
            .execute(&Lazy, &out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fold);
        assert!(!out.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_fold_drives_the_cli() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = |name: &str, body: &str| {
            let path = tmp.path().join(name);
            std::fs::write(&path, body).unwrap();
            path.to_string_lossy().into_owned()
        };
        let concat = script(
            "fake-hyaline.sh",
            r#"[ "$1" = "version" ] && { echo "hyaline v1.4.0"; exit 0; }
[ "$1" = "--debug" ] && shift
[ "$1 $2" = "merge documentation" ] || { echo "unexpected: $*" >&2; exit 64; }
shift 2
ins=
out=
while [ $# -gt 0 ]; do
  case "$1" in
    --input) ins="$ins $2"; shift 2 ;;
    --output) out="$2"; shift 2 ;;
    *) echo "unknown argument $1" >&2; exit 64 ;;
  esac
done
cat $ins > "$out"
"#,
        );
        let broken = script(
            "broken-hyaline.sh",
            "echo 'database is locked' >&2\nexit 3\n",
        );

        let a = tmp.path().join("a.db");
        let b = tmp.path().join("b.db");
        std::fs::write(&a, "one\n").unwrap();
        std::fs::write(&b, "two\n").unwrap();
        let out = tmp.path().join("out").join("documentation.db");

        let fold = CommandFold::new("sh").with_args([concat]).with_debug(true);
        assert_eq!(fold.version().await.unwrap(), "hyaline v1.4.0");
        FoldPlan::Fold(vec![a.clone(), b.clone()])
            .execute(&fold, &out)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "one\ntwo\n");

        let err = CommandFold::new("sh")
            .with_args([broken])
            .fold(&[a.clone(), b.clone()], &out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fold);
        assert!(err.to_string().contains("database is locked"));

        let missing = tmp.path().join("no-such-binary");
        let err = CommandFold::new(missing.to_string_lossy())
            .fold(&[a, b], &out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
