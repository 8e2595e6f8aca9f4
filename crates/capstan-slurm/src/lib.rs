//! Slurm batch submission and job tracking.
//!
//! This crate wraps the scheduler's command-line programs rather than its RPC
//! API: scripts are built with a typed [`Sbatch`] builder, submitted through
//! `sbatch --parsable`, and the resulting [`SlurmJob`] is tracked by spawning
//! `squeue`, `sacct`, and `scancel`. Because a Slurm test cluster is hard to
//! spin up in CI, the subprocess paths are covered by golden tests over the
//! generated scripts and command lines only.

mod directives;
mod job;

use std::process::ExitStatus;
use std::process::Stdio;

use indexmap::IndexMap;
use thiserror::Error as ThisError;
use tokio::process::Command;
use tracing::trace;

pub use directives::DirectiveValue;
pub use job::RUNNING_STATE;
pub use job::SlurmJob;

/// The shell used for the generated batch scripts.
const SCRIPT_SHELL: &str = "/bin/bash";

/// The name of the scheduler's submission program.
const SBATCH_PROGRAM: &str = "sbatch";

/// An error raised by the adapter.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A scheduler program exited with a nonzero status.
    #[error("`{program}` failed ({status}): {stderr}")]
    CommandFailed {
        /// The program that failed.
        program: &'static str,
        /// The program's exit status.
        status: ExitStatus,
        /// The program's standard error, trimmed.
        stderr: String,
    },
    /// A scheduler program could not be spawned or awaited.
    #[error("failed to run `{program}`")]
    Io {
        /// The program that could not be run.
        program: &'static str,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A scheduler program produced output that could not be interpreted.
    #[error("`{program}` produced unexpected output: {reason}")]
    UnexpectedOutput {
        /// The program whose output was unexpected.
        program: &'static str,
        /// Why the output could not be interpreted.
        reason: String,
    },
    /// A directive key is not a documented `sbatch` flag.
    #[error("unknown sbatch directive `{0}`")]
    UnknownDirective(String),
}

/// The result type used throughout the adapter.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A builder for `sbatch` submissions.
///
/// The builder accumulates an ordered table of scheduler directives and an
/// ordered list of shell commands. Directive keys are written with `_` in
/// place of `-` and are validated against the flags `sbatch` documents;
/// rendering restores the `-`.
///
/// `$` in commands is escaped by default when the script is rendered so that
/// variable expansion is deferred to the submitted script rather than
/// happening in the submitting shell's here-document.
#[derive(Debug, Default, Clone)]
pub struct Sbatch {
    /// The scheduler directive table, in insertion order.
    directives: IndexMap<String, DirectiveValue>,
    /// The shell commands the script runs, in order.
    commands: Vec<String>,
}

impl Sbatch {
    /// Constructs an empty submission.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a scheduler directive.
    ///
    /// Fails if `key` is not a documented `sbatch` flag. Setting a key twice
    /// replaces the earlier value. A `false` flag value records the directive
    /// but omits it from the rendered script.
    pub fn arg(&mut self, key: &str, value: impl Into<DirectiveValue>) -> Result<&mut Self> {
        let key = key.trim();
        if !directives::is_known_directive(key) {
            return Err(Error::UnknownDirective(key.to_string()));
        }

        self.directives.insert(key.to_string(), value.into());
        Ok(self)
    }

    /// Appends a shell command line to the script.
    ///
    /// Empty lines are ignored.
    pub fn cmd(&mut self, line: impl Into<String>) -> &mut Self {
        let line = line.into().trim().to_string();
        if !line.is_empty() {
            self.commands.push(line);
        }
        self
    }

    /// Renders the batch script with `$` escaping enabled.
    pub fn script(&self) -> String {
        self.script_with(true)
    }

    /// Renders the batch script.
    ///
    /// When `escape_dollar` is set, `$` in the accumulated commands is
    /// rewritten to `\$` so the submitting shell leaves variable references
    /// for the script to expand.
    pub fn script_with(&self, escape_dollar: bool) -> String {
        let mut lines = vec![format!("#!{SCRIPT_SHELL}"), String::new()];

        for (key, value) in &self.directives {
            let Some(rendered) = value.render() else {
                continue;
            };

            let key = key.replace('_', "-");
            lines.push(format!("#SBATCH --{key:<19} {rendered}").trim_end().to_string());
        }

        lines.push(String::new());

        for command in &self.commands {
            if escape_dollar {
                lines.push(command.replace('$', "\\$"));
            } else {
                lines.push(command.clone());
            }
        }

        let mut script = lines.join("\n").trim().to_string();
        script.push('\n');
        script
    }

    /// Submits the script with the given run command appended, escaping `$`.
    ///
    /// See [`Sbatch::submit_with`].
    pub async fn submit<I, S>(&mut self, command: I) -> Result<SlurmJob>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.submit_with(command, true).await
    }

    /// Submits the script with the given run command appended.
    ///
    /// The command parts are joined with spaces and appended to the command
    /// list, then the rendered script is fed to `sbatch --parsable` through
    /// an inline here-document. The job identifier is read from the first
    /// `;`-delimited field of stdout.
    pub async fn submit_with<I, S>(&mut self, command: I, escape_dollar: bool) -> Result<SlurmJob>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let line = command
            .into_iter()
            .map(|part| part.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.cmd(line);

        let script = self.script_with(escape_dollar);
        let shell_line = submit_shell_line(&script);

        trace!(%script, "submitting batch script");

        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&shell_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| Error::Io {
                program: SBATCH_PROGRAM,
                source,
            })?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                program: SBATCH_PROGRAM,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| Error::UnexpectedOutput {
            program: SBATCH_PROGRAM,
            reason: "output was not UTF-8".to_string(),
        })?;

        // Parsable output is `<job id>[;<cluster name>]`.
        let id = stdout
            .trim()
            .split(';')
            .next()
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Err(Error::UnexpectedOutput {
                program: SBATCH_PROGRAM,
                reason: "missing job identifier".to_string(),
            });
        }

        Ok(SlurmJob::new(id, Some(script)))
    }
}

/// Builds the shell line that pipes a script into `sbatch` as an inline
/// here-document.
///
/// The delimiter is unquoted: the submitting shell expands `$` references,
/// which is why [`Sbatch::script_with`] escapes them by default.
fn submit_shell_line(script: &str) -> String {
    format!(
        "{SBATCH_PROGRAM} --parsable << CAPSTAN_EOF\n{script}\nCAPSTAN_EOF",
        script = script.trim_end()
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scripts_rewrite_underscores_in_keys() {
        let mut sbatch = Sbatch::new();
        sbatch.arg("cpus_per_task", 4_u32).unwrap();
        let script = sbatch.script();
        assert!(script.contains("#SBATCH --cpus-per-task"));
        assert!(!script.contains("cpus_per_task"));
    }

    #[test]
    fn false_flags_are_absent_from_scripts() {
        let mut sbatch = Sbatch::new();
        sbatch.arg("exclusive", false).unwrap();
        sbatch.arg("requeue", true).unwrap();
        let script = sbatch.script();
        assert!(!script.contains("exclusive"));
        assert!(script.contains("#SBATCH --requeue"));
    }

    #[test]
    fn unknown_directives_are_rejected() {
        let mut sbatch = Sbatch::new();
        let err = sbatch.arg("no_such_flag", "value").unwrap_err();
        assert!(matches!(err, Error::UnknownDirective(key) if key == "no_such_flag"));
    }

    #[test]
    fn scripts_render_header_then_commands() {
        let mut sbatch = Sbatch::new();
        sbatch.arg("job_name", "pool").unwrap();
        sbatch.arg("ntasks", 8_u32).unwrap();
        sbatch
            .arg("time", Duration::from_secs(86_400 + 2 * 3_600 + 3 * 60 + 4))
            .unwrap();
        sbatch.cmd("export SRUN_CPUS_PER_TASK=${SLURM_CPUS_PER_TASK}");

        assert_eq!(
            sbatch.script(),
            "#!/bin/bash\n\
             \n\
             #SBATCH --job-name            pool\n\
             #SBATCH --ntasks              8\n\
             #SBATCH --time                1-02:03:04\n\
             \n\
             export SRUN_CPUS_PER_TASK=\\${SLURM_CPUS_PER_TASK}\n"
        );
    }

    #[test]
    fn dollar_escaping_can_be_disabled() {
        let mut sbatch = Sbatch::new();
        sbatch.cmd("echo $HOME");
        assert!(sbatch.script_with(true).contains("echo \\$HOME"));
        assert!(sbatch.script_with(false).contains("echo $HOME"));
    }

    #[test]
    fn replacing_a_directive_keeps_one_line() {
        let mut sbatch = Sbatch::new();
        sbatch.arg("qos", "debug").unwrap();
        sbatch.arg("qos", "normal").unwrap();
        let script = sbatch.script();
        assert_eq!(script.matches("#SBATCH --qos").count(), 1);
        assert!(script.contains("normal"));
    }

    #[test]
    fn submissions_go_through_a_here_document() {
        let line = submit_shell_line("#!/bin/bash\n\n#SBATCH --ntasks              1\n");
        assert_eq!(
            line,
            "sbatch --parsable << CAPSTAN_EOF\n\
             #!/bin/bash\n\
             \n\
             #SBATCH --ntasks              1\n\
             CAPSTAN_EOF"
        );
    }
}
