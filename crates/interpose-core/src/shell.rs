//! Privileged execution channel.
//!
//! A privileged shell is a process started with elevated rights (`su`,
//! `sudo -n sh`, or plain `sh` when already root). Commands are piped to its
//! standard input; the exit status and captured output come back as a
//! [`ShellOutput`].

use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::CommandError;

/// Result of one privileged session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Exit status of the session (`-1` when killed by a signal).
    pub status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ShellOutput {
    /// Returns true if the session exited with status 0.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A channel that runs a batch of commands with elevated rights.
///
/// Implementations run the batch in one session and stop at the first failing
/// command. An `Err` is only returned when the session could not be run at all;
/// a session that ran and failed is an `Ok` with a non-zero status.
pub trait PrivilegedShell: Send + Sync {
    /// Runs `commands` in order in a single privileged session.
    fn run(&self, commands: &[String]) -> Result<ShellOutput, CommandError>;
}

/// Privileged shell backed by an external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandShell {
    program: String,
    args: Vec<String>,
}

impl CommandShell {
    /// Creates a shell from a program and its arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `su` reading commands from stdin (rooted Android).
    pub fn su() -> Self {
        Self::new("su", Vec::<String>::new())
    }

    /// Non-interactive `sudo` running `sh`.
    pub fn sudo() -> Self {
        Self::new("sudo", ["-n", "sh"])
    }

    /// Plain `sh`, for when the process already runs as root.
    pub fn sh() -> Self {
        Self::new("sh", Vec::<String>::new())
    }

    /// Parses a whitespace-separated command line such as `"sudo -n sh"`.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }

    /// Returns the program this shell launches.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Renders the script piped to the session. `set -e` makes a failure in
    /// the middle of the batch end the session with that command's status.
    pub fn script(commands: &[String]) -> String {
        let mut script = String::from("set -e\n");
        for command in commands {
            script.push_str(command);
            script.push('\n');
        }
        script.push_str("exit\n");
        script
    }
}

impl Default for CommandShell {
    fn default() -> Self {
        Self::su()
    }
}

impl PrivilegedShell for CommandShell {
    fn run(&self, commands: &[String]) -> Result<ShellOutput, CommandError> {
        debug!(program = %self.program, ?commands, "running privileged session");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    CommandError::PermissionDenied(format!("cannot start {}: {}", self.program, e))
                }
                _ => CommandError::Channel(format!("cannot start {}: {}", self.program, e)),
            })?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| CommandError::Channel("stdin not captured".into()))?;
            // A helper that refuses access may exit before reading its input.
            // Its status and stderr still say why, so a closed pipe is not fatal.
            match stdin.write_all(Self::script(commands).as_bytes()) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!(program = %self.program, "privileged shell closed its input early");
                }
                Err(e) => return Err(CommandError::Channel(format!("writing commands: {}", e))),
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| CommandError::Channel(format!("waiting for {}: {}", self.program, e)))?;

        Ok(ShellOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_wraps_commands() {
        let script = CommandShell::script(&["echo one".to_string(), "echo two".to_string()]);
        assert_eq!(script, "set -e\necho one\necho two\nexit\n");
    }

    #[test]
    fn test_parse_spec() {
        let shell = CommandShell::parse("sudo -n sh").unwrap();
        assert_eq!(shell, CommandShell::sudo());
        assert_eq!(CommandShell::parse("su").unwrap(), CommandShell::su());
        assert!(CommandShell::parse("   ").is_none());
    }

    #[test]
    fn test_missing_program_is_permission_denied() {
        let shell = CommandShell::new("interpose-no-such-shell", Vec::<String>::new());
        let err = shell.run(&["true".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[cfg(unix)]
    #[test]
    fn test_sh_stops_at_first_failure() {
        let output = CommandShell::sh()
            .run(&[
                "echo before".to_string(),
                "echo broken >&2; false".to_string(),
                "echo after".to_string(),
            ])
            .unwrap();
        assert!(!output.success());
        assert!(output.stdout.contains("before"));
        assert!(!output.stdout.contains("after"));
        assert!(output.stderr.contains("broken"));
    }

    #[cfg(unix)]
    #[test]
    fn test_refusing_helper_reports_its_exit_status() {
        let shell = CommandShell::new(
            "sh",
            ["-c", "echo 'sudo: a password is required' >&2; exit 1"],
        );
        let batch: Vec<String> = (0..20_000)
            .map(|i| format!("iptables -t nat -A INTERPOSE -m comment --comment rule-{}", i))
            .collect();

        for commands in [vec!["true".to_string()], batch] {
            for _ in 0..50 {
                let output = shell.run(&commands).unwrap();
                assert_eq!(output.status, 1);
                assert!(output.stderr.contains("a password is required"));
            }
        }
    }
}
