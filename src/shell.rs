use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("не удалось запустить {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("команда {program} не завершилась за {secs} с")]
    Timeout { program: String, secs: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stdout of a successful run, `None` on non-zero exit or empty output.
    pub fn non_empty_stdout(&self) -> Option<&str> {
        if self.success() && !self.stdout.is_empty() {
            Some(self.stdout.as_str())
        } else {
            None
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, script: &str) -> Result<CommandOutput, ShellError>;

    async fn run_with_env(
        &self,
        script: &str,
        envs: &[(&str, &str)],
    ) -> Result<CommandOutput, ShellError> {
        let _ = envs;
        self.run(script).await
    }
}

/// Runs scripts through `sh -c` on this host.
#[derive(Debug, Clone)]
pub struct LocalShell {
    timeout: Duration,
}

impl LocalShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for LocalShell {
    async fn run(&self, script: &str) -> Result<CommandOutput, ShellError> {
        self.run_with_env(script, &[]).await
    }

    async fn run_with_env(
        &self,
        script: &str,
        envs: &[(&str, &str)],
    ) -> Result<CommandOutput, ShellError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        for (k, v) in envs {
            cmd.env(k, v);
        }
        debug!(script, "локальная команда");
        execute(cmd, "sh", self.timeout).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    Agent,
    IdentityFile(PathBuf),
    Password(String),
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub auth: SshAuth,
    pub connect_timeout_secs: u64,
    pub strict_host_key_checking: bool,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Program and argument list, without the remote command itself.
    pub fn command_line(&self) -> (String, Vec<String>) {
        let mut args = Vec::new();
        let program = match &self.auth {
            SshAuth::Password(_) => {
                args.push("-e".to_string());
                args.push("ssh".to_string());
                "sshpass".to_string()
            }
            _ => "ssh".to_string(),
        };

        if let SshAuth::IdentityFile(path) = &self.auth {
            args.push("-i".to_string());
            args.push(path.display().to_string());
        }
        if !matches!(self.auth, SshAuth::Password(_)) {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        let strict = if self.strict_host_key_checking {
            "yes"
        } else {
            "no"
        };
        args.push("-o".to_string());
        args.push(format!("StrictHostKeyChecking={strict}"));
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.connect_timeout_secs));
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(self.destination());

        (program, args)
    }
}

/// Runs every script over a fresh ssh connection, so one failed check
/// never leaks into the next.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    target: SshTarget,
    timeout: Duration,
}

impl RemoteShell {
    pub fn new(target: SshTarget, timeout: Duration) -> Self {
        Self { target, timeout }
    }
}

#[async_trait]
impl CommandRunner for RemoteShell {
    async fn run(&self, script: &str) -> Result<CommandOutput, ShellError> {
        let (program, args) = self.target.command_line();
        let mut cmd = Command::new(&program);
        cmd.args(&args).arg(script);
        if let SshAuth::Password(password) = &self.target.auth {
            cmd.env("SSHPASS", password);
        }
        debug!(host = %self.target.host, script, "удалённая команда");
        execute(cmd, &program, self.timeout).await
    }
}

async fn execute(
    mut cmd: Command,
    program: &str,
    timeout: Duration,
) -> Result<CommandOutput, ShellError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|source| ShellError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let out = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(source)) => {
            return Err(ShellError::Spawn {
                program: program.to_string(),
                source,
            })
        }
        Err(_elapsed) => {
            return Err(ShellError::Timeout {
                program: program.to_string(),
                secs: timeout.as_secs(),
            })
        }
    };

    Ok(CommandOutput {
        code: out.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&out.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    })
}

/// Single-quotes `input` for POSIX sh.
pub fn shell_quote(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }
    let escaped = input.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Answers scripts by substring match, first rule wins; unmatched
    /// scripts exit 1 with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Vec<(String, Result<CommandOutput, String>)>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ok(mut self, needle: &str, stdout: &str) -> Self {
            self.rules.push((
                needle.to_string(),
                Ok(CommandOutput {
                    code: 0,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }),
            ));
            self
        }

        pub fn exit(mut self, needle: &str, code: i32, stdout: &str) -> Self {
            self.rules.push((
                needle.to_string(),
                Ok(CommandOutput {
                    code,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }),
            ));
            self
        }

        pub fn unreachable(mut self, needle: &str) -> Self {
            self.rules
                .push((needle.to_string(), Err("connection refused".to_string())));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_containing(&self, needle: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.contains(needle))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, script: &str) -> Result<CommandOutput, ShellError> {
            self.calls.lock().unwrap().push(script.to_string());
            for (needle, response) in &self.rules {
                if script.contains(needle.as_str()) {
                    return match response {
                        Ok(out) => Ok(out.clone()),
                        Err(msg) => Err(ShellError::Spawn {
                            program: "scripted".to_string(),
                            source: std::io::Error::new(std::io::ErrorKind::Other, msg.clone()),
                        }),
                    };
                }
            }
            Ok(CommandOutput {
                code: 1,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}
