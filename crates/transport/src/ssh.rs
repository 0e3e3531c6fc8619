//! SSH transport implementation using system ssh
//!
//! Each session is an OpenSSH ControlMaster connection authenticated once with
//! the tag password (supplied through `sshpass -e`). Commands and file fetches
//! are multiplexed over the master's control socket, so only the master ever
//! sees the password.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tagsync_core::session::shell_quote;
use tagsync_core::{CommandOutput, ConnectError, Connector, Credentials, RemoteSession, SessionError};
use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, Command};
use tracing::debug;

/// `sshpass` exit status for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// `ssh` exit status when the connection, not the remote command, failed
const SSH_CONNECTION_FAILED: i32 = 255;

/// How often to check whether the master connection is up
const READY_POLL: Duration = Duration::from_millis(100);

const UNREACHABLE_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "Network is unreachable",
    "Host is down",
    "Could not resolve hostname",
    "Name or service not known",
    "Temporary failure in name resolution",
];

/// Opens [`SshSession`]s
#[derive(Debug, Clone)]
pub struct SshConnector {
    port: u16,
    connect_timeout: Duration,
}

impl SshConnector {
    #[must_use]
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, ConnectError> {
        let session = SshSession::open(host, self.port, credentials, self.connect_timeout).await?;
        Ok(Box::new(session))
    }
}

/// Live master connection, present until the session is closed
struct Master {
    child: Child,
    // Removed (with the socket) on drop
    control_dir: tempfile::TempDir,
}

/// An authenticated SSH session to one tag
pub struct SshSession {
    host: String,
    port: u16,
    user: String,
    control_path: PathBuf,
    master: Option<Master>,
}

impl SshSession {
    /// Start a master connection and wait until it is authenticated.
    ///
    /// `ConnectTimeout` only bounds the TCP connect. Callers bound the whole
    /// handshake; dropping the returned future kills the master.
    ///
    /// # Errors
    /// Returns why the connection could not be established
    pub async fn open(
        host: &str,
        port: u16,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        debug!("Connecting to {}@{host}:{port}", credentials.username);

        let protocol = |reason: String| ConnectError::Protocol {
            host: host.to_string(),
            reason,
        };

        let control_dir = tempfile::Builder::new()
            .prefix("tagsync-")
            .tempdir()
            .map_err(|e| protocol(format!("creating control directory: {e}")))?;
        let control_path = control_dir.path().join("master");

        let child = Command::new("sshpass")
            .arg("-e")
            .arg("ssh")
            .args(["-M", "-N", "-S"])
            .arg(&control_path)
            .args(common_options(connect_timeout))
            .args([
                "-o",
                "PubkeyAuthentication=no",
                "-o",
                "PreferredAuthentications=password,keyboard-interactive",
                "-o",
                "NumberOfPasswordPrompts=1",
                "-p",
                &port.to_string(),
                &format!("{}@{host}", credentials.username),
            ])
            .env("SSHPASS", &credentials.password)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| protocol(format!("failed to launch sshpass/ssh: {e}")))?;

        let mut session = Self {
            host: host.to_string(),
            port,
            user: credentials.username.clone(),
            control_path,
            master: Some(Master { child, control_dir }),
        };

        session.wait_ready().await?;
        debug!("Master connection to {host} is up");
        Ok(session)
    }

    /// Poll the control socket until the master answers or exits
    async fn wait_ready(&mut self) -> Result<(), ConnectError> {
        loop {
            let Some(master) = self.master.as_mut() else {
                return Err(ConnectError::Protocol {
                    host: self.host.clone(),
                    reason: "master connection vanished".to_string(),
                });
            };

            let exited = master.child.try_wait().map_err(|e| ConnectError::Protocol {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
            if let Some(status) = exited {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                self.master = None;
                return Err(classify(&self.host, &self.user, status.code(), &stderr));
            }

            let check = self
                .control_command()
                .args(["-O", "check"])
                .arg(self.destination())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if matches!(check, Ok(status) if status.success()) {
                return Ok(());
            }

            tokio::time::sleep(READY_POLL).await;
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `ssh` bound to this session's control socket
    fn control_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-S")
            .arg(&self.control_path)
            .args(["-o", "ControlMaster=no", "-o", "BatchMode=yes"])
            .args(["-p", &self.port.to_string()])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.master.is_some() {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        self.ensure_open()?;
        debug!("{}: {command}", self.host);
        let output = self
            .control_command()
            .arg(self.destination())
            .arg(command)
            .output()
            .await?;

        command_output(output.status.code(), &output.stdout, &output.stderr)
    }

    async fn list_dir(&mut self, dir: &str) -> Result<Vec<String>, SessionError> {
        let command = format!("ls -1 -- {}", shell_quote(dir));
        let output = self.exec(&command).await?.check(&command)?;
        Ok(parse_listing(&output.stdout))
    }

    async fn digest(&mut self, path: &str) -> Result<String, SessionError> {
        let command = format!("sha256sum -- {}", shell_quote(path));
        let output = self.exec(&command).await?.check(&command)?;
        parse_sha256sum(&output.stdout).ok_or_else(|| SessionError::UnexpectedOutput {
            command,
            output: output.stdout,
        })
    }

    async fn fetch(&mut self, remote: &str, local: &Path) -> Result<u64, SessionError> {
        self.ensure_open()?;
        debug!("Downloading {remote}");

        let command = format!("cat -- {}", shell_quote(remote));
        let mut child = self
            .control_command()
            .arg(self.destination())
            .arg(&command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("ssh stdout not captured"))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("ssh stderr not captured"))?;

        let mut file = tokio::fs::File::create(local).await?;
        let (copied, stderr) = tokio::join!(tokio::io::copy(&mut stdout, &mut file), async {
            let mut stderr = String::new();
            let _ = stderr_pipe.read_to_string(&mut stderr).await;
            stderr
        });
        let bytes = copied?;
        file.sync_all().await?;

        let status = child.wait().await?;
        if status.code() == Some(SSH_CONNECTION_FAILED) {
            return Err(SessionError::Disconnected(stderr.trim().to_string()));
        }
        if !status.success() {
            return Err(SessionError::CommandFailed {
                command,
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(bytes)
    }

    async fn remove_contents(&mut self, dir: &str) -> Result<(), SessionError> {
        // Quote the directory but leave the glob to the remote shell
        let command = format!("rm -rf -- {}/*", shell_quote(dir.trim_end_matches('/')));
        self.exec(&command).await?.check(&command)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let Some(mut master) = self.master.take() else {
            return Ok(());
        };

        let exit = self
            .control_command()
            .args(["-O", "exit"])
            .arg(self.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !matches!(exit, Ok(status) if status.success()) {
            debug!("Master for {} did not exit cleanly, killing it", self.host);
            master.child.start_kill()?;
        }
        master.child.wait().await?;
        drop(master.control_dir);
        debug!("Closed session to {}", self.host);
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // Not closed explicitly (e.g. the owning future was cancelled). Killing
        // the master drops the connection; the socket goes with its directory.
        if let Some(mut master) = self.master.take() {
            debug!("Killing unclosed master for {}", self.host);
            let _ = master.child.start_kill();
        }
    }
}

/// Options shared by every ssh invocation that opens a connection
fn common_options(connect_timeout: Duration) -> Vec<String> {
    [
        "StrictHostKeyChecking=no".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "LogLevel=ERROR".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "ServerAliveInterval=15".to_string(),
        "ServerAliveCountMax=4".to_string(),
    ]
    .into_iter()
    .flat_map(|opt| ["-o".to_string(), opt])
    .collect()
}

/// Map a failed master startup to a [`ConnectError`]
fn classify(host: &str, user: &str, code: Option<i32>, stderr: &str) -> ConnectError {
    let reason = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("ssh exited without output")
        .to_string();

    if code == Some(SSHPASS_BAD_PASSWORD) || stderr.contains("Permission denied") {
        ConnectError::AuthRejected {
            host: host.to_string(),
            user: user.to_string(),
        }
    } else if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        ConnectError::Unreachable {
            host: host.to_string(),
            reason,
        }
    } else {
        ConnectError::Protocol {
            host: host.to_string(),
            reason: format!("exit status {}: {reason}", code.unwrap_or(-1)),
        }
    }
}

/// Result of a command run over the master connection
fn command_output(
    status: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<CommandOutput, SessionError> {
    let stderr = String::from_utf8_lossy(stderr).to_string();
    if status == Some(SSH_CONNECTION_FAILED) {
        return Err(SessionError::Disconnected(stderr.trim().to_string()));
    }
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(stdout).to_string(),
        stderr,
        status: status.unwrap_or(-1),
    })
}

/// File names from `ls -1` output
fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Digest from `sha256sum` output (`<hex>  <path>`).
///
/// `sha256sum` prefixes the line with `\` when the file name needed escaping.
fn parse_sha256sum(stdout: &str) -> Option<String> {
    let token = stdout.split_whitespace().next()?;
    let hex = token.strip_prefix('\\').unwrap_or(token);
    (hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit())).then(|| hex.to_string())
}
