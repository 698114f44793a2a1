//! The ssh child process carrying the session.

use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::Error;

/// Options placed after the caller's own; ssh honors the first occurrence of an option, so the
/// caller can still override any of them.
const HARDENING_OPTIONS: &[&str] = &[
    "-oProtocol=2",
    "-oForwardX11=no",
    "-oForwardAgent=no",
    "-oPermitLocalCommand=no",
    "-oClearAllForwardings=yes",
];

/// How to reach the remote sftp subsystem.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub program: String,
    pub host: String,
    pub user: Option<String>,
    /// Extra arguments handed to ssh before anything else, e.g. `-oPort=2222`.
    pub options: Vec<String>,
}

impl SshConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            program: "ssh".to_string(),
            host: host.into(),
            user: None,
            options: vec![],
        }
    }

    /// Arguments passed to [`SshConfig::program`].
    pub fn args(&self) -> Vec<String> {
        let mut args = self.options.clone();
        args.extend(HARDENING_OPTIONS.iter().map(|option| option.to_string()));
        if let Some(user) = &self.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.extend(["-s", "--", self.host.as_str(), "sftp"].map(str::to_string));
        args
    }

    pub(crate) fn spawn(&self) -> Result<SshProcess, Error> {
        tracing::debug!("running {} {:?}", self.program, self.args());
        let child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(SshProcess { child })
    }
}

pub(crate) struct SshProcess {
    child: Child,
}

impl SshProcess {
    pub(crate) fn take_stdio(&mut self) -> Result<(ChildStdout, ChildStdin), Error> {
        match (self.child.stdout.take(), self.child.stdin.take()) {
            (Some(stdout), Some(stdin)) => Ok((stdout, stdin)),
            _ => Err(Error::internal("ssh stdio is not piped")),
        }
    }

    /// Sends SIGTERM and reaps the process.
    pub(crate) async fn terminate(mut self) -> Result<(), Error> {
        if let Some(pid) = self.child.id() {
            let pid = i32::try_from(pid)
                .map_err(|_| Error::internal(format!("ssh pid {pid} out of range")))?;
            if let Err(errno) = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            ) {
                // already gone is fine, it gets reaped below
                tracing::debug!("failed to signal ssh ({pid}): {errno}");
            }
        }
        let status = self.child.wait().await?;
        tracing::debug!("ssh exited with {status}");
        Ok(())
    }
}
