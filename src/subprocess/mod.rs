pub mod supervisor;

use std::process::ExitStatus;

use anyhow::Result;
use nix::unistd::{getgid, getuid, setfsgid, setfsuid, setgid, setgroups, setuid};
use rustix::{
    io::Errno,
    process::{self, Pid, Signal},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::watch,
};
use tracing::{debug, warn};

use crate::{error::LoginError, login::users::UserID};

/// Identity a child process is started with
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    /// Keep the orchestrator's identity.
    /// Holds the file-system identity to restore if it was dropped.
    Orchestrator(Option<UserID>),
    /// Fully switch to the user
    User(UserID),
}

impl Credential {
    /// Installs the identity change and parent-death signal into `command`.
    ///
    /// Runs in the forked child right before exec.
    pub fn apply(&self, command: &mut Command) {
        let credential = self.clone();

        unsafe {
            command.pre_exec(move || {
                process::set_parent_process_death_signal(Some(Signal::TERM))?;

                match &credential {
                    Credential::Orchestrator(None) => {}
                    Credential::Orchestrator(Some(restore)) => {
                        setfsuid(restore.uid);
                        setfsgid(restore.gid);
                        setgroups(&restore.groups)?;
                    }
                    Credential::User(user) => {
                        if getuid() != user.uid || getgid() != user.gid {
                            setgroups(&user.groups)?;
                            setgid(user.gid)?;
                            setuid(user.uid)?;
                        }
                    }
                }

                Ok(())
            });
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Credential::Orchestrator(_) => "orchestrator".to_string(),
            Credential::User(user) => format!("uid {}", user.uid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessState {
    Running,
    Exited(Option<ExitStatus>),
}

/// Shared handle to a spawned child.
///
/// The child itself is owned by a reaper task, clones only observe its state
/// and can signal it, so the foreground flow and the supervisor act on the
/// same process.
#[derive(Clone)]
pub struct ManagedProcess {
    name: String,
    pid: Option<Pid>,
    credential: Credential,
    state: watch::Receiver<ProcessState>,
}

impl ManagedProcess {
    pub fn spawn(mut command: Command, credential: Credential) -> Result<Self> {
        let name = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();

        credential.apply(&mut command);
        let mut child = command
            .spawn()
            .map_err(|e| LoginError::external(&name, format!("failed to spawn: {e}")))?;

        let pid = child.id().and_then(|id| Pid::from_raw(id as i32));
        debug!("Started {name} ({pid:?}) as {}", credential.describe());

        // only set when the caller asked for pipes
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(name.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(name.clone(), stderr));
        }

        let (state_tx, state) = watch::channel(ProcessState::Running);
        let reaper_name = name.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("Failed to wait for {reaper_name}: {e}");
                    None
                }
            };

            debug!("{reaper_name} exited with {status:?}");
            let _ = state_tx.send(ProcessState::Exited(status));
        });

        Ok(Self {
            name,
            pid,
            credential,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow() == ProcessState::Running
    }

    /// Sends SIGINT. Does nothing once the process has exited.
    pub fn interrupt(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        if !self.is_running() {
            return;
        }

        match process::kill_process(pid, Signal::INT) {
            Ok(()) => debug!("Interrupted {}", self.name),
            Err(Errno::SRCH) => {}
            Err(e) => warn!("Failed to interrupt {}: {e}", self.name),
        }
    }

    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut state = self.state.clone();

        match state
            .wait_for(|state| matches!(state, ProcessState::Exited(_)))
            .await
            .as_deref()
        {
            Ok(ProcessState::Exited(status)) => *status,
            _ => None,
        }
    }

    pub async fn stop(&self) -> Option<ExitStatus> {
        self.interrupt();
        self.wait().await
    }
}

/// Sends every line of a child's output stream to the log
async fn forward_output(name: String, stream: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stream).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "vtlogin::child", "{name}: {line}");
    }
}

/// Runs `command` to completion and returns its trimmed standard output
pub async fn capture(mut command: Command, credential: Credential) -> Result<String> {
    let name = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    credential.apply(&mut command);
    let output = command
        .output()
        .await
        .map_err(|e| LoginError::external(&name, format!("failed to run: {e}")))?;

    if !output.status.success() {
        return Err(LoginError::external(&name, output.status).into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
