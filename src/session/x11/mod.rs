pub mod auth;

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use super::{
    DesktopDescriptor, SessionType, SessionTypeEnv,
    command::{Wrappers, assemble},
};
use crate::{
    environment::prelude::*,
    login::context::LoginContext,
    subprocess::{ManagedProcess, supervisor::Registrar},
    utils::config,
};
use auth::{AuthorityFile, XAuthority};

/// Displays probed for a free slot
pub const DISPLAY_COUNT: u8 = 32;

const READY_POLLS: u32 = 50;
const READY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub server: PathBuf,
    pub xauth: PathBuf,
    pub mcookie: PathBuf,
    /// Where servers leave their `.X<n>-lock` files
    pub lock_dir: PathBuf,
    pub socket_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: PathBuf::from("/usr/bin/Xorg"),
            xauth: PathBuf::from("/usr/bin/xauth"),
            mcookie: PathBuf::from("/usr/bin/mcookie"),
            lock_dir: PathBuf::from("/tmp"),
            socket_dir: PathBuf::from("/tmp/.X11-unix"),
        }
    }
}

define_env!("DISPLAY", pub Display(u8));

impl Display {
    /// First display without a lock file.
    /// Falls back to 0 when every slot is taken.
    pub fn allocate(lock_dir: &Path) -> Self {
        let free = (0..DISPLAY_COUNT).find(|n| !lock_dir.join(format!(".X{n}-lock")).exists());

        match free {
            Some(number) => Self(number),
            None => {
                warn!("All {DISPLAY_COUNT} displays are locked, falling back to :0");
                Self(0)
            }
        }
    }

    pub fn name(&self) -> String {
        format!(":{}", self.0)
    }

    pub fn socket(&self, socket_dir: &Path) -> PathBuf {
        socket_dir.join(format!("X{}", self.0))
    }
}

impl EnvParser for Display {
    fn serialize(&self) -> OsString {
        self.name().into()
    }
}

/// Polls for the server socket. Returns whether it showed up in time.
async fn await_ready(socket: &Path) -> bool {
    for _ in 0..READY_POLLS {
        if socket.exists() {
            return true;
        }
        tokio::time::sleep(READY_INTERVAL).await;
    }

    socket.exists()
}

fn start_server(
    display: &Display,
    context: &LoginContext,
    config: &config::Config,
    env: &Env,
) -> Result<ManagedProcess> {
    let mut command = context.command(&config.x11.server, env);
    command
        .arg(format!("vt{}", config.tty))
        .arg(display.name())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    ManagedProcess::spawn(command, context.orchestrator_credential())
        .context("Failed to start the display server")
}

pub async fn run(
    desktop: &DesktopDescriptor,
    context: &LoginContext,
    config: &config::Config,
    registrar: &Registrar,
) -> Result<Option<ExitStatus>> {
    let display = Display::allocate(&config.x11.lock_dir);
    let authority = XAuthority::in_runtime_dir(context);
    let display_name = display.name();
    info!("Using display {}", display_name);

    let env = context.env.clone().set((
        SessionTypeEnv::from(SessionType::X11),
        authority.clone(),
        display.clone(),
    ));

    let authority_file =
        AuthorityFile::provision(&authority, &display, context, &config.x11, &env).await?;
    let session = assemble(desktop, &context.identity.home, Wrappers::from_config(config))?;

    let server = start_server(&display, context, config, &env)?;
    registrar.register(&server);

    if !await_ready(&display.socket(&config.x11.socket_dir)).await {
        warn!("Display server socket did not appear, starting the session anyway");
    }

    info!("Starting {}", session.line());
    let mut command = context.command(&session.program, &env);
    command
        .args(&session.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let process = match ManagedProcess::spawn(command, context.user_credential()) {
        Ok(process) => process,
        Err(e) => {
            server.stop().await;
            return Err(e.context("Failed to start the session"));
        }
    };
    registrar.register(&process);

    let status = process.wait().await;
    info!("{} finished with {status:?}", session.line());

    server.stop().await;
    info!("Interrupted display server");

    authority_file.remove()?;
    Ok(status)
}
