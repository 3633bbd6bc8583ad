use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tracing::info;

use super::{
    DesktopDescriptor, SessionType, SessionTypeEnv,
    command::{Wrappers, assemble},
};
use crate::{
    login::context::LoginContext,
    subprocess::{ManagedProcess, supervisor::Registrar},
    utils::config::Config,
};

pub async fn run(
    desktop: &DesktopDescriptor,
    context: &LoginContext,
    config: &Config,
    registrar: &Registrar,
) -> Result<Option<ExitStatus>> {
    let env = context
        .env
        .clone()
        .set(SessionTypeEnv::from(SessionType::Wayland));

    let session = assemble(desktop, &context.identity.home, Wrappers::from_config(config))?;
    info!("Starting {}", session.line());

    let mut command = context.command(&session.program, &env);
    command
        .args(&session.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let process = ManagedProcess::spawn(command, context.user_credential())
        .context("Failed to start the compositor")?;
    registrar.register(&process);

    let status = process.wait().await;
    info!("{} finished with {status:?}", session.line());

    Ok(status)
}
