pub mod command;
pub mod metadata;
pub mod wayland;
pub mod x11;

use std::{ffi::OsString, process::ExitStatus};

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::{
    environment::prelude::*, login::context::LoginContext, subprocess::supervisor::Registrar,
    utils::config::Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    X11,
    Wayland,
}

impl SessionType {
    // This should equal XDG_SESSION_TYPE
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::X11 => "x11",
            Self::Wayland => "wayland",
        }
    }
}

define_env!("XDG_SESSION_TYPE", pub SessionTypeEnv(SessionType));

impl EnvParser for SessionTypeEnv {
    fn serialize(&self) -> OsString {
        self.0.tag().into()
    }
}

impl From<SessionType> for SessionTypeEnv {
    fn from(value: SessionType) -> Self {
        Self(value)
    }
}

fn default_wrappable() -> bool {
    true
}

/// A launchable desktop
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DesktopDescriptor {
    /// Filled from the config key or the .desktop file name
    #[serde(skip)]
    pub name: String,
    pub session_type: SessionType,

    /// Full command line, startup wrappers may be prepended
    pub exec: Option<String>,
    /// Used only without `exec`, never wrapped
    pub path: Option<String>,

    #[serde(default = "default_wrappable")]
    pub wrappable: bool,
}

/// Runs the desktop to completion and returns the session's exit status
pub async fn start(
    desktop: &DesktopDescriptor,
    context: &LoginContext,
    config: &Config,
    registrar: &Registrar,
) -> Result<Option<ExitStatus>> {
    info!(
        "Starting {} session {:?} for {}",
        desktop.session_type.tag(),
        desktop.name,
        context.identity.username
    );

    match desktop.session_type {
        SessionType::Wayland => wayland::run(desktop, context, config, registrar).await,
        SessionType::X11 => x11::run(desktop, context, config, registrar).await,
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::*;

    #[test]
    fn session_type_variable_uses_tag() {
        let wayland = Env::empty().set(SessionTypeEnv::from(SessionType::Wayland));
        let x11 = Env::empty().set(SessionTypeEnv::from(SessionType::X11));

        assert_eq!(wayland.get("XDG_SESSION_TYPE"), Some(OsStr::new("wayland")));
        assert_eq!(x11.get("XDG_SESSION_TYPE"), Some(OsStr::new("x11")));
    }

    #[test]
    fn desktop_defaults_to_wrappable() {
        let desktop: DesktopDescriptor =
            toml::from_str("session-type = \"wayland\"\nexec = \"sway\"").unwrap();

        assert_eq!(desktop.session_type, SessionType::Wayland);
        assert!(desktop.wrappable);
        assert_eq!(desktop.path, None);
    }
}
