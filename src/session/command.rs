use std::path::Path;

use anyhow::{Result, anyhow};

use super::{DesktopDescriptor, SessionType};
use crate::utils::config::Config;

/// Startup wrappers that may be put in front of a session command
#[derive(Debug, Clone, Copy, Default)]
pub struct Wrappers {
    pub xinitrc: bool,
    pub dbus_launch: bool,
}

impl Wrappers {
    pub fn from_config(config: &Config) -> Self {
        Self {
            xinitrc: config.xinitrc_launch,
            dbus_launch: config.dbus_launch,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SessionCommand {
    pub fn line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.trim().is_empty())
}

/// Builds the command line of a desktop.
///
/// `home` must only be inspected after the file-system privilege drop.
pub fn assemble(
    desktop: &DesktopDescriptor,
    home: &Path,
    wrappers: Wrappers,
) -> Result<SessionCommand> {
    let (mut line, mut wrappable) = match (non_empty(&desktop.exec), non_empty(&desktop.path)) {
        (Some(exec), _) => (exec.to_string(), desktop.wrappable),
        (None, Some(path)) => (path.to_string(), false),
        (None, None) => return Err(anyhow!("Desktop {:?} has no command", desktop.name)),
    };

    if desktop.session_type == SessionType::X11
        && wrappers.xinitrc
        && wrappable
        && !line.contains(".xinitrc")
    {
        let script = home.join(".xinitrc");
        if script.exists() {
            line = format!("{} {line}", script.display());
            // the script decides how to start the rest
            wrappable = false;
        }
    }

    if wrappers.dbus_launch && wrappable && !line.contains("dbus-launch") {
        line = format!("dbus-launch {line}");
    }

    let mut words = line.split_whitespace().map(String::from);
    let program = words
        .next()
        .ok_or(anyhow!("Desktop {:?} has no command", desktop.name))?;

    Ok(SessionCommand {
        program,
        args: words.collect(),
    })
}
