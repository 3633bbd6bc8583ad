use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use freedesktop_file_parser::{self as parser, EntryType};
use fs_err::read_dir;
use tracing::debug;

use super::{DesktopDescriptor, SessionType};
use crate::utils::config::UserPreferences;

pub const WAYLAND_SESSIONS: &str = "/usr/share/wayland-sessions";
pub const X11_SESSIONS: &str = "/usr/share/xsessions";

/// Name of a desktop defined inline in the user's preferences
pub const USER_DESKTOP: &str = "user";

fn parse_desktop_file(
    text: &str,
    name: &str,
    session_type: SessionType,
) -> Result<DesktopDescriptor> {
    let parsed = parser::parse(text)?.entry;

    let app = match parsed.entry_type {
        EntryType::Application(app) => app,
        _ => bail!("Not a valid entry type for a session"),
    };

    let exec = app
        .exec
        .ok_or(anyhow!("Session does not define an executable"))?;
    let path = exec.split_whitespace().next().map(String::from);

    Ok(DesktopDescriptor {
        name: name.to_string(),
        session_type,
        exec: Some(exec),
        path,
        wrappable: true,
    })
}

/// Known desktops: config entries first, then freedesktop session files
pub struct DesktopCatalog {
    configured: HashMap<String, DesktopDescriptor>,
    sources: Vec<(SessionType, PathBuf)>,
}

impl DesktopCatalog {
    pub fn new(configured: &HashMap<String, DesktopDescriptor>) -> Self {
        Self::with_sources(
            configured,
            vec![
                (SessionType::Wayland, PathBuf::from(WAYLAND_SESSIONS)),
                (SessionType::X11, PathBuf::from(X11_SESSIONS)),
            ],
        )
    }

    pub fn with_sources(
        configured: &HashMap<String, DesktopDescriptor>,
        sources: Vec<(SessionType, PathBuf)>,
    ) -> Self {
        let configured = configured
            .iter()
            .map(|(name, desktop)| {
                let desktop = DesktopDescriptor {
                    name: name.clone(),
                    ..desktop.clone()
                };
                (name.clone(), desktop)
            })
            .collect();

        Self {
            configured,
            sources,
        }
    }

    pub fn lookup(&self, name: &str) -> Result<DesktopDescriptor> {
        if let Some(desktop) = self.configured.get(name) {
            return Ok(desktop.clone());
        }

        for (session_type, dir) in &self.sources {
            let path = dir.join(format!("{name}.desktop"));

            let text = match fs_err::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            return parse_desktop_file(&text, name, *session_type)
                .context(format!("Session definition {} is incorrect", path.display()));
        }

        bail!("Desktop {name:?} is not defined")
    }

    /// Desktop to start: the user's own choice first, then `fallback`
    pub fn select(
        &self,
        preferences: &UserPreferences,
        fallback: Option<&str>,
    ) -> Result<DesktopDescriptor> {
        if let Some(session) = &preferences.session {
            return Ok(DesktopDescriptor {
                name: USER_DESKTOP.to_string(),
                ..session.clone()
            });
        }

        let name = preferences
            .desktop
            .as_deref()
            .or(fallback)
            .ok_or(anyhow!(
                "No desktop selected.\nUse --list to list available desktops."
            ))?;

        self.lookup(name)
    }

    /// Every desktop that could be looked up.
    ///
    /// Entries with invalid metadata are silently discarded.
    pub fn all(&self) -> BTreeMap<String, DesktopDescriptor> {
        let mut desktops = BTreeMap::new();

        // later sources lose to earlier ones, config wins over everything
        for (session_type, dir) in self.sources.iter().rev() {
            desktops.extend(scan(dir, *session_type));
        }
        desktops.extend(self.configured.clone());

        desktops
    }
}

fn scan(dir: &Path, session_type: SessionType) -> Vec<(String, DesktopDescriptor)> {
    let entries = match read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Skipping {}: {e}", dir.display());
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?.strip_suffix(".desktop")?.to_string();
            let text = fs_err::read_to_string(&path).ok()?;

            let desktop = parse_desktop_file(&text, &name, session_type).ok()?;
            Some((name, desktop))
        })
        .collect()
}
