use std::{io::ErrorKind, path::PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use super::{Config, Display};
use crate::{
    environment::prelude::*, error::LoginError, login::context::LoginContext, subprocess::capture,
};

/// File name of the authority, relative to the runtime directory
pub const AUTHORITY_FILE: &str = ".vtlogin-xauth";

define_env!("XAUTHORITY", pub XAuthority(PathBuf));
env_parser_raw!(XAuthority);

impl XAuthority {
    pub fn in_runtime_dir(context: &LoginContext) -> Self {
        Self(context.runtime_dir.join(AUTHORITY_FILE))
    }
}

/// A provisioned authority file, removed again on drop
#[derive(Debug)]
pub struct AuthorityFile {
    path: PathBuf,
    removed: bool,
}

impl AuthorityFile {
    /// Creates a fresh authority file holding a new cookie for `display`.
    ///
    /// Has to run after the file-system privilege drop, so the file is
    /// created as the user.
    pub async fn provision(
        authority: &XAuthority,
        display: &Display,
        context: &LoginContext,
        config: &Config,
        env: &Env,
    ) -> Result<Self> {
        let path = authority.to_path_buf();

        match fs_err::remove_file(&path) {
            Ok(()) => debug!("Removed stale {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(LoginError::resource("removing stale authority", e).into()),
        }

        fs_err::File::create(&path)
            .map_err(|e| LoginError::resource("creating authority", e))?;
        let file = Self {
            path,
            removed: false,
        };

        let cookie = capture(
            context.command(&config.mcookie, env),
            context.orchestrator_credential(),
        )
        .await
        .context("Failed to generate cookie")?;

        if cookie.is_empty() {
            bail!(LoginError::external(config.mcookie.display(), "produced no cookie"));
        }

        let mut xauth = context.command(&config.xauth, env);
        xauth.args(["add", &display.name(), ".", &cookie]);
        capture(xauth, context.user_credential())
            .await
            .context("Failed to register cookie")?;

        let display_name = display.name();
        info!("Authority for {} written to {}", display_name, file.path.display());
        Ok(file)
    }

    pub fn remove(mut self) -> Result<()> {
        self.removed = true;
        fs_err::remove_file(&self.path)
            .map_err(|e| LoginError::resource("removing authority", e))?;

        info!("Cleaned up authority");
        Ok(())
    }
}

impl Drop for AuthorityFile {
    fn drop(&mut self) {
        if !self.removed
            && let Err(e) = fs_err::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove authority: {e}");
        }
    }
}
