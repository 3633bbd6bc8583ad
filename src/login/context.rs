use std::{
    ffi::OsStr,
    fs::DirBuilder,
    io,
    os::unix::fs::{DirBuilderExt, chown},
    path::{Path, PathBuf},
};

use anyhow::Result;
use nix::unistd::{Gid, Uid, getegid, geteuid, getgroups, setfsgid, setfsuid, setgroups};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    environment::{self, EnvRecipient, prelude::*},
    error::LoginError,
    login::users::{Identity, UserID},
    subprocess::Credential,
};

define_env!("HOME", pub Home(PathBuf));
env_parser_raw!(Home);

define_env!("PWD", pub WorkingDir(PathBuf));
env_parser_raw!(WorkingDir);

define_env!("USER", pub UserName(String));
env_parser_auto!(UserName);

define_env!("LOGNAME", pub LogName(String));
env_parser_auto!(LogName);

define_env!("XDG_CONFIG_HOME", pub ConfigHome(PathBuf));
env_parser_raw!(ConfigHome);

define_env!("XDG_RUNTIME_DIR", pub RuntimeDir(PathBuf));
env_parser_raw!(RuntimeDir);

define_env!("XDG_SEAT", pub Seat(String));
env_parser_auto!(Seat);

impl Default for Seat {
    fn default() -> Self {
        // man sd-login says that seat0 always exists
        Self("seat0".into())
    }
}

define_env!("XDG_SESSION_CLASS", pub SessionClass(String));
env_parser_auto!(SessionClass);

impl Default for SessionClass {
    fn default() -> Self {
        Self("user".into())
    }
}

define_env!("SHELL", pub Shell(PathBuf));
env_parser_raw!(Shell);

define_env!("LANG", pub Lang(String));
env_parser_auto!(Lang);

/// Variables every session gets, regardless of what the backend says
pub fn fixed_vars(identity: &Identity, runtime_dir: &Path, lang: &str) -> impl EnvContainer {
    (
        Home(identity.home.clone()),
        WorkingDir(identity.home.clone()),
        UserName(identity.username.clone()),
        LogName(identity.username.clone()),
        ConfigHome(identity.home.join(".config")),
        RuntimeDir(runtime_dir.to_path_buf()),
        Seat::default(),
        SessionClass::default(),
        Shell(identity.shell.clone()),
        Lang(lang.to_string()),
    )
}

fn prepare_runtime_dir(path: &Path, identity: &Identity) -> Result<()> {
    if !path.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .map_err(|e| LoginError::resource(format!("creating {}", path.display()), e))?;
    }

    chown(path, Some(identity.uid.as_raw()), Some(identity.gid.as_raw()))
        .map_err(|e| LoginError::resource(format!("chown of {}", path.display()), e))?;

    Ok(())
}

fn verify_switch(what: &str, switched: bool) -> Result<()> {
    if switched {
        Ok(())
    } else {
        Err(LoginError::resource(what, io::Error::from(io::ErrorKind::PermissionDenied)).into())
    }
}

/// Moves file-system permission checks of the calling thread to the user.
///
/// Real and effective ids stay untouched, so the orchestrator can still
/// start the display server with its own identity. Returns that identity
/// for restoring in children, or `None` if nothing had to change.
fn drop_fs_privileges(identity: &Identity) -> Result<Option<UserID>> {
    let euid = geteuid();
    let egid = getegid();

    if euid == identity.uid && egid == identity.gid {
        debug!("Already running as {}, no privileges to drop", identity.username);
        return Ok(None);
    }

    let saved_groups = getgroups()
        .map_err(|e| LoginError::resource("reading supplementary groups", e))?;

    // setfsuid never fails, an invalid id only reports the current one
    setfsuid(identity.uid);
    verify_switch(
        "switching file-system uid",
        setfsuid(Uid::from_raw(u32::MAX)) == identity.uid,
    )?;

    setfsgid(identity.gid);
    verify_switch(
        "switching file-system gid",
        setfsgid(Gid::from_raw(u32::MAX)) == identity.gid,
    )?;

    setgroups(&identity.groups)
        .map_err(|e| LoginError::resource("setting supplementary groups", e))?;

    debug!("File-system identity switched to {}", identity.username);
    Ok(Some(UserID {
        uid: euid,
        gid: egid,
        groups: saved_groups,
    }))
}

/// Execution context of an authenticated user
pub struct LoginContext {
    pub identity: Identity,
    pub env: Env,
    pub runtime_dir: PathBuf,

    orchestrator: Credential,
}

impl LoginContext {
    /// Builds the session environment and switches this thread to the user.
    ///
    /// The environment layers, lowest first: what this process inherited,
    /// the backend's pairs, the fixed session variables.
    ///
    /// Runs, in order: runtime dir creation, chown, file-system privilege drop
    /// and chdir to home. Any failure aborts the login.
    pub fn establish(
        identity: Identity,
        backend_env: Env,
        runtime_dir_base: &Path,
        lang: &str,
    ) -> Result<Self> {
        let runtime_dir = runtime_dir_base.join(identity.uid.to_string());
        let env = environment::current()
            .set(backend_env)
            .set(fixed_vars(&identity, &runtime_dir, lang));

        prepare_runtime_dir(&runtime_dir, &identity)?;

        let restore = drop_fs_privileges(&identity)?;

        std::env::set_current_dir(&identity.home).map_err(|e| {
            LoginError::resource(format!("changing directory to {}", identity.home.display()), e)
        })?;

        info!("Login context ready for {}", identity.username);
        Ok(Self {
            identity,
            env,
            runtime_dir,
            orchestrator: Credential::Orchestrator(restore),
        })
    }

    pub fn override_lang(&mut self, lang: &str) {
        self.env = self.env.clone().set(Lang(lang.to_string()));
    }

    pub fn user_credential(&self) -> Credential {
        Credential::User(self.identity.as_user_id())
    }

    pub fn orchestrator_credential(&self) -> Credential {
        self.orchestrator.clone()
    }

    /// Command with exactly `env` as its environment
    pub fn command(&self, program: impl AsRef<OsStr>, env: &Env) -> Command {
        let mut command = Command::new(program);
        command.set_env(env.clone());
        command
    }
}
