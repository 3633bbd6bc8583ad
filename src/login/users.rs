use std::{ffi::CString, path::PathBuf};

use anyhow::{Context, Result};
use nix::unistd::{Gid, Uid, User, getgrouplist};

use crate::error::LoginError;

/// OS account of the authenticated user
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub username: String,
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl Identity {
    pub fn as_user_id(&self) -> UserID {
        UserID {
            uid: self.uid,
            gid: self.gid,
            groups: self.groups.clone(),
        }
    }
}

/// Credential a child process is started with
#[derive(Debug, Clone, PartialEq)]
pub struct UserID {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

pub trait UserInfoProvider {
    fn query(&self, name: &str) -> Result<Identity>;
}

/// Account lookup through the system databases (passwd and group)
pub struct SystemUsers;

impl UserInfoProvider for SystemUsers {
    fn query(&self, name: &str) -> Result<Identity> {
        // Shell comes from the account database, never from the environment
        let user = User::from_name(name)
            .context("Failed to query the account database")?
            .ok_or_else(|| LoginError::Identity(name.to_string()))?;

        let c_name = CString::new(name).map_err(|_| LoginError::Identity(name.to_string()))?;
        let groups = getgrouplist(&c_name, user.gid)
            .context(format!("Failed to list groups of {name}"))?;

        Ok(Identity {
            username: user.name,
            uid: user.uid,
            gid: user.gid,
            groups,
            home: user.dir,
            shell: user.shell,
        })
    }
}
