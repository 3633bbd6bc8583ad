use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{
    environment::Env,
    login::{
        pam::PamDisplay,
        tty::{AutologinDisplay, TerminalDisplay},
    },
    utils::config::Config,
};

/// What the gateway asks the backend to authenticate
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequest {
    pub user: Option<String>,
    pub tty: u8,
    pub autologin: bool,
}

impl AuthRequest {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user: config.default_user.clone(),
            tty: config.tty,
            autologin: config.autologin,
        }
    }
}

/// Pluggable authentication backend.
///
/// `begin` runs the whole conversation and returns only once a session
/// is open on the backend side.
pub trait Authenticator {
    type Transaction: Transaction;

    fn begin(
        &self,
        request: &AuthRequest,
        display: impl PamDisplay + 'static,
    ) -> Result<Self::Transaction>;
}

/// An open backend session.
///
/// Dropping a transaction without calling `close` must still release it.
pub trait Transaction {
    fn username(&mut self) -> Result<String>;
    fn env(&mut self) -> Result<Env>;
    fn close(self) -> Result<()>;
}

pub struct Authenticated<T: Transaction> {
    pub username: String,
    pub transaction: T,
}

pub fn authenticate<A: Authenticator>(
    backend: &A,
    request: &AuthRequest,
) -> Result<Authenticated<A::Transaction>> {
    let transaction = if request.autologin {
        debug!("Autologin enabled, skipping interactive conversation");
        backend.begin(request, AutologinDisplay)
    } else {
        backend.begin(request, TerminalDisplay::new(request.user.clone()))
    };
    let mut transaction = transaction.context("Authentication failed")?;

    let username = match transaction.username() {
        Ok(username) => username,
        Err(e) => {
            if let Err(close_error) = transaction.close() {
                warn!("Failed to close the login session: {close_error:#}");
            }
            return Err(e.context("Backend did not report the authenticated user"));
        }
    };

    info!("Authenticated {username}");
    Ok(Authenticated {
        username,
        transaction,
    })
}
