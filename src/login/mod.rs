pub mod auth;
pub mod context;
pub mod pam;
pub mod tty;
pub mod users;

use std::process::ExitStatus;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    session::{self, metadata::DesktopCatalog},
    subprocess::supervisor::Supervisor,
    utils::config::{Config, UserPreferences},
};
use auth::{AuthRequest, Authenticated, Authenticator, Transaction, authenticate};
use context::LoginContext;
use users::UserInfoProvider;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// The session ended on its own
    Finished(Option<ExitStatus>),
    /// A signal stopped the session
    Interrupted,
}

/// One complete login: authenticate, prepare the user's context,
/// run the desktop and close the backend session again.
///
/// The desktop is picked from the user's preferences, `fallback`
/// names the one to use when they have none.
pub async fn login<A: Authenticator>(
    backend: &A,
    users: &impl UserInfoProvider,
    desktops: &DesktopCatalog,
    fallback: Option<&str>,
    config: &Config,
) -> Result<Outcome> {
    let Authenticated {
        username,
        mut transaction,
    } = authenticate(backend, &AuthRequest::from_config(config))?;

    let outcome = run_session(
        &username,
        &mut transaction,
        users,
        desktops,
        fallback,
        config,
    )
    .await;

    // closed on every path, the outcome error takes precedence
    let closed = transaction
        .close()
        .context("Failed to close the login session");
    let outcome = outcome?;
    closed?;

    info!("Logged out {username}");
    Ok(outcome)
}

async fn run_session(
    username: &str,
    transaction: &mut impl Transaction,
    users: &impl UserInfoProvider,
    desktops: &DesktopCatalog,
    fallback: Option<&str>,
    config: &Config,
) -> Result<Outcome> {
    let identity = users.query(username)?;
    let backend_env = transaction
        .env()
        .context("Failed to read the session environment")?;

    let mut context =
        LoginContext::establish(identity, backend_env, &config.runtime_dir_base, &config.lang)?;

    // read as the user, after the privilege drop
    let preferences = UserPreferences::load(&context.identity.home).unwrap_or_else(|e| {
        warn!("Ignoring user preferences: {e:#}");
        UserPreferences::default()
    });
    if let Some(lang) = &preferences.lang {
        context.override_lang(lang);
    }
    let desktop = desktops.select(&preferences, fallback)?;

    let supervisor = Supervisor::start()?;
    let registrar = supervisor.registrar();

    let finished = tokio::select! {
        biased;
        _ = supervisor.signalled() => None,
        result = session::start(&desktop, &context, config, &registrar) => Some(result),
    };

    match finished {
        None => {
            supervisor.join().await?;
            info!("Session interrupted");
            Ok(Outcome::Interrupted)
        }
        Some(result) => {
            supervisor.stop();
            Ok(Outcome::Finished(result?))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        time::Duration,
    };

    use rustix::process::{Signal, getpid, kill_process};
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        environment::Env,
        error::LoginError,
        login::{
            auth::testing::FakeAuthenticator,
            users::testing::{FakeUsers, current_identity},
        },
        session::{DesktopDescriptor, SessionType, x11},
    };

    struct Fixture {
        root: TempDir,
        cwd: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Self {
                root: TempDir::new().unwrap(),
                cwd: std::env::current_dir().unwrap(),
            };
            for dir in ["home", "run", "bin", "out", "locks", "sockets"] {
                std::fs::create_dir(fixture.path(dir)).unwrap();
            }
            fixture
        }

        fn path(&self, name: &str) -> PathBuf {
            self.root.path().join(name)
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            let path = self.path("bin").join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn out(&self, name: &str) -> String {
            std::fs::read_to_string(self.path("out").join(name))
                .unwrap()
                .trim()
                .to_string()
        }

        fn users(&self) -> FakeUsers {
            FakeUsers(current_identity(&self.path("home")))
        }

        fn backend(&self) -> FakeAuthenticator {
            let username = self.users().0.username;
            FakeAuthenticator::new(&username, "").with_env(Env::from_pairs([
                b"HOME=/not/the/home".as_slice(),
                b"MAIL=/var/mail/test".as_slice(),
            ]))
        }

        fn config(&self) -> Config {
            Config {
                default_user: Some(self.users().0.username),
                autologin: true,
                dbus_launch: false,
                runtime_dir_base: self.path("run"),
                x11: x11::Config {
                    server: self.script(
                        "Xorg",
                        &format!(
                            r#"echo "$@" > {out}/server-args
touch {sockets}/X${{2#:}}
trap 'echo stopped > {out}/server-stopped; exit 0' INT
while true; do sleep 0.05; done"#,
                            out = self.path("out").display(),
                            sockets = self.path("sockets").display(),
                        ),
                    ),
                    xauth: self.script(
                        "xauth",
                        &format!(
                            r#"echo "$@" > {}/xauth-args
test -f "$XAUTHORITY""#,
                            self.path("out").display()
                        ),
                    ),
                    mcookie: self.script("mcookie", "echo 0123abcd"),
                    lock_dir: self.path("locks"),
                    socket_dir: self.path("sockets"),
                },
                ..Config::default()
            }
        }

        fn desktop(&self, session_type: SessionType, body: &str) -> DesktopDescriptor {
            self.named_desktop("test", session_type, body)
        }

        fn named_desktop(
            &self,
            name: &str,
            session_type: SessionType,
            body: &str,
        ) -> DesktopDescriptor {
            DesktopDescriptor {
                name: name.into(),
                session_type,
                exec: Some(self.script(name, body).display().to_string()),
                path: None,
                wrappable: true,
            }
        }

        fn preferences(&self, text: &str) {
            let path = self.path("home").join(UserPreferences::PATH);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, text).unwrap();
        }

        fn authority(&self) -> PathBuf {
            let uid = self.users().0.uid;
            self.path("run")
                .join(uid.to_string())
                .join(x11::auth::AUTHORITY_FILE)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.cwd);
        }
    }

    fn catalog(desktops: &[&DesktopDescriptor]) -> DesktopCatalog {
        let configured: HashMap<_, _> = desktops
            .iter()
            .map(|desktop| (desktop.name.clone(), (*desktop).clone()))
            .collect();

        DesktopCatalog::with_sources(&configured, Vec::new())
    }

    /// Logs in with `desktop` as the only known desktop and the fallback choice
    async fn login_to(
        fixture: &Fixture,
        backend: &FakeAuthenticator,
        desktop: &DesktopDescriptor,
        config: &Config,
    ) -> Result<Outcome> {
        let desktops = catalog(&[desktop]);
        login(backend, &fixture.users(), &desktops, Some(&desktop.name), config).await
    }

    async fn wait_for_file(path: &Path) {
        for _ in 0..500 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never appeared", path.display());
    }

    #[tokio::test]
    #[serial]
    async fn wayland_session_runs_to_completion() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let desktop = fixture.desktop(
            SessionType::Wayland,
            &format!(
                r#"echo "$XDG_SESSION_TYPE $HOME $MAIL $PWD" > {out}/session-env
echo "$PATH" > {out}/session-path
exit 3"#,
                out = fixture.path("out").display()
            ),
        );

        let outcome = login_to(&fixture, &backend, &desktop, &fixture.config())
            .await
            .unwrap();

        let Outcome::Finished(Some(status)) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(status.code(), Some(3));

        let home = fixture.path("home");
        assert_eq!(
            fixture.out("session-env"),
            format!("wayland {0} /var/mail/test {0}", home.display())
        );
        assert_eq!(
            std::env::var_os("PATH").map(|path| path.to_string_lossy().into_owned()),
            Some(fixture.out("session-path"))
        );
        assert_eq!(*backend.closed.borrow(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn x11_session_brings_server_up_and_down() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let desktop = fixture.desktop(
            SessionType::X11,
            &format!(
                r#"echo "$DISPLAY $XAUTHORITY $XDG_SESSION_TYPE" > {}/session-env"#,
                fixture.path("out").display()
            ),
        );

        let outcome = login_to(&fixture, &backend, &desktop, &fixture.config())
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Finished(Some(status)) if status.success()));
        assert_eq!(fixture.out("server-args"), "vt7 :0");
        assert_eq!(fixture.out("xauth-args"), "add :0 . 0123abcd");
        assert_eq!(
            fixture.out("session-env"),
            format!(":0 {} x11", fixture.authority().display())
        );
        assert_eq!(fixture.out("server-stopped"), "stopped");
        assert!(!fixture.authority().exists());
        assert_eq!(*backend.closed.borrow(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn signal_during_x11_session_tears_everything_down() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let started = fixture.path("out").join("session-started");
        let desktop = fixture.desktop(
            SessionType::X11,
            &format!("echo started > {}\nexec sleep 30", started.display()),
        );
        let config = fixture.config();

        let raise = async {
            wait_for_file(&started).await;
            kill_process(getpid(), Signal::TERM).unwrap();
        };

        let (outcome, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(login_to(&fixture, &backend, &desktop, &config), raise)
        })
        .await
        .unwrap();

        assert_eq!(outcome.unwrap(), Outcome::Interrupted);
        assert_eq!(fixture.out("server-stopped"), "stopped");
        assert!(!fixture.authority().exists());
        assert_eq!(*backend.closed.borrow(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn rejected_login_touches_nothing() {
        let fixture = Fixture::new();
        let username = fixture.users().0.username;
        let backend = FakeAuthenticator::new(&username, "secret");
        let desktop = fixture.desktop(SessionType::Wayland, "exit 0");

        let err = login_to(&fixture, &backend, &desktop, &fixture.config())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<LoginError>(),
            Some(LoginError::Authentication(_))
        ));
        assert_eq!(std::fs::read_dir(fixture.path("run")).unwrap().count(), 0);
        assert_eq!(*backend.closed.borrow(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn unknown_account_still_closes_transaction() {
        let fixture = Fixture::new();
        let backend = FakeAuthenticator::new("nobody-in-particular", "");
        let desktop = fixture.desktop(SessionType::Wayland, "exit 0");
        let mut config = fixture.config();
        config.default_user = Some("nobody-in-particular".into());

        let err = login_to(&fixture, &backend, &desktop, &config)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<LoginError>(),
            Some(LoginError::Identity(_))
        ));
        assert_eq!(std::fs::read_dir(fixture.path("run")).unwrap().count(), 0);
        assert_eq!(*backend.closed.borrow(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn failing_session_spawn_stops_server() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let desktop = DesktopDescriptor {
            name: "missing".into(),
            session_type: SessionType::X11,
            exec: Some("/nonexistent/vtlogin-session".into()),
            path: None,
            wrappable: true,
        };

        let err = login_to(&fixture, &backend, &desktop, &fixture.config())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<LoginError>(),
            Some(LoginError::ExternalProcess { .. })
        ));
        assert_eq!(fixture.out("server-stopped"), "stopped");
        assert!(!fixture.authority().exists());
        assert_eq!(*backend.closed.borrow(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn user_preferences_pick_desktop_and_locale() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let out = fixture.path("out");
        let fallback = fixture.desktop(
            SessionType::Wayland,
            &format!("echo fallback > {}/chosen", out.display()),
        );
        let preferred = fixture.named_desktop(
            "preferred",
            SessionType::Wayland,
            &format!(r#"echo "preferred $LANG" > {}/chosen"#, out.display()),
        );
        fixture.preferences("desktop = \"preferred\"\nlang = \"de_DE.UTF-8\"\n");

        let desktops = catalog(&[&fallback, &preferred]);
        let outcome = login(
            &backend,
            &fixture.users(),
            &desktops,
            Some("test"),
            &fixture.config(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, Outcome::Finished(Some(status)) if status.success()));
        assert_eq!(fixture.out("chosen"), "preferred de_DE.UTF-8");
    }

    #[tokio::test]
    #[serial]
    async fn broken_user_preferences_fall_back() {
        let fixture = Fixture::new();
        let backend = fixture.backend();
        let desktop = fixture.desktop(
            SessionType::Wayland,
            &format!(
                r#"echo "$LANG" > {}/chosen"#,
                fixture.path("out").display()
            ),
        );
        fixture.preferences("desktop = [");

        let outcome = login_to(&fixture, &backend, &desktop, &fixture.config())
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Finished(Some(status)) if status.success()));
        assert_eq!(fixture.out("chosen"), Config::default().lang);
    }
}
