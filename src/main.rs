mod environment;
mod error;
mod login;
mod session;
mod subprocess;
mod utils;

use std::{path::Path, process::ExitCode, sync::Mutex};

use anyhow::{Context, Result, bail};
use pico_args::Arguments;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use login::{Outcome, login, pam::PamAuthenticator, users::SystemUsers};
use session::metadata::DesktopCatalog;
use utils::config::Config;

pub const APP_NAME: &str = "vtlogin";
const CONFIG_PATH: &str = "/etc/vtlogin/config.toml";
const INTERRUPTED_EXIT_CODE: u8 = 1;

const HELP: &str = "\
Usage: vtlogin [OPTIONS] [DESKTOP]

Authenticates a user on the terminal and starts an X11 or Wayland desktop.
DESKTOP is used unless the user picks one in ~/.config/vtlogin/config.toml.

Options:
  -c, --config PATH   Config file [default: /etc/vtlogin/config.toml]
  -t, --tty N         Virtual terminal for the display server
  -u, --user NAME     Default user
      --autologin     Log the default user in without a password
      --list          List known desktops and exit
  -h, --help          Print help
  -V, --version       Print version
";

enum Action {
    Help,
    Version,
    List(Config),
    Login(Config, Option<String>),
}

fn parse_args(mut args: Arguments) -> Result<Action> {
    if args.contains(["-h", "--help"]) {
        return Ok(Action::Help);
    }
    if args.contains(["-V", "--version"]) {
        return Ok(Action::Version);
    }

    let mut config = Config::from_args(&mut args, CONFIG_PATH)?;

    if let Some(tty) = args.opt_value_from_str(["-t", "--tty"])? {
        config.tty = tty;
    }
    if let Some(user) = args.opt_value_from_str(["-u", "--user"])? {
        config.default_user = Some(user);
    }
    if args.contains("--autologin") {
        config.autologin = true;
    }
    let list = args.contains("--list");
    let desktop: Option<String> = args.opt_free_from_str()?;

    let rest = args.finish();
    if !rest.is_empty() {
        bail!("Unexpected arguments: {rest:?}");
    }

    config.validate()?;

    if list {
        Ok(Action::List(config))
    } else {
        Ok(Action::Login(config, desktop))
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}=info")));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_file {
        None => builder.with_writer(std::io::stderr).init(),
        Some(path) => {
            let (file, _) = fs_err::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context("Failed to open log file")?
                .into_parts();

            builder.with_writer(Mutex::new(file)).with_ansi(false).init()
        }
    }

    Ok(())
}

fn list(config: &Config) {
    for (name, desktop) in DesktopCatalog::new(&config.desktops).all() {
        let command = desktop.exec.or(desktop.path).unwrap_or_default();
        println!("[{name}] {}: {command}", desktop.session_type.tag());
    }
}

async fn run(config: Config, desktop: Option<String>) -> Result<ExitCode> {
    let desktops = DesktopCatalog::new(&config.desktops);
    let fallback = desktop.or_else(|| config.default_desktop.clone());

    let outcome = login(
        &PamAuthenticator::new(APP_NAME),
        &SystemUsers,
        &desktops,
        fallback.as_deref(),
        &config,
    )
    .await?;

    Ok(match outcome {
        Outcome::Finished(status) => {
            info!("Session exited with {status:?}");
            ExitCode::SUCCESS
        }
        Outcome::Interrupted => ExitCode::from(INTERRUPTED_EXIT_CODE),
    })
}

// Single threaded: the file-system identity switch only applies to the calling thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let action = match parse_args(Arguments::from_env()) {
        Ok(action) => action,
        Err(e) => {
            eprintln!("{APP_NAME}: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let (config, desktop) = match action {
        Action::Help => {
            print!("{HELP}");
            return ExitCode::SUCCESS;
        }
        Action::Version => {
            println!("{APP_NAME} {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Action::List(config) => {
            list(&config);
            return ExitCode::SUCCESS;
        }
        Action::Login(config, desktop) => (config, desktop),
    };

    if let Err(e) = init_logging(config.log_file.as_deref()) {
        eprintln!("{APP_NAME}: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(config, desktop).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
