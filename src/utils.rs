pub mod misc {
    pub fn hostname() -> String {
        rustix::system::uname()
            .nodename()
            .to_string_lossy()
            .into_owned()
    }
}


pub mod config {
    use std::{
        collections::HashMap,
        convert::Infallible,
        io::{ErrorKind, Read},
        path::{Path, PathBuf},
    };

    use anyhow::{Context, Result, bail};
    use fs_err::File;
    use pico_args::Arguments;
    use serde::Deserialize;

    use crate::session::{DesktopDescriptor, x11};

    /// Resolved runtime options of one login attempt.
    #[derive(Deserialize, Debug)]
    #[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
    pub struct Config {
        /// Virtual terminal the display server binds to
        pub tty: u8,
        pub lang: String,

        pub default_user: Option<String>,
        pub autologin: bool,
        pub default_desktop: Option<String>,

        /// Prepend ~/.xinitrc to X11 sessions
        pub xinitrc_launch: bool,
        /// Prepend dbus-launch to sessions
        pub dbus_launch: bool,

        pub runtime_dir_base: PathBuf,
        pub log_file: Option<PathBuf>,

        pub x11: x11::Config,
        pub desktops: HashMap<String, DesktopDescriptor>,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                tty: 7,
                lang: "en_US.UTF-8".into(),
                default_user: None,
                autologin: false,
                default_desktop: None,
                xinitrc_launch: false,
                dbus_launch: true,
                runtime_dir_base: PathBuf::from("/run/user"),
                log_file: None,
                x11: x11::Config::default(),
                desktops: HashMap::new(),
            }
        }
    }

    impl Config {
        pub fn from_args(args: &mut Arguments, default_path: &str) -> Result<Self> {
            let config_path = args
                .opt_value_from_os_str::<_, _, Infallible>(["-c", "--config"], |path| {
                    Ok(PathBuf::from(path))
                })?
                .unwrap_or(PathBuf::from(default_path));

            Self::from_file(&config_path).context("Failed to read config")
        }

        fn from_file(path: &Path) -> Result<Self> {
            let mut file = match File::open(path) {
                Err(e) if matches!(e.kind(), ErrorKind::NotFound) => return Ok(Self::default()),
                other => other,
            }?;

            let mut buf = String::new();
            file.read_to_string(&mut buf)?;

            Self::parse(&buf)
        }

        pub fn parse(text: &str) -> Result<Self> {
            toml::from_str(text).context("Invalid config")
        }

        pub fn validate(&self) -> Result<()> {
            if self.autologin && self.default_user.is_none() {
                bail!("autologin is enabled, but default-user is not set");
            }

            Ok(())
        }
    }

    /// Per-user choices, read from the home directory after login
    #[derive(Deserialize, Debug, Default, PartialEq)]
    #[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
    pub struct UserPreferences {
        /// Name of a known desktop
        pub desktop: Option<String>,
        /// Desktop defined in place, wins over `desktop`
        pub session: Option<DesktopDescriptor>,
        pub lang: Option<String>,
    }

    impl UserPreferences {
        /// Location relative to the home directory
        pub const PATH: &str = ".config/vtlogin/config.toml";

        /// Reads the preferences of the user owning `home`.
        /// A missing file means no preferences.
        ///
        /// Must run after the file-system privilege drop.
        pub fn load(home: &Path) -> Result<Self> {
            let path = home.join(Self::PATH);

            let text = match fs_err::read_to_string(&path) {
                Err(e) if matches!(e.kind(), ErrorKind::NotFound) => return Ok(Self::default()),
                other => other,
            }?;

            toml::from_str(&text).context(format!("Invalid preferences in {}", path.display()))
        }
    }

}
