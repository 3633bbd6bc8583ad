use std::{
    env,
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStrExt,
};

use im::HashMap;

pub mod prelude {
    pub use super::{Env, EnvContainer, EnvParser, EnvVar};
    pub use crate::{define_env, env_parser_auto, env_parser_raw};
}

pub trait EnvVar {
    const KEY: &str;
}

pub trait EnvParser {
    fn serialize(&self) -> OsString;
}

#[macro_export]
macro_rules! define_env {
    ($key:expr, $vis:vis $struct_name:ident($inner:ty)) => {
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $struct_name($inner);

        impl $crate::environment::EnvVar for $struct_name {
            const KEY: &str = $key;
        }

        impl std::ops::Deref for $struct_name {
            type Target = $inner;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

/// Serializes through the value's `Display` impl
#[macro_export]
macro_rules! env_parser_auto {
    ($struct_name:ident) => {
        impl $crate::environment::EnvParser for $struct_name {
            #[inline]
            fn serialize(&self) -> std::ffi::OsString {
                self.0.to_string().into()
            }
        }
    };
}

/// Parser for values stored as raw OS strings (paths and friends)
#[macro_export]
macro_rules! env_parser_raw {
    ($struct_name:ident) => {
        impl $crate::environment::EnvParser for $struct_name {
            #[inline]
            fn serialize(&self) -> std::ffi::OsString {
                self.0.clone().into()
            }
        }
    };
}

/// Immutable process environment handed to every spawned child.
///
/// Cloning is cheap, the underlying map is persistent.
#[derive(Clone, Debug, Default)]
pub struct Env {
    state: HashMap<String, OsString>,
}

/// Environment this process was started with
pub fn current() -> Env {
    Env::from_values(
        env::vars_os()
            // Note: ignore all variables with non-unicode keys
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v))),
    )
}

impl Env {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = (String, OsString)>) -> Self {
        Self {
            state: values.into_iter().collect(),
        }
    }

    /// Parses `KEY=VALUE` pairs, as returned by PAM.
    ///
    /// Pairs without `=` or with a non-unicode key are skipped.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a [u8]>) -> Self {
        Self::from_values(pairs.into_iter().filter_map(|pair| {
            let split = pair.iter().position(|byte| *byte == b'=')?;
            let key = std::str::from_utf8(&pair[..split]).ok()?;
            let value = OsStr::from_bytes(&pair[split + 1..]);

            Some((key.to_string(), value.to_os_string()))
        }))
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.state.get(key).map(OsString::as_os_str)
    }

    // Callers should use set()
    fn bind<E: EnvVar + EnvParser>(self, var: &E) -> Self {
        Self {
            state: self.state.update(E::KEY.to_string(), var.serialize()),
        }
    }

    /// Applies a container on top of this environment.
    /// Values from the container win on conflict.
    pub fn set(self, container: impl EnvContainer) -> Self {
        container.apply_as_container(self)
    }
}

pub trait EnvContainer {
    fn apply_as_container(self, env: Env) -> Env;
}

impl<T: EnvVar + EnvParser> EnvContainer for T {
    fn apply_as_container(self, env: Env) -> Env {
        env.bind(&self)
    }
}

impl EnvContainer for Env {
    fn apply_as_container(self, env: Env) -> Env {
        // union() keeps the receiver's value on conflict
        Env {
            state: self.state.union(env.state),
        }
    }
}

macro_rules! variadic_env_impl {
    ( $( $name:ident )+ ) => {
        #[allow(non_camel_case_types)]
        impl<$($name: EnvContainer),+> EnvContainer for ($($name,)+)
        {
            fn apply_as_container(self, env: Env) -> Env {
                let ($($name,)+) = self;
                $(let env = $name.apply_as_container(env);)+
                env
            }
        }
    };
}

variadic_env_impl! { a b }
variadic_env_impl! { a b c }
variadic_env_impl! { a b c d }
variadic_env_impl! { a b c d e }
variadic_env_impl! { a b c d e f }
variadic_env_impl! { a b c d e f g }
variadic_env_impl! { a b c d e f g h }
variadic_env_impl! { a b c d e f g h i }
variadic_env_impl! { a b c d e f g h i j }

pub trait EnvRecipient {
    fn set_env(&mut self, env: Env) -> &mut Self;
}

impl EnvRecipient for tokio::process::Command {
    fn set_env(&mut self, env: Env) -> &mut Self {
        self.env_clear().envs(env.state)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::prelude::*;
    use super::*;

    define_env!("TEST_NUMBER", Number(u8));
    env_parser_auto!(Number);

    define_env!("TEST_PATH", SomePath(PathBuf));
    env_parser_raw!(SomePath);

    #[test]
    fn set_serializes_values() {
        let env = Env::empty().set((Number(7), SomePath("/some/where".into())));

        assert_eq!(env.get("TEST_NUMBER"), Some(OsStr::new("7")));
        assert_eq!(env.get("TEST_PATH"), Some(OsStr::new("/some/where")));
    }

    #[test]
    fn current_reflects_process_environment() {
        let env = current();

        assert_eq!(env.get("PATH"), std::env::var_os("PATH").as_deref());
        assert_eq!(env.get("HOME"), std::env::var_os("HOME").as_deref());
    }

    #[test]
    fn merged_values_win() {
        let base = Env::from_values([
            ("TEST_NUMBER".to_string(), "1".into()),
            ("KEEP".to_string(), "kept".into()),
        ]);
        let overlay = Env::empty().set(Number(2));

        let merged = base.set(overlay);

        assert_eq!(merged.get("TEST_NUMBER"), Some(OsStr::new("2")));
        assert_eq!(merged.get("KEEP"), Some(OsStr::new("kept")));
    }

    #[test]
    fn pairs_are_split_on_first_equals() {
        let env = Env::from_pairs([
            b"PATH=/usr/bin:/bin".as_slice(),
            b"WEIRD=a=b".as_slice(),
            b"garbage".as_slice(),
        ]);

        assert_eq!(env.get("garbage"), None);
        assert_eq!(env.get("PATH"), Some(OsStr::new("/usr/bin:/bin")));
        assert_eq!(env.get("WEIRD"), Some(OsStr::new("a=b")));
    }
}
