use std::io::{self, BufRead, Write};

use rustix::termios::{self, LocalModes, OptionalActions, Termios};
use tracing::{error, info};
use zeroize::Zeroize;

use crate::{
    login::pam::{ConversationError, MessageLevel, PamDisplay},
    utils::misc::hostname,
};

fn forward_message(text: &str, level: MessageLevel) {
    match level {
        MessageLevel::Info => info!("{text}"),
        MessageLevel::Error => error!("{text}"),
    }
}

/// Disables terminal echo until dropped
struct EchoGuard {
    saved: Termios,
}

impl EchoGuard {
    fn mask() -> rustix::io::Result<Self> {
        let stdin = io::stdin();
        let saved = termios::tcgetattr(&stdin)?;

        let mut masked = saved.clone();
        masked.local_modes.remove(LocalModes::ECHO);
        termios::tcsetattr(&stdin, OptionalActions::Now, &masked)?;

        Ok(Self { saved })
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(io::stdin(), OptionalActions::Now, &self.saved);
    }
}

/// Conversation over the controlling terminal
pub struct TerminalDisplay {
    hostname: String,
    default_user: Option<String>,
}

impl TerminalDisplay {
    pub fn new(default_user: Option<String>) -> Self {
        Self {
            hostname: hostname(),
            default_user,
        }
    }

    fn banner(&self, show: bool) -> String {
        match (show, &self.default_user) {
            (true, _) => format!("{} login: ", self.hostname),
            (false, Some(user)) => format!("{} login: {user}\nPassword: ", self.hostname),
            (false, None) => "Password: ".to_string(),
        }
    }

    fn read_line() -> Result<String, ConversationError> {
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        let answer = line.trim_end_matches(['\n', '\r']).to_string();
        line.zeroize();
        Ok(answer)
    }
}

impl PamDisplay for TerminalDisplay {
    fn prompt(&self, _text: &str, show: bool) -> Result<String, ConversationError> {
        let mut stdout = io::stdout();
        write!(stdout, "{}", self.banner(show))?;
        stdout.flush()?;

        if show {
            return Self::read_line();
        }

        let answer = {
            let _guard = EchoGuard::mask()?;
            Self::read_line()
        };
        writeln!(stdout)?;

        answer
    }

    fn message(&self, text: &str, level: MessageLevel) -> Result<(), ConversationError> {
        forward_message(text, level);
        Ok(())
    }
}

/// Conversation that answers every prompt with nothing
pub struct AutologinDisplay;

impl PamDisplay for AutologinDisplay {
    fn prompt(&self, _text: &str, _show: bool) -> Result<String, ConversationError> {
        Ok(String::new())
    }

    fn message(&self, text: &str, level: MessageLevel) -> Result<(), ConversationError> {
        forward_message(text, level);
        Ok(())
    }
}
