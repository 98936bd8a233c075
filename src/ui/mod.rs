//! Presentation boundary.
//!
//! A [`Renderer`] paints immutable [`Frame`]s; it never touches the store.
//! Keyboard input comes back as [`UserCommand`]s published on the bus.

use std::io;
use std::sync::Arc;

use crate::bus::UserCommand;
use crate::state::WorldState;

mod console;

pub use console::{spawn_input_reader, ConsoleRenderer};

/// Everything one repaint needs.
#[derive(Debug, Clone)]
pub struct Frame {
    pub state: Arc<WorldState>,
    pub log_tail: Vec<String>,
}

pub trait Renderer: Send {
    fn render(&mut self, frame: &Frame) -> io::Result<()>;
}

/// Turn one line of keyboard input into a command.
///
/// Blank input yields `None`. Anything that is not a dashboard command is
/// passed through for the selected bot.
pub fn parse_command(line: &str) -> Option<UserCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    let command = match (head.to_ascii_lowercase().as_str(), rest) {
        ("q" | "quit", "") => UserCommand::Quit,
        ("p" | "pause", "") => UserCommand::PauseToggle,
        ("r" | "restart", "") => UserCommand::Restart,
        ("bot" | "select", name) if !name.is_empty() => UserCommand::SelectBot(name.to_string()),
        _ => UserCommand::SubmitText(line.to_string()),
    };
    Some(command)
}
