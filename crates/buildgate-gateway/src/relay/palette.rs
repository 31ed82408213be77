//! Styling of the lines written to the client's terminal.

const RESET: &str = "\x1b[0m";
const MARKER: &str = "\x1b[37;40;32m\u{2731}\x1b[0m";
const TEXT: &str = "\x1b[37;40m";

/// Formatting applied to outbound lines. Passed into each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    colored: bool,
}

impl Palette {
    pub const fn new(colored: bool) -> Self {
        Self { colored }
    }

    pub const fn plain() -> Self {
        Self::new(false)
    }

    /// A gateway progress line: a marker followed by the text.
    pub fn progress(&self, text: &str) -> String {
        if self.colored {
            format!("{MARKER}{TEXT} {text}{RESET}")
        } else {
            format!("* {text}")
        }
    }

    /// A relayed worker log line.
    pub fn log_line(&self, text: &str) -> String {
        if self.colored {
            format!("{TEXT}{text}{RESET}")
        } else {
            text.to_string()
        }
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::new(true)
    }
}
