//! Terminal helpers.

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Determines if stdout is a TTY that understands ANSI escapes.
pub fn is_ansi_interactive_terminal() -> bool {
    let stdout_is_tty = unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 };
    let dumb = std::env::var("TERM").map(|t| t == "dumb").unwrap_or(false);
    stdout_is_tty && !dumb
}
