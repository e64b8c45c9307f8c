use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// When created, enables raw mode on the terminal. When dropped (even on
/// panic), restores the terminal to its previous state.
///
/// Raw mode is needed while attached so every keystroke (including Ctrl+C
/// and friends) reaches the session's PTY instead of the local terminal.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Get the current terminal size.
///
/// Returns (rows, cols); crossterm reports (cols, rows), so we swap.
pub fn terminal_size() -> std::io::Result<(u16, u16)> {
    let (cols, rows) = size()?;
    Ok((rows, cols))
}
