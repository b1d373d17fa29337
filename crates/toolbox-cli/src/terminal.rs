//! Terminal handling for interactive container sessions.
//!
//! This module provides the local console abstraction used by the session:
//! TTY detection, terminal geometry, and raw mode with guaranteed restore.

use crossterm::terminal;
use std::io::{self, IsTerminal};
use std::sync::Arc;

/// Terminal size (width x height).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Gets the current terminal size.
    pub fn current() -> io::Result<Self> {
        let (cols, rows) = terminal::size()?;
        Ok(Self { cols, rows })
    }
}

/// Local console the session is driven from.
pub trait Console: Send + Sync {
    /// Returns true if standard input is a real terminal.
    fn is_terminal(&self) -> bool;

    /// Current terminal dimensions.
    fn size(&self) -> io::Result<TerminalSize>;

    /// Switches the terminal to raw mode.
    fn enable_raw_mode(&self) -> io::Result<()>;

    /// Restores cooked mode.
    fn disable_raw_mode(&self) -> io::Result<()>;
}

/// Console backed by the process's standard streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl Console for StdConsole {
    fn is_terminal(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn size(&self) -> io::Result<TerminalSize> {
        TerminalSize::current()
    }

    fn enable_raw_mode(&self) -> io::Result<()> {
        terminal::enable_raw_mode()
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        terminal::disable_raw_mode()
    }
}

/// RAII guard that restores terminal mode on drop.
pub struct RawModeGuard {
    console: Arc<dyn Console>,
}

impl RawModeGuard {
    /// Enables raw mode and returns a guard that restores normal mode on drop.
    pub fn new(console: Arc<dyn Console>) -> io::Result<Self> {
        console.enable_raw_mode()?;
        Ok(Self { console })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        tracing::debug!("Restoring terminal");
        if let Err(e) = self.console.disable_raw_mode() {
            tracing::warn!("Failed to restore terminal: {}", e);
        }
    }
}
