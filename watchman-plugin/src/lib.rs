//! Shared plugin surface for watchman.
//!
//! A plugin is initialized once, receives file events through [`Plugin::handle`]
//! for as long as the monitor runs, and is closed exactly once at shutdown.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin init failed: {0}")]
    Init(String),
    #[error("plugin close failed: {0}")]
    Close(String),
}

/// Event sink registered with the monitor.
///
/// `handle` runs on the event-processing worker and must return promptly;
/// plugins with slow I/O should hand events off to their own queue.
pub trait Plugin: Send + Sync {
    /// Stable identifier; doubles as the listener name.
    fn name(&self) -> &str;

    /// Called once before any event is delivered.
    fn init(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// `kind` is a `|`-joined set of event names or a `0x..` mask fallback.
    /// `directory` is absolute with no trailing slash except `/`; `filename`
    /// is a single path component.
    fn handle(&self, kind: &str, directory: &str, filename: &str, is_dir: bool);

    /// Called exactly once when the monitor stops.
    fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
