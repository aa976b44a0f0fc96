//! Filesystem activity monitor for Linux, built on fanotify.
//!
//! One fanotify mark at `/` covers the whole mounted tree; userspace
//! resolves directory handles to paths, filters against configured
//! prefixes, deduplicates bursts and fans the survivors out to listeners.

pub mod bootstrap;
pub mod fanotify;
pub mod filter;
pub mod listener;
pub mod settings;
pub mod sysinfo;
pub mod watcher;
