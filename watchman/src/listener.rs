//! Built-in logging listener: prints the joined path of each event to
//! stdout.

use std::sync::Arc;

use crate::watcher::Listener;

// appended by the kernel to names of unlinked-but-open files
const DELETED_SUFFIX: &str = " (deleted)";

pub fn logging() -> Listener {
    Arc::new(|kind, directory, filename, _is_dir| {
        println!("{}", display_path(kind, directory, filename));
    })
}

fn display_path(kind: &str, directory: &str, filename: &str) -> String {
    let filename = if kind.contains("DELETE") {
        filename.strip_suffix(DELETED_SUFFIX).unwrap_or(filename)
    } else {
        filename
    };
    if directory == "/" {
        format!("/{filename}")
    } else {
        format!("{directory}/{filename}")
    }
}
