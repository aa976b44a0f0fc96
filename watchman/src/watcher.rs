//! The event pipeline: capture worker, process worker, handle and path
//! caches, prefix filter and listener fan-out.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Once, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use moka::sync::Cache;
use thiserror::Error;
use tokio::task::JoinHandle;

use watchman_plugin::Plugin;

use crate::fanotify::{self, Event, InfoFid};
use crate::filter::PathFilter;
use crate::settings::Settings;

/// Capacity of the capture-to-process queue.
const EVENT_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("fanotify init: {0}")]
    Init(#[source] io::Error),
    #[error("fanotify mark: {0}")]
    Mark(#[source] io::Error),
    #[error("open root: {0}")]
    OpenRoot(#[source] io::Error),
}

/// Event callback. Implementations must return promptly; slow I/O belongs
/// on the listener's own queue, not the process worker.
pub type Listener = Arc<dyn Fn(&str, &str, &str, bool) + Send + Sync>;

pub struct Watchman {
    ffd: AtomicI32,
    rfd: AtomicI32,
    buffer_size: usize,
    fdc: Cache<String, String>,
    fpc: Cache<String, String>,
    filter: RwLock<PathFilter>,
    listeners: RwLock<HashMap<String, Listener>>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    queue: Mutex<Option<(Sender<Event>, Receiver<Event>)>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    stop_once: Once,
}

impl Watchman {
    /// Acquires the fanotify descriptor, the filesystem-wide mark and the
    /// root directory descriptor, unwinding on failure.
    pub fn initialize(settings: &Settings) -> Result<Self, InitError> {
        let ffd = fanotify::init_fd().map_err(InitError::Init)?;
        if let Err(err) = fanotify::mark_filesystem(ffd, "/", fanotify::EVENT_MASK) {
            unsafe { libc::close(ffd) };
            return Err(InitError::Mark(err));
        }
        let rfd = match fanotify::open_root("/") {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(ffd) };
                return Err(InitError::OpenRoot(err));
            }
        };
        for path in &settings.watchman.watcher.paths {
            info!("watching path {path}");
        }
        Ok(Self::from_parts(ffd, rfd, settings))
    }

    fn from_parts(ffd: RawFd, rfd: RawFd, settings: &Settings) -> Self {
        let config = &settings.watchman;
        let mut filter = PathFilter::new();
        for path in &config.watcher.paths {
            filter.insert(path);
        }
        let (stop_tx, stop_rx) = bounded(0);
        let queue = bounded(EVENT_QUEUE_CAPACITY);
        Self {
            ffd: AtomicI32::new(ffd),
            rfd: AtomicI32::new(rfd),
            buffer_size: config.watcher.buffer_size * 1024,
            fdc: Cache::builder()
                .max_capacity(config.cache.fd_size)
                .time_to_live(Duration::from_secs(config.cache.fd_ttl))
                .build(),
            fpc: Cache::builder()
                .max_capacity(config.cache.fp_size)
                .time_to_live(Duration::from_secs(config.cache.fp_ttl))
                .build(),
            filter: RwLock::new(filter),
            listeners: RwLock::new(HashMap::new()),
            plugins: Mutex::new(Vec::new()),
            queue: Mutex::new(Some(queue)),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            stop_once: Once::new(),
        }
    }

    /// Spawns the capture and process workers. Callable once; the returned
    /// handles complete after [`Watchman::stop`].
    pub fn watch(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let taken = self
            .queue
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        let Some((tx, rx)) = taken else {
            warn!("watch already running");
            return Vec::new();
        };

        let capture = {
            let wm = Arc::clone(&self);
            let stop = self.stop_rx.clone();
            tokio::task::spawn_blocking(move || wm.capture_events(&stop, tx))
        };
        let process = {
            let wm = Arc::clone(&self);
            let stop = self.stop_rx.clone();
            tokio::task::spawn_blocking(move || wm.process_events(&stop, rx))
        };
        vec![capture, process]
    }

    /// Tears the pipeline down exactly once, in an order that cannot
    /// deadlock: close the fanotify descriptor so the capture read returns,
    /// let the queue close behind the exiting capture worker, then close
    /// the root descriptor and the plugins.
    pub fn stop(&self) {
        self.stop_once.call_once(|| {
            let ffd = self.ffd.swap(-1, Ordering::SeqCst);
            if ffd >= 0 {
                unsafe { libc::close(ffd) };
            }
            drop(
                self.stop_tx
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .take(),
            );
            let rfd = self.rfd.swap(-1, Ordering::SeqCst);
            if rfd >= 0 {
                unsafe { libc::close(rfd) };
            }
            let plugins: Vec<_> = self
                .plugins
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .drain(..)
                .collect();
            for plugin in plugins {
                if let Err(err) = plugin.close() {
                    warn!("plugin {} close: {err}", plugin.name());
                }
            }
            info!("watchman stopped");
        });
    }

    pub fn add_listener(&self, name: impl Into<String>, listener: Listener) {
        self.listeners
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(name.into(), listener);
    }

    pub fn remove_listener(&self, name: &str) {
        self.listeners
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(name);
    }

    /// Binds the plugin's handler as a listener under the plugin's name and
    /// retains the plugin so stop can close it.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        let handler = Arc::clone(&plugin);
        self.add_listener(
            plugin.name(),
            Arc::new(move |kind, directory, filename, is_dir| {
                handler.handle(kind, directory, filename, is_dir)
            }),
        );
        self.plugins
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(plugin);
    }

    fn capture_events(&self, stop: &Receiver<()>, tx: Sender<Event>) {
        let mut buffer = BytesMut::zeroed(self.buffer_size);
        loop {
            if matches!(stop.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }
            let read = match fanotify::read_events(self.ffd.load(Ordering::SeqCst), &mut buffer) {
                // EOF; a live fanotify descriptor never returns it
                Ok(0) => return,
                Ok(read) => read,
                Err(err)
                    if matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::EINTR)) =>
                {
                    return;
                }
                Err(_) => continue,
            };
            for event in fanotify::parse_records(&buffer[..read]) {
                select! {
                    send(tx, event) -> sent => {
                        if sent.is_err() {
                            return;
                        }
                    },
                    recv(stop) -> _ => return,
                }
            }
        }
    }

    fn process_events(&self, stop: &Receiver<()>, rx: Receiver<Event>) {
        loop {
            select! {
                recv(rx) -> event => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => return,
                },
                recv(stop) -> _ => return,
            }
        }
    }

    fn handle_event(&self, event: Event) {
        let Some((directory, filename)) = self.resolve(&event.info) else {
            return;
        };
        if directory.is_empty() || filename.is_empty() {
            return;
        }
        self.deliver(event.mask, event.is_dir, &directory, &filename);
    }

    /// Filter, dedup and fan-out for a resolved event. Directory events are
    /// consumed only for the handle-cache entries their resolution creates.
    fn deliver(&self, mask: u64, is_dir: bool, directory: &str, filename: &str) {
        if is_dir {
            return;
        }
        let full_path = if directory == "/" {
            format!("/{filename}")
        } else {
            format!("{directory}/{filename}")
        };
        let matched = {
            let filter = self.filter.read().unwrap_or_else(|err| err.into_inner());
            filter.matches(&full_path)
        };
        if !matched {
            return;
        }
        let kind = fanotify::mask_to_string(mask);
        if self.fpc.get(&full_path).is_some() {
            return;
        }
        self.fpc.insert(full_path, kind.clone());

        // snapshot so no lock is held across callbacks
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|err| err.into_inner());
            listeners.values().cloned().collect()
        };
        for listener in snapshot {
            listener(&kind, directory, filename, is_dir);
        }
    }

    /// Resolves an info payload to `(directory, filename)`. The filename is
    /// empty for records without a DFID_NAME child entry; callers drop those.
    fn resolve(&self, info: &[u8]) -> Option<(String, String)> {
        let fid = InfoFid::parse(info)?;
        let rfd = self.rfd.load(Ordering::SeqCst);
        let directory = self.resolve_dir(&fid, |handle_type, handle| {
            fanotify::open_handle_path(rfd, handle_type, handle)
        })?;
        match fid.name() {
            Some(name) if !directory.is_empty() => Some((directory, name)),
            _ => Some((directory, String::new())),
        }
    }

    fn resolve_dir<F>(&self, fid: &InfoFid<'_>, open: F) -> Option<String>
    where
        F: FnOnce(i32, &[u8]) -> io::Result<String>,
    {
        let key = BASE64.encode(fid.handle);
        if let Some(directory) = self.fdc.get(&key) {
            return Some(directory);
        }
        match open(fid.handle_type, fid.handle) {
            Ok(directory) => {
                self.fdc.insert(key, directory.clone());
                Some(directory)
            }
            Err(err) => {
                debug!("handle resolution failed: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanotify::testutil::{dfid_name_info, record};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_settings(paths: &[&str]) -> Settings {
        let mut settings = Settings::default();
        let config = &mut settings.watchman;
        config.watcher.paths = paths.iter().map(|p| p.to_string()).collect();
        config.watcher.buffer_size = 64;
        config.cache.fd_size = 4096;
        config.cache.fd_ttl = 300;
        config.cache.fp_size = 5000;
        config.cache.fp_ttl = 5;
        settings
    }

    fn test_watchman(paths: &[&str]) -> Watchman {
        Watchman::from_parts(-1, -1, &test_settings(paths))
    }

    type Calls = Arc<Mutex<Vec<(String, String, String, bool)>>>;

    fn recording_listener() -> (Listener, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let listener: Listener = Arc::new(move |kind, directory, filename, is_dir| {
            sink.lock().unwrap().push((
                kind.to_string(),
                directory.to_string(),
                filename.to_string(),
                is_dir,
            ));
        });
        (listener, calls)
    }

    #[test]
    fn create_under_watched_prefix_reaches_the_listener() {
        let wm = test_watchman(&["/tmp/watched"]);
        let (listener, calls) = recording_listener();
        wm.add_listener("rec", listener);

        wm.deliver(libc::FAN_CREATE, false, "/tmp/watched/sub", "a.txt");

        let calls = calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            &[(
                "CREATE".to_string(),
                "/tmp/watched/sub".to_string(),
                "a.txt".to_string(),
                false
            )]
        );
    }

    #[test]
    fn create_outside_watched_prefix_is_dropped() {
        let wm = test_watchman(&["/tmp/watched"]);
        let (listener, calls) = recording_listener();
        wm.add_listener("rec", listener);

        wm.deliver(libc::FAN_CREATE, false, "/tmp/other", "a.txt");

        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn directory_events_are_dropped() {
        let wm = test_watchman(&["/tmp/watched"]);
        let (listener, calls) = recording_listener();
        wm.add_listener("rec", listener);

        wm.deliver(libc::FAN_CREATE | libc::FAN_ONDIR, true, "/tmp/watched", "sub");

        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn second_event_on_a_path_is_deduplicated_regardless_of_kind() {
        let wm = test_watchman(&["/tmp/watched"]);
        let (listener, calls) = recording_listener();
        wm.add_listener("rec", listener);

        wm.deliver(libc::FAN_CREATE, false, "/tmp/watched", "a.txt");
        wm.deliver(libc::FAN_CLOSE_WRITE, false, "/tmp/watched", "a.txt");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "CREATE");
    }

    #[test]
    fn distinct_paths_are_not_deduplicated() {
        let wm = test_watchman(&["/tmp/watched"]);
        let (listener, calls) = recording_listener();
        wm.add_listener("rec", listener);

        wm.deliver(libc::FAN_CREATE, false, "/tmp/watched", "a.txt");
        wm.deliver(libc::FAN_CREATE, false, "/tmp/watched", "b.txt");

        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn root_directory_is_not_collapsed() {
        let wm = test_watchman(&["/"]);
        let (listener, calls) = recording_listener();
        wm.add_listener("rec", listener);

        wm.deliver(libc::FAN_CREATE, false, "/", "etc");

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].1, "/");
        assert_eq!(calls[0].2, "etc");
    }

    #[test]
    fn listeners_observe_events_in_delivery_order() {
        let wm = test_watchman(&["/tmp/watched"]);
        let (listener, calls) = recording_listener();
        wm.add_listener("rec", listener);

        for name in ["a", "b", "c", "d"] {
            wm.deliver(libc::FAN_CREATE, false, "/tmp/watched", name);
        }

        let names: Vec<String> = calls.lock().unwrap().iter().map(|c| c.2.clone()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
    }

    #[test]
    fn add_listener_replaces_and_remove_erases() {
        let wm = test_watchman(&["/tmp/watched"]);
        let (first, first_calls) = recording_listener();
        let (second, second_calls) = recording_listener();

        wm.add_listener("rec", first);
        wm.add_listener("rec", second);
        wm.deliver(libc::FAN_CREATE, false, "/tmp/watched", "a.txt");
        assert!(first_calls.lock().unwrap().is_empty());
        assert_eq!(second_calls.lock().unwrap().len(), 1);

        wm.remove_listener("rec");
        wm.deliver(libc::FAN_CREATE, false, "/tmp/watched", "b.txt");
        assert_eq!(second_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn identical_handles_resolve_through_one_syscall() {
        let wm = test_watchman(&["/tmp/watched"]);
        let info = dfid_name_info(&[7; 16], 1, Some("a.txt"));
        let fid = InfoFid::parse(&info).unwrap();

        let invocations = AtomicUsize::new(0);
        for _ in 0..2 {
            let directory = wm.resolve_dir(&fid, |_, _| {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok("/tmp/watched/sub".to_string())
            });
            assert_eq!(directory.as_deref(), Some("/tmp/watched/sub"));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_resolution_is_not_cached() {
        let wm = test_watchman(&["/tmp/watched"]);
        let info = dfid_name_info(&[8; 16], 1, Some("a.txt"));
        let fid = InfoFid::parse(&info).unwrap();

        let miss = wm.resolve_dir(&fid, |_, _| {
            Err(io::Error::from_raw_os_error(libc::ESTALE))
        });
        assert!(miss.is_none());

        let hit = wm.resolve_dir(&fid, |_, _| Ok("/srv".to_string()));
        assert_eq!(hit.as_deref(), Some("/srv"));
    }

    struct CountingPlugin {
        events: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }

        fn handle(&self, _kind: &str, _directory: &str, _filename: &str, _is_dir: bool) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) -> Result<(), watchman_plugin::PluginError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn plugins_receive_events_and_close_once() {
        let wm = test_watchman(&["/tmp/watched"]);
        let plugin = Arc::new(CountingPlugin {
            events: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        wm.register_plugin(Arc::clone(&plugin) as Arc<dyn Plugin>);

        wm.deliver(libc::FAN_CREATE, false, "/tmp/watched", "a.txt");
        assert_eq!(plugin.events.load(Ordering::SeqCst), 1);

        wm.stop();
        wm.stop();
        assert_eq!(plugin.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_terminates_both_workers() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_end, write_end] = fds;

        let wm = Arc::new(Watchman::from_parts(read_end, -1, &test_settings(&["/tmp/watched"])));
        let handles = Arc::clone(&wm).watch();
        assert_eq!(handles.len(), 2);
        assert!(Arc::clone(&wm).watch().is_empty());

        // feed one well-formed record through the pipe before stopping
        let info = dfid_name_info(&[9; 16], 1, Some("a.txt"));
        let buf = record(libc::FANOTIFY_METADATA_VERSION, libc::FAN_CREATE, &info);
        let written =
            unsafe { libc::write(write_end, buf.as_ptr().cast(), buf.len()) };
        assert_eq!(written, buf.len() as isize);
        tokio::time::sleep(Duration::from_millis(50)).await;

        wm.stop();
        wm.stop();
        unsafe { libc::close(write_end) };

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("worker did not stop in time")
                .expect("worker panicked");
        }
    }
}
