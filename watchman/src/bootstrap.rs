//! Startup sequence: preflight checks, configuration, pipeline construction.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;

use crate::settings::Settings;
use crate::sysinfo;
use crate::watcher::Watchman;

// FAN_REPORT_DFID_NAME needs 5.9
const MIN_KERNEL_MAJOR: u64 = 5;
const MIN_KERNEL_MINOR: u64 = 9;

const CAP_DAC_READ_SEARCH: u64 = 2;
const CAP_SYS_ADMIN: u64 = 21;
const REQUIRED_CAPS: u64 = (1 << CAP_SYS_ADMIN) | (1 << CAP_DAC_READ_SEARCH);

fn kernel_supported(major: u64, minor: u64) -> bool {
    major > MIN_KERNEL_MAJOR || (major == MIN_KERNEL_MAJOR && minor >= MIN_KERNEL_MINOR)
}

fn has_required_caps(caps: u64) -> bool {
    caps & REQUIRED_CAPS == REQUIRED_CAPS
}

pub fn preflight() -> Result<()> {
    let (major, minor) = sysinfo::kernel_version()?;
    if !kernel_supported(major, minor) {
        bail!(
            "expected kernel version >={MIN_KERNEL_MAJOR}.{MIN_KERNEL_MINOR}, actual: {major}.{minor}"
        );
    }
    if !has_required_caps(sysinfo::capabilities()?) {
        bail!("insufficient capabilities. try: sudo setcap cap_sys_admin,cap_dac_read_search+ep watchman");
    }
    Ok(())
}

pub fn initialize(config: Option<&Path>) -> Result<Arc<Watchman>> {
    preflight()?;
    let settings = Settings::load(config).context("load settings")?;
    let plugin_root = &settings.watchman.plugin_root;
    if !plugin_root.as_os_str().is_empty() {
        info!(
            "plugin-root {} is set; plugins are compiled in, the directory is ignored",
            plugin_root.display()
        );
    }
    let wm = Watchman::initialize(&settings).context("initialize watcher")?;
    Ok(Arc::new(wm))
}
