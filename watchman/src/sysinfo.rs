//! Kernel release and process capability probes.

use std::ffi::CStr;
use std::fs;
use std::mem;

use anyhow::{bail, Context, Result};

pub fn kernel_version() -> Result<(u64, u64)> {
    let mut uts: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(std::io::Error::last_os_error()).context("uname");
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) }.to_string_lossy();
    parse_release(&release)
}

fn parse_release(release: &str) -> Result<(u64, u64)> {
    let mut parts = release.split('.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => bail!("unsupported kernel release format: {release}"),
    }
}

/// Effective capability mask of the current process.
pub fn capabilities() -> Result<u64> {
    let status = fs::read_to_string("/proc/self/status").context("read /proc/self/status")?;
    effective_caps(&status)
}

fn effective_caps(status: &str) -> Result<u64> {
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("CapEff:") {
            return u64::from_str_radix(value.trim(), 16).context("parse CapEff");
        }
    }
    bail!("CapEff not present in /proc/self/status")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_parses_major_and_minor() {
        assert_eq!(parse_release("5.15.0-91-generic").unwrap(), (5, 15));
        assert_eq!(parse_release("6.8.0").unwrap(), (6, 8));
    }

    #[test]
    fn malformed_release_is_an_error() {
        assert!(parse_release("linux").is_err());
        assert!(parse_release("6").is_err());
    }

    #[test]
    fn cap_eff_line_is_parsed_as_hex() {
        let status = "Name:\twatchman\nCapPrm:\t0000000000200002\nCapEff:\t0000000000200002\n";
        assert_eq!(effective_caps(status).unwrap(), 0x200002);
    }

    #[test]
    fn missing_cap_eff_is_an_error() {
        assert!(effective_caps("Name:\twatchman\n").is_err());
    }

    #[test]
    fn probes_work_on_the_running_system() {
        let (major, _) = kernel_version().unwrap();
        assert!(major >= 3);
        capabilities().unwrap();
    }
}
