//! fanotify ABI plumbing: descriptor setup, record stream decoding and
//! handle-to-path resolution.
//!
//! The kernel delivers a contiguous stream of variable-length records,
//! little-endian, each headed by a `fanotify_event_metadata` struct. With
//! `FAN_REPORT_DFID_NAME` the payload past the metadata carries an info-FID
//! header, a `file_handle` and a NUL-terminated child name.

use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use bytes::Bytes;
use log::warn;

/// size of struct fanotify_event_metadata
pub const EVENT_METADATA_LEN: usize = mem::size_of::<libc::fanotify_event_metadata>();
/// info_type(1) + pad(1) + len(2) + fsid(8)
pub const EVENT_INFO_FID_LEN: usize = 12;
/// struct file_handle header: handle_bytes(4) + handle_type(4)
pub const FILE_HANDLE_LEN: usize = 8;

/// Everything the mark subscribes to, filesystem-wide.
pub const EVENT_MASK: u64 = libc::FAN_CREATE
    | libc::FAN_DELETE
    | libc::FAN_DELETE_SELF
    | libc::FAN_CLOSE_WRITE
    | libc::FAN_MOVED_TO
    | libc::FAN_ONDIR
    | libc::FAN_EVENT_ON_CHILD;

/// One decoded kernel record, info payload copied out of the read buffer.
#[derive(Debug, Clone)]
pub struct Event {
    pub mask: u64,
    pub is_dir: bool,
    pub info: Bytes,
}

/// FAN_REPORT_DFID_NAME requires Linux kernel 5.9 or higher.
pub fn init_fd() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::fanotify_init(
            libc::FAN_REPORT_DFID_NAME | libc::FAN_CLOEXEC,
            libc::O_RDONLY as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn mark_filesystem(ffd: RawFd, path: &str, mask: u64) -> io::Result<()> {
    let path = CString::new(path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let rc = unsafe {
        libc::fanotify_mark(
            ffd,
            libc::FAN_MARK_ADD | libc::FAN_MARK_FILESYSTEM,
            mask,
            libc::AT_FDCWD,
            path.as_ptr(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Mount-fd argument for [`open_handle_path`].
pub fn open_root(path: &str) -> io::Result<RawFd> {
    let path = CString::new(path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_DIRECTORY | libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn read_events(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Splits a read buffer into decoded events, in record order.
///
/// A record claiming more bytes than remain (or fewer than the metadata
/// struct) ends the buffer; a mismatched metadata version skips only that
/// record; an overflow marker is logged and skipped.
pub fn parse_records(mut data: &[u8]) -> Vec<Event> {
    let mut events = Vec::new();
    while data.len() >= EVENT_METADATA_LEN {
        let event_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if event_len < EVENT_METADATA_LEN || event_len > data.len() {
            break;
        }
        if data[4] != libc::FANOTIFY_METADATA_VERSION {
            data = &data[event_len..];
            continue;
        }
        let mask = u64::from_le_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        if mask & libc::FAN_Q_OVERFLOW != 0 {
            warn!("fanotify queue overflow, events lost");
            data = &data[event_len..];
            continue;
        }
        let info = &data[EVENT_METADATA_LEN..event_len];
        let info = if info.len() >= EVENT_INFO_FID_LEN + FILE_HANDLE_LEN {
            Bytes::copy_from_slice(info)
        } else {
            Bytes::new()
        };
        events.push(Event {
            mask,
            is_dir: mask & libc::FAN_ONDIR != 0,
            info,
        });
        data = &data[event_len..];
    }
    events
}

/// Borrowed view over an info-FID payload: the opaque handle plus the
/// optional trailing child name.
#[derive(Debug)]
pub struct InfoFid<'a> {
    pub info_type: u8,
    pub handle_type: i32,
    pub handle: &'a [u8],
    name: &'a [u8],
}

impl<'a> InfoFid<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < EVENT_INFO_FID_LEN {
            return None;
        }
        let info_type = data[0];
        let handle_data = &data[EVENT_INFO_FID_LEN..];
        if handle_data.len() < FILE_HANDLE_LEN {
            return None;
        }
        let handle_bytes =
            u32::from_le_bytes([handle_data[0], handle_data[1], handle_data[2], handle_data[3]])
                as usize;
        let handle_type =
            i32::from_le_bytes([handle_data[4], handle_data[5], handle_data[6], handle_data[7]]);
        if handle_bytes > handle_data.len() - FILE_HANDLE_LEN {
            return None;
        }
        Some(InfoFid {
            info_type,
            handle_type,
            handle: &handle_data[FILE_HANDLE_LEN..FILE_HANDLE_LEN + handle_bytes],
            name: &handle_data[FILE_HANDLE_LEN + handle_bytes..],
        })
    }

    /// Child name for DFID_NAME records: bytes after the handle body up to
    /// the first NUL. Empty or absent names yield None.
    pub fn name(&self) -> Option<String> {
        if self.info_type != libc::FAN_EVENT_INFO_TYPE_DFID_NAME {
            return None;
        }
        let name = match self.name.iter().position(|&b| b == 0) {
            Some(nul) => &self.name[..nul],
            None => self.name,
        };
        if name.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(name).into_owned())
    }
}

/// Kernel MAX_HANDLE_SZ.
const MAX_HANDLE_SZ: usize = 128;

/// struct file_handle with inline storage for the opaque body.
#[repr(C)]
struct RawHandle {
    handle_bytes: u32,
    handle_type: i32,
    f_handle: [u8; MAX_HANDLE_SZ],
}

/// Opens the object named by an opaque handle and reads back its absolute
/// path through /proc. The descriptor is path-only and closed before
/// returning.
pub fn open_handle_path(mount_fd: RawFd, handle_type: i32, handle: &[u8]) -> io::Result<String> {
    if handle.len() > MAX_HANDLE_SZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "file handle too large",
        ));
    }
    let mut raw = RawHandle {
        handle_bytes: handle.len() as u32,
        handle_type,
        f_handle: [0; MAX_HANDLE_SZ],
    };
    raw.f_handle[..handle.len()].copy_from_slice(handle);

    let fd = unsafe {
        libc::open_by_handle_at(
            mount_fd,
            (&mut raw as *mut RawHandle).cast::<libc::file_handle>(),
            libc::O_PATH | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let path = fs::read_link(format!("/proc/self/fd/{fd}"));
    unsafe { libc::close(fd) };
    Ok(path?.to_string_lossy().into_owned())
}

/// Symbolic kind for a mask: matched names joined with `|`, or the raw
/// mask as hex when no subscribed bit is set.
pub fn mask_to_string(mask: u64) -> String {
    let mut kinds = Vec::new();
    if mask & libc::FAN_CREATE != 0 {
        kinds.push("CREATE");
    }
    if mask & libc::FAN_DELETE != 0 {
        kinds.push("DELETE");
    }
    if mask & libc::FAN_DELETE_SELF != 0 {
        kinds.push("DELETE_SELF");
    }
    if mask & libc::FAN_CLOSE_WRITE != 0 {
        kinds.push("CLOSE_WRITE");
    }
    if mask & libc::FAN_MOVED_TO != 0 {
        kinds.push("MOVED_TO");
    }
    if kinds.is_empty() {
        return format!("0x{mask:x}");
    }
    kinds.join("|")
}

/// Builders for synthetic kernel records.
#[cfg(test)]
pub(crate) mod testutil {
    use super::{EVENT_INFO_FID_LEN, EVENT_METADATA_LEN};

    pub fn record(version: u8, mask: u64, info: &[u8]) -> Vec<u8> {
        record_with_len(version, mask, info, (EVENT_METADATA_LEN + info.len()) as u32)
    }

    pub fn record_with_len(version: u8, mask: u64, info: &[u8], event_len: u32) -> Vec<u8> {
        let mut buf = vec![0u8; EVENT_METADATA_LEN];
        buf[0..4].copy_from_slice(&event_len.to_le_bytes());
        buf[4] = version;
        buf[6..8].copy_from_slice(&(EVENT_METADATA_LEN as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&mask.to_le_bytes());
        buf.extend_from_slice(info);
        buf
    }

    pub fn dfid_name_info(handle: &[u8], handle_type: i32, name: Option<&str>) -> Vec<u8> {
        let mut info = vec![0u8; EVENT_INFO_FID_LEN];
        info[0] = libc::FAN_EVENT_INFO_TYPE_DFID_NAME;
        info.extend_from_slice(&(handle.len() as u32).to_le_bytes());
        info.extend_from_slice(&handle_type.to_le_bytes());
        info.extend_from_slice(handle);
        if let Some(name) = name {
            info.extend_from_slice(name.as_bytes());
            info.push(0);
        }
        info
    }
}
