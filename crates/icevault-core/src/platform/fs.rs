use std::fs::Metadata;
use std::path::Path;

use chrono::{DateTime, Utc};

/// The filesystem attributes captured into (and re-applied from) a Node.
#[derive(Debug, Clone, Copy)]
pub struct MetadataSummary {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub access_time: DateTime<Utc>,
    pub mod_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
    pub size: u64,
}

pub fn summarize_metadata(metadata: &Metadata) -> MetadataSummary {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        MetadataSummary {
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            access_time: unix_timestamp(metadata.atime(), metadata.atime_nsec()),
            mod_time: unix_timestamp(metadata.mtime(), metadata.mtime_nsec()),
            change_time: unix_timestamp(metadata.ctime(), metadata.ctime_nsec()),
            size: metadata.len(),
        }
    }

    #[cfg(not(unix))]
    {
        let mod_time = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        MetadataSummary {
            mode: if metadata.permissions().readonly() {
                0o444
            } else {
                0o644
            },
            uid: 0,
            gid: 0,
            access_time: mod_time,
            mod_time,
            change_time: mod_time,
            size: metadata.len(),
        }
    }
}

#[cfg(unix)]
fn unix_timestamp(secs: i64, nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nanos as u32).unwrap_or_default()
}

pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly((mode & 0o200) == 0);
        std::fs::set_permissions(path, perms)
    }
}

/// Best-effort ownership change; unprivileged processes routinely cannot
/// chown, so callers ignore the result the same way the rest of the
/// restore metadata application does.
pub fn apply_ownership(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
    }

    #[cfg(not(unix))]
    {
        let _ = (path, uid, gid);
        Ok(())
    }
}

/// Ownership change for a symlink itself, without following it.
pub fn apply_symlink_ownership(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
    }

    #[cfg(not(unix))]
    {
        let _ = (path, uid, gid);
        Ok(())
    }
}

pub fn create_symlink(link_target: &Path, target: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_target, target)
    }

    #[cfg(not(unix))]
    {
        let _ = (link_target, target);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlink creation is not supported on this platform",
        ))
    }
}

/// Apply both access and modification times.
pub fn set_file_times(
    path: &Path,
    access_time: &DateTime<Utc>,
    mod_time: &DateTime<Utc>,
) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null")
        })?;
        let times = [
            libc::timespec {
                tv_sec: access_time.timestamp() as _,
                tv_nsec: access_time.timestamp_subsec_nanos() as _,
            },
            libc::timespec {
                tv_sec: mod_time.timestamp() as _,
                tv_nsec: mod_time.timestamp_subsec_nanos() as _,
            },
        ];
        if unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        use std::fs::{FileTimes, OpenOptions};
        use std::time::{Duration, SystemTime};

        let to_system_time = |t: &DateTime<Utc>| {
            SystemTime::UNIX_EPOCH + Duration::from_nanos(t.timestamp_nanos_opt().unwrap_or(0).max(0) as u64)
        };
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_times(
            FileTimes::new()
                .set_accessed(to_system_time(access_time))
                .set_modified(to_system_time(mod_time)),
        )
    }
}
