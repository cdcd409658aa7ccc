//! Process liveness and host identity helpers shared by both lock flavours.

use std::path::Path;

use chrono::{DateTime, Utc};

/// Check whether `pid` is currently alive.
///
/// `kill(pid, 0)` delivers no signal; it only probes existence. ESRCH means
/// the process is gone. EPERM means it exists but belongs to someone else,
/// which still counts as alive.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    matches!(err.raw_os_error(), Some(libc::EPERM))
}

/// Best-effort hostname for lock payloads.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "unknown".to_string()
}

/// Modification time of `path` as a UTC timestamp, used as the freshness
/// signal when a lock file exists but cannot be parsed.
pub fn mtime_utc(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// A short random nonce: 8 hex chars from fresh UUID bytes.
pub fn random_nonce() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        // Beyond the Linux pid range, guaranteed unused.
        assert!(!pid_alive(4_194_304));
        assert!(!pid_alive(0));
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn nonces_are_distinct() {
        assert_ne!(random_nonce(), random_nonce());
        assert_eq!(random_nonce().len(), 8);
    }
}
