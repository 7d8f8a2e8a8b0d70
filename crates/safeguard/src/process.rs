//! Process identity and liveness probing.
//!
//! A lock owner is recorded as pid + process start time + boot id. The pid
//! alone is not enough: after the owner dies the kernel may hand the same pid
//! to an unrelated process. A live pid whose start time or boot id differs
//! from the recorded one is therefore treated as dead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the process that owns a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// Operating system process id
    pub pid: u32,
    /// Human-readable `host:program` label
    pub label: String,
    /// Process start time in clock ticks since boot (Linux only)
    #[serde(default)]
    pub start_time: Option<u64>,
    /// Kernel boot id (Linux only)
    #[serde(default)]
    pub boot_id: Option<String>,
}

impl Owner {
    /// Identity of the calling process.
    pub fn current() -> Self {
        let pid = std::process::id();
        Self {
            pid,
            label: format!("{}:{}", hostname(), program_name()),
            start_time: process_start_time(pid),
            boot_id: boot_id(),
        }
    }

    /// Whether `other` names the same process instance as `self`.
    ///
    /// Start times and boot ids are only compared when both sides have one.
    pub fn same_process(&self, other: &Owner) -> bool {
        if self.pid != other.pid {
            return false;
        }
        if let (Some(a), Some(b)) = (self.start_time, other.start_time)
            && a != b
        {
            return false;
        }
        if let (Some(a), Some(b)) = (&self.boot_id, &other.boot_id)
            && a != b
        {
            return false;
        }
        true
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.label, self.pid)
    }
}

/// Best-effort check of whether a recorded owner is still running.
pub trait ProcessProbe: Send + Sync {
    /// Return `false` only when the owner can never release its lock.
    fn is_alive(&self, owner: &Owner) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, owner: &Owner) -> bool {
        if owner.pid == 0 {
            return false;
        }

        // Different boot: every process from the old boot is gone
        if let (Some(recorded), Some(current)) = (&owner.boot_id, boot_id())
            && *recorded != current
        {
            return false;
        }

        if !pid_exists(owner.pid) {
            return false;
        }

        // Same pid, different start time: the pid was reused
        if let (Some(recorded), Some(current)) = (owner.start_time, process_start_time(owner.pid))
            && recorded != current
        {
            return false;
        }

        true
    }
}

/// Check for a process via `kill(pid, 0)`, which sends no signal.
#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a probe, never declare an owner dead.
#[cfg(not(unix))]
fn pid_exists(_pid: u32) -> bool {
    true
}

/// Start time of `pid` in clock ticks since boot (field 22 of `/proc/<pid>/stat`).
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name (field 2) may contain spaces and parentheses
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // after_comm starts at field 3, so field 22 is index 19
    after_comm.split_whitespace().nth(19)?.parse().ok()
}

/// Start time of `pid`; not available on this platform.
#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: u32) -> Option<u64> {
    None
}

/// Current kernel boot id.
#[cfg(target_os = "linux")]
pub fn boot_id() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Current kernel boot id; not available on this platform.
#[cfg(not(target_os = "linux"))]
pub fn boot_id() -> Option<String> {
    None
}

/// Host name of this machine.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..end]).to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let me = Owner::current();
        assert_eq!(me.pid, std::process::id());
        assert!(SystemProbe.is_alive(&me));
    }

    #[test]
    fn test_pid_zero_is_not_alive() {
        let owner = Owner {
            pid: 0,
            ..Owner::current()
        };
        assert!(!SystemProbe.is_alive(&owner));
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let owner = Owner {
            pid,
            label: "test:true".into(),
            start_time: None,
            boot_id: None,
        };
        assert!(!SystemProbe.is_alive(&owner));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reused_pid_with_other_start_time_is_dead() {
        let me = Owner::current();
        let start = me.start_time.expect("linux exposes start time");
        let impostor = Owner {
            start_time: Some(start + 1),
            ..me.clone()
        };
        assert!(!SystemProbe.is_alive(&impostor));
        assert!(!me.same_process(&impostor));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_other_boot_is_dead() {
        let owner = Owner {
            boot_id: Some("00000000-0000-0000-0000-000000000000".into()),
            ..Owner::current()
        };
        assert!(!SystemProbe.is_alive(&owner));
    }

    #[test]
    fn test_same_process_ignores_missing_fields() {
        let me = Owner::current();
        let bare = Owner {
            pid: me.pid,
            label: "elsewhere".into(),
            start_time: None,
            boot_id: None,
        };
        assert!(me.same_process(&bare));

        let other = Owner {
            pid: me.pid.wrapping_add(1),
            ..me.clone()
        };
        assert!(!me.same_process(&other));
    }

    #[test]
    fn test_hostname_is_not_empty() {
        assert!(!hostname().is_empty());
    }
}
