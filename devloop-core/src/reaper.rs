//! Best-effort cleanup of stale listeners.
//!
//! Finds whichever processes hold a TCP port in LISTEN state and kills them so
//! a fresh backend can bind. Reaping a port nobody listens on is a no-op.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReapError {
    #[error("failed to inspect listeners on port {port}: {source}")]
    Inspect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to kill pid {pid}: {reason}")]
    Kill { pid: u32, reason: String },
}

/// Kill every process listening on `port`. Returns the pids that were signalled.
///
/// The current process is never included, even if it owns the listener.
pub fn reap_port(port: u16) -> Result<Vec<u32>, ReapError> {
    let own = std::process::id();
    let pids: Vec<u32> = listening_pids(port)?
        .into_iter()
        .filter(|pid| *pid != own && *pid != 0)
        .collect();

    let mut killed = Vec::with_capacity(pids.len());
    let mut first_err = None;
    for pid in pids {
        tracing::warn!(port, pid, "killing stale listener");
        match kill_pid(pid) {
            Ok(()) => killed.push(pid),
            Err(e) => {
                tracing::warn!(port, pid, error = %e, "failed to kill stale listener");
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) if killed.is_empty() => Err(e),
        _ => Ok(killed),
    }
}

/// Pids of processes holding `port` in LISTEN state.
#[cfg(target_os = "linux")]
fn listening_pids(port: u16) -> Result<Vec<u32>, ReapError> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match std::fs::read_to_string(table) {
            Ok(contents) => inodes.extend(listening_inodes(&contents, port)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ReapError::Inspect { port, source }),
        }
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let proc_dir =
        std::fs::read_dir("/proc").map_err(|source| ReapError::Inspect { port, source })?;

    let mut pids = Vec::new();
    for entry in proc_dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes owned by other users are unreadable; skip them.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let owns_socket = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .ok()
                .and_then(|target| socket_inode(&target.to_string_lossy()))
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if owns_socket {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn listening_pids(port: u16) -> Result<Vec<u32>, ReapError> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .map_err(|source| ReapError::Inspect { port, source })?;
    // lsof exits 1 when nothing matches.
    Ok(parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(windows)]
fn listening_pids(port: u16) -> Result<Vec<u32>, ReapError> {
    let output = std::process::Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .output()
        .map_err(|source| ReapError::Inspect { port, source })?;
    Ok(parse_netstat_listening(
        &String::from_utf8_lossy(&output.stdout),
        port,
    ))
}

/// Socket inodes from a `/proc/net/tcp`-format table that listen on `port`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port != port || *state != TCP_LISTEN {
                return None;
            }
            inode.parse::<u64>().ok().filter(|i| *i != 0)
        })
        .collect()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn socket_inode(link_target: &str) -> Option<u64> {
    link_target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg_attr(any(target_os = "linux", windows), allow(dead_code))]
fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Parse `netstat -ano` rows such as
/// `  TCP    0.0.0.0:8080    0.0.0.0:0    LISTENING    4242`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_listening(output: &str, port: u16) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || !fields[3].eq_ignore_ascii_case("LISTENING") {
                return None;
            }
            let (_, local_port) = fields[1].rsplit_once(':')?;
            if local_port.parse::<u16>().ok()? != port {
                return None;
            }
            fields[4].parse().ok()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Forcibly kill a single pid.
#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<(), ReapError> {
    let raw = i32::try_from(pid).map_err(|_| ReapError::Kill {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    let r = unsafe { libc::kill(raw, libc::SIGKILL) };
    if r == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(ReapError::Kill {
        pid,
        reason: err.to_string(),
    })
}

#[cfg(windows)]
fn kill_pid(pid: u32) -> Result<(), ReapError> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map_err(|e| ReapError::Kill {
            pid,
            reason: e.to_string(),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(ReapError::Kill {
            pid,
            reason: format!("taskkill exited with {status}"),
        })
    }
}
