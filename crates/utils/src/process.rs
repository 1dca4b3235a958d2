//! Liveness checks and signalling for processes known only by PID.
//!
//! The persisted PID on an environment snapshot outlives the daemon that
//! spawned it, so these helpers never assume the PID belongs to a child of
//! this process. PIDs may be recycled by the OS; callers treat them as a
//! best-effort fallback only.

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(code) if code == libc::EPERM
    )
}

#[cfg(windows)]
pub fn is_process_running(pid: u32) -> bool {
    use windows_sys::Win32::{
        Foundation::{CloseHandle, STILL_ACTIVE},
        System::Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION},
    };

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code) != 0;
        CloseHandle(handle);
        ok && code == STILL_ACTIVE as u32
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_process_running(_: u32) -> bool {
    false
}

/// Ask a process (and, on unix, its process group when it leads one) to terminate.
///
/// Returns `Ok(false)` when no such process exists.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> std::io::Result<bool> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pid <= 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "refusing to signal non-positive pid",
        ));
    }

    // Lifecycle commands are spawned as group leaders, so signal the group first.
    if unsafe { libc::killpg(pid, libc::SIGTERM) } == 0 {
        return Ok(true);
    }
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(pid: u32) -> std::io::Result<bool> {
    if !is_process_running(pid) {
        return Ok(false);
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "terminating a process by pid is only supported on unix",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn zero_pid_is_not_running() {
        assert!(!is_process_running(0));
        assert!(terminate_pid(0).is_err());
    }

    #[test]
    fn terminate_kills_spawned_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();
        assert!(terminate_pid(pid).unwrap());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
