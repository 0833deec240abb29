use std::io;
use std::os::fd::AsRawFd;
use std::process::Command;

/// Prepare the execution environment for a tunnel child process.
///
/// The child gets its own process group, and on Linux a parent-death
/// signal so tunnels cannot outlive a killed supervisor.
pub fn prepare_command(cmd: &mut Command) -> io::Result<()> {
    use std::os::unix::process::CommandExt;

    unsafe {
        cmd.pre_exec(|| {
            if set_process_group() != 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                if set_parent_death_signal() != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    Ok(())
}

/// Check if a PID refers to a live process.
pub fn process_alive(pid: u32) -> bool {
    match send_signal(pid as libc::pid_t, 0) {
        Ok(()) => true,
        // EPERM means the process exists but we may not signal it.
        Err(errno) => errno == libc::EPERM,
    }
}

/// Request graceful termination. Escalation to SIGKILL after the grace
/// window is the caller's job.
pub fn send_sigterm(pid: u32) -> bool {
    send_signal(pid as libc::pid_t, libc::SIGTERM).is_ok()
}

/// Switch a pipe read end to non-blocking mode so drain loops can poll
/// instead of parking on `read`.
pub fn set_nonblocking<F: AsRawFd>(handle: &F) -> io::Result<()> {
    let fd = handle.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Safely set process group ID
///
/// Encapsulates unsafe setpgid call
unsafe fn set_process_group() -> libc::c_int {
    unsafe { libc::setpgid(0, 0) }
}

/// Safely set parent death signal
///
/// Encapsulates unsafe prctl call
#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> libc::c_int {
    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) }
}

/// Safely send signal
///
/// Encapsulates unsafe kill call and returns Result instead of raw error code
fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> Result<(), libc::c_int> {
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}
