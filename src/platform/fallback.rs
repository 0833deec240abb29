use std::io;
use std::process::Command;

pub fn prepare_command(_cmd: &mut Command) -> io::Result<()> {
    Ok(())
}

pub fn process_alive(_pid: u32) -> bool {
    false
}

pub fn send_sigterm(_pid: u32) -> bool {
    false
}

/// No-op: pumps fall back to blocking reads and end on pipe EOF.
pub fn set_nonblocking<F>(_handle: &F) -> io::Result<()> {
    Ok(())
}
