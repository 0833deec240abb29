//! OS-specific process and pipe helpers.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{prepare_command, process_alive, send_sigterm, set_nonblocking};

#[cfg(not(unix))]
mod fallback;
#[cfg(not(unix))]
pub use fallback::{prepare_command, process_alive, send_sigterm, set_nonblocking};
