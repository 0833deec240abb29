//! Per-process output drain.
//!
//! Each spawned tunnel gets one pump thread that reads the child's
//! combined stdout/stderr pipe without ever blocking the supervisor.
//! Reads are non-blocking: when no data is ready the pump sleeps for a
//! bounded interval and re-checks the stop flag and the child's state.
//! Completed lines land in the log sink tagged with the instance alias;
//! a terminal record with the exit code closes the stream.

use crate::log_sink::LogSink;
use parking_lot::Mutex;
use std::io::{self, ErrorKind, PipeReader, Read};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// Sleep between read attempts when the pipe has no data ready.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for the exit status to become collectable.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(2);

pub struct OutputPump;

impl OutputPump {
    /// Spawns the drain thread for one child. The pump holds only a weak
    /// reference to the child handle; the supervisor table keeps the
    /// owning one, so a dropped table entry ends the pump.
    pub fn spawn(
        key: &str,
        alias: String,
        reader: PipeReader,
        child: Weak<Mutex<Child>>,
        sink: Arc<LogSink>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("pump-{key}"))
            .spawn(move || pump_loop(alias, reader, child, sink, stop))
    }
}

fn pump_loop(
    alias: String,
    mut reader: PipeReader,
    child: Weak<Mutex<Child>>,
    sink: Arc<LogSink>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf) {
            // All write ends closed: the child is gone.
            Ok(0) => {
                flush_pending(&sink, &alias, &mut pending);
                emit_exit_record(&sink, &alias, &child);
                return;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                drain_lines(&sink, &alias, &mut pending);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if stop.load(Ordering::SeqCst) {
                    flush_pending(&sink, &alias, &mut pending);
                    return;
                }
                if child_exited(&child) {
                    drain_remaining(&mut reader, &mut pending);
                    drain_lines(&sink, &alias, &mut pending);
                    flush_pending(&sink, &alias, &mut pending);
                    emit_exit_record(&sink, &alias, &child);
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(alias = %alias, "output pump read failed: {err}");
                flush_pending(&sink, &alias, &mut pending);
                return;
            }
        }
    }
}

/// Forward every complete line in `pending` to the sink. Lines are
/// trimmed; blank lines are dropped. Invalid UTF-8 decodes lossily.
fn drain_lines(sink: &LogSink, alias: &str, pending: &mut Vec<u8>) {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let decoded = String::from_utf8_lossy(&raw);
        let line = decoded.trim();
        if !line.is_empty() {
            sink.append(alias, line);
        }
    }
}

/// Emit leftover bytes as one final line, if any.
fn flush_pending(sink: &LogSink, alias: &str, pending: &mut Vec<u8>) {
    if pending.is_empty() {
        return;
    }
    let decoded = String::from_utf8_lossy(pending);
    let line = decoded.trim();
    if !line.is_empty() {
        sink.append(alias, line);
    }
    pending.clear();
}

fn child_exited(child: &Weak<Mutex<Child>>) -> bool {
    match child.upgrade() {
        Some(handle) => matches!(handle.lock().try_wait(), Ok(Some(_))),
        // Table entry dropped; nothing left to watch.
        None => true,
    }
}

/// After exit detection there may still be buffered bytes in the pipe;
/// pull them until the pipe reports empty or closed.
fn drain_remaining(reader: &mut PipeReader, pending: &mut Vec<u8>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            // WouldBlock: an exited child writes no more.
            Err(_) => return,
        }
    }
}

/// Terminal record for the stream. The exit status may take a moment to
/// become collectable after the pipe closes, so poll briefly.
fn emit_exit_record(sink: &LogSink, alias: &str, child: &Weak<Mutex<Child>>) {
    let deadline = Instant::now() + EXIT_STATUS_WAIT;
    loop {
        let Some(handle) = child.upgrade() else {
            sink.append(alias, "process exited");
            return;
        };
        let polled = handle.lock().try_wait();
        match polled {
            Ok(Some(status)) => {
                match status.code() {
                    Some(code) => sink.append(alias, &format!("process exited with code {code}")),
                    None => sink.append(alias, "process terminated by signal"),
                }
                return;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    sink.append(alias, "process exited");
                    return;
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                warn!(alias = %alias, "could not collect exit status: {err}");
                sink.append(alias, "process exited");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn drain_lines_splits_trims_and_skips_blanks() {
        let dir = tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("t.log"));
        let mut pending = b"first line\r\n\n  second  \npartial".to_vec();

        drain_lines(&sink, "tun", &mut pending);

        let lines = sink.tail(10);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[tun] first line"));
        assert!(lines[1].ends_with("[tun] second"));
        assert_eq!(pending, b"partial");
    }

    #[test]
    fn flush_pending_emits_final_partial_line() {
        let dir = tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("t.log"));
        let mut pending = b"tail without newline".to_vec();

        flush_pending(&sink, "tun", &mut pending);

        let lines = sink.tail(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("tail without newline"));
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_utf8_decodes_with_replacement() {
        let dir = tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("t.log"));
        let mut pending = vec![b'o', b'k', 0xff, 0xfe, b'\n'];

        drain_lines(&sink, "tun", &mut pending);

        let lines = sink.tail(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains('\u{fffd}'));
    }
}
