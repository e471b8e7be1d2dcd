//! Process signal handling.
//!
//! SIGPIPE is ignored so that writing to a closed peer surfaces as an
//! `EPIPE` error on the connection instead of killing the process.
//! SIGINT and SIGTERM are blocked in every thread and consumed by a
//! dedicated thread with `sigwait`, which turns the first one into a
//! graceful shutdown. A second one exits immediately.

use crate::runtime::ServerHandle;
use std::io;
use std::mem::MaybeUninit;
use std::thread;
use tracing::{error, info, warn};

/// Ignore SIGPIPE for the whole process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn shutdown_signals() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGINT);
        libc::sigaddset(set.as_mut_ptr(), libc::SIGTERM);
        set.assume_init()
    }
}

/// Block SIGINT and SIGTERM in the calling thread.
///
/// Threads inherit the mask, so call this before spawning any.
pub fn block_shutdown_signals() -> io::Result<()> {
    let set = shutdown_signals();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Spawn the thread that waits for SIGINT/SIGTERM and stops the server.
pub fn spawn_shutdown_listener(handle: ServerHandle) -> io::Result<()> {
    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            let set = shutdown_signals();
            let mut requested = false;
            loop {
                let mut sig: libc::c_int = 0;
                let rc = unsafe { libc::sigwait(&set, &mut sig) };
                if rc != 0 {
                    error!(error = %io::Error::from_raw_os_error(rc), "sigwait failed");
                    return;
                }

                if requested {
                    warn!(signal = sig, "Second shutdown signal, exiting");
                    std::process::exit(128 + sig);
                }
                requested = true;

                info!(
                    signal = sig,
                    live = handle.live_connections(),
                    "Shutdown signal received"
                );
                if let Err(e) = handle.shutdown() {
                    error!(error = %e, "Failed to request shutdown");
                }
            }
        })?;
    Ok(())
}
