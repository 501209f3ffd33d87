//! Failure reporting for paths where the heap itself is suspect.
//!
//! These run while the process wide lock is held, possibly with this crate
//! installed as the global allocator, so nothing here may allocate or call
//! back into the public entry points. Messages go straight to file
//! descriptor 2: `std`'s stderr handle buffers behind a lock and can
//! allocate on first use.

use std::process;

/// Writes `message` to stderr with a single raw `write(2)`.
pub(crate) fn write_stderr(message: &str) {
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    }
}

/// Reports an unrecoverable heap misuse and terminates the process with
/// exit status 1.
pub(crate) fn fatal(message: &str) -> ! {
    write_stderr(message);
    process::exit(1);
}
