//! The fatal error path.
//!
//! Errors the allocator cannot recover from (no virtual memory left, a
//! corrupted header, a bucket tag mismatch) end the process. Before doing so
//! a report is written to standard error without allocating, and the crash
//! hook registered with [`set_crash_hook`] runs.

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Something that can describe its state in a crash report.
pub trait Diagnostics {
    fn report(&self, w: &mut dyn fmt::Write) -> fmt::Result;
}

static CRASH_HOOK: AtomicUsize = AtomicUsize::new(0);
#[cfg_attr(test, allow(dead_code))]
static CRASHING: AtomicBool = AtomicBool::new(false);

/// Registers a function to run after the crash report is written and
/// before the process aborts.
///
/// The hook must not allocate.
pub fn set_crash_hook(hook: fn()) {
    CRASH_HOOK.store(hook as usize, Ordering::Release);
}

fn run_crash_hook() {
    let hook = CRASH_HOOK.load(Ordering::Acquire);

    if hook != 0 {
        // SAFETY: only ever stores `fn()` pointers
        let hook: fn() = unsafe { core::mem::transmute(hook) };
        hook();
    }
}

/// Writes straight to file descriptor 2.
#[cfg(all(feature = "system-backed", unix))]
pub(crate) struct StderrWriter;

#[cfg(all(feature = "system-backed", unix))]
impl fmt::Write for StderrWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();

        while !bytes.is_empty() {
            let n = unsafe { libc::write(2, bytes.as_ptr().cast(), bytes.len()) };
            if n <= 0 {
                return Err(fmt::Error);
            }
            bytes = &bytes[n as usize..];
        }

        Ok(())
    }
}

/// Reports an unrecoverable condition and ends the process.
#[cold]
#[inline(never)]
pub(crate) fn report_and_abort(diag: Option<&dyn Diagnostics>, args: fmt::Arguments<'_>) -> ! {
    #[cfg(test)]
    {
        let _ = diag;
        panic!("xmalloc: fatal: {}", args);
    }

    #[cfg(not(test))]
    {
        if CRASHING.swap(true, Ordering::AcqRel) {
            abort_now();
        }

        write_report(diag, args);
        run_crash_hook();
        abort_now();
    }
}

#[cfg(not(test))]
fn write_report(diag: Option<&dyn Diagnostics>, args: fmt::Arguments<'_>) {
    #[cfg(all(feature = "system-backed", unix))]
    {
        use fmt::Write;

        let mut w = StderrWriter;
        let _ = writeln!(w, "xmalloc: fatal: {}", args);
        if let Some(diag) = diag {
            let _ = diag.report(&mut w);
            let _ = writeln!(w);
        }
    }

    #[cfg(not(all(feature = "system-backed", unix)))]
    let _ = (diag, args);
}

#[cfg_attr(test, allow(dead_code))]
fn abort_now() -> ! {
    #[cfg(all(feature = "system-backed", unix))]
    unsafe {
        libc::abort()
    }

    #[cfg(not(all(feature = "system-backed", unix)))]
    panic!("xmalloc: fatal error")
}

/// Raises a fatal error with a formatted message.
macro_rules! fatal {
    ($diag:expr, $($arg:tt)+) => {
        $crate::crash::report_and_abort($diag, format_args!($($arg)+))
    };
}
pub(crate) use fatal;
