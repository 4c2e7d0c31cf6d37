//! Diagnostics that are safe to emit from inside `malloc`.
//!
//! Messages are formatted into one static buffer and written straight to
//! file descriptor 2.  Nothing here calls into the allocator: the buffer is
//! preallocated, the lock is a spinlock that needs no construction at runtime,
//! and `format_args!` does not allocate.

use std::fmt::{self, Write};

use spin::Mutex;

use crate::config::DIAG_BUF_LEN;

const PREFIX: &str = "latalloc: ";

/// Fixed-size message buffer.  Output that does not fit is truncated.
pub(crate) struct MessageBuf {
    bytes: [u8; DIAG_BUF_LEN],
    len: usize,
}

impl MessageBuf {
    pub(crate) const fn new() -> Self {
        MessageBuf {
            bytes: [0; DIAG_BUF_LEN],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    // Make room for and append a trailing newline, unless one is already there.
    fn terminate_line(&mut self) {
        if self.as_bytes().last() == Some(&b'\n') {
            return;
        }
        if self.len == DIAG_BUF_LEN {
            self.len -= 1;
        }
        self.bytes[self.len] = b'\n';
        self.len += 1;
    }
}

impl Write for MessageBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = DIAG_BUF_LEN - self.len;
        let n = s.len().min(room);
        self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

static DIAG_BUF: Mutex<MessageBuf> = Mutex::new(MessageBuf::new());

fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let written =
            unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

fn emit(args: fmt::Arguments<'_>) {
    let mut buf = DIAG_BUF.lock();
    buf.clear();
    let _ = buf.write_str(PREFIX);
    let _ = buf.write_fmt(args);
    buf.terminate_line();
    write_stderr(buf.as_bytes());
}

/// Write a message to stderr without allocating.  Use through [`log!`](crate::log).
pub fn log(args: fmt::Arguments<'_>) {
    emit(args);
}

/// Write a message to stderr without allocating and abort the process.
/// Use through [`fatal!`](crate::fatal).
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    emit(format_args!("fatal: {}", args));
    unsafe { libc::abort() }
}

#[doc(hidden)]
#[cold]
pub fn assert_failed(
    assertion: &str,
    file: &str,
    line: u32,
    module: &str,
    args: fmt::Arguments<'_>,
) -> ! {
    fatal(format_args!(
        "{}:{}:{}: ASSERTION '{}' FAILED: {}",
        file, line, module, assertion, args
    ))
}

/// `eprintln!` that never allocates.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::diag::log(format_args!($($arg)*))
    };
}

/// Report an unrecoverable condition on stderr and abort.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::diag::fatal(format_args!($($arg)*))
    };
}

/// Like `assert!`, but safe inside the allocator and active in release builds.
#[macro_export]
macro_rules! hard_assert {
    ($cond:expr) => {
        $crate::hard_assert!($cond, "")
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::diag::assert_failed(
                stringify!($cond),
                file!(),
                line!(),
                module_path!(),
                format_args!($($arg)*),
            )
        }
    };
}
