//! Resolution of the host's real I/O primitives via `dlsym(RTLD_NEXT, ...)`.
//!
//! The shim must never call its own public names (`write`, `pwrite`,
//! `read`, `pread`) internally — doing so would recurse back into the
//! interposer. These trampolines are the only way the pipeline performs
//! non-clone I/O (spec.md §4.1, §9 "Recursion hazard").

use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::OnceLock;

use libc::{off_t, size_t, ssize_t};

pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type PwriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t, off_t) -> ssize_t;
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type PreadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, off_t) -> ssize_t;

pub struct Trampolines {
    pub write: WriteFn,
    pub pwrite: PwriteFn,
    pub read: ReadFn,
    pub pread: PreadFn,
}

static TRAMPOLINES: OnceLock<Trampolines> = OnceLock::new();

/// Resolves a single symbol via `dlsym(RTLD_NEXT, name)`. A missing
/// symbol is fatal (spec.md §4.1): the caller aborts the process.
fn resolve(name: &'static str) -> *mut c_void {
    let cname = CString::new(name).expect("symbol name contains a NUL byte");
    // SAFETY: `dlsym` with `RTLD_NEXT` is the documented mechanism for
    // locating the next definition of `name` in the library search order
    // after this shared object; `cname` stays alive for the call.
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
    if sym.is_null() {
        tracing::error!(
            target: "writededuper",
            message = "undeclared symbol, aborting",
            symbol = name,
        );
        std::process::abort();
    }
    sym
}

/// Resolves and caches all four trampolines. Safe to call from multiple
/// racing first-callers (spec.md §4.7): only the winner's work is kept.
pub fn get() -> &'static Trampolines {
    TRAMPOLINES.get_or_init(|| {
        // SAFETY: each resolved symbol is transmuted to the exact C ABI
        // signature of the libc primitive it names.
        unsafe {
            Trampolines {
                write: std::mem::transmute::<*mut c_void, WriteFn>(resolve("write")),
                pwrite: std::mem::transmute::<*mut c_void, PwriteFn>(resolve("pwrite")),
                read: std::mem::transmute::<*mut c_void, ReadFn>(resolve("read")),
                pread: std::mem::transmute::<*mut c_void, PreadFn>(resolve("pread")),
            }
        }
    })
}
