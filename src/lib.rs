mod config;
mod diagnostics;
mod error;
mod fingerprint;
mod path_resolver;
mod pipeline;
mod trampoline;
mod working_fd;

use std::os::raw::{c_int, c_void};
use std::sync::OnceLock;

use libc::{off_t, size_t, ssize_t};

use config::{IndexBackend, ShimConfig};
use fingerprint::{FingerprintIndex, InProcessIndex};
use working_fd::WorkingFdCache;

/// Everything the pipeline needs to service a call: the fingerprint index
/// (backend chosen by configuration) and the working-descriptor cache
/// (spec.md §3, "two process-wide singletons").
pub(crate) struct ShimContext {
    index: Box<dyn FingerprintIndex>,
    working_fds: WorkingFdCache,
}

static CONTEXT: OnceLock<ShimContext> = OnceLock::new();

/// Builds the process-wide context on first use. `OnceLock::get_or_init`
/// already gives us the "safe under parallel first-callers" guarantee
/// spec.md §4.7 and §9 ask for: every racing caller blocks on the same
/// initialization and only the winner's closure runs.
fn context() -> &'static ShimContext {
    CONTEXT.get_or_init(|| {
        let cfg = ShimConfig::from_env();
        diagnostics::init(&cfg.log_filter);

        let index: Box<dyn FingerprintIndex> = match cfg.index_backend {
            #[cfg(feature = "redis-index")]
            IndexBackend::Redis => match fingerprint::RedisIndex::connect(&cfg.redis_addr) {
                Ok(index) => Box::new(index),
                Err(error) => {
                    tracing::error!(
                        target: "writededuper",
                        message = "external fingerprint index unreachable, aborting",
                        %error,
                    );
                    std::process::abort();
                }
            },
            #[cfg(not(feature = "redis-index"))]
            IndexBackend::Redis => {
                tracing::warn!(
                    target: "writededuper",
                    message = "redis-index feature not compiled in, using in-process index",
                );
                Box::new(InProcessIndex::new())
            }
            IndexBackend::InProcess => Box::new(InProcessIndex::new()),
        };

        ShimContext {
            index,
            working_fds: WorkingFdCache::new(),
        }
    })
}

/// # Safety
/// `buf` must be valid for reads of `count` bytes, matching the contract
/// of the libc `write` primitive this shadows.
#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let slice = std::slice::from_raw_parts(buf.cast::<u8>(), count);
    pipeline::write(context(), fd, slice, None) as ssize_t
}

/// # Safety
/// `buf` must be valid for reads of `count` bytes, matching the contract
/// of the libc `pwrite` primitive this shadows.
#[no_mangle]
pub unsafe extern "C" fn pwrite(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    offset: off_t,
) -> ssize_t {
    let slice = std::slice::from_raw_parts(buf.cast::<u8>(), count);
    pipeline::write(context(), fd, slice, Some(offset)) as ssize_t
}

/// # Safety
/// `buf` must be valid for writes of `count` bytes, matching the contract
/// of the libc `read` primitive this shadows.
#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let slice = std::slice::from_raw_parts_mut(buf.cast::<u8>(), count);
    pipeline::read(context(), fd, slice, None) as ssize_t
}

/// # Safety
/// `buf` must be valid for writes of `count` bytes, matching the contract
/// of the libc `pread` primitive this shadows.
#[no_mangle]
pub unsafe extern "C" fn pread(
    fd: c_int,
    buf: *mut c_void,
    count: size_t,
    offset: off_t,
) -> ssize_t {
    let slice = std::slice::from_raw_parts_mut(buf.cast::<u8>(), count);
    pipeline::read(context(), fd, slice, Some(offset)) as ssize_t
}
