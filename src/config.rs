use std::time::Duration;

/// Size of a block, in bytes. All addressing the pipeline performs is in
/// whole blocks; calls whose length or offset are not multiples of this
/// value are never touched by the pipeline (see `pipeline::classify`).
pub const BLOCK_SIZE: usize = 4096;

/// Working-descriptor cache is scanned for stale entries once its
/// population reaches this many descriptors.
pub const WORKING_FD_THRESHOLD: usize = 1000;

/// Entries older than this are evicted once the threshold is crossed.
pub const WORKING_FD_MAX_AGE: Duration = Duration::from_secs(1);

/// Which fingerprint index backend to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexBackend {
    InProcess,
    Redis,
}

impl Default for IndexBackend {
    fn default() -> Self {
        IndexBackend::InProcess
    }
}

/// Redis connection target: either host/port for TCP, or a bare path to a
/// UNIX socket when no port is configured.
#[derive(Clone, Debug)]
pub enum RedisAddr {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

#[derive(Clone, Debug)]
pub struct ShimConfig {
    pub index_backend: IndexBackend,
    pub redis_addr: RedisAddr,
    pub log_filter: String,
}

impl ShimConfig {
    /// Reads `LIBWRITEDEDUPER_*` environment variables once at shim load.
    /// Never fails: every variable has a documented default, matching
    /// spec.md's "never make the shim fail to load over configuration."
    pub fn from_env() -> Self {
        let host = std::env::var("LIBWRITEDEDUPER_REDIS_HOST")
            .unwrap_or_else(|_| "127.0.0.1".to_string());

        let redis_addr = match std::env::var("LIBWRITEDEDUPER_REDIS_PORT") {
            Ok(port_str) => match port_str.parse::<u16>() {
                Ok(port) => RedisAddr::Tcp { host, port },
                Err(_) => {
                    tracing::warn!(
                        target: "writededuper",
                        message = "invalid LIBWRITEDEDUPER_REDIS_PORT, falling back to unix socket",
                        value = %port_str,
                    );
                    RedisAddr::Unix { path: host }
                }
            },
            Err(_) => RedisAddr::Unix { path: host },
        };

        let index_backend = match std::env::var("LIBWRITEDEDUPER_INDEX").as_deref() {
            Ok("redis") => IndexBackend::Redis,
            Ok("inprocess") | Err(_) => IndexBackend::InProcess,
            Ok(other) => {
                tracing::warn!(
                    target: "writededuper",
                    message = "unrecognized LIBWRITEDEDUPER_INDEX, defaulting to inprocess",
                    value = %other,
                );
                IndexBackend::InProcess
            }
        };

        let log_filter =
            std::env::var("LIBWRITEDEDUPER_LOG").unwrap_or_else(|_| "warn".to_string());

        Self {
            index_backend,
            redis_addr,
            log_filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // SAFETY: test-only removal of env vars this process may have set;
        // no other thread in this test binary reads these keys concurrently.
        unsafe {
            std::env::remove_var("LIBWRITEDEDUPER_REDIS_HOST");
            std::env::remove_var("LIBWRITEDEDUPER_REDIS_PORT");
            std::env::remove_var("LIBWRITEDEDUPER_INDEX");
            std::env::remove_var("LIBWRITEDEDUPER_LOG");
        }
        let cfg = ShimConfig::from_env();
        assert_eq!(cfg.index_backend, IndexBackend::InProcess);
        assert!(matches!(cfg.redis_addr, RedisAddr::Unix { path } if path == "127.0.0.1"));
        assert_eq!(cfg.log_filter, "warn");
    }
}
