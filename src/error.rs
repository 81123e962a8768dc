/// Conditions the pipeline can hit while servicing a call.
///
/// `Fallback` covers every condition spec.md's error-handling design
/// classifies as "route the remainder through the underlying primitive,
/// never propagate a failure the underlying primitive wouldn't itself
/// have produced." `CallFailed` covers the one case where the shim must
/// return `-1` to the caller: the underlying primitive failed in the miss
/// branch, or the post-clone position update failed.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("call is not block-aligned")]
    Misaligned,

    #[error("could not resolve fd to a path: {0}")]
    PathResolution(#[source] std::io::Error),

    #[error("could not acquire a working descriptor for {path}: {source}")]
    WorkingFdOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("source block read short or unreadable")]
    SourceReadShort,

    #[error("source block did not match: fingerprint collision")]
    VerificationMismatch,

    #[error("range-clone failed: {0}")]
    CloneFailed(#[source] std::io::Error),

    #[error("underlying primitive failed: {0}")]
    PrimitiveFailed(#[source] std::io::Error),

    #[error("post-clone file position update failed: {0}")]
    PositionUpdateFailed(#[source] std::io::Error),
}

impl ShimError {
    /// Whether this condition means "fall back to the real primitive and
    /// say nothing went wrong" (spec.md §7, "per-call fallback") as
    /// opposed to "return -1, this call has genuinely failed."
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            ShimError::Misaligned
                | ShimError::PathResolution(_)
                | ShimError::WorkingFdOpen { .. }
                | ShimError::SourceReadShort
                | ShimError::VerificationMismatch
                | ShimError::CloneFailed(_)
        )
    }
}

/// Fatal, load-time-only failures. Every call site that produces one
/// terminates the process after emitting a diagnostic (spec.md §7,
/// "fatal-on-load").
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("undeclared symbol `{0}`")]
    MissingSymbol(&'static str),

    #[cfg(feature = "redis-index")]
    #[error("external fingerprint index unreachable: {0}")]
    IndexUnreachable(#[source] redis::RedisError),
}
