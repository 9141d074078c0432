//! Constants for the memory pool backing [`crate::osa::StaticPool`].

/// Size of 2 MiB.
pub const SZ_2M: usize = 2 * 1024 * 1024;
/// Max size managed by the TLSF pool — sized for a handful of concurrent
/// Extended-CSD/SD-Status temporary buffers, not bulk sector storage (the
/// upper layer's buffer pool owns sector-sized read/write buffers).
pub const MAX_POOL_SIZE: usize = SZ_2M;
