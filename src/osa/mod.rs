//! # Operating System Abstraction Layer (OSA)
//!
//! Backs the `SectorBufferPool` collaborator: the external buffer pool the
//! bring-up sequence borrows a single temporary sector buffer from while
//! reading Extended CSD, released before the bus lock is dropped.
//! Implemented with a TLSF (Two-Level Segregated Fit) allocator.
//!
//! ## Components
//!
//! - **FMemp**: memory pool manager using TLSF
//! - **PoolBuffer**: safe wrapper for aligned memory allocations
//! - **StaticPool**: the crate's ready-made [`SectorBufferPool`] impl over
//!   the global TLSF arena; embedders may supply their own instead.
//!
//! ## Usage
//!
//! ```rust
//! use sdmmc_core::osa::{osa_init, osa_alloc_aligned};
//!
//! // Initialize the memory pool
//! osa_init();
//!
//! // Allocate aligned memory
//! let buffer = osa_alloc_aligned(4096, 512).unwrap();
//! ```

#![deny(missing_docs)]
use core::{alloc::Layout, mem::MaybeUninit, ptr::NonNull};

use consts::MAX_POOL_SIZE;
use err::FMempError;
use lazy_static::*;
use pool_buffer::PoolBuffer;
use rlsf::Tlsf;
use spin::Mutex;

use crate::error::DeviceError;

mod consts;
pub mod err;
pub mod pool_buffer;

/// Memory managed by Tlsf pool
static mut POOL: [MaybeUninit<u8>; MAX_POOL_SIZE] = [MaybeUninit::uninit(); MAX_POOL_SIZE];

/// Tlsf memory pool controller.
///
/// This structure manages the memory pool using the TLSF algorithm
/// for efficient allocation and deallocation of variable-sized blocks.
pub struct FMemp<'a> {
    tlsf_ptr: Tlsf<'a, u32, u32, 32, 32>,
    /// Whether the pool is initialized
    is_ready: bool,
}

lazy_static! {
    /// Global memory pool manager
    pub static ref GLOBAL_FMEMP: Mutex<FMemp<'static>> =
        Mutex::new(FMemp::new());
}

impl<'a> FMemp<'a> {
    /// Constructor
    pub fn new() -> Self {
        Self {
            tlsf_ptr: Tlsf::new(),
            is_ready: false,
        }
    }

    unsafe fn init(&mut self) {
        self.tlsf_ptr.insert_free_block(&mut POOL[..]);
        self.is_ready = true;
    }

    unsafe fn alloc_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<PoolBuffer, FMempError> {
        let layout = Layout::from_size_align_unchecked(size, align);
        if let Some(addr) = self.tlsf_ptr.allocate(layout) {
            Ok(PoolBuffer::new(size, addr, align))
        } else {
            Err(FMempError::BadMalloc)
        }
    }

    unsafe fn dealloc(&mut self, addr: NonNull<u8>, size: usize) {
        self.tlsf_ptr.deallocate(addr, size);
    }
}

/// Init memory pool with size of ['MAX_POOL_SIZE']
pub fn osa_init() {
    unsafe {
        GLOBAL_FMEMP.lock().init();
    }
}

/// Alloc 'size' bytes space, aligned to 64 KiB by default
pub fn osa_alloc(size: usize) -> Result<PoolBuffer, FMempError> {
    unsafe { GLOBAL_FMEMP.lock().alloc_aligned(size, size_of::<usize>()) }
}

/// Alloc 'size' bytes space, aligned to 'align' bytes
pub fn osa_alloc_aligned(size: usize, align: usize) -> Result<PoolBuffer, FMempError> {
    unsafe { GLOBAL_FMEMP.lock().alloc_aligned(size, align) }
}

/// Dealloc 'size' bytes space from 'addr'
pub fn osa_dealloc(addr: NonNull<u8>, size: usize) {
    unsafe {
        GLOBAL_FMEMP.lock().dealloc(addr, size);
    }
}

/// The Buffer Pool collaborator, external to the core: lends the bring-up
/// sequence a single temporary sector buffer for the Extended-CSD read and
/// nothing else — the Sector I/O Engine moves data straight between the
/// card and the caller's own buffer, never through this pool.
pub trait SectorBufferPool {
    /// Borrow a buffer of at least `size` bytes. Returns `BufferUnavailable`
    /// if the pool is exhausted.
    fn acquire(&self, size: usize) -> Result<PoolBuffer, DeviceError>;
}

/// The crate's ready-made [`SectorBufferPool`], backed by the global TLSF
/// arena. Embedders who already run their own allocator can supply their
/// own impl instead — the state machine depends only on the trait.
pub struct StaticPool;

impl SectorBufferPool for StaticPool {
    fn acquire(&self, size: usize) -> Result<PoolBuffer, DeviceError> {
        osa_alloc(size).map_err(|_| DeviceError::BufferUnavailable)
    }
}
