//! Shared test-only [`Kernel`] registration.
//!
//! `set_impl!` defines a single crate-wide `#[no_mangle]` symbol, so exactly
//! one test module may invoke it; everything under `#[cfg(test)]` that needs
//! [`crate::kernel::sleep`] to resolve at link time shares this one.

use crate::Kernel;
use core::time::Duration;

pub struct NoopKernel;

impl Kernel for NoopKernel {
    fn sleep(_duration: Duration) {}
}

crate::set_impl!(NoopKernel);
