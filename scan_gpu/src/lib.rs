#![cfg_attr(
    target_os = "cuda",
    no_std,
    feature(register_attr),
    register_attr(nvvm_internal)
)]

pub mod element;
#[cfg(target_os = "cuda")]
pub mod kernels;
#[cfg(target_os = "cuda")]
mod step;

pub use element::{Element, SignEncoded};

/// The number of elements scanned by one block. Kernel launches must use this
/// as the block size so that each thread owns exactly one element.
pub const BLOCK_SIZE: usize = 256;
