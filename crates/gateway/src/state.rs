//! Shared application state and memory management.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system.
#[cfg(not(target_env = "msvc"))]
pub(crate) fn release_memory_to_os() {
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.4096.purge".as_ptr().cast(),
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            0,
        );
    }
}

#[cfg(target_env = "msvc")]
pub(crate) fn release_memory_to_os() {}

#[cfg(not(target_env = "msvc"))]
use std::ptr;
use std::sync::Arc;

use axum::extract::State as AxumState;
use gateway_core::pipeline::GatewayCore;

pub(crate) type SharedCore = Arc<GatewayCore>;

pub(crate) type AppState = AxumState<SharedCore>;
