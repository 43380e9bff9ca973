use std::sync::OnceLock;

use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tracing::debug;

/// Shared objects libtorch dlopens lazily for CUDA support.
const CUDA_LIBRARIES: [&str; 3] = [
    "libtorch_cuda.so",
    "libtorch_cuda_cu.so",
    "libtorch_cuda_cpp.so",
];

/// Pull the libtorch CUDA libraries into the process before the first model
/// load. Nothing in the binary references their symbols, so without this the
/// linker skips them and CUDA devices report as unavailable even on GPU
/// hosts.
///
/// Returns whether at least one library loaded; `false` means inference will
/// stay on the CPU. The handles live in a process-wide cache, so repeated
/// calls are cheap and report the outcome of the first.
pub fn preload_cuda_runtime() -> bool {
    static HANDLES: OnceLock<Vec<Library>> = OnceLock::new();
    let handles = HANDLES.get_or_init(|| {
        CUDA_LIBRARIES
            .into_iter()
            .filter_map(|name| {
                match unsafe { Library::open(Some(name), RTLD_NOW | RTLD_GLOBAL) } {
                    Ok(handle) => {
                        debug!(library = name, "loaded CUDA runtime library");
                        Some(handle)
                    }
                    Err(err) => {
                        debug!(library = name, "CUDA runtime library unavailable: {err}");
                        None
                    }
                }
            })
            .collect()
    });
    !handles.is_empty()
}
