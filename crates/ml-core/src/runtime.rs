use std::sync::Once;

use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tracing::{debug, warn};

/// Make libtorch's CUDA kernels visible before the first CUDA device is used.
/// Torch registers them from shared objects the linker may have dropped.
pub(crate) fn load_torch_cuda_runtime() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut handles = Vec::new();
        for lib in [
            "libtorch_cuda.so",
            "libtorch_cuda_cu.so",
            "libtorch_cuda_cpp.so",
        ] {
            match unsafe { Library::open(Some(lib), RTLD_NOW | RTLD_GLOBAL) } {
                Ok(handle) => {
                    debug!("Loaded {lib}");
                    handles.push(handle);
                }
                Err(err) => warn!("failed to load {lib}: {err}"),
            }
        }
        Box::leak(Box::new(handles));
    });
}
