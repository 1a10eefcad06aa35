mod arena;
mod blob;
mod deferred;
mod done;
mod error;
mod pool;
mod tensor;

pub use arena::FreeList;
pub use blob::Blob;
pub use deferred::{DeferredRelease, Mark};
pub use done::{Completion, Done};
pub use error::{functions::*, DeviceError, LaunchError, LaunchErrorKind};
pub use pool::Pool;
pub use tensor::{Tensor, TensorLayout};

pub mod utils {
    use super::{shape_mismatch, type_mismatch, LaunchError, TensorLayout};

    /// 检查两个张量可以直接逐字节拷贝。
    pub(crate) fn check_copy(src: &TensorLayout, dst: &TensorLayout) -> Result<usize, LaunchError> {
        if src.dt != dst.dt {
            return Err(type_mismatch(format!("src: {:?}, dst: {:?}", src.dt, dst.dt)));
        }
        if src.shape != dst.shape {
            return Err(shape_mismatch(format!(
                "src: {:?}, dst: {:?}",
                src.shape, dst.shape
            )));
        }
        Ok(src.nbytes())
    }
}
