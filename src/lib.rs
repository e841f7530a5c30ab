mod allocator;
mod buffer;
mod descriptor;
mod device;
mod resources;
mod shader;
mod transfer;
mod transform;

pub use allocator::{AllocatorState, FreeListAllocator, LinearAllocator, INVALID_ADDRESS};
pub use buffer::*;
pub use descriptor::*;
pub use device::*;
pub use resources::*;
pub use shader::*;
pub use transfer::*;
pub use transform::*;
