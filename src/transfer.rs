//! Seam to the property-transfer subsystem. The transform tree manager plans
//! batched per-property uploads and fills; an external handler records them
//! and reports which semaphores the consumer must wait on before its own
//! dispatch may read the destination.

use std::time::Instant;

use ash::vk;
use smallvec::SmallVec;
use thiserror::Error;

use crate::{BufferBinding, BufferRange};

/// Destination property array: a range of the pool buffer plus the byte
/// stride of one element.
#[derive(Clone, Copy, Debug, Default)]
pub struct PropertyBinding {
    pub dst: BufferRange,
    pub stride: u32,
}

/// Where one transfer's element data comes from.
#[derive(Clone, Copy, Debug)]
pub enum TransferSource<'a> {
    /// Replicate the single element at the binding into every destination.
    Fill(BufferBinding),
    /// Host data, staged by the handler.
    Upload(&'a [u8]),
    /// Device-local source read directly.
    Device(BufferBinding),
}

/// One batched property transfer. Address lists scatter (`dst_addresses`) or
/// gather (`src_addresses`) elements; `None` means contiguous.
pub struct PropertyTransferRequest<'a> {
    pub dst: PropertyBinding,
    pub element_count: u32,
    pub source: TransferSource<'a>,
    pub dst_addresses: Option<&'a [u32]>,
    pub src_addresses: Option<&'a [u32]>,
}

/// Recording context the handler works inside. `max_wait` bounds how long the
/// handler may block waiting for upstream staging space; `None` means the
/// handler's default deadline.
#[derive(Clone, Copy, Debug)]
pub struct TransferContext {
    pub cmdbuf: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub queue: vk::Queue,
    pub scratch: BufferBinding,
    pub max_wait: Option<Instant>,
}

/// Semaphores to wait on (with the stages that consume the data) before the
/// destination properties may be read.
#[derive(Default)]
pub struct TransferWaits {
    pub semaphores: SmallVec<[(vk::Semaphore, vk::PipelineStageFlags2); 2]>,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer request is malformed")]
    InvalidRequest,
    #[error("timed out waiting for staging space")]
    Timeout,
    #[error(transparent)]
    Vk(#[from] vk::Result),
}

pub trait PropertyTransferHandler {
    fn transfer_properties(
        &mut self,
        ctx: &TransferContext,
        requests: &[PropertyTransferRequest],
    ) -> Result<TransferWaits, TransferError>;
}
