use std::ops::BitOr;

use ash::vk;

/// Phase boundaries a caller wants covered by one barrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdatePhases(u32);

impl UpdatePhases {
    pub const PRE_RELATIVE_UPDATE: Self = Self(0x1);
    pub const POST_RELATIVE_UPDATE: Self = Self(0x2);
    pub const PRE_GLOBAL_RECOMPUTE: Self = Self(0x4);
    pub const POST_GLOBAL_RECOMPUTE: Self = Self(0x8);
    /// Recompute scheduled right after the update.
    pub const BETWEEN_UPDATE_AND_RECOMPUTE: Self =
        Self(Self::POST_RELATIVE_UPDATE.0 | Self::PRE_GLOBAL_RECOMPUTE.0);
    /// For a fused update-and-recompute dispatch.
    pub const PRE_UPDATE_AND_RECOMPUTE: Self =
        Self(Self::PRE_RELATIVE_UPDATE.0 | Self::PRE_GLOBAL_RECOMPUTE.0);
    pub const POST_UPDATE_AND_RECOMPUTE: Self =
        Self(Self::POST_RELATIVE_UPDATE.0 | Self::POST_GLOBAL_RECOMPUTE.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for UpdatePhases {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Access scopes for one of the six logical resources the two phases touch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceBarrier {
    pub src_access_mask: vk::AccessFlags2,
    pub dst_access_mask: vk::AccessFlags2,
}

/// The minimal stage and per-resource access masks a caller must record
/// between phases to keep them race-free. Advisory only: the manager never
/// inserts barriers itself, so it stays decoupled from the caller's command
/// buffer scheduling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BarrierSuggestion {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub request_ranges: ResourceBarrier,
    pub modification_requests: ResourceBarrier,
    pub relative_transforms: ResourceBarrier,
    pub modified_stamps: ResourceBarrier,
    pub global_transforms: ResourceBarrier,
    pub recomputed_stamps: ResourceBarrier,
}

pub fn suggest_barriers(phases: UpdatePhases) -> BarrierSuggestion {
    let rw = vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE;
    let read = vk::AccessFlags2::SHADER_READ;
    let write = vk::AccessFlags2::SHADER_WRITE;

    let mut barrier = BarrierSuggestion::default();
    if phases.contains(UpdatePhases::PRE_RELATIVE_UPDATE) {
        // guard whatever produced the inputs against the update's reads; the
        // update stepping on its own toes is the POST case
        barrier.dst_stage_mask |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        barrier.request_ranges.dst_access_mask |= read;
        barrier.modification_requests.dst_access_mask |= read;
    }
    if phases.contains(UpdatePhases::POST_RELATIVE_UPDATE) {
        barrier.src_stage_mask |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        barrier.dst_stage_mask |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        // future writes to the inputs must not overstep our reads
        barrier.request_ranges.src_access_mask |= read;
        barrier.modification_requests.src_access_mask |= read;
        // relative transforms may be multiplied in place or overwritten, and
        // an update->update loop needs both directions covered
        barrier.relative_transforms.src_access_mask |= rw;
        barrier.relative_transforms.dst_access_mask |= rw;
        // the update only writes modified stamps; recompute reads them later
        barrier.modified_stamps.src_access_mask |= write;
        barrier.modified_stamps.dst_access_mask |= rw;
    }
    if phases.contains(UpdatePhases::PRE_GLOBAL_RECOMPUTE) {
        // the relative update must be finished before recompute consumes it
        barrier.src_stage_mask |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        barrier.dst_stage_mask |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        barrier.relative_transforms.src_access_mask |= rw;
        barrier.relative_transforms.dst_access_mask |= read;
        barrier.modified_stamps.src_access_mask |= write;
        barrier.modified_stamps.dst_access_mask |= read;
    }
    if phases.contains(UpdatePhases::POST_GLOBAL_RECOMPUTE) {
        barrier.src_stage_mask |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        barrier.dst_stage_mask |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        // a future relative update must not overwrite inputs recompute still reads
        barrier.relative_transforms.src_access_mask |= read;
        barrier.relative_transforms.dst_access_mask |= rw;
        barrier.modified_stamps.src_access_mask |= read;
        barrier.modified_stamps.dst_access_mask |= write;
        barrier.global_transforms.src_access_mask |= rw;
        barrier.global_transforms.dst_access_mask |= rw;
        barrier.recomputed_stamps.src_access_mask |= rw;
        barrier.recomputed_stamps.dst_access_mask |= rw;
    }
    barrier
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_READ.as_raw() | vk::AccessFlags2::SHADER_WRITE.as_raw(),
    );

    #[test]
    fn pre_relative_update_only_guards_inputs() {
        let barrier = suggest_barriers(UpdatePhases::PRE_RELATIVE_UPDATE);
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::empty());
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(
            barrier.request_ranges.dst_access_mask,
            vk::AccessFlags2::SHADER_READ
        );
        assert_eq!(
            barrier.modification_requests.dst_access_mask,
            vk::AccessFlags2::SHADER_READ
        );
        assert_eq!(barrier.relative_transforms, ResourceBarrier::default());
        assert_eq!(barrier.global_transforms, ResourceBarrier::default());
    }

    #[test]
    fn between_update_and_recompute_covers_the_handoff() {
        let barrier = suggest_barriers(UpdatePhases::BETWEEN_UPDATE_AND_RECOMPUTE);
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::COMPUTE_SHADER);
        // the update wrote relative transforms; recompute reads them
        assert_eq!(barrier.relative_transforms.src_access_mask, RW);
        assert_eq!(barrier.relative_transforms.dst_access_mask, RW);
        assert_eq!(
            barrier.modified_stamps.src_access_mask,
            vk::AccessFlags2::SHADER_WRITE
        );
        assert_eq!(barrier.modified_stamps.dst_access_mask, RW);
        // recompute outputs are untouched by this boundary
        assert_eq!(barrier.global_transforms, ResourceBarrier::default());
        assert_eq!(barrier.recomputed_stamps, ResourceBarrier::default());
    }

    #[test]
    fn post_global_recompute_covers_outputs() {
        let barrier = suggest_barriers(UpdatePhases::POST_GLOBAL_RECOMPUTE);
        assert_eq!(barrier.global_transforms.src_access_mask, RW);
        assert_eq!(barrier.global_transforms.dst_access_mask, RW);
        assert_eq!(barrier.recomputed_stamps.src_access_mask, RW);
        assert_eq!(barrier.recomputed_stamps.dst_access_mask, RW);
        assert_eq!(
            barrier.relative_transforms.src_access_mask,
            vk::AccessFlags2::SHADER_READ
        );
        assert_eq!(barrier.relative_transforms.dst_access_mask, RW);
    }

    #[test]
    fn fused_masks_are_unions() {
        let fused = suggest_barriers(UpdatePhases::POST_UPDATE_AND_RECOMPUTE);
        let post_update = suggest_barriers(UpdatePhases::POST_RELATIVE_UPDATE);
        let post_recompute = suggest_barriers(UpdatePhases::POST_GLOBAL_RECOMPUTE);
        assert_eq!(
            fused.relative_transforms.src_access_mask,
            post_update.relative_transforms.src_access_mask
                | post_recompute.relative_transforms.src_access_mask
        );
        assert_eq!(
            fused.modified_stamps.dst_access_mask,
            post_update.modified_stamps.dst_access_mask
                | post_recompute.modified_stamps.dst_access_mask
        );
        assert_eq!(fused.src_stage_mask, vk::PipelineStageFlags2::COMPUTE_SHADER);
    }
}
