use std::sync::Arc;

use ash::{prelude::VkResult, vk};
use bytemuck::{Pod, Zeroable};
use cstr::cstr;
use thiserror::Error;

use super::{expand_skeletons, staging_requirements, NodeHandle, PoolTransform, Skeleton,
            TransformProperty, TransformTree, INITIAL_MODIFIED_STAMP, INITIAL_RECOMPUTED_STAMP,
            INVALID_NODE};
use crate::descriptor::{DescriptorBindingDesc, DescriptorKind, DescriptorPoolError,
                        DescriptorSetCache, DescriptorSetLayout};
use crate::shader::{create_shader_module, ShaderCompileError};
use crate::transfer::{PropertyTransferHandler, PropertyTransferRequest, TransferContext,
                      TransferError, TransferSource, TransferWaits};
use crate::{Allocator, Buffer, BufferBinding, BufferRange, Device, DeviceLimits, HasDevice};

/// Properties uploaded per provisioned node: parent, relative transform, and
/// the two stamps.
pub const TRANSFER_COUNT: usize = 4;

const DESCRIPTOR_CACHE_SIZE: u32 = 32;

const AABB_INDEX_COUNT: u32 = 24;
const LINE_INDEX_COUNT: u32 = 2;
/// Indices issued per instance by the debug draw: a wireframe box plus the
/// node-to-parent line.
pub const DEBUG_INDEX_COUNT: u32 = AABB_INDEX_COUNT + LINE_INDEX_COUNT;

pub const DEBUG_NODE_ID_BINDING: u32 = 14;
pub const DEBUG_AABB_ID_BINDING: u32 = 15;

const TRANSFERRED_PROPERTIES: [TransformProperty; TRANSFER_COUNT] = [
    TransformProperty::RelativeTransform,
    TransformProperty::Parent,
    TransformProperty::ModifiedStamp,
    TransformProperty::RecomputedStamp,
];

/// Offset of a property's default value inside the manager's fill-value
/// buffer. Each value sits at a storage-buffer-aligned offset so a fill
/// transfer can bind it directly.
pub fn default_value_offset(limits: &DeviceLimits, property: TransformProperty) -> vk::DeviceSize {
    debug_assert!(property != TransformProperty::GlobalTransform);
    let align = limits.min_storage_buffer_offset_alignment;
    let mut offset: vk::DeviceSize = 0;
    for candidate in TRANSFERRED_PROPERTIES {
        if candidate == property {
            return offset;
        }
        offset = (offset + candidate.stride() as vk::DeviceSize).next_multiple_of(align);
    }
    unreachable!()
}

fn default_value_buffer_len(limits: &DeviceLimits) -> vk::DeviceSize {
    default_value_offset(limits, TransformProperty::RecomputedStamp)
        + TransformProperty::RecomputedStamp.stride() as vk::DeviceSize
}

/// Host blob the fill-value buffer is initialized with: identity relative
/// transform, invalid parent, fresh stamp sentinels.
pub fn default_fill_data(limits: &DeviceLimits) -> Vec<u8> {
    let mut data = vec![0u8; default_value_buffer_len(limits) as usize];
    let mut put = |offset: vk::DeviceSize, bytes: &[u8]| {
        data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    };
    put(
        default_value_offset(limits, TransformProperty::RelativeTransform),
        bytemuck::bytes_of(&PoolTransform::IDENTITY),
    );
    put(
        default_value_offset(limits, TransformProperty::Parent),
        bytemuck::bytes_of(&INVALID_NODE),
    );
    put(
        default_value_offset(limits, TransformProperty::ModifiedStamp),
        bytemuck::bytes_of(&INITIAL_MODIFIED_STAMP),
    );
    put(
        default_value_offset(limits, TransformProperty::RecomputedStamp),
        bytemuck::bytes_of(&INITIAL_RECOMPUTED_STAMP),
    );
    data
}

#[derive(Debug, Error)]
pub enum ManagerCreateError {
    #[error(transparent)]
    Shader(#[from] ShaderCompileError),
    #[error(transparent)]
    Pool(#[from] DescriptorPoolError),
    #[error(transparent)]
    Vk(#[from] vk::Result),
}

#[derive(Debug, Error)]
pub enum AdditionError {
    #[error("addition request is invalid")]
    InvalidRequest,
    #[error("transform tree node pool exhausted")]
    OutOfNodes,
    #[error("property transfer failed: {0}")]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("dispatch parameters are invalid")]
    InvalidRequest,
    #[error("descriptor set cache exhausted")]
    DescriptorCacheExhausted,
}

/// Dispatch sizing: an explicit node/range count, or a count read from a GPU
/// buffer at execution time.
#[derive(Clone, Copy, Debug)]
pub enum Dispatch {
    Direct { count: u32 },
    Indirect { buffer: vk::Buffer, offset: vk::DeviceSize },
}

/// Common parameters of the two compute phases. The command buffer must be in
/// the recording state; the fence must be the one the caller will submit the
/// buffer with, since it gates recycling of the temporary descriptor set.
pub struct DispatchParams<'a> {
    pub cmdbuf: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub tree: &'a TransformTree,
    pub dispatch: Dispatch,
}

/// Pre-weighted SPIR-V for [`TransformTreeManager::create_with_spirv`]. The
/// compute kernels must be built with the device's workgroup size.
pub struct ManagerSpirv {
    pub relative_update: Vec<u32>,
    pub global_recompute: Vec<u32>,
    pub debug_vertex: Vec<u32>,
    pub debug_fragment: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct DebugPushConstants {
    pub view_projection: glam::Mat4,
    pub line_color: glam::Vec4,
    pub aabb_color: glam::Vec4,
}

/// A debug wireframe pipeline built against a caller renderpass.
pub struct DebugPipeline {
    device: Device,
    raw: vk::Pipeline,
}

impl DebugPipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }
}

impl Drop for DebugPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.raw, None);
        }
    }
}

/// Drives the two GPU phases over a [`TransformTree`] and provisions its
/// nodes. Stateless between calls apart from the fence-gated descriptor set
/// cache; ordering between the phases is the caller's, via
/// [`suggest_barriers`](super::suggest_barriers).
pub struct TransformTreeManager {
    device: Device,
    workgroup_size: u32,
    cache: DescriptorSetCache,
    // Layout template compatible with every tree's property set.
    property_layout: Arc<DescriptorSetLayout>,
    debug_aabb_layout: Arc<DescriptorSetLayout>,
    compute_pipeline_layout: vk::PipelineLayout,
    debug_pipeline_layout: vk::PipelineLayout,
    update_pipeline: vk::Pipeline,
    recompute_pipeline: vk::Pipeline,
    debug_vertex: vk::ShaderModule,
    debug_fragment: vk::ShaderModule,
    default_fill_values: Buffer,
    debug_index_buffer: Buffer,
}

impl TransformTreeManager {
    /// Compile the builtin kernels for this device and create the manager.
    #[cfg(feature = "glsl")]
    pub fn create(device: Device, allocator: Allocator) -> Result<Self, ManagerCreateError> {
        use crate::shader::{compile_glsl, ShaderStage};
        let workgroup_size = device.limits().max_compute_workgroup_invocations.to_string();
        let defines = [("WORKGROUP_SIZE", workgroup_size.as_str())];
        let spirv = ManagerSpirv {
            relative_update: compile_glsl(
                include_str!("../../shaders/relative_transform_update.comp"),
                ShaderStage::Compute,
                "relative_transform_update.comp",
                &defines,
            )?,
            global_recompute: compile_glsl(
                include_str!("../../shaders/global_transform_recompute.comp"),
                ShaderStage::Compute,
                "global_transform_recompute.comp",
                &defines,
            )?,
            debug_vertex: compile_glsl(
                include_str!("../../shaders/debug_draw.vert"),
                ShaderStage::Vertex,
                "debug_draw.vert",
                &[],
            )?,
            debug_fragment: compile_glsl(
                include_str!("../../shaders/debug_draw.frag"),
                ShaderStage::Fragment,
                "debug_draw.frag",
                &[],
            )?,
        };
        Self::create_with_spirv(device, allocator, &spirv)
    }

    pub fn create_with_spirv(
        device: Device,
        allocator: Allocator,
        spirv: &ManagerSpirv,
    ) -> Result<Self, ManagerCreateError> {
        let limits = *device.limits();

        let property_layout = Arc::new(DescriptorSetLayout::new(
            device.clone(),
            TransformTree::property_layout_bindings(),
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )?);
        let shared_bindings = (0..crate::descriptor::CACHE_SET_BINDING_COUNT as u32)
            .map(|binding| {
                DescriptorBindingDesc::new(
                    binding,
                    DescriptorKind::StorageBuffer,
                    1,
                    vk::ShaderStageFlags::COMPUTE,
                )
            })
            .collect();
        let shared_layout = Arc::new(DescriptorSetLayout::new(
            device.clone(),
            shared_bindings,
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )?);
        let debug_aabb_layout = Arc::new(DescriptorSetLayout::new(
            device.clone(),
            vec![DescriptorBindingDesc::new(
                0,
                DescriptorKind::StorageBuffer,
                1,
                vk::ShaderStageFlags::VERTEX,
            )],
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )?);

        let compute_pipeline_layout = {
            let set_layouts = [property_layout.raw(), shared_layout.raw()];
            unsafe {
                device.create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo {
                        set_layout_count: set_layouts.len() as u32,
                        p_set_layouts: set_layouts.as_ptr(),
                        ..Default::default()
                    },
                    None,
                )?
            }
        };
        let debug_pipeline_layout = {
            let set_layouts = [property_layout.raw(), debug_aabb_layout.raw()];
            let push_constants = vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: std::mem::size_of::<DebugPushConstants>() as u32,
            };
            unsafe {
                device.create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo {
                        set_layout_count: set_layouts.len() as u32,
                        p_set_layouts: set_layouts.as_ptr(),
                        push_constant_range_count: 1,
                        p_push_constant_ranges: &push_constants,
                        ..Default::default()
                    },
                    None,
                )?
            }
        };

        let (update_pipeline, recompute_pipeline) = {
            let update_module = create_shader_module(&device, &spirv.relative_update)?;
            let recompute_module = create_shader_module(&device, &spirv.global_recompute)?;
            let entry = cstr!("main");
            let stage = |module: vk::ShaderModule| vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::COMPUTE,
                module,
                p_name: entry.as_ptr(),
                ..Default::default()
            };
            let infos = [
                vk::ComputePipelineCreateInfo {
                    stage: stage(update_module),
                    layout: compute_pipeline_layout,
                    ..Default::default()
                },
                vk::ComputePipelineCreateInfo {
                    stage: stage(recompute_module),
                    layout: compute_pipeline_layout,
                    ..Default::default()
                },
            ];
            let result = unsafe {
                device
                    .create_compute_pipelines(vk::PipelineCache::null(), &infos, None)
                    .map_err(|(_, err)| err)
            };
            unsafe {
                device.destroy_shader_module(update_module, None);
                device.destroy_shader_module(recompute_module, None);
            }
            let pipelines = result?;
            (pipelines[0], pipelines[1])
        };

        let debug_vertex = create_shader_module(&device, &spirv.debug_vertex)?;
        let debug_fragment = create_shader_module(&device, &spirv.debug_fragment)?;

        let mut default_fill_values = Buffer::new_upload(
            allocator.clone(),
            default_value_buffer_len(&limits),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        default_fill_values.write(0, &default_fill_data(&limits));

        let mut debug_index_buffer = Buffer::new_upload(
            allocator,
            DEBUG_INDEX_COUNT as vk::DeviceSize * 2,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        debug_index_buffer.write(0, bytemuck::cast_slice(&debug_indices()));

        let cache = DescriptorSetCache::new(device.clone(), shared_layout, DESCRIPTOR_CACHE_SIZE)?;

        Ok(Self {
            workgroup_size: limits.max_compute_workgroup_invocations,
            cache,
            property_layout,
            debug_aabb_layout,
            compute_pipeline_layout,
            debug_pipeline_layout,
            update_pipeline,
            recompute_pipeline,
            debug_vertex,
            debug_fragment,
            default_fill_values,
            debug_index_buffer,
            device,
        })
    }

    /// Layout of the externally supplied bounding-box descriptor set the
    /// debug draw binds at set 1.
    pub fn debug_aabb_layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.debug_aabb_layout
    }

    /// The property-pool layout template the pipelines were built against;
    /// any tree with the standard property bindings is compatible.
    pub fn property_layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.property_layout
    }

    fn default_value_binding(&self, property: TransformProperty) -> BufferBinding {
        BufferBinding {
            buffer: self.default_fill_values.raw(),
            offset: default_value_offset(self.device.limits(), property),
        }
    }

    /// Build the four per-property transfers provisioning `nodes`: parents
    /// and relative transforms from the caller's sources where given and the
    /// default fill values otherwise; stamps always refilled with fresh
    /// sentinels.
    pub fn setup_transfers<'a>(
        &self,
        tree: &TransformTree,
        nodes: &'a [NodeHandle],
        parents: Option<TransferSource<'a>>,
        relative_transforms: Option<TransferSource<'a>>,
        transform_src_indices: Option<&'a [u32]>,
    ) -> [PropertyTransferRequest<'a>; TRANSFER_COUNT] {
        let defaults = TRANSFERRED_PROPERTIES.map(|property| self.default_value_binding(property));
        plan_transfers(
            TRANSFERRED_PROPERTIES.map(|property| tree.property_binding(property)),
            defaults,
            nodes,
            parents,
            relative_transforms,
            transform_src_indices,
        )
    }

    /// Allocate `out_nodes` from the tree (entries not equal to
    /// `INVALID_NODE` are treated as pre-allocated) and schedule the property
    /// upload through `handler`. On failure nothing stays allocated.
    pub fn add_nodes(
        &self,
        tree: &mut TransformTree,
        request: NodeAdditionRequest<'_>,
        handler: &mut dyn PropertyTransferHandler,
    ) -> Result<TransferWaits, AdditionError> {
        if request.out_nodes.is_empty() {
            return Ok(TransferWaits::default());
        }
        if !context_is_valid(&request.ctx) {
            return Err(AdditionError::InvalidRequest);
        }
        let fresh: Vec<usize> = (0..request.out_nodes.len())
            .filter(|&ix| request.out_nodes[ix] == INVALID_NODE)
            .collect();
        if !tree.allocate_nodes(request.out_nodes) {
            return Err(AdditionError::OutOfNodes);
        }
        let transfers = self.setup_transfers(
            tree,
            request.out_nodes,
            request.parents,
            request.relative_transforms,
            None,
        );
        match handler.transfer_properties(&request.ctx, &transfers) {
            Ok(waits) => Ok(waits),
            Err(err) => {
                rollback_fresh_nodes(tree, request.out_nodes, &fresh);
                Err(err.into())
            }
        }
    }

    /// Scratch sizes `add_skeleton_nodes` needs for this batch; compute them
    /// first, then call with exactly-sized scratch slices.
    pub fn staging_requirements(
        &self,
        skeletons: &[Skeleton],
        instance_counts: Option<&[u32]>,
    ) -> super::StagingRequirements {
        staging_requirements(skeletons, instance_counts)
    }

    /// Expand skeleton definitions into flattened node allocations, remapping
    /// every instance's joint topology onto its allocated handles, and upload
    /// the batch through `handler`.
    pub fn add_skeleton_nodes(
        &self,
        tree: &mut TransformTree,
        request: SkeletonAdditionRequest<'_>,
        handler: &mut dyn PropertyTransferHandler,
    ) -> Result<TransferWaits, AdditionError> {
        let reqs = staging_requirements(request.skeletons, request.instance_counts);
        if reqs.node_count == 0 {
            return Ok(TransferWaits::default());
        }
        if !context_is_valid(&request.ctx)
            || request.out_nodes.len() < reqs.node_count as usize
            || request.parent_scratch.len() < reqs.parent_count as usize
            || request.transform_scratch.len() < reqs.transform_count as usize
            || request.source_index_scratch.len() < reqs.source_index_count as usize
        {
            return Err(AdditionError::InvalidRequest);
        }
        if let Some(counts) = request.instance_counts {
            if counts.len() != request.skeletons.len() {
                return Err(AdditionError::InvalidRequest);
            }
        }
        if let Some(parents) = request.instance_parents {
            if parents.len() != request.skeletons.len() {
                return Err(AdditionError::InvalidRequest);
            }
        }

        let out_nodes = &mut request.out_nodes[..reqs.node_count as usize];
        let fresh: Vec<usize> = (0..out_nodes.len())
            .filter(|&ix| out_nodes[ix] == INVALID_NODE)
            .collect();
        if !tree.allocate_nodes(out_nodes) {
            return Err(AdditionError::OutOfNodes);
        }
        expand_skeletons(
            request.skeletons,
            request.instance_counts,
            request.instance_parents,
            out_nodes,
            &mut request.parent_scratch[..reqs.parent_count as usize],
            &mut request.transform_scratch[..reqs.transform_count as usize],
            &mut request.source_index_scratch[..reqs.source_index_count as usize],
        );

        let parents = TransferSource::Upload(bytemuck::cast_slice(
            &request.parent_scratch[..reqs.parent_count as usize],
        ));
        let (relative_transforms, src_indices): (_, Option<&[u32]>) = if reqs.transform_count > 0 {
            (
                Some(TransferSource::Upload(bytemuck::cast_slice(
                    &request.transform_scratch[..reqs.transform_count as usize],
                ))),
                Some(&request.source_index_scratch[..reqs.source_index_count as usize]),
            )
        } else {
            (None, None)
        };
        let transfers = self.setup_transfers(tree, out_nodes, Some(parents), relative_transforms, src_indices);
        match handler.transfer_properties(&request.ctx, &transfers) {
            Ok(waits) => Ok(waits),
            Err(err) => {
                rollback_fresh_nodes(tree, out_nodes, &fresh);
                Err(err.into())
            }
        }
    }

    /// Return node indices to the tree's pool. Children are not removed and
    /// dangling parent references are left as-is; topology fix-up after
    /// removal is the caller's responsibility.
    pub fn remove_nodes(&self, tree: &mut TransformTree, nodes: &[NodeHandle]) {
        tree.free_nodes(nodes);
    }

    /// Record the relative-update dispatch: applies the modification-request
    /// ranges in `request_ranges`/`modification_requests` and bumps modified
    /// stamps. Synchronization against other phases is the caller's, per the
    /// barrier advisory.
    pub fn update_relative(
        &self,
        params: &DispatchParams<'_>,
        request_ranges: BufferRange,
        modification_requests: BufferRange,
    ) -> Result<(), UpdateError> {
        if !request_ranges.is_valid() || !modification_requests.is_valid() {
            return Err(UpdateError::InvalidRequest);
        }
        self.record_dispatch(
            self.update_pipeline,
            params,
            &[request_ranges, modification_requests],
        )
    }

    /// Record the global-recompute dispatch over the node-index buffer.
    /// Must be ordered after the relative updates it depends on; the manager
    /// enforces nothing.
    pub fn recompute_global(
        &self,
        params: &DispatchParams<'_>,
        node_ids: BufferRange,
    ) -> Result<(), UpdateError> {
        if !node_ids.is_valid() {
            return Err(UpdateError::InvalidRequest);
        }
        self.record_dispatch(self.recompute_pipeline, params, &[node_ids])
    }

    fn record_dispatch(
        &self,
        pipeline: vk::Pipeline,
        params: &DispatchParams<'_>,
        buffers: &[BufferRange],
    ) -> Result<(), UpdateError> {
        if params.cmdbuf == vk::CommandBuffer::null() || params.fence == vk::Fence::null() {
            return Err(UpdateError::InvalidRequest);
        }
        let Some(set_index) = self.cache.acquire(buffers) else {
            tracing::error!("transform tree manager: failed to acquire descriptor set");
            return Err(UpdateError::DescriptorCacheExhausted);
        };
        let sets = [
            params.tree.property_descriptor_set(),
            self.cache.raw_set(set_index),
        ];
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                params.cmdbuf,
                vk::PipelineBindPoint::COMPUTE,
                self.compute_pipeline_layout,
                0,
                &sets,
                &[],
            );
            self.device
                .cmd_bind_pipeline(params.cmdbuf, vk::PipelineBindPoint::COMPUTE, pipeline);
            match params.dispatch {
                Dispatch::Direct { count } => {
                    self.device
                        .cmd_dispatch(params.cmdbuf, count.div_ceil(self.workgroup_size), 1, 1);
                }
                Dispatch::Indirect { buffer, offset } => {
                    self.device.cmd_dispatch_indirect(params.cmdbuf, buffer, offset);
                }
            }
        }
        self.cache.release(set_index, params.fence);
        Ok(())
    }

    /// Build the wireframe debug pipeline against a caller renderpass.
    pub fn create_debug_pipeline(
        &self,
        renderpass: vk::RenderPass,
        subpass: u32,
    ) -> VkResult<DebugPipeline> {
        let entry = cstr!("main");
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::VERTEX,
                module: self.debug_vertex,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: self.debug_fragment,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
        ];
        let bindings = [
            vk::VertexInputBindingDescription {
                binding: DEBUG_NODE_ID_BINDING,
                stride: std::mem::size_of::<u32>() as u32,
                input_rate: vk::VertexInputRate::INSTANCE,
            },
            vk::VertexInputBindingDescription {
                binding: DEBUG_AABB_ID_BINDING,
                stride: std::mem::size_of::<u32>() as u32,
                input_rate: vk::VertexInputRate::INSTANCE,
            },
        ];
        let attributes = [
            vk::VertexInputAttributeDescription {
                location: DEBUG_NODE_ID_BINDING,
                binding: DEBUG_NODE_ID_BINDING,
                format: vk::Format::R32_UINT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: DEBUG_AABB_ID_BINDING,
                binding: DEBUG_AABB_ID_BINDING,
                format: vk::Format::R32_UINT,
                offset: 0,
            },
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: bindings.len() as u32,
            p_vertex_binding_descriptions: bindings.as_ptr(),
            vertex_attribute_description_count: attributes.len() as u32,
            p_vertex_attribute_descriptions: attributes.as_ptr(),
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vk::PrimitiveTopology::LINE_LIST,
            ..Default::default()
        };
        let viewport = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };
        let rasterization = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default();
        let blend_attachment = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            attachment_count: 1,
            p_attachments: &blend_attachment,
            ..Default::default()
        };
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dynamic_states.len() as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };
        let info = vk::GraphicsPipelineCreateInfo {
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport,
            p_rasterization_state: &rasterization,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic,
            layout: self.debug_pipeline_layout,
            render_pass: renderpass,
            subpass,
            ..Default::default()
        };
        let raw = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, err)| err)?[0]
        };
        Ok(DebugPipeline {
            device: self.device.clone(),
            raw,
        })
    }

    /// Draw one wireframe box plus parent line per instance, driven by the
    /// per-instance node-ID and AABB-ID vertex streams.
    pub fn debug_draw(
        &self,
        cmdbuf: vk::CommandBuffer,
        pipeline: &DebugPipeline,
        tree: &TransformTree,
        aabb_set: vk::DescriptorSet,
        node_ids: BufferBinding,
        aabb_ids: BufferBinding,
        push_constants: &DebugPushConstants,
        instance_count: u32,
    ) {
        let sets = [tree.property_descriptor_set(), aabb_set];
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmdbuf,
                vk::PipelineBindPoint::GRAPHICS,
                self.debug_pipeline_layout,
                0,
                &sets,
                &[],
            );
            self.device
                .cmd_bind_pipeline(cmdbuf, vk::PipelineBindPoint::GRAPHICS, pipeline.raw());
            self.device.cmd_bind_vertex_buffers(
                cmdbuf,
                DEBUG_NODE_ID_BINDING,
                &[node_ids.buffer],
                &[node_ids.offset],
            );
            self.device.cmd_bind_vertex_buffers(
                cmdbuf,
                DEBUG_AABB_ID_BINDING,
                &[aabb_ids.buffer],
                &[aabb_ids.offset],
            );
            self.device.cmd_bind_index_buffer(
                cmdbuf,
                self.debug_index_buffer.raw(),
                0,
                vk::IndexType::UINT16,
            );
            self.device.cmd_push_constants(
                cmdbuf,
                self.debug_pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(push_constants),
            );
            self.device
                .cmd_draw_indexed(cmdbuf, DEBUG_INDEX_COUNT, instance_count, 0, 0, 0);
        }
    }
}

impl HasDevice for TransformTreeManager {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for TransformTreeManager {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.update_pipeline, None);
            self.device.destroy_pipeline(self.recompute_pipeline, None);
            self.device
                .destroy_pipeline_layout(self.compute_pipeline_layout, None);
            self.device
                .destroy_pipeline_layout(self.debug_pipeline_layout, None);
            self.device.destroy_shader_module(self.debug_vertex, None);
            self.device.destroy_shader_module(self.debug_fragment, None);
        }
    }
}

pub struct NodeAdditionRequest<'a> {
    pub ctx: TransferContext,
    /// Entries equal to `INVALID_NODE` get allocated; others pass through,
    /// letting callers split allocation from transfer setup.
    pub out_nodes: &'a mut [NodeHandle],
    pub parents: Option<TransferSource<'a>>,
    pub relative_transforms: Option<TransferSource<'a>>,
}

pub struct SkeletonAdditionRequest<'a> {
    pub ctx: TransferContext,
    pub skeletons: &'a [Skeleton],
    /// One instance count per skeleton; `None` means one instance each.
    pub instance_counts: Option<&'a [u32]>,
    /// Per skeleton, the external parent of each instance's roots. Missing
    /// entries attach roots to `INVALID_NODE`.
    pub instance_parents: Option<&'a [&'a [NodeHandle]]>,
    pub out_nodes: &'a mut [NodeHandle],
    /// Sized per [`staging_requirements`]; contents may be garbage on entry.
    pub parent_scratch: &'a mut [NodeHandle],
    pub transform_scratch: &'a mut [PoolTransform],
    pub source_index_scratch: &'a mut [u32],
}

fn context_is_valid(ctx: &TransferContext) -> bool {
    ctx.cmdbuf != vk::CommandBuffer::null()
        && ctx.fence != vk::Fence::null()
        && ctx.queue != vk::Queue::null()
        && ctx.scratch.is_valid()
}

fn rollback_fresh_nodes(tree: &mut TransformTree, out_nodes: &mut [NodeHandle], fresh: &[usize]) {
    for &ix in fresh {
        tree.free_nodes(&[out_nodes[ix]]);
        out_nodes[ix] = INVALID_NODE;
    }
}

/// Device-free core of [`TransformTreeManager::setup_transfers`].
pub(crate) fn plan_transfers<'a>(
    destinations: [crate::transfer::PropertyBinding; TRANSFER_COUNT],
    defaults: [BufferBinding; TRANSFER_COUNT],
    nodes: &'a [NodeHandle],
    parents: Option<TransferSource<'a>>,
    relative_transforms: Option<TransferSource<'a>>,
    transform_src_indices: Option<&'a [u32]>,
) -> [PropertyTransferRequest<'a>; TRANSFER_COUNT] {
    let element_count = nodes.len() as u32;
    let mut ix = 0usize;
    destinations.map(|dst| {
        let property = TRANSFERRED_PROPERTIES[ix];
        let default_fill = TransferSource::Fill(defaults[ix]);
        let (source, src_addresses) = match property {
            TransformProperty::RelativeTransform => (
                relative_transforms.unwrap_or(default_fill),
                if relative_transforms.is_some() {
                    transform_src_indices
                } else {
                    None
                },
            ),
            TransformProperty::Parent => (parents.unwrap_or(default_fill), None),
            _ => (default_fill, None),
        };
        ix += 1;
        PropertyTransferRequest {
            dst,
            element_count,
            source,
            dst_addresses: Some(nodes),
            src_addresses,
        }
    })
}

fn debug_indices() -> [u16; DEBUG_INDEX_COUNT as usize] {
    // 12 box edges over corners indexed by xyz bits, then the node->parent line
    [
        0b000, 0b001, 0b001, 0b011, 0b011, 0b010, 0b010, 0b000, // z = 0 face
        0b100, 0b101, 0b101, 0b111, 0b111, 0b110, 0b110, 0b100, // z = 1 face
        0b000, 0b100, 0b001, 0b101, 0b010, 0b110, 0b011, 0b111, // verticals
        8, 9,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::PropertyBinding;
    use ash::vk::Handle;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            min_storage_buffer_offset_alignment: 64,
            max_compute_workgroup_invocations: 64,
        }
    }

    #[test]
    fn default_value_offsets_are_aligned_and_ordered() {
        let limits = limits();
        let relative = default_value_offset(&limits, TransformProperty::RelativeTransform);
        let parent = default_value_offset(&limits, TransformProperty::Parent);
        let modified = default_value_offset(&limits, TransformProperty::ModifiedStamp);
        let recomputed = default_value_offset(&limits, TransformProperty::RecomputedStamp);
        assert_eq!(relative, 0);
        assert_eq!(parent, 64);
        assert_eq!(modified, 128);
        assert_eq!(recomputed, 192);
        for offset in [parent, modified, recomputed] {
            assert_eq!(offset % limits.min_storage_buffer_offset_alignment, 0);
        }
    }

    #[test]
    fn default_fill_data_holds_the_sentinels() {
        let limits = limits();
        let data = default_fill_data(&limits);
        let relative_at = default_value_offset(&limits, TransformProperty::RelativeTransform) as usize;
        let identity: &[u8] = bytemuck::bytes_of(&PoolTransform::IDENTITY);
        assert_eq!(&data[relative_at..relative_at + 48], identity);

        let parent_at = default_value_offset(&limits, TransformProperty::Parent) as usize;
        assert_eq!(&data[parent_at..parent_at + 4], bytemuck::bytes_of(&INVALID_NODE));

        let modified_at = default_value_offset(&limits, TransformProperty::ModifiedStamp) as usize;
        assert_eq!(
            &data[modified_at..modified_at + 4],
            bytemuck::bytes_of(&INITIAL_MODIFIED_STAMP)
        );
        let recomputed_at =
            default_value_offset(&limits, TransformProperty::RecomputedStamp) as usize;
        assert_eq!(
            &data[recomputed_at..recomputed_at + 4],
            bytemuck::bytes_of(&INITIAL_RECOMPUTED_STAMP)
        );
    }

    fn dummy_destinations() -> [PropertyBinding; TRANSFER_COUNT] {
        let mut next = 1u64;
        TRANSFERRED_PROPERTIES.map(|property| {
            let binding = PropertyBinding {
                dst: BufferRange {
                    buffer: vk::Buffer::from_raw(next),
                    offset: 0,
                    size: 1 << 20,
                },
                stride: property.stride(),
            };
            next += 1;
            binding
        })
    }

    fn dummy_defaults() -> [BufferBinding; TRANSFER_COUNT] {
        let limits = limits();
        TRANSFERRED_PROPERTIES.map(|property| BufferBinding {
            buffer: vk::Buffer::from_raw(100),
            offset: default_value_offset(&limits, property),
        })
    }

    #[test]
    fn plan_without_sources_fills_defaults_everywhere() {
        let nodes = [3u32, 7, 9];
        let plan = plan_transfers(dummy_destinations(), dummy_defaults(), &nodes, None, None, None);
        let limits = limits();
        for (request, property) in plan.iter().zip(TRANSFERRED_PROPERTIES) {
            assert_eq!(request.element_count, 3);
            assert_eq!(request.dst_addresses, Some(&nodes[..]));
            assert_eq!(request.src_addresses, None);
            match request.source {
                TransferSource::Fill(binding) => {
                    assert_eq!(binding.offset, default_value_offset(&limits, property));
                }
                _ => panic!("expected a default fill"),
            }
            assert_eq!(request.dst.stride, property.stride());
        }
    }

    #[test]
    fn plan_with_sources_keeps_stamp_fills() {
        let nodes = [0u32, 1];
        let parent_data = [5u32, 5];
        let gather = [0u32, 0];
        let transforms = [PoolTransform::IDENTITY; 1];
        let plan = plan_transfers(
            dummy_destinations(),
            dummy_defaults(),
            &nodes,
            Some(TransferSource::Upload(bytemuck::cast_slice(&parent_data))),
            Some(TransferSource::Upload(bytemuck::cast_slice(&transforms))),
            Some(&gather),
        );
        // relative transforms come first in the transfer table
        assert!(matches!(plan[0].source, TransferSource::Upload(_)));
        assert_eq!(plan[0].src_addresses, Some(&gather[..]));
        assert!(matches!(plan[1].source, TransferSource::Upload(_)));
        assert_eq!(plan[1].src_addresses, None);
        // stamps always refill from the defaults
        assert!(matches!(plan[2].source, TransferSource::Fill(_)));
        assert!(matches!(plan[3].source, TransferSource::Fill(_)));
    }
}
