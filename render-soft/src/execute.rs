//! The command-stream interpreter and scanline rasterizer.

use crate::backend::{DeviceState, SoftPipeline};
use crate::shaders::{
    ComputeInvocation, FragmentInput, InvocationAccess, SoftShaderKind, VertexInput, VertexOutput,
};
use chroma_render::debug::{trace_coordinate, trace_end_invocation, trace_write_record};
use chroma_render::driver::{
    BufferImageCopy, ClearValue, CmdScissor, CmdViewport, DescriptorValue, DriverCmd,
    PipelineBindPoint,
};
use chroma_render::error::{Error, Result};
use chroma_render::format::Format;
use fxhash::FxHashMap;

#[derive(Default)]
struct ExecState {
    compute_pipeline: Option<u64>,
    graphics_pipeline: Option<u64>,
    bound_sets: FxHashMap<u32, u64>,
    push: Vec<u8>,
    viewports: Vec<CmdViewport>,
    scissors: Vec<CmdScissor>,
    vertex_buffers: Vec<(u64, u64)>,
    index_buffer: Option<(u64, u64, bool)>,
    framebuffer: Option<u64>,
}

pub(crate) struct Interpreter<'a> {
    state: &'a mut DeviceState,
}

impl<'a> Interpreter<'a> {
    pub fn new(state: &'a mut DeviceState) -> Interpreter<'a> {
        Interpreter { state }
    }

    pub fn run(&mut self, cmds: &[DriverCmd]) -> Result<()> {
        let mut exec = ExecState::default();
        exec.push = vec![0; 256];
        for cmd in cmds {
            self.step(&mut exec, cmd)?;
        }
        Ok(())
    }

    fn step(&mut self, exec: &mut ExecState, cmd: &DriverCmd) -> Result<()> {
        match cmd {
            // Synchronization is a no-op on a synchronous device.
            DriverCmd::Barrier(_) => {}
            DriverCmd::BeginDebugGroup(_) | DriverCmd::EndDebugGroup => {}

            DriverCmd::BeginRenderPass {
                render_pass,
                framebuffer,
                clear_values,
                ..
            } => {
                exec.framebuffer = Some(framebuffer.0);
                let (pass_id, attachments, _, _) = self
                    .state
                    .framebuffers
                    .get(&framebuffer.0)
                    .cloned()
                    .ok_or_else(|| {
                        Error::ValidationFailed("begin with unknown framebuffer".to_owned())
                    })?;
                debug_assert_eq!(pass_id, render_pass.0);
                let pass = self
                    .state
                    .render_passes
                    .get(&render_pass.0)
                    .cloned()
                    .ok_or_else(|| {
                        Error::ValidationFailed("begin with unknown render pass".to_owned())
                    })?;
                let all = pass
                    .color_attachments
                    .iter()
                    .chain(pass.depth_attachment.iter());
                for (i, attachment) in all.enumerate() {
                    if attachment.load_op != chroma_render::AttachmentLoadOp::Clear {
                        continue;
                    }
                    let image = attachments.get(i).copied();
                    let value = clear_values.get(i).copied();
                    if let (Some(image), Some(value)) = (image, value) {
                        self.clear_image(image, value);
                    }
                }
            }
            DriverCmd::EndRenderPass => {
                exec.framebuffer = None;
            }

            DriverCmd::BindPipeline {
                bind_point,
                pipeline,
            } => match bind_point {
                PipelineBindPoint::Compute => exec.compute_pipeline = Some(pipeline.0),
                _ => exec.graphics_pipeline = Some(pipeline.0),
            },
            DriverCmd::BindDescriptorSets {
                first_set, sets, ..
            } => {
                for (i, set) in sets.iter().enumerate() {
                    exec.bound_sets.insert(first_set + i as u32, set.0);
                }
            }
            DriverCmd::PushConstants { offset, data, .. } => {
                let end = *offset as usize + data.len();
                if exec.push.len() < end {
                    exec.push.resize(end, 0);
                }
                exec.push[*offset as usize..end].copy_from_slice(data);
            }
            DriverCmd::SetViewports(viewports) => exec.viewports = viewports.clone(),
            DriverCmd::SetScissors(scissors) => exec.scissors = scissors.clone(),
            DriverCmd::BindVertexBuffers {
                first_binding,
                buffers,
            } => {
                let needed = *first_binding as usize + buffers.len();
                exec.vertex_buffers.resize(needed.max(exec.vertex_buffers.len()), (0, 0));
                for (i, (buffer, offset)) in buffers.iter().enumerate() {
                    exec.vertex_buffers[*first_binding as usize + i] = (buffer.0, *offset);
                }
            }
            DriverCmd::BindIndexBuffer {
                buffer,
                offset,
                sixteen_bit,
            } => {
                exec.index_buffer = Some((buffer.0, *offset, *sixteen_bit));
            }

            DriverCmd::Dispatch { group_count } => self.dispatch(exec, *group_count)?,
            DriverCmd::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                ..
            } => {
                for _ in 0..*instance_count {
                    let ids: Vec<u32> =
                        (*first_vertex..*first_vertex + *vertex_count).collect();
                    self.draw(exec, &ids)?;
                }
            }
            DriverCmd::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                ..
            } => {
                let (buffer, offset, sixteen_bit) = exec.index_buffer.ok_or_else(|| {
                    Error::ValidationFailed("indexed draw without an index buffer".to_owned())
                })?;
                let bytes = &self
                    .state
                    .buffers
                    .get(&buffer)
                    .ok_or_else(|| {
                        Error::ValidationFailed("unknown index buffer".to_owned())
                    })?
                    .bytes;
                let stride = if sixteen_bit { 2 } else { 4 };
                let base = offset as usize + *first_index as usize * stride;
                let mut ids = Vec::with_capacity(*index_count as usize);
                for i in 0..*index_count as usize {
                    let at = base + i * stride;
                    let raw = if sixteen_bit {
                        u32::from(u16::from_le_bytes([bytes[at], bytes[at + 1]]))
                    } else {
                        u32::from_le_bytes([
                            bytes[at],
                            bytes[at + 1],
                            bytes[at + 2],
                            bytes[at + 3],
                        ])
                    };
                    ids.push((raw as i64 + i64::from(*vertex_offset)) as u32);
                }
                for _ in 0..*instance_count {
                    self.draw(exec, &ids)?;
                }
            }
            DriverCmd::DrawMeshTasks { .. } => {
                log::warn!("mesh dispatch ignored: no mesh support in the software driver");
            }
            DriverCmd::TraceRays { .. } | DriverCmd::BuildAccelerationStructure { .. } => {
                log::warn!("ray tracing op ignored by the software driver");
            }

            DriverCmd::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let chunk = {
                        let src = self.state.buffers.get(&src.0).ok_or_else(|| {
                            Error::ValidationFailed("copy from unknown buffer".to_owned())
                        })?;
                        src.bytes[region.src_offset as usize
                            ..(region.src_offset + region.size) as usize]
                            .to_vec()
                    };
                    let dst = self.state.buffers.get_mut(&dst.0).ok_or_else(|| {
                        Error::ValidationFailed("copy to unknown buffer".to_owned())
                    })?;
                    dst.bytes[region.dst_offset as usize
                        ..(region.dst_offset + region.size) as usize]
                        .copy_from_slice(&chunk);
                }
            }

            DriverCmd::CopyImage {
                src, dst, regions, ..
            } => {
                for region in regions {
                    let (rows, texel) = {
                        let src_img = self.state.images.get(&src.0).ok_or_else(|| {
                            Error::ValidationFailed("copy from unknown image".to_owned())
                        })?;
                        let texel = src_img.desc.format.texel_size() as usize;
                        let mut rows = Vec::with_capacity(region.extent[1] as usize);
                        for y in 0..region.extent[1] {
                            let off = src_img.texel_offset(
                                region.src_offset[0] as u32,
                                region.src_offset[1] as u32 + y,
                                region.src_offset[2] as u32,
                            );
                            rows.push(
                                src_img.bytes[off..off + region.extent[0] as usize * texel]
                                    .to_vec(),
                            );
                        }
                        (rows, texel)
                    };
                    let dst_img = self.state.images.get_mut(&dst.0).ok_or_else(|| {
                        Error::ValidationFailed("copy to unknown image".to_owned())
                    })?;
                    for (y, row) in rows.iter().enumerate() {
                        let off = dst_img.texel_offset(
                            region.dst_offset[0] as u32,
                            region.dst_offset[1] as u32 + y as u32,
                            region.dst_offset[2] as u32,
                        );
                        dst_img.bytes[off..off + region.extent[0] as usize * texel]
                            .copy_from_slice(row);
                    }
                }
            }

            DriverCmd::CopyBufferToImage {
                src, dst, regions, ..
            } => {
                for region in regions {
                    self.buffer_to_image(src.0, dst.0, region)?;
                }
            }
            DriverCmd::CopyImageToBuffer {
                src, dst, regions, ..
            } => {
                for region in regions {
                    self.image_to_buffer(src.0, dst.0, region)?;
                }
            }

            DriverCmd::BlitImage {
                src, dst, regions, ..
            } => {
                for region in regions {
                    self.blit(src.0, dst.0, region)?;
                }
            }

            DriverCmd::ClearColorImage { image, value, .. } => {
                self.clear_image(image.0, *value);
            }
            DriverCmd::ClearDepthStencilImage {
                image,
                depth,
                stencil,
                ..
            } => {
                self.clear_image(
                    image.0,
                    ClearValue::DepthStencil {
                        depth: *depth,
                        stencil: *stencil,
                    },
                );
            }

            DriverCmd::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } => {
                let buffer = self.state.buffers.get_mut(&buffer.0).ok_or_else(|| {
                    Error::ValidationFailed("fill of unknown buffer".to_owned())
                })?;
                let pattern = value.to_le_bytes();
                let end = (*offset + *size) as usize;
                for (i, byte) in buffer.bytes[*offset as usize..end].iter_mut().enumerate() {
                    *byte = pattern[i % 4];
                }
            }
            DriverCmd::UpdateBuffer {
                buffer,
                offset,
                data,
            } => {
                let buffer = self.state.buffers.get_mut(&buffer.0).ok_or_else(|| {
                    Error::ValidationFailed("update of unknown buffer".to_owned())
                })?;
                buffer.bytes[*offset as usize..*offset as usize + data.len()]
                    .copy_from_slice(data);
            }
        }
        Ok(())
    }

    fn clear_image(&mut self, image: u64, value: ClearValue) {
        let image = match self.state.images.get_mut(&image) {
            Some(image) => image,
            None => return,
        };
        let texel = image.desc.format.texel_size() as usize;
        let mut pattern = vec![0u8; texel];
        match value {
            ClearValue::Color(color) => {
                image.desc.format.encode(color, &mut pattern);
            }
            ClearValue::ColorU(color) => {
                for (i, byte) in pattern.iter_mut().enumerate() {
                    *byte = color.get(i / 4).map(|v| v.to_le_bytes()[i % 4]).unwrap_or(0);
                }
            }
            ClearValue::DepthStencil { depth, .. } => {
                if image.desc.format == Format::D32_SFLOAT {
                    pattern.copy_from_slice(&depth.to_bits().to_le_bytes());
                }
            }
        }
        for chunk in image.bytes.chunks_exact_mut(texel) {
            chunk.copy_from_slice(&pattern);
        }
    }

    fn buffer_to_image(&mut self, src: u64, dst: u64, region: &BufferImageCopy) -> Result<()> {
        let rows = {
            let buffer = self.state.buffers.get(&src).ok_or_else(|| {
                Error::ValidationFailed("copy from unknown buffer".to_owned())
            })?;
            let image = self.state.images.get(&dst).ok_or_else(|| {
                Error::ValidationFailed("copy to unknown image".to_owned())
            })?;
            let texel = image.desc.format.texel_size() as usize;
            let row_texels = if region.buffer_row_length != 0 {
                region.buffer_row_length as usize
            } else {
                region.extent[0] as usize
            };
            let mut rows = Vec::with_capacity(region.extent[1] as usize);
            for y in 0..region.extent[1] as usize {
                let off = region.buffer_offset as usize + y * row_texels * texel;
                rows.push(buffer.bytes[off..off + region.extent[0] as usize * texel].to_vec());
            }
            rows
        };
        let image = match self.state.images.get_mut(&dst) {
            Some(image) => image,
            None => return Ok(()),
        };
        let texel = image.desc.format.texel_size() as usize;
        for (y, row) in rows.iter().enumerate() {
            let off = image.texel_offset(
                region.image_offset[0] as u32,
                region.image_offset[1] as u32 + y as u32,
                region.image_offset[2] as u32,
            );
            image.bytes[off..off + region.extent[0] as usize * texel].copy_from_slice(row);
        }
        Ok(())
    }

    fn image_to_buffer(&mut self, src: u64, dst: u64, region: &BufferImageCopy) -> Result<()> {
        let rows = {
            let image = self.state.images.get(&src).ok_or_else(|| {
                Error::ValidationFailed("copy from unknown image".to_owned())
            })?;
            let texel = image.desc.format.texel_size() as usize;
            let mut rows = Vec::with_capacity(region.extent[1] as usize);
            for y in 0..region.extent[1] as usize {
                let off = image.texel_offset(
                    region.image_offset[0] as u32,
                    region.image_offset[1] as u32 + y as u32,
                    region.image_offset[2] as u32,
                );
                rows.push(image.bytes[off..off + region.extent[0] as usize * texel].to_vec());
            }
            (rows, texel)
        };
        let (rows, texel) = rows;
        let buffer = self.state.buffers.get_mut(&dst).ok_or_else(|| {
            Error::ValidationFailed("copy to unknown buffer".to_owned())
        })?;
        let row_texels = if region.buffer_row_length != 0 {
            region.buffer_row_length as usize
        } else {
            region.extent[0] as usize
        };
        for (y, row) in rows.iter().enumerate() {
            let off = region.buffer_offset as usize + y * row_texels * texel;
            buffer.bytes[off..off + row.len()].copy_from_slice(row);
        }
        Ok(())
    }

    fn blit(&mut self, src: u64, dst: u64, region: &chroma_render::driver::ImageBlit) -> Result<()> {
        let (src_bytes, src_desc) = {
            let image = self.state.images.get(&src).ok_or_else(|| {
                Error::ValidationFailed("blit from unknown image".to_owned())
            })?;
            (image.bytes.clone(), image.desc.clone())
        };
        let dst_img = self.state.images.get_mut(&dst).ok_or_else(|| {
            Error::ValidationFailed("blit to unknown image".to_owned())
        })?;
        let src_w = (region.src_bounds[1][0] - region.src_bounds[0][0]).max(1) as f32;
        let src_h = (region.src_bounds[1][1] - region.src_bounds[0][1]).max(1) as f32;
        let dst_w = (region.dst_bounds[1][0] - region.dst_bounds[0][0]).max(1);
        let dst_h = (region.dst_bounds[1][1] - region.dst_bounds[0][1]).max(1);
        let texel = src_desc.format.texel_size() as usize;
        let src_pitch = src_desc.dimensions.width() as usize * texel;
        for dy in 0..dst_h {
            for dx in 0..dst_w {
                let sx = (dx as f32 / dst_w as f32 * src_w) as i32 + region.src_bounds[0][0];
                let sy = (dy as f32 / dst_h as f32 * src_h) as i32 + region.src_bounds[0][1];
                let sx = sx.max(0).min(src_desc.dimensions.width() as i32 - 1) as usize;
                let sy = sy.max(0).min(src_desc.dimensions.height() as i32 - 1) as usize;
                let src_off = sy * src_pitch + sx * texel;
                let dst_off = dst_img.texel_offset(
                    (region.dst_bounds[0][0] + dx) as u32,
                    (region.dst_bounds[0][1] + dy) as u32,
                    0,
                );
                let (from, to) = (
                    &src_bytes[src_off..src_off + texel],
                    &mut dst_img.bytes[dst_off..dst_off + texel],
                );
                to.copy_from_slice(from);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Compute

    fn dispatch(&mut self, exec: &ExecState, group_count: [u32; 3]) -> Result<()> {
        let pipeline_id = exec.compute_pipeline.ok_or_else(|| {
            Error::ValidationFailed("dispatch without a bound pipeline".to_owned())
        })?;
        let pipeline = self
            .state
            .pipelines
            .get(&pipeline_id)
            .cloned()
            .ok_or_else(|| Error::ValidationFailed("dispatch of unknown pipeline".to_owned()))?;
        let shader = match pipeline {
            SoftPipeline::Compute { shader } => shader,
            _ => {
                return Err(Error::ValidationFailed(
                    "bound pipeline is not a compute pipeline".to_owned(),
                ));
            }
        };
        let f = match &shader.kind {
            SoftShaderKind::Compute(f) => f.clone(),
            _ => unreachable!(),
        };
        let mut local = shader.reflection.local_size;
        if local == [0; 3] {
            local = [1, 1, 1];
        }
        let trace_buffer = shader
            .trace_binding
            .and_then(|tb| resolve_buffer(self.state, &exec.bound_sets, tb.set, tb.binding));
        let trace_coord = trace_buffer.and_then(|id| {
            self.state
                .buffers
                .get(&id)
                .and_then(|b| trace_coordinate(&b.bytes))
        });

        for wz in 0..group_count[2] {
            for wy in 0..group_count[1] {
                for wx in 0..group_count[0] {
                    for lz in 0..local[2] {
                        for ly in 0..local[1] {
                            for lx in 0..local[0] {
                                let global = [
                                    wx * local[0] + lx,
                                    wy * local[1] + ly,
                                    wz * local[2] + lz,
                                ];
                                let active = trace_coord == Some(global);
                                let mut access = AccessCtx {
                                    state: &mut *self.state,
                                    bound: &exec.bound_sets,
                                    trace_buffer: if active { trace_buffer } else { None },
                                };
                                let mut invocation = ComputeInvocation {
                                    global_id: global,
                                    local_id: [lx, ly, lz],
                                    workgroup_id: [wx, wy, wz],
                                    num_workgroups: group_count,
                                    local_size: local,
                                    push_constants: &exec.push,
                                    access: &mut access,
                                };
                                f(&mut invocation);
                                if active {
                                    if let Some(id) = trace_buffer {
                                        if let Some(buffer) = self.state.buffers.get_mut(&id) {
                                            trace_end_invocation(&mut buffer.bytes);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rasterization

    fn draw(&mut self, exec: &ExecState, vertex_ids: &[u32]) -> Result<()> {
        let pipeline_id = exec.graphics_pipeline.ok_or_else(|| {
            Error::ValidationFailed("draw without a bound pipeline".to_owned())
        })?;
        let pipeline = self
            .state
            .pipelines
            .get(&pipeline_id)
            .cloned()
            .ok_or_else(|| Error::ValidationFailed("draw of unknown pipeline".to_owned()))?;
        let (vertex, fragment) = match pipeline {
            SoftPipeline::Graphics {
                vertex, fragment, ..
            } => (vertex, fragment),
            _ => {
                return Err(Error::ValidationFailed(
                    "bound pipeline is not a graphics pipeline".to_owned(),
                ));
            }
        };
        let vertex_fn = match &vertex.kind {
            SoftShaderKind::Vertex(f) => f.clone(),
            _ => unreachable!(),
        };
        let fragment_fn = fragment.map(|f| match &f.kind {
            SoftShaderKind::Fragment(f) => f.clone(),
            _ => unreachable!(),
        });

        let framebuffer = exec.framebuffer.ok_or_else(|| {
            Error::ValidationFailed("draw outside a render pass".to_owned())
        })?;
        let (_, attachments, fb_w, fb_h) = self
            .state
            .framebuffers
            .get(&framebuffer)
            .cloned()
            .ok_or_else(|| Error::ValidationFailed("draw with unknown framebuffer".to_owned()))?;
        let target = match attachments.first() {
            Some(&target) => target,
            None => return Ok(()),
        };

        let outputs: Vec<VertexOutput> = vertex_ids
            .iter()
            .map(|&vertex_index| {
                vertex_fn(&VertexInput {
                    vertex_index,
                    instance_index: 0,
                    push_constants: &exec.push,
                })
            })
            .collect();

        let viewport = exec.viewports.first().copied().unwrap_or(CmdViewport {
            x: 0.0,
            y: 0.0,
            width: fb_w as f32,
            height: fb_h as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        let scissor = exec.scissors.first().copied().unwrap_or(CmdScissor {
            x: 0,
            y: 0,
            width: fb_w,
            height: fb_h,
        });

        for triangle in outputs.chunks(3) {
            if triangle.len() == 3 {
                self.rasterize(
                    target,
                    [&triangle[0], &triangle[1], &triangle[2]],
                    &viewport,
                    &scissor,
                    fragment_fn.as_ref(),
                    &exec.push,
                );
            }
        }
        Ok(())
    }

    fn rasterize(
        &mut self,
        target: u64,
        triangle: [&VertexOutput; 3],
        viewport: &CmdViewport,
        scissor: &CmdScissor,
        fragment_fn: Option<&crate::shaders::FragmentFn>,
        push: &[u8],
    ) {
        let image = match self.state.images.get_mut(&target) {
            Some(image) => image,
            None => return,
        };
        let width = image.desc.dimensions.width() as i32;
        let height = image.desc.dimensions.height() as i32;

        // NDC -> framebuffer coordinates (y down, no flip).
        let screen: Vec<[f32; 2]> = triangle
            .iter()
            .map(|v| {
                [
                    viewport.x + (v.position[0] * 0.5 + 0.5) * viewport.width,
                    viewport.y + (v.position[1] * 0.5 + 0.5) * viewport.height,
                ]
            })
            .collect();

        let edge = |a: [f32; 2], b: [f32; 2], p: [f32; 2]| -> f32 {
            (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
        };
        let mut area = edge(screen[0], screen[1], screen[2]);
        if area == 0.0 {
            return;
        }
        let flip = if area < 0.0 { -1.0 } else { 1.0 };
        area *= flip;

        let min_x = screen.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min);
        let max_x = screen.iter().map(|p| p[0]).fold(f32::NEG_INFINITY, f32::max);
        let min_y = screen.iter().map(|p| p[1]).fold(f32::INFINITY, f32::min);
        let max_y = screen.iter().map(|p| p[1]).fold(f32::NEG_INFINITY, f32::max);

        let x0 = (min_x.floor() as i32).max(scissor.x).max(0);
        let x1 = (max_x.ceil() as i32)
            .min(scissor.x + scissor.width as i32)
            .min(width);
        let y0 = (min_y.floor() as i32).max(scissor.y).max(0);
        let y1 = (max_y.ceil() as i32)
            .min(scissor.y + scissor.height as i32)
            .min(height);

        let texel = image.desc.format.texel_size() as usize;
        for py in y0..y1 {
            for px in x0..x1 {
                let p = [px as f32 + 0.5, py as f32 + 0.5];
                let w0 = edge(screen[1], screen[2], p) * flip;
                let w1 = edge(screen[2], screen[0], p) * flip;
                let w2 = edge(screen[0], screen[1], p) * flip;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }
                let (l0, l1, l2) = (w0 / area, w1 / area, w2 / area);
                let mut varying = [0.0f32; 4];
                for i in 0..4 {
                    varying[i] = l0 * triangle[0].varying[i]
                        + l1 * triangle[1].varying[i]
                        + l2 * triangle[2].varying[i];
                }
                let color = match fragment_fn {
                    Some(f) => f(&FragmentInput {
                        frag_coord: p,
                        varying,
                        push_constants: push,
                    }),
                    None => varying,
                };
                let off = image.texel_offset(px as u32, py as u32, 0);
                image
                    .desc
                    .format
                    .encode(color, &mut image.bytes[off..off + texel]);
            }
        }
    }
}

/// Resolves the buffer bound at `(set, binding)` of the current descriptor
/// state, if any.
fn resolve_buffer(
    state: &DeviceState,
    bound: &FxHashMap<u32, u64>,
    set: u32,
    binding: u32,
) -> Option<u64> {
    let set = state.sets.get(bound.get(&set)?)?;
    set.writes
        .iter()
        .find(|w| w.binding == binding)
        .and_then(|w| match &w.value {
            DescriptorValue::StorageBuffer { buffer, .. }
            | DescriptorValue::UniformBuffer { buffer, .. } => Some(buffer.0),
            _ => None,
        })
}

/// Descriptor-backed resource access for shader closures.
struct AccessCtx<'a> {
    state: &'a mut DeviceState,
    bound: &'a FxHashMap<u32, u64>,
    trace_buffer: Option<u64>,
}

impl<'a> AccessCtx<'a> {
    fn value(&self, set: u32, binding: u32) -> Option<DescriptorValue> {
        let set = self.state.sets.get(self.bound.get(&set)?)?;
        set.writes
            .iter()
            .find(|w| w.binding == binding)
            .map(|w| w.value.clone())
    }
}

impl<'a> InvocationAccess for AccessCtx<'a> {
    fn image_store(&mut self, set: u32, binding: u32, coord: [i32; 3], texel: [f32; 4]) {
        let image = match self.value(set, binding) {
            Some(DescriptorValue::StorageImage { image }) => image.0,
            other => {
                log::warn!("image_store on non-image binding {}.{}: {:?}", set, binding, other);
                return;
            }
        };
        if let Some(image) = self.state.images.get_mut(&image) {
            if image.in_bounds(coord[0], coord[1], coord[2]) {
                let off = image.texel_offset(coord[0] as u32, coord[1] as u32, coord[2] as u32);
                let size = image.desc.format.texel_size() as usize;
                image
                    .desc
                    .format
                    .encode(texel, &mut image.bytes[off..off + size]);
            }
        }
    }

    fn image_load(&mut self, set: u32, binding: u32, coord: [i32; 3]) -> [f32; 4] {
        let image = match self.value(set, binding) {
            Some(DescriptorValue::StorageImage { image })
            | Some(DescriptorValue::SampledImage { image, .. })
            | Some(DescriptorValue::CombinedImageSampler { image, .. }) => image.0,
            _ => return [0.0; 4],
        };
        match self.state.images.get(&image) {
            Some(image) if image.in_bounds(coord[0], coord[1], coord[2]) => {
                let off = image.texel_offset(coord[0] as u32, coord[1] as u32, coord[2] as u32);
                let size = image.desc.format.texel_size() as usize;
                image
                    .desc
                    .format
                    .decode(&image.bytes[off..off + size])
                    .unwrap_or([0.0; 4])
            }
            _ => [0.0; 4],
        }
    }

    fn buffer_write(&mut self, set: u32, binding: u32, offset: u64, data: &[u8]) {
        let (buffer, base) = match self.value(set, binding) {
            Some(DescriptorValue::StorageBuffer { buffer, offset, .. }) => (buffer.0, offset),
            other => {
                log::warn!(
                    "buffer_write on non-storage binding {}.{}: {:?}",
                    set,
                    binding,
                    other
                );
                return;
            }
        };
        if let Some(buffer) = self.state.buffers.get_mut(&buffer) {
            let at = (base + offset) as usize;
            if at + data.len() <= buffer.bytes.len() {
                buffer.bytes[at..at + data.len()].copy_from_slice(data);
            }
        }
    }

    fn buffer_read(&mut self, set: u32, binding: u32, offset: u64, out: &mut [u8]) {
        let (buffer, base) = match self.value(set, binding) {
            Some(DescriptorValue::StorageBuffer { buffer, offset, .. })
            | Some(DescriptorValue::UniformBuffer { buffer, offset, .. }) => (buffer.0, offset),
            _ => return,
        };
        if let Some(buffer) = self.state.buffers.get(&buffer) {
            let at = (base + offset) as usize;
            if at + out.len() <= buffer.bytes.len() {
                out.copy_from_slice(&buffer.bytes[at..at + out.len()]);
            }
        }
    }

    fn trace(&mut self, line: u32, type_tag: u32, name: &str, values: &[u32]) {
        if let Some(id) = self.trace_buffer {
            if let Some(buffer) = self.state.buffers.get_mut(&id) {
                trace_write_record(&mut buffer.bytes, line, type_tag, name, values);
            }
        }
    }

    fn trace_active(&self) -> bool {
        self.trace_buffer.is_some()
    }
}
