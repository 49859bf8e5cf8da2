//! Push-constant delivery into compute shaders.

use chroma_render::pipeline::ShaderStageFlags;
use chroma_render::{
    BufferDesc, BufferUsage, CommandBufferDesc, DispatchCompute, PipelineResources, ReadBuffer,
    ReadbackStatus, ShaderSource,
};
use chroma_render_test::{with_frame_graph, Reflect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// std140 block `{ vec3 f3; ivec2 i2; layout(offset=32) float f1; }`.
#[derive(Copy, Clone)]
struct PushBlock {
    f3: [f32; 3],
    i2: [i32; 2],
    f1: f32,
}

impl PushBlock {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; 36];
        for (i, v) in self.f3.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&v.to_bits().to_le_bytes());
        }
        bytes[16..20].copy_from_slice(&self.i2[0].to_le_bytes());
        bytes[20..24].copy_from_slice(&self.i2[1].to_le_bytes());
        bytes[32..36].copy_from_slice(&self.f1.to_bits().to_le_bytes());
        bytes
    }
}

#[test]
fn push_constants_arrive_bit_exact() {
    with_frame_graph(|registry, fg| {
        registry.register_compute(
            "push_cs",
            Reflect::new()
                .local_size([1, 1, 1])
                .storage_buffer(0, 0, "SSB")
                .push_constant("MyPushConstant", 36, ShaderStageFlags::COMPUTE)
                .build(),
            Arc::new(|inv| {
                let out = [
                    inv.push_f32(0),
                    inv.push_f32(4),
                    inv.push_f32(8),
                    inv.push_f32(32),
                    inv.push_i32(16) as f32,
                    inv.push_i32(20) as f32,
                    0.0,
                    1.0,
                ];
                for (i, v) in out.iter().enumerate() {
                    inv.buffer_write_f32(0, 0, i as u64, *v);
                }
            }),
        );

        let dst = fg
            .create_buffer(
                &BufferDesc::new(32, BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC),
                Some("DstBuffer"),
            )
            .unwrap();
        let ppln = fg
            .create_compute_pipeline(
                &chroma_render::ComputePipelineDesc::new()
                    .shader("main", ShaderSource::Text("push_cs".to_owned())),
                Some("push_constant"),
            )
            .unwrap();

        let mut resources = PipelineResources::new();
        assert!(fg.init_pipeline_resources(&mut resources, ppln, "0"));
        resources.bind_buffer("SSB", dst);

        let push = PushBlock {
            f3: [10.1, 11.2, 18.5],
            i2: [11, 22],
            f1: 33.0,
        };

        let called = Arc::new(AtomicBool::new(false));
        let correct = Arc::new(AtomicBool::new(false));
        let (called2, correct2) = (called.clone(), correct.clone());

        let mut cmd = fg
            .begin(CommandBufferDesc::new().name("push_constant"), &[])
            .unwrap();
        let dispatch = cmd
            .task(
                DispatchCompute::new()
                    .pipeline(ppln)
                    .dispatch([1, 1])
                    .add_push_constant("MyPushConstant", &push.to_bytes())
                    .add_resources("0", &resources),
            )
            .unwrap();
        cmd.task(
            ReadBuffer::new()
                .buffer(dst, 0, 32)
                .depends_on(dispatch)
                .callback(move |status, view| {
                    called2.store(true, Ordering::SeqCst);
                    assert_eq!(status, ReadbackStatus::Ok);
                    assert_eq!(view.size(), 32);
                    assert_eq!(view.parts().len(), 1);
                    let data = view.as_f32();
                    let ok = data[0] == push.f3[0]
                        && data[1] == push.f3[1]
                        && data[2] == push.f3[2]
                        && data[3] == push.f1
                        && data[4] == push.i2[0] as f32
                        && data[5] == push.i2[1] as f32
                        && data[6] == 0.0
                        && data[7] == 1.0;
                    correct2.store(ok, Ordering::SeqCst);
                }),
        )
        .unwrap();

        assert!(fg.execute(cmd));
        assert!(!called.load(Ordering::SeqCst));
        assert!(fg.wait_idle());
        assert!(called.load(Ordering::SeqCst));
        assert!(correct.load(Ordering::SeqCst));

        fg.release_resource(dst);
        fg.release_resource(ppln);
    });
}

#[test]
fn unknown_push_constant_is_rejected() {
    with_frame_graph(|registry, fg| {
        registry.register_compute(
            "plain_cs",
            Reflect::new()
                .local_size([1, 1, 1])
                .storage_buffer(0, 0, "SSB")
                .build(),
            Arc::new(|_inv| {}),
        );
        let dst = fg
            .create_buffer(&BufferDesc::new(16, BufferUsage::STORAGE), None)
            .unwrap();
        let ppln = fg
            .create_compute_pipeline(
                &chroma_render::ComputePipelineDesc::new()
                    .shader("main", ShaderSource::Text("plain_cs".to_owned())),
                None,
            )
            .unwrap();
        let mut resources = PipelineResources::new();
        assert!(fg.init_pipeline_resources(&mut resources, ppln, "0"));
        resources.bind_buffer("SSB", dst);

        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        let before = cmd.task_count();
        let result = cmd.task(
            DispatchCompute::new()
                .pipeline(ppln)
                .add_resources("0", &resources)
                .add_push_constant("NoSuchBlock", &[0u8; 4]),
        );
        assert!(result.is_err());
        // A rejected task leaves the graph untouched.
        assert_eq!(cmd.task_count(), before);
        assert!(fg.execute(cmd));
        assert!(fg.wait_idle());

        fg.release_resource(dst);
        fg.release_resource(ppln);
    });
}
