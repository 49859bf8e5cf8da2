//! Shader debug tracing through the graph debugger.

use chroma_render::driver::DebugTraceBinding;
use chroma_render::pipeline::ShaderStageFlags;
use chroma_render::{
    CommandBufferDesc, DebugFlags, DispatchCompute, Format, ImageDesc, ImageUsage,
    PipelineResources, ReadImage, ReadbackStatus, ShaderSource,
};
use chroma_render_test::{with_frame_graph, Reflect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn traced_dispatch_reports_one_invocation() {
    with_frame_graph(|registry, fg| {
        registry.register_compute_traced(
            "dbg_cs",
            Reflect::new()
                .local_size([8, 8, 1])
                .storage_image(0, 0, "un_OutImage")
                .storage_buffer(0, 1, "dbg_Trace")
                .build(),
            DebugTraceBinding { set: 0, binding: 1 },
            Arc::new(|inv| {
                let g = inv.global_id;
                let index = g[0] + g[1] * inv.num_workgroups[0] * inv.local_size[0];
                let size = inv.num_workgroups[0]
                    * inv.num_workgroups[1]
                    * inv.local_size[0]
                    * inv.local_size[1];
                let value = (index as f32 / size as f32).fract();
                if inv.trace_active() {
                    inv.trace_uint(11, "index", &[index]);
                    inv.trace_uint(12, "size", &[size]);
                    inv.trace_float(13, "value", &[value]);
                    inv.trace_void(14, "imageStore");
                }
                inv.image_store(0, 0, [g[0] as i32, g[1] as i32, 0], [value; 4]);
            }),
        );

        let image = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((16, 16))
                    .format(Format::R32_SFLOAT)
                    .usage(ImageUsage::STORAGE | ImageUsage::TRANSFER_SRC),
                Some("Output"),
            )
            .unwrap();
        let ppln = fg
            .create_compute_pipeline(
                &chroma_render::ComputePipelineDesc::new()
                    .shader("main", ShaderSource::Text("dbg_cs".to_owned()))
                    .shader_name("Debugger1_CS"),
                Some("shader_debugger"),
            )
            .unwrap();

        let mut resources = PipelineResources::new();
        assert!(fg.init_pipeline_resources(&mut resources, ppln, "0"));
        resources.bind_image("un_OutImage", image);

        let trace_ok = Arc::new(AtomicBool::new(false));
        let trace_count = Arc::new(Mutex::new(0u32));
        let (trace_ok2, trace_count2) = (trace_ok.clone(), trace_count.clone());
        fg.set_shader_debug_callback(Some(Box::new(move |task, shader, stages, outputs| {
            *trace_count2.lock().unwrap() += 1;
            let mut ok = true;
            ok &= task == "DebuggableCompute";
            ok &= shader == "Debugger1_CS";
            ok &= stages == ShaderStageFlags::COMPUTE;
            ok &= outputs.len() == 1;
            if let Some(body) = outputs.first() {
                ok &= body.contains("//> index: uint {136}");
                ok &= body.contains("//> size: uint {256}");
                ok &= body.contains("//> value: float {0.531250}");
                ok &= body.contains("//> imageStore(): void");
            }
            trace_ok2.store(ok, Ordering::SeqCst);
        })));

        let data_ok = Arc::new(AtomicBool::new(false));
        let data_ok2 = data_ok.clone();

        let mut cmd = fg
            .begin(
                CommandBufferDesc::new()
                    .name("shader_debugger")
                    .debug(DebugFlags::SHADER_TRACE),
                &[],
            )
            .unwrap();
        let run = cmd
            .task(
                DispatchCompute::new()
                    .pipeline(ppln)
                    .add_resources("0", &resources)
                    .dispatch([2, 2])
                    .name("DebuggableCompute")
                    .enable_debug_trace([8, 8, 0]),
            )
            .unwrap();
        cmd.task(
            ReadImage::new()
                .image(image, [0; 3], [16, 16])
                .depends_on(run)
                .callback(move |status, view| {
                    assert_eq!(status, ReadbackStatus::Ok);
                    assert_eq!(view.load(8, 8, 0).unwrap()[0], 0.53125);
                    data_ok2.store(true, Ordering::SeqCst);
                }),
        )
        .unwrap();

        assert!(fg.execute(cmd));
        assert!(fg.wait_idle());

        assert!(data_ok.load(Ordering::SeqCst));
        assert_eq!(*trace_count.lock().unwrap(), 1);
        assert!(trace_ok.load(Ordering::SeqCst));

        fg.release_resource(image);
        fg.release_resource(ppln);
    });
}

#[test]
fn trace_without_the_flag_stays_silent() {
    with_frame_graph(|registry, fg| {
        registry.register_compute(
            "quiet_cs",
            Reflect::new()
                .local_size([1, 1, 1])
                .storage_image(0, 0, "un_OutImage")
                .build(),
            Arc::new(|_inv| {}),
        );
        let image = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((4, 4))
                    .format(Format::R8G8B8A8_UNORM)
                    .usage(ImageUsage::STORAGE),
                None,
            )
            .unwrap();
        let ppln = fg
            .create_compute_pipeline(
                &chroma_render::ComputePipelineDesc::new()
                    .shader("main", ShaderSource::Text("quiet_cs".to_owned())),
                None,
            )
            .unwrap();
        let mut resources = PipelineResources::new();
        assert!(fg.init_pipeline_resources(&mut resources, ppln, "0"));
        resources.bind_image("un_OutImage", image);

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        fg.set_shader_debug_callback(Some(Box::new(move |_, _, _, _| {
            fired2.store(true, Ordering::SeqCst);
        })));

        // No SHADER_TRACE debug flag on the command buffer: the request is
        // dropped.
        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        cmd.task(
            DispatchCompute::new()
                .pipeline(ppln)
                .add_resources("0", &resources)
                .enable_debug_trace([0, 0, 0]),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        assert!(fg.wait_idle());
        assert!(!fired.load(Ordering::SeqCst));

        fg.release_resource(image);
        fg.release_resource(ppln);
    });
}
