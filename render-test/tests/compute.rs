//! Compute dispatch and read-back scenarios.

use chroma_render::{
    AutoResource, CommandBufferDesc, DispatchCompute, Format, ImageDesc, ImageUsage,
    PipelineResources, ReadImage, ReadbackStatus, ShaderSource,
};
use chroma_render_test::{with_frame_graph, Reflect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[test]
fn compute_fract_pattern_read_back() {
    with_frame_graph(|registry, fg| {
        registry.register_compute(
            "fract_cs",
            Reflect::new()
                .local_size([8, 8, 1])
                .storage_image(0, 0, "un_OutImage")
                .build(),
            Arc::new(|inv| {
                let g = inv.global_id;
                let index = g[0] + g[1] * inv.num_workgroups[0] * inv.local_size[0];
                let size = inv.num_workgroups[0]
                    * inv.num_workgroups[1]
                    * inv.local_size[0]
                    * inv.local_size[1];
                let value = (index as f32 / size as f32).fract();
                inv.image_store(0, 0, [g[0] as i32, g[1] as i32, 0], [value, 0.0, 0.0, 0.0]);
            }),
        );

        let image = AutoResource::new(
            fg,
            fg.create_image(
                &ImageDesc::new()
                    .dimensions((16, 16))
                    .format(Format::R8G8B8A8_UNORM)
                    .usage(ImageUsage::STORAGE | ImageUsage::TRANSFER_SRC),
                Some("Image"),
            )
            .unwrap(),
        );
        assert!(image.valid());
        let ppln = AutoResource::new(
            fg,
            fg.create_compute_pipeline(
                &chroma_render::ComputePipelineDesc::new()
                    .shader("main", ShaderSource::Text("fract_cs".to_owned())),
                Some("compute_fract"),
            )
            .unwrap(),
        );
        assert!(ppln.valid());

        let mut resources = PipelineResources::new();
        assert!(fg.init_pipeline_resources(&mut resources, *ppln, "0"));
        resources.bind_image("un_OutImage", *image);

        let correct = Arc::new(AtomicBool::new(false));
        let correct2 = correct.clone();
        let on_loaded = move |status: ReadbackStatus, view: &chroma_render::ImageView<'_>| {
            assert_eq!(status, ReadbackStatus::Ok);
            // index(8,8) = 8 + 8*16 = 136; 136/256 = 0.53125, stored as unorm8.
            let texel = view.load_u8(8, 8, 0).unwrap();
            let expected = (0.53125f32 * 255.0 + 0.5) as i64;
            assert!((texel[0] as i64 - expected).abs() <= 1, "r = {}", texel[0]);
            correct2.store(true, Ordering::SeqCst);
        };

        let mut cmd = fg
            .begin(CommandBufferDesc::new().name("compute_fract"), &[])
            .unwrap();
        let run = cmd
            .task(
                DispatchCompute::new()
                    .pipeline(*ppln)
                    .add_resources("0", &resources)
                    .dispatch([2, 2]),
            )
            .unwrap();
        cmd.task(
            ReadImage::new()
                .image(*image, [0; 3], [16, 16])
                .depends_on(run)
                .callback(on_loaded),
        )
        .unwrap();

        assert!(fg.execute(cmd));
        assert!(fg.wait_idle());
        assert!(correct.load(Ordering::SeqCst));
        // The guards release the image and pipeline on scope exit.
    });
}

#[test]
fn compute_block_pattern_on_second_set() {
    with_frame_graph(|registry, fg| {
        registry.register_compute(
            "block_cs",
            Reflect::new()
                .local_size([8, 8, 1])
                .storage_image(2, 0, "un_OutImage")
                .build(),
            Arc::new(|inv| {
                let g = inv.global_id;
                let l = inv.local_id;
                let color = [
                    l[0] as f32 / inv.local_size[0] as f32,
                    l[1] as f32 / inv.local_size[1] as f32,
                    1.0,
                    0.0,
                ];
                inv.image_store(2, 0, [g[0] as i32, g[1] as i32, 0], color);
            }),
        );

        let image = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((16, 16))
                    .format(Format::R8G8B8A8_UNORM)
                    .usage(ImageUsage::STORAGE | ImageUsage::TRANSFER_SRC),
                Some("Image"),
            )
            .unwrap();
        let ppln = fg
            .create_compute_pipeline(
                &chroma_render::ComputePipelineDesc::new()
                    .shader("main", ShaderSource::Text("block_cs".to_owned())),
                Some("compute_block"),
            )
            .unwrap();

        let mut resources = PipelineResources::new();
        assert!(fg.init_pipeline_resources(&mut resources, ppln, "2"));
        resources.bind_image("un_OutImage", image);

        let correct = Arc::new(AtomicBool::new(false));
        let correct2 = correct.clone();
        let mut cmd = fg
            .begin(CommandBufferDesc::new().name("compute_block"), &[])
            .unwrap();
        let run = cmd
            .task(
                DispatchCompute::new()
                    .pipeline(ppln)
                    .add_resources("2", &resources)
                    .dispatch([2, 2]),
            )
            .unwrap();
        cmd.task(
            ReadImage::new()
                .image(image, [0; 3], [16, 16])
                .depends_on(run)
                .callback(move |status, view| {
                    assert_eq!(status, ReadbackStatus::Ok);
                    let mut all_equal = true;
                    for y in 0..16u32 {
                        for x in 0..16u32 {
                            let texel = view.load_u8(x, y, 0).unwrap();
                            let r = ((x % 8) as f32 / 8.0 * 255.0 + 0.5) as i64;
                            let g = ((y % 8) as f32 / 8.0 * 255.0 + 0.5) as i64;
                            all_equal &= (texel[0] as i64 - r).abs() <= 1
                                && (texel[1] as i64 - g).abs() <= 1
                                && texel[2] == 255
                                && texel[3] == 0;
                        }
                    }
                    assert!(all_equal);
                    correct2.store(true, Ordering::SeqCst);
                }),
        )
        .unwrap();

        assert!(fg.execute(cmd));
        assert!(fg.wait_idle());
        assert!(correct.load(Ordering::SeqCst));

        fg.release_resource(image);
        fg.release_resource(ppln);
    });
}

#[test]
fn transient_images_alias_within_a_frame() {
    with_frame_graph(|_registry, fg| {
        let desc = ImageDesc::new()
            .dimensions((8, 8))
            .format(Format::R8G8B8A8_UNORM)
            .usage(ImageUsage::TRANSFER_DST);
        let a = fg.create_transient_image(&desc, Some("ta")).unwrap();
        let b = fg.create_transient_image(&desc, Some("tb")).unwrap();

        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        let first = cmd
            .task(chroma_render::ClearImage::new().image(a).color([1.0, 0.0, 0.0, 1.0]))
            .unwrap();
        // Handing the aliased memory to the second member inserts an
        // aliasing barrier on top of the layout transitions.
        cmd.task(
            chroma_render::ClearImage::new()
                .image(b)
                .color([0.0, 1.0, 0.0, 1.0])
                .depends_on(first),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        assert!(fg.flush());
        assert!(fg.last_frame_stats().barriers >= 2);

        // The frame retired with the flush; both transients are gone.
        assert!(fg.image_desc(a).is_err());
        assert!(fg.image_desc(b).is_err());
        assert!(fg.wait_idle());
    });
}

#[test]
fn clear_then_read() {
    with_frame_graph(|_registry, fg| {
        let image = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((8, 8))
                    .format(Format::R8G8B8A8_UNORM)
                    .usage(ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST),
                None,
            )
            .unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        let clear = cmd
            .task(
                chroma_render::ClearImage::new()
                    .image(image)
                    .color([0.0, 1.0, 0.0, 1.0]),
            )
            .unwrap();
        cmd.task(
            ReadImage::new()
                .image(image, [0; 3], [8, 8])
                .depends_on(clear)
                .callback(move |status, view| {
                    assert_eq!(status, ReadbackStatus::Ok);
                    assert_eq!(view.load_u8(3, 5, 0).unwrap(), [0, 255, 0, 255]);
                    done2.store(true, Ordering::SeqCst);
                }),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        assert!(fg.wait_idle());
        assert!(done.load(Ordering::SeqCst));
        fg.release_resource(image);
    });
}
