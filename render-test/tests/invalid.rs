//! Resilience against stale and fabricated handles.

use chroma_render::handle::{ImageId, RawId, ResourceKind};
use chroma_render::{
    CommandBufferDesc, CopyImage, DispatchCompute, Error, Format, ImageDesc, ImageUsage,
    PipelineResources, ReadImage, ReadbackStatus, ShaderSource,
};
use chroma_render_test::{with_frame_graph, Reflect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[test]
fn fabricated_handles_do_not_take_down_the_graph() {
    with_frame_graph(|registry, fg| {
        registry.register_compute(
            "inv_cs",
            Reflect::new()
                .local_size([8, 8, 1])
                .storage_image(0, 0, "un_OutImage")
                .build(),
            Arc::new(|inv| {
                let g = inv.global_id;
                inv.image_store(0, 0, [g[0] as i32, g[1] as i32, 0], [1.0, 0.0, 1.0, 1.0]);
            }),
        );

        let desc = ImageDesc::new()
            .dimensions((16, 16))
            .format(Format::R8G8B8A8_UNORM)
            .usage(ImageUsage::STORAGE | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST);
        let image0 = fg.create_image(&desc, Some("Image0")).unwrap();
        let image1 = fg.create_image(&desc, Some("Image1")).unwrap();
        // A second strong reference to image0.
        let image2 = fg.acquire_resource(image0).unwrap();
        // Handles out of thin air.
        let image3 = ImageId::from_raw(RawId::from_parts(1111, 1, ResourceKind::Image));
        let image4 = ImageId::from_raw(RawId::from_parts(2222, 1, ResourceKind::Image));

        let ppln = fg
            .create_compute_pipeline(
                &chroma_render::ComputePipelineDesc::new()
                    .shader("main", ShaderSource::Text("inv_cs".to_owned())),
                Some("invalid_id"),
            )
            .unwrap();
        let mut resources = PipelineResources::new();
        assert!(fg.init_pipeline_resources(&mut resources, ppln, "0"));
        resources.bind_image("un_OutImage", image0);

        // Descriptions of fabricated handles fail cleanly.
        assert!(matches!(fg.image_desc(image3), Err(Error::InvalidHandle(_))));

        // Frame 1: a copy with a fabricated destination records a warning
        // but the rest of the graph still executes.
        let mut cmd = fg
            .begin(CommandBufferDesc::new().name("frame1"), &[])
            .unwrap();
        let run = cmd
            .task(
                DispatchCompute::new()
                    .pipeline(ppln)
                    .add_resources("0", &resources)
                    .dispatch([2, 2]),
            )
            .unwrap();
        let copy = cmd
            .task(CopyImage::new().from(image2).to(image4).depends_on(run))
            .unwrap();
        let _ = copy;
        assert!(!cmd.diagnostics().is_empty());
        assert!(fg.execute(cmd));

        assert_eq!(fg.release_resource(image2), 1);

        // Frame 2: the same graph with valid handles, verified end to end.
        let verified = Arc::new(AtomicBool::new(false));
        let verified2 = verified.clone();
        let mut cmd = fg
            .begin(CommandBufferDesc::new().name("frame2"), &[])
            .unwrap();
        let run = cmd
            .task(
                DispatchCompute::new()
                    .pipeline(ppln)
                    .add_resources("0", &resources)
                    .dispatch([2, 2]),
            )
            .unwrap();
        let copy = cmd
            .task(CopyImage::new().from(image0).to(image1).depends_on(run))
            .unwrap();
        cmd.task(
            ReadImage::new()
                .image(image1, [0; 3], [16, 16])
                .depends_on(copy)
                .callback(move |status, view| {
                    assert_eq!(status, ReadbackStatus::Ok);
                    assert_eq!(view.load_u8(5, 9, 0).unwrap(), [255, 0, 255, 255]);
                    verified2.store(true, Ordering::SeqCst);
                }),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        assert!(fg.wait_idle());
        assert!(verified.load(Ordering::SeqCst));

        // Releasing fabricated handles is a no-op.
        assert_eq!(fg.release_resource(image3), 0);
        assert_eq!(fg.release_resource(image4), 0);

        fg.release_resource(image0);
        fg.release_resource(image1);
        fg.release_resource(ppln);
    });
}

#[test]
fn reading_through_a_stale_handle_is_skipped() {
    with_frame_graph(|_registry, fg| {
        let image = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((8, 8))
                    .format(Format::R8G8B8A8_UNORM)
                    .usage(ImageUsage::TRANSFER_SRC),
                None,
            )
            .unwrap();
        assert_eq!(fg.release_resource(image), 0);

        // The handle is now stale: the read task is neutered with a warning
        // and the callback never fires, but recording and execution succeed.
        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        cmd.task(
            ReadImage::new()
                .image(image, [0; 3], [8, 8])
                .callback(|_, _| panic!("callback on a stale handle")),
        )
        .unwrap();
        assert_eq!(cmd.diagnostics().len(), 1);
        assert!(fg.execute(cmd));
        assert!(fg.wait_idle());
    });
}
