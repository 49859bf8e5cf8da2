//! Staging backpressure and swapchain presentation.

use chroma_render::{
    CommandBufferDesc, Format, FrameGraph, FrameGraphConfig, ImageDesc, ImageUsage,
    PresentImage, ReadImage, StagingConfig, SwapchainDesc,
};
use chroma_render_soft::{ShaderRegistry, SoftCompiler, SoftDriver};
use chroma_render_test::init_logger;
use std::sync::Arc;
use std::time::Duration;

fn tiny_staging_graph() -> FrameGraph {
    init_logger();
    let registry = ShaderRegistry::new();
    let driver = SoftDriver::new(registry.clone());
    let compiler = Arc::new(SoftCompiler::new(registry));
    let mut config = FrameGraphConfig::default();
    config.staging = StagingConfig {
        chunk_size: 1024,
        max_chunks_per_frame: 1,
        timeout: Duration::from_millis(50),
    };
    FrameGraph::new(driver, compiler, config).unwrap()
}

#[test]
fn staging_exhaustion_leaves_the_graph_usable() {
    let fg = tiny_staging_graph();
    let image = fg
        .create_image(
            &ImageDesc::new()
                .dimensions((16, 16))
                .format(Format::R8G8B8A8_UNORM)
                .usage(ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST),
            None,
        )
        .unwrap();

    // First read fits the single 1 KiB chunk (16x16x4 = 1024).
    let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
    cmd.task(
        ReadImage::new()
            .image(image, [0; 3], [16, 16])
            .callback(|_, _| {}),
    )
    .unwrap();
    assert!(fg.execute(cmd));

    // Second read in the same frame cannot be placed: the ring is full and
    // the frame never retires within the timeout.
    let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
    cmd.task(
        ReadImage::new()
            .image(image, [0; 3], [16, 16])
            .callback(|_, _| panic!("must not fire")),
    )
    .unwrap();
    assert!(!fg.execute(cmd));

    // The failure is contained: after retirement the graph works again.
    assert!(fg.wait_idle());
    let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
    cmd.task(
        ReadImage::new()
            .image(image, [0; 3], [16, 16])
            .callback(|_, _| {}),
    )
    .unwrap();
    assert!(fg.execute(cmd));
    assert!(fg.wait_idle());

    fg.release_resource(image);
}

#[test]
fn present_blits_into_the_swapchain() {
    chroma_render_test::with_frame_graph(|_registry, fg| {
        let swapchain = fg
            .create_swapchain(
                &SwapchainDesc {
                    width: 64,
                    height: 64,
                    format: Format::R8G8B8A8_UNORM,
                    image_count: 2,
                },
                Some("swapchain"),
            )
            .unwrap();
        assert_eq!(fg.swapchain_images(swapchain).unwrap().len(), 2);

        let frame = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((64, 64))
                    .format(Format::R8G8B8A8_UNORM)
                    .usage(ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST),
                Some("frame"),
            )
            .unwrap();

        for _ in 0..3 {
            let mut cmd = fg.begin(CommandBufferDesc::new().name("present"), &[]).unwrap();
            let clear = cmd
                .task(
                    chroma_render::ClearImage::new()
                        .image(frame)
                        .color([0.2, 0.4, 0.6, 1.0]),
                )
                .unwrap();
            cmd.task(PresentImage::new(swapchain, frame).depends_on(clear))
                .unwrap();
            assert!(fg.execute(cmd));
            assert!(fg.flush());
        }
        assert!(fg.wait_idle());

        fg.release_resource(frame);
        fg.release_resource(swapchain);
    });
}
