//! Cross-frame uploads and cross-queue ownership transfers.

use chroma_render::{
    BufferDesc, BufferUsage, CommandBufferDesc, Format, ImageDesc, ImageUsage, QueueKind,
    ReadBuffer, ReadImage, ReadbackStatus, UpdateBuffer, UpdateImage,
};
use chroma_render_test::with_frame_graph;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const SRC: (u32, u32) = (64, 64);
const DST: (u32, u32) = (128, 128);
const OFFSET: (u32, u32) = (16, 27);

fn source_texel(x: u32, y: u32) -> [u8; 4] {
    [x as u8, y as u8, (x ^ y) as u8, 0xff]
}

fn source_rows(y0: u32, rows: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity((SRC.0 * rows * 4) as usize);
    for y in y0..y0 + rows {
        for x in 0..SRC.0 {
            data.extend_from_slice(&source_texel(x, y));
        }
    }
    data
}

#[test]
fn copy_spanning_two_frames() {
    with_frame_graph(|_registry, fg| {
        let dst = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions(DST)
                    .format(Format::R8G8B8A8_UNORM)
                    .usage(ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST),
                Some("dst"),
            )
            .unwrap();

        // Frame 1: upper half of the source lands at the offset.
        let mut cmd = fg
            .begin(CommandBufferDesc::new().name("frame1"), &[])
            .unwrap();
        cmd.task(
            UpdateImage::new()
                .image(dst)
                .region(
                    [OFFSET.0 as i32, OFFSET.1 as i32, 0],
                    [SRC.0, SRC.1 / 2, 1],
                )
                .data(&source_rows(0, SRC.1 / 2)),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        assert!(fg.flush());

        // Frame 2: lower half, then a read of the whole destination.
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let mut cmd = fg
            .begin(CommandBufferDesc::new().name("frame2"), &[])
            .unwrap();
        let upload = cmd
            .task(
                UpdateImage::new()
                    .image(dst)
                    .region(
                        [OFFSET.0 as i32, (OFFSET.1 + SRC.1 / 2) as i32, 0],
                        [SRC.0, SRC.1 / 2, 1],
                    )
                    .data(&source_rows(SRC.1 / 2, SRC.1 / 2)),
            )
            .unwrap();
        cmd.task(
            ReadImage::new()
                .image(dst, [0; 3], [DST.0, DST.1])
                .depends_on(upload)
                .callback(move |status, view| {
                    assert_eq!(status, ReadbackStatus::Ok);
                    for y in 0..SRC.1 {
                        for x in 0..SRC.0 {
                            let got = view.texel_bytes(x + OFFSET.0, y + OFFSET.1, 0);
                            assert_eq!(got, source_texel(x, y), "mismatch at ({}, {})", x, y);
                        }
                    }
                    fired2.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
        assert!(fg.execute(cmd));

        // Nothing fires before the idle wait.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(fg.wait_idle());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(fg.wait_idle());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        fg.release_resource(dst);
    });
}

#[test]
fn buffer_crosses_queues_with_ownership_transfer() {
    with_frame_graph(|_registry, fg| {
        let buffer = fg
            .create_buffer(
                &BufferDesc::new(
                    256,
                    BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                ),
                Some("shared"),
            )
            .unwrap();
        let payload: Vec<u8> = (0..=255).collect();

        let mut cmd = fg
            .begin(
                CommandBufferDesc::new().name("producer").queue(QueueKind::Graphics),
                &[],
            )
            .unwrap();
        cmd.task(UpdateBuffer::new().buffer(buffer, 0).data(&payload))
            .unwrap();
        let producer = fg.execute_batch(cmd).unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let expected = payload.clone();
        let mut cmd = fg
            .begin(
                CommandBufferDesc::new()
                    .name("consumer")
                    .queue(QueueKind::AsyncCompute),
                &[producer],
            )
            .unwrap();
        cmd.task(
            ReadBuffer::new()
                .buffer(buffer, 0, 256)
                .callback(move |status, view| {
                    assert_eq!(status, ReadbackStatus::Ok);
                    assert_eq!(view.to_vec(), expected);
                    fired2.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        assert!(fg.flush());
        assert!(fg.wait_idle());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(fg.last_frame_stats().queue_transfers, 1);

        fg.release_resource(buffer);
    });
}
