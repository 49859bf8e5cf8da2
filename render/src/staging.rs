//! Host-visible staging memory for uploads and downloads.
//!
//! Each in-flight frame owns two rings of host-visible chunks, one per
//! direction. Uploads copy the client's bytes into a chunk immediately and
//! the device-side copy is scheduled by the task processor. Downloads
//! reserve a range; the registered callback fires only after the frame's
//! fence signals, on the thread polling completions.

use crate::buffer::{BufferDesc, BufferUsage, BufferView};
use crate::driver::{DeviceBuffer, Driver, MemoryBind};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::image::{Dimensions, ImageView};
use crate::memory::{LinearAllocator, MemoryType};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Outcome delivered to read-back callbacks. Views are empty unless `Ok`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadbackStatus {
    Ok,
    Aborted,
    DeviceLost,
}

pub type ImageReadCallback = Box<dyn FnOnce(ReadbackStatus, &ImageView<'_>) + Send + 'static>;
pub type BufferReadCallback = Box<dyn FnOnce(ReadbackStatus, &BufferView<'_>) + Send + 'static>;

/// A reserved range of one staging chunk.
#[derive(Copy, Clone, Debug)]
pub struct StagingSlice {
    pub buffer: DeviceBuffer,
    pub offset: u64,
    pub size: u64,
}

/// What a download region decodes into when its frame retires.
pub(crate) enum DownloadTarget {
    Image {
        dimensions: Dimensions,
        format: Format,
        row_pitch: usize,
        callback: ImageReadCallback,
    },
    Buffer {
        callback: BufferReadCallback,
    },
}

/// One pending download, parked on the frame ring until the fence signals.
pub(crate) struct DownloadRegion {
    pub slice: StagingSlice,
    pub target: DownloadTarget,
}

impl DownloadRegion {
    /// Reads staging bytes back and fires the callback. On non-`Ok` status
    /// the bytes are skipped and the callback receives an empty view.
    pub(crate) fn complete(self, driver: &dyn Driver, status: ReadbackStatus) {
        let bytes = if status == ReadbackStatus::Ok {
            let mut bytes = vec![0u8; self.slice.size as usize];
            match driver.read_buffer(self.slice.buffer, self.slice.offset, &mut bytes) {
                Ok(()) => Some(bytes),
                Err(e) => {
                    log::warn!("staging read-back failed: {}", e);
                    None
                }
            }
        } else {
            None
        };
        match (self.target, bytes) {
            (
                DownloadTarget::Image {
                    dimensions,
                    format,
                    row_pitch,
                    callback,
                },
                Some(bytes),
            ) => {
                let view = ImageView::new(dimensions, format, row_pitch, &bytes);
                callback(status, &view);
            }
            (DownloadTarget::Image { callback, .. }, None) => {
                let status = if status == ReadbackStatus::Ok {
                    ReadbackStatus::Aborted
                } else {
                    status
                };
                callback(status, &ImageView::empty());
            }
            (DownloadTarget::Buffer { callback }, Some(bytes)) => {
                let view = BufferView::new(Some(&bytes[..]));
                callback(status, &view);
            }
            (DownloadTarget::Buffer { callback }, None) => {
                let status = if status == ReadbackStatus::Ok {
                    ReadbackStatus::Aborted
                } else {
                    status
                };
                callback(status, &BufferView::empty());
            }
        }
    }
}

struct Chunk {
    buffer: DeviceBuffer,
    alloc: LinearAllocator,
}

struct StagingFrame {
    upload: Vec<Chunk>,
    download: Vec<Chunk>,
}

#[derive(Copy, Clone, Debug)]
pub struct StagingConfig {
    pub chunk_size: u64,
    pub max_chunks_per_frame: usize,
    /// Backpressure deadline before `StagingExhausted`.
    pub timeout: Duration,
}

impl Default for StagingConfig {
    fn default() -> Self {
        StagingConfig {
            chunk_size: 16 * 1024 * 1024,
            max_chunks_per_frame: 8,
            timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Direction {
    Upload,
    Download,
}

pub(crate) struct StagingManager {
    driver: Arc<dyn Driver>,
    config: StagingConfig,
    frames: Mutex<Vec<StagingFrame>>,
    retired: Condvar,
    alignment: u64,
}

impl StagingManager {
    pub fn new(
        driver: Arc<dyn Driver>,
        config: StagingConfig,
        frames_in_flight: usize,
    ) -> StagingManager {
        let alignment = driver.caps().staging_alignment.max(4);
        let frames = (0..frames_in_flight)
            .map(|_| StagingFrame {
                upload: Vec::new(),
                download: Vec::new(),
            })
            .collect();
        StagingManager {
            driver,
            config,
            frames: Mutex::new(frames),
            retired: Condvar::new(),
            alignment,
        }
    }

    fn create_chunk(&self, direction: Direction, size: u64) -> Result<Chunk> {
        let (usage, memory) = match direction {
            Direction::Upload => (BufferUsage::TRANSFER_SRC, MemoryType::HostUpload),
            Direction::Download => (BufferUsage::TRANSFER_DST, MemoryType::HostReadback),
        };
        let size = size.max(self.config.chunk_size);
        let buffer = self.driver.create_buffer(
            &BufferDesc::new(size, usage),
            &MemoryBind::Dedicated(memory),
            Some("staging-chunk"),
        )?;
        Ok(Chunk {
            buffer,
            alloc: LinearAllocator::new(size),
        })
    }

    fn allocate(&self, slot: usize, direction: Direction, size: u64) -> Result<StagingSlice> {
        let deadline = ::std::time::Instant::now() + self.config.timeout;
        let mut frames = self.frames.lock();
        loop {
            let frame = &mut frames[slot];
            let chunks = match direction {
                Direction::Upload => &mut frame.upload,
                Direction::Download => &mut frame.download,
            };
            for chunk in chunks.iter_mut() {
                if let Some(offset) = chunk.alloc.allocate(size, self.alignment) {
                    return Ok(StagingSlice {
                        buffer: chunk.buffer,
                        offset,
                        size,
                    });
                }
            }
            if chunks.len() < self.config.max_chunks_per_frame {
                // Growth path; the new chunk is dedicated when the request
                // exceeds the ring chunk size.
                drop(frames);
                let mut chunk = self.create_chunk(direction, size)?;
                let offset = match chunk.alloc.allocate(size, self.alignment) {
                    Some(offset) => offset,
                    None => return Err(Error::StagingExhausted),
                };
                let slice = StagingSlice {
                    buffer: chunk.buffer,
                    offset,
                    size,
                };
                let mut frames = self.frames.lock();
                match direction {
                    Direction::Upload => frames[slot].upload.push(chunk),
                    Direction::Download => frames[slot].download.push(chunk),
                }
                return Ok(slice);
            }
            // All rings exhausted: block until a frame retires.
            let timed_out = self
                .retired
                .wait_until(&mut frames, deadline)
                .timed_out();
            if timed_out {
                return Err(Error::StagingExhausted);
            }
        }
    }

    /// Reserves an upload range and copies `data` into it immediately.
    pub fn stage_upload(&self, slot: usize, data: &[u8]) -> Result<StagingSlice> {
        let slice = self.allocate(slot, Direction::Upload, data.len() as u64)?;
        self.driver.write_buffer(slice.buffer, slice.offset, data)?;
        Ok(slice)
    }

    /// Reserves a download range for the task processor to copy into.
    pub fn stage_download(&self, slot: usize, size: u64) -> Result<StagingSlice> {
        self.allocate(slot, Direction::Download, size)
    }

    /// Recycles a frame's rings once its fence signaled, waking any thread
    /// blocked on backpressure.
    pub fn reset_frame(&self, slot: usize) {
        let mut frames = self.frames.lock();
        let frame = &mut frames[slot];
        for chunk in frame.upload.iter_mut().chain(frame.download.iter_mut()) {
            chunk.alloc.reset();
        }
        self.retired.notify_all();
    }

    /// Tears the rings down; used on device loss and drop.
    pub fn destroy(&self) {
        let mut frames = self.frames.lock();
        for frame in frames.iter_mut() {
            for chunk in frame.upload.drain(..).chain(frame.download.drain(..)) {
                self.driver.destroy_buffer(chunk.buffer);
            }
        }
        self.retired.notify_all();
    }
}
