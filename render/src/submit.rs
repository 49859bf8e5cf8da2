//! Submission batching, semaphore wiring and the per-frame retirement ring.
//!
//! Each executed command buffer becomes one driver submission tied to its own
//! fence. Client `wait_for` edges, queue-ownership transfers and swapchain
//! presents are stitched with binary semaphores. Everything a frame owns
//! (command lists, fences, semaphores, pending destructions, download
//! callbacks, descriptor pools, staging rings) is reclaimed when the frame's
//! fences signal.

use crate::debug::ShaderDebugCallback;
use crate::driver::{
    DeviceCommandList, DeviceFence, DeviceSemaphore, Driver, SubmitInfo,
};
use crate::error::{Error, Result};
use crate::handle::RawId;
use crate::pipeline::cache::PipelineCache;
use crate::resource::{ResourceManager, RetiredObject};
use crate::sched::{CompiledCommands, SolverStats};
use crate::staging::{DownloadRegion, ReadbackStatus, StagingManager};
use crate::sync::StageFlags;
use fxhash::FxHashMap;
use std::sync::Arc;

/// Opaque token of one submitted batch; usable in a later `begin`'s
/// `wait_for` list.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BatchToken(pub(crate) u64);

/// Aggregated per-flush statistics.
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameStats {
    pub batches: u32,
    pub tasks: u32,
    pub barriers: u32,
    pub layout_transitions: u32,
    pub queue_transfers: u32,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

impl FrameStats {
    fn absorb(&mut self, stats: &SolverStats) {
        self.batches += 1;
        self.tasks += stats.tasks;
        self.barriers += stats.barriers;
        self.layout_transitions += stats.layout_transitions;
        self.queue_transfers += stats.queue_transfers;
        self.upload_bytes += stats.upload_bytes;
        self.download_bytes += stats.download_bytes;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FrameState {
    Idle,
    Submitted,
}

struct PendingTrace {
    region: crate::staging::StagingSlice,
    task_name: String,
    shader_name: String,
    stage: crate::pipeline::ShaderStageFlags,
}

struct FrameInFlight {
    state: FrameState,
    fences: Vec<DeviceFence>,
    command_lists: Vec<DeviceCommandList>,
    semaphores: Vec<DeviceSemaphore>,
    batch_serials: Vec<u64>,
    downloads: Vec<DownloadRegion>,
    traces: Vec<PendingTrace>,
    /// Per-frame transient resources, released when the frame retires.
    transients: Vec<RawId>,
}

impl FrameInFlight {
    fn new() -> FrameInFlight {
        FrameInFlight {
            state: FrameState::Idle,
            fences: Vec::new(),
            command_lists: Vec::new(),
            semaphores: Vec::new(),
            batch_serials: Vec::new(),
            downloads: Vec::new(),
            traces: Vec::new(),
            transients: Vec::new(),
        }
    }
}

struct BatchRecord {
    semaphore: DeviceSemaphore,
}

pub(crate) struct SubmissionBatcher {
    driver: Arc<dyn Driver>,
    frames: Vec<FrameInFlight>,
    current_slot: usize,
    next_serial: u64,
    /// Per-batch signal semaphores for `wait_for` stitching.
    batches: FxHashMap<u64, BatchRecord>,
    /// Destroyed driver objects, tagged with the first batch serial whose
    /// completion does NOT cover them: an entry is deleted once every batch
    /// with a smaller serial has retired.
    deferred_destroy: Vec<(u64, Vec<RetiredObject>)>,
    stats: FrameStats,
    last_stats: FrameStats,
    fence_wait_ns: u64,
}

impl SubmissionBatcher {
    pub fn new(
        driver: Arc<dyn Driver>,
        frames_in_flight: usize,
        fence_wait_ns: u64,
    ) -> SubmissionBatcher {
        SubmissionBatcher {
            driver,
            frames: (0..frames_in_flight).map(|_| FrameInFlight::new()).collect(),
            current_slot: 0,
            next_serial: 1,
            batches: FxHashMap::default(),
            deferred_destroy: Vec::new(),
            stats: FrameStats::default(),
            last_stats: FrameStats::default(),
            fence_wait_ns,
        }
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn next_task_serial_base(&self) -> u64 {
        self.next_serial << 20
    }

    /// Statistics of the last closed submission window.
    pub fn last_stats(&self) -> FrameStats {
        self.last_stats
    }

    /// Ties a transient resource to the current frame: its reference is
    /// dropped when the frame retires.
    pub fn register_transient(&mut self, raw: RawId) {
        self.frames[self.current_slot].transients.push(raw);
    }

    /// Submits one compiled command buffer as a batch, wiring semaphores for
    /// `wait_for` edges, queue transfers and presents.
    ///
    /// `acquire_waits` carries the swapchain-acquire semaphores of this
    /// buffer's presents.
    pub fn submit(
        &mut self,
        manager: &ResourceManager,
        compiled: CompiledCommands,
        wait_for: &[BatchToken],
        acquire_waits: Vec<DeviceSemaphore>,
    ) -> Result<BatchToken> {
        let slot = self.current_slot;
        let serial = self.next_serial;
        self.next_serial += 1;

        let mut waits: Vec<(DeviceSemaphore, StageFlags)> = Vec::new();
        for token in wait_for {
            match self.batches.get(&token.0) {
                Some(batch) => waits.push((batch.semaphore, StageFlags::TOP_OF_PIPE)),
                // The batch already retired; the dependency is satisfied.
                None => {}
            }
        }
        for semaphore in acquire_waits {
            waits.push((semaphore, StageFlags::TRANSFER));
            self.frames[slot].semaphores.push(semaphore);
        }

        // Queue-ownership releases run as their own tiny batches on the
        // producer queues, each signaling a semaphore the main batch waits
        // on.
        for release in &compiled.releases {
            let semaphore = self.driver.create_semaphore()?;
            let list = self
                .driver
                .record(release.queue, &[crate::driver::DriverCmd::Barrier(
                    release.barrier.clone(),
                )])?;
            self.driver.submit(
                release.queue,
                SubmitInfo {
                    wait_semaphores: Vec::new(),
                    command_lists: vec![list],
                    signal_semaphores: vec![semaphore],
                    fence: None,
                },
            )?;
            waits.push((semaphore, StageFlags::TOP_OF_PIPE));
            let frame = &mut self.frames[slot];
            frame.semaphores.push(semaphore);
            frame.command_lists.push(list);
        }

        let batch_semaphore = self.driver.create_semaphore()?;
        let mut signals = vec![batch_semaphore];
        let mut present_waits = Vec::new();
        for _ in &compiled.presents {
            let semaphore = self.driver.create_semaphore()?;
            signals.push(semaphore);
            present_waits.push(semaphore);
        }

        let fence = self.driver.create_fence()?;
        let list = self.driver.record(compiled.queue, &compiled.ops)?;
        self.driver.submit(
            compiled.queue,
            SubmitInfo {
                wait_semaphores: waits,
                command_lists: vec![list],
                signal_semaphores: signals,
                fence: Some(fence),
            },
        )?;

        // Presents follow their batch immediately.
        for (present, semaphore) in compiled.presents.iter().zip(present_waits) {
            let (device, _) = {
                let swapchains = manager.swapchains.read();
                let record = swapchains.get(present.swapchain)?;
                (record.device, ())
            };
            self.driver
                .present(compiled.queue, device, present.image_index, semaphore)?;
            self.frames[slot].semaphores.push(semaphore);
        }

        // The submission is now visible: reconcile tracking state and park
        // everything the frame owns.
        manager.apply_access_states(&compiled.updated_states);
        let frame = &mut self.frames[slot];
        frame.state = FrameState::Submitted;
        frame.fences.push(fence);
        frame.command_lists.push(list);
        frame.semaphores.push(batch_semaphore);
        frame.batch_serials.push(serial);
        frame.downloads.extend(compiled.downloads);
        frame
            .traces
            .extend(compiled.traces.into_iter().map(|t| PendingTrace {
                region: t.slice,
                task_name: t.task_name,
                shader_name: t.shader_name,
                stage: t.stage,
            }));
        self.stats.absorb(&compiled.stats);
        self.sweep_pending(manager);
        self.batches.insert(
            serial,
            BatchRecord {
                semaphore: batch_semaphore,
            },
        );
        Ok(BatchToken(serial))
    }

    /// Non-blocking poll: retires every submitted frame whose fences have all
    /// signaled.
    pub fn poll(
        &mut self,
        manager: &ResourceManager,
        cache: &PipelineCache,
        staging: &StagingManager,
        debug_callback: &Option<ShaderDebugCallback>,
    ) -> Result<()> {
        for slot in 0..self.frames.len() {
            if self.frames[slot].state != FrameState::Submitted {
                continue;
            }
            let mut all_signaled = true;
            for &fence in &self.frames[slot].fences {
                if !self.driver.fence_signaled(fence)? {
                    all_signaled = false;
                    break;
                }
            }
            if all_signaled {
                self.retire_frame(slot, manager, cache, staging, debug_callback, ReadbackStatus::Ok);
            }
        }
        self.sweep_pending(manager);
        Ok(())
    }

    /// Collects new destruction requests and deletes every deferred entry
    /// whose covering submissions have all retired.
    fn sweep_pending(&mut self, manager: &ResourceManager) {
        let pending = manager.take_pending_destroy();
        if !pending.is_empty() {
            self.deferred_destroy.push((self.next_serial, pending));
        }
        // Oldest batch still on the GPU; everything older has retired.
        let oldest_outstanding = self
            .frames
            .iter()
            .filter(|f| f.state == FrameState::Submitted)
            .flat_map(|f| f.batch_serials.iter().copied())
            .min()
            .unwrap_or(u64::MAX);
        let mut ready = Vec::new();
        let mut kept = Vec::new();
        for (barrier, objects) in self.deferred_destroy.drain(..) {
            if barrier <= oldest_outstanding {
                ready.extend(objects);
            } else {
                kept.push((barrier, objects));
            }
        }
        self.deferred_destroy = kept;
        if !ready.is_empty() {
            manager.delete_retired(ready);
        }
    }

    /// Closes the current submission window and moves to the next frame
    /// slot, blocking until that slot's previous occupant retired.
    pub fn flush(
        &mut self,
        manager: &ResourceManager,
        cache: &PipelineCache,
        staging: &StagingManager,
        debug_callback: &Option<ShaderDebugCallback>,
    ) -> Result<()> {
        self.poll(manager, cache, staging, debug_callback)?;
        self.last_stats = std::mem::replace(&mut self.stats, FrameStats::default());
        let next = (self.current_slot + 1) % self.frames.len();
        if self.frames[next].state == FrameState::Submitted {
            let fences = self.frames[next].fences.clone();
            if !self.driver.wait_fences(&fences, self.fence_wait_ns)? {
                return Err(Error::Timeout);
            }
            self.retire_frame(next, manager, cache, staging, debug_callback, ReadbackStatus::Ok);
        }
        self.current_slot = next;
        Ok(())
    }

    /// Blocks until every pending fence signals, then drains all
    /// retirements and callbacks.
    pub fn wait_idle(
        &mut self,
        manager: &ResourceManager,
        cache: &PipelineCache,
        staging: &StagingManager,
        debug_callback: &Option<ShaderDebugCallback>,
    ) -> Result<()> {
        let fences: Vec<DeviceFence> = self
            .frames
            .iter()
            .flat_map(|f| f.fences.iter().copied())
            .collect();
        if !fences.is_empty() && !self.driver.wait_fences(&fences, self.fence_wait_ns)? {
            return Err(Error::Timeout);
        }
        for slot in 0..self.frames.len() {
            if self.frames[slot].state == FrameState::Submitted {
                self.retire_frame(slot, manager, cache, staging, debug_callback, ReadbackStatus::Ok);
            }
        }
        self.sweep_pending(manager);
        Ok(())
    }

    /// Device loss / teardown: every pending callback fires with the given
    /// status and empty views; driver objects are reclaimed unconditionally.
    pub fn abort_all(
        &mut self,
        manager: &ResourceManager,
        cache: &PipelineCache,
        staging: &StagingManager,
        status: ReadbackStatus,
    ) {
        debug_assert!(status != ReadbackStatus::Ok);
        for slot in 0..self.frames.len() {
            if self.frames[slot].state == FrameState::Submitted {
                self.retire_frame(slot, manager, cache, staging, &None, status);
            }
        }
        // Nothing is left on the GPU; everything deferred can go.
        let mut all = manager.take_pending_destroy();
        for (_, objects) in self.deferred_destroy.drain(..) {
            all.extend(objects);
        }
        manager.delete_retired(all);
    }

    fn retire_frame(
        &mut self,
        slot: usize,
        manager: &ResourceManager,
        cache: &PipelineCache,
        staging: &StagingManager,
        debug_callback: &Option<ShaderDebugCallback>,
        status: ReadbackStatus,
    ) {
        let frame = &mut self.frames[slot];
        frame.state = FrameState::Idle;

        // Read-back callbacks first: they observe staging memory that the
        // ring reset below recycles.
        for download in frame.downloads.drain(..) {
            download.complete(self.driver.as_ref(), status);
        }
        for trace in frame.traces.drain(..) {
            if status != ReadbackStatus::Ok {
                continue;
            }
            let mut bytes = vec![0u8; trace.region.size as usize];
            if let Err(e) =
                self.driver
                    .read_buffer(trace.region.buffer, trace.region.offset, &mut bytes)
            {
                log::warn!("shader trace read-back failed: {}", e);
                continue;
            }
            let outputs = crate::debug::decode_trace(&bytes);
            if let Some(callback) = debug_callback {
                callback(&trace.task_name, &trace.shader_name, trace.stage, &outputs);
            }
        }

        for list in frame.command_lists.drain(..) {
            self.driver.destroy_command_list(list);
        }
        for semaphore in frame.semaphores.drain(..) {
            self.driver.destroy_semaphore(semaphore);
        }
        for fence in frame.fences.drain(..) {
            self.driver.destroy_fence(fence);
        }
        for serial in frame.batch_serials.drain(..) {
            self.batches.remove(&serial);
        }
        for raw in frame.transients.drain(..) {
            manager.release(raw);
        }

        if let Err(e) = cache.retire_frame(slot) {
            log::warn!("descriptor pool reset failed: {}", e);
        }
        staging.reset_frame(slot);
    }
}
