//! Command submission disciplines.
//!
//! Three stream types share one contract ([`CommandStream`]): record into a
//! command buffer slot, submit it signaling a timeline semaphore, and block
//! until a chosen submission completes. Every slot carries a hold list of
//! shared resource handles; a held handle is dropped (releasing into the
//! memory pool) only after the slot's prior submission is confirmed complete
//! on the GPU. That deferral is what prevents use-after-free of in-flight
//! staging and scratch resources.
//!
//! - [`SyncCommandStream`]: one slot, so `begin_record` waits for the
//!   previous submission.
//! - [`AsyncRingCommandStream`]: N slots; submission `i` may record while
//!   `i - 1 .. i - N + 1` are still executing. `begin_record` of submission
//!   `i` blocks until `i - N` completes, the sole backpressure mechanism.
//! - [`ParallelCommandStream`]: M independent caller-selected slots, each
//!   with depth 1.
//!
//! Submission and device errors are fatal and propagate; an unsubmitted
//! command buffer is discarded by normal drop.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use crate::{
    buffer::Buffer,
    device::{Device, HasDevice},
    error::{Error, Result},
    image::Image,
};

/// Selects a submission for [`CommandStream::wait_complete`].
#[derive(Clone, Copy, Debug)]
pub enum Cursor {
    /// The most recent submission.
    Latest,
    /// `n` submissions before the most recent one. Saturates at the start of
    /// the stream's history.
    Back(u64),
    /// An explicit submission ordinal as returned by
    /// [`CommandStream::end_submit`].
    Absolute(u64),
}

/// Timeline value a cursor resolves to, given the stream's submission count.
/// Submission `i` (1-based) signals timeline value `i`; value 0 is the
/// already-signaled initial state, so waiting on an empty stream returns
/// immediately.
fn resolve_cursor(cursor: Cursor, submitted: u64) -> u64 {
    match cursor {
        Cursor::Latest => submitted,
        Cursor::Back(n) => submitted.saturating_sub(n),
        Cursor::Absolute(value) => value,
    }
}

/// A timeline semaphore with a cached view of the highest value known to be
/// signaled, saving driver round trips on repeated waits.
pub struct TimelineSemaphore {
    device: Device,
    handle: vk::Semaphore,
    signaled: AtomicU64,
}

impl HasDevice for TimelineSemaphore {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl TimelineSemaphore {
    pub fn new(device: Device) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let handle = unsafe { device.create_semaphore(&info, None)? };
        Ok(Self {
            device,
            handle,
            signaled: AtomicU64::new(0),
        })
    }

    pub fn vk_handle(&self) -> vk::Semaphore {
        self.handle
    }

    /// Blocks until the semaphore reaches `value`. No timeout.
    pub fn wait(&self, value: u64) -> Result<()> {
        if self.signaled.load(Ordering::Acquire) >= value {
            return Ok(());
        }
        let semaphores = [self.handle];
        let values = [value];
        unsafe {
            self.device.wait_semaphores(
                &vk::SemaphoreWaitInfo::default()
                    .semaphores(&semaphores)
                    .values(&values),
                u64::MAX,
            )?;
        }
        self.signaled.fetch_max(value, Ordering::Release);
        Ok(())
    }

}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}

/// One command buffer slot with its completion bookkeeping.
struct Slot {
    command_buffer: vk::CommandBuffer,
    /// Timeline value signaled when this slot's last submission completes.
    /// Zero when the slot has never been submitted.
    pending: u64,
    held_buffers: Vec<Buffer>,
    held_images: Vec<Image>,
}

/// Shared state behind every stream discipline: one command pool, a slot
/// ring, and the timeline semaphore sequencing submissions.
struct StreamCore {
    device: Device,
    pool: vk::CommandPool,
    timeline: TimelineSemaphore,
    slots: Vec<Slot>,
    /// Total submissions made on this stream. Submission `i` (1-based)
    /// signals timeline value `i`.
    submitted: u64,
    /// Slot currently being recorded into, if any.
    recording: Option<usize>,
}

impl StreamCore {
    fn new(device: Device, depth: usize) -> Result<Self> {
        assert!(depth >= 1);
        let pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    queue_family_index: device.queue_family_index(),
                    ..Default::default()
                },
                None,
            )?
        };
        let buffers = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(depth as u32),
            )
        };
        let buffers = match buffers {
            Ok(buffers) => buffers,
            Err(err) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };
        let timeline = match TimelineSemaphore::new(device.clone()) {
            Ok(timeline) => timeline,
            Err(err) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(err);
            }
        };
        let slots = buffers
            .into_iter()
            .map(|command_buffer| Slot {
                command_buffer,
                pending: 0,
                held_buffers: Vec::new(),
                held_images: Vec::new(),
            })
            .collect();
        Ok(Self {
            device,
            pool,
            timeline,
            slots,
            submitted: 0,
            recording: None,
        })
    }

    /// Waits for the slot's prior use, releases its holds, and begins
    /// recording into it.
    fn begin_slot(&mut self, slot: usize) -> Result<vk::CommandBuffer> {
        if self.recording.is_some() {
            return Err(Error::InvalidState(
                "begin_record while another recording is open",
            ));
        }
        let entry = &mut self.slots[slot];
        self.timeline.wait(entry.pending)?;
        // Prior submission confirmed complete; now safe to release what it
        // was using.
        entry.held_buffers.clear();
        entry.held_images.clear();
        unsafe {
            self.device.reset_command_buffer(
                entry.command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;
            self.device.begin_command_buffer(
                entry.command_buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
        }
        self.recording = Some(slot);
        Ok(entry.command_buffer)
    }

    fn end_submit(&mut self) -> Result<u64> {
        let slot = self
            .recording
            .take()
            .ok_or(Error::InvalidState("end_submit without begin_record"))?;
        let command_buffer = self.slots[slot].command_buffer;
        let value = self.submitted + 1;
        unsafe {
            self.device.end_command_buffer(command_buffer)?;
            let signal = vk::SemaphoreSubmitInfo::default()
                .semaphore(self.timeline.vk_handle())
                .value(value)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
            let buffer_info =
                vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer);
            self.device.queue_submit2(
                self.device.queue(),
                &[vk::SubmitInfo2::default()
                    .command_buffer_infos(std::slice::from_ref(&buffer_info))
                    .signal_semaphore_infos(std::slice::from_ref(&signal))],
                vk::Fence::null(),
            )?;
        }
        self.slots[slot].pending = value;
        self.submitted = value;
        Ok(value)
    }

    fn wait_complete(&self, cursor: Cursor) -> Result<()> {
        self.timeline.wait(resolve_cursor(cursor, self.submitted))
    }

    fn recording_slot(&mut self) -> &mut Slot {
        let slot = self
            .recording
            .expect("resources can only be held during recording");
        &mut self.slots[slot]
    }

    fn command_buffer(&self) -> vk::CommandBuffer {
        let slot = self
            .recording
            .expect("no recording in progress on this stream");
        self.slots[slot].command_buffer
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        if let Err(err) = self.timeline.wait(self.submitted) {
            tracing::error!(?err, "failed waiting for stream completion on drop");
        }
        for slot in &mut self.slots {
            slot.held_buffers.clear();
            slot.held_images.clear();
        }
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// The contract shared by all submission disciplines.
pub trait CommandStream {
    /// Waits for the target slot's prior use, then opens it for recording.
    /// Returns the command buffer to record into.
    fn begin_record(&mut self) -> Result<vk::CommandBuffer>;

    /// The command buffer currently being recorded. Panics outside a
    /// `begin_record`/`end_submit` pair.
    fn command_buffer(&self) -> vk::CommandBuffer;

    /// Ends recording and submits, returning the submission ordinal usable
    /// with [`Cursor::Absolute`].
    fn end_submit(&mut self) -> Result<u64>;

    /// Blocks until the selected submission completes on the GPU.
    fn wait_complete(&mut self, cursor: Cursor) -> Result<()>;

    /// Pins a buffer to the current recording's slot, deferring its release
    /// until that slot's submission is confirmed complete.
    fn hold_buffer(&mut self, buffer: Buffer);

    /// Pins an image to the current recording's slot; see
    /// [`CommandStream::hold_buffer`].
    fn hold_texture(&mut self, image: Image);
}

/// Depth-1 stream: every `begin_record` waits for the previous submission.
pub struct SyncCommandStream {
    core: StreamCore,
}

impl SyncCommandStream {
    pub fn new(device: Device) -> Result<Self> {
        Ok(Self {
            core: StreamCore::new(device, 1)?,
        })
    }
}

impl HasDevice for SyncCommandStream {
    fn device(&self) -> &Device {
        &self.core.device
    }
}

impl CommandStream for SyncCommandStream {
    fn begin_record(&mut self) -> Result<vk::CommandBuffer> {
        self.core.begin_slot(0)
    }
    fn command_buffer(&self) -> vk::CommandBuffer {
        self.core.command_buffer()
    }
    fn end_submit(&mut self) -> Result<u64> {
        self.core.end_submit()
    }
    fn wait_complete(&mut self, cursor: Cursor) -> Result<()> {
        self.core.wait_complete(cursor)
    }
    fn hold_buffer(&mut self, buffer: Buffer) {
        self.core.recording_slot().held_buffers.push(buffer);
    }
    fn hold_texture(&mut self, image: Image) {
        self.core.recording_slot().held_images.push(image);
    }
}

/// Ring of N slots cycled per submission, for pipelined per-frame work.
pub struct AsyncRingCommandStream {
    core: StreamCore,
    depth: usize,
}

impl AsyncRingCommandStream {
    pub fn new(device: Device, depth: usize) -> Result<Self> {
        assert!(depth >= 1);
        Ok(Self {
            core: StreamCore::new(device, depth)?,
            depth,
        })
    }

    /// The pipelining depth this stream was created with.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl HasDevice for AsyncRingCommandStream {
    fn device(&self) -> &Device {
        &self.core.device
    }
}

impl CommandStream for AsyncRingCommandStream {
    fn begin_record(&mut self) -> Result<vk::CommandBuffer> {
        let slot = (self.core.submitted % self.depth as u64) as usize;
        self.core.begin_slot(slot)
    }
    fn command_buffer(&self) -> vk::CommandBuffer {
        self.core.command_buffer()
    }
    fn end_submit(&mut self) -> Result<u64> {
        self.core.end_submit()
    }
    fn wait_complete(&mut self, cursor: Cursor) -> Result<()> {
        self.core.wait_complete(cursor)
    }
    fn hold_buffer(&mut self, buffer: Buffer) {
        self.core.recording_slot().held_buffers.push(buffer);
    }
    fn hold_texture(&mut self, image: Image) {
        self.core.recording_slot().held_images.push(image);
    }
}

/// M independent slots with caller-controlled selection, each depth 1.
///
/// Useful when several logical workloads submit on one queue but complete at
/// different cadences; the caller routes each recording to its own slot with
/// [`ParallelCommandStream::select_slot`].
pub struct ParallelCommandStream {
    core: StreamCore,
    active: usize,
}

impl ParallelCommandStream {
    pub fn new(device: Device, slots: usize) -> Result<Self> {
        assert!(slots >= 1);
        Ok(Self {
            core: StreamCore::new(device, slots)?,
            active: 0,
        })
    }

    /// Routes subsequent recordings to `slot`. Invalid mid-recording.
    pub fn select_slot(&mut self, slot: usize) {
        assert!(slot < self.core.slots.len(), "slot index out of range");
        assert!(
            self.core.recording.is_none(),
            "cannot switch slots while recording"
        );
        self.active = slot;
    }

    pub fn slot_count(&self) -> usize {
        self.core.slots.len()
    }
}

impl HasDevice for ParallelCommandStream {
    fn device(&self) -> &Device {
        &self.core.device
    }
}

impl CommandStream for ParallelCommandStream {
    fn begin_record(&mut self) -> Result<vk::CommandBuffer> {
        self.core.begin_slot(self.active)
    }
    fn command_buffer(&self) -> vk::CommandBuffer {
        self.core.command_buffer()
    }
    fn end_submit(&mut self) -> Result<u64> {
        self.core.end_submit()
    }
    fn wait_complete(&mut self, cursor: Cursor) -> Result<()> {
        self.core.wait_complete(cursor)
    }
    fn hold_buffer(&mut self, buffer: Buffer) {
        self.core.recording_slot().held_buffers.push(buffer);
    }
    fn hold_texture(&mut self, image: Image) {
        self.core.recording_slot().held_images.push(image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_resolution() {
        assert_eq!(resolve_cursor(Cursor::Latest, 7), 7);
        assert_eq!(resolve_cursor(Cursor::Back(2), 7), 5);
        assert_eq!(resolve_cursor(Cursor::Absolute(3), 7), 3);
        // Waiting further back than the stream's history resolves to the
        // initial value, which is always signaled.
        assert_eq!(resolve_cursor(Cursor::Back(10), 3), 0);
        assert_eq!(resolve_cursor(Cursor::Latest, 0), 0);
    }

    #[test]
    fn ring_slot_reuse_cycle() {
        // Submission i records into slot i % depth, so slot reuse happens
        // exactly depth submissions later.
        let depth = 3u64;
        let slots: Vec<_> = (0..7).map(|submitted| submitted % depth).collect();
        assert_eq!(slots, [0, 1, 2, 0, 1, 2, 0]);
    }
}
