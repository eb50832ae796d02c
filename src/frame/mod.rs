//! Frames in flight.
//!
//! Each [`FrameSlot`] owns the command list, the completion fence and the
//! image-acquired semaphore of one frame. The CPU only touches a slot's
//! resources after waiting on its fence, which is the sole steady-state
//! backpressure between CPU recording and GPU execution.
//!
//! A slot walks `Idle → WaitCompletion → Acquiring → Recording →
//! Submitted → Presenting → Idle`. An out-of-date surface at acquire time
//! returns the slot to `Idle` with its fence still signalled and its
//! command list untouched, so the next frame can reuse it unchanged.

use crate::error::PrismError;
use crate::gpu::{
    AcquireOutcome, CommandList, FenceId, GpuDevice, PresentOutcome,
    SemaphoreId, SubmitInfo,
};

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Where a slot is in its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Free to start a frame.
    #[default]
    Idle,
    /// Blocked on the fence of the frame submitted from this slot last
    /// time round.
    WaitCompletion,
    /// Waiting for a presentable image.
    Acquiring,
    /// Commands are being recorded.
    Recording,
    /// Work is queued; the fence signals when it completes.
    Submitted,
    /// Present was requested.
    Presenting,
}

/// Per-frame CPU/GPU resources.
#[derive(Debug)]
pub struct FrameSlot {
    commands: CommandList,
    fence: FenceId,
    image_available: SemaphoreId,
    state: SlotState,
}

impl FrameSlot {
    fn new<D: GpuDevice>(device: &mut D) -> Result<Self, PrismError> {
        Ok(Self {
            commands: CommandList::new(),
            // Signalled so the first wait on a fresh slot returns at once.
            fence: device.create_fence(true)?,
            image_available: device.create_semaphore()?,
            state: SlotState::Idle,
        })
    }

    /// Completion fence.
    #[must_use]
    pub const fn fence(&self) -> FenceId {
        self.fence
    }

    /// Semaphore the acquire signals.
    #[must_use]
    pub const fn image_available(&self) -> SemaphoreId {
        self.image_available
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SlotState {
        self.state
    }

    /// Commands recorded for the last frame of this slot.
    #[must_use]
    pub const fn commands(&self) -> &CommandList {
        &self.commands
    }
}

/// Ring of [`FRAMES_IN_FLIGHT`] slots plus the per-surface-image
/// render-finished semaphores.
#[derive(Debug)]
pub struct FrameSlotManager {
    slots: Vec<FrameSlot>,
    render_finished: Vec<SemaphoreId>,
    current: usize,
    image_index: Option<u32>,
    acquired_suboptimal: bool,
    frame_counter: u64,
}

impl FrameSlotManager {
    /// Create the slots and one render-finished semaphore per surface
    /// image.
    ///
    /// # Errors
    ///
    /// Fence or semaphore creation failure.
    pub fn new<D: GpuDevice>(
        device: &mut D,
        surface_images: usize,
    ) -> Result<Self, PrismError> {
        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            slots.push(FrameSlot::new(device)?);
        }
        let mut manager = Self {
            slots,
            render_finished: Vec::new(),
            current: 0,
            image_index: None,
            acquired_suboptimal: false,
            frame_counter: 0,
        };
        manager.recreate_render_finished(device, surface_images)?;
        Ok(manager)
    }

    /// Index of the slot the next (or current) frame uses.
    #[must_use]
    pub const fn slot_index(&self) -> usize {
        self.current
    }

    /// The current slot.
    #[must_use]
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// Every slot, in ring order.
    #[must_use]
    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Frames presented (or attempted) since creation.
    #[must_use]
    pub const fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Surface image acquired for the frame being recorded.
    #[must_use]
    pub const fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: SlotState,
    ) -> Result<(), PrismError> {
        let state = self.slots[self.current].state;
        if state == expected {
            Ok(())
        } else {
            Err(PrismError::SlotState { operation, state })
        }
    }

    /// Block until the GPU finished the work last submitted from the
    /// current slot. No timeout.
    ///
    /// # Errors
    ///
    /// [`PrismError::SlotState`] unless the slot is idle, or a fatal
    /// device failure.
    pub fn begin_frame<D: GpuDevice>(
        &mut self,
        device: &mut D,
    ) -> Result<(), PrismError> {
        self.expect_state("begin a frame", SlotState::Idle)?;
        let slot = &mut self.slots[self.current];
        slot.state = SlotState::WaitCompletion;
        device.wait_fence(slot.fence)?;
        slot.state = SlotState::Acquiring;
        Ok(())
    }

    /// Request the next presentable image.
    ///
    /// Returns `None` when the surface is out of date; the slot goes back
    /// to idle untouched and the caller should run the resize protocol.
    ///
    /// # Errors
    ///
    /// [`PrismError::SlotState`] unless [`begin_frame`](Self::begin_frame)
    /// ran, or a fatal device failure.
    pub fn acquire_target<D: GpuDevice>(
        &mut self,
        device: &mut D,
    ) -> Result<Option<u32>, PrismError> {
        self.expect_state("acquire", SlotState::Acquiring)?;
        let slot = &mut self.slots[self.current];
        match device.acquire_next_image(slot.image_available)? {
            AcquireOutcome::OutOfDate => {
                log::warn!("surface out of date at acquire");
                slot.state = SlotState::Idle;
                self.image_index = None;
                Ok(None)
            }
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => {
                slot.commands.clear();
                slot.state = SlotState::Recording;
                self.image_index = Some(image_index);
                self.acquired_suboptimal = suboptimal;
                Ok(Some(image_index))
            }
        }
    }

    /// The current slot's command list, only while recording.
    ///
    /// # Errors
    ///
    /// [`PrismError::SlotState`] outside the recording state.
    pub fn commands_mut(&mut self) -> Result<&mut CommandList, PrismError> {
        self.expect_state("record", SlotState::Recording)?;
        Ok(&mut self.slots[self.current].commands)
    }

    /// Submit the recorded commands: wait on image-acquired, signal the
    /// acquired image's render-finished semaphore and the slot fence.
    ///
    /// # Errors
    ///
    /// [`PrismError::SlotState`] unless recording, or a fatal device
    /// failure.
    pub fn submit<D: GpuDevice>(
        &mut self,
        device: &mut D,
    ) -> Result<(), PrismError> {
        self.expect_state("submit", SlotState::Recording)?;
        let render_finished = self.render_finished_for_current()?;
        let slot = &mut self.slots[self.current];
        device.reset_fence(slot.fence)?;
        device.submit(&SubmitInfo {
            commands: &slot.commands,
            wait: &[slot.image_available],
            signal: &[render_finished],
            fence: Some(slot.fence),
        })?;
        slot.state = SlotState::Submitted;
        Ok(())
    }

    /// Present the acquired image once its render-finished semaphore
    /// signals, then advance to the next slot.
    ///
    /// A suboptimal acquire is reported as a suboptimal present.
    ///
    /// # Errors
    ///
    /// [`PrismError::SlotState`] unless submitted, or a fatal device
    /// failure.
    pub fn present<D: GpuDevice>(
        &mut self,
        device: &mut D,
    ) -> Result<PresentOutcome, PrismError> {
        self.expect_state("present", SlotState::Submitted)?;
        let render_finished = self.render_finished_for_current()?;
        let image_index = self.image_index.take().ok_or(PrismError::SlotState {
            operation: "present",
            state: SlotState::Submitted,
        })?;
        self.slots[self.current].state = SlotState::Presenting;
        let outcome = device.present(image_index, render_finished)?;
        self.slots[self.current].state = SlotState::Idle;
        self.current = (self.current + 1) % self.slots.len();
        self.frame_counter += 1;

        let outcome = match outcome {
            PresentOutcome::Presented if self.acquired_suboptimal => {
                PresentOutcome::Suboptimal
            }
            other => other,
        };
        self.acquired_suboptimal = false;
        if outcome.needs_resize() {
            log::warn!("surface {outcome:?} at present");
        }
        Ok(outcome)
    }

    /// Replace the render-finished semaphores after the surface was
    /// reconfigured. The queue must be idle.
    ///
    /// # Errors
    ///
    /// Semaphore creation failure.
    pub fn recreate_render_finished<D: GpuDevice>(
        &mut self,
        device: &mut D,
        surface_images: usize,
    ) -> Result<(), PrismError> {
        for semaphore in self.render_finished.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        for _ in 0..surface_images {
            self.render_finished.push(device.create_semaphore()?);
        }
        Ok(())
    }

    /// Release every fence and semaphore. The queue must be idle.
    pub fn destroy<D: GpuDevice>(self, device: &mut D) {
        for semaphore in self.render_finished.into_iter().rev() {
            device.destroy_semaphore(semaphore);
        }
        for slot in self.slots.into_iter().rev() {
            device.destroy_semaphore(slot.image_available);
            device.destroy_fence(slot.fence);
        }
    }

    fn render_finished_for_current(&self) -> Result<SemaphoreId, PrismError> {
        let state = self.slots[self.current].state;
        self.image_index
            .and_then(|index| self.render_finished.get(index as usize))
            .copied()
            .ok_or(PrismError::SlotState {
                operation: "signal render finished",
                state,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Extent2d, HeadlessDevice, ImageLayout};

    fn configured() -> (HeadlessDevice, Vec<crate::gpu::ImageId>) {
        let mut device = HeadlessDevice::new();
        let info = device.configure_surface(Extent2d::new(800, 600)).unwrap();
        (device, info.images)
    }

    fn run_frame(
        manager: &mut FrameSlotManager,
        device: &mut HeadlessDevice,
        images: &[crate::gpu::ImageId],
    ) -> PresentOutcome {
        manager.begin_frame(device).unwrap();
        let index = manager.acquire_target(device).unwrap().unwrap();
        manager.commands_mut().unwrap().image_barrier(
            images[index as usize],
            ImageLayout::Undefined,
            ImageLayout::PresentSrc,
        );
        manager.submit(device).unwrap();
        manager.present(device).unwrap()
    }

    #[test]
    fn slots_cycle_through_the_ring() {
        let (mut device, images) = configured();
        let mut manager = FrameSlotManager::new(&mut device, images.len()).unwrap();
        let fences: Vec<FenceId> =
            manager.slots().iter().map(FrameSlot::fence).collect();
        for frame in 0..5 {
            assert_eq!(manager.slot_index(), frame % FRAMES_IN_FLIGHT);
            assert_eq!(
                run_frame(&mut manager, &mut device, &images),
                PresentOutcome::Presented
            );
        }
        assert_eq!(manager.frame_counter(), 5);
        assert_eq!(device.stats().fence_waits[&fences[0]], 3);
        assert_eq!(device.stats().fence_waits[&fences[1]], 2);
        // At most one submission per slot is outstanding.
        assert!(device.pending_submissions() <= FRAMES_IN_FLIGHT);
        assert!(device.validation_errors().is_empty());

        device.wait_idle().unwrap();
        manager.destroy(&mut device);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn out_of_date_acquire_leaves_the_slot_reusable() {
        let (mut device, images) = configured();
        let mut manager = FrameSlotManager::new(&mut device, images.len()).unwrap();
        device.inject_out_of_date_acquires(1);

        manager.begin_frame(&mut device).unwrap();
        assert_eq!(manager.acquire_target(&mut device).unwrap(), None);
        assert_eq!(manager.current().state(), SlotState::Idle);
        assert!(manager.current().commands().is_empty());
        assert!(device.fence_signaled(manager.current().fence()).unwrap());
        assert_eq!(manager.slot_index(), 0);

        assert_eq!(
            run_frame(&mut manager, &mut device, &images),
            PresentOutcome::Presented
        );
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let (mut device, images) = configured();
        let mut manager = FrameSlotManager::new(&mut device, images.len()).unwrap();
        assert!(matches!(
            manager.commands_mut(),
            Err(PrismError::SlotState {
                state: SlotState::Idle,
                ..
            })
        ));
        assert!(matches!(
            manager.submit(&mut device),
            Err(PrismError::SlotState { .. })
        ));
        manager.begin_frame(&mut device).unwrap();
        assert!(matches!(
            manager.begin_frame(&mut device),
            Err(PrismError::SlotState {
                state: SlotState::Acquiring,
                ..
            })
        ));
    }

    #[test]
    fn suboptimal_present_is_reported() {
        let (mut device, images) = configured();
        let mut manager = FrameSlotManager::new(&mut device, images.len()).unwrap();
        device.inject_suboptimal_presents(1);
        let outcome = run_frame(&mut manager, &mut device, &images);
        assert_eq!(outcome, PresentOutcome::Suboptimal);
        assert!(outcome.needs_resize());
    }
}
