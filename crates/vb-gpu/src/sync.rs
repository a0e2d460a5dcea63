//! Synchronization primitives and the frame ring.

use ash::vk;

use crate::command::CommandPool;
use crate::error::{GpuError, Result};
use crate::rollback::Rollback;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    unsafe { device.wait_for_fences(&[fence], true, timeout_ns)? };
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}

/// Consume a pending signal on `semaphore` with a submission that only waits.
///
/// An acquire that hands out an image but whose frame is skipped leaves the
/// semaphore with a signal operation nobody waits on. Draining it keeps the
/// semaphore reusable by the next acquire.
///
/// # Safety
/// All handles must be valid and `semaphore` must have a pending signal.
pub unsafe fn drain_semaphore(
    device: &ash::Device,
    queue: vk::Queue,
    semaphore: vk::Semaphore,
) -> Result<()> {
    let wait_semaphores = [semaphore];
    let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
    let submit_info = vk::SubmitInfo::default()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages);
    unsafe { device.queue_submit(queue, &[submit_info], vk::Fence::null())? };
    Ok(())
}

/// Ring slot used for the frame numbered `frame_counter`.
pub fn slot_for_frame(frame_counter: u64, ring_size: usize) -> usize {
    debug_assert!(ring_size > 0, "frame ring must not be empty");
    (frame_counter % ring_size as u64) as usize
}

/// Per-frame resources: one command buffer, two semaphores and the fence that
/// gates reuse of all three.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    /// Signaled by image acquisition.
    pub image_available: vk::Semaphore,
    /// Signaled by the frame's submission, waited on by present.
    pub render_finished: vk::Semaphore,
    /// Signaled when the frame's submission completes. Created signaled.
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    unsafe fn new(device: &ash::Device, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let mut rollback = Rollback::new();

        let image_available = unsafe { create_semaphore(device)? };
        rollback.push(move || unsafe { device.destroy_semaphore(image_available, None) });
        let render_finished = unsafe { create_semaphore(device)? };
        rollback.push(move || unsafe { device.destroy_semaphore(render_finished, None) });
        let in_flight = unsafe { create_fence(device, true)? };

        rollback.commit();
        Ok(Self {
            command_buffer,
            image_available,
            render_finished,
            in_flight,
        })
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

/// Fixed-size ring of frame slots sharing one command pool.
pub struct FrameRing {
    pool: CommandPool,
    slots: Vec<FrameSlot>,
}

impl FrameRing {
    /// Create `size` slots whose command buffers come from `queue_family`.
    ///
    /// On failure every slot created so far and the pool are destroyed.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, queue_family: u32, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(GpuError::InvalidState(
                "Frame ring needs at least one slot".to_string(),
            ));
        }

        let pool = unsafe {
            CommandPool::new(
                device,
                queue_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        let pool_handle = pool.handle();
        let mut rollback = Rollback::new();
        // Destroying the pool frees its command buffers too.
        rollback.push(move || unsafe { device.destroy_command_pool(pool_handle, None) });

        let command_buffers = unsafe {
            pool.allocate_command_buffers(device, vk::CommandBufferLevel::PRIMARY, size as u32)?
        };

        let mut slots = Vec::with_capacity(size);
        for command_buffer in command_buffers {
            let slot = unsafe { FrameSlot::new(device, command_buffer)? };
            rollback.push(move || unsafe { slot.destroy(device) });
            slots.push(slot);
        }

        rollback.commit();
        tracing::debug!(size, "Frame ring created");
        Ok(Self { pool, slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot at `index`.
    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Destroy all slots and the command pool.
    ///
    /// # Safety
    /// No slot may still be in use by the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in self.slots.drain(..) {
            unsafe { slot.destroy(device) };
        }
        unsafe { self.pool.destroy(device) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cycle_through_slots() {
        let slots: Vec<_> = (0..7).map(|frame| slot_for_frame(frame, 3)).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn counter_wraps_by_modulo() {
        assert_eq!(slot_for_frame(u64::MAX, 2), 1);
        assert_eq!(slot_for_frame(u64::MAX, 3), 0);
    }
}
