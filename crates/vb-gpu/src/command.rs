//! Command buffer management and the immediate submitter.

use std::cell::Cell;
use std::marker::PhantomData;

use ash::vk;

use crate::error::Result;
use crate::rollback::Rollback;
use crate::sync::{create_fence, reset_fence, wait_for_fence};

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffer(
        &self,
        device: &ash::Device,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let mut buffers = unsafe { self.allocate_command_buffers(device, level, 1)? };
        Ok(buffers.remove(0))
    }

    /// Allocate multiple command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(count);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers)
    }

    /// Destroy the command pool, freeing its command buffers.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    unsafe { device.queue_submit(queue, &[submit_info], fence)? };
    Ok(())
}

/// Dedicated command buffer and fence for blocking one-shot work.
///
/// Every [`submit`](Self::submit) records, submits and waits before it
/// returns, so uploads and transitions issued through it are serialized.
/// The type is `!Sync`: a single thread owns it.
pub struct ImmediateSubmitter {
    pool: CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    queue: vk::Queue,
    _single_thread: PhantomData<Cell<()>>,
}

impl ImmediateSubmitter {
    /// Create a submitter targeting `queue` from `queue_family`.
    ///
    /// The pool is destroyed again if the buffer or fence cannot be created.
    ///
    /// # Safety
    /// The device must be valid and `queue` must belong to `queue_family`.
    pub unsafe fn new(device: &ash::Device, queue_family: u32, queue: vk::Queue) -> Result<Self> {
        let pool = unsafe {
            CommandPool::new(
                device,
                queue_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        let pool_handle = pool.handle();
        let mut rollback = Rollback::new();
        rollback.push(move || unsafe { device.destroy_command_pool(pool_handle, None) });

        let command_buffer =
            unsafe { pool.allocate_command_buffer(device, vk::CommandBufferLevel::PRIMARY)? };
        let fence = unsafe { create_fence(device, false)? };

        rollback.commit();
        Ok(Self {
            pool,
            command_buffer,
            fence,
            queue,
            _single_thread: PhantomData,
        })
    }

    /// Record `record` into the dedicated buffer, submit it and block until
    /// the GPU has finished it.
    ///
    /// # Safety
    /// The device must be the one this submitter was created with, and the
    /// recorded commands must only reference live objects.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn submit<F>(&self, device: &ash::Device, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        // SAFETY: the previous submit waited on the fence, so the buffer is idle.
        unsafe {
            reset_fence(device, self.fence)?;
            device.reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;

            begin_command_buffer(
                device,
                self.command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
        }
        record(self.command_buffer);
        unsafe {
            end_command_buffer(device, self.command_buffer)?;

            submit_command_buffers(
                device,
                self.queue,
                &[self.command_buffer],
                &[],
                &[],
                &[],
                self.fence,
            )?;
            wait_for_fence(device, self.fence, u64::MAX)
        }
    }

    /// Queue this submitter targets.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Destroy the fence and the command pool.
    ///
    /// # Safety
    /// No submission may be pending.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.fence, None);
            self.pool.destroy(device);
        }
    }
}
