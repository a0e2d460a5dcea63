//! Staging uploads into device-local buffers.
//!
//! Every upload follows the same sequence: allocate a host-visible staging
//! buffer, copy the payload into it, record the copies through the immediate
//! submitter and free the staging buffer once the submission has completed.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::GpuBuffer;

/// Offset alignment of `vkCmdCopyBuffer` regions packed into one staging buffer.
pub const COPY_ALIGNMENT: u64 = 4;

/// Placement of several payloads inside one staging buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    offsets: Vec<u64>,
    sizes: Vec<u64>,
    total: u64,
}

impl StagingLayout {
    /// Pack payloads of the given sizes back to back, each starting on a
    /// [`COPY_ALIGNMENT`] boundary.
    pub fn new(sizes: &[u64]) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut cursor = 0u64;
        for &size in sizes {
            cursor = cursor.next_multiple_of(COPY_ALIGNMENT);
            offsets.push(cursor);
            cursor += size;
        }

        Self {
            offsets,
            sizes: sizes.to_vec(),
            total: cursor,
        }
    }

    /// Offset of payload `index`.
    pub fn offset(&self, index: usize) -> u64 {
        self.offsets[index]
    }

    /// Bytes the staging buffer must hold.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// `(staging offset, size)` per payload.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.offsets.iter().copied().zip(self.sizes.iter().copied())
    }
}

/// One payload and where it lands.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget<'a> {
    pub buffer: vk::Buffer,
    pub dst_offset: u64,
    pub data: &'a [u8],
}

impl<'a> UploadTarget<'a> {
    pub fn new(buffer: &GpuBuffer, data: &'a [u8]) -> Self {
        Self {
            buffer: buffer.buffer,
            dst_offset: 0,
            data,
        }
    }
}

/// Allocate a staging buffer, fill it with `fill`, run `record` through the
/// immediate submitter and free the staging buffer whatever the outcome.
pub(crate) fn with_staging<F, R>(
    ctx: &GpuContext,
    size: u64,
    name: &str,
    fill: F,
    record: R,
) -> Result<()>
where
    F: FnOnce(&GpuBuffer) -> Result<()>,
    R: FnOnce(vk::CommandBuffer, vk::Buffer),
{
    let mut staging = ctx.allocator().create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        name,
    )?;

    let result = fill(&staging).and_then(|()| {
        let source = staging.buffer;
        ctx.submit_immediate(|cmd| record(cmd, source))
    });

    let freed = ctx.allocator().free_buffer(&mut staging);
    result.and(freed)
}

/// Upload several payloads with one staging buffer and one submission.
pub fn upload_buffers(ctx: &GpuContext, targets: &[UploadTarget<'_>]) -> Result<()> {
    if targets.is_empty() {
        return Ok(());
    }

    let sizes: Vec<u64> = targets.iter().map(|t| t.data.len() as u64).collect();
    let layout = StagingLayout::new(&sizes);
    if layout.total_size() == 0 {
        return Err(GpuError::InvalidState("Nothing to upload".to_string()));
    }

    with_staging(
        ctx,
        layout.total_size(),
        "staging",
        |staging| {
            for (target, (offset, _)) in targets.iter().zip(layout.ranges()) {
                staging.write_bytes(offset, target.data)?;
            }
            Ok(())
        },
        |cmd, source| {
            let device = ctx.device();
            for (target, (offset, size)) in targets.iter().zip(layout.ranges()) {
                if size == 0 {
                    continue;
                }
                let region = vk::BufferCopy {
                    src_offset: offset,
                    dst_offset: target.dst_offset,
                    size,
                };
                unsafe { device.cmd_copy_buffer(cmd, source, target.buffer, &[region]) };
            }
        },
    )?;

    tracing::trace!(
        payloads = targets.len(),
        bytes = layout.total_size(),
        "Buffers uploaded"
    );
    Ok(())
}

/// Upload `data` into the start of `dst`.
pub fn upload_buffer(ctx: &GpuContext, dst: &GpuBuffer, data: &[u8]) -> Result<()> {
    if data.len() as u64 > dst.size {
        return Err(GpuError::InvalidState(format!(
            "Upload of {} bytes does not fit buffer of {} bytes",
            data.len(),
            dst.size
        )));
    }
    upload_buffers(ctx, &[UploadTarget::new(dst, data)])
}

/// Create a device-local buffer holding `data`.
///
/// `TRANSFER_DST` is added to `usage`.
pub fn create_buffer_with_data(
    ctx: &GpuContext,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<GpuBuffer> {
    let mut buffer = ctx.allocator().create_buffer(
        data.len() as u64,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        name,
    )?;

    if let Err(e) = upload_buffer(ctx, &buffer, data) {
        ctx.allocator().free_buffer(&mut buffer)?;
        return Err(e);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_packed_on_copy_alignment() {
        // 3 vertices of 12 bytes, then 6 u16 indices.
        let layout = StagingLayout::new(&[36, 12]);
        assert_eq!(layout.offset(0), 0);
        assert_eq!(layout.offset(1), 36);
        assert_eq!(layout.total_size(), 48);

        let layout = StagingLayout::new(&[6, 6, 1]);
        assert_eq!(layout.ranges().collect::<Vec<_>>(), vec![(0, 6), (8, 6), (16, 1)]);
        assert_eq!(layout.total_size(), 17);
    }

    #[test]
    fn ranges_never_overlap() {
        let sizes = [5, 0, 3, 17, 1, 64];
        let layout = StagingLayout::new(&sizes);
        let ranges: Vec<_> = layout.ranges().collect();

        for pair in ranges.windows(2) {
            let (offset, size) = pair[0];
            assert!(offset + size <= pair[1].0);
            assert_eq!(pair[1].0 % COPY_ALIGNMENT, 0);
        }
        assert_eq!(layout.len(), sizes.len());
    }

    #[test]
    fn empty_layout() {
        let layout = StagingLayout::new(&[]);
        assert!(layout.is_empty());
        assert_eq!(layout.total_size(), 0);
    }
}
