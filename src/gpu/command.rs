//! Recorded GPU work.
//!
//! A [`CommandList`] is an ordered list of [`Command`] values that a
//! backend replays at submit time. Recording is pure CPU work; nothing
//! touches the device until the list is handed to
//! [`GpuDevice::submit`](super::GpuDevice::submit).

use super::types::{
    AccelerationStructureId, BindingTableId, BufferId, Extent2d, Filter,
    ImageId, ImageLayout, PipelineId,
};

/// A color attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTarget {
    /// Target image (must be in [`ImageLayout::ColorAttachment`]).
    pub image: ImageId,
    /// Clear value, or `None` to load existing contents.
    pub clear: Option<[f32; 4]>,
}

/// The depth attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTarget {
    /// Target image (must be in [`ImageLayout::DepthAttachment`]).
    pub image: ImageId,
    /// Clear depth, or `None` to load existing contents.
    pub clear: Option<f32>,
}

/// One strided region of a shader binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StridedRegion {
    /// Byte offset of the region inside the table buffer.
    pub offset: u64,
    /// Bytes between consecutive records.
    pub stride: u64,
    /// Region size in bytes.
    pub size: u64,
}

/// The three shader-binding-table regions of a trace dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRegions {
    /// Buffer holding the shader-group handles.
    pub buffer: BufferId,
    /// Ray generation region.
    pub raygen: StridedRegion,
    /// Miss region.
    pub miss: StridedRegion,
    /// Hit-group region.
    pub hit: StridedRegion,
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Layout transition plus execution/memory dependency on one image.
    ImageBarrier {
        /// Image transitioned.
        image: ImageId,
        /// Layout the image is in ([`ImageLayout::Undefined`] discards).
        from: ImageLayout,
        /// Layout after the barrier.
        to: ImageLayout,
    },
    /// Makes every prior acceleration-structure build visible to later
    /// reads.
    AccelerationStructureBarrier,
    /// Fill an image with a constant color.
    ClearImage {
        /// Image cleared.
        image: ImageId,
        /// Clear value.
        color: [f32; 4],
    },
    /// Queue-ordered inline write into a buffer.
    UpdateBuffer {
        /// Destination.
        buffer: BufferId,
        /// Byte offset.
        offset: u64,
        /// Bytes written.
        data: Vec<u8>,
    },
    /// Buffer-to-buffer copy.
    CopyBuffer {
        /// Source.
        src: BufferId,
        /// Byte offset in the source.
        src_offset: u64,
        /// Destination.
        dst: BufferId,
        /// Byte offset in the destination.
        dst_offset: u64,
        /// Bytes copied.
        size: u64,
    },
    /// Start a single-subpass render pass.
    BeginRenderPass {
        /// Color attachments in attachment order.
        color: Vec<ColorTarget>,
        /// Optional depth attachment.
        depth: Option<DepthTarget>,
        /// Render area.
        extent: Extent2d,
    },
    /// Bind a graphics or ray tracing pipeline.
    BindPipeline(PipelineId),
    /// Bind a binding table to the bound pipeline.
    BindBindingTable(BindingTableId),
    /// Update the push-constant block.
    PushConstants {
        /// Byte offset into the block.
        offset: u32,
        /// Bytes written.
        data: Vec<u8>,
    },
    /// Indexed triangle-list draw.
    Draw {
        /// Vertex buffer.
        vertex_buffer: BufferId,
        /// `u32` index buffer.
        index_buffer: BufferId,
        /// Number of indices.
        index_count: u32,
    },
    /// Three-vertex full-screen triangle without vertex input.
    DrawFullscreen,
    /// End the current render pass.
    EndRenderPass,
    /// Build a top-level structure from the instance records in `instances`.
    BuildTopLevel {
        /// Structure written.
        tlas: AccelerationStructureId,
        /// Buffer of 64-byte instance records.
        instances: BufferId,
        /// Number of records read.
        instance_count: u32,
        /// Build working memory.
        scratch: BufferId,
    },
    /// Ray tracing dispatch over `extent`.
    TraceRays {
        /// Shader binding table regions.
        regions: TraceRegions,
        /// Launch size.
        extent: Extent2d,
    },
    /// Scaled image copy with format conversion.
    BlitImage {
        /// Source (must be in [`ImageLayout::TransferSrc`]).
        src: ImageId,
        /// Destination (must be in [`ImageLayout::TransferDst`]).
        dst: ImageId,
        /// Filtering used when scaling.
        filter: Filter,
    },
}

impl Command {
    /// Images named directly by this command.
    #[must_use]
    pub fn images(&self) -> Vec<ImageId> {
        match self {
            Self::ImageBarrier { image, .. } | Self::ClearImage { image, .. } => {
                vec![*image]
            }
            Self::BeginRenderPass { color, depth, .. } => color
                .iter()
                .map(|c| c.image)
                .chain(depth.map(|d| d.image))
                .collect(),
            Self::BlitImage { src, dst, .. } => vec![*src, *dst],
            _ => Vec::new(),
        }
    }

    /// Buffers named directly by this command.
    #[must_use]
    pub fn buffers(&self) -> Vec<BufferId> {
        match self {
            Self::UpdateBuffer { buffer, .. } => vec![*buffer],
            Self::CopyBuffer { src, dst, .. } => vec![*src, *dst],
            Self::Draw {
                vertex_buffer,
                index_buffer,
                ..
            } => vec![*vertex_buffer, *index_buffer],
            Self::BuildTopLevel {
                instances, scratch, ..
            } => vec![*instances, *scratch],
            Self::TraceRays { regions, .. } => vec![regions.buffer],
            _ => Vec::new(),
        }
    }
}

/// An ordered list of recorded commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every recorded command, keeping the allocation.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Number of recorded commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Nothing recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Recorded commands as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Command] {
        &self.commands
    }

    /// Recorded commands in submission order.
    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    /// Append an arbitrary command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Append a layout transition.
    pub fn image_barrier(
        &mut self,
        image: ImageId,
        from: ImageLayout,
        to: ImageLayout,
    ) {
        self.push(Command::ImageBarrier { image, from, to });
    }

    /// Append a queue-ordered buffer write.
    pub fn update_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        self.push(Command::UpdateBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    /// Append a push-constant update of the whole block.
    pub fn push_constants(&mut self, data: &[u8]) {
        self.push(Command::PushConstants {
            offset: 0,
            data: data.to_vec(),
        });
    }
}

impl Extend<Command> for CommandList {
    fn extend<I: IntoIterator<Item = Command>>(&mut self, iter: I) {
        self.commands.extend(iter);
    }
}

impl<'a> IntoIterator for &'a CommandList {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_keeps_list_reusable() {
        let mut list = CommandList::new();
        list.image_barrier(
            ImageId::from_raw(1),
            ImageLayout::Undefined,
            ImageLayout::General,
        );
        list.push(Command::AccelerationStructureBarrier);
        assert_eq!(list.len(), 2);
        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn commands_report_referenced_resources() {
        let pass = Command::BeginRenderPass {
            color: vec![ColorTarget {
                image: ImageId::from_raw(3),
                clear: None,
            }],
            depth: Some(DepthTarget {
                image: ImageId::from_raw(4),
                clear: Some(1.0),
            }),
            extent: Extent2d::new(8, 8),
        };
        assert_eq!(
            pass.images(),
            vec![ImageId::from_raw(3), ImageId::from_raw(4)]
        );
        let copy = Command::CopyBuffer {
            src: BufferId::from_raw(1),
            src_offset: 0,
            dst: BufferId::from_raw(2),
            dst_offset: 0,
            size: 4,
        };
        assert_eq!(copy.buffers().len(), 2);
        assert!(copy.images().is_empty());
    }
}
