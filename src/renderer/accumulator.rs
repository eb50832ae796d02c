//! Temporal accumulation: snapshot the trace output into the previous-frame
//! image after every trace.

use crate::gpu::{
    Command, CommandList, Filter, ImageId, ImageLayout, LayoutTracker,
};

/// Counts blended frames and records the current → previous copy.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    frames: u32,
}

impl FrameAccumulator {
    /// Accumulator with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames blended into the previous image since the last reset.
    #[must_use]
    pub const fn frames(&self) -> u32 {
        self.frames
    }

    /// Drop the history (camera moved, resize, scene change).
    pub fn reset(&mut self) {
        if self.frames > 0 {
            log::debug!("accumulation reset after {} frames", self.frames);
        }
        self.frames = 0;
    }

    /// Record the copy. `previous` ends in its steady shader-readable
    /// layout.
    pub fn record(
        &mut self,
        commands: &mut CommandList,
        tracker: &mut LayoutTracker,
        current: ImageId,
        previous: ImageId,
    ) {
        let _ = tracker.transition(commands, current, ImageLayout::TransferSrc);
        let _ = tracker.transition(commands, previous, ImageLayout::TransferDst);
        commands.push(Command::BlitImage {
            src: current,
            dst: previous,
            filter: Filter::Nearest,
        });
        let _ = tracker.transition(commands, previous, ImageLayout::ShaderReadOnly);
        self.frames = self.frames.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_is_bracketed_by_transitions() {
        let (current, previous) = (ImageId::from_raw(1), ImageId::from_raw(2));
        let mut tracker = LayoutTracker::new();
        let mut setup = CommandList::new();
        tracker.discard(&mut setup, current, ImageLayout::General);
        tracker.discard(&mut setup, previous, ImageLayout::ShaderReadOnly);

        let mut accumulator = FrameAccumulator::new();
        let mut commands = CommandList::new();
        accumulator.record(&mut commands, &mut tracker, current, previous);
        let recorded: Vec<&Command> = commands.iter().collect();
        assert_eq!(recorded.len(), 4);
        assert!(matches!(
            recorded[2],
            Command::BlitImage { src, dst, .. } if *src == current && *dst == previous
        ));
        assert_eq!(tracker.layout(previous), ImageLayout::ShaderReadOnly);
        assert_eq!(tracker.layout(current), ImageLayout::TransferSrc);
        assert_eq!(accumulator.frames(), 1);
        accumulator.reset();
        assert_eq!(accumulator.frames(), 0);
    }
}
