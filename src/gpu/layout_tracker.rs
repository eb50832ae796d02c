use rustc_hash::FxHashMap;

use super::command::CommandList;
use super::types::{ImageId, ImageLayout};

/// Record-time view of every image's layout.
///
/// Passes ask for the layout they need and the tracker emits a barrier only
/// when the image is in a different one. Lists must be submitted in the
/// order they were recorded for the view to stay correct.
#[derive(Debug, Default)]
pub struct LayoutTracker {
    layouts: FxHashMap<ImageId, ImageLayout>,
}

impl LayoutTracker {
    /// Tracker that knows no images.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout recorded for `image` (undefined if never seen).
    #[must_use]
    pub fn layout(&self, image: ImageId) -> ImageLayout {
        self.layouts.get(&image).copied().unwrap_or_default()
    }

    /// Record a barrier into `to` unless the image is already there.
    /// Returns whether a barrier was emitted.
    pub fn transition(
        &mut self,
        commands: &mut CommandList,
        image: ImageId,
        to: ImageLayout,
    ) -> bool {
        let from = self.layout(image);
        if from == to {
            return false;
        }
        commands.image_barrier(image, from, to);
        let _ = self.layouts.insert(image, to);
        true
    }

    /// Record a barrier that discards the current contents.
    pub fn discard(
        &mut self,
        commands: &mut CommandList,
        image: ImageId,
        to: ImageLayout,
    ) {
        commands.image_barrier(image, ImageLayout::Undefined, to);
        let _ = self.layouts.insert(image, to);
    }

    /// Stop tracking a destroyed image.
    pub fn forget(&mut self, image: ImageId) {
        let _ = self.layouts.remove(&image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Command;

    #[test]
    fn barriers_only_on_change() {
        let image = ImageId::from_raw(5);
        let mut tracker = LayoutTracker::new();
        let mut commands = CommandList::new();
        assert!(tracker.transition(&mut commands, image, ImageLayout::General));
        assert!(!tracker.transition(&mut commands, image, ImageLayout::General));
        assert!(tracker.transition(
            &mut commands,
            image,
            ImageLayout::TransferSrc
        ));
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands.iter().nth(1),
            Some(&Command::ImageBarrier {
                image,
                from: ImageLayout::General,
                to: ImageLayout::TransferSrc,
            })
        );
    }

    #[test]
    fn forgotten_images_start_undefined() {
        let image = ImageId::from_raw(1);
        let mut tracker = LayoutTracker::new();
        let mut commands = CommandList::new();
        tracker.discard(&mut commands, image, ImageLayout::TransferDst);
        assert_eq!(tracker.layout(image), ImageLayout::TransferDst);
        tracker.forget(image);
        assert_eq!(tracker.layout(image), ImageLayout::Undefined);
    }
}
