//! Single-slot store of the most recent decoded image

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::capture::convert::DecodedImage;

/// Latest converted frame of one worker.
///
/// The worker publishes, any number of consumers read copies. The lock is
/// only held to move an image in or clone it out.
#[derive(Debug, Default)]
pub struct LatestImageCache {
    slot: Mutex<Option<DecodedImage>>,
    published: Condvar,
}

impl LatestImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<DecodedImage>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the stored image. Images not newer than the current one are
    /// refused, so a late publish can never roll the slot back.
    pub fn publish(&self, image: DecodedImage) -> bool {
        let mut slot = self.lock();
        if matches!(&*slot, Some(current) if current.frame_id >= image.frame_id) {
            return false;
        }
        *slot = Some(image);
        drop(slot);
        self.published.notify_all();
        true
    }

    /// Copy of the latest image, `None` until the first publish.
    pub fn read(&self) -> Option<DecodedImage> {
        self.lock().clone()
    }

    pub fn latest_frame_id(&self) -> Option<u64> {
        self.lock().as_ref().map(|image| image.frame_id)
    }

    /// Blocks until an image newer than `after` is available or `timeout`
    /// elapses. `after = None` waits for the first image.
    pub fn wait_newer(&self, after: Option<u64>, timeout: Duration) -> Option<DecodedImage> {
        let deadline = Instant::now() + timeout;
        let is_newer = |slot: &Option<DecodedImage>| match (slot, after) {
            (Some(image), Some(after)) => image.frame_id > after,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let mut slot = self.lock();
        while !is_newer(&slot) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .published
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        slot.clone()
    }
}
