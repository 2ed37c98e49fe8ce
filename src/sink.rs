//! Display sinks.
//!
//! The acquisition worker calls `present` once per paced frame and moves on;
//! a sink must return without waiting for the image to be shown. What
//! happens when the presentation side falls behind is up to the sink:
//!
//! - `ChannelSink`: bounded queue, new images are dropped (and counted) when full.
//! - `LatestSink`: single slot, a new image replaces an unconsumed one.
//! - closures: called inline on the worker, so they must be quick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::frame::ColorTaggedImage;

pub trait DisplaySink: Send + Sync {
    /// Hand over a ready-to-render image. Must not block.
    fn present(&self, image: ColorTaggedImage);
}

impl<F> DisplaySink for F
where
    F: Fn(ColorTaggedImage) + Send + Sync,
{
    fn present(&self, image: ColorTaggedImage) {
        self(image)
    }
}

// ----------------------------------------------------------------------------
// ChannelSink
// ----------------------------------------------------------------------------

/// Bounded queue towards a presentation thread.
pub struct ChannelSink {
    tx: SyncSender<ColorTaggedImage>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Returns the sink and the receiving end for the presentation context.
    pub fn new(queue_depth: usize) -> (Self, Receiver<ColorTaggedImage>) {
        let (tx, rx) = mpsc::sync_channel(queue_depth.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Images discarded because the queue was full or the receiver was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl DisplaySink for ChannelSink {
    fn present(&self, image: ColorTaggedImage) {
        match self.tx.try_send(image) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!("display queue full; {} images dropped so far", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// LatestSink
// ----------------------------------------------------------------------------

/// Keeps only the newest image. Readers take it when they are ready.
#[derive(Default)]
pub struct LatestSink {
    slot: Mutex<Option<ColorTaggedImage>>,
    ready: Condvar,
    replaced: AtomicU64,
}

impl LatestSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the newest image, if any arrived since the last take.
    pub fn take(&self) -> Option<ColorTaggedImage> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Wait up to `timeout` for an image.
    pub fn take_timeout(&self, timeout: Duration) -> Option<ColorTaggedImage> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut slot = match self.ready.wait_timeout_while(slot, timeout, |slot| slot.is_none()) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
        slot.take()
    }

    /// Images overwritten before anyone took them.
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

impl DisplaySink for LatestSink {
    fn present(&self, image: ColorTaggedImage) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.replace(image).is_some() {
            self.replaced.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ColorSpace;
    use anyhow::Result;
    use std::sync::Arc;

    fn image(value: u8) -> Result<ColorTaggedImage> {
        Ok(ColorTaggedImage::new(vec![value], ColorSpace::Gray, 1, 1)?)
    }

    #[test]
    fn channel_sink_drops_newest_when_full() -> Result<()> {
        let (sink, rx) = ChannelSink::new(2);
        for value in 0..5 {
            sink.present(image(value)?);
        }
        assert_eq!(sink.dropped(), 3);

        let received: Vec<u8> = rx.try_iter().map(|img| img.as_bytes()[0]).collect();
        assert_eq!(received, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn channel_sink_survives_closed_receiver() -> Result<()> {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        sink.present(image(1)?);
        assert_eq!(sink.dropped(), 1);
        Ok(())
    }

    #[test]
    fn latest_sink_keeps_newest() -> Result<()> {
        let sink = LatestSink::new();
        assert!(sink.take().is_none());

        sink.present(image(1)?);
        sink.present(image(2)?);
        assert_eq!(sink.replaced(), 1);
        assert_eq!(sink.take().map(|img| img.as_bytes()[0]), Some(2));
        assert!(sink.take_timeout(Duration::from_millis(5)).is_none());
        Ok(())
    }

    #[test]
    fn closures_are_sinks() -> Result<()> {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let sink = move |_image: ColorTaggedImage| {
            counter.fetch_add(1, Ordering::Relaxed);
        };
        sink.present(image(0)?);
        sink.present(image(0)?);
        assert_eq!(seen.load(Ordering::Relaxed), 2);
        Ok(())
    }
}
