//! Queue between the model-receive task and the playback task of a voice session.

use bytes::Bytes;
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};
use tokio::sync::Notify;

/// What the playback task should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackFrame {
    Audio(Bytes),
    /// The model finished the turn and all its audio has been handed out.
    TurnComplete,
    /// Unplayed audio of the current turn was discarded.
    Interrupted,
}

#[derive(Default)]
struct Inner {
    frames: VecDeque<PlaybackFrame>,
    /// Audio of the current turn was pushed since the last turn boundary.
    turn_open: bool,
    /// The client stopped the current turn; its remaining audio is dropped
    /// until the model ends the turn.
    discarding: bool,
}

impl Inner {
    /// Empties the queue, returning the number of audio frames dropped and
    /// whether a turn was open.
    fn drain(&mut self) -> (usize, bool) {
        let cleared = self
            .frames
            .iter()
            .filter(|f| matches!(f, PlaybackFrame::Audio(_)))
            .count();
        self.frames.clear();
        let was_open = self.turn_open;
        if was_open || cleared > 0 {
            self.turn_open = false;
            self.frames.push_back(PlaybackFrame::Interrupted);
        }
        (cleared, was_open)
    }
}

#[derive(Default)]
pub struct PlaybackQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues model audio. Dropped while a stopped turn is still arriving.
    pub fn push_audio(&self, pcm: Bytes) {
        {
            let mut inner = self.lock();
            if inner.discarding {
                return;
            }
            inner.turn_open = true;
            inner.frames.push_back(PlaybackFrame::Audio(pcm));
        }
        self.notify.notify_one();
    }

    /// Marks the end of the model's turn. Ignored when the turn produced no
    /// audio or was already interrupted.
    pub fn finish_turn(&self) {
        {
            let mut inner = self.lock();
            if inner.discarding {
                inner.discarding = false;
                return;
            }
            if !inner.turn_open {
                return;
            }
            inner.turn_open = false;
            inner.frames.push_back(PlaybackFrame::TurnComplete);
        }
        self.notify.notify_one();
    }

    /// Client-requested stop. Discards every queued audio frame and returns
    /// how many were dropped.
    ///
    /// If a turn was in progress the playback task is told it was
    /// interrupted, and audio the model still sends for that turn is dropped
    /// until its turn boundary.
    pub fn stop(&self) -> usize {
        let cleared = {
            let mut inner = self.lock();
            let (cleared, was_open) = inner.drain();
            inner.discarding = was_open;
            cleared
        };
        self.notify.notify_one();
        cleared
    }

    /// Model-side barge-in. The model has already abandoned the turn, so
    /// whatever it sends next belongs to a new one.
    pub fn interrupt(&self) -> usize {
        let cleared = {
            let mut inner = self.lock();
            inner.discarding = false;
            inner.drain().0
        };
        self.notify.notify_one();
        cleared
    }

    /// Waits until a frame is queued.
    pub async fn ready(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.lock().frames.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Takes the next frame in production order, if any.
    pub fn try_next(&self) -> Option<PlaybackFrame> {
        self.lock().frames.pop_front()
    }

    /// Number of audio frames waiting to be played.
    pub fn len(&self) -> usize {
        self.lock()
            .frames
            .iter()
            .filter(|f| matches!(f, PlaybackFrame::Audio(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    fn pcm(n: u8) -> Bytes {
        Bytes::from(vec![n, n])
    }

    async fn next(queue: &PlaybackQueue) -> PlaybackFrame {
        loop {
            queue.ready().await;
            if let Some(frame) = queue.try_next() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_frames_come_out_in_order() {
        let queue = PlaybackQueue::new();
        queue.push_audio(pcm(1));
        queue.push_audio(pcm(2));
        queue.finish_turn();

        assert_eq!(next(&queue).await, PlaybackFrame::Audio(pcm(1)));
        assert_eq!(next(&queue).await, PlaybackFrame::Audio(pcm(2)));
        assert_eq!(next(&queue).await, PlaybackFrame::TurnComplete);
        assert!(queue.is_empty());
        assert_eq!(queue.try_next(), None);
    }

    #[tokio::test]
    async fn test_stop_discards_rest_of_turn() {
        let queue = PlaybackQueue::new();
        for i in 0..5 {
            queue.push_audio(pcm(i));
        }
        assert_eq!(queue.len(), 5);

        assert_eq!(queue.stop(), 5);
        assert_eq!(queue.len(), 0);
        assert_eq!(next(&queue).await, PlaybackFrame::Interrupted);

        // the model is still finishing the stopped turn
        queue.push_audio(pcm(8));
        queue.push_audio(pcm(9));
        assert!(queue.is_empty());
        queue.finish_turn();
        assert_eq!(queue.try_next(), None);

        queue.push_audio(pcm(10));
        queue.finish_turn();
        assert_eq!(next(&queue).await, PlaybackFrame::Audio(pcm(10)));
        assert_eq!(next(&queue).await, PlaybackFrame::TurnComplete);
    }

    #[tokio::test]
    async fn test_stop_after_turn_complete_keeps_next_turn() {
        let queue = PlaybackQueue::new();
        queue.push_audio(pcm(1));
        queue.finish_turn();

        assert_eq!(queue.stop(), 1);
        assert_eq!(next(&queue).await, PlaybackFrame::Interrupted);

        queue.push_audio(pcm(2));
        assert_eq!(next(&queue).await, PlaybackFrame::Audio(pcm(2)));
    }

    #[tokio::test]
    async fn test_stop_without_audio_is_quiet() {
        let queue = PlaybackQueue::new();
        assert_eq!(queue.stop(), 0);
        assert_eq!(queue.try_next(), None);
        queue.finish_turn();
        queue.push_audio(pcm(1));
        assert_eq!(next(&queue).await, PlaybackFrame::Audio(pcm(1)));
    }

    #[tokio::test]
    async fn test_model_interrupt_does_not_discard() {
        let queue = PlaybackQueue::new();
        queue.push_audio(pcm(1));
        assert_eq!(queue.interrupt(), 1);
        assert_eq!(next(&queue).await, PlaybackFrame::Interrupted);

        queue.push_audio(pcm(2));
        assert_eq!(next(&queue).await, PlaybackFrame::Audio(pcm(2)));
    }

    #[tokio::test]
    async fn test_model_interrupt_ends_client_discard() {
        let queue = PlaybackQueue::new();
        queue.push_audio(pcm(1));
        queue.stop();
        assert_eq!(next(&queue).await, PlaybackFrame::Interrupted);

        assert_eq!(queue.interrupt(), 0);
        queue.push_audio(pcm(2));
        assert_eq!(next(&queue).await, PlaybackFrame::Audio(pcm(2)));
    }

    #[tokio::test]
    async fn test_ready_wakes_on_push() {
        let queue = Arc::new(PlaybackQueue::new());
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { next(&queue).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push_audio(pcm(7));
        let frame = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, PlaybackFrame::Audio(pcm(7)));
    }
}
