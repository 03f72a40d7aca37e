//! Playback stage
//!
//! A single loop pops clips in arrival order and hands each one to the
//! output device on the blocking pool, waiting for it to finish before the
//! next one starts.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::{BoundedQueue, QueueClosed};
use super::types::AudioClip;
use crate::voice::AudioOutput;

/// Bounded clip queue in front of one audio output
pub struct PlaybackSink {
    queue: Arc<BoundedQueue<AudioClip>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSink {
    /// Create a stopped sink holding at most `capacity` queued clips
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(BoundedQueue::new(capacity)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the playback loop on `output`
    ///
    /// Does nothing if the loop is already running. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, output: Box<dyn AudioOutput>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        *task = Some(tokio::spawn(play_loop(
            Arc::clone(&self.queue),
            output,
            self.cancel.clone(),
        )));
        tracing::debug!(capacity = self.queue.capacity(), "playback sink started");
    }

    /// Queue a clip, waiting while the queue is full
    ///
    /// # Errors
    ///
    /// Hands the clip back if the sink has been stopped
    pub async fn enqueue(&self, clip: AudioClip) -> Result<(), QueueClosed<AudioClip>> {
        tracing::trace!(sequence = clip.sequence, bytes = clip.data.len(), "clip queued");
        self.queue.push(clip).await
    }

    /// Drop every queued clip; the clip currently sounding plays to the end
    pub fn clear(&self) -> usize {
        let dropped = self.queue.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "playback queue cleared");
        }
        dropped
    }

    /// Stop the loop and release the output device
    ///
    /// Waits for the clip currently sounding. Calling it again is harmless;
    /// a stopped sink cannot be restarted.
    pub async fn stop(&self) {
        self.queue.close();
        self.cancel.cancel();

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "playback loop ended abnormally");
            }
            tracing::debug!("playback sink stopped");
        }
    }

    /// Whether a clip is sounding or waiting to
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.queue.is_idle()
    }

    /// Number of clips waiting behind the current one
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

async fn play_loop(
    queue: Arc<BoundedQueue<AudioClip>>,
    mut output: Box<dyn AudioOutput>,
    cancel: CancellationToken,
) {
    loop {
        let clip = tokio::select! {
            () = cancel.cancelled() => break,
            clip = queue.pop() => match clip {
                Some(clip) => clip,
                None => break,
            },
        };

        let sequence = clip.sequence;
        tracing::debug!(sequence, bytes = clip.data.len(), "playing clip");

        let joined = tokio::task::spawn_blocking(move || {
            let result = output.play(&clip.data);
            (output, result)
        })
        .await;
        queue.done();

        match joined {
            Ok((returned, result)) => {
                output = returned;
                if let Err(e) = result {
                    tracing::warn!(sequence, error = %e, "clip playback failed, skipping");
                }
            }
            Err(e) => {
                tracing::error!(sequence, error = %e, "playback thread failed, stopping sink");
                return;
            }
        }
    }

    drop(output);
    tracing::debug!("audio output released");
}
