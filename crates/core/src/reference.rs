//! Far-end reference delay buffer shared between playback and capture threads.
//!
//! The playback thread writes every chunk it is about to render; the capture
//! thread reads as many samples as each microphone chunk holds. One mutex
//! serializes both sides, so FIFO order is preserved across threads.

use crate::resample::ReferenceResampler;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bounded FIFO of capture-rate reference samples.
///
/// Writing past the bound evicts the oldest samples; reading past the end
/// zero-fills. Neither side ever blocks on the other beyond the lock.
pub struct ReferenceDelayBuffer {
    inner: Mutex<HeapRb<i16>>,
    capacity: usize,
}

impl ReferenceDelayBuffer {
    /// Creates a buffer holding at most `max_delay_samples` samples.
    pub fn new(max_delay_samples: usize) -> Self {
        let capacity = max_delay_samples.max(1);
        Self {
            inner: Mutex::new(HeapRb::<i16>::new(capacity)),
            capacity,
        }
    }

    // A panic on the other thread must not take this one down with it.
    fn lock(&self) -> MutexGuard<'_, HeapRb<i16>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends samples, evicting the oldest ones beyond the bound.
    pub fn write(&self, samples: &[i16]) {
        let mut rb = self.lock();
        for &s in samples {
            rb.push_overwrite(s);
        }
    }

    /// Removes and returns the oldest `n` samples, zero-filled on underrun.
    pub fn read(&self, n: usize) -> Vec<i16> {
        let mut out = vec![0i16; n];
        self.read_into(&mut out);
        out
    }

    /// Fills `out` with the oldest samples and zeroes whatever is left.
    /// Returns how many real samples were read.
    pub fn read_into(&self, out: &mut [i16]) -> usize {
        let got = self.lock().pop_slice(out);
        out[got..].fill(0);
        got
    }

    /// Keeps only the newest `n` samples.
    pub fn retain_latest(&self, n: usize) {
        let mut rb = self.lock();
        let excess = rb.occupied_len().saturating_sub(n);
        rb.skip(excess);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Playback-thread handle: resamples played audio and feeds the delay buffer.
pub struct PlaybackTap {
    buffer: Arc<ReferenceDelayBuffer>,
    resampler: ReferenceResampler,
    residual_keep: usize,
}

impl PlaybackTap {
    pub fn new(
        buffer: Arc<ReferenceDelayBuffer>,
        resampler: ReferenceResampler,
        residual_keep: usize,
    ) -> Self {
        Self {
            buffer,
            resampler,
            residual_keep,
        }
    }

    /// Records a chunk at the playback rate. Call before handing it to the device.
    pub fn notify_played(&mut self, chunk: &[i16]) {
        let resampled = self.resampler.process(chunk);
        self.buffer.write(&resampled);
    }

    /// Trims the reference to its residual tail once a response finished playing,
    /// so stale far-end audio does not pair with later captures.
    pub fn playback_finished(&self) {
        self.buffer.retain_latest(self.residual_keep);
    }

    pub fn buffer(&self) -> &Arc<ReferenceDelayBuffer> {
        &self.buffer
    }
}
