//! Block reframer bridging variable-size capture chunks to fixed processing hops.
//!
//! Microphone and reference samples are accumulated in paired ring buffers.
//! Whenever a full hop (`block_shift` samples) is available on both channels,
//! the two sliding windows of `block_len` samples move left by one hop and the
//! new samples are appended at the end.

use anyhow::{bail, Result};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// One aligned processing step handed out by [`BlockReframer::push`].
///
/// Samples are on the i16 scale (not normalised).
#[derive(Debug, Clone, Copy)]
pub struct BlockPair<'a> {
    /// The newest `block_shift` microphone samples
    pub mic_hop: &'a [f32],
    /// The newest `block_shift` reference samples
    pub ref_hop: &'a [f32],
    /// The full microphone window, oldest first, ending with `mic_hop`
    pub mic_window: &'a [f32],
    /// The full reference window, oldest first, ending with `ref_hop`
    pub ref_window: &'a [f32],
}

pub struct BlockReframer {
    block_len: usize,
    block_shift: usize,
    mic_pending: HeapRb<f32>,
    ref_pending: HeapRb<f32>,
    mic_hop: Vec<f32>,
    ref_hop: Vec<f32>,
    mic_window: Vec<f32>,
    ref_window: Vec<f32>,
}

impl BlockReframer {
    pub fn new(block_len: usize, block_shift: usize) -> Result<Self> {
        if block_shift == 0 || block_len < block_shift {
            bail!(
                "Invalid block geometry: block_len={} block_shift={}",
                block_len,
                block_shift
            );
        }
        Ok(Self {
            block_len,
            block_shift,
            mic_pending: HeapRb::<f32>::new(block_shift),
            ref_pending: HeapRb::<f32>::new(block_shift),
            mic_hop: vec![0.0; block_shift],
            ref_hop: vec![0.0; block_shift],
            mic_window: vec![0.0; block_len],
            ref_window: vec![0.0; block_len],
        })
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn block_shift(&self) -> usize {
        self.block_shift
    }

    /// Samples buffered per channel that do not yet form a full hop.
    pub fn pending_len(&self) -> usize {
        self.mic_pending.occupied_len()
    }

    /// Number of blocks a push of `chunk_len` samples will produce.
    pub fn blocks_for(&self, chunk_len: usize) -> usize {
        (self.pending_len() + chunk_len) / self.block_shift
    }

    /// Appends a paired chunk and calls `on_block` once per completed hop.
    ///
    /// Returns the number of blocks produced. Chunks of different lengths are
    /// rejected before any sample is consumed.
    pub fn push<F>(&mut self, mic: &[i16], reference: &[i16], mut on_block: F) -> Result<usize>
    where
        F: FnMut(BlockPair<'_>),
    {
        if mic.len() != reference.len() {
            bail!(
                "Mic and reference chunks differ in length: {} vs {}",
                mic.len(),
                reference.len()
            );
        }

        let mut blocks = 0;
        for (&m, &r) in mic.iter().zip(reference) {
            let _ = self.mic_pending.try_push(m as f32);
            let _ = self.ref_pending.try_push(r as f32);

            if self.mic_pending.occupied_len() >= self.block_shift {
                self.advance();
                on_block(BlockPair {
                    mic_hop: &self.mic_hop,
                    ref_hop: &self.ref_hop,
                    mic_window: &self.mic_window,
                    ref_window: &self.ref_window,
                });
                blocks += 1;
            }
        }
        Ok(blocks)
    }

    fn advance(&mut self) {
        let keep = self.block_len - self.block_shift;
        self.mic_pending.pop_slice(&mut self.mic_hop);
        self.ref_pending.pop_slice(&mut self.ref_hop);

        self.mic_window.copy_within(self.block_shift.., 0);
        self.mic_window[keep..].copy_from_slice(&self.mic_hop);
        self.ref_window.copy_within(self.block_shift.., 0);
        self.ref_window[keep..].copy_from_slice(&self.ref_hop);
    }

    /// Drops pending samples and zeroes both windows.
    pub fn reset(&mut self) {
        self.mic_pending.clear();
        self.ref_pending.clear();
        self.mic_hop.fill(0.0);
        self.ref_hop.fill(0.0);
        self.mic_window.fill(0.0);
        self.ref_window.fill(0.0);
    }
}
