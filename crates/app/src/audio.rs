use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use talkback_core::{StreamingAecProcessor, SuppressionStats};

fn find_input(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    if name == "default" {
        host.default_input_device().context("No default input found")
    } else {
        host.input_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .context("Input device not found")
    }
}

fn find_output(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    if name == "default" {
        host.default_output_device().context("No default output found")
    } else {
        host.output_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .context("Output device not found")
    }
}

/// Ring size for one side of the engine: at least 200ms and four chunks.
fn ring_capacity(rate: u32, chunk: usize) -> usize {
    (rate as usize / 5).max(chunk * 4)
}

fn mono_config(rate: u32) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Full-duplex engine: plays a far-end signal, captures the microphone and
/// removes the echo of the former from the latter.
///
/// Three threads besides the device callbacks: the feeder hands far-end
/// chunks to the reference tap and then to the output device; the capture
/// worker runs the processor on fixed-size chunks.
pub struct DuplexEngine {
    _input_stream: cpal::Stream,
    _output_stream: cpal::Stream,
    is_running: Arc<AtomicBool>,
    pub playback_done: Arc<AtomicBool>,
    pub cleaned: Receiver<Vec<i16>>,
}

impl DuplexEngine {
    /// Starts the engine.
    ///
    /// # Arguments
    /// * `input_device_name` - Capture device, or "default"
    /// * `output_device_name` - Playback device, or "default"
    /// * `far_end` - Far-end audio at the playback rate
    /// * `processor` - Configured processor, moved to the capture worker
    /// * `chunk` - Capture chunk length in samples
    /// * `stats_sender` - Optional sink for suppression statistics
    pub fn start(
        input_device_name: &str,
        output_device_name: &str,
        far_end: Vec<i16>,
        mut processor: StreamingAecProcessor,
        chunk: usize,
        stats_sender: Option<Sender<SuppressionStats>>,
    ) -> Result<Self> {
        let host = cpal::default_host();
        info!("Audio host: {}", host.id().name());

        let input_device = find_input(&host, input_device_name)?;
        info!("Using input device: {}", input_device.name().unwrap_or_default());
        let output_device = find_output(&host, output_device_name)?;
        info!("Using output device: {}", output_device.name().unwrap_or_default());

        let capture_rate = processor.config().capture_rate;
        let playback_rate = processor.config().playback_rate;
        let play_chunk = (chunk * playback_rate as usize / capture_rate as usize).max(1);

        // Latency management: 200ms of headroom, and always room for several chunks
        let rb_in = HeapRb::<i16>::new(ring_capacity(capture_rate, chunk));
        let (mut prod_in, mut cons_in) = rb_in.split();
        let rb_play = HeapRb::<i16>::new(ring_capacity(playback_rate, play_chunk));
        let (mut prod_play, mut cons_play) = rb_play.split();

        let input_stream = input_device.build_input_stream(
            &mono_config(capture_rate),
            move |data: &[f32], _| {
                for &s in data {
                    let _ = prod_in.try_push((s * 32767.0).clamp(-32768.0, 32767.0) as i16);
                }
            },
            |err| warn!("Input error: {}", err),
            None,
        )?;

        let output_stream = output_device.build_output_stream(
            &mono_config(playback_rate),
            move |data: &mut [f32], _| {
                for sample in data.iter_mut() {
                    *sample = cons_play.try_pop().map_or(0.0, |s| s as f32 / 32768.0);
                }
            },
            |err| warn!("Output error: {}", err),
            None,
        )?;

        processor.stats_sender = stats_sender;
        let mut tap = processor.playback_tap();

        let is_running = Arc::new(AtomicBool::new(true));
        let playback_done = Arc::new(AtomicBool::new(far_end.is_empty()));
        let (cleaned_tx, cleaned_rx) = crossbeam_channel::bounded::<Vec<i16>>(64);

        let run_flag = is_running.clone();
        let done_flag = playback_done.clone();
        thread::Builder::new()
            .name("talkback-playback".into())
            .spawn(move || {
                for played in far_end.chunks(play_chunk) {
                    while prod_play.vacant_len() < played.len() {
                        if !run_flag.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(Duration::from_millis(2));
                    }
                    // The reference must be queued before the device can play it
                    tap.notify_played(played);
                    prod_play.push_slice(played);
                }
                tap.playback_finished();
                done_flag.store(true, Ordering::Relaxed);
            })
            .context("Failed to spawn playback thread")?;

        let run_flag = is_running.clone();
        thread::Builder::new()
            .name("talkback-capture".into())
            .spawn(move || {
                let mut input_chunk = vec![0i16; chunk];
                let mut output_chunk = vec![0i16; chunk];
                while run_flag.load(Ordering::Relaxed) {
                    if cons_in.occupied_len() >= chunk {
                        cons_in.pop_slice(&mut input_chunk);
                        processor.suppress_into(&input_chunk, &mut output_chunk);
                        if cleaned_tx.try_send(output_chunk.clone()).is_err() {
                            warn!("Recorder fell behind, dropping a cleaned chunk");
                        }
                    } else {
                        thread::sleep(Duration::from_micros(500));
                    }
                }
            })
            .context("Failed to spawn capture thread")?;

        input_stream.play()?;
        output_stream.play()?;

        Ok(Self {
            _input_stream: input_stream,
            _output_stream: output_stream,
            is_running,
            playback_done,
            cleaned: cleaned_rx,
        })
    }
}

impl Drop for DuplexEngine {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);
    }
}
