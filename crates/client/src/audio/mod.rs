//! Audio pipeline: Opus codec, capture/playback plumbing and the seams
//! for echo cancellation and preprocessing.
//!
//! Capture: the device input callback pushes mic samples into an SPSC
//! ring; the audio-sender thread drains it in 20 ms frames, runs the
//! optional preprocessors, Opus-encodes and posts packets to the session
//! send queue. Playback: the dispatch handler decodes incoming packets
//! into the jitter buffer; the device output callback pulls ordered
//! frames out and updates the echo canceller's render reference (from the
//! playback path only — never from decode, which runs tens of
//! milliseconds earlier).

pub mod jitter;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Bitrate, Channels, SampleRate};
use parking_lot::Mutex;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use glyphchat_protocol::packet::Packet;

use crate::shutdown::ShutdownToken;
use jitter::{JitterBuffer, PopOutcome, UnderrunStrategy};

pub const SAMPLE_RATE: u32 = 48_000;
pub const FRAME_MS: u16 = 20;
pub const FRAME_SAMPLES: usize = 960; // 20 ms at 48 kHz mono
pub const OPUS_BITRATE: i32 = 128_000;
const MAX_OPUS_PACKET: usize = 4000;
const UNDERRUN_LOG_EVERY: u64 = 50;

pub type MicProducer = ringbuf::HeapProd<f32>;
pub type MicConsumer = ringbuf::HeapCons<f32>;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("audio codec init failed: {0}")]
    Init(String),
}

/// SPSC ring between the device input callback (producer) and the
/// audio-sender thread (consumer).
pub fn capture_ring(capacity_ms: u32) -> (MicProducer, MicConsumer) {
    let samples = (SAMPLE_RATE as usize * capacity_ms as usize) / 1000;
    HeapRb::<f32>::new(samples.max(FRAME_SAMPLES * 2)).split()
}

/// Acoustic echo cancellation seam. The render reference is fed from the
/// playback callback; capture frames are filtered before encoding.
pub trait EchoCanceller: Send {
    fn analyze_render(&mut self, frame: &[f32]);
    fn process_capture(&mut self, frame: &mut [f32]);
}

/// 20 ms-frame preprocessing seam (noise suppression, AGC, VAD). Must
/// not change the sample rate or frame length.
pub trait Preprocessor: Send {
    fn process(&mut self, frame: &mut [f32]);
}

pub type SharedEchoCanceller = Arc<Mutex<Option<Box<dyn EchoCanceller>>>>;

/// Receive half: decode, jitter-buffer and hand frames to the device.
pub struct AudioPipeline {
    decoder: Mutex<OpusDecoder>,
    jitter: Mutex<JitterBuffer>,
    decode_seq: AtomicU64,
    aec: SharedEchoCanceller,
    underruns_logged: AtomicU64,
}

impl AudioPipeline {
    pub fn new(jitter_margin_ms: u32, strategy: UnderrunStrategy) -> Result<Self, AudioError> {
        let decoder = OpusDecoder::new(SampleRate::Hz48000, Channels::Mono)
            .map_err(|e| AudioError::Init(format!("opus decoder: {e:?}")))?;
        Ok(Self {
            decoder: Mutex::new(decoder),
            jitter: Mutex::new(JitterBuffer::new(
                jitter_margin_ms,
                FRAME_MS as u32,
                FRAME_SAMPLES,
                strategy,
            )),
            decode_seq: AtomicU64::new(0),
            aec: Arc::new(Mutex::new(None)),
            underruns_logged: AtomicU64::new(0),
        })
    }

    pub fn set_echo_canceller(&self, aec: Box<dyn EchoCanceller>) {
        *self.aec.lock() = Some(aec);
    }

    /// Shared handle for the sender thread's capture-side filtering.
    pub fn echo_canceller(&self) -> SharedEchoCanceller {
        Arc::clone(&self.aec)
    }

    /// Decode one AudioOpus packet into the jitter buffer. Called from
    /// the dispatch handler; decoding a few frames is fast enough to run
    /// inline.
    pub fn handle_packet(&self, sample_rate: u32, frame_ms: u16, frames: &[Vec<u8>]) {
        if sample_rate != SAMPLE_RATE || frame_ms != FRAME_MS {
            warn!(sample_rate, frame_ms, "dropping audio packet with unexpected format");
            return;
        }
        let mut decoder = self.decoder.lock();
        for opus_frame in frames {
            let mut pcm = vec![0.0f32; FRAME_SAMPLES];
            let decoded = match decoder.decode_float(Some(opus_frame.as_slice()), &mut pcm[..], false)
            {
                Ok(n) => n,
                Err(e) => {
                    warn!("opus decode failed: {e:?}");
                    continue;
                }
            };
            if decoded != FRAME_SAMPLES {
                debug!(decoded, "short opus frame, padding with silence");
                pcm.resize(FRAME_SAMPLES, 0.0);
            }
            let seq = self.decode_seq.fetch_add(1, Ordering::Relaxed);
            self.jitter.lock().insert(seq, pcm);
        }
    }

    /// Fill one playback frame. Called by the device output callback;
    /// this is the only place the AEC render reference is updated.
    pub fn render_output(&self, out: &mut [f32]) {
        let outcome = self.jitter.lock().pop(out);
        if outcome == PopOutcome::Underrun {
            let n = self.underruns_logged.fetch_add(1, Ordering::Relaxed);
            if n % UNDERRUN_LOG_EVERY == 0 {
                warn!(total = n + 1, "audio playback underrun");
            }
        }
        if let Some(aec) = self.aec.lock().as_mut() {
            aec.analyze_render(out);
        }
    }

    pub fn underruns(&self) -> u64 {
        self.jitter.lock().underruns()
    }

    pub fn reset(&self) {
        self.jitter.lock().reset();
        self.decode_seq.store(0, Ordering::Relaxed);
    }
}

/// Spawn the audio-sender thread: drain the mic ring, preprocess,
/// encode, post to the send queue.
pub fn spawn_audio_sender(
    mut mic: MicConsumer,
    aec: SharedEchoCanceller,
    mut preprocessors: Vec<Box<dyn Preprocessor>>,
    outbound: mpsc::Sender<Packet>,
    shutdown: ShutdownToken,
    connection_lost: ShutdownToken,
) -> Result<JoinHandle<()>, AudioError> {
    let mut encoder = OpusEncoder::new(SampleRate::Hz48000, Channels::Mono, Application::Audio)
        .map_err(|e| AudioError::Init(format!("opus encoder: {e:?}")))?;
    encoder
        .set_bitrate(Bitrate::BitsPerSecond(OPUS_BITRATE))
        .map_err(|e| AudioError::Init(format!("opus bitrate: {e:?}")))?;

    std::thread::Builder::new()
        .name("audio-sender".into())
        .spawn(move || {
            info!("audio sender thread started");
            let mut pcm = [0.0f32; FRAME_SAMPLES];
            let mut opus_buf = vec![0u8; MAX_OPUS_PACKET];
            loop {
                if shutdown.is_triggered() || connection_lost.is_triggered() {
                    info!("audio sender shutting down");
                    return;
                }
                if mic.occupied_len() < FRAME_SAMPLES {
                    // Device callback fills every 20 ms; stay responsive
                    // to shutdown without burning a core.
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                let got = mic.pop_slice(&mut pcm);
                if got < FRAME_SAMPLES {
                    pcm[got..].fill(0.0);
                }

                if let Some(aec) = aec.lock().as_mut() {
                    aec.process_capture(&mut pcm);
                }
                for stage in preprocessors.iter_mut() {
                    stage.process(&mut pcm);
                }

                let encoded = match encoder.encode_float(&pcm, &mut opus_buf) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("opus encode failed: {e:?}");
                        continue;
                    }
                };
                let packet = Packet::AudioOpus {
                    sample_rate: SAMPLE_RATE,
                    frame_ms: FRAME_MS,
                    frames: vec![opus_buf[..encoded].to_vec()],
                };
                match outbound.try_send(packet) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("send queue full, dropping audio frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        info!("send queue closed, stopping audio sender");
                        return;
                    }
                }
            }
        })
        .map_err(|e| AudioError::Init(format!("spawn audio sender: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_sine(encoder: &mut OpusEncoder, phase: &mut f32) -> Vec<u8> {
        let mut pcm = [0.0f32; FRAME_SAMPLES];
        for sample in pcm.iter_mut() {
            *sample = (*phase).sin() * 0.5;
            *phase += 2.0 * std::f32::consts::PI * 1000.0 / SAMPLE_RATE as f32;
        }
        let mut buf = vec![0u8; MAX_OPUS_PACKET];
        let n = encoder.encode_float(&pcm, &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    fn test_encoder() -> OpusEncoder {
        let mut encoder =
            OpusEncoder::new(SampleRate::Hz48000, Channels::Mono, Application::Audio).unwrap();
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(OPUS_BITRATE))
            .unwrap();
        encoder
    }

    #[test]
    fn capture_ring_is_spsc_pair() {
        let (mut producer, mut consumer) = capture_ring(200);
        let samples: Vec<f32> = (0..FRAME_SAMPLES).map(|i| i as f32).collect();
        assert_eq!(producer.push_slice(&samples), FRAME_SAMPLES);
        assert_eq!(consumer.occupied_len(), FRAME_SAMPLES);
        let mut out = vec![0.0f32; FRAME_SAMPLES];
        assert_eq!(consumer.pop_slice(&mut out), FRAME_SAMPLES);
        assert_eq!(out, samples);
    }

    #[test]
    fn encode_decode_through_pipeline() {
        let pipeline = AudioPipeline::new(20, UnderrunStrategy::Silence).unwrap();
        let mut encoder = test_encoder();
        let mut phase = 0.0f32;

        for _ in 0..4 {
            let frame = encode_sine(&mut encoder, &mut phase);
            pipeline.handle_packet(SAMPLE_RATE, FRAME_MS, &[frame]);
        }

        // Warm-up satisfied (margin = 1 frame); playback produces signal.
        let mut out = [0.0f32; FRAME_SAMPLES];
        pipeline.render_output(&mut out);
        // Opus needs a frame to converge; pull another.
        pipeline.render_output(&mut out);
        let energy: f32 = out.iter().map(|s| s * s).sum();
        assert!(energy > 0.0, "decoded audio should carry signal");
        assert_eq!(pipeline.underruns(), 0);
    }

    #[test]
    fn wrong_format_packets_are_dropped() {
        let pipeline = AudioPipeline::new(20, UnderrunStrategy::Silence).unwrap();
        pipeline.handle_packet(44_100, FRAME_MS, &[vec![0u8; 10]]);
        pipeline.handle_packet(SAMPLE_RATE, 60, &[vec![0u8; 10]]);
        let mut out = [1.0f32; FRAME_SAMPLES];
        pipeline.render_output(&mut out);
        assert_eq!(out, [0.0f32; FRAME_SAMPLES], "still warming, silence out");
    }

    #[test]
    fn render_reference_feeds_echo_canceller() {
        struct RecordingAec {
            render_frames: Arc<Mutex<usize>>,
        }
        impl EchoCanceller for RecordingAec {
            fn analyze_render(&mut self, _frame: &[f32]) {
                *self.render_frames.lock() += 1;
            }
            fn process_capture(&mut self, _frame: &mut [f32]) {}
        }

        let pipeline = AudioPipeline::new(20, UnderrunStrategy::Silence).unwrap();
        let count = Arc::new(Mutex::new(0usize));
        pipeline.set_echo_canceller(Box::new(RecordingAec {
            render_frames: Arc::clone(&count),
        }));

        let mut out = [0.0f32; FRAME_SAMPLES];
        pipeline.render_output(&mut out);
        pipeline.render_output(&mut out);
        assert_eq!(*count.lock(), 2);
    }

    #[tokio::test]
    async fn sender_thread_encodes_mic_samples() {
        let (mut producer, consumer) = capture_ring(200);
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = ShutdownToken::new();
        let handle = spawn_audio_sender(
            consumer,
            Arc::new(Mutex::new(None)),
            Vec::new(),
            tx,
            shutdown.clone(),
            ShutdownToken::new(),
        )
        .unwrap();

        // One 20 ms frame of a 1 kHz tone.
        let samples: Vec<f32> = (0..FRAME_SAMPLES)
            .map(|i| {
                (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / SAMPLE_RATE as f32).sin() * 0.5
            })
            .collect();
        producer.push_slice(&samples);

        let packet = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Packet::AudioOpus {
            sample_rate,
            frame_ms,
            frames,
        } = packet
        else {
            panic!("expected AudioOpus");
        };
        assert_eq!(sample_rate, SAMPLE_RATE);
        assert_eq!(frame_ms, FRAME_MS);
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_empty());

        shutdown.trigger();
        handle.join().unwrap();
    }

    #[test]
    fn preprocessors_run_on_frame_boundaries() {
        struct Gain(f32);
        impl Preprocessor for Gain {
            fn process(&mut self, frame: &mut [f32]) {
                for s in frame.iter_mut() {
                    *s *= self.0;
                }
            }
        }
        let mut stage: Box<dyn Preprocessor> = Box::new(Gain(0.0));
        let mut frame = [1.0f32; FRAME_SAMPLES];
        stage.process(&mut frame);
        assert_eq!(frame, [0.0f32; FRAME_SAMPLES]);
    }
}
