//! Video capture pipeline: source selection, frame pacing, resize and
//! packetization.
//!
//! The capture thread owns its source exclusively. Each tick it reads one
//! raw frame, shrinks it to the protocol bounds, packs a VideoFrame packet
//! and posts it to the session's send queue. Pacing uses the monotonic
//! clock and compensates for drift; the tick interval comes from the
//! configured fps, the source's probed fps, or 60 as the last resort.

use std::io::Read;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use glyphchat_protocol::config::MediaConfig;
use glyphchat_protocol::packet::{
    FRAME_FLAG_HAS_COLOR, Packet, PixelFormat, frame_flags,
};

use crate::shutdown::ShutdownToken;

pub const DEFAULT_FPS: u32 = 60;
pub const MAX_CAPTURE_WIDTH: u32 = 800;
pub const MAX_CAPTURE_HEIGHT: u32 = 600;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media source init failed: {0}")]
    Init(String),
    #[error("webcam unavailable: {0}")]
    Webcam(String),
    #[error("i/o error reading media: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed media stream: {0}")]
    Malformed(String),
}

/// One uncompressed frame from a source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

impl RawFrame {
    pub fn byte_len(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }
}

/// A video source the capture thread can drive.
///
/// Webcam and streaming-URL decoders implement this behind the device
/// seam; the built-in implementations cover files, stdin and the test
/// pattern.
pub trait VideoSource: Send {
    /// Native frame rate, when the source knows it.
    fn probe_fps(&mut self) -> Option<u32>;

    /// Read the next frame; `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RawFrame>, MediaError>;

    /// Interrupt a blocking read during shutdown.
    fn flush(&mut self) {}

    fn name(&self) -> &'static str;
}

/// Factory for sources whose drivers live outside this crate.
pub type SourceOpener = Box<dyn Fn(&MediaConfig) -> Result<Box<dyn VideoSource>, MediaError> + Send + Sync>;

/// Injected openers for out-of-crate devices.
#[derive(Default)]
pub struct SourceFactories {
    pub webcam: Option<SourceOpener>,
    pub url: Option<SourceOpener>,
}

/// Pick a source by configuration priority:
/// URL → file (`-` = stdin) → test pattern → webcam.
pub fn select_source(
    media: &MediaConfig,
    factories: &SourceFactories,
) -> Result<Box<dyn VideoSource>, MediaError> {
    if !media.media_path.is_empty() && media.media_path.contains("://") {
        let opener = factories
            .url
            .as_ref()
            .ok_or_else(|| MediaError::Init("no streaming decoder available".into()))?;
        return opener(media);
    }
    if media.media_path == "-" {
        info!("capturing raw frames from stdin");
        return Ok(Box::new(RawStreamSource::new(std::io::stdin())));
    }
    if !media.media_path.is_empty() {
        let file = std::fs::File::open(&media.media_path)?;
        info!(path = %media.media_path, "capturing raw frames from file");
        return Ok(Box::new(RawStreamSource::new(file)));
    }
    if media.test_pattern {
        return Ok(Box::new(TestPatternSource::new(320, 240)));
    }
    let opener = factories
        .webcam
        .as_ref()
        .ok_or_else(|| MediaError::Webcam("no webcam driver registered".into()))?;
    opener(media)
}

/// Moving colour gradient used when no capture device is wanted.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    tick: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl VideoSource for TestPatternSource {
    fn probe_fps(&mut self) -> Option<u32> {
        Some(30)
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>, MediaError> {
        let mut pixels =
            Vec::with_capacity(RawFrame::byte_len(self.width, self.height, PixelFormat::Rgb));
        let phase = (self.tick % 256) as u32;
        for y in 0..self.height {
            for x in 0..self.width {
                pixels.push(((x * 255 / self.width + phase) % 256) as u8);
                pixels.push(((y * 255 / self.height) % 256) as u8);
                pixels.push(((x + y + phase) % 256) as u8);
            }
        }
        self.tick += 1;
        Ok(Some(RawFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgb,
            pixels,
        }))
    }

    fn name(&self) -> &'static str {
        "test-pattern"
    }
}

/// Raw frame stream from a file or stdin. Each frame is a 16-byte
/// big-endian header `width | height | format | payload_len` followed by
/// the pixel payload.
pub struct RawStreamSource<R: Read + Send> {
    reader: R,
}

impl<R: Read + Send> RawStreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> VideoSource for RawStreamSource<R> {
    fn probe_fps(&mut self) -> Option<u32> {
        None
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>, MediaError> {
        let mut header = [0u8; 16];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.reader.read(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None); // clean end of stream
                }
                return Err(MediaError::Malformed("truncated frame header".into()));
            }
            filled += n;
        }
        let width = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let height = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let format_raw = u32::from_be_bytes(header[8..12].try_into().unwrap());
        let len = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;

        let format = match format_raw {
            0 => PixelFormat::Rgb,
            1 => PixelFormat::Rgba,
            2 => PixelFormat::Bgr,
            3 => PixelFormat::Bgra,
            other => {
                return Err(MediaError::Malformed(format!("pixel format {other}")));
            }
        };
        if width == 0 || height == 0 || width > 8192 || height > 8192 {
            return Err(MediaError::Malformed(format!(
                "frame dimensions {width}x{height}"
            )));
        }
        if len != RawFrame::byte_len(width, height, format) {
            return Err(MediaError::Malformed(format!(
                "payload {len} bytes for {width}x{height}"
            )));
        }

        let mut pixels = vec![0u8; len];
        self.reader.read_exact(&mut pixels)?;
        Ok(Some(RawFrame {
            width,
            height,
            format,
            pixels,
        }))
    }

    fn name(&self) -> &'static str {
        "raw-stream"
    }
}

/// Shrink a frame to fit the given bounds, preserving aspect ratio.
/// Frames already inside the bounds pass through untouched.
pub fn resize_to_fit(frame: RawFrame, max_width: u32, max_height: u32) -> RawFrame {
    if frame.width <= max_width && frame.height <= max_height {
        return frame;
    }
    // Fit-to-bounds scale, never upscale.
    let scale_w = max_width as f64 / frame.width as f64;
    let scale_h = max_height as f64 / frame.height as f64;
    let scale = scale_w.min(scale_h);
    let out_w = ((frame.width as f64 * scale) as u32).max(1);
    let out_h = ((frame.height as f64 * scale) as u32).max(1);

    let bpp = frame.format.bytes_per_pixel();
    let mut pixels = Vec::with_capacity(RawFrame::byte_len(out_w, out_h, frame.format));
    for y in 0..out_h {
        let src_y = (y as u64 * frame.height as u64 / out_h as u64) as u32;
        for x in 0..out_w {
            let src_x = (x as u64 * frame.width as u64 / out_w as u64) as u32;
            let offset = (src_y as usize * frame.width as usize + src_x as usize) * bpp;
            pixels.extend_from_slice(&frame.pixels[offset..offset + bpp]);
        }
    }
    RawFrame {
        width: out_w,
        height: out_h,
        format: frame.format,
        pixels,
    }
}

/// Turn a raw frame into its wire packet, validating protocol bounds.
pub fn packetize(frame: RawFrame) -> Result<Packet, MediaError> {
    if frame.pixels.len() != RawFrame::byte_len(frame.width, frame.height, frame.format) {
        return Err(MediaError::Malformed(format!(
            "pixel buffer {} bytes for {}x{}",
            frame.pixels.len(),
            frame.width,
            frame.height
        )));
    }
    Ok(Packet::VideoFrame {
        width: frame.width,
        height: frame.height,
        flags: frame_flags(FRAME_FLAG_HAS_COLOR, frame.format),
        pixels: frame.pixels,
    })
}

/// Spawn the capture thread.
///
/// Runs until the source ends, the shutdown token fires, or the send
/// queue closes (connection lost).
pub fn spawn_capture_thread(
    mut source: Box<dyn VideoSource>,
    fps_override: u32,
    outbound: mpsc::Sender<Packet>,
    shutdown: ShutdownToken,
    connection_lost: ShutdownToken,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("video-capture".into())
        .spawn(move || {
            let fps = if fps_override > 0 {
                fps_override
            } else {
                match source.probe_fps() {
                    Some(fps) if fps > 0 => fps,
                    _ => {
                        debug!("source fps probe failed, defaulting to {DEFAULT_FPS}");
                        DEFAULT_FPS
                    }
                }
            };
            let interval = Duration::from_nanos(1_000_000_000 / fps as u64);
            info!(source = source.name(), fps, "capture thread started");

            let mut next_tick = Instant::now();
            let mut frames_sent: u64 = 0;
            loop {
                if shutdown.is_triggered() || connection_lost.is_triggered() {
                    info!(frames_sent, "capture thread shutting down");
                    return;
                }

                let frame = match source.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        info!(frames_sent, "media source ended");
                        return;
                    }
                    Err(e) => {
                        error!("capture failed: {e}");
                        connection_lost.trigger();
                        return;
                    }
                };

                let frame = resize_to_fit(frame, MAX_CAPTURE_WIDTH, MAX_CAPTURE_HEIGHT);
                match packetize(frame) {
                    Ok(packet) => match outbound.try_send(packet) {
                        Ok(()) => frames_sent += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // Prefer dropping a frame over adding latency.
                            debug!("send queue full, dropping video frame");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            info!("send queue closed, stopping capture");
                            return;
                        }
                    },
                    Err(e) => {
                        warn!("skipping invalid frame: {e}");
                    }
                }

                // Drift-compensated pacing: deadlines advance by the
                // interval, not by "now", so a slow tick is amortized.
                next_tick += interval;
                let now = Instant::now();
                if next_tick > now {
                    let mut remaining = next_tick - now;
                    while remaining > Duration::ZERO {
                        let chunk = remaining.min(Duration::from_millis(250));
                        std::thread::sleep(chunk);
                        if shutdown.is_triggered() || connection_lost.is_triggered() {
                            return;
                        }
                        remaining = next_tick.saturating_duration_since(Instant::now());
                    }
                } else if now - next_tick > interval * 10 {
                    // Too far behind to catch up frame by frame.
                    next_tick = now;
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_produces_valid_frames() {
        let mut source = TestPatternSource::new(32, 24);
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 24);
        assert_eq!(frame.pixels.len(), 32 * 24 * 3);
        // Successive frames differ (the pattern moves).
        let next = source.next_frame().unwrap().unwrap();
        assert_ne!(frame.pixels, next.pixels);
    }

    #[test]
    fn test_pattern_packetizes() {
        let mut source = TestPatternSource::new(16, 16);
        let frame = source.next_frame().unwrap().unwrap();
        let packet = packetize(frame).unwrap();
        let Packet::VideoFrame { width, height, flags, pixels } = &packet else {
            panic!("expected VideoFrame");
        };
        assert_eq!((*width, *height), (16, 16));
        assert_ne!(flags & FRAME_FLAG_HAS_COLOR, 0);
        assert_eq!(pixels.len(), 16 * 16 * 3);
        // And decodes back through the codec.
        let decoded = Packet::decode(packet.kind(), &packet.encode_payload()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn resize_preserves_aspect_within_bounds() {
        let frame = RawFrame {
            width: 1600,
            height: 1200,
            format: PixelFormat::Rgb,
            pixels: vec![0u8; 1600 * 1200 * 3],
        };
        let out = resize_to_fit(frame, MAX_CAPTURE_WIDTH, MAX_CAPTURE_HEIGHT);
        assert_eq!(out.width, 800);
        assert_eq!(out.height, 600);
        assert_eq!(out.pixels.len(), 800 * 600 * 3);
    }

    #[test]
    fn resize_passes_small_frames_through() {
        let frame = RawFrame {
            width: 320,
            height: 240,
            format: PixelFormat::Rgb,
            pixels: vec![7u8; 320 * 240 * 3],
        };
        let out = resize_to_fit(frame.clone(), MAX_CAPTURE_WIDTH, MAX_CAPTURE_HEIGHT);
        assert_eq!(out, frame);
    }

    #[test]
    fn resize_wide_frame_letterboxes_by_width() {
        let frame = RawFrame {
            width: 1600,
            height: 400,
            format: PixelFormat::Rgb,
            pixels: vec![0u8; 1600 * 400 * 3],
        };
        let out = resize_to_fit(frame, MAX_CAPTURE_WIDTH, MAX_CAPTURE_HEIGHT);
        assert_eq!(out.width, 800);
        assert_eq!(out.height, 200);
    }

    #[test]
    fn raw_stream_roundtrip() {
        let frame_pixels: Vec<u8> = (0..2 * 2 * 3).map(|i| i as u8).collect();
        let mut stream = Vec::new();
        stream.extend_from_slice(&2u32.to_be_bytes());
        stream.extend_from_slice(&2u32.to_be_bytes());
        stream.extend_from_slice(&0u32.to_be_bytes());
        stream.extend_from_slice(&(frame_pixels.len() as u32).to_be_bytes());
        stream.extend_from_slice(&frame_pixels);

        let mut source = RawStreamSource::new(stream.as_slice());
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.width, 2);
        assert_eq!(frame.height, 2);
        assert_eq!(frame.format, PixelFormat::Rgb);
        assert_eq!(frame.pixels, frame_pixels);
        // Clean end of stream.
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn raw_stream_rejects_bad_header() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&2u32.to_be_bytes());
        stream.extend_from_slice(&2u32.to_be_bytes());
        stream.extend_from_slice(&9u32.to_be_bytes()); // bad format
        stream.extend_from_slice(&12u32.to_be_bytes());
        stream.extend_from_slice(&[0u8; 12]);
        let mut source = RawStreamSource::new(stream.as_slice());
        assert!(matches!(
            source.next_frame(),
            Err(MediaError::Malformed(_))
        ));
    }

    #[test]
    fn raw_stream_detects_truncated_header() {
        let stream = [0u8; 7];
        let mut source = RawStreamSource::new(&stream[..]);
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn select_source_priority() {
        // Test pattern beats webcam.
        let media = MediaConfig {
            test_pattern: true,
            ..Default::default()
        };
        let source = select_source(&media, &SourceFactories::default()).unwrap();
        assert_eq!(source.name(), "test-pattern");

        // No source at all: webcam required but no driver registered.
        let media = MediaConfig::default();
        assert!(matches!(
            select_source(&media, &SourceFactories::default()),
            Err(MediaError::Webcam(_))
        ));

        // URL requires a streaming decoder.
        let media = MediaConfig {
            media_path: "https://example.net/stream".into(),
            ..Default::default()
        };
        assert!(matches!(
            select_source(&media, &SourceFactories::default()),
            Err(MediaError::Init(_))
        ));
    }

    #[tokio::test]
    async fn capture_thread_sends_paced_frames() {
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = ShutdownToken::new();
        let lost = ShutdownToken::new();
        let handle = spawn_capture_thread(
            Box::new(TestPatternSource::new(16, 16)),
            120, // fast ticks keep the test short
            tx,
            shutdown.clone(),
            lost,
        )
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Packet::VideoFrame { .. }));

        shutdown.trigger();
        drop(rx);
        handle.join().unwrap();
    }
}
