//! Audio sink: serial playback of decoded buffers on the local host.
//!
//! A single worker thread owns the output streams (one lazily-created
//! stream per `(sample_rate, channel_count)` format) and plays exactly one
//! buffer at a time; the next buffer starts strictly after the previous
//! finished or was cancelled. Producers enqueue through a bounded channel
//! and either wait for the play result or take a one-shot completion
//! signal that closes when playback ends.
//!
//! MP3 input is detected by its header signature and decoded by rodio;
//! anything else is treated as signed 16-bit little-endian PCM with a
//! heuristically detected format.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink, Source};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Queue capacity in front of the single worker.
const QUEUE_CAPACITY: usize = 100;
/// Back-pressure deadline for the plain play call.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// Back-pressure deadline for the completion variant.
const ENQUEUE_TIMEOUT_WITH_COMPLETION: Duration = Duration::from_secs(30);

/// Candidate sample rates for headerless PCM, most likely first.
const PCM_CANDIDATE_RATES: [u32; 6] = [24000, 22050, 16000, 8000, 44100, 48000];

struct AudioTask {
    data: Vec<u8>,
    volume: i32,
    done: oneshot::Sender<anyhow::Result<()>>,
    /// Closed when playback finishes or aborts.
    completion: Option<oneshot::Sender<()>>,
}

/// Completion signal returned by [`AudioSink::play_with_completion`]. The
/// channel closes (recv errors) exactly once when the buffer is done.
pub type CompletionSignal = oneshot::Receiver<()>;

/// Handle to the playback worker.
pub struct AudioSink {
    task_tx: mpsc::Sender<AudioTask>,
}

impl AudioSink {
    /// Spawn the worker thread. It lives until `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        let (task_tx, task_rx) = mpsc::channel(QUEUE_CAPACITY);
        std::thread::Builder::new()
            .name("audio-worker".to_string())
            .spawn(move || worker_loop(task_rx, cancel))
            .ok();
        Self { task_tx }
    }

    /// Play a buffer and wait for playback to finish.
    pub async fn play(&self, data: Vec<u8>, volume: i32) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(data, volume, done_tx, None, ENQUEUE_TIMEOUT)
            .await?;
        match done_rx.await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("audio worker dropped the task"),
        }
    }

    /// Play a buffer, returning a completion signal once the task is
    /// accepted and decoded. The signal closes when playback finishes.
    pub async fn play_with_completion(
        &self,
        data: Vec<u8>,
        volume: i32,
    ) -> anyhow::Result<CompletionSignal> {
        let (done_tx, done_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        self.submit(
            data,
            volume,
            done_tx,
            Some(completion_tx),
            ENQUEUE_TIMEOUT_WITH_COMPLETION,
        )
        .await?;

        // Surface decode errors immediately; the completion signal then
        // tracks the actual playback.
        match done_rx.await {
            Ok(Ok(())) => Ok(completion_rx),
            Ok(Err(e)) => Err(e),
            Err(_) => anyhow::bail!("audio worker dropped the task"),
        }
    }

    async fn submit(
        &self,
        data: Vec<u8>,
        volume: i32,
        done: oneshot::Sender<anyhow::Result<()>>,
        completion: Option<oneshot::Sender<()>>,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        if data.is_empty() {
            anyhow::bail!("audio data is empty");
        }
        let volume = clamp_volume(volume);

        self.task_tx
            .send_timeout(
                AudioTask {
                    data,
                    volume,
                    done,
                    completion,
                },
                timeout,
            )
            .await
            .map_err(|_| anyhow::anyhow!("audio playback request timed out"))
    }
}

fn clamp_volume(volume: i32) -> i32 {
    if !(1..=100).contains(&volume) {
        tracing::warn!(volume, "volume out of range, clamping");
    }
    volume.clamp(1, 100)
}

// ── Worker ─────────────────────────────────────────────────────────

fn worker_loop(mut task_rx: mpsc::Receiver<AudioTask>, cancel: CancellationToken) {
    let mut streams: HashMap<(u32, u16), OutputStream> = HashMap::new();

    while let Some(task) = task_rx.blocking_recv() {
        if cancel.is_cancelled() {
            let _ = task.done.send(Err(anyhow::anyhow!("audio sink shut down")));
            continue;
        }

        let AudioTask {
            data,
            volume,
            done,
            completion,
        } = task;

        play_buffer(&mut streams, &data, volume, &cancel, completion.is_some(), done);
        // Dropping the sender closes the completion signal exactly once,
        // whether playback finished, failed, or was cancelled.
        drop(completion);
    }

    tracing::debug!("audio worker exiting");
}

fn play_buffer(
    streams: &mut HashMap<(u32, u16), OutputStream>,
    data: &[u8],
    volume: i32,
    cancel: &CancellationToken,
    early_ack: bool,
    done: oneshot::Sender<anyhow::Result<()>>,
) {
    // Decode first so format errors reach the caller before any sound.
    let decoded = match decode(data) {
        Ok(d) => d,
        Err(e) => {
            let _ = done.send(Err(e));
            return;
        }
    };

    let stream = match streams.entry(decoded.format) {
        std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
        std::collections::hash_map::Entry::Vacant(entry) => {
            match OutputStreamBuilder::open_default_stream() {
                Ok(stream) => {
                    tracing::info!(
                        sample_rate = decoded.format.0,
                        channels = decoded.format.1,
                        "audio output stream created"
                    );
                    entry.insert(stream)
                }
                Err(e) => {
                    let _ = done.send(Err(anyhow::anyhow!("failed to open audio output: {e}")));
                    return;
                }
            }
        }
    };

    let sink = Sink::connect_new(stream.mixer());
    sink.set_volume(volume as f32 / 100.0);
    sink.append(SamplesBuffer::new(
        decoded.format.1,
        decoded.format.0,
        decoded.samples,
    ));

    // The completion variant acknowledges before playback; the plain call
    // acknowledges after, so its await covers the whole playback.
    let late_ack = if early_ack {
        let _ = done.send(Ok(()));
        None
    } else {
        Some(done)
    };

    loop {
        if sink.empty() {
            if let Some(done) = late_ack {
                let _ = done.send(Ok(()));
            }
            return;
        }
        if cancel.is_cancelled() {
            sink.stop();
            if let Some(done) = late_ack {
                let _ = done.send(Err(anyhow::anyhow!("playback cancelled")));
            }
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

// ── Decoding ───────────────────────────────────────────────────────

struct DecodedAudio {
    /// (sample_rate, channels)
    format: (u32, u16),
    samples: Vec<f32>,
}

/// MPEG Layer-III frame sync or ID3 container signature.
fn looks_like_mp3(data: &[u8]) -> bool {
    data.starts_with(b"ID3") || (data.len() >= 2 && data[0] == 0xFF && (data[1] & 0xE0) == 0xE0)
}

fn decode(data: &[u8]) -> anyhow::Result<DecodedAudio> {
    if looks_like_mp3(data) {
        decode_mp3(data)
    } else {
        decode_pcm(data)
    }
}

fn decode_mp3(data: &[u8]) -> anyhow::Result<DecodedAudio> {
    let decoder = Decoder::new(Cursor::new(data.to_vec()))
        .map_err(|e| anyhow::anyhow!("mp3 decode failed: {e}"))?;
    let sample_rate = decoder.sample_rate();
    let channels = decoder.channels();
    let samples: Vec<f32> = decoder.collect();

    if samples.is_empty() {
        anyhow::bail!("mp3 decoded to zero samples");
    }
    Ok(DecodedAudio {
        format: (sample_rate, channels),
        samples,
    })
}

fn decode_pcm(data: &[u8]) -> anyhow::Result<DecodedAudio> {
    if data.len() < 4 {
        anyhow::bail!("audio data too short for pcm: {} bytes", data.len());
    }

    let format = detect_pcm_format(data.len());
    let samples: Vec<f32> = data
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect();

    tracing::debug!(
        sample_rate = format.0,
        channels = format.1,
        bytes = data.len(),
        "pcm format detected"
    );
    Ok(DecodedAudio { format, samples })
}

/// Pick the first plausible `(rate, channels)` for a headerless S16LE
/// buffer: candidates whose 1-second byte size brackets the buffer length
/// within 0.1–10 s, preferring common TTS rates. Falls back to 24 kHz mono.
fn detect_pcm_format(data_len: usize) -> (u32, u16) {
    const BYTES_PER_SAMPLE: usize = 2;
    for rate in PCM_CANDIDATE_RATES {
        for channels in [1u16, 2] {
            let bytes_per_second = rate as usize * channels as usize * BYTES_PER_SAMPLE;
            if data_len >= bytes_per_second / 10 && data_len <= bytes_per_second * 10 {
                if matches!(rate, 24000 | 22050 | 16000) {
                    return (rate, channels);
                }
            }
        }
    }
    (24000, 1)
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mp3_signature_detection() {
        assert!(looks_like_mp3(b"ID3\x04rest"));
        assert!(looks_like_mp3(&[0xFF, 0xFB, 0x90, 0x00]));
        assert!(looks_like_mp3(&[0xFF, 0xE0]));
        assert!(!looks_like_mp3(&[0x00, 0x01, 0x02, 0x03]));
        assert!(!looks_like_mp3(&[0xFF, 0x00]));
        assert!(!looks_like_mp3(b""));
    }

    #[test]
    fn pcm_detection_prefers_common_tts_rates() {
        // 1 second of 24kHz mono S16LE.
        let (rate, channels) = detect_pcm_format(24000 * 2);
        assert_eq!((rate, channels), (24000, 1));

        // Tiny buffers fall back to the default.
        assert_eq!(detect_pcm_format(16), (24000, 1));
    }

    #[test]
    fn pcm_decode_is_little_endian() {
        let data = [0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80];
        let decoded = decode_pcm(&data).unwrap();
        assert_eq!(decoded.samples.len(), 3);
        assert!((decoded.samples[0] - 1.0 / 32768.0).abs() < f32::EPSILON);
        assert!((decoded.samples[1] + 1.0 / 32768.0).abs() < f32::EPSILON);
        assert!((decoded.samples[2] + 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn pcm_too_short_rejected() {
        assert!(decode_pcm(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn volume_clamping() {
        assert_eq!(clamp_volume(0), 1);
        assert_eq!(clamp_volume(-5), 1);
        assert_eq!(clamp_volume(50), 50);
        assert_eq!(clamp_volume(101), 100);
    }

    #[tokio::test]
    async fn empty_buffer_rejected_before_enqueue() {
        let sink = AudioSink::new(CancellationToken::new());
        assert!(sink.play(Vec::new(), 80).await.is_err());
        assert!(sink.play_with_completion(Vec::new(), 80).await.is_err());
    }
}
