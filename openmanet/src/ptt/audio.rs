//! The cpal audio pipeline.
//!
//! cpal streams are not `Send`, so both streams live on a dedicated audio thread which owns them
//! from construction to drop. The rest of the session talks to it through a control channel:
//! arming and disarming the microphone, and final shutdown. The output stream runs for the whole
//! session lifetime and drains the playback queue; the input stream starts paused and is only
//! running while the operator holds the button.

use std::net::UdpSocket;
use std::sync::mpsc;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use tracing::{debug, error, warn};

use super::queue::PlaybackQueue;
use super::{PttError, FRAME_SIZE, MAX_PACKET_SIZE, SAMPLE_RATE};

/// Commands understood by the audio thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCommand {
    /// Start the microphone stream. Encoded frames flow to the multicast group immediately.
    StartMic,
    /// Pause the microphone stream.
    StopMic,
    /// Drop both streams and end the thread.
    Shutdown,
}

/// Handle to the running audio thread.
pub struct AudioPipeline {
    pub control: mpsc::Sender<AudioCommand>,
    pub thread: std::thread::JoinHandle<()>,
}

/// Spawn the audio thread: open both streams, then serve control commands until shutdown.
///
/// Construction errors on the audio thread are reported back synchronously, a failure to open
/// either device aborts the whole PTT subsystem.
pub fn spawn(
    playback: Arc<PlaybackQueue>,
    encoder: opus::Encoder,
    send_socket: UdpSocket,
) -> Result<AudioPipeline, PttError> {
    let (control_tx, control_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();

    let thread = std::thread::Builder::new()
        .name("ptt-audio".to_string())
        .spawn(move || {
            let streams = match build_streams(playback, encoder, send_socket) {
                Ok(streams) => {
                    let _ = ready_tx.send(Ok(()));
                    streams
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let (_output, input) = streams;

            while let Ok(command) = control_rx.recv() {
                match command {
                    AudioCommand::StartMic => {
                        if let Err(e) = input.play() {
                            error!(err = %e, "failed to start microphone stream");
                        } else {
                            debug!("microphone stream running");
                        }
                    }
                    AudioCommand::StopMic => {
                        if let Err(e) = input.pause() {
                            error!(err = %e, "failed to stop microphone stream");
                        } else {
                            debug!("microphone stream paused");
                        }
                    }
                    AudioCommand::Shutdown => break,
                }
            }
            // Dropping the streams releases both devices.
            debug!("audio thread stopped");
        })
        .map_err(PttError::Io)?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(AudioPipeline {
            control: control_tx,
            thread,
        }),
        Ok(Err(e)) => Err(e),
        // The audio thread died before reporting, which it never does without an error.
        Err(_) => Err(PttError::Io(std::io::Error::other(
            "audio thread exited during setup",
        ))),
    }
}

fn build_streams(
    playback: Arc<PlaybackQueue>,
    mut encoder: opus::Encoder,
    send_socket: UdpSocket,
) -> Result<(cpal::Stream, cpal::Stream), PttError> {
    let host = cpal::default_host();
    let config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: BufferSize::Default,
    };

    let output_device = host.default_output_device().ok_or(PttError::NoOutputDevice)?;
    // Partially consumed frame carried between callbacks, cpal buffer sizes don't line up with
    // our frame size.
    let mut pending: Vec<f32> = Vec::new();
    let output = output_device
        .build_output_stream(
            &config,
            move |out: &mut [f32], _| {
                let mut filled = 0;
                while filled < out.len() {
                    if pending.is_empty() {
                        match playback.pop() {
                            Some(frame) => pending = frame,
                            None => break,
                        }
                    }
                    let n = (out.len() - filled).min(pending.len());
                    out[filled..filled + n].copy_from_slice(&pending[..n]);
                    pending.drain(..n);
                    filled += n;
                }
                // Silence when nothing is queued.
                for sample in &mut out[filled..] {
                    *sample = 0.0;
                }
            },
            |e| error!(err = %e, "output stream error"),
            None,
        )
        .map_err(PttError::BuildStream)?;
    output.play().map_err(PttError::PlayStream)?;

    let input_device = host.default_input_device().ok_or(PttError::NoInputDevice)?;
    let mut pcm: Vec<i16> = Vec::with_capacity(FRAME_SIZE * 2);
    let mut packet = vec![0u8; MAX_PACKET_SIZE];
    let input = input_device
        .build_input_stream(
            &config,
            move |data: &[f32], _| {
                pcm.extend(data.iter().map(|&sample| pcm_sample(sample)));
                while pcm.len() >= FRAME_SIZE {
                    let frame: Vec<i16> = pcm.drain(..FRAME_SIZE).collect();
                    match encoder.encode(&frame, &mut packet) {
                        Ok(n) => {
                            if let Err(e) = send_socket.send(&packet[..n]) {
                                warn!(err = %e, "failed to send voice frame");
                            }
                        }
                        Err(e) => warn!(err = %e, "voice frame encode failed"),
                    }
                }
            },
            |e| error!(err = %e, "input stream error"),
            None,
        )
        .map_err(PttError::BuildStream)?;
    // Armed by the first button press.
    input.pause().map_err(PttError::PauseStream)?;

    Ok((output, input))
}

/// Convert a float sample to 16 bit PCM, clamping out of range input.
fn pcm_sample(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
