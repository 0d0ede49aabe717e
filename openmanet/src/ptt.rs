//! Push-to-talk voice over the mesh.
//!
//! Voice frames are Opus encoded and multicast on the bridge interface, one frame per packet
//! with no extra framing. The receive path always runs: every peer's frames are decoded and
//! queued towards the speaker. The transmit path is gated by a hardware button on a CM108
//! compatible HID device; holding it arms the microphone, releasing it disarms it, with short
//! feedback tones on both edges.
//!
//! All moving parts hang off one [`PttSession`] value: the audio thread owning the cpal streams,
//! the multicast receive loop, the HID monitor and the shared transmit state. There is no
//! process wide mutable state, shutting the session down releases every resource even when
//! individual steps fail.

use core::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::str::FromStr;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod audio;
mod hid;
mod queue;
mod tones;

pub use hid::list_input_devices;

use crate::shutdown::{Shutdown, ShutdownListener};
use audio::{AudioCommand, AudioPipeline};
use queue::PlaybackQueue;

/// Sample rate of the whole pipeline.
const SAMPLE_RATE: u32 = 48_000;
/// Samples per frame, 20 ms at 48 kHz.
const FRAME_SIZE: usize = 960;
/// Voice bitrate requested from the encoder.
const TARGET_BITRATE: i32 = 12_000;
/// Encoder complexity, tuned for small router CPUs.
const ENCODER_COMPLEXITY: i32 = 3;
/// Expected packet loss hint handed to the encoder for in-band FEC.
const PACKET_LOSS_PERC: i32 = 10;
/// Upper bound on an encoded frame.
const MAX_PACKET_SIZE: usize = 4000;
/// Frames the playback queue buffers before dropping.
const PLAYBACK_QUEUE_FRAMES: usize = 2;
/// Frequency of the transmit start tone.
const START_TONE_HZ: f32 = 1000.0;
/// Frequency of the transmit stop tone.
const STOP_TONE_HZ: f32 = 600.0;
/// Delay between queueing the start tone and arming the microphone.
const TONE_LEAD_IN: Duration = Duration::from_millis(200);

/// Default multicast group voice frames are sent to.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
/// Default multicast port.
pub const DEFAULT_MULTICAST_PORT: u16 = 5007;

/// Which HID key arms the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttKey {
    /// Any key on the device.
    Any,
    /// A specific key code.
    Code(u16),
}

/// An unparsable PTT key value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PttKeyParseError(String);

impl fmt::Display for PttKeyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "invalid ptt key {:?}, expected \"any\" or a key code",
            self.0
        ))
    }
}

impl std::error::Error for PttKeyParseError {}

impl FromStr for PttKey {
    type Err = PttKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("any") {
            return Ok(PttKey::Any);
        }
        s.parse::<u16>()
            .map(PttKey::Code)
            .map_err(|_| PttKeyParseError(s.to_string()))
    }
}

/// Configuration of the PTT subsystem.
#[derive(Debug, Clone)]
pub struct PttConfig {
    /// Bridge interface voice traffic is sent and received on.
    pub iface: String,
    pub group: Ipv4Addr,
    pub port: u16,
    pub key: PttKey,
    /// When set, our own frames are played back locally as well.
    pub loopback: bool,
    /// Name of the HID button device.
    pub device: String,
}

/// A fatal PTT error. Any of these aborts the subsystem during bootstrap.
#[derive(Debug)]
pub enum PttError {
    Io(io::Error),
    Codec(opus::Error),
    NoInputDevice,
    NoOutputDevice,
    HidDeviceNotFound(String),
    BuildStream(cpal::BuildStreamError),
    PlayStream(cpal::PlayStreamError),
    PauseStream(cpal::PauseStreamError),
}

impl fmt::Display for PttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PttError::Io(e) => f.write_fmt(format_args!("ptt io error: {e}")),
            PttError::Codec(e) => f.write_fmt(format_args!("opus codec error: {e}")),
            PttError::NoInputDevice => f.write_str("no audio input device available"),
            PttError::NoOutputDevice => f.write_str("no audio output device available"),
            PttError::HidDeviceNotFound(name) => {
                f.write_fmt(format_args!("ptt input device {name:?} not found"))
            }
            PttError::BuildStream(e) => f.write_fmt(format_args!("failed to open audio stream: {e}")),
            PttError::PlayStream(e) => f.write_fmt(format_args!("failed to start audio stream: {e}")),
            PttError::PauseStream(e) => f.write_fmt(format_args!("failed to pause audio stream: {e}")),
        }
    }
}

impl std::error::Error for PttError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PttError::Io(e) => Some(e),
            PttError::Codec(e) => Some(e),
            PttError::BuildStream(e) => Some(e),
            PttError::PlayStream(e) => Some(e),
            PttError::PauseStream(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PttError {
    fn from(e: io::Error) -> Self {
        PttError::Io(e)
    }
}

impl From<opus::Error> for PttError {
    fn from(e: opus::Error) -> Self {
        PttError::Codec(e)
    }
}

/// Transmit state shared between the HID monitor and session shutdown.
struct SessionState {
    /// Whether the microphone is currently armed. Press and release are idempotent under this
    /// lock, and the lock is held across the whole transition so a new stream can never start
    /// before the previous one stopped.
    broadcasting: tokio::sync::Mutex<bool>,
    playback: Arc<PlaybackQueue>,
    control: Mutex<mpsc::Sender<AudioCommand>>,
    start_tone: Vec<f32>,
    stop_tone: Vec<f32>,
}

impl SessionState {
    fn send_control(&self, command: AudioCommand) -> bool {
        self.control.lock().unwrap().send(command).is_ok()
    }

    /// Button pressed: feedback tone, then arm the microphone. A press while transmitting is
    /// ignored.
    async fn press(&self) {
        let mut broadcasting = self.broadcasting.lock().await;
        if *broadcasting {
            debug!("press ignored, already transmitting");
            return;
        }

        self.playback.clear();
        self.playback.push(self.start_tone.clone());
        tokio::time::sleep(TONE_LEAD_IN).await;

        if self.send_control(AudioCommand::StartMic) {
            *broadcasting = true;
            debug!("transmission started");
        } else {
            error!("audio pipeline gone, cannot start transmission");
        }
    }

    /// Button released: disarm the microphone, then feedback tone. A release while idle is
    /// ignored.
    async fn release(&self) {
        let mut broadcasting = self.broadcasting.lock().await;
        if !*broadcasting {
            debug!("release ignored, not transmitting");
            return;
        }

        if !self.send_control(AudioCommand::StopMic) {
            error!("audio pipeline gone, cannot stop transmission");
        }
        self.playback.clear();
        self.playback.push(self.stop_tone.clone());
        *broadcasting = false;
        debug!("transmission stopped");
    }
}

/// A running PTT session.
pub struct PttSession {
    shutdown: Shutdown,
    control: mpsc::Sender<AudioCommand>,
    audio_thread: Option<std::thread::JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PttSession {
    /// Bring up the whole pipeline: codec, sockets, HID device and audio streams. Any failure
    /// here aborts the subsystem.
    ///
    /// `local_ip` is the bridge IPv4 address; the send socket binds to it so frames egress the
    /// mesh bridge, and the receive socket joins the group on that interface.
    pub async fn start(config: PttConfig, local_ip: Ipv4Addr) -> Result<Self, PttError> {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;
        encoder.set_bitrate(opus::Bitrate::Bits(TARGET_BITRATE))?;
        encoder.set_complexity(ENCODER_COMPLEXITY)?;
        encoder.set_inband_fec(true)?;
        encoder.set_packet_loss_perc(PACKET_LOSS_PERC)?;
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)?;

        // Sender bound to the bridge address so the kernel picks the right egress interface.
        let send_socket = UdpSocket::bind(SocketAddr::from((local_ip, 0)))?;
        send_socket.connect(SocketAddr::from((config.group, config.port)))?;

        let recv_socket =
            tokio::net::UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)))
                .await?;
        recv_socket.join_multicast_v4(config.group, local_ip)?;
        debug!(group = %config.group, port = config.port, iface_ip = %local_ip, "joined multicast group");

        let device = hid::find_ptt_device(&config.device)?;

        let playback = Arc::new(PlaybackQueue::new(PLAYBACK_QUEUE_FRAMES));
        let pipeline: AudioPipeline = audio::spawn(playback.clone(), encoder, send_socket)?;

        let state = Arc::new(SessionState {
            broadcasting: tokio::sync::Mutex::new(false),
            playback,
            control: Mutex::new(pipeline.control.clone()),
            start_tone: tones::tone_frame(START_TONE_HZ),
            stop_tone: tones::tone_frame(STOP_TONE_HZ),
        });

        let shutdown = Shutdown::new();
        let tasks = vec![
            tokio::spawn(receive_loop(
                recv_socket,
                decoder,
                state.clone(),
                config.loopback,
                local_ip,
                shutdown.subscribe(),
            )),
            tokio::spawn(monitor_button(
                device,
                config.key,
                state.clone(),
                shutdown.subscribe(),
            )),
        ];

        info!(group = %config.group, port = config.port, "PTT session running");
        Ok(Self {
            shutdown,
            control: pipeline.control,
            audio_thread: Some(pipeline.thread),
            tasks,
        })
    }

    /// Stop every loop and release sockets, streams and codec state. Each release step runs
    /// regardless of earlier failures.
    pub async fn stop(mut self) {
        self.shutdown.trigger();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        let _ = self.control.send(AudioCommand::Shutdown);
        if let Some(thread) = self.audio_thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }

        info!("PTT session stopped");
    }
}

/// Always-running receive side: multicast in, decode, queue towards the speaker.
async fn receive_loop(
    socket: tokio::net::UdpSocket,
    mut decoder: opus::Decoder,
    state: Arc<SessionState>,
    loopback: bool,
    local_ip: Ipv4Addr,
    mut shutdown: ShutdownListener,
) {
    let mut buf = [0u8; 1500];
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        error!(err = %e, "multicast receive failed");
                        continue;
                    }
                };

                // Without loopback enabled, discard our own frames reflected by the kernel.
                if !loopback && (src.ip().is_loopback() || src.ip() == IpAddr::V4(local_ip)) {
                    continue;
                }

                let mut pcm = vec![0i16; FRAME_SIZE];
                let decoded = match decoder.decode(&buf[..len], &mut pcm, false) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        debug!(src = %src, err = %e, "undecodable voice frame");
                        continue;
                    }
                };

                let frame: Vec<f32> = pcm[..decoded]
                    .iter()
                    .map(|&sample| sample as f32 / 32768.0)
                    .collect();
                if !state.playback.push(frame) {
                    warn!(src = %src, "playback queue full, dropping frame");
                }
            }
        }
    }
    debug!("receive loop stopped");
}

/// Watch the HID device for key events and drive the transmit state.
async fn monitor_button(
    device: evdev::Device,
    key: PttKey,
    state: Arc<SessionState>,
    mut shutdown: ShutdownListener,
) {
    let mut events = match device.into_event_stream() {
        Ok(events) => events,
        Err(e) => {
            error!(err = %e, "failed to open HID event stream");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.next_event() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        error!(err = %e, "HID read failed");
                        continue;
                    }
                };
                if event.event_type() != evdev::EventType::KEY {
                    continue;
                }
                let matches = match key {
                    PttKey::Any => true,
                    PttKey::Code(code) => event.code() == code,
                };
                if !matches {
                    continue;
                }

                match event.value() {
                    1 => state.press().await,
                    0 => state.release().await,
                    // Key autorepeat, irrelevant for hold-to-talk.
                    _ => {}
                }
            }
        }
    }
    debug!("HID monitor stopped");
}
