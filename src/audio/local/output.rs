use std::{
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use rodio::{
    Decoder, Device, DeviceTrait, OutputStream, OutputStreamBuilder, Sink, Source,
    cpal::{
        BufferSize, SampleFormat, SampleRate, StreamConfig, default_host, traits::HostTrait,
    },
};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};

use crate::audio::error::PlayerError;
use crate::util::sync::lock;

use super::element::{ElementEvent, ElementEvents, MediaElement, MediaInput, fetch_bytes};

pub fn setup_device_config() -> Result<(Device, StreamConfig, SampleFormat), PlayerError> {
    let host = default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::Device("no default output device".to_string()))?;

    let best = device
        .supported_output_configs()
        .ok()
        .and_then(|configs| configs.max_by_key(|cfg| cfg.max_sample_rate().0));

    let (config, sample_format) = match best {
        Some(default_config) => (
            StreamConfig {
                channels: default_config.channels(),
                sample_rate: default_config.max_sample_rate(),
                buffer_size: BufferSize::Fixed(4096),
            },
            default_config.sample_format(),
        ),
        None => (
            StreamConfig {
                channels: 2,
                sample_rate: SampleRate(48000),
                buffer_size: BufferSize::Fixed(4096),
            },
            SampleFormat::F32,
        ),
    };

    Ok((device, config, sample_format))
}

pub fn construct_sink(
    device: Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
) -> Result<(OutputStream, Sink), PlayerError> {
    let stream = OutputStreamBuilder::default()
        .with_buffer_size(config.buffer_size)
        .with_sample_rate(config.sample_rate.0)
        .with_device(device)
        .with_sample_format(sample_format)
        .open_stream_or_fallback()
        .map_err(|e| PlayerError::Device(e.to_string()))?;
    let mixer = stream.mixer();
    let sink = Sink::connect_new(mixer);

    Ok((stream, sink))
}

fn decode(data: Arc<[u8]>) -> Result<Decoder<Cursor<Arc<[u8]>>>, PlayerError> {
    let byte_len = data.len() as u64;
    Decoder::builder()
        .with_data(Cursor::new(data))
        .with_byte_len(byte_len)
        .with_seekable(true)
        .with_gapless(true)
        .build()
        .map_err(|e| PlayerError::Decode(e.to_string()))
}

#[derive(Default)]
struct Shared {
    generation: AtomicU64,
    want_play: AtomicBool,
    ready: AtomicBool,
    playing: AtomicBool,
    looping: AtomicBool,
    alive: AtomicBool,
    media: Mutex<Option<Arc<[u8]>>>,
}

impl Shared {
    /// Queues the current media again from the start.
    fn requeue(&self, sink: &Sink) -> bool {
        let Some(data) = lock(&self.media).clone() else {
            return false;
        };
        match decode(data) {
            Ok(source) => {
                sink.append(source);
                true
            }
            Err(e) => {
                warn!(error = %e, "rodio_requeue_failed");
                false
            }
        }
    }
}

/// Media element on top of a rodio sink on the default output device.
pub struct RodioElement {
    _stream: OutputStream,
    sink: Arc<Sink>,
    events: ElementEvents,
    http: reqwest::Client,
    runtime: Handle,
    shared: Arc<Shared>,
    load_task: Option<JoinHandle<()>>,
    tick: Duration,
}

impl RodioElement {
    /// Must be called from within a tokio runtime. Position is reported
    /// every `tick` while playing.
    pub fn new(
        events: ElementEvents,
        http: reqwest::Client,
        tick: Duration,
    ) -> Result<Self, PlayerError> {
        let (device, stream_config, sample_format) = setup_device_config()?;
        let (stream, sink) = construct_sink(device, &stream_config, sample_format)?;
        sink.pause();

        let element = Self {
            _stream: stream,
            sink: Arc::new(sink),
            events,
            http,
            runtime: Handle::current(),
            shared: Arc::new(Shared {
                alive: AtomicBool::new(true),
                ..Default::default()
            }),
            load_task: None,
            tick,
        };

        element.start_monitor();
        Ok(element)
    }

    fn start_monitor(&self) {
        let sink = self.sink.clone();
        let shared = self.shared.clone();
        let events = self.events.clone();
        let tick = self.tick;

        thread::spawn(move || {
            while shared.alive.load(Ordering::Relaxed) {
                if shared.playing.load(Ordering::Relaxed) {
                    events.emit(ElementEvent::TimeUpdate(sink.get_pos().as_secs_f64()));

                    if sink.empty() {
                        if shared.looping.load(Ordering::Relaxed) && shared.requeue(&sink) {
                            continue;
                        }
                        shared.playing.store(false, Ordering::Relaxed);
                        shared.want_play.store(false, Ordering::Relaxed);
                        events.emit(ElementEvent::Pause { at_end: true });
                    }
                }

                thread::sleep(tick);
            }
        });
    }
}

impl MediaElement for RodioElement {
    fn load(&mut self, input: MediaInput) {
        self.unload();

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = self.shared.clone();
        let sink = self.sink.clone();
        let events = self.events.clone();
        let http = self.http.clone();

        self.load_task = Some(self.runtime.spawn(async move {
            let data = match input {
                MediaInput::File(path) => tokio::fs::read(&path)
                    .await
                    .map(Arc::<[u8]>::from)
                    .map_err(PlayerError::from),
                MediaInput::Remote(source) => fetch_bytes(&http, &source).await,
                MediaInput::Blob(data) => Ok(data),
            };

            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    if shared.generation.load(Ordering::SeqCst) == generation {
                        events.emit(ElementEvent::Error(e.to_string()));
                    }
                    return;
                }
            };

            let decoded = {
                let data = data.clone();
                tokio::task::spawn_blocking(move || decode(data)).await
            };
            let source = match decoded {
                Ok(Ok(source)) => Ok(source),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(PlayerError::Decode(e.to_string())),
            };

            if shared.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "rodio_load_superseded");
                return;
            }

            let source = match source {
                Ok(source) => source,
                Err(e) => {
                    events.emit(ElementEvent::Error(e.to_string()));
                    return;
                }
            };

            if let Some(total) = source.total_duration() {
                events.emit(ElementEvent::DurationChange(total.as_secs_f64()));
            }

            *lock(&shared.media) = Some(data);
            sink.append(source);
            shared.ready.store(true, Ordering::SeqCst);

            if shared.want_play.load(Ordering::SeqCst) {
                sink.play();
                shared.playing.store(true, Ordering::SeqCst);
                events.emit(ElementEvent::Playing);
            }
        }));
    }

    fn play(&mut self) {
        self.shared.want_play.store(true, Ordering::SeqCst);
        if !self.shared.ready.load(Ordering::SeqCst) {
            self.events.emit(ElementEvent::Waiting);
            return;
        }
        if self.sink.empty() && !self.shared.requeue(&self.sink) {
            self.events.emit(ElementEvent::Error("media is no longer available".to_string()));
            return;
        }
        self.sink.play();
        self.shared.playing.store(true, Ordering::SeqCst);
        self.events.emit(ElementEvent::Playing);
    }

    fn pause(&mut self) {
        let was_active = self.shared.want_play.swap(false, Ordering::SeqCst);
        self.sink.pause();
        self.shared.playing.store(false, Ordering::SeqCst);
        if was_active {
            self.events.emit(ElementEvent::Pause { at_end: false });
        }
    }

    fn seek(&mut self, seconds: f64) -> Result<(), PlayerError> {
        if !self.shared.ready.load(Ordering::SeqCst) {
            return Err(PlayerError::NotReady);
        }
        self.sink
            .try_seek(Duration::from_secs_f64(seconds.max(0.0)))
            .map_err(|e| PlayerError::Decode(e.to_string()))?;
        self.events.emit(ElementEvent::TimeUpdate(seconds));
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.sink.set_volume(volume);
    }

    fn set_speed(&mut self, speed: f32) {
        self.sink.set_speed(speed);
    }

    fn set_loop(&mut self, looping: bool) -> Result<(), PlayerError> {
        self.shared.looping.store(looping, Ordering::SeqCst);
        Ok(())
    }

    fn set_sink_id(&mut self, _device: &str) -> Result<(), PlayerError> {
        Err(PlayerError::Unsupported("output device selection"))
    }

    fn unload(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        self.shared.want_play.store(false, Ordering::SeqCst);
        self.shared.ready.store(false, Ordering::SeqCst);
        self.shared.playing.store(false, Ordering::SeqCst);
        *lock(&self.shared.media) = None;
        self.sink.stop();
        self.sink.pause();
    }
}

impl Drop for RodioElement {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Relaxed);
        self.unload();
    }
}
