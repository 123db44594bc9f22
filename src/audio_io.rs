// src/audio_io.rs

use crate::audio_device::host_id_from_name;
use crate::audio_engine::helpers::{Frame, SILENT_FRAME};
use crate::audio_engine::processor::BlockProcessor;
use crate::settings::LooperSettings;
use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, FromSample, HostId, Sample, SampleFormat, Stream, StreamConfig};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Input blocks queued beyond this many are dropped to keep latency down.
const MAX_QUEUED_BLOCKS: usize = 4;

/// Something that can drive a [`BlockProcessor`] with audio blocks.
pub trait AudioBackend: Send + Sync {
    /// Runs one playback session and returns once the processor's
    /// transport raised its stop event.
    fn run_session(&self, processor: BlockProcessor) -> Result<()>;
}

/// Sound card backend. Opens fresh cpal streams for every session.
pub struct CpalBackend {
    host_id: HostId,
    input_device: Option<String>,
    output_device: Option<String>,
    sample_rate: u32,
    buffer_size: Option<u32>,
    xrun_count: Arc<AtomicUsize>,
}

impl CpalBackend {
    pub fn from_settings(settings: &LooperSettings) -> Result<Self> {
        Ok(Self {
            host_id: host_id_from_name(settings.host_name.as_deref())?,
            input_device: settings.input_device.clone(),
            output_device: settings.output_device.clone(),
            sample_rate: settings.sample_rate,
            buffer_size: settings.buffer_size,
            xrun_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn xrun_count(&self) -> usize {
        self.xrun_count.load(Ordering::Relaxed)
    }
}

impl AudioBackend for CpalBackend {
    fn run_session(&self, processor: BlockProcessor) -> Result<()> {
        let transport = processor.transport().clone();
        let (input_stream, output_stream) = init_and_run_streams(
            self.host_id,
            self.input_device.as_deref(),
            self.output_device.as_deref(),
            self.sample_rate,
            self.buffer_size,
            processor,
            self.xrun_count.clone(),
        )?;
        transport.stop_signal.wait();
        drop(output_stream);
        drop(input_stream);
        Ok(())
    }
}

fn find_device(host: &cpal::Host, name: Option<&str>, input: bool) -> Result<Device> {
    let kind = if input { "input" } else { "output" };
    match name {
        Some(name) => {
            let mut devices = if input {
                host.input_devices()?
            } else {
                host.output_devices()?
            };
            devices
                .find(|d| d.name().ok().as_deref() == Some(name))
                .ok_or_else(|| anyhow::anyhow!("{} device not found: {}", kind, name))
        }
        None => {
            let device = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            device.ok_or_else(|| anyhow::anyhow!("No default {} device", kind))
        }
    }
}

pub fn init_and_run_streams(
    host_id: HostId,
    input_device_name: Option<&str>,
    output_device_name: Option<&str>,
    sample_rate: u32,
    requested_buffer_size: Option<u32>,
    processor: BlockProcessor,
    xrun_count: Arc<AtomicUsize>,
) -> Result<(Stream, Stream)> {
    let host = cpal::host_from_id(host_id)?;
    let input_device = find_device(&host, input_device_name, true)?;
    let output_device = find_device(&host, output_device_name, false)?;
    log::debug!("Using input device: {}", input_device.name()?);
    log::debug!("Using output device: {}", output_device.name()?);

    let input_default = input_device.default_input_config()?;
    let output_default = output_device.default_output_config()?;
    let input_format = supported_format(input_default.sample_format(), "input")?;
    let output_format = supported_format(output_default.sample_format(), "output")?;
    log::debug!("Sample formats: input {}, output {}", input_format, output_format);

    let mut input_config: StreamConfig = input_default.into();
    let mut output_config: StreamConfig = output_default.into();
    for config in [&mut input_config, &mut output_config] {
        config.sample_rate = cpal::SampleRate(sample_rate);
        if let Some(bs) = requested_buffer_size {
            config.buffer_size = BufferSize::Fixed(bs);
        }
    }

    let queue = HeapRb::<Frame>::new((sample_rate as usize).max(1024));
    let (producer, consumer) = queue.split();

    let input_stream = match input_format {
        SampleFormat::I16 => build_input_stream::<i16>(&input_device, &input_config, producer, xrun_count.clone())?,
        SampleFormat::U16 => build_input_stream::<u16>(&input_device, &input_config, producer, xrun_count.clone())?,
        _ => build_input_stream::<f32>(&input_device, &input_config, producer, xrun_count.clone())?,
    };
    let output_stream = match output_format {
        SampleFormat::I16 => build_output_stream::<i16>(&output_device, &output_config, consumer, processor, xrun_count)?,
        SampleFormat::U16 => build_output_stream::<u16>(&output_device, &output_config, consumer, processor, xrun_count)?,
        _ => build_output_stream::<f32>(&output_device, &output_config, consumer, processor, xrun_count)?,
    };
    input_stream.play()?;
    output_stream.play()?;

    log::debug!(
        "Streams running at {} Hz, buffer size {:?}",
        output_config.sample_rate.0,
        output_config.buffer_size
    );
    Ok((input_stream, output_stream))
}

/// The sample formats the streams convert from and to. Each device is
/// opened in its own default format.
fn supported_format(format: SampleFormat, kind: &str) -> Result<SampleFormat> {
    match format {
        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16 => Ok(format),
        format => Err(anyhow::anyhow!("Unsupported {} sample format {}", kind, format)),
    }
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProducer<Frame>,
    xrun_count: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample,
    i16: FromSample<T>,
{
    let err_fn = move |err| {
        log::error!("an error occurred on input stream: {}", err);
        xrun_count.fetch_add(1, Ordering::Relaxed);
    };
    let channels = config.channels as usize;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let left = i16::from_sample(frame[0]);
                let right = frame.get(1).map_or(left, |s| i16::from_sample(*s));
                // a full queue drops the frame
                let _ = producer.push([left, right]);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapConsumer<Frame>,
    mut processor: BlockProcessor,
    xrun_count: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<i16>,
{
    let channels = config.channels as usize;
    let err_fn = move |err| {
        log::error!("an error occurred on output stream: {}", err);
        xrun_count.fetch_add(1, Ordering::Relaxed);
    };
    let mut input_block: Vec<Frame> = vec![];
    let mut output_block: Vec<Frame> = vec![];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            input_block.resize(frames, SILENT_FRAME);
            output_block.resize(frames, SILENT_FRAME);

            if consumer.len() > frames * MAX_QUEUED_BLOCKS {
                consumer.skip(consumer.len() - frames);
            }
            let read = consumer.pop_slice(&mut input_block);
            input_block[read..].fill(SILENT_FRAME);

            processor.process(&input_block, &mut output_block);
            for (frame, out) in data.chunks_mut(channels).zip(output_block.iter()) {
                for (c, sample) in frame.iter_mut().enumerate() {
                    *sample = T::from_sample(out[c.min(1)]);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Backend without a sound card: the caller pushes audio through the open
/// session by hand. Sessions block until the transport stops, like a real
/// device would.
pub struct ManualBackend {
    block_size: usize,
    slot: Mutex<Option<BlockProcessor>>,
    cond: Condvar,
}

impl ManualBackend {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Waits until a session whose transport is still running is open.
    pub fn wait_for_session(&self, timeout: Duration) -> bool {
        fn running(slot: &Option<BlockProcessor>) -> bool {
            slot.as_ref().is_some_and(|p| !p.transport().is_stopped())
        }
        let guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |slot| !running(slot))
            .unwrap_or_else(|e| e.into_inner());
        running(&guard)
    }

    /// Feeds `input` through the open session in blocks of `block_size`
    /// frames and returns what was played. `None` when no session is open.
    pub fn process(&self, input: &[Frame]) -> Option<Vec<Frame>> {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let processor = guard.as_mut()?;
        let mut output = vec![SILENT_FRAME; input.len()];
        for (inp, out) in input
            .chunks(self.block_size)
            .zip(output.chunks_mut(self.block_size))
        {
            processor.process(inp, out);
        }
        Some(output)
    }

    /// Plays `frames` frames of silent input.
    pub fn process_silence(&self, frames: usize) -> Option<Vec<Frame>> {
        self.process(&vec![SILENT_FRAME; frames])
    }
}

impl AudioBackend for ManualBackend {
    fn run_session(&self, processor: BlockProcessor) -> Result<()> {
        let transport = processor.transport().clone();
        {
            let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(processor);
            self.cond.notify_all();
        }
        transport.stop_signal.wait();
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        self.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::song::Song;
    use crate::audio_engine::tests_support::silent_drum;
    use crate::audio_engine::transport::LoopTransport;
    use crate::looper::SharedLooperState;
    use std::thread;

    #[test]
    fn each_device_keeps_its_own_sample_format() {
        assert_eq!(supported_format(SampleFormat::I16, "input").unwrap(), SampleFormat::I16);
        assert_eq!(supported_format(SampleFormat::F32, "output").unwrap(), SampleFormat::F32);
        assert_eq!(supported_format(SampleFormat::U16, "input").unwrap(), SampleFormat::U16);
        let err = supported_format(SampleFormat::I8, "input").unwrap_err();
        assert!(err.to_string().contains("input"));
    }

    #[test]
    fn manual_session_runs_until_the_transport_stops() {
        let backend = Arc::new(ManualBackend::new(64));
        assert!(backend.process_silence(64).is_none());

        let transport = Arc::new(LoopTransport::new(silent_drum(), 0));
        let processor = BlockProcessor::new(
            Arc::new(Mutex::new(Song::new(1, 1000))),
            transport.clone(),
            SharedLooperState::new(),
            Arc::new(AtomicUsize::new(0)),
        );
        let session = {
            let backend = backend.clone();
            thread::spawn(move || backend.run_session(processor))
        };

        assert!(backend.wait_for_session(Duration::from_secs(5)));
        let out = backend.process_silence(200).unwrap();
        assert_eq!(out.len(), 200);
        assert_eq!(transport.idx(), 200);

        transport.stop_now();
        session.join().unwrap().unwrap();
        assert!(backend.process_silence(64).is_none());
        assert!(!backend.wait_for_session(Duration::from_millis(1)));
    }
}
