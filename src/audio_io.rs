// src/audio_io.rs

use crate::audio_engine::{EngineHandle, LoopEngine};
use crate::control::ControlSurface;
use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, FromSample, Sample, SampleFormat, Stream, StreamConfig};
use log::{info, warn};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

/// Capacity of the input-to-output transfer ring, in interleaved samples.
const INPUT_RING_CAPACITY: usize = 1 << 16;

pub struct AudioStreams {
    // Held only to keep the callbacks registered; dropping deactivates
    // them before the rest of the daemon is torn down.
    _input: Stream,
    _output: Stream,
    pub sample_rate: u32,
}

/// Opens the configured full-duplex pair and starts the loop engine inside
/// the output callback. The input callback feeds interleaved stereo into a
/// ring; the output callback drains one period, runs the engine, and
/// re-interleaves.
pub fn init_and_run_streams(
    host_name: Option<&str>,
    input_device_name: Option<&str>,
    output_device_name: Option<&str>,
    requested_sample_rate: Option<u32>,
    requested_buffer_size: Option<u32>,
    surface: ControlSurface,
) -> Result<(AudioStreams, EngineHandle)> {
    let host = match host_name {
        Some(name) => {
            let id = cpal::available_hosts()
                .into_iter()
                .find(|id| id.name().eq_ignore_ascii_case(name))
                .ok_or_else(|| anyhow::anyhow!("Audio host not found: {}", name))?;
            cpal::host_from_id(id)?
        }
        None => cpal::default_host(),
    };

    let input_device = if let Some(name) = input_device_name {
        host.input_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| anyhow::anyhow!("Input device not found: {}", name))?
    } else {
        host.default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No default input device"))?
    };
    let output_device = if let Some(name) = output_device_name {
        host.output_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| anyhow::anyhow!("Output device not found: {}", name))?
    } else {
        host.default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No default output device"))?
    };
    info!("Using input device: {}", input_device.name()?);
    info!("Using output device: {}", output_device.name()?);

    let default_input_config = input_device.default_input_config()?;
    let default_output_config = output_device.default_output_config()?;
    let sample_format = default_output_config.sample_format();

    let mut input_config: StreamConfig = default_input_config.into();
    let mut output_config: StreamConfig = default_output_config.into();
    for config in [&mut input_config, &mut output_config] {
        if let Some(sr) = requested_sample_rate {
            config.sample_rate = cpal::SampleRate(sr);
        }
        if let Some(bs) = requested_buffer_size {
            config.buffer_size = BufferSize::Fixed(bs);
        }
    }

    let sample_rate = output_config.sample_rate.0;
    let (engine, handle) = LoopEngine::new(surface, sample_rate);

    let ring = HeapRb::<f32>::new(INPUT_RING_CAPACITY);
    let (producer, consumer) = ring.split();

    fn run<T>(
        input_device: &Device,
        input_config: &StreamConfig,
        output_device: &Device,
        output_config: &StreamConfig,
        producer: HeapProducer<f32>,
        consumer: HeapConsumer<f32>,
        engine: LoopEngine,
    ) -> Result<(Stream, Stream)>
    where
        T: Sample + cpal::SizedSample + FromSample<f32>,
        f32: FromSample<T>,
    {
        let input_stream = build_input_stream::<T>(input_device, input_config, producer)?;
        let output_stream = build_output_stream::<T>(output_device, output_config, consumer, engine)?;
        input_stream.play()?;
        output_stream.play()?;
        Ok((input_stream, output_stream))
    }

    let (input_stream, output_stream) = match sample_format {
        SampleFormat::F32 => run::<f32>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            producer,
            consumer,
            engine,
        )?,
        SampleFormat::I16 => run::<i16>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            producer,
            consumer,
            engine,
        )?,
        SampleFormat::U16 => run::<u16>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            producer,
            consumer,
            engine,
        )?,
        format => return Err(anyhow::anyhow!("Unsupported sample format {}", format)),
    };

    info!("Streams running at {} Hz", sample_rate);
    Ok((
        AudioStreams {
            _input: input_stream,
            _output: output_stream,
            sample_rate,
        },
        handle,
    ))
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProducer<f32>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let err_fn = |err| warn!("input stream error: {}", err);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                // Fold whatever the device delivers down to a stereo pair;
                // a mono input feeds both sides.
                let left = f32::from_sample(frame[0]);
                let right = if channels > 1 {
                    f32::from_sample(frame[1])
                } else {
                    left
                };
                if producer.push(left).is_err() || producer.push(right).is_err() {
                    // Ring full: the output side stalled, drop the frame.
                }
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
    mut consumer: HeapConsumer<f32>,
    mut engine: LoopEngine,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let err_fn = |err| warn!("output stream error: {}", err);

    let mut in_l: Vec<f32> = Vec::new();
    let mut in_r: Vec<f32> = Vec::new();
    let mut out_l: Vec<f32> = Vec::new();
    let mut out_r: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let nframes = data.len() / channels;
            in_l.resize(nframes, 0.0);
            in_r.resize(nframes, 0.0);
            out_l.resize(nframes, 0.0);
            out_r.resize(nframes, 0.0);

            for i in 0..nframes {
                in_l[i] = consumer.pop().unwrap_or(0.0);
                in_r[i] = consumer.pop().unwrap_or(0.0);
            }

            engine.process(&in_l, &in_r, &mut out_l, &mut out_r);

            for (i, frame) in data.chunks_mut(channels).enumerate() {
                frame[0] = T::from_sample(out_l[i]);
                if channels > 1 {
                    frame[1] = T::from_sample(out_r[i]);
                }
                for sample in frame.iter_mut().skip(2) {
                    *sample = T::from_sample(0.0f32);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
