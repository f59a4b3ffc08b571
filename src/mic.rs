//! Microphone loudness as a beam trigger.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};

use desktop_stickman::error::TriggerError;
use desktop_stickman::workers::{rms, LevelMeter, LoudnessTrigger, TriggerSource};

/// Default input device feeding a [`LoudnessTrigger`].
///
/// The stream lives as long as this value, so it has to be built on the
/// thread that polls it.
pub struct Microphone {
    _stream: Stream,
    trigger: LoudnessTrigger,
}

impl Microphone {
    pub fn open(threshold: f32) -> Result<Self, TriggerError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| TriggerError::Source("no input device".into()))?;
        let config = device
            .default_input_config()
            .map_err(|e| TriggerError::Source(e.to_string()))?;

        let meter = LevelMeter::new();
        let on_error = |err: cpal::StreamError| bevy::log::warn!("microphone stream error: {err}");
        let stream = match config.sample_format() {
            SampleFormat::F32 => {
                let meter = meter.clone();
                device.build_input_stream(
                    &config.into(),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| meter.record(rms(data)),
                    on_error,
                    None,
                )
            }
            SampleFormat::I16 => {
                let meter = meter.clone();
                device.build_input_stream(
                    &config.into(),
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let samples: Vec<f32> =
                            data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                        meter.record(rms(&samples));
                    },
                    on_error,
                    None,
                )
            }
            other => {
                return Err(TriggerError::Source(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        }
        .map_err(|e| TriggerError::Source(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TriggerError::Source(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            trigger: LoudnessTrigger::new(meter, threshold),
        })
    }
}

impl TriggerSource for Microphone {
    fn detect(&mut self) -> Result<bool, TriggerError> {
        self.trigger.detect()
    }
}
