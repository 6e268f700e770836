//! Sample-rate conversion from the device rate down to the 16 kHz pipeline.
//!
//! With the `high-quality-audio` feature a rubato FFT resampler handles the
//! conversion; otherwise a streaming linear interpolator keeps latency and
//! dependencies minimal. Both paths are mono in, mono out.

#[cfg(feature = "high-quality-audio")]
use rubato::{FftFixedIn, Resampler as _};

#[cfg(feature = "high-quality-audio")]
const FFT_CHUNK_SAMPLES: usize = 1024;
#[cfg(feature = "high-quality-audio")]
const FFT_SUB_CHUNKS: usize = 2;

enum Inner {
    Passthrough,
    Linear {
        ratio: f64,
        position: f64,
        previous: f32,
        primed: bool,
    },
    #[cfg(feature = "high-quality-audio")]
    Fft {
        resampler: FftFixedIn<f32>,
        pending: Vec<f32>,
    },
}

/// Streaming mono resampler fed from the capture callback.
pub struct Resampler {
    inner: Inner,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        if input_rate == output_rate {
            return Self {
                inner: Inner::Passthrough,
            };
        }

        #[cfg(feature = "high-quality-audio")]
        if let Ok(resampler) = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            FFT_CHUNK_SAMPLES,
            FFT_SUB_CHUNKS,
            1,
        ) {
            return Self {
                inner: Inner::Fft {
                    resampler,
                    pending: Vec::new(),
                },
            };
        }

        Self {
            inner: Inner::Linear {
                ratio: f64::from(input_rate) / f64::from(output_rate),
                position: 0.0,
                previous: 0.0,
                primed: false,
            },
        }
    }

    /// Convert one block of input samples, appending output samples.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        match &mut self.inner {
            Inner::Passthrough => output.extend_from_slice(input),
            Inner::Linear {
                ratio,
                position,
                previous,
                primed,
            } => {
                if input.is_empty() {
                    return;
                }
                let len = input.len();
                // Virtual index -1 holds the last sample of the previous
                // block so interpolation is continuous across calls.
                let at = |i: isize| -> f32 {
                    if i < 0 {
                        if *primed {
                            *previous
                        } else {
                            input[0]
                        }
                    } else {
                        input[(i as usize).min(len - 1)]
                    }
                };
                while *position <= (len - 1) as f64 {
                    let base = position.floor();
                    let frac = (*position - base) as f32;
                    let i = base as isize;
                    let left = at(i);
                    let right = at(i + 1);
                    output.push(left + (right - left) * frac);
                    *position += *ratio;
                }
                *position -= len as f64;
                *previous = input[len - 1];
                *primed = true;
            }
            #[cfg(feature = "high-quality-audio")]
            Inner::Fft { resampler, pending } => {
                pending.extend_from_slice(input);
                while pending.len() >= FFT_CHUNK_SAMPLES {
                    let chunk: Vec<f32> = pending.drain(..FFT_CHUNK_SAMPLES).collect();
                    match resampler.process(&[chunk]) {
                        Ok(mut channels) => {
                            if let Some(channel) = channels.pop() {
                                output.extend(channel);
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    }
}
