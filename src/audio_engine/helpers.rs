// FILE: src\audio_engine\helpers.rs
// =================================

use anyhow::{bail, Context, Result};
use hound;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs::File;
use std::io::BufReader;
use std::ops::Range;
use std::path::Path;

/// One stereo frame of 16-bit PCM, `[left, right]`.
pub type Frame = [i16; 2];

pub const SILENT_FRAME: Frame = [0, 0];

/// Splits an access of `data_len` frames starting at `idx` into at most two
/// contiguous ranges of a buffer holding `buff_len` frames.
pub fn calc_slices(
    buff_len: usize,
    data_len: usize,
    idx: usize,
) -> (Range<usize>, Option<Range<usize>>) {
    debug_assert!(
        0 < data_len && data_len <= buff_len,
        "must be 0 < data_len {} <= buff_len {}",
        data_len,
        buff_len
    );
    let idx1 = idx % buff_len;
    let idx2 = (idx + data_len) % buff_len;
    if idx2 > idx1 {
        (idx1..idx2, None)
    } else {
        (idx1..buff_len, Some(0..idx2))
    }
}

#[inline]
pub fn mix_frame(dst: &mut Frame, src: &Frame) {
    dst[0] = dst[0].saturating_add(src[0]);
    dst[1] = dst[1].saturating_add(src[1]);
}

#[inline]
fn mix_slice(dst: &mut [Frame], src: &[Frame]) {
    for (d, s) in dst.iter_mut().zip(src) {
        mix_frame(d, s);
    }
}

/// Adds `data` into `buff` at `idx`, wrapping over the end of `buff`.
pub fn record_wrapped(buff: &mut [Frame], data: &[Frame], idx: usize) {
    let len = buff.len();
    if len == 0 {
        return;
    }
    // a block longer than the whole buffer wraps more than once
    for (k, chunk) in data.chunks(len).enumerate() {
        let (first, second) = calc_slices(len, chunk.len(), idx + k * len);
        let split = first.len();
        mix_slice(&mut buff[first], &chunk[..split]);
        if let Some(second) = second {
            mix_slice(&mut buff[second], &chunk[split..]);
        }
    }
}

/// Adds the content of `buff` at `idx` into `out`, wrapping over the end of
/// `buff`. With `reverse` the buffer is read back to front.
pub fn play_wrapped(buff: &[Frame], out: &mut [Frame], idx: usize, reverse: bool) {
    let len = buff.len();
    if len == 0 {
        return;
    }
    for (k, chunk) in out.chunks_mut(len).enumerate() {
        let (first, second) = calc_slices(len, chunk.len(), idx + k * len);
        let (head, tail) = chunk.split_at_mut(first.len());
        mix_range(buff, head, first, reverse);
        if let Some(second) = second {
            mix_range(buff, tail, second, reverse);
        }
    }
}

fn mix_range(buff: &[Frame], out: &mut [Frame], range: Range<usize>, reverse: bool) {
    if reverse {
        let last = buff.len() - 1;
        for (o, pos) in out.iter_mut().zip(range) {
            mix_frame(o, &buff[last - pos]);
        }
    } else {
        mix_slice(out, &buff[range]);
    }
}

/// Multiplies a frame by `gain`, clipping to the 16-bit range.
#[inline]
pub fn scale_frame(frame: &Frame, gain: f32) -> Frame {
    let scale = |s: i16| (s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    [scale(frame[0]), scale(frame[1])]
}

/// Largest absolute sample value in `frames`.
pub fn peak_of(frames: &[Frame]) -> i32 {
    frames
        .iter()
        .flat_map(|f| f.iter())
        .fold(0i32, |max, &s| max.max((s as i32).abs()))
}

pub fn write_wav_file(path: &Path, frames: &[Frame], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for frame in frames {
        writer.write_sample(frame[0])?; // Left channel
        writer.write_sample(frame[1])?; // Right channel
    }
    writer.finalize()?;
    Ok(())
}

/// Reads a 16-bit stereo WAV file. Returns the frames and the file's sample rate.
pub fn read_wav_frames(path: &Path) -> Result<(Vec<Frame>, u32)> {
    let file = BufReader::new(
        File::open(path).with_context(|| format!("opening {}", path.display()))?,
    );
    let reader = hound::WavReader::new(file)
        .with_context(|| format!("reading wav header of {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 2
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        bail!(
            "{} must be 16-bit stereo PCM, got {} channels {} bits",
            path.display(),
            spec.channels,
            spec.bits_per_sample
        );
    }

    let samples: Vec<i16> = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("decoding {}", path.display()))?;
    let frames = samples.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
    Ok((frames, spec.sample_rate))
}

/// Converts stereo frames from `source_sr` to `target_sr`.
pub fn resample_frames(frames: &[Frame], source_sr: u32, target_sr: u32) -> Result<Vec<Frame>> {
    if source_sr == target_sr || frames.is_empty() {
        return Ok(frames.to_vec());
    }
    log::info!("Resampling sound from {} Hz to {} Hz", source_sr, target_sr);

    let to_f32 = |ch: usize| -> Vec<f32> {
        frames.iter().map(|f| f[ch] as f32 / i16::MAX as f32).collect()
    };
    let waves_in = vec![to_f32(0), to_f32(1)];

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(
        target_sr as f64 / source_sr as f64,
        2.0,
        params,
        frames.len(),
        2,
    )?;
    let waves_out = resampler.process(&waves_in, None)?;

    let to_i16 = |s: f32| (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    Ok(waves_out[0]
        .iter()
        .zip(&waves_out[1])
        .map(|(l, r)| [to_i16(*l), to_i16(*r)])
        .collect())
}
