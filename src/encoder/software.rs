//! Pure-Rust fallback encoder
//!
//! Encodes every frame as an intra H.264 picture with `less_avc` and muxes
//! the result into an MPEG-4 container with the `mp4` crate. No external
//! binaries or system libraries, at the cost of large output files.

use less_avc::ycbcr_image::{DataPlane, Planes, YCbCrImage};
use less_avc::{BitDepth, H264Writer};
use mp4::{
    AvcConfig, Bytes, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer, TrackConfig, TrackType,
};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::time::Duration;
use tracing::{debug, warn};

use super::{EncodeStats, Encoder, EncoderError, EncoderSettings};
use crate::capture::{Frame, PixelFormat};

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// Video track timescale in units per second.
const TIMESCALE: u32 = 90_000;
const VIDEO_TRACK_ID: u32 = 1;

/// Plane alignment the H.264 writer insists on: whole macroblocks for luma,
/// half that for the subsampled chroma planes.
const LUMA_ALIGNMENT: usize = 16;
const CHROMA_ALIGNMENT: usize = 8;

pub struct SoftwareEncoder {
    settings: EncoderSettings,
    writer: Option<Mp4Writer<BufWriter<File>>>,
    track_added: bool,
    frames: u64,
    /// Presentation time of the next sample, in `TIMESCALE` units. Paused
    /// wall time never advances this, so pauses are absent from the output.
    media_time: u64,
}

impl SoftwareEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            writer: None,
            track_added: false,
            frames: 0,
            media_time: 0,
        }
    }

    fn add_video_track(
        writer: &mut Mp4Writer<BufWriter<File>>,
        settings: &EncoderSettings,
        sps: Vec<u8>,
        pps: Vec<u8>,
    ) -> Result<(), EncoderError> {
        writer.add_track(&TrackConfig {
            track_type: TrackType::Video,
            timescale: TIMESCALE,
            language: "eng".to_string(),
            media_conf: MediaConfig::AvcConfig(AvcConfig {
                width: settings.width as u16,
                height: settings.height as u16,
                seq_param_set: sps,
                pic_param_set: pps,
            }),
        })?;
        Ok(())
    }
}

impl Encoder for SoftwareEncoder {
    fn name(&self) -> &'static str {
        "software"
    }

    fn prepare(&mut self) -> Result<(), EncoderError> {
        let file = File::create(&self.settings.output)?;
        let config = Mp4Config {
            major_brand: "isom".parse()?,
            minor_version: 512,
            compatible_brands: vec![
                "isom".parse()?,
                "iso2".parse()?,
                "avc1".parse()?,
                "mp41".parse()?,
            ],
            timescale: 1000,
        };
        self.writer = Some(Mp4Writer::write_start(BufWriter::new(file), &config)?);
        debug!(output = %self.settings.output.display(), "opened mp4 container");
        Ok(())
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        if self.settings.audio != super::AudioSource::None {
            warn!("software encoder has no audio path, recording video only");
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| EncoderError::Encode("output container is not open".to_string()))?;

        if !frame.is_complete() {
            warn!(
                len = frame.data.len(),
                width = frame.width,
                height = frame.height,
                "skipping incomplete frame"
            );
            return Ok(());
        }
        if frame.width != self.settings.width || frame.height != self.settings.height {
            warn!(
                got = %format!("{}x{}", frame.width, frame.height),
                want = %format!("{}x{}", self.settings.width, self.settings.height),
                "skipping frame with unexpected dimensions"
            );
            return Ok(());
        }

        let annexb = encode_intra_frame(frame)?;
        let nals = split_annex_b(&annexb);

        if !self.track_added {
            let sps = nals
                .iter()
                .find(|nal| nal_type(nal) == Some(NAL_TYPE_SPS))
                .map(|nal| nal.to_vec());
            let pps = nals
                .iter()
                .find(|nal| nal_type(nal) == Some(NAL_TYPE_PPS))
                .map(|nal| nal.to_vec());
            match (sps, pps) {
                (Some(sps), Some(pps)) => {
                    Self::add_video_track(writer, &self.settings, sps, pps)?;
                    self.track_added = true;
                }
                _ => {
                    return Err(EncoderError::Encode(
                        "encoder produced no SPS/PPS parameter sets".to_string(),
                    ));
                }
            }
        }

        let slices: Vec<&[u8]> = nals
            .into_iter()
            .filter(|nal| !matches!(nal_type(nal), Some(NAL_TYPE_SPS) | Some(NAL_TYPE_PPS)))
            .collect();
        let sample_bytes = build_length_prefixed_sample(&slices)?;

        // Integer sample durations that sum exactly to frames / fps.
        let fps = u64::from(self.settings.fps.max(1));
        let scale = u64::from(TIMESCALE);
        let end_time = scale * (self.frames + 1) / fps;
        let duration = (end_time - self.media_time) as u32;

        writer.write_sample(
            VIDEO_TRACK_ID,
            &Mp4Sample {
                start_time: self.media_time,
                duration,
                rendering_offset: 0,
                is_sync: true,
                bytes: Bytes::copy_from_slice(&sample_bytes),
            },
        )?;

        self.frames += 1;
        self.media_time = end_time;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EncoderError> {
        // Nothing to suspend here. Paused wall time simply never enters the
        // sample timeline.
        debug!("software encoder paused");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EncoderError> {
        debug!("software encoder resumed");
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<EncodeStats, EncoderError> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| EncoderError::Finalize("output container is not open".to_string()))?;
        writer.write_end()?;
        let mut inner = writer.into_writer();
        inner.flush()?;
        drop(inner);

        let bytes = fs::metadata(&self.settings.output)?.len();
        let duration =
            Duration::from_micros(self.media_time * 1_000_000 / u64::from(TIMESCALE));
        debug!(
            frames = self.frames,
            bytes, "software encoder finalized mp4"
        );
        Ok(EncodeStats {
            frames: self.frames,
            dropped: 0,
            bytes,
            duration,
        })
    }

    fn abort(mut self: Box<Self>) {
        self.writer = None;
        if let Err(e) = fs::remove_file(&self.settings.output) {
            debug!("could not remove partial recording: {e}");
        }
    }
}

/// Encode one frame as a standalone Annex-B chunk (SPS + PPS + IDR slice).
///
/// A fresh `H264Writer` per frame keeps every sample independently decodable,
/// which is what lets pause cuts splice cleanly. The writer only accepts
/// whole macroblocks, so each plane is padded out to its alignment; the image
/// keeps the true dimensions and the SPS crop hides the padding.
fn encode_intra_frame(frame: &Frame) -> Result<Vec<u8>, EncoderError> {
    let (y, cb, cr) = frame_to_i420(frame);
    let width = frame.width;
    let height = frame.height;
    let (w, h) = (width as usize, height as usize);

    let (y_data, y_stride) = pad_plane(&y, w, h, LUMA_ALIGNMENT);
    let (cb_data, chroma_stride) = pad_plane(&cb, w / 2, h / 2, CHROMA_ALIGNMENT);
    let (cr_data, _) = pad_plane(&cr, w / 2, h / 2, CHROMA_ALIGNMENT);

    let mut annexb = Vec::new();
    let mut writer =
        H264Writer::new(&mut annexb).map_err(|e| EncoderError::Encode(format!("{e:?}")))?;
    writer
        .write(&YCbCrImage {
            planes: Planes::YCbCr((
                DataPlane {
                    bit_depth: BitDepth::Depth8,
                    stride: y_stride,
                    data: &y_data,
                },
                DataPlane {
                    bit_depth: BitDepth::Depth8,
                    stride: chroma_stride,
                    data: &cb_data,
                },
                DataPlane {
                    bit_depth: BitDepth::Depth8,
                    stride: chroma_stride,
                    data: &cr_data,
                },
            )),
            width,
            height,
        })
        .map_err(|e| EncoderError::Encode(format!("{e:?}")))?;
    drop(writer);
    Ok(annexb)
}

fn align_up(v: usize, alignment: usize) -> usize {
    (v + alignment - 1) / alignment * alignment
}

/// Copy a tight plane into a buffer whose stride and row count are rounded up
/// to `alignment`, returning the buffer and its stride. Padding bytes are
/// zero; the SPS crop keeps them out of the decoded picture.
fn pad_plane(plane: &[u8], width: usize, height: usize, alignment: usize) -> (Vec<u8>, usize) {
    let stride = align_up(width, alignment);
    let rows = align_up(height, alignment);
    if stride == width && rows == height {
        return (plane.to_vec(), stride);
    }

    let mut out = vec![0u8; stride * rows];
    for (src, dst) in plane.chunks_exact(width).zip(out.chunks_exact_mut(stride)) {
        dst[..width].copy_from_slice(src);
    }
    (out, stride)
}

/// Convert a packed 32-bit frame to planar YCbCr 4:2:0. Dimensions are even
/// by construction, so the 2x2 chroma average never runs off the edge.
fn frame_to_i420(frame: &Frame) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let (r_off, b_off) = match frame.pixel_format {
        PixelFormat::Rgba8888 => (0, 2),
        PixelFormat::Bgra8888 => (2, 0),
    };

    let mut y_plane = Vec::with_capacity(w * h);
    let mut cb_full = Vec::with_capacity(w * h);
    let mut cr_full = Vec::with_capacity(w * h);
    for px in frame.data.chunks_exact(4) {
        let (y, cb, cr) = rgb_to_ycbcr(px[r_off], px[1], px[b_off]);
        y_plane.push(y);
        cb_full.push(cb);
        cr_full.push(cr);
    }

    let cw = w / 2;
    let ch = h / 2;
    let mut cb_plane = Vec::with_capacity(cw * ch);
    let mut cr_plane = Vec::with_capacity(cw * ch);
    for row in 0..ch {
        for col in 0..cw {
            let i0 = row * 2 * w + col * 2;
            let avg = |p: &[u8]| {
                ((u16::from(p[i0]) + u16::from(p[i0 + 1]) + u16::from(p[i0 + w]) + u16::from(p[i0 + w + 1])) / 4) as u8
            };
            cb_plane.push(avg(&cb_full));
            cr_plane.push(avg(&cr_full));
        }
    }
    (y_plane, cb_plane, cr_plane)
}

/// JFIF coefficients scaled for a 255 maximum.
#[inline]
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let max = u8::MAX as f32;
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = 76.245 / max * r + 149.685 / max * g + 29.07 / max * b;
    let cb = -43.0185 / max * r - 84.4815 / max * g + 127.5 / max * b + 128.;
    let cr = 127.5 / max * r - 106.7685 / max * g - 20.7315 / max * b + 128.;

    (y as u8, cb as u8, cr as u8)
}

fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// Split an Annex-B stream into NAL unit payloads. Start codes are removed,
/// the NAL header byte stays.
fn split_annex_b(stream: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < stream.len() {
        if stream[i] == 0 && stream[i + 1] == 0 && stream[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(idx + 1) {
            Some(&next) => next - 3,
            None => stream.len(),
        };
        // A four-byte start code leaves its leading zero on our side.
        while end > start && stream[end - 1] == 0 {
            end -= 1;
        }
        nals.push(&stream[start..end]);
    }
    nals
}

/// Re-pack NAL units with 4-byte big-endian length prefixes, as the avcC
/// sample format expects.
fn build_length_prefixed_sample(nals: &[&[u8]]) -> Result<Vec<u8>, EncoderError> {
    let mut out = Vec::new();
    for nal in nals {
        let len = u32::try_from(nal.len())
            .map_err(|_| EncoderError::Encode("NAL unit too large".to_string()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(nal);
    }
    Ok(out)
}
