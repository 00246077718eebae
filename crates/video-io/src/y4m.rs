//! Native YUV4MPEG2 container support.
//!
//! Y4M is uncompressed and trivially seekable, which makes it the container of
//! choice for fixtures and for hosts without an ffmpeg binary. Frames are
//! written as full-range 4:4:4; 4:4:4, 4:2:0 and monochrome streams are read.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
};

use crate::{
    sink::FrameWriter,
    source::FrameReader,
    types::{Frame, FrameCount, MediaError, SourceProperties, rgb_frame_len},
};

const MAGIC: &str = "YUV4MPEG2";
const FRAME_MARKER: &[u8] = b"FRAME\n";
/// Largest accepted width or height.
const MAX_DIMENSION: u32 = 16_384;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Chroma {
    C444,
    C420,
    Mono,
}

impl Chroma {
    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "444" => Some(Chroma::C444),
            "420" | "420jpeg" | "420paldv" | "420mpeg2" => Some(Chroma::C420),
            "mono" => Some(Chroma::Mono),
            _ => None,
        }
    }

    fn chroma_plane_len(self, width: u32, height: u32) -> usize {
        match self {
            Chroma::C444 => width as usize * height as usize,
            Chroma::C420 => width.div_ceil(2) as usize * height.div_ceil(2) as usize,
            Chroma::Mono => 0,
        }
    }

    /// Bytes of plane data per frame, `None` on overflow.
    fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let luma = (width as usize).checked_mul(height as usize)?;
        let chroma = self.chroma_plane_len(width, height).checked_mul(2)?;
        luma.checked_add(chroma)
    }
}

#[derive(Debug)]
struct Header {
    width: u32,
    height: u32,
    fps: f64,
    chroma: Chroma,
}

fn parse_header(line: &str) -> Result<Header, String> {
    let mut tokens = line.split_ascii_whitespace();
    if tokens.next() != Some(MAGIC) {
        return Err("missing YUV4MPEG2 signature".into());
    }

    let mut width = None;
    let mut height = None;
    let mut fps = 25.0;
    let mut chroma = Chroma::C420;
    for token in tokens {
        let mut chars = token.chars();
        let tag = chars.next();
        let value = chars.as_str();
        match tag {
            Some('W') => width = value.parse::<u32>().ok(),
            Some('H') => height = value.parse::<u32>().ok(),
            Some('F') => {
                let (num, den) = value
                    .split_once(':')
                    .ok_or_else(|| format!("malformed frame rate {value:?}"))?;
                let num = num.parse::<f64>().map_err(|e| e.to_string())?;
                let den = den.parse::<f64>().map_err(|e| e.to_string())?;
                if num <= 0.0 || den <= 0.0 {
                    return Err(format!("invalid frame rate {value:?}"));
                }
                fps = num / den;
            }
            Some('C') => {
                chroma = Chroma::parse(value)
                    .ok_or_else(|| format!("unsupported chroma layout {value:?}"))?;
            }
            _ => {}
        }
    }

    match (width, height) {
        (Some(width), Some(height)) if width > MAX_DIMENSION || height > MAX_DIMENSION => Err(format!(
            "frame size {width}x{height} exceeds the {MAX_DIMENSION} pixel limit"
        )),
        (Some(width), Some(height)) if width > 0 && height > 0 => Ok(Header {
            width,
            height,
            fps,
            chroma,
        }),
        _ => Err("header lacks a valid W/H pair".into()),
    }
}

/// Sequential reader over a `.y4m` file.
pub(crate) struct Y4mReader {
    input: Option<BufReader<File>>,
    header: Header,
    frame_count: FrameCount,
    plane_bytes: usize,
    planes: Vec<u8>,
}

impl Y4mReader {
    pub(crate) fn open(path: &Path) -> Result<Self, String> {
        let file = File::open(path).map_err(|err| err.to_string())?;
        let file_len = file.metadata().map_err(|err| err.to_string())?.len();
        let mut input = BufReader::new(file);

        let mut line = Vec::new();
        input
            .read_until(b'\n', &mut line)
            .map_err(|err| err.to_string())?;
        if line.last() != Some(&b'\n') {
            return Err("truncated stream header".into());
        }
        let text = std::str::from_utf8(&line).map_err(|err| err.to_string())?;
        let header = parse_header(text.trim_end())?;

        let plane_bytes = header
            .chroma
            .frame_len(header.width, header.height)
            .ok_or("frame size overflows")?;
        let per_frame = plane_bytes
            .checked_add(FRAME_MARKER.len())
            .ok_or("frame size overflows")? as u64;
        let payload = file_len.saturating_sub(line.len() as u64);
        if payload > 0 && payload < per_frame {
            return Err(format!(
                "{}x{} frames need {per_frame} bytes but only {payload} follow the header",
                header.width, header.height
            ));
        }

        Ok(Self {
            input: Some(input),
            frame_count: FrameCount::Known(payload / per_frame),
            plane_bytes,
            planes: Vec::new(),
            header,
        })
    }
}

impl FrameReader for Y4mReader {
    fn properties(&self) -> SourceProperties {
        SourceProperties {
            width: self.header.width,
            height: self.header.height,
            fps: self.header.fps,
            frame_count: self.frame_count,
        }
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, MediaError> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };

        let mut marker = Vec::with_capacity(FRAME_MARKER.len());
        let read = input.read_until(b'\n', &mut marker)?;
        if read == 0 {
            return Ok(None);
        }
        if !marker.starts_with(b"FRAME") || marker.last() != Some(&b'\n') {
            return Err(MediaError::Decode("corrupt y4m frame marker".into()));
        }
        // Allocated on the first frame; open() has checked it fits the file.
        self.planes.resize(self.plane_bytes, 0);
        input.read_exact(&mut self.planes).map_err(|err| {
            MediaError::Decode(format!("truncated y4m frame: {err}"))
        })?;

        let Header {
            width,
            height,
            chroma,
            ..
        } = self.header;
        let rgb = planes_to_rgb(&self.planes, width, height, chroma);
        Frame::from_rgb(rgb, width, height).map(Some)
    }

    fn close(&mut self) {
        self.input = None;
    }
}

fn planes_to_rgb(planes: &[u8], width: u32, height: u32, chroma: Chroma) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let luma_len = w * h;
    let chroma_len = chroma.chroma_plane_len(width, height);
    let (luma, rest) = planes.split_at(luma_len);
    let (cb_plane, cr_plane) = rest.split_at(chroma_len);
    let chroma_width = width.div_ceil(2) as usize;

    let mut rgb = Vec::with_capacity(rgb_frame_len(width, height));
    for y in 0..h {
        for x in 0..w {
            let luma_value = luma[y * w + x];
            let (cb, cr) = match chroma {
                Chroma::C444 => (cb_plane[y * w + x], cr_plane[y * w + x]),
                Chroma::C420 => {
                    let idx = (y / 2) * chroma_width + x / 2;
                    (cb_plane[idx], cr_plane[idx])
                }
                Chroma::Mono => (128, 128),
            };
            rgb.extend_from_slice(&ycbcr_to_rgb(luma_value, cb, cr));
        }
    }
    rgb
}

/// Full-range BT.601 (JFIF) conversion.
pub(crate) fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344_136 * cb - 0.714_136 * cr;
    let b = y + 1.772 * cb;
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

pub(crate) fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    [clamp_u8(y), clamp_u8(cb), clamp_u8(cr)]
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Express a frame rate as the integer ratio Y4M headers expect.
fn frame_rate_ratio(fps: f64) -> (u64, u64) {
    if fps <= 0.0 || !fps.is_finite() {
        return (30, 1);
    }
    if (fps - fps.round()).abs() < 1e-6 {
        (fps.round() as u64, 1)
    } else {
        ((fps * 1000.0).round() as u64, 1000)
    }
}

/// Writes 4:4:4 full-range frames to a `.y4m` file.
pub(crate) struct Y4mWriter {
    output: Option<BufWriter<File>>,
    width: u32,
    height: u32,
    planes: Vec<u8>,
}

impl Y4mWriter {
    pub(crate) fn create(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self, String> {
        let plane_bytes = Chroma::C444
            .frame_len(width, height)
            .ok_or("frame size overflows")?;
        let file = File::create(path).map_err(|err| err.to_string())?;
        let mut output = BufWriter::new(file);
        let (num, den) = frame_rate_ratio(fps);
        writeln!(
            output,
            "{MAGIC} W{width} H{height} F{num}:{den} Ip A1:1 C444 XCOLORRANGE=FULL"
        )
        .map_err(|err| err.to_string())?;
        Ok(Self {
            output: Some(output),
            width,
            height,
            planes: vec![0; plane_bytes],
        })
    }
}

impl FrameWriter for Y4mWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), MediaError> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| MediaError::Encode("y4m writer already finished".into()))?;

        let plane = self.width as usize * self.height as usize;
        for (idx, px) in frame.data.chunks_exact(3).enumerate().take(plane) {
            let [y, cb, cr] = rgb_to_ycbcr(px[0], px[1], px[2]);
            self.planes[idx] = y;
            self.planes[plane + idx] = cb;
            self.planes[2 * plane + idx] = cr;
        }

        output.write_all(FRAME_MARKER)?;
        output.write_all(&self.planes)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MediaError> {
        if let Some(mut output) = self.output.take() {
            output.flush()?;
            output.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.output = None;
    }
}
