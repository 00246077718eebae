//! ffmpeg/ffprobe subprocess backends.
//!
//! Decoding streams `rawvideo rgb24` from ffmpeg's stdout on a reader thread
//! feeding a small bounded channel; encoding pipes raw frames into ffmpeg's
//! stdin and lets it mux H.264 into MP4.

use std::{
    io::{ErrorKind, Read, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    thread,
};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvError, Sender, bounded};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    locator::SourceLocator,
    sink::FrameWriter,
    source::FrameReader,
    types::{Frame, FrameCount, FrameFormat, MediaError, SourceProperties, rgb_frame_len},
};

const DECODE_QUEUE: usize = 2;
const CAMERA_DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn input_args(cmd: &mut Command, locator: &SourceLocator) {
    match locator {
        SourceLocator::Camera(_) => {
            cmd.arg("-f").arg("video4linux2").arg("-i").arg(locator.to_string());
        }
        SourceLocator::File(path) => {
            cmd.arg("-i").arg(path);
        }
    }
}

/// Query stream geometry, rate and length through `ffprobe`.
pub(crate) fn probe(locator: &SourceLocator) -> Result<SourceProperties, String> {
    let mut cmd = Command::new("ffprobe");
    cmd.arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,avg_frame_rate,r_frame_rate,nb_frames:format=duration")
        .arg("-of")
        .arg("json");
    match locator {
        SourceLocator::Camera(_) => {
            cmd.arg("-f").arg("video4linux2").arg(locator.to_string());
        }
        SourceLocator::File(path) => {
            cmd.arg(path);
        }
    }

    let output = cmd
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| format!("failed to run ffprobe: {err}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ffprobe exited with {}: {}", output.status, stderr.trim()));
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|err| format!("unreadable ffprobe output: {err}"))?;
    properties_from_probe(parsed, locator.is_camera())
}

fn properties_from_probe(probe: ProbeOutput, live: bool) -> Result<SourceProperties, String> {
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| "no video stream found".to_string())?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err("video stream has no usable dimensions".into()),
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate));

    let frame_count = if live {
        FrameCount::Unknown
    } else if let Some(count) = stream.nb_frames.as_deref().and_then(|n| n.parse::<u64>().ok()) {
        FrameCount::Known(count)
    } else {
        let duration = probe
            .format
            .and_then(|format| format.duration)
            .and_then(|d| d.parse::<f64>().ok());
        match (duration, fps) {
            (Some(duration), Some(fps)) => FrameCount::Known((duration * fps).round() as u64),
            _ => FrameCount::Unknown,
        }
    };

    let fps = match fps {
        Some(fps) => fps,
        None if live => CAMERA_DEFAULT_FPS,
        None => return Err("video stream has no frame rate".into()),
    };

    Ok(SourceProperties {
        width,
        height,
        fps,
        frame_count,
    })
}

fn parse_rate(value: &str) -> Option<f64> {
    let (num, den) = value.split_once('/').unwrap_or((value, "1"));
    let num = num.parse::<f64>().ok()?;
    let den = den.parse::<f64>().ok()?;
    if num <= 0.0 || den <= 0.0 {
        return None;
    }
    Some(num / den)
}

/// Pull-based decoder backed by an ffmpeg child process.
pub(crate) struct FfmpegReader {
    props: SourceProperties,
    frames: Option<Receiver<Result<Frame, MediaError>>>,
    child: Option<Child>,
    pump: Option<thread::JoinHandle<()>>,
}

impl FfmpegReader {
    pub(crate) fn spawn(locator: &SourceLocator) -> Result<Self, String> {
        let props = probe(locator)?;

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-noautorotate");
        input_args(&mut cmd, locator);
        cmd.arg("-an")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|err| format!("failed to spawn ffmpeg: {err}"))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err("failed to capture ffmpeg stdout".into());
        };

        let (tx, rx) = bounded(DECODE_QUEUE);
        let (width, height) = (props.width, props.height);
        let pump = thread::Builder::new()
            .name("video-io-decode".into())
            .spawn(move || decode_loop(stdout, width, height, tx));
        let pump = match pump {
            Ok(handle) => handle,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("failed to spawn decode thread: {err}"));
            }
        };

        Ok(Self {
            props,
            frames: Some(rx),
            child: Some(child),
            pump: Some(pump),
        })
    }

    fn exit_status_error(&mut self) -> Option<MediaError> {
        let child = self.child.as_mut()?;
        match child.wait() {
            Ok(status) if status.success() => None,
            Ok(status) => Some(MediaError::Decode(format!("ffmpeg exited with {status}"))),
            Err(err) => Some(MediaError::Io(err)),
        }
    }
}

impl FrameReader for FfmpegReader {
    fn properties(&self) -> SourceProperties {
        self.props
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, MediaError> {
        let Some(frames) = self.frames.as_ref() else {
            return Ok(None);
        };
        match frames.recv() {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(err)) => Err(err),
            Err(RecvError) => {
                self.frames = None;
                match self.exit_status_error() {
                    Some(err) => Err(err),
                    None => Ok(None),
                }
            }
        }
    }

    fn close(&mut self) {
        self.frames = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                if err.kind() != ErrorKind::InvalidInput {
                    warn!("failed to stop ffmpeg decoder: {err}");
                }
            }
            let _ = child.wait();
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

fn decode_loop(
    mut stdout: impl Read,
    width: u32,
    height: u32,
    tx: Sender<Result<Frame, MediaError>>,
) {
    let frame_bytes = rgb_frame_len(width, height);
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        match read_full(&mut stdout, &mut buffer) {
            Ok(0) => break,
            Ok(n) if n == frame_bytes => {
                let frame = Frame {
                    data: buffer.clone(),
                    width,
                    height,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Rgb8,
                };
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Ok(n) => {
                let _ = tx.send(Err(MediaError::Decode(format!(
                    "truncated frame: {n} of {frame_bytes} bytes"
                ))));
                break;
            }
            Err(err) => {
                let _ = tx.send(Err(MediaError::Io(err)));
                break;
            }
        }
    }
    debug!("ffmpeg decode loop finished");
}

/// Fill `buffer` unless the stream ends first; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// H.264/MP4 encoder fed through ffmpeg's stdin.
pub(crate) struct FfmpegWriter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl FfmpegWriter {
    pub(crate) fn spawn(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self, String> {
        let fps = if fps > 0.0 && fps.is_finite() { fps } else { CAMERA_DEFAULT_FPS };
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(format!("{fps}"))
            .arg("-i")
            .arg("-")
            .arg("-an")
            .arg("-vf")
            .arg("pad=ceil(iw/2)*2:ceil(ih/2)*2")
            .arg("-c:v")
            .arg("libx264")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-movflags")
            .arg("+faststart")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|err| format!("failed to spawn ffmpeg: {err}"))?;
        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err("failed to capture ffmpeg stdin".into());
        };
        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
        })
    }
}

impl FrameWriter for FfmpegWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), MediaError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MediaError::Encode("ffmpeg encoder already finished".into()))?;
        stdin
            .write_all(&frame.data)
            .map_err(|err| MediaError::Encode(format!("ffmpeg stdin closed: {err}")))
    }

    fn finish(&mut self) -> Result<(), MediaError> {
        // Closing stdin signals end of input; ffmpeg then writes the trailer.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(MediaError::Encode(format!("ffmpeg exited with {status}")))
        }
    }

    fn abort(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(nb_frames: Option<&str>, rate: Option<&str>) -> ProbeStream {
        ProbeStream {
            width: Some(1280),
            height: Some(720),
            avg_frame_rate: rate.map(str::to_string),
            r_frame_rate: None,
            nb_frames: nb_frames.map(str::to_string),
        }
    }

    #[test]
    fn rates_parse_as_fractions() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert_eq!(parse_rate("25"), Some(25.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
    }

    #[test]
    fn probe_prefers_container_frame_count() {
        let props = properties_from_probe(
            ProbeOutput {
                streams: vec![stream(Some("300"), Some("30/1"))],
                format: None,
            },
            false,
        )
        .unwrap();
        assert_eq!(props.frame_count, FrameCount::Known(300));
        assert_eq!((props.width, props.height), (1280, 720));
    }

    #[test]
    fn probe_derives_count_from_duration() {
        let props = properties_from_probe(
            ProbeOutput {
                streams: vec![stream(None, Some("25/1"))],
                format: Some(ProbeFormat {
                    duration: Some("2.0".into()),
                }),
            },
            false,
        )
        .unwrap();
        assert_eq!(props.frame_count, FrameCount::Known(50));
    }

    #[test]
    fn cameras_never_report_a_frame_count() {
        let props = properties_from_probe(
            ProbeOutput {
                streams: vec![stream(Some("10"), None)],
                format: None,
            },
            true,
        )
        .unwrap();
        assert_eq!(props.frame_count, FrameCount::Unknown);
        assert_eq!(props.fps, CAMERA_DEFAULT_FPS);
    }

    #[test]
    fn missing_stream_is_rejected() {
        let err = properties_from_probe(
            ProbeOutput {
                streams: Vec::new(),
                format: None,
            },
            false,
        )
        .unwrap_err();
        assert!(err.contains("no video stream"));
    }

    #[test]
    fn decode_loop_splits_frames_and_reports_truncation() {
        let (tx, rx) = bounded(8);
        let bytes = vec![7u8; 2 * 2 * 3 * 2 + 5];
        decode_loop(std::io::Cursor::new(bytes), 2, 2, tx);

        let results: Vec<_> = rx.iter().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(MediaError::Decode(_))));
    }
}
