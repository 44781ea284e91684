use std::{
    io::{ErrorKind, Read},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    source::{FrameSource, SourceOptions},
    types::{CaptureError, Frame},
};

type FrameReceiver = Receiver<Result<Frame, CaptureError>>;

/// Frames decoded by an `ffmpeg` child process writing raw BGR24 to stdout.
///
/// A reader thread owns the pipe and forwards whole frames over a small channel, so
/// `read_frame` can give up after the configured timeout instead of blocking on the pipe.
pub struct FfmpegSource {
    label: String,
    child: Option<Child>,
    rx: FrameReceiver,
    primed: Option<Frame>,
    options: SourceOptions,
}

impl FfmpegSource {
    /// Video4Linux capture device, used when OpenCV support is not compiled in.
    pub fn v4l2(index: u32, options: &SourceOptions) -> Result<Self, CaptureError> {
        let device = format!("/dev/video{index}");
        let mut cmd = base_command();
        cmd.arg("-f")
            .arg("video4linux2")
            .arg("-video_size")
            .arg(format!("{}x{}", options.width, options.height))
            .arg("-i")
            .arg(&device);
        Self::spawn(device, cmd, options)
    }

    pub fn rtsp(uri: &str, options: &SourceOptions) -> Result<Self, CaptureError> {
        let mut cmd = base_command();
        cmd.arg("-rtsp_transport")
            .arg("tcp")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay")
            .arg("-max_delay")
            .arg("0")
            .arg("-i")
            .arg(uri);
        Self::spawn(uri.to_string(), cmd, options)
    }

    pub fn udp(uri: &str, options: &SourceOptions) -> Result<Self, CaptureError> {
        let mut cmd = base_command();
        cmd.arg("-fflags")
            .arg("+genpts+discardcorrupt")
            .arg("-flags")
            .arg("low_delay")
            .arg("-i")
            .arg(uri)
            .arg("-an");
        Self::spawn(uri.to_string(), cmd, options)
    }

    /// Recorded video, replayed at its native frame rate.
    pub fn file(path: &str, options: &SourceOptions) -> Result<Self, CaptureError> {
        let mut cmd = base_command();
        cmd.arg("-re").arg("-i").arg(path);
        Self::spawn(path.to_string(), cmd, options)
    }

    fn spawn(label: String, mut cmd: Command, options: &SourceOptions) -> Result<Self, CaptureError> {
        let (width, height) = (options.width, options.height);
        cmd.arg("-vf")
            .arg(format!("scale={width}:{height}"))
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|err| {
            warn!(source = %label, error = %err, "failed to launch ffmpeg");
            CaptureError::Open { uri: label.clone() }
        })?;
        let rx = match start_reader(&mut child, width, height, &label) {
            Ok(rx) => rx,
            Err(err) => {
                reap(&mut child, &label);
                return Err(err);
            }
        };

        let mut source = Self {
            label,
            child: Some(child),
            rx,
            primed: None,
            options: options.clone(),
        };
        source.prime()?;
        Ok(source)
    }

    /// Waits for the first frame so a dead input surfaces as an open failure.
    fn prime(&mut self) -> Result<(), CaptureError> {
        match self.rx.recv_timeout(self.options.startup_timeout) {
            Ok(Ok(frame)) => {
                self.primed = Some(frame);
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(source = %self.label, error = %err, "ffmpeg produced no frames");
                self.close();
                Err(CaptureError::Open {
                    uri: self.label.clone(),
                })
            }
            Err(_) => {
                self.close();
                Err(CaptureError::Open {
                    uri: self.label.clone(),
                })
            }
        }
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.primed.take() {
            return Ok(frame);
        }
        match self.rx.recv_timeout(self.options.read_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Read(format!(
                "no frame from {} within {:?}",
                self.label, self.options.read_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::EndOfStream),
        }
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            reap(&mut child, &self.label);
        }
    }

    fn describe(&self) -> &str {
        &self.label
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Moves the child's stdout onto a reader thread.
fn start_reader(
    child: &mut Child,
    width: u32,
    height: u32,
    label: &str,
) -> Result<FrameReceiver, CaptureError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    let (tx, rx) = bounded(2);
    let thread_label = label.to_string();
    thread::Builder::new()
        .name("ffmpeg-reader".into())
        .spawn(move || read_loop(stdout, width, height, tx, &thread_label))
        .map_err(|err| CaptureError::Other(err.into()))?;
    Ok(rx)
}

/// Kills the child and waits for it so no ffmpeg process outlives its source.
fn reap(child: &mut Child, label: &str) {
    let _ = child.kill();
    let _ = child.wait();
    debug!(source = %label, "ffmpeg process stopped");
}

fn base_command() -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    cmd
}

fn read_loop(
    mut stdout: impl Read,
    width: u32,
    height: u32,
    tx: Sender<Result<Frame, CaptureError>>,
    label: &str,
) {
    let frame_bytes = width as usize * height as usize * 3;
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        let message = match stdout.read_exact(&mut buffer) {
            Ok(()) => Frame::from_bgr(buffer.clone(), width, height),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::EndOfStream),
            Err(err) => Err(CaptureError::Read(err.to_string())),
        };
        let finished = message.is_err();
        if tx.send(message).is_err() || finished {
            break;
        }
    }
    debug!(source = label, "ffmpeg reader exiting");
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn read_loop_splits_frames_and_signals_eof() {
        let bytes: Vec<u8> = (0..30).collect();
        let (tx, rx) = bounded(8);
        read_loop(Cursor::new(bytes), 2, 2, tx, "test");

        let first = rx.recv().unwrap().unwrap();
        assert_eq!(first.data(), &(0..12).collect::<Vec<u8>>()[..]);
        let second = rx.recv().unwrap().unwrap();
        assert_eq!(second.data()[0], 12);
        // Six trailing bytes are a truncated frame.
        assert!(matches!(rx.recv().unwrap(), Err(CaptureError::EndOfStream)));
        assert!(rx.recv().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn child_is_reaped_when_the_reader_cannot_start() {
        // stdout left unpiped, so there is no pipe for the reader thread to take.
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        assert!(matches!(
            start_reader(&mut child, 2, 2, "sleep"),
            Err(CaptureError::Other(_))
        ));
        assert!(child.try_wait().unwrap().is_none());

        reap(&mut child, "sleep");
        assert!(child.try_wait().unwrap().is_some());
    }
}
