use std::{
    io::{BufReader, Read},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use reqwest::blocking::Client;
use tracing::{debug, info, trace, warn};

use crate::{
    source::{FrameSource, SourceOptions},
    types::{CaptureError, Frame},
};

const CHUNK_SIZE: usize = 64 * 1024;

/// Multipart MJPEG over HTTP, as served by IP camera apps on phones.
pub struct MjpegSource {
    url: String,
    rx: Receiver<Result<Frame, CaptureError>>,
    stop: Arc<AtomicBool>,
    primed: Option<Frame>,
    options: SourceOptions,
}

impl MjpegSource {
    pub fn open(url: &str, options: &SourceOptions) -> Result<Self, CaptureError> {
        let open_err = || CaptureError::Open {
            uri: url.to_string(),
        };
        let client = Client::builder()
            .connect_timeout(options.startup_timeout)
            .timeout(None)
            .build()
            .map_err(|err| CaptureError::Other(err.into()))?;
        let response = client.get(url).send().map_err(|err| {
            warn!(url, error = %err, "MJPEG stream unreachable");
            open_err()
        })?;
        if !response.status().is_success() {
            warn!(url, status = %response.status(), "MJPEG stream rejected request");
            return Err(open_err());
        }
        info!(url, "connected to MJPEG stream");

        let (tx, rx) = bounded(2);
        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("mjpeg-reader".into())
            .spawn(move || stream_from_reader(BufReader::new(response), &tx, &reader_stop))
            .map_err(|err| CaptureError::Other(err.into()))?;

        let mut source = Self {
            url: url.to_string(),
            rx,
            stop,
            primed: None,
            options: options.clone(),
        };
        match source.rx.recv_timeout(options.startup_timeout) {
            Ok(Ok(frame)) => source.primed = Some(frame),
            _ => {
                source.close();
                return Err(open_err());
            }
        }
        Ok(source)
    }
}

impl FrameSource for MjpegSource {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.primed.take() {
            return Ok(frame);
        }
        match self.rx.recv_timeout(self.options.read_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Read(format!(
                "no MJPEG frame from {} within {:?}",
                self.url, self.options.read_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::EndOfStream),
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn describe(&self) -> &str {
        &self.url
    }
}

impl Drop for MjpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn stream_from_reader<R: Read>(
    mut reader: R,
    tx: &Sender<Result<Frame, CaptureError>>,
    stop: &AtomicBool,
) {
    let mut buffer = Vec::with_capacity(CHUNK_SIZE * 2);
    let mut chunk = vec![0u8; CHUNK_SIZE];

    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut chunk) {
            Ok(0) => {
                let _ = tx.send(Err(CaptureError::EndOfStream));
                return;
            }
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                while let Some(jpeg) = extract_frame(&mut buffer) {
                    trace!(bytes = jpeg.len(), "extracted MJPEG frame");
                    let decoded = match image::load_from_memory(&jpeg) {
                        Ok(dynamic) => Ok(Frame::from_rgb_image(&dynamic.into_rgb8())),
                        Err(err) => Err(CaptureError::Read(format!("undecodable JPEG: {err}"))),
                    };
                    if tx.send(decoded).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.send(Err(CaptureError::Read(err.to_string())));
                let _ = tx.send(Err(CaptureError::EndOfStream));
                return;
            }
        }
    }
    debug!("MJPEG reader stopped");
}

/// Pops the next complete JPEG (SOI through EOI) from the front of `buffer`.
fn extract_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let Some(start) = find_marker(buffer, &[0xFF, 0xD8]) else {
        if buffer.len() > CHUNK_SIZE {
            buffer.clear();
        }
        return None;
    };
    buffer.drain(..start);

    let end = find_marker(&buffer[2..], &[0xFF, 0xD9])? + 2;
    let frame: Vec<u8> = buffer.drain(..end + 2).collect();
    Some(frame)
}

fn find_marker(buffer: &[u8], marker: &[u8]) -> Option<usize> {
    buffer
        .windows(marker.len())
        .position(|window| window == marker)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;

    fn jpeg_bytes(color: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(8, 8, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[test]
    fn extracts_frames_between_markers() {
        let mut buffer = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        buffer.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        buffer.extend_from_slice(b"\r\n--frame\r\n");
        buffer.extend_from_slice(&[0xFF, 0xD8, 9]);

        let frame = extract_frame(&mut buffer).unwrap();
        assert_eq!(frame, vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        assert!(extract_frame(&mut buffer).is_none());
        assert_eq!(&buffer[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn decodes_multipart_stream() {
        let mut body = Vec::new();
        for color in [[200, 10, 10], [10, 200, 10]] {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg_bytes(color));
            body.extend_from_slice(b"\r\n");
        }
        let (tx, rx) = bounded(8);
        let stop = AtomicBool::new(false);
        stream_from_reader(Cursor::new(body), &tx, &stop);

        let first = rx.recv().unwrap().unwrap();
        assert_eq!((first.width(), first.height()), (8, 8));
        // BGR order: red channel is last.
        assert!(first.data()[2] > 150);
        let second = rx.recv().unwrap().unwrap();
        assert!(second.data()[1] > 150);
        assert!(matches!(rx.recv().unwrap(), Err(CaptureError::EndOfStream)));
    }
}
