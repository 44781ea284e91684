//! Configuration parsing for the capture pipeline.
//!
//! This module owns translation of CLI arguments into a `CaptureConfig` which the
//! pipeline and its loops read without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use pano_core::{ProjectionParams, Stitcher, TranslationStitcher};
use video_ingest::{FrameAdjust, SourceOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
/// Fusion backend used by the stitch scheduler.
pub enum StitcherBackend {
    /// Built-in translation-only fusion of cylindrically pre-warped frames.
    Translation,
    /// OpenCV's feature-based stitcher; requires the `opencv` feature.
    Opencv,
}

impl StitcherBackend {
    /// Instantiate the backend, failing when it was not compiled in.
    pub fn build(self) -> Result<Box<dyn Stitcher>> {
        match self {
            StitcherBackend::Translation => Ok(Box::new(TranslationStitcher::new())),
            #[cfg(feature = "opencv")]
            StitcherBackend::Opencv => Ok(Box::new(pano_core::OpenCvStitcher)),
            #[cfg(not(feature = "opencv"))]
            StitcherBackend::Opencv => {
                bail!("the opencv stitcher is unavailable; rebuild with `--features opencv`")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
/// Knobs read by the acceptance loop and the stitch scheduler during a session.
pub struct SessionSettings {
    /// Mean luminance difference a frame must exceed to be kept.
    pub scene_threshold: f64,
    /// Minimum time between two accepted frames.
    pub capture_interval: Duration,
    /// Frames required before a fusion attempt is made.
    pub min_frames_before_stitch: usize,
    /// Cap on stored frames; later candidates are skipped.
    pub max_frames: usize,
    /// Pre-warp accepted frames onto a cylinder.
    pub cylindrical_warp: bool,
    /// Camera model assumed by the pre-warp.
    pub projection: ProjectionParams,
    /// Ask the loop-closure detector before each fusion.
    pub loop_closure: bool,
    /// Leading frames re-appended when the loop is closed.
    pub wrap_frames: usize,
    /// Accepted frames wider than this are downscaled before storage.
    pub max_frame_width: u32,
    /// Cadence of the acceptance loop.
    pub poll_interval: Duration,
    /// Upper bound on how long the scheduler blocks waiting for a request.
    pub scheduler_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scene_threshold: 25.0,
            capture_interval: Duration::from_millis(1_500),
            min_frames_before_stitch: 3,
            max_frames: 50,
            cylindrical_warp: true,
            projection: ProjectionParams::default(),
            loop_closure: true,
            wrap_frames: 3,
            max_frame_width: 800,
            poll_interval: Duration::from_millis(100),
            scheduler_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing output.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log level to `debug`.
    pub verbose: bool,
}

#[derive(Clone, Debug)]
/// Canonical configuration for a capture run.
pub struct CaptureConfig {
    /// Device index, `webcam`, `/dev/videoN`, stream URL or image directory.
    pub source: String,
    /// Backend settings handed to the source opener.
    pub source_options: SourceOptions,
    /// Brightness/contrast applied by the producer.
    pub adjust: FrameAdjust,
    /// Capacity of the drop-oldest frame queue.
    pub queue_capacity: usize,
    pub session: SessionSettings,
    /// Default destination for the finished panorama.
    pub output: PathBuf,
    /// Address of the HTTP preview server, if enabled.
    pub preview_addr: Option<SocketAddr>,
    pub stitcher: StitcherBackend,
    pub telemetry: TelemetryOptions,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "webcam".to_string(),
            source_options: SourceOptions::default(),
            adjust: FrameAdjust::default(),
            queue_capacity: 5,
            session: SessionSettings::default(),
            output: PathBuf::from("panorama.jpg"),
            preview_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
            stitcher: StitcherBackend::Translation,
            telemetry: TelemetryOptions::default(),
        }
    }
}

/// CLI arguments accepted by the `capture` subcommand.
#[derive(Debug, Default, Args)]
pub struct CaptureCliArgs {
    /// Camera index, `webcam`, `/dev/videoN`, http(s)/rtsp/udp URL or image directory.
    #[arg(long = "source", value_name = "URI")]
    pub source: Option<String>,
    /// Requested capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<u32>,
    /// Requested capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<u32>,
    /// Scene-change threshold (mean luminance difference, 0-255).
    #[arg(long = "threshold", value_name = "DIFF")]
    pub threshold: Option<f64>,
    /// Minimum seconds between captured frames.
    #[arg(long = "interval", value_name = "SECS")]
    pub interval: Option<f64>,
    /// Frames required before stitching starts.
    #[arg(long = "min-frames", value_name = "N")]
    pub min_frames: Option<usize>,
    /// Maximum number of frames kept per session.
    #[arg(long = "max-frames", value_name = "N")]
    pub max_frames: Option<usize>,
    /// Skip the cylindrical pre-warp of captured frames.
    #[arg(long = "no-warp", action = clap::ArgAction::SetTrue)]
    pub no_warp: bool,
    /// Horizontal field of view assumed by the pre-warp, in degrees.
    #[arg(long = "fov", value_name = "DEGREES")]
    pub fov: Option<f64>,
    /// Disable loop-closure detection and wraparound duplication.
    #[arg(long = "no-loop-closure", action = clap::ArgAction::SetTrue)]
    pub no_loop_closure: bool,
    /// Leading frames appended when a full circle is detected.
    #[arg(long = "wrap-frames", value_name = "N")]
    pub wrap_frames: Option<usize>,
    /// Brightness offset added to every channel.
    #[arg(long = "brightness", value_name = "OFFSET", allow_hyphen_values = true)]
    pub brightness: Option<f32>,
    /// Contrast gain applied to every channel.
    #[arg(long = "contrast", value_name = "GAIN")]
    pub contrast: Option<f32>,
    /// Capacity of the live frame queue.
    #[arg(long = "queue-capacity", value_name = "N")]
    pub queue_capacity: Option<usize>,
    /// Acceptance loop polling interval in milliseconds.
    #[arg(long = "poll-ms", value_name = "MS")]
    pub poll_ms: Option<u64>,
    /// Stored frames wider than this are downscaled.
    #[arg(long = "max-frame-width", value_name = "PX")]
    pub max_frame_width: Option<u32>,
    /// Where the panorama is written when the session ends.
    #[arg(long = "output", short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Preview server bind address.
    #[arg(long = "preview-addr", value_name = "ADDR")]
    pub preview_addr: Option<String>,
    /// Do not start the HTTP preview server.
    #[arg(long = "no-preview", action = clap::ArgAction::SetTrue)]
    pub no_preview: bool,
    /// Fusion backend.
    #[arg(long = "stitcher", value_enum, value_name = "BACKEND")]
    pub stitcher: Option<StitcherBackend>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<CaptureCliArgs> for CaptureConfig {
    type Error = anyhow::Error;

    fn try_from(args: CaptureCliArgs) -> Result<Self> {
        let defaults = CaptureConfig::default();
        let session_defaults = SessionSettings::default();

        let source = args.source.unwrap_or(defaults.source);
        if source.trim().is_empty() {
            bail!("--source must not be empty");
        }

        let mut source_options = defaults.source_options;
        source_options.width = args.width.unwrap_or(source_options.width);
        source_options.height = args.height.unwrap_or(source_options.height);
        if source_options.width == 0 || source_options.height == 0 {
            bail!("Capture width and height must be positive integers");
        }

        let scene_threshold = args.threshold.unwrap_or(session_defaults.scene_threshold);
        if !scene_threshold.is_finite() || scene_threshold < 0.0 {
            bail!("--threshold must be a non-negative number");
        }

        let capture_interval = match args.interval {
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
            Some(_) => bail!("--interval must be a positive number of seconds"),
            None => session_defaults.capture_interval,
        };

        let min_frames_before_stitch = args
            .min_frames
            .unwrap_or(session_defaults.min_frames_before_stitch);
        if min_frames_before_stitch == 0 {
            bail!("--min-frames must be at least 1");
        }

        let max_frames = args.max_frames.unwrap_or(session_defaults.max_frames);
        if max_frames == 0 {
            bail!("--max-frames must be at least 1");
        }

        let projection = match args.fov {
            Some(fov) => ProjectionParams::new(fov)
                .map_err(|_| anyhow!("--fov must lie strictly between 0 and 180 degrees"))?,
            None => session_defaults.projection,
        };

        let contrast = args.contrast.unwrap_or(1.0);
        if !contrast.is_finite() || contrast <= 0.0 {
            bail!("--contrast must be greater than zero");
        }
        let brightness = args.brightness.unwrap_or(0.0);
        if !brightness.is_finite() {
            bail!("--brightness must be a finite number");
        }

        let queue_capacity = args.queue_capacity.unwrap_or(defaults.queue_capacity);
        if queue_capacity == 0 {
            bail!("--queue-capacity must be at least 1");
        }

        let poll_interval = match args.poll_ms {
            Some(0) => bail!("--poll-ms must be positive"),
            Some(ms) => Duration::from_millis(ms),
            None => session_defaults.poll_interval,
        };

        let max_frame_width = args
            .max_frame_width
            .unwrap_or(session_defaults.max_frame_width);
        if max_frame_width == 0 {
            bail!("--max-frame-width must be at least 1");
        }

        let preview_addr = if args.no_preview {
            None
        } else {
            match args.preview_addr {
                Some(addr) => Some(
                    addr.parse::<SocketAddr>()
                        .with_context(|| format!("invalid --preview-addr `{addr}`"))?,
                ),
                None => defaults.preview_addr,
            }
        };

        let session = SessionSettings {
            scene_threshold,
            capture_interval,
            min_frames_before_stitch,
            max_frames,
            cylindrical_warp: !args.no_warp,
            projection,
            loop_closure: !args.no_loop_closure,
            wrap_frames: args.wrap_frames.unwrap_or(session_defaults.wrap_frames),
            max_frame_width,
            poll_interval,
            scheduler_timeout: session_defaults.scheduler_timeout,
        };

        let telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace,
            verbose: args.verbose,
        };

        Ok(Self {
            source,
            source_options,
            adjust: FrameAdjust::new(brightness, contrast),
            queue_capacity,
            session,
            output: args.output.unwrap_or(defaults.output),
            preview_addr,
            stitcher: args.stitcher.unwrap_or(defaults.stitcher),
            telemetry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args_yield_documented_defaults() {
        let config = CaptureConfig::try_from(CaptureCliArgs::default()).unwrap();
        assert_eq!(config.source, "webcam");
        assert_eq!((config.source_options.width, config.source_options.height), (1280, 720));
        assert_eq!(config.queue_capacity, 5);
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.session.scene_threshold, 25.0);
        assert_eq!(config.session.capture_interval, Duration::from_millis(1_500));
        assert_eq!(config.output, PathBuf::from("panorama.jpg"));
        assert_eq!(config.preview_addr, Some(SocketAddr::from(([0, 0, 0, 0], 8080))));
        assert_eq!(config.stitcher, StitcherBackend::Translation);
        assert!(config.adjust.is_identity());
    }

    #[test]
    fn flags_override_defaults() {
        let args = CaptureCliArgs {
            source: Some("rtsp://cam/stream".into()),
            threshold: Some(12.5),
            interval: Some(0.5),
            no_warp: true,
            fov: Some(90.0),
            no_loop_closure: true,
            no_preview: true,
            contrast: Some(1.2),
            ..CaptureCliArgs::default()
        };
        let config = CaptureConfig::try_from(args).unwrap();
        assert_eq!(config.source, "rtsp://cam/stream");
        assert_eq!(config.session.scene_threshold, 12.5);
        assert_eq!(config.session.capture_interval, Duration::from_millis(500));
        assert!(!config.session.cylindrical_warp);
        assert_eq!(config.session.projection.fov_degrees, 90.0);
        assert!(!config.session.loop_closure);
        assert!(config.preview_addr.is_none());
        assert!(!config.adjust.is_identity());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            CaptureCliArgs {
                threshold: Some(-1.0),
                ..CaptureCliArgs::default()
            },
            CaptureCliArgs {
                interval: Some(0.0),
                ..CaptureCliArgs::default()
            },
            CaptureCliArgs {
                max_frames: Some(0),
                ..CaptureCliArgs::default()
            },
            CaptureCliArgs {
                fov: Some(180.0),
                ..CaptureCliArgs::default()
            },
            CaptureCliArgs {
                contrast: Some(0.0),
                ..CaptureCliArgs::default()
            },
            CaptureCliArgs {
                queue_capacity: Some(0),
                ..CaptureCliArgs::default()
            },
            CaptureCliArgs {
                preview_addr: Some("not-an-address".into()),
                ..CaptureCliArgs::default()
            },
        ];
        for args in cases {
            let debug = format!("{args:?}");
            assert!(CaptureConfig::try_from(args).is_err(), "accepted {debug}");
        }
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn opencv_backend_requires_feature() {
        assert!(StitcherBackend::Opencv.build().is_err());
        assert!(StitcherBackend::Translation.build().is_ok());
    }
}
