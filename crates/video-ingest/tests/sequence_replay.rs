use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use image::{Rgb, RgbImage};
use video_ingest::{
    FrameAdjust, LatestFrameQueue, ProducerExit, ProducerStats, SourceKind, SourceOpener,
    SourceOptions, StandardOpener, run_producer,
};

fn image_directory(count: u8) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..count {
        RgbImage::from_pixel(8, 4, Rgb([i * 10, 0, 0]))
            .save(dir.path().join(format!("frame_{i:02}.png")))
            .unwrap();
    }
    dir
}

#[test]
fn directory_replays_through_producer_and_keeps_newest() {
    let dir = image_directory(6);
    let identifier = dir.path().display().to_string();
    assert!(matches!(
        SourceKind::parse(&identifier),
        SourceKind::ImageSequence(_)
    ));

    let opener = StandardOpener::new(SourceOptions {
        sequence_interval: Duration::from_millis(1),
        ..SourceOptions::default()
    });
    let source = opener.open(&identifier).unwrap();

    let queue = LatestFrameQueue::new(2);
    let stats = Arc::new(ProducerStats::default());
    let exit = run_producer(
        source,
        queue.clone(),
        Arc::new(AtomicBool::new(true)),
        FrameAdjust::new(5.0, 1.0),
        stats.clone(),
    );

    assert_eq!(exit, ProducerExit::EndOfStream);
    assert_eq!(stats.frames(), 6);
    assert_eq!(queue.dropped(), 4);

    let newest = queue.latest().unwrap();
    assert_eq!(newest.sequence(), 5);
    // Red 50 becomes 55 after the brightness offset; stored as BGR.
    assert_eq!(&newest.data()[..3], &[5, 5, 55]);
    assert!(queue.latest().is_none());
}

#[test]
fn stopped_producer_exits_without_reading() {
    let dir = image_directory(3);
    let opener = StandardOpener::default();
    let source = opener.open(&dir.path().display().to_string()).unwrap();
    let running = Arc::new(AtomicBool::new(false));
    let queue = LatestFrameQueue::new(5);

    let exit = run_producer(
        source,
        queue.clone(),
        running.clone(),
        FrameAdjust::default(),
        Arc::new(ProducerStats::default()),
    );

    assert_eq!(exit, ProducerExit::Stopped);
    assert!(queue.is_empty());
    assert!(!running.load(Ordering::SeqCst));
}

#[test]
fn empty_directory_cannot_be_opened() {
    let dir = tempfile::tempdir().unwrap();
    let err = StandardOpener::default()
        .open(&dir.path().display().to_string())
        .err()
        .unwrap();
    assert!(err.to_string().contains("failed to open video source"));
}
