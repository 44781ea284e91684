use std::{fs, io::Cursor, path::Path};

use image::{Rgb, RgbImage};
use pano_viewer::{ViewerConfig, ViewerError, ViewerExit, run};

/// Dark gray panorama with a bright column at yaw 0.
fn write_panorama(path: &Path) {
    let image = RgbImage::from_fn(720, 180, |x, _| {
        if (358..=362).contains(&x) {
            Rgb([250, 250, 250])
        } else {
            Rgb([30, 30, 30])
        }
    });
    image.save(path).unwrap();
}

fn small_config(image: &Path) -> ViewerConfig {
    ViewerConfig {
        view_width: 120,
        view_height: 80,
        ..ViewerConfig::new(image)
    }
}

#[test]
fn scripted_tour_renders_views_and_stops_at_quit() {
    let dir = tempfile::tempdir().unwrap();
    let pano = dir.path().join("pano.png");
    write_panorama(&pano);
    let ahead = dir.path().join("ahead.png");
    let behind = dir.path().join("behind.png");
    let never = dir.path().join("never.png");

    let script = format!(
        "# look ahead, then turn around\nrender {}\ndrag 360 0\nrender {}\nq\nrender {}\n",
        ahead.display(),
        behind.display(),
        never.display()
    );
    let summary = run(&small_config(&pano), Cursor::new(script)).unwrap();

    assert_eq!(summary.exit, ViewerExit::Quit);
    assert_eq!(summary.rendered, vec![ahead.clone(), behind.clone()]);
    assert_eq!(summary.state.yaw(), 180.0);
    assert!(!never.exists());

    let ahead = image::open(&ahead).unwrap().to_rgb8();
    let behind = image::open(&behind).unwrap().to_rgb8();
    assert_eq!(ahead.dimensions(), (120, 80));
    // Below the HUD band the stripe is visible ahead and gone behind.
    assert!(ahead.get_pixel(60, 60).0[0] > 200);
    assert!(behind.get_pixel(60, 60).0[0] < 60);
}

#[test]
fn final_view_is_written_when_input_ends() {
    let dir = tempfile::tempdir().unwrap();
    let pano = dir.path().join("pano.jpg");
    write_panorama(&pano);
    let output = dir.path().join("final.png");
    let config = ViewerConfig {
        output: Some(output.clone()),
        ..small_config(&pano)
    };

    let summary = run(&config, Cursor::new("+\n+\nup\n")).unwrap();
    assert_eq!(summary.exit, ViewerExit::EndOfInput);
    assert_eq!(summary.state.fov(), 100.0);
    assert_eq!(summary.state.pitch(), 5.0);
    assert_eq!(summary.rendered, vec![output.clone()]);
    assert!(fs::metadata(&output).unwrap().len() > 0);
}

#[test]
fn missing_image_fails_before_reading_commands() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(&dir.path().join("absent.jpg"));
    let err = run(&config, Cursor::new("q\n")).unwrap_err();
    assert!(matches!(err, ViewerError::Load { .. }));
}

#[test]
fn bad_command_reports_its_line() {
    let dir = tempfile::tempdir().unwrap();
    let pano = dir.path().join("pano.png");
    write_panorama(&pano);
    let err = run(&small_config(&pano), Cursor::new("left\n\nspin 3\n")).unwrap_err();
    match err {
        ViewerError::Script { line, message } => {
            assert_eq!(line, 3);
            assert!(message.contains("spin"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
