use std::{fs, process::Command};

use image::{Rgb, RgbImage};

fn photosphere() -> Command {
    Command::new(env!("CARGO_BIN_EXE_photosphere"))
}

#[test]
fn view_renders_and_exits_zero_on_quit() {
    let dir = tempfile::tempdir().unwrap();
    let pano = dir.path().join("pano.png");
    RgbImage::from_fn(400, 100, |x, _| Rgb([(x % 256) as u8, 90, 140]))
        .save(&pano)
        .unwrap();
    let script = dir.path().join("tour.txt");
    let view = dir.path().join("view.png");
    fs::write(&script, format!("right\ndrag 30 -8\nrender {}\nq\n", view.display())).unwrap();

    let status = photosphere()
        .arg("view")
        .arg(&pano)
        .args(["--width", "160", "--height", "90", "--script"])
        .arg(&script)
        .status()
        .unwrap();

    assert!(status.success());
    let rendered = image::open(&view).unwrap();
    assert_eq!((rendered.width(), rendered.height()), (160, 90));
}

#[test]
fn view_exits_nonzero_when_image_cannot_load() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("tour.txt");
    fs::write(&script, "q\n").unwrap();

    let output = photosphere()
        .arg("view")
        .arg(dir.path().join("missing.jpg"))
        .arg("--script")
        .arg(&script)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("could not load panorama"), "{stderr}");
}

#[test]
fn capture_rejects_invalid_options() {
    let output = photosphere()
        .args(["capture", "--no-preview", "--max-frames", "0"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--max-frames"), "{stderr}");
}
