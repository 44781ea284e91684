use pano_core::{
    BorderMode, ViewParams, build_spherical_sampling_map, cylindrical_warp, remap_packed3,
};
use video_ingest::Frame;

const PANO_W: u32 = 360;
const PANO_H: u32 = 90;

/// Gray panorama with a red stripe at the column facing yaw 0.
fn striped_panorama() -> Vec<u8> {
    let mut data = Vec::with_capacity((PANO_W * PANO_H * 3) as usize);
    for _y in 0..PANO_H {
        for x in 0..PANO_W {
            if x == PANO_W / 2 {
                data.extend_from_slice(&[0, 0, 255]);
            } else {
                data.extend_from_slice(&[60, 60, 60]);
            }
        }
    }
    data
}

fn render(yaw: f64) -> Vec<u8> {
    let view = ViewParams::new(yaw, 0.0, 60.0, 64, 48);
    let map = build_spherical_sampling_map(PANO_W, PANO_H, &view).unwrap();
    remap_packed3(&striped_panorama(), PANO_W, PANO_H, &map, BorderMode::Wrap)
}

fn pixel(view: &[u8], x: usize, y: usize) -> [u8; 3] {
    let idx = (y * 64 + x) * 3;
    [view[idx], view[idx + 1], view[idx + 2]]
}

#[test]
fn forward_view_shows_stripe_at_center() {
    let view = render(0.0);
    assert_eq!(pixel(&view, 32, 24), [0, 0, 255]);
    assert_eq!(pixel(&view, 5, 24), [60, 60, 60]);
}

#[test]
fn turning_away_hides_the_stripe() {
    let view = render(90.0);
    assert!(view.iter().all(|&c| c == 60));
}

#[test]
fn full_turn_renders_the_same_view() {
    let a = render(10.0);
    let b = render(370.0);
    assert!(a.iter().zip(&b).all(|(x, y)| x.abs_diff(*y) <= 1));
}

#[test]
fn warped_frame_is_stable_across_calls() {
    let data: Vec<u8> = (0..120 * 80 * 3).map(|i| (i * 31 % 256) as u8).collect();
    let frame = Frame::from_bgr(data, 120, 80).unwrap();
    let once = cylindrical_warp(&frame, 68.5).unwrap();
    let again = cylindrical_warp(&frame, 68.5).unwrap();
    assert_eq!(once.data(), again.data());
    assert_eq!((once.width(), once.height()), (120, 80));
}
