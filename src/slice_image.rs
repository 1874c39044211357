//! ボリュームの断面を画像にするモジュール

use anyhow::{ensure, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use ndarray::ArrayView5;
use num_traits::AsPrimitive;

use crate::boxes::Box3D;

/// ボリュームの深さ方向の1断面を8bitグレースケール画像にします。
///
/// 値は断面内の最小値・最大値で0〜255に正規化されます。断面が一様な場合は黒になります。
///
/// # Args
///
/// * `volume` - `[batch, depth, height, width, channels]` のボリューム
/// * `batch` - バッチ番号
/// * `depth` - 深さ方向のインデックス
/// * `channel` - チャネル番号
///
/// # Return
/// * `width x height` の画像
pub fn render_slice<T>(
    volume: ArrayView5<T>,
    batch: usize,
    depth: usize,
    channel: usize,
) -> Result<GrayImage>
where
    T: AsPrimitive<f32>,
{
    let (b, d, h, w, c) = volume.dim();
    ensure!(
        batch < b && depth < d && channel < c,
        "slice ({}, {}, {}) out of range for volume {:?}",
        batch,
        depth,
        channel,
        volume.shape()
    );

    let value = |y: usize, x: usize| -> f32 { volume[[batch, depth, y, x, channel]].as_() };
    let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
    for y in 0..h {
        for x in 0..w {
            let v = value(y, x);
            if v.is_finite() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
    }
    let range = hi - lo;

    let img = GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let v = value(y as usize, x as usize);
        if range > 0.0 && v.is_finite() {
            Luma([((v - lo) / range * 255.0).round() as u8])
        } else {
            Luma([0])
        }
    });
    Ok(img)
}

/// ボックス番号ごとの枠の色。色相を黄金角ずつ回します。
fn box_color(i: usize) -> Rgb<u8> {
    let h = (i as f32 * 137.5).rem_euclid(360.0) / 60.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    let (r, g, b) = match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let to_u8 = |v: f32| (v * 255.0).round() as u8;
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}

/// 2頂点 (画素座標) で与えた矩形の枠を1画素幅で描画します。
fn draw_outline(
    img: &mut RgbImage,
    (x1, y1): (i32, i32),
    (x2, y2): (i32, i32),
    color: Rgb<u8>,
) {
    let w = x1.abs_diff(x2) + 1;
    let h = y1.abs_diff(y2) + 1;
    let rect = Rect::at(x1.min(x2), y1.min(y2)).of_size(w, h);
    draw_hollow_rect_mut(img, rect, color);
}

/// 断面画像を拡大し、断面と交差するボックスの枠を描画します。
///
/// # Args
///
/// * `slice` - [`render_slice`] で作成した断面
/// * `boxes` - 正規化ボックス
/// * `depth` - 断面の深さ方向のインデックス
/// * `num_depth` - ボリュームの深さ
/// * `scale` - 拡大率
///
/// # Return
/// * ボックスの枠を描画したRGB画像
pub fn draw_boxes_on_slice(
    slice: &GrayImage,
    boxes: &[Box3D],
    depth: usize,
    num_depth: usize,
    scale: u32,
) -> RgbImage {
    let scale = scale.max(1);
    let (w, h) = slice.dimensions();
    let mut img = imageops::resize(
        &DynamicImage::ImageLuma8(slice.clone()).to_rgb8(),
        w * scale,
        h * scale,
        FilterType::Nearest,
    );

    let z = if num_depth > 1 {
        depth as f32 / (num_depth - 1) as f32
    } else {
        0.0
    };
    // ボクセル中心を画素中心に合わせる
    let to_px =
        |v: f32, len: u32| ((v * (len.max(1) - 1) as f32 + 0.5) * scale as f32).round() as i32;

    for (i, b) in boxes.iter().enumerate() {
        if !b.contains_depth(z) {
            continue;
        }
        let n = b.normalized();
        draw_outline(
            &mut img,
            (to_px(n.x1, w), to_px(n.y1, h)),
            (to_px(n.x2, w), to_px(n.y2, h)),
            box_color(i),
        );
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array5;

    #[test]
    fn slice_is_min_max_normalized() {
        let volume = Array5::from_shape_fn((1, 2, 2, 3, 1), |(_, z, y, x, _)| {
            (z * 100 + y * 3 + x) as f32
        });
        let img = render_slice(volume.view(), 0, 1, 0).unwrap();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(0, 0)[0], 0);
        assert_eq!(img.get_pixel(2, 1)[0], 255);
    }

    #[test]
    fn flat_slice_is_black() {
        let volume = Array5::<u8>::from_elem((1, 1, 4, 4, 1), 9);
        let img = render_slice(volume.view(), 0, 0, 0).unwrap();
        assert!(img.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn out_of_range_slice_is_rejected() {
        let volume = Array5::<f32>::zeros((1, 2, 2, 2, 1));
        assert!(render_slice(volume.view(), 0, 2, 0).is_err());
    }

    #[test]
    fn only_intersecting_boxes_are_drawn() {
        let slice = GrayImage::new(8, 8);
        let hit = Box3D::new(0.0, 0.0, 0.0, 0.5, 1.0, 1.0);
        let miss = Box3D::new(0.8, 0.0, 0.0, 1.0, 1.0, 1.0);

        let img = draw_boxes_on_slice(&slice, &[miss], 0, 5, 2);
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0]));

        let img = draw_boxes_on_slice(&slice, &[hit], 0, 5, 2);
        assert_eq!(img.dimensions(), (16, 16));
        assert!(img.pixels().any(|p| *p == box_color(0)));
    }

    #[test]
    fn neighbouring_boxes_get_distinct_colors() {
        assert_eq!(box_color(0), Rgb([255, 0, 0]));
        let colors: Vec<_> = (0..6).map(box_color).collect();
        for (i, a) in colors.iter().enumerate() {
            assert!(colors[i + 1..].iter().all(|b| b != a));
        }
    }
}
