//! CropAndResize3D: ボリュームから3Dボックスを切り出し、固定サイズのグリッドにリサンプリングするモジュール

use log::debug;
use ndarray::parallel::prelude::*;
use ndarray::{s, Array5, ArrayView1, ArrayView2, ArrayView4, ArrayView5, ArrayViewMut1, Axis};
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geometry::{CropGeometry, Extrapolation};
use crate::sampling::{Method, Neighborhood};

pub const OP_NAME: &str = "CropAndResize3D";

/// CropAndResize3D 系の演算子に共通する設定
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CropAndResizeConfig {
    /// サンプリング方法
    pub method: Method,
    /// ボリューム外の扱い
    pub extrapolation: Extrapolation,
}

/// ボリュームから各ボックスを切り出し、`crop_size` のグリッドにリサンプリングします。
///
/// # Args
///
/// * `image` - `[batch, depth, height, width, channels]` のボリューム
/// * `boxes` - `[num_boxes, 6]` の正規化ボックス `(z1, y1, x1, z2, y2, x2)`
/// * `box_index` - `[num_boxes]` の各ボックスのバッチ番号
/// * `crop_size` - 出力グリッドの (深さ, 高さ, 幅)
/// * `config` - サンプリング設定
///
/// # Return
/// * `[num_boxes, crop_d, crop_h, crop_w, channels]` の切り出し結果
pub fn crop_and_resize_3d<T>(
    image: ArrayView5<T>,
    boxes: ArrayView2<f32>,
    box_index: ArrayView1<i32>,
    crop_size: [usize; 3],
    config: &CropAndResizeConfig,
) -> Result<Array5<f32>>
where
    T: AsPrimitive<f32> + Send + Sync,
{
    let geometry = CropGeometry::new(
        OP_NAME,
        image.shape(),
        boxes,
        box_index,
        crop_size,
        config.extrapolation,
    )?;
    debug!(
        "{}: image {:?}, {} boxes, crop {:?}, {}",
        OP_NAME,
        image.shape(),
        geometry.num_boxes(),
        crop_size,
        config.method
    );

    let [cd, ch, cw] = crop_size;
    let mut crops = Array5::<f32>::zeros((geometry.num_boxes(), cd, ch, cw, geometry.channels));
    let fill = config.extrapolation.fill_value();

    crops
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(geometry.plans.par_iter())
        .for_each(|(mut crop, plan)| {
            let volume = image.index_axis(Axis(0), plan.batch);
            let [zs, ys, xs] = &plan.axes;
            for (z, sz) in zs.iter().enumerate() {
                for (y, sy) in ys.iter().enumerate() {
                    for (x, sx) in xs.iter().enumerate() {
                        let mut out = crop.slice_mut(s![z, y, x, ..]);
                        match Neighborhood::from_samples(sz, sy, sx) {
                            Some(n) => sample_into(&volume, &n, config.method, out),
                            None => out.fill(fill),
                        }
                    }
                }
            }
        });

    Ok(crops)
}

/// 1点分の全チャネルの値を `out` に書き込みます。`out` は0で初期化されている必要があります。
fn sample_into<T>(
    volume: &ArrayView4<T>,
    n: &Neighborhood,
    method: Method,
    mut out: ArrayViewMut1<f32>,
) where
    T: AsPrimitive<f32>,
{
    match method {
        Method::Trilinear => {
            for (c, w) in n.corners().iter().zip(n.weights()) {
                if w == 0.0 {
                    continue;
                }
                let lane = volume.slice(s![c[0], c[1], c[2], ..]);
                out.zip_mut_with(&lane, |o, &v| {
                    let v: f32 = v.as_();
                    *o += w * v;
                });
            }
        }
        Method::Nearest => {
            let [z, y, x] = n.nearest();
            let lane = volume.slice(s![z, y, x, ..]);
            out.zip_mut_with(&lane, |o, &v| *o = v.as_());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpError;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array};

    fn ramp(shape: (usize, usize, usize, usize, usize)) -> Array5<f32> {
        let n = shape.0 * shape.1 * shape.2 * shape.3 * shape.4;
        Array::from_shape_vec(shape, (0..n).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn full_box_at_native_resolution_is_identity() {
        let image = ramp((2, 3, 4, 5, 2));
        let boxes = arr2(&[[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0]; 2]);
        let crops = crop_and_resize_3d(
            image.view(),
            boxes.view(),
            arr1(&[0, 1]).view(),
            [3, 4, 5],
            &CropAndResizeConfig::default(),
        )
        .unwrap();
        assert_eq!(crops, image);
    }

    #[test]
    fn box_ending_on_the_last_plane_samples_it() {
        let image = Array5::<f32>::ones((1, 2, 2, 2, 1));
        let boxes = arr2(&[[0.2f32, 0.0, 0.0, 1.0, 1.0, 1.0]]);
        let crops = crop_and_resize_3d(
            image.view(),
            boxes.view(),
            arr1(&[0]).view(),
            [4, 1, 1],
            &CropAndResizeConfig::default(),
        )
        .unwrap();
        for v in crops.iter() {
            assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn integer_volumes_are_accepted() {
        let image = Array5::<u8>::from_elem((1, 2, 2, 2, 1), 7);
        let boxes = arr2(&[[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0]]);
        let crops = crop_and_resize_3d(
            image.view(),
            boxes.view(),
            arr1(&[0]).view(),
            [3, 3, 3],
            &CropAndResizeConfig::default(),
        )
        .unwrap();
        assert!(crops.iter().all(|&v| (v - 7.0).abs() < 1e-6));
    }

    #[test]
    fn midpoint_is_trilinear_average() {
        let image = ramp((1, 2, 2, 2, 1));
        // 単一出力はボックス中心 (0.5, 0.5, 0.5) をサンプリングする
        let boxes = arr2(&[[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0]]);
        let crops = crop_and_resize_3d(
            image.view(),
            boxes.view(),
            arr1(&[0]).view(),
            [1, 1, 1],
            &CropAndResizeConfig::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(crops[[0, 0, 0, 0, 0]], 3.5, epsilon = 1e-6);
    }

    #[test]
    fn nearest_picks_closest_voxel() {
        let image = ramp((1, 2, 2, 2, 1));
        let boxes = arr2(&[[0.2f32, 0.2, 0.8, 0.2, 0.2, 0.8]]);
        let config = CropAndResizeConfig {
            method: Method::Nearest,
            ..Default::default()
        };
        let crops =
            crop_and_resize_3d(image.view(), boxes.view(), arr1(&[0]).view(), [1, 1, 1], &config)
                .unwrap();
        // (0, 0, 1) のボクセル
        assert_eq!(crops[[0, 0, 0, 0, 0]], 1.0);
    }

    #[test]
    fn outside_samples_use_extrapolation_value() {
        let image = ramp((1, 3, 3, 3, 1));
        let boxes = arr2(&[[-1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0]]);
        let config = CropAndResizeConfig {
            extrapolation: Extrapolation::Constant(-5.0),
            ..Default::default()
        };
        let crops =
            crop_and_resize_3d(image.view(), boxes.view(), arr1(&[0]).view(), [3, 3, 3], &config)
                .unwrap();
        // 深さ方向の先頭は z = -2 でボリューム外
        assert!(crops.slice(s![0, 0, .., .., ..]).iter().all(|&v| v == -5.0));
        // 深さ方向の末尾は z = 2
        assert_eq!(crops[[0, 2, 0, 0, 0]], image[[0, 2, 0, 0, 0]]);
    }

    #[test]
    fn clamp_replicates_border_voxels() {
        let image = ramp((1, 3, 3, 3, 1));
        let boxes = arr2(&[[-1.0f32, 0.0, 0.0, -0.5, 1.0, 1.0]]);
        let config = CropAndResizeConfig {
            extrapolation: Extrapolation::Clamp,
            ..Default::default()
        };
        let crops =
            crop_and_resize_3d(image.view(), boxes.view(), arr1(&[0]).view(), [2, 3, 3], &config)
                .unwrap();
        for z in 0..2 {
            assert_eq!(
                crops.slice(s![0, z, .., .., 0]),
                image.slice(s![0, 0, .., .., 0])
            );
        }
    }

    #[test]
    fn degenerate_box_yields_finite_values() {
        let image = ramp((1, 4, 4, 4, 2));
        let boxes = arr2(&[[0.5f32, 0.1, 0.1, 0.5, 0.9, 0.9]]);
        let crops = crop_and_resize_3d(
            image.view(),
            boxes.view(),
            arr1(&[0]).view(),
            [3, 3, 3],
            &CropAndResizeConfig::default(),
        )
        .unwrap();
        assert!(crops.iter().all(|v| v.is_finite()));
        // 深さ方向は同じ平面の複製になる
        assert_eq!(crops.slice(s![0, 0, .., .., ..]), crops.slice(s![0, 2, .., .., ..]));
    }

    #[test]
    fn flipped_box_reverses_axis() {
        let image = ramp((1, 3, 1, 1, 1));
        let boxes = arr2(&[[1.0f32, 0.0, 0.0, 0.0, 0.0, 0.0]]);
        let crops = crop_and_resize_3d(
            image.view(),
            boxes.view(),
            arr1(&[0]).view(),
            [3, 1, 1],
            &CropAndResizeConfig::default(),
        )
        .unwrap();
        let depth: Vec<f32> = crops.iter().copied().collect();
        assert_eq!(depth, vec![2.0, 1.0, 0.0]);
    }

    #[test]
    fn out_of_range_box_index_is_rejected() {
        let image = ramp((3, 2, 2, 2, 1));
        let boxes = arr2(&[[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0]]);
        let err = crop_and_resize_3d(
            image.view(),
            boxes.view(),
            arr1(&[5]).view(),
            [2, 2, 2],
            &CropAndResizeConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            OpError::BoxIndexOutOfRange {
                index: 5,
                batch: 3,
                ..
            }
        ));
    }

    #[test]
    fn no_boxes_gives_empty_output() {
        let image = ramp((1, 2, 2, 2, 3));
        let boxes = Array::<f32, _>::zeros((0, 6));
        let crops = crop_and_resize_3d(
            image.view(),
            boxes.view(),
            Array::<i32, _>::zeros(0).view(),
            [2, 2, 2],
            &CropAndResizeConfig::default(),
        )
        .unwrap();
        assert_eq!(crops.shape(), &[0, 2, 2, 2, 3]);
    }
}
