//! CropAndResize3DGradImage: 切り出し結果の勾配を元のボリュームへ逆伝播するモジュール

use log::debug;
use ndarray::parallel::prelude::*;
use ndarray::{s, Array5, ArrayView1, ArrayView2, ArrayView5, Axis};

use crate::crop_and_resize::CropAndResizeConfig;
use crate::error::{OpError, Result};
use crate::geometry::CropGeometry;
use crate::sampling::{Method, Neighborhood};

pub const OP_NAME: &str = "CropAndResize3DGradImage";

/// 切り出し結果の勾配をボリュームの勾配に変換します。
///
/// 各出力点の勾配は、順伝播と同じ重みで近傍ボクセルに加算されます。
/// 出力はバッチ単位で分割され、各バッチ内では入力順にボックスを処理するため、
/// スレッド数によらず結果は決定的です。
///
/// # Args
///
/// * `grads` - `[num_boxes, crop_d, crop_h, crop_w, channels]` の勾配
/// * `boxes` - `[num_boxes, 6]` の正規化ボックス
/// * `box_index` - `[num_boxes]` の各ボックスのバッチ番号
/// * `image_size` - 元のボリュームの形状 `[batch, depth, height, width, channels]`
/// * `config` - 順伝播と同じサンプリング設定
///
/// # Return
/// * `image_size` の形状を持つ勾配
pub fn crop_and_resize_3d_grad_image(
    grads: ArrayView5<f32>,
    boxes: ArrayView2<f32>,
    box_index: ArrayView1<i32>,
    image_size: [usize; 5],
    config: &CropAndResizeConfig,
) -> Result<Array5<f32>> {
    let g = grads.shape();
    let geometry = CropGeometry::new(
        OP_NAME,
        &image_size,
        boxes,
        box_index,
        [g[1], g[2], g[3]],
        config.extrapolation,
    )?;
    if g[0] != geometry.num_boxes() {
        return Err(OpError::shape(
            OP_NAME,
            format!(
                "grads has {} rows but there are {} boxes",
                g[0],
                geometry.num_boxes()
            ),
        ));
    }
    if g[4] != geometry.channels {
        return Err(OpError::shape(
            OP_NAME,
            format!(
                "grads has {} channels but image_size has {}",
                g[4], geometry.channels
            ),
        ));
    }
    debug!(
        "{}: grads {:?}, image_size {:?}, {}",
        OP_NAME, g, image_size, config.method
    );

    let mut members: Vec<Vec<usize>> = vec![vec![]; geometry.batch];
    for (i, plan) in geometry.plans.iter().enumerate() {
        members[plan.batch].push(i);
    }

    let mut output = Array5::<f32>::zeros(image_size);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(members.par_iter())
        .for_each(|(mut volume, ids)| {
            for &i in ids {
                let plan = &geometry.plans[i];
                let grad = grads.index_axis(Axis(0), i);
                let [zs, ys, xs] = &plan.axes;
                for (z, sz) in zs.iter().enumerate() {
                    for (y, sy) in ys.iter().enumerate() {
                        for (x, sx) in xs.iter().enumerate() {
                            let Some(n) = Neighborhood::from_samples(sz, sy, sx) else {
                                continue;
                            };
                            let lane = grad.slice(s![z, y, x, ..]);
                            match config.method {
                                Method::Trilinear => {
                                    for (c, w) in n.corners().iter().zip(n.weights()) {
                                        if w == 0.0 {
                                            continue;
                                        }
                                        volume
                                            .slice_mut(s![c[0], c[1], c[2], ..])
                                            .scaled_add(w, &lane);
                                    }
                                }
                                Method::Nearest => {
                                    let [nz, ny, nx] = n.nearest();
                                    volume.slice_mut(s![nz, ny, nx, ..]).scaled_add(1.0, &lane);
                                }
                            }
                        }
                    }
                }
            }
        });

    Ok(output)
}
