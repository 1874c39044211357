//! CropAndResize3DGradBoxes: 切り出し結果の勾配をボックス座標へ逆伝播するモジュール

use log::debug;
use ndarray::parallel::prelude::*;
use ndarray::{s, Array2, ArrayView1, ArrayView2, ArrayView5, Axis};
use num_traits::AsPrimitive;

use crate::boxes::BOX_COORDS;
use crate::crop_and_resize::CropAndResizeConfig;
use crate::error::{OpError, Result};
use crate::geometry::CropGeometry;
use crate::sampling::{Method, Neighborhood};

pub const OP_NAME: &str = "CropAndResize3DGradBoxes";

/// 切り出し結果の勾配をボックス座標の勾配に変換します。
///
/// 各出力点について、トライリニア補間値の座標に対する偏微分を求め、
/// 座標写像の微分 (d/d lo, d/d hi) を掛けて6つの座標へ加算します。
/// 幅0の軸やクランプされた点の微分は0です。
///
/// # Args
///
/// * `grads` - `[num_boxes, crop_d, crop_h, crop_w, channels]` の勾配
/// * `image` - 順伝播に使ったボリューム
/// * `boxes` - `[num_boxes, 6]` の正規化ボックス
/// * `box_index` - `[num_boxes]` の各ボックスのバッチ番号
/// * `config` - 順伝播と同じサンプリング設定 (トライリニアのみ対応)
///
/// # Return
/// * `[num_boxes, 6]` の勾配 (`boxes` と同じ並び)
pub fn crop_and_resize_3d_grad_boxes<T>(
    grads: ArrayView5<f32>,
    image: ArrayView5<T>,
    boxes: ArrayView2<f32>,
    box_index: ArrayView1<i32>,
    config: &CropAndResizeConfig,
) -> Result<Array2<f32>>
where
    T: AsPrimitive<f32> + Send + Sync,
{
    if config.method != Method::Trilinear {
        return Err(OpError::Unsupported {
            op: OP_NAME,
            reason: format!("box gradients are only defined for trilinear, got {}", config.method),
        });
    }

    let g = grads.shape();
    let geometry = CropGeometry::new(
        OP_NAME,
        image.shape(),
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
                "grads has {} channels but image has {}",
                g[4], geometry.channels
            ),
        ));
    }
    debug!("{}: grads {:?}, image {:?}", OP_NAME, g, image.shape());

    let mut output = Array2::<f32>::zeros((geometry.num_boxes(), BOX_COORDS));
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(grads.axis_iter(Axis(0)).into_par_iter())
        .zip(geometry.plans.par_iter())
        .for_each(|((mut row, grad), plan)| {
            let volume = image.index_axis(Axis(0), plan.batch);
            let mut acc = [0.0f32; BOX_COORDS];
            let mut values = [0.0f32; 8];

            let [zs, ys, xs] = &plan.axes;
            for (z, sz) in zs.iter().enumerate() {
                for (y, sy) in ys.iter().enumerate() {
                    for (x, sx) in xs.iter().enumerate() {
                        let Some(n) = Neighborhood::from_samples(sz, sy, sx) else {
                            continue;
                        };
                        let corners = n.corners();
                        let lanes = corners.map(|c| volume.slice(s![c[0], c[1], c[2], ..]));

                        // 全チャネルの勾配を座標ごとにまとめてから写像の微分を掛ける
                        let mut d_coord = [0.0f32; 3];
                        for (ch, &gv) in grad.slice(s![z, y, x, ..]).iter().enumerate() {
                            if gv == 0.0 {
                                continue;
                            }
                            for (v, lane) in values.iter_mut().zip(lanes.iter()) {
                                *v = lane[ch].as_();
                            }
                            let p = n.partials(&values);
                            for a in 0..3 {
                                d_coord[a] += gv * p[a];
                            }
                        }

                        for (a, (d_lo, d_hi)) in n.coord_derivatives().into_iter().enumerate() {
                            acc[a] += d_coord[a] * d_lo;
                            acc[a + 3] += d_coord[a] * d_hi;
                        }
                    }
                }
            }

            for (o, v) in row.iter_mut().zip(acc) {
                *o = v;
            }
        });

    Ok(output)
}
