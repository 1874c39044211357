//! 出力グリッドからボリューム座標への写像を扱うモジュール
//!
//! 順伝播 (`crop_and_resize`) と2つの逆伝播 (`grad_image`, `grad_boxes`) は
//! すべてこのモジュールの [`CropGeometry`] を通して座標を求めます。
//! 座標計算を別々に書くと勾配が順伝播と一致しなくなるため、ここ以外で計算してはいけません。

use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::boxes::{check_box_index, parse_boxes, Box3D};
use crate::error::{OpError, Result};

/// 境界に吸着させる座標の相対許容誤差
const EDGE_EPS: f32 = 1e-6;

/// ボリューム外の点をサンプリングしたときの扱い
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extrapolation {
    /// 定数で埋める。勾配は流れない
    Constant(f32),
    /// 最も近い有効なボクセルの値を複製する
    Clamp,
}

impl Default for Extrapolation {
    fn default() -> Self {
        Self::Constant(0.0)
    }
}

impl Extrapolation {
    /// サンプリングできない点に書き込む値
    pub fn fill_value(&self) -> f32 {
        match self {
            Self::Constant(v) => *v,
            Self::Clamp => 0.0,
        }
    }
}

/// 1軸分のサンプリング位置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSample {
    /// ボリューム上の座標 (ボクセル単位)
    pub coord: f32,
    /// floor側の近傍インデックス
    pub lower: usize,
    /// ceil側の近傍インデックス
    pub upper: usize,
    /// `coord - lower`
    pub lerp: f32,
    /// 最近傍インデックス
    pub nearest: usize,
    /// `coord` のボックス開始座標に対する偏微分
    pub d_lo: f32,
    /// `coord` のボックス終了座標に対する偏微分
    pub d_hi: f32,
}

/// 出力インデックス `i` をボリューム座標に写像し、その座標と偏微分 (d/d lo, d/d hi) を返します。
///
/// # Args
///
/// * `lo`, `hi` - ボックスのこの軸における開始・終了 (正規化座標)
/// * `len` - ボリュームのこの軸の長さ
/// * `crop_len` - 出力グリッドのこの軸の長さ
/// * `i` - 出力インデックス
///
/// # Return
/// * (座標, d/d lo, d/d hi)
pub fn source_coord(lo: f32, hi: f32, len: usize, crop_len: usize, i: usize) -> (f32, f32, f32) {
    let extent = (len - 1) as f32;
    if crop_len > 1 {
        let denom = (crop_len - 1) as f32;
        let scale = (hi - lo) * extent / denom;
        let t = i as f32 / denom;
        (lo * extent + i as f32 * scale, extent * (1.0 - t), extent * t)
    } else {
        (0.5 * (lo + hi) * extent, 0.5 * extent, 0.5 * extent)
    }
}

/// 出力インデックス `i` に対応するサンプリング位置を計算します。
///
/// # Return
/// * サンプリング位置。ボリューム外で [`Extrapolation::Constant`] の場合は `None`
pub fn axis_sample(
    lo: f32,
    hi: f32,
    len: usize,
    crop_len: usize,
    i: usize,
    extrapolation: Extrapolation,
) -> Option<AxisSample> {
    let (mut coord, mut d_lo, mut d_hi) = source_coord(lo, hi, len, crop_len, i);
    let max = (len - 1) as f32;

    if coord.is_nan() {
        return None;
    }
    // 丸め誤差で境界をわずかに越えた座標はボリューム内として扱う
    let tol = EDGE_EPS * max.max(1.0);
    if coord.abs() <= tol {
        coord = 0.0;
    } else if (coord - max).abs() <= tol {
        coord = max;
    }
    if coord < 0.0 || coord > max {
        match extrapolation {
            Extrapolation::Constant(_) => return None,
            Extrapolation::Clamp => {
                coord = coord.clamp(0.0, max);
                d_lo = 0.0;
                d_hi = 0.0;
            }
        }
    }
    // 幅0の軸では微分を0と定める
    if lo == hi {
        d_lo = 0.0;
        d_hi = 0.0;
    }

    // 格子点上でも微分が消えないよう、常に幅1のセルを選ぶ (端では片側差分)
    let lower = (coord.floor() as usize).min(len.saturating_sub(2));
    let upper = (lower + 1).min(len - 1);
    Some(AxisSample {
        coord,
        lower,
        upper,
        lerp: coord - lower as f32,
        nearest: coord.round() as usize,
        d_lo,
        d_hi,
    })
}

/// 1つのボックスについて、各軸の全出力インデックスのサンプリング位置をまとめたもの
#[derive(Debug, Clone, PartialEq)]
pub struct BoxPlan {
    /// 切り出し元のバッチ番号
    pub batch: usize,
    /// 元のボックス
    pub bbox: Box3D,
    /// (深さ, 高さ, 幅) それぞれのサンプリング位置
    pub axes: [Vec<Option<AxisSample>>; 3],
}

impl BoxPlan {
    pub fn new(
        bbox: Box3D,
        batch: usize,
        image_dims: [usize; 3],
        crop_size: [usize; 3],
        extrapolation: Extrapolation,
    ) -> Self {
        let bounds = bbox.axis_bounds();
        let axes: [Vec<Option<AxisSample>>; 3] = [0, 1, 2].map(|a| {
            let (lo, hi) = bounds[a];
            (0..crop_size[a])
                .map(|i| axis_sample(lo, hi, image_dims[a], crop_size[a], i, extrapolation))
                .collect()
        });
        Self { batch, bbox, axes }
    }
}

/// 検証済みの入力形状とボックスごとのサンプリング計画
#[derive(Debug, Clone)]
pub struct CropGeometry {
    /// バッチサイズ
    pub batch: usize,
    /// ボリュームの (深さ, 高さ, 幅)
    pub image_dims: [usize; 3],
    /// チャネル数
    pub channels: usize,
    /// 出力グリッドの (深さ, 高さ, 幅)
    pub crop_size: [usize; 3],
    /// ボックスごとの計画
    pub plans: Vec<BoxPlan>,
}

impl CropGeometry {
    /// 入力を検証し、ボックスごとのサンプリング計画を作成します。
    ///
    /// # Args
    ///
    /// * `op` - エラーメッセージに使う演算子名
    /// * `image_shape` - ボリュームの形状 `[batch, depth, height, width, channels]`
    /// * `boxes` - `[num_boxes, 6]` のボックス
    /// * `box_index` - `[num_boxes]` のバッチ番号
    /// * `crop_size` - 出力グリッドの (深さ, 高さ, 幅)
    /// * `extrapolation` - ボリューム外の扱い
    ///
    /// # Return
    /// * 新たなCropGeometryインスタンス
    pub fn new(
        op: &'static str,
        image_shape: &[usize],
        boxes: ArrayView2<f32>,
        box_index: ArrayView1<i32>,
        crop_size: [usize; 3],
        extrapolation: Extrapolation,
    ) -> Result<Self> {
        if image_shape.len() != 5 {
            return Err(OpError::InvalidRank {
                op,
                name: "image",
                expected: 5,
                shape: image_shape.to_vec(),
            });
        }
        let image_dims = [image_shape[1], image_shape[2], image_shape[3]];
        if image_dims.iter().any(|&d| d == 0) {
            return Err(OpError::invalid(
                op,
                format!("image dimensions must be positive, got {:?}", image_shape),
            ));
        }
        if crop_size.iter().any(|&d| d == 0) {
            return Err(OpError::invalid(
                op,
                format!("crop dimensions must be positive, got {:?}", crop_size),
            ));
        }

        let batch = image_shape[0];
        let parsed = parse_boxes(op, boxes)?;
        let batch_ids = check_box_index(op, box_index, parsed.len(), batch)?;

        let plans = parsed
            .into_iter()
            .zip(batch_ids)
            .map(|(bbox, b)| BoxPlan::new(bbox, b, image_dims, crop_size, extrapolation))
            .collect();

        Ok(Self {
            batch,
            image_dims,
            channels: image_shape[4],
            crop_size,
            plans,
        })
    }

    pub fn num_boxes(&self) -> usize {
        self.plans.len()
    }
}
