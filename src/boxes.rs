//! 3Dバウンディングボックスを扱うモジュール

use ndarray::{ArrayView1, ArrayView2};

use crate::error::{OpError, Result};

/// ボックス1つあたりの座標数
pub const BOX_COORDS: usize = 6;

/// 正規化座標 (0〜1) で表された3Dバウンディングボックス
///
/// `z1 > z2` のような反転したボックスや、幅0のボックスもそのまま保持します。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Box3D {
    /// 深さ方向の開始位置
    pub z1: f32,
    /// 高さ方向の開始位置
    pub y1: f32,
    /// 幅方向の開始位置
    pub x1: f32,
    /// 深さ方向の終了位置
    pub z2: f32,
    /// 高さ方向の終了位置
    pub y2: f32,
    /// 幅方向の終了位置
    pub x2: f32,
}

impl Box3D {
    pub fn new(z1: f32, y1: f32, x1: f32, z2: f32, y2: f32, x2: f32) -> Self {
        Self {
            z1,
            y1,
            x1,
            z2,
            y2,
            x2,
        }
    }

    /// `(z1, y1, x1, z2, y2, x2)` の並びの行からボックスを作成します。
    ///
    /// # Args
    ///
    /// * `row` - 長さ6の行
    ///
    /// # Return
    /// * 新たなBox3Dインスタンス
    pub fn from_row(row: ArrayView1<f32>) -> Self {
        Self::new(row[0], row[1], row[2], row[3], row[4], row[5])
    }

    pub fn to_array(&self) -> [f32; BOX_COORDS] {
        [self.z1, self.y1, self.x1, self.z2, self.y2, self.x2]
    }

    /// 軸ごとの (開始, 終了) を (深さ, 高さ, 幅) の順で返します。
    pub fn axis_bounds(&self) -> [(f32, f32); 3] {
        [(self.z1, self.z2), (self.y1, self.y2), (self.x1, self.x2)]
    }

    /// 各軸の開始・終了を min/max で並べ替えたボックスを返します。
    pub fn normalized(&self) -> Self {
        Self::new(
            self.z1.min(self.z2),
            self.y1.min(self.y2),
            self.x1.min(self.x2),
            self.z1.max(self.z2),
            self.y1.max(self.y2),
            self.x1.max(self.x2),
        )
    }

    pub fn volume(&self) -> f32 {
        let n = self.normalized();
        (n.z2 - n.z1) * (n.y2 - n.y1) * (n.x2 - n.x1)
    }

    /// 別のボックスとの Intersection over Union (IoU) を計算します。
    ///
    /// 体積が0以下のボックスが含まれる場合は0を返します。
    ///
    /// # Args
    ///
    /// * `other` - 比較対象のボックス
    ///
    /// # Return
    /// * IoU (0〜1)
    pub fn iou(&self, other: &Self) -> f32 {
        let a = self.normalized();
        let b = other.normalized();
        let vol_a = a.volume();
        let vol_b = b.volume();
        if vol_a <= 0.0 || vol_b <= 0.0 {
            return 0.0;
        }

        let dz = (a.z2.min(b.z2) - a.z1.max(b.z1)).max(0.0);
        let dy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
        let dx = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
        let intersection = dz * dy * dx;
        intersection / (vol_a + vol_b - intersection)
    }

    /// 各座標を `[lo, hi]` に収めたボックスを返します。
    pub fn clipped(&self, lo: f32, hi: f32) -> Self {
        let c = |v: f32| v.max(lo).min(hi);
        Self::new(
            c(self.z1),
            c(self.y1),
            c(self.x1),
            c(self.z2),
            c(self.y2),
            c(self.x2),
        )
    }

    /// 正規化された深さ `z` の平面とボックスが交差するかを返します。
    pub fn contains_depth(&self, z: f32) -> bool {
        let n = self.normalized();
        n.z1 <= z && z <= n.z2
    }
}

/// `[num_boxes, 6]` の配列をボックスの列に変換します。
///
/// # Args
///
/// * `op` - エラーメッセージに使う演算子名
/// * `boxes` - ボックス配列
///
/// # Return
/// * ボックスのベクタ
pub fn parse_boxes(op: &'static str, boxes: ArrayView2<f32>) -> Result<Vec<Box3D>> {
    if boxes.nrows() > 0 && boxes.ncols() != BOX_COORDS {
        return Err(OpError::shape(
            op,
            format!("boxes must have 6 columns, got shape {:?}", boxes.shape()),
        ));
    }
    Ok(boxes.outer_iter().map(Box3D::from_row).collect())
}

/// `box_index` の形状と値域を検証し、バッチ番号の列に変換します。
///
/// 範囲外のインデックスはクランプせずエラーにします。
///
/// # Args
///
/// * `op` - エラーメッセージに使う演算子名
/// * `box_index` - 各ボックスのバッチ番号
/// * `num_boxes` - ボックス数
/// * `batch` - バッチサイズ
///
/// # Return
/// * バッチ番号のベクタ
pub fn check_box_index(
    op: &'static str,
    box_index: ArrayView1<i32>,
    num_boxes: usize,
    batch: usize,
) -> Result<Vec<usize>> {
    if box_index.len() != num_boxes {
        return Err(OpError::shape(
            op,
            format!(
                "box_index has {} entries but there are {} boxes",
                box_index.len(),
                num_boxes
            ),
        ));
    }

    box_index
        .iter()
        .enumerate()
        .map(|(box_id, &index)| {
            if index < 0 || index as usize >= batch {
                Err(OpError::BoxIndexOutOfRange {
                    op,
                    box_id,
                    index: i64::from(index),
                    batch,
                })
            } else {
                Ok(index as usize)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = Box3D::new(0.1, 0.1, 0.1, 0.5, 0.5, 0.5);
        assert_abs_diff_eq!(b.iou(&b), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn iou_ignores_flipped_corners() {
        let a = Box3D::new(0.0, 0.0, 0.0, 0.5, 0.5, 0.5);
        let flipped = Box3D::new(0.5, 0.5, 0.5, 0.0, 0.0, 0.0);
        assert_abs_diff_eq!(a.iou(&flipped), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = Box3D::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0);
        let b = Box3D::new(0.5, 0.0, 0.0, 1.5, 1.0, 1.0);
        // 交差 0.5, 和 1.5
        assert_abs_diff_eq!(a.iou(&b), 1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn degenerate_box_has_zero_iou() {
        let flat = Box3D::new(0.2, 0.0, 0.0, 0.2, 1.0, 1.0);
        let full = Box3D::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0);
        assert_eq!(flat.iou(&full), 0.0);
        assert_eq!(flat.iou(&flat), 0.0);
    }

    #[test]
    fn parse_boxes_rejects_wrong_width() {
        let boxes = arr2(&[[0.0f32, 0.0, 0.0, 1.0]]);
        assert!(matches!(
            parse_boxes("test", boxes.view()),
            Err(OpError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn box_index_out_of_range_is_rejected() {
        let idx = arr1(&[0, 5, 1]);
        let err = check_box_index("test", idx.view(), 3, 3).unwrap_err();
        assert_eq!(
            err,
            OpError::BoxIndexOutOfRange {
                op: "test",
                box_id: 1,
                index: 5,
                batch: 3
            }
        );
        assert!(check_box_index("test", arr1(&[-1]).view(), 1, 3).is_err());
    }

    #[test]
    fn box_index_length_must_match() {
        let idx = arr1(&[0, 0]);
        assert!(matches!(
            check_box_index("test", idx.view(), 3, 1),
            Err(OpError::ShapeMismatch { .. })
        ));
    }
}
