//! 3D Non-Maximum Suppression (NMS) モジュール

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::{debug, warn};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::boxes::{parse_boxes, Box3D, BOX_COORDS};
use crate::error::{OpError, Result};

pub const OP_NAME: &str = "NonMaxSuppression3D";
pub const COMBINED_OP_NAME: &str = "CombinedNonMaxSuppression3D";

/// 採用済みボックスがこの数以上あれば重なり判定を並列に行う
const PARALLEL_SCAN_MIN: usize = 512;

/// NMSの設定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmsConfig {
    /// このIoUを超えて重なる候補は抑制される
    pub iou_threshold: f32,
    /// このスコア以下の候補は無視される (`None` なら全候補)
    pub score_threshold: Option<f32>,
    /// Soft-NMS のσ。0なら通常のNMS
    pub soft_nms_sigma: f32,
}

impl Default for NmsConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            score_threshold: None,
            soft_nms_sigma: 0.0,
        }
    }
}

impl NmsConfig {
    pub fn validate(&self, op: &'static str) -> Result<()> {
        check_iou_threshold(op, self.iou_threshold)?;
        if !(self.soft_nms_sigma >= 0.0 && self.soft_nms_sigma.is_finite()) {
            return Err(OpError::invalid(
                op,
                format!("soft_nms_sigma must be >= 0, got {}", self.soft_nms_sigma),
            ));
        }
        Ok(())
    }

    fn passes_score(&self, score: f32) -> bool {
        !score.is_nan() && self.score_threshold.map_or(true, |t| score > t)
    }
}

fn check_iou_threshold(op: &'static str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(OpError::InvalidThreshold { op, value })
    }
}

/// NMSの結果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NmsOutput {
    /// 採用されたボックスの入力インデックス (採用順)
    pub selected_indices: Vec<usize>,
    /// 採用時のスコア (Soft-NMS では減衰後の値)
    pub selected_scores: Vec<f32>,
    /// パディングを除いた有効な個数
    pub valid_count: usize,
}

/// 優先度付きキューに積む候補
#[derive(Debug, Clone, Copy)]
struct Candidate {
    box_index: usize,
    score: f32,
    /// この候補と比較済みの採用ボックス数
    suppress_begin: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // スコアが同じなら入力順の早い方を先に取り出す
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.box_index.cmp(&self.box_index))
    }
}

/// スコアの降順に貪欲にボックスを選びます。
///
/// # Args
///
/// * `boxes` - 候補ボックス
/// * `scores` - 候補のスコア
/// * `max_output` - 採用する最大数
/// * `config` - NMSの設定
///
/// # Return
/// * (採用したインデックス, 採用時のスコア)
fn greedy_select(
    boxes: &[Box3D],
    scores: &[f32],
    max_output: usize,
    config: &NmsConfig,
) -> (Vec<usize>, Vec<f32>) {
    let mut queue: BinaryHeap<Candidate> = scores
        .iter()
        .enumerate()
        .filter(|(_, &s)| config.passes_score(s))
        .map(|(box_index, &score)| Candidate {
            box_index,
            score,
            suppress_begin: 0,
        })
        .collect();

    let scale = if config.soft_nms_sigma > 0.0 {
        -0.5 / config.soft_nms_sigma
    } else {
        0.0
    };
    let threshold = config.iou_threshold;

    let mut selected: Vec<usize> = Vec::new();
    let mut selected_scores: Vec<f32> = Vec::new();

    while selected.len() < max_output {
        let Some(mut candidate) = queue.pop() else {
            break;
        };
        let bbox = &boxes[candidate.box_index];

        if scale == 0.0 {
            // 通常のNMS: スコアは変化しないので重なりの有無だけを見る
            let overlaps = |&j: &usize| bbox.iou(&boxes[j]) > threshold;
            let suppressed = if selected.len() >= PARALLEL_SCAN_MIN {
                selected.par_iter().any(overlaps)
            } else {
                // 重なる候補はスコアも近いことが多いので新しい方から調べる
                selected.iter().rev().any(overlaps)
            };
            if !suppressed {
                selected.push(candidate.box_index);
                selected_scores.push(candidate.score);
            }
            continue;
        }

        let original_score = candidate.score;
        let mut hard_suppressed = false;
        for &j in selected[candidate.suppress_begin..].iter().rev() {
            let iou = bbox.iou(&boxes[j]);
            // NaN は通常のNMSと同じく重なりなしとみなす
            if iou.is_nan() {
                continue;
            }
            if iou > threshold {
                hard_suppressed = true;
                break;
            }
            candidate.score *= (scale * iou * iou).exp();
            if !config.passes_score(candidate.score) {
                break;
            }
        }
        candidate.suppress_begin = selected.len();

        if hard_suppressed {
            continue;
        }
        if candidate.score == original_score {
            selected.push(candidate.box_index);
            selected_scores.push(candidate.score);
        } else if config.passes_score(candidate.score) {
            queue.push(candidate);
        }
    }

    (selected, selected_scores)
}

/// 3D NMS を行い、採用したボックスのインデックスをスコアの降順で返します。
///
/// # Args
///
/// * `boxes` - `[num_boxes, 6]` のボックス
/// * `scores` - `[num_boxes]` のスコア
/// * `max_output_size` - 採用する最大数 (`None` なら無制限)
/// * `config` - NMSの設定
///
/// # Return
/// * NMSの結果
pub fn non_max_suppression_3d(
    boxes: ArrayView2<f32>,
    scores: ArrayView1<f32>,
    max_output_size: Option<usize>,
    config: &NmsConfig,
) -> Result<NmsOutput> {
    config.validate(OP_NAME)?;
    let parsed = parse_boxes(OP_NAME, boxes)?;
    if scores.len() != parsed.len() {
        return Err(OpError::shape(
            OP_NAME,
            format!(
                "scores has {} entries but there are {} boxes",
                scores.len(),
                parsed.len()
            ),
        ));
    }

    let scores = scores.to_vec();
    let nan_count = scores.iter().filter(|s| s.is_nan()).count();
    if nan_count > 0 {
        warn!("{}: skipping {} boxes with NaN scores", OP_NAME, nan_count);
    }

    let max_output = max_output_size.unwrap_or(parsed.len());
    let (selected_indices, selected_scores) = greedy_select(&parsed, &scores, max_output, config);
    debug!(
        "{}: kept {} of {} boxes (iou_threshold {})",
        OP_NAME,
        selected_indices.len(),
        parsed.len(),
        config.iou_threshold
    );

    Ok(NmsOutput {
        valid_count: selected_indices.len(),
        selected_indices,
        selected_scores,
    })
}

/// [`non_max_suppression_3d`] の結果を `max_output_size` の長さまで0で埋めて返します。
pub fn non_max_suppression_3d_padded(
    boxes: ArrayView2<f32>,
    scores: ArrayView1<f32>,
    max_output_size: usize,
    config: &NmsConfig,
) -> Result<NmsOutput> {
    let mut out = non_max_suppression_3d(boxes, scores, Some(max_output_size), config)?;
    out.selected_indices.resize(max_output_size, 0);
    out.selected_scores.resize(max_output_size, 0.0);
    Ok(out)
}

/// クラス別・バッチ別 NMS の設定
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinedNmsConfig {
    /// クラスごとに採用する最大数
    pub max_output_size_per_class: usize,
    /// バッチごとに出力する最大数
    pub max_total_size: usize,
    pub iou_threshold: f32,
    pub score_threshold: Option<f32>,
    /// true なら出力長を `min(max_total_size, max_output_size_per_class * num_classes)` にする
    pub pad_per_class: bool,
    /// true なら出力ボックスを [0, 1] に収める
    pub clip_boxes: bool,
}

impl Default for CombinedNmsConfig {
    fn default() -> Self {
        Self {
            max_output_size_per_class: 100,
            max_total_size: 100,
            iou_threshold: 0.5,
            score_threshold: None,
            pad_per_class: false,
            clip_boxes: true,
        }
    }
}

/// クラス別・バッチ別 NMS の結果
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedNmsOutput {
    /// `[batch, K, 6]`
    pub nmsed_boxes: Array3<f32>,
    /// `[batch, K]`
    pub nmsed_scores: Array2<f32>,
    /// `[batch, K]`
    pub nmsed_classes: Array2<f32>,
    /// `[batch]`
    pub valid_detections: Array1<i32>,
}

#[derive(Debug, Clone, Copy)]
struct Detection {
    score: f32,
    class: usize,
    bbox: Box3D,
}

/// クラスごとに NMS を行い、バッチごとにスコア上位の検出結果をまとめます。
///
/// # Args
///
/// * `boxes` - `[batch, num_boxes, q, 6]` のボックス (`q` は1またはクラス数)
/// * `scores` - `[batch, num_boxes, num_classes]` のスコア
/// * `config` - 設定
///
/// # Return
/// * パディングされた検出結果
pub fn combined_non_max_suppression_3d(
    boxes: ArrayView4<f32>,
    scores: ArrayView3<f32>,
    config: &CombinedNmsConfig,
) -> Result<CombinedNmsOutput> {
    let op = COMBINED_OP_NAME;
    check_iou_threshold(op, config.iou_threshold)?;
    if config.max_output_size_per_class == 0 || config.max_total_size == 0 {
        return Err(OpError::invalid(
            op,
            "max_output_size_per_class and max_total_size must be positive",
        ));
    }

    let (batch, num_boxes, q, coords) = boxes.dim();
    let (score_batch, score_boxes, num_classes) = scores.dim();
    if coords != BOX_COORDS {
        return Err(OpError::shape(op, "boxes must have 6 columns"));
    }
    if q != 1 && q != num_classes {
        return Err(OpError::shape(
            op,
            "third dimension of boxes must be either 1 or num classes",
        ));
    }
    if score_batch != batch || score_boxes != num_boxes {
        return Err(OpError::shape(
            op,
            format!(
                "scores shape {:?} is incompatible with boxes shape {:?}",
                scores.shape(),
                boxes.shape()
            ),
        ));
    }

    let per_batch = if config.pad_per_class {
        config
            .max_total_size
            .min(config.max_output_size_per_class.saturating_mul(num_classes))
    } else {
        config.max_total_size
    };
    let class_config = NmsConfig {
        iou_threshold: config.iou_threshold,
        score_threshold: config.score_threshold,
        soft_nms_sigma: 0.0,
    };
    let per_class = config.max_output_size_per_class.min(num_boxes);

    let results: Vec<Vec<Detection>> = (0..batch)
        .into_par_iter()
        .map(|b| {
            let mut detections = Vec::new();
            for class in 0..num_classes {
                let qi = if q > 1 { class } else { 0 };
                let class_boxes: Vec<Box3D> = (0..num_boxes)
                    .map(|i| Box3D::from_row(boxes.slice(s![b, i, qi, ..])))
                    .collect();
                let class_scores = scores.slice(s![b, .., class]).to_vec();

                let (kept, kept_scores) =
                    greedy_select(&class_boxes, &class_scores, per_class, &class_config);
                detections.extend(kept.into_iter().zip(kept_scores).map(|(i, score)| Detection {
                    score,
                    class,
                    bbox: class_boxes[i],
                }));
            }
            detections.sort_by(|a, b| b.score.total_cmp(&a.score));
            detections.truncate(per_batch);
            detections
        })
        .collect();

    let mut nmsed_boxes = Array3::<f32>::zeros((batch, per_batch, BOX_COORDS));
    let mut nmsed_scores = Array2::<f32>::zeros((batch, per_batch));
    let mut nmsed_classes = Array2::<f32>::zeros((batch, per_batch));
    let mut valid_detections = Array1::<i32>::zeros(batch);

    for (b, detections) in results.iter().enumerate() {
        valid_detections[b] = detections.len() as i32;
        for (k, d) in detections.iter().enumerate() {
            let bbox = if config.clip_boxes {
                d.bbox.clipped(0.0, 1.0)
            } else {
                d.bbox
            };
            for (o, v) in nmsed_boxes
                .slice_mut(s![b, k, ..])
                .iter_mut()
                .zip(bbox.to_array())
            {
                *o = v;
            }
            nmsed_scores[[b, k]] = d.score;
            nmsed_classes[[b, k]] = d.class as f32;
        }
    }
    debug!(
        "{}: {} batches, {} classes, valid {:?}",
        op,
        batch,
        num_classes,
        valid_detections
    );

    Ok(CombinedNmsOutput {
        nmsed_boxes,
        nmsed_scores,
        nmsed_classes,
        valid_detections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array4};

    fn cube(origin: f32, size: f32) -> [f32; 6] {
        [
            origin,
            origin,
            origin,
            origin + size,
            origin + size,
            origin + size,
        ]
    }

    #[test]
    fn nan_boxes_are_kept_by_both_modes() {
        let boxes = arr2(&[cube(0.1, 0.4), [f32::NAN; 6]]);
        let scores = arr1(&[0.9, 0.8]);
        for sigma in [0.0, 0.5] {
            let config = NmsConfig {
                soft_nms_sigma: sigma,
                ..Default::default()
            };
            let out =
                non_max_suppression_3d(boxes.view(), scores.view(), None, &config).unwrap();
            assert_eq!(out.selected_indices, vec![0, 1], "sigma {}", sigma);
            assert_eq!(out.selected_scores, vec![0.9, 0.8]);
        }
    }

    #[test]
    fn identical_boxes_keep_higher_score() {
        let boxes = arr2(&[cube(0.1, 0.4), cube(0.1, 0.4)]);
        let out = non_max_suppression_3d(
            boxes.view(),
            arr1(&[0.3, 0.9]).view(),
            None,
            &NmsConfig::default(),
        )
        .unwrap();
        assert_eq!(out.selected_indices, vec![1]);
    }

    #[test]
    fn equal_scores_keep_first_in_input_order() {
        let boxes = arr2(&[cube(0.5, 0.2), cube(0.1, 0.4), cube(0.1, 0.4)]);
        let out = non_max_suppression_3d(
            boxes.view(),
            arr1(&[0.2, 0.7, 0.7]).view(),
            None,
            &NmsConfig::default(),
        )
        .unwrap();
        assert_eq!(out.selected_indices, vec![1, 0]);
        assert_eq!(out.selected_scores, vec![0.7, 0.2]);
    }

    #[test]
    fn threshold_is_strict() {
        // IoU = 1/3
        let boxes = arr2(&[
            [0.0f32, 0.0, 0.0, 0.5, 0.5, 0.5],
            [0.25, 0.0, 0.0, 0.75, 0.5, 0.5],
        ]);
        let scores = arr1(&[0.9, 0.8]);
        let mut config = NmsConfig {
            iou_threshold: 1.0 / 3.0,
            ..Default::default()
        };
        let kept = non_max_suppression_3d(boxes.view(), scores.view(), None, &config).unwrap();
        assert_eq!(kept.selected_indices, vec![0, 1]);

        config.iou_threshold = 0.3;
        let kept = non_max_suppression_3d(boxes.view(), scores.view(), None, &config).unwrap();
        assert_eq!(kept.selected_indices, vec![0]);
    }

    #[test]
    fn max_output_size_stops_early() {
        let boxes = arr2(&[cube(0.0, 0.1), cube(0.3, 0.1), cube(0.6, 0.1)]);
        let out = non_max_suppression_3d(
            boxes.view(),
            arr1(&[0.1, 0.2, 0.3]).view(),
            Some(2),
            &NmsConfig::default(),
        )
        .unwrap();
        assert_eq!(out.selected_indices, vec![2, 1]);
    }

    #[test]
    fn score_threshold_and_nan_scores_are_skipped() {
        let boxes = arr2(&[cube(0.0, 0.1), cube(0.3, 0.1), cube(0.6, 0.1)]);
        let config = NmsConfig {
            score_threshold: Some(0.15),
            ..Default::default()
        };
        let out = non_max_suppression_3d(
            boxes.view(),
            arr1(&[0.1, f32::NAN, 0.3]).view(),
            None,
            &config,
        )
        .unwrap();
        assert_eq!(out.selected_indices, vec![2]);
    }

    #[test]
    fn soft_nms_decays_overlapping_scores() {
        let boxes = arr2(&[
            [0.0f32, 0.0, 0.0, 0.5, 0.5, 0.5],
            [0.25, 0.0, 0.0, 0.75, 0.5, 0.5],
            [0.6, 0.6, 0.6, 0.9, 0.9, 0.9],
        ]);
        let config = NmsConfig {
            iou_threshold: 1.0,
            score_threshold: Some(0.0),
            soft_nms_sigma: 0.5,
        };
        let out =
            non_max_suppression_3d(boxes.view(), arr1(&[0.9, 0.8, 0.7]).view(), None, &config)
                .unwrap();
        // 1番は 0.8 * exp(-(1/3)^2) ≈ 0.712 に減衰するが、2番の0.7よりは高い
        assert_eq!(out.selected_indices, vec![0, 1, 2]);
        let expected = 0.8 * (-1.0f32 / 9.0).exp();
        assert!((out.selected_scores[1] - expected).abs() < 1e-5);
    }

    #[test]
    fn padded_output_has_fixed_length() {
        let boxes = arr2(&[cube(0.1, 0.4), cube(0.1, 0.4)]);
        let out = non_max_suppression_3d_padded(
            boxes.view(),
            arr1(&[0.3, 0.9]).view(),
            4,
            &NmsConfig::default(),
        )
        .unwrap();
        assert_eq!(out.selected_indices, vec![1, 0, 0, 0]);
        assert_eq!(out.valid_count, 1);
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        let boxes = arr2(&[cube(0.1, 0.4)]);
        let config = NmsConfig {
            iou_threshold: 1.5,
            ..Default::default()
        };
        let err = non_max_suppression_3d(boxes.view(), arr1(&[0.3]).view(), None, &config)
            .unwrap_err();
        assert_eq!(
            err,
            OpError::InvalidThreshold {
                op: OP_NAME,
                value: 1.5
            }
        );
    }

    #[test]
    fn score_length_must_match() {
        let boxes = arr2(&[cube(0.1, 0.4)]);
        let err = non_max_suppression_3d(
            boxes.view(),
            arr1(&[0.3, 0.1]).view(),
            None,
            &NmsConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch { .. }));
    }

    #[test]
    fn combined_nms_runs_per_class_and_pads() {
        // 1バッチ, 3ボックス, q = 1, 2クラス
        let mut boxes = Array4::<f32>::zeros((1, 3, 1, 6));
        for (i, b) in [cube(0.1, 0.4), cube(0.1, 0.4), cube(0.7, 0.5)].iter().enumerate() {
            for (k, v) in b.iter().enumerate() {
                boxes[[0, i, 0, k]] = *v;
            }
        }
        let scores = Array3::<f32>::from_shape_vec(
            (1, 3, 2),
            vec![
                0.9, 0.1, //
                0.8, 0.6, //
                0.2, 0.05,
            ],
        )
        .unwrap();
        let config = CombinedNmsConfig {
            max_output_size_per_class: 2,
            max_total_size: 5,
            score_threshold: Some(0.07),
            ..Default::default()
        };
        let out = combined_non_max_suppression_3d(boxes.view(), scores.view(), &config).unwrap();

        assert_eq!(out.valid_detections[0], 3);
        assert_eq!(out.nmsed_scores.row(0).to_vec(), vec![0.9, 0.6, 0.2, 0.0, 0.0]);
        assert_eq!(out.nmsed_classes.row(0).to_vec(), vec![0.0, 1.0, 0.0, 0.0, 0.0]);
        // 3番目のボックスは [0, 1] に切り詰められる
        assert_eq!(
            out.nmsed_boxes.slice(s![0, 2, ..]).to_vec(),
            vec![0.7, 0.7, 0.7, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn combined_nms_pad_per_class_limits_width() {
        let boxes = Array4::<f32>::zeros((2, 4, 1, 6));
        let scores = Array3::<f32>::zeros((2, 4, 3));
        let config = CombinedNmsConfig {
            max_output_size_per_class: 1,
            max_total_size: 10,
            pad_per_class: true,
            ..Default::default()
        };
        let out = combined_non_max_suppression_3d(boxes.view(), scores.view(), &config).unwrap();
        assert_eq!(out.nmsed_boxes.shape(), &[2, 3, 6]);
        assert_eq!(out.valid_detections.to_vec(), vec![3, 3]);
    }

    #[test]
    fn combined_nms_rejects_bad_q() {
        let boxes = Array4::<f32>::zeros((1, 4, 2, 6));
        let scores = Array3::<f32>::zeros((1, 4, 3));
        assert!(combined_non_max_suppression_3d(
            boxes.view(),
            scores.view(),
            &CombinedNmsConfig::default()
        )
        .is_err());
    }
}
