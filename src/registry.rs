//! 演算子を名前で登録・検索・実行するモジュール
//!
//! 各演算子は動的ランクの [`TensorValue`] を受け取り、ランクと型の検証をここで行ってから
//! 型付きの関数 ([`crate::crop_and_resize_3d`] など) を呼び出します。
//! 属性 ([`AttrValue`]) は [`OpsConfig`] のデフォルト値を上書きします。

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use log::{debug, info};
use ndarray::{
    arr0, Array, Array1, ArrayD, ArrayView, ArrayView1, Dimension, Ix1, Ix2, Ix3, Ix4, Ix5,
};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::OpsConfig;
use crate::crop_and_resize::{self, crop_and_resize_3d, CropAndResizeConfig};
use crate::error::{OpError, Result};
use crate::geometry::Extrapolation;
use crate::grad_boxes::{self, crop_and_resize_3d_grad_boxes};
use crate::grad_image::{self, crop_and_resize_3d_grad_image};
use crate::nms::{
    self, combined_non_max_suppression_3d, non_max_suppression_3d, non_max_suppression_3d_padded,
    CombinedNmsConfig, NmsConfig,
};

/// 演算子の入出力テンソル
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
}

impl TensorValue {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(a) => a.shape(),
            Self::I32(a) => a.shape(),
        }
    }

    pub fn dtype_name(&self) -> &'static str {
        match self {
            Self::F32(_) => "float32",
            Self::I32(_) => "int32",
        }
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Self::F32(a) => Some(a),
            Self::I32(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<&ArrayD<i32>> {
        match self {
            Self::I32(a) => Some(a),
            Self::F32(_) => None,
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for TensorValue {
    fn from(a: Array<f32, D>) -> Self {
        Self::F32(a.into_dyn())
    }
}

impl<D: Dimension> From<Array<i32, D>> for TensorValue {
    fn from(a: Array<i32, D>) -> Self {
        Self::I32(a.into_dyn())
    }
}

/// 演算子の属性値
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

pub type Attrs = HashMap<String, AttrValue>;

/// 登録可能な演算子
pub trait Operator: Send + Sync {
    fn name(&self) -> &'static str;

    /// 演算子を実行します。
    ///
    /// # Args
    ///
    /// * `inputs` - 入力テンソル
    /// * `attrs` - 属性
    ///
    /// # Return
    /// * 出力テンソル
    fn compute(&self, inputs: &[TensorValue], attrs: &Attrs) -> Result<Vec<TensorValue>>;
}

/// 演算子のレジストリ
pub struct OpRegistry {
    ops: HashMap<&'static str, Arc<dyn Operator>>,
    pool: Option<ThreadPool>,
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OpRegistry {
    /// 空のレジストリを作成します。
    pub fn new() -> Self {
        Self {
            ops: HashMap::new(),
            pool: None,
        }
    }

    /// 組み込みの演算子をすべて登録したレジストリを作成します。
    ///
    /// # Args
    ///
    /// * `config` - 演算子のデフォルト設定
    ///
    /// # Return
    /// * 新たなOpRegistryインスタンス
    pub fn with_builtin_ops(config: &OpsConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let mut registry = Self::new();
        if let Some(n) = config.num_threads {
            registry.pool = Some(ThreadPoolBuilder::new().num_threads(n).build()?);
        }

        let ops: [Arc<dyn Operator>; 5] = [
            Arc::new(CropAndResizeOp(config.crop_and_resize)),
            Arc::new(GradImageOp(config.crop_and_resize)),
            Arc::new(GradBoxesOp(config.crop_and_resize)),
            Arc::new(NmsOp(config.nms)),
            Arc::new(CombinedNmsOp(config.combined_nms)),
        ];
        for op in ops {
            registry.register(op)?;
        }
        info!(
            "registered {} ops (num_threads: {:?})",
            registry.ops.len(),
            config.num_threads
        );
        Ok(registry)
    }

    pub fn register(&mut self, op: Arc<dyn Operator>) -> Result<()> {
        let name = op.name();
        if self.ops.contains_key(name) {
            return Err(OpError::DuplicateOp(name.to_string()));
        }
        self.ops.insert(name, op);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Operator>> {
        self.ops
            .get(name)
            .cloned()
            .ok_or_else(|| OpError::UnknownOp(name.to_string()))
    }

    /// 登録されている演算子名 (昇順)
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.ops.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// 名前で演算子を検索して実行します。
    ///
    /// スレッド数が設定されていれば専用のスレッドプール内で実行します。
    pub fn run(
        &self,
        name: &str,
        inputs: &[TensorValue],
        attrs: &Attrs,
    ) -> Result<Vec<TensorValue>> {
        let op = self.lookup(name)?;
        debug!(
            "run {}: inputs {:?}",
            name,
            inputs.iter().map(TensorValue::shape).collect::<Vec<_>>()
        );
        match &self.pool {
            Some(pool) => pool.install(|| op.compute(inputs, attrs)),
            None => op.compute(inputs, attrs),
        }
    }
}

fn expect_inputs(
    op: &'static str,
    inputs: &[TensorValue],
    range: RangeInclusive<usize>,
) -> Result<()> {
    if range.contains(&inputs.len()) {
        Ok(())
    } else {
        Err(OpError::invalid(
            op,
            format!(
                "expected {}..={} inputs, got {}",
                range.start(),
                range.end(),
                inputs.len()
            ),
        ))
    }
}

fn to_rank<'a, T, D: Dimension>(
    op: &'static str,
    name: &'static str,
    a: &'a ArrayD<T>,
) -> Result<ArrayView<'a, T, D>> {
    a.view()
        .into_dimensionality::<D>()
        .map_err(|_| OpError::InvalidRank {
            op,
            name,
            expected: D::NDIM.unwrap_or(0),
            shape: a.shape().to_vec(),
        })
}

fn f32_input<'a, D: Dimension>(
    op: &'static str,
    inputs: &'a [TensorValue],
    i: usize,
    name: &'static str,
) -> Result<ArrayView<'a, f32, D>> {
    match &inputs[i] {
        TensorValue::F32(a) => to_rank(op, name, a),
        other => Err(OpError::invalid(
            op,
            format!("{} must be float32, got {}", name, other.dtype_name()),
        )),
    }
}

fn i32_input<'a, D: Dimension>(
    op: &'static str,
    inputs: &'a [TensorValue],
    i: usize,
    name: &'static str,
) -> Result<ArrayView<'a, i32, D>> {
    match &inputs[i] {
        TensorValue::I32(a) => to_rank(op, name, a),
        other => Err(OpError::invalid(
            op,
            format!("{} must be int32, got {}", name, other.dtype_name()),
        )),
    }
}

/// 長さ `N` の正の整数ベクトルを読み取ります。
fn size_input<const N: usize>(
    op: &'static str,
    v: ArrayView1<i32>,
    name: &'static str,
) -> Result<[usize; N]> {
    if v.len() != N {
        return Err(OpError::invalid(
            op,
            format!("{} must have {} elements, got {}", name, N, v.len()),
        ));
    }
    let mut out = [0usize; N];
    for (o, &d) in out.iter_mut().zip(v.iter()) {
        *o = usize::try_from(d)
            .ok()
            .filter(|&d| d > 0)
            .ok_or_else(|| OpError::invalid(op, format!("{} must be positive, got {}", name, v)))?;
    }
    Ok(out)
}

/// 0次元または要素数1の非負整数を読み取ります。
fn scalar_usize(op: &'static str, t: &TensorValue, name: &'static str) -> Result<usize> {
    let value = match t {
        TensorValue::I32(a) if a.len() == 1 => a.iter().next().copied(),
        _ => None,
    };
    value
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| {
            OpError::invalid(op, format!("{} must be a non-negative int32 scalar", name))
        })
}

fn attr_f32(op: &'static str, attrs: &Attrs, key: &str) -> Result<Option<f32>> {
    match attrs.get(key) {
        None => Ok(None),
        Some(AttrValue::Float(v)) => Ok(Some(*v as f32)),
        Some(AttrValue::Int(v)) => Ok(Some(*v as f32)),
        Some(other) => Err(OpError::invalid(
            op,
            format!("attr '{}' must be a number, got {:?}", key, other),
        )),
    }
}

fn attr_usize(op: &'static str, attrs: &Attrs, key: &str) -> Result<Option<usize>> {
    match attrs.get(key) {
        None => Ok(None),
        Some(AttrValue::Int(v)) => usize::try_from(*v).map(Some).map_err(|_| {
            OpError::invalid(op, format!("attr '{}' must be non-negative, got {}", key, v))
        }),
        Some(other) => Err(OpError::invalid(
            op,
            format!("attr '{}' must be an int, got {:?}", key, other),
        )),
    }
}

fn attr_bool(op: &'static str, attrs: &Attrs, key: &str) -> Result<Option<bool>> {
    match attrs.get(key) {
        None => Ok(None),
        Some(AttrValue::Bool(v)) => Ok(Some(*v)),
        Some(other) => Err(OpError::invalid(
            op,
            format!("attr '{}' must be a bool, got {:?}", key, other),
        )),
    }
}

fn attr_str<'a>(op: &'static str, attrs: &'a Attrs, key: &str) -> Result<Option<&'a str>> {
    match attrs.get(key) {
        None => Ok(None),
        Some(AttrValue::String(v)) => Ok(Some(v.as_str())),
        Some(other) => Err(OpError::invalid(
            op,
            format!("attr '{}' must be a string, got {:?}", key, other),
        )),
    }
}

/// `method_name`, `extrapolation`, `extrapolation_value` 属性でデフォルト設定を上書きします。
fn crop_config(
    op: &'static str,
    base: CropAndResizeConfig,
    attrs: &Attrs,
) -> Result<CropAndResizeConfig> {
    let mut config = base;
    if let Some(name) = attr_str(op, attrs, "method_name")? {
        config.method = name.parse().map_err(|e: String| OpError::invalid(op, e))?;
    }
    match attr_str(op, attrs, "extrapolation")? {
        None => {}
        Some("clamp") => config.extrapolation = Extrapolation::Clamp,
        Some("constant") => {
            config.extrapolation = Extrapolation::Constant(config.extrapolation.fill_value())
        }
        Some(other) => {
            return Err(OpError::invalid(
                op,
                format!("extrapolation must be 'constant' or 'clamp', got '{}'", other),
            ))
        }
    }
    if let Some(v) = attr_f32(op, attrs, "extrapolation_value")? {
        config.extrapolation = Extrapolation::Constant(v);
    }
    Ok(config)
}

fn nms_config(op: &'static str, base: NmsConfig, attrs: &Attrs) -> Result<NmsConfig> {
    let mut config = base;
    if let Some(v) = attr_f32(op, attrs, "iou_threshold")? {
        config.iou_threshold = v;
    }
    if let Some(v) = attr_f32(op, attrs, "score_threshold")? {
        config.score_threshold = Some(v);
    }
    if let Some(v) = attr_f32(op, attrs, "soft_nms_sigma")? {
        config.soft_nms_sigma = v;
    }
    Ok(config)
}

/// 入力: image, boxes, box_index, crop_size
struct CropAndResizeOp(CropAndResizeConfig);

impl Operator for CropAndResizeOp {
    fn name(&self) -> &'static str {
        crop_and_resize::OP_NAME
    }

    fn compute(&self, inputs: &[TensorValue], attrs: &Attrs) -> Result<Vec<TensorValue>> {
        let op = self.name();
        expect_inputs(op, inputs, 4..=4)?;
        let config = crop_config(op, self.0, attrs)?;
        let boxes = f32_input::<Ix2>(op, inputs, 1, "boxes")?;
        let box_index = i32_input::<Ix1>(op, inputs, 2, "box_index")?;
        let crop_size = i32_input::<Ix1>(op, inputs, 3, "crop_size")?;
        let crop_size = size_input::<3>(op, crop_size, "crop_size")?;

        let crops = match &inputs[0] {
            TensorValue::F32(a) => {
                let image = to_rank::<_, Ix5>(op, "image", a)?;
                crop_and_resize_3d(image, boxes, box_index, crop_size, &config)?
            }
            TensorValue::I32(a) => {
                let image = to_rank::<_, Ix5>(op, "image", a)?;
                crop_and_resize_3d(image, boxes, box_index, crop_size, &config)?
            }
        };
        Ok(vec![crops.into()])
    }
}

/// 入力: grads, boxes, box_index, image_size
struct GradImageOp(CropAndResizeConfig);

impl Operator for GradImageOp {
    fn name(&self) -> &'static str {
        grad_image::OP_NAME
    }

    fn compute(&self, inputs: &[TensorValue], attrs: &Attrs) -> Result<Vec<TensorValue>> {
        let op = self.name();
        expect_inputs(op, inputs, 4..=4)?;
        let config = crop_config(op, self.0, attrs)?;
        let grads = f32_input::<Ix5>(op, inputs, 0, "grads")?;
        let boxes = f32_input::<Ix2>(op, inputs, 1, "boxes")?;
        let box_index = i32_input::<Ix1>(op, inputs, 2, "box_index")?;
        let image_size =
            size_input::<5>(op, i32_input::<Ix1>(op, inputs, 3, "image_size")?, "image_size")?;

        let out = crop_and_resize_3d_grad_image(grads, boxes, box_index, image_size, &config)?;
        Ok(vec![out.into()])
    }
}

/// 入力: grads, image, boxes, box_index
struct GradBoxesOp(CropAndResizeConfig);

impl Operator for GradBoxesOp {
    fn name(&self) -> &'static str {
        grad_boxes::OP_NAME
    }

    fn compute(&self, inputs: &[TensorValue], attrs: &Attrs) -> Result<Vec<TensorValue>> {
        let op = self.name();
        expect_inputs(op, inputs, 4..=4)?;
        let config = crop_config(op, self.0, attrs)?;
        let grads = f32_input::<Ix5>(op, inputs, 0, "grads")?;
        let boxes = f32_input::<Ix2>(op, inputs, 2, "boxes")?;
        let box_index = i32_input::<Ix1>(op, inputs, 3, "box_index")?;

        let out = match &inputs[1] {
            TensorValue::F32(a) => crop_and_resize_3d_grad_boxes(
                grads,
                to_rank::<_, Ix5>(op, "image", a)?,
                boxes,
                box_index,
                &config,
            )?,
            TensorValue::I32(a) => crop_and_resize_3d_grad_boxes(
                grads,
                to_rank::<_, Ix5>(op, "image", a)?,
                boxes,
                box_index,
                &config,
            )?,
        };
        Ok(vec![out.into()])
    }
}

/// 入力: boxes, scores, [max_output_size]
///
/// 出力: selected_indices, selected_scores, valid_outputs
struct NmsOp(NmsConfig);

impl Operator for NmsOp {
    fn name(&self) -> &'static str {
        nms::OP_NAME
    }

    fn compute(&self, inputs: &[TensorValue], attrs: &Attrs) -> Result<Vec<TensorValue>> {
        let op = self.name();
        expect_inputs(op, inputs, 2..=3)?;
        let config = nms_config(op, self.0, attrs)?;
        let boxes = f32_input::<Ix2>(op, inputs, 0, "boxes")?;
        let scores = f32_input::<Ix1>(op, inputs, 1, "scores")?;
        let max_output_size = inputs
            .get(2)
            .map(|t| scalar_usize(op, t, "max_output_size"))
            .transpose()?;
        let pad = attr_bool(op, attrs, "pad_to_max_output_size")?.unwrap_or(false);

        let out = match (pad, max_output_size) {
            (true, Some(n)) => non_max_suppression_3d_padded(boxes, scores, n, &config)?,
            (true, None) => {
                return Err(OpError::invalid(
                    op,
                    "pad_to_max_output_size requires max_output_size",
                ))
            }
            (false, n) => non_max_suppression_3d(boxes, scores, n, &config)?,
        };

        let indices: Array1<i32> = out.selected_indices.iter().map(|&i| i as i32).collect();
        Ok(vec![
            indices.into(),
            Array1::from(out.selected_scores).into(),
            arr0(out.valid_count as i32).into(),
        ])
    }
}

/// 入力: boxes, scores
///
/// 出力: nmsed_boxes, nmsed_scores, nmsed_classes, valid_detections
struct CombinedNmsOp(CombinedNmsConfig);

impl Operator for CombinedNmsOp {
    fn name(&self) -> &'static str {
        nms::COMBINED_OP_NAME
    }

    fn compute(&self, inputs: &[TensorValue], attrs: &Attrs) -> Result<Vec<TensorValue>> {
        let op = self.name();
        expect_inputs(op, inputs, 2..=2)?;
        let mut config = self.0;
        if let Some(v) = attr_usize(op, attrs, "max_output_size_per_class")? {
            config.max_output_size_per_class = v;
        }
        if let Some(v) = attr_usize(op, attrs, "max_total_size")? {
            config.max_total_size = v;
        }
        if let Some(v) = attr_f32(op, attrs, "iou_threshold")? {
            config.iou_threshold = v;
        }
        if let Some(v) = attr_f32(op, attrs, "score_threshold")? {
            config.score_threshold = Some(v);
        }
        if let Some(v) = attr_bool(op, attrs, "pad_per_class")? {
            config.pad_per_class = v;
        }
        if let Some(v) = attr_bool(op, attrs, "clip_boxes")? {
            config.clip_boxes = v;
        }

        let boxes = f32_input::<Ix4>(op, inputs, 0, "boxes")?;
        let scores = f32_input::<Ix3>(op, inputs, 1, "scores")?;
        let out = combined_non_max_suppression_3d(boxes, scores, &config)?;
        Ok(vec![
            out.nmsed_boxes.into(),
            out.nmsed_scores.into(),
            out.nmsed_classes.into(),
            out.valid_detections.into(),
        ])
    }
}
