//! 演算子のエラー型を定義するモジュール

use thiserror::Error;

/// 演算子の入力検証・実行で発生するエラー
///
/// すべての検証は出力テンソルの確保前に行われるため、
/// エラーが返った場合に部分的な結果が観測されることはありません。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpError {
    #[error("{op}: {name} must be {expected}-D, got shape {shape:?}")]
    InvalidRank {
        op: &'static str,
        name: &'static str,
        expected: usize,
        shape: Vec<usize>,
    },

    #[error("{op}: {reason}")]
    ShapeMismatch { op: &'static str, reason: String },

    #[error("{op}: box_index[{box_id}] = {index} is not in [0, {batch})")]
    BoxIndexOutOfRange {
        op: &'static str,
        box_id: usize,
        index: i64,
        batch: usize,
    },

    #[error("{op}: iou_threshold must be in [0, 1], got {value}")]
    InvalidThreshold { op: &'static str, value: f32 },

    #[error("{op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("{op}: {reason}")]
    Unsupported { op: &'static str, reason: String },

    #[error("no operator registered under the name '{0}'")]
    UnknownOp(String),

    #[error("operator '{0}' is already registered")]
    DuplicateOp(String),
}

impl OpError {
    pub(crate) fn shape(op: &'static str, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OpError>;
