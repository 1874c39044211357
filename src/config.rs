//! 演算子のデフォルト設定を JSON から読み込むモジュール

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::crop_and_resize::CropAndResizeConfig;
use crate::nms::{CombinedNmsConfig, NmsConfig, COMBINED_OP_NAME};

/// 演算子全体の設定
///
/// JSON に存在しない項目はデフォルト値になります。
///
/// ```json
/// {
///     "crop_and_resize": { "method": "trilinear", "extrapolation": { "constant": 0.0 } },
///     "nms": { "iou_threshold": 0.5, "soft_nms_sigma": 0.0 },
///     "num_threads": 4
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub crop_and_resize: CropAndResizeConfig,
    pub nms: NmsConfig,
    pub combined_nms: CombinedNmsConfig,
    /// 演算子を実行するスレッド数 (`None` なら rayon のグローバルプール)
    pub num_threads: Option<usize>,
}

impl OpsConfig {
    /// JSON ファイルから設定を読み込みます。
    ///
    /// # Args
    ///
    /// * `path` - 設定ファイルのパス
    ///
    /// # Return
    /// * 検証済みの設定
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config = Self::from_json_str(&text)
            .with_context(|| format!("invalid config: {}", path.display()))?;
        info!("loaded ops config from {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("failed to parse config json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.nms.validate(crate::nms::OP_NAME)?;
        let combined = &self.combined_nms;
        ensure!(
            (0.0..=1.0).contains(&combined.iou_threshold),
            "{}: iou_threshold must be in [0, 1], got {}",
            COMBINED_OP_NAME,
            combined.iou_threshold
        );
        ensure!(
            combined.max_output_size_per_class > 0 && combined.max_total_size > 0,
            "{}: output sizes must be positive",
            COMBINED_OP_NAME
        );
        ensure!(
            self.num_threads != Some(0),
            "num_threads must be positive when set"
        );
        Ok(())
    }
}
