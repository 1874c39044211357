//! 2x2x2 近傍の補間重みとその偏微分を計算するモジュール

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::geometry::AxisSample;

/// サンプリング方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// トライリニア補間
    #[default]
    Trilinear,
    /// 最近傍
    Nearest,
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trilinear" => Ok(Self::Trilinear),
            "nearest" => Ok(Self::Nearest),
            other => Err(format!(
                "method must be 'trilinear' or 'nearest', got '{}'",
                other
            )),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trilinear => write!(f, "trilinear"),
            Self::Nearest => write!(f, "nearest"),
        }
    }
}

/// 1点を囲む 2x2x2 の近傍
///
/// 頂点の番号 `k` は、ビット2が深さ、ビット1が高さ、ビット0が幅の ceil 側を表します。
#[derive(Debug, Clone, Copy)]
pub struct Neighborhood {
    pub z: AxisSample,
    pub y: AxisSample,
    pub x: AxisSample,
}

impl Neighborhood {
    /// 3軸すべてがボリューム内にある場合のみ近傍を作成します。
    pub fn from_samples(
        z: &Option<AxisSample>,
        y: &Option<AxisSample>,
        x: &Option<AxisSample>,
    ) -> Option<Self> {
        Some(Self {
            z: (*z)?,
            y: (*y)?,
            x: (*x)?,
        })
    }

    /// 8頂点の (深さ, 高さ, 幅) インデックス
    pub fn corners(&self) -> [[usize; 3]; 8] {
        let pick = |s: &AxisSample, upper: bool| if upper { s.upper } else { s.lower };
        let mut out = [[0; 3]; 8];
        for (k, c) in out.iter_mut().enumerate() {
            *c = [
                pick(&self.z, k & 4 != 0),
                pick(&self.y, k & 2 != 0),
                pick(&self.x, k & 1 != 0),
            ];
        }
        out
    }

    /// 8頂点のトライリニア重み。合計は1になります。
    pub fn weights(&self) -> [f32; 8] {
        let w = |s: &AxisSample, upper: bool| if upper { s.lerp } else { 1.0 - s.lerp };
        let mut out = [0.0; 8];
        for (k, v) in out.iter_mut().enumerate() {
            *v = w(&self.z, k & 4 != 0) * w(&self.y, k & 2 != 0) * w(&self.x, k & 1 != 0);
        }
        out
    }

    /// 補間値の (深さ, 高さ, 幅) 座標に対する偏微分
    ///
    /// # Args
    ///
    /// * `values` - 8頂点の値 ([`Self::corners`] と同じ順番)
    ///
    /// # Return
    /// * [d/dz, d/dy, d/dx]
    pub fn partials(&self, values: &[f32; 8]) -> [f32; 3] {
        let w = |s: &AxisSample, upper: bool| if upper { s.lerp } else { 1.0 - s.lerp };
        let sign = |upper: bool| if upper { 1.0 } else { -1.0 };

        let mut out = [0.0; 3];
        for (k, &v) in values.iter().enumerate() {
            let (uz, uy, ux) = (k & 4 != 0, k & 2 != 0, k & 1 != 0);
            out[0] += v * sign(uz) * w(&self.y, uy) * w(&self.x, ux);
            out[1] += v * w(&self.z, uz) * sign(uy) * w(&self.x, ux);
            out[2] += v * w(&self.z, uz) * w(&self.y, uy) * sign(ux);
        }
        out
    }

    pub fn nearest(&self) -> [usize; 3] {
        [self.z.nearest, self.y.nearest, self.x.nearest]
    }

    /// 各軸の (d/d lo, d/d hi)
    pub fn coord_derivatives(&self) -> [(f32, f32); 3] {
        [
            (self.z.d_lo, self.z.d_hi),
            (self.y.d_lo, self.y.d_hi),
            (self.x.d_lo, self.x.d_hi),
        ]
    }
}
