//! # 3D RoI 演算子ライブラリ
//!
//! このクレートは、5次元ボリューム `[batch, depth, height, width, channels]` に対する
//! 3次元の RoI (Region of Interest) 演算子を提供するRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **CropAndResize3D**: 正規化ボックスでボリュームを切り出し、固定サイズにリサンプリングします。
//! 2. **CropAndResize3DGradImage / GradBoxes**: 切り出し結果の勾配をボリュームとボックス座標へ逆伝播します。
//! 3. **NonMaxSuppression3D**: 重なった3Dボックスをスコア順に抑制します (Soft-NMS にも対応)。
//! 4. **CombinedNonMaxSuppression3D**: バッチ・クラスごとの NMS をまとめて行います。
//! 5. **演算子レジストリ**: 名前と動的ランクのテンソルで上記の演算子を呼び出します。
//!
//! ## Example
//! ```
//! use ndarray::{arr1, arr2, Array5};
//! use roi_ops_3d::{crop_and_resize_3d, CropAndResizeConfig};
//!
//! let image = Array5::<f32>::ones((1, 4, 4, 4, 1));
//! let boxes = arr2(&[[0.0f32, 0.0, 0.0, 0.5, 0.5, 0.5]]);
//! let crops = crop_and_resize_3d(
//!     image.view(),
//!     boxes.view(),
//!     arr1(&[0]).view(),
//!     [2, 2, 2],
//!     &CropAndResizeConfig::default(),
//! )?;
//! assert_eq!(crops.shape(), &[1, 2, 2, 2, 1]);
//! # Ok::<(), roi_ops_3d::OpError>(())
//! ```

pub mod boxes;
pub mod config;
pub mod crop_and_resize;
pub mod error;
pub mod geometry;
pub mod grad_boxes;
pub mod grad_image;
pub mod nms;
pub mod registry;
pub mod sampling;
pub mod slice_image;

pub use boxes::Box3D;
pub use config::OpsConfig;
pub use crop_and_resize::{crop_and_resize_3d, CropAndResizeConfig};
pub use error::{OpError, Result};
pub use geometry::Extrapolation;
pub use grad_boxes::crop_and_resize_3d_grad_boxes;
pub use grad_image::crop_and_resize_3d_grad_image;
pub use nms::{
    combined_non_max_suppression_3d, non_max_suppression_3d, non_max_suppression_3d_padded,
    CombinedNmsConfig, CombinedNmsOutput, NmsConfig, NmsOutput,
};
pub use registry::{AttrValue, Attrs, OpRegistry, Operator, TensorValue};
pub use sampling::Method;
