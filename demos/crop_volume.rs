use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::{arr1, arr2, Array1, Array5, Axis, Ix5};

use roi_ops_3d::boxes::parse_boxes;
use roi_ops_3d::slice_image::{draw_boxes_on_slice, render_slice};
use roi_ops_3d::{AttrValue, Attrs, OpRegistry, OpsConfig, TensorValue};

fn main() -> Result<()> {
    // 第1引数で設定ファイルを指定できる
    let config = match std::env::args().nth(1) {
        Some(path) => OpsConfig::from_path(path)?,
        None => OpsConfig::default(),
    };
    let registry = OpRegistry::with_builtin_ops(&config)?;

    // 中心から離れるほど暗くなる球状のボリューム
    let (d, h, w) = (32usize, 48usize, 48usize);
    let volume = Array5::from_shape_fn((1, d, h, w, 1), |(_, z, y, x, _)| {
        let dz = z as f32 / (d - 1) as f32 - 0.5;
        let dy = y as f32 / (h - 1) as f32 - 0.5;
        let dx = x as f32 / (w - 1) as f32 - 0.5;
        (1.0 - 2.0 * (dz * dz + dy * dy + dx * dx).sqrt()).max(0.0)
    });

    let boxes = arr2(&[
        [0.25f32, 0.25, 0.25, 0.75, 0.75, 0.75],
        [0.3, 0.3, 0.3, 0.8, 0.8, 0.8],
        [0.0, 0.0, 0.5, 0.4, 0.5, 1.0],
    ]);
    let scores = arr1(&[0.9f32, 0.7, 0.4]);

    // ./out ディレクトリを作成
    std::fs::create_dir_all("./out")?;

    let start = Instant::now();
    let nms_out = registry.run(
        "NonMaxSuppression3D",
        &[
            TensorValue::from(boxes.clone()),
            TensorValue::from(scores),
            TensorValue::from(arr1(&[10i32])),
        ],
        &Attrs::from([("iou_threshold".to_string(), AttrValue::Float(0.3))]),
    )?;
    let selected: Vec<usize> = nms_out[0]
        .as_i32()
        .context("selected_indices must be int32")?
        .iter()
        .map(|&i| i as usize)
        .collect();
    println!(
        "NMS: kept {:?} ({:.03}ms)",
        selected,
        start.elapsed().as_secs_f64() * 1000.0
    );

    let kept = boxes.select(Axis(0), &selected);
    let box_index = Array1::<i32>::zeros(selected.len());

    let start = Instant::now();
    let crops = registry.run(
        "CropAndResize3D",
        &[
            TensorValue::from(volume.clone()),
            TensorValue::from(kept.clone()),
            TensorValue::from(box_index),
            TensorValue::from(arr1(&[16i32, 16, 16])),
        ],
        &Attrs::new(),
    )?;
    let crops = crops[0]
        .as_f32()
        .context("crops must be float32")?
        .view()
        .into_dimensionality::<Ix5>()?;
    println!(
        "CropAndResize3D: {:?} ({:.03}ms)",
        crops.shape(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    let parsed = parse_boxes("demo", kept.view())?;
    for z in (0..d).step_by(8) {
        let slice = render_slice(volume.view(), 0, z, 0)?;
        draw_boxes_on_slice(&slice, &parsed, z, d, 4).save(format!("./out/volume_z{:02}.png", z))?;
    }
    for b in 0..crops.len_of(Axis(0)) {
        let slice = render_slice(crops.view(), b, 8, 0)?;
        draw_boxes_on_slice(&slice, &[], 8, 16, 8).save(format!("./out/crop{}_z08.png", b))?;
    }
    println!("saved slices to ./out");

    Ok(())
}
