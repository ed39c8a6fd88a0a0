//! 剂量分布侧别
//!
//! 以CT图像中线划分剂量网格，逐平面累加左右两侧的高百分位剂量

use rt_core::{Laterality, LateralityConfig};
use rt_dicom::{CtImage, DoseGrid};

/// 线性插值百分位数，空输入返回 None
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// CT中线在剂量网格中的列索引
pub fn dose_midline_column(ct: &CtImage, grid: &DoseGrid) -> usize {
    let geometry = grid.geometry();
    let offset = ct.mid_x() - geometry.image_position[0];
    (offset / geometry.pixel_spacing[1]).round().abs() as usize
}

/// 右侧 / 左侧 剂量比
///
/// 低列号为患者右侧。右侧为空的平面整体跳过，左侧为空时只累加右侧
pub fn right_left_ratio(ct: &CtImage, grid: &DoseGrid, p: f64) -> f64 {
    let geometry = grid.geometry();
    let columns = geometry.columns;
    let mid = dose_midline_column(ct, grid).min(columns);

    let mut right_sum = 0.0;
    let mut left_sum = 0.0;
    for frame in 0..geometry.frames() {
        let plane = grid.plane(frame);
        let (mut right, mut left) = (Vec::new(), Vec::new());
        for row in plane.chunks_exact(columns) {
            right.extend_from_slice(&row[..mid]);
            left.extend_from_slice(&row[mid..]);
        }

        let Some(right_value) = percentile(&right, p) else {
            continue;
        };
        right_sum += right_value;
        if let Some(left_value) = percentile(&left, p) {
            left_sum += left_value;
        }
    }

    right_sum / left_sum
}

/// 按阈值把右/左比值分为左侧、右侧或双侧
pub fn classify(ratio: f64, config: &LateralityConfig) -> Laterality {
    if ratio < config.left_threshold {
        Laterality::Left
    } else if ratio > config.right_threshold {
        Laterality::Right
    } else {
        Laterality::Bilateral
    }
}
