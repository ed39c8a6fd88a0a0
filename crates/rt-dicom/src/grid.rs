//! 剂量网格
//!
//! 以Gy为单位保存剂量值，提供缩放、相加（可强制对齐不同网格）和插值

use rt_core::{Result, RtError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 几何比较容差 (mm)
const GEOMETRY_TOLERANCE: f64 = 1e-3;

/// 剂量网格几何
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridGeometry {
    pub rows: usize,
    pub columns: usize,
    /// ImagePositionPatient，第一个体素中心
    pub image_position: [f64; 3],
    /// (行间距, 列间距)
    pub pixel_spacing: [f64; 2],
    pub image_orientation: [f64; 6],
    /// GridFrameOffsetVector
    pub frame_offsets: Vec<f64>,
}

impl GridGeometry {
    pub fn frames(&self) -> usize {
        self.frame_offsets.len()
    }

    pub fn voxel_count(&self) -> usize {
        self.rows * self.columns * self.frames()
    }

    /// 各列中心的x坐标
    pub fn x_positions(&self) -> Vec<f64> {
        (0..self.columns)
            .map(|c| {
                self.image_position[0]
                    + c as f64 * self.pixel_spacing[1] * self.image_orientation[0]
            })
            .collect()
    }

    /// 各行中心的y坐标
    pub fn y_positions(&self) -> Vec<f64> {
        (0..self.rows)
            .map(|r| {
                self.image_position[1]
                    + r as f64 * self.pixel_spacing[0] * self.image_orientation[4]
            })
            .collect()
    }

    /// 各剂量平面的z坐标
    pub fn z_positions(&self) -> Vec<f64> {
        self.frame_offsets
            .iter()
            .map(|offset| offset * self.image_orientation[0] + self.image_position[2])
            .collect()
    }

    /// 相邻剂量平面的间距
    pub fn frame_spacing(&self) -> Option<f64> {
        let z = self.z_positions();
        if z.len() < 2 {
            return None;
        }
        Some((z[1] - z[0]).abs())
    }

    /// 距离给定z最近的平面索引
    pub fn nearest_frame(&self, z: f64) -> Option<(usize, f64)> {
        self.z_positions()
            .into_iter()
            .enumerate()
            .map(|(index, plane_z)| (index, (plane_z - z).abs()))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn coincides_with(&self, other: &GridGeometry) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() < GEOMETRY_TOLERANCE;
        self.rows == other.rows
            && self.columns == other.columns
            && self.frames() == other.frames()
            && self
                .image_position
                .iter()
                .zip(other.image_position.iter())
                .all(|(a, b)| close(*a, *b))
            && self
                .pixel_spacing
                .iter()
                .zip(other.pixel_spacing.iter())
                .all(|(a, b)| close(*a, *b))
            && self
                .image_orientation
                .iter()
                .zip(other.image_orientation.iter())
                .all(|(a, b)| close(*a, *b))
            && self
                .frame_offsets
                .iter()
                .zip(other.frame_offsets.iter())
                .all(|(a, b)| close(*a, *b))
    }
}

/// 三维剂量网格，按 帧 → 行 → 列 顺序存储
#[derive(Debug, Clone, PartialEq)]
pub struct DoseGrid {
    geometry: GridGeometry,
    values: Vec<f64>,
}

impl DoseGrid {
    pub fn new(geometry: GridGeometry, values: Vec<f64>) -> Result<Self> {
        if geometry.rows == 0 || geometry.columns == 0 {
            return Err(RtError::Dicom(format!(
                "剂量网格为空: {} 行 × {} 列",
                geometry.rows, geometry.columns
            )));
        }
        if values.len() != geometry.voxel_count() {
            return Err(RtError::Dicom(format!(
                "剂量网格大小不匹配: 期望 {} 个体素, 实际 {}",
                geometry.voxel_count(),
                values.len()
            )));
        }
        Ok(Self { geometry, values })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn value(&self, frame: usize, row: usize, column: usize) -> f64 {
        let g = &self.geometry;
        self.values[(frame * g.rows + row) * g.columns + column]
    }

    /// 单个剂量平面（行优先）
    pub fn plane(&self, frame: usize) -> &[f64] {
        let size = self.geometry.rows * self.geometry.columns;
        &self.values[frame * size..(frame + 1) * size]
    }

    /// 网格最大剂量 (Gy)
    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(0.0, f64::max)
    }

    /// 返回缩放后的新网格
    pub fn multiply(self, scale: f64) -> DoseGrid {
        let values = self.values.into_iter().map(|v| v * scale).collect();
        DoseGrid {
            geometry: self.geometry,
            values,
        }
    }

    /// 返回两网格之和，结果使用本网格的几何
    ///
    /// 几何不一致时，`force_align` 为真则把 `other` 三线性插值到本网格上，
    /// 否则报错
    pub fn add(&self, other: &DoseGrid, force_align: bool) -> Result<DoseGrid> {
        if self.geometry.coincides_with(&other.geometry) {
            let values = self
                .values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| a + b)
                .collect();
            return Ok(DoseGrid {
                geometry: self.geometry.clone(),
                values,
            });
        }

        if !force_align {
            return Err(RtError::Dicom("剂量网格几何不一致，无法直接相加".to_string()));
        }

        debug!("剂量网格几何不一致，插值到目标网格后相加");
        let xs = self.geometry.x_positions();
        let ys = self.geometry.y_positions();
        let zs = self.geometry.z_positions();

        let mut values = Vec::with_capacity(self.values.len());
        for (frame, z) in zs.iter().enumerate() {
            for (row, y) in ys.iter().enumerate() {
                for (column, x) in xs.iter().enumerate() {
                    values.push(self.value(frame, row, column) + other.interpolate(*x, *y, *z));
                }
            }
        }

        Ok(DoseGrid {
            geometry: self.geometry.clone(),
            values,
        })
    }

    /// 患者坐标处的三线性插值，网格外为0
    pub fn interpolate(&self, x: f64, y: f64, z: f64) -> f64 {
        let (Some((c0, fx)), Some((r0, fy)), Some((f0, fz))) = (
            bracket(&self.geometry.x_positions(), x),
            bracket(&self.geometry.y_positions(), y),
            bracket(&self.geometry.z_positions(), z),
        ) else {
            return 0.0;
        };

        let g = &self.geometry;
        let c1 = (c0 + 1).min(g.columns - 1);
        let r1 = (r0 + 1).min(g.rows - 1);
        let f1 = (f0 + 1).min(g.frames() - 1);

        let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;
        let plane = |f: usize| {
            let top = lerp(self.value(f, r0, c0), self.value(f, r0, c1), fx);
            let bottom = lerp(self.value(f, r1, c0), self.value(f, r1, c1), fx);
            lerp(top, bottom, fy)
        };
        lerp(plane(f0), plane(f1), fz)
    }
}

/// 在单调坐标轴上定位，返回左侧索引和插值权重
fn bracket(axis: &[f64], value: f64) -> Option<(usize, f64)> {
    match axis.len() {
        0 => None,
        1 => ((axis[0] - value).abs() < GEOMETRY_TOLERANCE).then_some((0, 0.0)),
        _ => axis.windows(2).enumerate().find_map(|(index, pair)| {
            let (lo, hi) = (pair[0].min(pair[1]), pair[0].max(pair[1]));
            if value < lo - GEOMETRY_TOLERANCE || value > hi + GEOMETRY_TOLERANCE {
                return None;
            }
            let span = pair[1] - pair[0];
            let t = if span.abs() < f64::EPSILON {
                0.0
            } else {
                ((value - pair[0]) / span).clamp(0.0, 1.0)
            };
            Some((index, t))
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn geometry(rows: usize, columns: usize, frames: usize) -> GridGeometry {
        GridGeometry {
            rows,
            columns,
            image_position: [0.0, 0.0, 0.0],
            pixel_spacing: [1.0, 1.0],
            image_orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            frame_offsets: (0..frames).map(|f| f as f64).collect(),
        }
    }

    pub(crate) fn uniform_grid(rows: usize, columns: usize, frames: usize, dose: f64) -> DoseGrid {
        let geometry = geometry(rows, columns, frames);
        let values = vec![dose; geometry.voxel_count()];
        DoseGrid::new(geometry, values).unwrap()
    }

    #[test]
    fn test_grid_size_mismatch() {
        assert!(DoseGrid::new(geometry(2, 2, 2), vec![0.0; 7]).is_err());
    }

    #[test]
    fn test_empty_plane_rejected() {
        let result = DoseGrid::new(geometry(2, 0, 1), vec![]);
        assert!(matches!(result, Err(RtError::Dicom(_))));
        assert!(DoseGrid::new(geometry(0, 3, 1), vec![]).is_err());
    }

    #[test]
    fn test_multiply_and_add_same_geometry() {
        let a = uniform_grid(2, 3, 2, 2.0).multiply(1.5);
        let b = uniform_grid(2, 3, 2, 1.0);
        let sum = a.add(&b, false).unwrap();
        assert!(sum.values().iter().all(|v| (*v - 4.0).abs() < 1e-12));
        assert_eq!(sum.max(), 4.0);
    }

    #[test]
    fn test_add_mismatched_geometry_requires_force() {
        let a = uniform_grid(4, 4, 3, 1.0);
        let mut shifted = geometry(4, 4, 3);
        shifted.image_position = [1.0, 0.0, 0.0];
        let b = DoseGrid::new(shifted, vec![2.0; 48]).unwrap();

        assert!(a.add(&b, false).is_err());

        let sum = a.add(&b, true).unwrap();
        // 第0列不在b的覆盖范围内
        assert_eq!(sum.value(0, 0, 0), 1.0);
        assert!((sum.value(1, 1, 2) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_interpolation_between_voxels() {
        let geometry = geometry(1, 2, 1);
        let grid = DoseGrid::new(geometry, vec![0.0, 10.0]).unwrap();
        assert!((grid.interpolate(0.25, 0.0, 0.0) - 2.5).abs() < 1e-12);
        assert_eq!(grid.interpolate(5.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_nearest_frame() {
        let geometry = geometry(1, 1, 4);
        assert_eq!(geometry.nearest_frame(2.2).map(|(i, _)| i), Some(2));
        assert_eq!(geometry.frame_spacing(), Some(1.0));
    }
}
