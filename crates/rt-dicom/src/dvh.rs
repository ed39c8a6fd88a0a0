//! 剂量体积直方图 (DVH)
//!
//! 由区域轮廓和剂量网格计算累积DVH，并按名称（`mean`、`d95`、`v20gy` 等）取统计量

use regex::Regex;
use rt_core::{Result, RtError};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

use crate::grid::DoseGrid;
use crate::objects::{ContourPlane, Region};

/// 直方图的剂量分箱宽度 (Gy)
pub const DEFAULT_BIN_WIDTH: f64 = 0.01;

/// 体积输出模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeMode {
    /// cc
    Absolute,
    /// 占区域总体积的百分比
    Relative,
}

impl VolumeMode {
    /// 解析 `abs` / `rel`
    pub fn parse(flag: &str) -> Option<Self> {
        match flag {
            "abs" => Some(VolumeMode::Absolute),
            "rel" => Some(VolumeMode::Relative),
            _ => None,
        }
    }
}

/// 带单位的DVH统计值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DvhValue {
    pub value: f64,
    pub units: String,
}

impl DvhValue {
    fn new(value: f64, units: &str) -> Self {
        Self {
            value,
            units: units.to_string(),
        }
    }
}

/// 微分形式存储的剂量体积直方图
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dvh {
    pub name: String,
    pub bin_width: f64,
    /// 第 i 个元素为剂量落在 [i·w, (i+1)·w) 内的体积 (cc)
    pub differential: Vec<f64>,
    /// 处方剂量，用于相对剂量 (Gy)
    pub rx_dose: Option<f64>,
}

impl Dvh {
    pub fn new(name: &str, bin_width: f64, differential: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            bin_width,
            differential,
            rx_dose: None,
        }
    }

    pub fn with_rx_dose(mut self, rx_dose: f64) -> Self {
        self.rx_dose = (rx_dose > 0.0).then_some(rx_dose);
        self
    }

    /// 第 i 个元素为受照剂量 ≥ i·w 的体积
    pub fn cumulative(&self) -> Vec<f64> {
        let mut cumulative = vec![0.0; self.differential.len() + 1];
        for i in (0..self.differential.len()).rev() {
            cumulative[i] = cumulative[i + 1] + self.differential[i];
        }
        cumulative
    }

    /// 区域总体积 (cc)
    pub fn volume(&self) -> f64 {
        self.differential.iter().sum()
    }

    /// 平均剂量 (Gy)
    pub fn mean(&self) -> f64 {
        let volume = self.volume();
        if volume <= 0.0 {
            return 0.0;
        }
        self.differential
            .iter()
            .enumerate()
            .map(|(i, v)| v * (i as f64 + 0.5) * self.bin_width)
            .sum::<f64>()
            / volume
    }

    /// 最大剂量 (Gy)，取最后一个非零分箱的上沿
    pub fn max(&self) -> f64 {
        self.differential
            .iter()
            .rposition(|v| *v > 0.0)
            .map_or(0.0, |i| (i + 1) as f64 * self.bin_width)
    }

    /// 最小剂量 (Gy)，取第一个非零分箱的下沿
    pub fn min(&self) -> f64 {
        self.differential
            .iter()
            .position(|v| *v > 0.0)
            .map_or(0.0, |i| i as f64 * self.bin_width)
    }

    /// Dx：至少 `volume` 体积所接受的最高剂量 (Gy)
    pub fn dose_constraint(&self, volume: f64, volume_in_cc: bool) -> f64 {
        let total = self.volume();
        let target = if volume_in_cc {
            volume
        } else {
            volume / 100.0 * total
        };
        if target > total || total <= 0.0 {
            return 0.0;
        }
        let cumulative = self.cumulative();
        cumulative
            .iter()
            .rposition(|v| *v >= target - 1e-12)
            .map_or(0.0, |i| i as f64 * self.bin_width)
    }

    /// Vx：受照剂量 ≥ `dose_gy` 的体积
    pub fn volume_constraint(&self, dose_gy: f64, mode: VolumeMode) -> f64 {
        let index = (dose_gy / self.bin_width - 1e-9).ceil().max(0.0) as usize;
        let cumulative = self.cumulative();
        let volume = cumulative.get(index).copied().unwrap_or(0.0);
        match mode {
            VolumeMode::Absolute => volume,
            VolumeMode::Relative => {
                let total = self.volume();
                if total > 0.0 {
                    volume / total * 100.0
                } else {
                    0.0
                }
            }
        }
    }

    /// 按名称取统计量
    ///
    /// 支持 `mean`、`volume`、`max`、`min`、`d<体积%>`、`d<体积>cc`、
    /// `v<处方%>`、`v<剂量>gy`
    pub fn statistic(&self, name: &str, mode: VolumeMode) -> Result<DvhValue> {
        let name = name.trim().to_lowercase();
        match name.as_str() {
            "mean" => return Ok(DvhValue::new(self.mean(), "Gy")),
            "volume" => return Ok(DvhValue::new(self.volume(), "cc")),
            "max" => return Ok(DvhValue::new(self.max(), "Gy")),
            "min" => return Ok(DvhValue::new(self.min(), "Gy")),
            _ => {}
        }

        let captures = point_pattern()
            .captures(&name)
            .ok_or_else(|| RtError::Dvh(format!("无法识别的DVH点: {}", name)))?;
        let amount: f64 = captures[2]
            .parse()
            .map_err(|_| RtError::Dvh(format!("DVH点数值无效: {}", name)))?;
        let unit = captures.get(3).map(|m| m.as_str());

        match (&captures[1], unit) {
            ("d", Some("gy")) => Err(RtError::Dvh(format!("D点不能使用Gy单位: {}", name))),
            ("d", unit) => {
                let dose = self.dose_constraint(amount, unit == Some("cc"));
                Ok(DvhValue::new(dose, "Gy"))
            }
            ("v", Some("cc")) => Err(RtError::Dvh(format!("V点不能使用cc单位: {}", name))),
            ("v", unit) => {
                let dose_gy = if unit == Some("gy") {
                    amount
                } else {
                    let rx = self.rx_dose.ok_or_else(|| {
                        RtError::Dvh(format!("未设置处方剂量，无法计算相对剂量点: {}", name))
                    })?;
                    amount / 100.0 * rx
                };
                let units = match mode {
                    VolumeMode::Absolute => "cc",
                    VolumeMode::Relative => "%",
                };
                Ok(DvhValue::new(self.volume_constraint(dose_gy, mode), units))
            }
            _ => Err(RtError::Dvh(format!("无法识别的DVH点: {}", name))),
        }
    }
}

fn point_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([dv])(\d+(?:\.\d+)?)(cc|gy)?$").expect("DVH点正则表达式有效")
    })
}

/// 计算区域在剂量网格上的累积DVH
///
/// 每个轮廓平面映射到最近的剂量平面，平面内所有轮廓按奇偶规则组合（处理空洞），
/// 体素权重为 像素面积 × 平面厚度
pub fn calculate_dvh(region: &Region, grid: &DoseGrid, bin_width: f64) -> Result<Dvh> {
    if region.is_empty() {
        return Err(RtError::Dvh(format!("区域 {} 没有轮廓", region.name)));
    }

    let geometry = grid.geometry();
    let thickness = region
        .plane_thickness()
        .or_else(|| geometry.frame_spacing())
        .ok_or_else(|| RtError::Dvh(format!("无法确定区域 {} 的平面厚度", region.name)))?;

    let voxel_cc = geometry.pixel_spacing[0] * geometry.pixel_spacing[1] * thickness / 1000.0;
    let xs = geometry.x_positions();
    let ys = geometry.y_positions();

    let mut differential: Vec<f64> = Vec::new();
    let mut planes_used = 0usize;

    for plane in &region.planes {
        let Some((frame, distance)) = geometry.nearest_frame(plane.z) else {
            continue;
        };
        if distance > thickness / 2.0 + 1e-6 {
            continue;
        }
        planes_used += 1;

        let dose_plane = grid.plane(frame);
        for (row, y) in ys.iter().enumerate() {
            for (column, x) in xs.iter().enumerate() {
                if !inside_plane(plane, *x, *y) {
                    continue;
                }
                let dose = dose_plane[row * geometry.columns + column];
                let bin = (dose / bin_width).floor().max(0.0) as usize;
                if differential.len() <= bin {
                    differential.resize(bin + 1, 0.0);
                }
                differential[bin] += voxel_cc;
            }
        }
    }

    debug!(
        "DVH计算完成: 区域 {}, 使用 {} / {} 个平面",
        region.name,
        planes_used,
        region.planes.len()
    );

    Ok(Dvh::new(&region.name, bin_width, differential))
}

/// 奇偶规则：点落在奇数个轮廓内即视为区域内
fn inside_plane(plane: &ContourPlane, x: f64, y: f64) -> bool {
    plane
        .contours
        .iter()
        .filter(|contour| point_in_polygon(&contour.points, x, y))
        .count()
        % 2
        == 1
}

fn point_in_polygon(points: &[[f64; 3]], x: f64, y: f64) -> bool {
    if points.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (xi, yi) = (points[i][0], points[i][1]);
        let (xj, yj) = (points[j][0], points[j][1]);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::tests::geometry;
    use crate::objects::Contour;

    fn square(z: f64, lo: f64, hi: f64) -> Contour {
        Contour {
            points: vec![[lo, lo, z], [hi, lo, z], [hi, hi, z], [lo, hi, z]],
        }
    }

    fn step_dvh() -> Dvh {
        // 10cc 接受 1 Gy，10cc 接受 3 Gy
        let mut differential = vec![0.0; 400];
        differential[100] = 10.0;
        differential[300] = 10.0;
        Dvh::new("test", DEFAULT_BIN_WIDTH, differential).with_rx_dose(2.0)
    }

    #[test]
    fn test_basic_statistics() {
        let dvh = step_dvh();
        assert!((dvh.volume() - 20.0).abs() < 1e-9);
        assert!((dvh.mean() - 2.005).abs() < 1e-9);
        assert!((dvh.max() - 3.01).abs() < 1e-9);
        assert!((dvh.min() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_dose_and_volume_points() {
        let dvh = step_dvh();
        let d50 = dvh.statistic("d50", VolumeMode::Absolute).unwrap();
        assert!((d50.value - 3.0).abs() < 1e-9);
        assert_eq!(d50.units, "Gy");

        let d15cc = dvh.statistic("D15cc", VolumeMode::Absolute).unwrap();
        assert!((d15cc.value - 1.0).abs() < 1e-9);

        let v2gy = dvh.statistic("v2gy", VolumeMode::Absolute).unwrap();
        assert!((v2gy.value - 10.0).abs() < 1e-9);
        assert_eq!(v2gy.units, "cc");

        // 处方 2 Gy 的 100% 即 2 Gy
        let v100 = dvh.statistic("v100", VolumeMode::Relative).unwrap();
        assert!((v100.value - 50.0).abs() < 1e-9);
        assert_eq!(v100.units, "%");
    }

    #[test]
    fn test_unknown_and_relative_without_rx() {
        let dvh = step_dvh();
        assert!(dvh.statistic("x95", VolumeMode::Absolute).is_err());
        assert!(dvh.statistic("d5gy", VolumeMode::Absolute).is_err());

        let no_rx = Dvh::new("test", DEFAULT_BIN_WIDTH, vec![1.0]);
        assert!(matches!(
            no_rx.statistic("v95", VolumeMode::Absolute),
            Err(RtError::Dvh(_))
        ));
    }

    #[test]
    fn test_calculate_dvh_on_uniform_grid() {
        let mut g = geometry(10, 10, 3);
        g.frame_offsets = vec![0.0, 2.0, 4.0];
        let values = vec![2.0; g.voxel_count()];
        let grid = DoseGrid::new(g, values).unwrap();

        let mut region = Region::new(1, "Heart");
        region.add_contour(square(0.0, 1.5, 5.5));
        region.add_contour(square(2.0, 1.5, 5.5));

        let dvh = calculate_dvh(&region, &grid, DEFAULT_BIN_WIDTH).unwrap();
        // 每平面 4×4 个体素，体素体积 1×1×2 mm³
        assert!((dvh.volume() - 2.0 * 16.0 * 2.0 / 1000.0).abs() < 1e-12);
        assert!((dvh.mean() - 2.005).abs() < 1e-9);
    }

    #[test]
    fn test_hole_is_excluded() {
        // 单平面区域的厚度取剂量平面间距 (1 mm)
        let grid = DoseGrid::new(geometry(10, 10, 2), vec![1.0; 200]).unwrap();
        let mut region = Region::new(2, "Ring");
        region.add_contour(square(0.0, 0.5, 8.5));
        region.add_contour(square(0.0, 2.5, 6.5));

        let dvh = calculate_dvh(&region, &grid, DEFAULT_BIN_WIDTH).unwrap();
        // 外框 8×8=64 个体素，内孔 4×4=16 个
        let voxel_cc = 1.0 / 1000.0;
        assert!((dvh.volume() - 48.0 * voxel_cc).abs() < 1e-12);
    }

    #[test]
    fn test_empty_region_is_rejected() {
        let grid = DoseGrid::new(geometry(2, 2, 1), vec![1.0; 4]).unwrap();
        assert!(calculate_dvh(&Region::new(9, "Empty"), &grid, DEFAULT_BIN_WIDTH).is_err());
    }
}
