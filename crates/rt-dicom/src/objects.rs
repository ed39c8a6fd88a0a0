//! 解析后的放疗DICOM对象

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::grid::GridGeometry;

/// 同一平面的z坐标容差 (mm)
const PLANE_TOLERANCE: f64 = 0.01;

/// 单条轮廓
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contour {
    /// 患者坐标系中的点 (x, y, z)
    pub points: Vec<[f64; 3]>,
}

impl Contour {
    pub fn num_points(&self) -> usize {
        self.points.len()
    }
}

/// 某一z平面上的全部轮廓
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContourPlane {
    pub z: f64,
    pub contours: Vec<Contour>,
}

impl ContourPlane {
    /// 点数最多的轮廓
    pub fn largest_contour(&self) -> Option<&Contour> {
        // 点数相同时保留先出现的轮廓
        self.contours
            .iter()
            .rev()
            .max_by_key(|contour| contour.num_points())
    }
}

/// 结构集中的一个区域 (ROI)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    /// ROI Number
    pub id: i32,
    /// ROI Name，保留原始大小写
    pub name: String,
    /// 按z升序排列
    pub planes: Vec<ContourPlane>,
}

impl Region {
    pub fn new(id: i32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            planes: Vec::new(),
        }
    }

    /// 没有任何带点轮廓的区域视为空
    pub fn is_empty(&self) -> bool {
        !self
            .planes
            .iter()
            .any(|plane| plane.contours.iter().any(|c| c.num_points() > 0))
    }

    /// 按z坐标加入轮廓，保持平面有序
    pub fn add_contour(&mut self, contour: Contour) {
        let Some(z) = contour.points.first().map(|p| p[2]) else {
            return;
        };
        match self
            .planes
            .iter_mut()
            .find(|plane| (plane.z - z).abs() < PLANE_TOLERANCE)
        {
            Some(plane) => plane.contours.push(contour),
            None => {
                self.planes.push(ContourPlane {
                    z,
                    contours: vec![contour],
                });
                self.planes.sort_by(|a, b| a.z.total_cmp(&b.z));
            }
        }
    }

    /// 相邻平面之间的最小间距
    pub fn plane_thickness(&self) -> Option<f64> {
        self.planes
            .windows(2)
            .map(|pair| (pair[1].z - pair[0].z).abs())
            .filter(|gap| *gap > PLANE_TOLERANCE)
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// RT结构集
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StructureSet {
    pub sop_instance_uid: Option<String>,
    /// 文件中的出现顺序
    pub regions: Vec<Region>,
}

impl StructureSet {
    pub fn region(&self, id: i32) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// 按名称查找（大小写敏感）
    pub fn region_by_name(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }
}

/// 分次组
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FractionGroup {
    pub number: Option<i32>,
    pub fractions_planned: Option<u32>,
}

/// RT计划
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RtPlan {
    pub sop_instance_uid: String,
    pub label: Option<String>,
    pub study_date: Option<NaiveDate>,
    pub fraction_groups: Vec<FractionGroup>,
}

impl RtPlan {
    /// 第一个分次组的计划分次数
    pub fn fractions(&self) -> Option<u32> {
        self.fraction_groups
            .first()
            .and_then(|group| group.fractions_planned)
    }
}

/// RT剂量文件的头信息（不含像素）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RtDose {
    pub sop_instance_uid: String,
    /// ReferencedRTPlanSequence 中的第一个计划
    pub referenced_plan_uid: Option<String>,
    pub dose_grid_scaling: f64,
    /// 原始像素最大值（未乘缩放）
    pub dose_max: f64,
    pub geometry: GridGeometry,
}

impl RtDose {
    /// 剂量网格最大值 (Gy) = 缩放因子 × 像素最大值
    pub fn max_dose(&self) -> f64 {
        self.dose_grid_scaling * self.dose_max
    }
}

/// 第一张CT图像的几何与设备信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CtImage {
    pub sop_instance_uid: Option<String>,
    pub image_position: [f64; 3],
    /// (行间距, 列间距)
    pub pixel_spacing: [f64; 2],
    pub rows: usize,
    pub columns: usize,
    pub slice_thickness: Option<f64>,
    pub manufacturer: Option<String>,
    pub kvp: Option<f64>,
    pub software_versions: Option<String>,
}

impl CtImage {
    /// 图像中线在患者坐标系中的x位置
    pub fn mid_x(&self) -> f64 {
        self.image_position[0] + self.columns as f64 * self.pixel_spacing[1] / 2.0
    }
}
