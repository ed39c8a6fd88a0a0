//! 核心数据模型定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RtError;

/// 目录中登记的DICOM文件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Ct,
    Structure,
    Plan,
    Dose,
    SumDose,
    AugmentedStruct,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Ct => "ct",
            FileKind::Structure => "structure",
            FileKind::Plan => "plan",
            FileKind::Dose => "dose",
            FileKind::SumDose => "sum_dose",
            FileKind::AugmentedStruct => "augmented_struct",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = RtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ct" => Ok(FileKind::Ct),
            "structure" => Ok(FileKind::Structure),
            "plan" => Ok(FileKind::Plan),
            "dose" => Ok(FileKind::Dose),
            "sum_dose" => Ok(FileKind::SumDose),
            "augmented_struct" => Ok(FileKind::AugmentedStruct),
            other => Err(RtError::Catalog(format!("未知的文件类型: {}", other))),
        }
    }
}

/// 目录中的一条文件记录，路径相对于DICOM根目录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub file_id: i64,
    pub treatment_id: Option<i64>,
    /// 原始类型字符串，未知类型由调用方记录并忽略
    pub kind: String,
    pub path: String,
    pub uid: Option<String>,
}

impl FileRecord {
    pub fn file_kind(&self) -> Option<FileKind> {
        self.kind.parse().ok()
    }
}

/// 处方参数，构造后不可变
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Prescription {
    pub main_reference_dose: f64,
    pub main_dose_scale_factor: f64,
    /// 0 表示没有加量 (boost)
    pub boost_reference_dose: f64,
    pub boost_dose_scale_factor: f64,
}

impl Prescription {
    pub fn new(
        main_reference_dose: f64,
        main_dose_scale_factor: f64,
        boost_reference_dose: f64,
        boost_dose_scale_factor: f64,
    ) -> Self {
        Self {
            main_reference_dose,
            main_dose_scale_factor,
            boost_reference_dose,
            boost_dose_scale_factor,
        }
    }

    /// 无加量、无缩放的单一处方
    pub fn main_only(main_reference_dose: f64) -> Self {
        Self::new(main_reference_dose, 1.0, 0.0, 1.0)
    }

    pub fn has_boost(&self) -> bool {
        self.boost_reference_dose != 0.0
    }
}

/// 疗程目录行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreatmentRecord {
    pub treatment_id: i64,
    pub patient_id: String,
    pub collection_id: i64,
    /// 治疗中心
    pub treatment_place: Option<String>,
    pub prescription: Prescription,
}

/// 目录中某标准名称的同义词
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SynonymRecord {
    pub synonym: String,
    pub priority_count: Option<i64>,
    /// `l` / `r` / `i`，缺省为无侧别
    pub laterality: Option<String>,
}

/// 增强（例如深度学习生成的）结构集
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AugmentedStructure {
    pub path: String,
    pub structure_collection_id: i64,
}

/// 剂量分布的左右侧别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Laterality {
    #[serde(rename = "left")]
    Left,
    #[serde(rename = "right")]
    Right,
    #[serde(rename = "bilat")]
    Bilateral,
}

impl Laterality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Laterality::Left => "left",
            Laterality::Right => "right",
            Laterality::Bilateral => "bilat",
        }
    }
}

impl fmt::Display for Laterality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 从目录中选取疗程的过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreatmentFilter {
    /// 只取前 N 个疗程（调试用）
    pub limit: Option<usize>,
    pub departments: Option<Vec<String>>,
    pub exclude_patients: Option<Vec<String>>,
    pub select_patients: Option<Vec<String>>,
}

impl TreatmentFilter {
    pub fn for_patient(patient_id: &str) -> Self {
        Self {
            select_patients: Some(vec![patient_id.to_string()]),
            ..Self::default()
        }
    }

    /// 内存中应用过滤条件（不含 limit）
    pub fn accepts(&self, record: &TreatmentRecord) -> bool {
        if let Some(departments) = &self.departments {
            match &record.treatment_place {
                Some(place) if departments.contains(place) => {}
                _ => return false,
            }
        }
        if let Some(excluded) = &self.exclude_patients {
            if excluded.contains(&record.patient_id) {
                return false;
            }
        }
        if let Some(selected) = &self.select_patients {
            if !selected.contains(&record.patient_id) {
                return false;
            }
        }
        true
    }
}
