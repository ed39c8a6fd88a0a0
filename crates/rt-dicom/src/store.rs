//! DICOM对象存储接口
//!
//! 疗程逻辑只通过 [`DicomObjectStore`] 读取和写出DICOM对象，测试中可替换为内存实现

use rt_core::utils::generate_dicom_uid;
use rt_core::{Result, RtError};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::dvh::{calculate_dvh, Dvh, DEFAULT_BIN_WIDTH};
use crate::grid::DoseGrid;
use crate::objects::{CtImage, RtDose, RtPlan, StructureSet};
use crate::parser::RtDicomParser;

/// DICOM对象存储
pub trait DicomObjectStore {
    fn parse_structure_set(&self, path: &Path) -> Result<StructureSet>;

    fn parse_plan(&self, path: &Path) -> Result<RtPlan>;

    fn parse_dose(&self, path: &Path) -> Result<RtDose>;

    fn parse_ct_image(&self, path: &Path) -> Result<CtImage>;

    fn load_dose_grid(&self, path: &Path) -> Result<DoseGrid>;

    /// 计算结构集中某区域在剂量文件上的DVH
    fn compute_dvh(&self, structure_path: &Path, dose_path: &Path, region_id: i32) -> Result<Dvh>;

    fn artifact_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// 写出求和剂量文件及其日志，返回新文件的 SOP Instance UID
    ///
    /// `template` 为提供头信息的原始剂量文件，日志写到同目录的 `log_<文件名>.txt`
    fn write_sum_dose_artifact(
        &self,
        grid: &DoseGrid,
        template: &Path,
        destination: &Path,
        log_lines: &[String],
    ) -> Result<String>;
}

/// 基于文件系统的DICOM存储
#[derive(Debug, Clone)]
pub struct DicomFileStore {
    bin_width: f64,
}

impl Default for DicomFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DicomFileStore {
    pub fn new() -> Self {
        Self {
            bin_width: DEFAULT_BIN_WIDTH,
        }
    }

    pub fn with_bin_width(bin_width: f64) -> Self {
        Self { bin_width }
    }

    /// 日志文件路径：`treatment_7_sum_dose.dcm` → `log_treatment_7.txt`
    pub fn log_path(destination: &Path) -> Option<std::path::PathBuf> {
        let stem = destination.file_stem()?.to_str()?;
        let base = stem.strip_suffix("_sum_dose").unwrap_or(stem);
        Some(destination.with_file_name(format!("log_{}.txt", base)))
    }
}

impl DicomObjectStore for DicomFileStore {
    fn parse_structure_set(&self, path: &Path) -> Result<StructureSet> {
        RtDicomParser::parse_structure_set(path)
    }

    fn parse_plan(&self, path: &Path) -> Result<RtPlan> {
        RtDicomParser::parse_plan(path)
    }

    fn parse_dose(&self, path: &Path) -> Result<RtDose> {
        RtDicomParser::parse_dose(path)
    }

    fn parse_ct_image(&self, path: &Path) -> Result<CtImage> {
        RtDicomParser::parse_ct_image(path)
    }

    fn load_dose_grid(&self, path: &Path) -> Result<DoseGrid> {
        RtDicomParser::load_dose_grid(path)
    }

    fn compute_dvh(&self, structure_path: &Path, dose_path: &Path, region_id: i32) -> Result<Dvh> {
        let structure = self.parse_structure_set(structure_path)?;
        let region = structure.region(region_id).ok_or_else(|| {
            RtError::Dvh(format!(
                "结构集 {:?} 中不存在区域编号 {}",
                structure_path, region_id
            ))
        })?;
        let grid = self.load_dose_grid(dose_path)?;
        debug!("计算DVH: 区域 {} ({})", region.name, region_id);
        calculate_dvh(region, &grid, self.bin_width)
    }

    fn write_sum_dose_artifact(
        &self,
        grid: &DoseGrid,
        template: &Path,
        destination: &Path,
        log_lines: &[String],
    ) -> Result<String> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let uid = generate_dicom_uid();
        RtDicomParser::write_dose_file(template, grid, destination, &uid)?;

        if let Some(log_path) = Self::log_path(destination) {
            let mut content = log_lines.join("\n");
            content.push('\n');
            fs::write(&log_path, content)?;
            debug!("求和日志已写出: {:?}", log_path);
        }

        info!("求和剂量文件已保存: {:?} (UID {})", destination, uid);
        Ok(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_log_path_next_to_artifact() {
        let destination = PathBuf::from("/data/aarhus_dose_sum/0101/treatment_7_sum_dose.dcm");
        assert_eq!(
            DicomFileStore::log_path(&destination),
            Some(PathBuf::from("/data/aarhus_dose_sum/0101/log_treatment_7.txt"))
        );
    }

    #[test]
    fn test_missing_artifact_does_not_exist() {
        let store = DicomFileStore::new();
        assert!(!store.artifact_exists(Path::new("/nonexistent/treatment_1_sum_dose.dcm")));
    }

    #[test]
    fn test_compute_dvh_unreadable_structure() {
        let store = DicomFileStore::new();
        let result = store.compute_dvh(
            Path::new("/nonexistent/rs.dcm"),
            Path::new("/nonexistent/rd.dcm"),
            1,
        );
        assert!(matches!(result, Err(RtError::DicomParse(_))));
    }
}
