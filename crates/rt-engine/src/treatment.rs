//! 放疗疗程
//!
//! 疗程持有按类型分类的文件路径，校验文件结构后确定唯一的结构集和剂量文件，
//! 解析后的DICOM对象和派生量在首次访问时计算并缓存

use chrono::NaiveDate;
use rt_core::{
    AugmentedStructure, FileKind, Laterality, Prescription, Result, RtError, TreatmentRecord,
};
use rt_dicom::{CtImage, DoseGrid, RtDose, RtPlan, StructureSet};
use serde::Serialize;
use std::cell::OnceCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::context::TreatmentContext;
use crate::laterality;
use crate::roi::Roi;
use crate::state_machine::{ValidationEvent, ValidationState, ValidationStateMachine};
use crate::sum_dose::{create_sum_dose, SumDoseRequest};

/// 取缓存值，未缓存时计算并保存；计算失败不缓存
pub(crate) fn memo<T>(cell: &OnceCell<T>, init: impl FnOnce() -> Result<T>) -> Result<&T> {
    if let Some(value) = cell.get() {
        return Ok(value);
    }
    let value = init()?;
    Ok(cell.get_or_init(|| value))
}

/// 某标准名称对应区域的轮廓几何
#[derive(Debug, Clone, Serialize)]
pub struct StructureGeometry {
    pub region_id: i32,
    /// 小写区域名
    pub region_name: String,
    /// 各平面的z坐标
    pub planes: Vec<f64>,
    /// 每个平面点数最多的轮廓
    pub coordinates: Vec<Vec<[f64; 3]>>,
    pub slice_thickness: Option<f64>,
}

/// 放疗疗程
pub struct Treatment<'a> {
    ctx: TreatmentContext<'a>,
    pub treatment_id: i64,
    pub patient_id: String,
    pub collection_id: i64,
    pub treatment_place: Option<String>,
    prescription: Prescription,

    pub ct_paths: BTreeSet<PathBuf>,
    pub structure_paths: BTreeSet<PathBuf>,
    pub plan_paths: BTreeSet<PathBuf>,
    pub dose_paths: BTreeSet<PathBuf>,
    pub sum_dose_paths: BTreeSet<PathBuf>,

    state_machine: ValidationStateMachine,
    state: ValidationState,
    failure: Option<String>,
    /// 结构集已替换为增强结构集
    structure_replaced: bool,
    structure_path: Option<PathBuf>,
    dose_path: Option<PathBuf>,
    sum_dose_path: Option<PathBuf>,

    structure: OnceCell<StructureSet>,
    plans: OnceCell<Vec<RtPlan>>,
    dose: OnceCell<RtDose>,
    dose_grid: OnceCell<DoseGrid>,
    ct_image: OnceCell<CtImage>,
    laterality: OnceCell<(f64, Laterality)>,

    rois: Vec<Roi>,
}

impl<'a> Treatment<'a> {
    pub fn new(
        ctx: TreatmentContext<'a>,
        treatment_id: i64,
        patient_id: &str,
        collection_id: i64,
        prescription: Prescription,
    ) -> Self {
        Self {
            ctx,
            treatment_id,
            patient_id: patient_id.to_string(),
            collection_id,
            treatment_place: None,
            prescription,
            ct_paths: BTreeSet::new(),
            structure_paths: BTreeSet::new(),
            plan_paths: BTreeSet::new(),
            dose_paths: BTreeSet::new(),
            sum_dose_paths: BTreeSet::new(),
            state_machine: ValidationStateMachine::new(),
            state: ValidationState::Unvalidated,
            failure: None,
            structure_replaced: false,
            structure_path: None,
            dose_path: None,
            sum_dose_path: None,
            structure: OnceCell::new(),
            plans: OnceCell::new(),
            dose: OnceCell::new(),
            dose_grid: OnceCell::new(),
            ct_image: OnceCell::new(),
            laterality: OnceCell::new(),
            rois: Vec::new(),
        }
    }

    /// 由目录行创建疗程（文件路径尚未加载）
    pub fn from_record(ctx: TreatmentContext<'a>, record: &TreatmentRecord) -> Self {
        let mut treatment = Self::new(
            ctx,
            record.treatment_id,
            &record.patient_id,
            record.collection_id,
            record.prescription,
        );
        treatment.treatment_place = record.treatment_place.clone();
        treatment
    }

    pub fn context(&self) -> TreatmentContext<'a> {
        self.ctx
    }

    pub fn prescription(&self) -> &Prescription {
        &self.prescription
    }

    // ========== 文件路径 ==========

    /// 从目录读取文件并按类型分类，路径拼接DICOM根目录
    pub fn load_file_paths(&mut self) -> Result<()> {
        let files = self.ctx.catalog.list_files(self.treatment_id)?;
        for file in files {
            let local_path = self.ctx.config.local_path(&file.path);
            match file.file_kind() {
                Some(FileKind::Ct) => self.ct_paths.insert(local_path),
                Some(FileKind::Structure) => self.structure_paths.insert(local_path),
                Some(FileKind::Plan) => self.plan_paths.insert(local_path),
                Some(FileKind::Dose) => self.dose_paths.insert(local_path),
                Some(FileKind::SumDose) => self.sum_dose_paths.insert(local_path),
                Some(FileKind::AugmentedStruct) | None => {
                    warn!(
                        "疗程 {} 中的文件类型无法识别: {} ({})",
                        self.treatment_id, file.kind, file.path
                    );
                    false
                }
            };
        }
        debug!(
            "疗程 {} 文件: CT {}, 结构集 {}, 计划 {}, 剂量 {}, 求和剂量 {}",
            self.treatment_id,
            self.ct_paths.len(),
            self.structure_paths.len(),
            self.plan_paths.len(),
            self.dose_paths.len(),
            self.sum_dose_paths.len()
        );
        Ok(())
    }

    // ========== 校验 ==========

    pub fn validation_state(&self) -> ValidationState {
        self.state
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.state == ValidationState::DoseResolved
    }

    /// 依次检查结构集、CT和剂量，首个失败即终止
    ///
    /// 已通过校验时直接返回；已失败时以初始化错误重新报告失败原因
    pub fn validate(&mut self) -> Result<()> {
        match self.state {
            ValidationState::DoseResolved => return Ok(()),
            ValidationState::Failed => {
                return Err(RtError::Init(
                    self.failure.clone().unwrap_or_else(|| "疗程校验失败".to_string()),
                ))
            }
            _ => {}
        }

        let result = self.run_validation();
        if let Err(e) = &result {
            error!(
                "疗程校验失败: 患者 {}, 疗程 {}, 错误: {}",
                self.patient_id, self.treatment_id, e
            );
            self.failure = Some(e.to_string());
            self.state = self
                .state_machine
                .transition(self.state, ValidationEvent::Rejected)?;
        }
        result
    }

    fn run_validation(&mut self) -> Result<()> {
        let structure_path = self.check_structure()?;
        self.advance(ValidationEvent::StructureAccepted)?;

        self.check_cts()?;
        self.advance(ValidationEvent::CtsAccepted)?;

        // 清空结构集后重新校验时沿用已确定的剂量
        let (dose_path, sum_dose_path) = match &self.dose_path {
            Some(path) => (path.clone(), self.sum_dose_path.clone()),
            None => self.resolve_dose()?,
        };
        self.advance(ValidationEvent::DoseResolved)?;

        info!(
            "疗程校验通过: 患者 {}, 疗程 {}, 剂量 {:?}",
            self.patient_id, self.treatment_id, dose_path
        );
        self.structure_path = Some(structure_path);
        self.dose_path = Some(dose_path);
        self.sum_dose_path = sum_dose_path;
        Ok(())
    }

    fn advance(&mut self, event: ValidationEvent) -> Result<()> {
        self.state = self.state_machine.transition(self.state, event)?;
        Ok(())
    }

    fn check_structure(&self) -> Result<PathBuf> {
        let mut paths = self.structure_paths.iter();
        match (paths.next(), paths.next()) {
            (Some(path), None) => Ok(path.clone()),
            (None, _) => Err(RtError::Init(format!(
                "患者 {} 疗程 {} 没有结构集",
                self.patient_id, self.treatment_id
            ))),
            (Some(_), Some(_)) => Err(RtError::Init(format!(
                "患者 {} 疗程 {} 有多于一个结构集",
                self.patient_id, self.treatment_id
            ))),
        }
    }

    fn check_cts(&self) -> Result<()> {
        if self.ct_paths.is_empty() {
            return Err(RtError::Init(format!(
                "患者 {} 疗程 {} 没有CT",
                self.patient_id, self.treatment_id
            )));
        }
        Ok(())
    }

    /// 确定使用的剂量文件，返回 (剂量路径, 求和剂量路径)
    fn resolve_dose(&self) -> Result<(PathBuf, Option<PathBuf>)> {
        if self.plan_paths.len() > self.dose_paths.len() {
            let labels = self.plan_labels().unwrap_or_default();
            return Err(RtError::Init(format!(
                "患者 {}: 计划数多于剂量文件数，计划: {:?}",
                self.patient_id, labels
            )));
        }

        let mut sum_doses = self.sum_dose_paths.iter();
        match (sum_doses.next(), sum_doses.next()) {
            (None, _) => {
                let mut doses = self.dose_paths.iter();
                if let (Some(single), None) = (doses.next(), doses.next()) {
                    if self.prescription.main_dose_scale_factor == 1.0 {
                        return Ok((single.clone(), None));
                    }
                }
                let path = self.summed_dose(true, None)?;
                Ok((path.clone(), Some(path)))
            }
            (Some(existing), None) => {
                if self.ctx.store.artifact_exists(existing) {
                    debug!("使用已有的求和剂量文件: {:?}", existing);
                    return Ok((existing.clone(), Some(existing.clone())));
                }
                warn!(
                    "患者 {} 疗程 {}: 求和剂量文件 {:?} 不存在，重新求和",
                    self.patient_id, self.treatment_id, existing
                );
                let path = self.summed_dose(false, Some(existing.clone()))?;
                Ok((path.clone(), Some(path)))
            }
            (Some(_), Some(_)) => Err(RtError::Init(format!(
                "患者 {} 疗程 {} 有多于一个求和剂量文件",
                self.patient_id, self.treatment_id
            ))),
        }
    }

    fn summed_dose(&self, register: bool, destination: Option<PathBuf>) -> Result<PathBuf> {
        let plans = self.plans()?;
        let dose_paths: Vec<PathBuf> = self.dose_paths.iter().cloned().collect();

        let artifact = create_sum_dose(
            &self.ctx,
            SumDoseRequest {
                treatment_id: self.treatment_id,
                patient_id: &self.patient_id,
                dose_paths: &dose_paths,
                plans,
                prescription: &self.prescription,
                register,
                destination,
            },
        )?;

        match artifact {
            Some(artifact) => {
                let _ = self.dose_grid.set(artifact.grid);
                Ok(artifact.path)
            }
            None => Err(RtError::Init(format!(
                "患者 {} 疗程 {}: 剂量求和失败",
                self.patient_id, self.treatment_id
            ))),
        }
    }

    /// 校验通过后使用的结构集路径
    pub fn structure_path(&self) -> Option<&Path> {
        if !self.is_valid() {
            return None;
        }
        self.structure_path.as_deref()
    }

    /// 校验通过后使用的剂量路径
    pub fn dose_path(&self) -> Option<&Path> {
        if !self.is_valid() {
            return None;
        }
        self.dose_path.as_deref()
    }

    pub fn sum_dose_path(&self) -> Option<&Path> {
        if !self.is_valid() {
            return None;
        }
        self.sum_dose_path.as_deref()
    }

    fn require_structure_path(&self) -> Result<&Path> {
        self.structure_path().ok_or_else(|| {
            RtError::Init(format!(
                "患者 {} 疗程 {} 尚未确定结构集",
                self.patient_id, self.treatment_id
            ))
        })
    }

    fn require_dose_path(&self) -> Result<&Path> {
        self.dose_path().ok_or_else(|| {
            RtError::Init(format!(
                "患者 {} 疗程 {} 尚未确定剂量",
                self.patient_id, self.treatment_id
            ))
        })
    }

    // ========== DICOM数据 ==========

    pub fn structure(&self) -> Result<&StructureSet> {
        let path = self.require_structure_path()?;
        memo(&self.structure, || self.ctx.store.parse_structure_set(path))
    }

    pub fn plans(&self) -> Result<&[RtPlan]> {
        memo(&self.plans, || {
            self.plan_paths
                .iter()
                .map(|path| self.ctx.store.parse_plan(path))
                .collect()
        })
        .map(Vec::as_slice)
    }

    pub fn dose(&self) -> Result<&RtDose> {
        let path = self.require_dose_path()?;
        memo(&self.dose, || self.ctx.store.parse_dose(path))
    }

    pub fn dose_grid(&self) -> Result<&DoseGrid> {
        let path = self.require_dose_path()?;
        memo(&self.dose_grid, || self.ctx.store.load_dose_grid(path))
    }

    /// 第一张CT的图像信息
    pub fn ct_image_data(&self) -> Result<&CtImage> {
        memo(&self.ct_image, || {
            let first = self.ct_paths.iter().next().ok_or_else(|| {
                RtError::NoCts(format!(
                    "患者 {} 疗程 {} 没有CT",
                    self.patient_id, self.treatment_id
                ))
            })?;
            self.ctx.store.parse_ct_image(first)
        })
    }

    /// 加载结构集、计划、剂量和第一张CT
    pub fn load_all_dicom_data(&self) -> Result<()> {
        self.structure()?;
        self.plans()?;
        self.dose()?;
        self.dose_grid()?;
        self.ct_image_data()?;
        Ok(())
    }

    /// 释放剂量网格，之后访问时重新加载
    pub fn release_grids(&mut self) {
        if self.dose_grid.take().is_some() {
            debug!("疗程 {} 已释放剂量网格", self.treatment_id);
        }
    }

    // ========== 派生量 ==========

    /// 所有计划中最早的检查日期
    pub fn study_date(&self) -> Result<Option<NaiveDate>> {
        Ok(self.plans()?.iter().filter_map(|plan| plan.study_date).min())
    }

    pub fn plan_fractions(&self) -> Result<Vec<Option<u32>>> {
        Ok(self.plans()?.iter().map(RtPlan::fractions).collect())
    }

    pub fn plan_labels(&self) -> Result<Vec<String>> {
        Ok(self
            .plans()?
            .iter()
            .map(|plan| plan.label.clone().unwrap_or_default())
            .collect())
    }

    /// 剂量网格缩放因子 × 网格最大值
    pub fn max_dose(&self) -> Result<f64> {
        Ok(self.dose()?.max_dose())
    }

    fn laterality_state(&self) -> Result<(f64, Laterality)> {
        memo(&self.laterality, || {
            let ct = self.ct_image_data()?;
            let grid = self.dose_grid()?;
            let config = &self.ctx.config.laterality;
            let ratio = laterality::right_left_ratio(ct, grid, config.percentile);
            let class = laterality::classify(ratio, config);
            debug!(
                "疗程 {} 右/左剂量比 {:.3}，侧别 {}",
                self.treatment_id, ratio, class
            );
            Ok((ratio, class))
        })
        .copied()
    }

    /// 右侧/左侧剂量比
    pub fn left_right_dose_ratio(&self) -> Result<f64> {
        self.laterality_state().map(|(ratio, _)| ratio)
    }

    pub fn laterality(&self) -> Result<Laterality> {
        self.laterality_state().map(|(_, class)| class)
    }

    // ========== 结构集替换 ==========

    pub fn augmented_structures(
        &self,
        structure_collection_id: Option<i64>,
    ) -> Result<Vec<AugmentedStructure>> {
        self.ctx
            .catalog
            .list_augmented_structures(&self.patient_id, structure_collection_id)
    }

    /// 清空结构集相关信息，剂量不受影响
    ///
    /// 疗程回到未校验状态，重新加入结构集路径后需再次校验
    pub fn reset_structure_information(&mut self) {
        self.structure_paths.clear();
        self.structure_path = None;
        self.structure_replaced = false;
        self.structure = OnceCell::new();
        self.rois.clear();
        if let Ok(state) = self
            .state_machine
            .transition(self.state, ValidationEvent::StructureReset)
        {
            debug!("疗程 {} 结构集已清空，回到 {:?}", self.treatment_id, state);
            self.state = state;
        }
    }

    /// 改用另一个结构集（目录路径），清空所有ROI
    pub fn change_structure(&mut self, catalog_path: &str) -> Result<()> {
        if !self.is_valid() {
            return Err(RtError::Init(format!(
                "患者 {} 疗程 {} 尚未通过校验，不能替换结构集",
                self.patient_id, self.treatment_id
            )));
        }
        self.reset_structure_information();
        let local_path = self.ctx.config.local_path(catalog_path);
        self.structure_paths.insert(local_path);
        self.structure_replaced = true;
        self.validate()?;
        self.structure()?;
        info!("疗程 {} 改用结构集 {}", self.treatment_id, catalog_path);
        Ok(())
    }

    pub fn has_replaced_structure(&self) -> bool {
        self.structure_replaced
    }

    /// 恢复目录中登记的原始结构集
    pub fn restore_original_structure(&mut self) -> Result<()> {
        self.reset_structure_information();
        for file in self.ctx.catalog.list_files(self.treatment_id)? {
            if file.file_kind() == Some(FileKind::Structure) {
                self.structure_paths
                    .insert(self.ctx.config.local_path(&file.path));
            }
        }
        self.validate()
    }

    // ========== ROI ==========

    pub fn rois(&self) -> &[Roi] {
        &self.rois
    }

    pub fn roi(&self, standard_name: &str) -> Option<&Roi> {
        self.rois
            .iter()
            .find(|roi| roi.standard_name() == standard_name)
    }

    /// 添加ROI，同名ROI已存在时返回可忽略的警告错误
    pub fn add_roi(&mut self, standard_name: &str) -> Result<()> {
        if self.roi(standard_name).is_some() {
            warn!("疗程 {} 中ROI已存在: {}", self.treatment_id, standard_name);
            return Err(RtError::RoiAlreadyExists(standard_name.to_string()));
        }
        self.rois.push(Roi::new(standard_name));
        Ok(())
    }

    /// 确保ROI存在
    pub fn ensure_roi(&mut self, standard_name: &str) {
        if self.roi(standard_name).is_none() {
            self.rois.push(Roi::new(standard_name));
        }
    }

    /// 结构集中所有区域名（小写）
    pub fn roi_names_in_structure_set(&self) -> Result<Vec<String>> {
        Ok(self
            .structure()?
            .regions
            .iter()
            .map(|region| region.name.to_lowercase())
            .collect())
    }

    /// 第一个名称属于同义词且非空的区域的轮廓几何
    pub fn structure_geometry(&self, standard_name: &str) -> Result<Option<StructureGeometry>> {
        let synonyms: Vec<String> = self
            .ctx
            .catalog
            .list_synonyms(standard_name, self.collection_id, false)?
            .into_iter()
            .map(|record| record.synonym.to_lowercase())
            .collect();

        let structure = self.structure()?;
        let Some(region) = structure
            .regions
            .iter()
            .find(|region| !region.is_empty() && synonyms.contains(&region.name.to_lowercase()))
        else {
            return Ok(None);
        };

        let coordinates = region
            .planes
            .iter()
            .filter_map(|plane| plane.largest_contour())
            .map(|contour| contour.points.clone())
            .collect();

        Ok(Some(StructureGeometry {
            region_id: region.id,
            region_name: region.name.to_lowercase(),
            planes: region.planes.iter().map(|plane| plane.z).collect(),
            coordinates,
            slice_thickness: region.plane_thickness(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{region, Fixture};
    use rt_core::SynonymRecord;

    #[test]
    fn test_missing_or_duplicate_structure() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.structure_paths.clear();
        assert!(matches!(treatment.validate(), Err(RtError::Init(_))));
        assert_eq!(treatment.structure_path(), None);

        let mut duplicate = fixture.treatment();
        duplicate.structure_paths.insert(PathBuf::from("/data/aarhus/p1/rs2.dcm"));
        assert!(matches!(duplicate.validate(), Err(RtError::Init(_))));
        assert_eq!(duplicate.validation_state(), ValidationState::Failed);
        assert_eq!(duplicate.structure_path(), None);
        assert_eq!(duplicate.dose_path(), None);
    }

    #[test]
    fn test_missing_cts() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.ct_paths.clear();
        assert!(matches!(treatment.validate(), Err(RtError::Init(_))));
        assert!(matches!(treatment.ct_image_data(), Err(RtError::NoCts(_))));
    }

    #[test]
    fn test_more_plans_than_doses() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.plan_paths.insert(PathBuf::from("/data/aarhus/p1/rp_extra.dcm"));
        assert!(matches!(treatment.validate(), Err(RtError::Init(_))));
    }

    #[test]
    fn test_single_dose_used_directly() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.validate().unwrap();

        assert_eq!(treatment.dose_path(), Some(Path::new("/data/aarhus/p1/rd_main.dcm")));
        assert_eq!(treatment.sum_dose_path(), None);
        assert_eq!(fixture.store.grid_loads(), 0);
        assert!(fixture.store.written_artifacts().is_empty());
    }

    #[test]
    fn test_failed_validation_is_reported_again_as_init_error() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.prescription = Prescription::new(0.0, 1.3, 0.0, 1.0);
        assert!(matches!(treatment.validate(), Err(RtError::SumDose(_))));
        assert!(matches!(treatment.validate(), Err(RtError::Init(_))));
        assert!(treatment.failure_reason().is_some());
    }

    #[test]
    fn test_validation_is_memoised() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.prescription = Prescription::new(50.0, 1.2, 0.0, 1.0);
        treatment.validate().unwrap();
        let first = treatment.dose_path().map(Path::to_path_buf);
        treatment.validate().unwrap();

        assert_eq!(treatment.dose_path().map(Path::to_path_buf), first);
        assert_eq!(fixture.store.written_artifacts().len(), 1);
        assert_eq!(fixture.catalog.sum_dose_write_backs(), 1);
    }

    #[test]
    fn test_lost_sum_dose_recreated_without_write_back() {
        let fixture = Fixture::standard();
        let mut first = fixture.treatment();
        first.prescription = Prescription::new(50.0, 1.2, 0.0, 1.0);
        first.validate().unwrap();
        let artifact = first.sum_dose_path().map(Path::to_path_buf).unwrap();
        assert_eq!(
            artifact,
            PathBuf::from("/data/aarhus_dose_sum/p1/treatment_1_sum_dose.dcm")
        );
        assert_eq!(fixture.catalog.sum_dose_write_backs(), 1);

        // 目录中已登记求和剂量，文件存在时直接复用
        let mut reused = fixture.loaded_treatment(Prescription::new(50.0, 1.2, 0.0, 1.0));
        reused.validate().unwrap();
        assert_eq!(reused.dose_path(), Some(artifact.as_path()));
        assert_eq!(fixture.store.written_artifacts().len(), 1);

        // 文件丢失后重新求和，但不再登记
        fixture.store.remove_artifact(&artifact);
        let mut recreated = fixture.loaded_treatment(Prescription::new(50.0, 1.2, 0.0, 1.0));
        recreated.validate().unwrap();
        assert_eq!(recreated.dose_path(), Some(artifact.as_path()));
        assert_eq!(fixture.store.written_artifacts().len(), 2);
        assert_eq!(fixture.catalog.sum_dose_write_backs(), 1);
    }

    #[test]
    fn test_duplicate_sum_doses_rejected() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.sum_dose_paths.insert(PathBuf::from("/data/a_dose_sum/p1/one.dcm"));
        treatment.sum_dose_paths.insert(PathBuf::from("/data/a_dose_sum/p1/two.dcm"));
        assert!(matches!(treatment.validate(), Err(RtError::Init(_))));
    }

    #[test]
    fn test_derived_values() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.validate().unwrap();

        assert_eq!(treatment.plan_fractions().unwrap(), vec![Some(25)]);
        assert_eq!(treatment.plan_labels().unwrap(), vec!["Main".to_string()]);
        assert_eq!(treatment.study_date().unwrap(), NaiveDate::from_ymd_opt(2012, 3, 1));
        assert!((treatment.max_dose().unwrap() - 40.0).abs() < 1e-9);
        // 高剂量在右侧
        assert_eq!(treatment.laterality().unwrap(), Laterality::Right);
        assert!(treatment.left_right_dose_ratio().unwrap() > 1.2);
        assert_eq!(fixture.store.grid_loads(), 1);

        treatment.plans().unwrap();
        assert_eq!(fixture.store.plan_parses(), 1);
    }

    #[test]
    fn test_release_grids_reloads_on_demand() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.validate().unwrap();
        treatment.load_all_dicom_data().unwrap();
        treatment.release_grids();
        treatment.dose_grid().unwrap();
        assert_eq!(fixture.store.grid_loads(), 2);
    }

    #[test]
    fn test_roi_management_and_structure_reset() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.validate().unwrap();

        treatment.add_roi("heart").unwrap();
        assert!(matches!(treatment.add_roi("heart"), Err(RtError::RoiAlreadyExists(_))));
        treatment.ensure_roi("heart");
        treatment.ensure_roi("lung");
        assert_eq!(treatment.rois().len(), 2);

        fixture.store.add_structure(
            "/data/dl/aarhus/p1/rs_dl.dcm",
            vec![region(5, "HEART_DL", true)],
        );
        treatment.change_structure("/dl/aarhus/p1/rs_dl.dcm").unwrap();
        assert!(treatment.rois().is_empty());
        assert_eq!(treatment.roi_names_in_structure_set().unwrap(), vec!["heart_dl"]);
        assert_eq!(treatment.dose_path(), Some(Path::new("/data/aarhus/p1/rd_main.dcm")));

        treatment.restore_original_structure().unwrap();
        assert_eq!(treatment.structure_path(), Some(Path::new("/data/aarhus/p1/rs.dcm")));
    }

    #[test]
    fn test_reset_requires_revalidation() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.treatment();
        treatment.prescription = Prescription::new(50.0, 1.2, 0.0, 1.0);
        treatment.validate().unwrap();
        let dose = treatment.dose_path().map(Path::to_path_buf);

        treatment.reset_structure_information();
        assert_eq!(treatment.validation_state(), ValidationState::Unvalidated);
        assert!(!treatment.is_valid());
        assert_eq!(treatment.structure_path(), None);
        assert!(matches!(treatment.structure(), Err(RtError::Init(_))));

        treatment.structure_paths.insert(PathBuf::from("/data/aarhus/p1/rs.dcm"));
        treatment.validate().unwrap();
        assert_eq!(treatment.structure_path(), Some(Path::new("/data/aarhus/p1/rs.dcm")));
        assert_eq!(treatment.dose_path().map(Path::to_path_buf), dose);
        // 剂量沿用，不重新求和
        assert_eq!(fixture.store.written_artifacts().len(), 1);
    }

    #[test]
    fn test_reset_without_structure_fails_validation() {
        let fixture = Fixture::standard();
        let mut treatment = fixture.valid_treatment();
        treatment.reset_structure_information();
        assert!(matches!(treatment.validate(), Err(RtError::Init(_))));
        assert_eq!(treatment.validation_state(), ValidationState::Failed);
    }

    #[test]
    fn test_unknown_file_kinds_ignored() {
        let fixture = Fixture::standard();
        fixture
            .catalog
            .add_raw_file(1, "rt_record", "/aarhus/p1/rt_record.dcm");
        let mut treatment = fixture.treatment();

        let all_paths = treatment
            .ct_paths
            .iter()
            .chain(&treatment.structure_paths)
            .chain(&treatment.plan_paths)
            .chain(&treatment.dose_paths)
            .chain(&treatment.sum_dose_paths);
        assert_eq!(all_paths.count(), 4);
        treatment.validate().unwrap();
    }

    #[test]
    fn test_structure_geometry_from_synonyms() {
        let fixture = Fixture::standard();
        fixture.catalog.add_synonym(
            "heart",
            1,
            SynonymRecord {
                synonym: "hjerte".to_string(),
                priority_count: None,
                laterality: None,
            },
        );
        let mut treatment = fixture.treatment();
        treatment.validate().unwrap();

        let geometry = treatment.structure_geometry("heart").unwrap().unwrap();
        assert_eq!(geometry.region_name, "hjerte");
        assert_eq!(geometry.planes, vec![0.0, 1.0]);
        assert_eq!(geometry.coordinates.len(), 2);
        assert_eq!(geometry.slice_thickness, Some(1.0));
        assert!(treatment.structure_geometry("spleen").unwrap().is_none());
    }
}
