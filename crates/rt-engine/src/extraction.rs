//! 按患者提取数据点
//!
//! 数据点分三类：疗程级参数（如 `study_date`）、ROI参数（`<roi>_synonyms_found`）
//! 和DVH点（`<roi>_<点>_<abs|rel>`，`<roi>_mean`，`<roi>_volume`）

use rt_core::{Result, RtError, TreatmentFilter};
use rt_dicom::VolumeMode;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::collection::init_treatments_from_collection;
use crate::context::TreatmentContext;
use crate::roi::{DataRecord, DvhPointSpec, Roi};
use crate::treatment::Treatment;

/// 疗程级参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenericParameter {
    StudyDate,
    Fractions,
    PlanNames,
    MainReferenceDose,
    BoostReferenceDose,
    MainDoseScaleFactor,
    BoostDoseScaleFactor,
    Centre,
    DoseFilePath,
    StructureFilePath,
    TreatmentMaxDose,
    Laterality,
    LeftRightDoseRatio,
    CtSliceThickness,
    CtManufacturer,
    CtKvp,
    CtSoftwareVersion,
    CtPixelSpacing,
}

impl GenericParameter {
    pub const ALL: [GenericParameter; 18] = [
        GenericParameter::StudyDate,
        GenericParameter::Fractions,
        GenericParameter::PlanNames,
        GenericParameter::MainReferenceDose,
        GenericParameter::BoostReferenceDose,
        GenericParameter::MainDoseScaleFactor,
        GenericParameter::BoostDoseScaleFactor,
        GenericParameter::Centre,
        GenericParameter::DoseFilePath,
        GenericParameter::StructureFilePath,
        GenericParameter::TreatmentMaxDose,
        GenericParameter::Laterality,
        GenericParameter::LeftRightDoseRatio,
        GenericParameter::CtSliceThickness,
        GenericParameter::CtManufacturer,
        GenericParameter::CtKvp,
        GenericParameter::CtSoftwareVersion,
        GenericParameter::CtPixelSpacing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenericParameter::StudyDate => "study_date",
            GenericParameter::Fractions => "fractions",
            GenericParameter::PlanNames => "plan_names",
            GenericParameter::MainReferenceDose => "main_reference_dose",
            GenericParameter::BoostReferenceDose => "boost_reference_dose",
            GenericParameter::MainDoseScaleFactor => "main_dose_scale_factor",
            GenericParameter::BoostDoseScaleFactor => "boost_dose_scale_factor",
            GenericParameter::Centre => "centre",
            GenericParameter::DoseFilePath => "dose_file_path",
            GenericParameter::StructureFilePath => "structure_file_path",
            GenericParameter::TreatmentMaxDose => "treatment_max_dose",
            GenericParameter::Laterality => "laterality",
            GenericParameter::LeftRightDoseRatio => "left_right_dose_ratio",
            GenericParameter::CtSliceThickness => "ct_slice_thickness",
            GenericParameter::CtManufacturer => "ct_manufacturer",
            GenericParameter::CtKvp => "ct_kvp",
            GenericParameter::CtSoftwareVersion => "ct_software_version",
            GenericParameter::CtPixelSpacing => "ct_pixel_spacing",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }

    fn value(&self, treatment: &Treatment<'_>) -> Result<Value> {
        let prescription = treatment.prescription();
        let path_value = |path: Option<&Path>| Value::from(path.map(|p| p.display().to_string()));
        let value = match self {
            GenericParameter::StudyDate => {
                Value::from(treatment.study_date()?.map(|d| d.format("%Y-%m-%d").to_string()))
            }
            GenericParameter::Fractions => Value::from(treatment.plan_fractions()?),
            GenericParameter::PlanNames => Value::from(treatment.plan_labels()?),
            GenericParameter::MainReferenceDose => Value::from(prescription.main_reference_dose),
            GenericParameter::BoostReferenceDose => Value::from(prescription.boost_reference_dose),
            GenericParameter::MainDoseScaleFactor => {
                Value::from(prescription.main_dose_scale_factor)
            }
            GenericParameter::BoostDoseScaleFactor => {
                Value::from(prescription.boost_dose_scale_factor)
            }
            GenericParameter::Centre => Value::from(treatment.treatment_place.clone()),
            GenericParameter::DoseFilePath => path_value(treatment.dose_path()),
            GenericParameter::StructureFilePath => path_value(treatment.structure_path()),
            GenericParameter::TreatmentMaxDose => Value::from(treatment.max_dose()?),
            GenericParameter::Laterality => Value::from(treatment.laterality()?.to_string()),
            GenericParameter::LeftRightDoseRatio => Value::from(treatment.left_right_dose_ratio()?),
            GenericParameter::CtSliceThickness => {
                Value::from(treatment.ct_image_data()?.slice_thickness)
            }
            GenericParameter::CtManufacturer => {
                Value::from(treatment.ct_image_data()?.manufacturer.clone())
            }
            GenericParameter::CtKvp => Value::from(treatment.ct_image_data()?.kvp),
            GenericParameter::CtSoftwareVersion => {
                Value::from(treatment.ct_image_data()?.software_versions.clone())
            }
            GenericParameter::CtPixelSpacing => {
                Value::from(treatment.ct_image_data()?.pixel_spacing.to_vec())
            }
        };
        Ok(value)
    }
}

/// ROI级参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoiParameter {
    SynonymsFound,
    PrioritySynonym,
}

impl RoiParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoiParameter::SynonymsFound => "synonyms_found",
            RoiParameter::PrioritySynonym => "priority_synonym",
        }
    }
}

/// 一个待提取的数据点
#[derive(Debug, Clone, PartialEq)]
pub enum DataPoint {
    Generic(GenericParameter),
    Roi {
        standard_name: String,
        parameter: RoiParameter,
    },
    /// `mode` 为 None 时名称不带 `_abs` / `_rel` 后缀（用于 `mean` / `volume`）
    Dvh {
        standard_name: String,
        point: String,
        mode: Option<VolumeMode>,
    },
}

impl DataPoint {
    pub fn dvh(standard_name: &str, point: &str, mode: Option<VolumeMode>) -> Self {
        DataPoint::Dvh {
            standard_name: standard_name.to_string(),
            point: point.to_lowercase(),
            mode,
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }

    /// 由名称解析数据点
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(parameter) = GenericParameter::parse(name) {
            return Ok(DataPoint::Generic(parameter));
        }

        for parameter in [RoiParameter::SynonymsFound, RoiParameter::PrioritySynonym] {
            if let Some(standard_name) = name
                .strip_suffix(parameter.as_str())
                .and_then(|rest| rest.strip_suffix('_'))
                .filter(|rest| !rest.is_empty())
            {
                return Ok(DataPoint::Roi {
                    standard_name: standard_name.to_string(),
                    parameter,
                });
            }
        }

        let parts: Vec<&str> = name.split('_').collect();
        match parts.as_slice() {
            [roi @ .., point, flag] if !roi.is_empty() && VolumeMode::parse(flag).is_some() => {
                Ok(DataPoint::dvh(&roi.join("_"), point, VolumeMode::parse(flag)))
            }
            [roi @ .., point] if !roi.is_empty() && matches!(*point, "mean" | "volume") => {
                Ok(DataPoint::dvh(&roi.join("_"), point, None))
            }
            _ => Err(RtError::NotFound(format!("无法识别的数据点: {}", name))),
        }
    }

    fn value(&self, treatment: &mut Treatment<'_>) -> Result<Value> {
        match self {
            DataPoint::Generic(parameter) => parameter.value(treatment),
            DataPoint::Roi {
                standard_name,
                parameter,
            } => {
                treatment.ensure_roi(standard_name);
                let treatment: &Treatment<'_> = treatment;
                let roi = roi_of(treatment, standard_name)?;
                match parameter {
                    RoiParameter::SynonymsFound => {
                        Ok(serde_json::to_value(roi.find_synonyms(treatment)?)?)
                    }
                    RoiParameter::PrioritySynonym => Ok(Value::from(
                        roi.priority_synonym(treatment)?.map(|m| m.name.clone()),
                    )),
                }
            }
            DataPoint::Dvh {
                standard_name,
                point,
                mode,
            } => {
                treatment.ensure_roi(standard_name);
                let treatment: &Treatment<'_> = treatment;
                let roi = roi_of(treatment, standard_name)?;
                let spec = DvhPointSpec::new(point, *mode);
                let mut record = DataRecord::new();
                roi.dvh_points_from_roi(treatment, &mut record, std::slice::from_ref(&spec));
                Ok(record
                    .remove(&spec.value_key(standard_name))
                    .unwrap_or(Value::Null))
            }
        }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataPoint::Generic(parameter) => write!(f, "{}", parameter.as_str()),
            DataPoint::Roi {
                standard_name,
                parameter,
            } => write!(f, "{}_{}", standard_name, parameter.as_str()),
            DataPoint::Dvh {
                standard_name,
                point,
                mode: None,
            } => write!(f, "{}_{}", standard_name, point),
            DataPoint::Dvh {
                standard_name,
                point,
                mode: Some(mode),
            } => {
                let flag = match mode {
                    VolumeMode::Absolute => "abs",
                    VolumeMode::Relative => "rel",
                };
                write!(f, "{}_{}_{}", standard_name, point, flag)
            }
        }
    }
}

fn roi_of<'t>(treatment: &'t Treatment<'_>, standard_name: &str) -> Result<&'t Roi> {
    treatment
        .roi(standard_name)
        .ok_or_else(|| RtError::NotFound(format!("ROI不存在: {}", standard_name)))
}

/// 一个患者的提取结果
#[derive(Debug, Clone, Serialize)]
pub struct PatientData {
    pub patient_id: String,
    pub treatment_id: i64,
    pub values: DataRecord,
}

/// 为患者提取数据点
///
/// 取该患者第一个通过校验的疗程；给出 `structure_collection_id` 时改用该集合中的结构集。
/// 单个数据点失败时写入 null
pub fn extract_data_from_patient(
    ctx: TreatmentContext<'_>,
    collection_id: i64,
    patient_id: &str,
    points: &[DataPoint],
    structure_collection_id: Option<i64>,
    failure_log: Option<&Path>,
) -> Result<PatientData> {
    let outcome = init_treatments_from_collection(
        ctx,
        collection_id,
        &TreatmentFilter::for_patient(patient_id),
        failure_log,
    )?;
    let Some(mut treatment) = outcome.treatments.into_iter().next() else {
        return Err(RtError::DataExtractionFailed(format!(
            "患者 {} 没有通过校验的疗程",
            patient_id
        )));
    };

    if let Some(structure_collection_id) = structure_collection_id {
        let augmented = treatment.augmented_structures(Some(structure_collection_id))?;
        let Some(first) = augmented.first() else {
            return Err(RtError::AugmentedStructureMissing(format!(
                "患者 {} 在结构集合 {} 中没有结构集",
                patient_id, structure_collection_id
            )));
        };
        treatment.change_structure(&first.path)?;
    }

    let mut values = DataRecord::new();
    for point in points {
        let name = point.name();
        let value = match point.value(&mut treatment) {
            Ok(value) => value,
            Err(e) => {
                warn!("患者 {} 数据点 {} 提取失败: {}", patient_id, name, e);
                Value::Null
            }
        };
        debug!("患者 {} {} = {}", patient_id, name, value);
        values.insert(name, value);
    }

    info!(
        "患者 {} 疗程 {}: 提取 {} 个数据点",
        patient_id,
        treatment.treatment_id,
        values.len()
    );
    Ok(PatientData {
        patient_id: patient_id.to_string(),
        treatment_id: treatment.treatment_id,
        values,
    })
}
