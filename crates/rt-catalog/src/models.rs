//! 数据库模型

use rt_core::{AugmentedStructure, FileRecord, Prescription, SynonymRecord, TreatmentRecord};
use sqlx::FromRow;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 疗程表
#[derive(Debug, FromRow)]
pub struct DbTreatment {
    pub treatment_id: i64,
    pub patient_id: String,
    pub collection_id: i64,
    pub treatment_place: Option<String>,
    pub main_reference_dose: Option<f64>,
    pub main_dose_scale_factor: Option<f64>,
    pub boost_reference_dose: Option<f64>,
    pub boost_dose_scale_factor: Option<f64>,
}

impl From<DbTreatment> for TreatmentRecord {
    fn from(db: DbTreatment) -> Self {
        TreatmentRecord {
            treatment_id: db.treatment_id,
            patient_id: db.patient_id,
            collection_id: db.collection_id,
            treatment_place: db.treatment_place,
            prescription: Prescription::new(
                db.main_reference_dose.unwrap_or(0.0),
                db.main_dose_scale_factor.unwrap_or(1.0),
                db.boost_reference_dose.unwrap_or(0.0),
                db.boost_dose_scale_factor.unwrap_or(1.0),
            ),
        }
    }
}

/// DICOM文件表
#[derive(Debug, FromRow)]
pub struct DbDicomFile {
    pub dicom_file_id: i64,
    pub treatment_id: Option<i64>,
    pub file_path: String,
    pub file_type: String,
    pub file_uid: Option<String>,
}

impl From<DbDicomFile> for FileRecord {
    fn from(db: DbDicomFile) -> Self {
        FileRecord {
            file_id: db.dicom_file_id,
            treatment_id: db.treatment_id,
            kind: db.file_type,
            path: db.file_path,
            uid: db.file_uid,
        }
    }
}

/// 同义词表
#[derive(Debug, FromRow)]
pub struct DbSynonym {
    pub synonym: String,
    pub priority_count: Option<i64>,
    pub laterality: Option<String>,
}

impl From<DbSynonym> for SynonymRecord {
    fn from(db: DbSynonym) -> Self {
        SynonymRecord {
            synonym: db.synonym,
            priority_count: db.priority_count,
            // 空字符串等同于无侧别
            laterality: db.laterality.filter(|l| !l.is_empty()),
        }
    }
}

/// 结构表关联的文件
#[derive(Debug, FromRow)]
pub struct DbAugmentedStructure {
    pub file_path: String,
    pub structure_collection_id: i64,
}

impl From<DbAugmentedStructure> for AugmentedStructure {
    fn from(db: DbAugmentedStructure) -> Self {
        AugmentedStructure {
            path: db.file_path,
            structure_collection_id: db.structure_collection_id,
        }
    }
}
