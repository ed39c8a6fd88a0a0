//! 目录接口

use rt_core::{AugmentedStructure, FileRecord, Result, SynonymRecord, TreatmentFilter, TreatmentRecord};

/// 疗程文件目录
///
/// 所有路径都以 `/` 开头，相对于配置中的DICOM根目录
pub trait FileCatalog {
    /// 集合中符合过滤条件的疗程，按疗程ID升序
    fn list_treatments(
        &self,
        collection_id: i64,
        filter: &TreatmentFilter,
    ) -> Result<Vec<TreatmentRecord>>;

    /// 疗程登记的全部文件
    fn list_files(&self, treatment_id: i64) -> Result<Vec<FileRecord>>;

    /// 与疗程集合关联的所有同义词集合中，某标准名称的同义词（去重）
    ///
    /// `with_priority` 为假时只返回同义词本身，优先级和侧别为空
    fn list_synonyms(
        &self,
        standard_name: &str,
        collection_id: i64,
        with_priority: bool,
    ) -> Result<Vec<SynonymRecord>>;

    /// 患者的增强结构集，`structure_collection_id` 为空时返回全部
    fn list_augmented_structures(
        &self,
        patient_id: &str,
        structure_collection_id: Option<i64>,
    ) -> Result<Vec<AugmentedStructure>>;

    /// 登记新生成的求和剂量文件
    fn record_sum_dose_artifact(&self, treatment_id: i64, path: &str, uid: &str) -> Result<()>;
}
