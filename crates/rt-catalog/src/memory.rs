//! 内存目录
//!
//! 用于脚本和测试，不做持久化

use rt_core::{
    AugmentedStructure, FileKind, FileRecord, Result, SynonymRecord, TreatmentFilter,
    TreatmentRecord,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use tracing::debug;

use crate::catalog::FileCatalog;

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    treatments: RefCell<Vec<TreatmentRecord>>,
    files: RefCell<Vec<FileRecord>>,
    /// (标准名称, 疗程集合ID) → 同义词
    synonyms: RefCell<HashMap<(String, i64), Vec<SynonymRecord>>>,
    /// 患者ID → 增强结构集
    augmented: RefCell<HashMap<String, Vec<AugmentedStructure>>>,
    next_file_id: Cell<i64>,
    sum_dose_write_backs: Cell<usize>,
    synonym_lookups: Cell<usize>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_treatment(&self, record: TreatmentRecord) {
        self.treatments.borrow_mut().push(record);
    }

    pub fn add_file(&self, treatment_id: i64, kind: FileKind, path: &str, uid: Option<&str>) -> i64 {
        let file_id = self.next_file_id.get() + 1;
        self.next_file_id.set(file_id);
        self.files.borrow_mut().push(FileRecord {
            file_id,
            treatment_id: Some(treatment_id),
            kind: kind.as_str().to_string(),
            path: path.to_string(),
            uid: uid.map(str::to_string),
        });
        file_id
    }

    /// 登记任意类型字符串的文件，用于未知类型
    pub fn add_raw_file(&self, treatment_id: i64, kind: &str, path: &str) {
        let file_id = self.next_file_id.get() + 1;
        self.next_file_id.set(file_id);
        self.files.borrow_mut().push(FileRecord {
            file_id,
            treatment_id: Some(treatment_id),
            kind: kind.to_string(),
            path: path.to_string(),
            uid: None,
        });
    }

    pub fn add_synonym(&self, standard_name: &str, collection_id: i64, record: SynonymRecord) {
        let mut synonyms = self.synonyms.borrow_mut();
        let entry = synonyms
            .entry((standard_name.to_string(), collection_id))
            .or_default();
        if !entry.contains(&record) {
            entry.push(record);
        }
    }

    pub fn add_augmented_structure(&self, patient_id: &str, structure: AugmentedStructure) {
        self.augmented
            .borrow_mut()
            .entry(patient_id.to_string())
            .or_default()
            .push(structure);
    }

    /// 求和剂量文件的登记次数
    pub fn sum_dose_write_backs(&self) -> usize {
        self.sum_dose_write_backs.get()
    }

    /// 同义词查询次数
    pub fn synonym_lookups(&self) -> usize {
        self.synonym_lookups.get()
    }
}

impl FileCatalog for MemoryCatalog {
    fn list_treatments(
        &self,
        collection_id: i64,
        filter: &TreatmentFilter,
    ) -> Result<Vec<TreatmentRecord>> {
        let mut treatments: Vec<TreatmentRecord> = self
            .treatments
            .borrow()
            .iter()
            .filter(|record| record.collection_id == collection_id && filter.accepts(record))
            .cloned()
            .collect();
        treatments.sort_by_key(|record| record.treatment_id);
        treatments.truncate(filter.limit.unwrap_or(usize::MAX));
        Ok(treatments)
    }

    fn list_files(&self, treatment_id: i64) -> Result<Vec<FileRecord>> {
        Ok(self
            .files
            .borrow()
            .iter()
            .filter(|file| file.treatment_id == Some(treatment_id))
            .cloned()
            .collect())
    }

    fn list_synonyms(
        &self,
        standard_name: &str,
        collection_id: i64,
        with_priority: bool,
    ) -> Result<Vec<SynonymRecord>> {
        self.synonym_lookups.set(self.synonym_lookups.get() + 1);
        let synonyms = self.synonyms.borrow();
        let Some(records) = synonyms.get(&(standard_name.to_string(), collection_id)) else {
            return Ok(Vec::new());
        };
        if with_priority {
            return Ok(records.clone());
        }

        let mut plain: Vec<SynonymRecord> = Vec::new();
        for record in records {
            let stripped = SynonymRecord {
                synonym: record.synonym.clone(),
                priority_count: None,
                laterality: None,
            };
            if !plain.contains(&stripped) {
                plain.push(stripped);
            }
        }
        Ok(plain)
    }

    fn list_augmented_structures(
        &self,
        patient_id: &str,
        structure_collection_id: Option<i64>,
    ) -> Result<Vec<AugmentedStructure>> {
        Ok(self
            .augmented
            .borrow()
            .get(patient_id)
            .map(|structures| {
                structures
                    .iter()
                    .filter(|s| {
                        structure_collection_id.map_or(true, |id| s.structure_collection_id == id)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn record_sum_dose_artifact(&self, treatment_id: i64, path: &str, uid: &str) -> Result<()> {
        self.add_file(treatment_id, FileKind::SumDose, path, Some(uid));
        self.sum_dose_write_backs.set(self.sum_dose_write_backs.get() + 1);
        debug!("疗程 {} 登记求和剂量文件: {}", treatment_id, path);
        Ok(())
    }
}
