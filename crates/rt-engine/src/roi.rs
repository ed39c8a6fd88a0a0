//! 感兴趣区域 (ROI)
//!
//! ROI以标准名称（如 `heart`）标识，通过目录中的同义词映射到结构集里的具体区域。
//! 同义词、优先同义词和DVH在首次访问时计算并缓存

use rt_core::{Laterality, Result, RtError};
use rt_dicom::{Dvh, VolumeMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::OnceCell;
use tracing::{debug, warn};

use crate::treatment::{memo, Treatment};

/// 一条数据记录：键为数据点名称
pub type DataRecord = serde_json::Map<String, Value>;

/// 同义词的侧别
///
/// 排序 同侧 < 左 < 右 < 无侧别，与优先选择的顺序一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SynonymLaterality {
    #[serde(rename = "i")]
    Ipsilateral,
    #[serde(rename = "l")]
    Left,
    #[serde(rename = "r")]
    Right,
    #[serde(rename = "x")]
    Unspecified,
}

impl SynonymLaterality {
    /// 解析目录中的侧别代码，未知代码视为无侧别
    pub fn from_code(code: Option<&str>) -> Self {
        match code.map(|c| c.trim().to_lowercase()).as_deref() {
            Some("i") => SynonymLaterality::Ipsilateral,
            Some("l") => SynonymLaterality::Left,
            Some("r") => SynonymLaterality::Right,
            _ => SynonymLaterality::Unspecified,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SynonymLaterality::Ipsilateral => "i",
            SynonymLaterality::Left => "l",
            SynonymLaterality::Right => "r",
            SynonymLaterality::Unspecified => "x",
        }
    }
}

/// 结构集中匹配到的同义词
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynonymMatch {
    /// 结构集中的区域名，保留原始大小写
    pub name: String,
    pub region_id: i32,
    pub priority_count: i64,
    pub laterality: SynonymLaterality,
}

/// DVH数据点：点名称和体积输出模式
#[derive(Debug, Clone, PartialEq)]
pub struct DvhPointSpec {
    pub point: String,
    pub mode: Option<VolumeMode>,
}

impl DvhPointSpec {
    pub fn new(point: &str, mode: Option<VolumeMode>) -> Self {
        Self {
            point: point.to_lowercase(),
            mode,
        }
    }

    /// 记录中保存数值的键
    pub fn value_key(&self, standard_name: &str) -> String {
        match self.point.as_str() {
            "mean" | "volume" => format!("{}_{}", standard_name, self.point),
            point => format!("{}_{}_value", standard_name, point),
        }
    }
}

/// 疗程中的一个ROI
#[derive(Debug)]
pub struct Roi {
    standard_name: String,
    synonyms: OnceCell<Vec<SynonymMatch>>,
    priority: OnceCell<Option<usize>>,
    dvh: OnceCell<Option<Dvh>>,
}

impl Roi {
    pub fn new(standard_name: &str) -> Self {
        Self {
            standard_name: standard_name.to_string(),
            synonyms: OnceCell::new(),
            priority: OnceCell::new(),
            dvh: OnceCell::new(),
        }
    }

    pub fn standard_name(&self) -> &str {
        &self.standard_name
    }

    /// 结构集中名称属于同义词的非空区域
    ///
    /// 按侧别、再按优先计数降序排列，相同时保持结构集中的顺序
    pub fn find_synonyms(&self, treatment: &Treatment<'_>) -> Result<&[SynonymMatch]> {
        memo(&self.synonyms, || {
            let records = treatment.context().catalog.list_synonyms(
                &self.standard_name,
                treatment.collection_id,
                true,
            )?;
            let structure = treatment.structure()?;

            let mut found = Vec::new();
            for region in &structure.regions {
                if region.is_empty() {
                    continue;
                }
                let name = region.name.to_lowercase();
                if let Some(record) = records.iter().find(|r| r.synonym.to_lowercase() == name) {
                    found.push(SynonymMatch {
                        name: region.name.clone(),
                        region_id: region.id,
                        priority_count: record.priority_count.unwrap_or(0),
                        laterality: SynonymLaterality::from_code(record.laterality.as_deref()),
                    });
                }
            }
            found.sort_by(|a, b| {
                a.laterality
                    .cmp(&b.laterality)
                    .then(b.priority_count.cmp(&a.priority_count))
            });
            debug!(
                "疗程 {} ROI {} 找到 {} 个同义词",
                treatment.treatment_id,
                self.standard_name,
                found.len()
            );
            Ok(found)
        })
        .map(Vec::as_slice)
    }

    /// 优先同义词
    ///
    /// 同侧同义词优先；左/右同义词与疗程侧别一致时选中；否则取排序后的第一个
    pub fn priority_synonym(&self, treatment: &Treatment<'_>) -> Result<Option<&SynonymMatch>> {
        let index = *memo(&self.priority, || {
            let candidates = self.find_synonyms(treatment)?;
            let mut treatment_laterality = None;
            for (index, candidate) in candidates.iter().enumerate() {
                let wanted = match candidate.laterality {
                    SynonymLaterality::Ipsilateral => return Ok(Some(index)),
                    SynonymLaterality::Left => Laterality::Left,
                    SynonymLaterality::Right => Laterality::Right,
                    SynonymLaterality::Unspecified => continue,
                };
                if treatment_laterality.is_none() {
                    treatment_laterality = Some(self.treatment_laterality(treatment)?);
                }
                if treatment_laterality == Some(Some(wanted)) {
                    return Ok(Some(index));
                }
            }
            Ok((!candidates.is_empty()).then_some(0))
        })?;

        let candidates = self.find_synonyms(treatment)?;
        Ok(index.and_then(|i| candidates.get(i)))
    }

    fn treatment_laterality(&self, treatment: &Treatment<'_>) -> Result<Option<Laterality>> {
        match treatment.laterality() {
            Ok(laterality) => Ok(Some(laterality)),
            Err(RtError::NoCts(message)) => {
                warn!(
                    "ROI {} 无法确定疗程侧别，使用第一个同义词: {}",
                    self.standard_name, message
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 优先同义词区域的DVH，没有同义词时为 None
    ///
    /// 结构集已替换时先按标准名称查找区域
    pub fn dvh(&self, treatment: &Treatment<'_>) -> Result<Option<&Dvh>> {
        memo(&self.dvh, || {
            if treatment.has_replaced_structure() {
                if let Some(dvh) = self.dvh_for_region_name(treatment)? {
                    return Ok(Some(dvh));
                }
            }
            let Some(synonym) = self.priority_synonym(treatment)? else {
                return Ok(None);
            };
            self.compute(treatment, synonym.region_id).map(Some)
        })
        .map(Option::as_ref)
    }

    /// 不经同义词，直接用标准名称查找区域计算DVH（不缓存）
    pub fn dvh_for_region_name(&self, treatment: &Treatment<'_>) -> Result<Option<Dvh>> {
        let Some(region) = treatment.structure()?.region_by_name(&self.standard_name) else {
            return Ok(None);
        };
        self.compute(treatment, region.id).map(Some)
    }

    fn compute(&self, treatment: &Treatment<'_>, region_id: i32) -> Result<Dvh> {
        let not_resolved = || {
            RtError::Init(format!(
                "疗程 {} 尚未通过校验，无法计算DVH",
                treatment.treatment_id
            ))
        };
        let structure_path = treatment.structure_path().ok_or_else(not_resolved)?;
        let dose_path = treatment.dose_path().ok_or_else(not_resolved)?;
        let dvh = treatment
            .context()
            .store
            .compute_dvh(structure_path, dose_path, region_id)?;
        Ok(dvh.with_rx_dose(treatment.prescription().main_reference_dose))
    }

    /// 把DVH点写入记录
    ///
    /// `mean` / `volume` 写入 `<roi>_<点>`；其他点写入 `<roi>_<点>_value` 和带单位的 `<roi>_<点>`。
    /// 没有DVH或计算失败时写入 null
    pub fn dvh_points_from_roi(
        &self,
        treatment: &Treatment<'_>,
        record: &mut DataRecord,
        points: &[DvhPointSpec],
    ) {
        let dvh = match self.dvh(treatment) {
            Ok(dvh) => dvh,
            Err(e) => {
                warn!("ROI {} 的DVH计算失败: {}", self.standard_name, e);
                None
            }
        };

        for spec in points {
            let key = format!("{}_{}", self.standard_name, spec.point);
            match spec.point.as_str() {
                "mean" => {
                    record.insert(key, Value::from(dvh.map(Dvh::mean)));
                }
                "volume" => {
                    record.insert(key, Value::from(dvh.map(Dvh::volume)));
                }
                point => {
                    let mode = spec.mode.unwrap_or(VolumeMode::Absolute);
                    let value = dvh.map(|dvh| dvh.statistic(point, mode)).transpose();
                    match value {
                        Ok(Some(value)) => {
                            record.insert(
                                spec.value_key(&self.standard_name),
                                Value::from(value.value),
                            );
                            record.insert(
                                key,
                                serde_json::to_value(&value).unwrap_or(Value::Null),
                            );
                        }
                        Ok(None) => {
                            record.insert(spec.value_key(&self.standard_name), Value::Null);
                            record.insert(key, Value::Null);
                        }
                        Err(e) => {
                            debug!("DVH点 {} 计算失败: {}", key, e);
                            record.insert(spec.value_key(&self.standard_name), Value::Null);
                            record.insert(key, Value::Null);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{region, Fixture};
    use rt_core::SynonymRecord;
    use std::path::PathBuf;

    fn synonym(fixture: &Fixture, standard_name: &str, name: &str, count: i64, laterality: &str) {
        fixture.catalog.add_synonym(
            standard_name,
            1,
            SynonymRecord {
                synonym: name.to_string(),
                priority_count: Some(count),
                laterality: Some(laterality.to_string()),
            },
        );
    }

    #[test]
    fn test_laterality_codes() {
        assert_eq!(SynonymLaterality::from_code(Some("I")), SynonymLaterality::Ipsilateral);
        assert_eq!(SynonymLaterality::from_code(Some("q")), SynonymLaterality::Unspecified);
        assert_eq!(SynonymLaterality::from_code(None), SynonymLaterality::Unspecified);
        assert!(SynonymLaterality::Ipsilateral < SynonymLaterality::Left);
        assert!(SynonymLaterality::Right < SynonymLaterality::Unspecified);
    }

    #[test]
    fn test_synonyms_sorted_and_empty_regions_skipped() {
        let fixture = Fixture::standard();
        synonym(&fixture, "heart", "heart", 50, "x");
        synonym(&fixture, "heart", "HJERTE", 3, "x");
        synonym(&fixture, "heart", "lung_l", 10, "l");
        let treatment = fixture.valid_treatment();

        let roi = Roi::new("heart");
        let names: Vec<&str> = roi
            .find_synonyms(&treatment)
            .unwrap()
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        // 空区域 Heart 不参与
        assert_eq!(names, vec!["Lung_L", "Hjerte"]);

        roi.find_synonyms(&treatment).unwrap();
        assert_eq!(fixture.store.structure_parses(), 1);
    }

    #[test]
    fn test_ipsilateral_synonym_wins() {
        let fixture = Fixture::standard();
        synonym(&fixture, "lung", "hjerte", 1, "x");
        synonym(&fixture, "lung", "lung_l", 1, "i");
        let treatment = fixture.valid_treatment();

        let roi = Roi::new("lung");
        let chosen = roi.priority_synonym(&treatment).unwrap().unwrap();
        assert_eq!(chosen.name, "Lung_L");
        // 同侧同义词不需要计算疗程侧别
        assert_eq!(fixture.store.grid_loads(), 0);
    }

    #[test]
    fn test_side_specific_synonym_follows_treatment_laterality() {
        let fixture = Fixture::standard();
        fixture.store.add_structure(
            "/data/aarhus/p1/rs.dcm",
            vec![region(1, "Lung_L", true), region(2, "Lung_R", true)],
        );
        synonym(&fixture, "lung", "lung_l", 10, "l");
        synonym(&fixture, "lung", "lung_r", 1, "r");
        let treatment = fixture.valid_treatment();

        // 剂量偏右
        let roi = Roi::new("lung");
        assert_eq!(roi.priority_synonym(&treatment).unwrap().unwrap().name, "Lung_R");
    }

    #[test]
    fn test_priority_synonym_computed_once() {
        let fixture = Fixture::standard();
        fixture.store.add_structure(
            "/data/aarhus/p1/rs.dcm",
            vec![region(1, "Lung_L", true), region(2, "Lung_R", true)],
        );
        synonym(&fixture, "lung", "lung_l", 10, "l");
        synonym(&fixture, "lung", "lung_r", 1, "r");
        let treatment = fixture.valid_treatment();

        let roi = Roi::new("lung");
        for _ in 0..3 {
            assert_eq!(roi.priority_synonym(&treatment).unwrap().unwrap().name, "Lung_R");
            assert_eq!(roi.find_synonyms(&treatment).unwrap().len(), 2);
        }
        assert_eq!(fixture.catalog.synonym_lookups(), 1);
        // 侧别只计算一次
        assert_eq!(fixture.store.grid_loads(), 1);
        assert_eq!(fixture.store.structure_parses(), 1);
    }

    #[test]
    fn test_falls_back_to_first_synonym() {
        let fixture = Fixture::standard();
        synonym(&fixture, "lung", "lung_l", 10, "l");
        synonym(&fixture, "lung", "hjerte", 1, "x");
        let treatment = fixture.valid_treatment();

        let roi = Roi::new("lung");
        assert_eq!(roi.priority_synonym(&treatment).unwrap().unwrap().name, "Lung_L");
        assert!(Roi::new("spleen").priority_synonym(&treatment).unwrap().is_none());
    }

    #[test]
    fn test_missing_ct_falls_back_to_first_synonym() {
        let fixture = Fixture::standard();
        synonym(&fixture, "lung", "lung_l", 10, "r");
        let mut treatment = fixture.valid_treatment();
        treatment.ct_paths = [PathBuf::from("/data/aarhus/p1/unknown_ct.dcm")].into();

        // CT无法读取时侧别计算失败，错误向上传递
        let roi = Roi::new("lung");
        assert!(roi.priority_synonym(&treatment).is_err());

        treatment.ct_paths.clear();
        let roi = Roi::new("lung");
        assert_eq!(roi.priority_synonym(&treatment).unwrap().unwrap().name, "Lung_L");
    }

    #[test]
    fn test_dvh_points_written_to_record() {
        let fixture = Fixture::standard();
        synonym(&fixture, "heart", "hjerte", 1, "x");
        fixture.store.set_dvh(1, Dvh::new("Hjerte", 1.0, vec![0.0, 2.0, 2.0]));
        let treatment = fixture.valid_treatment();

        let roi = Roi::new("heart");
        let mut record = DataRecord::new();
        roi.dvh_points_from_roi(
            &treatment,
            &mut record,
            &[
                DvhPointSpec::new("mean", None),
                DvhPointSpec::new("volume", None),
                DvhPointSpec::new("v2gy", Some(VolumeMode::Relative)),
                DvhPointSpec::new("bogus", None),
            ],
        );

        assert_eq!(record["heart_volume"], Value::from(4.0));
        assert!(record["heart_mean"].as_f64().is_some());
        assert_eq!(record["heart_v2gy_value"], Value::from(50.0));
        assert_eq!(record["heart_v2gy"]["units"], Value::from("%"));
        assert_eq!(record["heart_bogus"], Value::Null);
        assert_eq!(record["heart_bogus_value"], Value::Null);

        // DVH只计算一次
        roi.dvh(&treatment).unwrap();
        assert_eq!(fixture.store.dvh_computations(), 1);
    }

    #[test]
    fn test_roi_without_synonyms_writes_nulls() {
        let fixture = Fixture::standard();
        let treatment = fixture.valid_treatment();
        let mut record = DataRecord::new();
        Roi::new("spleen").dvh_points_from_roi(
            &treatment,
            &mut record,
            &[DvhPointSpec::new("mean", None), DvhPointSpec::new("d2cc", None)],
        );
        assert_eq!(record["spleen_mean"], Value::Null);
        assert_eq!(record["spleen_d2cc"], Value::Null);
        assert_eq!(fixture.store.dvh_computations(), 0);
    }

    #[test]
    fn test_dvh_for_region_name_is_case_sensitive() {
        let fixture = Fixture::standard();
        let treatment = fixture.valid_treatment();
        let dvh = Roi::new("Hjerte").dvh_for_region_name(&treatment).unwrap().unwrap();
        assert!(dvh.volume() > 0.0);
        assert!(Roi::new("hjerte").dvh_for_region_name(&treatment).unwrap().is_none());
    }
}
