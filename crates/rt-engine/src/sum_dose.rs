//! 剂量求和
//!
//! 按主量/加量协议为每个剂量文件确定缩放因子，再把合格的剂量网格缩放后累加

use chrono::{DateTime, Local};
use rt_core::{Prescription, Result, RtError};
use rt_dicom::{DicomObjectStore, DoseGrid, RtPlan};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::context::TreatmentContext;

/// 标准主量方案：参考剂量 (Gy) → 分次数
const MAIN_FRACTIONS: &[(f64, u32)] = &[(50.0, 25), (48.0, 24), (40.0, 15)];
/// 标准加量方案：参考剂量 (Gy) → 分次数
const BOOST_FRACTIONS: &[(f64, u32)] = &[(16.0, 8), (10.0, 5)];

/// 一个剂量文件及其缩放因子
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DosePair {
    pub path: PathBuf,
    pub scale: f64,
}

/// 剂量配对结果，只在一次求和中使用
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DosePairing {
    pub pairs: Vec<DosePair>,
}

impl DosePairing {
    fn uniform(dose_paths: &[PathBuf], scale: f64) -> Self {
        Self {
            pairs: dose_paths
                .iter()
                .map(|path| DosePair {
                    path: path.clone(),
                    scale,
                })
                .collect(),
        }
    }

    pub fn scale_for(&self, path: &Path) -> Option<f64> {
        self.pairs.iter().find(|p| p.path == path).map(|p| p.scale)
    }
}

impl fmt::Display for DosePairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .pairs
            .iter()
            .map(|p| format!("[{}, {}]", p.path.display(), p.scale))
            .collect();
        write!(f, "[{}]", items.join(", "))
    }
}

/// 求和审计日志
#[derive(Debug, Clone, Serialize)]
pub struct SumDoseLog {
    pub created: DateTime<Local>,
    pub entries: Vec<String>,
}

impl SumDoseLog {
    pub fn new(pairing: &DosePairing) -> Self {
        Self {
            created: Local::now(),
            entries: vec!["Summed doses:".to_string(), pairing.to_string()],
        }
    }

    fn record(&mut self, entry: String) {
        self.entries.push(entry);
    }

    pub fn to_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Log created {}", self.created.format("%Y-%m-%d %H:%M:%S%.6f"))];
        lines.extend(self.entries.iter().cloned());
        lines
    }
}

fn standard_fractions(reference_dose: f64, table: &[(f64, u32)]) -> Option<u32> {
    table
        .iter()
        .find(|(dose, _)| (dose - reference_dose).abs() < 1e-9)
        .map(|(_, fractions)| *fractions)
}

/// 为剂量文件确定缩放因子
///
/// 单计划时全部使用主量缩放；多计划无加量时同样使用主量缩放；两个缩放因子都为1时不缩放；
/// 否则必须恰好两个剂量文件，分次较少的计划对应加量
pub fn pair_doses(
    store: &dyn DicomObjectStore,
    patient_id: &str,
    dose_paths: &[PathBuf],
    plans: &[RtPlan],
    prescription: &Prescription,
) -> Result<DosePairing> {
    if plans.len() == 1 {
        if prescription.main_reference_dose == 0.0 {
            return Err(RtError::SumDose(format!(
                "患者 {}: 单计划疗程的主量参考剂量为0",
                patient_id
            )));
        }
        return Ok(DosePairing::uniform(dose_paths, prescription.main_dose_scale_factor));
    }

    if plans.len() > dose_paths.len() {
        let labels: Vec<&str> = plans.iter().filter_map(|p| p.label.as_deref()).collect();
        return Err(RtError::SumDose(format!(
            "患者 {}: 计划数多于剂量文件数，计划: {:?}",
            patient_id, labels
        )));
    }

    if !prescription.has_boost() {
        return Ok(DosePairing::uniform(dose_paths, prescription.main_dose_scale_factor));
    }

    if prescription.main_dose_scale_factor == 1.0 && prescription.boost_dose_scale_factor == 1.0 {
        return Ok(DosePairing::uniform(dose_paths, 1.0));
    }

    if dose_paths.len() != 2 {
        return Err(RtError::SumDose(format!(
            "患者 {}: 剂量文件数不是2而是 {}，加量参考剂量 {}，主量参考剂量 {}",
            patient_id,
            dose_paths.len(),
            prescription.boost_reference_dose,
            prescription.main_reference_dose
        )));
    }

    let mut fractions_per_dose = Vec::with_capacity(2);
    for path in dose_paths {
        let dose = store.parse_dose(path).map_err(|e| {
            RtError::SumDose(format!("患者 {}: 无法读取剂量文件 {:?}: {}", patient_id, path, e))
        })?;
        let plan = plans.iter().find(|plan| {
            dose.referenced_plan_uid.as_deref() == Some(plan.sop_instance_uid.as_str())
        });
        if let Some(plan) = plan {
            let fractions = plan.fractions().ok_or_else(|| {
                RtError::SumDose(format!(
                    "患者 {}: 计划 {} 缺少计划分次数",
                    patient_id, plan.sop_instance_uid
                ))
            })?;
            fractions_per_dose.push((fractions, path.clone()));
        }
    }
    if fractions_per_dose.len() != 2 {
        return Err(RtError::SumDose(format!(
            "患者 {}: 只有 {} 个剂量文件能匹配到计划",
            patient_id,
            fractions_per_dose.len()
        )));
    }
    // 分次数少的在前
    fractions_per_dose.sort_by_key(|(fractions, _)| *fractions);

    let main_fractions = standard_fractions(prescription.main_reference_dose, MAIN_FRACTIONS)
        .ok_or_else(|| {
            RtError::SumDose(format!(
                "患者 {}: 主量参考剂量不是标准值，而是 {}",
                patient_id, prescription.main_reference_dose
            ))
        })?;
    let boost_fractions = standard_fractions(prescription.boost_reference_dose, BOOST_FRACTIONS)
        .ok_or_else(|| {
            RtError::SumDose(format!(
                "患者 {}: 加量参考剂量不是标准值，而是 {}",
                patient_id, prescription.boost_reference_dose
            ))
        })?;

    // 主量缩放过大时，分次最多的剂量文件不一定是主量
    let max_scale = main_fractions as f64 / (boost_fractions as f64 + 1.0);
    if prescription.main_dose_scale_factor > max_scale {
        return Err(RtError::SumDose(format!(
            "患者 {}: 无法识别主量计划，主量缩放因子 {} 超过 {:.2}",
            patient_id, prescription.main_dose_scale_factor, max_scale
        )));
    }

    let (_, boost_path) = &fractions_per_dose[0];
    let (_, main_path) = &fractions_per_dose[1];
    Ok(DosePairing {
        pairs: vec![
            DosePair {
                path: boost_path.clone(),
                scale: prescription.boost_dose_scale_factor,
            },
            DosePair {
                path: main_path.clone(),
                scale: prescription.main_dose_scale_factor,
            },
        ],
    })
}

/// 求和结果：累加网格和作为头信息模板的第一个合格剂量文件
#[derive(Debug, Clone)]
pub struct SummedDose {
    pub grid: DoseGrid,
    pub template: PathBuf,
}

/// 依次缩放并累加配对中的剂量网格
///
/// 最大剂量不超过 `min_max_dose_gy` 的文件记录后跳过；没有合格文件时结果为 None
pub fn sum_dose_grids(
    store: &dyn DicomObjectStore,
    patient_id: &str,
    pairing: &DosePairing,
    min_max_dose_gy: f64,
) -> Result<(Option<SummedDose>, SumDoseLog)> {
    let mut log = SumDoseLog::new(pairing);

    let mut summed: Option<SummedDose> = None;
    for pair in &pairing.pairs {
        let header = store.parse_dose(&pair.path).map_err(|e| {
            RtError::SumDose(format!("患者 {}: 无法读取剂量文件 {:?}: {}", patient_id, pair.path, e))
        })?;
        let max_dose = header.max_dose();

        if max_dose <= min_max_dose_gy {
            debug!("剂量文件最大剂量 {:.3} Gy 不超过阈值，跳过: {:?}", max_dose, pair.path);
            log.record(format!("Max dose < {} Gy {}", min_max_dose_gy, pair.path.display()));
            log.record(format!("with max dose: {}", max_dose));
            continue;
        }

        let grid = store
            .load_dose_grid(&pair.path)
            .map_err(|e| {
                RtError::SumDose(format!(
                    "患者 {}: 无法加载剂量网格 {:?}: {}",
                    patient_id, pair.path, e
                ))
            })?
            .multiply(pair.scale);
        log.record(pair.path.display().to_string());
        log.record(format!("with max dose: {}", max_dose));

        summed = Some(match summed {
            None => SummedDose {
                grid,
                template: pair.path.clone(),
            },
            Some(previous) => SummedDose {
                grid: previous.grid.add(&grid, true)?,
                template: previous.template,
            },
        });
    }

    Ok((summed, log))
}

/// 求和剂量文件
#[derive(Debug, Clone)]
pub struct SumDoseArtifact {
    /// 本地路径
    pub path: PathBuf,
    /// 目录中的相对路径
    pub catalog_path: String,
    pub uid: String,
    pub grid: DoseGrid,
}

/// 一次求和的输入
pub struct SumDoseRequest<'r> {
    pub treatment_id: i64,
    pub patient_id: &'r str,
    pub dose_paths: &'r [PathBuf],
    pub plans: &'r [RtPlan],
    pub prescription: &'r Prescription,
    /// 为真时把新文件登记到目录
    pub register: bool,
    /// 指定写出位置，缺省为 `<机构>_dose_sum/<患者>/treatment_<id>_sum_dose.dcm`
    pub destination: Option<PathBuf>,
}

/// 默认的求和文件目录路径，机构取第一个剂量文件所在的顶层目录
pub fn default_sum_dose_catalog_path(
    ctx: &TreatmentContext<'_>,
    treatment_id: i64,
    patient_id: &str,
    dose_paths: &[PathBuf],
) -> Result<String> {
    let first = dose_paths
        .first()
        .ok_or_else(|| RtError::SumDose(format!("患者 {}: 没有剂量文件", patient_id)))?;
    let institution = ctx
        .config
        .catalog_path(first)
        .and_then(|path| {
            path.trim_start_matches('/')
                .split('/')
                .next()
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .ok_or_else(|| {
            RtError::SumDose(format!(
                "患者 {}: 剂量文件 {:?} 不在DICOM根目录下",
                patient_id, first
            ))
        })?;

    Ok(format!(
        "/{}_dose_sum/{}/treatment_{}_sum_dose.dcm",
        institution, patient_id, treatment_id
    ))
}

/// 配对、求和并写出求和剂量文件
///
/// 求和没有合格剂量文件时返回 None
pub fn create_sum_dose(
    ctx: &TreatmentContext<'_>,
    request: SumDoseRequest<'_>,
) -> Result<Option<SumDoseArtifact>> {
    let pairing = pair_doses(
        ctx.store,
        request.patient_id,
        request.dose_paths,
        request.plans,
        request.prescription,
    )?;

    let (summed, log) = sum_dose_grids(
        ctx.store,
        request.patient_id,
        &pairing,
        ctx.config.dose.min_summed_max_dose_gy,
    )?;
    let Some(summed) = summed else {
        warn!("患者 {} 疗程 {}: 没有可求和的剂量文件", request.patient_id, request.treatment_id);
        return Ok(None);
    };

    let (path, catalog_path) = match request.destination {
        Some(destination) => {
            let catalog_path = ctx
                .config
                .catalog_path(&destination)
                .unwrap_or_else(|| destination.display().to_string());
            (destination, catalog_path)
        }
        None => {
            let catalog_path = default_sum_dose_catalog_path(
                ctx,
                request.treatment_id,
                request.patient_id,
                request.dose_paths,
            )?;
            (ctx.config.local_path(&catalog_path), catalog_path)
        }
    };

    let uid = ctx
        .store
        .write_sum_dose_artifact(&summed.grid, &summed.template, &path, &log.to_lines())?;

    if request.register {
        ctx.catalog
            .record_sum_dose_artifact(request.treatment_id, &catalog_path, &uid)?;
    }

    info!(
        "患者 {} 疗程 {}: 求和剂量 {:?} (登记: {})",
        request.patient_id, request.treatment_id, path, request.register
    );
    Ok(Some(SumDoseArtifact {
        path,
        catalog_path,
        uid,
        grid: summed.grid,
    }))
}
