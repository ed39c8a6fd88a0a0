//! 按疗程集合批量初始化疗程

use rt_core::{Result, RtError, TreatmentFilter};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::context::TreatmentContext;
use crate::treatment::Treatment;

/// 一个未通过校验的疗程
#[derive(Debug, Clone, Serialize)]
pub struct TreatmentFailure {
    pub patient_id: String,
    pub treatment_id: i64,
    pub error: String,
}

/// 批量初始化结果
pub struct BatchOutcome<'a> {
    pub treatments: Vec<Treatment<'a>>,
    pub failures: Vec<TreatmentFailure>,
}

/// 单个疗程的失败不影响批次中的其他疗程
fn is_treatment_failure(error: &RtError) -> bool {
    matches!(
        error,
        RtError::Init(_) | RtError::SumDose(_) | RtError::Dicom(_) | RtError::DicomParse(_)
    )
}

/// 读取集合中的疗程，加载文件路径并逐个校验
///
/// 给出 `failure_log` 时，追加一行批次描述和每个失败疗程的 `患者;疗程;错误`
pub fn init_treatments_from_collection<'a>(
    ctx: TreatmentContext<'a>,
    collection_id: i64,
    filter: &TreatmentFilter,
    failure_log: Option<&Path>,
) -> Result<BatchOutcome<'a>> {
    let records = ctx.catalog.list_treatments(collection_id, filter)?;
    info!("疗程集合 {}: 读取到 {} 个疗程", collection_id, records.len());

    let mut treatments = Vec::new();
    let mut failures = Vec::new();
    for record in &records {
        let mut treatment = Treatment::from_record(ctx, record);
        treatment.load_file_paths()?;

        match treatment.validate() {
            Ok(()) => treatments.push(treatment),
            Err(e) if is_treatment_failure(&e) => {
                warn!(
                    "跳过疗程: 患者 {}, 疗程 {}, 错误: {}",
                    record.patient_id, record.treatment_id, e
                );
                failures.push(TreatmentFailure {
                    patient_id: record.patient_id.clone(),
                    treatment_id: record.treatment_id,
                    error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(path) = failure_log {
        append_failure_log(path, collection_id, filter, &failures)?;
    }

    info!(
        "疗程集合 {}: {} 个疗程通过校验，{} 个失败",
        collection_id,
        treatments.len(),
        failures.len()
    );
    Ok(BatchOutcome {
        treatments,
        failures,
    })
}

fn append_failure_log(
    path: &Path,
    collection_id: i64,
    filter: &TreatmentFilter,
    failures: &[TreatmentFailure],
) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "collection_id: {}, treatment_limit: {:?}, departments: {:?}",
        collection_id, filter.limit, filter.departments
    )?;
    for failure in failures {
        writeln!(
            file,
            "{};{};{}",
            failure.patient_id, failure.treatment_id, failure.error
        )?;
    }
    Ok(())
}
