//! 放疗数据提取命令行程序

use anyhow::Context;
use clap::Parser;
use rt_catalog::{FileCatalog, SqliteCatalog};
use rt_core::{RtConfig, TreatmentFilter};
use rt_dicom::DicomFileStore;
use rt_engine::{extract_data_from_patient, DataPoint, TreatmentContext};
use std::path::PathBuf;
use tracing::{error, info};

/// 数据提取命令行参数
#[derive(Parser, Debug)]
#[command(name = "rt-extract")]
#[command(about = "从放疗疗程集合中按患者提取剂量和疗程数据点")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/rt.toml")]
    config: String,

    /// 疗程集合ID
    #[arg(long)]
    collection: i64,

    /// 患者ID，可重复；缺省为集合中的全部患者
    #[arg(short, long)]
    patient: Vec<String>,

    /// 数据点名称，可重复，例如 heart_mean、heart_v20gy_rel
    #[arg(long, required = true)]
    point: Vec<String>,

    /// 改用该结构集合中的结构集
    #[arg(long)]
    structure_collection: Option<i64>,

    /// 追加记录初始化失败的疗程
    #[arg(long)]
    failure_log: Option<PathBuf>,

    /// 日志级别，缺省使用配置文件中的值
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RtConfig::load(&args.config)?;

    // 日志输出到stderr，stdout只输出提取结果
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();

    info!("启动数据提取...");
    info!("  DICOM根目录: {}", config.dicom_root.display());
    info!("  疗程集合: {}", args.collection);

    let points = args
        .point
        .iter()
        .map(|name| DataPoint::parse(name))
        .collect::<Result<Vec<_>, _>>()
        .context("数据点名称无效")?;

    let catalog = SqliteCatalog::connect(&config.database_url, &config.user)
        .with_context(|| format!("无法连接目录数据库 {}", config.database_url))?;
    let store = DicomFileStore::new();
    let ctx = TreatmentContext::new(&catalog, &store, &config);

    let patients = if args.patient.is_empty() {
        let mut patients: Vec<String> = catalog
            .list_treatments(args.collection, &TreatmentFilter::default())?
            .into_iter()
            .map(|record| record.patient_id)
            .collect();
        patients.sort();
        patients.dedup();
        patients
    } else {
        args.patient.clone()
    };
    info!("  患者数: {}", patients.len());

    let mut failed = 0;
    for patient_id in &patients {
        match extract_data_from_patient(
            ctx,
            args.collection,
            patient_id,
            &points,
            args.structure_collection,
            args.failure_log.as_deref(),
        ) {
            Ok(data) => println!("{}", serde_json::to_string(&data)?),
            Err(e) => {
                error!("患者 {} 数据提取失败: {}", patient_id, e);
                failed += 1;
            }
        }
    }

    info!("提取完成: {} 个患者，{} 个失败", patients.len(), failed);
    Ok(())
}
