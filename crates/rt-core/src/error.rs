//! 错误定义模块

use thiserror::Error;

/// 疗程解析统一错误类型
#[derive(Error, Debug)]
pub enum RtError {
    /// 疗程文件集合的结构/数量约束不成立，该疗程无法继续
    #[error("疗程初始化错误: {0}")]
    Init(String),

    /// 剂量配对/缩放协议无法给出可信结果
    #[error("剂量求和错误: {0}")]
    SumDose(String),

    #[error("缺少CT影像: {0}")]
    NoCts(String),

    #[error("ROI已存在: {0}")]
    RoiAlreadyExists(String),

    #[error("缺少增强结构集: {0}")]
    AugmentedStructureMissing(String),

    #[error("数据提取失败: {0}")]
    DataExtractionFailed(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("目录错误: {0}")]
    Catalog(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("DICOM解析错误: {0}")]
    DicomParse(String),

    #[error("DVH计算错误: {0}")]
    Dvh(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

impl RtError {
    /// 调用方可以只跳过当前指标/数据源而继续处理该疗程
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RtError::NoCts(_)
                | RtError::RoiAlreadyExists(_)
                | RtError::AugmentedStructureMissing(_)
                | RtError::DataExtractionFailed(_)
        )
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, RtError>;
