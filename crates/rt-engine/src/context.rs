//! 疗程运行上下文

use rt_catalog::FileCatalog;
use rt_core::RtConfig;
use rt_dicom::DicomObjectStore;

/// 注入每个疗程的协作者：目录、DICOM存储和进程级配置
#[derive(Clone, Copy)]
pub struct TreatmentContext<'a> {
    pub catalog: &'a dyn FileCatalog,
    pub store: &'a dyn DicomObjectStore,
    pub config: &'a RtConfig,
}

impl<'a> TreatmentContext<'a> {
    pub fn new(
        catalog: &'a dyn FileCatalog,
        store: &'a dyn DicomObjectStore,
        config: &'a RtConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            config,
        }
    }
}
