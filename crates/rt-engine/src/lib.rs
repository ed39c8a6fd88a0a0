//! # RT疗程引擎
//!
//! 疗程校验状态机、主量/加量剂量配对与求和、ROI同义词优先级选择，
//! 以及按集合批量初始化疗程和按患者提取数据点。

pub mod collection;
pub mod context;
pub mod extraction;
pub mod laterality;
pub mod roi;
pub mod state_machine;
pub mod sum_dose;
pub mod treatment;

#[cfg(test)]
pub(crate) mod testing;

pub use collection::{init_treatments_from_collection, BatchOutcome, TreatmentFailure};
pub use context::TreatmentContext;
pub use extraction::{extract_data_from_patient, DataPoint, GenericParameter, PatientData, RoiParameter};
pub use roi::{DataRecord, DvhPointSpec, Roi, SynonymLaterality, SynonymMatch};
pub use state_machine::{ValidationEvent, ValidationState, ValidationStateMachine};
pub use sum_dose::{create_sum_dose, pair_doses, sum_dose_grids, DosePair, DosePairing, SumDoseArtifact, SumDoseLog};
pub use treatment::{StructureGeometry, Treatment};
