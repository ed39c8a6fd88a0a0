//! # RT DICOM模块
//!
//! 放疗DICOM对象（结构集、计划、剂量、CT）的解析，剂量网格运算与DVH计算。

pub mod dvh;
pub mod grid;
pub mod objects;
pub mod parser;
pub mod store;

pub use dvh::{calculate_dvh, Dvh, DvhValue, VolumeMode};
pub use grid::{DoseGrid, GridGeometry};
pub use objects::{
    Contour, ContourPlane, CtImage, FractionGroup, Region, RtDose, RtPlan, StructureSet,
};
pub use parser::RtDicomParser;
pub use store::{DicomFileStore, DicomObjectStore};
