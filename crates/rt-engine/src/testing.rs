//! 测试用的内存DICOM存储和标准疗程夹具

use chrono::NaiveDate;
use rt_catalog::MemoryCatalog;
use rt_core::{FileKind, Prescription, Result, RtConfig, RtError, TreatmentRecord};
use rt_dicom::{
    calculate_dvh, Contour, CtImage, DicomObjectStore, DoseGrid, Dvh, FractionGroup, GridGeometry,
    Region, RtDose, RtPlan, StructureSet,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::context::TreatmentContext;
use crate::treatment::Treatment;

pub fn plan(uid: &str, label: &str, fractions: u32, study_date: Option<NaiveDate>) -> RtPlan {
    RtPlan {
        sop_instance_uid: uid.to_string(),
        label: Some(label.to_string()),
        study_date,
        fraction_groups: vec![FractionGroup {
            number: Some(1),
            fractions_planned: Some(fractions),
        }],
    }
}

/// 覆盖整个测试网格的方形轮廓，位于 z = 0 和 z = 1 两个平面
pub fn region(id: i32, name: &str, contoured: bool) -> Region {
    let mut region = Region::new(id, name);
    if contoured {
        for z in [0.0, 1.0] {
            region.add_contour(Contour {
                points: vec![[0.0, -0.5, z], [4.0, -0.5, z], [4.0, 1.5, z], [0.0, 1.5, z]],
            });
        }
    }
    region
}

pub fn ct_image(columns: usize) -> CtImage {
    CtImage {
        sop_instance_uid: Some("ct.1".to_string()),
        image_position: [0.0, 0.0, 0.0],
        pixel_spacing: [1.0, 1.0],
        rows: columns,
        columns,
        slice_thickness: Some(1.0),
        manufacturer: Some("Siemens".to_string()),
        kvp: Some(120.0),
        software_versions: None,
    }
}

/// 2行4列2帧的网格，低两列为 `right`，高两列为 `left`
pub fn split_grid(right: f64, left: f64) -> DoseGrid {
    let geometry = GridGeometry {
        rows: 2,
        columns: 4,
        image_position: [0.5, 0.0, 0.0],
        pixel_spacing: [1.0, 1.0],
        image_orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        frame_offsets: vec![0.0, 1.0],
    };
    let values = [right, right, left, left].repeat(4);
    DoseGrid::new(geometry, values).unwrap()
}

/// 不读磁盘的DICOM存储，记录解析次数和写出的文件
#[derive(Default)]
pub struct FakeStore {
    structures: RefCell<HashMap<PathBuf, StructureSet>>,
    plans: RefCell<HashMap<PathBuf, RtPlan>>,
    doses: RefCell<HashMap<PathBuf, (RtDose, DoseGrid)>>,
    cts: RefCell<HashMap<PathBuf, CtImage>>,
    dvhs: RefCell<HashMap<i32, Dvh>>,
    existing: RefCell<HashSet<PathBuf>>,
    written: RefCell<Vec<PathBuf>>,
    structure_parses: Cell<usize>,
    plan_parses: Cell<usize>,
    grid_loads: Cell<usize>,
    dvh_computations: Cell<usize>,
}

fn bump(counter: &Cell<usize>) {
    counter.set(counter.get() + 1);
}

fn missing(path: &Path) -> RtError {
    RtError::DicomParse(format!("文件不存在: {:?}", path))
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_structure(&self, path: &str, regions: Vec<Region>) {
        self.structures.borrow_mut().insert(
            PathBuf::from(path),
            StructureSet {
                sop_instance_uid: Some(format!("rs.{}", path)),
                regions,
            },
        );
    }

    pub fn add_plan(&self, path: &str, plan: RtPlan) {
        self.plans.borrow_mut().insert(PathBuf::from(path), plan);
    }

    pub fn add_ct(&self, path: &str, ct: CtImage) {
        self.cts.borrow_mut().insert(PathBuf::from(path), ct);
    }

    /// 均匀剂量网格，头信息中的最大剂量等于 `value`
    pub fn add_dose(&self, path: &str, referenced_plan: Option<&str>, value: f64) {
        self.add_dose_grid(path, referenced_plan, split_grid(value, value));
    }

    pub fn add_dose_grid(&self, path: &str, referenced_plan: Option<&str>, grid: DoseGrid) {
        let header = RtDose {
            sop_instance_uid: format!("rd.{}", path),
            referenced_plan_uid: referenced_plan.map(str::to_string),
            dose_grid_scaling: 1.0,
            dose_max: grid.max(),
            geometry: grid.geometry().clone(),
        };
        self.doses
            .borrow_mut()
            .insert(PathBuf::from(path), (header, grid));
    }

    /// 预置某区域的DVH，计算时直接返回
    pub fn set_dvh(&self, region_id: i32, dvh: Dvh) {
        self.dvhs.borrow_mut().insert(region_id, dvh);
    }

    pub fn remove_artifact(&self, path: &Path) {
        self.existing.borrow_mut().remove(path);
    }

    pub fn written_artifacts(&self) -> Vec<PathBuf> {
        self.written.borrow().clone()
    }

    pub fn structure_parses(&self) -> usize {
        self.structure_parses.get()
    }

    pub fn plan_parses(&self) -> usize {
        self.plan_parses.get()
    }

    pub fn grid_loads(&self) -> usize {
        self.grid_loads.get()
    }

    pub fn dvh_computations(&self) -> usize {
        self.dvh_computations.get()
    }
}

impl DicomObjectStore for FakeStore {
    fn parse_structure_set(&self, path: &Path) -> Result<StructureSet> {
        bump(&self.structure_parses);
        self.structures
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| missing(path))
    }

    fn parse_plan(&self, path: &Path) -> Result<RtPlan> {
        bump(&self.plan_parses);
        self.plans.borrow().get(path).cloned().ok_or_else(|| missing(path))
    }

    fn parse_dose(&self, path: &Path) -> Result<RtDose> {
        self.doses
            .borrow()
            .get(path)
            .map(|(header, _)| header.clone())
            .ok_or_else(|| missing(path))
    }

    fn parse_ct_image(&self, path: &Path) -> Result<CtImage> {
        self.cts.borrow().get(path).cloned().ok_or_else(|| missing(path))
    }

    fn load_dose_grid(&self, path: &Path) -> Result<DoseGrid> {
        bump(&self.grid_loads);
        self.doses
            .borrow()
            .get(path)
            .map(|(_, grid)| grid.clone())
            .ok_or_else(|| missing(path))
    }

    fn compute_dvh(&self, structure_path: &Path, dose_path: &Path, region_id: i32) -> Result<Dvh> {
        bump(&self.dvh_computations);
        if let Some(dvh) = self.dvhs.borrow().get(&region_id) {
            return Ok(dvh.clone());
        }
        let structure = self.parse_structure_set(structure_path)?;
        let region = structure
            .region(region_id)
            .ok_or_else(|| RtError::Dvh(format!("区域 {} 不存在", region_id)))?;
        let grid = self.load_dose_grid(dose_path)?;
        calculate_dvh(region, &grid, 0.01)
    }

    fn artifact_exists(&self, path: &Path) -> bool {
        self.existing.borrow().contains(path)
    }

    fn write_sum_dose_artifact(
        &self,
        grid: &DoseGrid,
        _template: &Path,
        destination: &Path,
        _log_lines: &[String],
    ) -> Result<String> {
        let uid = format!("2.25.{}", self.written.borrow().len() + 1);
        let key = destination.display().to_string();
        self.add_dose_grid(&key, None, grid.clone());
        self.existing.borrow_mut().insert(destination.to_path_buf());
        self.written.borrow_mut().push(destination.to_path_buf());
        Ok(uid)
    }
}

/// 一个完整的单计划疗程：患者 p1，疗程 1，集合 1，DICOM根目录 /data
///
/// 结构集含 Hjerte、Lung_L 和一个空区域 Heart；剂量偏向右侧，最大 40 Gy
pub struct Fixture {
    pub catalog: MemoryCatalog,
    pub store: FakeStore,
    pub config: RtConfig,
}

impl Fixture {
    pub fn standard() -> Self {
        let fixture = Self {
            catalog: MemoryCatalog::new(),
            store: FakeStore::new(),
            config: RtConfig::with_root("/data"),
        };
        fixture.add_patient(1, "p1");
        fixture
    }

    /// 登记一个标准疗程及其文件
    pub fn add_patient(&self, treatment_id: i64, patient_id: &str) {
        self.catalog.add_treatment(TreatmentRecord {
            treatment_id,
            patient_id: patient_id.to_string(),
            collection_id: 1,
            treatment_place: Some("breast".to_string()),
            prescription: Prescription::main_only(50.0),
        });

        let dir = format!("/aarhus/{}", patient_id);
        let files = [
            (FileKind::Ct, "ct1.dcm"),
            (FileKind::Structure, "rs.dcm"),
            (FileKind::Plan, "rp_main.dcm"),
            (FileKind::Dose, "rd_main.dcm"),
        ];
        for (kind, name) in files {
            self.catalog
                .add_file(treatment_id, kind, &format!("{}/{}", dir, name), None);
        }

        let local = |name: &str| format!("/data{}/{}", dir, name);
        self.store.add_ct(&local("ct1.dcm"), ct_image(4));
        self.store.add_structure(
            &local("rs.dcm"),
            vec![region(1, "Hjerte", true), region(2, "Lung_L", true), region(3, "Heart", false)],
        );
        self.store.add_plan(
            &local("rp_main.dcm"),
            plan("plan.main", "Main", 25, NaiveDate::from_ymd_opt(2012, 3, 1)),
        );
        self.store
            .add_dose_grid(&local("rd_main.dcm"), Some("plan.main"), split_grid(40.0, 2.0));
    }

    pub fn context(&self) -> TreatmentContext<'_> {
        TreatmentContext::new(&self.catalog, &self.store, &self.config)
    }

    pub fn treatment(&self) -> Treatment<'_> {
        self.loaded_treatment(Prescription::main_only(50.0))
    }

    pub fn loaded_treatment(&self, prescription: Prescription) -> Treatment<'_> {
        let mut treatment = Treatment::new(self.context(), 1, "p1", 1, prescription);
        treatment.load_file_paths().unwrap();
        treatment
    }

    /// 已校验的标准疗程
    pub fn valid_treatment(&self) -> Treatment<'_> {
        let mut treatment = self.treatment();
        treatment.validate().unwrap();
        treatment
    }
}
