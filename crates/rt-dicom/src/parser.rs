//! 放疗DICOM解析器
//!
//! 基于 dicom-rs 读取RT结构集、RT计划、RT剂量和CT图像，并把求和后的剂量网格写回RTDOSE文件

use dicom::core::value::PrimitiveValue;
use dicom::core::{DataElement, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject, InMemDicomObject, OpenFileOptions};
use rt_core::utils::parse_dicom_date;
use rt_core::{Result, RtError};
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::grid::{DoseGrid, GridGeometry};
use crate::objects::{Contour, CtImage, FractionGroup, Region, RtDose, RtPlan, StructureSet};

/// 放疗DICOM解析器
pub struct RtDicomParser;

impl RtDicomParser {
    /// 打开DICOM文件
    pub fn open(path: &Path) -> Result<DefaultDicomObject> {
        open_file(path).map_err(|e| {
            error!("DICOM文件解析失败: {:?}, 错误: {}", path, e);
            RtError::DicomParse(format!("无法解析DICOM文件 {:?}: {}", path, e))
        })
    }

    /// 解析RT结构集
    pub fn parse_structure_set(path: &Path) -> Result<StructureSet> {
        let obj = Self::open(path)?;
        let structure = Self::structure_set_from_object(&obj)?;
        debug!("解析结构集 {:?}: {} 个区域", path, structure.regions.len());
        Ok(structure)
    }

    pub fn structure_set_from_object(obj: &InMemDicomObject) -> Result<StructureSet> {
        let mut regions: Vec<Region> = sequence_items(obj, tags::STRUCTURE_SET_ROI_SEQUENCE)
            .iter()
            .filter_map(|item| {
                let id = int_value::<i32>(item, tags::ROI_NUMBER)?;
                let name = string_value(item, tags::ROI_NAME).unwrap_or_default();
                Some(Region::new(id, &name))
            })
            .collect();

        for roi_contour in sequence_items(obj, tags::ROI_CONTOUR_SEQUENCE) {
            let Some(roi_number) = int_value::<i32>(roi_contour, tags::REFERENCED_ROI_NUMBER) else {
                warn!("ROI轮廓缺少引用ROI编号，已跳过");
                continue;
            };
            let Some(region) = regions.iter_mut().find(|r| r.id == roi_number) else {
                warn!("ROI轮廓引用了不存在的ROI编号: {}", roi_number);
                continue;
            };

            for contour_item in sequence_items(roi_contour, tags::CONTOUR_SEQUENCE) {
                let data = float_values(contour_item, tags::CONTOUR_DATA);
                let points: Vec<[f64; 3]> = data
                    .chunks_exact(3)
                    .map(|p| [p[0], p[1], p[2]])
                    .collect();
                if points.is_empty() {
                    continue;
                }
                region.add_contour(Contour { points });
            }
        }

        Ok(StructureSet {
            sop_instance_uid: string_value(obj, tags::SOP_INSTANCE_UID),
            regions,
        })
    }

    /// 解析RT计划
    pub fn parse_plan(path: &Path) -> Result<RtPlan> {
        let obj = Self::open(path)?;
        Self::plan_from_object(&obj)
    }

    pub fn plan_from_object(obj: &InMemDicomObject) -> Result<RtPlan> {
        let sop_instance_uid = string_value(obj, tags::SOP_INSTANCE_UID)
            .ok_or_else(|| RtError::DicomParse("RT计划缺少SOP Instance UID".to_string()))?;

        let fraction_groups = sequence_items(obj, tags::FRACTION_GROUP_SEQUENCE)
            .iter()
            .map(|group| FractionGroup {
                number: int_value::<i32>(group, tags::FRACTION_GROUP_NUMBER),
                fractions_planned: int_value::<u32>(group, tags::NUMBER_OF_FRACTIONS_PLANNED),
            })
            .collect();

        Ok(RtPlan {
            sop_instance_uid,
            label: string_value(obj, tags::RT_PLAN_LABEL),
            study_date: string_value(obj, tags::STUDY_DATE).and_then(|d| parse_dicom_date(&d)),
            fraction_groups,
        })
    }

    /// 解析RT剂量头信息，像素最大值需要读取像素数据
    pub fn parse_dose(path: &Path) -> Result<RtDose> {
        let obj = Self::open(path)?;
        let (dose, _) = Self::dose_from_object(&obj)?;
        Ok(dose)
    }

    /// 读取剂量网格 (Gy)
    pub fn load_dose_grid(path: &Path) -> Result<DoseGrid> {
        let obj = Self::open(path)?;
        let (dose, raw) = Self::dose_from_object(&obj)?;
        let values = raw.into_iter().map(|v| v * dose.dose_grid_scaling).collect();
        DoseGrid::new(dose.geometry, values)
    }

    pub fn dose_from_object(obj: &InMemDicomObject) -> Result<(RtDose, Vec<f64>)> {
        let sop_instance_uid = string_value(obj, tags::SOP_INSTANCE_UID)
            .ok_or_else(|| RtError::DicomParse("RT剂量缺少SOP Instance UID".to_string()))?;

        let referenced_plan_uid = sequence_items(obj, tags::REFERENCED_RT_PLAN_SEQUENCE)
            .first()
            .and_then(|item| string_value(item, tags::REFERENCED_SOP_INSTANCE_UID));

        let geometry = Self::grid_geometry(obj)?;
        let raw = Self::raw_pixels(obj, geometry.voxel_count())?;
        let dose_max = raw.iter().copied().fold(0.0, f64::max);

        let dose = RtDose {
            sop_instance_uid,
            referenced_plan_uid,
            dose_grid_scaling: float_value(obj, tags::DOSE_GRID_SCALING).unwrap_or(1.0),
            dose_max,
            geometry,
        };
        Ok((dose, raw))
    }

    fn grid_geometry(obj: &InMemDicomObject) -> Result<GridGeometry> {
        let rows = int_value::<usize>(obj, tags::ROWS)
            .ok_or_else(|| RtError::DicomParse("RT剂量缺少Rows".to_string()))?;
        let columns = int_value::<usize>(obj, tags::COLUMNS)
            .ok_or_else(|| RtError::DicomParse("RT剂量缺少Columns".to_string()))?;

        let position = float_values(obj, tags::IMAGE_POSITION_PATIENT);
        let spacing = float_values(obj, tags::PIXEL_SPACING);
        if position.len() < 3 || spacing.len() < 2 {
            return Err(RtError::DicomParse("RT剂量缺少图像位置或像素间距".to_string()));
        }
        let orientation = float_values(obj, tags::IMAGE_ORIENTATION_PATIENT);
        let image_orientation = if orientation.len() == 6 {
            [
                orientation[0],
                orientation[1],
                orientation[2],
                orientation[3],
                orientation[4],
                orientation[5],
            ]
        } else {
            [1.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        };

        let mut frame_offsets = float_values(obj, tags::GRID_FRAME_OFFSET_VECTOR);
        let frames = int_value::<usize>(obj, tags::NUMBER_OF_FRAMES).unwrap_or(1);
        if frame_offsets.is_empty() {
            frame_offsets = vec![0.0];
        }
        if frame_offsets.len() != frames {
            warn!(
                "帧偏移数量 ({}) 与帧数 ({}) 不一致，以偏移向量为准",
                frame_offsets.len(),
                frames
            );
        }

        Ok(GridGeometry {
            rows,
            columns,
            image_position: [position[0], position[1], position[2]],
            pixel_spacing: [spacing[0], spacing[1]],
            image_orientation,
            frame_offsets,
        })
    }

    fn raw_pixels(obj: &InMemDicomObject, expected: usize) -> Result<Vec<f64>> {
        let bits = int_value::<u16>(obj, tags::BITS_ALLOCATED).unwrap_or(32);
        let signed = int_value::<u16>(obj, tags::PIXEL_REPRESENTATION) == Some(1);
        let bytes = obj
            .element(tags::PIXEL_DATA)
            .ok()
            .and_then(|e| e.to_bytes().ok())
            .ok_or_else(|| RtError::DicomParse("RT剂量缺少可读取的像素数据".to_string()))?;

        let values: Vec<f64> = match (bits, signed) {
            (16, false) => bytes
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as f64)
                .collect(),
            (16, true) => bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f64)
                .collect(),
            (32, false) => bytes
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
                .collect(),
            (32, true) => bytes
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
                .collect(),
            (other, _) => {
                return Err(RtError::DicomParse(format!("不支持的剂量像素位数: {}", other)));
            }
        };

        if values.len() < expected {
            return Err(RtError::DicomParse(format!(
                "剂量像素数据不完整: 期望 {}, 实际 {}",
                expected,
                values.len()
            )));
        }
        Ok(values.into_iter().take(expected).collect())
    }

    /// 解析CT图像信息（不读取像素数据）
    pub fn parse_ct_image(path: &Path) -> Result<CtImage> {
        let obj = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .map_err(|e| RtError::DicomParse(format!("无法解析CT文件 {:?}: {}", path, e)))?;
        Self::ct_image_from_object(&obj)
    }

    pub fn ct_image_from_object(obj: &InMemDicomObject) -> Result<CtImage> {
        let position = float_values(obj, tags::IMAGE_POSITION_PATIENT);
        let spacing = float_values(obj, tags::PIXEL_SPACING);
        if position.len() < 3 || spacing.len() < 2 {
            return Err(RtError::DicomParse("CT图像缺少图像位置或像素间距".to_string()));
        }

        Ok(CtImage {
            sop_instance_uid: string_value(obj, tags::SOP_INSTANCE_UID),
            image_position: [position[0], position[1], position[2]],
            pixel_spacing: [spacing[0], spacing[1]],
            rows: int_value::<usize>(obj, tags::ROWS).unwrap_or(0),
            columns: int_value::<usize>(obj, tags::COLUMNS).unwrap_or(0),
            slice_thickness: float_value(obj, tags::SLICE_THICKNESS),
            manufacturer: string_value(obj, tags::MANUFACTURER),
            kvp: float_value(obj, tags::KVP),
            software_versions: string_value(obj, tags::SOFTWARE_VERSIONS),
        })
    }

    /// 以模板剂量文件为基础写出新的RTDOSE文件
    ///
    /// 像素以32位无符号整数保存，缩放因子由网格最大值推出；模板须为非压缩的小端传输语法
    pub fn write_dose_file(template: &Path, grid: &DoseGrid, dest: &Path, uid: &str) -> Result<()> {
        let mut obj = Self::open(template)?;
        let geometry = grid.geometry();

        let max = grid.max();
        let scaling = if max > 0.0 { max / u32::MAX as f64 } else { 1.0 };
        let mut pixel_bytes = Vec::with_capacity(grid.values().len() * 4);
        for value in grid.values() {
            let raw = (value / scaling).round().clamp(0.0, u32::MAX as f64) as u32;
            pixel_bytes.extend_from_slice(&raw.to_le_bytes());
        }

        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(uid)));
        obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(geometry.rows as u16)));
        obj.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            PrimitiveValue::from(geometry.columns as u16),
        ));
        obj.put(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from(geometry.frames().to_string()),
        ));
        obj.put(ds_element(tags::IMAGE_POSITION_PATIENT, &geometry.image_position));
        obj.put(ds_element(tags::PIXEL_SPACING, &geometry.pixel_spacing));
        obj.put(ds_element(tags::IMAGE_ORIENTATION_PATIENT, &geometry.image_orientation));
        obj.put(ds_element(tags::GRID_FRAME_OFFSET_VECTOR, &geometry.frame_offsets));
        obj.put(ds_element(tags::DOSE_GRID_SCALING, &[scaling]));
        obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(32_u16)));
        obj.put(DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(32_u16)));
        obj.put(DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(31_u16)));
        obj.put(DataElement::new(
            tags::PIXEL_REPRESENTATION,
            VR::US,
            PrimitiveValue::from(0_u16),
        ));
        obj.put(DataElement::new(
            tags::DOSE_SUMMATION_TYPE,
            VR::CS,
            PrimitiveValue::from("MULTI_PLAN"),
        ));
        obj.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixel_bytes)));
        obj.update_meta(|meta| {
            meta.media_storage_sop_instance_uid = uid.to_string();
        });

        obj.write_to_file(dest).map_err(|e| {
            error!("写出剂量文件失败: {:?}, 错误: {}", dest, e);
            RtError::Dicom(format!("无法写出剂量文件 {:?}: {}", dest, e))
        })?;

        info!("剂量文件已写出: {:?}, 最大剂量 {:.3} Gy", dest, max);
        Ok(())
    }
}

/// 序列元素的条目，缺失时为空
fn sequence_items(obj: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    obj.element(tag)
        .ok()
        .and_then(|element| element.items())
        .unwrap_or(&[])
}

/// 获取字符串类型元素的值，去掉填充字符
fn string_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let element = obj.element(tag).ok()?;
    let value = element.to_str().ok()?;
    let trimmed = value.trim_end_matches(['\0', ' ']).trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn int_value<T: TryFrom<i64>>(obj: &InMemDicomObject, tag: Tag) -> Option<T> {
    let value = obj.element(tag).ok()?.to_int::<i64>().ok()?;
    T::try_from(value).ok()
}

fn float_value(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag).ok()?.to_float64().ok()
}

fn float_values(obj: &InMemDicomObject, tag: Tag) -> Vec<f64> {
    obj.element(tag)
        .ok()
        .and_then(|element| element.to_multi_float64().ok())
        .unwrap_or_default()
}

/// DS值最长16个字符
fn format_ds(value: f64) -> String {
    let plain = format!("{}", value);
    if plain.len() <= 16 {
        plain
    } else {
        format!("{:.8e}", value)
    }
}

fn ds_element(tag: Tag, values: &[f64]) -> DataElement<InMemDicomObject> {
    let joined = values
        .iter()
        .map(|v| format_ds(*v))
        .collect::<Vec<_>>()
        .join("\\");
    DataElement::new(tag, VR::DS, PrimitiveValue::from(joined))
}
