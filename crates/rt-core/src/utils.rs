//! 通用工具函数

use chrono::NaiveDate;
use uuid::Uuid;

/// 生成求和剂量文件使用的DICOM UID
///
/// 使用 `2.25` 根（UUID派生的UID），长度不超过64字符
pub fn generate_dicom_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

/// 解析DICOM DA格式日期 (YYYYMMDD)
pub fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(is_valid_dicom_uid(&uid));
        assert_ne!(uid, generate_dicom_uid());
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.481.2"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("1..2"));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
    }

    #[test]
    fn test_parse_dicom_date() {
        assert_eq!(
            parse_dicom_date("20090315"),
            NaiveDate::from_ymd_opt(2009, 3, 15)
        );
        assert_eq!(parse_dicom_date("2009-03-15"), None);
    }
}
