//! SQLite目录
//!
//! 目录接口是同步的：每个逻辑操作在目录自带的tokio运行时上执行一次，占用一个连接

use chrono::Utc;
use rt_core::{
    AugmentedStructure, FileKind, FileRecord, Prescription, Result, RtError, SynonymRecord,
    TreatmentFilter, TreatmentRecord,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashSet;
use std::str::FromStr;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::catalog::FileCatalog;
use crate::models::{DbAugmentedStructure, DbDicomFile, DbSynonym, DbTreatment};

fn db_error(e: sqlx::Error) -> RtError {
    RtError::Catalog(e.to_string())
}

/// SQLite目录
pub struct SqliteCatalog {
    runtime: Runtime,
    pool: SqlitePool,
    /// 写入 edit_user 列
    user: String,
}

impl SqliteCatalog {
    /// 连接数据库，文件不存在时创建
    pub fn connect(database_url: &str, user: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_error)?
            .create_if_missing(true);
        let pool = runtime
            .block_on(
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options),
            )
            .map_err(db_error)?;

        info!("目录数据库已连接: {}", database_url);
        Ok(Self {
            runtime,
            pool,
            user: user.to_string(),
        })
    }

    /// 内存数据库，已建表
    pub fn in_memory(user: &str) -> Result<Self> {
        let catalog = Self::connect("sqlite::memory:", user)?;
        catalog.create_tables()?;
        Ok(catalog)
    }

    /// 创建数据库表
    pub fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS treatment_collections (
                collection_id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_name TEXT NOT NULL,
                edit_date TEXT,
                edit_user TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS treatments (
                treatment_id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_id INTEGER NOT NULL REFERENCES treatment_collections(collection_id),
                patient_id TEXT NOT NULL,
                treatment_place TEXT,
                main_reference_dose REAL,
                main_dose_scale_factor REAL,
                boost_reference_dose REAL,
                boost_dose_scale_factor REAL,
                edit_date TEXT,
                edit_user TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dicom_files (
                dicom_file_id INTEGER PRIMARY KEY AUTOINCREMENT,
                treatment_id INTEGER REFERENCES treatments(treatment_id),
                file_path TEXT NOT NULL,
                file_type TEXT NOT NULL,
                file_uid TEXT,
                edit_date TEXT,
                edit_user TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS synonym_collections (
                synonym_collection_id INTEGER PRIMARY KEY AUTOINCREMENT,
                synonym_collection_name TEXT NOT NULL,
                edit_date TEXT,
                edit_user TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS synonyms_for_treatment_collections (
                synonym_collection_id INTEGER NOT NULL REFERENCES synonym_collections(synonym_collection_id),
                treatment_collection_id INTEGER NOT NULL REFERENCES treatment_collections(collection_id),
                edit_date TEXT,
                edit_user TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS synonyms (
                synonym_id INTEGER PRIMARY KEY AUTOINCREMENT,
                synonym_collection_id INTEGER NOT NULL REFERENCES synonym_collections(synonym_collection_id),
                synonym TEXT NOT NULL,
                standard_name TEXT NOT NULL,
                laterality TEXT,
                priority_count INTEGER,
                edit_date TEXT,
                edit_user TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS structure_collections (
                structure_collection_id INTEGER PRIMARY KEY AUTOINCREMENT,
                structure_collection_name TEXT NOT NULL,
                edit_date TEXT,
                edit_user TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS structures (
                structure_id INTEGER PRIMARY KEY AUTOINCREMENT,
                structure_collection_id INTEGER NOT NULL REFERENCES structure_collections(structure_collection_id),
                patient_id TEXT NOT NULL,
                dicom_file_id INTEGER NOT NULL REFERENCES dicom_files(dicom_file_id),
                edit_date TEXT,
                edit_user TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_treatments_collection_id ON treatments(collection_id)",
            "CREATE INDEX IF NOT EXISTS idx_dicom_files_treatment_id ON dicom_files(treatment_id)",
            "CREATE INDEX IF NOT EXISTS idx_synonyms_standard_name ON synonyms(standard_name)",
            "CREATE INDEX IF NOT EXISTS idx_structures_patient_id ON structures(patient_id)",
        ];

        self.runtime.block_on(async {
            for statement in statements {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(db_error)?;
            }
            Ok::<(), RtError>(())
        })?;

        info!("目录数据表创建完成");
        Ok(())
    }

    // ========== 疗程集合 ==========

    /// 新建疗程集合，返回集合ID
    pub fn create_treatment_collection(&self, collection_name: &str) -> Result<i64> {
        self.runtime.block_on(async {
            sqlx::query(
                "INSERT INTO treatment_collections (collection_name, edit_date, edit_user) VALUES (?, ?, ?)",
            )
            .bind(collection_name)
            .bind(Utc::now())
            .bind(&self.user)
            .execute(&self.pool)
            .await
            .map(|result| result.last_insert_rowid())
            .map_err(db_error)
        })
    }

    /// 向集合中加入疗程，返回疗程ID
    pub fn add_treatment(
        &self,
        collection_id: i64,
        patient_id: &str,
        treatment_place: Option<&str>,
        prescription: &Prescription,
    ) -> Result<i64> {
        self.runtime.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO treatments (collection_id, patient_id, treatment_place,
                    main_dose_scale_factor, boost_dose_scale_factor,
                    main_reference_dose, boost_reference_dose, edit_date, edit_user)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(collection_id)
            .bind(patient_id)
            .bind(treatment_place)
            .bind(prescription.main_dose_scale_factor)
            .bind(prescription.boost_dose_scale_factor)
            .bind(prescription.main_reference_dose)
            .bind(prescription.boost_reference_dose)
            .bind(Utc::now())
            .bind(&self.user)
            .execute(&self.pool)
            .await
            .map(|result| result.last_insert_rowid())
            .map_err(db_error)
        })
    }

    /// 登记文件，路径统一为 `/` 分隔，返回文件ID
    pub fn add_file(
        &self,
        treatment_id: Option<i64>,
        kind: FileKind,
        path: &str,
        uid: Option<&str>,
    ) -> Result<i64> {
        let path = path.replace('\\', "/");
        self.runtime.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO dicom_files (treatment_id, file_path, file_type, file_uid, edit_date, edit_user)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(treatment_id)
            .bind(&path)
            .bind(kind.as_str())
            .bind(uid)
            .bind(Utc::now())
            .bind(&self.user)
            .execute(&self.pool)
            .await
            .map(|result| result.last_insert_rowid())
            .map_err(db_error)
        })
    }

    /// 删除集合中指定患者的求和剂量文件记录，返回删除的行数
    pub fn delete_sum_dose_files(&self, patient_ids: &[String], collection_id: i64) -> Result<u64> {
        let deleted = self.runtime.block_on(async {
            let mut deleted = 0;
            for patient_id in patient_ids {
                deleted += sqlx::query(
                    r#"
                    DELETE FROM dicom_files
                    WHERE file_type = ? AND treatment_id IN (
                        SELECT treatment_id FROM treatments WHERE collection_id = ? AND patient_id = ?
                    )
                    "#,
                )
                .bind(FileKind::SumDose.as_str())
                .bind(collection_id)
                .bind(patient_id)
                .execute(&self.pool)
                .await
                .map_err(db_error)?
                .rows_affected();
            }
            Ok::<u64, RtError>(deleted)
        })?;

        info!("已删除 {} 条求和剂量文件记录 (集合 {})", deleted, collection_id);
        Ok(deleted)
    }

    // ========== 同义词 ==========

    /// 新建同义词集合，返回集合ID
    pub fn create_synonym_collection(&self, name: &str) -> Result<i64> {
        self.runtime.block_on(async {
            sqlx::query(
                "INSERT INTO synonym_collections (synonym_collection_name, edit_date, edit_user) VALUES (?, ?, ?)",
            )
            .bind(name)
            .bind(Utc::now())
            .bind(&self.user)
            .execute(&self.pool)
            .await
            .map(|result| result.last_insert_rowid())
            .map_err(db_error)
        })
    }

    /// 把同义词集合关联到疗程集合
    pub fn associate_synonym_collection(
        &self,
        synonym_collection_id: i64,
        treatment_collection_id: i64,
    ) -> Result<()> {
        self.runtime.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO synonyms_for_treatment_collections
                    (synonym_collection_id, treatment_collection_id, edit_date, edit_user)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(synonym_collection_id)
            .bind(treatment_collection_id)
            .bind(Utc::now())
            .bind(&self.user)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(db_error)
        })
    }

    pub fn add_synonym(
        &self,
        synonym_collection_id: i64,
        synonym: &str,
        standard_name: &str,
        laterality: Option<&str>,
        priority_count: Option<i64>,
    ) -> Result<()> {
        self.runtime.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO synonyms (synonym_collection_id, synonym, standard_name,
                    laterality, priority_count, edit_date, edit_user)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(synonym_collection_id)
            .bind(synonym)
            .bind(standard_name)
            .bind(laterality)
            .bind(priority_count)
            .bind(Utc::now())
            .bind(&self.user)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(db_error)
        })
    }

    // ========== 增强结构集 ==========

    /// 新建结构集合，返回集合ID
    pub fn create_structure_collection(&self, name: &str) -> Result<i64> {
        self.runtime.block_on(async {
            sqlx::query(
                "INSERT INTO structure_collections (structure_collection_name, edit_date, edit_user) VALUES (?, ?, ?)",
            )
            .bind(name)
            .bind(Utc::now())
            .bind(&self.user)
            .execute(&self.pool)
            .await
            .map(|result| result.last_insert_rowid())
            .map_err(db_error)
        })
    }

    /// 登记增强结构集文件并加入结构集合，返回文件ID
    pub fn add_augmented_structure(
        &self,
        structure_collection_id: i64,
        patient_id: &str,
        path: &str,
    ) -> Result<i64> {
        let file_id = self.add_file(None, FileKind::AugmentedStruct, path, None)?;
        self.runtime.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO structures (structure_collection_id, patient_id, dicom_file_id, edit_date, edit_user)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(structure_collection_id)
            .bind(patient_id)
            .bind(file_id)
            .bind(Utc::now())
            .bind(&self.user)
            .execute(&self.pool)
            .await
            .map_err(db_error)
        })?;
        Ok(file_id)
    }
}

impl FileCatalog for SqliteCatalog {
    fn list_treatments(
        &self,
        collection_id: i64,
        filter: &TreatmentFilter,
    ) -> Result<Vec<TreatmentRecord>> {
        let rows = self.runtime.block_on(async {
            sqlx::query_as::<_, DbTreatment>(
                r#"
                SELECT treatment_id, patient_id, collection_id, treatment_place,
                    main_reference_dose, main_dose_scale_factor,
                    boost_reference_dose, boost_dose_scale_factor
                FROM treatments WHERE collection_id = ? ORDER BY treatment_id
                "#,
            )
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
        })?;

        let treatments: Vec<TreatmentRecord> = rows
            .into_iter()
            .map(TreatmentRecord::from)
            .filter(|record| filter.accepts(record))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();

        debug!("集合 {} 中选出 {} 个疗程", collection_id, treatments.len());
        Ok(treatments)
    }

    fn list_files(&self, treatment_id: i64) -> Result<Vec<FileRecord>> {
        let rows = self.runtime.block_on(async {
            sqlx::query_as::<_, DbDicomFile>(
                r#"
                SELECT dicom_file_id, treatment_id, file_path, file_type, file_uid
                FROM dicom_files WHERE treatment_id = ? ORDER BY dicom_file_id
                "#,
            )
            .bind(treatment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
        })?;

        Ok(rows.into_iter().map(FileRecord::from).collect())
    }

    fn list_synonyms(
        &self,
        standard_name: &str,
        collection_id: i64,
        with_priority: bool,
    ) -> Result<Vec<SynonymRecord>> {
        let rows = self.runtime.block_on(async {
            sqlx::query_as::<_, DbSynonym>(
                r#"
                SELECT s.synonym, s.priority_count, s.laterality
                FROM synonyms s
                JOIN synonyms_for_treatment_collections st
                    ON st.synonym_collection_id = s.synonym_collection_id
                WHERE s.standard_name = ? AND st.treatment_collection_id = ?
                ORDER BY s.synonym_id
                "#,
            )
            .bind(standard_name)
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
        })?;

        let mut seen = HashSet::new();
        let synonyms = rows
            .into_iter()
            .map(SynonymRecord::from)
            .map(|record| {
                if with_priority {
                    record
                } else {
                    SynonymRecord {
                        synonym: record.synonym,
                        priority_count: None,
                        laterality: None,
                    }
                }
            })
            .filter(|record| seen.insert(record.clone()))
            .collect();
        Ok(synonyms)
    }

    fn list_augmented_structures(
        &self,
        patient_id: &str,
        structure_collection_id: Option<i64>,
    ) -> Result<Vec<AugmentedStructure>> {
        let rows = self.runtime.block_on(async {
            sqlx::query_as::<_, DbAugmentedStructure>(
                r#"
                SELECT f.file_path, s.structure_collection_id
                FROM structures s
                JOIN dicom_files f ON f.dicom_file_id = s.dicom_file_id
                WHERE s.patient_id = ? AND (? IS NULL OR s.structure_collection_id = ?)
                ORDER BY s.structure_id
                "#,
            )
            .bind(patient_id)
            .bind(structure_collection_id)
            .bind(structure_collection_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
        })?;

        Ok(rows.into_iter().map(AugmentedStructure::from).collect())
    }

    fn record_sum_dose_artifact(&self, treatment_id: i64, path: &str, uid: &str) -> Result<()> {
        self.add_file(Some(treatment_id), FileKind::SumDose, path, Some(uid))?;
        info!("疗程 {} 登记求和剂量文件: {}", treatment_id, path);
        Ok(())
    }
}
