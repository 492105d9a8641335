use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Error, Result};
use crate::types::{
    AnnotationTableMetadata, MetadataUpdate, NewAnnotationTable, Permission,
    SegmentationTableMetadata, VoxelResolution,
};

use super::builder::{self, quote_ident, segmentation_table_name};
use super::{AnnotationDb, format_datetime, parse_datetime};

const ANNO_METADATA_COLUMNS: &str = "id, table_name, schema_type, description, user_id, \
     voxel_resolution_x, voxel_resolution_y, voxel_resolution_z, \
     reference_table, flat_segmentation_source, read_permission, write_permission, \
     notice_text, valid, created, deleted, last_modified";

const SEG_METADATA_COLUMNS: &str =
    "id, table_name, schema_type, annotation_table, pcg_table_name, valid, created, deleted, last_updated";

fn permission_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Permission> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().map(parse_datetime))
}

fn read_annotation_metadata(row: &Row<'_>) -> rusqlite::Result<AnnotationTableMetadata> {
    Ok(AnnotationTableMetadata {
        id: row.get(0)?,
        table_name: row.get(1)?,
        schema_type: row.get(2)?,
        description: row.get(3)?,
        user_id: row.get(4)?,
        voxel_resolution: VoxelResolution {
            x: row.get(5)?,
            y: row.get(6)?,
            z: row.get(7)?,
        },
        reference_table: row.get(8)?,
        flat_segmentation_source: row.get(9)?,
        read_permission: permission_at(row, 10)?,
        write_permission: permission_at(row, 11)?,
        notice_text: row.get(12)?,
        valid: row.get(13)?,
        created: parse_datetime(&row.get::<_, String>(14)?),
        deleted: datetime_at(row, 15)?,
        last_modified: parse_datetime(&row.get::<_, String>(16)?),
    })
}

fn read_segmentation_metadata(row: &Row<'_>) -> rusqlite::Result<SegmentationTableMetadata> {
    Ok(SegmentationTableMetadata {
        id: row.get(0)?,
        table_name: row.get(1)?,
        schema_type: row.get(2)?,
        annotation_table: row.get(3)?,
        pcg_table_name: row.get(4)?,
        valid: row.get(5)?,
        created: parse_datetime(&row.get::<_, String>(6)?),
        deleted: datetime_at(row, 7)?,
        last_updated: datetime_at(row, 8)?,
    })
}

/// Stamps the owning table's last_modified inside the caller's transaction.
pub(crate) fn touch_last_modified(
    conn: &Connection,
    table_name: &str,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE annotation_table_metadata SET last_modified = ?1 WHERE table_name = ?2",
        params![format_datetime(now), table_name],
    )?;
    Ok(())
}

impl AnnotationDb {
    /// Creates a new annotation table: the physical relation plus its
    /// catalog row, in one transaction. Fails if the name is taken, and
    /// validates reference-table declarations before any DDL runs.
    pub fn create_table(&self, spec: &NewAnnotationTable) -> Result<String> {
        builder::validate_table_name(&spec.table_name)?;
        let fields = self.catalog().resolve(&spec.schema_type)?;

        if let Some(reference) = &spec.reference_table {
            if !fields.is_reference {
                return Err(Error::NotAReferenceSchema(spec.schema_type.clone()));
            }
            if reference == &spec.table_name {
                return Err(Error::SelfReferenceTable(spec.table_name.clone()));
            }
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let taken: Option<i64> = tx
            .query_row(
                "SELECT id FROM annotation_table_metadata WHERE table_name = ?1",
                params![spec.table_name],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(Error::TableExists(spec.table_name.clone()));
        }

        if let Some(reference) = &spec.reference_table {
            let found: Option<i64> = tx
                .query_row(
                    "SELECT id FROM annotation_table_metadata WHERE table_name = ?1 AND deleted IS NULL",
                    params![reference],
                    |row| row.get(0),
                )
                .optional()?;
            if found.is_none() {
                return Err(Error::TableNotFound(reference.clone()));
            }
        }

        builder::create_annotation_table(&tx, &spec.table_name, &fields, true)?;

        let now = format_datetime(&Utc::now());
        tx.execute(
            "INSERT INTO annotation_table_metadata \
             (table_name, schema_type, description, user_id, \
              voxel_resolution_x, voxel_resolution_y, voxel_resolution_z, \
              reference_table, flat_segmentation_source, read_permission, write_permission, \
              notice_text, valid, created, last_modified) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13, ?13)",
            params![
                spec.table_name,
                spec.schema_type,
                spec.description,
                spec.user_id,
                spec.voxel_resolution.x,
                spec.voxel_resolution.y,
                spec.voxel_resolution.z,
                spec.reference_table,
                spec.flat_segmentation_source,
                spec.read_permission.as_str(),
                spec.write_permission.as_str(),
                spec.notice_text,
                now,
            ],
        )?;
        tx.commit()?;

        tracing::info!(table = %spec.table_name, schema = %spec.schema_type, "annotation table created");
        Ok(spec.table_name.clone())
    }

    /// Returns metadata for a live table. Soft-deleted tables do not
    /// resolve here, so a double delete surfaces as not-found.
    pub fn get_table_metadata(&self, table_name: &str) -> Result<AnnotationTableMetadata> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {ANNO_METADATA_COLUMNS} FROM annotation_table_metadata \
                 WHERE table_name = ?1 AND deleted IS NULL"
            ),
            params![table_name],
            read_annotation_metadata,
        )
        .optional()?
        .ok_or_else(|| Error::TableNotFound(table_name.to_string()))
    }

    /// Metadata lookup that also resolves soft-deleted tables; rows of a
    /// deleted table remain reachable until the table is dropped.
    pub(crate) fn find_annotation_metadata(
        &self,
        table_name: &str,
    ) -> Result<Option<AnnotationTableMetadata>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {ANNO_METADATA_COLUMNS} FROM annotation_table_metadata WHERE table_name = ?1"
            ),
            params![table_name],
            read_annotation_metadata,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Partial metadata update; always bumps last_modified. An empty
    /// notice_text clears the stored value to NULL.
    pub fn update_table_metadata(
        &self,
        table_name: &str,
        update: &MetadataUpdate,
    ) -> Result<AnnotationTableMetadata> {
        let notice_present = update.notice_text.is_some();
        let notice_value = update
            .notice_text
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let rows = self.conn().execute(
            "UPDATE annotation_table_metadata SET \
                 description = COALESCE(?1, description), \
                 user_id = COALESCE(?2, user_id), \
                 flat_segmentation_source = COALESCE(?3, flat_segmentation_source), \
                 read_permission = COALESCE(?4, read_permission), \
                 write_permission = COALESCE(?5, write_permission), \
                 notice_text = CASE WHEN ?6 THEN ?7 ELSE notice_text END, \
                 last_modified = ?8 \
             WHERE table_name = ?9 AND deleted IS NULL",
            params![
                update.description,
                update.user_id,
                update.flat_segmentation_source,
                update.read_permission.map(Permission::as_str),
                update.write_permission.map(Permission::as_str),
                notice_present,
                notice_value,
                format_datetime(&Utc::now()),
                table_name,
            ],
        )?;
        if rows == 0 {
            return Err(Error::TableNotFound(table_name.to_string()));
        }
        tracing::info!(table = table_name, "table metadata updated");
        self.get_table_metadata(table_name)
    }

    /// Marks a table deleted, hiding it from lookups and listings. The
    /// physical relation and its rows are kept; see [`Self::drop_table`].
    pub fn mark_table_deleted(&self, table_name: &str) -> Result<()> {
        let now = format_datetime(&Utc::now());
        let rows = self.conn().execute(
            "UPDATE annotation_table_metadata \
             SET deleted = ?1, valid = 0, last_modified = ?1 \
             WHERE table_name = ?2 AND deleted IS NULL",
            params![now, table_name],
        )?;
        if rows == 0 {
            return Err(Error::TableNotFound(table_name.to_string()));
        }
        tracing::info!(table = table_name, "table marked deleted");
        Ok(())
    }

    /// Irreversibly drops a table: the annotation relation, every
    /// segmentation relation attached to it, and their catalog rows.
    /// Returns false when nothing by that name exists.
    pub fn drop_table(&self, table_name: &str) -> Result<bool> {
        let mut dropped_names = Vec::new();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;

            let is_annotation: Option<String> = tx
                .query_row(
                    "SELECT table_name FROM annotation_table_metadata WHERE table_name = ?1",
                    params![table_name],
                    |row| row.get(0),
                )
                .optional()?;

            if is_annotation.is_some() {
                let seg_tables: Vec<String> = tx
                    .prepare(
                        "SELECT table_name FROM segmentation_table_metadata WHERE annotation_table = ?1",
                    )?
                    .query_map(params![table_name], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                for seg_table in &seg_tables {
                    builder::drop_physical_table(&tx, seg_table)?;
                }
                tx.execute(
                    "DELETE FROM segmentation_table_metadata WHERE annotation_table = ?1",
                    params![table_name],
                )?;
                builder::drop_physical_table(&tx, table_name)?;
                tx.execute(
                    "DELETE FROM annotation_table_metadata WHERE table_name = ?1",
                    params![table_name],
                )?;
                dropped_names = seg_tables;
                dropped_names.push(table_name.to_string());
            } else {
                let is_segmentation: Option<String> = tx
                    .query_row(
                        "SELECT table_name FROM segmentation_table_metadata WHERE table_name = ?1",
                        params![table_name],
                        |row| row.get(0),
                    )
                    .optional()?;
                if is_segmentation.is_none() {
                    return Ok(false);
                }
                builder::drop_physical_table(&tx, table_name)?;
                tx.execute(
                    "DELETE FROM segmentation_table_metadata WHERE table_name = ?1",
                    params![table_name],
                )?;
                dropped_names.push(table_name.to_string());
            }
            tx.commit()?;
        }

        let mut cache = self.cache();
        for name in &dropped_names {
            cache.invalidate(name);
        }
        tracing::info!(table = table_name, "table dropped");
        Ok(true)
    }

    /// Names of all live, valid annotation tables.
    pub fn list_valid_tables(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT table_name FROM annotation_table_metadata \
             WHERE valid = 1 AND deleted IS NULL ORDER BY table_name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Creates a segmentation table for (annotation table, pcg table).
    /// Idempotent: an existing pair resolves to its derived name without
    /// modification. Returns `None` when the schema has no segmentation
    /// fields.
    pub fn create_segmentation_table(
        &self,
        table_name: &str,
        pcg_table_name: &str,
    ) -> Result<Option<String>> {
        let metadata = self
            .find_annotation_metadata(table_name)?
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;
        let fields = self.catalog().resolve(&metadata.schema_type)?;

        let seg_table = segmentation_table_name(table_name, pcg_table_name);

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT table_name FROM segmentation_table_metadata WHERE table_name = ?1",
                params![seg_table],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(name) = existing {
            return Ok(Some(name));
        }

        let Some(created_name) =
            builder::create_segmentation_table(&tx, table_name, pcg_table_name, &fields)?
        else {
            return Ok(None);
        };

        tx.execute(
            "INSERT INTO segmentation_table_metadata \
             (table_name, schema_type, annotation_table, pcg_table_name, valid, created) \
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                created_name,
                metadata.schema_type,
                table_name,
                pcg_table_name,
                format_datetime(&Utc::now()),
            ],
        )?;
        tx.commit()?;
        Ok(Some(created_name))
    }

    pub fn get_segmentation_table_metadata(
        &self,
        table_name: &str,
        pcg_table_name: &str,
    ) -> Result<SegmentationTableMetadata> {
        let seg_table = segmentation_table_name(table_name, pcg_table_name);
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {SEG_METADATA_COLUMNS} FROM segmentation_table_metadata WHERE table_name = ?1"
            ),
            params![seg_table],
            read_segmentation_metadata,
        )
        .optional()?
        .ok_or(Error::TableNotFound(seg_table))
    }

    /// All segmentation tables attached to an annotation table.
    pub fn list_segmentation_tables(
        &self,
        annotation_table: &str,
    ) -> Result<Vec<SegmentationTableMetadata>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEG_METADATA_COLUMNS} FROM segmentation_table_metadata \
             WHERE annotation_table = ?1 ORDER BY table_name"
        ))?;
        let rows = stmt
            .query_map(params![annotation_table], read_segmentation_metadata)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(crate) fn find_segmentation_metadata_by_name(
        &self,
        table_name: &str,
    ) -> Result<Option<SegmentationTableMetadata>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {SEG_METADATA_COLUMNS} FROM segmentation_table_metadata WHERE table_name = ?1"
            ),
            params![table_name],
            read_segmentation_metadata,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Row count of any dynamically created table, optionally restricted to
    /// valid rows and/or rows created at or before a cutoff.
    pub fn table_row_count(
        &self,
        table_name: &str,
        filter_valid: bool,
        filter_timestamp: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let handle = self.resolve_table(table_name)?;

        let mut sql = format!("SELECT COUNT(id) FROM {}", quote_ident(&handle.table_name));
        let mut clauses = Vec::new();
        if filter_valid {
            clauses.push("valid = 1".to_string());
        }
        let cutoff = filter_timestamp.as_ref().map(format_datetime);
        if cutoff.is_some() {
            clauses.push("created <= ?1".to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let conn = self.conn();
        let count = match cutoff {
            Some(ts) => conn.query_row(&sql, params![ts], |row| row.get(0))?,
            None => conn.query_row(&sql, [], |row| row.get(0))?,
        };
        Ok(count)
    }

    pub fn min_annotation_id(&self, table_name: &str) -> Result<Option<i64>> {
        self.id_aggregate(table_name, "MIN")
    }

    pub fn max_annotation_id(&self, table_name: &str) -> Result<Option<i64>> {
        self.id_aggregate(table_name, "MAX")
    }

    fn id_aggregate(&self, table_name: &str, func: &str) -> Result<Option<i64>> {
        let handle = self.resolve_table(table_name)?;
        let conn = self.conn();
        let value = conn.query_row(
            &format!("SELECT {func}(id) FROM {}", quote_ident(&handle.table_name)),
            [],
            |row| row.get(0),
        )?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::schema::MemoryCatalog;

    fn test_db() -> (TempDir, AnnotationDb) {
        let temp = TempDir::new().unwrap();
        let db = AnnotationDb::new(
            temp.path().join("test.db"),
            Arc::new(MemoryCatalog::with_defaults()),
        )
        .unwrap();
        db.initialize().unwrap();
        (temp, db)
    }

    fn synapse_table(name: &str) -> NewAnnotationTable {
        NewAnnotationTable {
            table_name: name.to_string(),
            schema_type: "synapse".to_string(),
            description: "some description".to_string(),
            user_id: "foo@bar.com".to_string(),
            voxel_resolution: VoxelResolution {
                x: 4.0,
                y: 4.0,
                z: 40.0,
            },
            reference_table: None,
            flat_segmentation_source: None,
            read_permission: Permission::Public,
            write_permission: Permission::Private,
            notice_text: None,
        }
    }

    #[test]
    fn test_create_and_get_metadata() {
        let (_temp, db) = test_db();
        let name = db.create_table(&synapse_table("anno_test")).unwrap();
        assert_eq!(name, "anno_test");

        let metadata = db.get_table_metadata("anno_test").unwrap();
        assert_eq!(metadata.schema_type, "synapse");
        assert_eq!(metadata.read_permission, Permission::Public);
        assert!(metadata.valid);
        assert!(metadata.deleted.is_none());
        assert_eq!(metadata.created, metadata.last_modified);
    }

    #[test]
    fn test_duplicate_table_name_conflicts() {
        let (_temp, db) = test_db();
        db.create_table(&synapse_table("anno_test")).unwrap();
        let err = db.create_table(&synapse_table("anno_test")).unwrap_err();
        assert!(matches!(err, Error::TableExists(name) if name == "anno_test"));

        // first table untouched by the failed second attempt
        assert!(db.get_table_metadata("anno_test").is_ok());
    }

    #[test]
    fn test_unknown_schema_type() {
        let (_temp, db) = test_db();
        let mut spec = synapse_table("anno_test");
        spec.schema_type = "no_such_schema".to_string();
        assert!(matches!(
            db.create_table(&spec),
            Err(Error::UnknownSchemaType(_))
        ));
    }

    #[test]
    fn test_reference_table_validation() {
        let (_temp, db) = test_db();
        db.create_table(&synapse_table("anno_test")).unwrap();

        // non-reference schema may not declare a reference table
        let mut bad = synapse_table("bad_reference");
        bad.reference_table = Some("anno_test".to_string());
        assert!(matches!(
            db.create_table(&bad),
            Err(Error::NotAReferenceSchema(_))
        ));

        let mut spec = synapse_table("bouton_types");
        spec.schema_type = "presynaptic_bouton_type".to_string();
        spec.reference_table = Some("bouton_types".to_string());
        assert!(matches!(
            db.create_table(&spec),
            Err(Error::SelfReferenceTable(_))
        ));

        spec.reference_table = Some("missing".to_string());
        assert!(matches!(db.create_table(&spec), Err(Error::TableNotFound(_))));

        spec.reference_table = Some("anno_test".to_string());
        db.create_table(&spec).unwrap();
        let metadata = db.get_table_metadata("bouton_types").unwrap();
        assert_eq!(metadata.reference_table.as_deref(), Some("anno_test"));
    }

    #[test]
    fn test_update_metadata_clears_empty_notice_text() {
        let (_temp, db) = test_db();
        db.create_table(&synapse_table("anno_test")).unwrap();

        let updated = db
            .update_table_metadata(
                "anno_test",
                &MetadataUpdate {
                    description: Some("new description".to_string()),
                    notice_text: Some("under review".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.description, "new description");
        assert_eq!(updated.notice_text.as_deref(), Some("under review"));
        assert!(updated.last_modified > updated.created);

        let cleared = db
            .update_table_metadata(
                "anno_test",
                &MetadataUpdate {
                    notice_text: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cleared.notice_text.is_none());
        // untouched fields survive partial updates
        assert_eq!(cleared.description, "new description");
    }

    #[test]
    fn test_mark_deleted_hides_table_and_double_delete_fails() {
        let (_temp, db) = test_db();
        db.create_table(&synapse_table("anno_test")).unwrap();

        db.mark_table_deleted("anno_test").unwrap();
        assert!(matches!(
            db.get_table_metadata("anno_test"),
            Err(Error::TableNotFound(_))
        ));
        assert!(db.list_valid_tables().unwrap().is_empty());

        // deleted rows are excluded from lookup, so a second delete fails
        assert!(matches!(
            db.mark_table_deleted("anno_test"),
            Err(Error::TableNotFound(_))
        ));

        // but the name stays reserved
        assert!(matches!(
            db.create_table(&synapse_table("anno_test")),
            Err(Error::TableExists(_))
        ));
    }

    #[test]
    fn test_segmentation_table_idempotent() {
        let (_temp, db) = test_db();
        db.create_table(&synapse_table("anno_test")).unwrap();

        let first = db
            .create_segmentation_table("anno_test", "pcg_v1")
            .unwrap()
            .unwrap();
        assert_eq!(first, "anno_test__pcg_v1");

        let second = db
            .create_segmentation_table("anno_test", "pcg_v1")
            .unwrap()
            .unwrap();
        assert_eq!(first, second);

        let metadata = db
            .get_segmentation_table_metadata("anno_test", "pcg_v1")
            .unwrap();
        assert_eq!(metadata.annotation_table, "anno_test");
        assert_eq!(metadata.pcg_table_name, "pcg_v1");

        let listed = db.list_segmentation_tables("anno_test").unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_segmentation_table_none_without_bound_fields() {
        let (_temp, db) = test_db();
        let mut spec = synapse_table("plain_points");
        spec.schema_type = "point_annotation".to_string();
        db.create_table(&spec).unwrap();

        let created = db
            .create_segmentation_table("plain_points", "pcg_v1")
            .unwrap();
        assert!(created.is_none());
    }

    #[test]
    fn test_drop_table_removes_everything() {
        let (_temp, db) = test_db();
        db.create_table(&synapse_table("anno_test")).unwrap();
        db.create_segmentation_table("anno_test", "pcg_v1").unwrap();

        assert!(db.drop_table("anno_test").unwrap());
        assert!(!db.drop_table("anno_test").unwrap());

        // name is free again after a hard drop
        db.create_table(&synapse_table("anno_test")).unwrap();
    }
}
