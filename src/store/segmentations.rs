use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::{Record, project_columns, split_record, unflatten_record};

use super::annotations::{explicit_id, insert_flat_row, read_flat_rows};
use super::builder::{quote_ident, segmentation_table_name};
use super::cache::{TableHandle, TableKind};
use super::registry::touch_last_modified;
use super::{AnnotationDb, format_datetime, sql_to_json};

fn touch_segmentation_updated(
    conn: &Connection,
    seg_table: &str,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE segmentation_table_metadata SET last_updated = ?1 WHERE table_name = ?2",
        params![format_datetime(now), seg_table],
    )?;
    Ok(())
}

impl AnnotationDb {
    fn segmentation_handle(
        &self,
        table_name: &str,
        pcg_table_name: &str,
    ) -> Result<Arc<TableHandle>> {
        let seg_table = segmentation_table_name(table_name, pcg_table_name);
        let handle = self.resolve_table(&seg_table)?;
        match handle.kind {
            TableKind::Segmentation { .. } => Ok(handle),
            TableKind::Annotation { .. } => Err(Error::TableNotFound(seg_table)),
        }
    }

    /// Inserts annotation records together with their segmentation rows,
    /// sharing one id per pair. Both writes commit atomically; a conflict on
    /// the segmentation side rolls the annotation rows back too.
    pub fn insert_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        records: &[Record],
    ) -> Result<Vec<i64>> {
        self.check_insert_limit(records.len())?;
        let anno = self.annotation_handle(table_name)?;
        let seg = self.segmentation_handle(table_name, pcg_table_name)?;
        let anno_columns = anno.stored_columns();
        let seg_columns = seg.stored_columns();

        let now = Utc::now();
        let created = Value::from(format_datetime(&now));

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let (mut annotation, segmentation) = split_record(&anno.fields, record);
            annotation.insert("created".to_string(), created.clone());
            annotation.insert("valid".to_string(), Value::Bool(true));
            let id = insert_flat_row(
                &tx,
                &anno.table_name,
                &anno_columns,
                &annotation,
                explicit_id(record),
            )?;

            let taken: Option<i64> = tx
                .query_row(
                    &format!(
                        "SELECT id FROM {} WHERE id = ?1",
                        quote_ident(&seg.table_name)
                    ),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(Error::IdsExist(vec![id]));
            }
            insert_flat_row(&tx, &seg.table_name, &seg_columns, &segmentation, Some(id))?;
            ids.push(id);
        }
        touch_last_modified(&tx, &anno.table_name, &now)?;
        touch_segmentation_updated(&tx, &seg.table_name, &now)?;
        tx.commit()?;

        tracing::info!(
            table = table_name,
            pcg = pcg_table_name,
            rows = ids.len(),
            "inserted linked annotations"
        );
        Ok(ids)
    }

    /// Inserts segmentation rows for existing annotation ids. Every record
    /// must carry the annotation id it links to; ids already present in the
    /// segmentation table fail the whole batch.
    pub fn insert_segmentations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        records: &[Record],
    ) -> Result<Vec<i64>> {
        self.check_insert_limit(records.len())?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let seg = self.segmentation_handle(table_name, pcg_table_name)?;
        let seg_columns = seg.stored_columns();

        let mut pairs = Vec::with_capacity(records.len());
        for record in records {
            let id = explicit_id(record).ok_or(Error::MissingId)?;
            let (_, segmentation) = split_record(&seg.fields, record);
            pairs.push((id, segmentation));
        }

        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let ids: Vec<i64> = pairs.iter().map(|(id, _)| *id).collect();
        let existing: Vec<i64> = tx
            .prepare(&format!(
                "SELECT id FROM {} WHERE id IN ({})",
                quote_ident(&seg.table_name),
                vec!["?"; ids.len()].join(", ")
            ))?
            .query_map(params_from_iter(ids.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !existing.is_empty() {
            return Err(Error::IdsExist(existing));
        }

        for (id, segmentation) in &pairs {
            insert_flat_row(&tx, &seg.table_name, &seg_columns, segmentation, Some(*id))?;
        }
        touch_segmentation_updated(&tx, &seg.table_name, &now)?;
        tx.commit()?;
        Ok(ids)
    }

    /// Fetches annotation rows joined with their segmentation rows, merged
    /// into one nested record per id. Annotations without a segmentation
    /// counterpart are not returned.
    pub fn get_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        ids: &[i64],
    ) -> Result<Vec<Record>> {
        let anno = self.annotation_handle(table_name)?;
        let seg = self.segmentation_handle(table_name, pcg_table_name)?;
        let anno_columns = anno.stored_columns();
        let seg_columns = seg.stored_columns();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut select = vec!["a.id".to_string()];
        select.extend(anno_columns.iter().map(|c| format!("a.{}", quote_ident(&c.name))));
        select.extend(seg_columns.iter().map(|c| format!("s.{}", quote_ident(&c.name))));
        let sql = format!(
            "SELECT {} FROM {} a JOIN {} s ON s.id = a.id WHERE a.id IN ({}) ORDER BY a.id",
            select.join(", "),
            quote_ident(&anno.table_name),
            quote_ident(&seg.table_name),
            vec!["?"; ids.len()].join(", ")
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(ids.iter()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut flat = Record::new();
            flat.insert("id".to_string(), Value::from(row.get::<_, i64>(0)?));
            for (idx, column) in anno_columns.iter().chain(seg_columns.iter()).enumerate() {
                let value = sql_to_json(column, row.get_ref(idx + 1)?)?;
                flat.insert(column.name.clone(), value);
            }
            records.push(unflatten_record(&anno.fields, &flat));
        }
        if records.is_empty() {
            return Err(Error::NoAnnotationsFound(ids.to_vec()));
        }
        Ok(records)
    }

    /// Supersedes an annotation row and re-points its segmentation row at
    /// the new id. The segmentation row is re-associated, not duplicated.
    pub fn update_linked_annotation(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        record: &Record,
    ) -> Result<(i64, i64)> {
        let id = explicit_id(record).ok_or(Error::MissingId)?;
        let anno = self.annotation_handle(table_name)?;
        let seg = self.segmentation_handle(table_name, pcg_table_name)?;
        let anno_columns = anno.stored_columns();
        let data_columns = anno.data_columns();

        let (new_annotation, _) = split_record(&anno.fields, record);

        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let old = read_flat_rows(&tx, &anno.table_name, &anno_columns, &[id])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoAnnotationsFound(vec![id]))?;

        // Staleness first: a superseded row's segmentation row has already
        // been re-pointed at the new head, so the link check below would
        // misreport a stale update as not-found.
        if let Some(superseded_by) = old.get("superceded_id").and_then(Value::as_i64) {
            return Err(Error::UpdateConflict { id, superseded_by });
        }

        let linked: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT id FROM {} WHERE id = ?1",
                    quote_ident(&seg.table_name)
                ),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if linked.is_none() {
            return Err(Error::NoAnnotationsFound(vec![id]));
        }

        let mut merged = project_columns(&data_columns, &old);
        for (key, value) in new_annotation {
            merged.insert(key, value);
        }
        merged.insert("created".to_string(), Value::from(format_datetime(&now)));
        merged.insert("valid".to_string(), Value::Bool(true));

        let new_id = insert_flat_row(&tx, &anno.table_name, &anno_columns, &merged, None)?;

        tx.execute(
            &format!(
                "UPDATE {} SET deleted = ?1, superceded_id = ?2, valid = 0 WHERE id = ?3",
                quote_ident(&anno.table_name)
            ),
            params![format_datetime(&now), new_id, id],
        )?;
        tx.execute(
            &format!(
                "UPDATE {} SET id = ?1 WHERE id = ?2",
                quote_ident(&seg.table_name)
            ),
            params![new_id, id],
        )?;
        touch_last_modified(&tx, &anno.table_name, &now)?;
        touch_segmentation_updated(&tx, &seg.table_name, &now)?;
        tx.commit()?;

        tracing::info!(
            table = table_name,
            pcg = pcg_table_name,
            old_id = id,
            new_id,
            "superseded linked annotation"
        );
        Ok((id, new_id))
    }

    /// Soft-deletes annotation rows that have a segmentation counterpart.
    /// Rows matching the id filter but lacking a segmentation row are left
    /// untouched.
    pub fn delete_linked_annotations(
        &self,
        table_name: &str,
        pcg_table_name: &str,
        ids: &[i64],
    ) -> Result<Option<Vec<i64>>> {
        if ids.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let anno = self.annotation_handle(table_name)?;
        let seg = self.segmentation_handle(table_name, pcg_table_name)?;

        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let found: Vec<i64> = tx
            .prepare(&format!(
                "SELECT a.id FROM {} a JOIN {} s ON s.id = a.id WHERE a.id IN ({})",
                quote_ident(&anno.table_name),
                quote_ident(&seg.table_name),
                vec!["?"; ids.len()].join(", ")
            ))?
            .query_map(params_from_iter(ids.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if found.is_empty() {
            return Ok(None);
        }

        let mut params_vec: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(format_datetime(&now))];
        params_vec.extend(found.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        tx.execute(
            &format!(
                "UPDATE {} SET deleted = ?1, valid = 0 WHERE id IN ({})",
                quote_ident(&anno.table_name),
                vec!["?"; found.len()].join(", ")
            ),
            params_from_iter(params_vec),
        )?;

        touch_last_modified(&tx, &anno.table_name, &now)?;
        tx.commit()?;

        let deleted: Vec<i64> = ids.iter().copied().filter(|id| found.contains(id)).collect();
        Ok(Some(deleted))
    }
}
