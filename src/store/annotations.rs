use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, params_from_iter};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::{Column, Record, project_columns, split_record, unflatten_record};

use super::builder::quote_ident;
use super::cache::{TableHandle, TableKind};
use super::registry::touch_last_modified;
use super::{AnnotationDb, format_datetime, json_to_sql, sql_to_json};

pub(super) fn select_list(columns: &[Column]) -> String {
    let mut parts = vec!["id".to_string()];
    parts.extend(columns.iter().map(|c| quote_ident(&c.name)));
    parts.join(", ")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Reads rows by id into flat records. The `id` key is always present;
/// every other key follows the given column list.
pub(super) fn read_flat_rows(
    conn: &Connection,
    table: &str,
    columns: &[Column],
    ids: &[i64],
) -> Result<Vec<Record>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE id IN ({}) ORDER BY id",
        select_list(columns),
        quote_ident(table),
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(ids.iter()))?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut flat = Record::new();
        flat.insert("id".to_string(), Value::from(row.get::<_, i64>(0)?));
        for (idx, column) in columns.iter().enumerate() {
            let value = sql_to_json(column, row.get_ref(idx + 1)?)?;
            flat.insert(column.name.clone(), value);
        }
        records.push(flat);
    }
    Ok(records)
}

/// Inserts one flat record, letting the database assign the id unless the
/// caller supplied one. Columns absent from the record store NULL.
pub(super) fn insert_flat_row(
    conn: &Connection,
    table: &str,
    columns: &[Column],
    flat: &Record,
    explicit_id: Option<i64>,
) -> Result<i64> {
    let mut names = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(id) = explicit_id {
        names.push("id".to_string());
        values.push(rusqlite::types::Value::Integer(id));
    }
    for column in columns {
        names.push(quote_ident(&column.name));
        match flat.get(&column.name) {
            Some(value) => values.push(json_to_sql(column, value)?),
            None => values.push(rusqlite::types::Value::Null),
        }
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        names.join(", "),
        placeholders(values.len())
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(explicit_id.unwrap_or_else(|| conn.last_insert_rowid()))
}

pub(super) fn explicit_id(record: &Record) -> Option<i64> {
    record.get("id").and_then(Value::as_i64)
}

impl AnnotationDb {
    /// Resolves a name that must be an annotation table; a segmentation
    /// table name does not satisfy an annotation lookup.
    pub(super) fn annotation_handle(&self, table_name: &str) -> Result<Arc<TableHandle>> {
        let handle = self.resolve_table(table_name)?;
        match handle.kind {
            TableKind::Annotation { .. } => Ok(handle),
            TableKind::Segmentation { .. } => Err(Error::TableNotFound(table_name.to_string())),
        }
    }

    pub(super) fn check_insert_limit(&self, attempted: usize) -> Result<()> {
        let limit = self.insert_limit();
        if attempted > limit {
            return Err(Error::InsertLimitExceeded { limit, attempted });
        }
        Ok(())
    }

    /// Inserts a batch of annotation records, returning the assigned ids in
    /// input order. Caller-supplied ids are honored; all other rows get a
    /// database-assigned id. The whole batch commits or rolls back as one.
    pub fn insert_annotations(&self, table_name: &str, records: &[Record]) -> Result<Vec<i64>> {
        self.check_insert_limit(records.len())?;
        let handle = self.annotation_handle(table_name)?;
        let columns = handle.stored_columns();

        let now = Utc::now();
        let created = Value::from(format_datetime(&now));

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let (mut annotation, _segmentation) = split_record(&handle.fields, record);
            annotation.insert("created".to_string(), created.clone());
            annotation.insert("valid".to_string(), Value::Bool(true));
            let id = insert_flat_row(
                &tx,
                &handle.table_name,
                &columns,
                &annotation,
                explicit_id(record),
            )?;
            ids.push(id);
        }
        touch_last_modified(&tx, &handle.table_name, &now)?;
        tx.commit()?;

        tracing::info!(table = table_name, rows = ids.len(), "inserted annotations");
        Ok(ids)
    }

    /// Fetches annotations by id, in any lifecycle state, re-hydrated into
    /// nested form with timestamps as RFC 3339 text. Ids with no row are
    /// skipped; fails not-found only when none of the requested ids exist.
    pub fn get_annotations(&self, table_name: &str, ids: &[i64]) -> Result<Vec<Record>> {
        let handle = self.annotation_handle(table_name)?;
        let columns = handle.stored_columns();

        let conn = self.conn();
        let rows = read_flat_rows(&conn, &handle.table_name, &columns, ids)?;
        if rows.is_empty() && !ids.is_empty() {
            return Err(Error::NoAnnotationsFound(ids.to_vec()));
        }
        Ok(rows
            .iter()
            .map(|flat| unflatten_record(&handle.fields, flat))
            .collect())
    }

    /// Replaces the current head of a version chain. The record must carry
    /// the id of the row to supersede; its values are merged over that
    /// row's, the result is inserted as a fresh row, and the old row is
    /// marked invalid, stamped deleted, and linked forward.
    ///
    /// Returns `(old_id, new_id)`.
    ///
    /// The head check and the supersede run in one write transaction, so two
    /// racing updates of the same head serialize on the database's write
    /// lock rather than both succeeding.
    pub fn update_annotation(&self, table_name: &str, record: &Record) -> Result<(i64, i64)> {
        let id = explicit_id(record).ok_or(Error::MissingId)?;
        let handle = self.annotation_handle(table_name)?;
        let columns = handle.stored_columns();
        let data_columns = handle.data_columns();

        let (new_annotation, _segmentation) = split_record(&handle.fields, record);

        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let old = read_flat_rows(&tx, &handle.table_name, &columns, &[id])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoAnnotationsFound(vec![id]))?;

        if let Some(superseded_by) = old.get("superceded_id").and_then(Value::as_i64) {
            return Err(Error::UpdateConflict { id, superseded_by });
        }

        // old values are the defaults; the update payload overrides
        let mut merged = project_columns(&data_columns, &old);
        for (key, value) in new_annotation {
            merged.insert(key, value);
        }
        merged.insert("created".to_string(), Value::from(format_datetime(&now)));
        merged.insert("valid".to_string(), Value::Bool(true));

        let new_id = insert_flat_row(&tx, &handle.table_name, &columns, &merged, None)?;

        tx.execute(
            &format!(
                "UPDATE {} SET deleted = ?1, superceded_id = ?2, valid = 0 WHERE id = ?3",
                quote_ident(&handle.table_name)
            ),
            rusqlite::params![format_datetime(&now), new_id, id],
        )?;
        touch_last_modified(&tx, &handle.table_name, &now)?;
        tx.commit()?;

        tracing::info!(table = table_name, old_id = id, new_id, "superseded annotation");
        Ok((id, new_id))
    }

    /// Soft-deletes rows by id, in any state. Returns the subset of
    /// requested ids that existed, `None` when none did, and an empty list
    /// when the request itself was empty.
    pub fn delete_annotations(
        &self,
        table_name: &str,
        ids: &[i64],
    ) -> Result<Option<Vec<i64>>> {
        if ids.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let handle = self.annotation_handle(table_name)?;

        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let sql = format!(
            "SELECT id FROM {} WHERE id IN ({})",
            quote_ident(&handle.table_name),
            placeholders(ids.len())
        );
        let found: Vec<i64> = tx
            .prepare(&sql)?
            .query_map(params_from_iter(ids.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if found.is_empty() {
            return Ok(None);
        }

        let update = format!(
            "UPDATE {} SET deleted = ?1, valid = 0 WHERE id IN ({})",
            quote_ident(&handle.table_name),
            placeholders(found.len())
        );
        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(format_datetime(&now))];
        params.extend(found.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        tx.execute(&update, params_from_iter(params))?;

        touch_last_modified(&tx, &handle.table_name, &now)?;
        tx.commit()?;

        // report in request order
        let deleted: Vec<i64> = ids.iter().copied().filter(|id| found.contains(id)).collect();
        tracing::info!(table = table_name, rows = deleted.len(), "deleted annotations");
        Ok(Some(deleted))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::tests_support::{sample_synapse, test_db_with_table};
    use crate::types::RowState;

    fn row_state(record: &Record) -> RowState {
        let valid = record.get("valid").and_then(Value::as_bool).unwrap_or(false);
        let deleted = record
            .get("deleted")
            .and_then(Value::as_str)
            .map(|s| super::super::parse_datetime(s));
        let superceded = record.get("superceded_id").and_then(Value::as_i64);
        RowState::from_columns(valid, deleted, superceded)
    }

    #[test]
    fn test_insert_get_round_trip() {
        let (_temp, db) = test_db_with_table("anno_test");
        let ids = db
            .insert_annotations("anno_test", &[sample_synapse()])
            .unwrap();
        assert_eq!(ids, [1]);

        let rows = db.get_annotations("anno_test", &ids).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["pre_pt"]["position"], json!([121, 123, 1232]));
        assert_eq!(row["post_pt"]["position"], json!([333, 555, 5555]));
        assert_eq!(row["size"], json!(1.0));
        assert_eq!(row["valid"], json!(true));
        assert!(row.get("created").and_then(Value::as_str).is_some());
        assert_eq!(row_state(row), RowState::Active);
    }

    #[test]
    fn test_insert_honors_explicit_id() {
        let (_temp, db) = test_db_with_table("anno_test");
        let mut record = sample_synapse();
        record.insert("id".to_string(), json!(50));
        let ids = db.insert_annotations("anno_test", &[record]).unwrap();
        assert_eq!(ids, [50]);

        // the sequence continues past the explicit id
        let next = db
            .insert_annotations("anno_test", &[sample_synapse()])
            .unwrap();
        assert_eq!(next, [51]);
    }

    #[test]
    fn test_insert_limit_checked_before_any_write() {
        let (_temp, db) = test_db_with_table("anno_test");
        let records: Vec<Record> = (0..10_001).map(|_| sample_synapse()).collect();
        let err = db.insert_annotations("anno_test", &records).unwrap_err();
        assert!(matches!(
            err,
            Error::InsertLimitExceeded {
                limit: 10_000,
                attempted: 10_001
            }
        ));
        assert_eq!(db.table_row_count("anno_test", false, None).unwrap(), 0);
    }

    #[test]
    fn test_update_builds_version_chain() {
        let (_temp, db) = test_db_with_table("anno_test");
        db.insert_annotations("anno_test", &[sample_synapse()])
            .unwrap();

        let update: Record = json!({
            "id": 1,
            "pre_pt": {"position": [77, 88, 99]}
        })
        .as_object()
        .unwrap()
        .clone();
        let (old_id, new_id) = db.update_annotation("anno_test", &update).unwrap();
        assert_eq!((old_id, new_id), (1, 2));

        let rows = db.get_annotations("anno_test", &[1, 2]).unwrap();
        let old = &rows[0];
        let new = &rows[1];

        assert_eq!(row_state(old), RowState::Superseded { by: 2 });
        assert_eq!(old["valid"], json!(false));

        assert_eq!(row_state(new), RowState::Active);
        // updated field replaced, untouched fields carried over
        assert_eq!(new["pre_pt"]["position"], json!([77, 88, 99]));
        assert_eq!(new["post_pt"]["position"], json!([333, 555, 5555]));
        assert_eq!(new["size"], json!(1.0));
    }

    #[test]
    fn test_chain_never_branches() {
        let (_temp, db) = test_db_with_table("anno_test");
        db.insert_annotations("anno_test", &[sample_synapse()])
            .unwrap();

        let mut head = 1;
        for i in 0..4 {
            let update: Record = json!({
                "id": head,
                "size": i + 2
            })
            .as_object()
            .unwrap()
            .clone();
            let (_, new_id) = db.update_annotation("anno_test", &update).unwrap();
            head = new_id;
        }

        let all_ids: Vec<i64> = (1..=5).collect();
        let rows = db.get_annotations("anno_test", &all_ids).unwrap();
        let heads: Vec<i64> = rows
            .iter()
            .filter(|r| row_state(r) == RowState::Active)
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert_eq!(heads, [head]);

        // every superseded row points at its immediate successor
        for (idx, row) in rows.iter().enumerate().take(4) {
            assert_eq!(
                row_state(row),
                RowState::Superseded {
                    by: (idx + 2) as i64
                }
            );
        }
    }

    #[test]
    fn test_stale_update_rejected() {
        let (_temp, db) = test_db_with_table("anno_test");
        db.insert_annotations("anno_test", &[sample_synapse()])
            .unwrap();
        let update: Record = json!({"id": 1, "size": 2})
            .as_object()
            .unwrap()
            .clone();
        db.update_annotation("anno_test", &update).unwrap();

        let err = db.update_annotation("anno_test", &update).unwrap_err();
        assert!(matches!(
            err,
            Error::UpdateConflict {
                id: 1,
                superseded_by: 2
            }
        ));

        // the failed update must leave the store unchanged
        assert_eq!(db.table_row_count("anno_test", false, None).unwrap(), 2);
    }

    #[test]
    fn test_update_requires_id() {
        let (_temp, db) = test_db_with_table("anno_test");
        let err = db
            .update_annotation("anno_test", &sample_synapse())
            .unwrap_err();
        assert!(matches!(err, Error::MissingId));
    }

    #[test]
    fn test_update_unknown_id() {
        let (_temp, db) = test_db_with_table("anno_test");
        let update: Record = json!({"id": 999, "size": 2})
            .as_object()
            .unwrap()
            .clone();
        let err = db.update_annotation("anno_test", &update).unwrap_err();
        assert!(matches!(err, Error::NoAnnotationsFound(ids) if ids == [999]));
    }

    #[test]
    fn test_delete_returns_found_subset() {
        let (_temp, db) = test_db_with_table("anno_test");
        db.insert_annotations("anno_test", &[sample_synapse(), sample_synapse()])
            .unwrap();

        let deleted = db.delete_annotations("anno_test", &[1, 999]).unwrap();
        assert_eq!(deleted, Some(vec![1]));

        // deleting an already-deleted id still reports it
        let again = db.delete_annotations("anno_test", &[1]).unwrap();
        assert_eq!(again, Some(vec![1]));

        // nothing found is distinguishable from nothing requested
        assert_eq!(db.delete_annotations("anno_test", &[999]).unwrap(), None);
        assert_eq!(
            db.delete_annotations("anno_test", &[]).unwrap(),
            Some(vec![])
        );
    }

    #[test]
    fn test_delete_does_not_clear_superseded_link() {
        let (_temp, db) = test_db_with_table("anno_test");
        db.insert_annotations("anno_test", &[sample_synapse()])
            .unwrap();
        let update: Record = json!({"id": 1, "size": 3})
            .as_object()
            .unwrap()
            .clone();
        db.update_annotation("anno_test", &update).unwrap();

        db.delete_annotations("anno_test", &[1, 2]).unwrap();
        let rows = db.get_annotations("anno_test", &[1, 2]).unwrap();
        assert_eq!(row_state(&rows[0]), RowState::Superseded { by: 2 });
        assert_eq!(row_state(&rows[1]), RowState::Deleted);
    }

    #[test]
    fn test_get_missing_ids() {
        let (_temp, db) = test_db_with_table("anno_test");
        db.insert_annotations("anno_test", &[sample_synapse()])
            .unwrap();

        // partial hits return what exists
        let rows = db.get_annotations("anno_test", &[1, 42]).unwrap();
        assert_eq!(rows.len(), 1);

        // all misses fail not-found
        let err = db.get_annotations("anno_test", &[41, 42]).unwrap_err();
        assert!(matches!(err, Error::NoAnnotationsFound(ids) if ids == [41, 42]));
    }

    #[test]
    fn test_row_count_filters() {
        let (_temp, db) = test_db_with_table("anno_test");
        db.insert_annotations("anno_test", &[sample_synapse(), sample_synapse()])
            .unwrap();
        db.delete_annotations("anno_test", &[1]).unwrap();

        assert_eq!(db.table_row_count("anno_test", false, None).unwrap(), 2);
        assert_eq!(db.table_row_count("anno_test", true, None).unwrap(), 1);
        assert_eq!(
            db.table_row_count("anno_test", false, Some(Utc::now())).unwrap(),
            2
        );
        assert_eq!(db.min_annotation_id("anno_test").unwrap(), Some(1));
        assert_eq!(db.max_annotation_id("anno_test").unwrap(), Some(2));
    }
}
