use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::schema::{Column, ColumnType, FieldSet};

/// Derives the physical name of the segmentation table that pairs an
/// annotation table with one pcg (supervoxel/root id) space. Pure and
/// deterministic: the same inputs always name the same relation.
pub fn segmentation_table_name(annotation_table: &str, pcg_table_name: &str) -> String {
    format!("{annotation_table}__{pcg_table_name}")
}

/// Rejects names that cannot be embedded safely in generated DDL and SQL.
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > 120 {
        return Err(Error::InvalidTableName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn quote_ident(name: &str) -> String {
    // Column names come from caller-registered field sets, so embedded
    // quotes must be doubled rather than trusted.
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// id, created, deleted, valid, superceded_id make up the versioning state
/// of every annotation row; only id lives outside this list because it is
/// the primary key.
pub(crate) fn crud_columns() -> Vec<Column> {
    vec![
        Column::new("created", ColumnType::Timestamp),
        Column::new("deleted", ColumnType::Timestamp),
        Column::new("valid", ColumnType::Boolean),
        Column::new("superceded_id", ColumnType::BigInt),
    ]
}

fn column_ddl(column: &Column) -> String {
    format!("    {} {}", quote_ident(&column.name), column.column_type.sql_type())
}

pub(crate) fn annotation_table_ddl(
    table_name: &str,
    fields: &FieldSet,
    with_crud_columns: bool,
) -> String {
    let mut lines = vec!["    id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
    for column in fields.annotation_columns() {
        lines.push(column_ddl(&column));
    }
    if with_crud_columns {
        lines.push("    created TEXT NOT NULL".to_string());
        lines.push("    deleted TEXT".to_string());
        lines.push("    valid INTEGER NOT NULL DEFAULT 1".to_string());
        lines.push("    superceded_id INTEGER".to_string());
    }
    format!(
        "CREATE TABLE {} (\n{}\n)",
        quote_ident(table_name),
        lines.join(",\n")
    )
}

pub(crate) fn segmentation_table_ddl(
    segmentation_table: &str,
    annotation_table: &str,
    fields: &FieldSet,
) -> Option<String> {
    let columns = fields.segmentation_columns();
    if columns.is_empty() {
        return None;
    }
    // The id is simultaneously the primary key and a foreign key to the
    // annotation row it annotates.
    let mut lines = vec![format!(
        "    id INTEGER PRIMARY KEY REFERENCES {}(id)",
        quote_ident(annotation_table)
    )];
    for column in &columns {
        lines.push(column_ddl(column));
    }
    Some(format!(
        "CREATE TABLE {} (\n{}\n)",
        quote_ident(segmentation_table),
        lines.join(",\n")
    ))
}

pub(crate) fn create_annotation_table(
    conn: &Connection,
    table_name: &str,
    fields: &FieldSet,
    with_crud_columns: bool,
) -> Result<()> {
    validate_table_name(table_name)?;
    conn.execute(&annotation_table_ddl(table_name, fields, with_crud_columns), [])?;
    for column in fields.annotation_columns() {
        if column.column_type == ColumnType::Geometry {
            conn.execute(
                &format!(
                    "CREATE INDEX {} ON {}({})",
                    quote_ident(&format!("idx_{table_name}_{}", column.name)),
                    quote_ident(table_name),
                    quote_ident(&column.name)
                ),
                [],
            )?;
        }
    }
    tracing::info!(table = table_name, schema = %fields.schema_type, "created annotation table");
    Ok(())
}

/// Creates the companion segmentation table, or returns `None` when the
/// schema has no segmentation fields.
pub(crate) fn create_segmentation_table(
    conn: &Connection,
    annotation_table: &str,
    pcg_table_name: &str,
    fields: &FieldSet,
) -> Result<Option<String>> {
    validate_table_name(pcg_table_name)?;
    let segmentation_table = segmentation_table_name(annotation_table, pcg_table_name);
    validate_table_name(&segmentation_table)?;

    let Some(ddl) = segmentation_table_ddl(&segmentation_table, annotation_table, fields) else {
        return Ok(None);
    };
    conn.execute(&ddl, [])?;
    tracing::info!(table = %segmentation_table, "created segmentation table");
    Ok(Some(segmentation_table))
}

pub(crate) fn drop_physical_table(conn: &Connection, table_name: &str) -> Result<()> {
    validate_table_name(table_name)?;
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table_name)), [])?;
    Ok(())
}
