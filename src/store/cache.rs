use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::{Column, FieldSet};

use super::AnnotationDb;
use super::builder::crud_columns;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKind {
    Annotation { reference_table: Option<String> },
    Segmentation {
        annotation_table: String,
        pcg_table_name: String,
    },
}

/// Resolved physical layout of one dynamically created relation.
#[derive(Debug, Clone)]
pub struct TableHandle {
    pub table_name: String,
    pub schema_type: String,
    pub fields: FieldSet,
    pub kind: TableKind,
}

impl TableHandle {
    /// Schema-derived columns of this relation, without id or versioning
    /// columns.
    pub(crate) fn data_columns(&self) -> Vec<Column> {
        match self.kind {
            TableKind::Annotation { .. } => self.fields.annotation_columns(),
            TableKind::Segmentation { .. } => self.fields.segmentation_columns(),
        }
    }

    /// Every stored column except id, in physical order.
    pub(crate) fn stored_columns(&self) -> Vec<Column> {
        let mut columns = self.data_columns();
        if matches!(self.kind, TableKind::Annotation { .. }) {
            columns.extend(crud_columns());
        }
        columns
    }
}

/// Memoizes resolved table layouts, keyed by table name only. Stale entries
/// must be invalidated explicitly when a table is dropped.
pub(crate) struct TableCache {
    tables: HashMap<String, Arc<TableHandle>>,
}

impl TableCache {
    pub(crate) fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, table_name: &str) -> Option<Arc<TableHandle>> {
        self.tables.get(table_name).cloned()
    }

    pub(crate) fn insert(&mut self, handle: Arc<TableHandle>) {
        self.tables.insert(handle.table_name.clone(), handle);
    }

    pub(crate) fn invalidate(&mut self, table_name: &str) {
        self.tables.remove(table_name);
    }
}

impl AnnotationDb {
    /// Resolves a table layout, memoizing the result. Soft-deleted tables
    /// still resolve; deletion hides a table from listings without dropping
    /// its rows.
    pub(crate) fn resolve_table(&self, table_name: &str) -> Result<Arc<TableHandle>> {
        if let Some(handle) = self.cache().get(table_name) {
            return Ok(handle);
        }

        let handle = self.load_table_handle(table_name)?;
        self.cache().insert(handle.clone());
        Ok(handle)
    }

    fn load_table_handle(&self, table_name: &str) -> Result<Arc<TableHandle>> {
        if let Some(metadata) = self.find_annotation_metadata(table_name)? {
            let fields = self.catalog().resolve(&metadata.schema_type)?;
            return Ok(Arc::new(TableHandle {
                table_name: metadata.table_name,
                schema_type: metadata.schema_type,
                fields,
                kind: TableKind::Annotation {
                    reference_table: metadata.reference_table,
                },
            }));
        }

        if let Some(seg) = self.find_segmentation_metadata_by_name(table_name)? {
            let fields = self.catalog().resolve(&seg.schema_type)?;
            return Ok(Arc::new(TableHandle {
                table_name: seg.table_name,
                schema_type: seg.schema_type,
                fields,
                kind: TableKind::Segmentation {
                    annotation_table: seg.annotation_table,
                    pcg_table_name: seg.pcg_table_name,
                },
            }));
        }

        Err(Error::TableNotFound(table_name.to_string()))
    }
}
