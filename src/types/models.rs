use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Permission;

/// Physical unit of every point stored in an annotation table, typically
/// nanometers per voxel along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelResolution {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationTableMetadata {
    pub id: i64,
    pub table_name: String,
    pub schema_type: String,
    pub description: String,
    pub user_id: String,
    pub voxel_resolution: VoxelResolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flat_segmentation_source: Option<String>,
    pub read_permission: Permission,
    pub write_permission: Permission,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice_text: Option<String>,
    pub valid: bool,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationTableMetadata {
    pub id: i64,
    pub table_name: String,
    pub schema_type: String,
    pub annotation_table: String,
    pub pcg_table_name: String,
    pub valid: bool,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Parameters for creating a new annotation table.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAnnotationTable {
    pub table_name: String,
    pub schema_type: String,
    pub description: String,
    pub user_id: String,
    pub voxel_resolution: VoxelResolution,
    #[serde(default)]
    pub reference_table: Option<String>,
    #[serde(default)]
    pub flat_segmentation_source: Option<String>,
    #[serde(default = "default_read_permission")]
    pub read_permission: Permission,
    #[serde(default = "default_write_permission")]
    pub write_permission: Permission,
    #[serde(default)]
    pub notice_text: Option<String>,
}

fn default_read_permission() -> Permission {
    Permission::Public
}

fn default_write_permission() -> Permission {
    Permission::Private
}

/// Partial update of annotation table metadata. `None` fields are left
/// untouched; an empty `notice_text` clears the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataUpdate {
    pub description: Option<String>,
    pub user_id: Option<String>,
    pub flat_segmentation_source: Option<String>,
    pub read_permission: Option<Permission>,
    pub write_permission: Option<Permission>,
    pub notice_text: Option<String>,
}

/// Lifecycle state of one physical annotation row, derived from its
/// `valid`, `deleted` and `superceded_id` columns.
///
/// A logical annotation is a chain of physical rows: exactly one head stays
/// `Active`, every replaced row is `Superseded` pointing at its successor,
/// and a soft delete leaves the row `Deleted` with no successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Active,
    Superseded { by: i64 },
    Deleted,
}

impl RowState {
    pub fn from_columns(valid: bool, deleted: Option<DateTime<Utc>>, superceded_id: Option<i64>) -> Self {
        match (valid, deleted, superceded_id) {
            (_, _, Some(by)) => RowState::Superseded { by },
            (false, Some(_), None) => RowState::Deleted,
            _ => RowState::Active,
        }
    }

    pub const fn is_head(self) -> bool {
        matches!(self, RowState::Active)
    }
}
