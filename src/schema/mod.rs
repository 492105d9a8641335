//! Schema resolution: maps a schema type name to a typed field set and
//! derives the flat column layout of its annotation and segmentation
//! relations.

mod catalog;
mod flatten;

pub use catalog::{MemoryCatalog, SchemaCatalog};
pub use flatten::{Record, flatten_record, project_columns, split_record, unflatten_record};

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// A 3D point bound to the segmentation: contributes a position column
    /// to the annotation relation and supervoxel/root id columns to the
    /// segmentation relation.
    BoundPoint,
    /// A free 3D point with no segmentation binding.
    Point,
    Integer,
    Float,
    Text,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
        }
    }
}

/// Resolved definition of a schema type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    pub schema_type: String,
    pub fields: Vec<Field>,
    /// Reference schemas attach their rows to another annotation table via
    /// a `target_id` column; only they may declare a reference table.
    pub is_reference: bool,
}

impl FieldSet {
    pub fn new(schema_type: &str, fields: Vec<Field>) -> Self {
        Self {
            schema_type: schema_type.to_string(),
            fields,
            is_reference: false,
        }
    }

    pub fn reference(schema_type: &str, fields: Vec<Field>) -> Self {
        Self {
            schema_type: schema_type.to_string(),
            fields,
            is_reference: true,
        }
    }

    /// A schema needs a companion segmentation relation iff it carries at
    /// least one field tied to the segmentation id space.
    pub fn requires_segmentation(&self) -> bool {
        self.fields
            .iter()
            .any(|f| f.field_type == FieldType::BoundPoint)
    }

    pub fn annotation_columns(&self) -> Vec<Column> {
        let mut columns = Vec::new();
        if self.is_reference {
            columns.push(Column::new("target_id", ColumnType::BigInt));
        }
        for field in &self.fields {
            match field.field_type {
                FieldType::BoundPoint | FieldType::Point => {
                    columns.push(Column::new(
                        &format!("{}_position", field.name),
                        ColumnType::Geometry,
                    ));
                }
                FieldType::Integer => {
                    columns.push(Column::new(&field.name, ColumnType::Integer));
                }
                FieldType::Float => columns.push(Column::new(&field.name, ColumnType::Float)),
                FieldType::Text => columns.push(Column::new(&field.name, ColumnType::Text)),
                FieldType::Boolean => columns.push(Column::new(&field.name, ColumnType::Boolean)),
            }
        }
        columns
    }

    pub fn segmentation_columns(&self) -> Vec<Column> {
        let mut columns = Vec::new();
        for field in &self.fields {
            if field.field_type == FieldType::BoundPoint {
                columns.push(Column::new(
                    &format!("{}_supervoxel_id", field.name),
                    ColumnType::BigInt,
                ));
                columns.push(Column::new(
                    &format!("{}_root_id", field.name),
                    ColumnType::BigInt,
                ));
            }
        }
        columns
    }
}

/// Storage type of one flattened column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    Float,
    Text,
    Boolean,
    Timestamp,
    /// Spatial point, persisted as a JSON `[x, y, z]` text value. SQLite has
    /// no native geometry type, so this is the portable encoding.
    Geometry,
}

impl ColumnType {
    pub const fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::BigInt => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text | ColumnType::Timestamp | ColumnType::Geometry => "TEXT",
            ColumnType::Boolean => "INTEGER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synapse() -> FieldSet {
        FieldSet::new(
            "synapse",
            vec![
                Field::new("pre_pt", FieldType::BoundPoint),
                Field::new("ctr_pt", FieldType::Point),
                Field::new("post_pt", FieldType::BoundPoint),
                Field::new("size", FieldType::Float),
            ],
        )
    }

    #[test]
    fn test_annotation_columns() {
        let names: Vec<_> = synapse()
            .annotation_columns()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(
            names,
            ["pre_pt_position", "ctr_pt_position", "post_pt_position", "size"]
        );
    }

    #[test]
    fn test_segmentation_columns_skip_unbound_points() {
        let names: Vec<_> = synapse()
            .segmentation_columns()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(
            names,
            [
                "pre_pt_supervoxel_id",
                "pre_pt_root_id",
                "post_pt_supervoxel_id",
                "post_pt_root_id"
            ]
        );
        assert!(synapse().requires_segmentation());
    }

    #[test]
    fn test_reference_schema_adds_target_id() {
        let fields = FieldSet::reference("bouton_type", vec![Field::new("tag", FieldType::Text)]);
        let names: Vec<_> = fields
            .annotation_columns()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["target_id", "tag"]);
        assert!(!fields.requires_segmentation());
    }
}
