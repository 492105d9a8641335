use std::collections::HashMap;

use crate::error::{Error, Result};

use super::{Field, FieldSet, FieldType};

/// External schema catalog: resolves a schema type name to its field set.
///
/// The catalog is a pure lookup collaborator; annodb never stores schema
/// definitions itself.
pub trait SchemaCatalog: Send + Sync {
    fn resolve(&self, schema_type: &str) -> Result<FieldSet>;
}

/// In-process catalog backed by a map, preloaded with the common EM
/// annotation schema types. Callers can register additional field sets.
pub struct MemoryCatalog {
    schemas: HashMap<String, FieldSet>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.register(FieldSet::new(
            "synapse",
            vec![
                Field::new("pre_pt", FieldType::BoundPoint),
                Field::new("ctr_pt", FieldType::Point),
                Field::new("post_pt", FieldType::BoundPoint),
                Field::new("size", FieldType::Float),
            ],
        ));
        catalog.register(FieldSet::new(
            "cell_type_local",
            vec![
                Field::new("pt", FieldType::BoundPoint),
                Field::new("cell_type", FieldType::Text),
                Field::new("classification_system", FieldType::Text),
            ],
        ));
        catalog.register(FieldSet::new(
            "bound_tag",
            vec![
                Field::new("pt", FieldType::BoundPoint),
                Field::new("tag", FieldType::Text),
            ],
        ));
        catalog.register(FieldSet::new(
            "point_annotation",
            vec![Field::new("pt", FieldType::Point)],
        ));
        catalog.register(FieldSet::reference(
            "presynaptic_bouton_type",
            vec![Field::new("bouton_type", FieldType::Text)],
        ));
        catalog
    }

    pub fn register(&mut self, fields: FieldSet) {
        self.schemas.insert(fields.schema_type.clone(), fields);
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SchemaCatalog for MemoryCatalog {
    fn resolve(&self, schema_type: &str) -> Result<FieldSet> {
        self.schemas
            .get(schema_type)
            .cloned()
            .ok_or_else(|| Error::UnknownSchemaType(schema_type.to_string()))
    }
}
