use serde_json::{Map, Value};

use super::{Column, FieldSet, FieldType};

/// Dynamic record: field name to JSON value. Nested form holds point fields
/// as objects (`{"position": [x, y, z], "supervoxel_id": n, "root_id": n}`);
/// flat form holds one key per physical column.
pub type Record = Map<String, Value>;

/// Expands nested point fields into flat `<parent>_<child>` columns and
/// drops any key the schema does not declare.
pub fn flatten_record(fields: &FieldSet, record: &Record) -> Record {
    let mut flat = Record::new();
    if fields.is_reference
        && let Some(target) = record.get("target_id")
    {
        flat.insert("target_id".to_string(), target.clone());
    }
    for field in &fields.fields {
        match field.field_type {
            FieldType::BoundPoint | FieldType::Point => {
                let Some(Value::Object(point)) = record.get(&field.name) else {
                    continue;
                };
                if let Some(position) = point.get("position") {
                    flat.insert(format!("{}_position", field.name), position.clone());
                }
                if field.field_type == FieldType::BoundPoint {
                    if let Some(sv) = point.get("supervoxel_id") {
                        flat.insert(format!("{}_supervoxel_id", field.name), sv.clone());
                    }
                    if let Some(root) = point.get("root_id") {
                        flat.insert(format!("{}_root_id", field.name), root.clone());
                    }
                }
            }
            _ => {
                if let Some(value) = record.get(&field.name) {
                    flat.insert(field.name.clone(), value.clone());
                }
            }
        }
    }
    flat
}

/// Flattens a record and routes each column to the annotation or the
/// segmentation relation.
pub fn split_record(fields: &FieldSet, record: &Record) -> (Record, Record) {
    let flat = flatten_record(fields, record);
    let seg_names: Vec<String> = fields
        .segmentation_columns()
        .into_iter()
        .map(|c| c.name)
        .collect();

    let mut annotation = Record::new();
    let mut segmentation = Record::new();
    for (key, value) in flat {
        if seg_names.contains(&key) {
            segmentation.insert(key, value);
        } else {
            annotation.insert(key, value);
        }
    }
    (annotation, segmentation)
}

/// Inverse of [`flatten_record`]: reassembles point objects from their flat
/// columns. Keys outside the schema (id, crud columns, target_id) pass
/// through untouched.
pub fn unflatten_record(fields: &FieldSet, flat: &Record) -> Record {
    let mut nested = Record::new();
    let mut consumed: Vec<String> = Vec::new();

    for field in &fields.fields {
        match field.field_type {
            FieldType::BoundPoint | FieldType::Point => {
                let mut point = Record::new();
                let position_key = format!("{}_position", field.name);
                if let Some(position) = flat.get(&position_key) {
                    point.insert("position".to_string(), position.clone());
                    consumed.push(position_key);
                }
                if field.field_type == FieldType::BoundPoint {
                    let sv_key = format!("{}_supervoxel_id", field.name);
                    if let Some(sv) = flat.get(&sv_key)
                        && !sv.is_null()
                    {
                        point.insert("supervoxel_id".to_string(), sv.clone());
                    }
                    consumed.push(sv_key);
                    let root_key = format!("{}_root_id", field.name);
                    if let Some(root) = flat.get(&root_key)
                        && !root.is_null()
                    {
                        point.insert("root_id".to_string(), root.clone());
                    }
                    consumed.push(root_key);
                }
                if !point.is_empty() {
                    nested.insert(field.name.clone(), Value::Object(point));
                }
            }
            _ => {
                if let Some(value) = flat.get(&field.name) {
                    nested.insert(field.name.clone(), value.clone());
                    consumed.push(field.name.clone());
                }
            }
        }
    }

    for (key, value) in flat {
        if !consumed.contains(key) && !nested.contains_key(key) {
            nested.insert(key.clone(), value.clone());
        }
    }
    nested
}

/// Projects a flat record down to the given column set, silently dropping
/// unknown keys.
pub fn project_columns(columns: &[Column], flat: &Record) -> Record {
    let mut projected = Record::new();
    for column in columns {
        if let Some(value) = flat.get(&column.name) {
            projected.insert(column.name.clone(), value.clone());
        }
    }
    projected
}
