use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use annodb::Record;
use annodb::schema::MemoryCatalog;
use annodb::store::AnnotationDb;
use annodb::types::{NewAnnotationTable, Permission, VoxelResolution};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_db() -> (TempDir, AnnotationDb) {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let db = AnnotationDb::new(
        temp.path().join("annodb.db"),
        Arc::new(MemoryCatalog::with_defaults()),
    )
    .unwrap();
    db.initialize().unwrap();
    (temp, db)
}

pub fn synapse_table(name: &str) -> NewAnnotationTable {
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

pub fn synapse_record() -> Record {
    json!({
        "pre_pt": {"position": [121, 123, 1232]},
        "ctr_pt": {"position": [121, 123, 1232]},
        "post_pt": {"position": [333, 555, 5555]},
        "size": 1
    })
    .as_object()
    .unwrap()
    .clone()
}

pub fn synapse_record_linked() -> Record {
    json!({
        "pre_pt": {"position": [121, 123, 1232], "supervoxel_id": 2344444, "root_id": 4},
        "ctr_pt": {"position": [121, 123, 1232]},
        "post_pt": {"position": [333, 555, 5555], "supervoxel_id": 3929, "root_id": 5},
        "size": 1
    })
    .as_object()
    .unwrap()
    .clone()
}
