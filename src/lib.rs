//! # annodb
//!
//! A versioned annotation table layer over SQLite, usable as an embedded
//! library. Callers define annotation tables dynamically from named schema
//! types; rows evolve through an append-only supersede chain with soft
//! deletes, optionally paired with a segmentation table keyed to an
//! external supervoxel/root-id space.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use annodb::schema::MemoryCatalog;
//! use annodb::store::AnnotationDb;
//! use annodb::types::{NewAnnotationTable, Permission, VoxelResolution};
//!
//! let db = AnnotationDb::new("./data/annodb.db", Arc::new(MemoryCatalog::with_defaults()))?;
//! db.initialize()?;
//!
//! db.create_table(&NewAnnotationTable {
//!     table_name: "synapses_v1".into(),
//!     schema_type: "synapse".into(),
//!     description: "proofread synapses".into(),
//!     user_id: "ada@example.com".into(),
//!     voxel_resolution: VoxelResolution { x: 4.0, y: 4.0, z: 40.0 },
//!     reference_table: None,
//!     flat_segmentation_source: None,
//!     read_permission: Permission::Public,
//!     write_permission: Permission::Private,
//!     notice_text: None,
//! })?;
//!
//! let ids = db.insert_annotations("synapses_v1", &records)?;
//! ```

pub mod config;
pub mod error;
pub mod schema;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use schema::Record;
pub use store::AnnotationDb;
