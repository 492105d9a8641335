pub const SCHEMA: &str = r#"
-- Catalog of every dynamically created annotation table
CREATE TABLE IF NOT EXISTS annotation_table_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL UNIQUE,
    schema_type TEXT NOT NULL,
    description TEXT NOT NULL,
    user_id TEXT NOT NULL,

    -- Physical unit of stored points (typically nm per voxel)
    voxel_resolution_x REAL NOT NULL,
    voxel_resolution_y REAL NOT NULL,
    voxel_resolution_z REAL NOT NULL,

    -- Logical attachment to another annotation table (reference schemas only)
    reference_table TEXT,
    flat_segmentation_source TEXT,

    -- Stored for callers, not enforced here
    read_permission TEXT NOT NULL DEFAULT 'PUBLIC',
    write_permission TEXT NOT NULL DEFAULT 'PRIVATE',
    notice_text TEXT,

    valid INTEGER NOT NULL DEFAULT 1,
    created TEXT NOT NULL,
    deleted TEXT,            -- soft delete; the physical table is kept
    last_modified TEXT NOT NULL
);

-- Catalog of segmentation tables, at most one per
-- (annotation table, pcg table) pair
CREATE TABLE IF NOT EXISTS segmentation_table_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL UNIQUE,
    schema_type TEXT NOT NULL,
    annotation_table TEXT NOT NULL REFERENCES annotation_table_metadata(table_name),
    pcg_table_name TEXT NOT NULL,
    valid INTEGER NOT NULL DEFAULT 1,
    created TEXT NOT NULL,
    deleted TEXT,
    last_updated TEXT,

    UNIQUE(annotation_table, pcg_table_name)
);

CREATE INDEX IF NOT EXISTS idx_anno_metadata_schema ON annotation_table_metadata(schema_type);
CREATE INDEX IF NOT EXISTS idx_seg_metadata_anno_table ON segmentation_table_metadata(annotation_table);
"#;
