//! Database schema definitions

/// SQL to create the cityobject table
pub const CREATE_CITYOBJECT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cityobject (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    gmlid TEXT,
    gmlid_codespace TEXT,
    objectclass TEXT NOT NULL,
    kind TEXT NOT NULL,
    parent_id INTEGER,
    root_id INTEGER,
    workspace TEXT NOT NULL DEFAULT 'LIVE',
    import_file TEXT,
    creation_date TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

/// SQL to create the surface_geometry table
///
/// Geometry trees are stored flat: `parent_id` links a node to its aggregate,
/// `root_id` to the top node of the tree. XLink placeholders carry
/// `is_xlink = 1` and the referenced `gml:id` in `xlink_href` until resolved.
pub const CREATE_SURFACE_GEOMETRY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS surface_geometry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    gmlid TEXT,
    parent_id INTEGER,
    root_id INTEGER,
    cityobject_id INTEGER,
    geometry_type TEXT NOT NULL,
    role TEXT,
    dimension INTEGER NOT NULL DEFAULT 3,
    coordinates TEXT,
    is_xlink INTEGER NOT NULL DEFAULT 0,
    xlink_href TEXT,
    xlink_ref_id INTEGER
)
"#;

/// SQL to create the cityobject_reference table
/// Holds feature-to-feature links such as group members
pub const CREATE_CITYOBJECT_REFERENCE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cityobject_reference (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cityobject_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    target_gmlid TEXT NOT NULL,
    target_id INTEGER
)
"#;

pub const CREATE_WORKSPACE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS database_workspace (
    name TEXT PRIMARY KEY,
    created TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

pub const SEED_DEFAULT_WORKSPACE: &str = "INSERT OR IGNORE INTO database_workspace (name) VALUES ('LIVE')";

/// Groups of indexes that can be switched off around a bulk load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Geometry indexes
    Spatial,
    /// Attribute indexes on features and references
    Normal,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Spatial => "spatial",
            IndexKind::Normal => "normal",
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    pub kind: IndexKind,
}

impl IndexDef {
    pub fn create_statement(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            self.name, self.table, self.column
        )
    }
}

pub const INDEXES: &[IndexDef] = &[
    IndexDef { name: "idx_surface_geometry_root", table: "surface_geometry", column: "root_id", kind: IndexKind::Spatial },
    IndexDef { name: "idx_surface_geometry_parent", table: "surface_geometry", column: "parent_id", kind: IndexKind::Spatial },
    IndexDef { name: "idx_surface_geometry_cityobject", table: "surface_geometry", column: "cityobject_id", kind: IndexKind::Spatial },
    IndexDef { name: "idx_surface_geometry_gmlid", table: "surface_geometry", column: "gmlid", kind: IndexKind::Spatial },
    IndexDef { name: "idx_cityobject_gmlid", table: "cityobject", column: "gmlid", kind: IndexKind::Normal },
    IndexDef { name: "idx_cityobject_objectclass", table: "cityobject", column: "objectclass", kind: IndexKind::Normal },
    IndexDef { name: "idx_cityobject_root", table: "cityobject", column: "root_id", kind: IndexKind::Normal },
    IndexDef { name: "idx_cityobject_reference_source", table: "cityobject_reference", column: "cityobject_id", kind: IndexKind::Normal },
];

pub fn indexes_of(kind: IndexKind) -> impl Iterator<Item = &'static IndexDef> {
    INDEXES.iter().filter(move |def| def.kind == kind)
}

/// Table creation statements, safe to run on every connection
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_CITYOBJECT_TABLE,
        CREATE_SURFACE_GEOMETRY_TABLE,
        CREATE_CITYOBJECT_REFERENCE_TABLE,
        CREATE_WORKSPACE_TABLE,
    ]
}

/// Statements run only when the database is first created, so that
/// deactivated indexes stay dropped for later connections
pub fn initial_statements() -> Vec<String> {
    let mut stmts = vec![SEED_DEFAULT_WORKSPACE.to_string()];
    stmts.extend(INDEXES.iter().map(IndexDef::create_statement));
    stmts
}
