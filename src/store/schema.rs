//! Database schema definitions

/// SQL to create the documents table
///
/// Every collection shares this table; `id` gives the natural fetch order.
pub const CREATE_DOCUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    body TEXT NOT NULL
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)",
    "CREATE INDEX IF NOT EXISTS idx_documents_primary_key ON documents(collection, json_extract(body, '$._id'))",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![CREATE_DOCUMENTS_TABLE];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}

/// JSON path addressing a top-level document field
pub fn field_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// `field_path` as a quoted SQL string literal
pub fn path_literal(field: &str) -> String {
    format!("'{}'", field_path(field).replace('\'', "''"))
}
