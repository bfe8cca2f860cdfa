//! Declarative tenant schema: tables, indexes and seed rows applied to every tenant database.

use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub seeds: Vec<SeedRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Raw SQL default expression, e.g. `NOW()` or `'page'`.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub references: Option<ForeignKeyDef>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub on_delete: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// One default row, inserted with `ON CONFLICT (conflict_columns) DO NOTHING`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedRow {
    pub table: String,
    pub conflict_columns: Vec<String>,
    pub values: Map<String, Value>,
}

const IDENTIFIER_PATTERN: &str = r"^[a-z_][a-z0-9_]{0,62}$";

fn check_ident(kind: &str, name: &str) -> Result<(), ConfigError> {
    let re = Regex::new(IDENTIFIER_PATTERN).map_err(|e| ConfigError::Schema(e.to_string()))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::Schema(format!("invalid {} name: {:?}", kind, name)))
    }
}

impl SchemaDefinition {
    /// Referential checks: every key, index and seed names existing tables and columns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut table_names = HashSet::new();
        for t in &self.tables {
            check_ident("table", &t.name)?;
            if !table_names.insert(t.name.as_str()) {
                return Err(ConfigError::Schema(format!("duplicate table: {}", t.name)));
            }
            if t.columns.is_empty() {
                return Err(ConfigError::Schema(format!("table {} has no columns", t.name)));
            }
            if t.primary_key.is_empty() {
                return Err(ConfigError::Schema(format!("table {} has no primary key", t.name)));
            }
            let cols: HashSet<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
            for c in &t.columns {
                check_ident("column", &c.name)?;
            }
            for key_col in t.primary_key.iter().chain(t.unique.iter().flatten()) {
                if !cols.contains(key_col.as_str()) {
                    return Err(ConfigError::Schema(format!(
                        "table {} key references unknown column {}",
                        t.name, key_col
                    )));
                }
            }
        }

        for t in &self.tables {
            for c in &t.columns {
                if let Some(fk) = &c.references {
                    let target = self.table(&fk.table).ok_or_else(|| {
                        ConfigError::Schema(format!("{}.{} references unknown table {}", t.name, c.name, fk.table))
                    })?;
                    if !target.has_column(&fk.column) {
                        return Err(ConfigError::Schema(format!(
                            "{}.{} references unknown column {}.{}",
                            t.name, c.name, fk.table, fk.column
                        )));
                    }
                }
            }
        }

        for idx in &self.indexes {
            check_ident("index", &idx.name)?;
            let table = self
                .table(&idx.table)
                .ok_or_else(|| ConfigError::Schema(format!("index {} on unknown table {}", idx.name, idx.table)))?;
            if idx.columns.is_empty() || idx.columns.iter().any(|c| !table.has_column(c)) {
                return Err(ConfigError::Schema(format!("index {} has invalid columns", idx.name)));
            }
        }

        for seed in &self.seeds {
            let table = self
                .table(&seed.table)
                .ok_or_else(|| ConfigError::Schema(format!("seed for unknown table {}", seed.table)))?;
            if seed.conflict_columns.is_empty() {
                return Err(ConfigError::Schema(format!(
                    "seed for {} needs conflict columns to be idempotent",
                    seed.table
                )));
            }
            let is_key = table.primary_key == seed.conflict_columns
                || table.unique.iter().any(|u| *u == seed.conflict_columns);
            if !is_key {
                return Err(ConfigError::Schema(format!(
                    "seed conflict columns {:?} are not a key of {}",
                    seed.conflict_columns, seed.table
                )));
            }
            for col in seed.values.keys().chain(seed.conflict_columns.iter()) {
                if !table.has_column(col) {
                    return Err(ConfigError::Schema(format!("seed for {} sets unknown column {}", seed.table, col)));
                }
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables every Sonicus tenant database carries.
    pub fn platform_default() -> Self {
        let ts = |name: &str| ColumnDef::new(name, "TIMESTAMPTZ").not_null().default_expr("NOW()");
        let uuid_pk = || ColumnDef::new("id", "UUID").not_null().default_expr("gen_random_uuid()");

        let tables = vec![
            TableDef {
                name: "content".into(),
                columns: vec![
                    uuid_pk(),
                    ColumnDef::new("slug", "TEXT").not_null(),
                    ColumnDef::new("title", "TEXT").not_null(),
                    ColumnDef::new("body", "TEXT"),
                    ColumnDef::new("content_type", "TEXT").not_null().default_expr("'page'"),
                    ColumnDef::new("is_published", "BOOLEAN").not_null().default_expr("TRUE"),
                    ts("created_at"),
                    ts("updated_at"),
                ],
                primary_key: vec!["id".into()],
                unique: vec![vec!["slug".into()]],
            },
            TableDef {
                name: "sound_packages".into(),
                columns: vec![
                    uuid_pk(),
                    ColumnDef::new("name", "TEXT").not_null(),
                    ColumnDef::new("description", "TEXT"),
                    ColumnDef::new("category", "TEXT"),
                    ColumnDef::new("is_active", "BOOLEAN").not_null().default_expr("TRUE"),
                    ts("created_at"),
                    ts("updated_at"),
                ],
                primary_key: vec!["id".into()],
                unique: vec![],
            },
            TableDef {
                name: "sounds".into(),
                columns: vec![
                    uuid_pk(),
                    ColumnDef::new("package_id", "UUID")
                        .not_null()
                        .references("sound_packages", "id", Some("CASCADE")),
                    ColumnDef::new("title", "TEXT").not_null(),
                    ColumnDef::new("file_url", "TEXT").not_null(),
                    ColumnDef::new("duration_seconds", "INTEGER"),
                    ColumnDef::new("tags", "JSONB").not_null().default_expr("'[]'::jsonb"),
                    ts("created_at"),
                ],
                primary_key: vec!["id".into()],
                unique: vec![],
            },
            TableDef {
                name: "user_sessions".into(),
                columns: vec![
                    uuid_pk(),
                    ColumnDef::new("user_id", "BIGINT").not_null(),
                    ColumnDef::new("sound_id", "UUID").references("sounds", "id", Some("SET NULL")),
                    ts("started_at"),
                    ColumnDef::new("ended_at", "TIMESTAMPTZ"),
                    ColumnDef::new("duration_seconds", "INTEGER"),
                ],
                primary_key: vec!["id".into()],
                unique: vec![],
            },
            TableDef {
                name: "analytics_events".into(),
                columns: vec![
                    ColumnDef::new("id", "BIGSERIAL").not_null(),
                    ColumnDef::new("user_id", "BIGINT"),
                    ColumnDef::new("event_type", "TEXT").not_null(),
                    ColumnDef::new("payload", "JSONB").not_null().default_expr("'{}'::jsonb"),
                    ts("occurred_at"),
                ],
                primary_key: vec!["id".into()],
                unique: vec![],
            },
        ];

        let indexes = vec![
            IndexDef {
                name: "idx_sounds_package_id".into(),
                table: "sounds".into(),
                columns: vec!["package_id".into()],
                unique: false,
            },
            IndexDef {
                name: "idx_user_sessions_user_id".into(),
                table: "user_sessions".into(),
                columns: vec!["user_id".into()],
                unique: false,
            },
            IndexDef {
                name: "idx_analytics_events_type_time".into(),
                table: "analytics_events".into(),
                columns: vec!["event_type".into(), "occurred_at".into()],
                unique: false,
            },
        ];

        let welcome = json!({
            "slug": "welcome",
            "title": "Welcome to Sonicus",
            "body": "Your organization's sound library is ready. Start by creating a sound package.",
            "content_type": "page",
        });
        let seeds = vec![SeedRow {
            table: "content".into(),
            conflict_columns: vec!["slug".into()],
            values: welcome.as_object().cloned().unwrap_or_default(),
        }];

        SchemaDefinition { tables, indexes, seeds }
    }
}

impl TableDef {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

impl ColumnDef {
    pub fn new(name: &str, type_: &str) -> Self {
        ColumnDef {
            name: name.into(),
            type_: type_.into(),
            nullable: true,
            default: None,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_expr(mut self, expression: &str) -> Self {
        self.default = Some(expression.into());
        self
    }

    pub fn references(mut self, table: &str, column: &str, on_delete: Option<&str>) -> Self {
        self.references = Some(ForeignKeyDef {
            table: table.into(),
            column: column.into(),
            on_delete: on_delete.map(String::from),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_default_is_valid() {
        SchemaDefinition::platform_default().validate().unwrap();
    }

    #[test]
    fn seed_without_key_conflict_target_is_rejected() {
        let mut schema = SchemaDefinition::platform_default();
        schema.seeds[0].conflict_columns = vec!["title".into()];
        assert!(schema.validate().is_err());
    }

    #[test]
    fn foreign_key_to_unknown_table_is_rejected() {
        let mut schema = SchemaDefinition::platform_default();
        schema.tables[2].columns[1] = ColumnDef::new("package_id", "UUID").references("packages", "id", None);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        let mut schema = SchemaDefinition::platform_default();
        schema.tables[0].name = "content; DROP TABLE users".into();
        assert!(schema.validate().is_err());
    }

    #[test]
    fn json_defaults_apply() {
        let raw = r#"{
            "tables": [{"name": "t", "primary_key": ["id"], "columns": [{"name": "id", "type": "UUID"}]}]
        }"#;
        let schema: SchemaDefinition = serde_json::from_str(raw).unwrap();
        assert!(schema.tables[0].columns[0].nullable);
        assert!(schema.indexes.is_empty());
        assert!(schema.seeds.is_empty());
        schema.validate().unwrap();
    }
}
