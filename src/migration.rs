//! Render the tenant schema to idempotent DDL and apply it to a tenant database.
//! Tables are created in foreign-key dependency order.

use crate::config::{IndexDef, SchemaDefinition, SeedRow, TableDef};
use crate::error::TenancyError;
use crate::naming::quote_ident;
use serde_json::Value;
use sqlx::{Connection, PgConnection};
use std::collections::HashSet;

fn quote(s: &str) -> String {
    quote_ident(s)
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'::jsonb", other.to_string().replace('\'', "''")),
    }
}

/// Order tables so every referenced table is created first. Tables in a reference cycle keep
/// their declared order at the end.
pub fn table_apply_order(schema: &SchemaDefinition) -> Vec<&TableDef> {
    let mut order: Vec<&TableDef> = Vec::with_capacity(schema.tables.len());
    let mut done: HashSet<&str> = HashSet::new();
    while order.len() < schema.tables.len() {
        let mut made_progress = false;
        for t in &schema.tables {
            if done.contains(t.name.as_str()) {
                continue;
            }
            let deps_met = t
                .columns
                .iter()
                .filter_map(|c| c.references.as_ref())
                .all(|fk| fk.table == t.name || done.contains(fk.table.as_str()));
            if deps_met {
                order.push(t);
                done.insert(t.name.as_str());
                made_progress = true;
            }
        }
        if !made_progress {
            for t in &schema.tables {
                if done.insert(t.name.as_str()) {
                    order.push(t);
                }
            }
        }
    }
    order
}

pub fn create_table_sql(t: &TableDef) -> String {
    let mut defs: Vec<String> = Vec::new();
    for c in &t.columns {
        let mut def = format!("{} {}", quote(&c.name), c.type_);
        if !c.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(ref d) = c.default {
            def.push_str(" DEFAULT ");
            def.push_str(d);
        }
        if let Some(ref fk) = c.references {
            def.push_str(&format!(" REFERENCES {} ({})", quote(&fk.table), quote(&fk.column)));
            if let Some(ref action) = fk.on_delete {
                def.push_str(&format!(" ON DELETE {}", action.to_uppercase()));
            }
        }
        defs.push(def);
    }
    let pk: Vec<String> = t.primary_key.iter().map(|s| quote(s)).collect();
    defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
    for u in &t.unique {
        let cols: Vec<String> = u.iter().map(|s| quote(s)).collect();
        defs.push(format!("UNIQUE ({})", cols.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        quote(&t.name),
        defs.join(",\n  ")
    )
}

pub fn create_index_sql(idx: &IndexDef) -> String {
    let cols: Vec<String> = idx.columns.iter().map(|s| quote(s)).collect();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if idx.unique { "UNIQUE " } else { "" },
        quote(&idx.name),
        quote(&idx.table),
        cols.join(", ")
    )
}

pub fn seed_sql(seed: &SeedRow) -> String {
    let cols: Vec<String> = seed.values.keys().map(|k| quote(k)).collect();
    let vals: Vec<String> = seed.values.values().map(literal).collect();
    let conflict: Vec<String> = seed.conflict_columns.iter().map(|s| quote(s)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
        quote(&seed.table),
        cols.join(", "),
        vals.join(", "),
        conflict.join(", ")
    )
}

/// All DDL for the schema, tables before indexes.
pub fn schema_statements(schema: &SchemaDefinition) -> Vec<String> {
    let mut out: Vec<String> = table_apply_order(schema)
        .into_iter()
        .map(create_table_sql)
        .collect();
    out.extend(schema.indexes.iter().map(create_index_sql));
    out
}

/// Apply every table and index in one transaction; a failure leaves the database unchanged.
pub async fn apply_schema(conn: &mut PgConnection, schema: &SchemaDefinition) -> Result<usize, TenancyError> {
    schema.validate()?;
    let statements = schema_statements(schema);
    let mut tx = conn.begin().await?;
    for sql in &statements {
        tracing::debug!(sql = %sql, "ddl");
        sqlx::query(sql).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(statements.len())
}

/// Insert seed rows; existing rows are left untouched. Returns rows actually inserted.
pub async fn seed_defaults(conn: &mut PgConnection, schema: &SchemaDefinition) -> Result<u64, TenancyError> {
    let mut inserted = 0u64;
    let mut tx = conn.begin().await?;
    for seed in &schema.seeds {
        let result = sqlx::query(&seed_sql(seed)).execute(&mut *tx).await?;
        inserted += result.rows_affected();
    }
    tx.commit().await?;
    Ok(inserted)
}
