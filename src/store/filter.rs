//! Typed filter expressions for similarity search.
//!
//! Callers describe chunk predicates as data; the builder compiles the
//! conjunction into a parameterized WHERE fragment. Caller-supplied keys and
//! values only ever travel as bind parameters, never as SQL text.

use super::DocumentStatus;
use crate::error::{KildeError, Result};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

/// A single predicate over a chunk and its parent document. Filters on a
/// search are conjunctive: every predicate must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChunkFilter {
    /// Chunk metadata value at `key` equals `value` (scalar JSON values).
    MetadataEquals {
        key: String,
        value: serde_json::Value,
    },
    /// Chunk metadata array at `key` contains the string `value`.
    MetadataContains { key: String, value: String },
    /// Parent document has the given status.
    DocumentStatus { status: DocumentStatus },
}

/// A compiled WHERE fragment plus its bind parameters, in order.
#[derive(Debug)]
pub(crate) struct FilterClause {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Compile scope and filters into one WHERE clause.
///
/// The collection scope is the authorization boundary and always present as
/// a hard predicate; chunks without an embedding are excluded
/// unconditionally. An empty scope matches nothing.
pub(crate) fn compile(scope: &[String], filters: &[ChunkFilter]) -> Result<FilterClause> {
    let mut conditions = vec!["c.embedding IS NOT NULL".to_string()];
    let mut params: Vec<Value> = Vec::new();

    let placeholders = vec!["?"; scope.len()].join(", ");
    conditions.push(format!("d.collection_id IN ({})", placeholders));
    for id in scope {
        params.push(Value::Text(id.clone()));
    }

    for filter in filters {
        match filter {
            ChunkFilter::MetadataEquals { key, value } => {
                let bound = scalar_to_value(value)?;
                match bound {
                    Value::Null => {
                        conditions.push(
                            "json_extract(c.metadata_json, '$.' || ?) IS NULL".to_string(),
                        );
                        params.push(Value::Text(key.clone()));
                    }
                    bound => {
                        conditions
                            .push("json_extract(c.metadata_json, '$.' || ?) = ?".to_string());
                        params.push(Value::Text(key.clone()));
                        params.push(bound);
                    }
                }
            }
            ChunkFilter::MetadataContains { key, value } => {
                conditions.push(
                    "EXISTS (SELECT 1 FROM json_each(c.metadata_json, '$.' || ?) je \
                     WHERE je.value = ?)"
                        .to_string(),
                );
                params.push(Value::Text(key.clone()));
                params.push(Value::Text(value.clone()));
            }
            ChunkFilter::DocumentStatus { status } => {
                conditions.push("d.status = ?".to_string());
                params.push(Value::Text(status.as_str().to_string()));
            }
        }
    }

    Ok(FilterClause {
        sql: conditions.join(" AND "),
        params,
    })
}

/// JSON booleans come back from json_extract as 0/1, so bind them that way.
/// Arrays and objects are not valid equality operands.
fn scalar_to_value(value: &serde_json::Value) -> Result<Value> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Integer(*b as i64)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else {
                Ok(Value::Real(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        other => Err(KildeError::Validation(format!(
            "Metadata equality filters require a scalar value, got: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_only() {
        let clause = compile(&["col-1".to_string(), "col-2".to_string()], &[]).unwrap();
        assert_eq!(
            clause.sql,
            "c.embedding IS NOT NULL AND d.collection_id IN (?, ?)"
        );
        assert_eq!(clause.params.len(), 2);
    }

    #[test]
    fn test_empty_scope_matches_nothing() {
        let clause = compile(&[], &[]).unwrap();
        assert!(clause.sql.contains("d.collection_id IN ()"));
        assert!(clause.params.is_empty());
    }

    #[test]
    fn test_metadata_equals_string() {
        let filters = vec![ChunkFilter::MetadataEquals {
            key: "lang".to_string(),
            value: json!("en"),
        }];
        let clause = compile(&["c".to_string()], &filters).unwrap();
        assert!(clause
            .sql
            .contains("json_extract(c.metadata_json, '$.' || ?) = ?"));
        assert_eq!(clause.params.len(), 3);
    }

    #[test]
    fn test_metadata_equals_bool_binds_integer() {
        let filters = vec![ChunkFilter::MetadataEquals {
            key: "published".to_string(),
            value: json!(true),
        }];
        let clause = compile(&["c".to_string()], &filters).unwrap();
        assert!(matches!(clause.params[2], Value::Integer(1)));
    }

    #[test]
    fn test_object_value_rejected() {
        let filters = vec![ChunkFilter::MetadataEquals {
            key: "meta".to_string(),
            value: json!({"nested": 1}),
        }];
        assert!(compile(&["c".to_string()], &filters).is_err());
    }

    #[test]
    fn test_injection_attempt_stays_parameterized() {
        let hostile = "x'; DROP TABLE document_chunks; --".to_string();
        let filters = vec![ChunkFilter::MetadataEquals {
            key: hostile.clone(),
            value: json!(hostile.clone()),
        }];
        let clause = compile(&[hostile.clone()], &filters).unwrap();
        // Hostile text never appears in the SQL, only in the bind list.
        assert!(!clause.sql.contains("DROP TABLE"));
        assert_eq!(
            clause
                .params
                .iter()
                .filter(|p| matches!(p, Value::Text(t) if t.contains("DROP TABLE")))
                .count(),
            3
        );
    }

    #[test]
    fn test_conjunction_of_filters() {
        let filters = vec![
            ChunkFilter::MetadataContains {
                key: "tags".to_string(),
                value: "billing".to_string(),
            },
            ChunkFilter::DocumentStatus {
                status: DocumentStatus::Ready,
            },
        ];
        let clause = compile(&["c".to_string()], &filters).unwrap();
        assert!(clause.sql.contains("json_each"));
        assert!(clause.sql.contains("d.status = ?"));
        assert_eq!(clause.sql.matches(" AND ").count(), 3);
    }
}
