//! Transactional query over one keyspace.
//!
//! Supports `SELECT * | field, ... FROM keyspace [AS alias]
//! [WHERE field = value] [LIMIT n] [OFFSET n]` where `keyspace` is
//! `bucket`, `bucket.scope.collection`, or a bare collection resolved
//! through the query context. Values may be literals or `?`, `$n` and
//! `$name` parameters.

use crate::config::QueryProfile;
use crate::native::{NativeError, QueryRequest};
use crate::types::{Content, DocumentId, QueryResult};
use serde_json::{Map, Value, json};
use sqlparser::ast::{
    BinaryOperator, Expr, Ident, SelectItem, SetExpr, Statement, TableFactor,
    Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeMap;
use std::time::Instant;

const DEFAULT_SCOPE: &str = "_default";
const DEFAULT_COLLECTION: &str = "_default";

#[derive(Debug, Clone, PartialEq)]
enum Projection {
    All,
    Fields(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    field: String,
    value: Value,
}

/// A parsed statement ready to run against a document snapshot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueryPlan {
    bucket: String,
    scope: String,
    collection: String,
    alias: String,
    projection: Projection,
    filter: Option<Filter>,
    limit: Option<usize>,
    offset: usize,
}

impl QueryPlan {
    pub(crate) fn keyspace(&self) -> (&str, &str, &str) {
        (&self.bucket, &self.scope, &self.collection)
    }

    fn matches(&self, document: &Value) -> bool {
        match &self.filter {
            Some(filter) => document.get(&filter.field) == Some(&filter.value),
            None => true,
        }
    }

    fn project(&self, document: Value) -> Value {
        match &self.projection {
            Projection::All => {
                let mut row = Map::new();
                row.insert(self.alias.clone(), document);
                Value::Object(row)
            }
            Projection::Fields(fields) => {
                let row: Map<String, Value> = fields
                    .iter()
                    .filter_map(|field| {
                        document
                            .get(field)
                            .map(|value| (field.clone(), value.clone()))
                    })
                    .collect();
                Value::Object(row)
            }
        }
    }

    fn signature(&self) -> Value {
        match &self.projection {
            Projection::All => json!({ "*": "*" }),
            Projection::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|field| (field.clone(), json!("json")))
                    .collect(),
            ),
        }
    }
}

fn unsupported(what: impl Into<String>) -> NativeError {
    NativeError::FeatureNotAvailable(what.into())
}

/// Parse `statement` and resolve it against `request`.
pub(crate) fn plan(statement: &str, request: &QueryRequest) -> Result<QueryPlan, NativeError> {
    let parsed = Parser::parse_sql(&GenericDialect {}, statement).map_err(|e| {
        NativeError::QueryParsingFailure {
            message: e.to_string(),
            statement: statement.to_string(),
        }
    })?;
    let [Statement::Query(query)] = parsed.as_slice() else {
        return Err(unsupported("only a single SELECT statement is supported in a transaction"));
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(unsupported("only plain SELECT queries are supported"));
    };
    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(unsupported("queries must read exactly one keyspace"));
    }
    let (name, alias) = match &select.from[0].relation {
        TableFactor::Table { name, alias, .. } => (name, alias),
        _ => return Err(unsupported("subqueries and table functions are not supported")),
    };

    let parts: Vec<&str> = name.0.iter().map(|ident| ident.value.as_str()).collect();
    let (bucket, scope, collection) = match (parts.as_slice(), &request.query_context) {
        ([collection], Some(context)) => {
            let (bucket, scope) = context.split_once('.').ok_or_else(|| {
                unsupported(format!("query context {context} is not bucket.scope"))
            })?;
            (bucket.to_string(), scope.to_string(), collection.to_string())
        }
        ([bucket], None) => (
            bucket.to_string(),
            DEFAULT_SCOPE.to_string(),
            DEFAULT_COLLECTION.to_string(),
        ),
        ([bucket, scope, collection], _) => {
            (bucket.to_string(), scope.to_string(), collection.to_string())
        }
        _ => return Err(unsupported(format!("cannot resolve keyspace {name}"))),
    };
    let alias = alias
        .as_ref()
        .map(|alias| alias.name.value.clone())
        .unwrap_or_else(|| parts.last().map(|s| s.to_string()).unwrap_or_default());

    let mut fields = Vec::new();
    let mut wildcard = false;
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => wildcard = true,
            SelectItem::UnnamedExpr(expr) => fields.push(field_name(expr, &alias)?),
            other => return Err(unsupported(format!("unsupported select item: {other}"))),
        }
    }
    let projection = if wildcard {
        Projection::All
    } else {
        Projection::Fields(fields)
    };

    let mut positional = 0;
    let filter = match &select.selection {
        None => None,
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) => Some(Filter {
            field: field_name(left, &alias)?,
            value: literal(right, request, &mut positional)?,
        }),
        Some(other) => return Err(unsupported(format!("unsupported predicate: {other}"))),
    };

    let limit = query
        .limit
        .as_ref()
        .map(|expr| count(expr, request, &mut positional))
        .transpose()?;
    let offset = match &query.offset {
        Some(offset) => count(&offset.value, request, &mut positional)?,
        None => 0,
    };

    Ok(QueryPlan {
        bucket,
        scope,
        collection,
        alias,
        projection,
        filter,
        limit,
        offset,
    })
}

fn field_name(expr: &Expr, alias: &str) -> Result<String, NativeError> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => match idents.as_slice() {
            [Ident { value: qualifier, .. }, field] if qualifier == alias => Ok(field.value.clone()),
            _ => Err(unsupported(format!("unsupported field path: {expr}"))),
        },
        other => Err(unsupported(format!("unsupported expression: {other}"))),
    }
}

fn literal(expr: &Expr, request: &QueryRequest, positional: &mut usize) -> Result<Value, NativeError> {
    let value = match expr {
        Expr::Value(value) => value,
        other => return Err(unsupported(format!("unsupported value expression: {other}"))),
    };
    match value {
        SqlValue::Number(n, _) => n
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| n.parse::<f64>().map(Value::from))
            .map_err(|_| unsupported(format!("invalid number: {n}"))),
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::String(s.clone()))
        }
        SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
        SqlValue::Null => Ok(Value::Null),
        SqlValue::Placeholder(name) => parameter(name, request, positional),
        other => Err(unsupported(format!("unsupported literal: {other}"))),
    }
}

/// Resolve `?`, `$1` or `$name` against the request's encoded parameters.
fn parameter(name: &str, request: &QueryRequest, positional: &mut usize) -> Result<Value, NativeError> {
    let encoded = if name == "?" {
        let index = *positional;
        *positional += 1;
        request.positional_parameters.get(index)
    } else if let Ok(number) = name.trim_start_matches('$').parse::<usize>() {
        number
            .checked_sub(1)
            .and_then(|index| request.positional_parameters.get(index))
    } else {
        request.named_parameters.get(name)
    };
    let encoded = encoded.ok_or_else(|| NativeError::QueryParsingFailure {
        message: format!("no value supplied for parameter {name}"),
        statement: name.to_string(),
    })?;
    serde_json::from_slice(encoded).map_err(|e| NativeError::QueryParsingFailure {
        message: format!("parameter {name} is not valid JSON: {e}"),
        statement: name.to_string(),
    })
}

fn count(expr: &Expr, request: &QueryRequest, positional: &mut usize) -> Result<usize, NativeError> {
    literal(expr, request, positional)?
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| unsupported(format!("LIMIT and OFFSET take a non-negative integer, got {expr}")))
}

/// Run `plan` over `documents` (already merged with the attempt's staged
/// writes) and build the query service response body.
pub(crate) fn execute(
    plan: &QueryPlan,
    request: &QueryRequest,
    documents: BTreeMap<DocumentId, Content>,
) -> Result<QueryResult, NativeError> {
    let started = Instant::now();
    let rows: Vec<Value> = documents
        .into_values()
        .filter_map(|content| serde_json::from_slice::<Value>(&content.data).ok())
        .filter(|document| plan.matches(document))
        .skip(plan.offset)
        .take(plan.limit.unwrap_or(usize::MAX))
        .map(|document| plan.project(document))
        .collect();
    let encoded_rows = serde_json::to_vec(&rows).map_err(encode_error)?;

    let mut body = Map::new();
    body.insert(
        "requestID".to_string(),
        json!(format!("{:032x}", rand::random::<u128>())),
    );
    if let Some(id) = &request.client_context_id {
        body.insert("clientContextID".to_string(), json!(id));
    }
    body.insert("signature".to_string(), plan.signature());
    let result_count = rows.len();
    body.insert("results".to_string(), Value::Array(rows));
    body.insert("status".to_string(), json!("success"));
    let elapsed = format!("{:?}", started.elapsed());
    if request.metrics {
        body.insert(
            "metrics".to_string(),
            json!({
                "elapsedTime": elapsed,
                "executionTime": elapsed,
                "resultCount": result_count,
                "resultSize": encoded_rows.len(),
            }),
        );
    }
    if request.profile != QueryProfile::Off {
        body.insert(
            "profile".to_string(),
            json!({ "mode": request.profile.as_str(), "executionTime": elapsed }),
        );
    }
    let raw = serde_json::to_vec(&Value::Object(body)).map_err(encode_error)?;
    Ok(QueryResult::new(raw))
}

fn encode_error(err: serde_json::Error) -> NativeError {
    NativeError::other(0, format!("failed to encode query response: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::flags;

    fn docs() -> BTreeMap<DocumentId, Content> {
        [("a", 1), ("b", 2), ("c", 2)]
            .into_iter()
            .map(|(key, qty)| {
                (
                    DocumentId::new("b", "s", "c", key),
                    Content::new(serde_json::to_vec(&json!({ "qty": qty, "sku": key })).unwrap(), flags::JSON),
                )
            })
            .collect()
    }

    fn run(statement: &str, request: &QueryRequest) -> Value {
        let plan = plan(statement, request).unwrap();
        execute(&plan, request, docs()).unwrap().to_json().unwrap()
    }

    #[test]
    fn select_star_wraps_rows_in_alias() {
        let body = run("SELECT * FROM b.s.c", &QueryRequest::default());
        assert_eq!(body["status"], "success");
        assert_eq!(body["results"].as_array().unwrap().len(), 3);
        assert_eq!(body["results"][0]["c"]["sku"], "a");
        assert!(body.get("metrics").is_none());
    }

    #[test]
    fn filter_projection_and_limit() {
        let request = QueryRequest {
            metrics: true,
            ..QueryRequest::default()
        };
        let body = run("SELECT sku FROM b.s.c WHERE qty = 2 LIMIT 1", &request);
        assert_eq!(body["results"], json!([{ "sku": "b" }]));
        assert_eq!(body["metrics"]["resultCount"], 1);
    }

    #[test]
    fn positional_parameter() {
        let request = QueryRequest {
            positional_parameters: vec![b"1".to_vec()],
            ..QueryRequest::default()
        };
        let body = run("SELECT * FROM b.s.c AS d WHERE d.qty = $1", &request);
        assert_eq!(body["results"], json!([{ "d": { "qty": 1, "sku": "a" } }]));
    }

    #[test]
    fn query_context_resolves_bare_collection() {
        let request = QueryRequest {
            query_context: Some("b.s".to_string()),
            ..QueryRequest::default()
        };
        let plan = plan("SELECT * FROM c", &request).unwrap();
        assert_eq!(plan.keyspace(), ("b", "s", "c"));
        let plan = plan_default("SELECT * FROM travel");
        assert_eq!(plan.keyspace(), ("travel", "_default", "_default"));
    }

    fn plan_default(statement: &str) -> QueryPlan {
        plan(statement, &QueryRequest::default()).unwrap()
    }

    #[test]
    fn parse_errors_and_unsupported_statements() {
        assert!(matches!(
            plan("SELEC * FORM", &QueryRequest::default()),
            Err(NativeError::QueryParsingFailure { .. })
        ));
        assert!(matches!(
            plan("DELETE FROM b.s.c", &QueryRequest::default()),
            Err(NativeError::FeatureNotAvailable(_))
        ));
        assert!(matches!(
            plan("SELECT * FROM b.s.c JOIN d ON b.s.c.x = d.y", &QueryRequest::default()),
            Err(NativeError::FeatureNotAvailable(_))
        ));
    }

    #[test]
    fn named_parameter_and_offset() {
        let request = QueryRequest {
            named_parameters: [("$qty".to_string(), b"2".to_vec())].into_iter().collect(),
            ..QueryRequest::default()
        };
        let body = run("SELECT sku FROM b.s.c WHERE qty = $qty OFFSET 1", &request);
        assert_eq!(body["results"], json!([{ "sku": "c" }]));
    }

    #[test]
    fn missing_parameter_is_a_parse_failure() {
        assert!(matches!(
            plan("SELECT * FROM b.s.c WHERE qty = $2", &QueryRequest::default()),
            Err(NativeError::QueryParsingFailure { .. })
        ));
    }

    #[test]
    fn limit_from_parameter_must_be_a_non_negative_integer() {
        let request = QueryRequest {
            positional_parameters: vec![b"2".to_vec()],
            ..QueryRequest::default()
        };
        let body = run("SELECT sku FROM b.s.c LIMIT $1", &request);
        assert_eq!(body["results"].as_array().unwrap().len(), 2);

        for bad in [&b"-3"[..], b"1.5", b"\"two\""] {
            let request = QueryRequest {
                positional_parameters: vec![bad.to_vec()],
                ..QueryRequest::default()
            };
            assert!(matches!(
                plan("SELECT sku FROM b.s.c LIMIT $1", &request),
                Err(NativeError::FeatureNotAvailable(_))
            ));
        }
    }

    #[test]
    fn profile_is_reported() {
        let request = QueryRequest {
            profile: QueryProfile::Timings,
            client_context_id: Some("ctx-9".to_string()),
            ..QueryRequest::default()
        };
        let body = run("SELECT * FROM b.s.c", &request);
        assert_eq!(body["profile"]["mode"], "timings");
        assert_eq!(body["clientContextID"], "ctx-9");
    }
}
