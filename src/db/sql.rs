//! SQL rendering for collections stored as JSON rows.
//!
//! A collection is a table `(id, doc)` where `doc` holds the JSON document
//! (`jsonb` on Postgres, JSON text on SQLite). Every query spec is translated
//! into one SQL statement so that matching, ordering, grouping and bucketing
//! run inside the engine.
//!
//! Field paths are inlined into the SQL text (expression indexes only match
//! literal expressions); they are validated by
//! [`validate_field`](crate::query::validate_field) before rendering. Operands
//! are always bound as parameters.

use crate::error::{Result, ShelfError};
use crate::query::{Accumulator, BucketSpec, CompareOp, Filter, FindQuery, GroupSpec, IndexSpec};
use crate::query::{SortDirection, SortSpec, MAX_INDEX_NAME_LEN};
use serde_json::Value;

/// Table holding index definitions per collection.
pub const INDEX_CATALOG: &str = "_shelfscan_indexes";

/// SQL flavor to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// A bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// A scalar JSON operand (jsonb on Postgres, native value on SQLite).
    Json(Value),
    Float(f64),
}

/// A rendered statement and its parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Quotes an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Name of the engine index backing a logical index.
pub fn physical_index_name(collection: &str, name: &str) -> String {
    format!("{collection}_{name}")
}

/// Rejects indexes whose engine name would be truncated.
pub fn check_index_name_length(collection: &str, name: &str) -> Result<()> {
    let physical = physical_index_name(collection, name);
    if physical.len() > MAX_INDEX_NAME_LEN {
        return Err(ShelfError::index(format!(
            "index name '{physical}' is longer than {MAX_INDEX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// Maps an engine index name back to the logical name.
pub fn logical_index_name(collection: &str, physical: &str) -> String {
    if physical == format!("{collection}_pkey") || physical.starts_with("sqlite_autoindex") {
        return crate::query::ID_INDEX_NAME.to_string();
    }
    physical
        .strip_prefix(&format!("{collection}_"))
        .unwrap_or(physical)
        .to_string()
}

impl Dialect {
    fn placeholder(&self, position: usize) -> String {
        match self {
            Self::Postgres => format!("${position}"),
            Self::Sqlite => "?".to_string(),
        }
    }

    /// Expression extracting a field.
    ///
    /// Postgres yields `jsonb`; SQLite yields the native SQL value.
    pub fn field(&self, field: &str) -> String {
        match self {
            Self::Postgres if field.contains('.') => {
                format!("doc #> '{{{}}}'", field.replace('.', ","))
            }
            Self::Postgres => format!("doc->'{field}'"),
            Self::Sqlite => format!("json_extract(doc, '$.{field}')"),
        }
    }

    /// Expression yielding the JSON type name of a field.
    fn field_type(&self, field: &str) -> String {
        match self {
            Self::Postgres => format!("jsonb_typeof({})", self.field(field)),
            Self::Sqlite => format!("json_type(doc, '$.{field}')"),
        }
    }

    /// Expression yielding the field as JSON, for use as a group key.
    fn json_value(&self, field: &str) -> String {
        match self {
            Self::Postgres => self.field(field),
            Self::Sqlite => format!("(doc -> '$.{field}')"),
        }
    }

    /// Expression yielding the field as a float when numeric, otherwise NULL.
    fn numeric(&self, field: &str) -> String {
        match self {
            Self::Postgres => format!(
                "CASE WHEN {} = 'number' THEN ({})::float8 END",
                self.field_type(field),
                self.field(field)
            ),
            Self::Sqlite => format!(
                "CASE WHEN {} IN ('integer', 'real') THEN {} END",
                self.field_type(field),
                self.field(field)
            ),
        }
    }

    /// Condition restricting a field to the JSON type of `value`.
    fn type_check(&self, field: &str, value: &Value) -> Option<String> {
        let t = self.field_type(field);
        match (self, value) {
            (Self::Postgres, Value::Number(_)) => Some(format!("{t} = 'number'")),
            (Self::Postgres, Value::String(_)) => Some(format!("{t} = 'string'")),
            (Self::Postgres, Value::Bool(_)) => Some(format!("{t} = 'boolean'")),
            (Self::Sqlite, Value::Number(_)) => Some(format!("{t} IN ('integer', 'real')")),
            (Self::Sqlite, Value::String(_)) => Some(format!("{t} = 'text'")),
            (Self::Sqlite, Value::Bool(_)) => Some(format!("{t} IN ('true', 'false')")),
            _ => None,
        }
    }

    fn order_by(&self, sort: &SortSpec) -> String {
        format!(
            "{} {}, id",
            self.field(&sort.field),
            null_order(sort.direction)
        )
    }
}

/// Missing values sort lowest: first ascending, last descending.
fn null_order(direction: SortDirection) -> &'static str {
    match direction {
        SortDirection::Asc => "ASC NULLS FIRST",
        SortDirection::Desc => "DESC NULLS LAST",
    }
}

struct Renderer {
    dialect: Dialect,
    params: Vec<SqlParam>,
}

impl Renderer {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    fn finish(self, sql: String) -> SqlQuery {
        SqlQuery {
            sql,
            params: self.params,
        }
    }

    fn filter(&mut self, filter: &Filter) -> String {
        match filter {
            Filter::All => "TRUE".to_string(),
            Filter::And(filters) => self.join(filters, " AND "),
            Filter::Or(filters) => self.join(filters, " OR "),
            Filter::Compare { field, op, value } => self.compare(field, *op, value),
        }
    }

    fn join(&mut self, filters: &[Filter], separator: &str) -> String {
        let parts: Vec<String> = filters
            .iter()
            .map(|f| format!("({})", self.filter(f)))
            .collect();
        parts.join(separator)
    }

    fn compare(&mut self, field: &str, op: CompareOp, value: &Value) -> String {
        match op {
            CompareOp::Eq => self.equals(field, value),
            CompareOp::Ne => format!("NOT COALESCE({}, FALSE)", self.equals(field, value)),
            _ => {
                let expr = self.dialect.field(field);
                let guard = self
                    .dialect
                    .type_check(field, value)
                    .unwrap_or_else(|| "FALSE".to_string());
                let placeholder = self.bind(SqlParam::Json(value.clone()));
                format!("({guard} AND {expr} {} {placeholder})", op.sql())
            }
        }
    }

    fn equals(&mut self, field: &str, value: &Value) -> String {
        let expr = self.dialect.field(field);
        let field_type = self.dialect.field_type(field);
        match (self.dialect, value) {
            (_, Value::Null) => format!("({expr} IS NULL OR {field_type} = 'null')"),
            (Dialect::Sqlite, Value::Bool(b)) => format!("{field_type} = '{b}'"),
            // jsonb equality already distinguishes types.
            (Dialect::Postgres, _) => {
                let placeholder = self.bind(SqlParam::Json(value.clone()));
                format!("{expr} = {placeholder}")
            }
            (Dialect::Sqlite, _) => {
                let guard = self
                    .dialect
                    .type_check(field, value)
                    .unwrap_or_else(|| "FALSE".to_string());
                let placeholder = self.bind(SqlParam::Json(value.clone()));
                format!("({guard} AND {expr} = {placeholder})")
            }
        }
    }
}

/// `SELECT id, doc` matching the query, in sort order (or natural order).
pub fn find(dialect: Dialect, collection: &str, query: &FindQuery) -> SqlQuery {
    let mut renderer = Renderer::new(dialect);
    let predicate = renderer.filter(&query.filter);
    let order = query
        .sort
        .as_ref()
        .map(|sort| dialect.order_by(sort))
        .unwrap_or_else(|| "id".to_string());

    let mut sql = format!(
        "SELECT id, doc FROM {} WHERE {predicate} ORDER BY {order}",
        quote_ident(collection)
    );

    match (dialect, query.limit, query.skip) {
        (_, Some(limit), skip) => sql.push_str(&format!(" LIMIT {limit} OFFSET {skip}")),
        (_, None, 0) => {}
        (Dialect::Postgres, None, skip) => sql.push_str(&format!(" OFFSET {skip}")),
        (Dialect::Sqlite, None, skip) => sql.push_str(&format!(" LIMIT -1 OFFSET {skip}")),
    }

    renderer.finish(sql)
}

/// `SELECT id, doc` matching a filter with no ordering, as explained.
pub fn select_matching(dialect: Dialect, collection: &str, filter: &Filter) -> SqlQuery {
    let mut renderer = Renderer::new(dialect);
    let predicate = renderer.filter(filter);
    let sql = format!(
        "SELECT id, doc FROM {} WHERE {predicate}",
        quote_ident(collection)
    );
    renderer.finish(sql)
}

/// `SELECT COUNT(*)` of documents matching a filter.
pub fn count(dialect: Dialect, collection: &str, filter: &Filter) -> SqlQuery {
    let mut renderer = Renderer::new(dialect);
    let predicate = renderer.filter(filter);
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {predicate}",
        quote_ident(collection)
    );
    renderer.finish(sql)
}

/// Grouping query returning `(group_key, group_value)` rows.
///
/// `group_value` is always a float so both engines decode it the same way.
pub fn group(dialect: Dialect, collection: &str, spec: &GroupSpec) -> SqlQuery {
    let renderer = Renderer::new(dialect);
    let key = dialect.json_value(&spec.group_by);
    let value = match (&spec.accumulator, dialect) {
        (Accumulator::Count, Dialect::Postgres) => "(COUNT(*))::float8".to_string(),
        (Accumulator::Count, Dialect::Sqlite) => "CAST(COUNT(*) AS REAL)".to_string(),
        (Accumulator::Avg(field), _) => format!("AVG({})", dialect.numeric(field)),
        (Accumulator::Sum(field), Dialect::Postgres) => {
            format!("COALESCE(SUM({}), 0)", dialect.numeric(field))
        }
        (Accumulator::Sum(field), Dialect::Sqlite) => format!("TOTAL({})", dialect.numeric(field)),
    };

    let mut sql = format!(
        "SELECT {key} AS group_key, {value} AS group_value FROM {} GROUP BY 1",
        quote_ident(collection)
    );
    if let Some(direction) = spec.sort {
        sql.push_str(&format!(" ORDER BY 2 {}", null_order(direction)));
    }
    if let Some(limit) = spec.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    renderer.finish(sql)
}

/// Bucketing query returning `(bucket, n)` rows; bucket `-1` is the overflow.
pub fn bucket(dialect: Dialect, collection: &str, spec: &BucketSpec) -> SqlQuery {
    let mut renderer = Renderer::new(dialect);
    let value = dialect.numeric(&spec.group_by);

    let mut case = String::from("CASE");
    for (i, window) in spec.boundaries.windows(2).enumerate() {
        let lower = renderer.bind(SqlParam::Float(window[0]));
        let upper = renderer.bind(SqlParam::Float(window[1]));
        case.push_str(&format!(
            " WHEN ({value}) >= {lower} AND ({value}) < {upper} THEN {i}"
        ));
    }
    case.push_str(" ELSE -1 END");

    let sql = format!(
        "SELECT {case} AS bucket, COUNT(*) AS n FROM {} GROUP BY 1",
        quote_ident(collection)
    );
    renderer.finish(sql)
}

/// DDL creating a collection table.
pub fn create_collection(dialect: Dialect, collection: &str) -> String {
    match dialect {
        Dialect::Postgres => format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)",
            quote_ident(collection)
        ),
        Dialect::Sqlite => format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             doc TEXT NOT NULL CHECK (json_valid(doc)))",
            quote_ident(collection)
        ),
    }
}

/// Inserts one document; the single parameter is the document.
pub fn insert_document(dialect: Dialect, collection: &str) -> String {
    format!(
        "INSERT INTO {} (doc) VALUES ({})",
        quote_ident(collection),
        dialect.placeholder(1)
    )
}

/// Checks whether a table exists; the single parameter is its name.
pub fn table_exists(dialect: Dialect) -> String {
    match dialect {
        Dialect::Postgres => "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)"
            .to_string(),
        Dialect::Sqlite => {
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)"
                .to_string()
        }
    }
}

/// DDL creating the index catalog.
pub fn create_index_catalog(dialect: Dialect) -> String {
    let seq = match dialect {
        Dialect::Postgres => "seq BIGSERIAL PRIMARY KEY",
        Dialect::Sqlite => "seq INTEGER PRIMARY KEY AUTOINCREMENT",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {INDEX_CATALOG} ({seq}, collection TEXT NOT NULL, \
         name TEXT NOT NULL, keys TEXT NOT NULL, UNIQUE (collection, name))"
    )
}

/// Lists catalog entries of a collection in creation order.
pub fn select_index_catalog(dialect: Dialect) -> String {
    format!(
        "SELECT name, keys FROM {INDEX_CATALOG} WHERE collection = {} ORDER BY seq",
        dialect.placeholder(1)
    )
}

/// Records an index in the catalog: `(collection, name, keys)`.
pub fn insert_index_catalog(dialect: Dialect) -> String {
    format!(
        "INSERT INTO {INDEX_CATALOG} (collection, name, keys) VALUES ({}, {}, {})",
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.placeholder(3)
    )
}

/// DDL creating the engine index for a spec.
pub fn create_index(dialect: Dialect, collection: &str, spec: &IndexSpec) -> String {
    let columns: Vec<String> = spec
        .keys
        .iter()
        .map(|key| match dialect {
            Dialect::Postgres => format!("({}) {}", dialect.field(&key.field), key.direction.sql()),
            Dialect::Sqlite => format!("{} {}", dialect.field(&key.field), key.direction.sql()),
        })
        .collect();

    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&physical_index_name(collection, &spec.name())),
        quote_ident(collection),
        columns.join(", ")
    )
}

/// Wraps a select in the engine's plan statement.
pub fn explain(dialect: Dialect, select: &SqlQuery) -> SqlQuery {
    let sql = match dialect {
        Dialect::Postgres => format!("EXPLAIN (ANALYZE, FORMAT JSON) {}", select.sql),
        Dialect::Sqlite => format!("EXPLAIN QUERY PLAN {}", select.sql),
    };
    SqlQuery {
        sql,
        params: select.params.clone(),
    }
}
