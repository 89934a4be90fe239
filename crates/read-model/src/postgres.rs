use async_trait::async_trait;
use common::ReadModelId;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

use crate::{
    Condition, Document, FieldRef, FindQuery, ModelUpdate, Operator, Page, ReadModel,
    ReadModelError, ReadModelStore, Result, SortDirection, Version,
};

const SELECT_COLUMNS: &str =
    "SELECT id, model_type, version, data, metadata, created_at, updated_at FROM read_models";

/// PostgreSQL-backed read-model store.
///
/// Models live in the `read_models` table; data and metadata are `jsonb`.
#[derive(Clone)]
pub struct PostgresReadModelStore {
    pool: PgPool,
}

impl PostgresReadModelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_model(row: PgRow) -> Result<ReadModel> {
        let data: Value = row.try_get("data")?;
        let metadata: Value = row.try_get("metadata")?;

        Ok(ReadModel {
            id: ReadModelId::new(row.try_get::<String, _>("id")?),
            model_type: row.try_get("model_type")?,
            version: Version::new(row.try_get("version")?),
            data: into_document(data)?,
            metadata: into_document(metadata)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn current_version(&self, id: &ReadModelId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM read_models WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(Version::new))
    }

    async fn conflict(&self, id: &ReadModelId, expected: Version) -> Result<ReadModelError> {
        metrics::counter!("read_model_conflicts_total").increment(1);
        Ok(ReadModelError::ConcurrencyConflict {
            id: id.clone(),
            expected,
            actual: self.current_version(id).await?,
        })
    }
}

fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ReadModelError::Storage(format!(
            "expected a JSON object, found {other}"
        ))),
    }
}

#[async_trait]
impl ReadModelStore for PostgresReadModelStore {
    async fn get(&self, id: &ReadModelId) -> Result<Option<ReadModel>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_model).transpose()
    }

    #[tracing::instrument(skip(self, update), fields(model_type = %update.model_type))]
    async fn upsert(
        &self,
        id: &ReadModelId,
        expected: Version,
        update: ModelUpdate,
    ) -> Result<ReadModel> {
        let data = Value::Object(update.data);
        let metadata = Value::Object(update.metadata);

        let row = if expected == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO read_models (id, model_type, version, data, metadata, created_at, updated_at)
                VALUES ($1, $2, 1, $3, $4, NOW(), NOW())
                ON CONFLICT (id) DO NOTHING
                RETURNING id, model_type, version, data, metadata, created_at, updated_at
                "#,
            )
            .bind(id.as_str())
            .bind(&update.model_type)
            .bind(&data)
            .bind(&metadata)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE read_models
                SET model_type = $2, version = version + 1, data = $3, metadata = $4, updated_at = NOW()
                WHERE id = $1 AND version = $5
                RETURNING id, model_type, version, data, metadata, created_at, updated_at
                "#,
            )
            .bind(id.as_str())
            .bind(&update.model_type)
            .bind(&data)
            .bind(&metadata)
            .bind(expected.as_i64())
            .fetch_optional(&self.pool)
            .await?
        };

        match row {
            Some(row) => Self::row_to_model(row),
            None => Err(self.conflict(id, expected).await?),
        }
    }

    async fn delete(&self, id: &ReadModelId, expected: Option<Version>) -> Result<()> {
        let Some(expected) = expected else {
            sqlx::query("DELETE FROM read_models WHERE id = $1")
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
            return Ok(());
        };

        let result = sqlx::query("DELETE FROM read_models WHERE id = $1 AND version = $2")
            .bind(id.as_str())
            .bind(expected.as_i64())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, expected).await?);
        }
        Ok(())
    }

    async fn find(&self, query: &FindQuery) -> Result<Page> {
        query.validate()?;
        let limit = query.limit.map(|limit| sql_bound("limit", limit)).transpose()?;
        let offset = sql_bound("offset", query.offset)?;

        let mut sql = SqlBuilder::default();
        let mut clauses = vec!["TRUE".to_string()];
        if let Some(ref model_type) = query.filter.model_type {
            let p = sql.push(Bind::Text(model_type.clone()));
            clauses.push(format!("model_type = ${p}"));
        }
        for condition in &query.filter.conditions {
            clauses.push(sql.condition(condition));
        }
        let where_clause = clauses.join(" AND ");

        let total = if query.include_total {
            let count_sql = format!("SELECT COUNT(*) FROM read_models WHERE {where_clause}");
            let row = sql.bind_all(sqlx::query(&count_sql)).fetch_one(&self.pool).await?;
            let count: i64 = row.try_get(0)?;
            Some(count as u64)
        } else {
            None
        };

        let mut select = format!("{SELECT_COLUMNS} WHERE {where_clause}");
        if !query.sort.is_empty() {
            let order: Vec<String> = query
                .sort
                .iter()
                .map(|key| {
                    let expr = sort_expression(&FieldRef::parse(&key.field), &mut sql);
                    match key.direction {
                        SortDirection::Asc => format!("{expr} ASC NULLS FIRST"),
                        SortDirection::Desc => format!("{expr} DESC NULLS LAST"),
                    }
                })
                .collect();
            select.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        if let Some(limit) = limit {
            let p = sql.push(Bind::Int(limit));
            select.push_str(&format!(" LIMIT ${p}"));
        }
        if offset > 0 {
            let p = sql.push(Bind::Int(offset));
            select.push_str(&format!(" OFFSET ${p}"));
        }

        let rows = sql.bind_all(sqlx::query(&select)).fetch_all(&self.pool).await?;
        let items = rows
            .into_iter()
            .map(Self::row_to_model)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page { items, total })
    }
}

#[derive(Debug, Clone)]
enum Bind {
    Text(String),
    OptText(Option<String>),
    Path(Vec<String>),
    Json(Value),
    Int(i64),
}

/// Accumulates positional parameters for a dynamically built statement.
#[derive(Default)]
struct SqlBuilder {
    binds: Vec<Bind>,
}

impl SqlBuilder {
    /// Adds a parameter and returns its 1-based placeholder index.
    fn push(&mut self, bind: Bind) -> usize {
        self.binds.push(bind);
        self.binds.len()
    }

    fn bind_all<'q>(
        &self,
        mut query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        for bind in &self.binds {
            query = match bind.clone() {
                Bind::Text(v) => query.bind(v),
                Bind::OptText(v) => query.bind(v),
                Bind::Path(v) => query.bind(v),
                Bind::Json(v) => query.bind(v),
                Bind::Int(v) => query.bind(v),
            };
        }
        query
    }

    /// Renders a condition as a boolean SQL expression over `jsonb` values.
    fn condition(&mut self, condition: &Condition) -> String {
        let field = value_expression(&FieldRef::parse(&condition.field), self);
        let value = &condition.value;

        match condition.op {
            Operator::Eq => {
                let v = self.push(Bind::Json(value.clone()));
                format!("({})", json_equals(&field, &format!("${v}::jsonb")))
            }
            Operator::Ne => {
                let v = self.push(Bind::Json(value.clone()));
                format!(
                    "({field} IS NULL OR NOT ({}))",
                    json_equals(&field, &format!("${v}::jsonb"))
                )
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let op = match condition.op {
                    Operator::Gt => ">",
                    Operator::Gte => ">=",
                    Operator::Lt => "<",
                    _ => "<=",
                };
                let v = self.push(Bind::Json(value.clone()));
                format!(
                    "(jsonb_typeof({field}) = jsonb_typeof(${v}::jsonb) AND jsonb_typeof({field}) IN ('number', 'string', 'boolean') AND {field} {op} ${v}::jsonb)"
                )
            }
            Operator::In => {
                let v = self.push(Bind::Json(value.clone()));
                format!(
                    "EXISTS (SELECT 1 FROM jsonb_array_elements(${v}::jsonb) AS candidate WHERE {})",
                    json_equals(&field, "candidate")
                )
            }
            Operator::Contains => {
                let needle = self.push(Bind::OptText(value.as_str().map(str::to_string)));
                let element = self.push(Bind::Json(value.clone()));
                format!(
                    "(CASE jsonb_typeof({field}) \
                     WHEN 'string' THEN COALESCE(strpos({field} #>> '{{}}', ${needle}) > 0, FALSE) \
                     WHEN 'array' THEN EXISTS (SELECT 1 FROM jsonb_array_elements({field}) AS item WHERE {}) \
                     ELSE FALSE END)",
                    json_equals("item", &format!("${element}::jsonb"))
                )
            }
            Operator::Exists => {
                let present = format!("({field} IS NOT NULL AND jsonb_typeof({field}) <> 'null')");
                if value.as_bool().unwrap_or(true) {
                    present
                } else {
                    format!("NOT {present}")
                }
            }
        }
    }
}

/// Equality of two `jsonb` expressions; numbers compare numerically.
fn json_equals(left: &str, right: &str) -> String {
    format!(
        "CASE WHEN jsonb_typeof({left}) = 'number' AND jsonb_typeof({right}) = 'number' \
         THEN ({left})::numeric = ({right})::numeric ELSE {left} = {right} END"
    )
}

/// The `jsonb` value a field resolves to, matching `ReadModel::field`.
fn value_expression(field: &FieldRef, sql: &mut SqlBuilder) -> String {
    match field {
        FieldRef::Id => "to_jsonb(id)".to_string(),
        FieldRef::ModelType => "to_jsonb(model_type)".to_string(),
        FieldRef::Version => "to_jsonb(version)".to_string(),
        FieldRef::CreatedAt => timestamp_json("created_at"),
        FieldRef::UpdatedAt => timestamp_json("updated_at"),
        FieldRef::Data(path) => {
            let p = sql.push(Bind::Path(path.clone()));
            format!("NULLIF(data #> ${p}::text[], 'null'::jsonb)")
        }
    }
}

/// LIMIT and OFFSET are `bigint` in PostgreSQL.
fn sql_bound(name: &str, value: usize) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| ReadModelError::InvalidQuery(format!("{name} {value} is out of range")))
}

fn timestamp_json(column: &str) -> String {
    format!(
        "to_jsonb(to_char({column} AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.US\"Z\"'))"
    )
}

fn sort_expression(field: &FieldRef, sql: &mut SqlBuilder) -> String {
    match field {
        FieldRef::Id => "id COLLATE \"C\"".to_string(),
        FieldRef::ModelType => "model_type".to_string(),
        FieldRef::Version => "version".to_string(),
        FieldRef::CreatedAt => "created_at".to_string(),
        FieldRef::UpdatedAt => "updated_at".to_string(),
        data => value_expression(data, sql),
    }
}
