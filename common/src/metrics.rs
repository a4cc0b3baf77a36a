use std::collections::HashMap;

use crate::table::{Column, ColumnType, TableSchema};
use crate::transform::{DateCutoff, Transform};

/// Definición de una métrica: la consulta (parametrizada sólo por la lista
/// de ids en `$1`), su esquema fijo y los pasos de normalización.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub name: String,
    pub sql: String,
    pub schema: TableSchema,

    /// Columna que identifica la entidad dueña de cada fila
    pub entity_column: String,

    pub transforms: Vec<Transform>,
}

impl MetricQuery {
    pub fn new(name: impl Into<String>, sql: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            schema,
            entity_column: "id".to_string(),
            transforms: Vec::new(),
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }
}

pub const PR_FILE: &str = "PR_FILE";
pub const PR_ASSIGNEE: &str = "PR_ASSIGNEE";

const PR_FILE_SQL: &str = "
    SELECT
        prf.pr_file_path AS file_path,
        pr.pull_request_id AS pull_request,
        pr.repo_id AS id
    FROM
        pull_requests pr,
        pull_request_files prf
    WHERE
        pr.pull_request_id = prf.pull_request_id AND
        pr.repo_id = ANY($1)
    ORDER BY pr.repo_id, pr.pull_request_id, prf.pr_file_path
";

const PR_ASSIGNEE_SQL: &str = "
    SELECT
        pr.pull_request_id,
        r.repo_id AS id,
        pr.pr_created_at AS created,
        pr.pr_closed_at AS closed,
        pre.created_at AS assign_date,
        pre.action AS assign,
        pre.cntrb_id::text AS assignee
    FROM
        pull_requests pr,
        repo r,
        pull_request_events pre
    WHERE
        r.repo_id = pr.repo_id AND
        pr.pull_request_id = pre.pull_request_id AND
        pre.action IN ('unassigned', 'assigned') AND
        r.repo_id = ANY($1)
    ORDER BY r.repo_id, pr.pull_request_id, pre.created_at
";

// Largo al que se recorta el id de contribuyente
const ASSIGNEE_ID_WIDTH: usize = 13;

/// Catálogo de métricas por nombre de tarea.
#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    queries: HashMap<String, MetricQuery>,
}

impl MetricCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Métricas incluidas de fábrica.
    pub fn builtin() -> Self {
        let pr_file = MetricQuery::new(
            PR_FILE,
            PR_FILE_SQL,
            TableSchema::new(vec![
                Column::new("file_path", ColumnType::Utf8),
                Column::new("pull_request", ColumnType::Int64),
                Column::new("id", ColumnType::Int64),
            ]),
        );

        let pr_assignee = MetricQuery::new(
            PR_ASSIGNEE,
            PR_ASSIGNEE_SQL,
            TableSchema::new(vec![
                Column::new("pull_request_id", ColumnType::Int64),
                Column::new("id", ColumnType::Int64),
                Column::new("created", ColumnType::Timestamp),
                Column::new("closed", ColumnType::Timestamp),
                Column::new("assign_date", ColumnType::Timestamp),
                Column::new("assign", ColumnType::Utf8),
                Column::new("assignee", ColumnType::Utf8),
            ]),
        )
        .with_transform(Transform::TruncateText {
            column: "assignee".into(),
            width: ASSIGNEE_ID_WIDTH,
        })
        .with_transform(Transform::TimestampToDate {
            column: "created".into(),
        })
        .with_transform(Transform::KeepDateBefore {
            column: "created".into(),
            cutoff: DateCutoff::Today,
        });

        Self::new().with(pr_file).with(pr_assignee)
    }

    pub fn with(mut self, query: MetricQuery) -> Self {
        self.register(query);
        self
    }

    /// Registra (o reemplaza) una métrica.
    pub fn register(&mut self, query: MetricQuery) {
        self.queries.insert(query.name.clone(), query);
    }

    pub fn get(&self, name: &str) -> Option<&MetricQuery> {
        self.queries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queries.contains_key(name)
    }

    /// Nombres registrados, ordenados.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queries.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_both_metrics() {
        let catalog = MetricCatalog::builtin();
        assert_eq!(catalog.names(), vec![PR_ASSIGNEE.to_string(), PR_FILE.to_string()]);
    }

    #[test]
    fn builtin_queries_expose_an_integer_entity_column() {
        let catalog = MetricCatalog::builtin();
        for name in catalog.names() {
            let q = catalog.get(&name).unwrap();
            let column = q.schema.column(&q.entity_column).unwrap();
            assert_eq!(column.column_type, ColumnType::Int64, "{name}");
            assert!(q.sql.contains("ANY($1)"), "{name}");
        }
    }

    #[test]
    fn pr_assignee_normalizes_assignee_and_created() {
        let catalog = MetricCatalog::builtin();
        let q = catalog.get(PR_ASSIGNEE).unwrap();
        let names: Vec<&str> = q.transforms.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["truncate_text", "timestamp_to_date", "keep_date_before"]);
    }
}
