use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::table::{ColumnType, ResultSet, Table};
use crate::task::EntityId;

/// Subconjunto del resultado combinado que pertenece a una entidad.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub entity_id: EntityId,
    pub table: Table,
}

#[derive(Debug, Error, PartialEq)]
pub enum PartitionError {
    #[error("la columna de entidad '{0}' no existe en el resultado")]
    MissingEntityColumn(String),

    #[error("la columna de entidad '{column}' es {found:?}, se esperaba Int64")]
    EntityColumnType { column: String, found: ColumnType },
}

/// Parte el resultado combinado en una partición por id pedido.
///
/// - Siempre devuelve `entity_ids.len()` particiones, en el mismo orden.
/// - Un id sin filas recibe una tabla vacía con el esquema completo.
/// - Ids repetidos reciben cada uno las mismas filas.
/// - Las filas conservan su orden relativo original.
/// - Filas con entidad nula o no pedida se descartan.
pub fn partition(
    result: &ResultSet,
    entity_ids: &[EntityId],
) -> Result<Vec<Partition>, PartitionError> {
    let schema = result.table.schema();
    let index = schema
        .index_of(&result.entity_column)
        .ok_or_else(|| PartitionError::MissingEntityColumn(result.entity_column.clone()))?;

    let found = schema.columns()[index].column_type;
    if found != ColumnType::Int64 {
        return Err(PartitionError::EntityColumnType {
            column: result.entity_column.clone(),
            found,
        });
    }

    // Una sola pasada: índices de filas agrupados por entidad
    let requested: HashSet<EntityId> = entity_ids.iter().copied().collect();
    let mut groups: HashMap<EntityId, Vec<usize>> = HashMap::new();
    for (i, row) in result.table.rows().iter().enumerate() {
        if let Some(id) = row[index].as_i64() {
            if requested.contains(&id) {
                groups.entry(id).or_default().push(i);
            }
        }
    }

    let rows = result.table.rows();
    let partitions = entity_ids
        .iter()
        .map(|&entity_id| {
            let selected = groups
                .get(&entity_id)
                .map(|idx| idx.iter().map(|&i| rows[i].clone()).collect())
                .unwrap_or_default();

            Partition {
                entity_id,
                table: Table::from_validated(schema.clone(), selected),
            }
        })
        .collect();

    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, TableSchema, Value};

    fn pr_files(rows: Vec<(i64, i64, &str)>) -> ResultSet {
        let schema = TableSchema::new(vec![
            Column::new("file_path", ColumnType::Utf8),
            Column::new("pull_request", ColumnType::Int64),
            Column::new("id", ColumnType::Int64),
        ]);
        let rows = rows
            .into_iter()
            .map(|(id, pr, path)| vec![Value::Utf8(path.into()), Value::Int64(pr), Value::Int64(id)])
            .collect();
        ResultSet::new(Table::try_new(schema, rows).unwrap(), "id")
    }

    #[test]
    fn produces_one_partition_per_id_in_caller_order() {
        let result = pr_files(vec![
            (101, 1, "a.rs"),
            (101, 2, "b.rs"),
            (101, 2, "c.rs"),
        ]);

        let parts = partition(&result, &[101, 102]).unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].entity_id, 101);
        assert_eq!(parts[0].table.num_rows(), 3);
        assert_eq!(parts[1].entity_id, 102);
        assert!(parts[1].table.is_empty());
        assert_eq!(parts[1].table.schema(), result.table.schema());
    }

    #[test]
    fn keeps_requested_order_and_relative_row_order() {
        let result = pr_files(vec![
            (7, 1, "x"),
            (3, 2, "y"),
            (7, 3, "z"),
            (9, 4, "ignored"),
        ]);

        let parts = partition(&result, &[3, 7]).unwrap();
        let ids: Vec<i64> = parts.iter().map(|p| p.entity_id).collect();
        assert_eq!(ids, vec![3, 7]);

        let prs: Vec<&Value> = parts[1].table.rows().iter().map(|r| &r[1]).collect();
        assert_eq!(prs, vec![&Value::Int64(1), &Value::Int64(3)]);
    }

    #[test]
    fn repeated_ids_are_not_deduplicated() {
        let result = pr_files(vec![(5, 1, "a")]);
        let parts = partition(&result, &[5, 5]).unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], parts[1]);
    }

    #[test]
    fn empty_result_gives_empty_partitions() {
        let result = pr_files(vec![]);
        let parts = partition(&result, &[1, 2, 3]).unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.table.is_empty()));
    }

    #[test]
    fn rows_with_null_entity_are_dropped() {
        let schema = TableSchema::new(vec![Column::new("id", ColumnType::Int64)]);
        let table = Table::try_new(schema, vec![vec![Value::Null], vec![Value::Int64(1)]]).unwrap();
        let parts = partition(&ResultSet::new(table, "id"), &[1]).unwrap();
        assert_eq!(parts[0].table.num_rows(), 1);
    }

    #[test]
    fn missing_entity_column_is_an_error() {
        let mut result = pr_files(vec![]);
        result.entity_column = "repo_id".into();
        assert_eq!(
            partition(&result, &[1]).unwrap_err(),
            PartitionError::MissingEntityColumn("repo_id".into())
        );
    }

    #[test]
    fn non_integer_entity_column_is_an_error() {
        let mut result = pr_files(vec![]);
        result.entity_column = "file_path".into();
        assert!(matches!(
            partition(&result, &[1]),
            Err(PartitionError::EntityColumnType { found: ColumnType::Utf8, .. })
        ));
    }
}
