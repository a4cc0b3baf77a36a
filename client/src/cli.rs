use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::task::fingerprint;
use common::{codec, EntityId, InvocationInfo, InvocationRequest, Table, WorkerMetrics};
use reqwest::{Client, StatusCode};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    /// URL base del master (en Docker: http://master:8080)
    #[arg(long, env = "MASTER_URL", default_value = "http://localhost:8080")]
    master_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encola una invocación de una métrica sobre un lote de entidades
    Invoke {
        #[arg(value_name = "METRICA")]
        task: String,

        /// Ids de entidad separados por coma (ej: 101,102)
        #[arg(value_name = "IDS", value_delimiter = ',')]
        ids: Vec<EntityId>,
    },
    /// Consulta el estado de una invocación
    Status {
        #[arg(value_name = "INVOCATION_ID")]
        id: String,
    },
    /// Lista los workers registrados
    Workers,
    /// Lista las métricas disponibles
    Metrics,
    /// Lee del cache la partición de una entidad
    Cache {
        #[arg(value_name = "METRICA")]
        task: String,

        /// Lote con el que se invocó la métrica
        #[arg(value_name = "IDS", value_delimiter = ',')]
        ids: Vec<EntityId>,

        /// Entidad a mostrar
        #[arg(long)]
        entity: EntityId,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.master_url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Invoke { task, ids } => {
            let url = format!("{}/api/v1/tasks", base_url);
            let req = InvocationRequest {
                task_name: task.clone(),
                entity_ids: ids,
            };

            let resp = client.post(&url).json(&req).send().await?;
            if resp.status() == StatusCode::NOT_FOUND {
                bail!("el master no conoce la métrica {task}");
            }
            let info: InvocationInfo = resp.error_for_status()?.json().await?;

            println!("Invocación encolada:");
            print_invocation(&info);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let info: InvocationInfo = resp.json().await?;
                println!("Invocación:");
                print_invocation(&info);
            } else {
                println!("Error: invocación no encontrada (status {})", resp.status());
            }
        }

        Commands::Metrics => {
            let url = format!("{}/api/v1/metrics", base_url);
            let names: Vec<String> = client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            for name in names {
                println!("{name}");
            }
        }

        Commands::Cache { task, ids, entity } => {
            let fp = fingerprint(&task, &ids);
            let url = format!("{}/api/v1/cache/{}/{}/{}", base_url, task, fp, entity);
            let resp = client.get(&url).send().await?;

            if resp.status() == StatusCode::NOT_FOUND {
                println!("No hay partición en cache para {task}:{fp}:{entity}");
                return Ok(());
            }
            let bytes = resp.error_for_status()?.bytes().await?;
            let table = codec::decode(&bytes)
                .with_context(|| format!("buffer inválido para {task}:{fp}:{entity}"))?;

            println!("{task}:{fp}:{entity} ({} filas)", table.num_rows());
            print!("{}", render_table(&table));
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                } else {
                    for w in workers {
                        println!("Worker {}", w.worker_id);
                        println!("  host           : {}", w.hostname);
                        println!("  dead           : {}", w.dead);
                        println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                        println!(
                            "  concurrency    : max={}, activas={}",
                            w.max_concurrency, w.active_tasks
                        );
                        println!(
                            "  tareas         : started={}, ok={}, failed={}",
                            w.tasks_started, w.tasks_succeeded, w.tasks_failed
                        );
                        if let Some(avg) = w.avg_task_ms {
                            println!("  avg_task_ms    : {:.1}", avg);
                        } else {
                            println!("  avg_task_ms    : (sin datos)");
                        }
                        if let Some(cpu) = w.cpu_percent {
                            println!("  cpu_percent    : {:.1}%", cpu);
                        } else {
                            println!("  cpu_percent    : (sin datos)");
                        }
                        if let Some(mem) = w.mem_bytes {
                            println!("  mem_bytes      : {}", mem);
                        } else {
                            println!("  mem_bytes      : (sin datos)");
                        }
                        println!();
                    }
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }
    }

    Ok(())
}

fn print_invocation(info: &InvocationInfo) {
    println!("  id: {}", info.id);
    println!("  métrica: {}", info.task_name);
    println!("  entidades: {:?}", info.entity_ids);
    println!("  fingerprint: {}", info.fingerprint);
    println!("  estado: {:?}", info.status);
    println!("  intentos: {}, entregas: {}", info.attempts, info.deliveries);
    println!("  submitted_at: {}", info.submitted_at);
    if let Some(ref started) = info.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = info.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(ref fault) = info.last_fault {
        println!("  último fallo: {}", fault);
    }
}

/// Tabla de texto con columnas alineadas; los nulos se muestran vacíos.
fn render_table(table: &Table) -> String {
    let headers: Vec<String> = table
        .schema()
        .columns()
        .iter()
        .map(|c| c.name.clone())
        .collect();
    let cells: Vec<Vec<String>> = table
        .rows()
        .iter()
        .map(|row| {
            row.iter()
                .map(|v| if v.is_null() { String::new() } else { v.to_string() })
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |values: &[String]| -> String {
        let padded: Vec<String> = values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<width$}", v, width = *w))
            .collect();
        format!("{}\n", padded.join(" | ").trim_end())
    };

    let mut out = line(&headers);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&format!("{}\n", rule.join("-+-")));
    for row in &cells {
        out.push_str(&line(row));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Column, ColumnType, TableSchema, Value};

    #[test]
    fn renders_aligned_columns_with_empty_nulls() {
        let schema = TableSchema::new(vec![
            Column::new("file_path", ColumnType::Utf8),
            Column::new("id", ColumnType::Int64),
        ]);
        let table = Table::try_new(
            schema,
            vec![
                vec![Value::Utf8("src/lib.rs".into()), Value::Int64(101)],
                vec![Value::Null, Value::Int64(7)],
            ],
        )
        .unwrap();

        let out = render_table(&table);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "file_path  | id");
        assert_eq!(lines[1], "-----------+----");
        assert_eq!(lines[2], "src/lib.rs | 101");
        assert_eq!(lines[3], "           | 7");
    }

    #[test]
    fn parses_comma_separated_ids() {
        let cli = Cli::try_parse_from(["client", "invoke", "PR_FILE", "101,102"]).unwrap();
        match cli.command {
            Commands::Invoke { task, ids } => {
                assert_eq!(task, "PR_FILE");
                assert_eq!(ids, vec![101, 102]);
            }
            _ => panic!("esperaba invoke"),
        }
    }
}
