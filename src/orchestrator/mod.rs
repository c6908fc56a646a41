//! # Orquestrador de Partições
//!
//! Dispara um worker independente por partição, de dois jeitos:
//!
//! - **tasks**: uma task tokio por partição, no mesmo processo (`JoinSet`)
//! - **processes**: um processo filho do próprio binário por partição
//!   (`run <inicio> <fim> --id <id>`), como as janelas que o operador abria
//!   à mão
//!
//! ## Para todos entenderem:
//!
//! O orquestrador não junta nada durante a execução. Cada worker tem sua
//! sessão, seu checkpoint e seus relatórios; a única coisa compartilhada é o
//! console, protegido por um lock na camada de log.
//!
//! Os inícios são escalonados (`stagger_ms`, padrão 3 s) para que os
//! navegadores não façam login todos no mesmo segundo.
//!
//! No Ctrl+C os filhos recebem o mesmo sinal do terminal e fecham sozinhos,
//! gravando checkpoint. Quem não sair em `child_grace_ms` é encerrado.

use anyhow::{Context, Result};
use std::path::Path;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::config::RunnerConfig;
use crate::driver::DriverFactory;
use crate::partition::Partition;
use crate::protocol::SourceRecord;
use crate::worker::{cancelled, RunStats, Worker};

/// Resultado de uma partição executada como task.
#[derive(Debug)]
pub struct PartitionResult {
    pub id: String,
    pub stats: Result<RunStats>,
}

/// Resultado de uma partição executada como processo filho.
#[derive(Debug)]
pub struct ChildResult {
    pub id: String,
    pub status: Result<ExitStatus>,
}

impl ChildResult {
    pub fn succeeded(&self) -> bool {
        matches!(&self.status, Ok(status) if status.success())
    }
}

/// Espera `delay`, ou menos se a interrupção chegar antes. Devolve `false`
/// quando interrompido.
async fn stagger(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => false,
        _ = sleep(delay) => true,
    }
}

// ============================================================================
// TASKS
// ============================================================================

/// Uma task por partição no processo atual.
#[instrument(skip_all, fields(partitions = partitions.len()))]
pub async fn run_in_tasks(
    partitions: Vec<Partition>,
    records: Arc<Vec<SourceRecord>>,
    config: Arc<RunnerConfig>,
    factory: Arc<dyn DriverFactory>,
    mut cancel: watch::Receiver<bool>,
) -> Result<Vec<PartitionResult>> {
    Partition::validate(&partitions, records.len())?;

    let mut join_set = JoinSet::new();
    for (i, partition) in partitions.into_iter().enumerate() {
        if i > 0 && !stagger(config.stagger(), &mut cancel).await {
            warn!("Interrompido antes de iniciar todas as partições");
            break;
        }
        info!(partition = %partition, "Iniciando worker");

        let records = Arc::clone(&records);
        let worker = Worker::new(partition.clone(), Arc::clone(&config), Arc::clone(&factory));
        let cancel = cancel.clone();
        join_set.spawn(async move {
            let stats = worker.run(&records, cancel).await;
            PartitionResult {
                id: partition.id,
                stats,
            }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => {
                if let Err(err) = &result.stats {
                    error!(partition = %result.id, error = %err, "Partição encerrada com erro fatal");
                }
                results.push(result);
            }
            Err(join_err) => {
                error!(error = %join_err, "Worker abortado");
            }
        }
    }
    results.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(results)
}

// ============================================================================
// PROCESSOS
// ============================================================================

/// Argumentos do processo filho de uma partição.
pub fn child_args(partition: &Partition, forwarded: &[String]) -> Vec<String> {
    let mut args = vec!["run".to_string(), partition.start.to_string()];
    if let Some(end) = partition.end {
        args.push(end.to_string());
    }
    args.push("--id".to_string());
    args.push(partition.id.clone());
    args.extend(forwarded.iter().cloned());
    args
}

/// Espera o filho sair; com interrupção, dá `grace` antes de matá-lo.
async fn supervise(
    id: &str,
    child: &mut Child,
    grace: Duration,
    mut cancel: watch::Receiver<bool>,
) -> io::Result<ExitStatus> {
    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancelled(&mut cancel) => None,
    };
    if let Some(status) = finished {
        return status;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(partition = %id, grace_ms = grace.as_millis() as u64, "Processo não encerrou após a interrupção, matando");
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// Um processo filho de `exe` por partição; espera todos terminarem.
///
/// `forwarded` vai no fim de cada linha de comando (ex: `--config robo.json`).
pub async fn run_in_processes(
    partitions: &[Partition],
    exe: &Path,
    forwarded: &[String],
    delay: Duration,
    grace: Duration,
    mut cancel: watch::Receiver<bool>,
) -> Result<Vec<ChildResult>> {
    let mut join_set = JoinSet::new();
    for (i, partition) in partitions.iter().enumerate() {
        if i > 0 && !stagger(delay, &mut cancel).await {
            warn!("Interrompido antes de iniciar todos os processos");
            break;
        }

        let args = child_args(partition, forwarded);
        let mut child = Command::new(exe)
            .args(&args)
            .spawn()
            .with_context(|| format!("Failed to spawn worker {} ({:?})", partition.id, exe))?;
        info!(partition = %partition, pid = ?child.id(), "Processo iniciado");

        let id = partition.id.clone();
        let cancel = cancel.clone();
        join_set.spawn(async move {
            let status = supervise(&id, &mut child, grace, cancel)
                .await
                .map_err(anyhow::Error::from);
            ChildResult { id, status }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => {
                match &result.status {
                    Ok(status) if status.success() => info!(partition = %result.id, "Processo concluído"),
                    Ok(status) => warn!(partition = %result.id, status = %status, "Processo terminou com falha"),
                    Err(err) => error!(partition = %result.id, error = %err, "Processo perdido"),
                }
                results.push(result);
            }
            Err(join_err) => error!(error = %join_err, "Espera do processo abortada"),
        }
    }
    results.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(results)
}
