//! # Worker de Partição
//!
//! Executa uma partição do começo ao fim:
//!
//! ```text
//! carrega checkpoint → calcula [retomada, fim) → abre sessão
//!   → para cada índice: retry(processa) → grava checkpoint → relatórios → pausa
//!   → (fim ou interrupção) grava relatórios, snapshot, fecha sessão, resumo
//! ```
//!
//! ## Para todos entenderem:
//!
//! Cada worker é dono exclusivo da sua sessão de navegador, do seu arquivo de
//! checkpoint e dos seus relatórios. Workers não conversam entre si.
//!
//! Só duas coisas derrubam uma partição inteira: não conseguir gravar o
//! checkpoint e não conseguir abrir o navegador nem depois do reinício.
//! Todo o resto vira, no máximo, uma linha no relatório de erros.
//!
//! Uma interrupção (Ctrl+C) abandona o registro em andamento, que é refeito
//! na próxima execução, e ainda assim grava tudo antes de sair.

use anyhow::{Context, Result};
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::RunnerConfig;
use crate::driver::DriverFactory;
use crate::errors::{ErrorCode, RecordFailure};
use crate::partition::Partition;
use crate::processor::RecordProcessor;
use crate::protocol::SourceRecord;
use crate::report::Reporter;
use crate::retry::{process_with_retry, RecordOutcome};
use crate::session::SessionController;

// ============================================================================
// ESTATÍSTICAS
// ============================================================================

/// Contadores de uma execução de partição. Só resultados finais contam.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub partition: String,
    /// Registros no intervalo da partição.
    pub total: usize,
    /// Processados nesta execução.
    pub processed: usize,
    pub successes: usize,
    pub failures: usize,
    pub not_found: usize,
    pub divergences: usize,
    pub defaults_applied: usize,
    /// Já concluídos em execução anterior.
    pub resumed_from: usize,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunStats {
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.successes as f64 / self.processed as f64 * 100.0
    }

    fn count(&mut self, outcome: &RecordOutcome) {
        self.processed += 1;
        if outcome.is_success() {
            self.successes += 1;
            return;
        }
        self.failures += 1;
        if let RecordOutcome::Failed {
            failure: RecordFailure::NotFound { .. },
            ..
        } = outcome
        {
            self.not_found += 1;
        }
    }

    pub fn log_summary(&self) {
        info!(
            partition = %self.partition,
            total = self.total,
            processados = self.processed,
            sucessos = self.successes,
            erros = self.failures,
            nao_encontrados = self.not_found,
            divergencias = self.divergences,
            padroes = self.defaults_applied,
            taxa_sucesso = %format!("{:.1}%", self.success_rate()),
            tempo_s = self.elapsed.as_secs(),
            interrompido = self.interrupted,
            "Resumo da partição"
        );
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} processados, {} sucessos, {} erros ({} não encontrados), {} divergências, {:.1}% sucesso em {}s",
            self.partition,
            self.processed,
            self.total,
            self.successes,
            self.failures,
            self.not_found,
            self.divergences,
            self.success_rate(),
            self.elapsed.as_secs()
        )
    }
}

// ============================================================================
// CANCELAMENTO
// ============================================================================

/// Resolve quando o sinal de interrupção vira `true`. Se o emissor sumir sem
/// sinalizar, nunca resolve.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}

// ============================================================================
// EXECUÇÃO
// ============================================================================

pub struct Worker {
    partition: Partition,
    config: Arc<RunnerConfig>,
    factory: Arc<dyn DriverFactory>,
}

impl Worker {
    pub fn new(partition: Partition, config: Arc<RunnerConfig>, factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            partition,
            config,
            factory,
        }
    }

    /// Processa a partição sobre `records`. Erro aqui é fatal para a partição.
    pub async fn run(&self, records: &[SourceRecord], mut cancel: watch::Receiver<bool>) -> Result<RunStats> {
        let started = Instant::now();
        let id = self.partition.id.as_str();
        let range = self.partition.bounded(records.len());

        let mut store = CheckpointStore::load(&self.config.output_dir, id)?;
        let resume = store.resume_index(range.start).min(range.end);
        let mut reporter = Reporter::new(&self.config.output_dir, id);
        let mut stats = RunStats {
            partition: id.to_string(),
            total: range.len(),
            resumed_from: resume - range.start,
            ..Default::default()
        };

        info!(
            partition = %id,
            start = range.start,
            end = range.end,
            resume = resume,
            run_id = %store.checkpoint().run_id,
            checkpoint = ?store.path(),
            "Iniciando partição"
        );

        if resume >= range.end {
            info!(partition = %id, "Nada pendente nesta partição");
            stats.elapsed = started.elapsed();
            return Ok(stats);
        }

        let mut session = SessionController::new(
            Arc::clone(&self.factory),
            self.config.session.clone(),
            self.config.locator.sort_column.clone(),
            id,
        );
        let processor = RecordProcessor::from_config(&self.config);

        let result = self
            .process_range(
                &records[resume..range.end],
                &mut session,
                &processor,
                &mut store,
                &mut reporter,
                &mut stats,
                &mut cancel,
            )
            .await;

        // Finalização acontece mesmo depois de erro fatal ou interrupção.
        if let Err(err) = reporter.flush() {
            error!(partition = %id, error = %err, "Falha ao gravar relatórios");
        }
        let snapshot = store.snapshot();
        session.teardown().await;

        stats.divergences = reporter.divergence_total();
        stats.defaults_applied = reporter.defaults_total();
        stats.elapsed = started.elapsed();
        stats.log_summary();
        for (field, count) in reporter.defaults() {
            info!(partition = %id, field = %field, count = count, "Valor padrão aplicado");
        }

        result?;
        snapshot?;
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_range(
        &self,
        pending_records: &[SourceRecord],
        session: &mut SessionController,
        processor: &RecordProcessor,
        store: &mut CheckpointStore,
        reporter: &mut Reporter,
        stats: &mut RunStats,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let id = self.partition.id.as_str();
        let total_records = pending_records.last().map_or(0, |r| r.index + 1);

        for record in pending_records {
            if *cancel.borrow() {
                stats.interrupted = true;
                break;
            }
            if store.is_done(record.index) {
                continue;
            }
            if record.key.is_empty() {
                debug!(partition = %id, index = record.index, "Linha sem código pulada");
                continue;
            }

            if !session.is_live() {
                let opened = tokio::select! {
                    biased;
                    _ = cancelled(cancel) => {
                        stats.interrupted = true;
                        break;
                    }
                    opened = self.open_session(session) => opened,
                };
                opened?;
            }

            info!(
                partition = %id,
                index = record.index,
                "[{}/{}] {} - {}",
                record.index + 1,
                total_records,
                record.key,
                record.label
            );

            let outcome = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    warn!(partition = %id, index = record.index, "Interrompido no meio do registro, será refeito");
                    stats.interrupted = true;
                    break;
                }
                outcome = process_with_retry(session, processor, record, &self.config.retry) => outcome,
            };

            match &outcome {
                RecordOutcome::Completed { report, .. } => {
                    info!(
                        partition = %id,
                        key = %outcome.key(),
                        attempts = outcome.attempts(),
                        page = report.page,
                        auto_populated = report.auto_populated,
                        corrected_document = report.corrected_document,
                        silent_save = report.silent_save,
                        "✓ Atualizado"
                    );
                    reporter.record_divergences(&report.divergences);
                    reporter.record_defaults(&report.defaulted);
                }
                RecordOutcome::Failed { entry, .. } => {
                    warn!(partition = %id, key = %record.key, code = %entry.code, "✗ {}", entry.error);
                    reporter.record_error(entry.clone());
                }
            }
            stats.count(&outcome);
            store
                .append(&outcome)
                .with_context(|| format!("Checkpoint da partição {} não pôde ser gravado", id))?;

            if reporter.has_pending() {
                if let Err(err) = reporter.flush() {
                    warn!(partition = %id, error = %err, "Relatórios ficam em memória até a próxima gravação");
                }
            }

            tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    stats.interrupted = true;
                    break;
                }
                _ = sleep(self.config.delay_between_records()) => {}
            }
        }
        Ok(())
    }

    /// Abre a sessão; uma falha ganha o reinício completo antes de virar fatal.
    async fn open_session(&self, session: &mut SessionController) -> Result<()> {
        if let Err(first) = session.establish().await {
            warn!(partition = %self.partition.id, error = %first, "Sessão não abriu, reiniciando");
            session.restart().await.with_context(|| {
                format!(
                    "[{}] navegador indisponível para a partição {}",
                    ErrorCode::SESSION_LOST,
                    self.partition.id
                )
            })?;
        }
        Ok(())
    }
}
