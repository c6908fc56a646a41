//! Módulo de Retry com RecoveryPolicy.
//!
//! Envolve o processador de registros com tentativas limitadas e escalonamento:
//!
//! - falha de ambiente (`FormTimeout`, `UnknownFailure`, `SessionLost`):
//!   reinicia a sessão antes da próxima tentativa
//! - falha de dados (`NotFound`, `SaveRejected`): repete sem reiniciar; se a
//!   mesma falha se repetir, escala para reinício
//! - tentativas esgotadas: devolve `RecordOutcome::Failed` com um `ErrorEntry`
//!
//! Um registro ruim nunca para o lote. As estatísticas só são contadas pelo
//! worker a partir do resultado final, então tentativas que falharam não
//! deixam contagem para trás.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::errors::RecordFailure;
use crate::processor::{ProcessReport, RecordProcessor};
use crate::protocol::{ErrorEntry, SourceRecord};
use crate::session::SessionController;

/// Política de recuperação de um registro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    /// Espera antes da segunda tentativa.
    pub backoff_ms: u64,
    /// Multiplicador da espera a cada nova falha.
    pub backoff_factor: f64,
    /// Falhas de dados iguais e seguidas que justificam reiniciar a sessão
    /// (0 desliga o escalonamento).
    pub restart_on_data_failures_after: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            backoff_factor: 2.0,
            restart_on_data_failures_after: 2,
        }
    }
}

/// Resultado final de um registro, depois de todas as tentativas.
#[derive(Debug)]
pub enum RecordOutcome {
    Completed {
        index: usize,
        key: String,
        attempts: u32,
        report: ProcessReport,
    },
    Failed {
        entry: ErrorEntry,
        failure: RecordFailure,
    },
}

impl RecordOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Completed { index, .. } => *index,
            Self::Failed { entry, .. } => entry.index,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Completed { key, .. } => key,
            Self::Failed { entry, .. } => &entry.key,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Completed { attempts, .. } => *attempts,
            Self::Failed { entry, .. } => entry.attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Decide se a próxima tentativa começa com uma sessão nova.
fn needs_restart(failure: &RecordFailure, data_streak: u32, policy: &RecoveryPolicy) -> bool {
    if failure.triggers_restart() {
        return true;
    }
    failure.is_data_problem()
        && policy.restart_on_data_failures_after > 0
        && data_streak >= policy.restart_on_data_failures_after
}

/// Processa um registro com retry conforme a política.
///
/// Sempre devolve um resultado: falhas viram `RecordOutcome::Failed`.
/// Um reinício que falha não interrompe nada aqui; a tentativa seguinte
/// encontra a sessão ausente, falha com `SessionLost` e pede outro reinício.
pub async fn process_with_retry(
    session: &mut SessionController,
    processor: &RecordProcessor,
    record: &SourceRecord,
    policy: &RecoveryPolicy,
) -> RecordOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    let mut current_backoff = policy.backoff_ms;
    let mut data_streak = 0;
    let mut last_kind: Option<&'static str> = None;

    loop {
        let result = match session.driver() {
            Ok(driver) => processor.process(driver, record).await,
            Err(lost) => Err(lost),
        };

        let failure = match result {
            Ok(report) => {
                if attempt > 1 {
                    info!(index = record.index, key = %record.key, attempt = attempt, "Retry bem sucedido");
                }
                return RecordOutcome::Completed {
                    index: record.index,
                    key: record.key.clone(),
                    attempts: attempt,
                    report,
                };
            }
            Err(failure) => failure,
        };

        if attempt >= max_attempts {
            warn!(
                index = record.index,
                key = %record.key,
                attempt = attempt,
                max_attempts = max_attempts,
                code = %failure.code(),
                category = %failure.code().category(),
                reason = failure.code().description(),
                error = %failure,
                "Todas as tentativas esgotadas"
            );
            let entry = ErrorEntry {
                index: record.index,
                key: record.key.clone(),
                label: record.label.clone(),
                code: failure.code().formatted(),
                error: failure.to_string(),
                attempts: attempt,
                timestamp: Utc::now(),
            };
            return RecordOutcome::Failed { entry, failure };
        }

        data_streak = if failure.is_data_problem() && last_kind == Some(failure.kind()) {
            data_streak + 1
        } else if failure.is_data_problem() {
            1
        } else {
            0
        };
        last_kind = Some(failure.kind());
        let restart = needs_restart(&failure, data_streak, policy);

        warn!(
            index = record.index,
            key = %record.key,
            attempt = attempt,
            max_attempts = max_attempts,
            backoff_ms = current_backoff,
            restart = restart,
            error = %failure,
            "Tentativa falhou, aguardando retry"
        );

        sleep(Duration::from_millis(current_backoff)).await;
        current_backoff = (current_backoff as f64 * policy.backoff_factor) as u64;

        if restart {
            if let Err(err) = session.restart().await {
                warn!(key = %record.key, error = %err, "Reinício da sessão falhou");
            }
        }
        attempt += 1;
    }
}
