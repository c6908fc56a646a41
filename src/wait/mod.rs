//! # Esperas Limitadas
//!
//! Toda interação com a tela remota é assíncrona do ponto de vista do robô:
//! clicar em "Salvar" não significa que o aviso já apareceu. Em vez de pausas
//! fixas, o robô consulta a tela em intervalos curtos até a condição valer ou
//! o prazo acabar.
//!
//! ## Para todos entenderem:
//!
//! ```text
//! check() ──► Some(v)? ──sim──► retorna Some(v)
//!                │
//!               não
//!                │
//!        prazo estourou? ──sim──► retorna None
//!                │
//!               não ──► dorme `interval` e tenta de novo
//! ```
//!
//! Esperas nunca falham com erro: o chamador decide o que "não aconteceu"
//! significa no seu contexto (formulário não abriu, salvou sem aviso, etc).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Consulta `check` até ele devolver `Some` ou o prazo acabar.
///
/// A primeira consulta acontece imediatamente, então um prazo zero ainda
/// avalia a condição uma vez.
pub async fn poll_until<T, F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Versão booleana de [`poll_until`].
pub async fn await_condition<F, Fut>(timeout: Duration, interval: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    poll_until(timeout, interval, || {
        let check = predicate();
        async move { check.await.then_some(()) }
    })
    .await
    .is_some()
}

// ============================================================================
// PRAZOS
// ============================================================================

/// Prazos e intervalos de cada espera, em milissegundos.
///
/// Os valores padrão foram calibrados contra a tela real: generosos o
/// bastante para a rede lenta, curtos o bastante para não travar o lote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitTimeouts {
    /// Formulário de edição pronto após clicar em editar.
    pub form_ready_ms: u64,
    /// Consulta de cadastro externo preenchendo a razão social.
    pub auto_population_ms: u64,
    /// Campo de documento aparecendo após trocar o tipo de pessoa.
    pub document_toggle_ms: u64,
    /// Aviso de sucesso/erro após salvar.
    pub save_ms: u64,
    /// Listagem visível após voltar do formulário.
    pub listing_ms: u64,
    /// Resultado da busca rápida.
    pub search_ms: u64,
    /// Intervalo padrão entre consultas.
    pub poll_interval_ms: u64,
    /// Intervalo da troca de tipo de pessoa (campo aparece rápido).
    pub toggle_interval_ms: u64,
}

impl Default for WaitTimeouts {
    fn default() -> Self {
        Self {
            form_ready_ms: 3000,
            auto_population_ms: 2000,
            document_toggle_ms: 1500,
            save_ms: 3000,
            listing_ms: 2000,
            search_ms: 5000,
            poll_interval_ms: 100,
            toggle_interval_ms: 50,
        }
    }
}

impl WaitTimeouts {
    pub fn form_ready(&self) -> Duration {
        Duration::from_millis(self.form_ready_ms)
    }

    pub fn auto_population(&self) -> Duration {
        Duration::from_millis(self.auto_population_ms)
    }

    pub fn document_toggle(&self) -> Duration {
        Duration::from_millis(self.document_toggle_ms)
    }

    pub fn save(&self) -> Duration {
        Duration::from_millis(self.save_ms)
    }

    pub fn listing(&self) -> Duration {
        Duration::from_millis(self.listing_ms)
    }

    pub fn search(&self) -> Duration {
        Duration::from_millis(self.search_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn toggle_interval(&self) -> Duration {
        Duration::from_millis(self.toggle_interval_ms)
    }
}
