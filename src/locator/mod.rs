//! # Localizador de Registros
//!
//! Encontra a linha de um código na listagem do ERP e abre o formulário de
//! edição dela.
//!
//! ## Para todos entenderem:
//!
//! A busca rápida do ERP é por *substring*: pesquisar `150` traz `150`,
//! `1150`, `2150`... e a ordenação pode voltar invertida depois da busca.
//! Por isso o localizador:
//!
//! 1. pesquisa o código (se um aviso aparecer, fecha e pesquisa de novo);
//! 2. espera o código aparecer ou a listagem dizer "nenhum registro";
//! 3. volta para a página 1 e, se o primeiro código for grande demais,
//!    reordena em ordem crescente;
//! 4. procura a linha com o código *exato* (nunca prefixo), avançando
//!    algumas páginas se preciso;
//! 5. clica em editar e espera o formulário ficar pronto.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::driver::{keys_match, Dialog, DialogKind, RemoteDriver, RowHandle};
use crate::errors::RecordFailure;
use crate::protocol::FormField;
use crate::wait::{await_condition, poll_until, WaitTimeouts};

/// Parâmetros da listagem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorSettings {
    /// Cabeçalho clicado para ordenar por código.
    pub sort_column: String,
    /// Primeiro código acima disso indica ordem decrescente.
    pub sort_threshold: u64,
    /// Páginas extras visitadas quando o código não está na primeira.
    pub max_extra_pages: u32,
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            sort_column: "Código".to_string(),
            sort_threshold: 100,
            max_extra_pages: 3,
        }
    }
}

/// Resultado de uma localização bem-sucedida: formulário já aberto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub row: RowHandle,
    /// Página (1-based) onde o código estava.
    pub page: u32,
}

enum SearchState {
    Settled,
    Dialog(Dialog),
}

pub struct RecordLocator<'a> {
    settings: &'a LocatorSettings,
    timeouts: &'a WaitTimeouts,
}

impl<'a> RecordLocator<'a> {
    pub fn new(settings: &'a LocatorSettings, timeouts: &'a WaitTimeouts) -> Self {
        Self { settings, timeouts }
    }

    pub async fn locate(&self, driver: &dyn RemoteDriver, key: &str) -> Result<Located, RecordFailure> {
        driver.search(key).await?;
        if let Some(dialog) = self.await_results(driver, key).await {
            warn!(key = %key, dialog = %dialog.text, "Aviso durante a pesquisa, pesquisando de novo");
            driver.dismiss_dialog().await?;
            driver.search(key).await?;
            if let Some(dialog) = self.await_results(driver, key).await {
                debug!(key = %key, dialog = %dialog.text, "Aviso repetido na pesquisa");
                driver.dismiss_dialog().await?;
            }
        }

        driver.first_page().await?;
        self.ensure_ascending(driver, key).await?;

        let (row, page) = self.scan_pages(driver, key).await?;
        debug!(key = %key, page = page, row = row.position, "Código encontrado");

        driver.click_edit(&row).await?;
        self.await_form(driver).await?;

        Ok(Located { row, page })
    }

    /// Espera o resultado da busca. Devolve o aviso, se um aparecer.
    async fn await_results(&self, driver: &dyn RemoteDriver, key: &str) -> Option<Dialog> {
        let state = poll_until(self.timeouts.search(), self.timeouts.interval(), move || async move {
            if let Ok(Some(dialog)) = driver.detect_dialog().await {
                if dialog.kind != DialogKind::Success {
                    return Some(SearchState::Dialog(dialog));
                }
            }
            if matches!(driver.find_row(key).await, Ok(Some(_))) {
                return Some(SearchState::Settled);
            }
            if driver.listing_empty().await.unwrap_or(false) {
                return Some(SearchState::Settled);
            }
            None
        })
        .await;

        match state {
            Some(SearchState::Dialog(dialog)) => Some(dialog),
            Some(SearchState::Settled) => None,
            None => {
                // Segue mesmo assim: o código pode estar em outra página.
                debug!(key = %key, "Prazo da pesquisa esgotado");
                None
            }
        }
    }

    async fn ensure_ascending(&self, driver: &dyn RemoteDriver, key: &str) -> Result<(), RecordFailure> {
        let rows = driver.visible_rows().await?;
        let Some(first) = rows.first() else {
            return Ok(());
        };
        let digits: String = first.key_text.chars().filter(|c| c.is_ascii_digit()).collect();
        let Ok(first_code) = digits.parse::<u64>() else {
            return Ok(());
        };

        if first_code > self.settings.sort_threshold && !keys_match(&first.key_text, key) {
            debug!(first = %first.key_text, "Listagem fora de ordem, reordenando");
            driver.sort_ascending_by(&self.settings.sort_column).await?;
            driver.first_page().await?;
        }
        Ok(())
    }

    async fn scan_pages(&self, driver: &dyn RemoteDriver, key: &str) -> Result<(RowHandle, u32), RecordFailure> {
        let mut page = 1;
        loop {
            if let Some(row) = driver.find_row(key).await? {
                return Ok((row, page));
            }
            if page > self.settings.max_extra_pages || !driver.next_page().await? {
                return Err(RecordFailure::NotFound {
                    key: key.to_string(),
                    pages_scanned: page,
                });
            }
            page += 1;
        }
    }

    async fn await_form(&self, driver: &dyn RemoteDriver) -> Result<(), RecordFailure> {
        let ready = await_condition(self.timeouts.form_ready(), self.timeouts.interval(), move || async move {
            for field in [FormField::LegalName, FormField::Cnpj, FormField::Cpf] {
                if driver.field_visible(field).await.unwrap_or(false) {
                    return true;
                }
            }
            false
        })
        .await;

        if ready {
            return Ok(());
        }

        match driver.detect_dialog().await? {
            Some(dialog) => {
                driver.dismiss_dialog().await?;
                Err(RecordFailure::FormTimeout(dialog.text))
            }
            None => Err(RecordFailure::FormTimeout(format!(
                "formulário não carregou em {}ms",
                self.timeouts.form_ready_ms
            ))),
        }
    }
}
