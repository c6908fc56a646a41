//! # Processador de Registros
//!
//! Máquina de estados que leva um cadastro da planilha até o ERP:
//!
//! ```text
//! Idle → Located → FormOpen → FieldsFilled → Saved → Verified → Done
//!   └──────────────┴──────────┴──────────────┴───────┴──► Failed(motivo)
//! ```
//!
//! ## Para todos entenderem:
//!
//! O formulário do ERP tem vontade própria: digitar o CNPJ/CPF dispara uma
//! consulta à Receita que preenche razão social, endereço e contato por cima
//! do que estiver lá. Por isso a ordem de preenchimento importa:
//!
//! 1. limpa o documento antigo (alternando o tipo de pessoa), para a consulta
//!    não disparar cedo;
//! 2. escreve todos os campos da planilha;
//! 3. guarda o que está na tela, apaga a razão social, escreve o documento
//!    **por último** e espera a razão social reaparecer;
//! 4. compara o que a consulta trouxe com a planilha. Diferença vira
//!    divergência no relatório, e o valor da consulta é mantido (ou o da
//!    planilha, se a política configurada pedir);
//! 5. campos obrigatórios que ficaram vazios recebem o valor padrão;
//! 6. salva. Se o ERP reclamar do documento, roda a correção e salva mais
//!    uma vez.
//!
//! Qualquer falha vira um `RecordFailure`; nada sai daqui como pânico.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, instrument, warn};

use crate::config::RunnerConfig;
use crate::driver::{Dialog, DialogKind, RemoteDriver, UiAction};
use crate::errors::{DriverError, RecordFailure};
use crate::locator::{LocatorSettings, RecordLocator};
use crate::normalizer::{digits_only, normalize, NormalizedFieldSet, RequiredDefaults};
use crate::protocol::{
    DivergenceEntry, FormField, PersonType, SourceRecord, ACTIVE_GROUP, PERSON_TYPE_GROUP,
};
use crate::wait::{await_condition, poll_until, WaitTimeouts};

/// Campos comparados com a planilha depois da consulta do documento.
const COMPARABLE: [FormField; 8] = [
    FormField::Street,
    FormField::Number,
    FormField::Complement,
    FormField::Neighborhood,
    FormField::PostalCode,
    FormField::Phone,
    FormField::Email,
    FormField::LegalName,
];

/// Quem vence quando a consulta do documento discorda da planilha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPopulationPolicy {
    /// Mantém o valor da consulta (fonte oficial).
    #[default]
    PreferRemote,
    /// Reescreve o valor da planilha por cima.
    PreferSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    pub auto_population: AutoPopulationPolicy,
    pub defaults: RequiredDefaults,
    /// Selects fixos do formulário (`name` → `value`).
    pub fixed_selects: BTreeMap<String, String>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        let mut fixed_selects = BTreeMap::new();
        fixed_selects.insert("cf_tipo".to_string(), "Fornecedor".to_string());
        fixed_selects.insert("pa_codigo".to_string(), "1058".to_string());
        Self {
            auto_population: AutoPopulationPolicy::default(),
            defaults: RequiredDefaults::default(),
            fixed_selects,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Located,
    FormOpen,
    FieldsFilled,
    Saved,
    Verified,
    Done,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Located => "located",
            Self::FormOpen => "form_open",
            Self::FieldsFilled => "fields_filled",
            Self::Saved => "saved",
            Self::Verified => "verified",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// O que aconteceu com um registro processado com sucesso.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub states: Vec<ProcessState>,
    pub page: u32,
    pub divergences: Vec<DivergenceEntry>,
    /// Obrigatórios que foram salvos com o valor padrão.
    pub defaulted: Vec<FormField>,
    /// A consulta do documento preencheu a razão social dentro do prazo.
    pub auto_populated: bool,
    pub corrected_document: bool,
    /// Salvou sem que nenhum aviso fosse visto.
    pub silent_save: bool,
}

impl ProcessReport {
    fn enter(&mut self, state: ProcessState) {
        debug!(state = %state, "Transição de estado");
        self.states.push(state);
    }

    pub fn final_state(&self) -> Option<ProcessState> {
        self.states.last().copied()
    }
}

enum SaveSignal {
    Success,
    Silent,
    Rejected(Dialog),
}

/// Compara ignorando espaços nas pontas, caixa e, em campos numéricos, a máscara.
fn equivalent(field: FormField, remote: &str, source: &str) -> bool {
    if field.is_numeric() {
        digits_only(remote) == digits_only(source)
    } else {
        remote.trim().to_lowercase() == source.trim().to_lowercase()
    }
}

pub struct RecordProcessor {
    settings: ProcessorSettings,
    locator: LocatorSettings,
    timeouts: WaitTimeouts,
}

impl RecordProcessor {
    pub fn new(settings: ProcessorSettings, locator: LocatorSettings, timeouts: WaitTimeouts) -> Self {
        Self {
            settings,
            locator,
            timeouts,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            config.processor.clone(),
            config.locator.clone(),
            config.timeouts.clone(),
        )
    }

    /// Processa um registro do início ao fim. Em caso de falha, tenta deixar
    /// a tela de volta na listagem antes de devolver o motivo.
    #[instrument(skip_all, fields(index = record.index, key = %record.key))]
    pub async fn process(
        &self,
        driver: &dyn RemoteDriver,
        record: &SourceRecord,
    ) -> Result<ProcessReport, RecordFailure> {
        let fields = normalize(record, &self.settings.defaults);
        let mut report = ProcessReport::default();
        report.enter(ProcessState::Idle);

        match self.run(driver, record, &fields, &mut report).await {
            Ok(()) => Ok(report),
            Err(failure) => {
                let last = report.final_state().unwrap_or(ProcessState::Idle);
                warn!(state = %last, code = %failure.code(), error = %failure, "Registro falhou");
                self.recover_screen(driver).await;
                Err(failure)
            }
        }
    }

    async fn run(
        &self,
        driver: &dyn RemoteDriver,
        record: &SourceRecord,
        fields: &NormalizedFieldSet,
        report: &mut ProcessReport,
    ) -> Result<(), RecordFailure> {
        let located = RecordLocator::new(&self.locator, &self.timeouts)
            .locate(driver, &record.key)
            .await?;
        report.page = located.page;
        debug!(row = located.row.position, page = located.page, "Formulário aberto");
        report.enter(ProcessState::Located);
        report.enter(ProcessState::FormOpen);

        self.fill(driver, record, fields, report).await?;
        report.enter(ProcessState::FieldsFilled);

        self.save(driver, fields, report).await?;
        report.enter(ProcessState::Saved);
        report.enter(ProcessState::Verified);

        self.return_to_listing(driver).await;
        report.enter(ProcessState::Done);
        info!(divergences = report.divergences.len(), "Registro atualizado");
        Ok(())
    }

    // ========================================================================
    // PREENCHIMENTO
    // ========================================================================

    async fn fill(
        &self,
        driver: &dyn RemoteDriver,
        record: &SourceRecord,
        fields: &NormalizedFieldSet,
        report: &mut ProcessReport,
    ) -> Result<(), RecordFailure> {
        let person_type = fields.person_type();
        self.clear_document(driver, person_type).await?;

        for (field, value) in fields.inputs() {
            write_if_present(driver, field, value).await?;
        }
        for (name, value) in &self.settings.fixed_selects {
            match driver.set_select(name, value).await {
                Err(DriverError::ElementNotFound(_)) => debug!(select = %name, "Select ausente"),
                other => other?,
            }
        }
        let active = if fields.active() { "Sim" } else { "Não" };
        driver.set_radio(ACTIVE_GROUP, active).await?;
        driver.set_radio(PERSON_TYPE_GROUP, person_type.radio_value()).await?;

        let Some(document) = fields.document() else {
            debug!("Sem documento, consulta externa não dispara");
            return self.apply_missing_defaults(driver, fields, report).await;
        };

        // A razão social vazia é o sinal de que a consulta ainda não chegou.
        let before = observe(driver).await?;
        write_if_present(driver, FormField::LegalName, "").await?;
        driver.set_field(person_type.document_field(), document).await?;
        report.auto_populated = self.await_auto_population(driver).await;
        if !report.auto_populated {
            debug!("Consulta do documento não preencheu a razão social no prazo");
        }

        self.reconcile(driver, record, fields, &before, report).await?;
        self.apply_missing_defaults(driver, fields, report).await
    }

    /// Troca para o tipo oposto, limpa o campo que aparece e volta.
    async fn clear_document(&self, driver: &dyn RemoteDriver, person_type: PersonType) -> Result<(), RecordFailure> {
        let opposite = person_type.opposite();
        let (timeout, interval) = (self.timeouts.document_toggle(), self.timeouts.toggle_interval());

        driver.set_radio(PERSON_TYPE_GROUP, opposite.radio_value()).await?;
        if driver.wait_for_field(opposite.document_field(), timeout, interval).await {
            write_if_present(driver, opposite.document_field(), "").await?;
        }
        driver.set_radio(PERSON_TYPE_GROUP, person_type.radio_value()).await?;
        if !driver.wait_for_field(person_type.document_field(), timeout, interval).await {
            debug!(field = %person_type.document_field(), "Campo do documento não apareceu");
        }
        Ok(())
    }

    async fn await_auto_population(&self, driver: &dyn RemoteDriver) -> bool {
        await_condition(
            self.timeouts.auto_population(),
            self.timeouts.interval(),
            move || async move {
                driver
                    .read_field(FormField::LegalName)
                    .await
                    .map(|v| !v.trim().is_empty())
                    .unwrap_or(false)
            },
        )
        .await
    }

    /// Compara a tela depois da consulta com a planilha.
    ///
    /// `before` é a tela logo antes do documento ser escrito. Campo sem valor
    /// da planilha que a consulta apagou volta ao que era.
    async fn reconcile(
        &self,
        driver: &dyn RemoteDriver,
        record: &SourceRecord,
        fields: &NormalizedFieldSet,
        before: &BTreeMap<FormField, String>,
        report: &mut ProcessReport,
    ) -> Result<(), RecordFailure> {
        for field in FormField::OBSERVABLE {
            let remote = read_if_present(driver, field).await?;
            let source = fields
                .source_value(field)
                .filter(|_| COMPARABLE.contains(&field));
            let Some(source) = source else {
                let previous = before.get(&field).map(String::as_str).unwrap_or_default();
                if remote.trim().is_empty() && !previous.trim().is_empty() {
                    write_if_present(driver, field, previous).await?;
                } else if remote != previous {
                    debug!(field = %field, value = %remote, "Campo preenchido pela consulta");
                }
                continue;
            };

            if remote.trim().is_empty() {
                // Consulta apagou o campo: o valor da planilha volta.
                write_if_present(driver, field, source).await?;
                continue;
            }
            if equivalent(field, &remote, source) {
                continue;
            }

            info!(field = %field, remote = %remote, source = %source, "Divergência com a consulta do documento");
            report.divergences.push(DivergenceEntry {
                key: record.key.clone(),
                label: record.label.clone(),
                field: field.remote_id().to_string(),
                remote_value: remote,
                source_value: source.to_string(),
                timestamp: Utc::now(),
            });

            if self.settings.auto_population == AutoPopulationPolicy::PreferSource {
                write_if_present(driver, field, source).await?;
            }
        }
        Ok(())
    }

    /// Preenche obrigatórios vazios e monta a auditoria de padrões com o que
    /// ficou na tela: padrão que a consulta substituiu não conta.
    async fn apply_missing_defaults(
        &self,
        driver: &dyn RemoteDriver,
        fields: &NormalizedFieldSet,
        report: &mut ProcessReport,
    ) -> Result<(), RecordFailure> {
        let normalized = fields.defaulted();
        for field in FormField::REQUIRED {
            let Some(default) = self.settings.defaults.get(field) else {
                continue;
            };
            let remote = driver.read_field(field).await?;
            if remote.trim().is_empty() {
                write_if_present(driver, field, default).await?;
                debug!(field = %field, "Obrigatório vazio, padrão aplicado");
            } else if !(normalized.contains(&field) && equivalent(field, &remote, default)) {
                continue;
            }
            report.defaulted.push(field);
        }
        Ok(())
    }

    // ========================================================================
    // SALVAMENTO
    // ========================================================================

    async fn save(
        &self,
        driver: &dyn RemoteDriver,
        fields: &NormalizedFieldSet,
        report: &mut ProcessReport,
    ) -> Result<(), RecordFailure> {
        driver.click(UiAction::Save).await?;
        let dialog = match self.await_save_signal(driver).await? {
            SaveSignal::Success => return Ok(()),
            SaveSignal::Silent => {
                report.silent_save = true;
                debug!("Nenhum aviso após salvar, assumindo sucesso");
                return Ok(());
            }
            SaveSignal::Rejected(dialog) => dialog,
        };

        driver.dismiss_dialog().await?;
        if !dialog.mentions_document() {
            return Err(RecordFailure::SaveRejected(dialog.text));
        }

        warn!(
            error = %dialog.text,
            document = fields.person_type().document_name(),
            "Erro no documento, corrigindo e salvando de novo"
        );
        self.correct_document(driver, fields).await?;
        report.corrected_document = true;

        driver.click(UiAction::Save).await?;
        match self.await_save_signal(driver).await? {
            SaveSignal::Success => Ok(()),
            SaveSignal::Silent => {
                report.silent_save = true;
                Ok(())
            }
            SaveSignal::Rejected(dialog) => {
                driver.dismiss_dialog().await?;
                Err(RecordFailure::SaveRejected(dialog.text))
            }
        }
    }

    /// Alterna o tipo de pessoa, limpa o documento e o reescreve.
    async fn correct_document(&self, driver: &dyn RemoteDriver, fields: &NormalizedFieldSet) -> Result<(), RecordFailure> {
        let person_type = fields.person_type();
        self.clear_document(driver, person_type).await?;
        if let Some(document) = fields.document() {
            driver.set_field(person_type.document_field(), document).await?;
        }
        Ok(())
    }

    async fn await_save_signal(&self, driver: &dyn RemoteDriver) -> Result<SaveSignal, RecordFailure> {
        let signal = poll_until(self.timeouts.save(), self.timeouts.interval(), move || async move {
            match driver.detect_dialog().await {
                Ok(Some(dialog)) if dialog.kind == DialogKind::Success => Some(Ok(SaveSignal::Success)),
                Ok(Some(dialog)) => Some(Ok(SaveSignal::Rejected(dialog))),
                Ok(None) => None,
                Err(err) => Some(Err(err)),
            }
        })
        .await;

        // Popup sem cara de erro depois de salvar ainda é validação do ERP.
        if let Some(Ok(SaveSignal::Rejected(dialog))) = &signal {
            if dialog.kind == DialogKind::Confirm {
                warn!(dialog = %dialog.text, "Popup não classificado após salvar, tratado como recusa");
            }
        }

        match signal {
            Some(result) => Ok(result?),
            None => Ok(SaveSignal::Silent),
        }
    }

    // ========================================================================
    // VOLTA PARA A LISTAGEM
    // ========================================================================

    async fn return_to_listing(&self, driver: &dyn RemoteDriver) {
        if let Err(err) = driver.go_back().await {
            warn!(error = %err, "Falha ao clicar em voltar");
            return;
        }
        let visible = await_condition(self.timeouts.listing(), self.timeouts.interval(), move || async move {
            if let Ok(Some(dialog)) = driver.detect_dialog().await {
                if dialog.kind != DialogKind::Success {
                    let _ = driver.dismiss_dialog().await;
                }
            }
            driver.listing_visible().await.unwrap_or(false)
        })
        .await;
        if !visible {
            warn!("Listagem não reapareceu após voltar");
        }
    }

    /// Melhor esforço depois de uma falha: fecha avisos e sai do formulário.
    async fn recover_screen(&self, driver: &dyn RemoteDriver) {
        if matches!(driver.detect_dialog().await, Ok(Some(_))) {
            let _ = driver.dismiss_dialog().await;
        }
        if !driver.listing_visible().await.unwrap_or(false) {
            self.return_to_listing(driver).await;
        }
    }
}

/// Lê o campo; campo ausente no formulário conta como vazio.
async fn read_if_present(driver: &dyn RemoteDriver, field: FormField) -> Result<String, RecordFailure> {
    match driver.read_field(field).await {
        Err(DriverError::ElementNotFound(_)) => Ok(String::new()),
        other => Ok(other?),
    }
}

/// Valores de tudo que a consulta do documento pode sobrescrever.
async fn observe(driver: &dyn RemoteDriver) -> Result<BTreeMap<FormField, String>, RecordFailure> {
    let mut values = BTreeMap::new();
    for field in FormField::OBSERVABLE {
        values.insert(field, read_if_present(driver, field).await?);
    }
    Ok(values)
}

/// Escreve o campo; campo ausente ou desabilitado no formulário é ignorado.
async fn write_if_present(driver: &dyn RemoteDriver, field: FormField, value: &str) -> Result<(), RecordFailure> {
    match driver.set_field(field, value).await {
        Err(DriverError::ElementNotFound(_)) => {
            debug!(field = %field, "Campo ausente no formulário");
            Ok(())
        }
        other => Ok(other?),
    }
}
