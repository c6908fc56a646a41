//! # Configuração do Robô
//!
//! Junta em um lugar tudo que muda entre ambientes: endereço do ERP,
//! credenciais, servidor WebDriver, prazos de espera, política de retry,
//! valores padrão e diretórios de saída.
//!
//! ## Para todos entenderem:
//!
//! A configuração vem em camadas, e a última vence:
//!
//! 1. Valores padrão do código (calibrados contra a tela real)
//! 2. Arquivo JSON (`--config robo.json`), com qualquer subconjunto dos campos
//! 3. Variáveis de ambiente (credenciais nunca precisam ir para o arquivo)
//!
//! ## Variáveis de ambiente:
//!
//! | Variável             | Campo                         |
//! |----------------------|-------------------------------|
//! | `SYNC_LOGIN_URL`     | `session.login_url`           |
//! | `SYNC_USER`          | `session.user`                |
//! | `SYNC_PASSWORD`      | `session.password`            |
//! | `SYNC_WEBDRIVER_URL` | `browser.webdriver_url`       |
//! | `SYNC_HEADLESS`      | `browser.headless`            |
//! | `SYNC_OUTPUT_DIR`    | `output_dir`                  |
//! | `SYNC_MAX_ATTEMPTS`  | `retry.max_attempts`          |

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ErrorCode;
use crate::locator::LocatorSettings;
use crate::processor::ProcessorSettings;
use crate::retry::RecoveryPolicy;
use crate::session::SessionSettings;
use crate::wait::WaitTimeouts;

/// Servidor WebDriver e opções do navegador.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    /// Iframe onde o ERP renderiza listagem e formulário.
    pub frame_selector: String,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            headless: false,
            frame_selector: "#iframe_11".to_string(),
        }
    }
}

/// Configuração completa de uma execução.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub session: SessionSettings,
    pub browser: BrowserSettings,
    pub locator: LocatorSettings,
    pub processor: ProcessorSettings,
    pub timeouts: WaitTimeouts,
    pub retry: RecoveryPolicy,

    /// Export processado (CSV ou JSON).
    pub data_file: PathBuf,
    /// Onde ficam checkpoints, relatórios e logs.
    pub output_dir: PathBuf,

    pub delay_between_records_ms: u64,
    /// Intervalo entre o início de cada processo filho.
    pub stagger_ms: u64,
    /// Depois do Ctrl+C, quanto esperar um processo filho sair sozinho.
    pub child_grace_ms: u64,
    /// Partições padrão do `orchestrate` (formato `id=inicio:fim`).
    pub partitions: Vec<String>,

    pub log_level: String,
    pub log_to_file: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            browser: BrowserSettings::default(),
            locator: LocatorSettings::default(),
            processor: ProcessorSettings::default(),
            timeouts: WaitTimeouts::default(),
            retry: RecoveryPolicy::default(),
            data_file: PathBuf::from("cadastros_processados.csv"),
            output_dir: PathBuf::from("."),
            delay_between_records_ms: 100,
            stagger_ms: 3000,
            child_grace_ms: 30_000,
            partitions: Vec::new(),
            log_level: "info".to_string(),
            log_to_file: true,
        }
    }
}

impl RunnerConfig {
    /// Carrega de um arquivo JSON. Campos ausentes ficam com o padrão.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON {:?}", path))?;
        Ok(config)
    }

    /// Arquivo opcional + ambiente + validação. Ponto de entrada da CLI.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Aplica as variáveis `SYNC_*` do processo.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Aplica overrides vindos de qualquer fonte chave → valor.
    ///
    /// Valores que não fazem parse são ignorados, como nos limites de execução.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SYNC_LOGIN_URL") {
            self.session.login_url = val;
        }
        if let Some(val) = lookup("SYNC_USER") {
            self.session.user = val;
        }
        if let Some(val) = lookup("SYNC_PASSWORD") {
            self.session.password = val;
        }
        if let Some(val) = lookup("SYNC_WEBDRIVER_URL") {
            self.browser.webdriver_url = val;
        }
        if let Some(val) = lookup("SYNC_HEADLESS") {
            match val.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "sim" => self.browser.headless = true,
                "0" | "false" | "no" | "nao" | "não" => self.browser.headless = false,
                _ => {}
            }
        }
        if let Some(val) = lookup("SYNC_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("SYNC_MAX_ATTEMPTS") {
            if let Ok(n) = val.trim().parse() {
                self.retry.max_attempts = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.login_url.trim().is_empty() {
            bail!("[{}] session.login_url vazio", ErrorCode::INVALID_CONFIG);
        }
        if self.retry.max_attempts == 0 {
            bail!("[{}] retry.max_attempts precisa ser >= 1", ErrorCode::INVALID_CONFIG);
        }
        if self.retry.backoff_factor < 1.0 {
            bail!("[{}] retry.backoff_factor precisa ser >= 1.0", ErrorCode::INVALID_CONFIG);
        }
        if self.timeouts.poll_interval_ms == 0 || self.timeouts.toggle_interval_ms == 0 {
            bail!("[{}] intervalos de polling precisam ser > 0", ErrorCode::INVALID_CONFIG);
        }
        Ok(())
    }

    pub fn delay_between_records(&self) -> Duration {
        Duration::from_millis(self.delay_between_records_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn child_grace(&self) -> Duration {
        Duration::from_millis(self.child_grace_ms)
    }

    /// Configuração para testes: prazos curtos e nenhuma pausa.
    #[cfg(test)]
    pub fn fast() -> Self {
        let mut config = Self::default();
        config.timeouts = WaitTimeouts {
            form_ready_ms: 30,
            auto_population_ms: 20,
            document_toggle_ms: 20,
            save_ms: 30,
            listing_ms: 20,
            search_ms: 30,
            poll_interval_ms: 2,
            toggle_interval_ms: 2,
        };
        config.retry.backoff_ms = 0;
        config.session.restart_pause_ms = 0;
        config.session.restart_jitter_ms = 0;
        config.delay_between_records_ms = 0;
        config.stagger_ms = 0;
        config.log_to_file = false;
        config
    }
}
