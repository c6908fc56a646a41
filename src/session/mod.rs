//! # Controlador de Sessão
//!
//! Dono do navegador de um worker. Só três coisas acontecem aqui:
//!
//! - `establish`: abre o navegador, faz login, abre o módulo e ordena a listagem
//! - `teardown`: fecha o navegador (erros são registrados e engolidos)
//! - `restart`: teardown + pausa + establish, com uma segunda tentativa completa
//!
//! Nenhum outro componente abre ou fecha sessões; o worker chama no início e
//! no fim, o controlador de retry chama entre tentativas.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::driver::{Credentials, DriverFactory, ModulePath, RemoteDriver};
use crate::errors::{DriverResult, RecordFailure};

/// Acesso ao ERP e comportamento do reinício.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub login_url: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Menu principal que contém o módulo.
    pub menu: String,
    /// Item do menu que abre a listagem de cadastros.
    pub item: String,
    pub restart_pause_ms: u64,
    /// Variação aleatória somada à pausa, para workers não reabrirem juntos.
    pub restart_jitter_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            login_url: "http://localhost:4586/login".to_string(),
            user: String::new(),
            password: String::new(),
            menu: "Cadastros".to_string(),
            item: "Cliente/Fornecedores".to_string(),
            restart_pause_ms: 2000,
            restart_jitter_ms: 500,
        }
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("login_url", &self.login_url)
            .field("user", &self.user)
            .field("password", &"***")
            .field("menu", &self.menu)
            .field("item", &self.item)
            .field("restart_pause_ms", &self.restart_pause_ms)
            .field("restart_jitter_ms", &self.restart_jitter_ms)
            .finish()
    }
}

impl SessionSettings {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }

    pub fn module_path(&self) -> ModulePath {
        ModulePath {
            menu: self.menu.clone(),
            item: self.item.clone(),
        }
    }

    fn restart_pause(&self) -> Duration {
        let jitter = if self.restart_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.restart_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.restart_pause_ms + jitter)
    }
}

pub struct SessionController {
    factory: Arc<dyn DriverFactory>,
    settings: SessionSettings,
    sort_column: String,
    partition: String,
    driver: Option<Box<dyn RemoteDriver>>,
}

impl SessionController {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        settings: SessionSettings,
        sort_column: impl Into<String>,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            settings,
            sort_column: sort_column.into(),
            partition: partition.into(),
            driver: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.driver.is_some()
    }

    /// Driver da sessão atual, ou `SessionLost` se não houver sessão.
    pub fn driver(&self) -> Result<&dyn RemoteDriver, RecordFailure> {
        self.driver
            .as_deref()
            .ok_or_else(|| RecordFailure::SessionLost("sessão não estabelecida".to_string()))
    }

    pub async fn establish(&mut self) -> DriverResult<()> {
        if self.driver.is_some() {
            self.teardown().await;
        }

        let driver = self.factory.create().await?;
        if let Err(err) = self.prepare(driver.as_ref()).await {
            if let Err(close_err) = driver.close().await {
                warn!(partition = %self.partition, error = %close_err, "Falha ao fechar sessão incompleta");
            }
            return Err(err);
        }

        info!(partition = %self.partition, "Sessão pronta");
        self.driver = Some(driver);
        Ok(())
    }

    async fn prepare(&self, driver: &dyn RemoteDriver) -> DriverResult<()> {
        driver.navigate_to(&self.settings.login_url).await?;
        driver.login(&self.settings.credentials()).await?;
        driver.open_module(&self.settings.module_path()).await?;
        driver.sort_ascending_by(&self.sort_column).await
    }

    pub async fn teardown(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.close().await {
                warn!(partition = %self.partition, error = %err, "Falha ao fechar navegador");
            }
        }
    }

    /// Fecha e reabre a sessão. Uma falha no primeiro establish ganha mais
    /// uma tentativa completa antes do erro subir.
    #[instrument(skip(self), fields(partition = %self.partition))]
    pub async fn restart(&mut self) -> DriverResult<()> {
        info!("Reiniciando navegador");
        self.teardown().await;
        sleep(self.settings.restart_pause()).await;

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "Reinício falhou, tentando de novo");
                self.teardown().await;
                sleep(self.settings.restart_pause()).await;
                self.establish().await
            }
        }
    }
}
