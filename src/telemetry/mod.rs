//! # Módulo de Telemetria
//!
//! Liga os logs estruturados (`tracing`) a três destinos:
//!
//! - console, compartilhado por todos os workers do processo
//! - arquivo de log da execução (opcional)
//! - coletor OpenTelemetry via OTLP (opcional)
//!
//! ## Para todos entenderem:
//!
//! Com vários workers rodando ao mesmo tempo, duas linhas de log podem
//! tentar sair no console no mesmo instante e se misturar. A camada de
//! console escreve através de um `Mutex<Stdout>`: o lock é pego só para
//! formatar e emitir uma linha, e solto em seguida.
//!
//! Cada registro processado vira um span (`process`) com `index` e `key`,
//! então no Jaeger/Tempo dá para ver quanto tempo cada cadastro levou e em
//! qual etapa ele falhou.
//!
//! ## Configuração via variáveis de ambiente:
//!
//! - `RUST_LOG`: filtro de nível (vence o `log_level` da configuração)
//! - `OTEL_SERVICE_NAME`: Nome do serviço
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: URL do coletor OTLP
//! - `OTEL_TRACES_SAMPLER_ARG`: Taxa de sampling (0.0-1.0)

use anyhow::Context;
use chrono::Local;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Nome do serviço nos traces.
    pub service_name: String,

    /// Endpoint OTLP (ex: "http://localhost:4317"). Se None, sem exporter.
    pub otlp_endpoint: Option<String>,

    /// Taxa de sampling (0.0 a 1.0).
    pub sampling_ratio: f64,

    pub enable_console_logging: bool,

    /// Arquivo de log da execução, sem cores.
    pub log_file: Option<PathBuf>,

    /// Nível mínimo quando `RUST_LOG` não está definido.
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sync-runner".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_file: None,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Padrão + variáveis `OTEL_*` do processo.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("OTEL_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.otlp_endpoint = Some(endpoint);
        }
        if let Some(ratio) = lookup("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                self.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }
    }

    /// Nível a partir do texto da configuração; texto inválido vira INFO.
    pub fn with_level(mut self, level: &str) -> Self {
        self.log_level = level.trim().parse().unwrap_or(Level::INFO);
        self
    }

    /// `<dir>/sync_<partição>_<AAAAMMDD_HHMMSS>.log`
    pub fn log_file_for(dir: &Path, label: &str) -> PathBuf {
        dir.join(format!("sync_{}_{}.log", label, Local::now().format("%Y%m%d_%H%M%S")))
    }
}

// ============================================================================
// INICIALIZAÇÃO
// ============================================================================

/// Instala o subscriber global.
///
/// ## Retorno:
///
/// - `Ok(Some(Tracer))`: OTLP configurado
/// - `Ok(None)`: apenas console/arquivo
/// - `Err`: arquivo de log inacessível, exporter inválido ou subscriber já instalado
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    let tracer = match &config.otlp_endpoint {
        Some(endpoint) => Some(init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?),
        None => None,
    };
    let otel_layer = tracer.clone().map(OpenTelemetryLayer::new);

    let console_layer = config.enable_console_logging.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(Mutex::new(io::stdout()))
    });

    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).with_context(|| format!("Failed to create log dir {:?}", dir))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &config.otlp_endpoint {
        Some(endpoint) => tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "Telemetria OTEL inicializada"
        ),
        None => tracing::debug!("Telemetria inicializada (sem OTLP)"),
    }
    if let Some(path) = &config.log_file {
        tracing::info!(path = ?path, "Log em arquivo");
    }

    Ok(tracer)
}

// ============================================================================
// TRACER OTLP
// ============================================================================

fn init_otlp_tracer(service_name: &str, endpoint: &str, sampling_ratio: f64) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}

// ============================================================================
// ENCERRAMENTO
// ============================================================================

/// Flush dos spans pendentes. Chamar antes de sair do processo.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "sync-runner");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(config.enable_console_logging);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_overrides_clamp_sampling() {
        let env: HashMap<&str, &str> = [
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://jaeger:4317"),
            ("OTEL_TRACES_SAMPLER_ARG", "7"),
        ]
        .into_iter()
        .collect();
        let mut config = TelemetryConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://jaeger:4317"));
        assert_eq!(config.sampling_ratio, 1.0);
    }

    #[test]
    fn test_level_from_text() {
        assert_eq!(TelemetryConfig::default().with_level("debug").log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::default().with_level("barulho").log_level, Level::INFO);
    }

    #[test]
    fn test_log_file_name() {
        let path = TelemetryConfig::log_file_for(Path::new("/tmp/saida"), "inst2");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sync_inst2_"));
        assert!(name.ends_with(".log"));
        assert!(path.starts_with("/tmp/saida"));
    }
}
