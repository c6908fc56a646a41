//! # Módulo de Erros Estruturados
//!
//! Define a taxonomia de falhas do robô: códigos padronizados para relatórios
//! e os tipos de erro que atravessam as fronteiras do motor (driver, registro).
//!
//! ## Para todos entenderem:
//!
//! Quando um cadastro não pode ser atualizado, queremos saber *por quê* sem
//! abrir o log inteiro. Cada falha recebe um código curto que vai parar na
//! planilha de erros e que diz se o problema é do dado ou do ambiente.
//!
//! ## Categorias de Erro
//!
//! | Faixa  | Categoria    | Descrição                                   |
//! |--------|--------------|---------------------------------------------|
//! | E1xxx  | Localização  | Código não encontrado na listagem           |
//! | E2xxx  | Formulário   | Tela de edição não ficou pronta             |
//! | E3xxx  | Salvamento   | Sistema remoto rejeitou a gravação          |
//! | E4xxx  | Ambiente     | Sessão do navegador, checkpoint, config     |
//! | E5xxx  | Interno      | Falha inesperada na camada de automação     |
//!
//! ## Dado vs. ambiente
//!
//! Falhas de dado (`NotFound`, `SaveRejected`) não justificam reabrir o
//! navegador. Falhas de ambiente (`FormTimeout`, `UnknownFailure`,
//! `SessionLost`) indicam que a tela não está mais onde o robô acha que
//! está, e disparam o reinício da sessão no controlador de retry.

use std::fmt;
use thiserror::Error;

// ============================================================================
// CÓDIGO DE ERRO
// ============================================================================

/// Código de erro estruturado com categoria e número.
///
/// Primeiro dígito = categoria, últimos 3 = erro específico.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // ========================================================================
    // E1xxx: Localização
    // ========================================================================

    /// Código não apareceu na busca nem nas páginas seguintes.
    pub const RECORD_NOT_FOUND: Self = Self(1001);

    // ========================================================================
    // E2xxx: Formulário
    // ========================================================================

    /// Formulário de edição não carregou dentro do prazo.
    pub const FORM_TIMEOUT: Self = Self(2001);

    // ========================================================================
    // E3xxx: Salvamento
    // ========================================================================

    /// Validação do sistema remoto recusou o cadastro.
    pub const SAVE_REJECTED: Self = Self(3001);

    // ========================================================================
    // E4xxx: Ambiente
    // ========================================================================

    /// Sessão do navegador indisponível (não estabelecida ou perdida).
    pub const SESSION_LOST: Self = Self(4001);

    /// Arquivo de checkpoint não pôde ser lido ou gravado.
    pub const CHECKPOINT_IO: Self = Self(4002);

    /// Configuração inválida (ranges, arquivos, credenciais).
    pub const INVALID_CONFIG: Self = Self(4003);

    // ========================================================================
    // E5xxx: Interno
    // ========================================================================

    /// Exceção inesperada vinda do driver.
    pub const UNKNOWN_FAILURE: Self = Self(5001);

    // ========================================================================
    // MÉTODOS
    // ========================================================================

    /// Retorna o código formatado com prefixo "E".
    ///
    /// Exemplo: ErrorCode::RECORD_NOT_FOUND.formatted() == "E1001"
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    /// Retorna a categoria do erro baseado no primeiro dígito.
    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Locate,
            2 => ErrorCategory::Form,
            3 => ErrorCategory::Save,
            4 => ErrorCategory::Environment,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Descrição curta, usada nos logs e na planilha de erros.
    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "Código não encontrado",
            2001 => "Formulário não carregou",
            3001 => "Salvamento rejeitado",
            4001 => "Sessão indisponível",
            4002 => "Falha de checkpoint",
            4003 => "Configuração inválida",
            5001 => "Falha inesperada",
            _ => "Erro desconhecido",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// CATEGORIA DE ERRO
// ============================================================================

/// Categoria de erro baseada no primeiro dígito do código.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Locate,
    Form,
    Save,
    Environment,
    Internal,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locate => write!(f, "Localização"),
            Self::Form => write!(f, "Formulário"),
            Self::Save => write!(f, "Salvamento"),
            Self::Environment => write!(f, "Ambiente"),
            Self::Internal => write!(f, "Interno"),
            Self::Unknown => write!(f, "Desconhecido"),
        }
    }
}

// ============================================================================
// ERROS DO DRIVER
// ============================================================================

/// Erros levantados pela camada de automação do navegador.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("elemento não encontrado: {0}")]
    ElementNotFound(String),

    #[error("sessão do navegador encerrada")]
    SessionClosed,

    #[error("falha ao executar script na página: {0}")]
    Script(String),

    #[error("falha no WebDriver: {0}")]
    WebDriver(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// FALHAS POR REGISTRO
// ============================================================================

/// Motivo pelo qual um registro saiu da máquina de estados em `Failed`.
///
/// Tudo que acontece dentro de um registro vira um destes valores; nada
/// atravessa a fronteira do processador como pânico ou erro fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordFailure {
    #[error("código {key} não encontrado após {pages_scanned} página(s)")]
    NotFound { key: String, pages_scanned: u32 },

    #[error("formulário de edição não ficou pronto: {0}")]
    FormTimeout(String),

    #[error("salvamento rejeitado: {0}")]
    SaveRejected(String),

    #[error("falha inesperada no driver: {0}")]
    UnknownFailure(String),

    #[error("sessão indisponível: {0}")]
    SessionLost(String),
}

impl RecordFailure {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::RECORD_NOT_FOUND,
            Self::FormTimeout(_) => ErrorCode::FORM_TIMEOUT,
            Self::SaveRejected(_) => ErrorCode::SAVE_REJECTED,
            Self::UnknownFailure(_) => ErrorCode::UNKNOWN_FAILURE,
            Self::SessionLost(_) => ErrorCode::SESSION_LOST,
        }
    }

    /// Falhas de ambiente pedem reinício da sessão antes da próxima tentativa.
    pub fn triggers_restart(&self) -> bool {
        matches!(
            self,
            Self::FormTimeout(_) | Self::UnknownFailure(_) | Self::SessionLost(_)
        )
    }

    /// Falhas de dado: o navegador está bem, o registro é que tem problema.
    pub fn is_data_problem(&self) -> bool {
        !self.triggers_restart()
    }

    /// Discriminante estável, usado para detectar falhas repetidas.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::FormTimeout(_) => "form_timeout",
            Self::SaveRejected(_) => "save_rejected",
            Self::UnknownFailure(_) => "unknown_failure",
            Self::SessionLost(_) => "session_lost",
        }
    }
}

impl From<DriverError> for RecordFailure {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::SessionClosed => Self::SessionLost(err.to_string()),
            other => Self::UnknownFailure(other.to_string()),
        }
    }
}
