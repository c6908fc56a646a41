// Module: Protocol
// Data model shared by every stage: source rows, remote form fields and the
// entries persisted in checkpoints and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Radio group that switches the form between CNPJ and CPF.
pub const PERSON_TYPE_GROUP: &str = "cf_tipo_pessoa";

/// Radio group with the active/inactive flag.
pub const ACTIVE_GROUP: &str = "cf_ativo";

/// Person type of a cadastro. Decides which document field and length apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonType {
    /// Pessoa Jurídica, identified by CNPJ (14 digits).
    Organization,
    /// Pessoa Física, identified by CPF (11 digits).
    Individual,
}

impl PersonType {
    /// Source flag `indfisjur`: only an explicit `F` means individual.
    pub fn from_flag(flag: Option<&str>) -> Self {
        match flag.map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("F") => Self::Individual,
            _ => Self::Organization,
        }
    }

    pub fn document_len(self) -> usize {
        match self {
            Self::Organization => 14,
            Self::Individual => 11,
        }
    }

    pub fn document_field(self) -> FormField {
        match self {
            Self::Organization => FormField::Cnpj,
            Self::Individual => FormField::Cpf,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Organization => Self::Individual,
            Self::Individual => Self::Organization,
        }
    }

    /// Value of the person type radio in the remote form.
    pub fn radio_value(self) -> &'static str {
        match self {
            Self::Organization => "Jurídica",
            Self::Individual => "Física",
        }
    }

    pub fn document_name(self) -> &'static str {
        match self {
            Self::Organization => "CNPJ",
            Self::Individual => "CPF",
        }
    }
}

/// Closed set of remote form fields the robot reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormField {
    TradeName,
    LegalName,
    Street,
    Number,
    Complement,
    Neighborhood,
    PostalCode,
    Phone,
    SecondaryPhone,
    Email,
    PurchasingEmail,
    StateRegistration,
    IdentityNumber,
    MunicipalRegistration,
    Cnpj,
    Cpf,
}

impl FormField {
    /// Fields that must be non-empty for the remote server-side validation.
    pub const REQUIRED: [FormField; 6] = [
        FormField::Phone,
        FormField::Email,
        FormField::PostalCode,
        FormField::Street,
        FormField::Neighborhood,
        FormField::Number,
    ];

    /// Fields the registry lookup may overwrite after the document is typed.
    pub const OBSERVABLE: [FormField; 11] = [
        FormField::TradeName,
        FormField::LegalName,
        FormField::PostalCode,
        FormField::Street,
        FormField::Number,
        FormField::Complement,
        FormField::Neighborhood,
        FormField::Phone,
        FormField::SecondaryPhone,
        FormField::Email,
        FormField::PurchasingEmail,
    ];

    /// Remote field id (without the `id_sc_field_` prefix).
    pub fn remote_id(self) -> &'static str {
        match self {
            Self::TradeName => "cf_nome_fantasia",
            Self::LegalName => "cf_nome_razao",
            Self::Street => "cf_endereco",
            Self::Number => "cf_endereco_nro",
            Self::Complement => "cf_end_complemento",
            Self::Neighborhood => "cf_bairro",
            Self::PostalCode => "cf_cepx",
            Self::Phone => "cf_telefone1x",
            Self::SecondaryPhone => "cf_telefone2x",
            Self::Email => "cf_email",
            Self::PurchasingEmail => "cf_email_compras",
            Self::StateRegistration => "cf_inscr_est",
            Self::IdentityNumber => "cf_ci",
            Self::MunicipalRegistration => "cf_inscrmunicipio",
            Self::Cnpj => "cf_cnpjx",
            Self::Cpf => "cf_cpfx",
        }
    }

    pub fn is_document(self) -> bool {
        matches!(self, Self::Cnpj | Self::Cpf)
    }

    /// Numeric fields are compared and stored as digits only.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::PostalCode | Self::Phone | Self::SecondaryPhone | Self::Cnpj | Self::Cpf
        )
    }
}

impl fmt::Display for FormField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.remote_id())
    }
}

/// One row of the data set. Immutable after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Stable 0-based position in the ordered data set.
    pub index: usize,
    /// Business key (`pessoa`), the code shown in the remote listing.
    pub key: String,
    /// Human label for logs and reports (`nome`).
    pub label: String,
    pub person_type: PersonType,
    /// Raw column values, already trimmed; absent columns are simply missing.
    pub fields: BTreeMap<String, String>,
}

impl SourceRecord {
    /// Returns the raw value of a column when present and non-blank.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Builds a record from column pairs; label and person type come from
    /// `nome` and `indfisjur` like in ingestion.
    #[cfg(test)]
    pub fn sample(index: usize, key: &str, pairs: &[(&str, &str)]) -> Self {
        let fields: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            index,
            key: key.to_string(),
            label: fields.get("nome").cloned().unwrap_or_default(),
            person_type: PersonType::from_flag(fields.get("indfisjur").map(String::as_str)),
            fields,
        }
    }
}

/// Checkpoint row for a record that finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedEntry {
    pub index: usize,
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

/// Checkpoint row for a record that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub index: usize,
    pub key: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Remote auto-population disagreed with the source for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceEntry {
    pub key: String,
    pub label: String,
    pub field: String,
    pub remote_value: String,
    pub source_value: String,
    pub timestamp: DateTime<Utc>,
}

/// One per record that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub index: usize,
    pub key: String,
    pub label: String,
    pub code: String,
    pub error: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}
