//! # Normalizador de Campos
//!
//! Transforma os valores crus da planilha na representação que o formulário
//! remoto espera. Funções puras: mesma entrada, mesma saída, sem I/O.
//!
//! ## O que é feito aqui:
//!
//! - Separação de endereço e número (`"Rua das Flores 123"` → `"Rua das Flores"`, `"123"`)
//! - CNPJ/CPF só com dígitos e zeros à esquerda (14 ou 11 posições)
//! - CEP e telefone só com dígitos
//! - Valores padrão para campos obrigatórios vazios, com registro de cada substituição
//!
//! A separação de endereço é heurística. Ela é validada por exemplos, não
//! por uma gramática formal.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::{FormField, PersonType, SourceRecord};

/// Marcador canônico de "sem número".
pub const NO_NUMBER: &str = "S/N";

/// Tamanho máximo aceito para o número "longo" (ex: "12 KM").
const MAX_LONG_NUMBER_LEN: usize = 15;

/// Número no fim com sufixo curto: "123", "123 A", "123-B".
static TRAILING_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s+(\d+[\s\-]?[A-Za-z]?)$").expect("valid trailing number regex")
});

/// Número mais longo no fim, típico de rodovias: "BR 285 12 KM".
static TRAILING_PHRASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s+(\d+(?:\s+[A-Za-z]+\s*\d*)?)$").expect("valid trailing phrase regex")
});

// ============================================================================
// COLUNAS DA PLANILHA
// ============================================================================

/// Nomes das colunas do export processado.
pub mod columns {
    pub const KEY: &str = "pessoa";
    pub const NAME: &str = "nome";
    pub const LEGAL_NAME: &str = "razaosocial";
    pub const ADDRESS: &str = "endereco";
    pub const ADDRESS_SPLIT: &str = "endereco_separado";
    pub const ADDRESS_NUMBER: &str = "numero_endereco";
    pub const COMPLEMENT: &str = "complemento";
    pub const NEIGHBORHOOD: &str = "bairro";
    pub const POSTAL_CODE: &str = "cep";
    pub const PHONE: &str = "telefone";
    pub const EMAIL: &str = "email";
    pub const DOCUMENT: &str = "cnpj_cpf";
    pub const PERSON_FLAG: &str = "indfisjur";
    pub const STATE_REGISTRATION: &str = "inscrestad_rg";
    pub const MUNICIPAL_REGISTRATION: &str = "inscmunicipal";
    pub const ACTIVE: &str = "indAtivoSimNao";
}

// ============================================================================
// VALORES PADRÃO
// ============================================================================

/// Valores injetados quando um campo obrigatório ficaria vazio.
///
/// O preço é colocar dado fictício no cadastro. Por isso cada uso fica
/// registrado no `NormalizedFieldSet` e é contado no resumo da execução.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequiredDefaults {
    pub phone: String,
    pub email: String,
    pub postal_code: String,
    pub street: String,
    pub neighborhood: String,
    pub number: String,
}

impl Default for RequiredDefaults {
    fn default() -> Self {
        Self {
            phone: "4199999999".to_string(),
            email: "naotem@email.com".to_string(),
            postal_code: "80000000".to_string(),
            street: "NAO INFORMADO".to_string(),
            neighborhood: "CENTRO".to_string(),
            number: NO_NUMBER.to_string(),
        }
    }
}

impl RequiredDefaults {
    /// Valor padrão do campo, se ele for obrigatório e tiver padrão configurado.
    pub fn get(&self, field: FormField) -> Option<&str> {
        let value = match field {
            FormField::Phone => &self.phone,
            FormField::Email => &self.email,
            FormField::PostalCode => &self.postal_code,
            FormField::Street => &self.street,
            FormField::Neighborhood => &self.neighborhood,
            FormField::Number => &self.number,
            _ => return None,
        };
        Some(value.as_str()).filter(|v| !v.is_empty())
    }
}

// ============================================================================
// CONJUNTO NORMALIZADO
// ============================================================================

/// Origem do valor de um campo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrigin {
    Source,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldValue {
    value: String,
    origin: ValueOrigin,
}

/// Conjunto fechado de valores prontos para o formulário.
///
/// Garantias (verificadas na construção):
/// - todo campo obrigatório está presente (da planilha ou do padrão);
/// - o documento tem 14 (CNPJ) ou 11 (CPF) dígitos, ou está vazio;
/// - CEP e telefone contêm apenas dígitos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFieldSet {
    values: BTreeMap<FormField, FieldValue>,
    document: String,
    person_type: PersonType,
    active: bool,
}

impl NormalizedFieldSet {
    pub fn person_type(&self) -> PersonType {
        self.person_type
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Documento formatado, `None` quando a planilha não tem documento.
    pub fn document(&self) -> Option<&str> {
        Some(self.document.as_str()).filter(|d| !d.is_empty())
    }

    pub fn get(&self, field: FormField) -> Option<&str> {
        if field.is_document() {
            return (field == self.person_type.document_field())
                .then(|| self.document())
                .flatten();
        }
        self.values.get(&field).map(|v| v.value.as_str())
    }

    /// Valor vindo da planilha (ignora padrões). Base da detecção de divergência.
    pub fn source_value(&self, field: FormField) -> Option<&str> {
        self.values
            .get(&field)
            .filter(|v| v.origin == ValueOrigin::Source)
            .map(|v| v.value.as_str())
    }

    pub fn is_defaulted(&self, field: FormField) -> bool {
        self.values
            .get(&field)
            .map(|v| v.origin == ValueOrigin::Default)
            .unwrap_or(false)
    }

    /// Campos que receberam valor padrão.
    pub fn defaulted(&self) -> Vec<FormField> {
        self.values
            .keys()
            .copied()
            .filter(|f| self.is_defaulted(*f))
            .collect()
    }

    /// Campos não identificadores, na ordem de preenchimento.
    pub fn inputs(&self) -> impl Iterator<Item = (FormField, &str)> {
        self.values.iter().map(|(f, v)| (*f, v.value.as_str()))
    }

    fn validate(&self) -> Result<(), String> {
        for field in FormField::REQUIRED {
            if self.values.get(&field).map_or(true, |v| v.value.is_empty()) {
                return Err(format!("campo obrigatório {} vazio", field));
            }
        }
        if !self.document.is_empty() && self.document.len() < self.person_type.document_len() {
            return Err(format!("documento com {} dígitos", self.document.len()));
        }
        for (field, value) in &self.values {
            if field.is_numeric() && !value.value.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("campo numérico {} com caracteres", field));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TRANSFORMAÇÕES
// ============================================================================

/// Separa um endereço livre em (logradouro, número).
///
/// Ordem de tentativa:
/// 1. termina com "S/N", "SN" ou "S.N" → remove o marcador, número "S/N"
/// 2. tem vírgula e o trecho após a última começa com dígito → esse trecho é o número
/// 3. número no fim com sufixo curto ("123", "123 A", "123-B")
/// 4. número longo no fim ("12 KM"), aceito só se tiver até 15 caracteres
/// 5. nada encontrado → endereço inteiro, número "S/N"
pub fn split_address(raw: &str) -> (String, String) {
    let address = raw.trim();
    if address.is_empty() {
        return (String::new(), NO_NUMBER.to_string());
    }

    if let Some(street) = strip_no_number_marker(address) {
        return (street, NO_NUMBER.to_string());
    }

    if let Some((street, tail)) = address.rsplit_once(',') {
        let tail = tail.trim();
        if tail.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return (street.trim().to_string(), tail.to_string());
        }
    }

    if let Some((start, number)) = trailing(&TRAILING_NUMBER_RE, address) {
        return (address[..start].trim().to_string(), number.to_string());
    }

    if let Some((start, number)) = trailing(&TRAILING_PHRASE_RE, address) {
        if number.len() <= MAX_LONG_NUMBER_LEN {
            return (address[..start].trim().to_string(), number.to_string());
        }
    }

    (address.to_string(), NO_NUMBER.to_string())
}

/// Início do casamento e o número capturado.
fn trailing<'a>(re: &Regex, address: &'a str) -> Option<(usize, &'a str)> {
    let caps = re.captures(address)?;
    let start = caps.get(0)?.start();
    let number = caps.get(1)?.as_str().trim();
    Some((start, number))
}

/// Remove "S/N", "SN" ou "S.N" do fim, desde que sejam uma palavra isolada.
fn strip_no_number_marker(address: &str) -> Option<String> {
    let upper = address.to_ascii_uppercase();
    for marker in ["S/N", "S.N", "SN"] {
        if let Some(rest) = upper.strip_suffix(marker) {
            let boundary = rest
                .chars()
                .last()
                .map_or(true, |c| c.is_whitespace() || c == ',');
            if boundary {
                let street = address[..rest.len()]
                    .trim_end_matches(|c: char| c.is_whitespace() || c == ',');
                return Some(street.to_string());
            }
        }
    }
    None
}

/// Apenas os dígitos do valor.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Formata CNPJ/CPF: só dígitos, zeros à esquerda até 14 (PJ) ou 11 (PF).
///
/// Entrada vazia (ou sem nenhum dígito) resulta em string vazia.
pub fn format_document(raw: &str, person_type: PersonType) -> String {
    let digits = digits_only(raw);
    if digits.is_empty() {
        return digits;
    }
    format!("{:0>width$}", digits, width = person_type.document_len())
}

/// Flag `indAtivoSimNao`: só um "Não" explícito desativa o cadastro.
pub fn is_active(flag: Option<&str>) -> bool {
    match flag {
        Some(v) => {
            let upper = v.trim().to_uppercase();
            upper != "NÃO" && upper != "NAO"
        }
        None => true,
    }
}

/// Normaliza um registro da planilha para o formulário remoto.
pub fn normalize(record: &SourceRecord, defaults: &RequiredDefaults) -> NormalizedFieldSet {
    use columns::*;

    let person_type = record.person_type;
    let mut values: BTreeMap<FormField, FieldValue> = BTreeMap::new();
    let mut put = |field: FormField, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            values.insert(
                field,
                FieldValue {
                    value,
                    origin: ValueOrigin::Source,
                },
            );
        }
    };

    // Planilha processada já traz endereço e número separados; senão separamos aqui.
    let (street, number) = match record.get(ADDRESS_SPLIT) {
        Some(street) => (
            street.to_string(),
            record
                .get(ADDRESS_NUMBER)
                .map(str::to_string)
                .unwrap_or_else(|| NO_NUMBER.to_string()),
        ),
        None => split_address(record.get(ADDRESS).unwrap_or_default()),
    };

    put(FormField::TradeName, record.get(NAME).map(str::to_string));
    put(FormField::LegalName, record.get(LEGAL_NAME).map(str::to_string));
    put(FormField::Street, Some(street));
    put(FormField::Number, Some(number));
    put(FormField::Complement, record.get(COMPLEMENT).map(str::to_string));
    put(FormField::Neighborhood, record.get(NEIGHBORHOOD).map(str::to_string));
    put(FormField::PostalCode, record.get(POSTAL_CODE).map(digits_only));
    put(FormField::Phone, record.get(PHONE).map(digits_only));
    put(FormField::Email, record.get(EMAIL).map(str::to_string));

    let registration = match person_type {
        PersonType::Organization => FormField::StateRegistration,
        PersonType::Individual => FormField::IdentityNumber,
    };
    put(registration, record.get(STATE_REGISTRATION).map(str::to_string));
    put(
        FormField::MunicipalRegistration,
        record.get(MUNICIPAL_REGISTRATION).map(str::to_string),
    );

    for field in FormField::REQUIRED {
        if values.contains_key(&field) {
            continue;
        }
        if let Some(default) = defaults.get(field) {
            values.insert(
                field,
                FieldValue {
                    value: default.to_string(),
                    origin: ValueOrigin::Default,
                },
            );
        }
    }

    let set = NormalizedFieldSet {
        values,
        document: format_document(record.get(DOCUMENT).unwrap_or_default(), person_type),
        person_type,
        active: is_active(record.get(ACTIVE)),
    };

    if let Err(violation) = set.validate() {
        // Só acontece com padrões mal configurados (ex: telefone padrão com letras).
        tracing::warn!(key = %record.key, violation = %violation, "Conjunto normalizado fora do contrato");
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SourceRecord;

    fn record(person_type: PersonType, pairs: &[(&str, &str)]) -> SourceRecord {
        SourceRecord {
            index: 0,
            key: "100".into(),
            label: "Fornecedor Teste".into(),
            person_type,
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn split(raw: &str) -> (String, String) {
        split_address(raw)
    }

    #[test]
    fn test_split_address_trailing_number() {
        assert_eq!(split("Rua das Flores 123"), ("Rua das Flores".into(), "123".into()));
    }

    #[test]
    fn test_split_address_after_comma() {
        assert_eq!(split("Av Brasil, 456"), ("Av Brasil".into(), "456".into()));
        assert_eq!(split("Rua XV, 1200 sala 3"), ("Rua XV".into(), "1200 sala 3".into()));
    }

    #[test]
    fn test_split_address_number_with_letter() {
        assert_eq!(split("Rua ABC 123 A"), ("Rua ABC".into(), "123 A".into()));
        assert_eq!(split("Rua ABC 123-B"), ("Rua ABC".into(), "123-B".into()));
    }

    #[test]
    fn test_split_address_without_number() {
        assert_eq!(split("Rua sem numero"), ("Rua sem numero".into(), "S/N".into()));
        assert_eq!(split(""), ("".into(), "S/N".into()));
    }

    #[test]
    fn test_split_address_explicit_marker() {
        assert_eq!(split("Rua X S/N"), ("Rua X".into(), "S/N".into()));
        assert_eq!(split("Rua X sn"), ("Rua X".into(), "S/N".into()));
        assert_eq!(split("Rua X, S.N"), ("Rua X".into(), "S/N".into()));
    }

    #[test]
    fn test_split_address_marker_needs_word_boundary() {
        // "JOSN" não é marcador: sem espaço antes do "SN".
        assert_eq!(split("Rua Josn"), ("Rua Josn".into(), "S/N".into()));
    }

    #[test]
    fn test_split_address_highway_marker() {
        assert_eq!(split("Estrada Velha 12 KM"), ("Estrada Velha".into(), "12 KM".into()));
    }

    #[test]
    fn test_split_address_rejects_long_phrase() {
        // Frase longa demais para ser número: fica tudo no logradouro.
        let raw = "Rodovia 12 Quilometragemmuitolonga";
        assert_eq!(split(raw), (raw.to_string(), "S/N".into()));
    }

    #[test]
    fn test_format_document_organization_unchanged() {
        assert_eq!(
            format_document("12345678000195", PersonType::Organization),
            "12345678000195"
        );
        assert_eq!(
            format_document("12.345.678/0001-95", PersonType::Organization),
            "12345678000195"
        );
    }

    #[test]
    fn test_format_document_pads_individual() {
        assert_eq!(format_document("123456789", PersonType::Individual), "00123456789");
        assert_eq!(format_document("345678000195", PersonType::Organization), "00345678000195");
    }

    #[test]
    fn test_format_document_empty_input() {
        assert_eq!(format_document("", PersonType::Individual), "");
        assert_eq!(format_document("--", PersonType::Organization), "");
    }

    #[test]
    fn test_is_active() {
        assert!(is_active(None));
        assert!(is_active(Some("Sim")));
        assert!(!is_active(Some("Não")));
        assert!(!is_active(Some("nao")));
    }

    #[test]
    fn test_normalize_applies_defaults_and_tracks_them() {
        let rec = record(
            PersonType::Organization,
            &[("nome", "ACME"), ("endereco", "Rua A 10"), ("cep", "80.000-123")],
        );
        let set = normalize(&rec, &RequiredDefaults::default());

        assert_eq!(set.get(FormField::Street), Some("Rua A"));
        assert_eq!(set.get(FormField::Number), Some("10"));
        assert_eq!(set.get(FormField::PostalCode), Some("80000123"));
        assert_eq!(set.get(FormField::Phone), Some("4199999999"));
        assert_eq!(set.get(FormField::Email), Some("naotem@email.com"));
        assert_eq!(set.get(FormField::Neighborhood), Some("CENTRO"));

        let defaulted = set.defaulted();
        assert_eq!(
            defaulted,
            vec![FormField::Neighborhood, FormField::Phone, FormField::Email]
        );
        assert_eq!(set.source_value(FormField::Phone), None);
        assert_eq!(set.source_value(FormField::Street), Some("Rua A"));
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_normalize_prefers_presplit_columns() {
        let rec = record(
            PersonType::Organization,
            &[
                ("endereco", "Rua Errada 1"),
                ("endereco_separado", "Rua Certa"),
                ("numero_endereco", "77"),
            ],
        );
        let set = normalize(&rec, &RequiredDefaults::default());

        assert_eq!(set.get(FormField::Street), Some("Rua Certa"));
        assert_eq!(set.get(FormField::Number), Some("77"));
    }

    #[test]
    fn test_normalize_document_and_registration_by_person_type() {
        let rec = record(
            PersonType::Individual,
            &[("cnpj_cpf", "123.456.789"), ("inscrestad_rg", "9876543")],
        );
        let set = normalize(&rec, &RequiredDefaults::default());

        assert_eq!(set.document(), Some("00123456789"));
        assert_eq!(set.get(FormField::Cpf), Some("00123456789"));
        assert_eq!(set.get(FormField::Cnpj), None);
        assert_eq!(set.get(FormField::IdentityNumber), Some("9876543"));
        assert_eq!(set.get(FormField::StateRegistration), None);
        assert!(set.inputs().all(|(f, _)| !f.is_document()));
    }

    #[test]
    fn test_normalize_phone_digits_only() {
        let rec = record(PersonType::Organization, &[("telefone", "(41) 3333-4444")]);
        let set = normalize(&rec, &RequiredDefaults::default());
        assert_eq!(set.get(FormField::Phone), Some("4133334444"));
        assert!(!set.is_defaulted(FormField::Phone));
    }
}
