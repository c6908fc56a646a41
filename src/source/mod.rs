//! # Leitura da Planilha Processada
//!
//! Carrega o export do ERP (CSV ou JSON) como uma sequência ordenada de
//! `SourceRecord`. A posição de cada linha vira o índice estável usado por
//! partições e checkpoints, então a ordem do arquivo nunca é alterada.
//!
//! ## Formatos aceitos:
//!
//! - CSV com `;` ou `,` (detectado pela linha de cabeçalho)
//! - JSON: array de objetos `{ "pessoa": 123, "nome": "...", ... }`
//!
//! Exports gerados por planilha costumam trazer números como `12345.0` e
//! células vazias como `nan`; os dois casos são limpos aqui.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::normalizer::columns;
use crate::protocol::{PersonType, SourceRecord};

/// Carrega o arquivo de dados, escolhendo o formato pela extensão ou conteúdo.
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<SourceRecord>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read data file {:?}", path))?;
    let content = content.trim_start_matches('\u{feff}');

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
        || content.trim_start().starts_with('[');

    let records = if is_json {
        parse_json(content).with_context(|| format!("Failed to parse data JSON {:?}", path))?
    } else {
        parse_csv(content).with_context(|| format!("Failed to parse data CSV {:?}", path))?
    };

    info!(path = ?path, records = records.len(), "Planilha carregada");
    Ok(records)
}

/// `;` quando o cabeçalho tem mais `;` do que `,`.
fn detect_delimiter(content: &str) -> u8 {
    let header = content.lines().next().unwrap_or_default();
    let semicolons = header.matches(';').count();
    let commas = header.matches(',').count();
    if semicolons >= commas && semicolons > 0 {
        b';'
    } else {
        b','
    }
}

/// Limpa artefatos de planilha: `12345.0` → `12345`, `nan` → vazio.
fn clean_cell(raw: &str) -> String {
    let value = raw.trim();
    if value.eq_ignore_ascii_case("nan") || value.eq_ignore_ascii_case("null") {
        return String::new();
    }
    match value.strip_suffix(".0") {
        Some(int) if !int.is_empty() && int.chars().all(|c| c.is_ascii_digit()) => int.to_string(),
        _ => value.to_string(),
    }
}

pub fn parse_csv(content: &str) -> Result<Vec<SourceRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(detect_delimiter(content))
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if !headers.iter().any(|h| h == columns::KEY) {
        bail!("coluna '{}' ausente no cabeçalho", columns::KEY);
    }

    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let row = result.with_context(|| format!("linha {} ilegível", line + 2))?;
        let fields: BTreeMap<String, String> = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.clone(), clean_cell(v)))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        rows.push(fields);
    }
    Ok(into_records(rows))
}

pub fn parse_json(content: &str) -> Result<Vec<SourceRecord>> {
    let values: Vec<BTreeMap<String, Value>> = serde_json::from_str(content)?;
    let mut rows = Vec::with_capacity(values.len());
    for (i, object) in values.into_iter().enumerate() {
        if !object.contains_key(columns::KEY) {
            bail!("objeto {} sem a coluna '{}'", i, columns::KEY);
        }
        let fields = object
            .into_iter()
            .filter_map(|(k, v)| {
                let text = match v {
                    Value::Null => return None,
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Some((k, clean_cell(&text))).filter(|(_, v)| !v.is_empty())
            })
            .collect();
        rows.push(fields);
    }
    Ok(into_records(rows))
}

/// Linha sem código fica no lugar com `key` vazio; o worker a pula. Assim o
/// índice de toda linha é a posição dela na planilha.
fn into_records(rows: Vec<BTreeMap<String, String>>) -> Vec<SourceRecord> {
    rows.into_iter()
        .enumerate()
        .map(|(index, fields)| {
            let key = fields.get(columns::KEY).cloned().unwrap_or_default();
            if key.is_empty() {
                warn!(row = index, "Linha sem código, não será processada");
            }
            SourceRecord {
                index,
                label: fields.get(columns::NAME).cloned().unwrap_or_default(),
                person_type: PersonType::from_flag(fields.get(columns::PERSON_FLAG).map(String::as_str)),
                key,
                fields,
            }
        })
        .collect()
}
