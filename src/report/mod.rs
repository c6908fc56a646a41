// Module: Report
// Divergence and error sheets of one partition, appended as CSV
// (`divergences_<id>.csv`, `errors_<id>.csv`, `;`-separated for spreadsheet
// users). Also counts default substitutions for the run summary.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::protocol::{DivergenceEntry, ErrorEntry, FormField};

pub struct Reporter {
    dir: PathBuf,
    partition: String,
    pending_divergences: Vec<DivergenceEntry>,
    pending_errors: Vec<ErrorEntry>,
    divergence_total: usize,
    defaults: BTreeMap<FormField, usize>,
}

impl Reporter {
    pub fn new(dir: &Path, partition: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            partition: partition.to_string(),
            pending_divergences: Vec::new(),
            pending_errors: Vec::new(),
            divergence_total: 0,
            defaults: BTreeMap::new(),
        }
    }

    pub fn divergence_path(&self) -> PathBuf {
        self.dir.join(format!("divergences_{}.csv", self.partition))
    }

    pub fn error_path(&self) -> PathBuf {
        self.dir.join(format!("errors_{}.csv", self.partition))
    }

    pub fn record_divergences(&mut self, entries: &[DivergenceEntry]) {
        self.divergence_total += entries.len();
        self.pending_divergences.extend_from_slice(entries);
    }

    pub fn record_error(&mut self, entry: ErrorEntry) {
        self.pending_errors.push(entry);
    }

    pub fn record_defaults(&mut self, fields: &[FormField]) {
        for field in fields {
            *self.defaults.entry(*field).or_default() += 1;
        }
    }

    pub fn divergence_total(&self) -> usize {
        self.divergence_total
    }

    /// Substitutions per field, for the audit line.
    pub fn defaults(&self) -> &BTreeMap<FormField, usize> {
        &self.defaults
    }

    pub fn defaults_total(&self) -> usize {
        self.defaults.values().sum()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_divergences.is_empty() || !self.pending_errors.is_empty()
    }

    /// Appends pending rows to disk. Buffers are cleared only after a
    /// successful write.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending_divergences.is_empty() {
            append_rows(&self.divergence_path(), &self.pending_divergences)?;
            debug!(rows = self.pending_divergences.len(), "Divergências gravadas");
            self.pending_divergences.clear();
        }
        if !self.pending_errors.is_empty() {
            append_rows(&self.error_path(), &self.pending_errors)?;
            debug!(rows = self.pending_errors.len(), "Erros gravados");
            self.pending_errors.clear();
        }
        Ok(())
    }
}

/// Rewrites the sheet with `rows` at the end through a temp file and a
/// rename, so a failed flush leaves the previous sheet whole. Header only
/// goes into a new (or empty) sheet.
fn append_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create report dir {:?}", dir))?;
    }
    let mut content = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err).with_context(|| format!("Failed to read report {:?}", path)),
    };

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .has_headers(content.is_empty())
        .from_writer(Vec::new());
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("Failed to write report row {:?}", path))?;
    }
    let tail = writer
        .into_inner()
        .map_err(|err| anyhow!("Failed to encode report rows {:?}: {}", path, err.error()))?;
    content.extend_from_slice(&tail);

    let tmp = path.with_extension("csv.tmp");
    let mut file = File::create(&tmp).with_context(|| format!("Failed to write report {:?}", tmp))?;
    file.write_all(&content)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("Failed to write report {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace report {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn divergence(key: &str) -> DivergenceEntry {
        DivergenceEntry {
            key: key.into(),
            label: "ACME".into(),
            field: "cf_endereco".into(),
            remote_value: "Rua da Receita".into(),
            source_value: "Rua Planilha".into(),
            timestamp: Utc::now(),
        }
    }

    fn error(index: usize) -> ErrorEntry {
        ErrorEntry {
            index,
            key: "99".into(),
            label: "Sem Cadastro".into(),
            code: "E1001".into(),
            error: "Código 99 não encontrado após 4 página(s)".into(),
            attempts: 3,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_flush_appends_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = Reporter::new(dir.path(), "inst1");
        reporter.record_divergences(&[divergence("1")]);
        reporter.flush().unwrap();
        reporter.record_divergences(&[divergence("2"), divergence("3")]);
        reporter.flush().unwrap();

        let content = std::fs::read_to_string(reporter.divergence_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("key;label;field;remote_value;source_value"));
        assert!(lines[1].starts_with("1;ACME;cf_endereco;Rua da Receita;Rua Planilha;"));
        assert_eq!(reporter.divergence_total(), 3);
        assert!(!reporter.has_pending());
    }

    #[test]
    fn test_existing_file_gets_no_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = Reporter::new(dir.path(), "inst1");
        first.record_error(error(0));
        first.flush().unwrap();

        let mut second = Reporter::new(dir.path(), "inst1");
        second.record_error(error(1));
        second.flush().unwrap();

        let content = std::fs::read_to_string(second.error_path()).unwrap();
        assert_eq!(content.lines().filter(|l| l.starts_with("index;")).count(), 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_failed_flush_keeps_rows_and_sheet_intact() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = Reporter::new(dir.path(), "inst1");
        reporter.record_divergences(&[divergence("1")]);
        reporter.flush().unwrap();

        // A directory in place of the temp file makes the write fail.
        let blocker = reporter.divergence_path().with_extension("csv.tmp");
        std::fs::create_dir(&blocker).unwrap();
        reporter.record_divergences(&[divergence("2"), divergence("3")]);
        assert!(reporter.flush().is_err());
        assert!(reporter.has_pending());
        let content = std::fs::read_to_string(reporter.divergence_path()).unwrap();
        assert_eq!(content.lines().count(), 2);

        std::fs::remove_dir(&blocker).unwrap();
        reporter.flush().unwrap();
        let content = std::fs::read_to_string(reporter.divergence_path()).unwrap();
        let keys: Vec<&str> = content
            .lines()
            .skip(1)
            .map(|l| l.split(';').next().unwrap())
            .collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
        assert!(!blocker.exists());
    }

    #[test]
    fn test_nothing_pending_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = Reporter::new(dir.path(), "inst2");
        reporter.flush().unwrap();
        assert!(!reporter.divergence_path().exists());
        assert!(!reporter.error_path().exists());
    }

    #[test]
    fn test_partitions_write_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = Reporter::new(dir.path(), "inst1");
        let b = Reporter::new(dir.path(), "inst2");
        assert_ne!(a.error_path(), b.error_path());
        assert!(b.divergence_path().ends_with("divergences_inst2.csv"));
    }

    #[test]
    fn test_default_counts_per_field() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = Reporter::new(dir.path(), "inst1");
        reporter.record_defaults(&[FormField::Phone, FormField::Email]);
        reporter.record_defaults(&[FormField::Phone]);

        assert_eq!(reporter.defaults()[&FormField::Phone], 2);
        assert_eq!(reporter.defaults()[&FormField::Email], 1);
        assert_eq!(reporter.defaults_total(), 3);
    }
}
