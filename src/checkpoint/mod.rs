//! # Checkpoint por Partição
//!
//! Guarda o progresso de um worker em `<saida>/progress_<id>.json`, gravado
//! de forma síncrona depois de **cada** registro.
//!
//! ## Para todos entenderem:
//!
//! Se o robô cair no registro 1.532, o próximo início lê este arquivo e
//! continua do 1.533. No pior caso, o registro que estava em andamento é
//! refeito (com os mesmos dados, o que o ERP aceita sem problema).
//!
//! A gravação é atômica: escreve um arquivo temporário, força o disco
//! (`sync_all`) e só então renomeia por cima do checkpoint. Um desligamento
//! no meio da escrita deixa o arquivo anterior intacto.
//!
//! Um arquivo corrompido **não** é ignorado: recomeçar do zero em silêncio
//! reprocessaria milhares de cadastros.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::errors::ErrorCode;
use crate::protocol::{CompletedEntry, FailedEntry};
use crate::retry::RecordOutcome;

/// Conteúdo persistido do checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition: String,
    /// Execução que gravou por último.
    pub run_id: Uuid,
    /// Maior índice já finalizado (sucesso ou falha definitiva).
    pub last_completed_index: Option<usize>,
    pub completed: Vec<CompletedEntry>,
    pub failed: Vec<FailedEntry>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    fn empty(partition: &str) -> Self {
        Self {
            partition: partition.to_string(),
            run_id: Uuid::new_v4(),
            last_completed_index: None,
            completed: Vec::new(),
            failed: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Dono exclusivo do checkpoint de uma partição.
pub struct CheckpointStore {
    path: PathBuf,
    state: Checkpoint,
    done: BTreeSet<usize>,
}

impl CheckpointStore {
    pub fn path_for(dir: &Path, partition: &str) -> PathBuf {
        dir.join(format!("progress_{}.json", partition))
    }

    /// Carrega o checkpoint da partição; arquivo ausente significa começo limpo.
    pub fn load(dir: &Path, partition: &str) -> Result<Self> {
        let path = Self::path_for(dir, partition);
        let mut state = if path.exists() {
            let content = fs::read_to_string(&path).with_context(|| {
                format!("[{}] Failed to read checkpoint {:?}", ErrorCode::CHECKPOINT_IO, path)
            })?;
            serde_json::from_str::<Checkpoint>(&content).with_context(|| {
                format!("[{}] Corrupt checkpoint {:?}", ErrorCode::CHECKPOINT_IO, path)
            })?
        } else {
            Checkpoint::empty(partition)
        };
        state.run_id = Uuid::new_v4();

        let done = state
            .completed
            .iter()
            .map(|e| e.index)
            .chain(state.failed.iter().map(|e| e.index))
            .collect();

        debug!(partition = %partition, path = ?path, last = ?state.last_completed_index, "Checkpoint carregado");
        Ok(Self { path, state, done })
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Primeiro índice a processar: `max(start, último concluído + 1)`.
    pub fn resume_index(&self, start: usize) -> usize {
        match self.state.last_completed_index {
            Some(last) => start.max(last + 1),
            None => start,
        }
    }

    pub fn is_done(&self, index: usize) -> bool {
        self.done.contains(&index)
    }

    /// Registra o resultado e grava antes de devolver.
    pub fn append(&mut self, outcome: &RecordOutcome) -> Result<()> {
        let now = Utc::now();
        match outcome {
            RecordOutcome::Completed { index, key, .. } => {
                self.state.completed.push(CompletedEntry {
                    index: *index,
                    key: key.clone(),
                    timestamp: now,
                });
            }
            RecordOutcome::Failed { entry, .. } => {
                self.state.failed.push(FailedEntry {
                    index: entry.index,
                    key: entry.key.clone(),
                    error: entry.error.clone(),
                    timestamp: now,
                });
            }
        }

        let index = outcome.index();
        self.done.insert(index);
        self.state.last_completed_index = Some(
            self.state
                .last_completed_index
                .map_or(index, |last| last.max(index)),
        );
        self.persist()
    }

    /// Regrava o estado atual (usado no encerramento).
    pub fn snapshot(&mut self) -> Result<()> {
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| {
                format!("[{}] Failed to create output dir {:?}", ErrorCode::CHECKPOINT_IO, dir)
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        let mut file = File::create(&tmp).with_context(|| {
            format!("[{}] Failed to write checkpoint {:?}", ErrorCode::CHECKPOINT_IO, tmp)
        })?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .with_context(|| {
                format!("[{}] Failed to write checkpoint {:?}", ErrorCode::CHECKPOINT_IO, tmp)
            })?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("[{}] Failed to replace checkpoint {:?}", ErrorCode::CHECKPOINT_IO, self.path)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RecordFailure;
    use crate::processor::ProcessReport;
    use crate::protocol::ErrorEntry;

    fn done(index: usize, key: &str) -> RecordOutcome {
        RecordOutcome::Completed {
            index,
            key: key.to_string(),
            attempts: 1,
            report: ProcessReport::default(),
        }
    }

    fn failed(index: usize, key: &str) -> RecordOutcome {
        RecordOutcome::Failed {
            entry: ErrorEntry {
                index,
                key: key.to_string(),
                label: "X".into(),
                code: "E1001".into(),
                error: "não encontrado".into(),
                attempts: 3,
                timestamp: Utc::now(),
            },
            failure: RecordFailure::NotFound {
                key: key.to_string(),
                pages_scanned: 1,
            },
        }
    }

    #[test]
    fn test_missing_file_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::load(dir.path(), "inst1").unwrap();

        assert_eq!(store.checkpoint().last_completed_index, None);
        assert_eq!(store.resume_index(0), 0);
        assert_eq!(store.resume_index(2000), 2000);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_append_persists_and_reload_resumes_after_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::load(dir.path(), "inst1").unwrap();
        store.append(&done(0, "10")).unwrap();
        store.append(&failed(1, "11")).unwrap();
        store.append(&done(2, "12")).unwrap();

        let reloaded = CheckpointStore::load(dir.path(), "inst1").unwrap();
        let cp = reloaded.checkpoint();
        assert_eq!(cp.last_completed_index, Some(2));
        assert_eq!(cp.completed.len(), 2);
        assert_eq!(cp.failed.len(), 1);
        assert_eq!(cp.failed[0].key, "11");
        assert_eq!(reloaded.resume_index(0), 3);
        assert!(reloaded.is_done(1));
        assert!(!reloaded.is_done(3));
    }

    #[test]
    fn test_resume_never_goes_below_configured_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::load(dir.path(), "inst2").unwrap();
        store.append(&done(5, "15")).unwrap();
        assert_eq!(store.resume_index(2000), 2000);
        assert_eq!(store.resume_index(3), 6);
    }

    #[test]
    fn test_partitions_use_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = CheckpointStore::load(dir.path(), "inst1").unwrap();
        let b = CheckpointStore::load(dir.path(), "inst2").unwrap();
        a.append(&done(0, "10")).unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().ends_with("progress_inst1.json"));
        assert_eq!(CheckpointStore::load(dir.path(), "inst2").unwrap().checkpoint().completed.len(), 0);
    }

    #[test]
    fn test_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::load(dir.path(), "inst1").unwrap();
        store.append(&done(0, "10")).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["progress_inst1.json".to_string()]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(CheckpointStore::path_for(dir.path(), "inst1"), "{ nope").unwrap();

        let err = CheckpointStore::load(dir.path(), "inst1").err().unwrap();
        assert!(format!("{:#}", err).contains("E4002"));
    }

    #[test]
    fn test_unwritable_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("arquivo");
        fs::write(&blocker, "x").unwrap();

        let mut store = CheckpointStore::load(&blocker, "inst1").unwrap();
        assert!(store.append(&done(0, "10")).is_err());
    }
}
