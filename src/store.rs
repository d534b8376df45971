use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::consolidate::{self, Consolidated};
use crate::error::{EngineError, Result};
use crate::models::{
    AssessmentRecord, AuditAction, AuditEntry, Instrument, School, StoredRecord, UserAccount,
};
use crate::validate;

#[derive(Debug, Clone)]
pub enum RecordChange {
    Save(StoredRecord),
    Remove(Uuid),
}

/// A record change, the (school, instrument) pairs whose cached indicators
/// are re-derived after it, and the audit entry describing it.
#[derive(Debug, Clone, Default)]
pub struct WriteUnit {
    pub change: Option<RecordChange>,
    pub refresh: Vec<(Uuid, Instrument)>,
    pub audit: Option<AuditEntry>,
}

/// Raw persistence used by the engine.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_record(&self, id: Uuid) -> Result<Option<StoredRecord>>;
    async fn records_for(&self, school_id: Uuid, instrument: Instrument) -> Result<Vec<StoredRecord>>;

    async fn schools(&self) -> Result<Vec<School>>;
    async fn fetch_school(&self, id: Uuid) -> Result<Option<School>>;
    async fn save_school(&self, school: &School) -> Result<()>;
    /// Removes the school together with its assessment records.
    async fn remove_school(&self, id: Uuid) -> Result<bool>;

    async fn accounts(&self) -> Result<Vec<UserAccount>>;
    async fn save_account(&self, account: &UserAccount) -> Result<()>;
    async fn remove_account(&self, id: Uuid) -> Result<bool>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
    async fn audit_log(&self) -> Result<Vec<AuditEntry>>;

    /// Applies the whole unit or nothing. Units refreshing the same school
    /// are serialized, so one never overwrites another's cached indicators.
    /// Returns one consolidation per entry of `unit.refresh`, in order.
    async fn commit(&self, unit: &WriteUnit) -> Result<Vec<Consolidated>>;
}

/// Validated create/edit/delete of assessment records on top of a [`Backend`].
pub struct RecordStore<B: ?Sized> {
    backend: Arc<B>,
}

impl<B: ?Sized> Clone for RecordStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

/// What an upsert replaced, so callers can tell a create from an edit.
#[derive(Debug, Clone)]
pub struct Upserted {
    pub stored: StoredRecord,
    pub previous: Option<StoredRecord>,
}

fn audit_entry(action: AuditAction, stored: &StoredRecord, author: &str) -> AuditEntry {
    AuditEntry {
        occurred_at: Utc::now(),
        actor: author.to_string(),
        action,
        subject_id: stored.id,
        school_id: Some(stored.record.school_id),
        detail: format!("{} {}", stored.record.instrument(), stored.record.year),
    }
}

impl<B: Backend + ?Sized> RecordStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Creates a record when `id` is `None`, otherwise replaces the record with
    /// that identity, keeping its creation stamp. The save, the recompute of
    /// every pair the record feeds or used to feed, and the audit entry commit
    /// together.
    pub async fn upsert(
        &self,
        id: Option<Uuid>,
        record: AssessmentRecord,
        author: &str,
    ) -> Result<Upserted> {
        let record = validate::validate(record)?;
        let now = Utc::now();

        let (stored, previous) = match id {
            None => (
                StoredRecord {
                    id: Uuid::new_v4(),
                    record,
                    created_at: now,
                    created_by: author.to_string(),
                    updated_at: now,
                    updated_by: author.to_string(),
                },
                None,
            ),
            Some(id) => {
                let existing = self.get(id).await?;
                (
                    StoredRecord {
                        id,
                        record,
                        created_at: existing.created_at,
                        created_by: existing.created_by.clone(),
                        updated_at: now,
                        updated_by: author.to_string(),
                    },
                    Some(existing),
                )
            }
        };

        let mut refresh = vec![(stored.record.school_id, stored.record.instrument())];
        if let Some(previous) = &previous {
            let old = (previous.record.school_id, previous.record.instrument());
            if !refresh.contains(&old) {
                refresh.push(old);
            }
        }
        let action = if previous.is_some() {
            AuditAction::RecordUpdated
        } else {
            AuditAction::RecordCreated
        };

        self.backend
            .commit(&WriteUnit {
                audit: Some(audit_entry(action, &stored, author)),
                change: Some(RecordChange::Save(stored.clone())),
                refresh,
            })
            .await?;
        Ok(Upserted { stored, previous })
    }

    /// Removes a record and recomputes the pair it fed in the same commit.
    pub async fn delete(&self, id: Uuid, author: &str) -> Result<StoredRecord> {
        let existing = self.get(id).await?;
        self.backend
            .commit(&WriteUnit {
                change: Some(RecordChange::Remove(id)),
                refresh: vec![(existing.record.school_id, existing.record.instrument())],
                audit: Some(audit_entry(AuditAction::RecordDeleted, &existing, author)),
            })
            .await?;
        Ok(existing)
    }

    pub async fn get(&self, id: Uuid) -> Result<StoredRecord> {
        self.backend
            .fetch_record(id)
            .await?
            .ok_or_else(|| EngineError::not_found("record", id))
    }

    /// Records of one school and instrument, oldest first.
    pub async fn list_by_instrument(
        &self,
        school_id: Uuid,
        instrument: Instrument,
    ) -> Result<Vec<StoredRecord>> {
        let mut records = self.backend.records_for(school_id, instrument).await?;
        records.sort_by_key(|stored| (stored.created_at, stored.id));
        Ok(records)
    }
}

#[derive(Default, Clone)]
struct MemoryState {
    records: HashMap<Uuid, StoredRecord>,
    schools: HashMap<Uuid, School>,
    accounts: HashMap<Uuid, UserAccount>,
    audit: Vec<AuditEntry>,
}

impl MemoryState {
    fn records_for(&self, school_id: Uuid, instrument: Instrument) -> Vec<StoredRecord> {
        self.records
            .values()
            .filter(|stored| {
                stored.record.school_id == school_id && stored.record.instrument() == instrument
            })
            .cloned()
            .collect()
    }

    fn apply(&mut self, unit: &WriteUnit) -> Result<Vec<Consolidated>> {
        match &unit.change {
            Some(RecordChange::Save(stored)) => {
                self.records.insert(stored.id, stored.clone());
            }
            Some(RecordChange::Remove(id)) => {
                if self.records.remove(id).is_none() {
                    return Err(EngineError::not_found("record", *id));
                }
            }
            None => {}
        }

        let mut results = Vec::with_capacity(unit.refresh.len());
        for &(school_id, instrument) in &unit.refresh {
            let records = self.records_for(school_id, instrument);
            let school = self
                .schools
                .get_mut(&school_id)
                .ok_or_else(|| EngineError::not_found("school", school_id))?;
            let consolidated = consolidate::recompute(school_id, instrument, &records);
            consolidate::apply(&mut school.indicators, instrument, &consolidated);
            results.push(consolidated);
        }

        if let Some(entry) = &unit.audit {
            self.audit.push(entry.clone());
        }
        Ok(results)
    }
}

/// Process-local backend for tests and embedding.
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_record(&self, id: Uuid) -> Result<Option<StoredRecord>> {
        Ok(self.state.read().await.records.get(&id).cloned())
    }

    async fn records_for(&self, school_id: Uuid, instrument: Instrument) -> Result<Vec<StoredRecord>> {
        Ok(self.state.read().await.records_for(school_id, instrument))
    }

    async fn schools(&self) -> Result<Vec<School>> {
        let mut schools: Vec<School> = self.state.read().await.schools.values().cloned().collect();
        schools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schools)
    }

    async fn fetch_school(&self, id: Uuid) -> Result<Option<School>> {
        Ok(self.state.read().await.schools.get(&id).cloned())
    }

    async fn save_school(&self, school: &School) -> Result<()> {
        self.state
            .write()
            .await
            .schools
            .insert(school.id, school.clone());
        Ok(())
    }

    async fn remove_school(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        state.records.retain(|_, stored| stored.record.school_id != id);
        Ok(state.schools.remove(&id).is_some())
    }

    async fn accounts(&self) -> Result<Vec<UserAccount>> {
        let mut accounts: Vec<UserAccount> =
            self.state.read().await.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(accounts)
    }

    async fn save_account(&self, account: &UserAccount) -> Result<()> {
        self.state
            .write()
            .await
            .accounts
            .insert(account.id, account.clone());
        Ok(())
    }

    async fn remove_account(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.accounts.remove(&id).is_some())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.state.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.state.read().await.audit.clone())
    }

    async fn commit(&self, unit: &WriteUnit) -> Result<Vec<Consolidated>> {
        // Work on a copy under the write lock; publish it only if every step succeeds.
        let mut state = self.state.write().await;
        let mut staged = state.clone();
        let results = staged.apply(unit)?;
        *state = staged;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CncaAssessment, CncaBands, Component, Grade, Indicators, Outcome, Participation,
        SubPopulation,
    };

    fn cnca_record(school_id: Uuid, evaluated: u32) -> AssessmentRecord {
        AssessmentRecord {
            school_id,
            year: 2024,
            sub_population: SubPopulation {
                grade: Some(Grade::Year(2)),
                component: Some(Component::Mathematics),
                class_type: None,
            },
            participation: Participation {
                expected: 30,
                evaluated,
            },
            outcome: Outcome::Cnca {
                assessment: CncaAssessment::Formative,
                bands: CncaBands {
                    insufficient_learning: 20.0,
                    partial_learning: 30.0,
                    adequate_learning: 50.0,
                },
            },
        }
    }

    fn school(id: Uuid) -> School {
        School {
            id,
            name: "Escola A".to_string(),
            manager: "Marta Sousa".to_string(),
            municipality: "Caxias".to_string(),
            segments: Vec::new(),
            average_attendance: None,
            indicators: Indicators::default(),
        }
    }

    async fn store_with_school() -> (RecordStore<MemoryBackend>, Arc<MemoryBackend>, Uuid) {
        let backend = Arc::new(MemoryBackend::new());
        let school_id = Uuid::new_v4();
        backend.save_school(&school(school_id)).await.unwrap();
        (RecordStore::new(Arc::clone(&backend)), backend, school_id)
    }

    #[tokio::test]
    async fn edit_preserves_creation_stamp() {
        let (store, backend, school) = store_with_school().await;
        let created = store
            .upsert(None, cnca_record(school, 25), "ana@seduc.example")
            .await
            .unwrap()
            .stored;

        let edited = store
            .upsert(Some(created.id), cnca_record(school, 28), "rui@seduc.example")
            .await
            .unwrap();

        assert_eq!(edited.stored.id, created.id);
        assert_eq!(edited.stored.created_at, created.created_at);
        assert_eq!(edited.stored.created_by, "ana@seduc.example");
        assert_eq!(edited.stored.updated_by, "rui@seduc.example");
        assert_eq!(edited.previous.map(|p| p.record.participation.evaluated), Some(25));

        let listed = store
            .list_by_instrument(school, Instrument::Cnca)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record.participation.evaluated, 28);

        let log = backend.audit_log().await.unwrap();
        let actions: Vec<_> = log.iter().map(|entry| entry.action).collect();
        assert_eq!(actions, vec![AuditAction::RecordCreated, AuditAction::RecordUpdated]);
        assert_eq!(log[1].actor, "rui@seduc.example");
    }

    #[tokio::test]
    async fn invalid_record_is_never_persisted() {
        let (store, backend, school) = store_with_school().await;
        let err = store
            .upsert(None, cnca_record(school, 31), "ana@seduc.example")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(store
            .list_by_instrument(school, Instrument::Cnca)
            .await
            .unwrap()
            .is_empty());
        assert!(backend.audit_log().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn editing_or_deleting_unknown_identity_is_not_found() {
        let (store, _, school) = store_with_school().await;
        let ghost = Uuid::new_v4();
        let err = store
            .upsert(Some(ghost), cnca_record(school, 10), "ana@seduc.example")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "record", id } if id == ghost));
        assert!(matches!(
            store.delete(ghost, "ana@seduc.example").await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_behind_and_retry_stores_once() {
        let backend = Arc::new(MemoryBackend::new());
        let store = RecordStore::new(Arc::clone(&backend));
        let school_id = Uuid::new_v4();

        // The school row is missing, so the refresh step fails after the save was staged.
        let err = store
            .upsert(None, cnca_record(school_id, 25), "ana@seduc.example")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "school", .. }));
        assert!(backend.records_for(school_id, Instrument::Cnca).await.unwrap().is_empty());
        assert!(backend.audit_log().await.unwrap().is_empty());

        backend.save_school(&school(school_id)).await.unwrap();
        store
            .upsert(None, cnca_record(school_id, 25), "ana@seduc.example")
            .await
            .unwrap();
        assert_eq!(backend.records_for(school_id, Instrument::Cnca).await.unwrap().len(), 1);
        assert_eq!(backend.audit_log().await.unwrap().len(), 1);
        let cached = backend.fetch_school(school_id).await.unwrap().unwrap().indicators;
        assert_eq!(cached.cnca_formative, Some(50.0));
    }

    #[tokio::test]
    async fn commit_refreshes_only_the_listed_pairs() {
        let (store, backend, school) = store_with_school().await;
        store
            .upsert(None, cnca_record(school, 25), "ana@seduc.example")
            .await
            .unwrap();

        let results = backend
            .commit(&WriteUnit {
                refresh: vec![(school, Instrument::Parc)],
                ..WriteUnit::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        let cached = backend.fetch_school(school).await.unwrap().unwrap().indicators;
        assert_eq!(cached.reading_fluency, Some(0.0));
        assert_eq!(cached.cnca_formative, Some(50.0));
    }
}
