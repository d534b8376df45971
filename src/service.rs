use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::consolidate::Consolidated;
use crate::error::{EngineError, Result};
use crate::models::{
    Actor, AssessmentRecord, AuditAction, AuditEntry, Instrument, Role, School, Scope,
    StoredRecord, UserAccount,
};
use crate::store::{Backend, RecordStore, WriteUnit};
use crate::visibility;

/// Single entry point for writes and actor-scoped reads.
pub struct IndicatorService<B: ?Sized> {
    backend: Arc<B>,
    records: RecordStore<B>,
}

impl<B: Backend + ?Sized> IndicatorService<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let records = RecordStore::new(Arc::clone(&backend));
        Self { backend, records }
    }

    async fn account(&self, actor: &Actor) -> Result<UserAccount> {
        let accounts = self.backend.accounts().await?;
        visibility::resolve_account(actor, &accounts).cloned()
    }

    async fn admin(&self, actor: &Actor, action: &str) -> Result<UserAccount> {
        let account = self.account(actor).await?;
        if account.role != Role::Admin {
            tracing::warn!(actor = %account.email, action, "admin action denied");
            return Err(EngineError::denied(&account.email, action));
        }
        Ok(account)
    }

    async fn audit(
        &self,
        account: &UserAccount,
        action: AuditAction,
        subject_id: Uuid,
        school_id: Option<Uuid>,
        detail: String,
    ) -> Result<()> {
        let entry = AuditEntry {
            occurred_at: Utc::now(),
            actor: account.email.clone(),
            action,
            subject_id,
            school_id,
            detail,
        };
        self.backend.append_audit(&entry).await
    }

    pub async fn scope(&self, actor: &Actor) -> Result<Scope> {
        let account = self.account(actor).await?;
        let schools = self.backend.schools().await?;
        Ok(visibility::scope(&account, schools.iter().map(|school| school.id)))
    }

    pub async fn can_write(&self, actor: &Actor, school_id: Uuid) -> Result<bool> {
        let account = self.account(actor).await?;
        Ok(visibility::can_write(&account, school_id))
    }

    // Out-of-scope ids read as missing, not forbidden.
    fn ensure_writable(&self, account: &UserAccount, school_id: Uuid, record_id: Option<Uuid>) -> Result<()> {
        if !visibility::can_read(account, school_id) {
            return Err(match record_id {
                Some(id) => EngineError::not_found("record", id),
                None => EngineError::not_found("school", school_id),
            });
        }
        if !visibility::can_write(account, school_id) {
            tracing::warn!(actor = %account.email, %school_id, "record write denied");
            return Err(EngineError::denied(
                &account.email,
                format!("write records for school {school_id}"),
            ));
        }
        Ok(())
    }

    /// Creates (`id == None`) or replaces a record, then recomputes the
    /// consolidated indicators it feeds.
    pub async fn upsert_record(
        &self,
        actor: &Actor,
        id: Option<Uuid>,
        record: AssessmentRecord,
    ) -> Result<StoredRecord> {
        let account = self.account(actor).await?;
        let school_id = record.school_id;

        if let Some(id) = id {
            let existing = self.records.get(id).await?;
            self.ensure_writable(&account, existing.record.school_id, Some(id))?;
        }
        self.ensure_writable(&account, school_id, None)?;
        if self.backend.fetch_school(school_id).await?.is_none() {
            return Err(EngineError::not_found("school", school_id));
        }

        let upserted = self.records.upsert(id, record, &account.email).await?;
        let stored = upserted.stored;
        tracing::info!(
            record_id = %stored.id,
            %school_id,
            instrument = stored.record.instrument().as_str(),
            actor = %account.email,
            edit = upserted.previous.is_some(),
            "record saved"
        );
        Ok(stored)
    }

    pub async fn delete_record(&self, actor: &Actor, id: Uuid) -> Result<()> {
        let account = self.account(actor).await?;
        let existing = self.records.get(id).await?;
        let school_id = existing.record.school_id;
        self.ensure_writable(&account, school_id, Some(id))?;

        let removed = self.records.delete(id, &account.email).await?;
        tracing::info!(
            record_id = %id,
            %school_id,
            instrument = removed.record.instrument().as_str(),
            "record deleted"
        );
        Ok(())
    }

    /// Schools outside the actor's scope yield an empty list.
    pub async fn list_records(
        &self,
        actor: &Actor,
        school_id: Uuid,
        instrument: Instrument,
    ) -> Result<Vec<StoredRecord>> {
        let account = self.account(actor).await?;
        if !visibility::can_read(&account, school_id) {
            tracing::debug!(actor = %account.email, %school_id, "listing outside scope");
            return Ok(Vec::new());
        }
        self.records.list_by_instrument(school_id, instrument).await
    }

    pub async fn recompute(&self, school_id: Uuid, instrument: Instrument) -> Result<Consolidated> {
        let mut results = self
            .backend
            .commit(&WriteUnit {
                refresh: vec![(school_id, instrument)],
                ..WriteUnit::default()
            })
            .await?;
        let consolidated = results
            .pop()
            .ok_or_else(|| EngineError::not_found("school", school_id))?;
        tracing::debug!(
            %school_id,
            instrument = instrument.as_str(),
            ?consolidated,
            "indicators recomputed"
        );
        Ok(consolidated)
    }

    pub async fn recompute_all(&self, actor: &Actor, school_id: Uuid) -> Result<School> {
        let account = self.account(actor).await?;
        self.ensure_writable(&account, school_id, None)?;
        self.backend
            .commit(&WriteUnit {
                refresh: Instrument::ALL
                    .into_iter()
                    .map(|instrument| (school_id, instrument))
                    .collect(),
                ..WriteUnit::default()
            })
            .await?;
        self.backend
            .fetch_school(school_id)
            .await?
            .ok_or_else(|| EngineError::not_found("school", school_id))
    }

    pub async fn list_schools(&self, actor: &Actor) -> Result<Vec<School>> {
        let account = self.account(actor).await?;
        let schools = self.backend.schools().await?;
        let scope = visibility::scope(&account, schools.iter().map(|school| school.id));
        Ok(visibility::retain_in_scope(&scope, schools, |school| school.id))
    }

    pub async fn school(&self, actor: &Actor, school_id: Uuid) -> Result<School> {
        let account = self.account(actor).await?;
        if !visibility::can_read(&account, school_id) {
            return Err(EngineError::not_found("school", school_id));
        }
        self.backend
            .fetch_school(school_id)
            .await?
            .ok_or_else(|| EngineError::not_found("school", school_id))
    }

    pub async fn list_users(&self, actor: &Actor) -> Result<Vec<UserAccount>> {
        let accounts = self.backend.accounts().await?;
        let account = visibility::resolve_account(actor, &accounts)?;
        Ok(visibility::visible_users(account, &accounts))
    }

    /// Cached indicators are kept from the stored copy.
    pub async fn save_school(&self, actor: &Actor, mut school: School) -> Result<School> {
        let account = self.admin(actor, "manage schools").await?;
        school.indicators = self
            .backend
            .fetch_school(school.id)
            .await?
            .map(|existing| existing.indicators)
            .unwrap_or_default();

        self.backend.save_school(&school).await?;
        self.audit(
            &account,
            AuditAction::SchoolSaved,
            school.id,
            Some(school.id),
            school.name.clone(),
        )
        .await?;
        tracing::info!(school_id = %school.id, name = %school.name, "school saved");
        Ok(school)
    }

    pub async fn delete_school(&self, actor: &Actor, school_id: Uuid) -> Result<()> {
        let account = self.admin(actor, "manage schools").await?;
        if !self.backend.remove_school(school_id).await? {
            return Err(EngineError::not_found("school", school_id));
        }
        self.audit(
            &account,
            AuditAction::SchoolDeleted,
            school_id,
            Some(school_id),
            String::new(),
        )
        .await?;
        tracing::info!(%school_id, "school deleted");
        Ok(())
    }

    pub async fn save_user(&self, actor: &Actor, user: UserAccount) -> Result<UserAccount> {
        let account = self.admin(actor, "manage users").await?;
        self.backend.save_account(&user).await?;
        self.audit(
            &account,
            AuditAction::UserSaved,
            user.id,
            None,
            format!("{} ({})", user.email, user.role.as_str()),
        )
        .await?;
        tracing::info!(user_id = %user.id, email = %user.email, "user saved");
        Ok(user)
    }

    pub async fn delete_user(&self, actor: &Actor, user_id: Uuid) -> Result<()> {
        let account = self.admin(actor, "manage users").await?;
        if !self.backend.remove_account(user_id).await? {
            return Err(EngineError::not_found("user", user_id));
        }
        self.audit(&account, AuditAction::UserDeleted, user_id, None, String::new())
            .await?;
        tracing::info!(%user_id, "user deleted");
        Ok(())
    }

    pub async fn audit_log(&self, actor: &Actor) -> Result<Vec<AuditEntry>> {
        self.admin(actor, "read the audit log").await?;
        self.backend.audit_log().await
    }
}
