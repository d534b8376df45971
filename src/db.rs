use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::consolidate::{self, Consolidated};
use crate::error::{EngineError, Result};
use crate::models::{
    AccountStatus, Actor, AssessmentRecord, AuditEntry, CncaAssessment, CncaBands, Component,
    Grade, IdebScores, Indicators, Instrument, Outcome, ParcEdition, ParcOutcome, Participation,
    Role, SaebScores, School, StoredRecord, SubPopulation, UserAccount,
};
use crate::service::IndicatorService;
use crate::store::{Backend, RecordChange, WriteUnit};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed storage under the `school_indicators` schema.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_error(message: String) -> EngineError {
    EngineError::Storage(sqlx::Error::Decode(message.into()))
}

fn row_to_record(row: &PgRow) -> Result<StoredRecord> {
    let payload: Json<AssessmentRecord> = row.try_get("payload")?;
    Ok(StoredRecord {
        id: row.try_get("id")?,
        record: payload.0,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
        updated_at: row.try_get("updated_at")?,
        updated_by: row.try_get("updated_by")?,
    })
}

fn row_to_school(row: &PgRow) -> Result<School> {
    let indicators: Json<Indicators> = row.try_get("indicators")?;
    Ok(School {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        manager: row.try_get("manager")?,
        municipality: row.try_get("municipality")?,
        segments: row.try_get("segments")?,
        average_attendance: row.try_get("average_attendance")?,
        indicators: indicators.0,
    })
}

fn row_to_account(row: &PgRow) -> Result<UserAccount> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    let linked: Vec<Uuid> = row.try_get("linked_schools")?;
    Ok(UserAccount {
        id: row.try_get("id")?,
        auth_subject: row.try_get("auth_subject")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        role: role.parse().map_err(decode_error)?,
        status: status.parse().map_err(decode_error)?,
        linked_schools: linked.into_iter().collect(),
    })
}

fn row_to_audit(row: &PgRow) -> Result<AuditEntry> {
    let action: String = row.try_get("action")?;
    Ok(AuditEntry {
        occurred_at: row.try_get("occurred_at")?,
        actor: row.try_get("actor")?,
        action: action.parse().map_err(decode_error)?,
        subject_id: row.try_get("subject_id")?,
        school_id: row.try_get("school_id")?,
        detail: row.try_get("detail")?,
    })
}

const RECORD_COLUMNS: &str = "id, payload, created_at, created_by, updated_at, updated_by";
const SCHOOL_COLUMNS: &str =
    "id, name, manager, municipality, segments, average_attendance, indicators";
const ACCOUNT_COLUMNS: &str = "id, auth_subject, name, email, role, status, linked_schools";

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

fn select_records_for(school_id: Uuid, instrument: Instrument) -> PgQuery<'static> {
    sqlx::query(
        "SELECT id, payload, created_at, created_by, updated_at, updated_by \
         FROM school_indicators.assessment_records \
         WHERE school_id = $1 AND instrument = $2 ORDER BY created_at, id",
    )
    .bind(school_id)
    .bind(instrument.as_str())
}

fn upsert_record(stored: &StoredRecord) -> PgQuery<'_> {
    sqlx::query(
        r#"
        INSERT INTO school_indicators.assessment_records
        (id, school_id, instrument, reference_year, payload, created_at, created_by, updated_at, updated_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE
        SET school_id = EXCLUDED.school_id,
            instrument = EXCLUDED.instrument,
            reference_year = EXCLUDED.reference_year,
            payload = EXCLUDED.payload,
            updated_at = EXCLUDED.updated_at,
            updated_by = EXCLUDED.updated_by
        "#,
    )
    .bind(stored.id)
    .bind(stored.record.school_id)
    .bind(stored.record.instrument().as_str())
    .bind(stored.record.year)
    .bind(Json(&stored.record))
    .bind(stored.created_at)
    .bind(&stored.created_by)
    .bind(stored.updated_at)
    .bind(&stored.updated_by)
}

fn insert_audit(entry: &AuditEntry) -> PgQuery<'_> {
    sqlx::query(
        r#"
        INSERT INTO school_indicators.audit_log
        (occurred_at, actor, action, subject_id, school_id, detail)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(entry.occurred_at)
    .bind(&entry.actor)
    .bind(entry.action.as_str())
    .bind(entry.subject_id)
    .bind(entry.school_id)
    .bind(&entry.detail)
}

#[async_trait]
impl Backend for PgBackend {
    async fn fetch_record(&self, id: Uuid) -> Result<Option<StoredRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM school_indicators.assessment_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn records_for(&self, school_id: Uuid, instrument: Instrument) -> Result<Vec<StoredRecord>> {
        let rows = select_records_for(school_id, instrument)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn schools(&self) -> Result<Vec<School>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHOOL_COLUMNS} FROM school_indicators.schools ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_school).collect()
    }

    async fn fetch_school(&self, id: Uuid) -> Result<Option<School>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHOOL_COLUMNS} FROM school_indicators.schools WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_school).transpose()
    }

    async fn save_school(&self, school: &School) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO school_indicators.schools
            (id, name, manager, municipality, segments, average_attendance, indicators)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                manager = EXCLUDED.manager,
                municipality = EXCLUDED.municipality,
                segments = EXCLUDED.segments,
                average_attendance = EXCLUDED.average_attendance,
                indicators = EXCLUDED.indicators
            "#,
        )
        .bind(school.id)
        .bind(&school.name)
        .bind(&school.manager)
        .bind(&school.municipality)
        .bind(&school.segments)
        .bind(school.average_attendance)
        .bind(Json(&school.indicators))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_school(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM school_indicators.schools WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn accounts(&self) -> Result<Vec<UserAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM school_indicators.user_accounts ORDER BY email"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_account).collect()
    }

    async fn save_account(&self, account: &UserAccount) -> Result<()> {
        let linked: Vec<Uuid> = account.linked_schools.iter().copied().collect();
        sqlx::query(
            r#"
            INSERT INTO school_indicators.user_accounts
            (id, auth_subject, name, email, role, status, linked_schools)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET auth_subject = EXCLUDED.auth_subject,
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                role = EXCLUDED.role,
                status = EXCLUDED.status,
                linked_schools = EXCLUDED.linked_schools
            "#,
        )
        .bind(account.id)
        .bind(&account.auth_subject)
        .bind(&account.name)
        .bind(&account.email)
        .bind(account.role.as_str())
        .bind(account.status.as_str())
        .bind(linked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_account(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM school_indicators.user_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        insert_audit(entry).execute(&self.pool).await?;
        Ok(())
    }

    async fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT occurred_at, actor, action, subject_id, school_id, detail \
             FROM school_indicators.audit_log ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_audit).collect()
    }

    async fn commit(&self, unit: &WriteUnit) -> Result<Vec<Consolidated>> {
        let mut tx = self.pool.begin().await?;

        // Lock the affected schools in id order before touching records, so
        // concurrent units queue up instead of deadlocking or overwriting.
        let school_ids: BTreeSet<Uuid> = unit.refresh.iter().map(|(id, _)| *id).collect();
        let mut cached: BTreeMap<Uuid, Indicators> = BTreeMap::new();
        for school_id in school_ids {
            let row = sqlx::query(
                "SELECT indicators FROM school_indicators.schools WHERE id = $1 FOR UPDATE",
            )
            .bind(school_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::not_found("school", school_id))?;
            let indicators: Json<Indicators> = row.try_get("indicators")?;
            cached.insert(school_id, indicators.0);
        }

        match &unit.change {
            Some(RecordChange::Save(stored)) => {
                upsert_record(stored).execute(&mut *tx).await?;
            }
            Some(RecordChange::Remove(id)) => {
                let result =
                    sqlx::query("DELETE FROM school_indicators.assessment_records WHERE id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                if result.rows_affected() == 0 {
                    return Err(EngineError::not_found("record", *id));
                }
            }
            None => {}
        }

        let mut results = Vec::with_capacity(unit.refresh.len());
        for &(school_id, instrument) in &unit.refresh {
            let rows = select_records_for(school_id, instrument)
                .fetch_all(&mut *tx)
                .await?;
            let records = rows.iter().map(row_to_record).collect::<Result<Vec<_>>>()?;
            let consolidated = consolidate::recompute(school_id, instrument, &records);
            if let Some(indicators) = cached.get_mut(&school_id) {
                consolidate::apply(indicators, instrument, &consolidated);
            }
            results.push(consolidated);
        }

        for (school_id, indicators) in &cached {
            sqlx::query("UPDATE school_indicators.schools SET indicators = $2 WHERE id = $1")
                .bind(school_id)
                .bind(Json(indicators))
                .execute(&mut *tx)
                .await?;
        }

        if let Some(entry) = &unit.audit {
            insert_audit(entry).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(results)
    }
}

pub const SEED_ADMIN_EMAIL: &str = "admin@seduc.example";

/// Inserts a small demo region: two schools, an admin, one coordinator and a
/// handful of records written through the service so indicators are computed.
pub async fn seed(backend: Arc<PgBackend>) -> anyhow::Result<()> {
    let school_a = Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?;
    let school_b = Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?;

    let admin = UserAccount {
        id: Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
        auth_subject: None,
        name: "Secretaria Regional".to_string(),
        email: SEED_ADMIN_EMAIL.to_string(),
        role: Role::Admin,
        status: AccountStatus::Active,
        linked_schools: BTreeSet::new(),
    };
    backend
        .save_account(&admin)
        .await
        .context("failed to insert seed admin")?;

    let service = IndicatorService::new(Arc::clone(&backend));
    let actor = Actor::new("seed", SEED_ADMIN_EMAIL);

    for (id, name, manager, municipality) in [
        (school_a, "U.E. Gonçalves Dias", "Marta Sousa", "Caxias"),
        (school_b, "U.E. Maria Firmina", "João Ribeiro", "Codó"),
    ] {
        service
            .save_school(
                &actor,
                School {
                    id,
                    name: name.to_string(),
                    manager: manager.to_string(),
                    municipality: municipality.to_string(),
                    segments: vec!["early years".to_string(), "late years".to_string()],
                    average_attendance: Some(90.0),
                    indicators: Indicators::default(),
                },
            )
            .await?;
    }

    service
        .save_user(
            &actor,
            UserAccount {
                id: Uuid::parse_str("7b1e3c64-5a0e-4f55-9d5d-2f7a0f3b8c11")?,
                auth_subject: None,
                name: "Ana Coordenadora".to_string(),
                email: "ana@seduc.example".to_string(),
                role: Role::RegionalCoordinator,
                status: AccountStatus::Active,
                linked_schools: BTreeSet::from([school_a]),
            },
        )
        .await?;

    let second_year = SubPopulation {
        grade: Some(Grade::Year(2)),
        component: Some(Component::Portuguese),
        class_type: Some("regular".to_string()),
    };

    let records = vec![
        AssessmentRecord {
            school_id: school_a,
            year: 2024,
            sub_population: second_year.clone(),
            participation: Participation {
                expected: 28,
                evaluated: 25,
            },
            outcome: Outcome::Parc {
                edition: ParcEdition::Exit,
                levels: ParcOutcome {
                    pre_reader_1: 2,
                    pre_reader_2: 3,
                    pre_reader_3: 2,
                    pre_reader_4: 1,
                    beginning_reader: 12,
                    fluent_reader: 5,
                },
            },
        },
        AssessmentRecord {
            school_id: school_a,
            year: 2024,
            sub_population: second_year.clone(),
            participation: Participation {
                expected: 28,
                evaluated: 26,
            },
            outcome: Outcome::Cnca {
                assessment: CncaAssessment::Diagnostic,
                bands: CncaBands {
                    insufficient_learning: 20.0,
                    partial_learning: 35.0,
                    adequate_learning: 45.0,
                },
            },
        },
        AssessmentRecord {
            school_id: school_b,
            year: 2023,
            sub_population: SubPopulation {
                grade: Some(Grade::Year(5)),
                ..SubPopulation::default()
            },
            participation: Participation {
                expected: 40,
                evaluated: 37,
            },
            outcome: Outcome::Saeb(SaebScores {
                proficiency_lp: Some(212.4),
                proficiency_mt: Some(220.9),
                ..SaebScores::default()
            }),
        },
        AssessmentRecord {
            school_id: school_b,
            year: 2023,
            sub_population: SubPopulation::default(),
            participation: Participation {
                expected: 40,
                evaluated: 37,
            },
            outcome: Outcome::Ideb(IdebScores {
                early_years: Some(5.4),
                late_years: Some(4.6),
                approval_rate: Some(94.2),
            }),
        },
    ];

    if !backend.records_for(school_a, Instrument::Parc).await?.is_empty() {
        tracing::info!("seed records already present, skipping");
        return Ok(());
    }
    for record in records {
        service.upsert_record(&actor, None, record).await?;
    }

    tracing::info!("seed data inserted");
    Ok(())
}
