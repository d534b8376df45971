use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{
    Actor, AssessmentRecord, CncaAssessment, CncaBands, Component, Grade, IdebScores, Instrument,
    Outcome, ParcEdition, ParcOutcome, Participation, SaebScores, SeamaBands, SubPopulation,
};
use crate::service::IndicatorService;
use crate::store::Backend;

/// One CSV line. Columns that do not apply to the chosen instrument stay empty.
#[derive(Debug, Deserialize)]
struct CsvRow {
    id: Option<Uuid>,
    school_id: Uuid,
    year: i32,
    grade: Option<String>,
    component: Option<String>,
    class_type: Option<String>,
    expected: u32,
    evaluated: u32,
    edition: Option<String>,
    pre_reader_1: Option<u32>,
    pre_reader_2: Option<u32>,
    pre_reader_3: Option<u32>,
    pre_reader_4: Option<u32>,
    beginning_reader: Option<u32>,
    fluent_reader: Option<u32>,
    assessment: Option<String>,
    insufficient_learning: Option<f64>,
    partial_learning: Option<f64>,
    adequate_learning: Option<f64>,
    below_basic: Option<f64>,
    basic: Option<f64>,
    adequate: Option<f64>,
    advanced: Option<f64>,
    mean_proficiency: Option<f64>,
    proficiency_lp: Option<f64>,
    proficiency_mt: Option<f64>,
    early_years: Option<f64>,
    late_years: Option<f64>,
    approval_rate: Option<f64>,
}

fn required<T>(value: Option<T>, column: &str) -> anyhow::Result<T> {
    value.ok_or_else(|| anyhow!("column `{column}` is required"))
}

impl CsvRow {
    fn into_record(self, instrument: Instrument) -> anyhow::Result<AssessmentRecord> {
        let grade = self
            .grade
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(str::parse::<Grade>)
            .transpose()
            .map_err(|err| anyhow!(err))?;
        let component = self
            .component
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(str::parse::<Component>)
            .transpose()
            .map_err(|err| anyhow!(err))?;

        let outcome = match instrument {
            Instrument::Parc => {
                let edition = match required(self.edition, "edition")?.trim().to_ascii_lowercase().as_str() {
                    "entry" | "entrada" => ParcEdition::Entry,
                    "exit" | "saida" | "saída" => ParcEdition::Exit,
                    other => return Err(anyhow!("unknown PARC edition `{other}`")),
                };
                Outcome::Parc {
                    edition,
                    levels: ParcOutcome {
                        pre_reader_1: self.pre_reader_1.unwrap_or(0),
                        pre_reader_2: self.pre_reader_2.unwrap_or(0),
                        pre_reader_3: self.pre_reader_3.unwrap_or(0),
                        pre_reader_4: self.pre_reader_4.unwrap_or(0),
                        beginning_reader: self.beginning_reader.unwrap_or(0),
                        fluent_reader: self.fluent_reader.unwrap_or(0),
                    },
                }
            }
            Instrument::Cnca => Outcome::Cnca {
                assessment: required(self.assessment, "assessment")?
                    .parse::<CncaAssessment>()
                    .map_err(|err| anyhow!(err))?,
                bands: CncaBands {
                    insufficient_learning: self.insufficient_learning.unwrap_or(0.0),
                    partial_learning: self.partial_learning.unwrap_or(0.0),
                    adequate_learning: required(self.adequate_learning, "adequate_learning")?,
                },
            },
            Instrument::Seama => Outcome::Seama(SeamaBands {
                below_basic: self.below_basic.unwrap_or(0.0),
                basic: self.basic.unwrap_or(0.0),
                adequate: required(self.adequate, "adequate")?,
                advanced: required(self.advanced, "advanced")?,
                mean_proficiency: self.mean_proficiency,
            }),
            Instrument::Saeb => Outcome::Saeb(SaebScores {
                proficiency_lp: self.proficiency_lp,
                proficiency_mt: self.proficiency_mt,
                ..SaebScores::default()
            }),
            Instrument::Ideb => Outcome::Ideb(IdebScores {
                early_years: self.early_years,
                late_years: self.late_years,
                approval_rate: self.approval_rate,
            }),
        };

        Ok(AssessmentRecord {
            school_id: self.school_id,
            year: self.year,
            sub_population: SubPopulation {
                grade,
                component,
                class_type: self.class_type.filter(|value| !value.trim().is_empty()),
            },
            participation: Participation {
                expected: self.expected,
                evaluated: self.evaluated,
            },
            outcome,
        })
    }
}

/// Upserts every row through the service, stopping at the first rejected row.
/// Rows carrying an `id` edit that record; the rest create new ones.
pub async fn import_csv<B: Backend + ?Sized>(
    service: &IndicatorService<B>,
    actor: &Actor,
    instrument: Instrument,
    csv_path: &Path,
) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    import_reader(service, actor, instrument, file).await
}

pub async fn import_reader<B: Backend + ?Sized, R: Read>(
    service: &IndicatorService<B>,
    actor: &Actor,
    instrument: Instrument,
    input: R,
) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_reader(input);
    let mut imported = 0usize;

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let row = result.with_context(|| format!("line {line}: malformed row"))?;
        let id = row.id;
        let record = row
            .into_record(instrument)
            .with_context(|| format!("line {line}"))?;
        service
            .upsert_record(actor, id, record)
            .await
            .with_context(|| format!("line {line}"))?;
        imported += 1;
    }

    tracing::info!(instrument = instrument.as_str(), imported, "csv import finished");
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use crate::models::{AccountStatus, Indicators, Role, School, UserAccount};
    use crate::store::MemoryBackend;

    async fn service_with_school(school_id: Uuid) -> IndicatorService<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .save_school(&School {
                id: school_id,
                name: "Escola A".to_string(),
                manager: "Marta Sousa".to_string(),
                municipality: "Caxias".to_string(),
                segments: Vec::new(),
                average_attendance: None,
                indicators: Indicators::default(),
            })
            .await
            .unwrap();
        backend
            .save_account(&UserAccount {
                id: Uuid::new_v4(),
                auth_subject: None,
                name: "Ana".to_string(),
                email: "ana@seduc.example".to_string(),
                role: Role::RegionalCoordinator,
                status: AccountStatus::Active,
                linked_schools: BTreeSet::from([school_id]),
            })
            .await
            .unwrap();
        IndicatorService::new(backend)
    }

    const PARC_HEADER: &str = "id,school_id,year,grade,component,class_type,expected,evaluated,edition,pre_reader_1,pre_reader_2,pre_reader_3,pre_reader_4,beginning_reader,fluent_reader,assessment,insufficient_learning,partial_learning,adequate_learning,below_basic,basic,adequate,advanced,mean_proficiency,proficiency_lp,proficiency_mt,early_years,late_years,approval_rate";

    #[tokio::test]
    async fn imports_parc_rows_and_recomputes() {
        let school = Uuid::new_v4();
        let service = service_with_school(school).await;
        let actor = Actor::new("sub-ana", "ana@seduc.example");
        let csv = format!(
            "{PARC_HEADER}\n\
             ,{school},2024,2,LP,regular,30,25,saida,,,,,12,5,,,,,,,,,,,,,,\n\
             ,{school},2024,2,LP,regular,30,25,exit,,,,,0,0,,,,,,,,,,,,,,\n"
        );

        let imported = import_reader(&service, &actor, Instrument::Parc, csv.as_bytes())
            .await
            .unwrap();
        assert_eq!(imported, 2);

        let school = service.school(&actor, school).await.unwrap();
        assert_eq!(school.indicators.reading_fluency, Some(34.0));
    }

    #[tokio::test]
    async fn reports_the_failing_line() {
        let school = Uuid::new_v4();
        let service = service_with_school(school).await;
        let actor = Actor::new("sub-ana", "ana@seduc.example");
        let csv = format!(
            "{PARC_HEADER}\n\
             ,{school},2024,2,LP,,20,18,,,,,,,,diagnostica,10,20,70,,,,,,,,,,\n\
             ,{school},2024,2,LP,,20,22,,,,,,,,diagnostica,10,20,70,,,,,,,,,,\n"
        );

        let err = import_reader(&service, &actor, Instrument::Cnca, csv.as_bytes())
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("line 3"), "{message}");
        assert!(message.contains("evaluated 22 exceeds expected 20"), "{message}");
    }
}
