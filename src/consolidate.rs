use std::cmp::Reverse;

use serde::Serialize;
use uuid::Uuid;

use crate::models::{CncaAssessment, Indicators, Instrument, Outcome, ParcEdition, StoredRecord};
use crate::validate::round_to;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ReadingFluency,
    CncaDiagnostic,
    CncaFormative,
    CncaSummative,
    SeamaScore,
    SaebScore,
    Ideb,
    ApprovalRate,
}

impl Metric {
    pub fn label(self) -> &'static str {
        match self {
            Metric::ReadingFluency => "PARC reading fluency %",
            Metric::CncaDiagnostic => "CNCA diagnostic adequate learning %",
            Metric::CncaFormative => "CNCA formative adequate learning %",
            Metric::CncaSummative => "CNCA summative adequate learning %",
            Metric::SeamaScore => "SEAMA adequate + advanced %",
            Metric::SaebScore => "SAEB score",
            Metric::Ideb => "IDEB",
            Metric::ApprovalRate => "Approval rate %",
        }
    }

    fn slot(self, indicators: &mut Indicators) -> &mut Option<f64> {
        match self {
            Metric::ReadingFluency => &mut indicators.reading_fluency,
            Metric::CncaDiagnostic => &mut indicators.cnca_diagnostic,
            Metric::CncaFormative => &mut indicators.cnca_formative,
            Metric::CncaSummative => &mut indicators.cnca_summative,
            Metric::SeamaScore => &mut indicators.seama_score,
            Metric::SaebScore => &mut indicators.saeb_score,
            Metric::Ideb => &mut indicators.ideb,
            Metric::ApprovalRate => &mut indicators.approval_rate,
        }
    }

    pub fn cached(self, indicators: &Indicators) -> Option<f64> {
        match self {
            Metric::ReadingFluency => indicators.reading_fluency,
            Metric::CncaDiagnostic => indicators.cnca_diagnostic,
            Metric::CncaFormative => indicators.cnca_formative,
            Metric::CncaSummative => indicators.cnca_summative,
            Metric::SeamaScore => indicators.seama_score,
            Metric::SaebScore => indicators.saeb_score,
            Metric::Ideb => indicators.ideb,
            Metric::ApprovalRate => indicators.approval_rate,
        }
    }

    /// Metrics whose cached value belongs to `instrument`.
    pub fn owned_by(instrument: Instrument) -> &'static [Metric] {
        match instrument {
            Instrument::Parc => &[Metric::ReadingFluency],
            Instrument::Cnca => &[
                Metric::CncaDiagnostic,
                Metric::CncaFormative,
                Metric::CncaSummative,
            ],
            Instrument::Seama => &[Metric::SeamaScore],
            Instrument::Saeb => &[Metric::SaebScore],
            Instrument::Ideb => &[Metric::Ideb, Metric::ApprovalRate],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedIndicator {
    pub school_id: Uuid,
    pub instrument: Instrument,
    pub metric: Metric,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Consolidated {
    Values(Vec<ConsolidatedIndicator>),
    NoData,
}

impl Consolidated {
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match self {
            Consolidated::Values(values) => values
                .iter()
                .find(|indicator| indicator.metric == metric)
                .map(|indicator| indicator.value),
            Consolidated::NoData => None,
        }
    }
}

/// Derives the consolidated indicators of one instrument for one school.
///
/// Records for other schools or instruments are ignored, so callers may pass a
/// wider set. The result depends only on the input slice.
pub fn recompute(school_id: Uuid, instrument: Instrument, records: &[StoredRecord]) -> Consolidated {
    let mut owned: Vec<&StoredRecord> = records
        .iter()
        .filter(|stored| {
            stored.record.school_id == school_id && stored.record.instrument() == instrument
        })
        .collect();
    // Stable order so "first" is well defined when years tie.
    owned.sort_by_key(|stored| (stored.created_at, stored.id));

    let indicator = |metric: Metric, value: f64| ConsolidatedIndicator {
        school_id,
        instrument,
        metric,
        value,
    };

    match instrument {
        Instrument::Parc => Consolidated::Values(vec![indicator(
            Metric::ReadingFluency,
            parc_reading_fluency(&owned),
        )]),
        Instrument::Cnca => Consolidated::Values(
            [
                (CncaAssessment::Diagnostic, Metric::CncaDiagnostic),
                (CncaAssessment::Formative, Metric::CncaFormative),
                (CncaAssessment::Summative, Metric::CncaSummative),
            ]
            .into_iter()
            .map(|(assessment, metric)| indicator(metric, cnca_adequate_mean(&owned, assessment)))
            .collect(),
        ),
        Instrument::Seama => {
            Consolidated::Values(vec![indicator(Metric::SeamaScore, seama_score(&owned))])
        }
        Instrument::Saeb => match saeb_score(&owned) {
            Some(score) => Consolidated::Values(vec![indicator(Metric::SaebScore, score)]),
            None => Consolidated::NoData,
        },
        Instrument::Ideb => {
            let (ideb, approval) = ideb_latest(&owned);
            let mut values = vec![indicator(Metric::Ideb, ideb)];
            if let Some(rate) = approval {
                values.push(indicator(Metric::ApprovalRate, rate));
            }
            Consolidated::Values(values)
        }
    }
}

/// Writes the instrument's metrics into the cached indicators, clearing any
/// owned metric the consolidation no longer produces. Other fields are untouched.
pub fn apply(indicators: &mut Indicators, instrument: Instrument, consolidated: &Consolidated) {
    for metric in Metric::owned_by(instrument) {
        *metric.slot(indicators) = consolidated.value(*metric);
    }
}

fn latest_year(records: &[&StoredRecord]) -> Option<i32> {
    records.iter().map(|stored| stored.record.year).max()
}

fn parc_reading_fluency(records: &[&StoredRecord]) -> f64 {
    let exit: Vec<_> = records
        .iter()
        .filter(|stored| {
            matches!(
                stored.record.outcome,
                Outcome::Parc {
                    edition: ParcEdition::Exit,
                    ..
                }
            )
        })
        .copied()
        .collect();

    let Some(year) = latest_year(&exit) else {
        return 0.0;
    };

    let (readers, present) = exit
        .iter()
        .filter(|stored| stored.record.year == year)
        .fold((0u64, 0u64), |(readers, present), stored| match &stored.record.outcome {
            Outcome::Parc { levels, .. } => (
                readers + u64::from(levels.beginning_reader) + u64::from(levels.fluent_reader),
                present + u64::from(stored.record.participation.evaluated),
            ),
            _ => (readers, present),
        });

    if present == 0 {
        return 0.0;
    }
    round_to(readers as f64 / present as f64 * 100.0, 1)
}

fn cnca_adequate_mean(records: &[&StoredRecord], assessment: CncaAssessment) -> f64 {
    let values: Vec<f64> = records
        .iter()
        .filter_map(|stored| match &stored.record.outcome {
            Outcome::Cnca {
                assessment: kind,
                bands,
            } if *kind == assessment => Some(bands.adequate_learning),
            _ => None,
        })
        .collect();
    round_to(mean(&values), 1)
}

fn seama_score(records: &[&StoredRecord]) -> f64 {
    let values: Vec<f64> = records
        .iter()
        .filter_map(|stored| match &stored.record.outcome {
            Outcome::Seama(bands) => Some(bands.adequate + bands.advanced),
            _ => None,
        })
        .collect();
    round_to(mean(&values), 1)
}

/// Overall score of the newest record that has one; older years are the fallback.
fn saeb_score(records: &[&StoredRecord]) -> Option<f64> {
    let mut by_year: Vec<&&StoredRecord> = records.iter().collect();
    by_year.sort_by_key(|stored| Reverse(stored.record.year));
    by_year
        .into_iter()
        .find_map(|stored| match &stored.record.outcome {
            Outcome::Saeb(scores) => scores.overall_score,
            _ => None,
        })
}

fn ideb_latest(records: &[&StoredRecord]) -> (f64, Option<f64>) {
    let Some(year) = latest_year(records) else {
        return (0.0, None);
    };

    records
        .iter()
        .filter(|stored| stored.record.year == year)
        .find_map(|stored| match &stored.record.outcome {
            Outcome::Ideb(scores) => {
                let best = scores
                    .early_years
                    .into_iter()
                    .chain(scores.late_years)
                    .fold(0.0, f64::max);
                Some((round_to(best, 1), scores.approval_rate))
            }
            _ => None,
        })
        .unwrap_or((0.0, None))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
