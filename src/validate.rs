use crate::error::ValidationError;
use crate::models::{AssessmentRecord, Grade, Instrument, Outcome, Participation, SaebScores};

/// Absorbs rounding when band percentages are typed in with one decimal.
pub const PERCENT_TOLERANCE: f64 = 0.1;

pub const SCORE_MAX: f64 = 10.0;

/// Floor/ceiling proficiency used to map a raw SAEB scale score onto 0..=10.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceRange {
    pub floor: f64,
    pub ceiling: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaebReference {
    pub portuguese: ReferenceRange,
    pub mathematics: ReferenceRange,
}

const fn range(floor: f64, ceiling: f64) -> ReferenceRange {
    ReferenceRange { floor, ceiling }
}

pub fn saeb_reference(grade: Grade) -> Option<SaebReference> {
    match grade {
        Grade::Year(5) => Some(SaebReference {
            portuguese: range(49.0, 324.0),
            mathematics: range(60.0, 322.0),
        }),
        Grade::Year(9) => Some(SaebReference {
            portuguese: range(100.0, 400.0),
            mathematics: range(100.0, 400.0),
        }),
        Grade::HighSchool(3) => Some(SaebReference {
            portuguese: range(117.0, 451.0),
            mathematics: range(111.0, 467.0),
        }),
        _ => None,
    }
}

/// Linear position of `raw` between the reference floor and ceiling, clamped to [0, 10].
pub fn normalize(raw: f64, reference: ReferenceRange) -> f64 {
    let span = reference.ceiling - reference.floor;
    let scaled = (raw - reference.floor) / span * SCORE_MAX;
    scaled.clamp(0.0, SCORE_MAX)
}

/// Checks a record before persistence and fills in the derived SAEB scores.
///
/// Checks run in a fixed order: required sub-population fields, participation,
/// band ranges and totals, then SAEB normalisation. The first failure wins.
pub fn validate(mut record: AssessmentRecord) -> Result<AssessmentRecord, ValidationError> {
    let instrument = record.instrument();

    check_required(&record, instrument)?;
    check_participation(record.participation, instrument)?;

    match &mut record.outcome {
        Outcome::Parc { levels, .. } => {
            let present = u64::from(record.participation.evaluated);
            let total = levels.total();
            if total > present {
                return Err(ValidationError::Exceeds {
                    instrument,
                    field: "reading levels total",
                    actual: total as f64,
                    limit_field: "present",
                    limit: present as f64,
                });
            }
        }
        Outcome::Cnca { bands, .. } => {
            check_bands(
                instrument,
                &[
                    ("insufficient learning", bands.insufficient_learning),
                    ("partial learning", bands.partial_learning),
                    ("adequate learning", bands.adequate_learning),
                ],
            )?;
        }
        Outcome::Seama(bands) => {
            check_bands(
                instrument,
                &[
                    ("below basic", bands.below_basic),
                    ("basic", bands.basic),
                    ("adequate", bands.adequate),
                    ("advanced", bands.advanced),
                ],
            )?;
            if let Some(mean) = bands.mean_proficiency {
                check_finite_non_negative(instrument, "mean proficiency", mean)?;
            }
        }
        Outcome::Saeb(scores) => {
            // Grade presence is guaranteed by check_required.
            let grade = record.sub_population.grade;
            derive_saeb(instrument, grade, scores)?;
        }
        Outcome::Ideb(scores) => {
            if let Some(value) = scores.early_years {
                check_range(instrument, "early years score", value, 0.0, SCORE_MAX)?;
            }
            if let Some(value) = scores.late_years {
                check_range(instrument, "late years score", value, 0.0, SCORE_MAX)?;
            }
            if let Some(value) = scores.approval_rate {
                check_range(instrument, "approval rate", value, 0.0, 100.0)?;
            }
        }
    }

    Ok(record)
}

fn check_required(record: &AssessmentRecord, instrument: Instrument) -> Result<(), ValidationError> {
    let sub = &record.sub_population;
    let missing = |field| ValidationError::MissingField { instrument, field };
    let has_class_type = sub
        .class_type
        .as_deref()
        .is_some_and(|value| !value.trim().is_empty());

    match instrument {
        Instrument::Parc => {
            sub.grade.ok_or_else(|| missing("grade"))?;
            if !has_class_type {
                return Err(missing("class type"));
            }
        }
        Instrument::Cnca | Instrument::Seama => {
            sub.grade.ok_or_else(|| missing("grade"))?;
            sub.component.ok_or_else(|| missing("component"))?;
        }
        Instrument::Saeb => {
            sub.grade.ok_or_else(|| missing("grade"))?;
        }
        Instrument::Ideb => {}
    }
    Ok(())
}

/// PARC compares present against enrolled; every other instrument compares
/// evaluated against expected. The labels differ, the rule is the same.
fn check_participation(
    participation: Participation,
    instrument: Instrument,
) -> Result<(), ValidationError> {
    let (field, limit_field) = match instrument {
        Instrument::Parc => ("present", "enrolled"),
        _ => ("evaluated", "expected"),
    };

    if participation.evaluated > participation.expected {
        return Err(ValidationError::Exceeds {
            instrument,
            field,
            actual: participation.evaluated as f64,
            limit_field,
            limit: participation.expected as f64,
        });
    }
    Ok(())
}

fn check_bands(instrument: Instrument, bands: &[(&'static str, f64)]) -> Result<(), ValidationError> {
    for &(field, value) in bands {
        check_range(instrument, field, value, 0.0, 100.0)?;
    }

    let total: f64 = bands.iter().map(|(_, value)| value).sum();
    if total > 100.0 + PERCENT_TOLERANCE {
        return Err(ValidationError::Exceeds {
            instrument,
            field: "band percentages total",
            actual: round_to(total, 2),
            limit_field: "maximum",
            limit: 100.0,
        });
    }
    Ok(())
}

fn check_range(
    instrument: Instrument,
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ValidationError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ValidationError::OutOfRange {
            instrument,
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_finite_non_negative(
    instrument: Instrument,
    field: &'static str,
    value: f64,
) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::OutOfRange {
            instrument,
            field,
            value,
            min: 0.0,
            max: f64::INFINITY,
        });
    }
    Ok(())
}

fn derive_saeb(
    instrument: Instrument,
    grade: Option<Grade>,
    scores: &mut SaebScores,
) -> Result<(), ValidationError> {
    // Out-of-scale proficiency is clamped by `normalize`; only NaN/inf is refused.
    for (field, value) in [
        ("proficiency LP", scores.proficiency_lp),
        ("proficiency MT", scores.proficiency_mt),
    ] {
        if let Some(value) = value {
            if !value.is_finite() {
                return Err(ValidationError::OutOfRange {
                    instrument,
                    field,
                    value,
                    min: f64::NEG_INFINITY,
                    max: f64::INFINITY,
                });
            }
        }
    }

    let reference = grade.and_then(saeb_reference);
    scores.normalized_lp = reference
        .zip(scores.proficiency_lp)
        .map(|(reference, raw)| normalize(raw, reference.portuguese));
    scores.normalized_mt = reference
        .zip(scores.proficiency_mt)
        .map(|(reference, raw)| normalize(raw, reference.mathematics));
    scores.overall_score = scores
        .normalized_lp
        .zip(scores.normalized_mt)
        .map(|(lp, mt)| (lp + mt) / 2.0);
    Ok(())
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CncaAssessment, CncaBands, Component, IdebScores, ParcEdition, ParcOutcome, SeamaBands,
        SubPopulation,
    };
    use uuid::Uuid;

    fn record(sub_population: SubPopulation, expected: u32, evaluated: u32, outcome: Outcome) -> AssessmentRecord {
        AssessmentRecord {
            school_id: Uuid::new_v4(),
            year: 2024,
            sub_population,
            participation: Participation { expected, evaluated },
            outcome,
        }
    }

    fn graded(grade: Grade) -> SubPopulation {
        SubPopulation {
            grade: Some(grade),
            component: Some(Component::Portuguese),
            class_type: Some("regular".to_string()),
        }
    }

    fn cnca(expected: u32, evaluated: u32, bands: CncaBands) -> AssessmentRecord {
        record(
            graded(Grade::Year(2)),
            expected,
            evaluated,
            Outcome::Cnca {
                assessment: CncaAssessment::Diagnostic,
                bands,
            },
        )
    }

    fn saeb(grade: Grade, lp: Option<f64>, mt: Option<f64>) -> AssessmentRecord {
        record(
            graded(grade),
            30,
            28,
            Outcome::Saeb(SaebScores {
                proficiency_lp: lp,
                proficiency_mt: mt,
                ..SaebScores::default()
            }),
        )
    }

    #[test]
    fn rejects_evaluated_above_expected_with_values() {
        let err = validate(cnca(40, 42, CncaBands::default())).unwrap_err();
        assert_eq!(err.to_string(), "CNCA: evaluated 42 exceeds expected 40");
    }

    #[test]
    fn parc_uses_present_and_enrolled_labels() {
        let rec = record(
            graded(Grade::Year(2)),
            20,
            21,
            Outcome::Parc {
                edition: ParcEdition::Exit,
                levels: ParcOutcome::default(),
            },
        );
        let err = validate(rec).unwrap_err();
        assert_eq!(err.to_string(), "PARC: present 21 exceeds enrolled 20");
    }

    #[test]
    fn parc_level_counts_cannot_exceed_present() {
        let rec = record(
            graded(Grade::Year(2)),
            30,
            25,
            Outcome::Parc {
                edition: ParcEdition::Exit,
                levels: ParcOutcome {
                    beginning_reader: 20,
                    fluent_reader: 6,
                    ..ParcOutcome::default()
                },
            },
        );
        assert!(matches!(
            validate(rec),
            Err(ValidationError::Exceeds { actual, limit, .. }) if actual == 26.0 && limit == 25.0
        ));
    }

    #[test]
    fn huge_level_counts_do_not_wrap_around() {
        let rec = record(
            graded(Grade::Year(2)),
            30,
            25,
            Outcome::Parc {
                edition: ParcEdition::Exit,
                levels: ParcOutcome {
                    pre_reader_1: u32::MAX,
                    fluent_reader: 1,
                    ..ParcOutcome::default()
                },
            },
        );
        assert!(matches!(
            validate(rec),
            Err(ValidationError::Exceeds { field: "reading levels total", actual, .. })
                if actual == u32::MAX as f64 + 1.0
        ));
    }

    #[test]
    fn missing_class_type_is_reported_before_participation() {
        let sub = SubPopulation {
            class_type: Some("  ".to_string()),
            ..graded(Grade::Year(1))
        };
        let rec = record(
            sub,
            10,
            99,
            Outcome::Parc {
                edition: ParcEdition::Entry,
                levels: ParcOutcome::default(),
            },
        );
        assert_eq!(
            validate(rec),
            Err(ValidationError::MissingField {
                instrument: Instrument::Parc,
                field: "class type"
            })
        );
    }

    #[test]
    fn band_sum_allows_rounding_tolerance() {
        let within = CncaBands {
            insufficient_learning: 50.05,
            partial_learning: 30.0,
            adequate_learning: 20.0,
        };
        assert!(validate(cnca(30, 30, within)).is_ok());

        let over = CncaBands {
            insufficient_learning: 50.0,
            partial_learning: 30.0,
            adequate_learning: 20.2,
        };
        let err = validate(cnca(30, 30, over)).unwrap_err();
        assert!(err.to_string().contains("100.2 exceeds maximum 100"), "{err}");
    }

    #[test]
    fn seama_four_band_total_is_capped() {
        let seama = |advanced: f64| {
            record(
                graded(Grade::Year(5)),
                30,
                30,
                Outcome::Seama(SeamaBands {
                    below_basic: 10.0,
                    basic: 30.0,
                    adequate: 40.0,
                    advanced,
                    mean_proficiency: None,
                }),
            )
        };
        assert!(validate(seama(20.05)).is_ok());

        let err = validate(seama(20.3)).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Exceeds { field: "band percentages total", .. }
        ));
        assert!(err.to_string().contains("100.3 exceeds maximum 100"), "{err}");
    }

    #[test]
    fn band_value_outside_percentage_range_is_rejected() {
        let rec = record(
            graded(Grade::Year(5)),
            30,
            30,
            Outcome::Seama(SeamaBands {
                below_basic: -1.0,
                ..SeamaBands::default()
            }),
        );
        assert!(matches!(
            validate(rec),
            Err(ValidationError::OutOfRange { field: "below basic", .. })
        ));
    }

    #[test]
    fn saeb_proficiency_at_ceiling_normalizes_to_ten() {
        let rec = validate(saeb(Grade::Year(5), Some(324.0), Some(500.0))).unwrap();
        let Outcome::Saeb(scores) = rec.outcome else {
            panic!("expected SAEB outcome");
        };
        assert_eq!(scores.normalized_lp, Some(10.0));
        assert_eq!(scores.normalized_mt, Some(10.0));
        assert_eq!(scores.overall_score, Some(10.0));
    }

    #[test]
    fn saeb_below_floor_clamps_to_zero() {
        let rec = validate(saeb(Grade::Year(9), Some(50.0), Some(250.0))).unwrap();
        let Outcome::Saeb(scores) = rec.outcome else {
            panic!("expected SAEB outcome");
        };
        assert_eq!(scores.normalized_lp, Some(0.0));
        assert_eq!(scores.normalized_mt, Some(5.0));
        assert_eq!(scores.overall_score, Some(2.5));
    }

    #[test]
    fn saeb_grade_without_reference_has_no_overall_score() {
        let rec = validate(saeb(Grade::Year(2), Some(700.0), Some(700.0))).unwrap();
        let Outcome::Saeb(scores) = rec.outcome else {
            panic!("expected SAEB outcome");
        };
        assert_eq!(scores.overall_score, None);
    }

    #[test]
    fn saeb_requires_grade() {
        let mut rec = saeb(Grade::Year(5), Some(200.0), None);
        rec.sub_population.grade = None;
        assert!(matches!(
            validate(rec),
            Err(ValidationError::MissingField { field: "grade", .. })
        ));
    }

    #[test]
    fn ideb_scores_are_bounded() {
        let rec = record(
            SubPopulation::default(),
            0,
            0,
            Outcome::Ideb(IdebScores {
                early_years: Some(10.5),
                late_years: None,
                approval_rate: None,
            }),
        );
        assert!(matches!(
            validate(rec),
            Err(ValidationError::OutOfRange { field: "early years score", .. })
        ));
    }
}
