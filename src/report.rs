use std::fmt::Write;

use chrono::NaiveDate;

use crate::consolidate::Metric;
use crate::models::School;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    pub metric: Metric,
    pub schools_reporting: usize,
    pub average: f64,
}

const REPORTED: [Metric; 5] = [
    Metric::ReadingFluency,
    Metric::CncaDiagnostic,
    Metric::SeamaScore,
    Metric::SaebScore,
    Metric::Ideb,
];

pub fn summarize_by_metric(schools: &[School]) -> Vec<MetricSummary> {
    REPORTED
        .iter()
        .filter_map(|&metric| {
            let values: Vec<f64> = schools
                .iter()
                .filter_map(|school| metric.cached(&school.indicators))
                .collect();
            if values.is_empty() {
                return None;
            }
            Some(MetricSummary {
                metric,
                schools_reporting: values.len(),
                average: values.iter().sum::<f64>() / values.len() as f64,
            })
        })
        .collect()
}

fn cell(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}"))
}

/// Markdown dashboard of the schools an actor can see.
pub fn build_report(actor: &str, generated_on: NaiveDate, schools: &[School]) -> String {
    let summaries = summarize_by_metric(schools);
    let mut output = String::new();

    let _ = writeln!(output, "# School Indicators Report");
    let _ = writeln!(
        output,
        "Generated for {} on {} ({} schools in scope)",
        actor,
        generated_on,
        schools.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Network Averages");

    if summaries.is_empty() {
        let _ = writeln!(output, "No consolidated indicators yet.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {:.1} across {} schools",
                summary.metric.label(),
                summary.average,
                summary.schools_reporting
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Schools");

    if schools.is_empty() {
        let _ = writeln!(output, "No schools in scope.");
    } else {
        let _ = writeln!(
            output,
            "| School | Municipality | Reading fluency % | SAEB | IDEB | Approval % | Attendance % |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|");
        for school in schools {
            let indicators = &school.indicators;
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {} | {} | {} |",
                school.name,
                school.municipality,
                cell(indicators.reading_fluency),
                cell(indicators.saeb_score),
                cell(indicators.ideb),
                cell(indicators.approval_rate),
                cell(school.average_attendance)
            );
        }
    }

    output
}
