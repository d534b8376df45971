use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instrument {
    Parc,
    Cnca,
    Seama,
    Saeb,
    Ideb,
}

impl Instrument {
    pub const ALL: [Instrument; 5] = [
        Instrument::Parc,
        Instrument::Cnca,
        Instrument::Seama,
        Instrument::Saeb,
        Instrument::Ideb,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Instrument::Parc => "parc",
            Instrument::Cnca => "cnca",
            Instrument::Seama => "seama",
            Instrument::Saeb => "saeb",
            Instrument::Ideb => "ideb",
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl FromStr for Instrument {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "parc" => Ok(Instrument::Parc),
            "cnca" => Ok(Instrument::Cnca),
            "seama" => Ok(Instrument::Seama),
            "saeb" => Ok(Instrument::Saeb),
            "ideb" => Ok(Instrument::Ideb),
            other => Err(format!("unknown instrument `{other}`")),
        }
    }
}

/// Elementary school year (1..=9) or high-school series (EM1..=EM3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Grade {
    Year(u8),
    HighSchool(u8),
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grade::Year(year) => write!(f, "{year}"),
            Grade::HighSchool(series) => write!(f, "EM{series}"),
        }
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        if let Some(series) = normalized.strip_prefix("EM") {
            return match series.trim().parse::<u8>() {
                Ok(n @ 1..=3) => Ok(Grade::HighSchool(n)),
                _ => Err(format!("invalid high-school series `{value}`")),
            };
        }

        let digits: String = normalized.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse::<u8>() {
            Ok(n @ 1..=9) => Ok(Grade::Year(n)),
            _ => Err(format!("invalid grade `{value}`")),
        }
    }
}

impl TryFrom<String> for Grade {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Grade> for String {
    fn from(grade: Grade) -> Self {
        grade.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "LP")]
    Portuguese,
    #[serde(rename = "MT")]
    Mathematics,
}

impl FromStr for Component {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LP" | "PORTUGUESE" => Ok(Component::Portuguese),
            "MT" | "MATHEMATICS" | "MATH" => Ok(Component::Mathematics),
            other => Err(format!("unknown curricular component `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubPopulation {
    pub grade: Option<Grade>,
    pub component: Option<Component>,
    pub class_type: Option<String>,
}

/// Expected vs. evaluated students. PARC reads these as enrolled vs. present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub expected: u32,
    pub evaluated: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParcEdition {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParcOutcome {
    pub pre_reader_1: u32,
    pub pre_reader_2: u32,
    pub pre_reader_3: u32,
    pub pre_reader_4: u32,
    pub beginning_reader: u32,
    pub fluent_reader: u32,
}

impl ParcOutcome {
    pub fn total(&self) -> u64 {
        [
            self.pre_reader_1,
            self.pre_reader_2,
            self.pre_reader_3,
            self.pre_reader_4,
            self.beginning_reader,
            self.fluent_reader,
        ]
        .into_iter()
        .map(u64::from)
        .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CncaAssessment {
    Diagnostic,
    Formative,
    Summative,
}

impl FromStr for CncaAssessment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "diagnostic" | "diagnostica" | "diagnóstica" => Ok(CncaAssessment::Diagnostic),
            "formative" | "formativa" => Ok(CncaAssessment::Formative),
            "summative" | "somativa" => Ok(CncaAssessment::Summative),
            other => Err(format!("unknown CNCA assessment type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CncaBands {
    pub insufficient_learning: f64,
    pub partial_learning: f64,
    pub adequate_learning: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeamaBands {
    pub below_basic: f64,
    pub basic: f64,
    pub adequate: f64,
    pub advanced: f64,
    pub mean_proficiency: Option<f64>,
}

/// Raw SAEB proficiency plus the normalised scores derived on write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaebScores {
    pub proficiency_lp: Option<f64>,
    pub proficiency_mt: Option<f64>,
    #[serde(default)]
    pub normalized_lp: Option<f64>,
    #[serde(default)]
    pub normalized_mt: Option<f64>,
    #[serde(default)]
    pub overall_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdebScores {
    pub early_years: Option<f64>,
    pub late_years: Option<f64>,
    pub approval_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "instrument", rename_all = "lowercase")]
pub enum Outcome {
    Parc {
        edition: ParcEdition,
        levels: ParcOutcome,
    },
    Cnca {
        assessment: CncaAssessment,
        bands: CncaBands,
    },
    Seama(SeamaBands),
    Saeb(SaebScores),
    Ideb(IdebScores),
}

impl Outcome {
    pub fn instrument(&self) -> Instrument {
        match self {
            Outcome::Parc { .. } => Instrument::Parc,
            Outcome::Cnca { .. } => Instrument::Cnca,
            Outcome::Seama(_) => Instrument::Seama,
            Outcome::Saeb(_) => Instrument::Saeb,
            Outcome::Ideb(_) => Instrument::Ideb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub school_id: Uuid,
    pub year: i32,
    pub sub_population: SubPopulation,
    pub participation: Participation,
    pub outcome: Outcome,
}

impl AssessmentRecord {
    pub fn instrument(&self) -> Instrument {
        self.outcome.instrument()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub record: AssessmentRecord,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Cached output of the last consolidation per instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    pub reading_fluency: Option<f64>,
    pub cnca_diagnostic: Option<f64>,
    pub cnca_formative: Option<f64>,
    pub cnca_summative: Option<f64>,
    pub seama_score: Option<f64>,
    pub saeb_score: Option<f64>,
    pub ideb: Option<f64>,
    pub approval_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    pub id: Uuid,
    pub name: String,
    pub manager: String,
    pub municipality: String,
    pub segments: Vec<String>,
    pub average_attendance: Option<f64>,
    #[serde(default)]
    pub indicators: Indicators,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    RegionalCoordinator,
    Other,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::RegionalCoordinator => "regional_coordinator",
            Role::Other => "other",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "regional_coordinator" | "coordinator" => Ok(Role::RegionalCoordinator),
            "other" => Ok(Role::Other),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(AccountStatus::Active),
            "inactive" => Ok(AccountStatus::Inactive),
            other => Err(format!("unknown account status `{other}`")),
        }
    }
}

/// Coordinator or other staff account known to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub auth_subject: Option<String>,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub status: AccountStatus,
    pub linked_schools: BTreeSet<Uuid>,
}

/// Authenticated identity handed over by the external session provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub subject: String,
    pub email: String,
}

impl Actor {
    pub fn new(subject: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            email: email.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub school_ids: BTreeSet<Uuid>,
    pub can_see_all_users: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    SchoolSaved,
    SchoolDeleted,
    UserSaved,
    UserDeleted,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::RecordCreated => "record_created",
            AuditAction::RecordUpdated => "record_updated",
            AuditAction::RecordDeleted => "record_deleted",
            AuditAction::SchoolSaved => "school_saved",
            AuditAction::SchoolDeleted => "school_deleted",
            AuditAction::UserSaved => "user_saved",
            AuditAction::UserDeleted => "user_deleted",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "record_created" => Ok(AuditAction::RecordCreated),
            "record_updated" => Ok(AuditAction::RecordUpdated),
            "record_deleted" => Ok(AuditAction::RecordDeleted),
            "school_saved" => Ok(AuditAction::SchoolSaved),
            "school_deleted" => Ok(AuditAction::SchoolDeleted),
            "user_saved" => Ok(AuditAction::UserSaved),
            "user_deleted" => Ok(AuditAction::UserDeleted),
            other => Err(format!("unknown audit action `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub occurred_at: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub subject_id: Uuid,
    pub school_id: Option<Uuid>,
    pub detail: String,
}
