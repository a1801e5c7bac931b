use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::StatsError;
use crate::period::{PeriodKind, PeriodWindow};

// Source records. Owned by other subsystems; this crate only reads them.

#[derive(Debug, Clone)]
pub struct ClassRecord {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: Uuid,
    pub class_id: Uuid,
    pub full_name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct Measurement {
    pub student_id: Uuid,
    pub height: f64,
    pub weight: f64,
    pub measured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    EarlyLeave,
}

impl AttendanceStatus {
    /// Present and late both mean the student was in class to eat.
    pub fn is_in_class(&self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEntry {
    pub student_id: Uuid,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub arrival_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub departure_time: Option<DateTime<Utc>>,
}

/// One attendance sheet per class per day.
#[derive(Debug, Clone)]
pub struct AttendanceRecord {
    pub class_id: Uuid,
    pub date: DateTime<Utc>,
    pub entries: Vec<AttendanceEntry>,
}

/// Nutrient amounts keyed by nutrient name (calories, protein, fat, ...).
///
/// Catalog entries hold amounts per 100 units; intake totals hold absolute
/// amounts. Every arithmetic step rounds to two decimals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NutrientProfile(pub BTreeMap<String, f64>);

/// Catalog and intake documents are edited by other subsystems; null or
/// non-numeric amounts are dropped instead of failing the whole read.
impl<'de> Deserialize<'de> for NutrientProfile {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        Ok(NutrientProfile(
            raw.into_iter()
                .filter_map(|(name, amount)| amount.as_f64().map(|amount| (name, amount)))
                .collect(),
        ))
    }
}

pub const CORE_NUTRIENTS: [&str; 4] = ["calories", "protein", "fat", "carbohydrate"];

impl NutrientProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, nutrient: &str, amount: f64) -> Self {
        self.0.insert(nutrient.to_string(), round2(amount));
        self
    }

    pub fn get(&self, nutrient: &str) -> f64 {
        self.0.get(nutrient).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Amounts for `quantity` units of a per-100-unit profile.
    pub fn scaled(&self, quantity: f64) -> NutrientProfile {
        let ratio = quantity / 100.0;
        NutrientProfile(
            self.0
                .iter()
                .map(|(name, amount)| (name.clone(), round2(amount * ratio)))
                .collect(),
        )
    }

    pub fn add(&mut self, other: &NutrientProfile) {
        for (name, amount) in &other.0 {
            let entry = self.0.entry(name.clone()).or_insert(0.0);
            *entry = round2(*entry + amount);
        }
    }

    pub fn divided(&self, divisor: usize) -> NutrientProfile {
        if divisor == 0 {
            return NutrientProfile::new();
        }
        NutrientProfile(
            self.0
                .iter()
                .map(|(name, amount)| (name.clone(), round2(amount / divisor as f64)))
                .collect(),
        )
    }

    /// Make sure the headline nutrients are present, zero when unknown.
    pub fn with_core_nutrients(mut self) -> Self {
        for name in CORE_NUTRIENTS {
            self.0.entry(name.to_string()).or_insert(0.0);
        }
        self
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodPortion {
    pub food_item_id: Uuid,
    #[serde(default)]
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdHocFood {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub nutrition: NutrientProfile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealIntake {
    #[serde(default)]
    pub planned: Vec<FoodPortion>,
    #[serde(default)]
    pub actual: Vec<FoodPortion>,
    #[serde(default)]
    pub ad_hoc: Vec<AdHocFood>,
    /// Precomputed by the intake subsystem when the meal was recorded.
    #[serde(default)]
    pub total: Option<NutrientProfile>,
}

impl MealIntake {
    pub fn has_items(&self) -> bool {
        !self.actual.is_empty() || !self.ad_hoc.is_empty()
    }

    pub fn recorded_total(&self) -> Option<&NutrientProfile> {
        self.total.as_ref().filter(|total| !total.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MealIntakes {
    #[serde(default)]
    pub breakfast: MealIntake,
    #[serde(default)]
    pub lunch: MealIntake,
    #[serde(default)]
    pub snack: MealIntake,
}

impl MealIntakes {
    pub fn slots(&self) -> [&MealIntake; 3] {
        [&self.breakfast, &self.lunch, &self.snack]
    }
}

/// One intake sheet per student per day.
#[derive(Debug, Clone)]
pub struct DailyIntake {
    pub student_id: Uuid,
    pub class_id: Uuid,
    pub date: DateTime<Utc>,
    pub meals: MealIntakes,
    pub daily_total: Option<NutrientProfile>,
}

impl DailyIntake {
    pub fn recorded_daily_total(&self) -> Option<&NutrientProfile> {
        self.daily_total.as_ref().filter(|total| !total.is_empty())
    }
}

/// One health sheet per student per day.
#[derive(Debug, Clone)]
pub struct DailyHealth {
    pub student_id: Uuid,
    pub class_id: Uuid,
    pub date: DateTime<Utc>,
    pub health_status: serde_json::Value,
    pub requires_attention: bool,
}

impl DailyHealth {
    pub fn temperature(&self) -> Option<f64> {
        self.health_status.get("temperature").and_then(|t| t.as_f64())
    }
}

// Aggregated stats. The only state this crate owns.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Class,
    Student,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Class => "class",
            Scope::Student => "student",
        }
    }
}

impl FromStr for Scope {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "class" => Ok(Scope::Class),
            "student" => Ok(Scope::Student),
            other => Err(StatsError::InvalidValue {
                kind: "scope",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricGroup {
    Anthro,
    Attendance,
    Nutrition,
}

impl MetricGroup {
    pub const ALL: [MetricGroup; 3] = [
        MetricGroup::Anthro,
        MetricGroup::Attendance,
        MetricGroup::Nutrition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricGroup::Anthro => "anthro",
            MetricGroup::Attendance => "attendance",
            MetricGroup::Nutrition => "nutrition",
        }
    }
}

impl fmt::Display for MetricGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricGroup {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthro" => Ok(MetricGroup::Anthro),
            "attendance" => Ok(MetricGroup::Attendance),
            "nutrition" => Ok(MetricGroup::Nutrition),
            other => Err(StatsError::InvalidValue {
                kind: "metric group",
                value: other.to_string(),
            }),
        }
    }
}

/// The entity an aggregate summarizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Class(Uuid),
    Student(Uuid),
}

impl Subject {
    pub fn scope(&self) -> Scope {
        match self {
            Subject::Class(_) => Scope::Class,
            Subject::Student(_) => Scope::Student,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Subject::Class(id) | Subject::Student(id) => *id,
        }
    }

    pub fn class_id(&self) -> Option<Uuid> {
        match self {
            Subject::Class(id) => Some(*id),
            Subject::Student(_) => None,
        }
    }

    pub fn student_id(&self) -> Option<Uuid> {
        match self {
            Subject::Student(id) => Some(*id),
            Subject::Class(_) => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.scope().as_str(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAnthro {
    pub avg_height: Option<f64>,
    pub avg_weight: Option<f64>,
    pub sample_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAnthro {
    pub latest_height: Option<f64>,
    pub latest_weight: Option<f64>,
    pub measured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnthroValues {
    Class(ClassAnthro),
    Student(StudentAnthro),
}

/// Status tallies against expected attendance slots.
///
/// `expected_slots` is `total_students * days_count`; at student scope
/// `total_students` is 1. Slots with no row for the student count toward
/// `unrecorded`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceValues {
    pub days_count: u32,
    pub total_students: u32,
    pub expected_slots: u32,
    pub present: u32,
    pub absent: u32,
    pub late: u32,
    pub early_leave: u32,
    pub unrecorded: u32,
    pub rate_present: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub issues: u32,
    pub avg_temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassNutrition {
    pub meals: u32,
    pub present_students: u32,
    pub fed_students: u32,
    pub totals: NutrientProfile,
    pub avg_per_student: NutrientProfile,
    #[serde(flatten)]
    pub health: HealthSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentNutrition {
    pub meals_recorded: u32,
    pub records: u32,
    pub records_without_daily_total: u32,
    pub totals: NutrientProfile,
    #[serde(flatten)]
    pub health: HealthSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NutritionValues {
    Class(ClassNutrition),
    Student(StudentNutrition),
}

/// Metric-group specific payload of an aggregated stat.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatValues {
    Anthro(AnthroValues),
    Attendance(AttendanceValues),
    Nutrition(NutritionValues),
}

impl StatValues {
    pub fn metric_group(&self) -> MetricGroup {
        match self {
            StatValues::Anthro(_) => MetricGroup::Anthro,
            StatValues::Attendance(_) => MetricGroup::Attendance,
            StatValues::Nutrition(_) => MetricGroup::Nutrition,
        }
    }

    /// Scope the payload was built for; `None` when it fits either.
    fn scope(&self) -> Option<Scope> {
        match self {
            StatValues::Anthro(AnthroValues::Class(_))
            | StatValues::Nutrition(NutritionValues::Class(_)) => Some(Scope::Class),
            StatValues::Anthro(AnthroValues::Student(_))
            | StatValues::Nutrition(NutritionValues::Student(_)) => Some(Scope::Student),
            StatValues::Attendance(_) => None,
        }
    }

    /// Rebuild a stored payload; the stored scope and group pick the shape.
    pub fn decode(
        scope: Scope,
        group: MetricGroup,
        raw: serde_json::Value,
    ) -> Result<StatValues, StatsError> {
        Ok(match (group, scope) {
            (MetricGroup::Anthro, Scope::Class) => {
                StatValues::Anthro(AnthroValues::Class(serde_json::from_value(raw)?))
            }
            (MetricGroup::Anthro, Scope::Student) => {
                StatValues::Anthro(AnthroValues::Student(serde_json::from_value(raw)?))
            }
            (MetricGroup::Attendance, _) => StatValues::Attendance(serde_json::from_value(raw)?),
            (MetricGroup::Nutrition, Scope::Class) => {
                StatValues::Nutrition(NutritionValues::Class(serde_json::from_value(raw)?))
            }
            (MetricGroup::Nutrition, Scope::Student) => {
                StatValues::Nutrition(NutritionValues::Student(serde_json::from_value(raw)?))
            }
        })
    }
}

/// Natural key of an aggregated stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatKey {
    pub subject: Subject,
    pub metric_group: MetricGroup,
    pub period: PeriodKind,
    pub period_start: DateTime<Utc>,
}

/// Materialized aggregate for one entity, metric group and period bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStat {
    scope: Scope,
    metric_group: MetricGroup,
    period: PeriodKind,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    class_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    student_id: Option<Uuid>,
    values: StatValues,
}

impl AggregatedStat {
    pub fn new(
        subject: Subject,
        window: &PeriodWindow,
        values: StatValues,
    ) -> Result<Self, StatsError> {
        if let Some(scope) = values.scope() {
            if scope != subject.scope() {
                return Err(StatsError::ScopeMismatch(subject.scope().as_str()));
            }
        }
        Ok(Self {
            scope: subject.scope(),
            metric_group: values.metric_group(),
            period: window.kind,
            period_start: window.start,
            period_end: window.end,
            class_id: subject.class_id(),
            student_id: subject.student_id(),
            values,
        })
    }

    pub fn key(&self) -> StatKey {
        StatKey {
            subject: self.subject(),
            metric_group: self.metric_group,
            period: self.period,
            period_start: self.period_start,
        }
    }

    pub fn subject(&self) -> Subject {
        match (self.scope, self.class_id, self.student_id) {
            (Scope::Student, _, Some(id)) => Subject::Student(id),
            (_, Some(id), _) => Subject::Class(id),
            // Unreachable through `new`; fall back to the nil id.
            (Scope::Student, _, None) => Subject::Student(Uuid::nil()),
            (Scope::Class, None, _) => Subject::Class(Uuid::nil()),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn metric_group(&self) -> MetricGroup {
        self.metric_group
    }

    pub fn period(&self) -> PeriodKind {
        self.period
    }

    pub fn period_start(&self) -> DateTime<Utc> {
        self.period_start
    }

    pub fn period_end(&self) -> DateTime<Utc> {
        self.period_end
    }

    pub fn window(&self) -> PeriodWindow {
        PeriodWindow {
            kind: self.period,
            start: self.period_start,
            end: self.period_end,
        }
    }

    pub fn values(&self) -> &StatValues {
        &self.values
    }

    pub fn attendance(&self) -> Option<&AttendanceValues> {
        match &self.values {
            StatValues::Attendance(values) => Some(values),
            _ => None,
        }
    }
}
