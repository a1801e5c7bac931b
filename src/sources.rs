//! Read and write contracts of the aggregation engine.
//!
//! Source collections are owned by other subsystems and are only read here.
//! Reads are independent point-in-time queries without a shared transaction:
//! a row written between two reads of one tick may be seen by one and missed
//! by the other. Aggregates are dashboard-grade and converge on the next tick.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StatsError;
use crate::models::{
    AggregatedStat, AttendanceRecord, ClassRecord, DailyHealth, DailyIntake, Measurement,
    MetricGroup, NutrientProfile, StudentRecord, Subject,
};
use crate::period::{PeriodKind, PeriodWindow};

#[async_trait]
pub trait SourceReader: Send + Sync + 'static {
    async fn active_classes(&self) -> Result<Vec<ClassRecord>, StatsError>;

    async fn active_students(&self, class_id: Uuid) -> Result<Vec<StudentRecord>, StatsError>;

    async fn student(&self, student_id: Uuid) -> Result<Option<StudentRecord>, StatsError>;

    async fn measurements(
        &self,
        student_ids: &[Uuid],
        window: &PeriodWindow,
    ) -> Result<Vec<Measurement>, StatsError>;

    async fn class_attendance(
        &self,
        class_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<AttendanceRecord>, StatsError>;

    async fn class_intake(
        &self,
        class_id: Uuid,
        student_ids: &[Uuid],
        window: &PeriodWindow,
    ) -> Result<Vec<DailyIntake>, StatsError>;

    async fn student_intake(
        &self,
        student_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyIntake>, StatsError>;

    async fn class_health(
        &self,
        class_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyHealth>, StatsError>;

    async fn student_health(
        &self,
        student_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyHealth>, StatsError>;

    /// Per-100-unit profiles for the given food items; unknown ids are absent.
    async fn food_nutrition(
        &self,
        food_item_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, NutrientProfile>, StatsError>;
}

#[async_trait]
pub trait StatStore: Send + Sync + 'static {
    /// Insert or overwrite the stat under its natural key.
    async fn upsert(&self, stat: &AggregatedStat) -> Result<(), StatsError>;

    /// The stat whose period starts inside `window`, if one was written.
    async fn find(
        &self,
        subject: Subject,
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<Option<AggregatedStat>, StatsError>;

    /// Most recent stats for the entity, newest period first.
    async fn history(
        &self,
        subject: Subject,
        group: MetricGroup,
        period: PeriodKind,
        limit: usize,
    ) -> Result<Vec<AggregatedStat>, StatsError>;
}
