use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{self, MealTotalsPolicy};
use crate::error::StatsError;
use crate::models::{
    AggregatedStat, AnthroValues, ClassRecord, MetricGroup, NutritionValues, StatValues,
    StudentRecord, Subject,
};
use crate::period::{PeriodCalculator, PeriodWindow};
use crate::sources::{SourceReader, StatStore};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads sources, runs the aggregators and writes results.
///
/// Every source read is bounded by `read_timeout`. Writes are single
/// upserts and are not retried.
#[derive(Clone)]
pub struct StatsEngine {
    sources: Arc<dyn SourceReader>,
    store: Arc<dyn StatStore>,
    calculator: PeriodCalculator,
    read_timeout: Duration,
    policy: MealTotalsPolicy,
}

impl StatsEngine {
    pub fn new(
        sources: Arc<dyn SourceReader>,
        store: Arc<dyn StatStore>,
        calculator: PeriodCalculator,
    ) -> Self {
        Self {
            sources,
            store,
            calculator,
            read_timeout: DEFAULT_READ_TIMEOUT,
            policy: MealTotalsPolicy::default(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_policy(mut self, policy: MealTotalsPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn calculator(&self) -> &PeriodCalculator {
        &self.calculator
    }

    pub fn store(&self) -> &Arc<dyn StatStore> {
        &self.store
    }

    async fn read<T, F>(&self, what: &'static str, read: F) -> Result<T, StatsError>
    where
        F: Future<Output = Result<T, StatsError>>,
    {
        match tokio::time::timeout(self.read_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(StatsError::Timeout {
                what,
                after: self.read_timeout,
            }),
        }
    }

    pub async fn active_classes(&self) -> Result<Vec<ClassRecord>, StatsError> {
        self.read("active classes", self.sources.active_classes()).await
    }

    pub async fn active_students(&self, class_id: Uuid) -> Result<Vec<StudentRecord>, StatsError> {
        self.read("active students", self.sources.active_students(class_id))
            .await
    }

    pub async fn student(&self, student_id: Uuid) -> Result<StudentRecord, StatsError> {
        self.read("student", self.sources.student(student_id))
            .await?
            .ok_or(StatsError::StudentNotFound(student_id))
    }

    /// Aggregate one entity for one group and window without writing it.
    pub async fn compute(
        &self,
        subject: Subject,
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<AggregatedStat, StatsError> {
        match subject {
            Subject::Class(class_id) => {
                let roster = self.active_students(class_id).await?;
                self.compute_class(class_id, &roster, group, window).await
            }
            Subject::Student(student_id) => {
                let student = self.student(student_id).await?;
                self.compute_student(&student, group, window).await
            }
        }
    }

    /// Class variant for callers that already hold the active roster.
    pub async fn compute_class(
        &self,
        class_id: Uuid,
        roster: &[StudentRecord],
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<AggregatedStat, StatsError> {
        let values = self.class_values(class_id, roster, group, window).await?;
        AggregatedStat::new(Subject::Class(class_id), window, values)
    }

    /// Student variant for callers that already hold the student record.
    pub async fn compute_student(
        &self,
        student: &StudentRecord,
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<AggregatedStat, StatsError> {
        let values = self.student_values(student, group, window).await?;
        AggregatedStat::new(Subject::Student(student.id), window, values)
    }

    pub async fn compute_and_store(
        &self,
        subject: Subject,
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<AggregatedStat, StatsError> {
        let stat = self.compute(subject, group, window).await?;
        self.store.upsert(&stat).await?;
        debug!(%subject, %group, period = %window.kind, "stat written");
        Ok(stat)
    }

    async fn class_values(
        &self,
        class_id: Uuid,
        roster: &[StudentRecord],
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<StatValues, StatsError> {
        let roster: Vec<Uuid> = roster.iter().map(|s| s.id).collect();

        let values = match group {
            MetricGroup::Anthro => {
                let measurements = self
                    .read("measurements", self.sources.measurements(&roster, window))
                    .await?;
                StatValues::Anthro(AnthroValues::Class(aggregate::anthro::class(
                    &roster,
                    &measurements,
                    window,
                )))
            }
            MetricGroup::Attendance => {
                let records = self
                    .read("attendance", self.sources.class_attendance(class_id, window))
                    .await?;
                StatValues::Attendance(aggregate::attendance::class(
                    roster.len(),
                    &records,
                    &self.calculator,
                    window,
                ))
            }
            MetricGroup::Nutrition => {
                let attendance = self
                    .read("attendance", self.sources.class_attendance(class_id, window))
                    .await?;
                let present: Vec<Uuid> =
                    aggregate::nutrition::present_slots(&attendance, &self.calculator, window)
                        .into_iter()
                        .map(|(student_id, _)| student_id)
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                let intakes = self
                    .read("intake", self.sources.class_intake(class_id, &present, window))
                    .await?;
                let food_ids = aggregate::nutrition::referenced_food_items(&intakes);
                let catalog = self
                    .read("food catalog", self.sources.food_nutrition(&food_ids))
                    .await?;
                let health = self
                    .read("health", self.sources.class_health(class_id, window))
                    .await?;
                StatValues::Nutrition(NutritionValues::Class(aggregate::nutrition::class(
                    &attendance,
                    &intakes,
                    &catalog,
                    &health,
                    &self.calculator,
                    window,
                )))
            }
        };
        Ok(values)
    }

    async fn student_values(
        &self,
        student: &StudentRecord,
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<StatValues, StatsError> {
        let values = match group {
            MetricGroup::Anthro => {
                let measurements = self
                    .read("measurements", self.sources.measurements(&[student.id], window))
                    .await?;
                StatValues::Anthro(AnthroValues::Student(aggregate::anthro::student(
                    student.id,
                    &measurements,
                    window,
                )))
            }
            MetricGroup::Attendance => {
                let records = self
                    .read(
                        "attendance",
                        self.sources.class_attendance(student.class_id, window),
                    )
                    .await?;
                StatValues::Attendance(aggregate::attendance::student(
                    student.id,
                    &records,
                    &self.calculator,
                    window,
                ))
            }
            MetricGroup::Nutrition => {
                let intakes = self
                    .read("intake", self.sources.student_intake(student.id, window))
                    .await?;
                let health = self
                    .read("health", self.sources.student_health(student.id, window))
                    .await?;
                StatValues::Nutrition(NutritionValues::Student(aggregate::nutrition::student(
                    &intakes,
                    &health,
                    window,
                    self.policy,
                )))
            }
        };
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::period::PeriodKind;
    use chrono::{TimeZone, Utc};

    fn engine(backend: Arc<MemoryBackend>) -> StatsEngine {
        StatsEngine::new(backend.clone(), backend, PeriodCalculator::new(420).unwrap())
    }

    fn window() -> PeriodWindow {
        PeriodCalculator::new(420)
            .unwrap()
            .window(PeriodKind::Week, Utc.with_ymd_and_hms(2025, 3, 5, 3, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn class_computation_reuses_the_given_roster() {
        use std::sync::atomic::Ordering;

        let backend = Arc::new(MemoryBackend::default());
        let class_id = Uuid::new_v4();
        let roster = vec![StudentRecord {
            id: Uuid::new_v4(),
            class_id,
            full_name: "An".to_string(),
            is_active: true,
        }];

        let stat = engine(backend.clone())
            .compute_class(class_id, &roster, MetricGroup::Anthro, &window())
            .await
            .unwrap();
        assert_eq!(stat.subject(), Subject::Class(class_id));
        // Only the measurements read; the roster came from the caller.
        assert_eq!(backend.read_calls.load(Ordering::Relaxed), 1);

        engine(backend.clone())
            .compute(Subject::Class(class_id), MetricGroup::Anthro, &window())
            .await
            .unwrap();
        assert_eq!(backend.read_calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn unknown_student_is_not_found() {
        let backend = Arc::new(MemoryBackend::default());
        let id = Uuid::new_v4();
        let err = engine(backend)
            .compute(Subject::Student(id), MetricGroup::Anthro, &window())
            .await
            .unwrap_err();
        assert!(matches!(err, StatsError::StudentNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn slow_reads_time_out() {
        let backend = Arc::new(MemoryBackend::slow(Duration::from_millis(200)));
        let err = engine(backend)
            .with_read_timeout(Duration::from_millis(20))
            .compute(Subject::Class(Uuid::new_v4()), MetricGroup::Attendance, &window())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn empty_class_yields_zero_values() {
        let backend = Arc::new(MemoryBackend::default());
        let stat = engine(backend.clone())
            .compute_and_store(Subject::Class(Uuid::new_v4()), MetricGroup::Anthro, &window())
            .await
            .unwrap();

        match stat.values() {
            StatValues::Anthro(AnthroValues::Class(values)) => {
                assert_eq!(values.sample_size, 0);
                assert_eq!(values.avg_height, None);
            }
            other => panic!("unexpected values {other:?}"),
        }
        assert_eq!(backend.stat_count().await, 1);
    }
}
