use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StatsError;
use crate::models::{
    AggregatedStat, AttendanceRecord, ClassRecord, DailyHealth, DailyIntake, Measurement,
    MetricGroup, NutrientProfile, StatKey, StudentRecord, Subject,
};
use crate::period::{PeriodKind, PeriodWindow};
use crate::sources::{SourceReader, StatStore};

/// In-process backend for tests and local runs without Postgres.
///
/// Reads touching an id in `failing` return an error, `fail_class_listing`
/// breaks the active class listing, and `slow_read` delays every read by
/// `slow_read_delay`.
pub struct MemoryBackend {
    pub classes: Mutex<Vec<ClassRecord>>,
    pub students: Mutex<Vec<StudentRecord>>,
    pub measurements: Mutex<Vec<Measurement>>,
    pub attendance: Mutex<Vec<AttendanceRecord>>,
    pub intakes: Mutex<Vec<DailyIntake>>,
    pub health: Mutex<Vec<DailyHealth>>,
    pub foods: Mutex<HashMap<Uuid, NutrientProfile>>,
    pub stats: Mutex<HashMap<StatKey, AggregatedStat>>,
    pub failing: Mutex<HashSet<Uuid>>,
    pub fail_class_listing: AtomicBool,
    pub read_calls: AtomicU64,
    pub upsert_calls: AtomicU64,
    pub slow_read: bool,
    pub slow_read_delay: Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            classes: Mutex::new(Vec::new()),
            students: Mutex::new(Vec::new()),
            measurements: Mutex::new(Vec::new()),
            attendance: Mutex::new(Vec::new()),
            intakes: Mutex::new(Vec::new()),
            health: Mutex::new(Vec::new()),
            foods: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            fail_class_listing: AtomicBool::new(false),
            read_calls: AtomicU64::new(0),
            upsert_calls: AtomicU64::new(0),
            slow_read: false,
            slow_read_delay: Duration::from_millis(0),
        }
    }
}

impl MemoryBackend {
    pub fn slow(delay: Duration) -> Self {
        Self {
            slow_read: true,
            slow_read_delay: delay,
            ..Self::default()
        }
    }

    async fn begin_read(&self, ids: &[Uuid]) -> Result<(), StatsError> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        if self.slow_read {
            tokio::time::sleep(self.slow_read_delay).await;
        }
        let failing = self.failing.lock().await;
        if let Some(id) = ids.iter().find(|id| failing.contains(id)) {
            return Err(StatsError::Database(sqlx::Error::Protocol(format!(
                "read failure injected for {id}"
            ))));
        }
        Ok(())
    }

    pub async fn stat_count(&self) -> usize {
        self.stats.lock().await.len()
    }
}

#[async_trait]
impl SourceReader for MemoryBackend {
    async fn active_classes(&self) -> Result<Vec<ClassRecord>, StatsError> {
        self.begin_read(&[]).await?;
        if self.fail_class_listing.load(Ordering::Relaxed) {
            return Err(StatsError::Database(sqlx::Error::Protocol(
                "class listing failure injected".to_string(),
            )));
        }
        let mut classes: Vec<ClassRecord> = self
            .classes
            .lock()
            .await
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        classes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(classes)
    }

    async fn active_students(&self, class_id: Uuid) -> Result<Vec<StudentRecord>, StatsError> {
        self.begin_read(&[class_id]).await?;
        let mut students: Vec<StudentRecord> = self
            .students
            .lock()
            .await
            .iter()
            .filter(|s| s.class_id == class_id && s.is_active)
            .cloned()
            .collect();
        students.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(students)
    }

    async fn student(&self, student_id: Uuid) -> Result<Option<StudentRecord>, StatsError> {
        self.begin_read(&[student_id]).await?;
        Ok(self
            .students
            .lock()
            .await
            .iter()
            .find(|s| s.id == student_id)
            .cloned())
    }

    async fn measurements(
        &self,
        student_ids: &[Uuid],
        window: &PeriodWindow,
    ) -> Result<Vec<Measurement>, StatsError> {
        self.begin_read(student_ids).await?;
        Ok(self
            .measurements
            .lock()
            .await
            .iter()
            .filter(|m| student_ids.contains(&m.student_id) && window.contains(m.measured_at))
            .cloned()
            .collect())
    }

    async fn class_attendance(
        &self,
        class_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<AttendanceRecord>, StatsError> {
        self.begin_read(&[class_id]).await?;
        let mut records: Vec<AttendanceRecord> = self
            .attendance
            .lock()
            .await
            .iter()
            .filter(|r| r.class_id == class_id && window.contains(r.date))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.date);
        Ok(records)
    }

    async fn class_intake(
        &self,
        class_id: Uuid,
        student_ids: &[Uuid],
        window: &PeriodWindow,
    ) -> Result<Vec<DailyIntake>, StatsError> {
        self.begin_read(&[class_id]).await?;
        Ok(self
            .intakes
            .lock()
            .await
            .iter()
            .filter(|i| {
                i.class_id == class_id
                    && student_ids.contains(&i.student_id)
                    && window.contains(i.date)
            })
            .cloned()
            .collect())
    }

    async fn student_intake(
        &self,
        student_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyIntake>, StatsError> {
        self.begin_read(&[student_id]).await?;
        Ok(self
            .intakes
            .lock()
            .await
            .iter()
            .filter(|i| i.student_id == student_id && window.contains(i.date))
            .cloned()
            .collect())
    }

    async fn class_health(
        &self,
        class_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyHealth>, StatsError> {
        self.begin_read(&[class_id]).await?;
        Ok(self
            .health
            .lock()
            .await
            .iter()
            .filter(|h| h.class_id == class_id && window.contains(h.date))
            .cloned()
            .collect())
    }

    async fn student_health(
        &self,
        student_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyHealth>, StatsError> {
        self.begin_read(&[student_id]).await?;
        Ok(self
            .health
            .lock()
            .await
            .iter()
            .filter(|h| h.student_id == student_id && window.contains(h.date))
            .cloned()
            .collect())
    }

    async fn food_nutrition(
        &self,
        food_item_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, NutrientProfile>, StatsError> {
        self.begin_read(&[]).await?;
        let foods = self.foods.lock().await;
        Ok(food_item_ids
            .iter()
            .filter_map(|id| foods.get(id).map(|profile| (*id, profile.clone())))
            .collect())
    }
}

#[async_trait]
impl StatStore for MemoryBackend {
    async fn upsert(&self, stat: &AggregatedStat) -> Result<(), StatsError> {
        self.upsert_calls.fetch_add(1, Ordering::Relaxed);
        self.stats.lock().await.insert(stat.key(), stat.clone());
        Ok(())
    }

    async fn find(
        &self,
        subject: Subject,
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<Option<AggregatedStat>, StatsError> {
        Ok(self
            .stats
            .lock()
            .await
            .values()
            .filter(|s| {
                s.subject() == subject
                    && s.metric_group() == group
                    && s.period() == window.kind
                    && window.contains(s.period_start())
            })
            .max_by_key(|s| s.period_start())
            .cloned())
    }

    async fn history(
        &self,
        subject: Subject,
        group: MetricGroup,
        period: PeriodKind,
        limit: usize,
    ) -> Result<Vec<AggregatedStat>, StatsError> {
        let mut stats: Vec<AggregatedStat> = self
            .stats
            .lock()
            .await
            .values()
            .filter(|s| s.subject() == subject && s.metric_group() == group && s.period() == period)
            .cloned()
            .collect();
        stats.sort_by(|a, b| b.period_start().cmp(&a.period_start()));
        stats.truncate(limit);
        Ok(stats)
    }
}
