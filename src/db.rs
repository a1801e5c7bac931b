use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::aggregate::nutrition::meal_total;
use crate::aggregate::FoodCatalog;
use crate::error::StatsError;
use crate::models::{
    round2, AdHocFood, AggregatedStat, AttendanceEntry, AttendanceRecord, AttendanceStatus,
    ClassRecord, DailyHealth, DailyIntake, FoodPortion, MealIntake, MealIntakes, Measurement,
    MetricGroup, NutrientProfile, Scope, StatValues, StudentRecord, Subject,
};
use crate::period::{PeriodCalculator, PeriodKind, PeriodWindow};
use crate::sources::{SourceReader, StatStore};

pub async fn init_db(pool: &PgPool) -> Result<(), StatsError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed source reader and stat store.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn class_from_row(row: &PgRow) -> Result<ClassRecord, StatsError> {
    Ok(ClassRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
    })
}

fn student_from_row(row: &PgRow) -> Result<StudentRecord, StatsError> {
    Ok(StudentRecord {
        id: row.try_get("id")?,
        class_id: row.try_get("class_id")?,
        full_name: row.try_get("full_name")?,
        is_active: row.try_get("is_active")?,
    })
}

fn intake_from_row(row: &PgRow) -> Result<DailyIntake, StatsError> {
    let meals: Json<MealIntakes> = row.try_get("meals")?;
    let daily_total: Option<Json<NutrientProfile>> = row.try_get("daily_total")?;
    Ok(DailyIntake {
        student_id: row.try_get("student_id")?,
        class_id: row.try_get("class_id")?,
        date: row.try_get("date")?,
        meals: meals.0,
        daily_total: daily_total.map(|total| total.0),
    })
}

fn health_from_row(row: &PgRow) -> Result<DailyHealth, StatsError> {
    Ok(DailyHealth {
        student_id: row.try_get("student_id")?,
        class_id: row.try_get("class_id")?,
        date: row.try_get("date")?,
        health_status: row.try_get("health_status")?,
        requires_attention: row.try_get("requires_attention")?,
    })
}

fn stat_from_row(row: &PgRow) -> Result<AggregatedStat, StatsError> {
    let scope: Scope = row.try_get::<String, _>("scope")?.parse()?;
    let group: MetricGroup = row.try_get::<String, _>("metric_group")?.parse()?;
    let period: PeriodKind = row.try_get::<String, _>("period")?.parse()?;
    let class_id: Option<Uuid> = row.try_get("class_id")?;
    let student_id: Option<Uuid> = row.try_get("student_id")?;

    let subject = match (scope, class_id, student_id) {
        (Scope::Class, Some(id), _) => Subject::Class(id),
        (Scope::Student, _, Some(id)) => Subject::Student(id),
        (scope, _, _) => return Err(StatsError::ScopeMismatch(scope.as_str())),
    };
    let window = PeriodWindow {
        kind: period,
        start: row.try_get("period_start")?,
        end: row.try_get("period_end")?,
    };
    let values = StatValues::decode(scope, group, row.try_get("stat_values")?)?;
    AggregatedStat::new(subject, &window, values)
}

const INTAKE_COLUMNS: &str = "student_id, class_id, date, meals, daily_total";
const HEALTH_COLUMNS: &str = "student_id, class_id, date, health_status, requires_attention";
const STAT_COLUMNS: &str =
    "scope, metric_group, period, period_start, period_end, class_id, student_id, stat_values";

#[async_trait]
impl SourceReader for PgBackend {
    async fn active_classes(&self) -> Result<Vec<ClassRecord>, StatsError> {
        let rows = sqlx::query(
            "SELECT id, name, is_active FROM school_stats.classes WHERE is_active ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(class_from_row).collect()
    }

    async fn active_students(&self, class_id: Uuid) -> Result<Vec<StudentRecord>, StatsError> {
        let rows = sqlx::query(
            r#"
            SELECT id, class_id, full_name, is_active
            FROM school_stats.students
            WHERE class_id = $1 AND is_active
            ORDER BY full_name
            "#,
        )
        .bind(class_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(student_from_row).collect()
    }

    async fn student(&self, student_id: Uuid) -> Result<Option<StudentRecord>, StatsError> {
        let row = sqlx::query(
            "SELECT id, class_id, full_name, is_active FROM school_stats.students WHERE id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(student_from_row).transpose()
    }

    async fn measurements(
        &self,
        student_ids: &[Uuid],
        window: &PeriodWindow,
    ) -> Result<Vec<Measurement>, StatsError> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT student_id, height, weight, measured_at
            FROM school_stats.measurements
            WHERE student_id = ANY($1) AND measured_at >= $2 AND measured_at < $3
            ORDER BY student_id, measured_at DESC
            "#,
        )
        .bind(student_ids)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        let mut measurements = Vec::with_capacity(rows.len());
        for row in rows {
            measurements.push(Measurement {
                student_id: row.try_get("student_id")?,
                height: row.try_get("height")?,
                weight: row.try_get("weight")?,
                measured_at: row.try_get("measured_at")?,
            });
        }
        Ok(measurements)
    }

    async fn class_attendance(
        &self,
        class_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<AttendanceRecord>, StatsError> {
        let rows = sqlx::query(
            r#"
            SELECT class_id, date, entries
            FROM school_stats.attendance
            WHERE class_id = $1 AND date >= $2 AND date < $3
            ORDER BY date
            "#,
        )
        .bind(class_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let entries: Json<Vec<AttendanceEntry>> = row.try_get("entries")?;
            records.push(AttendanceRecord {
                class_id: row.try_get("class_id")?,
                date: row.try_get("date")?,
                entries: entries.0,
            });
        }
        Ok(records)
    }

    async fn class_intake(
        &self,
        class_id: Uuid,
        student_ids: &[Uuid],
        window: &PeriodWindow,
    ) -> Result<Vec<DailyIntake>, StatsError> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {INTAKE_COLUMNS} FROM school_stats.daily_intake \
             WHERE class_id = $1 AND student_id = ANY($2) AND date >= $3 AND date < $4 \
             ORDER BY date, student_id"
        );
        let rows = sqlx::query(&query)
            .bind(class_id)
            .bind(student_ids)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(intake_from_row).collect()
    }

    async fn student_intake(
        &self,
        student_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyIntake>, StatsError> {
        let query = format!(
            "SELECT {INTAKE_COLUMNS} FROM school_stats.daily_intake \
             WHERE student_id = $1 AND date >= $2 AND date < $3 ORDER BY date"
        );
        let rows = sqlx::query(&query)
            .bind(student_id)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(intake_from_row).collect()
    }

    async fn class_health(
        &self,
        class_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyHealth>, StatsError> {
        let query = format!(
            "SELECT {HEALTH_COLUMNS} FROM school_stats.daily_health \
             WHERE class_id = $1 AND date >= $2 AND date < $3 ORDER BY date"
        );
        let rows = sqlx::query(&query)
            .bind(class_id)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(health_from_row).collect()
    }

    async fn student_health(
        &self,
        student_id: Uuid,
        window: &PeriodWindow,
    ) -> Result<Vec<DailyHealth>, StatsError> {
        let query = format!(
            "SELECT {HEALTH_COLUMNS} FROM school_stats.daily_health \
             WHERE student_id = $1 AND date >= $2 AND date < $3 ORDER BY date"
        );
        let rows = sqlx::query(&query)
            .bind(student_id)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(health_from_row).collect()
    }

    async fn food_nutrition(
        &self,
        food_item_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, NutrientProfile>, StatsError> {
        if food_item_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT id, nutrition FROM school_stats.food_items WHERE id = ANY($1)")
            .bind(food_item_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut catalog = HashMap::with_capacity(rows.len());
        for row in rows {
            let nutrition: Json<NutrientProfile> = row.try_get("nutrition")?;
            catalog.insert(row.try_get("id")?, nutrition.0);
        }
        Ok(catalog)
    }
}

#[async_trait]
impl StatStore for PgBackend {
    async fn upsert(&self, stat: &AggregatedStat) -> Result<(), StatsError> {
        let key = stat.key();
        sqlx::query(
            r#"
            INSERT INTO school_stats.aggregated_stats
            (scope, metric_group, period, period_start, period_end, class_id, student_id, stat_values)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT ON CONSTRAINT aggregated_stats_natural_key DO UPDATE
            SET period_end = EXCLUDED.period_end, stat_values = EXCLUDED.stat_values
            "#,
        )
        .bind(key.subject.scope().as_str())
        .bind(key.metric_group.as_str())
        .bind(key.period.as_str())
        .bind(key.period_start)
        .bind(stat.period_end())
        .bind(key.subject.class_id())
        .bind(key.subject.student_id())
        .bind(Json(stat.values()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(
        &self,
        subject: Subject,
        group: MetricGroup,
        window: &PeriodWindow,
    ) -> Result<Option<AggregatedStat>, StatsError> {
        let query = format!(
            "SELECT {STAT_COLUMNS} FROM school_stats.aggregated_stats \
             WHERE scope = $1 AND metric_group = $2 AND period = $3 \
             AND period_start >= $4 AND period_start < $5 \
             AND class_id IS NOT DISTINCT FROM $6 AND student_id IS NOT DISTINCT FROM $7 \
             ORDER BY period_start DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(subject.scope().as_str())
            .bind(group.as_str())
            .bind(window.kind.as_str())
            .bind(window.start)
            .bind(window.end)
            .bind(subject.class_id())
            .bind(subject.student_id())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stat_from_row).transpose()
    }

    async fn history(
        &self,
        subject: Subject,
        group: MetricGroup,
        period: PeriodKind,
        limit: usize,
    ) -> Result<Vec<AggregatedStat>, StatsError> {
        let query = format!(
            "SELECT {STAT_COLUMNS} FROM school_stats.aggregated_stats \
             WHERE scope = $1 AND metric_group = $2 AND period = $3 \
             AND class_id IS NOT DISTINCT FROM $4 AND student_id IS NOT DISTINCT FROM $5 \
             ORDER BY period_start DESC LIMIT $6"
        );
        let rows = sqlx::query(&query)
            .bind(subject.scope().as_str())
            .bind(group.as_str())
            .bind(period.as_str())
            .bind(subject.class_id())
            .bind(subject.student_id())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(stat_from_row).collect()
    }
}

/// Load a small demo school whose records fall in the current week.
pub async fn seed(pool: &PgPool, calculator: &PeriodCalculator) -> anyhow::Result<()> {
    let class_id = Uuid::parse_str("6f1c2a44-0b5e-4c1e-9d38-5b0e6c1f2a01")?;
    sqlx::query(
        r#"
        INSERT INTO school_stats.classes (id, name, is_active)
        VALUES ($1, $2, TRUE)
        ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
        "#,
    )
    .bind(class_id)
    .bind("Sunflower (4-5 years)")
    .execute(pool)
    .await?;

    let names = [
        "An Nguyen",
        "Binh Tran",
        "Chi Le",
        "Dung Pham",
        "Giang Hoang",
        "Hanh Vu",
        "Khoa Dang",
        "Lan Bui",
        "Minh Do",
        "Ngoc Ho",
    ];
    let mut students = Vec::with_capacity(names.len());
    for (index, name) in names.iter().enumerate() {
        let id = Uuid::from_u128(0x7a3e_0000_0000_4000_8000_0000_0000_0000 + index as u128);
        sqlx::query(
            r#"
            INSERT INTO school_stats.students (id, class_id, full_name, is_active)
            VALUES ($1, $2, $3, TRUE)
            ON CONFLICT (id) DO UPDATE SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(id)
        .bind(class_id)
        .bind(*name)
        .execute(pool)
        .await?;
        students.push(id);
    }

    let foods = [
        ("Steamed rice", profile(130.0, 2.7, 0.3, 28.0)),
        ("Braised pork", profile(242.0, 27.0, 14.0, 0.0)),
        ("Banana", profile(89.0, 1.1, 0.3, 22.8)),
    ];
    let mut food_ids = Vec::with_capacity(foods.len());
    let mut catalog = FoodCatalog::with_capacity(foods.len());
    for (name, nutrition) in foods {
        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO school_stats.food_items (id, name, unit, nutrition)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET nutrition = EXCLUDED.nutrition
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind("g")
        .bind(Json(&nutrition))
        .fetch_one(pool)
        .await?
        .try_get("id")?;
        food_ids.push(id);
        catalog.insert(id, nutrition);
    }

    let now = Utc::now();
    let week = calculator.window(PeriodKind::Week, now);
    let mut day_start = week.start;
    let mut day = 0usize;
    while day_start <= now && day < 5 {
        let sheet_at = day_start + Duration::hours(1);
        seed_day(pool, class_id, &students, &food_ids, &catalog, sheet_at, day).await?;
        day_start += Duration::days(1);
        day += 1;
    }

    Ok(())
}

fn profile(calories: f64, protein: f64, fat: f64, carbohydrate: f64) -> NutrientProfile {
    NutrientProfile::new()
        .with("calories", calories)
        .with("protein", protein)
        .with("fat", fat)
        .with("carbohydrate", carbohydrate)
}

async fn seed_day(
    pool: &PgPool,
    class_id: Uuid,
    students: &[Uuid],
    food_ids: &[Uuid],
    catalog: &FoodCatalog,
    at: DateTime<Utc>,
    day: usize,
) -> anyhow::Result<()> {
    let entries: Vec<AttendanceEntry> = students
        .iter()
        .enumerate()
        .map(|(index, student_id)| AttendanceEntry {
            student_id: *student_id,
            status: match (index + day) % 10 {
                0 => AttendanceStatus::Absent,
                1 => AttendanceStatus::Late,
                _ => AttendanceStatus::Present,
            },
            arrival_time: Some(at),
            departure_time: None,
        })
        .collect();

    sqlx::query(
        r#"
        INSERT INTO school_stats.attendance (id, class_id, date, entries)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (class_id, date) DO UPDATE SET entries = EXCLUDED.entries
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(class_id)
    .bind(at)
    .bind(Json(&entries))
    .execute(pool)
    .await?;

    for (index, entry) in entries.iter().enumerate() {
        if !entry.status.is_in_class() {
            continue;
        }
        let lunch = MealIntake {
            actual: vec![
                FoodPortion {
                    food_item_id: food_ids[0],
                    quantity: 150.0 + (index * 10) as f64,
                },
                FoodPortion {
                    food_item_id: food_ids[1],
                    quantity: 60.0,
                },
            ],
            ..MealIntake::default()
        };
        let snack = MealIntake {
            ad_hoc: vec![AdHocFood {
                name: "Soy milk".to_string(),
                quantity: 200.0,
                nutrition: profile(54.0, 3.3, 1.8, 6.3),
            }],
            ..MealIntake::default()
        };
        let mut meals = MealIntakes {
            lunch,
            snack,
            ..MealIntakes::default()
        };
        // Totals are filled in the way the intake screen records them.
        let mut daily_total = NutrientProfile::new();
        for meal in [&mut meals.lunch, &mut meals.snack] {
            let total = meal_total(meal, catalog);
            daily_total.add(&total);
            meal.total = Some(total);
        }

        sqlx::query(
            r#"
            INSERT INTO school_stats.daily_intake
            (id, student_id, class_id, date, meals, daily_total)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (student_id, date) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.student_id)
        .bind(class_id)
        .bind(at)
        .bind(Json(&meals))
        .bind(Json(&daily_total))
        .execute(pool)
        .await?;

        let temperature = 36.5 + ((index + day) % 4) as f64 * 0.3;
        sqlx::query(
            r#"
            INSERT INTO school_stats.daily_health
            (id, student_id, class_id, date, health_status, requires_attention)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (student_id, date) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.student_id)
        .bind(class_id)
        .bind(at)
        .bind(serde_json::json!({ "temperature": temperature }))
        .bind(temperature >= 37.4)
        .execute(pool)
        .await?;
    }

    if day == 0 {
        for (index, student_id) in students.iter().enumerate() {
            insert_measurement(
                pool,
                *student_id,
                102.0 + index as f64 * 1.5,
                16.0 + index as f64 * 0.4,
                at,
            )
            .await?;
        }
    }

    Ok(())
}

/// Body mass index from centimetres and kilograms.
pub fn bmi(height_cm: f64, weight_kg: f64) -> Option<f64> {
    if height_cm <= 0.0 || weight_kg <= 0.0 {
        return None;
    }
    let metres = height_cm / 100.0;
    Some(round2(weight_kg / (metres * metres)))
}

async fn insert_measurement(
    pool: &PgPool,
    student_id: Uuid,
    height: f64,
    weight: f64,
    measured_at: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let bmi = bmi(height, weight).context("height and weight must be positive")?;
    let result = sqlx::query(
        r#"
        INSERT INTO school_stats.measurements
        (id, student_id, height, weight, bmi, measured_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (student_id, measured_at) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(height)
    .bind(weight)
    .bind(bmi)
    .bind(measured_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Backfill measurements from a CSV with columns
/// `student_id,height,weight,measured_at`. Rows already present for the same
/// student and instant are skipped.
pub async fn import_measurements(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_id: Uuid,
        height: f64,
        weight: f64,
        measured_at: DateTime<Utc>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed row {}", line + 2))?;
        if insert_measurement(pool, row.student_id, row.height, row.weight, row.measured_at)
            .await
            .with_context(|| format!("row {} for student {}", line + 2, row.student_id))?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}
