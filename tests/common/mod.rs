#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use school_stats::models::{
    AttendanceEntry, AttendanceRecord, AttendanceStatus, ClassRecord, DailyHealth, DailyIntake,
    FoodPortion, MealIntake, MealIntakes, Measurement, NutrientProfile, StudentRecord,
};
use school_stats::{MemoryBackend, PeriodCalculator, StatsEngine};
use uuid::Uuid;

pub const OFFSET_MINUTES: i32 = 420;
pub const RICE_KCAL_PER_GRAM: f64 = 2.5;

pub fn calculator() -> PeriodCalculator {
    PeriodCalculator::new(OFFSET_MINUTES).expect("offset")
}

/// Wednesday 2025-03-05 10:00 at +07:00.
pub fn reference_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 5, 3, 0, 0).unwrap()
}

/// Monday 2025-03-03 08:00 at +07:00 plus `day` days.
pub fn school_morning(day: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 1, 0, 0).unwrap() + Duration::days(day)
}

pub struct School {
    pub backend: Arc<MemoryBackend>,
    pub class_id: Uuid,
    pub students: Vec<Uuid>,
    pub rice_id: Uuid,
}

impl School {
    pub fn engine(&self) -> StatsEngine {
        StatsEngine::new(self.backend.clone(), self.backend.clone(), calculator())
    }
}

pub fn class_record(id: Uuid, name: &str) -> ClassRecord {
    ClassRecord {
        id,
        name: name.to_string(),
        is_active: true,
    }
}

pub fn student_record(id: Uuid, class_id: Uuid, name: &str) -> StudentRecord {
    StudentRecord {
        id,
        class_id,
        full_name: name.to_string(),
        is_active: true,
    }
}

pub fn sheet(class_id: Uuid, date: DateTime<Utc>, rows: Vec<(Uuid, AttendanceStatus)>) -> AttendanceRecord {
    AttendanceRecord {
        class_id,
        date,
        entries: rows
            .into_iter()
            .map(|(student_id, status)| AttendanceEntry {
                student_id,
                status,
                arrival_time: Some(date),
                departure_time: None,
            })
            .collect(),
    }
}

/// Rice for lunch; the sheet carries its precomputed daily total.
pub fn lunch_intake(
    student_id: Uuid,
    class_id: Uuid,
    date: DateTime<Utc>,
    food_item_id: Uuid,
    quantity: f64,
) -> DailyIntake {
    DailyIntake {
        student_id,
        class_id,
        date,
        meals: MealIntakes {
            lunch: MealIntake {
                actual: vec![FoodPortion {
                    food_item_id,
                    quantity,
                }],
                ..MealIntake::default()
            },
            ..MealIntakes::default()
        },
        daily_total: Some(NutrientProfile::new().with("calories", quantity * RICE_KCAL_PER_GRAM)),
    }
}

/// Ten students over three school days with [10, 9, 10] present, and two
/// students eating 500 and 600 kcal of rice on the first day.
pub async fn school_week() -> School {
    let backend = Arc::new(MemoryBackend::default());
    let class_id = Uuid::new_v4();
    let students: Vec<Uuid> = (0..10).map(|i| Uuid::from_u128(0x1000 + i)).collect();
    let rice_id = Uuid::new_v4();

    backend
        .classes
        .lock()
        .await
        .push(class_record(class_id, "Sunflower"));
    {
        let mut roster = backend.students.lock().await;
        for (index, id) in students.iter().enumerate() {
            roster.push(student_record(*id, class_id, &format!("Student {index:02}")));
        }
    }

    {
        let mut attendance = backend.attendance.lock().await;
        for day in 0..3 {
            let rows = students
                .iter()
                .enumerate()
                .map(|(index, id)| {
                    let status = if day == 1 && index == 3 {
                        AttendanceStatus::Absent
                    } else {
                        AttendanceStatus::Present
                    };
                    (*id, status)
                })
                .collect();
            attendance.push(sheet(class_id, school_morning(day), rows));
        }
    }

    backend.foods.lock().await.insert(
        rice_id,
        NutrientProfile::new()
            .with("calories", RICE_KCAL_PER_GRAM * 100.0)
            .with("protein", 5.0)
            .with("fat", 1.0)
            .with("carbohydrate", 52.0),
    );
    {
        let mut intakes = backend.intakes.lock().await;
        intakes.push(lunch_intake(students[0], class_id, school_morning(0), rice_id, 200.0));
        intakes.push(lunch_intake(students[1], class_id, school_morning(0), rice_id, 240.0));
    }

    backend.measurements.lock().await.push(Measurement {
        student_id: students[0],
        height: 104.0,
        weight: 17.5,
        measured_at: school_morning(1),
    });
    backend.health.lock().await.push(DailyHealth {
        student_id: students[0],
        class_id,
        date: school_morning(0),
        health_status: serde_json::json!({ "temperature": 37.8 }),
        requires_attention: true,
    });

    School {
        backend,
        class_id,
        students,
        rice_id,
    }
}
