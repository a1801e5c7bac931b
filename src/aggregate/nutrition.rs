use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{
    round2, AttendanceRecord, ClassNutrition, DailyHealth, DailyIntake, HealthSummary, MealIntake,
    NutrientProfile, StudentNutrition,
};
use crate::period::{PeriodCalculator, PeriodWindow};

/// Per-100-unit nutrient profiles keyed by food item id.
pub type FoodCatalog = HashMap<Uuid, NutrientProfile>;

/// How student nutrition treats intake sheets without a daily total.
///
/// Older intake sheets only carry per-meal totals. `FallbackToMeals` sums
/// those instead; it goes away once every sheet carries a daily total and
/// the `legacy-meal-totals` feature is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MealTotalsPolicy {
    DailyTotalOnly,
    FallbackToMeals,
}

impl Default for MealTotalsPolicy {
    fn default() -> Self {
        if cfg!(feature = "legacy-meal-totals") {
            MealTotalsPolicy::FallbackToMeals
        } else {
            MealTotalsPolicy::DailyTotalOnly
        }
    }
}

/// (student, local day) pairs marked present or late.
pub fn present_slots(
    records: &[AttendanceRecord],
    calculator: &PeriodCalculator,
    window: &PeriodWindow,
) -> HashSet<(Uuid, NaiveDate)> {
    records
        .iter()
        .filter(|r| window.contains(r.date))
        .flat_map(|r| {
            let day = calculator.local_date(r.date);
            r.entries
                .iter()
                .filter(|e| e.status.is_in_class())
                .map(move |e| (e.student_id, day))
        })
        .collect()
}

/// Food item ids referenced by actual portions, for one catalog lookup.
pub fn referenced_food_items(intakes: &[DailyIntake]) -> Vec<Uuid> {
    let ids: BTreeSet<Uuid> = intakes
        .iter()
        .flat_map(|i| i.meals.slots())
        .flat_map(|meal| meal.actual.iter().map(|p| p.food_item_id))
        .collect();
    ids.into_iter().collect()
}

/// Nutrients eaten in one meal slot.
///
/// Items missing from the catalog contribute nothing.
pub fn meal_total(meal: &MealIntake, catalog: &FoodCatalog) -> NutrientProfile {
    let mut total = NutrientProfile::new();
    for portion in &meal.actual {
        if let Some(per_100) = catalog.get(&portion.food_item_id) {
            total.add(&per_100.scaled(portion.quantity));
        }
    }
    for food in &meal.ad_hoc {
        total.add(&food.nutrition.scaled(food.quantity));
    }
    total
}

pub fn health(records: &[DailyHealth], window: &PeriodWindow) -> HealthSummary {
    let in_window: Vec<&DailyHealth> = records.iter().filter(|r| window.contains(r.date)).collect();
    let issues = in_window.iter().filter(|r| r.requires_attention).count() as u32;
    let temperatures: Vec<f64> = in_window.iter().filter_map(|r| r.temperature()).collect();
    let avg_temperature = if temperatures.is_empty() {
        None
    } else {
        Some(round2(temperatures.iter().sum::<f64>() / temperatures.len() as f64))
    };
    HealthSummary {
        issues,
        avg_temperature,
    }
}

/// Class nutrition gated by attendance.
///
/// Only intake sheets whose (student, local day) is a present slot count.
/// The per-student average divides by the students contributing such sheets.
pub fn class(
    attendance: &[AttendanceRecord],
    intakes: &[DailyIntake],
    catalog: &FoodCatalog,
    health_records: &[DailyHealth],
    calculator: &PeriodCalculator,
    window: &PeriodWindow,
) -> ClassNutrition {
    let slots = present_slots(attendance, calculator, window);
    let present_students: HashSet<Uuid> = slots.iter().map(|(student, _)| *student).collect();

    let mut totals = NutrientProfile::new();
    let mut fed: HashSet<Uuid> = HashSet::new();
    let mut meals = 0;

    for intake in intakes.iter().filter(|i| window.contains(i.date)) {
        if !slots.contains(&(intake.student_id, calculator.local_date(intake.date))) {
            continue;
        }
        fed.insert(intake.student_id);
        for meal in intake.meals.slots() {
            if meal.has_items() {
                meals += 1;
            }
            totals.add(&meal_total(meal, catalog));
        }
    }

    ClassNutrition {
        meals,
        present_students: present_students.len() as u32,
        fed_students: fed.len() as u32,
        avg_per_student: totals.divided(fed.len()),
        totals,
        health: health(health_records, window),
    }
}

/// Student nutrition from precomputed sheet totals.
pub fn student(
    intakes: &[DailyIntake],
    health_records: &[DailyHealth],
    window: &PeriodWindow,
    policy: MealTotalsPolicy,
) -> StudentNutrition {
    let mut values = StudentNutrition::default();
    let mut totals = NutrientProfile::new();

    for intake in intakes.iter().filter(|i| window.contains(i.date)) {
        values.records += 1;
        values.meals_recorded += intake
            .meals
            .slots()
            .iter()
            .filter(|m| m.recorded_total().is_some())
            .count() as u32;

        if let Some(daily) = intake.recorded_daily_total() {
            totals.add(daily);
            continue;
        }

        values.records_without_daily_total += 1;
        if policy == MealTotalsPolicy::FallbackToMeals {
            for recorded in intake.meals.slots().iter().filter_map(|m| m.recorded_total()) {
                totals.add(recorded);
            }
        }
    }

    values.totals = totals.with_core_nutrients();
    values.health = health(health_records, window);
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdHocFood, AttendanceEntry, AttendanceStatus, FoodPortion, MealIntakes};
    use crate::period::PeriodKind;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn calc() -> PeriodCalculator {
        PeriodCalculator::new(7 * 60).unwrap()
    }

    fn week() -> PeriodWindow {
        calc().window(
            PeriodKind::Week,
            Utc.with_ymd_and_hms(2025, 3, 5, 3, 0, 0).unwrap(),
        )
    }

    fn at(day: i64) -> DateTime<Utc> {
        week().start + Duration::days(day) + Duration::hours(2)
    }

    fn sheet(day: i64, rows: &[(Uuid, AttendanceStatus)]) -> AttendanceRecord {
        AttendanceRecord {
            class_id: Uuid::nil(),
            date: at(day),
            entries: rows
                .iter()
                .map(|(student_id, status)| AttendanceEntry {
                    student_id: *student_id,
                    status: *status,
                    arrival_time: None,
                    departure_time: None,
                })
                .collect(),
        }
    }

    fn intake(student_id: Uuid, day: i64, lunch: MealIntake) -> DailyIntake {
        DailyIntake {
            student_id,
            class_id: Uuid::nil(),
            date: at(day),
            meals: MealIntakes {
                lunch,
                ..MealIntakes::default()
            },
            daily_total: None,
        }
    }

    fn ad_hoc(calories: f64) -> MealIntake {
        MealIntake {
            ad_hoc: vec![AdHocFood {
                name: "porridge".to_string(),
                quantity: 100.0,
                nutrition: NutrientProfile::new().with("calories", calories),
            }],
            ..MealIntake::default()
        }
    }

    #[test]
    fn catalog_items_scale_by_actual_quantity() {
        let rice = Uuid::new_v4();
        let catalog: FoodCatalog =
            HashMap::from([(rice, NutrientProfile::new().with("calories", 130.0).with("fat", 0.3))]);
        let meal = MealIntake {
            planned: vec![FoodPortion {
                food_item_id: rice,
                quantity: 300.0,
            }],
            actual: vec![FoodPortion {
                food_item_id: rice,
                quantity: 250.0,
            }],
            ..MealIntake::default()
        };

        let total = meal_total(&meal, &catalog);
        assert_eq!(total.get("calories"), 325.0);
        assert_eq!(total.get("fat"), 0.75);
    }

    #[test]
    fn absent_students_do_not_count() {
        let (fed, absent) = (Uuid::new_v4(), Uuid::new_v4());
        let attendance = vec![sheet(
            1,
            &[(fed, AttendanceStatus::Late), (absent, AttendanceStatus::Absent)],
        )];
        let intakes = vec![intake(fed, 1, ad_hoc(480.0)), intake(absent, 1, ad_hoc(900.0))];

        let values = class(&attendance, &intakes, &FoodCatalog::new(), &[], &calc(), &week());
        assert_eq!(values.present_students, 1);
        assert_eq!(values.fed_students, 1);
        assert_eq!(values.totals.get("calories"), 480.0);
        assert_eq!(values.avg_per_student.get("calories"), 480.0);
        assert_eq!(values.meals, 1);
    }

    #[test]
    fn intake_on_a_day_without_presence_is_dropped() {
        let student_id = Uuid::new_v4();
        let attendance = vec![sheet(0, &[(student_id, AttendanceStatus::Present)])];
        let intakes = vec![intake(student_id, 2, ad_hoc(500.0))];

        let values = class(&attendance, &intakes, &FoodCatalog::new(), &[], &calc(), &week());
        assert_eq!(values.fed_students, 0);
        assert!(values.totals.is_empty());
        assert!(values.avg_per_student.is_empty());
    }

    #[test]
    fn class_average_divides_by_fed_students() {
        let students: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
        let present: Vec<_> = students.iter().map(|s| (*s, AttendanceStatus::Present)).collect();
        let attendance = vec![sheet(0, &present), sheet(1, &present), sheet(2, &present)];
        let intakes = vec![
            intake(students[0], 1, ad_hoc(500.0)),
            intake(students[1], 1, ad_hoc(600.0)),
        ];

        let values = class(&attendance, &intakes, &FoodCatalog::new(), &[], &calc(), &week());
        assert_eq!(values.present_students, 10);
        assert_eq!(values.avg_per_student.get("calories"), 550.0);
    }

    #[test]
    fn health_counts_issues_and_averages_temperature() {
        let id = Uuid::new_v4();
        let record = |day, temp: Option<f64>, flag| DailyHealth {
            student_id: id,
            class_id: Uuid::nil(),
            date: at(day),
            health_status: match temp {
                Some(t) => serde_json::json!({ "temperature": t }),
                None => serde_json::json!({}),
            },
            requires_attention: flag,
        };
        let rows = vec![
            record(0, Some(36.5), false),
            record(1, Some(38.0), true),
            record(2, None, true),
            record(9, Some(40.0), true),
        ];

        let summary = health(&rows, &week());
        assert_eq!(summary.issues, 2);
        assert_eq!(summary.avg_temperature, Some(37.25));
        assert_eq!(health(&[], &week()).avg_temperature, None);
    }

    fn with_meal_totals(mut sheet: DailyIntake, parts: [f64; 3]) -> DailyIntake {
        sheet.meals.breakfast.total = Some(NutrientProfile::new().with("calories", parts[0]));
        sheet.meals.lunch.total = Some(NutrientProfile::new().with("calories", parts[1]));
        sheet.meals.snack.total = Some(NutrientProfile::new().with("calories", parts[2]));
        sheet
    }

    #[test]
    fn student_prefers_daily_total() {
        let id = Uuid::new_v4();
        let mut sheet = with_meal_totals(intake(id, 0, MealIntake::default()), [1.0, 1.0, 1.0]);
        sheet.daily_total = Some(NutrientProfile::new().with("calories", 700.0).with("protein", 20.0));

        let values = student(&[sheet], &[], &week(), MealTotalsPolicy::FallbackToMeals);
        assert_eq!(values.totals.get("calories"), 700.0);
        assert_eq!(values.totals.get("fat"), 0.0);
        assert_eq!(values.meals_recorded, 3);
        assert_eq!(values.records_without_daily_total, 0);
    }

    #[test]
    fn student_fallback_sums_meal_totals_exactly() {
        let id = Uuid::new_v4();
        let sheet = with_meal_totals(intake(id, 0, MealIntake::default()), [33.33, 33.33, 33.34]);

        let values = student(&[sheet.clone()], &[], &week(), MealTotalsPolicy::FallbackToMeals);
        assert_eq!(values.totals.get("calories"), 100.0);
        assert_eq!(values.records_without_daily_total, 1);

        let strict = student(&[sheet], &[], &week(), MealTotalsPolicy::DailyTotalOnly);
        assert_eq!(strict.totals.get("calories"), 0.0);
        assert_eq!(strict.records_without_daily_total, 1);
    }

    #[test]
    fn empty_daily_total_is_treated_as_missing() {
        let id = Uuid::new_v4();
        let mut sheet = with_meal_totals(intake(id, 0, MealIntake::default()), [10.0, 20.0, 30.0]);
        sheet.daily_total = Some(NutrientProfile::new());

        let values = student(&[sheet], &[], &week(), MealTotalsPolicy::FallbackToMeals);
        assert_eq!(values.totals.get("calories"), 60.0);
    }

    #[test]
    fn referenced_items_are_deduplicated() {
        let rice = Uuid::new_v4();
        let portion = FoodPortion {
            food_item_id: rice,
            quantity: 50.0,
        };
        let meal = MealIntake {
            actual: vec![portion.clone(), portion],
            ..MealIntake::default()
        };
        let sheets = vec![intake(Uuid::new_v4(), 0, meal.clone()), intake(Uuid::new_v4(), 1, meal)];
        assert_eq!(referenced_food_items(&sheets), vec![rice]);
    }
}
