use std::fmt::Write;

use crate::error::StatsError;
use crate::models::{
    AggregatedStat, AnthroValues, AttendanceValues, ClassAnthro, ClassNutrition, ClassRecord,
    MetricGroup, NutritionValues, StatValues, StudentNutrition, Subject,
};
use crate::period::{PeriodCalculator, PeriodWindow};
use crate::sources::{SourceReader, StatStore};

pub struct StudentLine {
    pub name: String,
    pub attendance: Option<AttendanceValues>,
    pub nutrition: Option<StudentNutrition>,
}

pub struct ClassReport {
    pub class: ClassRecord,
    pub window: PeriodWindow,
    pub anthro: Option<ClassAnthro>,
    pub attendance: Option<AttendanceValues>,
    pub nutrition: Option<ClassNutrition>,
    pub students: Vec<StudentLine>,
}

fn class_anthro(stat: Option<AggregatedStat>) -> Option<ClassAnthro> {
    match stat?.values() {
        StatValues::Anthro(AnthroValues::Class(values)) => Some(values.clone()),
        _ => None,
    }
}

fn class_nutrition(stat: Option<AggregatedStat>) -> Option<ClassNutrition> {
    match stat?.values() {
        StatValues::Nutrition(NutritionValues::Class(values)) => Some(values.clone()),
        _ => None,
    }
}

fn student_nutrition(stat: Option<AggregatedStat>) -> Option<StudentNutrition> {
    match stat?.values() {
        StatValues::Nutrition(NutritionValues::Student(values)) => Some(values.clone()),
        _ => None,
    }
}

/// Gather stored stats for a class and its active students.
pub async fn load_class_report(
    sources: &dyn SourceReader,
    store: &dyn StatStore,
    class: ClassRecord,
    window: PeriodWindow,
) -> Result<ClassReport, StatsError> {
    let subject = Subject::Class(class.id);
    let anthro = class_anthro(store.find(subject, MetricGroup::Anthro, &window).await?);
    let attendance = store
        .find(subject, MetricGroup::Attendance, &window)
        .await?
        .and_then(|stat| stat.attendance().cloned());
    let nutrition = class_nutrition(store.find(subject, MetricGroup::Nutrition, &window).await?);

    let mut students = Vec::new();
    for student in sources.active_students(class.id).await? {
        let subject = Subject::Student(student.id);
        students.push(StudentLine {
            name: student.full_name,
            attendance: store
                .find(subject, MetricGroup::Attendance, &window)
                .await?
                .and_then(|stat| stat.attendance().cloned()),
            nutrition: student_nutrition(store.find(subject, MetricGroup::Nutrition, &window).await?),
        });
    }

    Ok(ClassReport {
        class,
        window,
        anthro,
        attendance,
        nutrition,
        students,
    })
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

pub fn build_report(report: &ClassReport, calculator: &PeriodCalculator) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Class Report: {}", report.class.name);
    let _ = writeln!(
        output,
        "Generated for the {} starting {}",
        report.window.kind,
        calculator.local_date(report.window.start)
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");

    match &report.attendance {
        Some(values) if values.days_count > 0 => {
            let _ = writeln!(
                output,
                "- Attendance: {} present ({} of {} slots over {} days, {} late, {} absent)",
                percent(values.rate_present),
                values.present,
                values.expected_slots,
                values.days_count,
                values.late,
                values.absent
            );
        }
        _ => {
            let _ = writeln!(output, "- Attendance: no sheets recorded for this window.");
        }
    }

    match &report.anthro {
        Some(ClassAnthro {
            avg_height: Some(height),
            avg_weight: Some(weight),
            sample_size,
        }) => {
            let _ = writeln!(
                output,
                "- Growth: average {:.1} cm, {:.1} kg across {} students",
                height, weight, sample_size
            );
        }
        _ => {
            let _ = writeln!(output, "- Growth: no measurements recorded for this window.");
        }
    }

    match &report.nutrition {
        Some(values) if values.fed_students > 0 => {
            let _ = writeln!(
                output,
                "- Nutrition: {:.2} kcal per fed student over {} meals ({} of {} present students fed)",
                values.avg_per_student.get("calories"),
                values.meals,
                values.fed_students,
                values.present_students
            );
        }
        _ => {
            let _ = writeln!(output, "- Nutrition: no meals recorded for this window.");
        }
    }

    if let Some(values) = &report.nutrition {
        match values.health.avg_temperature {
            Some(temperature) => {
                let _ = writeln!(
                    output,
                    "- Health: {} checks need attention, average temperature {:.2}",
                    values.health.issues, temperature
                );
            }
            None => {
                let _ = writeln!(output, "- Health: {} checks need attention", values.health.issues);
            }
        }
    }

    let mut by_rate: Vec<&StudentLine> = report.students.iter().collect();
    by_rate.sort_by(|a, b| {
        let rate = |line: &StudentLine| line.attendance.as_ref().map(|v| v.rate_present);
        match (rate(a), rate(b)) {
            (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.name.cmp(&b.name)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        }
    });

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students by Attendance");

    if by_rate.is_empty() {
        let _ = writeln!(output, "No active students in this class.");
    } else {
        for line in by_rate {
            match &line.attendance {
                Some(values) => {
                    let _ = writeln!(
                        output,
                        "- {}: {} present ({} of {} days, {} unrecorded)",
                        line.name,
                        percent(values.rate_present),
                        values.present,
                        values.expected_slots,
                        values.unrecorded
                    );
                }
                None => {
                    let _ = writeln!(output, "- {}: not computed yet", line.name);
                }
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Nutrition Totals");

    let fed: Vec<(&str, &StudentNutrition)> = report
        .students
        .iter()
        .filter_map(|line| {
            line.nutrition
                .as_ref()
                .filter(|n| n.records > 0)
                .map(|n| (line.name.as_str(), n))
        })
        .collect();

    if fed.is_empty() {
        let _ = writeln!(output, "No intake recorded for this window.");
    } else {
        for (name, values) in fed {
            let _ = writeln!(
                output,
                "- {}: {:.2} kcal, {:.2} g protein, {:.2} g fat, {:.2} g carbohydrate over {} days",
                name,
                values.totals.get("calories"),
                values.totals.get("protein"),
                values.totals.get("fat"),
                values.totals.get("carbohydrate"),
                values.records
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NutrientProfile;
    use crate::period::PeriodKind;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn attendance(present: u32, days: u32) -> AttendanceValues {
        AttendanceValues {
            days_count: days,
            total_students: 1,
            expected_slots: days,
            present,
            absent: days - present,
            rate_present: present as f64 / days as f64,
            ..AttendanceValues::default()
        }
    }

    fn report(students: Vec<StudentLine>) -> (ClassReport, PeriodCalculator) {
        let calculator = PeriodCalculator::new(420).unwrap();
        let window = calculator.window(
            PeriodKind::Week,
            Utc.with_ymd_and_hms(2025, 3, 5, 3, 0, 0).unwrap(),
        );
        let report = ClassReport {
            class: ClassRecord {
                id: Uuid::new_v4(),
                name: "Sunflower".to_string(),
                is_active: true,
            },
            window,
            anthro: None,
            attendance: None,
            nutrition: None,
            students,
        };
        (report, calculator)
    }

    #[test]
    fn students_are_listed_lowest_attendance_first() {
        let (report, calculator) = report(vec![
            StudentLine {
                name: "An".to_string(),
                attendance: Some(attendance(5, 5)),
                nutrition: None,
            },
            StudentLine {
                name: "Binh".to_string(),
                attendance: None,
                nutrition: None,
            },
            StudentLine {
                name: "Chi".to_string(),
                attendance: Some(attendance(2, 5)),
                nutrition: Some(StudentNutrition {
                    records: 2,
                    totals: NutrientProfile::new().with("calories", 1100.0).with_core_nutrients(),
                    ..StudentNutrition::default()
                }),
            },
        ]);

        let text = build_report(&report, &calculator);
        assert!(text.starts_with("# Class Report: Sunflower"));
        assert!(text.contains("week starting 2025-03-03"));
        let chi = text.find("- Chi: 40.0% present").unwrap();
        let an = text.find("- An: 100.0% present").unwrap();
        let binh = text.find("- Binh: not computed yet").unwrap();
        assert!(chi < an && an < binh);
        assert!(text.contains("- Chi: 1100.00 kcal"));
    }

    #[test]
    fn empty_class_reports_missing_sections() {
        let (report, calculator) = report(Vec::new());
        let text = build_report(&report, &calculator);
        assert!(text.contains("no sheets recorded for this window"));
        assert!(text.contains("No active students in this class."));
        assert!(text.contains("No intake recorded for this window."));
    }
}
