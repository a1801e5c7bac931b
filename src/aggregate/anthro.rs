use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::models::{ClassAnthro, Measurement, StudentAnthro};
use crate::period::PeriodWindow;

/// Average of each active student's latest in-window measurement.
pub fn class(
    active_students: &[Uuid],
    measurements: &[Measurement],
    window: &PeriodWindow,
) -> ClassAnthro {
    let roster: HashSet<Uuid> = active_students.iter().copied().collect();
    let mut latest: HashMap<Uuid, &Measurement> = HashMap::new();

    for measurement in measurements {
        if !roster.contains(&measurement.student_id) || !window.contains(measurement.measured_at) {
            continue;
        }
        latest
            .entry(measurement.student_id)
            .and_modify(|current| {
                if measurement.measured_at > current.measured_at {
                    *current = measurement;
                }
            })
            .or_insert(measurement);
    }

    let sample_size = latest.len();
    if sample_size == 0 {
        return ClassAnthro {
            avg_height: None,
            avg_weight: None,
            sample_size: 0,
        };
    }

    let (height, weight) = latest
        .values()
        .fold((0.0, 0.0), |(h, w), m| (h + m.height, w + m.weight));

    ClassAnthro {
        avg_height: Some(height / sample_size as f64),
        avg_weight: Some(weight / sample_size as f64),
        sample_size: sample_size as u32,
    }
}

/// The student's most recent in-window measurement.
pub fn student(student_id: Uuid, measurements: &[Measurement], window: &PeriodWindow) -> StudentAnthro {
    let latest = measurements
        .iter()
        .filter(|m| m.student_id == student_id && window.contains(m.measured_at))
        .max_by_key(|m| m.measured_at);

    match latest {
        Some(m) => StudentAnthro {
            latest_height: Some(m.height),
            latest_weight: Some(m.weight),
            measured_at: Some(m.measured_at),
        },
        None => StudentAnthro {
            latest_height: None,
            latest_weight: None,
            measured_at: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodKind;
    use chrono::{Duration, TimeZone, Utc};

    fn week() -> PeriodWindow {
        let start = Utc.with_ymd_and_hms(2025, 3, 2, 17, 0, 0).unwrap();
        PeriodWindow {
            kind: PeriodKind::Week,
            start,
            end: start + Duration::days(7),
        }
    }

    fn measure(student_id: Uuid, days: i64, height: f64, weight: f64) -> Measurement {
        Measurement {
            student_id,
            height,
            weight,
            measured_at: week().start + Duration::days(days),
        }
    }

    #[test]
    fn class_average_uses_latest_per_student() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let rows = vec![
            measure(a, 0, 100.0, 15.0),
            measure(a, 3, 102.0, 16.0),
            measure(b, 1, 110.0, 18.0),
            // Outside the window.
            measure(b, 7, 150.0, 40.0),
        ];

        let values = class(&[a, b], &rows, &week());
        assert_eq!(values.sample_size, 2);
        assert_eq!(values.avg_height, Some(106.0));
        assert_eq!(values.avg_weight, Some(17.0));
    }

    #[test]
    fn class_ignores_inactive_students_and_never_yields_nan() {
        let outsider = Uuid::new_v4();
        let rows = vec![measure(outsider, 1, 120.0, 20.0)];

        let values = class(&[Uuid::new_v4()], &rows, &week());
        assert_eq!(values.sample_size, 0);
        assert_eq!(values.avg_height, None);
        assert_eq!(values.avg_weight, None);
    }

    #[test]
    fn student_latest_measurement() {
        let id = Uuid::new_v4();
        let rows = vec![measure(id, 1, 98.0, 14.0), measure(id, 5, 99.5, 14.2)];

        let values = student(id, &rows, &week());
        assert_eq!(values.latest_height, Some(99.5));
        assert_eq!(values.measured_at, Some(week().start + Duration::days(5)));

        let empty = student(Uuid::new_v4(), &rows, &week());
        assert_eq!(empty.latest_height, None);
        assert_eq!(empty.latest_weight, None);
    }

    #[test]
    fn measurement_at_window_start_counts() {
        let id = Uuid::new_v4();
        let rows = vec![measure(id, 0, 101.0, 15.0)];
        assert_eq!(student(id, &rows, &week()).latest_height, Some(101.0));
    }
}
