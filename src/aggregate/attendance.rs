use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{AttendanceRecord, AttendanceStatus, AttendanceValues};
use crate::period::{PeriodCalculator, PeriodWindow};

#[derive(Default)]
struct Tally {
    present: u32,
    absent: u32,
    late: u32,
    early_leave: u32,
}

impl Tally {
    fn record(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::EarlyLeave => self.early_leave += 1,
        }
    }

    fn recorded(&self) -> u32 {
        self.present + self.absent + self.late + self.early_leave
    }

    fn into_values(self, days_count: u32, total_students: u32) -> AttendanceValues {
        let expected_slots = days_count * total_students;
        let rate_present = if expected_slots == 0 {
            0.0
        } else {
            self.present as f64 / expected_slots as f64
        };
        AttendanceValues {
            days_count,
            total_students,
            expected_slots,
            unrecorded: expected_slots.saturating_sub(self.recorded()),
            present: self.present,
            absent: self.absent,
            late: self.late,
            early_leave: self.early_leave,
            rate_present,
        }
    }
}

/// Latest status per student for each local day with a sheet.
///
/// Sheets are keyed by their local day; when a class has more than one sheet
/// on the same day the later one wins, so a day is one expected slot.
fn sheets_by_day(
    records: &[AttendanceRecord],
    calculator: &PeriodCalculator,
    window: &PeriodWindow,
) -> BTreeMap<NaiveDate, HashMap<Uuid, AttendanceStatus>> {
    let mut in_window: Vec<&AttendanceRecord> =
        records.iter().filter(|r| window.contains(r.date)).collect();
    in_window.sort_by_key(|r| r.date);

    let mut days: BTreeMap<NaiveDate, HashMap<Uuid, AttendanceStatus>> = BTreeMap::new();
    for record in in_window {
        let day = days.entry(calculator.local_date(record.date)).or_default();
        for entry in &record.entries {
            day.insert(entry.student_id, entry.status);
        }
    }
    days
}

/// Class tallies over every local day with a sheet in the window.
///
/// The rate denominator is `active_students * days with a sheet`.
pub fn class(
    active_students: usize,
    records: &[AttendanceRecord],
    calculator: &PeriodCalculator,
    window: &PeriodWindow,
) -> AttendanceValues {
    let days = sheets_by_day(records, calculator, window);
    if days.is_empty() {
        return AttendanceValues::default();
    }

    let mut tally = Tally::default();
    for status in days.values().flat_map(|day| day.values()) {
        tally.record(*status);
    }
    tally.into_values(days.len() as u32, active_students as u32)
}

/// One student's tallies over the class sheets in the window.
///
/// Each day with a sheet is one expected slot for the student, listed or not.
pub fn student(
    student_id: Uuid,
    class_records: &[AttendanceRecord],
    calculator: &PeriodCalculator,
    window: &PeriodWindow,
) -> AttendanceValues {
    let days = sheets_by_day(class_records, calculator, window);
    if days.is_empty() {
        return AttendanceValues::default();
    }

    let mut tally = Tally::default();
    for status in days.values().filter_map(|day| day.get(&student_id)) {
        tally.record(*status);
    }
    tally.into_values(days.len() as u32, 1)
}
