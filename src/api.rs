//! Read API over stored aggregates.
//!
//! Handlers only read what the job runner last wrote. A stat that has not
//! been computed yet is returned as `null`, never as an error.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::{parse_id, StatsError};
use crate::models::{
    round2, AggregatedStat, AnthroValues, MetricGroup, NutritionValues, StatValues, Subject,
    CORE_NUTRIENTS,
};
use crate::period::{PeriodCalculator, PeriodKind, PeriodWindow};
use crate::sources::{SourceReader, StatStore};

pub const DEFAULT_HISTORY_LIMIT: usize = 12;
pub const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn StatStore>,
    sources: Arc<dyn SourceReader>,
    calculator: PeriodCalculator,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn StatStore>,
        sources: Arc<dyn SourceReader>,
        calculator: PeriodCalculator,
    ) -> Self {
        Self {
            store,
            sources,
            calculator,
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

pub struct ApiError(StatsError);

impl From<StatsError> for ApiError {
    fn from(err: StatsError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StatsError::InvalidId { .. } | StatsError::InvalidValue { .. } => {
                StatusCode::BAD_REQUEST
            }
            StatsError::StudentNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "read api request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Raw query string. Parsed by hand so bad input gets the JSON error body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    pub class_id: Option<String>,
    pub student_id: Option<String>,
    pub period: Option<String>,
    pub group: Option<String>,
    pub at: Option<String>,
    pub limit: Option<String>,
}

impl StatsQuery {
    fn class(&self) -> Result<Subject, StatsError> {
        Ok(Subject::Class(parse_id(
            "class",
            self.class_id.as_deref().unwrap_or_default(),
        )?))
    }

    fn student_id(&self) -> Result<Uuid, StatsError> {
        parse_id("student", self.student_id.as_deref().unwrap_or_default())
    }

    fn period(&self) -> Result<PeriodKind, StatsError> {
        self.period.as_deref().unwrap_or("day").parse()
    }

    fn group(&self) -> Result<MetricGroup, StatsError> {
        self.group.as_deref().unwrap_or("attendance").parse()
    }

    fn at(&self) -> Result<DateTime<Utc>, StatsError> {
        match self.at.as_deref() {
            None => Ok(Utc::now()),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|_| StatsError::InvalidValue {
                    kind: "timestamp",
                    value: raw.to_string(),
                }),
        }
    }

    fn limit(&self) -> Result<usize, StatsError> {
        match self.limit.as_deref() {
            None => Ok(DEFAULT_HISTORY_LIMIT),
            Some(raw) => raw
                .parse::<usize>()
                .map(|limit| limit.clamp(1, MAX_HISTORY_LIMIT))
                .map_err(|_| StatsError::InvalidValue {
                    kind: "limit",
                    value: raw.to_string(),
                }),
        }
    }

    fn window(&self, calculator: &PeriodCalculator) -> Result<PeriodWindow, StatsError> {
        Ok(calculator.window(self.period()?, self.at()?))
    }
}

#[derive(Debug, Serialize)]
pub struct Overview {
    pub anthro: Option<AggregatedStat>,
    pub attendance: Option<AggregatedStat>,
    pub nutrition: Option<AggregatedStat>,
}

async fn overview_for(
    state: &ApiState,
    subject: Subject,
    window: &PeriodWindow,
) -> Result<Overview, StatsError> {
    Ok(Overview {
        anthro: state.store.find(subject, MetricGroup::Anthro, window).await?,
        attendance: state
            .store
            .find(subject, MetricGroup::Attendance, window)
            .await?,
        nutrition: state
            .store
            .find(subject, MetricGroup::Nutrition, window)
            .await?,
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn class_stat(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Option<AggregatedStat>> {
    let subject = query.class()?;
    let group = query.group()?;
    let window = query.window(&state.calculator)?;
    Ok(Json(state.store.find(subject, group, &window).await?))
}

async fn class_overview(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Overview> {
    let subject = query.class()?;
    let window = query.window(&state.calculator)?;
    Ok(Json(overview_for(&state, subject, &window).await?))
}

async fn class_history(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Vec<AggregatedStat>> {
    let subject = query.class()?;
    let stats = state
        .store
        .history(subject, query.group()?, query.period()?, query.limit()?)
        .await?;
    Ok(Json(stats))
}

async fn student_stat(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Option<AggregatedStat>> {
    let subject = Subject::Student(query.student_id()?);
    let group = query.group()?;
    let window = query.window(&state.calculator)?;
    Ok(Json(state.store.find(subject, group, &window).await?))
}

async fn student_overview(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Overview> {
    let subject = Subject::Student(query.student_id()?);
    let window = query.window(&state.calculator)?;
    Ok(Json(overview_for(&state, subject, &window).await?))
}

async fn student_history(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Vec<AggregatedStat>> {
    let subject = Subject::Student(query.student_id()?);
    let stats = state
        .store
        .history(subject, query.group()?, query.period()?, query.limit()?)
        .await?;
    Ok(Json(stats))
}

/// One number for the student next to the class figure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricComparison {
    pub student: Option<f64>,
    pub class: Option<f64>,
    pub difference: Option<f64>,
}

impl MetricComparison {
    fn new(student: Option<f64>, class: Option<f64>) -> Self {
        let difference = match (student, class) {
            (Some(student), Some(class)) => Some(round2(student - class)),
            _ => None,
        };
        Self {
            student,
            class,
            difference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnthroComparison {
    pub height: MetricComparison,
    pub weight: MetricComparison,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceComparison {
    pub rate_present: MetricComparison,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub student_id: Uuid,
    pub class_id: Uuid,
    pub period: PeriodKind,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub anthro: Option<AnthroComparison>,
    pub attendance: Option<AttendanceComparison>,
    pub nutrition: Option<BTreeMap<String, MetricComparison>>,
}

fn compare_anthro(
    student: Option<&AggregatedStat>,
    class: Option<&AggregatedStat>,
) -> Option<AnthroComparison> {
    let StatValues::Anthro(AnthroValues::Student(mine)) = student?.values() else {
        return None;
    };
    let theirs = match class.map(|c| c.values()) {
        Some(StatValues::Anthro(AnthroValues::Class(values))) => Some(values),
        _ => None,
    };
    Some(AnthroComparison {
        height: MetricComparison::new(mine.latest_height, theirs.and_then(|c| c.avg_height)),
        weight: MetricComparison::new(mine.latest_weight, theirs.and_then(|c| c.avg_weight)),
    })
}

fn compare_attendance(
    student: Option<&AggregatedStat>,
    class: Option<&AggregatedStat>,
) -> Option<AttendanceComparison> {
    let mine = student?.attendance()?;
    let theirs = class.and_then(|c| c.attendance());
    Some(AttendanceComparison {
        rate_present: MetricComparison::new(
            Some(mine.rate_present),
            theirs.map(|c| c.rate_present),
        ),
    })
}

fn compare_nutrition(
    student: Option<&AggregatedStat>,
    class: Option<&AggregatedStat>,
) -> Option<BTreeMap<String, MetricComparison>> {
    let StatValues::Nutrition(NutritionValues::Student(mine)) = student?.values() else {
        return None;
    };
    let theirs = match class.map(|c| c.values()) {
        Some(StatValues::Nutrition(NutritionValues::Class(values))) => Some(values),
        _ => None,
    };
    Some(
        CORE_NUTRIENTS
            .iter()
            .map(|name| {
                let comparison = MetricComparison::new(
                    Some(mine.totals.get(name)),
                    theirs.map(|c| c.avg_per_student.get(name)),
                );
                (name.to_string(), comparison)
            })
            .collect(),
    )
}

async fn student_compare(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Comparison> {
    let student_id = query.student_id()?;
    let window = query.window(&state.calculator)?;
    let student = state
        .sources
        .student(student_id)
        .await?
        .ok_or(StatsError::StudentNotFound(student_id))?;

    let mine = overview_for(&state, Subject::Student(student_id), &window).await?;
    let class = overview_for(&state, Subject::Class(student.class_id), &window).await?;

    Ok(Json(Comparison {
        student_id,
        class_id: student.class_id,
        period: window.kind,
        period_start: window.start,
        period_end: window.end,
        anthro: compare_anthro(mine.anthro.as_ref(), class.anthro.as_ref()),
        attendance: compare_attendance(mine.attendance.as_ref(), class.attendance.as_ref()),
        nutrition: compare_nutrition(mine.nutrition.as_ref(), class.nutrition.as_ref()),
    }))
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health))
        .route("/stats/class", get(class_stat))
        .route("/stats/class/overview", get(class_overview))
        .route("/stats/class/history", get(class_history))
        .route("/stats/student", get(student_stat))
        .route("/stats/student/overview", get(student_overview))
        .route("/stats/student/compare", get(student_compare))
        .route("/stats/student/history", get(student_history))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(state: ApiState, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Read API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Start the server in the background; send on the returned channel to stop it.
pub async fn run(
    state: ApiState,
    addr: SocketAddr,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    tracing::info!("Read API listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let app = router(state);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        {
            tracing::error!("Read API error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttendanceValues, ClassAnthro, StudentAnthro};
    use chrono::TimeZone;

    fn window() -> PeriodWindow {
        PeriodCalculator::new(420)
            .unwrap()
            .window(PeriodKind::Month, Utc.with_ymd_and_hms(2025, 3, 5, 3, 0, 0).unwrap())
    }

    #[test]
    fn query_defaults_and_clamps() {
        let query = StatsQuery {
            limit: Some("500".to_string()),
            ..StatsQuery::default()
        };
        assert_eq!(query.period().unwrap(), PeriodKind::Day);
        assert_eq!(query.group().unwrap(), MetricGroup::Attendance);
        assert_eq!(query.limit().unwrap(), MAX_HISTORY_LIMIT);
        assert_eq!(StatsQuery::default().limit().unwrap(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(query.class().unwrap_err().code(), "INVALID_ID");
    }

    #[test]
    fn bad_timestamp_is_invalid_value() {
        let query = StatsQuery {
            at: Some("yesterday".to_string()),
            ..StatsQuery::default()
        };
        assert_eq!(query.at().unwrap_err().code(), "INVALID_VALUE");
    }

    #[test]
    fn anthro_comparison_without_class_stat_has_no_difference() {
        let student = AggregatedStat::new(
            Subject::Student(Uuid::new_v4()),
            &window(),
            StatValues::Anthro(AnthroValues::Student(StudentAnthro {
                latest_height: Some(104.5),
                latest_weight: Some(17.0),
                measured_at: None,
            })),
        )
        .unwrap();
        let class = AggregatedStat::new(
            Subject::Class(Uuid::new_v4()),
            &window(),
            StatValues::Anthro(AnthroValues::Class(ClassAnthro {
                avg_height: Some(102.25),
                avg_weight: None,
                sample_size: 4,
            })),
        )
        .unwrap();

        let compared = compare_anthro(Some(&student), Some(&class)).unwrap();
        assert_eq!(compared.height.difference, Some(2.25));
        assert_eq!(compared.weight.class, None);
        assert_eq!(compared.weight.difference, None);

        let alone = compare_anthro(Some(&student), None).unwrap();
        assert_eq!(alone.height.class, None);
        assert!(compare_anthro(None, Some(&class)).is_none());
    }

    #[test]
    fn attendance_difference_is_rounded() {
        let stat = |subject, rate| {
            AggregatedStat::new(
                subject,
                &window(),
                StatValues::Attendance(AttendanceValues {
                    rate_present: rate,
                    ..AttendanceValues::default()
                }),
            )
            .unwrap()
        };
        let student = stat(Subject::Student(Uuid::new_v4()), 0.75);
        let class = stat(Subject::Class(Uuid::new_v4()), 29.0 / 30.0);

        let compared = compare_attendance(Some(&student), Some(&class)).unwrap();
        assert_eq!(compared.rate_present.difference, Some(-0.22));
    }
}
