use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::QueueError;
use crate::models::{Job, JobStats};
use crate::queue::{EnqueueOptions, JobQueue};

const DEFAULT_FAILED_LIMIT: i64 = 20;
const MAX_FAILED_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
}

pub fn router(queue: JobQueue) -> Router {
    Router::new()
        .route("/jobs", post(create_job_handler))
        .route("/jobs/stats", get(stats_handler))
        .route("/jobs/failed", get(list_failed_jobs_handler))
        .route("/jobs/dead/retry", post(retry_dead_jobs_handler))
        .route("/jobs/purge", post(purge_completed_jobs_handler))
        .route("/jobs/:id", get(get_job_handler))
        .with_state(AppState { queue })
}

#[derive(Debug, Serialize)]
pub struct JobDto {
    id: String,
    #[serde(rename = "type")]
    job_type: String,
    data: serde_json::Value,
    status: String,
    run_at: NaiveDateTime,
    attempts: i32,
    max_retries: i32,
    last_error: Option<String>,
    created_at: NaiveDateTime,
    started_at: Option<NaiveDateTime>,
    completed_at: Option<NaiveDateTime>,
    failed_at: Option<NaiveDateTime>,
}

fn transform_job(job: Job) -> JobDto {
    // Rows are only written through enqueue, so this is always valid JSON.
    let data = job
        .data_value()
        .unwrap_or_else(|_| serde_json::Value::String(job.data.clone()));

    JobDto {
        id: job.id,
        job_type: job.job_type,
        data,
        status: job.status.to_string(),
        run_at: job.run_at,
        attempts: job.attempts,
        max_retries: job.max_retries,
        last_error: job.last_error,
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        failed_at: job.failed_at,
    }
}

fn error_response(error: QueueError, context: &str) -> (StatusCode, String) {
    if error.is_invalid_input() {
        return (StatusCode::BAD_REQUEST, error.to_string());
    }

    log::error!("{} {}", context, error);

    (StatusCode::INTERNAL_SERVER_ERROR, context.into())
}

#[derive(Deserialize)]
pub struct NewJobInput {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    data: serde_json::Value,
    run_at: Option<NaiveDateTime>,
    max_retries: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    job: JobDto,
}

pub async fn create_job_handler(
    State(state): State<AppState>,
    Json(new_job_input): Json<NewJobInput>,
) -> Result<Json<JobResponse>, (StatusCode, String)> {
    let job_type = new_job_input.job_type.trim();

    if job_type.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "type cannot be empty.".into()));
    }

    let options = EnqueueOptions {
        run_at: new_job_input.run_at,
        max_retries: new_job_input.max_retries,
    };

    let id = state
        .queue
        .enqueue_json(job_type, new_job_input.data, options)
        .map_err(|e| error_response(e, "Failed to create job."))?;

    match state.queue.get_job(&id) {
        Ok(Some(job)) => Ok(Json(JobResponse {
            job: transform_job(job),
        })),
        Ok(None) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch job.".into(),
        )),
        Err(e) => Err(error_response(e, "Failed to fetch job.")),
    }
}

pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, (StatusCode, String)> {
    match state.queue.get_job(id.trim()) {
        Ok(Some(job)) => Ok(Json(JobResponse {
            job: transform_job(job),
        })),
        Ok(None) => Err((StatusCode::NOT_FOUND, "Job does not exist.".into())),
        Err(e) => Err(error_response(e, "Failed to fetch job.")),
    }
}

pub async fn stats_handler(
    State(state): State<AppState>,
) -> Result<Json<JobStats>, (StatusCode, String)> {
    state
        .queue
        .get_stats()
        .map(Json)
        .map_err(|e| error_response(e, "Failed to fetch job stats."))
}

#[derive(Deserialize)]
pub struct FailedJobsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    jobs: Vec<JobDto>,
}

pub async fn list_failed_jobs_handler(
    State(state): State<AppState>,
    Query(query): Query<FailedJobsQuery>,
) -> Result<Json<ListJobsResponse>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT);

    if !(1..=MAX_FAILED_LIMIT).contains(&limit) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {MAX_FAILED_LIMIT}."),
        ));
    }

    let jobs = state
        .queue
        .get_recent_failed(limit)
        .map_err(|e| error_response(e, "Failed to fetch jobs."))?;

    Ok(Json(ListJobsResponse {
        jobs: jobs.into_iter().map(transform_job).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct RetryDeadResponse {
    requeued: usize,
}

pub async fn retry_dead_jobs_handler(
    State(state): State<AppState>,
) -> Result<Json<RetryDeadResponse>, (StatusCode, String)> {
    let requeued = state
        .queue
        .retry_dead()
        .map_err(|e| error_response(e, "Failed to requeue dead jobs."))?;

    Ok(Json(RetryDeadResponse { requeued }))
}

#[derive(Deserialize)]
pub struct PurgeInput {
    older_than_hours: i64,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    purged: usize,
}

pub async fn purge_completed_jobs_handler(
    State(state): State<AppState>,
    Json(purge_input): Json<PurgeInput>,
) -> Result<Json<PurgeResponse>, (StatusCode, String)> {
    if purge_input.older_than_hours < 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "older_than_hours must be greater than or equal to 0.".into(),
        ));
    }

    let cutoff = TimeDelta::try_hours(purge_input.older_than_hours)
        .and_then(|age| Utc::now().naive_utc().checked_sub_signed(age))
        .ok_or((
            StatusCode::BAD_REQUEST,
            "older_than_hours is out of range.".to_string(),
        ))?;

    let purged = state
        .queue
        .purge_completed(cutoff)
        .map_err(|e| error_response(e, "Failed to purge jobs."))?;

    Ok(Json(PurgeResponse { purged }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::test_helpers::{fail_with, TestDatabase};

    fn state(db: &TestDatabase) -> State<AppState> {
        State(AppState { queue: db.queue() })
    }

    fn new_job(job_type: &str) -> NewJobInput {
        NewJobInput {
            job_type: job_type.into(),
            data: serde_json::json!({ "to": "a@b.com" }),
            run_at: None,
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn creates_and_fetches_a_job() {
        let db = TestDatabase::new();

        let Json(created) = create_job_handler(state(&db), Json(new_job("email.send")))
            .await
            .unwrap();
        assert_eq!(created.job.status, "pending");
        assert_eq!(created.job.data, serde_json::json!({ "to": "a@b.com" }));

        let Json(fetched) = get_job_handler(state(&db), Path(created.job.id.clone()))
            .await
            .unwrap();
        assert_eq!(fetched.job.id, created.job.id);
        assert_eq!(fetched.job.max_retries, 3);
    }

    #[tokio::test]
    async fn rejects_unknown_types_and_bad_retries() {
        let db = TestDatabase::new();
        let state = State(AppState {
            queue: db.queue().with_known_types(["email.send"]),
        });

        let (status, message) = create_job_handler(state.clone(), Json(new_job("emial.send")))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(message, "Unknown job type: emial.send");

        let mut input = new_job("email.send");
        input.max_retries = Some(0);
        let (status, _) = create_job_handler(state.clone(), Json(input)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = create_job_handler(state, Json(new_job("  "))).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_jobs_are_not_found() {
        let db = TestDatabase::new();

        let (status, _) = get_job_handler(state(&db), Path("nope".into()))
            .await
            .unwrap_err();

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn operator_endpoints_report_and_requeue_dead_jobs() {
        let db = TestDatabase::new();
        let queue = db.queue();
        let id = queue
            .enqueue("doomed", &(), EnqueueOptions::default().max_retries(1))
            .unwrap();
        queue.process_next(fail_with("boom")).await.unwrap();

        let Json(stats) = stats_handler(state(&db)).await.unwrap();
        assert_eq!(stats.dead, 1);

        let Json(failed) = list_failed_jobs_handler(state(&db), Query(FailedJobsQuery { limit: None }))
            .await
            .unwrap();
        assert_eq!(failed.jobs.len(), 1);
        assert_eq!(failed.jobs[0].last_error.as_deref(), Some("boom"));

        let Json(retried) = retry_dead_jobs_handler(state(&db)).await.unwrap();
        assert_eq!(retried.requeued, 1);
        assert_eq!(queue.get_job(&id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn failed_job_limit_is_bounded() {
        let db = TestDatabase::new();

        let (status, _) =
            list_failed_jobs_handler(state(&db), Query(FailedJobsQuery { limit: Some(0) }))
                .await
                .unwrap_err();

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn purge_rejects_negative_ages() {
        let db = TestDatabase::new();

        let (status, _) = purge_completed_jobs_handler(
            state(&db),
            Json(PurgeInput {
                older_than_hours: -1,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let Json(purged) = purge_completed_jobs_handler(
            state(&db),
            Json(PurgeInput {
                older_than_hours: 24,
            }),
        )
        .await
        .unwrap();
        assert_eq!(purged.purged, 0);
    }
}
