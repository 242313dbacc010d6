use crate::activation::ActivationRegistry;
use crate::error::BrokerError;
use crate::models::{BrokerConfig, BrokerConfigPatch, NewBrokerConfig};
use crate::probe::{ConnectionProbe, ProbeResult};
use crate::stats::{Stats, StatsAggregator};
use crate::status::{ConnectionStatusSnapshot, StatusBroadcaster, StatusReport};
use crate::store::ConfigStore;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::{self, Json};
use rocket::serde::Serialize;
use rocket::{catch, catchers, delete, get, options, post, put, routes, Build, Request, Rocket, State};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::error;

const MIN_PROBE_TIMEOUT_MS: u64 = 100;
const MAX_PROBE_TIMEOUT_MS: u64 = 60_000;

/// Everything the handlers need, managed by rocket.
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub registry: ActivationRegistry,
    pub probe: ConnectionProbe,
    pub status: Arc<StatusBroadcaster>,
    pub stats: StatsAggregator,
}

impl AppState {
    pub fn new(store: Arc<ConfigStore>, status: Arc<StatusBroadcaster>, probe: ConnectionProbe) -> Self {
        Self {
            registry: ActivationRegistry::new(store.clone()),
            stats: StatsAggregator::new(store.clone(), status.clone()),
            store,
            probe,
            status,
        }
    }
}

/// Error body
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError(e)
    }
}

impl<'a> From<json::Error<'a>> for ApiError {
    fn from(e: json::Error<'a>) -> Self {
        ApiError(BrokerError::validation(format!("Invalid JSON body: {}", e)))
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = match &self.0 {
            BrokerError::Validation(_) => Status::BadRequest,
            BrokerError::NotFound(_) => Status::NotFound,
            BrokerError::DuplicateId(_) => Status::Conflict,
            BrokerError::Persistence(_) => Status::InternalServerError,
        };
        if status == Status::InternalServerError {
            error!("{} {} failed: {}", req.method(), req.uri(), self.0);
        }

        let body = ErrorResponse {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).respond_to(req)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

/// Answer CORS preflight requests on every path
#[options("/<_..>")]
fn preflight() -> Status {
    Status::NoContent
}

#[get("/configs")]
fn list_configs(state: &State<AppState>) -> ApiResult<Vec<BrokerConfig>> {
    Ok(Json(state.store.list()?))
}

#[post("/configs", data = "<payload>")]
fn create_config(
    payload: Result<Json<NewBrokerConfig>, json::Error<'_>>,
    state: &State<AppState>,
) -> Result<(Status, Json<BrokerConfig>), ApiError> {
    let config = state.store.create(payload?.into_inner())?;
    Ok((Status::Created, Json(config)))
}

#[get("/configs/<id>")]
fn get_config(id: i64, state: &State<AppState>) -> ApiResult<BrokerConfig> {
    Ok(Json(state.store.get(id)?))
}

#[put("/configs/<id>", data = "<payload>")]
fn update_config(
    id: i64,
    payload: Result<Json<BrokerConfigPatch>, json::Error<'_>>,
    state: &State<AppState>,
) -> ApiResult<BrokerConfig> {
    Ok(Json(state.store.update(id, payload?.into_inner())?))
}

#[delete("/configs/<id>")]
fn delete_config(id: i64, state: &State<AppState>) -> ApiResult<BrokerConfig> {
    Ok(Json(state.registry.delete(id)?))
}

#[put("/configs/<id>/active")]
fn set_active(id: i64, state: &State<AppState>) -> ApiResult<BrokerConfig> {
    Ok(Json(state.registry.set_active(id)?))
}

#[post("/configs/<id>/enable")]
fn enable_config(id: i64, state: &State<AppState>) -> ApiResult<BrokerConfig> {
    Ok(Json(state.registry.set_enabled(id)?))
}

#[delete("/configs/<id>/enable")]
fn disable_config(id: i64, state: &State<AppState>) -> ApiResult<BrokerConfig> {
    Ok(Json(state.registry.disable(id)?))
}

/// Probe a stored configuration and record the outcome on its row
#[post("/configs/<id>/test")]
async fn test_config(id: i64, state: &State<AppState>) -> ApiResult<ProbeResult> {
    Ok(Json(state.probe.test_and_record(&state.store, id).await?))
}

/// Probe a configuration that has not been saved
#[post("/test?<timeout_ms>", data = "<payload>")]
async fn test_unsaved(
    timeout_ms: Option<u64>,
    payload: Result<Json<NewBrokerConfig>, json::Error<'_>>,
    state: &State<AppState>,
) -> ApiResult<ProbeResult> {
    let config = payload?.into_inner().into_config(0, OffsetDateTime::now_utc())?;
    let deadline = match timeout_ms {
        None => state.probe.deadline(),
        Some(ms) if (MIN_PROBE_TIMEOUT_MS..=MAX_PROBE_TIMEOUT_MS).contains(&ms) => Duration::from_millis(ms),
        Some(_) => {
            return Err(BrokerError::validation(format!(
                "timeout_ms must be between {} and {}",
                MIN_PROBE_TIMEOUT_MS, MAX_PROBE_TIMEOUT_MS
            ))
            .into())
        }
    };
    Ok(Json(state.probe.test(&config, deadline).await))
}

#[get("/stats")]
fn stats(state: &State<AppState>) -> ApiResult<Stats> {
    Ok(Json(state.stats.summarize()?))
}

#[get("/status")]
fn current_status(state: &State<AppState>) -> Json<ConnectionStatusSnapshot> {
    Json(state.status.current())
}

#[post("/status", data = "<payload>")]
fn report_status(
    payload: Result<Json<StatusReport>, json::Error<'_>>,
    state: &State<AppState>,
) -> ApiResult<ConnectionStatusSnapshot> {
    let report = payload?.into_inner();
    Ok(Json(state.status.report(report.into())))
}

/// Unmatched routes and rejected guards still answer in the error shape.
#[catch(default)]
fn default_catcher(status: Status, _req: &Request<'_>) -> (Status, Json<ErrorResponse>) {
    let error = match status.code {
        404 => "NotFound",
        400..=499 => "ValidationError",
        _ => "InternalError",
    };
    let body = ErrorResponse {
        error,
        message: status.reason_lossy().to_string(),
    };
    (status, Json(body))
}

pub fn build_rocket(state: AppState) -> Rocket<Build> {
    rocket::build()
        .manage(state)
        .mount("/", routes![preflight])
        .mount(
            "/api/mqtt",
            routes![
                list_configs,
                create_config,
                get_config,
                update_config,
                delete_config,
                set_active,
                enable_config,
                disable_config,
                test_config,
                test_unsaved,
                stats,
                current_status,
                report_status,
            ],
        )
        .register("/", catchers![default_catcher])
        .attach(Cors)
}

/// Run the Rocket server until it is shut down
pub async fn run_rest_server(state: AppState) -> Result<(), rocket::Error> {
    build_rocket(state).launch().await.map(|_| ())
}
