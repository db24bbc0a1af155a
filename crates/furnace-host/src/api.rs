//! # API Server
//!
//! This module provides a web server that exposes a REST and WebSocket API
//! for the furnace. The REST surface serves the latest controller snapshot,
//! the program catalog, and the operator commands; the WebSocket endpoint
//! streams snapshots to connected front-ends.
//!
//! ## REST API
//!
//! *   `GET  /api/status`: latest snapshot plus `now_ms`.
//! *   `GET  /api/programs`: all firing programs.
//! *   `POST /api/start` / `stop` / `pause` / `resume` / `emergency`: run control.
//! *   `POST /api/pid/tune`: live PID gain changes.
//! *   `POST /api/programs/save`, `DELETE /api/programs/{id}`: user programs.
//! *   `POST /api/errors/clear`: empty the error log.
//! *   `POST /api/test/{heater|vacuum|fan|sensors}`: idle-only exercises.
//!
//! Commands go to the controller through its mailbox and are applied at the
//! start of its next tick; handlers wait for the structured result.
//!
//! ## WebSocket API
//!
//! Clients connect to `/ws` and receive the snapshot as JSON whenever it
//! changes, checked on a fixed interval. A slow client simply misses
//! intermediate snapshots; the controller is never blocked.

use crate::catalog::{ProgramCatalog, Step};
use crate::controller::{Command, CommandError, CommandOutcome, CommandRequest, TestTarget};
use crate::state::Snapshot;
use actix::prelude::*;
use actix_web::{delete, get, post, web, App, Error, HttpRequest, HttpResponse, HttpServer, Responder};
use actix_web_actors::ws;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Interval for sending WebSocket heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Timeout for WebSocket clients. If no heartbeat is received, the client is disconnected.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the WebSocket checks for a changed snapshot.
const STATE_INTERVAL: Duration = Duration::from_secs(1);

/// The application state shared across all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub snapshot: Arc<Mutex<Snapshot>>,
    pub catalog: Arc<Mutex<ProgramCatalog>>,
    pub commands: mpsc::Sender<CommandRequest>,
    /// The controller's time base, for `now_ms` in status replies.
    pub epoch: Instant,
}

enum SubmitError {
    Command(CommandError),
    ControllerGone,
}

/// Queues a command for the controller and waits for its structured result.
async fn submit(state: &AppState, command: Command) -> Result<CommandOutcome, SubmitError> {
    let (reply, response) = oneshot::channel();
    state
        .commands
        .send(CommandRequest { command, reply })
        .await
        .map_err(|_| SubmitError::ControllerGone)?;
    match response.await {
        Ok(result) => result.map_err(SubmitError::Command),
        Err(_) => Err(SubmitError::ControllerGone),
    }
}

fn reject(error: SubmitError) -> HttpResponse {
    match error {
        SubmitError::Command(CommandError::Rejected(reason)) => {
            HttpResponse::BadRequest().json(serde_json::json!({ "error": reason }))
        }
        SubmitError::Command(CommandError::NotFound(reason)) => {
            HttpResponse::NotFound().json(serde_json::json!({ "error": reason }))
        }
        SubmitError::ControllerGone => HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({ "error": "controller is not running" })),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    snapshot: Snapshot,
    now_ms: u64,
}

/// REST endpoint returning the latest published snapshot.
#[get("/api/status")]
async fn status(data: web::Data<AppState>) -> impl Responder {
    let snapshot = data.snapshot.lock().clone();
    HttpResponse::Ok().json(StatusResponse {
        snapshot,
        now_ms: data.epoch.elapsed().as_millis() as u64,
    })
}

/// REST endpoint listing every firing program.
#[get("/api/programs")]
async fn list_programs(data: web::Data<AppState>) -> impl Responder {
    let programs = data.catalog.lock().list();
    HttpResponse::Ok().json(programs)
}

#[derive(Deserialize)]
struct StartBody {
    program_id: u32,
}

/// REST endpoint starting a firing program.
#[post("/api/start")]
async fn start(body: web::Json<StartBody>, data: web::Data<AppState>) -> impl Responder {
    match submit(&data, Command::Start { program_id: body.program_id }).await {
        Ok(CommandOutcome::Started {
            program_name,
            total_steps,
            first_target,
        }) => HttpResponse::Ok().json(serde_json::json!({
            "started": true,
            "program_name": program_name,
            "total_steps": total_steps,
            "first_target": first_target,
        })),
        Ok(_) => HttpResponse::InternalServerError().finish(),
        Err(error) => reject(error),
    }
}

/// REST endpoint stopping the current run (also acknowledges faults).
#[post("/api/stop")]
async fn stop(data: web::Data<AppState>) -> impl Responder {
    match submit(&data, Command::Stop).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "stopped": true })),
        Err(error) => reject(error),
    }
}

/// REST endpoint toggling pause/resume.
#[post("/api/pause")]
async fn pause(data: web::Data<AppState>) -> impl Responder {
    match submit(&data, Command::TogglePause).await {
        Ok(CommandOutcome::Paused) => {
            HttpResponse::Ok().json(serde_json::json!({ "state": "paused" }))
        }
        Ok(CommandOutcome::Resumed) => {
            HttpResponse::Ok().json(serde_json::json!({ "state": "running" }))
        }
        Ok(_) => HttpResponse::InternalServerError().finish(),
        Err(error) => reject(error),
    }
}

/// REST endpoint explicitly resuming a paused run.
#[post("/api/resume")]
async fn resume(data: web::Data<AppState>) -> impl Responder {
    match submit(&data, Command::Resume).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "resumed": true })),
        Err(error) => reject(error),
    }
}

/// REST endpoint for the emergency stop.
#[post("/api/emergency")]
async fn emergency(data: web::Data<AppState>) -> impl Responder {
    match submit(&data, Command::EmergencyStop).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "emergency_stopped": true })),
        Err(error) => reject(error),
    }
}

#[derive(Deserialize)]
struct TuneBody {
    kp: f64,
    ki: f64,
    kd: f64,
}

/// REST endpoint updating the PID gains.
#[post("/api/pid/tune")]
async fn tune_pid(body: web::Json<TuneBody>, data: web::Data<AppState>) -> impl Responder {
    let TuneBody { kp, ki, kd } = body.into_inner();
    match submit(&data, Command::TunePid { kp, ki, kd }).await {
        Ok(CommandOutcome::PidTuned { kp, ki, kd }) => {
            HttpResponse::Ok().json(serde_json::json!({ "kp": kp, "ki": ki, "kd": kd }))
        }
        Ok(_) => HttpResponse::InternalServerError().finish(),
        Err(error) => reject(error),
    }
}

#[derive(Deserialize)]
struct SaveBody {
    name: String,
    steps: Vec<Step>,
}

/// REST endpoint saving a user program.
#[post("/api/programs/save")]
async fn save_program(body: web::Json<SaveBody>, data: web::Data<AppState>) -> impl Responder {
    let SaveBody { name, steps } = body.into_inner();
    match submit(&data, Command::SaveProgram { name, steps }).await {
        Ok(CommandOutcome::ProgramSaved { id, program }) => {
            HttpResponse::Ok().json(serde_json::json!({ "id": id, "program": program }))
        }
        Ok(_) => HttpResponse::InternalServerError().finish(),
        Err(error) => reject(error),
    }
}

/// REST endpoint deleting a user program.
#[delete("/api/programs/{id}")]
async fn delete_program(path: web::Path<u32>, data: web::Data<AppState>) -> impl Responder {
    let id = path.into_inner();
    match submit(&data, Command::DeleteProgram { id }).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "deleted": true })),
        Err(error) => reject(error),
    }
}

/// REST endpoint clearing the error log.
#[post("/api/errors/clear")]
async fn clear_errors(data: web::Data<AppState>) -> impl Responder {
    match submit(&data, Command::ClearErrors).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "ok": true })),
        Err(error) => reject(error),
    }
}

/// REST endpoint exercising one actuator or the sensors while idle.
#[post("/api/test/{device}")]
async fn test_device(path: web::Path<String>, data: web::Data<AppState>) -> impl Responder {
    let target = match path.as_str() {
        "heater" => TestTarget::Heater,
        "vacuum" => TestTarget::Vacuum,
        "fan" => TestTarget::Fan,
        "sensors" => TestTarget::Sensors,
        other => {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": format!("unknown device {:?}", other) }));
        }
    };
    match submit(&data, Command::Test(target)).await {
        Ok(CommandOutcome::TestStarted { target }) => {
            HttpResponse::Ok().json(serde_json::json!({ "pulsing": target.name() }))
        }
        Ok(CommandOutcome::SensorReadings { tc1, tc2 }) => {
            HttpResponse::Ok().json(serde_json::json!({ "tc1": tc1, "tc2": tc2 }))
        }
        Ok(_) => HttpResponse::InternalServerError().finish(),
        Err(error) => reject(error),
    }
}

/// The WebSocket actor for handling a single client connection.
struct WebSocketSession {
    /// The time of the last heartbeat received from the client.
    hb: Instant,
    /// The shared application state.
    app_state: AppState,
    /// The last snapshot sent to the client, used to avoid duplicate sends.
    last_state: String,
}

impl Actor for WebSocketSession {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the actor is started.
    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
        self.send_state_update(ctx);
        ctx.run_interval(STATE_INTERVAL, |act, ctx| {
            act.send_state_update(ctx);
        });
    }
}

/// Handler for WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocketSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(_)) => {
                // The command surface is REST-only; inbound text is ignored.
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => ctx.stop(),
        }
    }
}

impl WebSocketSession {
    /// Sends a heartbeat ping to the client every `HEARTBEAT_INTERVAL`.
    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!("WebSocket client heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Sends the current snapshot to the client if it has changed.
    fn send_state_update(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let snapshot = self.app_state.snapshot.lock();
        if let Ok(json_state) = serde_json::to_string(&*snapshot) {
            if json_state != self.last_state {
                ctx.text(json_state.clone());
                self.last_state = json_state;
            }
        }
    }
}

/// WebSocket endpoint handler.
async fn websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    ws::start(
        WebSocketSession {
            hb: Instant::now(),
            app_state: data.get_ref().clone(),
            last_state: String::new(),
        },
        &req,
        stream,
    )
}

/// Starts the Actix web server.
pub fn start_api_server(port: u16, app_state: AppState) -> std::io::Result<actix_web::dev::Server> {
    info!("API listening on port {}", port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(status)
            .service(list_programs)
            .service(start)
            .service(stop)
            .service(pause)
            .service(resume)
            .service(emergency)
            .service(tune_pid)
            .service(save_program)
            .service(delete_program)
            .service(clear_errors)
            .service(test_device)
            .route("/ws", web::get().to(websocket_handler))
    })
    .bind(("0.0.0.0", port))?
    .run();
    Ok(server)
}
