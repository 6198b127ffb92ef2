use std::future::Future;
use std::sync::Arc;

use actix_web::cookie::{Cookie, SameSite};
use actix_web::http::header::{
    self, Charset, ContentDisposition, DispositionParam, DispositionType, ExtendedValue,
};
use actix_web::{web, HttpRequest, HttpResponse, HttpResponseBuilder, Responder};
use async_stream::stream;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;

use crate::job::{Bitrate, JobError, JobRequest};
use crate::orchestrator::{self, Artifact};
use crate::progress::ProgressSink;
use crate::session::{DownloadUnavailable, Session};
use crate::{state::AppState, util};

pub const SESSION_COOKIE: &str = "ytmp3_session";

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Deserialize)]
pub struct ConvertRequest {
    pub url: String,
    // kbps; falls back to default_bitrate from config.toml
    pub bitrate: Option<u32>,
    // EBU R128 loudness normalisation
    pub normalize: Option<bool>,
}

fn session_id(req: &HttpRequest) -> Option<Uuid> {
    req.cookie(SESSION_COOKIE)
        .and_then(|c| Uuid::parse_str(c.value()).ok())
}

fn with_session(mut builder: HttpResponseBuilder, id: Uuid, created: bool) -> HttpResponseBuilder {
    if created {
        builder.cookie(
            Cookie::build(SESSION_COOKIE, id.to_string())
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .finish(),
        );
    }
    builder
}

fn error_body(e: &JobError) -> serde_json::Value {
    serde_json::json!({
        "error": e.to_string(),
        "kind": e.kind(),
        "stderr_tail": e.stderr_tail(),
    })
}

fn ascii_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect()
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(16 * 1024)
        .error_handler(|err, _req| {
            let body = serde_json::json!({
                "error": format!("Invalid request body: {}", err),
                "kind": "validation",
            });
            actix_web::error::InternalError::from_response(err, HttpResponse::BadRequest().json(body))
                .into()
        })
}

/// Run `job` on its own task and always settle `session`, even if the job panics.
async fn supervise<F>(session: Arc<Session>, permit: OwnedSemaphorePermit, job: F)
where
    F: Future<Output = Result<Artifact, JobError>> + Send + 'static,
{
    // Keep the concurrency slot held while yt-dlp runs.
    let _permit = permit;
    let outcome = match tokio::spawn(job).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("[JOB] Task ended abnormally: {}", e);
            let err = JobError::Extraction {
                message: "the conversion job stopped unexpectedly".to_string(),
                stderr_tail: None,
            };
            session.relay().fail(err.kind(), &err.to_string());
            Err(err)
        }
    };
    session.finish(outcome);
}

/// Routes for the page and its JSON API.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/api/health").route(web::get().to(health)))
        .service(web::resource("/api/convert").route(web::post().to(convert)))
        .service(web::resource("/api/status").route(web::get().to(status)))
        .service(web::resource("/api/reset").route(web::post().to(reset)))
        .service(web::resource("/api/download").route(web::get().to(download)));
}

pub async fn index() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

pub async fn health(state: web::Data<AppState>) -> impl Responder {
    let cfg = state.config.as_ref();
    let ffmpeg = util::find_ffmpeg(cfg.ffmpeg_bin.as_deref(), &cfg.ytdlp_path);
    if ffmpeg.is_none() {
        log::warn!("[HEALTH] FFmpeg not found; MP3 conversion will fail");
    }
    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-store"))
        .json(serde_json::json!({
            "service": "YouTube to MP3",
            "version": env!("CARGO_PKG_VERSION"),
            "ffmpeg_found": ffmpeg.is_some(),
            "bitrates": Bitrate::ALL,
            "default_bitrate": cfg.default_bitrate,
            "allowed_hosts": cfg.allowed_hosts,
            "endpoints": {
                "GET /": "The converter page",
                "GET /api/health": "Service info and dependency check",
                "POST /api/convert": "Start a job for this session (body: {url, bitrate, normalize})",
                "GET /api/status": "Progress and result of this session's job",
                "POST /api/reset": "Discard the finished job and return to idle",
                "GET /api/download": "Download the MP3 once"
            }
        }))
}

pub async fn convert(
    req: HttpRequest,
    body: web::Json<ConvertRequest>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let (sid, session, created) = state.sessions.resolve(session_id(&req));
    let cfg = state.config.clone();

    let kbps = body.bitrate.unwrap_or_else(|| cfg.default_bitrate.kbps());
    let normalize = body.normalize.unwrap_or(false);
    let request = match JobRequest::new(&body.url, kbps, normalize, &cfg.allowed_hosts) {
        Ok(r) => r,
        Err(e) => {
            log::info!("[JOB] Rejected for session {}: {}", sid, e);
            return with_session(HttpResponse::BadRequest(), sid, created).json(error_body(&e));
        }
    };

    let permit = match state.limiter.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => {
            return with_session(HttpResponse::TooManyRequests(), sid, created).json(
                serde_json::json!({
                    "error": format!("Too many concurrent jobs (max: {})", cfg.max_concurrent_jobs)
                }),
            );
        }
    };

    if session.begin().is_err() {
        return with_session(HttpResponse::Conflict(), sid, created).json(serde_json::json!({
            "error": "A conversion is already running in this session"
        }));
    }

    log::info!("[JOB] Accepted for session {}: {}", sid, request.url());

    let job_session = session.clone();
    let job = async move { orchestrator::run(&request, cfg.as_ref(), job_session.relay()).await };
    tokio::spawn(supervise(session, permit, job));

    with_session(HttpResponse::Accepted(), sid, created).json(serde_json::json!({
        "status": "accepted",
        "bitrate": kbps,
        "normalize": normalize,
    }))
}

pub async fn status(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let (sid, session, created) = state.sessions.resolve(session_id(&req));
    with_session(HttpResponse::Ok(), sid, created)
        .append_header((header::CACHE_CONTROL, "no-store"))
        .json(session.snapshot())
}

pub async fn reset(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let (sid, session, created) = state.sessions.resolve(session_id(&req));
    match session.reset() {
        Ok(()) => with_session(HttpResponse::Ok(), sid, created).json(session.snapshot()),
        Err(_) => with_session(HttpResponse::Conflict(), sid, created).json(serde_json::json!({
            "error": "A conversion is still running in this session"
        })),
    }
}

pub async fn download(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let session = match session_id(&req).and_then(|id| state.sessions.get(&id)) {
        Some(s) => s,
        None => {
            return HttpResponse::NotFound().json(serde_json::json!({
                "error": "No converted file for this session"
            }));
        }
    };

    let artifact = match session.take_artifact() {
        Ok(a) => a,
        Err(DownloadUnavailable::NotReady) => {
            return HttpResponse::NotFound().json(serde_json::json!({
                "error": "No converted file for this session"
            }));
        }
        Err(DownloadUnavailable::AlreadyServed) => {
            return HttpResponse::Gone().json(serde_json::json!({
                "error": "This file was already downloaded; convert again to get a new copy"
            }));
        }
    };

    let file_name = artifact.file_name.clone();
    let size = artifact.size;
    let (temp_dir, path) = artifact.into_parts();

    log::info!("[DOWNLOAD] Streaming {} ({} bytes)", file_name, size);

    // Capture TempDir so the MP3 is deleted when the response ends.
    let body = stream! {
        let _temp_dir: TempDir = temp_dir;

        let mut file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => yield Ok(bytes::Bytes::copy_from_slice(&buffer[..n])),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };

    let disposition = ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![
            DispositionParam::Filename(ascii_file_name(&file_name)),
            DispositionParam::FilenameExt(ExtendedValue {
                charset: Charset::Ext("UTF-8".to_string()),
                language_tag: None,
                value: file_name.into_bytes(),
            }),
        ],
    };

    HttpResponse::Ok()
        .content_type("audio/mpeg")
        .append_header((header::CONTENT_LENGTH, size.to_string()))
        .insert_header(disposition)
        .append_header((header::CACHE_CONTROL, "no-store"))
        .streaming(body)
}
