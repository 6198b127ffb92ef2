use std::time::Duration;

use actix_web::{web, App, HttpServer};
use tokio::time;

use ytmp3::config::AppConfig;
use ytmp3::state::AppState;
use ytmp3::{handlers, util};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cfg_path = std::env::args()
        .skip_while(|a| a != "--config")
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let cfg = match AppConfig::load(&cfg_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("[CONFIG] Failed to load {}: {:#}", cfg_path, e);
            std::process::exit(1);
        }
    };

    log::info!("========================================");
    log::info!("  YouTube -> MP3");
    log::info!("  http://{}", cfg.listen_addr);
    log::info!("========================================");

    if util::find_ffmpeg(cfg.ffmpeg_bin.as_deref(), &cfg.ytdlp_path).is_none() {
        log::warn!(
            "[CONFIG] FFmpeg not found in PATH. Jobs will fail with a conversion error until it is installed."
        );
    }

    let state = web::Data::new(AppState::new(cfg));

    // Drop abandoned sessions (and any MP3 they never downloaded).
    {
        let sessions = state.sessions.clone();
        let ttl = Duration::from_secs(state.config.session_ttl_secs);
        let every = Duration::from_secs(state.config.session_sweep_secs);
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            loop {
                interval.tick().await;
                let reaped = sessions.reap_idle(ttl);
                if reaped > 0 {
                    log::info!(
                        "[SESSION] Reaped {} idle session(s), {} remaining",
                        reaped,
                        sessions.len()
                    );
                }
            }
        });
    }

    let bind_addr = state.config.listen_addr.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .bind(bind_addr.as_str())?
    .run()
    .await
}
