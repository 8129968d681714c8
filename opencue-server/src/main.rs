//! OpenCue server entry point.
//!
//! Builds the process-lifetime services (catalogue, detector, advisor,
//! precision recorder, session manager) and binds the WebSocket endpoint
//! browser extensions connect to.

mod config;
mod server;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use opencue_core::advisor::{ContextAdvisor, OllamaAdvisor};
use opencue_core::session::precision::PrecisionRecorder;
use opencue_core::transcribe::stub::ScriptedTranscriber;
use opencue_core::transcribe::TranscriberHandle;
use opencue_core::{CatalogManager, Detector, Lexicon, SessionConfig, SessionManager};

use config::{default_settings_path, load_settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    info!(settings = %settings_path.display(), "settings loaded");

    let catalog_dir = settings.catalog_dir();
    let catalog = Arc::new(
        CatalogManager::new(catalog_dir.clone())
            .with_context(|| format!("open catalogue at {}", catalog_dir.display()))?,
    );

    let lexicon = Arc::new(if settings.wordlist_path.trim().is_empty() {
        Lexicon::builtin()
    } else {
        let raw = std::fs::read_to_string(settings.wordlist_path.trim())
            .with_context(|| format!("read wordlist {}", settings.wordlist_path))?;
        Lexicon::from_json(&raw).context("parse wordlist")?
    });
    let detector = Arc::new(Detector::from_lexicon(&lexicon));

    let advisor: Option<Arc<dyn ContextAdvisor>> = if settings.advisor_url.is_empty() {
        info!("advisor disabled — context-sensitive detections default to filtering");
        None
    } else {
        info!(url = settings.advisor_url.as_str(), model = settings.advisor_model.as_str(), "advisor enabled");
        Some(Arc::new(OllamaAdvisor::new(
            settings.advisor_url.clone(),
            settings.advisor_model.clone(),
        )))
    };

    let transcriber = if settings.stub_transcriber {
        warn!("using scripted stub transcriber — precision recordings will contain no cues");
        Some(TranscriberHandle::new(ScriptedTranscriber::silent()))
    } else {
        // A real engine is wired here by embedding hosts; without one the
        // precision path reports itself unavailable with instructions.
        None
    };

    let recorder = Arc::new(PrecisionRecorder::new(
        Arc::clone(&catalog),
        Arc::clone(&lexicon),
        transcriber,
        None,
    ));

    let manager = Arc::new(SessionManager::new(
        catalog,
        detector,
        advisor,
        recorder,
        SessionConfig::default(),
    ));

    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("bind {}", settings.listen_addr))?;
    info!(addr = settings.listen_addr.as_str(), "listening for clients");

    tokio::select! {
        result = server::run(listener, manager) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}
