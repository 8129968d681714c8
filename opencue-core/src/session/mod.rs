//! Per-client sync sessions.
//!
//! ## Ownership model
//!
//! Each connected client gets one [`Session`], owned by a single tokio task
//! that drains the connection's inbound queue in arrival order. All cue
//! bookkeeping (`triggered`/`active` sets, sync state, recording state) is
//! plain mutable state inside that task — no locks, no races, and cue
//! decisions for one session are serialised by construction.
//!
//! ```text
//! reader ──mpsc──► Session::run ──mpsc──► writer
//!                     │    ▲
//!                     │    └── FingerprintSyncUpdate (live capture task)
//!                     └──► CatalogManager / Detector / Advisor / Recorder
//! ```
//!
//! [`SessionManager`] is the process-lifetime service holding the shared
//! collaborators and spawning sessions.

pub mod fingerprint_sync;
pub mod precision;
pub mod recording;
pub mod sync;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::advisor::{advice_or_default, Advice, AdviceRequest, ContextAdvisor, ADVISOR_TIMEOUT};
use crate::cues::catalog::CatalogManager;
use crate::cues::{Cue, CueAction, CueFile};
use crate::lexicon::{replace, Detection, Detector};
use crate::proto::messages::{
    CueEventKind, CueEventPayload, Inbound, ModeSetPayload, Outbound, OverlayPayload,
    PlaybackState, PrecisionStartedPayload, PrecisionStoppedPayload, RecordingAbortedPayload,
    RecordingPausedPayload, RecordingResumedPayload, RecordingStartedPayload,
    RecordingStatusPayload, RecordingStoppedPayload, SessionInfoPayload, SessionMode,
    StartPrecisionPayload, StartRecordingPayload, SubtitlePayload, SyncStateKind,
    SyncStatePayload,
};

use fingerprint_sync::{FingerprintSyncTask, FingerprintSyncUpdate};
use precision::{PrecisionConfig, PrecisionRecorder};
use recording::RecordingState;
use sync::{SubtitleSyncConfig, SubtitleSyncEngine, SyncMethod};

/// Session-level tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cue trigger lookahead with an active sync signal (ms).
    pub lookahead_ms: i64,
    /// Lookahead in pure-timestamp mode (ms).
    pub timestamp_lookahead_ms: i64,
    /// Realtime cue padding before the detected word (ms).
    pub pad_before_ms: i64,
    /// Realtime cue padding after the detected word (ms).
    pub pad_after_ms: i64,
    /// Minimum realtime cue duration (ms).
    pub min_cue_duration_ms: i64,
    /// Identical-caption dedup window (ms).
    pub subtitle_dedup_window_ms: i64,
    pub sync: SubtitleSyncConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 500,
            timestamp_lookahead_ms: 200,
            pad_before_ms: 400,
            pad_after_ms: 150,
            min_cue_duration_ms: 400,
            subtitle_dedup_window_ms: 300,
            sync: SubtitleSyncConfig::default(),
        }
    }
}

/// Recent-caption dedup ring depth.
const SUBTITLE_RING_LEN: usize = 10;

/// Supervisory warning threshold for a blocked outbound send.
const SEND_WARN_AFTER: Duration = Duration::from_secs(30);

/// Process-lifetime service owning shared collaborators and sessions.
pub struct SessionManager {
    pub catalog: Arc<CatalogManager>,
    pub detector: Arc<Detector>,
    pub advisor: Option<Arc<dyn ContextAdvisor>>,
    pub recorder: Arc<PrecisionRecorder>,
    pub config: SessionConfig,
    counter: AtomicU64,
    active: Mutex<HashSet<String>>,
}

/// Handle returned to the connection layer.
pub struct SessionHandle {
    pub id: String,
    pub inbound_tx: mpsc::Sender<Inbound>,
    pub task: tokio::task::JoinHandle<()>,
}

impl SessionManager {
    pub fn new(
        catalog: Arc<CatalogManager>,
        detector: Arc<Detector>,
        advisor: Option<Arc<dyn ContextAdvisor>>,
        recorder: Arc<PrecisionRecorder>,
        config: SessionConfig,
    ) -> Self {
        Self {
            catalog,
            detector,
            advisor,
            recorder,
            config,
            counter: AtomicU64::new(0),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Create a session for one connection and spawn its actor task.
    ///
    /// The session lives until `inbound_tx` is dropped (client disconnect).
    pub fn spawn_session(self: &Arc<Self>, outbound: mpsc::Sender<Outbound>) -> SessionHandle {
        let id = format!("session_{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(64);
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();

        self.active.lock().insert(id.clone());
        info!(session = id.as_str(), "session created");

        let session = Session {
            id: id.clone(),
            manager: Arc::clone(self),
            outbound,
            sync_tx,
            mode: SessionMode::Realtime,
            content_id: None,
            cue_file_id: None,
            cue_file: None,
            synced: false,
            sync_offset_ms: 0,
            lookahead_ms: self.config.lookahead_ms,
            last_position_ms: 0,
            triggered: HashSet::new(),
            active_cues: HashMap::new(),
            subtitle_sync: None,
            fingerprint_task: None,
            fingerprint_mode: false,
            recent_subtitles: VecDeque::new(),
            recording: None,
            owned_precision_id: None,
        };

        let task = tokio::spawn(session.run(inbound_rx, sync_rx));
        SessionHandle {
            id,
            inbound_tx,
            task,
        }
    }

    pub fn session_count(&self) -> usize {
        self.active.lock().len()
    }

    fn remove_session(&self, id: &str) {
        self.active.lock().remove(id);
        info!(session = id, "session removed");
    }
}

/// One connected client's state, owned by its actor task.
struct Session {
    id: String,
    manager: Arc<SessionManager>,
    outbound: mpsc::Sender<Outbound>,
    sync_tx: mpsc::UnboundedSender<FingerprintSyncUpdate>,

    mode: SessionMode,
    content_id: Option<String>,
    cue_file_id: Option<String>,
    cue_file: Option<Arc<CueFile>>,

    synced: bool,
    sync_offset_ms: i64,
    lookahead_ms: i64,
    last_position_ms: i64,

    triggered: HashSet<String>,
    /// Active cue id → index into the loaded file's cue list.
    active_cues: HashMap<String, usize>,

    subtitle_sync: Option<SubtitleSyncEngine>,
    fingerprint_task: Option<FingerprintSyncTask>,
    /// Cue events take the `cue {event}` shape while fingerprint-synced.
    fingerprint_mode: bool,

    recent_subtitles: VecDeque<(String, i64)>,
    recording: Option<RecordingState>,
    owned_precision_id: Option<String>,
}

impl Session {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut sync_rx: mpsc::UnboundedReceiver<FingerprintSyncUpdate>,
    ) {
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                Some(update) = sync_rx.recv() => self.handle_sync_update(update).await,
            }
        }
        self.teardown().await;
    }

    async fn handle(&mut self, message: Inbound) {
        match message {
            Inbound::Subtitle(payload) => self.on_subtitle(payload).await,
            Inbound::Playback(payload) => {
                if !payload.content_id.is_empty() {
                    self.content_id = Some(payload.content_id.clone());
                }
                match payload.state {
                    PlaybackState::Playing => self.update_position(payload.position_ms).await,
                    PlaybackState::Seeked => self.handle_seek(payload.position_ms).await,
                    PlaybackState::Paused => self.last_position_ms = payload.position_ms,
                }
            }
            Inbound::Position { position_ms } => self.update_position(position_ms).await,
            Inbound::SetMode(payload) => {
                let result = self.set_mode(payload.mode, payload.cue_file).await;
                self.send(Outbound::ModeSet(result)).await;
            }
            Inbound::LoadCueFile { id } => {
                let result = self.set_mode(SessionMode::CueFile, Some(id)).await;
                self.send(Outbound::CueFileLoaded(result)).await;
            }
            Inbound::ListCueFiles => {
                let files = self.manager.catalog.available();
                self.send(Outbound::CueFileList { files }).await;
            }
            Inbound::SearchCueFiles { query } => {
                self.manager.catalog.refresh_index();
                let files = if query.is_empty() {
                    self.manager.catalog.available()
                } else {
                    self.manager.catalog.search(&query)
                };
                self.send(Outbound::CueFileSearchResults { query, files })
                    .await;
            }
            Inbound::GetSessionInfo => {
                let info = SessionInfoPayload {
                    session_id: self.id.clone(),
                    mode: self.mode.as_str().into(),
                    synced: self.synced,
                    cue_file: self.cue_file_id.clone(),
                    content_id: self.content_id.clone(),
                };
                self.send(Outbound::SessionInfo(info)).await;
            }
            Inbound::StartRecording(payload) => self.start_recording(payload).await,
            Inbound::StopRecording => self.stop_recording().await,
            Inbound::AbortRecording => self.abort_recording().await,
            Inbound::PauseRecording => self.pause_recording().await,
            Inbound::ResumeRecording { position_ms } => self.resume_recording(position_ms).await,
            Inbound::GetRecordingStatus => self.recording_status().await,
            Inbound::StartPrecisionRecording(payload) => {
                self.start_precision_recording(payload).await
            }
            Inbound::StopPrecisionRecording { recording_id } => {
                self.stop_precision_recording(recording_id).await
            }
            Inbound::GetPrecisionRecordingStatus { recording_id } => {
                let payload = self.manager.recorder.status(recording_id.as_deref());
                self.send(Outbound::PrecisionRecordingStatus(payload)).await;
            }
            Inbound::AbortPrecisionRecording { recording_id } => {
                let recorder = Arc::clone(&self.manager.recorder);
                let payload = tokio::task::spawn_blocking(move || {
                    recorder.abort(recording_id.as_deref())
                })
                .await
                .unwrap_or_else(|e| crate::proto::messages::PrecisionAbortedPayload {
                    success: false,
                    recording_id: None,
                    error: Some(e.to_string()),
                });
                if payload.success {
                    self.owned_precision_id = None;
                }
                self.send(Outbound::PrecisionRecordingAborted(payload)).await;
            }
            Inbound::CheckPrecisionRequirements => {
                let recorder = Arc::clone(&self.manager.recorder);
                match tokio::task::spawn_blocking(move || recorder.check_requirements()).await {
                    Ok(payload) => self.send(Outbound::PrecisionRequirements(payload)).await,
                    Err(e) => warn!("requirements check task failed: {e}"),
                }
            }
        }
    }

    // ── Subtitles ────────────────────────────────────────────────────────

    async fn on_subtitle(&mut self, payload: SubtitlePayload) {
        let position_ms = payload.position();

        // Streaming services re-emit the same caption frame; drop repeats
        // of identical text arriving within the dedup window.
        let window = self.manager.config.subtitle_dedup_window_ms;
        let duplicate = self
            .recent_subtitles
            .iter()
            .any(|(text, time)| *text == payload.text && (position_ms - time).abs() < window);
        if duplicate {
            debug!("dropping duplicate caption frame");
            return;
        }
        self.recent_subtitles
            .push_back((payload.text.clone(), position_ms));
        if self.recent_subtitles.len() > SUBTITLE_RING_LEN {
            self.recent_subtitles.pop_front();
        }

        if !payload.content_id.is_empty() {
            self.content_id = Some(payload.content_id.clone());
        }

        match self.mode {
            SessionMode::Realtime | SessionMode::Hybrid | SessionMode::Recording => {
                self.realtime_detect(&payload).await;
                if let Some(rec) = &mut self.recording {
                    rec.add_subtitle(&payload.text, position_ms);
                }
            }
            SessionMode::CueFile => {
                self.subtitle_sync_step(&payload.text, position_ms).await;
            }
        }
    }

    async fn subtitle_sync_step(&mut self, text: &str, position_ms: i64) {
        let Some(engine) = self.subtitle_sync.as_mut() else {
            return;
        };
        let outcome = engine.process_subtitle(text, position_ms);
        let became_synced = outcome.synced && !self.synced;

        if outcome.synced {
            self.synced = true;
            self.sync_offset_ms = outcome.offset_ms;
        }

        match outcome.method {
            SyncMethod::SubtitleMatch if became_synced => {
                info!(
                    session = self.id.as_str(),
                    offset_ms = outcome.offset_ms,
                    confidence = outcome.confidence,
                    "subtitle sync established"
                );
                self.send(Outbound::SyncState(SyncStatePayload {
                    state: SyncStateKind::Synced,
                    mode: Some("subtitle".into()),
                    offset_ms: Some(outcome.offset_ms),
                    confidence: Some(outcome.confidence),
                    matched: outcome.matched.map(|m| m.chars().take(50).collect()),
                    reason: None,
                    has_microsignatures: None,
                }))
                .await;
            }
            SyncMethod::PendingConfirmation => {
                debug!(
                    offset_ms = outcome.offset_ms,
                    "subtitle match pending confirmation"
                );
            }
            _ => {}
        }
    }

    // ── Realtime detection ───────────────────────────────────────────────

    async fn realtime_detect(&mut self, payload: &SubtitlePayload) {
        let detections = self.manager.detector.detect(&payload.text);
        if detections.is_empty() {
            return;
        }

        for detection in detections {
            let Some((confidence, context_type)) =
                self.advisor_gate(payload, &detection).await
            else {
                continue;
            };

            let (start_ms, end_ms) = subtitle_cue_interval(
                payload.start_ms,
                payload.end_ms,
                detection.position_start,
                detection.position_end,
                &self.manager.config,
            );

            let cue_id = format!("cue_{:08x}", rand::random::<u32>());
            let overlay = OverlayPayload {
                cue_id: cue_id.clone(),
                action: CueAction::Mute.as_str().into(),
                start_ms,
                end_ms,
                category: detection.category.clone(),
                matched: detection.matched.clone(),
                replacement: detection.replacement.clone(),
                source: "realtime".into(),
                content_id: payload.content_id.clone(),
                confidence: Some(confidence),
                context_type,
            };
            info!(
                matched = detection.matched.as_str(),
                start_ms, end_ms, "overlay dispatched"
            );
            self.send(Outbound::Overlay(overlay)).await;

            if let Some(rec) = &mut self.recording {
                rec.add_cue(Cue {
                    id: cue_id,
                    start_ms,
                    end_ms,
                    action: CueAction::Mute,
                    category: detection.category.clone(),
                    word: Some(detection.matched.to_lowercase()),
                    region: None,
                    confidence,
                    source: Some("subtitle".into()),
                });
            }
        }
    }

    /// Apply the contextual advisor to a detection. `None` means the
    /// detection was vetoed; otherwise the (possibly adjusted) confidence
    /// and context type are returned.
    ///
    /// The wait is bounded by the subtitle interval so a slow advisor can
    /// never stall caption processing past the moment the cue matters.
    async fn advisor_gate(
        &self,
        payload: &SubtitlePayload,
        detection: &Detection,
    ) -> Option<(f32, Option<String>)> {
        let needs_context =
            detection.context_required || detection.category.contains("blasphemy");
        if !needs_context {
            return Some((detection.confidence, None));
        }
        let Some(advisor) = self.manager.advisor.as_ref() else {
            // No advisor configured: the safe default is to filter.
            return Some((detection.confidence, None));
        };

        let subtitle_span = (payload.end_ms - payload.start_ms).max(0) as u64;
        let deadline = ADVISOR_TIMEOUT.min(Duration::from_millis(subtitle_span.max(250)));

        let context_text: String = self
            .recent_subtitles
            .iter()
            .map(|(text, _)| text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let request = AdviceRequest {
            text: &payload.text,
            word: &detection.word,
            category: &detection.category,
            context_text: &context_text,
        };

        let advice = match tokio::time::timeout(deadline, advisor.analyze(request)).await {
            Ok(outcome) => advice_or_default(outcome),
            Err(_) => {
                warn!(
                    word = detection.word.as_str(),
                    "advisor missed the subtitle deadline — keeping detection"
                );
                Advice::safe_default("advisor deadline")
            }
        };

        if !advice.should_filter {
            info!(
                word = detection.word.as_str(),
                reason = advice.reason.as_str(),
                context_type = advice.context_type.as_str(),
                "detection suppressed by advisor"
            );
            return None;
        }
        Some((advice.confidence, Some(advice.context_type)))
    }

    // ── Cue-file mode ────────────────────────────────────────────────────

    async fn set_mode(&mut self, mode: SessionMode, cue_file_id: Option<String>) -> ModeSetPayload {
        self.mode = mode;

        if let Some(id) = cue_file_id {
            if matches!(mode, SessionMode::CueFile | SessionMode::Hybrid) {
                let file = match self.manager.catalog.load(&id) {
                    Ok(file) => file,
                    Err(e) => {
                        warn!(id = id.as_str(), "cue file load failed: {e}");
                        return ModeSetPayload {
                            success: false,
                            mode: None,
                            error: Some(e.to_string()),
                        };
                    }
                };

                self.cue_file_id = Some(id);
                self.cue_file = Some(Arc::clone(&file));
                self.triggered.clear();
                self.active_cues.clear();
                self.synced = false;
                self.sync_offset_ms = 0;
                self.subtitle_sync = None;
                self.fingerprint_task = None; // drop stops any live capture
                self.fingerprint_mode = false;

                self.start_sync(&file).await;
            }
        }

        info!(
            session = self.id.as_str(),
            mode = self.mode.as_str(),
            cue_file = self.cue_file_id.as_deref().unwrap_or("-"),
            "session mode set"
        );
        ModeSetPayload {
            success: true,
            mode: Some(self.mode.as_str().into()),
            error: None,
        }
    }

    /// Sync priority: subtitle text → fingerprints → timestamp-only.
    async fn start_sync(&mut self, file: &Arc<CueFile>) {
        let microsig_reference = file
            .microsignatures
            .as_ref()
            .map(|block| block.sequences.clone())
            .filter(|sequences| !sequences.is_empty());
        let has_microsignatures = microsig_reference.is_some();

        if file.has_subtitles() {
            self.subtitle_sync = Some(SubtitleSyncEngine::new(
                file,
                self.manager.config.sync.clone(),
            ));
            self.lookahead_ms = self.manager.config.lookahead_ms;
            self.send(Outbound::SyncState(SyncStatePayload {
                state: SyncStateKind::Syncing,
                mode: Some("subtitle".into()),
                offset_ms: None,
                confidence: None,
                matched: None,
                reason: Some("waiting_for_subtitles".into()),
                has_microsignatures: Some(has_microsignatures),
            }))
            .await;
            return;
        }

        if let Some(block) = file.fingerprints.clone().filter(|b| !b.markers.is_empty()) {
            let sync_tx = self.sync_tx.clone();
            let started = tokio::task::spawn_blocking(move || {
                FingerprintSyncTask::start(&block, microsig_reference, sync_tx)
            })
            .await;

            match started {
                Ok(Ok(task)) => {
                    self.fingerprint_task = Some(task);
                    self.fingerprint_mode = true;
                    self.lookahead_ms = self.manager.config.lookahead_ms;
                    self.send(Outbound::SyncState(SyncStatePayload {
                        state: SyncStateKind::Syncing,
                        mode: Some("fingerprint".into()),
                        offset_ms: None,
                        confidence: None,
                        matched: None,
                        reason: None,
                        has_microsignatures: Some(has_microsignatures),
                    }))
                    .await;
                    return;
                }
                Ok(Err(e)) => warn!("fingerprint sync unavailable: {e}"),
                Err(e) => warn!("fingerprint sync task panicked: {e}"),
            }
            // Fall through to timestamp mode.
            self.enter_timestamp_mode("capture_unavailable").await;
            return;
        }

        self.enter_timestamp_mode("no_sync_data").await;
    }

    async fn enter_timestamp_mode(&mut self, reason: &str) {
        self.synced = true;
        self.sync_offset_ms = 0;
        self.lookahead_ms = self.manager.config.timestamp_lookahead_ms;
        self.send(Outbound::SyncState(SyncStatePayload {
            state: SyncStateKind::Synced,
            mode: Some("timestamp".into()),
            offset_ms: Some(0),
            confidence: None,
            matched: None,
            reason: Some(reason.into()),
            has_microsignatures: None,
        }))
        .await;
    }

    async fn handle_sync_update(&mut self, update: FingerprintSyncUpdate) {
        match update {
            FingerprintSyncUpdate::Synced {
                offset_ms,
                confidence,
            } => {
                let became_synced = !self.synced;
                self.synced = true;
                self.sync_offset_ms = offset_ms;
                if became_synced {
                    self.send(Outbound::SyncState(SyncStatePayload {
                        state: SyncStateKind::Synced,
                        mode: Some("fingerprint".into()),
                        offset_ms: Some(offset_ms),
                        confidence: Some(confidence),
                        matched: None,
                        reason: None,
                        has_microsignatures: None,
                    }))
                    .await;
                }
            }
            FingerprintSyncUpdate::Lost => {
                if self.synced {
                    self.synced = false;
                    self.send(Outbound::SyncState(SyncStatePayload {
                        state: SyncStateKind::Lost,
                        mode: Some("fingerprint".into()),
                        offset_ms: None,
                        confidence: None,
                        matched: None,
                        reason: None,
                        has_microsignatures: None,
                    }))
                    .await;
                }
            }
        }
    }

    async fn update_position(&mut self, position_ms: i64) {
        self.last_position_ms = position_ms;
        if !matches!(self.mode, SessionMode::CueFile | SessionMode::Hybrid) {
            return;
        }

        // Effective content time: the raw position while waiting for sync
        // keeps timestamp-only dispatch working as a fallback.
        let effective = if self.synced {
            position_ms + self.sync_offset_ms
        } else {
            position_ms
        };
        self.check_cues(effective).await;
    }

    async fn check_cues(&mut self, t: i64) {
        let Some(file) = self.cue_file.clone() else {
            return;
        };

        for (idx, cue) in file.cues.iter().enumerate() {
            let should_start = !self.triggered.contains(&cue.id)
                && cue.start_ms <= t + self.lookahead_ms
                && t < cue.end_ms;
            if should_start {
                self.triggered.insert(cue.id.clone());
                self.active_cues.insert(cue.id.clone(), idx);
                info!(
                    cue = cue.id.as_str(),
                    t,
                    start_ms = cue.start_ms,
                    end_ms = cue.end_ms,
                    "cue triggered"
                );
                self.send_cue_start(cue).await;
            } else if self.active_cues.contains_key(&cue.id) && t >= cue.end_ms {
                self.active_cues.remove(&cue.id);
                self.send_cue_end(cue).await;
            }
        }
    }

    async fn send_cue_start(&mut self, cue: &Cue) {
        if self.fingerprint_mode {
            self.send(Outbound::Cue(CueEventPayload {
                event: CueEventKind::Start,
                cue_id: cue.id.clone(),
                action: cue.action.as_str().into(),
                category: cue.category.clone(),
                start_ms: cue.start_ms,
                end_ms: cue.end_ms,
                word: cue.word.clone(),
                region: cue.region,
            }))
            .await;
            return;
        }

        let replacement = match cue.word.as_deref() {
            Some(word) if !word.is_empty() => replace::replacement_mirroring_case(word),
            _ => "****".into(),
        };
        self.send(Outbound::Overlay(OverlayPayload {
            cue_id: cue.id.clone(),
            action: cue.action.as_str().into(),
            start_ms: cue.start_ms,
            end_ms: cue.end_ms,
            category: cue.category.clone(),
            matched: cue.word.clone().unwrap_or_default(),
            replacement,
            source: "cue_file".into(),
            content_id: self.content_id.clone().unwrap_or_default(),
            confidence: Some(cue.confidence),
            context_type: None,
        }))
        .await;
    }

    async fn send_cue_end(&mut self, cue: &Cue) {
        if self.fingerprint_mode {
            self.send(Outbound::Cue(CueEventPayload {
                event: CueEventKind::End,
                cue_id: cue.id.clone(),
                action: cue.action.as_str().into(),
                category: cue.category.clone(),
                start_ms: cue.start_ms,
                end_ms: cue.end_ms,
                word: cue.word.clone(),
                region: cue.region,
            }))
            .await;
        } else {
            self.send(Outbound::CueEnd {
                cue_id: cue.id.clone(),
            })
            .await;
        }
    }

    /// A seek supersedes pending cue decisions: cues ahead of the new
    /// position become triggerable again, and active cues that no longer
    /// cover the position end immediately.
    async fn handle_seek(&mut self, position_ms: i64) {
        if let Some(file) = self.cue_file.clone() {
            for cue in &file.cues {
                if cue.start_ms > position_ms {
                    self.triggered.remove(&cue.id);
                }
            }
            for cue in &file.cues {
                if self.active_cues.contains_key(&cue.id)
                    && (cue.end_ms <= position_ms || cue.start_ms > position_ms)
                {
                    self.active_cues.remove(&cue.id);
                    self.send_cue_end(cue).await;
                }
            }
        }

        if let Some(task) = &self.fingerprint_task {
            task.seek();
        }
        debug!(position_ms, "seek handled");
        self.last_position_ms = position_ms;
    }

    // ── Subtitle-driven recording ────────────────────────────────────────

    async fn start_recording(&mut self, payload: StartRecordingPayload) {
        if self.recording.is_some() {
            self.send(Outbound::RecordingStarted(RecordingStartedPayload {
                success: false,
                recording: true,
                title: String::new(),
                start_position_ms: 0,
                error: Some("Already recording".into()),
            }))
            .await;
            return;
        }

        let content_id = if payload.content_id.is_empty() {
            self.content_id.clone().unwrap_or_else(|| "unknown".into())
        } else {
            payload.content_id
        };

        let state = RecordingState::begin(
            &payload.title,
            &content_id,
            self.last_position_ms,
            self.manager.catalog.dir(),
        );
        let started = RecordingStartedPayload {
            success: true,
            recording: true,
            title: state.title.clone(),
            start_position_ms: state.start_position_ms,
            error: None,
        };
        info!(
            session = self.id.as_str(),
            title = state.title.as_str(),
            "subtitle recording started"
        );
        self.recording = Some(state);
        self.mode = SessionMode::Recording;
        self.send(Outbound::RecordingStarted(started)).await;
    }

    async fn stop_recording(&mut self) {
        let Some(mut state) = self.recording.take() else {
            self.send(Outbound::RecordingStopped(RecordingStoppedPayload {
                success: false,
                recording: false,
                cue_count: None,
                subtitle_count: None,
                duration_ms: None,
                saved_to: None,
                error: Some("Not recording".into()),
            }))
            .await;
            return;
        };

        let file = state.seal(self.last_position_ms);
        let cue_count = file.cues.len();
        let subtitle_count = file.subtitles.len();
        let duration_ms = file.content.duration_ms;

        let payload = match self.manager.catalog.add(&file, &state.filename()) {
            Ok(path) => {
                state.cleanup_temp();
                info!(
                    cues = cue_count,
                    subtitles = subtitle_count,
                    path = %path.display(),
                    "subtitle recording sealed"
                );
                RecordingStoppedPayload {
                    success: true,
                    recording: false,
                    cue_count: Some(cue_count),
                    subtitle_count: Some(subtitle_count),
                    duration_ms: Some(duration_ms),
                    saved_to: Some(path.display().to_string()),
                    error: None,
                }
            }
            Err(e) => {
                // Temp file is kept so the capture can be recovered by hand.
                warn!("could not persist recording: {e}");
                RecordingStoppedPayload {
                    success: false,
                    recording: false,
                    cue_count: Some(cue_count),
                    subtitle_count: Some(subtitle_count),
                    duration_ms: Some(duration_ms),
                    saved_to: None,
                    error: Some(e.to_string()),
                }
            }
        };

        self.mode = SessionMode::Realtime;
        self.send(Outbound::RecordingStopped(payload)).await;
    }

    async fn abort_recording(&mut self) {
        let payload = match self.recording.take() {
            Some(state) => {
                state.cleanup_temp();
                info!(
                    cues = state.cues.len(),
                    subtitles = state.subtitles.len(),
                    "subtitle recording aborted"
                );
                RecordingAbortedPayload {
                    success: true,
                    aborted: true,
                    discarded_cues: state.cues.len(),
                    discarded_subtitles: state.subtitles.len(),
                    error: None,
                }
            }
            None => RecordingAbortedPayload {
                success: false,
                aborted: false,
                discarded_cues: 0,
                discarded_subtitles: 0,
                error: Some("Not recording".into()),
            },
        };
        if payload.success {
            self.mode = SessionMode::Realtime;
        }
        self.send(Outbound::RecordingAborted(payload)).await;
    }

    async fn pause_recording(&mut self) {
        let payload = match self.recording.as_mut() {
            Some(state) => {
                state.paused = true;
                RecordingPausedPayload {
                    success: true,
                    paused: true,
                    cue_count: state.cues.len(),
                    position_ms: self.last_position_ms,
                    error: None,
                }
            }
            None => RecordingPausedPayload {
                success: false,
                paused: false,
                cue_count: 0,
                position_ms: self.last_position_ms,
                error: Some("Not recording".into()),
            },
        };
        self.send(Outbound::RecordingPaused(payload)).await;
    }

    async fn resume_recording(&mut self, position_ms: i64) {
        let payload = match self.recording.as_mut() {
            Some(state) => {
                state.paused = false;
                if state.cues.is_empty() {
                    state.reanchor(position_ms);
                }
                self.mode = SessionMode::Recording;
                RecordingResumedPayload {
                    success: true,
                    resumed: true,
                    existing_cues: state.cues.len(),
                    position_ms,
                    error: None,
                }
            }
            None => RecordingResumedPayload {
                success: false,
                resumed: false,
                existing_cues: 0,
                position_ms,
                error: Some("Not recording".into()),
            },
        };
        self.send(Outbound::RecordingResumed(payload)).await;
    }

    async fn recording_status(&mut self) {
        let payload = match self.recording.as_ref() {
            Some(state) => RecordingStatusPayload {
                recording: !state.paused,
                cue_count: state.cues.len(),
                title: Some(state.title.clone()),
                elapsed_ms: Some(self.last_position_ms - state.start_position_ms),
                start_position_ms: Some(state.start_position_ms),
                current_position_ms: Some(self.last_position_ms),
                paused: Some(state.paused),
            },
            None => RecordingStatusPayload {
                recording: false,
                cue_count: 0,
                title: None,
                elapsed_ms: None,
                start_position_ms: None,
                current_position_ms: None,
                paused: None,
            },
        };
        self.send(Outbound::RecordingStatus(payload)).await;
    }

    // ── Precision recording ──────────────────────────────────────────────

    async fn start_precision_recording(&mut self, payload: StartPrecisionPayload) {
        let recorder = Arc::clone(&self.manager.recorder);
        let config = PrecisionConfig {
            use_virtual_cable: payload.use_virtual_cable,
            whisper_model: payload.whisper_model,
            playback_speed: payload.playback_speed,
            video_start_position_ms: payload.video_start_position_ms,
            ..PrecisionConfig::default()
        };
        let title = payload.title;
        let content_id = if payload.content_id.is_empty() {
            self.content_id.clone().unwrap_or_else(|| "unknown".into())
        } else {
            payload.content_id
        };

        let result = tokio::task::spawn_blocking(move || {
            recorder.start(&title, &content_id, config)
        })
        .await;

        let payload = match result {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                // Structured failure: name what is missing.
                let instructions = self.manager.recorder.check_requirements().instructions;
                PrecisionStartedPayload {
                    success: false,
                    recording_id: None,
                    title: None,
                    whisper_model: None,
                    error: Some(e.to_string()),
                    instructions,
                }
            }
            Err(e) => PrecisionStartedPayload {
                success: false,
                recording_id: None,
                title: None,
                whisper_model: None,
                error: Some(e.to_string()),
                instructions: Vec::new(),
            },
        };

        if payload.success {
            self.owned_precision_id = payload.recording_id.clone();
        }
        self.send(Outbound::PrecisionRecordingStarted(payload)).await;
    }

    async fn stop_precision_recording(&mut self, recording_id: Option<String>) {
        let recorder = Arc::clone(&self.manager.recorder);
        let result = tokio::task::spawn_blocking(move || {
            recorder.stop(recording_id.as_deref())
        })
        .await;

        let payload = match result {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => PrecisionStoppedPayload {
                success: false,
                recording_id: None,
                cue_file: None,
                cue_count: None,
                word_count: None,
                duration_ms: None,
                audio_path: None,
                error: Some(e.to_string()),
            },
            Err(e) => PrecisionStoppedPayload {
                success: false,
                recording_id: None,
                cue_file: None,
                cue_count: None,
                word_count: None,
                duration_ms: None,
                audio_path: None,
                error: Some(e.to_string()),
            },
        };

        self.owned_precision_id = None;
        self.send(Outbound::PrecisionRecordingStopped(payload)).await;
    }

    // ── Plumbing ─────────────────────────────────────────────────────────

    /// Send with a supervisory warning when the channel stays blocked.
    /// A closed channel only costs the event — the session itself ends when
    /// the inbound side closes.
    async fn send(&self, message: Outbound) {
        let send_fut = self.outbound.send(message);
        tokio::pin!(send_fut);
        let mut warned = false;
        loop {
            tokio::select! {
                result = &mut send_fut => {
                    if result.is_err() {
                        warn!(session = self.id.as_str(), "client channel closed — event dropped");
                    }
                    return;
                }
                _ = tokio::time::sleep(SEND_WARN_AFTER), if !warned => {
                    warned = true;
                    warn!(session = self.id.as_str(), "client channel send not drained after 30s");
                }
            }
        }
    }

    async fn teardown(&mut self) {
        // Stop any live capture owned by this session.
        self.fingerprint_task = None;

        if let Some(id) = self.owned_precision_id.take() {
            let recorder = Arc::clone(&self.manager.recorder);
            let _ = tokio::task::spawn_blocking(move || recorder.abort(Some(&id))).await;
        }

        if let Some(state) = self.recording.take() {
            // Disconnect mid-recording: temp save stays for recovery.
            warn!(
                session = self.id.as_str(),
                cues = state.cues.len(),
                "session ended while recording — temp save retained"
            );
        }

        self.manager.remove_session(&self.id);
    }
}

/// Map a detection's fractional span inside a subtitle interval to a cue
/// interval with asymmetric padding and a minimum duration.
fn subtitle_cue_interval(
    start_ms: i64,
    end_ms: i64,
    position_start: f64,
    position_end: f64,
    config: &SessionConfig,
) -> (i64, i64) {
    let span = (end_ms - start_ms).max(0) as f64;
    let word_start = start_ms + (span * position_start).round() as i64;
    let word_end = start_ms + (span * position_end).round() as i64;

    let mut cue_start = (word_start - config.pad_before_ms).max(0);
    let mut cue_end = word_end + config.pad_after_ms;

    if cue_end - cue_start < config.min_cue_duration_ms {
        let mid = (word_start + word_end) / 2;
        cue_start = (mid - config.min_cue_duration_ms / 2).max(0);
        cue_end = cue_start + config.min_cue_duration_ms;
    }

    (cue_start, cue_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cue_interval_applies_asymmetric_padding() {
        let config = SessionConfig::default();
        // Word spans 9/26..13/26 of a 2 s subtitle starting at 10 000 ms.
        let (start, end) =
            subtitle_cue_interval(10_000, 12_000, 9.0 / 26.0, 13.0 / 26.0, &config);
        let word_start = 10_000 + (2000.0 * 9.0 / 26.0_f64).round() as i64;
        let word_end = 10_000 + (2000.0 * 13.0 / 26.0_f64).round() as i64;
        assert_eq!(start, word_start - 400);
        assert_eq!(end, word_end + 150);
        assert!(end - start >= 400);
    }

    #[test]
    fn cue_interval_clamps_start_to_zero() {
        let config = SessionConfig::default();
        let (start, _) = subtitle_cue_interval(0, 1000, 0.0, 0.2, &config);
        assert_eq!(start, 0);
    }

    #[test]
    fn cue_interval_enforces_minimum_duration() {
        let mut config = SessionConfig::default();
        config.pad_before_ms = 0;
        config.pad_after_ms = 0;
        // 100 ms word with no padding: centred to the 400 ms minimum.
        let (start, end) = subtitle_cue_interval(10_000, 11_000, 0.4, 0.5, &config);
        assert_eq!(end - start, 400);
        let mid = (10_400 + 10_500) / 2;
        assert_eq!(start, mid - 200);
    }

    #[test]
    fn zero_length_subtitle_interval_still_produces_a_cue() {
        let config = SessionConfig::default();
        let (start, end) = subtitle_cue_interval(5000, 5000, 0.2, 0.4, &config);
        assert!(end > start);
        assert!(end - start >= config.min_cue_duration_ms);
    }
}
