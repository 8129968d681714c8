//! Inbound and outbound message payloads.
//!
//! Field names follow the original wire contract: payload fields are
//! snake_case except `cueFile` on `setMode`, and type tags are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cues::catalog::CueFileInfo;
use crate::cues::CueRegion;
use crate::error::{OpenCueError, Result};

// ---------------------------------------------------------------------------
// Session mode
// ---------------------------------------------------------------------------

/// Operating mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Cues derived on-the-fly from subtitle text.
    Realtime,
    /// Cues read from a loaded cue file, dispatched by content time.
    CueFile,
    /// Cue file with realtime fallback.
    Hybrid,
    /// Subtitle-driven recording of a new cue file.
    Recording,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Realtime => "realtime",
            SessionMode::CueFile => "cue_file",
            SessionMode::Hybrid => "hybrid",
            SessionMode::Recording => "recording",
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SubtitlePayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub start_ms: i64,
    #[serde(default)]
    pub end_ms: i64,
    /// Current playback position; defaults to `start_ms` when omitted.
    #[serde(default)]
    pub position_ms: Option<i64>,
    #[serde(default)]
    pub content_id: String,
}

impl SubtitlePayload {
    pub fn position(&self) -> i64 {
        self.position_ms.unwrap_or(self.start_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Seeked,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackPayload {
    pub state: PlaybackState,
    #[serde(default)]
    pub position_ms: i64,
    #[serde(default)]
    pub content_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetModePayload {
    pub mode: SessionMode,
    #[serde(default, rename = "cueFile")]
    pub cue_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRecordingPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartPrecisionPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content_id: String,
    #[serde(default = "default_playback_speed")]
    pub playback_speed: f32,
    #[serde(default = "default_true")]
    pub use_virtual_cable: bool,
    #[serde(default = "default_whisper_model")]
    pub whisper_model: String,
    #[serde(default)]
    pub video_start_position_ms: i64,
}

fn default_playback_speed() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_whisper_model() -> String {
    "base".into()
}

/// Messages from the client, one variant per `type` tag.
#[derive(Debug, Clone)]
pub enum Inbound {
    Subtitle(SubtitlePayload),
    Playback(PlaybackPayload),
    Position { position_ms: i64 },
    SetMode(SetModePayload),
    LoadCueFile { id: String },
    ListCueFiles,
    SearchCueFiles { query: String },
    GetSessionInfo,
    StartRecording(StartRecordingPayload),
    StopRecording,
    AbortRecording,
    PauseRecording,
    ResumeRecording { position_ms: i64 },
    GetRecordingStatus,
    StartPrecisionRecording(StartPrecisionPayload),
    StopPrecisionRecording { recording_id: Option<String> },
    GetPrecisionRecordingStatus { recording_id: Option<String> },
    AbortPrecisionRecording { recording_id: Option<String> },
    CheckPrecisionRequirements,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Inbound {
    /// Parse one raw JSON envelope.
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| OpenCueError::ProtocolBadMessage(e.to_string()))?;
        let payload = if envelope.payload.is_null() {
            json!({})
        } else {
            envelope.payload
        };

        fn from<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T> {
            serde_json::from_value(payload)
                .map_err(|e| OpenCueError::ProtocolBadMessage(e.to_string()))
        }

        #[derive(Deserialize)]
        struct PositionOnly {
            #[serde(default)]
            position_ms: i64,
        }
        #[derive(Deserialize)]
        struct IdOnly {
            id: String,
        }
        #[derive(Deserialize)]
        struct QueryOnly {
            #[serde(default)]
            query: String,
        }
        #[derive(Deserialize)]
        struct RecordingIdOnly {
            #[serde(default)]
            recording_id: Option<String>,
        }

        let message = match envelope.kind.as_str() {
            "subtitle" => Inbound::Subtitle(from(payload)?),
            "playback" => Inbound::Playback(from(payload)?),
            "position" => {
                let p: PositionOnly = from(payload)?;
                Inbound::Position {
                    position_ms: p.position_ms,
                }
            }
            "setMode" => Inbound::SetMode(from(payload)?),
            "loadCueFile" => {
                let p: IdOnly = from(payload)?;
                Inbound::LoadCueFile { id: p.id }
            }
            "listCueFiles" => Inbound::ListCueFiles,
            "searchCueFiles" => {
                let p: QueryOnly = from(payload)?;
                Inbound::SearchCueFiles { query: p.query }
            }
            "getSessionInfo" => Inbound::GetSessionInfo,
            "startRecording" => Inbound::StartRecording(from(payload)?),
            "stopRecording" => Inbound::StopRecording,
            "abortRecording" => Inbound::AbortRecording,
            "pauseRecording" => Inbound::PauseRecording,
            "resumeRecording" => {
                let p: PositionOnly = from(payload)?;
                Inbound::ResumeRecording {
                    position_ms: p.position_ms,
                }
            }
            "getRecordingStatus" => Inbound::GetRecordingStatus,
            "startPrecisionRecording" => Inbound::StartPrecisionRecording(from(payload)?),
            "stopPrecisionRecording" => {
                let p: RecordingIdOnly = from(payload)?;
                Inbound::StopPrecisionRecording {
                    recording_id: p.recording_id,
                }
            }
            "getPrecisionRecordingStatus" => {
                let p: RecordingIdOnly = from(payload)?;
                Inbound::GetPrecisionRecordingStatus {
                    recording_id: p.recording_id,
                }
            }
            "abortPrecisionRecording" => {
                let p: RecordingIdOnly = from(payload)?;
                Inbound::AbortPrecisionRecording {
                    recording_id: p.recording_id,
                }
            }
            "checkPrecisionRequirements" => Inbound::CheckPrecisionRequirements,
            other => {
                return Err(OpenCueError::ProtocolBadMessage(format!(
                    "unknown message type: {other}"
                )))
            }
        };
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OverlayPayload {
    pub cue_id: String,
    pub action: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub category: String,
    pub matched: String,
    pub replacement: String,
    pub source: String,
    pub content_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CueEventKind {
    Start,
    End,
}

#[derive(Debug, Clone, Serialize)]
pub struct CueEventPayload {
    pub event: CueEventKind,
    pub cue_id: String,
    pub action: String,
    pub category: String,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<CueRegion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStateKind {
    Idle,
    Syncing,
    Synced,
    Lost,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatePayload {
    pub state: SyncStateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_microsignatures: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeSetPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfoPayload {
    pub session_id: String,
    pub mode: String,
    pub synced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cue_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStartedPayload {
    pub success: bool,
    pub recording: bool,
    pub title: String,
    pub start_position_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStoppedPayload {
    pub success: bool,
    pub recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cue_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingAbortedPayload {
    pub success: bool,
    pub aborted: bool,
    pub discarded_cues: usize,
    pub discarded_subtitles: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingPausedPayload {
    pub success: bool,
    pub paused: bool,
    pub cue_count: usize,
    pub position_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingResumedPayload {
    pub success: bool,
    pub resumed: bool,
    pub existing_cues: usize,
    pub position_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatusPayload {
    pub recording: bool,
    pub cue_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_position_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_position_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecisionRequirementsPayload {
    pub ready: bool,
    pub capture_available: bool,
    pub virtual_cable: bool,
    pub loopback: bool,
    pub transcriber_available: bool,
    pub instructions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecisionStartedPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whisper_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecisionStoppedPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cue_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cue_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecisionStatusPayload {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_captured: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecisionAbortedPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Messages to the client.
#[derive(Debug, Clone)]
pub enum Outbound {
    Overlay(OverlayPayload),
    CueEnd { cue_id: String },
    Cue(CueEventPayload),
    SyncState(SyncStatePayload),
    ModeSet(ModeSetPayload),
    CueFileLoaded(ModeSetPayload),
    CueFileList { files: Vec<CueFileInfo> },
    CueFileSearchResults { query: String, files: Vec<CueFileInfo> },
    SessionInfo(SessionInfoPayload),
    RecordingStarted(RecordingStartedPayload),
    RecordingStopped(RecordingStoppedPayload),
    RecordingAborted(RecordingAbortedPayload),
    RecordingPaused(RecordingPausedPayload),
    RecordingResumed(RecordingResumedPayload),
    RecordingStatus(RecordingStatusPayload),
    PrecisionRequirements(PrecisionRequirementsPayload),
    PrecisionRecordingStarted(PrecisionStartedPayload),
    PrecisionRecordingStopped(PrecisionStoppedPayload),
    PrecisionRecordingStatus(PrecisionStatusPayload),
    PrecisionRecordingAborted(PrecisionAbortedPayload),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Overlay(_) => "overlay",
            Outbound::CueEnd { .. } => "cueEnd",
            Outbound::Cue(_) => "cue",
            Outbound::SyncState(_) => "syncState",
            Outbound::ModeSet(_) => "modeSet",
            Outbound::CueFileLoaded(_) => "cueFileLoaded",
            Outbound::CueFileList { .. } => "cueFileList",
            Outbound::CueFileSearchResults { .. } => "cueFileSearchResults",
            Outbound::SessionInfo(_) => "sessionInfo",
            Outbound::RecordingStarted(_) => "recordingStarted",
            Outbound::RecordingStopped(_) => "recordingStopped",
            Outbound::RecordingAborted(_) => "recordingAborted",
            Outbound::RecordingPaused(_) => "recordingPaused",
            Outbound::RecordingResumed(_) => "recordingResumed",
            Outbound::RecordingStatus(_) => "recordingStatus",
            Outbound::PrecisionRequirements(_) => "precisionRequirements",
            Outbound::PrecisionRecordingStarted(_) => "precisionRecordingStarted",
            Outbound::PrecisionRecordingStopped(_) => "precisionRecordingStopped",
            Outbound::PrecisionRecordingStatus(_) => "precisionRecordingStatus",
            Outbound::PrecisionRecordingAborted(_) => "precisionRecordingAborted",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Outbound::Overlay(p) => to_value(p),
            Outbound::CueEnd { cue_id } => json!({ "cue_id": cue_id }),
            Outbound::Cue(p) => to_value(p),
            Outbound::SyncState(p) => to_value(p),
            Outbound::ModeSet(p) | Outbound::CueFileLoaded(p) => to_value(p),
            Outbound::CueFileList { files } => json!({ "files": files }),
            Outbound::CueFileSearchResults { query, files } => json!({
                "query": query,
                "files": files,
                "count": files.len(),
            }),
            Outbound::SessionInfo(p) => to_value(p),
            Outbound::RecordingStarted(p) => to_value(p),
            Outbound::RecordingStopped(p) => to_value(p),
            Outbound::RecordingAborted(p) => to_value(p),
            Outbound::RecordingPaused(p) => to_value(p),
            Outbound::RecordingResumed(p) => to_value(p),
            Outbound::RecordingStatus(p) => to_value(p),
            Outbound::PrecisionRequirements(p) => to_value(p),
            Outbound::PrecisionRecordingStarted(p) => to_value(p),
            Outbound::PrecisionRecordingStopped(p) => to_value(p),
            Outbound::PrecisionRecordingStatus(p) => to_value(p),
            Outbound::PrecisionRecordingAborted(p) => to_value(p),
        }
    }

    /// Build the wire envelope. `timestamp_ms` is stamped by the writer.
    pub fn envelope(&self, timestamp_ms: Option<i64>) -> Value {
        let mut envelope = json!({
            "type": self.kind(),
            "payload": self.payload(),
        });
        if let Some(ts) = timestamp_ms {
            envelope["timestamp"] = json!(ts);
        }
        envelope
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subtitle_with_defaulted_position() {
        let raw = r#"{"type":"subtitle","payload":{"text":"hello there","start_ms":1000,"end_ms":2500,"content_id":"x:1"}}"#;
        match Inbound::parse(raw).unwrap() {
            Inbound::Subtitle(p) => {
                assert_eq!(p.text, "hello there");
                assert_eq!(p.position(), 1000);
                assert_eq!(p.content_id, "x:1");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_set_mode_with_camel_case_cue_file() {
        let raw = r#"{"type":"setMode","payload":{"mode":"cue_file","cueFile":"some-movie"}}"#;
        match Inbound::parse(raw).unwrap() {
            Inbound::SetMode(p) => {
                assert_eq!(p.mode, SessionMode::CueFile);
                assert_eq!(p.cue_file.as_deref(), Some("some-movie"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_messages_without_payload() {
        assert!(matches!(
            Inbound::parse(r#"{"type":"listCueFiles"}"#).unwrap(),
            Inbound::ListCueFiles
        ));
        assert!(matches!(
            Inbound::parse(r#"{"type":"stopRecording","payload":{}}"#).unwrap(),
            Inbound::StopRecording
        ));
    }

    #[test]
    fn precision_start_uses_documented_defaults() {
        let raw = r#"{"type":"startPrecisionRecording","payload":{"title":"A Movie"}}"#;
        match Inbound::parse(raw).unwrap() {
            Inbound::StartPrecisionRecording(p) => {
                assert_eq!(p.playback_speed, 1.0);
                assert!(p.use_virtual_cable);
                assert_eq!(p.whisper_model, "base");
                assert_eq!(p.video_start_position_ms, 0);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        assert!(matches!(
            Inbound::parse(r#"{"type":"frobnicate","payload":{}}"#),
            Err(OpenCueError::ProtocolBadMessage(_))
        ));
        assert!(Inbound::parse("not json").is_err());
    }

    #[test]
    fn overlay_envelope_matches_wire_contract() {
        let message = Outbound::Overlay(OverlayPayload {
            cue_id: "cue_ab12cd34".into(),
            action: "mute".into(),
            start_ms: 10_468,
            end_ms: 11_367,
            category: "language.profanity.severe".into(),
            matched: "fuck".into(),
            replacement: "fudge".into(),
            source: "realtime".into(),
            content_id: "x:1".into(),
            confidence: Some(0.95),
            context_type: None,
        });

        let envelope = message.envelope(Some(1_700_000_000_000));
        assert_eq!(envelope["type"], "overlay");
        assert_eq!(envelope["payload"]["action"], "mute");
        assert_eq!(envelope["payload"]["replacement"], "fudge");
        assert_eq!(envelope["timestamp"], 1_700_000_000_000i64);
        assert!(envelope["payload"].get("context_type").is_none());
    }

    #[test]
    fn cue_end_envelope_is_minimal() {
        let envelope = Outbound::CueEnd {
            cue_id: "cue_0001".into(),
        }
        .envelope(None);
        assert_eq!(envelope["type"], "cueEnd");
        assert_eq!(envelope["payload"]["cue_id"], "cue_0001");
        assert!(envelope.get("timestamp").is_none());
    }

    #[test]
    fn sync_state_omits_absent_fields() {
        let envelope = Outbound::SyncState(SyncStatePayload {
            state: SyncStateKind::Syncing,
            mode: Some("subtitle".into()),
            offset_ms: None,
            confidence: None,
            matched: None,
            reason: Some("waiting_for_subtitles".into()),
            has_microsignatures: Some(false),
        })
        .envelope(None);
        assert_eq!(envelope["payload"]["state"], "syncing");
        assert!(envelope["payload"].get("offset_ms").is_none());
    }

    #[test]
    fn session_mode_round_trips_snake_case() {
        let json = serde_json::to_string(&SessionMode::CueFile).unwrap();
        assert_eq!(json, "\"cue_file\"");
        let back: SessionMode = serde_json::from_str("\"hybrid\"").unwrap();
        assert_eq!(back, SessionMode::Hybrid);
    }
}
