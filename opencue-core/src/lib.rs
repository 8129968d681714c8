//! # opencue-core
//!
//! Per-word timing engine for audio-visual content filtering.
//!
//! ## Architecture
//!
//! ```text
//! record:  Capture → chunk queue → sealed buffer → Transcriber
//!                                        │              │
//!                                  Fingerprints     WordTimings
//!                                        └──────┬───────┘
//!                                            CueFile
//!
//! play:    client channel → Session ─┬─ SubtitleSyncEngine
//!                                    ├─ FingerprintSyncTask (live capture)
//!                                    └─ position + offset → overlay events
//! ```
//!
//! The capture callback is zero-alloc; all heap work happens on worker
//! threads. Session logic runs as one actor task per connection.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod advisor;
pub mod audio;
pub mod cues;
pub mod error;
pub mod fingerprint;
pub mod lexicon;
pub mod microsig;
pub mod proto;
pub mod session;
pub mod transcribe;

// Convenience re-exports for downstream crates
pub use cues::catalog::CatalogManager;
pub use cues::{Cue, CueAction, CueFile};
pub use error::OpenCueError;
pub use lexicon::{Detector, Lexicon};
pub use proto::messages::{Inbound, Outbound, SessionMode};
pub use session::precision::{PrecisionConfig, PrecisionRecorder};
pub use session::{SessionConfig, SessionHandle, SessionManager};
pub use transcribe::{Transcriber, TranscriberHandle, TranscriptionResult, WordTiming};
