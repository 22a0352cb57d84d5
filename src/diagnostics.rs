//! Ordered diagnostic log and structured validation warnings.
//!
//! Every entry is forwarded to the `log` facade as it is recorded, and kept in
//! order so callers can inspect the info/warning/error streams after a run.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    /// Pipeline stage or component that produced the entry
    pub source: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiagnosticLog {
    entries: Vec<LogEntry>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, source: &str, message: impl Into<String>) {
        let message = message.into();
        log::info!("[{}] {}", source, message);
        self.push(LogLevel::Info, source, message);
    }

    pub fn warn(&mut self, source: &str, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[{}] {}", source, message);
        self.push(LogLevel::Warning, source, message);
    }

    pub fn error(&mut self, source: &str, message: impl Into<String>) {
        let message = message.into();
        log::error!("[{}] {}", source, message);
        self.push(LogLevel::Error, source, message);
    }

    /// Record a validation advisory as a warning entry.
    pub fn advisory(&mut self, source: &str, warning: &ValidationWarning) {
        self.warn(source, warning.to_string());
    }

    fn push(&mut self, level: LogLevel, source: &str, message: String) {
        self.entries.push(LogEntry {
            level,
            source: source.to_string(),
            message,
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn with_level(&self, level: LogLevel) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.level == level)
    }

    pub fn infos(&self) -> impl Iterator<Item = &LogEntry> {
        self.with_level(LogLevel::Info)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &LogEntry> {
        self.with_level(LogLevel::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &LogEntry> {
        self.with_level(LogLevel::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }
}

/// Category of a parameter advisory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    DisconnectedRoadRisk,
    CrossSectionSpacing,
    MaskExtensionMargin,
    SteepSlope,
    SideSlopeUnreachable,
    NarrowRoad,
    HighFilterOrder,
    EvenWindowSize,
    JunctionBlendDistance,
    UnreachableMaterial,
    DegradedGeoMode,
}

impl std::fmt::Display for WarningKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::DisconnectedRoadRisk => "Disconnected Road Risk",
            Self::CrossSectionSpacing => "Cross-Section Spacing Too Large",
            Self::MaskExtensionMargin => "Insufficient Mask Extension",
            Self::SteepSlope => "Steep Slope",
            Self::SideSlopeUnreachable => "Side Slope Unreachable",
            Self::NarrowRoad => "Narrow Road",
            Self::HighFilterOrder => "High Filter Order",
            Self::EvenWindowSize => "Even Window Size",
            Self::JunctionBlendDistance => "Short Junction Blend",
            Self::UnreachableMaterial => "Unreachable Material",
            Self::DegradedGeoMode => "Geographic Features Unavailable",
        };
        write!(f, "{}", label)
    }
}

/// A non-blocking advisory about a risky parameter combination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub kind: WarningKind,
    pub message: String,
    pub recommendation: String,
}

impl ValidationWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recommendation: recommendation.into(),
        }
    }
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.kind, self.message, self.recommendation)
    }
}
