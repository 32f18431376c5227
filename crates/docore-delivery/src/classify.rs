//! Failure classification.
//!
//! A classifier maps a handler failure to [`FailureKind::Retryable`] or
//! [`FailureKind::Terminal`]. Terminal failures skip whatever retry budget is
//! left and go straight to the dead-letter destination.

use std::{collections::HashSet, fmt, str::FromStr};

use docore_core::{headers, Message};

use crate::error::{DeliveryError, ErrorCategory};

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Another attempt may succeed.
    Retryable,
    /// No attempt will ever succeed.
    Terminal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => f.write_str("retryable"),
            Self::Terminal => f.write_str("terminal"),
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(Self::Retryable),
            "terminal" => Ok(Self::Terminal),
            other => Err(format!("unknown failure kind '{other}'")),
        }
    }
}

/// Maps delivery errors to retry semantics.
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    /// Classifies one failed attempt.
    fn classify(&self, error: &DeliveryError) -> FailureKind;
}

/// Categories that are terminal no matter how the classifier is configured.
const BASE_TERMINAL: [ErrorCategory; 3] =
    [ErrorCategory::MalformedMessage, ErrorCategory::InvalidArgument, ErrorCategory::MissingField];

/// Classifier backed by a set of terminal categories.
///
/// Starts from the malformed, invalid-argument and missing-field categories.
/// More categories can be added; none of the base ones can be removed.
#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    terminal: HashSet<ErrorCategory>,
}

impl DefaultClassifier {
    /// Creates a classifier with the base terminal set.
    pub fn new() -> Self {
        Self { terminal: BASE_TERMINAL.into_iter().collect() }
    }

    /// Treats `category` as terminal as well.
    #[must_use]
    pub fn with_terminal_category(mut self, category: ErrorCategory) -> Self {
        self.terminal.insert(category);
        self
    }

    /// Whether `category` is in the terminal set.
    pub fn is_terminal(&self, category: ErrorCategory) -> bool {
        self.terminal.contains(&category)
    }
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, error: &DeliveryError) -> FailureKind {
        if self.is_terminal(ErrorCategory::from(error)) {
            FailureKind::Terminal
        } else {
            FailureKind::Retryable
        }
    }
}

/// Failure metadata attached to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Classification of the last failure.
    pub kind: FailureKind,
    /// Failure category name, e.g. `MalformedMessage`.
    pub reason: String,
    /// Rendered error chain of the last failure.
    pub stack_trace: String,
}

impl ErrorInfo {
    /// Builds the metadata for `error` as classified by `kind`.
    pub fn from_error(error: &DeliveryError, kind: FailureKind) -> Self {
        Self {
            kind,
            reason: ErrorCategory::from(error).to_string(),
            stack_trace: render_chain(error),
        }
    }

    /// Reads the metadata back from dead-letter headers.
    ///
    /// Missing headers fall back to an unknown reason, an empty trace and a
    /// terminal kind.
    pub fn from_headers(message: &Message) -> Self {
        Self {
            kind: message
                .header(headers::EXCEPTION_KIND)
                .and_then(|kind| kind.parse().ok())
                .unwrap_or(FailureKind::Terminal),
            reason: message.header(headers::EXCEPTION_MESSAGE).unwrap_or("Unknown").to_string(),
            stack_trace: message.header(headers::EXCEPTION_STACKTRACE).unwrap_or_default().to_string(),
        }
    }
}

fn render_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
