//! Error policy and per-request context.

use crate::error::{SessionError, SessionResult, Severity};
use crate::locking::LockMarker;
use tracing::{error, warn};

/// State carried through one request/response cycle.
///
/// Created by the transport layer for each request, handed to every store
/// operation, and dropped when the response has been sent.
#[derive(Debug, Default)]
pub struct RequestContext {
    new_session: bool,
    initial_data: Option<Vec<u8>>,
    lock: Option<LockMarker>,
    errors: Vec<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the current identifier has no record yet.
    pub fn is_new_session(&self) -> bool {
        self.new_session
    }

    pub(crate) fn mark_new_session(&mut self) {
        self.new_session = true;
    }

    pub(crate) fn clear_new_session(&mut self) {
        self.new_session = false;
    }

    /// Raw payload as read from the table during this request.
    pub fn initial_data(&self) -> Option<&[u8]> {
        self.initial_data.as_deref()
    }

    pub(crate) fn set_initial_data(&mut self, data: Option<Vec<u8>>) {
        self.initial_data = data;
    }

    /// Lock held on behalf of this request, if any.
    pub fn lock(&self) -> Option<LockMarker> {
        self.lock
    }

    pub(crate) fn set_lock(&mut self, lock: Option<LockMarker>) {
        self.lock = lock;
    }

    pub(crate) fn take_lock(&mut self) -> Option<LockMarker> {
        self.lock.take()
    }

    /// Write a line to the operator error channel.
    pub fn report(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Everything reported so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

/// Decides what happens to an error raised by a store operation.
///
/// Returning `Ok(())` means the error was fully handled and the operation
/// degrades gracefully (empty session on read, nothing persisted on write).
/// Returning `Err` propagates it to the caller.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, error: SessionError, ctx: &mut RequestContext) -> SessionResult<()>;
}

/// Propagates hard errors, and soft ones too when `raise_errors` is set;
/// everything else is written to the request's error channel.
#[derive(Debug, Clone, Default)]
pub struct DefaultErrorHandler {
    raise_errors: bool,
}

impl DefaultErrorHandler {
    pub fn new(raise_errors: bool) -> Self {
        Self { raise_errors }
    }

    /// Text written to the error channel for a swallowed error.
    pub fn error_string(error: &SessionError) -> String {
        let mut out = format!("Exception occurred: {}", error);
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            out.push_str(&format!("\n  caused by: {}", cause));
            source = cause.source();
        }
        out
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn handle_error(&self, error: SessionError, ctx: &mut RequestContext) -> SessionResult<()> {
        if self.raise_errors || error.severity() == Severity::Hard {
            if error.is_hard() {
                error!(error = %error, "Session store error");
            }
            return Err(error);
        }

        warn!(error = %error, "Session store error swallowed");
        ctx.report(Self::error_string(&error));
        Ok(())
    }
}
