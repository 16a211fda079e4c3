//! Application callbacks for one session.
//!
//! Callbacks run on the session's worker. A returned error or a panic is routed to
//! [`Listener::on_exception`] of the same listener; the connection keeps running.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, warn};

use crate::session::Session;

pub trait Listener: Send + Sync + 'static {
    fn on_connected(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// One complete message, or the bytes available so far in stream mode.
    fn on_receive(&self, session: &Session, message: Vec<u8>) -> anyhow::Result<()>;

    fn on_exception(&self, session: &Session, error: anyhow::Error) {
        warn!(session = session.id(), conv = session.conv(), error = %error, "listener error");
    }

    fn on_closed(&self, _session: &Session) {}
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic"
    }
}

/// Run one callback, routing failure to `on_exception`.
pub(crate) fn guarded(
    listener: &dyn Listener,
    session: &Session,
    call: impl FnOnce() -> anyhow::Result<()>,
) {
    let err = match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(payload) => anyhow::anyhow!("listener panicked: {}", panic_message(payload.as_ref())),
    };
    report(listener, session, err);
}

pub(crate) fn report(listener: &dyn Listener, session: &Session, err: anyhow::Error) {
    let handled = panic::catch_unwind(AssertUnwindSafe(|| listener.on_exception(session, err)));
    if handled.is_err() {
        error!(session = session.id(), "on_exception panicked");
    }
}

pub(crate) fn closed(listener: &dyn Listener, session: &Session) {
    if panic::catch_unwind(AssertUnwindSafe(|| listener.on_closed(session))).is_err() {
        error!(session = session.id(), "on_closed panicked");
    }
}
