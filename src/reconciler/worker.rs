//! Background consumer of the entitlement source.
//!
//! The worker owns the source subscription. It connects, applies a replay,
//! then applies streamed messages until the stream ends, at which point it
//! backs off and reconnects. The last known tier is kept throughout.
//!
//! Shutdown is signalled by dropping the shutdown sender; every blocking wait
//! selects on it, so backoff timers die with the subscription.

use super::ReconcilerCore;
use crate::config::BackoffPolicy;
use crate::error::{GateError, Result};
use crate::source::{EntitlementSource, SourceMessage};
use crate::types::EntitlementEvent;
use chrono::Utc;
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Why the message pump returned.
enum PumpExit {
    Shutdown,
    Disconnected(String),
}

pub(crate) struct Worker {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        core: Arc<ReconcilerCore>,
        source: Arc<dyn EntitlementSource>,
        backoff: BackoffPolicy,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("entitlement-reconciler".into())
            .spawn(move || run(&core, source.as_ref(), &backoff, &shutdown_rx))
            .map_err(GateError::Io)?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Cancel the subscription and any pending reconnect, then wait for exit.
    pub(crate) fn stop(mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("entitlement worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    core: &ReconcilerCore,
    source: &dyn EntitlementSource,
    backoff: &BackoffPolicy,
    shutdown: &Receiver<()>,
) {
    let mut attempt = 0u32;

    loop {
        match connect(core, source) {
            Ok(stream) => {
                attempt = 0;
                core.set_connected(true);
                let exit = pump(core, &stream, shutdown);
                core.set_connected(false);
                match exit {
                    PumpExit::Shutdown => break,
                    PumpExit::Disconnected(reason) => {
                        warn!(%reason, tier = %core.tier.current(), "entitlement stream lost, keeping last known tier");
                    }
                }
            }
            Err(e) => {
                let failures = core.record_failure();
                warn!(error = %e, failures, tier = %core.tier.current(), "entitlement source unavailable");
            }
        }

        let delay = backoff.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        debug!(?delay, attempt, "scheduling entitlement reconnect");

        select! {
            recv(shutdown) -> _ => break,
            recv(after(delay)) -> _ => {}
        }
    }

    debug!("entitlement worker stopped");
}

/// Subscribe first, then replay, so nothing between the two is missed.
///
/// Events queued on the stream before the replay was requested are already
/// reflected in it; the replay is applied as of that instant so they are
/// treated as stale when the pump reaches them.
fn connect(core: &ReconcilerCore, source: &dyn EntitlementSource) -> Result<Receiver<SourceMessage>> {
    let stream = source.subscribe()?;
    let as_of = Utc::now();
    let snapshot = source.current_entitlements()?;
    info!(entitlements = snapshot.len(), queued = stream.len(), "entitlement replay received");
    core.apply_snapshot(&snapshot, Some(as_of));
    Ok(stream)
}

fn pump(core: &ReconcilerCore, stream: &Receiver<SourceMessage>, shutdown: &Receiver<()>) -> PumpExit {
    loop {
        select! {
            recv(shutdown) -> _ => return PumpExit::Shutdown,
            recv(stream) -> msg => match msg {
                Ok(SourceMessage::Event(event)) => {
                    core.apply_event(&event);
                }
                Ok(SourceMessage::Encoded(bytes)) => match EntitlementEvent::from_json(&bytes) {
                    Ok(event) => {
                        core.apply_event(&event);
                    }
                    Err(e) => {
                        core.record_malformed();
                        warn!(error = %e, bytes = bytes.len(), "dropping malformed entitlement event");
                    }
                },
                Ok(SourceMessage::Snapshot(events)) => {
                    info!(entitlements = events.len(), "entitlement restore received");
                    core.apply_snapshot(&events, None);
                }
                Ok(SourceMessage::Disconnected(reason)) => return PumpExit::Disconnected(reason),
                Err(_) => return PumpExit::Disconnected("stream closed".into()),
            },
        }
    }
}
