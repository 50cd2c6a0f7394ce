//! Retry loop around a backend.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use burrow_core::{Backoff, View};
use burrow_tunnel::Backend;

/// Run `backend` until its stop signal fires.
///
/// Every session end is followed by a backoff delay: a failed or panicking
/// session keeps growing the delay, a session that ended on its own resets
/// it. Stopping interrupts both the session and the delay.
pub async fn supervise(backend: Arc<dyn Backend>, backoff: Backoff, view: Arc<dyn View>) {
    let stop = backend.stop_signal().clone();
    let name = backend.name().to_string();
    let kind = backend.kind();

    while !stop.is_fired() {
        let session = AssertUnwindSafe(backend.forward()).catch_unwind();
        let res = tokio::select! {
            res = session => res,
            _ = stop.wait() => break,
        };

        let delay = match res {
            Ok(Ok(())) => {
                if stop.is_fired() {
                    break;
                }
                view.info(&format!("Forward '{}' ({}) disconnected, reconnecting", name, kind));
                backoff.reset();
                backoff.duration()
            }
            Ok(Err(e)) => {
                let delay = backoff.duration();
                view.error(&format!(
                    "Forward '{}' ({}) failed: {}, retrying in {:?}",
                    name, kind, e, delay
                ));
                delay
            }
            Err(panic) => {
                view.error(&format!(
                    "Forward '{}' ({}) panicked: {}",
                    name,
                    kind,
                    panic_message(panic.as_ref())
                ));
                backend.reset();
                backoff.duration()
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.wait() => break,
        }
    }

    log::debug!("[forward]{} ({}) supervisor exits", name, kind);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
