use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use courier_messaging::{DeliveryHandler, Envelope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::broker::State;

/// A message assigned to a consumer, waiting for the dispatch task.
pub struct Dispatch {
    pub destination: String,
    pub consumer_tag: String,
    pub handler: Arc<dyn DeliveryHandler>,
    pub envelope: Envelope,
}

/// Runs every delivery of one broker, one at a time, in enqueue order.
pub async fn run(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    state: Weak<State>,
    shutdown_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown_token.cancelled() => {
                debug!("shutdown token cancelled, exiting dispatch loop");
                break;
            }
            next = rx.recv() => {
                let Some(dispatch) = next else {
                    debug!("dispatch channel closed, exiting dispatch loop");
                    break;
                };

                let Some(state) = state.upgrade() else {
                    break;
                };
                if !state.is_subscribed(&dispatch.destination, &dispatch.consumer_tag) {
                    debug!(
                        consumer_tag = %dispatch.consumer_tag,
                        "subscription cancelled before delivery, dropping message"
                    );
                    continue;
                }
                drop(state);

                deliver(dispatch);
            }
        }
    }
}

fn deliver(dispatch: Dispatch) {
    let Dispatch {
        consumer_tag,
        handler,
        envelope,
        ..
    } = dispatch;

    match catch_unwind(AssertUnwindSafe(|| handler.handle_delivery(envelope))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(%consumer_tag, "delivery handler failed: {e}"),
        Err(_) => error!(%consumer_tag, "delivery handler panicked"),
    }
}
