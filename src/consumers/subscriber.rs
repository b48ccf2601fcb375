use crate::amqp::DeliveryStream;
use crate::consumers::{BrokerAction, Delivery, Handler};
use futures_util::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A receive loop attached to one delivery stream of a [`Consumer`](super::Consumer).
///
/// Deliveries are processed one at a time. A subscriber keeps running until its stop signal
/// fires, even if its delivery stream ends or fails: in that case it sits idle until the
/// consumer tears everything down.
pub struct Subscriber {
    name: String,
    stop: oneshot::Sender<()>,
}

impl Subscriber {
    pub(super) fn spawn(
        name: String,
        deliveries: DeliveryStream,
        handler: Arc<dyn Handler>,
        reject_penalty: Duration,
    ) -> Self {
        let (stop, stopped) = oneshot::channel();
        let receive_loop = ReceiveLoop {
            name: name.clone(),
            handler,
            reject_penalty,
        };
        tokio::spawn(receive_loop.run(deliveries, stopped));
        Self { name, stop }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the receive loop to exit once the delivery in flight, if any, has been settled.
    pub(super) fn stop(self) {
        let _ = self.stop.send(());
    }
}

struct ReceiveLoop {
    name: String,
    handler: Arc<dyn Handler>,
    reject_penalty: Duration,
}

impl ReceiveLoop {
    #[tracing::instrument(name = "subscriber_run", skip_all, fields(subscriber = %self.name))]
    async fn run(self, mut deliveries: DeliveryStream, mut stopped: oneshot::Receiver<()>) {
        loop {
            let next = tokio::select! {
                biased;

                _ = &mut stopped => break,
                next = deliveries.next() => next,
            };
            match next {
                Some(Ok(delivery)) => {
                    let action = self.process(&delivery).await;
                    settle(&delivery, action).await;
                }
                Some(Err(e)) => {
                    tracing::error!(error = ?e, "Delivery stream failed, waiting to be stopped");
                    let _ = stopped.await;
                    break;
                }
                None => {
                    tracing::info!("Delivery stream ended, waiting to be stopped");
                    let _ = stopped.await;
                    break;
                }
            }
        }
        tracing::debug!("Subscriber exited");
    }

    /// Run the handler, containing any panic it raises.
    ///
    /// A panicking handler costs a penalty delay, then the message goes back to the queue.
    #[tracing::instrument(
        name = "process_message",
        level = "debug",
        skip_all,
        fields(delivery_tag = delivery.delivery_tag)
    )]
    async fn process(&self, delivery: &Delivery) -> BrokerAction {
        match AssertUnwindSafe(self.handler.handle(delivery))
            .catch_unwind()
            .await
        {
            Ok(action) => action,
            Err(panic) => {
                tracing::error!(
                    panic = panic_message(panic.as_ref()),
                    penalty = ?self.reject_penalty,
                    "Message handler panicked, the message will be requeued"
                );
                tokio::time::sleep(self.reject_penalty).await;
                BrokerAction::RejectAndRequeue
            }
        }
    }
}

async fn settle(delivery: &Delivery, action: BrokerAction) {
    let outcome = match action {
        BrokerAction::Acknowledge => delivery.acker().ack().await,
        BrokerAction::RejectAndRequeue => delivery.acker().reject(true).await,
    };
    if let Err(e) = outcome {
        tracing::error!(
            error = ?e,
            delivery_tag = delivery.delivery_tag,
            ?action,
            "Failed to settle the message with the broker"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}
