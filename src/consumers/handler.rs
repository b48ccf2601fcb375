use crate::consumers::Delivery;

/// What to tell the broker once a delivery has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// Processing succeeded: the message is removed from the queue.
    Acknowledge,
    /// Processing failed: the message is put back on the queue for another attempt.
    RejectAndRequeue,
}

/// Implementers of the `Handler` trait process the messages delivered to a
/// [`Consumer`](crate::consumers::Consumer)'s subscribers.
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The framework takes care of acking/rejecting the message with the broker according to the
/// returned [`BrokerAction`].
///
/// A handler that panics does not bring its subscriber down: the message is rejected and
/// requeued after a penalty delay (see [`SupervisionPolicy`](crate::consumers::SupervisionPolicy)).
///
/// # Implementers
///
/// Synchronous closures with a matching signature, `Fn(&Delivery) -> BrokerAction`, implement
/// `Handler` out of the box.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> BrokerAction;
}

#[async_trait::async_trait]
impl<F> Handler for F
where
    F: Fn(&Delivery) -> BrokerAction + Send + Sync + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> BrokerAction {
        (self)(delivery)
    }
}
