//! Reply delivery for dispatched node requests

use tokio::sync::{mpsc, oneshot};

/// Receives the reply of one dispatched request.
///
/// `done` consumes the waiter, so each dispatched call completes it at most
/// once.
pub trait Waiter<R>: Send + 'static {
    fn done(self: Box<Self>, reply: R);
}

/// Channel waiter marshalling replies back to the owning loop. Any reply
/// convertible into the channel's item type is accepted, so one channel can
/// carry every operation kind.
impl<R, T> Waiter<R> for mpsc::UnboundedSender<T>
where
    R: Send + 'static,
    T: From<R> + Send + 'static,
{
    fn done(self: Box<Self>, reply: R) {
        // A closed receiver means the loop shut down.
        let _ = self.send(T::from(reply));
    }
}

impl<R: Send + 'static> Waiter<R> for oneshot::Sender<R> {
    fn done(self: Box<Self>, reply: R) {
        let _ = (*self).send(reply);
    }
}

/// Waiter calling a closure.
pub struct FnWaiter<F>(pub F);

impl<R, F> Waiter<R> for FnWaiter<F>
where
    F: FnOnce(R) + Send + 'static,
{
    fn done(self: Box<Self>, reply: R) {
        (self.0)(reply)
    }
}
