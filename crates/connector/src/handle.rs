use gateway_core::*;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub(crate) type Completion = oneshot::Sender<Result<Order, GatewayError>>;

fn resolve(
    polled: Poll<Result<Result<Order, GatewayError>, oneshot::error::RecvError>>,
) -> Poll<Result<Order, GatewayError>> {
    polled.map(|received| {
        received.unwrap_or_else(|_| {
            Err(GatewayError::Cancelled(
                "order tracker released the operation".to_string(),
            ))
        })
    })
}

/// Pending acknowledgement of a submitted order.
///
/// Resolves exactly once: with the acknowledged order, or with
/// `OrderRejected`, `Timeout`, or `Cancelled`. Later transitions of the
/// order (fills, cancels) arrive through order update listeners.
#[derive(Debug)]
pub struct OrderHandle {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Result<Order, GatewayError>>,
}

impl OrderHandle {
    pub(crate) fn new(correlation_id: CorrelationId) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        (Self { correlation_id, rx }, tx)
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

impl Future for OrderHandle {
    type Output = Result<Order, GatewayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        resolve(Pin::new(&mut self.rx).poll(cx))
    }
}

/// What a pending action asked the venue to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Amend,
    Cancel,
}

/// Pending outcome of a modify or cancel request.
///
/// Resolves with the order as it stands once the venue confirmed the
/// change, or with an error if the venue refused it, the order finished
/// first, or the connector went away.
#[derive(Debug)]
pub struct ActionHandle {
    correlation_id: CorrelationId,
    kind: ActionKind,
    rx: oneshot::Receiver<Result<Order, GatewayError>>,
}

impl ActionHandle {
    pub(crate) fn new(correlation_id: CorrelationId, kind: ActionKind) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                correlation_id,
                kind,
                rx,
            },
            tx,
        )
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }
}

impl Future for ActionHandle {
    type Output = Result<Order, GatewayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        resolve(Pin::new(&mut self.rx).poll(cx))
    }
}
