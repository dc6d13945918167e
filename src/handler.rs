//! Event handler trait invoked by bus subscription loops

use crate::error::Result;
use crate::types::ReceivedEnvelope;
use async_trait::async_trait;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;

/// Processes one delivered envelope
///
/// The returned error decides the envelope's fate: `Ok` acks it, a
/// non-retryable error discards it, a retryable error requests
/// redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, received: &ReceivedEnvelope) -> Result<()>;
}

/// Adapter turning an async closure into an `EventHandler`
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(ReceivedEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(ReceivedEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, received: &ReceivedEnvelope) -> Result<()> {
        (self.f)(received.clone()).await
    }
}

/// Text carried by a caught panic payload
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fn_handler_invokes_closure() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = FnHandler::new(move |received: ReceivedEnvelope| {
            let counter = counter.clone();
            async move {
                assert_eq!(received.envelope.topic, "check-results");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let received = ReceivedEnvelope {
            envelope: Envelope::new("check-results", serde_json::json!({})),
            sequence: 1,
            num_delivered: 1,
            stream: "test".to_string(),
        };
        handler.handle(&received).await.unwrap();
        handler.handle(&received).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let caught = std::panic::catch_unwind(|| panic!("bad index {}", 3)).unwrap_err();
        assert_eq!(panic_message(caught), "bad index 3");

        let caught = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(caught), "static text");
    }
}
