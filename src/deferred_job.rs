//! Deferred Job Coordinator
//!
//! Bridges a request/response exchange across process boundaries using the
//! pub/sub channel as the reply path, with a hard timeout. Three phases:
//!
//! ```text
//! deferred_job(hub, channel)
//!     .init(|channel| async { /* trigger the external side effect */ })
//!     .job(|message| async { /* consume the reply */ })
//!     .wait(timeout)
//! ```
//!
//! The subscription is established strictly *before* the initiator runs, so a
//! reply that arrives immediately cannot be lost, and it is removed exactly
//! once on every exit path: success, timeout, initiator error, job error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::{Result, ServiceError};
use crate::pubsub::{NotificationMessage, PubSubChannel};

/// Entry point: bind a pub/sub hub and a reply channel name.
pub fn deferred_job(hub: Arc<PubSubChannel>, channel: &str) -> DeferredJob {
    DeferredJob {
        hub,
        channel: channel.to_string(),
    }
}

pub struct DeferredJob {
    hub: Arc<PubSubChannel>,
    channel: String,
}

impl DeferredJob {
    /// Supply the side-effecting call that asks the external party to reply
    /// on `channel`.
    pub fn init<I>(self, initiator: I) -> DeferredJobWithInit<I> {
        DeferredJobWithInit {
            hub: self.hub,
            channel: self.channel,
            initiator,
        }
    }
}

pub struct DeferredJobWithInit<I> {
    hub: Arc<PubSubChannel>,
    channel: String,
    initiator: I,
}

impl<I> DeferredJobWithInit<I> {
    /// Supply the listener invoked with the received reply. Its result
    /// becomes the result of the whole deferred job.
    pub fn job<J>(self, listener: J) -> ReadyDeferredJob<I, J> {
        ReadyDeferredJob {
            hub: self.hub,
            channel: self.channel,
            initiator: self.initiator,
            listener,
        }
    }
}

pub struct ReadyDeferredJob<I, J> {
    hub: Arc<PubSubChannel>,
    channel: String,
    initiator: I,
    listener: J,
}

impl<I, IFut, J, JFut, T> ReadyDeferredJob<I, J>
where
    I: FnOnce(String) -> IFut,
    IFut: Future<Output = Result<()>>,
    J: FnOnce(NotificationMessage) -> JFut,
    JFut: Future<Output = Result<T>>,
{
    /// Run the protocol: subscribe, trigger, await one reply or the timeout.
    pub async fn wait(self, timeout: Duration) -> Result<T> {
        if timeout.is_zero() {
            return Err(ServiceError::PositiveTimeoutRequired);
        }

        let Self {
            hub,
            channel,
            initiator,
            listener,
        } = self;

        // Single-shot reply slot; later messages on the channel are ignored.
        let (tx, mut rx) = mpsc::channel::<NotificationMessage>(1);
        let subscription = hub
            .subscribe(&channel, move |message| {
                let _ = tx.try_send(message);
            })
            .await?;

        let outcome = async {
            initiator(channel.clone()).await?;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(message)) => listener(message).await,
                Ok(None) => Err(ServiceError::PubSub(
                    "reply channel closed before a notification arrived".to_string(),
                )),
                Err(_) => Err(ServiceError::DeferredJobTimeout),
            }
        }
        .await;

        // Cleanup happens exactly once, before the caller observes the result.
        hub.unsubscribe(&channel, subscription);
        debug!(channel, ok = outcome.is_ok(), "deferred job settled");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::memory_channel;
    use serde_json::json;

    #[tokio::test]
    async fn test_success_path() {
        let (hub, _) = memory_channel();
        let publish_hub = hub.clone();

        let result: String = deferred_job(hub.clone(), "ch-1")
            .init(|channel: String| async move {
                publish_hub.publish(&channel, &json!({"status":"ok"})).await
            })
            .job(|message: NotificationMessage| async move { Ok(message["status"].as_str().unwrap().to_string()) })
            .wait(Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(hub.subscriber_count("ch-1"), 0);
    }

    #[tokio::test]
    async fn test_subscribe_happens_before_initiator_runs() {
        let (hub, transport) = memory_channel();
        let observer = transport.clone();

        deferred_job(hub, "ch-order")
            .init(move |channel| {
                // The transport must already hold the subscription when the
                // side effect fires.
                let subscribed = observer.subscriptions().contains(&channel);
                async move {
                    assert!(subscribed, "initiator ran before subscription");
                    Ok(())
                }
            })
            .job(|_| async { Ok(()) })
            .wait(Duration::from_millis(20))
            .await
            .unwrap_err(); // no reply published, timeout expected
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_cleans_up() {
        let (hub, _) = memory_channel();

        let err = deferred_job(hub.clone(), "ch-t")
            .init(|_| async { Ok(()) })
            .job(|_| async { Ok(()) })
            .wait(Duration::from_millis(10))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::DeferredJobTimeout));
        assert_eq!(hub.subscriber_count("ch-t"), 0);
    }

    #[tokio::test]
    async fn test_initiator_error_rejects_and_cleans_up() {
        let (hub, _) = memory_channel();

        let err = deferred_job(hub.clone(), "ch-i")
            .init(|_| async { Err(ServiceError::Outbound("als unreachable".to_string())) })
            .job(|_| async { Ok(()) })
            .wait(Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Outbound(_)));
        assert_eq!(hub.subscriber_count("ch-i"), 0);
    }

    #[tokio::test]
    async fn test_job_error_rejects_and_cleans_up() {
        let (hub, _) = memory_channel();
        let publish_hub = hub.clone();

        let err = deferred_job(hub.clone(), "ch-j")
            .init(|channel: String| async move {
                publish_hub.publish(&channel, &json!({"status":"error"})).await
            })
            .job(|_| async { Err::<(), _>(ServiceError::AuthorizationFailed) })
            .wait(Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::AuthorizationFailed));
        assert_eq!(hub.subscriber_count("ch-j"), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let (hub, _) = memory_channel();
        let err = deferred_job(hub, "ch-z")
            .init(|_| async { Ok(()) })
            .job(|_| async { Ok(()) })
            .wait(Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PositiveTimeoutRequired));
    }

    #[tokio::test]
    async fn test_concurrent_jobs_on_same_channel_are_independent() {
        let (hub, _) = memory_channel();

        let first = deferred_job(hub.clone(), "ch-c")
            .init(|_| async { Ok(()) })
            .job(|m: NotificationMessage| async move { Ok(m["n"].as_u64().unwrap()) });
        let second = deferred_job(hub.clone(), "ch-c")
            .init(|_| async { Ok(()) })
            .job(|m: NotificationMessage| async move { Ok(m["n"].as_u64().unwrap()) });

        let publish_hub = hub.clone();
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publish_hub.publish("ch-c", &json!({"n": 7})).await.unwrap();
        });

        let (a, b) = tokio::join!(
            first.wait(Duration::from_secs(1)),
            second.wait(Duration::from_secs(1))
        );
        publisher.await.unwrap();

        // Both invocations own their own subscription and both observe the
        // broadcast.
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(hub.subscriber_count("ch-c"), 0);
    }
}
