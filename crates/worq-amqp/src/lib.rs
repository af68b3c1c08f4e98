//! worq-amqp
//!
//! AMQP 0.9.1 broker for worq, built on lapin.
//!
//! # Modules
//! - **config**: `AmqpConfig` (URL, exchange, prefetch) with env loading
//! - **broker**: `AmqpBroker`, lazy connection, topology, confirmed publishing
//! - **consumer**: `AmqpConsumer`, one channel per subscription
//! - **headers**: AMQP field table <-> JSON header map

pub mod broker;
pub mod config;
pub mod consumer;
mod headers;

pub use self::broker::AmqpBroker;
pub use self::config::AmqpConfig;
pub use self::consumer::AmqpConsumer;

#[cfg(test)]
mod live_tests {
    //! Needs a broker at `WORQ_AMQP_URL`; run with `--ignored`.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use worq_core::{AppBuilder, CancelScope, Context, Signature, WorqError};
    use worq_core::ports::Broker;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    #[ignore]
    async fn enqueue_then_consume_round_trip() {
        let queue = format!("worq-test-{}", uuid::Uuid::new_v4());
        let broker = Arc::new(AmqpBroker::new(AmqpConfig::from_env()));
        let app = AppBuilder::new()
            .broker(broker.clone())
            .default_queue(queue)
            .concurrency(2)
            .build()
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let done = CancelScope::new();
        let finished = done.clone();
        app.register("tasks.add", move |ctx: Context| {
            let counter = Arc::clone(&counter);
            let finished = finished.clone();
            async move {
                let (x, y): (i64, i64) = ctx.bind()?;
                assert_eq!(x + y, 12);
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    finished.cancel("all tasks seen");
                }
                Ok::<(), WorqError>(())
            }
        })
        .unwrap();

        for _ in 0..3 {
            app.enqueue(&Signature::new("tasks.add", json!([2, 10])))
                .await
                .unwrap();
        }

        let scope = app.scope().with_timeout(Duration::from_secs(30));
        let stopper = {
            let scope = scope.clone();
            tokio::spawn(async move {
                done.cancelled().await;
                scope.cancel("test finished");
            })
        };
        app.start_with(scope).await.unwrap();
        stopper.await.unwrap();
        broker.close().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
