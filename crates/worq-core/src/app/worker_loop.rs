//! WorkerPool - N 個の worker、worker ごとに consumer を一つ
//!
//! # フロー（worker ごと）
//! 1. `Broker::consume` で default queue の consumer を開く
//! 2. `Consumer::next` で次の delivery へ進む
//! 3. `App::consumer_on_next` が handler を実行し delivery を確定する
//! 4. `next` が `false` を返すまで繰り返し、最後に consumer のエラーを返す
//!
//! 最初に失敗した worker がプールのスコープをキャンセルし、
//! 他の worker は処理中の delivery を終えてから停止します。

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, debug, error, info_span, warn};

use super::context::ConsumerHandle;
use super::engine::App;
use crate::cancel::CancelScope;
use crate::domain::WorqError;

pub(crate) struct WorkerPool {
    app: App,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(app: App, size: usize) -> Self {
        Self { app, size }
    }

    /// Spawn the workers under a child of `scope` and wait for all of them.
    pub(crate) async fn run(self, scope: CancelScope) -> Result<(), WorqError> {
        let pool_scope = scope.child();
        let mut workers = JoinSet::new();

        for worker_id in 0..self.size {
            let app = self.app.clone();
            let scope = pool_scope.clone();
            let span = info_span!("worker", worker_id);
            let worker = async move { worker_loop(app, scope).await }.instrument(span);

            match self.app.dispatch() {
                Some(dispatch) => workers.spawn(worker.with_subscriber(dispatch.clone())),
                None => workers.spawn(worker),
            };
        }

        let mut first_err = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| WorqError::handler(format!("worker task failed: {e}")))
                .and_then(|r| r);
            if let Err(err) = result
                && first_err.is_none()
            {
                pool_scope.cancel(err.to_string());
                first_err = Some(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn worker_loop(app: App, scope: CancelScope) -> Result<(), WorqError> {
    let consumer = app.broker().consume(&scope, app.default_queue()).await?;
    let consumer: ConsumerHandle = Arc::new(tokio::sync::Mutex::new(consumer));
    debug!(queue = %app.default_queue(), "consumer opened");

    loop {
        // Lock only for the pull; the handler re-locks to settle.
        let advanced = consumer.lock().await.next().await;
        if !advanced {
            break;
        }
        if let Err(err) = app.consumer_on_next(&consumer, &scope).await {
            error!(error = %err, "cannot settle delivery");
        }
    }

    let mut consumer = consumer.lock().await;
    let err = consumer.take_err();
    if let Err(close_err) = consumer.close().await {
        warn!(error = %close_err, "consumer close failed");
    }

    match err {
        Some(err) => Err(err),
        None => {
            debug!(cause = ?scope.cause(), "consumer drained");
            Ok(())
        }
    }
}
