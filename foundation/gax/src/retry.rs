use std::future::Future;
use std::iter::Take;
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::grpc::{Code, Status};

/// Exponential delays: `base * factor`, `base^2 * factor`, ... capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
        }
    }

    pub fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    pub fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let duration = match self.current.checked_mul(self.factor) {
            Some(millis) => Duration::from_millis(millis),
            None => Duration::from_millis(u64::MAX),
        };

        if let Some(max_delay) = self.max_delay {
            if duration > max_delay {
                return Some(max_delay);
            }
        }

        self.current = self.current.checked_mul(self.base).unwrap_or(u64::MAX);
        Some(duration)
    }
}

pub trait TryAs<T> {
    fn try_as(&self) -> Option<&T>;
}

impl TryAs<Status> for Status {
    fn try_as(&self) -> Option<&Status> {
        Some(self)
    }
}

pub trait Condition<E> {
    fn should_retry(&mut self, error: &E) -> bool;
}

/// Retries when the status code of the error is one of `codes`.
pub struct CodeCondition {
    codes: Vec<Code>,
}

impl CodeCondition {
    pub fn new(codes: Vec<Code>) -> Self {
        Self { codes }
    }
}

impl<E> Condition<E> for CodeCondition
where
    E: TryAs<Status>,
{
    fn should_retry(&mut self, error: &E) -> bool {
        match error.try_as() {
            Some(status) => self.codes.contains(&status.code()),
            None => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetrySetting {
    pub from_millis: u64,
    pub max_delay: Option<Duration>,
    pub factor: u64,
    pub take: usize,
    pub codes: Vec<Code>,
}

impl RetrySetting {
    pub fn strategy(&self) -> Take<ExponentialBackoff> {
        let mut backoff = ExponentialBackoff::from_millis(self.from_millis).factor(self.factor);
        if let Some(max_delay) = self.max_delay {
            backoff = backoff.max_delay(max_delay);
        }
        backoff.take(self.take)
    }

    pub fn condition(&self) -> CodeCondition {
        CodeCondition::new(self.codes.clone())
    }
}

impl Default for RetrySetting {
    fn default() -> Self {
        Self {
            from_millis: 10,
            max_delay: Some(Duration::from_secs(1)),
            factor: 1u64,
            take: 5,
            codes: vec![Code::Unavailable, Code::Unknown, Code::Aborted],
        }
    }
}

/// Runs `f` until it succeeds, the error is not retryable, or the backoff is exhausted.
/// Without a `retry` setting `f` runs once.
pub async fn invoke<A, R, E>(
    cancel: Option<CancellationToken>,
    retry: Option<RetrySetting>,
    mut f: impl FnMut() -> A,
) -> Result<R, E>
where
    E: TryAs<Status> + From<Status>,
    A: Future<Output = Result<R, E>>,
{
    let attempt = move |()| {
        let call = f();
        async move { call.await.map_err(|e| (e, ())) }
    };
    invoke_fn(cancel, retry, attempt, ()).await
}

/// Like [`invoke`], but `v` is handed back by each failed attempt so the next one can reuse it.
pub async fn invoke_fn<R, V, A, E>(
    cancel: Option<CancellationToken>,
    retry: Option<RetrySetting>,
    mut f: impl FnMut(V) -> A,
    mut v: V,
) -> Result<R, E>
where
    E: TryAs<Status> + From<Status>,
    A: Future<Output = Result<R, (E, V)>>,
{
    let attempts = async {
        let mut backoff = retry.map(|retry| (retry.strategy(), retry.condition()));
        loop {
            let error = match f(v).await {
                Ok(r) => return Ok(r),
                Err((e, returned)) => {
                    v = returned;
                    e
                }
            };
            let Some((strategy, condition)) = backoff.as_mut() else {
                return Err(error);
            };
            if !condition.should_retry(&error) {
                return Err(error);
            }
            let Some(delay) = strategy.next() else {
                return Err(error);
            };
            tracing::trace!("retry after {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    };

    match cancel {
        Some(cancel) => {
            select! {
                _ = cancel.cancelled() => Err(Status::cancelled("client cancel").into()),
                r = attempts => r
            }
        }
        None => attempts.await,
    }
}
