//! The unit of work applied by workers and pipeline stages.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use crate::error::{Error, Result};

/// A one-to-one transform from `Input` to `Output`.
///
/// Takes `&self` so a single transform can be shared by every worker of a
/// pool; keep mutable state behind a lock or an atomic.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use taskweld::error::Result;
/// use taskweld::transform::Transform;
///
/// struct Square;
///
/// #[async_trait]
/// impl Transform for Square {
///     type Input = i64;
///     type Output = i64;
///
///     async fn apply(&self, item: i64) -> Result<i64> {
///         Ok(item * item)
///     }
/// }
/// ```
#[async_trait]
pub trait Transform: Send + Sync + 'static {
    /// The type of items this transform accepts
    type Input: Send + 'static;
    /// The type of items this transform produces
    type Output: Send + 'static;

    /// Transform a single item.
    async fn apply(&self, item: Self::Input) -> Result<Self::Output>;
}

/// Helper function to create a transform from a plain function
pub fn map_fn<F, T, U>(f: F) -> MapFn<F, T, U>
where
    F: Fn(T) -> U + Send + Sync + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    MapFn {
        f,
        _phantom: PhantomData,
    }
}

/// A transform created from a plain function
pub struct MapFn<F, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> U>,
}

#[async_trait]
impl<F, T, U> Transform for MapFn<F, T, U>
where
    F: Fn(T) -> U + Send + Sync + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn apply(&self, item: T) -> Result<U> {
        Ok((self.f)(item))
    }
}

/// Helper function to create a transform from an async, fallible function
pub fn transform_fn<F, Fut, T, U>(f: F) -> FnTransform<F, Fut, T, U>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    FnTransform {
        f,
        _phantom: PhantomData,
    }
}

/// A transform created from an async function
pub struct FnTransform<F, Fut, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> (Fut, U)>,
}

#[async_trait]
impl<F, Fut, T, U> Transform for FnTransform<F, Fut, T, U>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn apply(&self, item: T) -> Result<U> {
        (self.f)(item).await
    }
}

/// Apply `transform`, failing with [`Error::Timeout`] if it outlives `timeout`.
pub(crate) async fn apply_with_timeout<Tr: Transform + ?Sized>(
    transform: &Tr,
    item: Tr::Input,
    timeout: Option<Duration>,
) -> Result<Tr::Output> {
    match timeout {
        None => transform.apply(item).await,
        Some(limit) => match tokio::time::timeout(limit, transform.apply(item)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                duration_ms: limit.as_millis() as u64,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn map_fn_applies() {
        let double = map_fn(|x: i32| x * 2);
        assert_eq!(double.apply(21).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn transform_fn_propagates_errors() {
        let checked = transform_fn(|x: i32| async move {
            if x < 0 {
                Err(Error::custom("negative"))
            } else {
                Ok(x as u32)
            }
        });
        assert_eq!(checked.apply(3).await.unwrap(), 3);
        assert!(checked.apply(-1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transform_times_out() {
        let slow = transform_fn(|x: u8| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, Error>(x)
        });
        let err = apply_with_timeout(&slow, 1, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { duration_ms: 10 }));
    }
}
