//! Service traits for the four call shapes a remote step can take.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::future::Future;

/// One request, one response.
#[async_trait]
pub trait Service<I, O>: Send + Sync
where
    I: Send + 'static,
{
    async fn call(&self, input: I) -> Result<O>;
}

/// A completed collection of requests, one response.
#[async_trait]
pub trait ClientStreamingService<I, O>: Send + Sync
where
    I: Send + 'static,
{
    async fn call(&self, inputs: Vec<I>) -> Result<O>;
}

/// One request, a stream of responses.
#[async_trait]
pub trait ServerStreamingService<I, O>: Send + Sync
where
    I: Send + 'static,
{
    async fn call(&self, input: I) -> Result<BoxStream<'static, Result<O>>>;
}

/// A stream of requests, a stream of responses.
pub trait BidiStreamingService<I, O>: Send + Sync {
    fn call(&self, inputs: BoxStream<'static, Result<I>>) -> BoxStream<'static, Result<O>>;
}

/// A [`Service`] backed by an async closure. See [`service_fn`].
#[derive(Clone)]
pub struct ServiceFn<F> {
    f: F,
}

/// Wrap an async closure as a unary [`Service`].
///
/// ```
/// use pipeline_framework::remote::{service_fn, Service};
/// use pipeline_framework::PipelineError;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let double = service_fn(|n: u32| async move { Ok::<_, PipelineError>(n * 2) });
/// assert_eq!(double.call(21).await.unwrap(), 42);
/// # }
/// ```
pub fn service_fn<F>(f: F) -> ServiceFn<F> {
    ServiceFn { f }
}

#[async_trait]
impl<I, O, F, Fut> Service<I, O> for ServiceFn<F>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O>> + Send,
{
    async fn call(&self, input: I) -> Result<O> {
        (self.f)(input).await
    }
}

#[async_trait]
impl<I, O, F, Fut> ClientStreamingService<I, O> for ServiceFn<F>
where
    I: Send + 'static,
    F: Fn(Vec<I>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O>> + Send,
{
    async fn call(&self, inputs: Vec<I>) -> Result<O> {
        (self.f)(inputs).await
    }
}

#[async_trait]
impl<I, O, F, Fut> ServerStreamingService<I, O> for ServiceFn<F>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BoxStream<'static, Result<O>>>> + Send,
{
    async fn call(&self, input: I) -> Result<BoxStream<'static, Result<O>>> {
        (self.f)(input).await
    }
}

impl<I, O, F> BidiStreamingService<I, O> for ServiceFn<F>
where
    F: Fn(BoxStream<'static, Result<I>>) -> BoxStream<'static, Result<O>> + Send + Sync,
{
    fn call(&self, inputs: BoxStream<'static, Result<I>>) -> BoxStream<'static, Result<O>> {
        (self.f)(inputs)
    }
}
