use super::persistence::{is_transient_storage_error, Persistence};
use super::service::{BidiStreamingService, ClientStreamingService, ServerStreamingService, Service};
use crate::backoff::BackoffPolicy;
use crate::config::StepConfig;
use crate::error::Result;
use crate::events::{self, Event};
use crate::exec_ctx::ExecCtx;
use crate::retry::retry_with_backoff;
use crate::step::OneToOne;
use crate::PipelineError;
use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

type FromWire<WI, DI> = Arc<dyn Fn(WI) -> Result<DI> + Send + Sync>;
type ToWire<DO, WO> = Arc<dyn Fn(DO) -> Result<WO> + Send + Sync>;

/// Runs a domain service behind a wire boundary.
///
/// Every call follows the same order: convert the wire input, persist it
/// when `auto_persist` is on, invoke the service, convert the output. Any
/// failure along the way leaves as a [`PipelineError::Transport`] carrying
/// the original cause.
///
/// Persistence failures abort the call. Transient storage errors are
/// retried under [`BackoffPolicy::persistence`].
pub struct RemoteCallAdapter<WI, WO, DI: Send + 'static, DO> {
    name: String,
    from_wire: FromWire<WI, DI>,
    to_wire: ToWire<DO, WO>,
    persistence: Option<Arc<dyn Persistence<DI>>>,
}

impl<WI, WO, DI: Send + 'static, DO> Clone for RemoteCallAdapter<WI, WO, DI, DO> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            from_wire: self.from_wire.clone(),
            to_wire: self.to_wire.clone(),
            persistence: self.persistence.clone(),
        }
    }
}

impl<WI, WO, DI: Send + 'static, DO> std::fmt::Debug for RemoteCallAdapter<WI, WO, DI, DO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCallAdapter")
            .field("name", &self.name)
            .field("persistence", &self.persistence.is_some())
            .finish()
    }
}

impl<WI, WO, DI, DO> RemoteCallAdapter<WI, WO, DI, DO>
where
    WI: Send + 'static,
    WO: Send + 'static,
    DI: Clone + Send + Sync + 'static,
    DO: Send + 'static,
{
    pub fn new<F, T>(name: impl Into<String>, from_wire: F, to_wire: T) -> Self
    where
        F: Fn(WI) -> Result<DI> + Send + Sync + 'static,
        T: Fn(DO) -> Result<WO> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            from_wire: Arc::new(from_wire),
            to_wire: Arc::new(to_wire),
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence<DI>>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn store(&self) -> Result<&Arc<dyn Persistence<DI>>> {
        self.persistence.as_ref().ok_or_else(|| {
            PipelineError::InvalidConfiguration(format!(
                "step '{}' has auto_persist enabled but no persistence",
                self.name
            ))
        })
    }

    fn translate(&self, error: PipelineError) -> PipelineError {
        let error = error.into_transport();
        warn!(step = %self.name, error = %error, "remote call failed");
        error
    }

    async fn persist_one(&self, ctx: &ExecCtx, item: DI) -> Result<DI> {
        let store = self.store()?.as_ref();
        let policy = BackoffPolicy::persistence();
        let stored = retry_with_backoff(ctx, &self.name, &policy, is_transient_storage_error, move |_| {
            store.persist(item.clone())
        })
        .await
        .map_err(|exhausted| exhausted.error)?;
        debug!(step = %self.name, "input persisted");
        events::emit(
            &ctx.event_handler,
            Event::Persisted {
                name: self.name.clone(),
                count: 1,
            },
        );
        Ok(stored)
    }

    async fn persist_all(&self, ctx: &ExecCtx, items: Vec<DI>) -> Result<Vec<DI>> {
        let store = self.store()?.as_ref();
        let policy = BackoffPolicy::persistence();
        let count = items.len();
        let stored = retry_with_backoff(ctx, &self.name, &policy, is_transient_storage_error, move |_| {
            store.persist_all(items.clone())
        })
        .await
        .map_err(|exhausted| exhausted.error)?;
        debug!(step = %self.name, count, "inputs persisted in one scope");
        events::emit(
            &ctx.event_handler,
            Event::Persisted {
                name: self.name.clone(),
                count,
            },
        );
        Ok(stored)
    }

    /// One wire request through `service`.
    pub async fn unary(
        &self,
        ctx: &ExecCtx,
        config: &StepConfig,
        service: &dyn Service<DI, DO>,
        input: WI,
    ) -> Result<WO> {
        let result = async {
            let mut domain = (self.from_wire)(input)?;
            if config.auto_persist {
                domain = self.persist_one(ctx, domain).await?;
            }
            let output = service.call(domain).await?;
            (self.to_wire)(output)
        }
        .await;
        result.map_err(|e| self.translate(e))
    }

    /// Drain `inputs`, persist the collection in one scope, and hand it to
    /// `service` as a whole.
    pub async fn client_streaming<S>(
        &self,
        ctx: &ExecCtx,
        config: &StepConfig,
        service: &dyn ClientStreamingService<DI, DO>,
        inputs: S,
    ) -> Result<WO>
    where
        S: Stream<Item = Result<WI>> + Send,
    {
        let result = async {
            let from_wire = self.from_wire.clone();
            let mut domain: Vec<DI> = inputs
                .map(|item| item.and_then(|wire| from_wire(wire)))
                .try_collect()
                .await?;
            if config.auto_persist {
                domain = self.persist_all(ctx, domain).await?;
            }
            let output = service.call(domain).await?;
            (self.to_wire)(output)
        }
        .await;
        result.map_err(|e| self.translate(e))
    }

    /// One wire request fanned out into a stream of wire responses.
    ///
    /// Failures before the service starts streaming come back as the outer
    /// error; failures mid-stream end the stream.
    pub async fn server_streaming(
        &self,
        ctx: &ExecCtx,
        config: &StepConfig,
        service: &dyn ServerStreamingService<DI, DO>,
        input: WI,
    ) -> Result<BoxStream<'static, Result<WO>>> {
        let opened = async {
            let mut domain = (self.from_wire)(input)?;
            if config.auto_persist {
                domain = self.persist_one(ctx, domain).await?;
            }
            service.call(domain).await
        }
        .await;
        let outputs = opened.map_err(|e| self.translate(e))?;
        Ok(self.outbound(outputs))
    }

    /// A stream of wire requests through a bidirectional service. With
    /// `auto_persist`, each item is persisted before the service sees it.
    pub fn bidi(
        &self,
        ctx: &ExecCtx,
        config: &StepConfig,
        service: Arc<dyn BidiStreamingService<DI, DO>>,
        inputs: BoxStream<'static, Result<WI>>,
    ) -> BoxStream<'static, Result<WO>> {
        let this = self.clone();
        let ctx = ctx.clone();
        let auto_persist = config.auto_persist;
        let domain = inputs
            .then(move |item| {
                let this = this.clone();
                let ctx = ctx.clone();
                async move {
                    let domain = (this.from_wire)(item?)?;
                    if auto_persist {
                        this.persist_one(&ctx, domain).await
                    } else {
                        Ok(domain)
                    }
                }
            })
            .boxed();
        self.outbound(service.call(domain))
    }

    fn outbound(&self, outputs: BoxStream<'static, Result<DO>>) -> BoxStream<'static, Result<WO>> {
        let this = self.clone();
        let mut failed = false;
        outputs
            .map(move |item| item.and_then(|out| (this.to_wire)(out)).map_err(|e| this.translate(e)))
            .take_while(move |item| {
                let done = failed;
                failed = item.is_err();
                futures::future::ready(!done)
            })
            .boxed()
    }
}

impl<WI, WO, DI, DO> RemoteCallAdapter<WI, WO, DI, DO>
where
    WI: DeserializeOwned + Send + 'static,
    WO: Serialize + Send + 'static,
    DI: Clone + Send + Sync + 'static,
    DO: Send + 'static,
{
    /// A one-to-one step that runs `service` through [`unary`](Self::unary).
    ///
    /// Items are decoded into `WI` and the response encoded back to JSON.
    /// The step is named after the adapter; `auto_persist` is read from the
    /// step's effective config on each attempt.
    pub fn into_step<S>(self, service: S) -> OneToOne
    where
        S: Service<DI, DO> + 'static,
    {
        let name = self.name.clone();
        let adapter = Arc::new(self);
        let service: Arc<dyn Service<DI, DO>> = Arc::new(service);
        OneToOne::contextual(name, move |ctx, config, item: Value| {
            let adapter = adapter.clone();
            let service = service.clone();
            async move {
                let wire: WI = serde_json::from_value(item).map_err(|e| {
                    PipelineError::ProgrammerError(format!(
                        "step '{}' could not decode its input: {}",
                        adapter.name, e
                    ))
                    .into_transport()
                })?;
                let out = adapter.unary(&ctx, &config, service.as_ref(), wire).await?;
                serde_json::to_value(out).map_err(|e| PipelineError::from(e).into_transport())
            }
        })
    }
}
