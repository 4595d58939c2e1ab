use super::{context::RequestContext, errors::ProxyError, limits::RequestLimits, method_router::MethodRouter};
use crate::{
    backend::BackendGroup,
    cache::RpcCache,
    metrics::MetricsCollector,
    rpc,
    types::{JsonRpcRequest, JsonRpcResponse},
};
use ahash::AHashMap;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{error, info, warn};

/// Source label used when the proxy itself rejects a request.
const PROXYD_SOURCE: &str = "proxyd";

/// Answered locally with an empty account list.
const ETH_ACCOUNTS: &str = "eth_accounts";

/// Default for `server.max_upstream_batch_size`.
pub const DEFAULT_MAX_UPSTREAM_BATCH_SIZE: usize = 10;

/// Body of an HTTP reply: one envelope or a batch array.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Single(JsonRpcResponse),
    Batch(Vec<JsonRpcResponse>),
}

/// Outcome of processing one HTTP body.
#[derive(Debug, Clone, PartialEq)]
pub struct HandledRequest {
    pub reply: RpcReply,
    /// True if any envelope in the reply was served from the cache.
    pub cached: bool,
    pub status: u16,
    /// `group/backend` labels of every backend that answered, joined by `", "`.
    pub served_by: String,
}

impl HandledRequest {
    fn single(reply: JsonRpcResponse, cached: bool, status: u16) -> Self {
        Self { reply: RpcReply::Single(reply), cached, status, served_by: String::new() }
    }
}

/// Envelope for one call, with the HTTP status it would get as a single request.
struct Answer {
    response: JsonRpcResponse,
    status: u16,
    cached: bool,
}

impl Answer {
    fn ok(response: JsonRpcResponse, cached: bool) -> Self {
        Self { response, status: 200, cached }
    }

    fn err(err: &ProxyError, id: Arc<Value>) -> Self {
        Self { response: err.to_response(id), status: err.http_status(), cached: false }
    }
}

/// Where an admitted call is answered.
enum Route<'a> {
    Local(JsonRpcResponse),
    Group(&'a Arc<BackendGroup>),
}

/// Calls bound for one backend group. Calls sharing an id go to separate upstream batches so
/// responses can be matched back by id.
#[derive(Default)]
struct UpstreamBatch {
    group: Option<Arc<BackendGroup>>,
    calls: Vec<(usize, JsonRpcRequest)>,
}

/// The request pipeline: limit, route, read the cache, forward, fill the cache.
pub struct ProxyEngine {
    router: MethodRouter,
    cache: Option<Arc<RpcCache>>,
    metrics: MetricsCollector,
    limits: RequestLimits,
    max_batch_size: usize,
    max_upstream_batch_size: usize,
}

impl ProxyEngine {
    #[must_use]
    pub fn new(
        router: MethodRouter,
        cache: Option<Arc<RpcCache>>,
        metrics: MetricsCollector,
        max_batch_size: usize,
    ) -> Self {
        Self {
            router,
            cache,
            metrics,
            limits: RequestLimits::default(),
            max_batch_size,
            max_upstream_batch_size: DEFAULT_MAX_UPSTREAM_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: RequestLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_max_upstream_batch_size(mut self, size: usize) -> Self {
        self.max_upstream_batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn router(&self) -> &MethodRouter {
        &self.router
    }

    #[must_use]
    pub fn cache(&self) -> Option<&Arc<RpcCache>> {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Checks the client against the base rate limit before its body is read.
    ///
    /// # Errors
    ///
    /// See [`RequestLimits::check_request`].
    pub async fn admit(&self, ctx: &RequestContext) -> Result<(), ProxyError> {
        self.limits.check_request(ctx).await.inspect_err(|e| {
            self.metrics.record_rpc_error(PROXYD_SOURCE, e.code());
        })
    }

    /// Handles a raw HTTP body, single or batch.
    pub async fn handle_body(&self, ctx: &RequestContext, body: &[u8]) -> HandledRequest {
        if rpc::is_batch(body) {
            return self.handle_batch(ctx, body).await;
        }

        let req = match rpc::parse_single(body) {
            Ok(req) => req,
            Err(e) => {
                info!(source = ctx.source.as_str(), req_id = %ctx.request_id, error = %e, "error parsing rpc call");
                return self.reject(&e);
            }
        };

        let (mut answers, served_by) = self.dispatch(ctx, vec![Ok(req)]).await;
        let Some(Answer { response, status, cached }) = answers.pop() else {
            return self.reject(&ProxyError::Internal);
        };
        HandledRequest { reply: RpcReply::Single(response), cached, status, served_by }
    }

    async fn handle_batch(&self, ctx: &RequestContext, body: &[u8]) -> HandledRequest {
        let elements = match rpc::parse_batch(body)
            .and_then(|elements| rpc::check_batch_size(elements.len(), self.max_batch_size).map(|()| elements))
        {
            Ok(elements) => elements,
            Err(e) => {
                warn!(req_id = %ctx.request_id, error = %e, "rejecting batch request");
                return self.reject(&e);
            }
        };

        let calls = elements.into_iter().map(rpc::parse_value).collect();
        let (answers, served_by) = self.dispatch(ctx, calls).await;
        let cached = answers.iter().any(|answer| answer.cached);
        let responses = answers.into_iter().map(|answer| answer.response).collect();

        HandledRequest { reply: RpcReply::Batch(responses), cached, status: 200, served_by }
    }

    /// Answers every call, in input order, and reports which backends served them.
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        calls: Vec<Result<JsonRpcRequest, ProxyError>>,
    ) -> (Vec<Answer>, String) {
        let mut answers: Vec<Option<Answer>> = calls.iter().map(|_| None).collect();
        let mut batches: BTreeMap<(usize, String), UpstreamBatch> = BTreeMap::new();
        let mut id_counts: AHashMap<String, usize> = AHashMap::new();

        for (index, call) in calls.into_iter().enumerate() {
            let req = match call {
                Ok(req) => req,
                Err(e) => {
                    info!(source = ctx.source.as_str(), req_id = %ctx.request_id, error = %e, "error parsing rpc call");
                    answers[index] = Some(self.fail(&e, Arc::new(Value::Null)));
                    continue;
                }
            };

            match self.route(ctx, &req).await {
                Ok(Route::Local(response)) => answers[index] = Some(Answer::ok(response, false)),
                Ok(Route::Group(group)) => {
                    let seen = id_counts.entry(req.id.to_string()).or_default();
                    *seen += 1;
                    let batch = batches.entry((*seen, group.name().to_string())).or_default();
                    batch.group.get_or_insert_with(|| Arc::clone(group));
                    batch.calls.push((index, req));
                }
                Err(e) => answers[index] = Some(self.fail(&e, Arc::clone(&req.id))),
            }
        }

        let mut served_by = BTreeSet::new();
        for batch in batches.into_values() {
            let Some(group) = batch.group else { continue };
            self.forward_batch(ctx, &group, batch.calls, &mut answers, &mut served_by).await;
        }

        let answers = answers
            .into_iter()
            .map(|answer| answer.unwrap_or_else(|| self.fail(&ProxyError::Internal, Arc::new(Value::Null))))
            .collect();
        (answers, served_by.into_iter().collect::<Vec<_>>().join(", "))
    }

    /// Applies the local answers, the method whitelist and per-method limits to one call.
    async fn route(&self, ctx: &RequestContext, req: &JsonRpcRequest) -> Result<Route<'_>, ProxyError> {
        if req.method == ETH_ACCOUNTS {
            return Ok(Route::Local(JsonRpcResponse::success(json!([]), Arc::clone(&req.id))));
        }

        let group = self.router.group_for(&req.method).inspect_err(|_| {
            info!(
                source = ctx.source.as_str(),
                req_id = %ctx.request_id,
                method = %req.method,
                "blocked request for non-whitelisted method"
            );
            self.metrics.record_blocked_request(&req.method);
        })?;

        self.limits.check_method(ctx, req).await?;
        Ok(Route::Group(group))
    }

    /// Serves `calls` from the cache where possible and forwards the misses to `group` in
    /// upstream batches of at most `max_upstream_batch_size`.
    async fn forward_batch(
        &self,
        ctx: &RequestContext,
        group: &BackendGroup,
        calls: Vec<(usize, JsonRpcRequest)>,
        answers: &mut [Option<Answer>],
        served_by: &mut BTreeSet<String>,
    ) {
        let mut misses = Vec::with_capacity(calls.len());
        let mut miss_slots = Vec::with_capacity(calls.len());

        for (index, req) in calls {
            let mut head_at_request = None;
            if let Some(cache) = self.cache.as_ref().filter(|cache| cache.is_cached_method(&req)) {
                head_at_request = cache.current_head().await;
                match cache.get_rpc(&req).await {
                    Ok(Some(hit)) => {
                        answers[index] = Some(Answer::ok(hit, true));
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(req_id = %ctx.request_id, method = %req.method, error = %e, "cache get error");
                    }
                }
            }
            misses.push(req);
            miss_slots.push((index, head_at_request));
        }

        let size = self.max_upstream_batch_size;
        for (reqs, slots) in misses.chunks(size).zip(miss_slots.chunks(size)) {
            match group.forward_batch(ctx, reqs).await {
                Ok((responses, backend)) => {
                    served_by.insert(backend);
                    for ((req, (index, head)), response) in reqs.iter().zip(slots).zip(responses) {
                        let response = response.with_id(Arc::clone(&req.id));
                        self.fill_cache(ctx, req, &response, *head).await;
                        answers[*index] = Some(Answer::ok(response, false));
                    }
                }
                Err(e) => {
                    let err = ProxyError::from(e);
                    error!(
                        req_id = %ctx.request_id,
                        group = group.name(),
                        batch_size = reqs.len(),
                        error = %err,
                        "error forwarding rpc batch"
                    );
                    for (req, (index, _)) in reqs.iter().zip(slots) {
                        answers[*index] = Some(self.fail(&err, Arc::clone(&req.id)));
                    }
                }
            }
        }
    }

    async fn fill_cache(&self, ctx: &RequestContext, req: &JsonRpcRequest, res: &JsonRpcResponse, head: Option<u64>) {
        let Some(cache) = &self.cache else { return };
        if let Err(e) = cache.put_rpc(req, res, head).await {
            warn!(req_id = %ctx.request_id, method = %req.method, error = %e, "cache put error");
        }
    }

    fn fail(&self, err: &ProxyError, id: Arc<Value>) -> Answer {
        self.metrics.record_rpc_error(PROXYD_SOURCE, err.code());
        Answer::err(err, id)
    }

    fn reject(&self, err: &ProxyError) -> HandledRequest {
        self.metrics.record_rpc_error(PROXYD_SOURCE, err.code());
        HandledRequest::single(err.to_null_response(), false, err.http_status())
    }
}
