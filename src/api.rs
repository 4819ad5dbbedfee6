// ============================================================================
// API SEAM
// ============================================================================
// Wire-neutral request/response shapes and the status mapping the outer HTTP
// layer applies. Nothing here knows about routing or transport; a handler
// deserializes a DTO, calls `MetricsApi` and writes the `ApiReply` back.
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{MetricsError, MetricsResult};
use crate::ingest::{IngestOptions, IngestRequest, IngestionGateway};
use crate::logging::targets;
use crate::query::{ListFilter, QueryService, SeriesQuery, StatsRange};
use crate::time::Granularity;
use crate::types::{MetricSample, RequestContext};

pub use crate::query::FeatureStatus;

// ----------------------------------------------------------------------------
// DTOs
// ----------------------------------------------------------------------------

/// Body of a single-sample ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestBody {
    #[serde(alias = "userId")]
    pub entity_id: String,
    pub signal_type: String,
    #[serde(alias = "frequencyHz")]
    pub value: f64,
    #[serde(default)]
    pub metadata: IngestOptions,
}

impl From<IngestBody> for IngestRequest {
    fn from(body: IngestBody) -> Self {
        IngestRequest {
            entity_id: body.entity_id,
            signal_type: body.signal_type,
            value: body.value,
            options: body.metadata,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default, alias = "userId")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl From<ListQuery> for ListFilter {
    fn from(query: ListQuery) -> Self {
        ListFilter {
            entity_id: query.entity_id,
            signal_type: query.signal_type,
            limit: query.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub measurements: Vec<MetricSample>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuery {
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: f64,
}

fn default_window_minutes() -> f64 {
    60.0
}

/// Rollup series request. `entityId` may be `*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesRequest {
    pub entity_id: String,
    pub signal_type: String,
    pub granularity: String,
    pub range: String,
    #[serde(flatten)]
    pub page: SeriesQuery,
}

// ----------------------------------------------------------------------------
// Replies
// ----------------------------------------------------------------------------

/// Status code plus JSON body, ready for any HTTP framework.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub status: u16,
    pub body: Value,
}

impl ApiReply {
    pub fn ok<T: Serialize>(body: &T) -> Self {
        Self::with_status(200, body)
    }

    pub fn created<T: Serialize>(body: &T) -> Self {
        Self::with_status(201, body)
    }

    fn with_status<T: Serialize>(status: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(e) => Self::from_error(&MetricsError::Internal(format!("response encoding failed: {e}"))),
        }
    }

    pub fn from_error(error: &MetricsError) -> Self {
        let status = error.status_code();
        if status >= 500 {
            warn!(
                target: targets::QUERY,
                status,
                category = error.category(),
                error = %error,
                "Request failed"
            );
        }
        let mut body = json!({ "error": error.to_string() });
        if error.is_retryable() {
            body["retryable"] = Value::Bool(true);
        }
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn reply<T: Serialize>(result: MetricsResult<T>) -> ApiReply {
    match result {
        Ok(body) => ApiReply::ok(&body),
        Err(e) => ApiReply::from_error(&e),
    }
}

// ----------------------------------------------------------------------------
// Facade
// ----------------------------------------------------------------------------

/// Endpoint-shaped entry points over the gateway and the query service.
#[derive(Debug, Clone)]
pub struct MetricsApi {
    gateway: IngestionGateway,
    query: QueryService,
}

impl MetricsApi {
    pub fn new(gateway: IngestionGateway, query: QueryService) -> Self {
        Self { gateway, query }
    }

    /// `201` with the stored sample, `400 {error}` on validation failure.
    pub async fn ingest(&self, ctx: &RequestContext, body: IngestBody) -> ApiReply {
        let request = IngestRequest::from(body);
        match self
            .gateway
            .ingest(ctx, &request.entity_id, &request.signal_type, request.value, request.options)
            .await
        {
            Ok(sample) => ApiReply::created(&sample),
            Err(e) => ApiReply::from_error(&e),
        }
    }

    pub async fn batch_ingest(&self, ctx: &RequestContext, body: Vec<IngestRequest>) -> ApiReply {
        reply(self.gateway.batch_ingest(ctx, body).await)
    }

    pub async fn list(&self, query: ListQuery) -> ApiReply {
        reply(self.query.list(&query.into()).await.map(|list| ListResponse {
            measurements: list.items,
            total: list.total,
        }))
    }

    pub async fn windowed_stats(&self, query: WindowQuery) -> ApiReply {
        reply(
            self.query
                .windowed_stats(query.window_minutes, query.signal_type.as_deref())
                .await,
        )
    }

    pub async fn feature_status(&self) -> ApiReply {
        reply(self.query.feature_status().await)
    }

    pub async fn latest(&self, entity_id: &str, signal_type: &str) -> ApiReply {
        reply(self.query.latest(entity_id, signal_type).await)
    }

    pub async fn stats(&self, entity_id: &str, signal_type: &str, range: &str) -> ApiReply {
        let result = match range.parse::<StatsRange>() {
            Ok(range) => self.query.stats_by_range(entity_id, signal_type, range).await,
            Err(e) => Err(e),
        };
        reply(result)
    }

    pub async fn series(&self, request: SeriesRequest) -> ApiReply {
        let parsed = request
            .granularity
            .parse::<Granularity>()
            .and_then(|g| Ok((g, request.range.parse::<StatsRange>()?)));
        let result = match parsed {
            Ok((granularity, range)) => {
                self.query
                    .series(&request.entity_id, &request.signal_type, granularity, range, request.page)
                    .await
            }
            Err(e) => Err(e),
        };
        reply(result)
    }

    pub async fn kpi_status(&self, kpi_id: &str) -> ApiReply {
        reply(self.query.kpi_status(kpi_id).await)
    }
}
