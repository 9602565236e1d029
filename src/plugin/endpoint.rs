//! Host side of one plugin function: decode, validate, invoke, encode.

use crate::schema::{SchemaDocument, Validator};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warp::http::header::{HeaderValue, CONTENT_TYPE};
use warp::http::{Method, StatusCode};

const JSON_CONTENT_TYPE: &str = "application/json";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Per-request context handed to plugin functions.
///
/// The token is cancelled once the request is finished or abandoned, for
/// example when the caller disconnects or its timeout expires.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancellation: CancellationToken,
}

impl CallContext {
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// A fully formed HTTP reply produced by an endpoint.
#[derive(Debug)]
pub(crate) struct EndpointReply {
    pub status: StatusCode,
    pub body: Vec<u8>,
    content_type: &'static str,
}

impl EndpointReply {
    fn json(body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            content_type: JSON_CONTENT_TYPE,
        }
    }

    pub(crate) fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into().into_bytes(),
            content_type: TEXT_CONTENT_TYPE,
        }
    }
}

impl warp::Reply for EndpointReply {
    fn into_response(self) -> warp::reply::Response {
        let mut response = warp::reply::Response::new(self.body.into());
        *response.status_mut() = self.status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        response
    }
}

#[async_trait]
trait Handler: Send + Sync {
    async fn handle(&self, context: CallContext, body: Bytes) -> EndpointReply;
}

type BoxedFunction<I, O> =
    Box<dyn Fn(CallContext, I) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

struct TypedHandler<I, O> {
    function: BoxedFunction<I, O>,
    validator: Option<Validator<I>>,
}

impl<I: DeserializeOwned, O> TypedHandler<I, O> {
    fn decode(&self, body: &[u8]) -> Result<I, String> {
        if let Some(validator) = &self.validator {
            let evaluation = validator.validate(body);
            if !evaluation.is_valid() {
                return Err(format!("invalid input: {evaluation}"));
            }
        }

        decode_strict(body)
    }
}

#[async_trait]
impl<I, O> Handler for TypedHandler<I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    async fn handle(&self, context: CallContext, body: Bytes) -> EndpointReply {
        let input = match self.decode(&body) {
            Ok(input) => input,
            Err(reason) => {
                tracing::warn!(error = %reason, "Rejected function input");
                return EndpointReply::text(StatusCode::BAD_REQUEST, reason);
            }
        };

        let output = match (self.function)(context, input).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Function returned an error");
                return EndpointReply::text(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"));
            }
        };

        match serde_json::to_vec(&output) {
            Ok(body) => EndpointReply::json(body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode function output");
                EndpointReply::text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

/// Decode JSON, rejecting fields the target type would silently ignore and
/// any trailing data after the value.
pub(crate) fn decode_strict<T: DeserializeOwned>(body: &[u8]) -> Result<T, String> {
    let mut unknown = Vec::new();
    let mut deserializer = serde_json::Deserializer::from_slice(body);

    let value: T = serde_ignored::deserialize(&mut deserializer, |path| {
        unknown.push(path.to_string())
    })
    .map_err(|e| e.to_string())?;
    deserializer.end().map_err(|e| e.to_string())?;

    if !unknown.is_empty() {
        return Err(format!("unknown field(s): {}", unknown.join(", ")));
    }

    Ok(value)
}

/// A typed function bound to its schema document, ready to be registered on a
/// [`super::PluginServer`].
#[derive(Clone)]
pub struct FunctionEndpoint {
    schema: SchemaDocument,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for FunctionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEndpoint")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl FunctionEndpoint {
    /// Wrap `function`, deriving its schema document from `I` and `O`.
    ///
    /// When a validator is given, raw payloads are checked against it before
    /// decoding and the function never sees input that fails validation.
    pub fn new<I, O, F, Fut>(function: F, validator: Option<Validator<I>>) -> Self
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        O: Serialize + JsonSchema + Send + 'static,
        F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let function: BoxedFunction<I, O> =
            Box::new(move |context, input| Box::pin(function(context, input)));

        Self {
            schema: SchemaDocument::for_types::<I, O>(),
            handler: Arc::new(TypedHandler {
                function,
                validator,
            }),
        }
    }

    pub fn schema(&self) -> &SchemaDocument {
        &self.schema
    }

    pub(crate) async fn dispatch(&self, method: &Method, body: Bytes) -> EndpointReply {
        if *method != Method::POST {
            tracing::warn!(%method, "Method not allowed");
            return EndpointReply::text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let cancellation = CancellationToken::new();
        let _cancel_on_drop = cancellation.clone().drop_guard();

        self.handler
            .handle(CallContext { cancellation }, body)
            .await
    }
}
