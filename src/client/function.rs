use super::Connection;
use crate::error::{CallFailure, FunctionExecutionError};
use crate::protocol::SCHEMAS_PATH;
use crate::schema::SchemaDocument;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Typed proxy for one function exposed by a plugin.
///
/// `I` is serialized as the request body and the reply is decoded as `O`.
pub struct FunctionStub<I, O> {
    name: String,
    connection: Arc<Connection>,
    http: reqwest::Client,
    timeout: Duration,
    _types: PhantomData<fn(&I) -> O>,
}

impl<I, O> std::fmt::Debug for FunctionStub<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionStub")
            .field("name", &self.name)
            .field("base_url", &self.connection.base_url().as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<I, O> FunctionStub<I, O>
where
    I: Serialize,
    O: DeserializeOwned,
{
    pub fn new(
        name: impl Into<String>,
        connection: &Arc<Connection>,
    ) -> Result<Self, FunctionExecutionError> {
        let name = name.into();
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| FunctionExecutionError::new(&name, CallFailure::Transport(e)))?;

        Ok(Self {
            timeout: connection.call_timeout(),
            connection: Arc::clone(connection),
            http,
            name,
            _types: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the connection's call timeout for this function only.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn call(&self, input: &I) -> Result<O, FunctionExecutionError> {
        self.ensure_open()?;

        let body = serde_json::to_vec(input).map_err(|e| self.fail(CallFailure::Encode(e)))?;
        let response = self
            .http
            .post(self.connection.url_for(&self.name))
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| self.fail(e.into()))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.fail(e.into()))?;

        if status != StatusCode::OK {
            return Err(self.fail(CallFailure::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }));
        }

        serde_json::from_slice(&bytes).map_err(|e| self.fail(CallFailure::Decode(e)))
    }

    /// Fetch this function's input and output schemas from the plugin.
    pub async fn schema(&self) -> Result<SchemaDocument, FunctionExecutionError> {
        self.ensure_open()?;

        let response = self
            .http
            .get(self.connection.url_for(&format!("{}/{SCHEMAS_PATH}", self.name)))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.fail(e.into()))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.fail(e.into()))?;

        if status != StatusCode::OK {
            return Err(self.fail(CallFailure::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }));
        }

        serde_json::from_slice(&bytes).map_err(|e| self.fail(CallFailure::Decode(e)))
    }

    fn ensure_open(&self) -> Result<(), FunctionExecutionError> {
        if self.connection.is_closed() {
            return Err(self.fail(CallFailure::Closed));
        }
        Ok(())
    }

    fn fail(&self, cause: CallFailure) -> FunctionExecutionError {
        tracing::debug!(function = %self.name, error = %cause, "Function call failed");
        FunctionExecutionError::new(&self.name, cause)
    }
}
