// Message router - validates UI requests and hands them to registered handlers
//
// Every request name maps to exactly one handler together with the contract its
// payload must satisfy. Unknown names and invalid payloads never reach a handler;
// they are answered with `false`.

use crate::metrics::Metrics;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future returned by a request handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Value> + Send>>;

type Handler<C> = Arc<dyn Fn(Arc<C>, Value) -> HandlerFuture + Send + Sync>;

/// Whether a request is answered with its result or only acknowledged
///
/// Async requests reply with an acknowledgement and report their outcome later
/// through push events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Sync,
    Async,
}

/// Why a payload was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Expected a non-empty object")]
    EmptyObject,

    #[error("Expected a non-empty string")]
    EmptyString,

    #[error("Expected exactly the keys {expected:?}, got {actual:?}")]
    UnexpectedKeys {
        expected: &'static [&'static str],
        actual: Vec<String>,
    },

    #[error("Field `{0}` has the wrong type")]
    InvalidField(&'static str),
}

/// Shape a request payload must have before its handler runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadContract {
    /// Anything, including no payload
    Any,

    /// An object with at least one key
    NonEmptyObject,

    /// A string of at least one character
    NonEmptyString,

    /// `{content}` with a non-empty string
    ClipboardContent,

    /// `{fileTypes}` holding an object or an array
    FileTypes,

    /// `{settingsFile, staticSeed}` with a non-empty settings object
    GenerateSeed,
}

impl PayloadContract {
    pub fn validate(self, payload: &Value) -> Result<(), ValidationError> {
        match self {
            Self::Any => Ok(()),
            Self::NonEmptyObject => match payload {
                Value::Object(map) if !map.is_empty() => Ok(()),
                _ => Err(ValidationError::EmptyObject),
            },
            Self::NonEmptyString => match payload {
                Value::String(text) if !text.is_empty() => Ok(()),
                _ => Err(ValidationError::EmptyString),
            },
            Self::ClipboardContent => {
                let object = exact_keys(payload, &["content"])?;
                match object.get("content") {
                    Some(Value::String(text)) if !text.is_empty() => Ok(()),
                    _ => Err(ValidationError::InvalidField("content")),
                }
            }
            Self::FileTypes => {
                let object = exact_keys(payload, &["fileTypes"])?;
                match object.get("fileTypes") {
                    Some(Value::Object(_) | Value::Array(_)) => Ok(()),
                    _ => Err(ValidationError::InvalidField("fileTypes")),
                }
            }
            Self::GenerateSeed => {
                let object = exact_keys(payload, &["settingsFile", "staticSeed"])?;
                match object.get("settingsFile") {
                    Some(Value::Object(settings)) if !settings.is_empty() => Ok(()),
                    _ => Err(ValidationError::InvalidField("settingsFile")),
                }
            }
        }
    }
}

fn exact_keys<'a>(
    payload: &'a Value,
    expected: &'static [&'static str],
) -> Result<&'a serde_json::Map<String, Value>, ValidationError> {
    let Value::Object(object) = payload else {
        return Err(ValidationError::UnexpectedKeys {
            expected,
            actual: Vec::new(),
        });
    };

    let matches = object.len() == expected.len() && expected.iter().all(|key| object.contains_key(*key));
    if matches {
        Ok(object)
    } else {
        Err(ValidationError::UnexpectedKeys {
            expected,
            actual: object.keys().cloned().collect(),
        })
    }
}

/// A request as sent by the UI
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestEnvelope {
    /// Correlates the reply; requests without an id still get one
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl RequestEnvelope {
    pub fn new(id: Option<u64>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
        }
    }
}

/// The single reply to a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub id: Option<u64>,
    pub result: Value,
}

impl Reply {
    pub fn rejected(id: Option<u64>) -> Self {
        Self {
            id,
            result: Value::Bool(false),
        }
    }
}

struct Route<C> {
    kind: RequestKind,
    contract: PayloadContract,
    handler: Handler<C>,
}

/// Maps request names to validated handlers sharing one context
pub struct MessageRouter<C> {
    context: Arc<C>,
    routes: IndexMap<String, Route<C>>,
    metrics: Arc<Metrics>,
}

impl<C: Send + Sync + 'static> MessageRouter<C> {
    pub fn new(context: Arc<C>, metrics: Arc<Metrics>) -> Self {
        Self {
            context,
            routes: IndexMap::new(),
            metrics,
        }
    }

    /// Register `handler` for `name`, replacing any earlier registration
    pub fn register<F, Fut>(&mut self, name: &str, kind: RequestKind, contract: PayloadContract, handler: F)
    where
        F: Fn(Arc<C>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let handler: Handler<C> = Arc::new(move |context: Arc<C>, payload: Value| -> HandlerFuture {
            Box::pin(handler(context, payload))
        });
        let route = Route {
            kind,
            contract,
            handler,
        };

        if self.routes.insert(name.to_string(), route).is_some() {
            tracing::warn!("Handler for '{}' was registered twice, keeping the last one", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn kind(&self, name: &str) -> Option<RequestKind> {
        self.routes.get(name).map(|route| route.kind)
    }

    /// Registered names, in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Validate and run a request, producing its single reply
    pub async fn dispatch(&self, envelope: RequestEnvelope) -> Reply {
        let RequestEnvelope { id, name, payload } = envelope;

        let Some(route) = self.routes.get(&name) else {
            tracing::warn!("Rejected unknown request '{}'", name);
            self.metrics.record_request_rejected();
            return Reply::rejected(id);
        };

        if let Err(e) = route.contract.validate(&payload) {
            tracing::warn!("Rejected '{}': {}", name, e);
            self.metrics.record_request_rejected();
            return Reply::rejected(id);
        }

        tracing::debug!("Dispatching '{}' ({:?})", name, route.kind);
        self.metrics.record_request_dispatched();

        let handler = Arc::clone(&route.handler);
        let result = handler(Arc::clone(&self.context), payload).await;
        Reply { id, result }
    }
}
