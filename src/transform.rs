//! Per-service request/response transformation via sandboxed scripts.
//!
//! Scripts live at `<scripts_dir>/<service_name>/request.rhai` and
//! `response.rhai` and are compiled once at startup; compilation failure
//! is fatal. Each invocation runs the compiled program in a fresh engine
//! and scope seeded with a `request` or `response` object map, so no
//! script state leaks between requests. After the run, headers present in
//! the returned map are set (overwriting — removals are not propagated)
//! and a non-empty body is re-serialized, as JSON when the incoming body
//! parsed as JSON.

use crate::config::{ServiceTransform, TransformSettings};
use bytes::Bytes;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to read script {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile script {path}: {message}")]
    Compile { path: PathBuf, message: String },

    #[error("script execution failed for service {service}: {message}")]
    Execution { service: String, message: String },

    #[error("no compiled script for service {service}")]
    Missing { service: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn script_name(&self) -> &'static str {
        match self {
            Direction::Request => "request.rhai",
            Direction::Response => "response.rhai",
        }
    }

    fn binding(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// The request side of an exchange as bound into the sandbox.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// The response side of an exchange as bound into the sandbox.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Owns the compiled script programs, keyed by `(service, direction)`.
/// Shared read-only across requests after startup.
pub struct ScriptEngine {
    services: Vec<ServiceTransform>,
    scripts: HashMap<(String, Direction), AST>,
}

impl ScriptEngine {
    /// Reads and compiles both scripts for every configured service.
    pub fn load(settings: &TransformSettings) -> Result<Self, TransformError> {
        let compiler = Engine::new();
        let mut scripts = HashMap::new();

        for service in settings.services.values() {
            for direction in [Direction::Request, Direction::Response] {
                let path = settings
                    .scripts_dir
                    .join(&service.service_name)
                    .join(direction.script_name());

                let source = std::fs::read_to_string(&path).map_err(|source| {
                    TransformError::Load {
                        path: path.clone(),
                        source,
                    }
                })?;

                let ast = compiler.compile(&source).map_err(|e| TransformError::Compile {
                    path: path.clone(),
                    message: e.to_string(),
                })?;

                scripts.insert((service.service_name.clone(), direction), ast);
            }
        }

        info!(
            services = settings.services.len(),
            scripts = scripts.len(),
            "loaded transformation scripts"
        );

        Ok(Self {
            services: settings.services.values().cloned().collect(),
            scripts,
        })
    }

    /// An engine with no configured services; every path passes through.
    pub fn empty() -> Self {
        Self {
            services: Vec::new(),
            scripts: HashMap::new(),
        }
    }

    fn matching_service(&self, path: &str) -> Option<&ServiceTransform> {
        self.services.iter().find(|service| service.url == path)
    }

    /// Transforms the request envelope when its path exactly matches a
    /// configured service URL. Returns `None` on pass-through.
    pub fn transform_request(
        &self,
        envelope: &RequestEnvelope,
    ) -> Result<Option<RequestEnvelope>, TransformError> {
        let Some(service) = self.matching_service(&envelope.path) else {
            return Ok(None);
        };
        let service_name = service.service_name.clone();

        let (body, body_was_json) = body_to_dynamic(&envelope.body);
        let mut map = Map::new();
        map.insert("method".into(), envelope.method.clone().into());
        map.insert("path".into(), envelope.path.clone().into());
        map.insert("headers".into(), headers_to_map(&envelope.headers).into());
        map.insert("body".into(), body);

        let result = self.run(&service_name, Direction::Request, map)?;

        let mut transformed = envelope.clone();
        apply_result(&result, &mut transformed.headers, &mut transformed.body, body_was_json)
            .map_err(|message| TransformError::Execution {
                service: service_name,
                message,
            })?;
        Ok(Some(transformed))
    }

    /// Transforms the response envelope for a matching request path.
    /// Returns `None` on pass-through.
    pub fn transform_response(
        &self,
        path: &str,
        envelope: &ResponseEnvelope,
    ) -> Result<Option<ResponseEnvelope>, TransformError> {
        let Some(service) = self.matching_service(path) else {
            return Ok(None);
        };
        let service_name = service.service_name.clone();

        let (body, body_was_json) = body_to_dynamic(&envelope.body);
        let mut map = Map::new();
        map.insert("statusCode".into(), Dynamic::from(envelope.status_code as i64));
        map.insert("headers".into(), headers_to_map(&envelope.headers).into());
        map.insert("body".into(), body);

        let result = self.run(&service_name, Direction::Response, map)?;

        let mut transformed = envelope.clone();
        apply_result(&result, &mut transformed.headers, &mut transformed.body, body_was_json)
            .map_err(|message| TransformError::Execution {
                service: service_name,
                message,
            })?;
        Ok(Some(transformed))
    }

    /// Runs one compiled program in a fresh engine and scope and returns
    /// the possibly-mutated binding.
    fn run(
        &self,
        service: &str,
        direction: Direction,
        map: Map,
    ) -> Result<Map, TransformError> {
        let ast = self
            .scripts
            .get(&(service.to_string(), direction))
            .ok_or_else(|| TransformError::Missing {
                service: service.to_string(),
            })?;

        let mut engine = Engine::new();
        engine.register_fn("log", |message: &str| {
            info!(target: "muhtar::transform", "{message}");
        });

        let mut scope = Scope::new();
        scope.push(direction.binding(), map);

        engine
            .run_ast_with_scope(&mut scope, ast)
            .map_err(|e| TransformError::Execution {
                service: service.to_string(),
                message: e.to_string(),
            })?;

        scope
            .get_value::<Map>(direction.binding())
            .ok_or_else(|| TransformError::Execution {
                service: service.to_string(),
                message: format!("script replaced `{}` with a non-object", direction.binding()),
            })
    }
}

fn headers_to_map(headers: &HashMap<String, String>) -> Map {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().into(), value.clone().into()))
        .collect()
}

/// Parses the body for the sandbox: a JSON document becomes a structured
/// value, anything else is bound as the raw string.
fn body_to_dynamic(body: &Bytes) -> (Dynamic, bool) {
    if !body.is_empty() {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Ok(dynamic) = rhai::serde::to_dynamic(value) {
                return (dynamic, true);
            }
        }
    }
    (
        Dynamic::from(String::from_utf8_lossy(body).into_owned()),
        false,
    )
}

/// Read-back: sets returned headers over the envelope's and re-serializes
/// a non-empty body.
fn apply_result(
    result: &Map,
    headers: &mut HashMap<String, String>,
    body: &mut Bytes,
    body_was_json: bool,
) -> Result<(), String> {
    if let Some(returned_headers) = result.get("headers") {
        let returned_headers = returned_headers
            .clone()
            .try_cast::<Map>()
            .ok_or_else(|| "script set `headers` to a non-object".to_string())?;
        for (name, value) in returned_headers {
            // Display of a string Dynamic is the bare string; other types
            // stringify the way the script would print them.
            headers.insert(name.to_string(), value.to_string());
        }
    }

    if let Some(returned_body) = result.get("body") {
        if !returned_body.is_unit() {
            let serialized = if body_was_json {
                let value: serde_json::Value =
                    rhai::serde::from_dynamic(returned_body).map_err(|e| e.to_string())?;
                serde_json::to_vec(&value).map_err(|e| e.to_string())?
            } else {
                returned_body.to_string().into_bytes()
            };
            if !serialized.is_empty() {
                *body = Bytes::from(serialized);
            }
        }
    }

    Ok(())
}
