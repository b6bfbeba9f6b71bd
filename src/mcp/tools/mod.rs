//! Tool registry and the built-in read-only tools.
//!
//! Each tool module exposes a `descriptor()` and an async `handle()` taking
//! a typed input. Registering a tool never touches transport code: the
//! router only sees names, descriptors, and prepared calls.

pub mod file_info;
pub mod list_files;
pub mod read_lines;
pub mod read_range;
pub mod search;
pub mod util;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::context::ToolContext;
use crate::engine::emitter::ToolOutput;
use crate::{AppError, Result};

/// Advertised description of a tool.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Build a descriptor from a JSON Schema literal.
    #[must_use]
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            input_schema,
        }
    }
}

/// A call whose arguments already passed typed validation.
pub type PreparedCall = Box<dyn FnOnce(ToolContext) -> BoxFuture<'static, Result<ToolOutput>> + Send>;

type Prepare = Arc<dyn Fn(Value) -> Result<PreparedCall> + Send + Sync>;

struct ToolRoute {
    descriptor: ToolDescriptor,
    prepare: Prepare,
}

/// Name-to-route table consulted by the router.
#[derive(Default)]
pub struct ToolRegistry {
    routes: BTreeMap<String, ToolRoute>,
}

impl ToolRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in tool.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(list_files::descriptor(), list_files::handle);
        registry.register(file_info::descriptor(), file_info::handle);
        registry.register(read_range::descriptor(), read_range::handle);
        registry.register(read_lines::descriptor(), read_lines::handle);
        registry.register(search::descriptor(), search::handle);
        registry
    }

    /// Add a tool whose arguments deserialize into `I`.
    pub fn register<I, F, Fut>(&mut self, descriptor: ToolDescriptor, handler: F)
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(ToolContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        let name = descriptor.name.clone();
        let handler = Arc::new(handler);
        let prepare: Prepare = Arc::new(move |arguments: Value| {
            let input: I = serde_json::from_value(arguments)
                .map_err(|err| AppError::InvalidParams(format!("{name}: {err}")))?;
            let handler = Arc::clone(&handler);
            let call: PreparedCall = Box::new(
                move |ctx: ToolContext| -> BoxFuture<'static, Result<ToolOutput>> {
                    Box::pin((*handler)(ctx, input))
                },
            );
            Ok(call)
        });
        self.routes.insert(
            descriptor.name.clone(),
            ToolRoute {
                descriptor,
                prepare,
            },
        );
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Descriptors in name order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        self.routes.values().map(|r| &r.descriptor).collect()
    }

    /// Validate `arguments` for `name` and return the ready-to-run call.
    ///
    /// # Errors
    ///
    /// - `AppError::UnknownMethod` if the tool is not registered.
    /// - `AppError::InvalidParams` if the arguments do not deserialize.
    pub fn prepare(&self, name: &str, arguments: Option<Value>) -> Result<PreparedCall> {
        let route = self
            .routes
            .get(name)
            .ok_or_else(|| AppError::UnknownMethod(format!("tool {name} is not registered")))?;
        (route.prepare)(arguments.unwrap_or_else(|| Value::Object(Map::new())))
    }
}

/// Wrap a tool value as a `tools/call` result.
#[must_use]
pub fn call_result(value: Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "structuredContent": value,
        "isError": false,
    })
}
