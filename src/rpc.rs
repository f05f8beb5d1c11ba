//! Method tables for the file-as-call pattern.
//!
//! A service is a directory with one file per method. A caller opens the
//! method file for write, writes a JSON [`Call`], closes it (which runs the
//! handler) and reads the JSON [`Return`] back.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// JSON type a parameter or return value must have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Any,
    Null,
    Bool,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl ValueType {
    pub fn admits(self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::Null => value.is_null(),
            ValueType::Bool => value.is_boolean(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Number => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        }
    }
}

type Handler = dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync;

/// One callable entry of a method table.
#[derive(Clone)]
pub struct Method {
    name: String,
    params: Vec<ValueType>,
    returns: ValueType,
    handler: Arc<Handler>,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish()
    }
}

impl Method {
    pub fn new<F>(name: &str, params: Vec<ValueType>, returns: ValueType, handler: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            params,
            returns,
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn returns(&self) -> ValueType {
        self.returns
    }

    /// Type-check `params`, run the handler and type-check its result.
    pub fn invoke(&self, params: &[Value]) -> Result<Value> {
        if params.len() != self.params.len() {
            return Err(Error::Rpc(format!(
                "{} takes {} parameters, got {}",
                self.name,
                self.params.len(),
                params.len()
            )));
        }
        for (idx, (want, value)) in self.params.iter().zip(params).enumerate() {
            if !want.admits(value) {
                return Err(Error::Rpc(format!(
                    "{} parameter {} must be {:?}",
                    self.name, idx, want
                )));
            }
        }
        let value = (self.handler)(params).map_err(Error::Rpc)?;
        if !self.returns.admits(&value) {
            return Err(Error::Rpc(format!(
                "{} returned a value that is not {:?}",
                self.name, self.returns
            )));
        }
        Ok(value)
    }

    /// Run a serialized call and produce the serialized reply. Failures are
    /// reported inside the reply envelope.
    pub fn dispatch(&self, payload: &[u8]) -> Vec<u8> {
        let reply = match self.decode_call(payload).and_then(|params| self.invoke(&params)) {
            Ok(result) => Return::Ok { result },
            Err(e) => {
                warn!("call to {} failed: {}", self.name, e);
                Return::Err {
                    error: match e {
                        Error::Rpc(msg) => msg,
                        other => other.to_string(),
                    },
                }
            }
        };
        serde_json::to_vec(&reply).unwrap_or_else(|e| {
            format!("{{\"error\":{:?}}}", e.to_string()).into_bytes()
        })
    }

    fn decode_call(&self, payload: &[u8]) -> Result<Vec<Value>> {
        let call: Call = serde_json::from_slice(payload)?;
        if call.method != self.name {
            return Err(Error::Rpc(format!(
                "call to {} sent to {}",
                call.method, self.name
            )));
        }
        debug!("invoking {} with {} params", self.name, call.params.len());
        Ok(call.params)
    }
}

/// Request envelope written to a method file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Call {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }
}

/// Reply envelope read back from a method file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Return {
    Ok { result: Value },
    Err { error: String },
}

impl Return {
    pub fn into_result(self) -> Result<Value> {
        match self {
            Return::Ok { result } => Ok(result),
            Return::Err { error } => Err(Error::Rpc(error)),
        }
    }
}

/// Name-ordered set of methods built once when a service is registered.
#[derive(Clone, Debug, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, Arc<Method>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: Method) -> Result<()> {
        if self.methods.contains_key(method.name()) {
            return Err(Error::Exists(method.name().to_string()));
        }
        self.methods.insert(method.name().to_string(), Arc::new(method));
        Ok(())
    }

    /// Builder form of [`MethodTable::register`]; a duplicate name replaces
    /// the earlier entry.
    pub fn with(mut self, method: Method) -> Self {
        self.methods.insert(method.name().to_string(), Arc::new(method));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Method>> {
        self.methods.values()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn greet() -> Method {
        Method::new("greet", vec![ValueType::String], ValueType::String, |params| {
            let who = params[0].as_str().unwrap_or_default();
            Ok(Value::from(format!("hello {who}")))
        })
    }

    #[test]
    fn dispatch_produces_result_envelope() {
        let reply = greet().dispatch(br#"{"method":"greet","params":["world"]}"#);
        assert_eq!(reply, br#"{"result":"hello world"}"#.to_vec());
    }

    #[test]
    fn failures_become_error_envelopes() {
        let method = greet();
        let wrong_type: Return =
            serde_json::from_slice(&method.dispatch(br#"{"method":"greet","params":[1]}"#))
                .unwrap();
        assert!(matches!(wrong_type, Return::Err { .. }));

        let wrong_name: Return =
            serde_json::from_slice(&method.dispatch(br#"{"method":"other","params":["x"]}"#))
                .unwrap();
        assert!(matches!(wrong_name.into_result(), Err(Error::Rpc(_))));

        let garbage: Return = serde_json::from_slice(&method.dispatch(b"{nope")).unwrap();
        assert!(matches!(garbage, Return::Err { .. }));
    }

    #[test]
    fn handler_errors_and_bad_returns_are_reported() {
        let failing = Method::new("fail", vec![], ValueType::Any, |_| Err("boom".into()));
        assert!(matches!(failing.invoke(&[]), Err(Error::Rpc(msg)) if msg == "boom"));

        let liar = Method::new("liar", vec![], ValueType::Integer, |_| Ok(json!("x")));
        assert!(liar.invoke(&[]).is_err());
        assert!(liar.invoke(&[json!(1)]).is_err());
    }

    #[test]
    fn table_rejects_duplicates() {
        let mut table = MethodTable::new();
        table.register(greet()).unwrap();
        assert!(matches!(table.register(greet()), Err(Error::Exists(_))));
        assert_eq!(table.len(), 1);
        assert!(table.get("greet").is_some());
        let table = table.with(Method::new("echo", vec![ValueType::Any], ValueType::Any, |p| {
            Ok(p[0].clone())
        }));
        let names: Vec<_> = table.iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, ["echo", "greet"]);
    }

    #[test]
    fn null_result_round_trips() {
        let reply: Return = serde_json::from_str(r#"{"result":null}"#).unwrap();
        assert_eq!(reply, Return::Ok { result: Value::Null });
    }
}
