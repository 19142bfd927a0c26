//! The value bridge.
//!
//! Converts between script values (as produced by `mlua`) and the engine's
//! own [`Value`] representation, which is what the persistent store,
//! delegation fabric, and task catalogue all traffic in. Keeping a single
//! discriminated union at this boundary means the rest of the engine never
//! has to know a Lua interpreter exists.

use std::collections::BTreeMap;

use mlua::Lua;
use serde_json::Number;

use crate::error::ErrorKind;

/// An engine-native value: the intersection of what scripts can produce and
/// what the store/fabric can serialise.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Sequence(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Deep structural equality, as used by `compare_and_swap`.
    pub fn deep_eq(&self, other: &Value) -> bool {
        self == other
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Convert a Lua value into the engine's [`Value`].
///
/// Tables whose keys are consecutive positive integers starting at 1 are
/// treated as an ordered [`Value::Sequence`]; any other table becomes a
/// [`Value::Map`] with keys coerced to strings. Nesting is unbounded but
/// terminates because script-produced tables are acyclic by construction.
pub fn from_lua(value: mlua::Value) -> Result<Value, ErrorKind> {
    match value {
        mlua::Value::Nil => Ok(Value::Nil),
        mlua::Value::Boolean(b) => Ok(Value::Boolean(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(i as f64)),
        mlua::Value::Number(n) => Ok(Value::Number(n)),
        mlua::Value::String(s) => Ok(Value::String(
            s.to_str()
                .map_err(|e| ErrorKind::InvalidValue(e.to_string()))?
                .to_string(),
        )),
        mlua::Value::Table(table) => from_lua_table(&table),
        mlua::Value::Function(_) => Err(ErrorKind::InvalidValue(
            "function values are not serialisable".to_string(),
        )),
        mlua::Value::UserData(_) => Err(ErrorKind::InvalidValue(
            "userdata values are not serialisable".to_string(),
        )),
        other => Err(ErrorKind::InvalidValue(format!(
            "unsupported Lua value: {other:?}"
        ))),
    }
}

fn from_lua_table(table: &mlua::Table) -> Result<Value, ErrorKind> {
    let len = table.raw_len();
    let is_sequence = len > 0
        && (1..=len).all(|i| {
            table
                .raw_get::<mlua::Value>(i as i64)
                .map(|v| !matches!(v, mlua::Value::Nil))
                .unwrap_or(false)
        })
        && table.pairs::<mlua::Value, mlua::Value>().count() == len;

    if is_sequence {
        let mut seq = Vec::with_capacity(len);
        for i in 1..=len {
            let v: mlua::Value = table
                .raw_get(i as i64)
                .map_err(|e| ErrorKind::InvalidValue(e.to_string()))?;
            seq.push(from_lua(v)?);
        }
        return Ok(Value::Sequence(seq));
    }

    let mut map = BTreeMap::new();
    for pair in table.pairs::<mlua::Value, mlua::Value>() {
        let (k, v) = pair.map_err(|e| ErrorKind::InvalidValue(e.to_string()))?;
        let key = match k {
            mlua::Value::String(s) => s
                .to_str()
                .map_err(|e| ErrorKind::InvalidValue(e.to_string()))?
                .to_string(),
            mlua::Value::Integer(i) => i.to_string(),
            mlua::Value::Number(n) => n.to_string(),
            other => {
                return Err(ErrorKind::InvalidValue(format!(
                    "unsupported table key: {other:?}"
                )))
            }
        };
        map.insert(key, from_lua(v)?);
    }
    Ok(Value::Map(map))
}

/// Convert an engine [`Value`] back into a Lua value bound to the given
/// interpreter, for handing results back to script callables.
pub fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    match value {
        Value::Nil => Ok(mlua::Value::Nil),
        Value::Boolean(b) => Ok(mlua::Value::Boolean(*b)),
        Value::Number(n) => Ok(mlua::Value::Number(*n)),
        Value::String(s) => Ok(mlua::Value::String(lua.create_string(s)?)),
        Value::Sequence(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set(i as i64 + 1, to_lua(lua, item)?)?;
            }
            Ok(mlua::Value::Table(table))
        }
        Value::Map(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), to_lua(lua, v)?)?;
            }
            Ok(mlua::Value::Table(table))
        }
    }
}

/// Convert an engine [`Value`] into `serde_json::Value`, used by the
/// persistent store backends to serialise list/map kinds uniformly.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Sequence(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
    }
}

pub fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Sequence(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), from_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua() -> Lua {
        Lua::new()
    }

    #[test]
    fn sequence_round_trip() {
        let lua = lua();
        let table: mlua::Table = lua.load("return {1, 2, 3}").eval().unwrap();
        let v = from_lua(mlua::Value::Table(table)).unwrap();
        assert_eq!(
            v,
            Value::Sequence(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
        );
    }

    #[test]
    fn map_round_trip() {
        let lua = lua();
        let table: mlua::Table = lua.load("return {name = 'a', count = 2}").eval().unwrap();
        let v = from_lua(mlua::Value::Table(table)).unwrap();
        match v {
            Value::Map(m) => {
                assert_eq!(m.get("name"), Some(&Value::String("a".to_string())));
                assert_eq!(m.get("count"), Some(&Value::Number(2.0)));
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn function_is_invalid() {
        let lua = lua();
        let f: mlua::Function = lua.load("return function() end").eval().unwrap();
        let result = from_lua(mlua::Value::Function(f));
        assert!(matches!(result, Err(ErrorKind::InvalidValue(_))));
    }

    #[test]
    fn json_round_trip_nested() {
        let mut inner = BTreeMap::new();
        inner.insert("a".to_string(), Value::Number(1.0));
        let v = Value::Sequence(vec![Value::Map(inner), Value::String("x".to_string())]);
        let json = to_json(&v);
        let back = from_json(&json);
        assert_eq!(v, back);
    }
}
