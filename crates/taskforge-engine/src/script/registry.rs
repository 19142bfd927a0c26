//! The module registry: populates a fresh `Lua` environment with the fixed
//! set of names a script is allowed to reach engine services through.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, Value as LuaValue};
use tokio::sync::watch;

use crate::delegation::DelegationFabric;
use crate::error::ErrorKind;
use crate::observability::Observability;
use crate::persistence::Store;
use crate::value::{self, Value};

fn lua_err(error: ErrorKind) -> mlua::Error {
    mlua::Error::RuntimeError(error.to_string())
}

fn duration_secs(v: Option<f64>) -> Duration {
    Duration::from_secs_f64(v.unwrap_or(0.0).max(0.0))
}

/// Registers `workflow(spec)`, binding each call to push the raw spec
/// (converted through the value bridge) into `sink`.
pub fn register_workflow_fn(lua: &Lua, sink: Rc<RefCell<Vec<Value>>>) -> mlua::Result<()> {
    let func = lua.create_function(move |_, spec: LuaValue| {
        let value = value::from_lua(spec).map_err(lua_err)?;
        sink.borrow_mut().push(value);
        Ok(())
    })?;
    lua.globals().set("workflow", func)?;
    Ok(())
}

/// Registers the `values` read-only aggregate of externally supplied
/// overrides.
pub fn register_values(lua: &Lua, values: &std::collections::HashMap<String, Value>) -> mlua::Result<()> {
    let table = lua.create_table()?;
    for (key, val) in values {
        table.set(key.as_str(), value::to_lua(lua, val)?)?;
    }
    lua.globals().set("values", table)?;
    Ok(())
}

/// Registers the `state.*` bindings over the persistent store.
pub fn register_state(lua: &Lua, store: Arc<dyn Store>) -> mlua::Result<()> {
    let table = lua.create_table()?;

    macro_rules! bind {
        ($name:expr, $f:expr) => {
            table.set($name, lua.create_async_function($f)?)?;
        };
    }

    {
        let store = store.clone();
        bind!(
            "set",
            move |lua: Lua, (key, val, ttl): (String, LuaValue, Option<f64>)| {
                let store = store.clone();
                async move {
                    let value = value::from_lua(val).map_err(lua_err)?;
                    store
                        .set(&key, value, ttl.map(|t| duration_secs(Some(t))))
                        .await
                        .map_err(lua_err)?;
                    drop(lua);
                    Ok(())
                }
            }
        );
    }
    {
        let store = store.clone();
        bind!("get", move |lua: Lua, key: String| {
            let store = store.clone();
            async move {
                let result = store.get(&key).await.map_err(lua_err)?;
                value::to_lua(&lua, &result.unwrap_or(Value::Nil))
            }
        });
    }
    {
        let store = store.clone();
        bind!("delete", move |_, key: String| {
            let store = store.clone();
            async move { store.delete(&key).await.map_err(lua_err) }
        });
    }
    {
        let store = store.clone();
        bind!("exists", move |_, key: String| {
            let store = store.clone();
            async move { store.exists(&key).await.map_err(lua_err) }
        });
    }
    {
        let store = store.clone();
        bind!("keys", move |_, pattern: String| {
            let store = store.clone();
            async move { store.keys(&pattern).await.map_err(lua_err) }
        });
    }
    {
        let store = store.clone();
        bind!("clear", move |_, pattern: String| {
            let store = store.clone();
            async move { store.clear(&pattern).await.map_err(lua_err) }
        });
    }
    {
        let store = store.clone();
        bind!("set_ttl", move |_, (key, ttl): (String, f64)| {
            let store = store.clone();
            async move {
                store
                    .set_ttl(&key, duration_secs(Some(ttl)))
                    .await
                    .map_err(lua_err)
            }
        });
    }
    {
        let store = store.clone();
        bind!("get_ttl", move |_, key: String| {
            let store = store.clone();
            async move { store.get_ttl(&key).await.map_err(lua_err) }
        });
    }
    {
        let store = store.clone();
        bind!("increment", move |_, (key, delta): (String, Option<f64>)| {
            let store = store.clone();
            async move {
                store
                    .increment(&key, delta.unwrap_or(1.0))
                    .await
                    .map_err(lua_err)
            }
        });
    }
    {
        let store = store.clone();
        bind!("decrement", move |_, (key, delta): (String, Option<f64>)| {
            let store = store.clone();
            async move {
                store
                    .increment(&key, -delta.unwrap_or(1.0))
                    .await
                    .map_err(lua_err)
            }
        });
    }
    {
        let store = store.clone();
        bind!("append", move |_, (key, s): (String, String)| {
            let store = store.clone();
            async move { store.append(&key, &s).await.map_err(lua_err) }
        });
    }
    {
        let store = store.clone();
        bind!("list_push", move |lua: Lua, (key, val): (String, LuaValue)| {
            let store = store.clone();
            async move {
                let value = value::from_lua(val).map_err(lua_err)?;
                drop(lua);
                store.list_push(&key, value).await.map_err(lua_err)
            }
        });
    }
    {
        let store = store.clone();
        bind!("list_pop", move |lua: Lua, key: String| {
            let store = store.clone();
            async move {
                let popped = store.list_pop(&key).await.map_err(lua_err)?;
                value::to_lua(&lua, &popped.unwrap_or(Value::Nil))
            }
        });
    }
    {
        let store = store.clone();
        bind!("list_length", move |_, key: String| {
            let store = store.clone();
            async move { store.list_length(&key).await.map_err(lua_err) }
        });
    }
    {
        let store = store.clone();
        bind!(
            "compare_swap",
            move |lua: Lua, (key, old, new): (String, LuaValue, LuaValue)| {
                let store = store.clone();
                async move {
                    let old = value::from_lua(old).map_err(lua_err)?;
                    let new = value::from_lua(new).map_err(lua_err)?;
                    drop(lua);
                    store.compare_and_swap(&key, old, new).await.map_err(lua_err)
                }
            }
        );
    }
    {
        let store = store.clone();
        bind!("lock", move |_, (name, ttl): (String, f64)| {
            let store = store.clone();
            async move {
                store
                    .acquire_lock(&name, duration_secs(Some(ttl)))
                    .await
                    .map_err(lua_err)
            }
        });
    }
    {
        let store = store.clone();
        bind!("try_lock", move |_, (name, ttl): (String, f64)| {
            let store = store.clone();
            async move {
                store
                    .try_lock(&name, duration_secs(Some(ttl)))
                    .await
                    .map_err(lua_err)
            }
        });
    }
    {
        let store = store.clone();
        bind!("unlock", move |_, name: String| {
            let store = store.clone();
            async move { store.release_lock(&name).await.map_err(lua_err) }
        });
    }
    {
        let store = store.clone();
        bind!(
            "with_lock",
            move |_, (name, ttl, callable): (String, f64, mlua::Function)| {
                let store = store.clone();
                async move {
                    if !store
                        .acquire_lock(&name, duration_secs(Some(ttl)))
                        .await
                        .map_err(lua_err)?
                    {
                        return Err(lua_err(ErrorKind::Busy(name)));
                    }
                    let result: mlua::Result<LuaValue> = callable.call_async(()).await;
                    let _ = store.release_lock(&name).await;
                    result
                }
            }
        );
    }
    {
        let store = store.clone();
        bind!("stats", move |lua: Lua, ()| {
            let store = store.clone();
            async move {
                let stats = store.stats().await.map_err(lua_err)?;
                let table = lua.create_table()?;
                table.set("live_keys", stats.live_keys)?;
                table.set("expired_unswept", stats.expired_unswept)?;
                table.set("active_locks", stats.active_locks)?;
                table.set("storage_bytes", stats.storage_bytes)?;
                Ok(table)
            }
        });
    }

    lua.globals().set("state", table)?;
    Ok(())
}

/// Registers `delegate_to(target, callable)`. For a local target the
/// callable is invoked directly in-process; for a remote target, the
/// callable is first invoked (with no arguments) to produce the
/// value-bridge-serialisable payload, which the fabric then dispatches —
/// the callable's contribution is computing what to send, and the fabric's
/// result is what flows back to the caller.
pub fn register_delegate_to(lua: &Lua, fabric: Arc<DelegationFabric>) -> mlua::Result<()> {
    let func = lua.create_async_function(move |lua, (target, callable): (String, mlua::Function)| {
        let fabric = fabric.clone();
        async move {
            let is_local = matches!(target.as_str(), "" | "local" | "localhost");
            if is_local {
                return callable.call_async(()).await;
            }
            let payload: LuaValue = callable.call_async(()).await?;
            let payload = value::from_lua(payload).map_err(lua_err)?;
            let (_tx, cancel) = watch::channel(false);
            let result = fabric
                .invoke(&target, payload, Duration::from_secs(3600), cancel)
                .await
                .map_err(lua_err)?;
            value::to_lua(&lua, &result)
        }
    })?;
    lua.globals().set("delegate_to", func)?;
    Ok(())
}

/// Registers the `observability.*` bindings.
pub fn register_observability(lua: &Lua, observability: Arc<Observability>) -> mlua::Result<()> {
    let table = lua.create_table()?;

    {
        let observability = observability.clone();
        table.set(
            "start_trace",
            lua.create_function(move |_, ()| Ok(observability.start_trace().to_string()))?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "end_trace",
            lua.create_function(move |_, trace: String| {
                if let Ok(id) = trace.parse() {
                    observability.end_trace(id);
                }
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "start_span",
            lua.create_function(move |_, (trace, name): (String, String)| {
                let Ok(trace_id) = trace.parse() else {
                    return Ok(None);
                };
                Ok(observability.start_span(trace_id, name, None).map(|id| id.to_string()))
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "end_span",
            lua.create_function(move |_, (trace, span): (String, String)| {
                if let (Ok(trace_id), Ok(span_id)) = (trace.parse(), span.parse()) {
                    observability.end_span(trace_id, span_id);
                }
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "add_span_event",
            lua.create_function(move |_, (trace, span, name): (String, String, String)| {
                if let (Ok(trace_id), Ok(span_id)) = (trace.parse(), span.parse()) {
                    observability.add_span_event(trace_id, span_id, name);
                }
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "add_span_tag",
            lua.create_function(move |_, (trace, span, key, value): (String, String, String, String)| {
                if let (Ok(trace_id), Ok(span_id)) = (trace.parse(), span.parse()) {
                    observability.add_span_tag(trace_id, span_id, key, value);
                }
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "counter",
            lua.create_function(move |_, (name, delta): (String, f64)| {
                observability.counter(name, delta, std::collections::HashMap::new());
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "gauge",
            lua.create_function(move |_, (name, value): (String, f64)| {
                observability.gauge(name, value, std::collections::HashMap::new());
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "histogram",
            lua.create_function(move |_, (name, value): (String, f64)| {
                observability.histogram(name, value, std::collections::HashMap::new());
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "timer_start",
            lua.create_function(move |_, name: String| {
                observability.timer_start(name, std::collections::HashMap::new());
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "timer_end",
            lua.create_function(move |_, name: String| {
                observability.timer_end(&name);
                Ok(())
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "export_json",
            lua.create_function(move |_, ()| {
                serde_json::to_string(&observability.export_json())
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
            })?,
        )?;
    }
    {
        let observability = observability.clone();
        table.set(
            "health_check",
            lua.create_function(move |_, ()| {
                serde_json::to_string(&observability.health_check())
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
            })?,
        )?;
    }

    lua.globals().set("observability", table)?;
    Ok(())
}
