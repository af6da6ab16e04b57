//! Time-boxed Lua sandbox for `script`, `condition` and `switch` nodes.
//!
//! Scripts get the `table`, `string`, `math` and `utf8` libraries only;
//! file, process, module loading, chunk loading and protected calls are
//! unavailable, and `print` goes to the log. The caller's variables form the script's
//! global scope through a private environment table, so whatever the
//! script assigns at top level can be read back as its outputs.
//!
//! Deadlines are enforced twice: an instruction-count hook raises once the
//! wall clock passes the deadline, and the blocking task is abandoned if
//! it still has not returned shortly after. Without `pcall` and `xpcall`
//! nothing in the script can catch the hook's error, so it always unwinds
//! to the host and frees the blocking thread.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Value as LuaValue, VmState};
use serde_json::Value;
use tracing::debug;

use thinkflow_core::error::{Result, ThinkflowError};

/// Instructions between deadline checks.
const HOOK_INTERVAL: u32 = 1_000;
/// Upper bound on interpreter heap per script.
const MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;
/// Extra time given to the blocking task before it is abandoned.
const ABANDON_GRACE: Duration = Duration::from_millis(100);

const REMOVED_GLOBALS: [&str; 7] = [
    "dofile",
    "loadfile",
    "load",
    "require",
    "collectgarbage",
    "pcall",
    "xpcall",
];

/// What a script left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutput {
    /// Serializable top-level variables after the script ran.
    pub scope: HashMap<String, Value>,
    /// The chunk's first return value, if any.
    pub returned: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    default_timeout: Duration,
}

enum ScriptFailure {
    Timeout,
    Error(String),
}

impl From<mlua::Error> for ScriptFailure {
    fn from(e: mlua::Error) -> Self {
        ScriptFailure::Error(e.to_string())
    }
}

impl ScriptSandbox {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Run `source` with `scope` as its initial globals.
    pub async fn run(
        &self,
        node_id: &str,
        source: &str,
        scope: HashMap<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<ScriptOutput> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let chunk_name = format!("={}", node_id);
        let source = source.to_string();

        let task =
            tokio::task::spawn_blocking(move || run_blocking(&chunk_name, &source, scope, deadline));

        let timeout_err = || ThinkflowError::ScriptTimeout {
            node: node_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        match tokio::time::timeout(timeout + ABANDON_GRACE, task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(ScriptFailure::Timeout))) => Err(timeout_err()),
            Ok(Ok(Err(ScriptFailure::Error(message)))) => Err(ThinkflowError::Script {
                node: node_id.to_string(),
                message,
            }),
            Ok(Err(join_err)) => Err(ThinkflowError::Script {
                node: node_id.to_string(),
                message: join_err.to_string(),
            }),
            Err(_) => Err(timeout_err()),
        }
    }
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

fn run_blocking(
    chunk_name: &str,
    source: &str,
    scope: HashMap<String, Value>,
    deadline: Instant,
) -> std::result::Result<ScriptOutput, ScriptFailure> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(MEMORY_LIMIT_BYTES)?;

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_, _| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError("script deadline exceeded".into()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(name, LuaValue::Nil)?;
    }
    let log_name = chunk_name.trim_start_matches('=').to_string();
    let print = lua.create_function(move |_, args: mlua::Variadic<LuaValue>| {
        let line = args.iter().map(display).collect::<Vec<_>>().join("\t");
        debug!(node_id = %log_name, output = %line, "Script print");
        Ok(())
    })?;
    globals.set("print", print)?;

    let env = lua.create_table()?;
    for (name, value) in &scope {
        env.set(name.as_str(), lua.to_value(value)?)?;
    }
    let meta = lua.create_table()?;
    meta.set("__index", globals)?;
    env.set_metatable(Some(meta));

    let returned = lua
        .load(source)
        .set_name(chunk_name.to_string())
        .set_environment(env.clone())
        .eval::<LuaValue>();

    let returned = match returned {
        Ok(value) => value,
        Err(_) if Instant::now() >= deadline => return Err(ScriptFailure::Timeout),
        Err(e) => return Err(e.into()),
    };

    let mut output = ScriptOutput {
        returned: to_json(&lua, returned),
        ..Default::default()
    };
    for pair in env.clone().pairs::<String, LuaValue>() {
        let Ok((name, value)) = pair else { continue };
        if let Some(json) = to_json(&lua, value) {
            output.scope.insert(name, json);
        }
    }
    Ok(output)
}

/// Convert a Lua value to JSON, dropping functions, threads and values
/// that have no JSON form.
fn to_json(lua: &Lua, value: LuaValue) -> Option<Value> {
    match value {
        LuaValue::Nil
        | LuaValue::Function(_)
        | LuaValue::Thread(_)
        | LuaValue::UserData(_)
        | LuaValue::Error(_) => None,
        other => lua.from_value::<Value>(other).ok(),
    }
}

fn display(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}
