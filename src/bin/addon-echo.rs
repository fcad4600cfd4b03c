//! Reference add-on used by the host's integration tests.
//!
//! Reads one JSON request per stdin line and writes one JSON response per
//! stdout line.
//!
//! Usage: addon-echo [OPTIONS]
//!
//! Options:
//!   --stderr-lines N     Write N diagnostic lines to stderr at startup
//!   --delay-ms N         Wait N milliseconds before every response
//!   --mismatch           Answer with a wrong correlation id
//!   --fail-once PATH     Exit at startup unless PATH exists (creates it)
//!   --always-fail        Exit at startup

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use addon_host::addon::protocol::{
    AddonCommand, CommandList, INVALID_PARAMS, METHOD_GET_COMMANDS, METHOD_NOT_FOUND, METHOD_PING,
    METHOD_RUN_COMMAND, RpcRequest, RpcResponse, RunCommandParams,
};

#[derive(Debug, Default)]
struct Options {
    stderr_lines: u32,
    delay: Duration,
    mismatch: bool,
    fail_once: Option<PathBuf>,
    always_fail: bool,
}

fn parse_options() -> Options {
    let mut options = Options::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stderr-lines" => {
                options.stderr_lines = args.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            "--delay-ms" => {
                let ms = args.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                options.delay = Duration::from_millis(ms);
            }
            "--mismatch" => options.mismatch = true,
            "--fail-once" => options.fail_once = args.next().map(PathBuf::from),
            "--always-fail" => options.always_fail = true,
            other => eprintln!("addon-echo: ignoring argument {}", other),
        }
    }
    options
}

fn commands() -> Vec<AddonCommand> {
    vec![
        AddonCommand {
            id: "echo.hello".into(),
            name: "Say Hello".into(),
            description: "Returns a greeting".into(),
        },
        AddonCommand {
            id: "echo.time".into(),
            name: "Current Time".into(),
            description: "Returns the add-on's clock".into(),
        },
    ]
}

fn handle(request: &RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        METHOD_PING => RpcResponse::success(id, json!({ "pong": true })),
        METHOD_GET_COMMANDS => match serde_json::to_value(CommandList {
            commands: commands(),
        }) {
            Ok(list) => RpcResponse::success(id, list),
            Err(e) => RpcResponse::error(id, INVALID_PARAMS, e.to_string()),
        },
        METHOD_RUN_COMMAND => {
            match serde_json::from_value::<RunCommandParams>(request.params.clone()) {
                Ok(params) if params.id == "echo.hello" => {
                    RpcResponse::success(id, json!({ "message": "Hello from addon-echo" }))
                }
                Ok(params) if params.id == "echo.time" => RpcResponse::success(
                    id,
                    json!({ "time": chrono::Utc::now().to_rfc3339() }),
                ),
                Ok(params) => {
                    RpcResponse::error(id, INVALID_PARAMS, format!("unknown command: {}", params.id))
                }
                Err(e) => RpcResponse::error(id, INVALID_PARAMS, e.to_string()),
            }
        }
        "echo" => RpcResponse::success(id, request.params.clone()),
        "log" => {
            let text = request
                .params
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            eprintln!("{}", text);
            RpcResponse::success(id, json!({}))
        }
        "exit" => process::exit(3),
        other => RpcResponse::error(id, METHOD_NOT_FOUND, format!("method not found: {}", other)),
    }
}

fn main() {
    let options = parse_options();

    if options.always_fail {
        eprintln!("addon-echo: failing on purpose");
        process::exit(1);
    }
    if let Some(marker) = &options.fail_once {
        if !marker.exists() {
            let _ = std::fs::write(marker, b"failed once");
            eprintln!("addon-echo: first start fails");
            process::exit(1);
        }
    }

    for i in 1..=options.stderr_lines {
        eprintln!("addon-echo stderr {}", i);
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("addon-echo: bad request: {}", e);
                continue;
            }
        };

        if !options.delay.is_zero() {
            thread::sleep(options.delay);
        }

        let mut response = handle(&request);
        if options.mismatch {
            response.id = format!("{}-other", response.id);
        }

        let Ok(encoded) = serde_json::to_string(&response) else {
            continue;
        };
        if writeln!(stdout, "{}", encoded).and_then(|()| stdout.flush()).is_err() {
            break;
        }
    }
}
