use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

mod cloud_api;
mod launcher;
mod resolver;

use crate::cloud_api::{ClientSet, HookStatus};
use crate::launcher::{AdminCredentials, PlacementConstraints, TaskSubmission};

const LOG_TAG: &str = "deploy-task-launcher";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:25311";
const DEFAULT_HOOK_COMMAND: &str = "migrate";
const DEFAULT_PERIODIC_COMMAND: &str = "background-jobs";
const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 900;
const HOOK_ROUTE: &str = "/hooks/deployment";

// Environment variable names (external interface). All variables use the
// DTL_ prefix to avoid colliding with the services being launched.
const ENV_PROFILE: &str = "DTL_ENV";
const ENV_CLUSTER: &str = "DTL_CLUSTER";
const ENV_SERVICE: &str = "DTL_SERVICE";
const ENV_CONTAINER_NAME: &str = "DTL_CONTAINER_NAME";
const ENV_SECURITY_GROUPS: &str = "DTL_SECURITY_GROUPS";
const ENV_SUBNETS: &str = "DTL_SUBNETS";
const ENV_ASSIGN_PUBLIC_ADDRESS: &str = "DTL_ASSIGN_PUBLIC_ADDRESS";
const ENV_HOOK_COMMAND: &str = "DTL_HOOK_COMMAND";
const ENV_PERIODIC_COMMAND: &str = "DTL_PERIODIC_COMMAND";
const ENV_ADMIN_EMAIL: &str = "DTL_ADMIN_EMAIL";
const ENV_ADMIN_PASSWORD_SECRET: &str = "DTL_ADMIN_PASSWORD_SECRET";
const ENV_DATABASE_ADMIN_PASSWORD_SECRET: &str = "DTL_DATABASE_ADMIN_PASSWORD_SECRET";
const ENV_DATABASE_ADMIN_USER: &str = "DTL_DATABASE_ADMIN_USER";
const ENV_HTTP_ADDR: &str = "DTL_HTTP_ADDR";
const ENV_SCHEDULER_INTERVAL_SECS: &str = "DTL_SCHEDULER_INTERVAL_SECS";
const ENV_SCHEDULER_MIN_INTERVAL_SECS: &str = "DTL_SCHEDULER_MIN_INTERVAL_SECS";
const ENV_SCHEDULER_MAX_TICKS: &str = "DTL_SCHEDULER_MAX_TICKS";

// The invocation record the deployment orchestrator posts to the hook
// route. Field names are the orchestrator's, not ours.
#[derive(Clone, Debug, Deserialize)]
struct HookEvent {
    #[serde(rename = "DeploymentId")]
    deployment_id: String,
    #[serde(rename = "LifecycleEventHookExecutionId")]
    hook_execution_id: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PipelineKind {
    HookTriggered,
    Periodic,
}

impl PipelineKind {
    fn as_str(self) -> &'static str {
        match self {
            PipelineKind::HookTriggered => "hook",
            PipelineKind::Periodic => "periodic",
        }
    }
}

#[derive(Clone, Debug)]
struct PipelineFailure {
    code: &'static str,
    message: String,
}

impl PipelineFailure {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

struct RequestContext {
    method: String,
    path: String,
    body: Vec<u8>,
    invocation_id: String,
}

fn main() {
    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| "deploy-task-launcher".into());
    let Some(raw_cmd) = args.next() else {
        print_usage(&exe);
        std::process::exit(1);
    };

    let command = normalize_command(&raw_cmd);
    let remaining: Vec<String> = args.collect();

    match command.as_str() {
        "server" => run_server(),
        "http-server" => run_http_server_cli(&remaining),
        "periodic" => run_periodic_cli(&remaining),
        "scheduler" => run_scheduler_cli(&remaining),
        "version" => {
            println!("{}", release_tag());
            std::process::exit(0);
        }
        "help" => {
            print_usage(&exe);
            std::process::exit(0);
        }
        _ => {
            eprintln!("unknown command: {raw_cmd}");
            print_usage(&exe);
            std::process::exit(2);
        }
    }
}

fn normalize_command(raw: &str) -> String {
    raw.trim_start_matches('-').to_lowercase()
}

fn release_tag() -> String {
    if let Some(tag) = option_env!("DTL_BUILD_TAG") {
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let version = option_env!("DTL_BUILD_VERSION")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(env!("CARGO_PKG_VERSION"));

    format!("v{version}")
}

fn print_usage(exe: &str) {
    eprintln!("Usage: {exe} <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  server       handle one hook invocation on stdin/stdout");
    eprintln!("  http-server  accept TCP connections, one child process per invocation");
    eprintln!("  periodic     run the periodic pipeline once");
    eprintln!("  scheduler    run the periodic pipeline on an interval");
    eprintln!("  version      print the release tag");
    eprintln!("  help         show this message");
}

fn runtime_profile() -> String {
    env::var(ENV_PROFILE)
        .unwrap_or_else(|_| "dev".to_string())
        .to_ascii_lowercase()
}

pub(crate) fn is_test_profile() -> bool {
    matches!(runtime_profile().as_str(), "test" | "testing")
}

pub(crate) fn current_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn log_message(message: &str) {
    // Try system logger first; fall back to stderr so container logs
    // capture it. stdout stays reserved for the invocation response.
    let _ = Command::new("logger")
        .arg("-t")
        .arg(LOG_TAG)
        .arg(message)
        .status();
    eprintln!("{message}");
}

fn next_invocation_id() -> String {
    format!("inv_{}", nanoid::nanoid!(10))
}

fn env_trimmed(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_required(name: &str) -> Result<String, String> {
    env_trimmed(name).ok_or_else(|| format!("missing required environment variable {name}"))
}

fn env_optional(name: &str, default: &str) -> String {
    env_trimmed(name).unwrap_or_else(|| default.to_string())
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_trimmed(name).map(|v| v.to_ascii_lowercase()) {
        Some(value) => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_trimmed(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_command(name: &str, default: &str) -> Vec<String> {
    env_optional(name, default)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

// Where the one-off task lands: cluster, target container and network
// placement. Required by both pipelines.
#[derive(Clone, Debug)]
struct LaunchTarget {
    cluster: String,
    container_name: String,
    placement: PlacementConstraints,
}

impl LaunchTarget {
    fn load() -> Result<Self, String> {
        Ok(Self {
            cluster: env_required(ENV_CLUSTER)?,
            container_name: env_required(ENV_CONTAINER_NAME)?,
            placement: PlacementConstraints {
                security_groups: env_list(ENV_SECURITY_GROUPS),
                subnets: env_list(ENV_SUBNETS),
                assign_public_address: env_flag(ENV_ASSIGN_PUBLIC_ADDRESS, true),
            },
        })
    }
}

fn load_admin_credentials() -> Result<AdminCredentials, String> {
    Ok(AdminCredentials {
        admin_email: env_required(ENV_ADMIN_EMAIL)?,
        admin_password_secret: env_required(ENV_ADMIN_PASSWORD_SECRET)?,
        database_admin_password_secret: env_required(ENV_DATABASE_ADMIN_PASSWORD_SECRET)?,
        database_admin_user: env_required(ENV_DATABASE_ADMIN_USER)?,
    })
}

fn run_hook_pipeline(
    clients: &ClientSet,
    invocation_id: &str,
    event: &HookEvent,
) -> Result<(), PipelineFailure> {
    let target = LaunchTarget::load().map_err(|err| PipelineFailure::new("config-invalid", err))?;
    let credentials =
        load_admin_credentials().map_err(|err| PipelineFailure::new("config-invalid", err))?;
    let command = env_command(ENV_HOOK_COMMAND, DEFAULT_HOOK_COMMAND);

    log_message(&format!(
        "{invocation_id} {}-start deployment={} cluster={} container={} clients={}",
        PipelineKind::HookTriggered.as_str(),
        event.deployment_id,
        target.cluster,
        target.container_name,
        clients.kind()
    ));

    let spec = resolver::resolve_for_deployment(
        clients.deploy.as_ref(),
        clients.tasks.as_ref(),
        &event.deployment_id,
    )
    .map_err(|err| PipelineFailure::new(err.code(), err.to_string()))?;

    let environment = launcher::credential_env(clients.secrets.as_ref(), &credentials)
        .map_err(|err| PipelineFailure::new(err.code, err.message.clone()))?;

    let request = launcher::build_override(&spec, &target.container_name, &command, &environment);
    let submission = TaskSubmission {
        cluster: target.cluster,
        request,
        placement: target.placement,
    };

    launcher::launch(clients.tasks.as_ref(), &submission)
        .map_err(|err| PipelineFailure::new(err.code(), err.to_string()))?;

    log_message(&format!(
        "{invocation_id} hook-launched deployment={} task-definition={}",
        event.deployment_id, spec.task_definition
    ));

    // Acceptance is reported as success; the task runs asynchronously and
    // is never polled here.
    clients
        .deploy
        .put_hook_status(
            &event.deployment_id,
            &event.hook_execution_id,
            HookStatus::Succeeded,
        )
        .map_err(|err| PipelineFailure::new("report-rejected", err.to_string()))?;

    log_message(&format!(
        "{invocation_id} hook-reported deployment={} status=Succeeded",
        event.deployment_id
    ));
    Ok(())
}

fn run_periodic_pipeline(clients: &ClientSet, invocation_id: &str) -> Result<(), PipelineFailure> {
    let target = LaunchTarget::load().map_err(|err| PipelineFailure::new("config-invalid", err))?;
    let service =
        env_required(ENV_SERVICE).map_err(|err| PipelineFailure::new("config-invalid", err))?;
    let command = env_command(ENV_PERIODIC_COMMAND, DEFAULT_PERIODIC_COMMAND);

    log_message(&format!(
        "{invocation_id} {}-start cluster={} service={} container={} clients={}",
        PipelineKind::Periodic.as_str(),
        target.cluster,
        service,
        target.container_name,
        clients.kind()
    ));

    let spec = resolver::resolve_for_service(clients.tasks.as_ref(), &target.cluster, &service)
        .map_err(|err| PipelineFailure::new(err.code(), err.to_string()))?;

    let request = launcher::build_override(&spec, &target.container_name, &command, &[]);
    let submission = TaskSubmission {
        cluster: target.cluster,
        request,
        placement: target.placement,
    };

    launcher::launch(clients.tasks.as_ref(), &submission)
        .map_err(|err| PipelineFailure::new(err.code(), err.to_string()))?;

    log_message(&format!(
        "{invocation_id} periodic-launched service={service} task-definition={}",
        spec.task_definition
    ));
    Ok(())
}

fn run_periodic_cli(_args: &[String]) -> ! {
    let clients = match cloud_api::build_clients() {
        Ok(clients) => clients,
        Err(err) => {
            log_message(&format!("500 periodic config-invalid {err}"));
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let invocation_id = next_invocation_id();
    match run_periodic_pipeline(&clients, &invocation_id) {
        Ok(()) => std::process::exit(0),
        Err(failure) => {
            log_message(&format!(
                "{invocation_id} periodic-failed code={} {}",
                failure.code, failure.message
            ));
            std::process::exit(1);
        }
    }
}

fn run_scheduler_cli(args: &[String]) -> ! {
    let interval = env_u64(ENV_SCHEDULER_INTERVAL_SECS, DEFAULT_SCHEDULER_INTERVAL_SECS);
    let mut max_ticks = env_trimmed(ENV_SCHEDULER_MAX_TICKS).and_then(|v| v.parse::<u64>().ok());

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--max-ticks" => {
                max_ticks = iter.next().and_then(|v| v.parse::<u64>().ok());
                if max_ticks.is_none() {
                    eprintln!("--max-ticks requires a number");
                    std::process::exit(2);
                }
            }
            other => {
                eprintln!("unknown scheduler option: {other}");
                std::process::exit(2);
            }
        }
    }

    match run_scheduler_loop(interval, max_ticks) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            log_message(&format!("500 scheduler-failed {err}"));
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn scheduler_sleep_duration(interval_secs: u64) -> Duration {
    let min_interval = env_u64(ENV_SCHEDULER_MIN_INTERVAL_SECS, 60);
    Duration::from_secs(interval_secs.max(min_interval))
}

fn run_scheduler_loop(interval_secs: u64, max_ticks: Option<u64>) -> Result<(), String> {
    let clients = cloud_api::build_clients()?;
    let sleep = scheduler_sleep_duration(interval_secs);
    let mut ticks: u64 = 0;

    loop {
        ticks = ticks.saturating_add(1);
        let invocation_id = next_invocation_id();
        log_message(&format!("{invocation_id} scheduler tick={ticks}"));

        // A failed tick is logged and skipped; the next interval runs the
        // pipeline from scratch.
        if let Err(failure) = run_periodic_pipeline(&clients, &invocation_id) {
            log_message(&format!(
                "{invocation_id} scheduler-tick-failed tick={ticks} code={} {}",
                failure.code, failure.message
            ));
        }

        if let Some(limit) = max_ticks {
            if ticks >= limit {
                break;
            }
        }
        thread::sleep(sleep);
    }

    Ok(())
}

fn run_server() -> ! {
    if let Err(err) = handle_invocation() {
        log_message(&format!("500 internal-error {err}"));
        let _ = write_response(
            500,
            "InternalServerError",
            &json!({ "error": "internal", "message": err }).to_string(),
        );
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn handle_invocation() -> Result<(), String> {
    let invocation_id = next_invocation_id();

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|e| e.to_string())?;
    let request_line = request_line.trim_end_matches(['\r', '\n']).to_string();

    let (method, path) = parse_request_line(&request_line);
    if method.is_empty() || path.is_empty() {
        log_message(&format!("{invocation_id} 400 bad-request {request_line}"));
        return send_json_response(
            400,
            "BadRequest",
            &json!({ "error": "bad-request", "message": "malformed request line" }),
        );
    }

    let headers = read_headers(&mut reader)?;

    // Only read a body when the dispatcher signals one; reading to EOF
    // would deadlock while it keeps the socket open.
    let mut body = Vec::new();
    if let Some(len) = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        body.resize(len, 0);
        reader
            .read_exact(&mut body)
            .map_err(|e| format!("failed to read body: {e}"))?;
    }

    let ctx = RequestContext {
        method,
        path,
        body,
        invocation_id,
    };
    route_request(&ctx)
}

fn parse_request_line(request_line: &str) -> (String, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("");
    let path = target.split('?').next().unwrap_or("").to_string();
    (method, path)
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).map_err(|e| e.to_string())?;
        if read == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

fn route_request(ctx: &RequestContext) -> Result<(), String> {
    if ctx.method == "GET" && ctx.path == "/health" {
        return handle_health(ctx);
    }
    if ctx.path == HOOK_ROUTE {
        return handle_hook_request(ctx);
    }

    log_message(&format!(
        "{} 404 {} {}",
        ctx.invocation_id, ctx.method, ctx.path
    ));
    send_json_response(404, "NotFound", &json!({ "error": "not-found" }))
}

fn handle_health(ctx: &RequestContext) -> Result<(), String> {
    let mut issues = Vec::new();
    if let Err(err) = LaunchTarget::load() {
        issues.push(json!({ "component": "launch-target", "message": err }));
    }
    if !is_test_profile() {
        if let Err(err) = cloud_api::HttpApiClient::from_env() {
            issues.push(json!({ "component": "api-client", "message": err }));
        }
    }

    let status = if issues.is_empty() { 200 } else { 503 };
    let reason = if status == 200 {
        "OK"
    } else {
        "ServiceUnavailable"
    };
    log_message(&format!("{} {status} health-check", ctx.invocation_id));

    send_json_response(
        status,
        reason,
        &json!({
            "status": if issues.is_empty() { "ok" } else { "degraded" },
            "profile": runtime_profile(),
            "issues": issues,
        }),
    )
}

fn handle_hook_request(ctx: &RequestContext) -> Result<(), String> {
    if ctx.method != "POST" {
        log_message(&format!(
            "{} 405 method-not-allowed {}",
            ctx.invocation_id, ctx.method
        ));
        return send_json_response(
            405,
            "MethodNotAllowed",
            &json!({ "error": "method-not-allowed" }),
        );
    }

    let event: HookEvent = match serde_json::from_slice(&ctx.body) {
        Ok(event) => event,
        Err(err) => {
            log_message(&format!("{} 400 invalid-event {err}", ctx.invocation_id));
            return send_json_response(
                400,
                "BadRequest",
                &json!({ "error": "invalid-event", "message": err.to_string() }),
            );
        }
    };

    let clients = match cloud_api::build_clients() {
        Ok(clients) => clients,
        Err(err) => {
            log_message(&format!("{} 500 config-invalid {err}", ctx.invocation_id));
            return send_json_response(
                500,
                "InternalServerError",
                &json!({ "error": "config-invalid", "message": err }),
            );
        }
    };

    match run_hook_pipeline(&clients, &ctx.invocation_id, &event) {
        Ok(()) => {
            // The orchestrator retries the hook unless it sees a 200.
            send_json_response(200, "OK", &json!({ "statusCode": 200, "body": "Success" }))
        }
        Err(failure) => {
            log_message(&format!(
                "{} 500 hook-failed code={} {}",
                ctx.invocation_id, failure.code, failure.message
            ));
            // Best-effort Failed report, unless the report channel itself is
            // what broke. The non-200 response below is what drives the
            // orchestrator's retry either way.
            if failure.code != "report-rejected" {
                let _ = clients.deploy.put_hook_status(
                    &event.deployment_id,
                    &event.hook_execution_id,
                    HookStatus::Failed,
                );
            }
            send_json_response(
                500,
                "InternalServerError",
                &json!({ "error": failure.code, "message": failure.message }),
            )
        }
    }
}

fn write_response(status: u16, reason: &str, body: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "HTTP/1.1 {status} {reason}\r\n")?;
    stdout.write_all(b"Content-Type: application/json\r\n")?;
    write!(stdout, "Content-Length: {}\r\n", body.len())?;
    stdout.write_all(b"Connection: close\r\n")?;
    stdout.write_all(b"\r\n")?;
    stdout.write_all(body.as_bytes())?;
    stdout.flush()
}

fn send_json_response(status: u16, reason: &str, payload: &Value) -> Result<(), String> {
    match write_response(status, reason, &payload.to_string()) {
        Ok(()) => Ok(()),
        Err(err)
            if err.kind() == io::ErrorKind::BrokenPipe
                || err.kind() == io::ErrorKind::ConnectionReset =>
        {
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

fn run_http_server_cli(_args: &[String]) -> ! {
    let addr = env_optional(ENV_HTTP_ADDR, DEFAULT_HTTP_ADDR);
    let listener = TcpListener::bind(&addr).unwrap_or_else(|err| {
        eprintln!("failed to bind HTTP address {addr}: {err}");
        std::process::exit(1);
    });

    eprintln!("listening on http://{addr} (http-server)");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                // Each invocation runs in its own short-lived child process
                // so no state can leak between invocations.
                if let Err(err) = spawn_server_for_stream(stream) {
                    eprintln!("failed to spawn server for {peer:?}: {err}");
                }
            }
            Err(err) => {
                eprintln!("accept failed: {err}");
                // avoid busy loop on fatal errors
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn spawn_server_for_stream(stream: TcpStream) -> Result<(), String> {
    stream
        .set_nodelay(true)
        .map_err(|e| format!("set_nodelay failed: {e}"))?;

    // Duplicate the TCP stream for stdin/stdout and transfer ownership of
    // both file descriptors to the child process. into_raw_fd keeps the
    // parent's File wrappers from closing them before the child owns them.
    let stdin_stream = stream
        .try_clone()
        .map_err(|e| format!("failed to clone stream for stdin: {e}"))?;
    let stdout_stream = stream;

    let stdin_fd = stdin_stream.into_raw_fd();
    let stdout_fd = stdout_stream.into_raw_fd();

    let exe = env::current_exe().map_err(|e| e.to_string())?;

    let mut cmd = Command::new(exe);
    cmd.arg("server");
    // Safety: ownership of the raw FDs moves straight into File and then
    // Stdio; the parent never touches them again after this point.
    unsafe {
        cmd.stdin(Stdio::from(File::from_raw_fd(stdin_fd)));
        cmd.stdout(Stdio::from(File::from_raw_fd(stdout_fd)));
    }
    cmd.stderr(Stdio::null());

    cmd.spawn()
        .map_err(|e| format!("failed to spawn server child: {e}"))?;
    Ok(())
}
