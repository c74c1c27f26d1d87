use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Runtime;
use url::Url;

pub(crate) const ENV_DEPLOY_API_ENDPOINT: &str = "DTL_DEPLOY_API_ENDPOINT";
pub(crate) const ENV_TASKS_API_ENDPOINT: &str = "DTL_TASKS_API_ENDPOINT";
pub(crate) const ENV_SECRETS_API_ENDPOINT: &str = "DTL_SECRETS_API_ENDPOINT";
pub(crate) const ENV_API_KEY_ID: &str = "DTL_API_KEY_ID";
pub(crate) const ENV_API_KEY_SECRET: &str = "DTL_API_KEY_SECRET";
pub(crate) const ENV_API_TIMEOUT_SECS: &str = "DTL_API_TIMEOUT_SECS";
pub(crate) const ENV_API_MOCK: &str = "DTL_API_MOCK";
pub(crate) const ENV_API_MOCK_LOG: &str = "DTL_API_MOCK_LOG";

const DEFAULT_API_TIMEOUT_SECS: u64 = 10;

const HEADER_TARGET: &str = "x-api-target";
const HEADER_KEY_ID: &str = "x-api-key-id";
const HEADER_DATE: &str = "x-api-date";
const HEADER_SIGNATURE: &str = "x-api-signature";

type HmacSha256 = Hmac<Sha256>;

static API_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn api_runtime() -> &'static Runtime {
    API_RUNTIME.get_or_init(|| Runtime::new().expect("failed to create api runtime"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub(crate) fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookStatus {
    Succeeded,
    Failed,
}

impl HookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HookStatus::Succeeded => "Succeeded",
            HookStatus::Failed => "Failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentInfo {
    pub application: String,
    pub revision_sha: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub task_definition: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDefinitionInfo {
    pub reference: String,
    pub execution_role: String,
    pub task_role: String,
}

// Decrypted secret material. Kept out of Debug output so a stray log line
// can never leak plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

pub trait DeployApi: Send + Sync {
    fn get_deployment(&self, deployment_id: &str) -> Result<DeploymentInfo, ApiError>;

    fn get_application_revision(
        &self,
        application: &str,
        revision_sha: &str,
    ) -> Result<String, ApiError>;

    fn put_hook_status(
        &self,
        deployment_id: &str,
        hook_execution_id: &str,
        status: HookStatus,
    ) -> Result<(), ApiError>;
}

pub trait TasksApi: Send + Sync {
    fn describe_services(&self, cluster: &str, service: &str)
    -> Result<Vec<ServiceInfo>, ApiError>;

    fn describe_task_definition(&self, reference: &str) -> Result<TaskDefinitionInfo, ApiError>;

    fn run_task(&self, submission: &crate::launcher::TaskSubmission) -> Result<(), ApiError>;
}

pub trait SecretsApi: Send + Sync {
    fn get_secret(&self, name: &str) -> Result<SecretString, ApiError>;
}

pub struct ClientSet {
    pub deploy: Arc<dyn DeployApi>,
    pub tasks: Arc<dyn TasksApi>,
    pub secrets: Arc<dyn SecretsApi>,
    kind: &'static str,
}

impl ClientSet {
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

// One client per process, selected at startup and passed explicitly into
// the pipeline. The mock is honored only under the test profile.
pub fn build_clients() -> Result<ClientSet, String> {
    if let Some(mock) = MockApiClient::from_env()? {
        let mock = Arc::new(mock);
        return Ok(ClientSet {
            deploy: mock.clone(),
            tasks: mock.clone(),
            secrets: mock,
            kind: "mock",
        });
    }

    let http = Arc::new(HttpApiClient::from_env()?);
    Ok(ClientSet {
        deploy: http.clone(),
        tasks: http.clone(),
        secrets: http,
        kind: "http",
    })
}

pub struct HttpApiClient {
    client: Client,
    deploy_endpoint: Url,
    tasks_endpoint: Url,
    secrets_endpoint: Url,
    key_id: String,
    key_secret: String,
}

impl HttpApiClient {
    pub fn from_env() -> Result<Self, String> {
        let deploy_endpoint = endpoint_from_env(ENV_DEPLOY_API_ENDPOINT)?;
        let tasks_endpoint = endpoint_from_env(ENV_TASKS_API_ENDPOINT)?;
        let secrets_endpoint = endpoint_from_env(ENV_SECRETS_API_ENDPOINT)?;

        let key_id = required_env(ENV_API_KEY_ID)?;
        let key_secret = required_env(ENV_API_KEY_SECRET)?;

        let timeout_secs = env::var(ENV_API_TIMEOUT_SECS)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_API_TIMEOUT_SECS);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| format!("failed to build http client: {err}"))?;

        Ok(Self {
            client,
            deploy_endpoint,
            tasks_endpoint,
            secrets_endpoint,
            key_id,
            key_secret,
        })
    }

    fn call(&self, endpoint: &Url, target: &str, payload: &Value) -> Result<Value, ApiError> {
        let body = payload.to_string();
        let date = crate::current_unix_secs();
        let signature = sign_request(&self.key_secret, target, date, body.as_bytes())?;

        let response = api_runtime()
            .block_on(
                self.client
                    .post(endpoint.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .header(HEADER_TARGET, target)
                    .header(HEADER_KEY_ID, &self.key_id)
                    .header(HEADER_DATE, date.to_string())
                    .header(HEADER_SIGNATURE, signature)
                    .body(body)
                    .send(),
            )
            .map_err(|err| map_reqwest_error(target, err))?;

        let status = response.status();
        if status.is_success() {
            return api_runtime().block_on(response.json::<Value>()).map_err(|_| {
                ApiError::new("bad-response", format!("{target}: invalid JSON payload"))
            });
        }

        let detail = api_runtime()
            .block_on(response.json::<Value>())
            .unwrap_or(Value::Null);
        Err(map_status_to_error(status, target, &detail))
    }
}

fn endpoint_from_env(name: &str) -> Result<Url, String> {
    let raw = required_env(name)?;
    Url::parse(&raw).map_err(|err| format!("invalid URL in {name}: {err}"))
}

fn required_env(name: &str) -> Result<String, String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("missing required environment variable {name}"))
}

pub(crate) fn sign_request(
    key_secret: &str,
    target: &str,
    date: u64,
    body: &[u8],
) -> Result<String, ApiError> {
    let body_digest = hex::encode(Sha256::digest(body));
    let string_to_sign = format!("{target}\n{date}\n{body_digest}");

    let mut mac = HmacSha256::new_from_slice(key_secret.as_bytes())
        .map_err(|err| ApiError::new("sign-failed", err.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn map_reqwest_error(target: &str, err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::new("timeout", format!("{target}: request timed out"));
    }
    if err.is_connect() {
        return ApiError::new("connect-failed", format!("{target}: {err}"));
    }
    ApiError::new("transport", format!("{target}: {err}"))
}

fn map_status_to_error(status: StatusCode, target: &str, detail: &Value) -> ApiError {
    let server_code = detail.get("error").and_then(Value::as_str).unwrap_or("");
    let message = detail
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{target} returned {status}"));

    let code = match server_code {
        "secret-not-found" => "secret-not-found",
        "decryption-failed" => "secret-decrypt",
        "task-rejected" => "task-rejected",
        _ => match status {
            StatusCode::NOT_FOUND => "not-found",
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "unauthorized",
            StatusCode::TOO_MANY_REQUESTS => "throttled",
            _ => "bad-response",
        },
    };

    ApiError::new(code, message)
}

fn pointer_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn missing_field(target: &str, field: &str) -> ApiError {
    ApiError::new("bad-response", format!("{target}: missing {field}"))
}

impl DeployApi for HttpApiClient {
    fn get_deployment(&self, deployment_id: &str) -> Result<DeploymentInfo, ApiError> {
        let target = "Deploy.GetDeployment";
        let value = self.call(
            &self.deploy_endpoint,
            target,
            &json!({ "deploymentId": deployment_id }),
        )?;

        let application = pointer_str(&value, "/deployment/application")
            .ok_or_else(|| missing_field(target, "deployment.application"))?;
        let revision_sha = pointer_str(&value, "/deployment/revisionSha")
            .ok_or_else(|| missing_field(target, "deployment.revisionSha"))?;

        Ok(DeploymentInfo {
            application: application.to_string(),
            revision_sha: revision_sha.to_string(),
        })
    }

    fn get_application_revision(
        &self,
        application: &str,
        revision_sha: &str,
    ) -> Result<String, ApiError> {
        let target = "Deploy.GetApplicationRevision";
        let value = self.call(
            &self.deploy_endpoint,
            target,
            &json!({ "application": application, "revisionSha": revision_sha }),
        )?;

        pointer_str(&value, "/revision/content")
            .map(str::to_string)
            .ok_or_else(|| missing_field(target, "revision.content"))
    }

    fn put_hook_status(
        &self,
        deployment_id: &str,
        hook_execution_id: &str,
        status: HookStatus,
    ) -> Result<(), ApiError> {
        self.call(
            &self.deploy_endpoint,
            "Deploy.PutLifecycleHookStatus",
            &json!({
                "deploymentId": deployment_id,
                "hookExecutionId": hook_execution_id,
                "status": status.as_str(),
            }),
        )?;
        Ok(())
    }
}

impl TasksApi for HttpApiClient {
    fn describe_services(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<Vec<ServiceInfo>, ApiError> {
        let target = "Tasks.DescribeServices";
        let value = self.call(
            &self.tasks_endpoint,
            target,
            &json!({ "cluster": cluster, "service": service }),
        )?;

        let entries = value
            .pointer("/services")
            .and_then(Value::as_array)
            .ok_or_else(|| missing_field(target, "services"))?;

        let mut services = Vec::with_capacity(entries.len());
        for entry in entries {
            let name =
                pointer_str(entry, "/name").ok_or_else(|| missing_field(target, "service.name"))?;
            let task_definition = pointer_str(entry, "/taskDefinition")
                .ok_or_else(|| missing_field(target, "service.taskDefinition"))?;
            services.push(ServiceInfo {
                name: name.to_string(),
                task_definition: task_definition.to_string(),
            });
        }
        Ok(services)
    }

    fn describe_task_definition(&self, reference: &str) -> Result<TaskDefinitionInfo, ApiError> {
        let target = "Tasks.DescribeTaskDefinition";
        let value = self.call(
            &self.tasks_endpoint,
            target,
            &json!({ "taskDefinition": reference }),
        )?;

        let reference = pointer_str(&value, "/taskDefinition/reference")
            .ok_or_else(|| missing_field(target, "taskDefinition.reference"))?;
        let execution_role = pointer_str(&value, "/taskDefinition/executionRole")
            .ok_or_else(|| missing_field(target, "taskDefinition.executionRole"))?;
        let task_role = pointer_str(&value, "/taskDefinition/taskRole")
            .ok_or_else(|| missing_field(target, "taskDefinition.taskRole"))?;

        Ok(TaskDefinitionInfo {
            reference: reference.to_string(),
            execution_role: execution_role.to_string(),
            task_role: task_role.to_string(),
        })
    }

    fn run_task(&self, submission: &crate::launcher::TaskSubmission) -> Result<(), ApiError> {
        let target = "Tasks.RunTask";
        let value = self.call(&self.tasks_endpoint, target, &submission.wire_payload())?;

        // The engine reports per-task placement failures inside an
        // otherwise-2xx response; any entry is a rejection.
        if let Some(failures) = value.pointer("/failures").and_then(Value::as_array) {
            if !failures.is_empty() {
                let reasons: Vec<&str> = failures
                    .iter()
                    .filter_map(|f| pointer_str(f, "/reason"))
                    .collect();
                return Err(ApiError::new(
                    "task-rejected",
                    format!("{target}: {}", reasons.join(", ")),
                ));
            }
        }
        Ok(())
    }
}

impl SecretsApi for HttpApiClient {
    fn get_secret(&self, name: &str) -> Result<SecretString, ApiError> {
        let target = "Secrets.GetSecret";
        let value = self.call(
            &self.secrets_endpoint,
            target,
            &json!({ "name": name, "withDecryption": true }),
        )?;

        pointer_str(&value, "/secret/value")
            .map(SecretString::new)
            .ok_or_else(|| missing_field(target, "secret.value"))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MockDeployment {
    pub application: String,
    pub revision_sha: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MockService {
    pub name: String,
    pub task_definition: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MockTaskDefinition {
    pub execution_role: String,
    pub task_role: String,
}

// Fixture keys: revisions are "application@revisionSha", services are
// "cluster/service". Secret entries are plaintext strings, or an
// {"error": "<code>"} object to force a provider failure.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MockFixture {
    #[serde(default)]
    pub deployments: HashMap<String, MockDeployment>,
    #[serde(default)]
    pub revisions: HashMap<String, String>,
    #[serde(default)]
    pub services: HashMap<String, Vec<MockService>>,
    #[serde(default)]
    pub task_definitions: HashMap<String, MockTaskDefinition>,
    #[serde(default)]
    pub secrets: HashMap<String, Value>,
    #[serde(default)]
    pub run_task_error: Option<String>,
    #[serde(default)]
    pub report_error: Option<String>,
}

pub struct MockApiClient {
    fixture: MockFixture,
    log_path: Option<PathBuf>,
}

impl MockApiClient {
    pub fn from_env() -> Result<Option<Self>, String> {
        if !crate::is_test_profile() {
            return Ok(None);
        }

        let raw = match env::var(ENV_API_MOCK) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => return Ok(None),
        };

        let fixture: MockFixture = serde_json::from_str(&raw)
            .map_err(|err| format!("invalid {ENV_API_MOCK} fixture: {err}"))?;
        let log_path = env::var(ENV_API_MOCK_LOG)
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Ok(Some(Self { fixture, log_path }))
    }

    pub fn with_fixture(fixture: MockFixture, log_path: Option<PathBuf>) -> Self {
        Self { fixture, log_path }
    }

    fn log_call(&self, entry: Value) {
        let Some(path) = &self.log_path else { return };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{entry}"));
        if let Err(err) = result {
            crate::log_message(&format!(
                "warn mock-log-write-failed path={} err={}",
                path.display(),
                err
            ));
        }
    }
}

fn mock_error_code(code: &str) -> &'static str {
    match code.trim() {
        "not-found" => "not-found",
        "unauthorized" => "unauthorized",
        "throttled" => "throttled",
        "timeout" => "timeout",
        "secret-not-found" => "secret-not-found",
        "decryption-failed" | "secret-decrypt" => "secret-decrypt",
        "task-rejected" => "task-rejected",
        _ => "bad-response",
    }
}

impl DeployApi for MockApiClient {
    fn get_deployment(&self, deployment_id: &str) -> Result<DeploymentInfo, ApiError> {
        self.log_call(json!({ "call": "get_deployment", "deploymentId": deployment_id }));
        self.fixture
            .deployments
            .get(deployment_id)
            .map(|d| DeploymentInfo {
                application: d.application.clone(),
                revision_sha: d.revision_sha.clone(),
            })
            .ok_or_else(|| {
                ApiError::new("not-found", format!("unknown deployment {deployment_id}"))
            })
    }

    fn get_application_revision(
        &self,
        application: &str,
        revision_sha: &str,
    ) -> Result<String, ApiError> {
        self.log_call(json!({
            "call": "get_application_revision",
            "application": application,
            "revisionSha": revision_sha,
        }));
        let key = format!("{application}@{revision_sha}");
        self.fixture.revisions.get(&key).cloned().ok_or_else(|| {
            ApiError::new(
                "not-found",
                format!("unknown revision {revision_sha} for {application}"),
            )
        })
    }

    fn put_hook_status(
        &self,
        deployment_id: &str,
        hook_execution_id: &str,
        status: HookStatus,
    ) -> Result<(), ApiError> {
        self.log_call(json!({
            "call": "put_hook_status",
            "deploymentId": deployment_id,
            "hookExecutionId": hook_execution_id,
            "status": status.as_str(),
        }));
        if let Some(code) = &self.fixture.report_error {
            return Err(ApiError::new(
                mock_error_code(code),
                format!("forced report failure: {code}"),
            ));
        }
        Ok(())
    }
}

impl TasksApi for MockApiClient {
    fn describe_services(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<Vec<ServiceInfo>, ApiError> {
        self.log_call(json!({
            "call": "describe_services",
            "cluster": cluster,
            "service": service,
        }));
        let key = format!("{cluster}/{service}");
        let entries = self.fixture.services.get(&key).cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|s| ServiceInfo {
                name: s.name,
                task_definition: s.task_definition,
            })
            .collect())
    }

    fn describe_task_definition(&self, reference: &str) -> Result<TaskDefinitionInfo, ApiError> {
        self.log_call(json!({ "call": "describe_task_definition", "taskDefinition": reference }));
        self.fixture
            .task_definitions
            .get(reference)
            .map(|d| TaskDefinitionInfo {
                reference: reference.to_string(),
                execution_role: d.execution_role.clone(),
                task_role: d.task_role.clone(),
            })
            .ok_or_else(|| {
                ApiError::new("not-found", format!("unknown task definition {reference}"))
            })
    }

    fn run_task(&self, submission: &crate::launcher::TaskSubmission) -> Result<(), ApiError> {
        // Secret environment values are redacted by the sanitized
        // projection before anything is written out.
        self.log_call(json!({ "call": "run_task", "payload": submission.sanitized_payload() }));
        if let Some(code) = &self.fixture.run_task_error {
            return Err(ApiError::new(
                mock_error_code(code),
                format!("forced run-task failure: {code}"),
            ));
        }
        Ok(())
    }
}

impl SecretsApi for MockApiClient {
    fn get_secret(&self, name: &str) -> Result<SecretString, ApiError> {
        self.log_call(json!({ "call": "get_secret", "name": name }));
        match self.fixture.secrets.get(name) {
            Some(Value::String(plaintext)) => Ok(SecretString::new(plaintext.clone())),
            Some(Value::Object(entry)) => {
                let code = entry
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("bad-response");
                Err(ApiError::new(
                    mock_error_code(code),
                    format!("forced secret failure: {code}"),
                ))
            }
            Some(_) => Err(ApiError::new(
                "bad-response",
                format!("malformed fixture entry for secret {name}"),
            )),
            None => Err(ApiError::new(
                "secret-not-found",
                format!("unknown secret {name}"),
            )),
        }
    }
}
