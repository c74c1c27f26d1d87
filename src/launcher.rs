use serde_json::{Value, json};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::cloud_api::{ApiError, SecretString, SecretsApi, TasksApi};
use crate::resolver::TaskSpecification;

// Test escape hatch: when set, launch() writes the sanitized submission to
// this path instead of calling the orchestration engine.
pub(crate) const ENV_RUN_TASK_SNAPSHOT: &str = "DTL_RUN_TASK_SNAPSHOT";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementConstraints {
    pub security_groups: Vec<String>,
    pub subnets: Vec<String>,
    pub assign_public_address: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
    pub secret: bool,
}

impl EnvEntry {
    pub fn plain(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(name: impl Into<String>, value: &SecretString) -> Self {
        Self {
            name: name.into(),
            value: value.expose().to_string(),
            secret: true,
        }
    }
}

impl fmt::Debug for EnvEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: &dyn fmt::Debug = if self.secret { &"***" } else { &self.value };
        f.debug_struct("EnvEntry")
            .field("name", &self.name)
            .field("value", shown)
            .field("secret", &self.secret)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverrideRequest {
    pub task_definition: String,
    pub container_name: String,
    pub command: Vec<String>,
    pub environment: Vec<EnvEntry>,
    pub execution_role: String,
    pub task_role: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSubmission {
    pub cluster: String,
    pub request: OverrideRequest,
    pub placement: PlacementConstraints,
}

impl TaskSubmission {
    pub fn wire_payload(&self) -> Value {
        self.payload(false)
    }

    // Secret environment values replaced; safe for logs and snapshots.
    pub fn sanitized_payload(&self) -> Value {
        self.payload(true)
    }

    fn payload(&self, redact_secrets: bool) -> Value {
        let environment: Vec<Value> = self
            .request
            .environment
            .iter()
            .map(|entry| {
                let value = if redact_secrets && entry.secret {
                    "***"
                } else {
                    entry.value.as_str()
                };
                json!({ "name": entry.name, "value": value })
            })
            .collect();

        json!({
            "cluster": self.cluster,
            "taskDefinition": self.request.task_definition,
            "launchType": "serverless",
            "overrides": {
                "containerOverrides": [{
                    "name": self.request.container_name,
                    "command": self.request.command,
                    "environment": environment,
                }],
                "executionRole": self.request.execution_role,
                "taskRole": self.request.task_role,
            },
            "networkConfiguration": {
                "assignPublicAddress": self.placement.assign_public_address,
                "securityGroups": self.placement.security_groups,
                "subnets": self.placement.subnets,
            },
        })
    }
}

// Pure construction. Both identity roles are copied verbatim so the one-off
// task runs under exactly the trust boundaries of the live service, and the
// container command is replaced outright, never appended to.
pub fn build_override(
    spec: &TaskSpecification,
    container_name: &str,
    command: &[String],
    extra_env: &[EnvEntry],
) -> OverrideRequest {
    OverrideRequest {
        task_definition: spec.task_definition.clone(),
        container_name: container_name.to_string(),
        command: command.to_vec(),
        environment: extra_env.to_vec(),
        execution_role: spec.execution_role.clone(),
        task_role: spec.task_role.clone(),
    }
}

#[derive(Clone, Debug)]
pub struct AdminCredentials {
    pub admin_email: String,
    pub admin_password_secret: String,
    pub database_admin_password_secret: String,
    pub database_admin_user: String,
}

// Admin credentials ride into the one-off task as environment variables;
// the password values come decrypted from the secret store and exist only
// inside the in-memory request from here on.
pub fn credential_env(
    secrets: &dyn SecretsApi,
    credentials: &AdminCredentials,
) -> Result<Vec<EnvEntry>, ApiError> {
    let admin_password = secrets.get_secret(&credentials.admin_password_secret)?;
    let database_admin_password = secrets.get_secret(&credentials.database_admin_password_secret)?;

    Ok(vec![
        EnvEntry::plain("ADMIN_EMAIL", &credentials.admin_email),
        EnvEntry::secret("ADMIN_PASSWORD", &admin_password),
        EnvEntry::secret("DATABASE_ADMIN_PASSWORD", &database_admin_password),
        EnvEntry::plain("DATABASE_ADMIN_USER", &credentials.database_admin_user),
    ])
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchError {
    Rejected(ApiError),
    SnapshotWrite(String),
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::Rejected(err) => err.code,
            LaunchError::SnapshotWrite(_) => "snapshot-write-failed",
        }
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::Rejected(err) => write!(f, "task submission rejected: {err}"),
            LaunchError::SnapshotWrite(err) => {
                write!(f, "failed to write submission snapshot: {err}")
            }
        }
    }
}

// Submits the override and returns as soon as the engine accepts it.
// Acceptance is not completion; nothing here polls the task afterwards.
pub fn launch(tasks: &dyn TasksApi, submission: &TaskSubmission) -> Result<(), LaunchError> {
    if let Ok(path) = env::var(ENV_RUN_TASK_SNAPSHOT) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            write_snapshot(Path::new(trimmed), submission).map_err(LaunchError::SnapshotWrite)?;
            return Ok(());
        }
    }

    tasks.run_task(submission).map_err(LaunchError::Rejected)
}

fn write_snapshot(path: &Path, submission: &TaskSubmission) -> Result<(), String> {
    // Write-then-rename so a reader never sees a partial document.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, submission.sanitized_payload().to_string()).map_err(|err| err.to_string())?;
    fs::rename(&tmp, path).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_api::{MockApiClient, MockFixture};
    use serde_json::json;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    static TEST_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> MutexGuard<'static, ()> {
        TEST_MUTEX
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    fn spec() -> TaskSpecification {
        TaskSpecification {
            task_definition: "arn:task:42".to_string(),
            execution_role: "roleA".to_string(),
            task_role: "roleB".to_string(),
        }
    }

    fn placement() -> PlacementConstraints {
        PlacementConstraints {
            security_groups: vec!["sg-1".to_string()],
            subnets: vec!["subnet-1".to_string(), "subnet-2".to_string()],
            assign_public_address: true,
        }
    }

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identities_are_copied_verbatim() {
        let request = build_override(&spec(), "web", &command(&["migrate"]), &[]);
        assert_eq!(request.execution_role, "roleA");
        assert_eq!(request.task_role, "roleB");
        assert_eq!(request.task_definition, "arn:task:42");
        assert_eq!(request.command, vec!["migrate"]);
    }

    #[test]
    fn build_is_idempotent() {
        let env = vec![EnvEntry::plain("ADMIN_EMAIL", "ops@example.com")];
        let first = build_override(&spec(), "web", &command(&["migrate"]), &env);
        let second = build_override(&spec(), "web", &command(&["migrate"]), &env);
        assert_eq!(first, second);
    }

    #[test]
    fn debug_output_redacts_secret_entries() {
        let entry = EnvEntry::secret("ADMIN_PASSWORD", &SecretString::new("hunter2"));
        let rendered = format!("{entry:?}");
        assert!(!rendered.contains("hunter2"), "got: {rendered}");
        assert!(rendered.contains("***"));

        let request = build_override(&spec(), "web", &command(&["migrate"]), &[entry]);
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("hunter2"), "got: {rendered}");
    }

    #[test]
    fn sanitized_payload_hides_only_secret_values() {
        let environment = vec![
            EnvEntry::plain("ADMIN_EMAIL", "ops@example.com"),
            EnvEntry::secret("ADMIN_PASSWORD", &SecretString::new("hunter2")),
        ];
        let submission = TaskSubmission {
            cluster: "prod".to_string(),
            request: build_override(&spec(), "web", &command(&["migrate"]), &environment),
            placement: placement(),
        };

        let wire = submission.wire_payload().to_string();
        assert!(wire.contains("hunter2"));

        let sanitized = submission.sanitized_payload().to_string();
        assert!(!sanitized.contains("hunter2"), "got: {sanitized}");
        assert!(sanitized.contains("ops@example.com"));
        assert!(sanitized.contains("\"launchType\":\"serverless\""));
        assert!(sanitized.contains("\"assignPublicAddress\":true"));
    }

    #[test]
    fn credential_env_fetches_both_passwords() {
        let fixture: MockFixture = serde_json::from_value(json!({
            "secrets": {
                "/prod/admin-password": "hunter2",
                "/prod/db-password": "tiger",
            }
        }))
        .unwrap();
        let secrets = MockApiClient::with_fixture(fixture, None);

        let credentials = AdminCredentials {
            admin_email: "ops@example.com".to_string(),
            admin_password_secret: "/prod/admin-password".to_string(),
            database_admin_password_secret: "/prod/db-password".to_string(),
            database_admin_user: "postgres".to_string(),
        };

        let environment = credential_env(&secrets, &credentials).unwrap();
        let names: Vec<&str> = environment.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ADMIN_EMAIL",
                "ADMIN_PASSWORD",
                "DATABASE_ADMIN_PASSWORD",
                "DATABASE_ADMIN_USER",
            ]
        );
        assert_eq!(environment[1].value, "hunter2");
        assert!(environment[1].secret);
        assert_eq!(environment[3].value, "postgres");
        assert!(!environment[3].secret);
    }

    #[test]
    fn credential_env_propagates_secret_failure() {
        let fixture: MockFixture = serde_json::from_value(json!({
            "secrets": { "/prod/admin-password": "hunter2" }
        }))
        .unwrap();
        let secrets = MockApiClient::with_fixture(fixture, None);

        let credentials = AdminCredentials {
            admin_email: "ops@example.com".to_string(),
            admin_password_secret: "/prod/admin-password".to_string(),
            database_admin_password_secret: "/prod/missing".to_string(),
            database_admin_user: "postgres".to_string(),
        };

        let err = credential_env(&secrets, &credentials).unwrap_err();
        assert_eq!(err.code, "secret-not-found");
    }

    #[test]
    fn launch_rejection_carries_engine_code() {
        let _guard = env_lock();
        let fixture: MockFixture =
            serde_json::from_value(json!({ "run_task_error": "task-rejected" })).unwrap();
        let tasks = MockApiClient::with_fixture(fixture, None);

        let submission = TaskSubmission {
            cluster: "prod".to_string(),
            request: build_override(&spec(), "web", &command(&["migrate"]), &[]),
            placement: placement(),
        };

        let err = launch(&tasks, &submission).unwrap_err();
        assert_eq!(err.code(), "task-rejected");
    }

    #[test]
    fn snapshot_env_short_circuits_submission() {
        let _guard = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("submission.json");

        // The fixture would reject the launch; the snapshot path must win.
        let fixture: MockFixture =
            serde_json::from_value(json!({ "run_task_error": "task-rejected" })).unwrap();
        let tasks = MockApiClient::with_fixture(fixture, None);

        let environment = vec![EnvEntry::secret(
            "ADMIN_PASSWORD",
            &SecretString::new("hunter2"),
        )];
        let submission = TaskSubmission {
            cluster: "prod".to_string(),
            request: build_override(&spec(), "web", &command(&["migrate"]), &environment),
            placement: placement(),
        };

        unsafe {
            std::env::set_var(ENV_RUN_TASK_SNAPSHOT, &snapshot);
        }
        let result = launch(&tasks, &submission);
        unsafe {
            std::env::remove_var(ENV_RUN_TASK_SNAPSHOT);
        }
        result.unwrap();

        let written = std::fs::read_to_string(&snapshot).unwrap();
        assert!(written.contains("arn:task:42"));
        assert!(!written.contains("hunter2"), "got: {written}");
    }
}
