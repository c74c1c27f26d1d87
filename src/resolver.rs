use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::cloud_api::{ApiError, DeployApi, TasksApi};

// Pulls the task specification reference out of an appspec-style deployment
// document. Matched per line, case-sensitively; first match wins.
const TASK_DEFINITION_PATTERN: &str = r"(?m)TaskDefinition: (\S+)$";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSpecification {
    pub task_definition: String,
    pub execution_role: String,
    pub task_role: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveError {
    Missing {
        stage: &'static str,
        subject: String,
    },
    Ambiguous {
        stage: &'static str,
        subject: String,
        matched: usize,
    },
    PatternNotFound,
    Api(ApiError),
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::Missing { .. } => "missing-metadata",
            ResolveError::Ambiguous { .. } => "ambiguous-metadata",
            ResolveError::PatternNotFound => "pattern-not-found",
            ResolveError::Api(err) => err.code,
        }
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Missing { stage, subject } => {
                write!(f, "no {stage} record found for {subject}")
            }
            ResolveError::Ambiguous {
                stage,
                subject,
                matched,
            } => write!(
                f,
                "{matched} {stage} records match {subject}, expected exactly one"
            ),
            ResolveError::PatternNotFound => {
                write!(f, "no TaskDefinition line in deployment document")
            }
            ResolveError::Api(err) => write!(f, "{err}"),
        }
    }
}

fn stage_error(stage: &'static str, subject: &str, err: ApiError) -> ResolveError {
    if err.code == "not-found" {
        return ResolveError::Missing {
            stage,
            subject: subject.to_string(),
        };
    }
    ResolveError::Api(err)
}

// Hook-triggered entry point: deployment -> application revision ->
// appspec document -> task specification.
pub fn resolve_for_deployment(
    deploy: &dyn DeployApi,
    tasks: &dyn TasksApi,
    deployment_id: &str,
) -> Result<TaskSpecification, ResolveError> {
    let deployment = deploy
        .get_deployment(deployment_id)
        .map_err(|err| stage_error("deployment", deployment_id, err))?;
    crate::log_message(&format!(
        "resolver deployment={} application={} revision={}",
        deployment_id, deployment.application, deployment.revision_sha
    ));

    let document = deploy
        .get_application_revision(&deployment.application, &deployment.revision_sha)
        .map_err(|err| stage_error("application-revision", &deployment.revision_sha, err))?;

    let reference = extract_task_definition(&document)?;
    crate::log_message(&format!(
        "resolver deployment={deployment_id} task-definition={reference}"
    ));

    describe_specification(tasks, &reference)
}

// Periodic entry point: the running service's specification is the one in
// force. Anything other than exactly one matching service is fatal, never
// resolved by taking the first.
pub fn resolve_for_service(
    tasks: &dyn TasksApi,
    cluster: &str,
    service: &str,
) -> Result<TaskSpecification, ResolveError> {
    let subject = format!("{cluster}/{service}");
    let services = tasks
        .describe_services(cluster, service)
        .map_err(|err| stage_error("service", &subject, err))?;

    let found = match services.len() {
        0 => {
            return Err(ResolveError::Missing {
                stage: "service",
                subject,
            });
        }
        1 => &services[0],
        matched => {
            return Err(ResolveError::Ambiguous {
                stage: "service",
                subject,
                matched,
            });
        }
    };
    crate::log_message(&format!(
        "resolver service={subject} task-definition={}",
        found.task_definition
    ));

    describe_specification(tasks, &found.task_definition)
}

fn describe_specification(
    tasks: &dyn TasksApi,
    reference: &str,
) -> Result<TaskSpecification, ResolveError> {
    let info = tasks
        .describe_task_definition(reference)
        .map_err(|err| stage_error("task-definition", reference, err))?;
    crate::log_message(&format!(
        "resolver task-definition={} task-role={} execution-role={}",
        info.reference, info.task_role, info.execution_role
    ));

    Ok(TaskSpecification {
        task_definition: info.reference,
        execution_role: info.execution_role,
        task_role: info.task_role,
    })
}

pub(crate) fn extract_task_definition(document: &str) -> Result<String, ResolveError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let regex = PATTERN.get_or_init(|| Regex::new(TASK_DEFINITION_PATTERN).unwrap());

    regex
        .captures(document)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(ResolveError::PatternNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_api::{MockApiClient, MockFixture};
    use serde_json::json;

    fn mock(raw: serde_json::Value) -> MockApiClient {
        let fixture: MockFixture = serde_json::from_value(raw).expect("fixture should parse");
        MockApiClient::with_fixture(fixture, None)
    }

    #[test]
    fn extracts_reference_from_single_line() {
        let document = "version: 0.0\nresources:\n  TaskDefinition: arn:task:42\n";
        assert_eq!(
            extract_task_definition(document).unwrap(),
            "arn:task:42"
        );
    }

    #[test]
    fn missing_line_is_pattern_not_found() {
        let document = "version: 0.0\nresources:\n  ContainerName: web\n";
        assert_eq!(
            extract_task_definition(document),
            Err(ResolveError::PatternNotFound)
        );
        assert_eq!(
            ResolveError::PatternNotFound.code(),
            "pattern-not-found"
        );
    }

    #[test]
    fn first_match_wins_with_multiple_lines() {
        let document = "TaskDefinition: arn:task:1\nTaskDefinition: arn:task:2\n";
        assert_eq!(extract_task_definition(document).unwrap(), "arn:task:1");
    }

    #[test]
    fn match_is_case_sensitive_and_line_exact() {
        assert_eq!(
            extract_task_definition("taskdefinition: arn:task:1\n"),
            Err(ResolveError::PatternNotFound)
        );
        // A trailing space keeps the token from reaching end of line.
        assert_eq!(
            extract_task_definition("TaskDefinition: arn:task:1 \n"),
            Err(ResolveError::PatternNotFound)
        );
    }

    #[test]
    fn resolves_full_deployment_chain() {
        let client = mock(json!({
            "deployments": { "d-1": { "application": "api", "revision_sha": "abc123" } },
            "revisions": {
                "api@abc123": "version: 0.0\nresources:\n  TaskDefinition: arn:task:42\n"
            },
            "task_definitions": {
                "arn:task:42": { "execution_role": "roleA", "task_role": "roleB" }
            },
        }));

        let spec = resolve_for_deployment(&client, &client, "d-1").unwrap();
        assert_eq!(
            spec,
            TaskSpecification {
                task_definition: "arn:task:42".to_string(),
                execution_role: "roleA".to_string(),
                task_role: "roleB".to_string(),
            }
        );
    }

    #[test]
    fn unknown_deployment_is_missing_metadata() {
        let client = mock(json!({}));
        let err = resolve_for_deployment(&client, &client, "d-404").unwrap_err();
        assert_eq!(err.code(), "missing-metadata");
        assert!(matches!(err, ResolveError::Missing { stage: "deployment", .. }));
    }

    #[test]
    fn document_without_reference_stops_resolution() {
        let client = mock(json!({
            "deployments": { "d-1": { "application": "api", "revision_sha": "abc123" } },
            "revisions": { "api@abc123": "version: 0.0\nno reference here\n" },
        }));

        let err = resolve_for_deployment(&client, &client, "d-1").unwrap_err();
        assert_eq!(err, ResolveError::PatternNotFound);
    }

    #[test]
    fn ambiguous_service_lookup_is_fatal() {
        let client = mock(json!({
            "services": {
                "prod/web": [
                    { "name": "web", "task_definition": "arn:task:1" },
                    { "name": "web-canary", "task_definition": "arn:task:2" },
                ]
            }
        }));

        let err = resolve_for_service(&client, "prod", "web").unwrap_err();
        assert_eq!(err.code(), "ambiguous-metadata");
        assert!(matches!(err, ResolveError::Ambiguous { matched: 2, .. }));
    }

    #[test]
    fn absent_service_lookup_is_fatal() {
        let client = mock(json!({}));
        let err = resolve_for_service(&client, "prod", "gone").unwrap_err();
        assert!(matches!(err, ResolveError::Missing { stage: "service", .. }));
    }

    #[test]
    fn single_service_resolves_to_its_specification() {
        let client = mock(json!({
            "services": {
                "prod/web": [ { "name": "web", "task_definition": "arn:task:7" } ]
            },
            "task_definitions": {
                "arn:task:7": { "execution_role": "execR", "task_role": "taskR" }
            },
        }));

        let spec = resolve_for_service(&client, "prod", "web").unwrap();
        assert_eq!(spec.task_definition, "arn:task:7");
        assert_eq!(spec.execution_role, "execR");
        assert_eq!(spec.task_role, "taskR");
    }
}
