//! Test doubles for the command runner and cloud API.

use crate::aws::{AccountId, CallerIdentity, CloudOperations, RegistryCredentials};
use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use anyhow::Result;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

struct Rule {
    prefix: String,
    responses: VecDeque<Result<CommandOutput, String>>,
}

#[derive(Default)]
struct DockerState {
    containers: HashSet<String>,
    images: HashSet<String>,
}

/// A recorded invocation
#[derive(Debug, Clone)]
pub struct Call {
    pub spec: CommandSpec,
    pub at: Instant,
}

impl Call {
    pub fn line(&self) -> String {
        self.spec.display()
    }
}

/// Command runner that answers from scripted rules and otherwise simulates
/// just enough of docker (`ps`, `pull`, `run`, `rm`, `inspect`) to keep
/// container and image state consistent across calls.
///
/// Rules match on the rendered command line prefix. A rule pops its
/// responses in order and repeats the last one once the queue is drained.
/// Commands matching no rule and no simulated docker verb succeed silently.
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    state: Mutex<DockerState>,
    calls: Mutex<Vec<Call>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            state: Mutex::new(DockerState::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script responses for commands starting with `prefix`
    pub fn on(self, prefix: &str, responses: Vec<CommandOutput>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            responses: responses.into_iter().map(Ok).collect(),
        });
        self
    }

    /// Make commands starting with `prefix` fail to spawn
    pub fn on_spawn_error(self, prefix: &str, message: &str) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            responses: VecDeque::from([Err(message.to_string())]),
        });
        self
    }

    /// Pretend a container with this name already exists
    pub fn with_container(self, name: &str) -> Self {
        self.state.lock().unwrap().containers.insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded command lines starting with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.line().starts_with(prefix))
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls_matching(prefix).len()
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state.lock().unwrap().containers.contains(name)
    }

    fn scripted(&self, line: &str) -> Option<Result<CommandOutput, String>> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().find(|r| line.starts_with(&r.prefix))?;
        if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        }
    }

    fn simulate_docker(&self, args: &[String], scripted: Option<CommandOutput>) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        match args.first().map(String::as_str) {
            Some("pull") => {
                let output = scripted.unwrap_or_else(|| CommandOutput::ok("Status: Downloaded\n"));
                if output.success {
                    if let Some(image) = args.last() {
                        state.images.insert(image.clone());
                    }
                }
                output
            }
            Some("run") => {
                let name = flag_value(args, "--name").unwrap_or_default();
                let image = args.last().cloned().unwrap_or_default();
                if let Some(output) = scripted {
                    if output.success {
                        state.containers.insert(name);
                    }
                    return output;
                }
                if state.containers.contains(&name) {
                    return CommandOutput::failed(
                        125,
                        format!("docker: Error response from daemon: Conflict. The container name \"/{name}\" is already in use."),
                    );
                }
                if !state.images.contains(&image) {
                    return CommandOutput::failed(
                        125,
                        format!("Unable to find image '{image}' locally\ndocker: Error response from daemon: pull access denied."),
                    );
                }
                state.containers.insert(name);
                CommandOutput::ok("0123456789abcdef\n")
            }
            Some("rm") => {
                if let Some(name) = args.last() {
                    state.containers.remove(name);
                }
                scripted.unwrap_or_else(|| CommandOutput::ok(""))
            }
            Some("ps") if args.iter().any(|a| a == "--filter") => {
                if let Some(output) = scripted {
                    return output;
                }
                let mut names: Vec<&String> = state.containers.iter().collect();
                names.sort();
                let filter = flag_value(args, "--filter").unwrap_or_default();
                let wanted = filter
                    .trim_start_matches("name=^/")
                    .trim_end_matches('$')
                    .to_string();
                let stdout = names
                    .into_iter()
                    .filter(|n| **n == wanted)
                    .map(|n| format!("{n}\n"))
                    .collect::<String>();
                CommandOutput::ok(stdout)
            }
            Some("inspect") => {
                if let Some(output) = scripted {
                    return output;
                }
                let name = args.last().cloned().unwrap_or_default();
                if state.containers.contains(&name) {
                    CommandOutput::ok("true\n")
                } else {
                    CommandOutput::failed(1, format!("Error: No such object: {name}"))
                }
            }
            _ => scripted.unwrap_or_else(|| CommandOutput::ok("")),
        }
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(Call {
            spec: spec.clone(),
            at: Instant::now(),
        });

        let line = spec.display();
        let scripted = match self.scripted(&line) {
            Some(Err(message)) => anyhow::bail!("{message}"),
            Some(Ok(output)) => Some(output),
            None => None,
        };

        if spec.program == "docker" {
            Ok(self.simulate_docker(&spec.args, scripted))
        } else {
            Ok(scripted.unwrap_or_else(|| CommandOutput::ok("")))
        }
    }
}

/// Cloud API fake: identity fails a set number of times before succeeding
pub struct FakeCloud {
    identity_failures: AtomicU32,
    identity_calls: AtomicU32,
    registry_error: Option<String>,
    registry_calls: AtomicU32,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            identity_failures: AtomicU32::new(0),
            identity_calls: AtomicU32::new(0),
            registry_error: None,
            registry_calls: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` identity calls
    pub fn identity_fails(self, n: u32) -> Self {
        self.identity_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Make every registry credential request fail
    pub fn registry_fails(mut self, message: &str) -> Self {
        self.registry_error = Some(message.to_string());
        self
    }

    pub fn identity_calls(&self) -> u32 {
        self.identity_calls.load(Ordering::SeqCst)
    }

    pub fn registry_calls(&self) -> u32 {
        self.registry_calls.load(Ordering::SeqCst)
    }

    pub fn identity() -> CallerIdentity {
        CallerIdentity {
            account: AccountId::new("123456789012"),
            arn: "arn:aws:sts::123456789012:assumed-role/api-host-role/i-0123456789abcdef0".into(),
            user_id: "AROAEXAMPLEID:i-0123456789abcdef0".into(),
        }
    }
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudOperations for FakeCloud {
    async fn caller_identity(&self) -> Result<CallerIdentity> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.identity_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.identity_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("InvalidClientTokenId: The security token included in the request is invalid");
        }
        Ok(Self::identity())
    }

    async fn registry_credentials(&self, _registry_id: Option<&str>) -> Result<RegistryCredentials> {
        self.registry_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.registry_error {
            anyhow::bail!("{message}");
        }
        Ok(RegistryCredentials {
            username: "AWS".into(),
            password: "registry-password".into(),
            endpoint: Some("https://123456789012.dkr.ecr.us-east-1.amazonaws.com".into()),
        })
    }
}

/// Elapsed time between two recorded calls
pub fn gap(earlier: &Call, later: &Call) -> Duration {
    later.at - earlier.at
}
