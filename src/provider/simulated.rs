//! In-process simulated cloud.
//!
//! Fabricates identifiers and deterministic outputs for the built-in resource
//! catalog, so whole deployments can be previewed and applied offline.
//! Failures can be injected per resource and operation.

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::resource::PropertyMap;

use super::{Created, Provider, ProviderResult, ReadResult, ResourceKey};

/// Default simulated account id.
const DEFAULT_ACCOUNT: &str = "123456789012";

/// Default simulated region.
const DEFAULT_REGION: &str = "us-west-2";

/// Provider operations, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `invoke`
    Invoke,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Operation invoked.
    pub operation: Operation,
    /// Logical name of the resource.
    pub name: String,
}

/// An injected failure.
#[derive(Debug, Clone)]
pub struct FailureRule {
    /// Logical name the rule applies to.
    pub name: String,
    /// Operation the rule applies to.
    pub operation: Operation,
    /// Error returned while the rule is active.
    pub error: ProviderError,
    /// Remaining failures; `None` fails forever.
    pub remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct SimObject {
    key: ResourceKey,
    inputs: PropertyMap,
    outputs: PropertyMap,
}

#[derive(Debug, Default)]
struct SimState {
    objects: HashMap<String, SimObject>,
    counter: u64,
    revisions: HashMap<String, u64>,
    calls: Vec<ProviderCall>,
    rules: Vec<FailureRule>,
}

/// Simulated provider backend.
#[derive(Debug)]
pub struct SimulatedProvider {
    account: String,
    region: String,
    latency: Duration,
    state: Mutex<SimState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(DEFAULT_ACCOUNT, DEFAULT_REGION)
    }
}

impl SimulatedProvider {
    /// Creates a simulated cloud for an account and region.
    #[must_use]
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
            latency: Duration::ZERO,
            state: Mutex::new(SimState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Adds an artificial delay to every operation.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes `operation` on `name` fail `times` times (forever if `None`).
    pub fn fail_on(
        &self,
        name: impl Into<String>,
        operation: Operation,
        error: ProviderError,
        times: Option<u32>,
    ) {
        self.lock().rules.push(FailureRule {
            name: name.into(),
            operation,
            error,
            remaining: times,
        });
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Logical names of calls of one operation, in order.
    #[must_use]
    pub fn calls_of(&self, operation: Operation) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns true if an object with this id exists.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.lock().objects.contains_key(id)
    }

    /// Highest number of operations that were in progress at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Removes an object behind the engine's back, simulating drift.
    pub fn forget(&self, id: &str) {
        self.lock().objects.remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call and applies failure injection.
    async fn enter(&self, operation: Operation, key: &ResourceKey) -> ProviderResult<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.calls.push(ProviderCall {
            operation,
            name: key.name.clone(),
        });
        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.name == key.name && r.operation == operation && r.remaining != Some(0));
        if let Some(rule) = rule {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            debug!(resource = %key, ?operation, "Injected provider failure");
            return Err(rule.error.clone());
        }
        Ok(())
    }

    /// Computes outputs for a type from its inputs.
    fn outputs_for(&self, state: &mut SimState, key: &ResourceKey, inputs: &PropertyMap) -> PropertyMap {
        let mut outputs = inputs.clone();
        let account = &self.account;
        let region = &self.region;
        let name = string_input(inputs, "name").unwrap_or_else(|| key.name.clone());

        let computed = match key.type_token.as_str() {
            "aws:ecr/Repository" => json!({
                "name": name,
                "arn": format!("arn:aws:ecr:{region}:{account}:repository/{name}"),
                "registryId": account,
                "repositoryUrl": format!("{account}.dkr.ecr.{region}.amazonaws.com/{name}"),
            }),
            "aws:ecr/getAuthorizationToken" => json!({
                "userName": "AWS",
                "password": format!("sim-token-{account}"),
                "proxyEndpoint": format!("https://{account}.dkr.ecr.{region}.amazonaws.com"),
            }),
            "docker:Image" => {
                let requested = string_input(inputs, "imageName").unwrap_or_default();
                let image_name = with_default_tag(&requested);
                let mut hasher = Sha256::new();
                hasher.update(image_name.as_bytes());
                hasher.update(inputs.get("build").map(Value::to_string).unwrap_or_default());
                let base = image_name.rsplit_once(':').map_or(image_name.as_str(), |(b, _)| b);
                json!({
                    "imageName": image_name,
                    "baseImageName": requested,
                    "repoDigest": format!("{base}@sha256:{}", hex::encode(hasher.finalize())),
                })
            }
            "aws:ec2/getVpc" => json!({
                "id": "vpc-0sim0001",
                "arn": format!("arn:aws:ec2:{region}:{account}:vpc/vpc-0sim0001"),
                "cidrBlock": "172.31.0.0/16",
            }),
            "aws:ec2/getSubnetIds" => {
                let vpc = string_input(inputs, "vpcId").unwrap_or_default();
                json!({ "ids": [format!("subnet-{vpc}-a"), format!("subnet-{vpc}-b")] })
            }
            "aws:ec2/SecurityGroup" => json!({
                "name": name,
                "arn": format!("arn:aws:ec2:{region}:{account}:security-group/{name}"),
            }),
            "aws:ecs/Cluster" => json!({
                "name": name,
                "arn": format!("arn:aws:ecs:{region}:{account}:cluster/{name}"),
            }),
            "aws:iam/Role" => json!({
                "name": name,
                "arn": format!("arn:aws:iam::{account}:role/{name}"),
                "uniqueId": format!("AROA{}", short_digest(&name)),
            }),
            "aws:cloudwatch/LogGroup" => json!({
                "name": name,
                "arn": format!("arn:aws:logs:{region}:{account}:log-group:{name}"),
            }),
            "aws:ecs/TaskDefinition" => {
                let family = string_input(inputs, "family").unwrap_or_else(|| key.name.clone());
                let revision = state.revisions.entry(family.clone()).or_insert(0);
                *revision += 1;
                let base = format!("arn:aws:ecs:{region}:{account}:task-definition/{family}");
                json!({
                    "family": family,
                    "revision": *revision,
                    "arn": format!("{base}:{revision}"),
                    "arnWithoutRevision": base,
                })
            }
            "aws:lb/LoadBalancer" => json!({
                "arn": format!("arn:aws:elasticloadbalancing:{region}:{account}:loadbalancer/app/{name}"),
                "dnsName": format!("{name}-{}.{region}.elb.amazonaws.com", short_digest(&name)),
                "zoneId": "Z1H1FL5HABSF5",
            }),
            "aws:lb/TargetGroup" => json!({
                "name": name,
                "arn": format!("arn:aws:elasticloadbalancing:{region}:{account}:targetgroup/{name}"),
            }),
            "aws:lb/Listener" => json!({
                "arn": format!("arn:aws:elasticloadbalancing:{region}:{account}:listener/app/{}", key.name),
            }),
            _ => Value::Null,
        };

        if let Value::Object(computed) = computed {
            outputs.extend(computed);
        }
        outputs
    }

    fn next_id(state: &mut SimState, key: &ResourceKey) -> String {
        state.counter += 1;
        let kind = key
            .type_token
            .rsplit(['/', ':'])
            .next()
            .unwrap_or("object")
            .to_lowercase();
        format!("{kind}-{:06}", state.counter)
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn create(&self, key: &ResourceKey, inputs: &PropertyMap) -> ProviderResult<Created> {
        self.enter(Operation::Create, key).await?;
        let mut state = self.lock();
        let id = Self::next_id(&mut state, key);
        let outputs = self.outputs_for(&mut state, key, inputs);
        state.objects.insert(
            id.clone(),
            SimObject {
                key: key.clone(),
                inputs: inputs.clone(),
                outputs: outputs.clone(),
            },
        );
        debug!(resource = %key, %id, "Simulated create");
        Ok(Created { id, outputs })
    }

    async fn read(&self, key: &ResourceKey, id: &str) -> ProviderResult<ReadResult> {
        self.enter(Operation::Read, key).await?;
        let state = self.lock();
        let object = state
            .objects
            .get(id)
            .ok_or_else(|| ProviderError::not_found(format!("{key}: no object with id {id}")))?;
        Ok(ReadResult {
            inputs: object.inputs.clone(),
            outputs: object.outputs.clone(),
        })
    }

    async fn update(
        &self,
        key: &ResourceKey,
        id: &str,
        _old_inputs: &PropertyMap,
        new_inputs: &PropertyMap,
    ) -> ProviderResult<PropertyMap> {
        self.enter(Operation::Update, key).await?;
        let mut state = self.lock();
        if !state.objects.contains_key(id) {
            return Err(ProviderError::not_found(format!("{key}: no object with id {id}")));
        }
        let outputs = self.outputs_for(&mut state, key, new_inputs);
        if let Some(object) = state.objects.get_mut(id) {
            object.inputs = new_inputs.clone();
            object.outputs = outputs.clone();
        }
        debug!(resource = %key, %id, "Simulated update");
        Ok(outputs)
    }

    async fn delete(&self, key: &ResourceKey, id: &str) -> ProviderResult<()> {
        self.enter(Operation::Delete, key).await?;
        let mut state = self.lock();
        match state.objects.remove(id) {
            Some(object) => {
                debug!(resource = %object.key, %id, "Simulated delete");
                Ok(())
            }
            None => Err(ProviderError::not_found(format!("{key}: no object with id {id}"))),
        }
    }

    async fn invoke(&self, key: &ResourceKey, args: &PropertyMap) -> ProviderResult<PropertyMap> {
        self.enter(Operation::Invoke, key).await?;
        let mut state = self.lock();
        Ok(self.outputs_for(&mut state, key, args))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Invoke => "invoke",
        };
        f.write_str(name)
    }
}

fn string_input(inputs: &PropertyMap, key: &str) -> Option<String> {
    inputs.get(key).and_then(Value::as_str).map(ToString::to_string)
}

/// Appends `:latest` unless the last path segment already carries a tag.
fn with_default_tag(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || image.is_empty() {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

fn short_digest(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest).chars().take(8).collect()
}
