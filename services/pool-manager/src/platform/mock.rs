//! In-memory platform for testing.
//!
//! Records every call, supports per-operation failure and delay injection,
//! and lets tests script how each build ends.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Account, AccountResolver, Build, BuildOutput, BuildStatus, CreateInstance, Domain, Formation,
    Instance, NewBuild, Owner, Platform, PlatformError, SourceUpload, Transfer,
};

/// Domain suffix of hostnames routed to mock instances.
pub const MOCK_DOMAIN: &str = "mock.example.app";

/// Platform operations, for call recording and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetAccount,
    CreateInstance,
    GetInstance,
    DeleteInstance,
    RenameInstance,
    UpdateConfigVars,
    ScaleFormation,
    CreateSourceUpload,
    PutSourceBlob,
    CreateBuild,
    GetBuild,
    BuildOutput,
    ListOwnedInstances,
    AddCollaborator,
    RemoveCollaborator,
    CreateTransfer,
    AcceptTransfer,
    ListDomains,
}

/// A recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Operation,

    /// Instance, build or transfer the call addressed, if any.
    pub target: Option<String>,
}

/// How a build created on the mock ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildScript {
    /// Succeeds once polled more than `after_polls` times.
    Succeed { after_polls: u32 },

    /// Fails once polled more than `after_polls` times.
    Fail { after_polls: u32 },

    /// Never finishes.
    Pending,
}

impl Default for BuildScript {
    fn default() -> Self {
        BuildScript::Succeed { after_polls: 1 }
    }
}

type ErrorFactory = Arc<dyn Fn() -> PlatformError + Send + Sync>;

struct Injected {
    remaining: Option<u32>,
    make: ErrorFactory,
}

struct MockInstance {
    instance: Instance,
    config_vars: BTreeMap<String, String>,
    formation: BTreeMap<String, u32>,
    collaborators: Vec<String>,
}

struct MockBuild {
    build: Build,
    script: BuildScript,
    polls: u32,
}

struct MockTransfer {
    transfer: Transfer,
    instance_id: String,
    accepted: bool,
}

struct MockState {
    account: Account,
    instances: Vec<MockInstance>,
    builds: HashMap<String, MockBuild>,
    transfers: HashMap<String, MockTransfer>,
    uploads: HashMap<String, Bytes>,
    tokens: HashMap<String, Account>,
    scripts: VecDeque<BuildScript>,
    default_script: BuildScript,
    build_log: Vec<String>,
    failures: HashMap<Operation, Injected>,
    delays: HashMap<Operation, Duration>,
    calls: Vec<Call>,
}

/// In-memory [`Platform`] implementation.
///
/// Instances are listed in creation order. Cloning shares state.
#[derive(Clone)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    /// Create a mock whose credential belongs to `pool@example.com`.
    pub fn new() -> Self {
        Self::with_account(Account {
            id: "acct-pool".to_string(),
            email: Some("pool@example.com".to_string()),
        })
    }

    /// Create a mock whose credential belongs to `account`.
    pub fn with_account(account: Account) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                account,
                instances: Vec::new(),
                builds: HashMap::new(),
                transfers: HashMap::new(),
                uploads: HashMap::new(),
                tokens: HashMap::new(),
                scripts: VecDeque::new(),
                default_script: BuildScript::default(),
                build_log: vec![
                    "-----> Building source".to_string(),
                    "-----> Launching".to_string(),
                ],
                failures: HashMap::new(),
                delays: HashMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every call to `op` fail.
    pub fn fail_on(&self, op: Operation) {
        self.inject(op, None, Arc::new(move || mock_failure(op)));
    }

    /// Make the next call to `op` fail.
    pub fn fail_once(&self, op: Operation) {
        self.inject(op, Some(1), Arc::new(move || mock_failure(op)));
    }

    /// Make every call to `op` fail with the error built by `make`.
    pub fn fail_with<F>(&self, op: Operation, make: F)
    where
        F: Fn() -> PlatformError + Send + Sync + 'static,
    {
        self.inject(op, None, Arc::new(make));
    }

    /// Remove any failure injected for `op`.
    pub fn clear_failure(&self, op: Operation) {
        self.state().failures.remove(&op);
    }

    /// Hold every call to `op` for `delay` after recording it.
    pub fn delay(&self, op: Operation, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    fn inject(&self, op: Operation, remaining: Option<u32>, make: ErrorFactory) {
        self.state().failures.insert(op, Injected { remaining, make });
    }

    /// Queue scripts for the next builds, in build creation order.
    pub fn script_builds(&self, scripts: impl IntoIterator<Item = BuildScript>) {
        self.state().scripts.extend(scripts);
    }

    /// Script for builds with no queued script.
    pub fn set_default_build(&self, script: BuildScript) {
        self.state().default_script = script;
    }

    /// Lines returned by the build output stream.
    pub fn set_build_log(&self, lines: impl IntoIterator<Item = impl Into<String>>) {
        self.state().build_log = lines.into_iter().map(Into::into).collect();
    }

    /// Register a bearer token for [`AccountResolver::resolve`].
    pub fn register_token(&self, token: impl Into<String>, account: Account) {
        self.state().tokens.insert(token.into(), account);
    }

    /// Add an instance without recording a call.
    pub fn seed_instance(&self, name: &str, owner: Owner) -> Instance {
        let instance = Instance {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner,
            region: "us".to_string(),
            created_at: Some(Utc::now()),
        };
        self.state().instances.push(MockInstance::new(instance.clone()));
        instance
    }

    /// Add an instance owned by the mock's own account.
    pub fn seed_owned(&self, name: &str) -> Instance {
        let owner = self.pool_owner();
        self.seed_instance(name, owner)
    }

    /// Add `user` as a collaborator without recording a call.
    pub fn seed_collaborator(&self, instance: &str, user: &str) {
        let mut state = self.state();
        if let Some(entry) = state.find_mut(instance) {
            entry.collaborators.push(user.to_string());
        }
    }

    /// The mock's own account as an instance owner.
    pub fn pool_owner(&self) -> Owner {
        let state = self.state();
        Owner {
            id: state.account.id.clone(),
            email: state.account.email.clone().unwrap_or_default(),
        }
    }

    /// All live instances, in listing order.
    pub fn instances(&self) -> Vec<Instance> {
        self.state()
            .instances
            .iter()
            .map(|entry| entry.instance.clone())
            .collect()
    }

    /// Names of all live instances, in listing order.
    pub fn instance_names(&self) -> Vec<String> {
        self.state()
            .instances
            .iter()
            .map(|entry| entry.instance.name.clone())
            .collect()
    }

    /// Look up a live instance by ID or name.
    pub fn instance(&self, instance: &str) -> Option<Instance> {
        self.state().find(instance).map(|entry| entry.instance.clone())
    }

    /// Config vars of an instance.
    pub fn config_vars(&self, instance: &str) -> Option<BTreeMap<String, String>> {
        self.state().find(instance).map(|entry| entry.config_vars.clone())
    }

    /// Quantity of a process type, if it was ever scaled.
    pub fn formation(&self, instance: &str, process_type: &str) -> Option<u32> {
        self.state()
            .find(instance)
            .and_then(|entry| entry.formation.get(process_type).copied())
    }

    /// Collaborators of an instance.
    pub fn collaborators(&self, instance: &str) -> Vec<String> {
        self.state()
            .find(instance)
            .map(|entry| entry.collaborators.clone())
            .unwrap_or_default()
    }

    /// Blobs uploaded so far, keyed by put URL.
    pub fn uploads(&self) -> HashMap<String, Bytes> {
        self.state().uploads.clone()
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of recorded calls to `op`.
    pub fn count(&self, op: Operation) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Recorded targets of calls to `op`.
    pub fn targets(&self, op: Operation) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .filter_map(|c| c.target.clone())
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Record a call, wait out any injected delay and apply any injected
    /// failure.
    async fn enter(
        &self,
        op: Operation,
        target: Option<&str>,
    ) -> Result<MutexGuard<'_, MockState>, PlatformError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(Call {
                op,
                target: target.map(str::to_string),
            });
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            debug!(?op, target, ?delay, "[MOCK] Delaying call");
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();

        let fire = match state.failures.get_mut(&op) {
            Some(injected) => {
                let make = Arc::clone(&injected.make);
                match injected.remaining.as_mut() {
                    Some(0) => None,
                    Some(n) => {
                        *n -= 1;
                        Some(make)
                    }
                    None => Some(make),
                }
            }
            None => None,
        };

        match fire {
            Some(make) => {
                debug!(?op, target, "[MOCK] Injected failure");
                Err(make())
            }
            None => Ok(state),
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInstance {
    fn new(instance: Instance) -> Self {
        Self {
            instance,
            config_vars: BTreeMap::new(),
            formation: BTreeMap::new(),
            collaborators: Vec::new(),
        }
    }
}

impl MockState {
    fn find(&self, key: &str) -> Option<&MockInstance> {
        self.instances
            .iter()
            .find(|e| e.instance.id == key || e.instance.name == key)
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut MockInstance> {
        self.instances
            .iter_mut()
            .find(|e| e.instance.id == key || e.instance.name == key)
    }

    fn require_mut(&mut self, key: &str) -> Result<&mut MockInstance, PlatformError> {
        self.find_mut(key)
            .ok_or_else(|| PlatformError::NotFound(format!("Couldn't find that app: {key}")))
    }

    fn user(&self, who: &str) -> Owner {
        if self.account.email.as_deref() == Some(who) || self.account.id == who {
            return Owner {
                id: self.account.id.clone(),
                email: self.account.email.clone().unwrap_or_default(),
            };
        }
        Owner {
            id: format!("user-{who}"),
            email: who.to_string(),
        }
    }
}

fn mock_failure(op: Operation) -> PlatformError {
    PlatformError::Api {
        status: 503,
        id: "unavailable".to_string(),
        message: format!("mock failure injected for {op:?}"),
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn get_account(&self) -> Result<Account, PlatformError> {
        let state = self.enter(Operation::GetAccount, None).await?;
        Ok(state.account.clone())
    }

    async fn create_instance(&self, spec: &CreateInstance) -> Result<Instance, PlatformError> {
        let mut state = self.enter(Operation::CreateInstance, Some(&spec.name)).await?;
        if state.find(&spec.name).is_some() {
            return Err(PlatformError::Api {
                status: 422,
                id: "invalid_params".to_string(),
                message: format!("Name {} is already taken", spec.name),
            });
        }

        let owner = state.user(&state.account.id.clone());
        let instance = Instance {
            id: Uuid::new_v4().to_string(),
            name: spec.name.clone(),
            owner,
            region: spec.region.clone(),
            created_at: Some(Utc::now()),
        };
        info!(instance = %instance.name, "[MOCK] Created instance");
        state.instances.push(MockInstance::new(instance.clone()));
        Ok(instance)
    }

    async fn get_instance(&self, instance: &str) -> Result<Instance, PlatformError> {
        let mut state = self.enter(Operation::GetInstance, Some(instance)).await?;
        Ok(state.require_mut(instance)?.instance.clone())
    }

    async fn delete_instance(&self, instance: &str) -> Result<(), PlatformError> {
        let mut state = self.enter(Operation::DeleteInstance, Some(instance)).await?;
        let before = state.instances.len();
        state
            .instances
            .retain(|e| e.instance.id != instance && e.instance.name != instance);

        if state.instances.len() == before {
            return Err(PlatformError::NotFound(format!("Couldn't find that app: {instance}")));
        }
        info!(instance, "[MOCK] Deleted instance");
        Ok(())
    }

    async fn rename_instance(
        &self,
        current_name: &str,
        new_name: &str,
    ) -> Result<Instance, PlatformError> {
        let mut state = self.enter(Operation::RenameInstance, Some(current_name)).await?;
        if state.instances.iter().any(|e| e.instance.name == new_name) {
            return Err(PlatformError::Conflict(format!("Name {new_name} is already taken")));
        }

        let entry = state
            .instances
            .iter_mut()
            .find(|e| e.instance.name == current_name)
            .ok_or_else(|| PlatformError::NotFound(format!("Couldn't find that app: {current_name}")))?;
        entry.instance.name = new_name.to_string();
        debug!(from = current_name, to = new_name, "[MOCK] Renamed instance");
        Ok(entry.instance.clone())
    }

    async fn update_config_vars(
        &self,
        instance: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        let mut state = self.enter(Operation::UpdateConfigVars, Some(instance)).await?;
        let entry = state.require_mut(instance)?;
        entry
            .config_vars
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn scale_formation(
        &self,
        instance: &str,
        process_type: &str,
        quantity: u32,
    ) -> Result<Formation, PlatformError> {
        let mut state = self.enter(Operation::ScaleFormation, Some(instance)).await?;
        let entry = state.require_mut(instance)?;
        entry.formation.insert(process_type.to_string(), quantity);
        Ok(Formation {
            process_type: process_type.to_string(),
            quantity,
        })
    }

    async fn create_source_upload(&self) -> Result<SourceUpload, PlatformError> {
        let _state = self.enter(Operation::CreateSourceUpload, None).await?;
        let id = Uuid::new_v4();
        Ok(SourceUpload {
            put_url: format!("https://sources.{MOCK_DOMAIN}/{id}?put"),
            get_url: format!("https://sources.{MOCK_DOMAIN}/{id}?get"),
        })
    }

    async fn put_source_blob(&self, put_url: &str, blob: Bytes) -> Result<(), PlatformError> {
        let mut state = self.enter(Operation::PutSourceBlob, Some(put_url)).await?;
        state.uploads.insert(put_url.to_string(), blob);
        Ok(())
    }

    async fn create_build(&self, instance: &str, build: &NewBuild) -> Result<Build, PlatformError> {
        let mut state = self.enter(Operation::CreateBuild, Some(instance)).await?;
        let instance_id = state.require_mut(instance)?.instance.id.clone();
        let script = state.scripts.pop_front().unwrap_or(state.default_script);

        let id = Uuid::new_v4().to_string();
        let created = Build {
            id: id.clone(),
            instance_id,
            status: BuildStatus::Pending,
            release: None,
            output_stream_url: Some(format!("https://builds.{MOCK_DOMAIN}/{id}")),
        };
        info!(instance, build = %id, version = %build.version, ?script, "[MOCK] Created build");
        state.builds.insert(
            id,
            MockBuild {
                build: created.clone(),
                script,
                polls: 0,
            },
        );
        Ok(created)
    }

    async fn get_build(&self, instance: &str, build_id: &str) -> Result<Build, PlatformError> {
        let mut state = self.enter(Operation::GetBuild, Some(build_id)).await?;
        let entry = state
            .builds
            .get_mut(build_id)
            .ok_or_else(|| PlatformError::NotFound(format!("Couldn't find that build: {build_id}")))?;

        entry.polls += 1;
        let script = entry.script;
        match script {
            BuildScript::Succeed { after_polls } if entry.polls > after_polls => {
                entry.build.status = BuildStatus::Succeeded;
                if entry.build.release.is_none() {
                    entry.build.release = Some(Uuid::new_v4().to_string());
                }
            }
            BuildScript::Fail { after_polls } if entry.polls > after_polls => {
                entry.build.status = BuildStatus::Failed;
            }
            _ => {}
        }

        debug!(instance, build = build_id, status = %entry.build.status, "[MOCK] Polled build");
        Ok(entry.build.clone())
    }

    async fn build_output(&self, build: &Build) -> Result<BuildOutput, PlatformError> {
        let state = self.enter(Operation::BuildOutput, Some(&build.id)).await?;
        let chunks: Vec<Result<Bytes, PlatformError>> = state
            .build_log
            .iter()
            .map(|line| Ok(Bytes::from(format!("{line}\n"))))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn list_owned_instances(&self, scope: &str) -> Result<Vec<Instance>, PlatformError> {
        let state = self.enter(Operation::ListOwnedInstances, Some(scope)).await?;
        Ok(state.instances.iter().map(|e| e.instance.clone()).collect())
    }

    async fn add_collaborator(
        &self,
        instance: &str,
        user: &str,
        _silent: bool,
    ) -> Result<(), PlatformError> {
        let mut state = self.enter(Operation::AddCollaborator, Some(instance)).await?;
        let entry = state.require_mut(instance)?;
        if entry.collaborators.iter().any(|c| c == user) {
            return Err(PlatformError::AlreadyCollaborator(format!(
                "User is already a collaborator on app: {user}"
            )));
        }
        entry.collaborators.push(user.to_string());
        Ok(())
    }

    async fn remove_collaborator(&self, instance: &str, user: &str) -> Result<(), PlatformError> {
        let mut state = self.enter(Operation::RemoveCollaborator, Some(instance)).await?;
        let entry = state.require_mut(instance)?;
        let before = entry.collaborators.len();
        entry.collaborators.retain(|c| c != user);
        if entry.collaborators.len() == before {
            return Err(PlatformError::NotFound(format!("Couldn't find that collaborator: {user}")));
        }
        Ok(())
    }

    async fn create_transfer(
        &self,
        instance: &str,
        recipient: &str,
        _silent: bool,
    ) -> Result<Transfer, PlatformError> {
        let mut state = self.enter(Operation::CreateTransfer, Some(instance)).await?;
        let recipient = state.user(recipient);
        let entry = state.require_mut(instance)?;

        let transfer = Transfer {
            id: Uuid::new_v4().to_string(),
            owner: entry.instance.owner.clone(),
            recipient,
        };
        let instance_id = entry.instance.id.clone();
        state.transfers.insert(
            transfer.id.clone(),
            MockTransfer {
                transfer: transfer.clone(),
                instance_id,
                accepted: false,
            },
        );
        Ok(transfer)
    }

    async fn accept_transfer(&self, transfer_id: &str) -> Result<(), PlatformError> {
        let mut state = self.enter(Operation::AcceptTransfer, Some(transfer_id)).await?;
        let (instance_id, transfer) = match state.transfers.get_mut(transfer_id) {
            Some(t) if !t.accepted => {
                t.accepted = true;
                (t.instance_id.clone(), t.transfer.clone())
            }
            Some(_) => {
                return Err(PlatformError::Conflict(format!(
                    "Transfer {transfer_id} was already accepted"
                )))
            }
            None => {
                return Err(PlatformError::NotFound(format!(
                    "Couldn't find that transfer: {transfer_id}"
                )))
            }
        };

        let entry = state.require_mut(&instance_id)?;
        entry.instance.owner = transfer.recipient.clone();
        entry.collaborators.retain(|c| *c != transfer.recipient.email);
        // The previous owner stays on as a collaborator.
        entry.collaborators.push(transfer.owner.id.clone());
        info!(instance = %entry.instance.name, recipient = %transfer.recipient.email, "[MOCK] Transfer accepted");
        Ok(())
    }

    async fn list_domains(&self, instance: &str) -> Result<Vec<Domain>, PlatformError> {
        let mut state = self.enter(Operation::ListDomains, Some(instance)).await?;
        let entry = state.require_mut(instance)?;
        Ok(vec![Domain {
            id: format!("domain-{}", entry.instance.id),
            hostname: format!("{}.{MOCK_DOMAIN}", entry.instance.name),
        }])
    }
}

#[async_trait]
impl AccountResolver for MockPlatform {
    async fn resolve(&self, token: &str) -> Result<Account, PlatformError> {
        self.state()
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| PlatformError::Unauthorized("Invalid credentials provided.".to_string()))
    }
}
