//! In-memory stand-ins for Juju, the workload container, Kubernetes, PostgreSQL and S3.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{
            LoadBalancerIngress, LoadBalancerStatus, Namespace, Node, NodeAddress, NodeStatus,
            Pod, PodSpec, Service, ServiceAccount, ServiceStatus,
        },
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
    },
};

use crate::{
    charm::{
        AUTHENTICATION_DATABASE_NAME, AUTH_DB_REL, KYUUBI_RELEASE_PATH, METASTORE_DATABASE_NAME,
        METASTORE_DB_REL, PEER_REL, S3_REL, SERVICE_ACCOUNT_REL, TRUSTSTORE_PATH,
    },
    domain::{DatabaseConnectionInfo, KyuubiCluster, KyuubiServer, S3ConnectionInfo},
    events::Charm,
    juju::{self, Bag, Databag, Model, Relation, SecretLookup, StatusTarget},
    managers::{
        database::{DatabaseConnector, Row, SqlExecutor},
        k8s::{self, ClusterApi},
        s3::ObjectStorageVerifier,
    },
    status::CharmStatus,
    workload::{self, Workload},
};

pub const MODEL_NAME: &str = "kyuubi-model";
pub const KYUUBI_VERSION: &str = "1.10.2";

fn databag(pairs: &[(&str, &str)]) -> Databag {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

// Juju

struct RelationState {
    relation: Relation,
    local_app: Databag,
    local_unit: Databag,
    remote_app: Databag,
    remote_units: BTreeMap<String, Databag>,
}

struct ModelState {
    leader: bool,
    config: serde_json::Value,
    relations: Vec<RelationState>,
    next_relation_id: u32,
    secrets: BTreeMap<String, Databag>,
    labelled_secrets: BTreeMap<String, Databag>,
    planned_units: u32,
    bind_address: Option<String>,
    unit_status: Option<CharmStatus>,
    app_status: Option<CharmStatus>,
    workload_version: Option<String>,
    action_params: serde_json::Value,
    action_results: Databag,
    action_failure: Option<String>,
    action_logs: Vec<String>,
}

impl RelationState {
    fn new(relation: Relation) -> Self {
        Self {
            relation,
            local_app: Databag::new(),
            local_unit: Databag::new(),
            remote_app: Databag::new(),
            remote_units: BTreeMap::new(),
        }
    }
}

/// A Juju model holding a single unit of this application.
pub struct MemoryModel {
    unit_name: String,
    model_name: String,
    state: Mutex<ModelState>,
}

impl MemoryModel {
    pub fn leader(unit_name: &str) -> Self {
        Self {
            unit_name: unit_name.to_string(),
            model_name: MODEL_NAME.to_string(),
            state: Mutex::new(ModelState {
                leader: true,
                config: serde_json::json!({}),
                relations: Vec::new(),
                next_relation_id: 1,
                secrets: BTreeMap::new(),
                labelled_secrets: BTreeMap::new(),
                planned_units: 1,
                bind_address: Some("10.1.0.5".to_string()),
                unit_status: None,
                app_status: None,
                workload_version: None,
                action_params: serde_json::json!({}),
                action_results: Databag::new(),
                action_failure: None,
                action_logs: Vec::new(),
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ModelState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn with_relation<T>(
        &self,
        relation: &Relation,
        f: impl FnOnce(&mut RelationState) -> T,
    ) -> Option<T> {
        self.with_state(|state| {
            state
                .relations
                .iter_mut()
                .find(|candidate| {
                    candidate.relation.endpoint == relation.endpoint
                        && candidate.relation.id == relation.id
                })
                .map(f)
        })
    }

    pub fn set_leader(&self, leader: bool) {
        self.with_state(|state| state.leader = leader);
    }

    /// Relates to `remote_app`, whose application databag holds `remote_data`.
    pub fn add_relation(&self, endpoint: &str, remote_app: &str, remote_data: Databag) -> Relation {
        self.with_state(|state| {
            let relation =
                Relation::new(endpoint, state.next_relation_id).with_remote_app(remote_app);
            state.next_relation_id += 1;
            state.relations.push(RelationState {
                remote_app: remote_data,
                remote_units: BTreeMap::from([(format!("{remote_app}/0"), Databag::new())]),
                ..RelationState::new(relation.clone())
            });
            relation
        })
    }

    /// Establishes the peer relation, joined by the given other units.
    pub fn add_peer_relation(&self, peers: &[&str]) -> Relation {
        self.with_state(|state| {
            let relation = Relation::new(PEER_REL, state.next_relation_id);
            state.next_relation_id += 1;
            state.relations.push(RelationState {
                remote_units: peers
                    .iter()
                    .map(|unit| (unit.to_string(), Databag::new()))
                    .collect(),
                ..RelationState::new(relation.clone())
            });
            relation
        })
    }

    pub fn peer_relation(&self) -> Relation {
        self.relations_of(PEER_REL)
            .into_iter()
            .next()
            .expect("peer relation established")
    }

    pub fn relations_of(&self, endpoint: &str) -> Vec<Relation> {
        self.with_state(|state| {
            state
                .relations
                .iter()
                .filter(|candidate| candidate.relation.endpoint == endpoint)
                .map(|candidate| candidate.relation.clone())
                .collect()
        })
    }

    pub fn set_remote_app_data(&self, relation: &Relation, data: Databag) {
        self.with_relation(relation, |state| state.remote_app = data)
            .expect("relation exists");
    }

    pub fn bag(&self, relation: &Relation, bag: &Bag) -> Databag {
        self.with_relation(relation, |state| match bag {
            Bag::LocalApp => state.local_app.clone(),
            Bag::LocalUnit => state.local_unit.clone(),
            Bag::RemoteApp => state.remote_app.clone(),
            Bag::RemoteUnit(unit) => state.remote_units.get(unit).cloned().unwrap_or_default(),
        })
        .unwrap_or_default()
    }

    /// Stores a secret the way an operator would with `juju add-secret`.
    pub fn add_secret(&self, content: Databag) -> String {
        self.with_state(|state| {
            let uri = format!("secret:{}", state.secrets.len() + 1);
            state.secrets.insert(uri.clone(), content);
            uri
        })
    }

    pub fn secret_content(&self, label: &str) -> Option<Databag> {
        self.with_state(|state| state.labelled_secrets.get(label).cloned())
    }

    /// Merges `config` into the current configuration.
    pub fn set_config(&self, config: serde_json::Value) {
        self.with_state(|state| {
            if let (Some(current), serde_json::Value::Object(changes)) =
                (state.config.as_object_mut(), config)
            {
                current.extend(changes);
            }
        });
    }

    pub fn set_planned_units(&self, units: u32) {
        self.with_state(|state| state.planned_units = units);
    }

    pub fn set_bind_address(&self, address: &str) {
        self.with_state(|state| state.bind_address = Some(address.to_string()));
    }

    pub fn set_action_params(&self, params: serde_json::Value) {
        self.with_state(|state| state.action_params = params);
    }

    pub fn unit_status(&self) -> Option<CharmStatus> {
        self.with_state(|state| state.unit_status.clone())
    }

    pub fn app_status(&self) -> Option<CharmStatus> {
        self.with_state(|state| state.app_status.clone())
    }

    pub fn workload_version(&self) -> Option<String> {
        self.with_state(|state| state.workload_version.clone())
    }

    pub fn action_results(&self) -> Databag {
        self.with_state(|state| state.action_results.clone())
    }

    pub fn action_failure(&self) -> Option<String> {
        self.with_state(|state| state.action_failure.clone())
    }

    pub fn action_logs(&self) -> Vec<String> {
        self.with_state(|state| state.action_logs.clone())
    }
}

#[async_trait]
impl Model for MemoryModel {
    fn unit_name(&self) -> &str {
        &self.unit_name
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn is_leader(&self) -> juju::Result<bool> {
        Ok(self.with_state(|state| state.leader))
    }

    async fn config(&self) -> juju::Result<serde_json::Value> {
        Ok(self.with_state(|state| state.config.clone()))
    }

    async fn relations(&self, endpoint: &str) -> juju::Result<Vec<Relation>> {
        Ok(self.relations_of(endpoint))
    }

    async fn relation_units(&self, relation: &Relation) -> juju::Result<Vec<String>> {
        Ok(self
            .with_relation(relation, |state| state.remote_units.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn read(&self, relation: &Relation, bag: &Bag) -> juju::Result<Databag> {
        Ok(self.bag(relation, bag))
    }

    async fn write(&self, relation: &Relation, bag: &Bag, changes: &Databag) -> juju::Result<()> {
        let leader = self.with_state(|state| state.leader);
        let failure = |stderr: &str| juju::Error::HookToolFailed {
            tool: "relation-set".to_string(),
            stderr: stderr.to_string(),
        };
        if matches!(bag, Bag::LocalApp) && !leader {
            return Err(failure("cannot write application data: not the leader"));
        }
        self.with_relation(relation, |state| {
            let target = match bag {
                Bag::LocalApp => &mut state.local_app,
                Bag::LocalUnit => &mut state.local_unit,
                _ => return Err(failure("cannot write remote data")),
            };
            for (key, value) in changes {
                if value.is_empty() {
                    target.remove(key);
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
            Ok(())
        })
        .unwrap_or_else(|| Err(failure("relation not found")))
    }

    async fn secret_by_label(&self, label: &str) -> juju::Result<Option<Databag>> {
        Ok(self.secret_content(label))
    }

    async fn set_secret(&self, label: &str, content: &Databag) -> juju::Result<()> {
        self.with_state(|state| {
            state
                .labelled_secrets
                .insert(label.to_string(), content.clone())
        });
        Ok(())
    }

    async fn secret_by_id(&self, id: &str) -> juju::Result<SecretLookup> {
        Ok(self.with_state(|state| match state.secrets.get(id) {
            Some(content) => SecretLookup::Content(content.clone()),
            None => SecretLookup::NotFound,
        }))
    }

    async fn planned_units(&self) -> juju::Result<u32> {
        Ok(self.with_state(|state| state.planned_units))
    }

    async fn set_status(&self, target: StatusTarget, status: &CharmStatus) -> juju::Result<()> {
        self.with_state(|state| match target {
            StatusTarget::Unit => state.unit_status = Some(status.clone()),
            StatusTarget::Application => state.app_status = Some(status.clone()),
        });
        Ok(())
    }

    async fn set_workload_version(&self, version: &str) -> juju::Result<()> {
        self.with_state(|state| state.workload_version = Some(version.to_string()));
        Ok(())
    }

    async fn bind_address(&self, _endpoint: &str) -> juju::Result<Option<String>> {
        Ok(self.with_state(|state| state.bind_address.clone()))
    }

    async fn action_params(&self) -> juju::Result<serde_json::Value> {
        Ok(self.with_state(|state| state.action_params.clone()))
    }

    async fn action_set(&self, results: &Databag) -> juju::Result<()> {
        self.with_state(|state| state.action_results.extend(results.clone()));
        Ok(())
    }

    async fn action_fail(&self, message: &str) -> juju::Result<()> {
        self.with_state(|state| state.action_failure = Some(message.to_string()));
        Ok(())
    }

    async fn action_log(&self, message: &str) -> juju::Result<()> {
        self.with_state(|state| state.action_logs.push(message.to_string()));
        Ok(())
    }
}

// Workload

struct WorkloadState {
    ready: bool,
    active: bool,
    restarts: u32,
    files: BTreeMap<String, String>,
    commands: Vec<Vec<String>>,
    failing_programs: BTreeSet<String>,
    truststore: BTreeSet<String>,
    truststore_history: Vec<Vec<String>>,
}

/// A Kyuubi container with a filesystem, a fake `keytool` and a fake `openssl`.
pub struct FakeWorkload {
    state: Mutex<WorkloadState>,
}

impl Default for FakeWorkload {
    fn default() -> Self {
        let workload = Self {
            state: Mutex::new(WorkloadState {
                ready: true,
                active: false,
                restarts: 0,
                files: BTreeMap::new(),
                commands: Vec::new(),
                failing_programs: BTreeSet::new(),
                truststore: BTreeSet::new(),
                truststore_history: Vec::new(),
            }),
        };
        workload.set_release(KYUUBI_VERSION);
        workload
    }
}

fn argument<'a>(command: &'a [String], flag: &str) -> Option<&'a str> {
    command
        .iter()
        .position(|arg| arg == flag)
        .and_then(|index| command.get(index + 1))
        .map(String::as_str)
}

impl FakeWorkload {
    fn with_state<T>(&self, f: impl FnOnce(&mut WorkloadState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_ready(&self, ready: bool) {
        self.with_state(|state| state.ready = ready);
    }

    /// Replaces the `RELEASE` file, as an image with another Kyuubi version would.
    pub fn set_release(&self, version: &str) {
        self.with_state(|state| {
            state.files.insert(
                KYUUBI_RELEASE_PATH.to_string(),
                format!("Kyuubi {version} (git revision 1a2b3c4) built for\nSpark 3.4.2\n"),
            )
        });
    }

    /// Makes every later invocation of `program` fail, or succeed again.
    pub fn set_failing(&self, program: &str, failing: bool) {
        self.with_state(|state| {
            if failing {
                state.failing_programs.insert(program.to_string());
            } else {
                state.failing_programs.remove(program);
            }
        });
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.with_state(|state| state.files.get(path).cloned())
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.file(path).is_some()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.with_state(|state| state.commands.clone())
    }

    pub fn restarts(&self) -> u32 {
        self.with_state(|state| state.restarts)
    }

    pub fn truststore_aliases(&self) -> Vec<String> {
        self.with_state(|state| state.truststore.iter().cloned().collect())
    }

    /// The truststore aliases after every change, in order.
    pub fn truststore_history(&self) -> Vec<Vec<String>> {
        self.with_state(|state| state.truststore_history.clone())
    }

    fn keytool(state: &mut WorkloadState, command: &[String]) -> Result<(), String> {
        let alias = argument(command, "-alias").unwrap_or_default().to_string();
        if command.iter().any(|arg| arg == "-import") {
            if !state.truststore.insert(alias.clone()) {
                return Err(format!(
                    "keytool error: java.lang.Exception: Certificate not imported, alias <{alias}> already exists"
                ));
            }
        } else if command.iter().any(|arg| arg == "-changealias") {
            let destination = argument(command, "-destalias").unwrap_or_default().to_string();
            if !state.truststore.remove(&alias) {
                return Err(format!(
                    "keytool error: java.lang.Exception: Alias <{alias}> does not exist"
                ));
            }
            state.truststore.insert(destination);
        } else if command.iter().any(|arg| arg == "-delete") && !state.truststore.remove(&alias) {
            return Err(format!(
                "keytool error: java.lang.Exception: Alias <{alias}> does not exist"
            ));
        }
        let snapshot = state.truststore.iter().cloned().collect();
        state.truststore_history.push(snapshot);
        Ok(())
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn start(&self) -> workload::Result<()> {
        self.with_state(|state| state.active = true);
        Ok(())
    }

    async fn stop(&self) -> workload::Result<()> {
        self.with_state(|state| state.active = false);
        Ok(())
    }

    async fn restart(&self) -> workload::Result<()> {
        self.with_state(|state| {
            state.restarts += 1;
            state.active = true;
        });
        Ok(())
    }

    async fn exec(&self, command: &[String]) -> workload::Result<String> {
        self.with_state(|state| {
            state.commands.push(command.to_vec());
            let program = command.first().map(String::as_str);
            let result = match program {
                Some(program) if state.failing_programs.contains(program) => {
                    Err(format!("{program}: simulated failure"))
                }
                Some("keytool") => Self::keytool(state, command),
                Some("openssl") => {
                    if let Some(out) = argument(command, "-out") {
                        state.files.insert(out.to_string(), "PKCS12".to_string());
                    }
                    Ok(())
                }
                Some("rm") => {
                    for path in command.iter().skip(2) {
                        state.files.remove(path);
                        if path == TRUSTSTORE_PATH {
                            state.truststore.clear();
                        }
                    }
                    Ok(())
                }
                _ => Ok(()),
            };
            result.map(|()| String::new()).map_err(|output| workload::Error::CommandFailed {
                command: command.join(" "),
                output,
            })
        })
    }

    async fn read(&self, path: &str) -> workload::Result<Option<String>> {
        Ok(self.file(path))
    }

    async fn write(&self, path: &str, content: &str) -> workload::Result<()> {
        self.with_state(|state| state.files.insert(path.to_string(), content.to_string()));
        Ok(())
    }

    async fn exists(&self, path: &str) -> workload::Result<bool> {
        Ok(self.has_file(path))
    }

    async fn ready(&self) -> bool {
        self.with_state(|state| state.ready)
    }

    async fn active(&self) -> bool {
        self.with_state(|state| state.active)
    }

    async fn serving_requests(&self) -> bool {
        self.active().await
    }
}

// PostgreSQL

#[derive(Default)]
struct DatabaseState {
    unreachable: bool,
    extension: bool,
    users: BTreeMap<String, String>,
    tables: Vec<String>,
    schema_version: Option<String>,
    statements: Vec<(String, Option<String>)>,
}

/// Understands the handful of statements the charm issues. Clones share their state.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl FakeDatabase {
    pub fn unreachable() -> Self {
        let database = Self::default();
        database.with_state(|state| state.unreachable = true);
        database
    }

    /// A metastore holding `tables` in `public`, at `schema_version` if given.
    pub fn with_metastore(tables: &[&str], schema_version: Option<&str>) -> Self {
        let database = Self::default();
        database.with_state(|state| {
            state.tables = tables.iter().map(|table| table.to_string()).collect();
            state.schema_version = schema_version.map(str::to_string);
        });
        database
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DatabaseState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn usernames(&self) -> Vec<String> {
        self.with_state(|state| state.users.keys().cloned().collect())
    }

    pub fn password_matches(&self, username: &str, password: &str) -> bool {
        self.with_state(|state| state.users.get(username).map(String::as_str) == Some(password))
    }

    pub fn extension_enabled(&self) -> bool {
        self.with_state(|state| state.extension)
    }

    /// Every statement received, with the database it was sent to if not the default.
    pub fn statements(&self) -> Vec<(String, Option<String>)> {
        self.with_state(|state| state.statements.clone())
    }
}

fn one_row(value: &str) -> Vec<Row> {
    vec![vec![Some(value.to_string())]]
}

#[async_trait]
impl SqlExecutor for FakeDatabase {
    async fn execute(
        &self,
        query: &str,
        params: &[&str],
        database: Option<&str>,
    ) -> (bool, Vec<Row>) {
        self.with_state(|state| {
            state
                .statements
                .push((query.to_string(), database.map(str::to_string)));
            if state.unreachable {
                return (false, Vec::new());
            }
            let param = |index: usize| params.get(index).copied().unwrap_or_default().to_string();

            if query.starts_with("CREATE EXTENSION") {
                state.extension = true;
                (true, Vec::new())
            } else if query.starts_with("INSERT INTO") {
                let username = param(0);
                if state.users.contains_key(&username) {
                    return (false, Vec::new());
                }
                state.users.insert(username, param(1));
                (true, Vec::new())
            } else if query.starts_with("DELETE FROM") {
                state.users.remove(&param(0));
                (true, Vec::new())
            } else if query.starts_with("UPDATE") {
                match state.users.get_mut(&param(0)) {
                    Some(password) => {
                        *password = param(1);
                        (true, one_row("1"))
                    }
                    None => (true, Vec::new()),
                }
            } else if query.starts_with("SELECT 1 FROM") {
                let found = state.users.contains_key(&param(0));
                (true, if found { one_row("1") } else { Vec::new() })
            } else if query.contains("information_schema.tables") {
                let rows = state
                    .tables
                    .iter()
                    .map(|table| vec![Some(table.clone())])
                    .collect();
                (true, rows)
            } else if query.contains(r#"FROM "VERSION""#) {
                if !state.tables.iter().any(|table| table == "VERSION") {
                    return (false, Vec::new());
                }
                let rows = state.schema_version.as_deref().map(one_row).unwrap_or_default();
                (true, rows)
            } else {
                (true, Vec::new())
            }
        })
    }
}

/// Hands out the registered database of a connection info, by database name.
#[derive(Default)]
pub struct FakeConnector {
    databases: Mutex<BTreeMap<String, FakeDatabase>>,
}

impl FakeConnector {
    pub fn register(&self, dbname: &str, database: FakeDatabase) {
        self.databases
            .lock()
            .unwrap()
            .insert(dbname.to_string(), database);
    }
}

impl DatabaseConnector for FakeConnector {
    fn connect(&self, info: &DatabaseConnectionInfo) -> Box<dyn SqlExecutor> {
        let database = self
            .databases
            .lock()
            .unwrap()
            .entry(info.dbname.clone())
            .or_default()
            .clone();
        Box::new(database)
    }
}

// Kubernetes

#[derive(Default)]
struct ClusterState {
    forbidden: bool,
    namespaces: BTreeSet<String>,
    service_accounts: BTreeSet<(String, String)>,
    pods: BTreeMap<(String, String), Pod>,
    nodes: BTreeMap<String, Node>,
    services: BTreeMap<(String, String), Service>,
    // remaining lookups before a deleted service disappears
    terminating: BTreeMap<(String, String), u32>,
    finalizer_polls: u32,
    operations: Vec<String>,
    next_node_port: i32,
}

/// A Kubernetes API server keeping objects in memory.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    /// An API server refusing every request, as without `juju trust`.
    pub fn forbidden() -> Self {
        let cluster = Self::default();
        cluster.with_state(|state| state.forbidden = true);
        cluster
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn with_namespace(self, namespace: &str) -> Self {
        self.with_state(|state| state.namespaces.insert(namespace.to_string()));
        self
    }

    pub fn with_service_account(self, namespace: &str, name: &str) -> Self {
        self.with_state(|state| {
            state
                .service_accounts
                .insert((namespace.to_string(), name.to_string()))
        });
        self
    }

    /// A pod owned by the application's StatefulSet, scheduled on `node`.
    pub fn with_unit_pod(self, namespace: &str, pod: &str, node: &str) -> Self {
        let app = pod.rsplit_once('-').map_or(pod, |(app, _)| app);
        let pod_object = Pod {
            metadata: ObjectMeta {
                name: Some(pod.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "StatefulSet".to_string(),
                    name: app.to_string(),
                    uid: "2f0c3b4e-0000-4000-8000-000000000001".to_string(),
                    controller: Some(true),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..PodSpec::default()
            }),
            status: None,
        };
        self.with_state(|state| {
            state
                .pods
                .insert((namespace.to_string(), pod.to_string()), pod_object)
        });
        self
    }

    pub fn with_node(self, name: &str, addresses: &[(&str, &str)]) -> Self {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(type_, address)| NodeAddress {
                            type_: type_.to_string(),
                            address: address.to_string(),
                        })
                        .collect(),
                ),
                ..NodeStatus::default()
            }),
            ..Node::default()
        };
        self.with_state(|state| state.nodes.insert(name.to_string(), node));
        self
    }

    /// Deleted services stay visible for `polls` lookups, like a load balancer finalizer.
    pub fn set_service_finalizer(&self, polls: u32) {
        self.with_state(|state| state.finalizer_polls = polls);
    }

    /// `create <name>` and `delete <name>` for every service change, in order.
    pub fn operations(&self) -> Vec<String> {
        self.with_state(|state| state.operations.clone())
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.with_state(|state| {
            state
                .services
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        })
    }

    /// Completes the provisioning of a load balancer.
    pub fn assign_ingress(
        &self,
        namespace: &str,
        name: &str,
        ip: Option<&str>,
        hostname: Option<&str>,
    ) {
        self.with_state(|state| {
            let service = state
                .services
                .get_mut(&(namespace.to_string(), name.to_string()))
                .expect("service exists");
            service.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: ip.map(str::to_string),
                        hostname: hostname.map(str::to_string),
                        ..LoadBalancerIngress::default()
                    }]),
                }),
                ..ServiceStatus::default()
            });
        });
    }

    fn check_access(&self, resource: String) -> k8s::Result<()> {
        if self.with_state(|state| state.forbidden) {
            return Err(k8s::Error::Forbidden { resource });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn api_server(&self) -> String {
        "https://10.152.183.1:443".to_string()
    }

    async fn get_service(&self, namespace: &str, name: &str) -> k8s::Result<Option<Service>> {
        self.check_access(format!("service {namespace}/{name}"))?;
        Ok(self.with_state(|state| {
            let key = (namespace.to_string(), name.to_string());
            match state.terminating.get_mut(&key) {
                Some(0) => {
                    state.terminating.remove(&key);
                    state.services.remove(&key);
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
            state.services.get(&key).cloned()
        }))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> k8s::Result<()> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let resource = format!("service {namespace}/{name}");
        self.check_access(resource.clone())?;
        self.with_state(|state| {
            let key = (namespace.to_string(), name.clone());
            if state.services.contains_key(&key) {
                return Err(k8s::Error::AlreadyExists { resource });
            }
            let mut service = service.clone();
            let exposed = service
                .spec
                .as_ref()
                .and_then(|spec| spec.type_.as_deref())
                .is_some_and(|type_| type_ != "ClusterIP");
            if exposed {
                for port in service
                    .spec
                    .iter_mut()
                    .flat_map(|spec| spec.ports.iter_mut().flatten())
                {
                    port.node_port = Some(30000 + state.next_node_port);
                    state.next_node_port += 1;
                }
            }
            state.operations.push(format!("create {name}"));
            state.services.insert(key, service);
            Ok(())
        })
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> k8s::Result<()> {
        self.check_access(format!("service {namespace}/{name}"))?;
        self.with_state(|state| {
            state.operations.push(format!("delete {name}"));
            let key = (namespace.to_string(), name.to_string());
            if state.finalizer_polls > 0 {
                state.terminating.insert(key, state.finalizer_polls);
            } else {
                state.services.remove(&key);
            }
        });
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> k8s::Result<Option<Pod>> {
        self.check_access(format!("pod {namespace}/{name}"))?;
        Ok(self.with_state(|state| {
            state
                .pods
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }))
    }

    async fn get_node(&self, name: &str) -> k8s::Result<Option<Node>> {
        self.check_access(format!("node {name}"))?;
        Ok(self.with_state(|state| state.nodes.get(name).cloned()))
    }

    async fn get_namespace(&self, name: &str) -> k8s::Result<Option<Namespace>> {
        self.check_access(format!("namespace {name}"))?;
        Ok(self.with_state(|state| {
            state.namespaces.contains(name).then(|| Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..ObjectMeta::default()
                },
                ..Namespace::default()
            })
        }))
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> k8s::Result<Option<ServiceAccount>> {
        self.check_access(format!("serviceaccount {namespace}/{name}"))?;
        Ok(self.with_state(|state| {
            state
                .service_accounts
                .contains(&(namespace.to_string(), name.to_string()))
                .then(|| ServiceAccount {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..ObjectMeta::default()
                    },
                    ..ServiceAccount::default()
                })
        }))
    }
}

// S3

/// Accepts every set of credentials unless built with [`FakeS3::rejecting`].
pub struct FakeS3 {
    accept: bool,
}

impl Default for FakeS3 {
    fn default() -> Self {
        Self { accept: true }
    }
}

impl FakeS3 {
    pub fn rejecting() -> Self {
        Self { accept: false }
    }
}

#[async_trait]
impl ObjectStorageVerifier for FakeS3 {
    async fn verify(&self, _s3: &S3ConnectionInfo) -> bool {
        self.accept
    }
}

// Harness

/// The leader unit `kyuubi-k8s/0` in model `kyuubi-model`, with its peer relation
/// established and a ready workload.
pub struct Harness {
    pub model: MemoryModel,
    pub workload: FakeWorkload,
    pub cluster: FakeCluster,
    pub databases: FakeConnector,
    pub s3: FakeS3,
}

impl Harness {
    pub fn new() -> Self {
        let model = MemoryModel::leader("kyuubi-k8s/0");
        model.add_peer_relation(&[]);
        Self {
            model,
            workload: FakeWorkload::default(),
            cluster: FakeCluster::default()
                .with_unit_pod(MODEL_NAME, "kyuubi-k8s-0", "node-1")
                .with_node("node-1", &[("InternalIP", "10.0.0.7")])
                .with_namespace("spark")
                .with_service_account("spark", "kyuubi-engine"),
            databases: FakeConnector::default(),
            s3: FakeS3::default(),
        }
    }

    pub fn charm(&self) -> Charm<'_> {
        Charm {
            model: &self.model,
            workload: &self.workload,
            cluster_api: &self.cluster,
            databases: &self.databases,
            object_storage: &self.s3,
        }
    }

    pub fn relate_s3(&self) -> Relation {
        self.model.add_relation(
            S3_REL,
            "s3-integrator",
            databag(&[
                ("endpoint", "http://minio:9000"),
                ("access-key", "access"),
                ("secret-key", "secret"),
                ("bucket", "kyuubi"),
                ("path", "spark-events"),
            ]),
        )
    }

    /// Relates to an integration hub that grants `spark:kyuubi-engine`.
    pub fn relate_integration_hub(&self) -> Relation {
        self.model.add_relation(
            SERVICE_ACCOUNT_REL,
            "spark-integration-hub",
            databag(&[("service-account", "spark:kyuubi-engine")]),
        )
    }

    /// Relates to PostgreSQL for authentication, sharing the credentials through a
    /// secret, and returns the database behind it.
    pub fn relate_auth_db(&self) -> FakeDatabase {
        let database = FakeDatabase::default();
        self.databases
            .register(AUTHENTICATION_DATABASE_NAME, database.clone());
        let uri = self
            .model
            .add_secret(databag(&[("username", "relation_5"), ("password", "pw")]));
        self.model.add_relation(
            AUTH_DB_REL,
            "postgresql-k8s",
            databag(&[
                ("endpoints", "postgresql-k8s-primary:5432"),
                ("database", AUTHENTICATION_DATABASE_NAME),
                ("secret-user", &uri),
            ]),
        );
        database
    }

    pub fn relate_metastore(&self, database: FakeDatabase) -> Relation {
        self.databases.register(METASTORE_DATABASE_NAME, database);
        self.model.add_relation(
            METASTORE_DB_REL,
            "postgresql-k8s",
            databag(&[
                ("endpoints", "postgresql-k8s-primary:5432"),
                ("database", METASTORE_DATABASE_NAME),
                ("username", "relation_6"),
                ("password", "pw"),
            ]),
        )
    }

    pub fn unit_server(&self) -> KyuubiServer {
        KyuubiServer::from_databag(&self.model.bag(&self.model.peer_relation(), &Bag::LocalUnit))
    }

    pub fn cluster_state(&self) -> KyuubiCluster {
        KyuubiCluster::from_databag(&self.model.bag(&self.model.peer_relation(), &Bag::LocalApp))
    }
}
