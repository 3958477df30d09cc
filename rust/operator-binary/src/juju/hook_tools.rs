//! [`Model`] backed by the Juju hook tools available to a running charm.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use tokio::{io::AsyncWriteExt, process::Command};

use super::{
    Bag, Databag, HookToolFailedSnafu, Model, ParseHookToolOutputSnafu, Relation, Result,
    SecretLookup, SerializeHookToolInputSnafu, SpawnHookToolSnafu, StatusTarget,
};
use crate::status::CharmStatus;

pub struct HookTools {
    unit_name: String,
    model_name: String,
}

impl HookTools {
    pub fn new(unit_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            unit_name: unit_name.into(),
            model_name: model_name.into(),
        }
    }

    /// Runs a hook tool and returns its stdout.
    async fn run(&self, tool: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
        tracing::trace!(tool, ?args, "running hook tool");
        let mut command = Command::new(tool);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().context(SpawnHookToolSnafu { tool })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .context(SpawnHookToolSnafu { tool })?;
        }
        let output = child
            .wait_with_output()
            .await
            .context(SpawnHookToolSnafu { tool })?;

        ensure!(
            output.status.success(),
            HookToolFailedSnafu {
                tool,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json<T: for<'de> Deserialize<'de>>(&self, tool: &str, args: &[&str]) -> Result<T> {
        let mut args = args.to_vec();
        args.push("--format=json");
        let stdout = self.run(tool, &args, None).await?;
        let stdout = if stdout.trim().is_empty() {
            "null"
        } else {
            stdout.trim()
        };
        serde_json::from_str(stdout).context(ParseHookToolOutputSnafu { tool })
    }
}

#[derive(Deserialize)]
struct GoalState {
    #[serde(default)]
    units: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
impl Model for HookTools {
    fn unit_name(&self) -> &str {
        &self.unit_name
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn is_leader(&self) -> Result<bool> {
        self.run_json("is-leader", &[]).await
    }

    async fn config(&self) -> Result<serde_json::Value> {
        self.run_json("config-get", &["--all"]).await
    }

    async fn relations(&self, endpoint: &str) -> Result<Vec<Relation>> {
        let ids: Option<Vec<String>> = self.run_json("relation-ids", &[endpoint]).await?;
        let mut relations = Vec::new();
        for id in ids.unwrap_or_default() {
            let mut relation: Relation = id.parse()?;
            let units = self.relation_units(&relation).await?;
            relation.remote_app = units
                .first()
                .and_then(|unit| unit.split_once('/'))
                .map(|(app, _)| app.to_string());
            if relation.remote_app.is_none() {
                relation.remote_app = self
                    .run("relation-list", &["-r", &id, "--app"], None)
                    .await
                    .ok()
                    .map(|app| app.trim().to_string())
                    .filter(|app| !app.is_empty());
            }
            relations.push(relation);
        }
        Ok(relations)
    }

    async fn relation_units(&self, relation: &Relation) -> Result<Vec<String>> {
        let id = relation.to_string();
        let units: Option<Vec<String>> = self.run_json("relation-list", &["-r", &id]).await?;
        Ok(units.unwrap_or_default())
    }

    async fn read(&self, relation: &Relation, bag: &Bag) -> Result<Databag> {
        let id = relation.to_string();
        let remote_app = relation.remote_app.clone().unwrap_or_default();
        let (target, app_flag) = match bag {
            Bag::LocalApp => (self.app_name().to_string(), true),
            Bag::LocalUnit => (self.unit_name.clone(), false),
            Bag::RemoteApp => (remote_app, true),
            Bag::RemoteUnit(unit) => (unit.clone(), false),
        };
        if target.is_empty() {
            return Ok(Databag::new());
        }

        let mut args = vec!["-r", id.as_str()];
        if app_flag {
            args.push("--app");
        }
        args.extend(["-", target.as_str()]);
        let data: Option<Databag> = self.run_json("relation-get", &args).await?;
        Ok(data.unwrap_or_default())
    }

    async fn write(&self, relation: &Relation, bag: &Bag, changes: &Databag) -> Result<()> {
        let id = relation.to_string();
        let mut args = vec!["-r", id.as_str()];
        match bag {
            Bag::LocalApp => args.push("--app"),
            Bag::LocalUnit => {}
            Bag::RemoteApp | Bag::RemoteUnit(_) => {
                tracing::warn!(%relation, ?bag, "refusing to write a remote databag");
                return Ok(());
            }
        }
        args.extend(["--file", "-"]);
        // JSON is valid YAML, which is what relation-set expects on stdin
        let input = serde_json::to_vec(changes).context(SerializeHookToolInputSnafu {
            tool: "relation-set",
        })?;
        self.run("relation-set", &args, Some(&input)).await?;
        Ok(())
    }

    async fn secret_by_label(&self, label: &str) -> Result<Option<Databag>> {
        match self
            .run_json::<Databag>("secret-get", &["--label", label])
            .await
        {
            Ok(content) => Ok(Some(content)),
            Err(super::Error::HookToolFailed { stderr, .. }) if stderr.contains("not found") => {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn set_secret(&self, label: &str, content: &Databag) -> Result<()> {
        let pairs = content
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>();
        let info: Result<serde_json::Map<String, serde_json::Value>> =
            self.run_json("secret-info-get", &["--label", label]).await;

        match info.ok().and_then(|info| info.keys().next().cloned()) {
            Some(id) => {
                let mut args = vec![id.as_str()];
                args.extend(pairs.iter().map(String::as_str));
                self.run("secret-set", &args, None).await?;
            }
            None => {
                let mut args = vec!["--label", label, "--owner", "application"];
                args.extend(pairs.iter().map(String::as_str));
                self.run("secret-add", &args, None).await?;
            }
        }
        Ok(())
    }

    async fn secret_by_id(&self, id: &str) -> Result<SecretLookup> {
        match self.run_json::<Databag>("secret-get", &[id]).await {
            Ok(content) => Ok(SecretLookup::Content(content)),
            Err(super::Error::HookToolFailed { stderr, .. }) if stderr.contains("not found") => {
                Ok(SecretLookup::NotFound)
            }
            Err(super::Error::HookToolFailed { stderr, .. })
                if stderr.contains("permission denied") || stderr.contains("not authorized") =>
            {
                Ok(SecretLookup::Forbidden)
            }
            Err(error) => Err(error),
        }
    }

    async fn planned_units(&self) -> Result<u32> {
        let goal_state: GoalState = self.run_json("goal-state", &[]).await?;
        Ok(goal_state.units.len().max(1) as u32)
    }

    async fn set_status(&self, target: StatusTarget, status: &CharmStatus) -> Result<()> {
        let severity = status.severity().to_string();
        let message = status.to_string();
        let mut args = Vec::new();
        if target == StatusTarget::Application {
            args.push("--application");
        }
        args.extend([severity.as_str(), message.as_str()]);
        self.run("status-set", &args, None).await?;
        Ok(())
    }

    async fn set_workload_version(&self, version: &str) -> Result<()> {
        self.run("application-version-set", &[version], None)
            .await?;
        Ok(())
    }

    async fn bind_address(&self, endpoint: &str) -> Result<Option<String>> {
        let address = self
            .run("network-get", &[endpoint, "--bind-address"], None)
            .await?;
        let address = address.trim();
        Ok((!address.is_empty()).then(|| address.to_string()))
    }

    async fn action_params(&self) -> Result<serde_json::Value> {
        self.run_json("action-get", &[]).await
    }

    async fn action_set(&self, results: &Databag) -> Result<()> {
        let pairs = results
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>();
        let args = pairs.iter().map(String::as_str).collect::<Vec<_>>();
        self.run("action-set", &args, None).await?;
        Ok(())
    }

    async fn action_fail(&self, message: &str) -> Result<()> {
        self.run("action-fail", &[message], None).await?;
        Ok(())
    }

    async fn action_log(&self, message: &str) -> Result<()> {
        self.run("action-log", &[message], None).await?;
        Ok(())
    }
}
