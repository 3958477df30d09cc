mod charm;
mod command;
mod config;
mod context;
mod domain;
mod events;
mod juju;
mod kyuubi_version;
mod managers;
mod status;
#[cfg(test)]
mod testing;
mod workload;

use std::path::PathBuf;

use clap::{crate_description, crate_version, Parser};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    events::{Charm, Event},
    juju::{deferred::DeferredQueue, hook_tools::HookTools},
    managers::{database::PostgresConnector, k8s::KubeClient, s3::S3Manager},
    workload::PebbleWorkload,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET_PLATFORM: Option<&str> = option_env!("TARGET");
}

const LOG_ENV: &str = "KYUUBI_OPERATOR_LOG";

/// Dispatches a single Juju hook or action. Juju provides every argument through the
/// environment of the hook.
#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(long, env = "JUJU_CHARM_DIR")]
    charm_dir: PathBuf,

    #[clap(long, env = "JUJU_UNIT_NAME")]
    unit_name: String,

    #[clap(long, env = "JUJU_MODEL_NAME")]
    model_name: String,

    /// E.g. `hooks/config-changed` or `actions/get-password`.
    #[clap(long, env = "JUJU_DISPATCH_PATH")]
    dispatch_path: String,

    #[clap(long, env = "JUJU_RELATION_ID")]
    relation_id: Option<String>,

    #[clap(long, env = "JUJU_REMOTE_APP")]
    remote_app: Option<String>,
}

fn initialize_logging() {
    // juju-log captures stderr into the unit log
    fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    initialize_logging();
    stackable_operator::utils::print_startup_string(
        crate_description!(),
        crate_version!(),
        built_info::GIT_VERSION,
        built_info::TARGET_PLATFORM.unwrap_or("unknown target"),
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );

    let event = Event::from_dispatch(
        &opts.dispatch_path,
        opts.relation_id.as_deref(),
        opts.remote_app.as_deref(),
    )?;
    tracing::info!(unit = %opts.unit_name, ?event, "dispatching");

    let model = HookTools::new(&opts.unit_name, &opts.model_name);
    let workload = PebbleWorkload::new(opts.charm_dir.clone());
    let cluster_api = KubeClient::new().await?;
    let charm = Charm {
        model: &model,
        workload: &workload,
        cluster_api: &cluster_api,
        databases: &PostgresConnector,
        object_storage: &S3Manager,
    };

    let mut queue = DeferredQueue::load(&opts.charm_dir).await?;
    let result = charm.dispatch(event, &mut queue).await;
    // events deferred by this run must survive a failing handler
    queue.save().await?;
    let status = result?;
    tracing::info!(%status, deferred = queue.len(), "dispatch finished");
    Ok(())
}
