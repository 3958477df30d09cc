//! The Kyuubi workload container, driven through Pebble.

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use indoc::formatdoc;
use rand::{distributions::Alphanumeric, Rng};
use snafu::{ensure, ResultExt, Snafu};
use tokio::{io::AsyncWriteExt, net::TcpStream, process::Command};

use crate::charm::{
    CONTAINER_NAME, JDBC_PORT, KYUUBI_RELEASE_PATH, SERVICE_NAME, SPARK_DEFAULTS_PATH,
};

const PEBBLE_SOCKET_ENV: &str = "PEBBLE_SOCKET";
const SERVING_REQUESTS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to spawn {command:?}"))]
    Spawn {
        source: std::io::Error,
        command: String,
    },

    #[snafu(display("command {command:?} failed: {output}"))]
    CommandFailed { command: String, output: String },

    #[snafu(display("cannot start Kyuubi before {path} has been written"))]
    MissingConfiguration { path: String },

    #[snafu(display("failed to write Pebble layer to {path}"))]
    WriteLayer {
        source: std::io::Error,
        path: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Diagnostic output of a failed command, empty for any other failure.
    pub fn output(&self) -> &str {
        match self {
            Error::CommandFailed { output, .. } => output,
            _ => "",
        }
    }
}

/// Creates a random string of ASCII letters and digits.
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Extracts the version from the `RELEASE` file shipped with Kyuubi.
pub fn parse_kyuubi_version(release: &str) -> Option<String> {
    release.lines().find_map(|line| {
        let (_, rest) = line.split_once("Kyuubi ")?;
        let version = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect::<String>();
        let version = version.trim_end_matches('.');
        (!version.is_empty()).then(|| version.to_string())
    })
}

/// Operations on the managed Kyuubi process and its filesystem.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Runs a command inside the workload container and returns its stdout.
    async fn exec(&self, command: &[String]) -> Result<String>;

    /// Content of a file, or `None` if it does not exist.
    async fn read(&self, path: &str) -> Result<Option<String>>;

    async fn write(&self, path: &str, content: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Whether the container can be reached at all.
    async fn ready(&self) -> bool;

    /// Whether the Kyuubi service is running.
    async fn active(&self) -> bool;

    /// Whether Kyuubi accepts connections on its JDBC port.
    async fn serving_requests(&self) -> bool;

    async fn kyuubi_version(&self) -> Option<String> {
        match self.read(KYUUBI_RELEASE_PATH).await {
            Ok(Some(release)) => parse_kyuubi_version(&release),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(%error, "failed to read Kyuubi release file");
                None
            }
        }
    }
}

/// [`Workload`] talking to the Pebble daemon of the Kyuubi container through the `pebble` CLI.
pub struct PebbleWorkload {
    socket: PathBuf,
    scratch_dir: PathBuf,
}

impl PebbleWorkload {
    pub fn new(charm_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket: PathBuf::from(format!("/charm/containers/{CONTAINER_NAME}/pebble.socket")),
            scratch_dir: charm_dir.into(),
        }
    }

    fn layer() -> String {
        formatdoc! {"
            summary: kyuubi layer
            description: pebble config layer for kyuubi
            services:
              {SERVICE_NAME}:
                override: merge
                startup: enabled
            "
        }
    }

    async fn pebble(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let command = format!("pebble {}", args.join(" "));
        let mut child = Command::new("pebble")
            .args(args)
            .env(PEBBLE_SOCKET_ENV, &self.socket)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(SpawnSnafu { command: &command })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .context(SpawnSnafu { command: &command })?;
        }
        let output = child
            .wait_with_output()
            .await
            .context(SpawnSnafu { command: &command })?;

        // keytool reports its errors on stdout
        ensure!(
            output.status.success(),
            CommandFailedSnafu {
                command,
                output: [&output.stderr, &output.stdout]
                    .iter()
                    .map(|stream| String::from_utf8_lossy(stream).trim().to_string())
                    .filter(|stream| !stream.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n"),
            }
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Workload for PebbleWorkload {
    async fn start(&self) -> Result<()> {
        ensure!(
            self.exists(SPARK_DEFAULTS_PATH).await?,
            MissingConfigurationSnafu {
                path: SPARK_DEFAULTS_PATH
            }
        );

        let layer_path = self.scratch_dir.join(".kyuubi-layer.yaml");
        tokio::fs::write(&layer_path, Self::layer())
            .await
            .context(WriteLayerSnafu {
                path: layer_path.display().to_string(),
            })?;
        let layer_path = layer_path.display().to_string();

        tracing::info!("Kyuubi is starting");
        self.pebble(&["add", "--combine", CONTAINER_NAME, &layer_path], None)
            .await?;
        self.pebble(&["restart", SERVICE_NAME], None).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        tracing::info!("stopping Kyuubi");
        if self.ready().await {
            self.pebble(&["stop", SERVICE_NAME], None).await?;
        }
        Ok(())
    }

    async fn exec(&self, command: &[String]) -> Result<String> {
        let mut args = vec!["exec", "--"];
        args.extend(command.iter().map(String::as_str));
        self.pebble(&args, None).await
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        if !self.exists(path).await? {
            return Ok(None);
        }
        self.pebble(&["exec", "--", "cat", path], None)
            .await
            .map(Some)
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        // write to a sibling file first so readers never see a partial file
        let script = r#"mkdir -p "$(dirname "$0")" && cat > "$0.tmp" && mv "$0.tmp" "$0""#;
        self.pebble(&["exec", "--", "sh", "-c", script, path], Some(content))
            .await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.pebble(&["exec", "--", "test", "-e", path], None).await {
            Ok(_) => Ok(true),
            Err(Error::CommandFailed { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn ready(&self) -> bool {
        self.pebble(&["services"], None).await.is_ok()
    }

    async fn active(&self) -> bool {
        match self.pebble(&["services", SERVICE_NAME], None).await {
            Ok(table) => table.lines().skip(1).any(|line| {
                let mut columns = line.split_whitespace();
                columns.next() == Some(SERVICE_NAME) && columns.nth(1) == Some("active")
            }),
            Err(error) => {
                tracing::debug!(%error, "service {SERVICE_NAME} is not running");
                false
            }
        }
    }

    async fn serving_requests(&self) -> bool {
        let address = format!("127.0.0.1:{JDBC_PORT}");
        matches!(
            tokio::time::timeout(SERVING_REQUESTS_TIMEOUT, TcpStream::connect(&address)).await,
            Ok(Ok(_))
        )
    }
}
