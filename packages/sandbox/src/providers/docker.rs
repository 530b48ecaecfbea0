// ABOUTME: Docker provider implementation for local container-based sandboxes
// ABOUTME: Uses bollard to provision project containers, exec into them and move files

use super::{
    ExecProcess, FileStat, InstanceSpec, Provider, ProviderError, Result, StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const LABEL_PREFIX: &str = "dappbox.sandbox";
const EXIT_POLL_ATTEMPTS: usize = 50;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DockerProvider {
    client: Docker,
    /// Host name used when building public URLs for published ports
    public_host: String,
    /// Keep-alive deadline per container; Docker has no native TTL
    deadlines: Arc<RwLock<HashMap<String, Instant>>>,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Connect to the local Docker daemon
    pub fn new(public_host: impl Into<String>) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client(client, public_host))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker, public_host: impl Into<String>) -> Self {
        Self {
            client,
            public_host: public_host.into(),
            deadlines: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Convert an instance spec to bollard config. The container idles on
    /// `sleep infinity`; all work happens through exec.
    fn to_bollard_config(spec: &InstanceSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
        labels.insert(format!("{}.name", LABEL_PREFIX), spec.name.clone());

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for port in &spec.ports {
            let container_port = format!("{}/tcp", port);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            // No host port: the daemon picks a free one
            let binding = vec![bollard::models::PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }];
            port_bindings.insert(container_port, Some(binding));
        }

        let host_config = bollard::models::HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            nano_cpus: Some((spec.resources.cpu as f64 * 1_000_000_000.0) as i64),
            memory: Some((spec.resources.memory_mb * 1024 * 1024) as i64),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.base.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = &info.status {
                            if status != &last_status {
                                debug!("Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = info.error {
                            return Err(ProviderError::ImageError(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(ProviderError::ImageError(format!(
                            "Failed to pull image {}: {}",
                            image, e
                        )));
                    }
                }
            }

            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn run_to_completion(&self, instance_id: &str, command: &str) -> Result<()> {
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let result = self.exec(instance_id, argv).await?.collect().await?;
        if !result.success() {
            return Err(ProviderError::ImageError(format!(
                "Setup command '{}' exited with {}: {}",
                command,
                result.exit_code,
                result.stderr_lossy().trim()
            )));
        }
        Ok(())
    }

    async fn ensure_running(&self, instance_id: &str) -> Result<()> {
        let inspect = self
            .client
            .inspect_container(instance_id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => ProviderError::NotFound(instance_id.to_string()),
                other => ProviderError::ContainerError(other.to_string()),
            })?;

        let running = inspect
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return Err(ProviderError::ContainerError(format!(
                "Container {} is not running",
                instance_id
            )));
        }
        Ok(())
    }

    /// Remove containers whose keep-alive window has lapsed.
    /// Returns the ids that were reclaimed.
    pub async fn reap_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .deadlines
            .read()
            .await
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            info!("Keep-alive elapsed for container {}, removing", id);
            if let Err(e) = self.terminate(id).await {
                warn!("Failed to reap container {}: {}", id, e);
            }
        }
        expired
    }

    /// Spawn a background task reaping expired containers every `interval`
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = self.reap_expired().await;
                if !reaped.is_empty() {
                    debug!("Reaped {} expired container(s)", reaped.len());
                }
            }
        })
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        if !self.image_exists(&spec.image.base).await? {
            self.pull_image(&spec.image.base).await?;
        }

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        self.deadlines.write().await.insert(
            container.id.clone(),
            Instant::now() + Duration::from_secs(spec.keep_alive_secs),
        );

        for command in &spec.image.commands {
            if let Err(e) = self.run_to_completion(&container.id, command).await {
                error!("Image setup failed for {}: {}", spec.name, e);
                if let Err(cleanup) = self.terminate(&container.id).await {
                    warn!("Failed to remove container {}: {}", container.id, cleanup);
                }
                return Err(e);
            }
        }

        Ok(container.id)
    }

    async fn expose_port(&self, instance_id: &str, port: u16) -> Result<String> {
        let inspect = self
            .client
            .inspect_container(instance_id, None)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let key = format!("{}/tcp", port);
        let host_port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                ProviderError::NetworkError(format!(
                    "Port {} is not published for container {}",
                    port, instance_id
                ))
            })?;

        Ok(format!("http://{}:{}", self.public_host, host_port))
    }

    async fn renew(&self, instance_id: &str, keep_alive_secs: u64) -> Result<()> {
        let deadline = self.deadlines.read().await.get(instance_id).copied();
        match deadline {
            Some(deadline) if deadline <= Instant::now() => {
                self.terminate(instance_id).await?;
                return Err(ProviderError::Expired(instance_id.to_string()));
            }
            Some(_) => {}
            None => return Err(ProviderError::NotFound(instance_id.to_string())),
        }

        self.ensure_running(instance_id).await?;

        self.deadlines.write().await.insert(
            instance_id.to_string(),
            Instant::now() + Duration::from_secs(keep_alive_secs),
        );
        Ok(())
    }

    async fn exec(&self, instance_id: &str, argv: Vec<String>) -> Result<ExecProcess> {
        debug!("Executing command in container {}: {:?}", instance_id, argv);

        let exec_config = CreateExecOptions {
            cmd: Some(argv),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(instance_id, exec_config)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let mut output = match start_result {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(ProviderError::ContainerError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let (sink, process) = ExecProcess::channel();
        let client = self.client.clone();
        let exec_id = exec.id;

        tokio::spawn(async move {
            while let Some(msg) = output.next().await {
                let (stream, message) = match msg {
                    Ok(LogOutput::StdOut { message }) => (StreamType::Stdout, message),
                    Ok(LogOutput::StdErr { message }) => (StreamType::Stderr, message),
                    Ok(LogOutput::Console { message }) => (StreamType::Stdout, message),
                    Ok(_) => continue,
                    Err(e) => {
                        sink.fail(StreamType::Stdout, ProviderError::StreamError(e.to_string()));
                        return;
                    }
                };
                // Keep draining even if the reader is gone so the exec finishes
                sink.send(stream, message.to_vec());
            }

            match wait_exit_code(&client, &exec_id).await {
                Ok(code) => sink.finish(code),
                Err(e) => sink.fail(StreamType::Stdout, e),
            }
        });

        Ok(process)
    }

    async fn stat_file(&self, instance_id: &str, path: &str) -> Result<FileStat> {
        let argv = vec![
            "stat".to_string(),
            "-c".to_string(),
            "%s %F".to_string(),
            path.to_string(),
        ];
        let result = self.exec(instance_id, argv).await?.collect().await?;
        if !result.success() {
            return Err(ProviderError::NotFound(path.to_string()));
        }

        let stdout = result.stdout_lossy();
        let (size, kind) = stdout.trim().split_once(' ').ok_or_else(|| {
            ProviderError::InternalError(format!("Unexpected stat output: {}", stdout.trim()))
        })?;

        Ok(FileStat {
            is_dir: kind == "directory",
            size: size.parse().unwrap_or(0),
        })
    }

    async fn upload_file(
        &self,
        instance_id: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        let (parent, file_name) = split_remote_path(remote_path)?;
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| ProviderError::FileError(e.to_string()))?;

        let tar_data = create_single_file_tar(file_name, &content)
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: parent.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(instance_id, Some(options), tar_data.into())
            .await
            .map_err(|e| ProviderError::FileError(e.to_string()))?;

        Ok(())
    }

    async fn download_file(
        &self,
        instance_id: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()> {
        let options = DownloadFromContainerOptions {
            path: remote_path.to_string(),
        };

        let mut stream = self
            .client
            .download_from_container(instance_id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::FileError(e.to_string()))?;
            data.extend_from_slice(&bytes);
        }

        let content = extract_single_file(&data)
            .map_err(|e| ProviderError::FileError(e.to_string()))?;

        tokio::fs::write(local_path, content)
            .await
            .map_err(|e| ProviderError::FileError(e.to_string()))
    }

    async fn terminate(&self, instance_id: &str) -> Result<()> {
        info!("Removing container: {}", instance_id);
        self.deadlines.write().await.remove(instance_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(instance_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }
}

fn split_remote_path(remote_path: &str) -> Result<(&str, &str)> {
    match remote_path.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => {
            Ok((if parent.is_empty() { "/" } else { parent }, name))
        }
        _ => Err(ProviderError::FileError(format!(
            "Invalid remote file path: {}",
            remote_path
        ))),
    }
}

// Helper functions for tar operations
fn create_single_file_tar(file_name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    use tar::{Builder, Header};

    let mut archive = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, file_name, content)?;

    archive.into_inner()
}

fn extract_single_file(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    use tar::Archive;

    let mut archive = Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "Archive contains no regular file",
    ))
}

/// Exit code of a stopped exec; `None` while Docker still reports it running
fn settled_exit_code(running: Option<bool>, exit_code: Option<i64>) -> Option<i64> {
    match running {
        Some(false) => exit_code,
        _ => None,
    }
}

/// Output can close before Docker records the exit, so poll until it settles
async fn wait_exit_code(client: &Docker, exec_id: &str) -> Result<i64> {
    for _ in 0..EXIT_POLL_ATTEMPTS {
        let inspect = client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;
        if let Some(code) = settled_exit_code(inspect.running, inspect.exit_code) {
            return Ok(code);
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    Err(ProviderError::StreamError(format!(
        "Exit code of exec {} not reported",
        exec_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ImageSpec, ResourceSpec};

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "dappbox-demo-1234".to_string(),
            image: ImageSpec {
                base: "node:20".to_string(),
                commands: vec!["npm install -g pnpm".to_string()],
            },
            resources: ResourceSpec {
                cpu: 1.0,
                memory_mb: 1024,
            },
            keep_alive_secs: 300,
            ports: vec![3000],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_bollard_config_publishes_ports_and_limits() {
        let config = DockerProvider::to_bollard_config(&spec());

        assert_eq!(config.image, Some("node:20".to_string()));
        let exposed = config.exposed_ports.unwrap();
        assert!(exposed.contains_key("3000/tcp"));

        let host = config.host_config.unwrap();
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.memory, Some(1024 * 1024 * 1024));
        assert!(host.port_bindings.unwrap().contains_key("3000/tcp"));

        let labels = config.labels.unwrap();
        assert_eq!(
            labels.get("dappbox.sandbox.name"),
            Some(&"dappbox-demo-1234".to_string())
        );
    }

    #[test]
    fn test_single_file_tar_roundtrip() {
        let tar = create_single_file_tar("page.tsx", b"export default 1").unwrap();
        let content = extract_single_file(&tar).unwrap();
        assert_eq!(content, b"export default 1");
    }

    #[test]
    fn test_split_remote_path() {
        assert_eq!(
            split_remote_path("/app/src/a.ts").unwrap(),
            ("/app/src", "a.ts")
        );
        assert_eq!(split_remote_path("/a.ts").unwrap(), ("/", "a.ts"));
        assert!(split_remote_path("/app/").is_err());
    }

    #[test]
    fn test_exit_code_only_after_exec_stops() {
        assert_eq!(settled_exit_code(Some(false), Some(3)), Some(3));
        assert_eq!(settled_exit_code(Some(false), Some(0)), Some(0));
        assert_eq!(settled_exit_code(Some(true), Some(0)), None);
        assert_eq!(settled_exit_code(None, Some(0)), None);
        assert_eq!(settled_exit_code(Some(false), None), None);
    }
}
