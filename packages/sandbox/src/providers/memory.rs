// ABOUTME: In-memory provider that simulates sandbox instances inside the service process
// ABOUTME: Backs local development without Docker and every test that needs a sandbox

use super::{
    ExecProcess, ExecSink, FileStat, InstanceSpec, Provider, ProviderError, Result, StreamType,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Canned behaviour for commands matching a prefix
#[derive(Debug, Clone, Default)]
pub struct ScriptedCommand {
    stdout: Vec<Vec<u8>>,
    stderr: Vec<Vec<u8>>,
    exit_code: i64,
    read_error: Option<String>,
    keep_running: bool,
}

impl ScriptedCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, chunk: impl Into<Vec<u8>>) -> Self {
        self.stdout.push(chunk.into());
        self
    }

    pub fn stderr(mut self, chunk: impl Into<Vec<u8>>) -> Self {
        self.stderr.push(chunk.into());
        self
    }

    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// Emit the configured output, then fail the stdout pipe as if the
    /// instance vanished mid-read.
    pub fn fail_after_output(mut self, message: impl Into<String>) -> Self {
        self.read_error = Some(message.into());
        self
    }

    /// Emit the configured output and leave the process running until
    /// [`MemoryProvider::exit_running`] or instance termination.
    pub fn keep_running(mut self) -> Self {
        self.keep_running = true;
        self
    }
}

#[derive(Debug, Default)]
struct Instance {
    name: String,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    expired: bool,
}

impl Instance {
    fn add_dir(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.dirs.insert(current.clone());
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.dirs.contains(path.trim_end_matches('/'))
    }
}

/// Outcome of simulating one command
struct Simulated {
    stdout: Vec<Vec<u8>>,
    stderr: Vec<Vec<u8>>,
    exit_code: i64,
    read_error: Option<String>,
    keep_running: bool,
}

impl Simulated {
    fn exit(code: i64) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: code,
            read_error: None,
            keep_running: false,
        }
    }

    fn stdout(data: String) -> Self {
        let mut simulated = Self::exit(0);
        if !data.is_empty() {
            simulated.stdout.push(data.into_bytes());
        }
        simulated
    }

    fn failure(code: i64, message: String) -> Self {
        let mut simulated = Self::exit(code);
        simulated.stderr.push(message.into_bytes());
        simulated
    }
}

impl From<&ScriptedCommand> for Simulated {
    fn from(script: &ScriptedCommand) -> Self {
        Self {
            stdout: script.stdout.clone(),
            stderr: script.stderr.clone(),
            exit_code: script.exit_code,
            read_error: script.read_error.clone(),
            keep_running: script.keep_running,
        }
    }
}

/// Provider keeping every instance's filesystem in process memory.
///
/// `mkdir -p`, `find <root> -type f [-not -path PATTERN]...`, `echo` and
/// `cd <dir> && ...` wrapped in `sh -c` are understood natively. Anything else
/// must be scripted with [`MemoryProvider::script`] or exits with 127.
#[derive(Default)]
pub struct MemoryProvider {
    instances: Mutex<HashMap<String, Instance>>,
    scripts: Mutex<Vec<(String, ScriptedCommand)>>,
    exec_log: Mutex<Vec<String>>,
    create_count: AtomicUsize,
    renew_count: AtomicUsize,
    create_delay: Mutex<Option<Duration>>,
    fail_next_create: AtomicBool,
    fail_next_expose: AtomicBool,
    failing_execs: Mutex<Vec<String>>,
    /// Processes left running, keyed by instance
    running: Mutex<Vec<(String, ExecSink)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register canned output for commands starting with `prefix`.
    /// Earlier registrations win.
    pub fn script(&self, prefix: impl Into<String>, command: ScriptedCommand) {
        lock(&self.scripts).push((prefix.into(), command));
    }

    /// Slow down provisioning so concurrent callers overlap
    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = Some(delay);
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_expose(&self) {
        self.fail_next_expose.store(true, Ordering::SeqCst);
    }

    /// Make every exec whose command line contains `fragment` fail to start
    pub fn fail_exec(&self, fragment: impl Into<String>) {
        lock(&self.failing_execs).push(fragment.into());
    }

    /// Finish every process left running by a `keep_running` script
    pub fn exit_running(&self, exit_code: i64) {
        let running = std::mem::take(&mut *lock(&self.running));
        for (_, sink) in running {
            sink.finish(exit_code);
        }
    }

    /// Running processes whose output is still being read
    pub fn attached_processes(&self) -> usize {
        lock(&self.running)
            .iter()
            .filter(|(_, sink)| sink.is_attached())
            .count()
    }

    /// Simulate server-side keep-alive expiry of an instance
    pub fn expire(&self, instance_id: &str) {
        if let Some(instance) = lock(&self.instances).get_mut(instance_id) {
            instance.expired = true;
        }
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    pub fn renew_count(&self) -> usize {
        self.renew_count.load(Ordering::SeqCst)
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.instances).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn instance_name(&self, instance_id: &str) -> Option<String> {
        lock(&self.instances)
            .get(instance_id)
            .map(|instance| instance.name.clone())
    }

    /// Every command line executed so far, argv joined by spaces
    pub fn exec_log(&self) -> Vec<String> {
        lock(&self.exec_log).clone()
    }

    pub fn file(&self, instance_id: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.instances)
            .get(instance_id)
            .and_then(|instance| instance.files.get(path).cloned())
    }

    /// Place a file directly, creating its parent directories
    pub fn put_file(&self, instance_id: &str, path: &str, content: impl Into<Vec<u8>>) {
        if let Some(instance) = lock(&self.instances).get_mut(instance_id) {
            if let Some((parent, _)) = path.rsplit_once('/') {
                instance.add_dir(parent);
            }
            instance.files.insert(path.to_string(), content.into());
        }
    }

    fn with_live_instance<T>(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut Instance) -> Result<T>,
    ) -> Result<T> {
        let mut instances = lock(&self.instances);
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_string()))?;
        if instance.expired {
            return Err(ProviderError::Expired(instance_id.to_string()));
        }
        f(instance)
    }

    fn find_script(&self, command_line: &str) -> Option<ScriptedCommand> {
        lock(&self.scripts)
            .iter()
            .find(|(prefix, _)| command_line.starts_with(prefix.as_str()))
            .map(|(_, script)| script.clone())
    }

    fn simulate(&self, instance: &mut Instance, argv: &[String]) -> Simulated {
        if argv.len() == 3 && argv[0] == "sh" && argv[1] == "-c" {
            return self.simulate_shell(instance, &argv[2]);
        }

        let command_line = argv.join(" ");
        if let Some(script) = self.find_script(&command_line) {
            return Simulated::from(&script);
        }

        match argv.first().map(String::as_str) {
            Some("mkdir") => {
                for path in argv.iter().skip(1).filter(|a| !a.starts_with('-')) {
                    instance.add_dir(path);
                }
                Simulated::exit(0)
            }
            Some("find") => simulate_find(instance, &argv[1..]),
            Some("echo") => Simulated::stdout(format!("{}\n", argv[1..].join(" "))),
            Some("true") => Simulated::exit(0),
            _ => not_found(&command_line),
        }
    }

    fn simulate_shell(&self, instance: &mut Instance, script: &str) -> Simulated {
        let mut command = script.trim();
        if let Some(rest) = command.strip_prefix("cd ") {
            let (dir, tail) = rest.split_once(" && ").unwrap_or((rest, ""));
            let dir = unquote(dir.trim());
            if !instance.is_dir(&dir) {
                return Simulated::failure(2, format!("sh: 1: cd: can't cd to {}\n", dir));
            }
            command = tail.trim();
        }

        if let Some(script) = self.find_script(command) {
            return Simulated::from(&script);
        }

        if command.is_empty() || command == "true" {
            return Simulated::exit(0);
        }
        if command == "echo" {
            return Simulated::stdout("\n".to_string());
        }
        if let Some(args) = command.strip_prefix("echo ") {
            let words: Vec<String> = args.split_whitespace().map(unquote).collect();
            return Simulated::stdout(format!("{}\n", words.join(" ")));
        }

        not_found(command)
    }
}

fn unquote(word: &str) -> String {
    word.trim_matches(|c| c == '\'' || c == '"').to_string()
}

fn not_found(command: &str) -> Simulated {
    let program = command.split_whitespace().next().unwrap_or(command);
    Simulated::failure(127, format!("sh: 1: {}: not found\n", program))
}

fn simulate_find(instance: &Instance, args: &[String]) -> Simulated {
    let Some(root) = args.first() else {
        return Simulated::failure(1, "find: missing path\n".to_string());
    };
    let root = root.trim_end_matches('/');
    if !root.is_empty() && !instance.is_dir(root) {
        return Simulated::failure(1, format!("find: '{}': No such file or directory\n", root));
    }

    // `-not -path '*/name/*'` excludes any file below a directory called name
    let mut excluded = Vec::new();
    let mut rest = args[1..].iter();
    while let Some(arg) = rest.next() {
        if arg == "-path" {
            if let Some(pattern) = rest.next() {
                excluded.push(pattern.trim_matches('*').to_string());
            }
        }
    }

    let prefix = format!("{}/", root);
    let listing: String = instance
        .files
        .keys()
        .filter(|path| root.is_empty() || path.starts_with(&prefix))
        .filter(|path| !excluded.iter().any(|fragment| path.contains(fragment.as_str())))
        .map(|path| format!("{}\n", path))
        .collect();

    Simulated::stdout(listing)
}

/// Write the simulated output. A sink that must stay open is handed back.
fn publish(sink: ExecSink, simulated: Simulated) -> Option<ExecSink> {
    for chunk in simulated.stdout {
        sink.send(StreamType::Stdout, chunk);
    }
    for chunk in simulated.stderr {
        sink.send(StreamType::Stderr, chunk);
    }
    match simulated.read_error {
        Some(message) => sink.fail(StreamType::Stdout, ProviderError::Expired(message)),
        None if simulated.keep_running => return Some(sink),
        None => sink.finish(simulated.exit_code),
    }
    None
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let delay = *lock(&self.create_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let attempt = self.create_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(ProviderError::ContainerError(
                "simulated provisioning failure".to_string(),
            ));
        }

        let instance_id = format!("mem-{}", attempt);
        let mut instance = Instance {
            name: spec.name.clone(),
            ..Default::default()
        };
        instance.add_dir("/tmp");

        debug!("Created memory instance {} ({})", instance_id, spec.name);
        lock(&self.instances).insert(instance_id.clone(), instance);
        Ok(instance_id)
    }

    async fn expose_port(&self, instance_id: &str, port: u16) -> Result<String> {
        if self.fail_next_expose.swap(false, Ordering::SeqCst) {
            return Err(ProviderError::NetworkError(
                "simulated addressing failure".to_string(),
            ));
        }
        self.with_live_instance(instance_id, |_| {
            Ok(format!("https://{}-{}.sandbox.local", instance_id, port))
        })
    }

    async fn renew(&self, instance_id: &str, _keep_alive_secs: u64) -> Result<()> {
        self.renew_count.fetch_add(1, Ordering::SeqCst);
        self.with_live_instance(instance_id, |_| Ok(()))
    }

    async fn exec(&self, instance_id: &str, argv: Vec<String>) -> Result<ExecProcess> {
        let command_line = argv.join(" ");
        lock(&self.exec_log).push(command_line.clone());
        if lock(&self.failing_execs)
            .iter()
            .any(|fragment| command_line.contains(fragment.as_str()))
        {
            return Err(ProviderError::ContainerError(format!(
                "simulated exec failure: {}",
                command_line
            )));
        }
        let simulated = self.with_live_instance(instance_id, |instance| {
            Ok(self.simulate(instance, &argv))
        })?;

        let (sink, process) = ExecProcess::channel();
        if let Some(sink) = publish(sink, simulated) {
            lock(&self.running).push((instance_id.to_string(), sink));
        }
        Ok(process)
    }

    async fn stat_file(&self, instance_id: &str, path: &str) -> Result<FileStat> {
        self.with_live_instance(instance_id, |instance| {
            if let Some(content) = instance.files.get(path) {
                Ok(FileStat {
                    is_dir: false,
                    size: content.len() as u64,
                })
            } else if instance.is_dir(path) {
                Ok(FileStat {
                    is_dir: true,
                    size: 0,
                })
            } else {
                Err(ProviderError::NotFound(path.to_string()))
            }
        })
    }

    async fn upload_file(
        &self,
        instance_id: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| ProviderError::FileError(e.to_string()))?;

        self.with_live_instance(instance_id, |instance| {
            let parent = remote_path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            if !parent.is_empty() && !instance.is_dir(parent) {
                return Err(ProviderError::FileError(format!(
                    "Parent directory does not exist: {}",
                    parent
                )));
            }
            instance.files.insert(remote_path.to_string(), content);
            Ok(())
        })
    }

    async fn download_file(
        &self,
        instance_id: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()> {
        let content = self.with_live_instance(instance_id, |instance| {
            instance
                .files
                .get(remote_path)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(remote_path.to_string()))
        })?;

        tokio::fs::write(local_path, content)
            .await
            .map_err(|e| ProviderError::FileError(e.to_string()))
    }

    async fn terminate(&self, instance_id: &str) -> Result<()> {
        lock(&self.instances).remove(instance_id);
        lock(&self.running).retain(|(owner, _)| owner != instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ImageSpec, ResourceSpec};

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "dappbox-test".to_string(),
            image: ImageSpec {
                base: "node:20".to_string(),
                commands: vec![],
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

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_mkdir_then_find_lists_files() {
        let provider = MemoryProvider::new();
        let id = provider.create_instance(&spec()).await.unwrap();

        let result = provider
            .exec(&id, argv(&["mkdir", "-p", "/app/src"]))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);

        provider.put_file(&id, "/app/src/a.ts", "a");
        provider.put_file(&id, "/app/node_modules/x/index.js", "x");

        let result = provider
            .exec(
                &id,
                argv(&["find", "/app", "-type", "f", "-not", "-path", "*/node_modules/*"]),
            )
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(result.stdout_lossy(), "/app/src/a.ts\n");
    }

    #[tokio::test]
    async fn test_shell_cd_and_echo() {
        let provider = MemoryProvider::new();
        let id = provider.create_instance(&spec()).await.unwrap();
        provider.put_file(&id, "/app/readme", "r");

        let result = provider
            .exec(&id, argv(&["sh", "-c", "cd /app && echo hi"]))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(result.stdout_lossy(), "hi\n");

        let result = provider
            .exec(&id, argv(&["sh", "-c", "cd /missing && echo hi"]))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_unknown_command_exits_127() {
        let provider = MemoryProvider::new();
        let id = provider.create_instance(&spec()).await.unwrap();

        let result = provider
            .exec(&id, argv(&["sh", "-c", "cd /tmp && frobnicate --all"]))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(result.exit_code, 127);
        assert!(result.stderr_lossy().contains("frobnicate"));
    }

    #[tokio::test]
    async fn test_scripted_command_wins_over_builtin() {
        let provider = MemoryProvider::new();
        provider.script("echo", ScriptedCommand::new().stdout("scripted").exit_code(4));
        let id = provider.create_instance(&spec()).await.unwrap();

        let result = provider
            .exec(&id, argv(&["sh", "-c", "cd /tmp && echo hi"]))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(result.stdout_lossy(), "scripted");
        assert_eq!(result.exit_code, 4);
    }

    #[tokio::test]
    async fn test_expired_instance_refuses_work() {
        let provider = MemoryProvider::new();
        let id = provider.create_instance(&spec()).await.unwrap();
        provider.expire(&id);

        assert!(matches!(
            provider.renew(&id, 300).await,
            Err(ProviderError::Expired(_))
        ));
        assert!(provider.exec(&id, argv(&["true"])).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_requires_parent_directory() {
        let provider = MemoryProvider::new();
        let id = provider.create_instance(&spec()).await.unwrap();
        let staging = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(staging.path(), "X").unwrap();

        let err = provider
            .upload_file(&id, staging.path(), "/app/a.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::FileError(_)));

        provider
            .exec(&id, argv(&["mkdir", "-p", "/app"]))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        provider
            .upload_file(&id, staging.path(), "/app/a.txt")
            .await
            .unwrap();
        assert_eq!(provider.file(&id, "/app/a.txt"), Some(b"X".to_vec()));
    }

    #[tokio::test]
    async fn test_kept_running_process_exits_on_demand() {
        let provider = MemoryProvider::new();
        provider.script("serve", ScriptedCommand::new().stdout("up\n").keep_running());
        let id = provider.create_instance(&spec()).await.unwrap();

        let process = provider.exec(&id, argv(&["serve"])).await.unwrap();
        assert_eq!(provider.attached_processes(), 1);

        provider.exit_running(3);
        let result = process.collect().await.unwrap();
        assert_eq!(result.stdout_lossy(), "up\n");
        assert_eq!(result.exit_code, 3);
        assert_eq!(provider.attached_processes(), 0);
    }

    #[tokio::test]
    async fn test_dropped_reader_detaches_running_process() {
        let provider = MemoryProvider::new();
        provider.script("serve", ScriptedCommand::new().keep_running());
        let id = provider.create_instance(&spec()).await.unwrap();

        let process = provider.exec(&id, argv(&["serve"])).await.unwrap();
        assert_eq!(provider.attached_processes(), 1);
        drop(process);
        assert_eq!(provider.attached_processes(), 0);
    }

    #[tokio::test]
    async fn test_terminate_unknown_instance_is_ok() {
        let provider = MemoryProvider::new();
        assert!(provider.terminate("mem-404").await.is_ok());
    }
}
