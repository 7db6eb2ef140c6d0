use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use worker_core::formatters::sanitize_k8s_name;
use worker_core::models::LogSource;
use worker_core::schemas::BuildConfig;

use crate::error::AppError;
use super::logs::{LogSink, LogSinkFactory};

const PLAN_FILE: &str = "railpack-plan.json";
const FRONTEND_IMAGE: &str = "ghcr.io/railwayapp/railpack-frontend:latest";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Debug)]
pub struct BuilderConfig {
    pub buildkit_addr: String,
    pub registry_url: String,
    pub insecure_registry: bool,
    pub platform: Option<String>,
    pub timeout: Duration,
}

pub struct BuildOptions {
    pub source_path: PathBuf,
    pub image_name: String,
    pub deployment_id: String,
    pub project_name: String,
    pub build_config: BuildConfig,
    /// Already merged: defaults → framework → user (later wins).
    pub env_vars: HashMap<String, String>,
    pub port: u16,
}

pub struct BuildResult {
    pub image_name: String,
    pub duration: Duration,
    pub framework: String,
    pub cache_used: bool,
}

/// Drives the external packer + BuildKit pair and publishes the image.
pub struct ImageBuilder {
    config: BuilderConfig,
    sinks: LogSinkFactory,
}

impl ImageBuilder {
    pub fn new(config: BuilderConfig, sinks: LogSinkFactory) -> Self {
        Self { config, sinks }
    }

    pub async fn build(&self, opts: BuildOptions) -> Result<BuildResult, AppError> {
        let started = Instant::now();

        if !opts.source_path.exists() {
            return Err(AppError::Build(format!(
                "source path does not exist: {}",
                opts.source_path.display()
            )));
        }

        let sink = self
            .sinks
            .prefixed_sink(&opts.deployment_id, "[build] ", LogSource::Build);

        sink.log(format!("Building from: {}", opts.source_path.display()));
        sink.log(format!("Target image: {}", opts.image_name));
        if !opts.env_vars.is_empty() {
            sink.log(format!(
                "Build env: {}",
                describe_env_for_logging(&opts.env_vars)
            ));
        }

        // Shrink the context BuildKit has to ingest.
        if let Err(e) = ensure_git_ignored(&opts.source_path).await {
            warn!(error = %e, "Failed to update .dockerignore");
        }

        // ─────────────────────────────────────────────────────────
        // Phase 1: generate the build plan
        // ─────────────────────────────────────────────────────────
        sink.log("");
        sink.log("📋 Generating build plan...");

        let prepare_args = prepare_args(&opts);
        if let Err(e) = self
            .run_streamed("railpack", &prepare_args, &opts.source_path, &sink)
            .await
        {
            sink.flush();
            sink.close().await;
            return Err(e);
        }

        // ─────────────────────────────────────────────────────────
        // Phase 2: build and push via BuildKit
        // ─────────────────────────────────────────────────────────
        let (build_args, cache_used) = self.build_args(&opts);

        sink.log("");
        sink.log(format!("$ buildctl {}", sanitize_args(&build_args).join(" ")));
        sink.log("");
        sink.log("🔨 Building image with BuildKit...");

        let timeout = if self.config.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.config.timeout
        };

        let mut child = Command::new("buildctl")
            .args(&build_args)
            .current_dir(&opts.source_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Build(format!("failed to start buildctl: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let pump_out = pump(stdout.map(BufReader::new), &sink);
            let pump_err = pump(stderr.map(BufReader::new), &sink);
            let (status, _, _) = tokio::join!(child.wait(), pump_out, pump_err);
            status
        };

        let status = match tokio::time::timeout(timeout, run).await {
            Ok(status) => status?,
            Err(_) => {
                sink.flush();
                sink.close().await;
                return Err(AppError::Build(format!(
                    "build timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        if !status.success() {
            sink.flush();
            sink.close().await;
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(AppError::Build(format!(
                "build failed with exit code {code}"
            )));
        }

        let duration = started.elapsed();
        sink.log("");
        sink.log(format!("✓ Build completed in {}s", duration.as_secs()));
        sink.log(format!("✓ Image pushed: {}", opts.image_name));
        sink.close().await;

        info!(
            image = %opts.image_name,
            duration_secs = duration.as_secs(),
            cache_used,
            "Build completed"
        );

        Ok(BuildResult {
            image_name: opts.image_name,
            duration,
            framework: opts.build_config.framework,
            cache_used,
        })
    }

    fn build_args(&self, opts: &BuildOptions) -> (Vec<String>, bool) {
        let mut args: Vec<String> = vec![
            "--addr".to_string(),
            self.config.buildkit_addr.clone(),
            "build".to_string(),
            "--frontend".to_string(),
            "gateway.v0".to_string(),
            "--opt".to_string(),
            format!("source={FRONTEND_IMAGE}"),
            "--local".to_string(),
            format!("context={}", opts.source_path.display()),
            "--local".to_string(),
            format!("dockerfile={}", opts.source_path.display()),
            "--progress".to_string(),
            "plain".to_string(),
        ];

        if let Some(platform) = &self.config.platform {
            args.push("--opt".to_string());
            args.push(format!("platform={platform}"));
        }

        let mut env_keys: Vec<&String> = opts.env_vars.keys().collect();
        env_keys.sort();
        for key in env_keys {
            args.push("--opt".to_string());
            args.push(format!("env:{key}={}", opts.env_vars[key]));
        }

        let mut cache_used = false;
        if let Some(cache_ref) = self.cache_ref(&opts.project_name) {
            args.push("--import-cache".to_string());
            args.push(format!("type=registry,ref={cache_ref}"));
            args.push("--export-cache".to_string());
            args.push(format!("type=registry,ref={cache_ref},mode=max"));
            cache_used = true;
        }

        let mut output = format!("type=image,name={},push=true", opts.image_name);
        if self.config.insecure_registry {
            output.push_str(",registry.insecure=true");
        }
        args.push("--output".to_string());
        args.push(output);

        (args, cache_used)
    }

    /// `<registry>/<sanitised-project>:buildcache`, shared by every build of
    /// the project.
    fn cache_ref(&self, project_name: &str) -> Option<String> {
        if self.config.registry_url.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}:buildcache",
            self.config.registry_url,
            sanitize_k8s_name(project_name)
        ))
    }

    async fn run_streamed(
        &self,
        program: &str,
        args: &[String],
        dir: &Path,
        sink: &LogSink,
    ) -> Result<(), AppError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Build(format!("failed to start {program}: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let pump_out = pump(stdout.map(BufReader::new), sink);
        let pump_err = pump(stderr.map(BufReader::new), sink);
        let (status, _, _) = tokio::join!(child.wait(), pump_out, pump_err);
        let status = status?;

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(AppError::Build(format!(
                "{program} prepare failed with exit code {code}"
            )));
        }
        Ok(())
    }
}

fn prepare_args(opts: &BuildOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "prepare".to_string(),
        ".".to_string(),
        "--plan-out".to_string(),
        PLAN_FILE.to_string(),
    ];

    if let Some(install_cmd) = opts.build_config.install_command.as_deref() {
        if !install_cmd.is_empty() {
            args.push("--install-cmd".to_string());
            args.push(install_cmd.to_string());
        }
    }
    if let Some(build_cmd) = opts.build_config.build_command.as_deref() {
        if !build_cmd.is_empty() {
            args.push("--build-cmd".to_string());
            args.push(build_cmd.to_string());
        }
    }
    if let Some(run_cmd) = opts.build_config.run_command.as_deref() {
        if !run_cmd.is_empty() {
            args.push("--start-cmd".to_string());
            args.push(run_cmd.to_string());
        }
    }

    let mut env: HashMap<String, String> = opts.env_vars.clone();
    env.entry("PORT".to_string())
        .or_insert_with(|| opts.port.to_string());

    let mut keys: Vec<String> = env.keys().cloned().collect();
    keys.sort();
    for key in keys {
        args.push("--env".to_string());
        args.push(format!("{key}={}", env[&key]));
    }

    args
}

async fn pump<R>(reader: Option<R>, sink: &LogSink)
where
    R: AsyncBufRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => sink.write(&String::from_utf8_lossy(&buf)),
            Err(e) => {
                debug!(error = %e, "build output read error");
                break;
            }
        }
    }
}

/// Appends `.git` to the context's `.dockerignore`, creating the file when
/// missing and leaving it alone when `.git` is already listed.
async fn ensure_git_ignored(source_path: &Path) -> Result<(), std::io::Error> {
    let path = source_path.join(".dockerignore");

    let existing = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    if existing.lines().any(|line| line.trim() == ".git") {
        return Ok(());
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(".git\n");

    tokio::fs::write(&path, updated).await
}

/// Secret-bearing `env:` opt values must never appear in logged command
/// lines.
fn sanitize_args(args: &[String]) -> Vec<String> {
    let mut sanitized = args.to_vec();
    for i in 0..sanitized.len() {
        if sanitized[i] == "--opt" && i + 1 < sanitized.len() {
            let opt = &sanitized[i + 1];
            if let Some(rest) = opt.strip_prefix("env:") {
                if let Some(eq) = rest.find('=') {
                    sanitized[i + 1] = format!("env:{}=***", &rest[..eq]);
                }
            }
        }
    }
    sanitized
}

// ─────────────────────────────────────────────────────────────
// Environment helpers
// ─────────────────────────────────────────────────────────────

pub fn default_build_env() -> HashMap<String, String> {
    HashMap::from([
        ("CI".to_string(), "true".to_string()),
        ("NODE_ENV".to_string(), "production".to_string()),
    ])
}

/// Framework-specific build knobs: telemetry off, production mode, and the
/// quirks each toolchain needs to build headless.
pub fn framework_env(framework: &str) -> HashMap<String, String> {
    let pairs: &[(&str, &str)] = match framework.to_lowercase().as_str() {
        "nextjs" => &[("NEXT_TELEMETRY_DISABLED", "1")],
        "nuxt" | "nuxtjs" => &[("NUXT_TELEMETRY_DISABLED", "1")],
        "gatsby" => &[("GATSBY_TELEMETRY_DISABLED", "1")],
        "angular" => &[("NG_CLI_ANALYTICS", "false")],
        "create-react-app" => &[("GENERATE_SOURCEMAP", "false")],
        "vite" | "vue" | "express" | "fastify" | "nestjs" | "node" => {
            &[("NODE_ENV", "production")]
        }
        "django" | "fastapi" | "streamlit" | "python" => &[
            ("PYTHONDONTWRITEBYTECODE", "1"),
            ("PYTHONUNBUFFERED", "1"),
        ],
        "flask" => &[
            ("FLASK_ENV", "production"),
            ("PYTHONDONTWRITEBYTECODE", "1"),
            ("PYTHONUNBUFFERED", "1"),
        ],
        "go" | "golang" => &[("CGO_ENABLED", "0")],
        _ => &[],
    };

    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Later maps win.
pub fn merge_env_vars(maps: &[HashMap<String, String>]) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for map in maps {
        for (k, v) in map {
            result.insert(k.clone(), v.clone());
        }
    }
    result
}

const SENSITIVE_ENV_WORDS: [&str; 12] = [
    "PASSWORD",
    "SECRET",
    "TOKEN",
    "API_KEY",
    "APIKEY",
    "PRIVATE_KEY",
    "CREDENTIAL",
    "AUTH",
    "DATABASE_URL",
    "ENCRYPTION_KEY",
    "JWT",
    "AWS_SECRET",
];

pub fn is_sensitive_env_key(key: &str) -> bool {
    let upper = key.to_uppercase();
    SENSITIVE_ENV_WORDS.iter().any(|word| upper.contains(word))
}

/// Renders the env map for the build log with secret values masked and
/// long values elided.
pub fn describe_env_for_logging(env_vars: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = env_vars.keys().collect();
    keys.sort();

    keys.into_iter()
        .map(|key| {
            let value = &env_vars[key];
            if is_sensitive_env_key(key) {
                format!("{key}=***")
            } else if value.len() > 50 {
                format!("{key}={}...", &value[..47])
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ─────────────────────────────────────────────────────────────
// Startup verification
// ─────────────────────────────────────────────────────────────

/// The worker cannot run without its external binaries; absence is a
/// startup failure.
pub async fn verify_tooling() -> Result<(), AppError> {
    for bin in ["git", "railpack", "buildctl"] {
        let output = Command::new(bin)
            .arg("--version")
            .output()
            .await
            .map_err(|e| AppError::Internal(format!("{bin} not found in PATH: {e}")))?;
        let version = String::from_utf8_lossy(&output.stdout);
        info!(binary = bin, version = %version.trim(), "Tooling verified");
    }
    Ok(())
}

/// Best-effort reachability probe; the actual build will surface a hard
/// failure if the daemon is down.
pub async fn check_buildkit_health(addr: &str) {
    let probe = Command::new("buildctl")
        .args(["--addr", addr, "debug", "workers"])
        .output();

    match tokio::time::timeout(Duration::from_secs(5), probe).await {
        Ok(Ok(output)) if output.status.success() => {
            info!(addr = %addr, "BuildKit health check passed");
        }
        Ok(Ok(output)) => {
            warn!(
                addr = %addr,
                output = %String::from_utf8_lossy(&output.stderr).trim(),
                "BuildKit health check failed"
            );
        }
        Ok(Err(e)) => warn!(addr = %addr, error = %e, "BuildKit health check failed"),
        Err(_) => warn!(addr = %addr, "BuildKit health check timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::services::logs::LogDispatcher;

    struct NullDispatcher;

    #[async_trait::async_trait]
    impl LogDispatcher for NullDispatcher {
        async fn dispatch(&self, _: &str, _: LogSource, _: Vec<String>) {}
    }

    fn builder(registry: &str) -> ImageBuilder {
        ImageBuilder::new(
            BuilderConfig {
                buildkit_addr: "tcp://127.0.0.1:1234".to_string(),
                registry_url: registry.to_string(),
                insecure_registry: true,
                platform: None,
                timeout: Duration::from_secs(900),
            },
            LogSinkFactory::new(Arc::new(NullDispatcher)),
        )
    }

    fn options(env: &[(&str, &str)]) -> BuildOptions {
        BuildOptions {
            source_path: PathBuf::from("/tmp/src"),
            image_name: "reg.local/demo:abcdef12".to_string(),
            deployment_id: "d1".to_string(),
            project_name: "My Demo".to_string(),
            build_config: BuildConfig {
                build_command: Some("npm run build".to_string()),
                run_command: Some("npm start".to_string()),
                ..Default::default()
            },
            env_vars: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            port: 3000,
        }
    }

    #[test]
    fn build_args_include_cache_refs_for_registry() {
        let b = builder("reg.local");
        let (args, cache_used) = b.build_args(&options(&[]));

        assert!(cache_used);
        let joined = args.join(" ");
        assert!(joined.contains("--import-cache type=registry,ref=reg.local/my-demo:buildcache"));
        assert!(joined.contains("--export-cache type=registry,ref=reg.local/my-demo:buildcache,mode=max"));
    }

    #[test]
    fn build_args_without_registry_skip_cache() {
        let b = builder("");
        let (args, cache_used) = b.build_args(&options(&[]));

        assert!(!cache_used);
        assert!(!args.join(" ").contains("cache"));
    }

    #[test]
    fn build_args_mark_insecure_registry_on_output() {
        let b = builder("reg.local");
        let (args, _) = b.build_args(&options(&[]));
        let output = args.iter().find(|a| a.starts_with("type=image")).unwrap();
        assert_eq!(
            output,
            "type=image,name=reg.local/demo:abcdef12,push=true,registry.insecure=true"
        );
    }

    #[test]
    fn sanitize_args_masks_env_opt_values() {
        let args: Vec<String> = [
            "--opt",
            "env:NPM_TOKEN=supersecret",
            "--opt",
            "source=ghcr.io/railwayapp/railpack-frontend:latest",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let sanitized = sanitize_args(&args);
        assert_eq!(sanitized[1], "env:NPM_TOKEN=***");
        assert_eq!(sanitized[3], "source=ghcr.io/railwayapp/railpack-frontend:latest");
        assert!(!sanitized.join(" ").contains("supersecret"));
    }

    #[test]
    fn prepare_args_carry_overrides_and_port() {
        let args = prepare_args(&options(&[("FOO", "bar")]));
        let joined = args.join(" ");
        assert!(joined.starts_with("prepare . --plan-out railpack-plan.json"));
        assert!(joined.contains("--build-cmd npm run build"));
        assert!(joined.contains("--start-cmd npm start"));
        assert!(joined.contains("--env FOO=bar"));
        assert!(joined.contains("--env PORT=3000"));
    }

    #[test]
    fn prepare_args_respect_user_port() {
        let args = prepare_args(&options(&[("PORT", "8080")]));
        let joined = args.join(" ");
        assert!(joined.contains("--env PORT=8080"));
        assert!(!joined.contains("PORT=3000"));
    }

    #[test]
    fn env_merge_later_maps_win() {
        let merged = merge_env_vars(&[
            default_build_env(),
            framework_env("nextjs"),
            HashMap::from([("NODE_ENV".to_string(), "staging".to_string())]),
        ]);
        assert_eq!(merged["NODE_ENV"], "staging");
        assert_eq!(merged["CI"], "true");
        assert_eq!(merged["NEXT_TELEMETRY_DISABLED"], "1");
    }

    #[test]
    fn framework_env_covers_major_toolchains() {
        assert_eq!(framework_env("flask")["FLASK_ENV"], "production");
        assert_eq!(framework_env("go")["CGO_ENABLED"], "0");
        assert!(framework_env("unknown-framework").is_empty());
    }

    #[test]
    fn sensitive_keys_are_detected() {
        assert!(is_sensitive_env_key("NPM_TOKEN"));
        assert!(is_sensitive_env_key("database_url"));
        assert!(is_sensitive_env_key("AwsSecretAccessKey"));
        assert!(!is_sensitive_env_key("PORT"));
        assert!(!is_sensitive_env_key("NODE_ENV"));
    }

    #[test]
    fn env_description_masks_secrets() {
        let env = HashMap::from([
            ("NPM_TOKEN".to_string(), "supersecret".to_string()),
            ("PORT".to_string(), "3000".to_string()),
        ]);
        let described = describe_env_for_logging(&env);
        assert_eq!(described, "NPM_TOKEN=***, PORT=3000");
    }

    #[tokio::test]
    async fn dockerignore_is_created_with_git_entry() {
        let dir = tempfile::tempdir().unwrap();
        ensure_git_ignored(dir.path()).await.unwrap();

        let content = tokio::fs::read_to_string(dir.path().join(".dockerignore"))
            .await
            .unwrap();
        assert_eq!(content, ".git\n");
    }

    #[tokio::test]
    async fn dockerignore_append_preserves_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(".dockerignore"), "node_modules")
            .await
            .unwrap();

        ensure_git_ignored(dir.path()).await.unwrap();

        let content = tokio::fs::read_to_string(dir.path().join(".dockerignore"))
            .await
            .unwrap();
        assert_eq!(content, "node_modules\n.git\n");
    }

    #[tokio::test]
    async fn dockerignore_with_git_already_listed_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(".dockerignore"), "dist\n.git\n")
            .await
            .unwrap();

        ensure_git_ignored(dir.path()).await.unwrap();

        let content = tokio::fs::read_to_string(dir.path().join(".dockerignore"))
            .await
            .unwrap();
        assert_eq!(content, "dist\n.git\n");
    }
}
