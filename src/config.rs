use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::Provider;

pub(crate) const CONFIG_FILE: &str = "sandbox.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub start: GraphConfig,
    #[serde(default)]
    pub deploy: GraphConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Which exec provider backs the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecBackend {
    /// Long-lived Docker container.
    #[default]
    Docker,
    /// Processes on the host, in the project directory.
    Local,
}

impl std::fmt::Display for ExecBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for ExecBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            _ => anyhow::bail!("Unknown sandbox provider: '{s}'. Supported: docker, local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Exec provider: "docker" or "local"
    #[serde(default)]
    pub provider: ExecBackend,

    /// Working directory inside the sandbox
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Docker image to use
    #[serde(default = "default_image")]
    pub image: String,

    /// Fixed container name (generated when unset)
    #[serde(default)]
    pub container_name: Option<String>,

    /// Environment for every command
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Additional volume mounts
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: ExecBackend::default(),
            workdir: default_workdir(),
            image: default_image(),
            container_name: None,
            env: BTreeMap::new(),
            mounts: Vec::new(),
            network: NetworkConfig::default(),
            resources: ResourceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    #[default]
    AllowAll,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network policy
    #[serde(default)]
    pub policy: NetworkPolicy,

    /// Custom DNS servers
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            policy: NetworkPolicy::AllowAll,
            dns: default_dns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "8g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "4")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

/// Agent configuration - selects and configures the AI agent CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Which agent provider to use: "claude" or "cursor"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Cursor-specific configuration
    #[serde(default)]
    pub cursor: CursorConfig,

    /// Claude-specific configuration
    #[serde(default)]
    pub claude: ClaudeConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            cursor: CursorConfig::default(),
            claude: ClaudeConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Parse the provider string into a Provider enum
    pub fn get_provider(&self) -> Result<Provider> {
        self.provider.parse()
    }
}

fn default_provider() -> String {
    "claude".to_string()
}

/// Cursor CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to the Cursor agent CLI inside the sandbox
    #[serde(default = "default_cursor_path")]
    pub path: String,

    /// Model to use (optional, uses Cursor's default if not set)
    #[serde(default)]
    pub model: Option<String>,

    /// Output format for non-interactive mode
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            path: default_cursor_path(),
            model: None,
            output_format: default_output_format(),
        }
    }
}

fn default_cursor_path() -> String {
    "agent".to_string()
}

fn default_output_format() -> String {
    "text".to_string()
}

/// Claude Code CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Path to the Claude CLI inside the sandbox
    #[serde(default = "default_claude_path")]
    pub path: String,

    /// Model to use (optional)
    #[serde(default)]
    pub model: Option<String>,

    /// Skip permission prompts (required for autonomous operation)
    #[serde(default = "default_true")]
    pub skip_permissions: bool,

    /// Output format
    #[serde(default = "default_claude_output_format")]
    pub output_format: String,

    /// Verbose output
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            path: default_claude_path(),
            model: None,
            skip_permissions: true,
            output_format: default_claude_output_format(),
            verbose: false,
        }
    }
}

fn default_claude_path() -> String {
    "claude".to_string()
}

fn default_claude_output_format() -> String {
    "stream-json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Branches `git push` refuses to touch
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,

    /// Remote used when a branch has no upstream yet
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Commit URL template; `{sha}` is replaced with the commit hash
    #[serde(default)]
    pub commit_url: Option<String>,

    /// Commit author name
    #[serde(default = "default_author_name")]
    pub author_name: String,

    /// Commit author email
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            protected_branches: default_protected_branches(),
            remote: default_remote(),
            commit_url: None,
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

impl GitConfig {
    /// Check if a branch is protected
    pub fn is_protected_branch(&self, branch: &str) -> bool {
        self.protected_branches.iter().any(|b| b == branch)
    }

    /// Fills the commit URL template for `sha`, if one is configured.
    pub fn commit_url_for(&self, sha: &str) -> Option<String> {
        self.commit_url
            .as_ref()
            .map(|template| template.replace("{sha}", sha))
    }
}

/// An ordered list of provisioning steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// One provisioning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique id within the graph
    pub id: String,

    /// Display title (defaults to the id)
    #[serde(default)]
    pub title: Option<String>,

    /// Ids of tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Shell-style command line
    pub command: String,

    /// Run as a service and complete once it is ready
    #[serde(default)]
    pub ready: Option<ReadyConfig>,
}

/// Readiness condition for a service task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyConfig {
    /// Ready once an HTTP request to this URL gets any response
    #[serde(default)]
    pub url: Option<String>,

    /// Ready once a stdout line contains this text
    #[serde(default)]
    pub pattern: Option<String>,

    /// Give up after this many seconds
    #[serde(default = "default_ready_timeout")]
    pub timeout_secs: u64,

    /// Probe interval for `url`
    #[serde(default = "default_ready_interval")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Events retained per run for late listeners (0 = unbounded)
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: default_max_buffered_events(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory for conversation thread files, relative to the project
    #[serde(default = "default_threads_dir")]
    pub threads_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            threads_dir: default_threads_dir(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_image() -> String {
    "node:20-bookworm".to_string()
}

fn default_dns() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

fn default_memory() -> String {
    "8g".to_string()
}

fn default_cpus() -> String {
    "4".to_string()
}

fn default_protected_branches() -> Vec<String> {
    vec![
        "main".to_string(),
        "master".to_string(),
        "production".to_string(),
    ]
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_author_name() -> String {
    "Sandbox Agent".to_string()
}

fn default_author_email() -> String {
    "agent@sandbox.local".to_string()
}

fn default_ready_timeout() -> u64 {
    120
}

fn default_ready_interval() -> u64 {
    500
}

fn default_max_buffered_events() -> usize {
    10_000
}

fn default_bind() -> String {
    "127.0.0.1:4080".to_string()
}

fn default_threads_dir() -> PathBuf {
    PathBuf::from(".sandbox/threads")
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}
