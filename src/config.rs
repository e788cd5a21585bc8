use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder substituted with the artifact path in the build command
pub const OUTPUT_PLACEHOLDER: &str = "{output}";
/// Placeholder substituted with the entry source path in the build command
pub const MAIN_PLACEHOLDER: &str = "{main}";

/// Global configuration for the development proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// The supervised backend application
    #[serde(default)]
    pub app: AppConfig,

    /// The proxy listener
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Source tree watching
    #[serde(default)]
    pub watch: WatchConfig,
}

/// A contiguous, inclusive range of backend ports, written as `"5000-5010"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            return 0;
        }
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl TryFrom<String> for PortRange {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        let (start, end) = match value.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (value, value),
        };

        let start: u16 = start
            .parse()
            .map_err(|_| format!("invalid port range '{}': bad start port", value))?;
        let end: u16 = end
            .parse()
            .map_err(|_| format!("invalid port range '{}': bad end port", value))?;

        if start == 0 || end < start {
            return Err(format!("invalid port range '{}'", value));
        }

        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A toolchain invocation with `{output}` / `{main}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl BuildCommand {
    /// Parse a shell-style command line such as `go build -o {output} {main}`
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut words = shell_words::split(line)
            .map_err(|e| anyhow::anyhow!("invalid build command '{}': {}", line, e))?;
        if words.is_empty() {
            anyhow::bail!("build command is empty");
        }
        let program = words.remove(0);
        Ok(Self { program, args: words })
    }

    /// Arguments with the placeholders substituted
    pub fn render_args(&self, output: &Path, main: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        let main = main.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(OUTPUT_PLACEHOLDER, &output)
                    .replace(MAIN_PLACEHOLDER, &main)
            })
            .collect()
    }

    fn mentions_output(&self) -> bool {
        self.args.iter().any(|a| a.contains(OUTPUT_PLACEHOLDER))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Entry source file handed to the toolchain
    #[serde(default = "default_main")]
    pub main: String,

    /// Port the backend listens on (used when no range is configured)
    #[serde(default = "default_app_port")]
    pub port: u16,

    /// Port range for zero-downtime rotation, e.g. "5000-5010"
    pub port_range: Option<PortRange>,

    /// Flag used to hand the port to the backend, e.g. "-p"
    pub port_flag: Option<String>,

    /// Directory receiving build artifacts (default: current directory)
    pub build_dir: Option<String>,

    /// Toolchain invocation (default: "go build -o {output} {main}")
    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Application root used to tell application frames from library frames
    /// (default: current directory)
    pub root: Option<String>,

    /// Display name of the project (default: name of the current directory)
    pub name: Option<String>,

    /// Seconds to wait for the backend to accept connections
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Milliseconds between readiness probe attempts
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            main: default_main(),
            port: default_app_port(),
            port_range: None,
            port_flag: None,
            build_dir: None,
            build_command: default_build_command(),
            root: None,
            name: None,
            startup_timeout_secs: default_startup_timeout(),
            probe_interval_ms: default_probe_interval(),
        }
    }
}

impl AppConfig {
    /// Create an app config for an entry file and port with defaults
    pub fn new(main: impl Into<String>, port: u16) -> Self {
        Self {
            main: main.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the port range and flag (builder pattern)
    pub fn with_port_range(mut self, range: PortRange, flag: &str) -> Self {
        self.port_range = Some(range);
        self.port_flag = Some(flag.to_string());
        self
    }

    /// Set the build command (builder pattern)
    pub fn with_build_command(mut self, command: &str) -> Self {
        self.build_command = command.to_string();
        self
    }

    /// Set the build output directory (builder pattern)
    pub fn with_build_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.build_dir = Some(dir.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Set the application root (builder pattern)
    pub fn with_root(mut self, dir: impl AsRef<Path>) -> Self {
        self.root = Some(dir.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Ports the supervisor may run the backend on. The first one is used
    /// for the initial start.
    pub fn ports(&self) -> PortRange {
        self.port_range.unwrap_or_else(|| PortRange::single(self.port))
    }

    /// Whether background builds rotate onto alternate ports
    pub fn is_multi_port(&self) -> bool {
        self.ports().len() > 1
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn build_command(&self) -> anyhow::Result<BuildCommand> {
        BuildCommand::parse(&self.build_command)
    }

    pub fn main_path(&self) -> PathBuf {
        PathBuf::from(&self.main)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.build_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Absolute application root, falling back to the working directory
    pub fn root(&self) -> PathBuf {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match &self.root {
            Some(root) if Path::new(root).is_absolute() => PathBuf::from(root),
            Some(root) => cwd.join(root),
            None => cwd,
        }
    }

    /// Project name, falling back to the working directory's name
    pub fn name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        std::env::current_dir()
            .ok()
            .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "app".to_string())
    }

    /// Validate the app configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.main.trim().is_empty() {
            errors.push("app: 'main' must name the entry source file".to_string());
        }

        if self.port_range.is_none() && self.port == 0 {
            errors.push("app: 'port' must be greater than 0".to_string());
        }

        if self.is_multi_port() && self.port_flag.is_none() {
            errors.push(format!(
                "app: 'port_range' {} requires 'port_flag' so the backend can be told its port",
                self.ports()
            ));
        }

        match self.build_command() {
            Ok(command) if !command.mentions_output() => {
                errors.push(format!(
                    "app: 'build_command' must contain the {} placeholder",
                    OUTPUT_PLACEHOLDER
                ));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("app: {}", e)),
        }

        if self.startup_timeout_secs == 0 {
            errors.push("app: 'startup_timeout_secs' must be greater than 0".to_string());
        }

        errors
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Port the proxy listens on
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Log request parameters and debug output
    #[serde(default)]
    pub verbose: bool,

    /// Maximum idle connections kept to the backend
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
            bind: default_bind_address(),
            verbose: false,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Directory to watch (default: directory of the entry source file)
    pub dir: Option<String>,

    /// File extensions that invalidate the build, as an alternation: "go|tmpl"
    #[serde(default = "default_watch_files")]
    pub files: String,

    /// Quiet period before a background rebuild fires, in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: None,
            files: default_watch_files(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Watched directory for the given entry source
    pub fn dir_for(&self, main: &Path) -> PathBuf {
        if let Some(dir) = &self.dir {
            return PathBuf::from(dir);
        }
        match main.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

// Default value functions
fn default_main() -> String {
    "main.go".to_string()
}

fn default_app_port() -> u16 {
    5000
}

fn default_build_command() -> String {
    "go build -o {output} {main}".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_probe_interval() -> u64 {
    100
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_watch_files() -> String {
    "go".to_string()
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.app.validate();

        if self.proxy.port == 0 {
            errors.push("proxy: 'port' must be greater than 0".to_string());
        }

        if self.app.ports().contains(self.proxy.port) {
            errors.push(format!(
                "proxy: port {} collides with the backend port(s) {}",
                self.proxy.port,
                self.app.ports()
            ));
        }

        if let Err(e) = regex::Regex::new(&format!(r"\.({})$", self.watch.files)) {
            errors.push(format!("watch: invalid 'files' pattern: {}", e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
