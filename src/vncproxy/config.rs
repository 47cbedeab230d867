use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::vncproxy::{dial, peer, resolver};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    let resolved = |path: PathBuf, source: ConfigPathSource| -> anyhow::Result<ResolvedConfigPath> {
        Ok(ResolvedConfigPath { path, source })
    };

    if let Some(p) = explicit_flag_path {
        return resolved(explicit_path(&p)?, ConfigPathSource::Flag);
    }

    // clap already maps VNCPROXY_CONFIG into the flag value when unset; this
    // only matters for callers that bypass the CLI.
    match std::env::var_os(CONFIG_ENV) {
        Some(p) if !p.is_empty() => {
            return resolved(explicit_path(Path::new(&p))?, ConfigPathSource::Env);
        }
        _ => {}
    }

    if let Some(p) = find_in_dir(Path::new(".")) {
        return resolved(p, ConfigPathSource::Cwd);
    }

    resolved(default_config_path()?, ConfigPathSource::Default)
}

const CONFIG_ENV: &str = "VNCPROXY_CONFIG";
const CONFIG_CANDIDATES: [&str; 3] = ["vncproxy.toml", "vncproxy.yaml", "vncproxy.yml"];

/// A directory is searched for a config file; a missing file without an
/// extension becomes `.toml`.
fn explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if p.is_dir() {
        return Ok(find_in_dir(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
    }
    if p.exists() || p.extension().is_some() {
        return Ok(p.to_path_buf());
    }
    Ok(p.with_extension("toml"))
}

fn find_in_dir(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

#[cfg(target_os = "linux")]
fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(PathBuf::from("/etc/vncproxy/vncproxy.toml"))
}

#[cfg(not(target_os = "linux"))]
fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("io", "vncproxy", "vncproxy")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join(CONFIG_CANDIDATES[0]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    fn of(path: &Path) -> anyhow::Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("yaml" | "yml") => Ok(ConfigFormat::Yaml),
            _ => anyhow::bail!(
                "config: unsupported extension of {} (expected .toml, .yaml or .yml)",
                path.display()
            ),
        }
    }

    fn template(self) -> &'static str {
        match self {
            ConfigFormat::Toml => DEFAULT_CONFIG_TEMPLATE_TOML,
            ConfigFormat::Yaml => DEFAULT_CONFIG_TEMPLATE_YAML,
        }
    }

    fn parse(self, src: &str) -> anyhow::Result<FileConfig> {
        let fc = match self {
            ConfigFormat::Toml => toml::from_str(src).context("parse toml")?,
            ConfigFormat::Yaml => serde_yaml::from_str(src).context("parse yaml")?,
        };
        Ok(fc)
    }
}

/// Writes the default template if `path` does not exist yet.
/// Returns true when a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = ConfigFormat::of(path)?.template();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let format = ConfigFormat::of(path)?;
    let src = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let fc = format
        .parse(&src)
        .with_context(|| format!("config: {}", path.display()))?;
    Config::from_file_config(fc)
}

/// Process-wide settings, read-only once loaded.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub ws_path: String,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub dial_timeout: Duration,
    pub buffer_size: usize,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub default_target: String,
    pub token_param: String,
    /// token -> backend `host:port`
    pub targets: BTreeMap<String, String>,
    /// Browser origins allowed to open a tunnel; empty allows any.
    pub allowed_origins: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_target: resolver::DEFAULT_TARGET.into(),
            token_param: "token".into(),
            targets: BTreeMap::new(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    #[serde(default)]
    ws_path: String,

    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    #[serde(default)]
    dial_timeout_ms: i64,

    #[serde(default)]
    buffer_size: i64,

    resolver: Option<FileResolver>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileResolver {
    default_target: Option<String>,
    token_param: Option<String>,
    #[serde(default)]
    targets: BTreeMap<String, String>,
    #[serde(default)]
    allowed_origins: Vec<String>,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            listen_addr: fc.listen_addr.trim().to_string(),
            ws_path: fc.ws_path.trim().to_string(),
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            // Negative values are treated like unset.
            dial_timeout: Duration::from_millis(fc.dial_timeout_ms.max(0) as u64),
            buffer_size: fc.buffer_size.max(0) as usize,
            resolver: ResolverConfig::default(),
        };

        if cfg.listen_addr.is_empty() {
            cfg.listen_addr = ":8080".into();
        }
        if cfg.ws_path.is_empty() {
            cfg.ws_path = "/ws".into();
        }
        if !cfg.ws_path.starts_with('/') {
            anyhow::bail!("config: ws_path must start with '/' (got {:?})", cfg.ws_path);
        }
        if cfg.dial_timeout.is_zero() {
            cfg.dial_timeout = dial::DEFAULT_DIAL_TIMEOUT;
        }
        if cfg.buffer_size == 0 {
            cfg.buffer_size = peer::DEFAULT_BUFFER_SIZE;
        }

        if let Some(l) = fc.logging {
            if let Some(level) = non_empty(l.level) {
                cfg.logging.level = level;
            }
            if let Some(format) = non_empty(l.format) {
                cfg.logging.format = format;
            }
            if let Some(output) = non_empty(l.output) {
                cfg.logging.output = output;
            }
            cfg.logging.add_source = l.add_source;
        }

        if let Some(r) = fc.resolver {
            if let Some(target) = non_empty(r.default_target) {
                cfg.resolver.default_target = target;
            }
            if let Some(param) = non_empty(r.token_param) {
                cfg.resolver.token_param = param;
            }
            for (token, target) in r.targets {
                let token = token.trim().to_string();
                let target = target.trim().to_string();
                if token.is_empty() {
                    anyhow::bail!("config: resolver.targets has an empty token");
                }
                if target.is_empty() {
                    anyhow::bail!("config: resolver.targets[{token:?}] missing target");
                }
                cfg.resolver.targets.insert(token, target);
            }
            cfg.resolver.allowed_origins = r
                .allowed_origins
                .into_iter()
                .filter_map(|o| non_empty(Some(o)))
                .collect();
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# vncproxy configuration

# WebSocket listener; ":PORT" binds all interfaces.
listen_addr = ":8080"
ws_path = "/ws"

# Introspection API (/health, /metrics, /sessions). Empty disables it.
admin_addr = ":9090"

# Backend dial timeout; <= 0 uses the 5s default.
dial_timeout_ms = 5000
buffer_size = 32768

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[resolver]
# Used for every connection when no targets are listed.
default_target = ":5901"
token_param = "token"

# Browser origins allowed to connect; empty allows any.
allowed_origins = []

# With targets, clients must connect with ?token=<name>.
# [resolver.targets]
# desktop1 = "10.0.0.5:5901"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# vncproxy configuration

listen_addr: ":8080"
ws_path: "/ws"
admin_addr: ":9090"

dial_timeout_ms: 5000
buffer_size: 32768

logging:
  level: info
  format: json
  output: stderr
  add_source: false

resolver:
  default_target: ":5901"
  token_param: token
  allowed_origins: []
  # targets:
  #   desktop1: "10.0.0.5:5901"
"#;

/// Trimmed value, or `None` when unset or blank.
fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
