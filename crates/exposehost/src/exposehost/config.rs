use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::exposehost::tunnel::{codec::TunnelProtocol, transport::parse_transport};

pub const CONFIG_ENV: &str = "EXPOSEHOST_CONFIG";

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
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps the env var into the flag already; this covers callers that bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("exposehost.toml")));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["exposehost.toml", "exposehost.yaml", "exposehost.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no exposehost.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    if cfg!(target_os = "linux") {
        return Ok(PathBuf::from("/etc/exposehost/exposehost.toml"));
    }
    let proj = ProjectDirs::from("me", "exposehost", "exposehost")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("exposehost.toml"))
}

/// Writes the default template to `path` unless a file is already there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);
    parse_config(&s, &config_ext(path)).with_context(|| format!("config: {}", path.display()))
}

fn parse_config(s: &str, ext: &str) -> anyhow::Result<Config> {
    let fc: FileConfig = match ext {
        "toml" => toml::from_str(s).context("parse toml")?,
        "yaml" | "yml" => serde_yaml::from_str(s).context("parse yaml")?,
        _ => anyhow::bail!("config: unsupported config extension {ext}"),
    };
    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub balancer: Option<BalancerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub domain: String,
    pub transport: String,
    pub auth_token: String,
    pub public_bind_host: String,
    pub heartbeat_interval: Duration,
    pub callback_timeout: Duration,
    pub tls: TlsServerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct TlsServerConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub listen_addr: String,
    pub workers: usize,
    pub worker_base_port: u16,
    /// Externally managed workers. When set, no worker processes are spawned.
    pub worker_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub transport: String,
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub ca_file: String,
    pub auth_token: String,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub local_addr: String,
    pub dial_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    balancer: Option<FileBalancer>,
    client: Option<FileClient>,
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
struct FileServer {
    listen_addr: Option<String>,
    domain: Option<String>,
    transport: Option<String>,
    auth_token: Option<String>,
    public_bind_host: Option<String>,
    heartbeat_interval_ms: Option<i64>,
    callback_timeout_ms: Option<i64>,
    tls: Option<FileTlsServer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTlsServer {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBalancer {
    listen_addr: Option<String>,
    workers: Option<i64>,
    worker_base_port: Option<i64>,
    #[serde(default)]
    worker_ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: String,
    transport: Option<String>,
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    ca_file: Option<String>,
    auth_token: Option<String>,
    subdomain: Option<String>,
    protocol: Option<String>,
    local_addr: String,
    dial_timeout_ms: Option<i64>,
}

fn trimmed(v: &Option<String>) -> String {
    v.as_deref().unwrap_or("").trim().to_string()
}

fn or_default(v: &Option<String>, default: &str) -> String {
    let s = trimmed(v);
    if s.is_empty() { default.to_string() } else { s }
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            server: None,
            balancer: None,
            client: None,
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            cfg.logging.level = or_default(&l.level, &cfg.logging.level);
            cfg.logging.format = or_default(&l.format, &cfg.logging.format).to_ascii_lowercase();
            cfg.logging.output = or_default(&l.output, &cfg.logging.output);
            cfg.logging.add_source = l.add_source;
        }

        // --- Server ---
        if let Some(s) = &fc.server {
            let transport = parse_transport(&trimmed(&s.transport)).context("config: server.transport")?;
            cfg.server = Some(ServerConfig {
                listen_addr: or_default(&s.listen_addr, ":1435"),
                domain: or_default(&s.domain, "exposehost.local").to_ascii_lowercase(),
                transport,
                auth_token: trimmed(&s.auth_token),
                public_bind_host: or_default(&s.public_bind_host, "0.0.0.0"),
                heartbeat_interval: millis(s.heartbeat_interval_ms, 5000),
                callback_timeout: millis(s.callback_timeout_ms, 5000),
                tls: TlsServerConfig {
                    cert_file: s.tls.as_ref().map(|t| trimmed(&t.cert_file)).unwrap_or_default(),
                    key_file: s.tls.as_ref().map(|t| trimmed(&t.key_file)).unwrap_or_default(),
                },
            });
        }

        // --- Balancer ---
        if let Some(b) = &fc.balancer {
            if cfg.server.is_none() {
                anyhow::bail!("config: [balancer] requires a [server] section for its workers");
            }
            let workers = b.workers.unwrap_or(2);
            if workers <= 0 {
                anyhow::bail!("config: balancer.workers must be at least 1");
            }
            let base = b.worker_base_port.unwrap_or(1436);
            let last = base.checked_add(workers - 1);
            match last {
                Some(last) if base > 0 && last <= i64::from(u16::MAX) => {}
                _ => anyhow::bail!(
                    "config: balancer worker ports from {base} for {workers} workers out of range"
                ),
            }
            if b.worker_ports.contains(&0) {
                anyhow::bail!("config: balancer.worker_ports must not contain 0");
            }
            cfg.balancer = Some(BalancerConfig {
                listen_addr: or_default(&b.listen_addr, ":1435"),
                workers: workers as usize,
                worker_base_port: base as u16,
                worker_ports: b.worker_ports.clone(),
            });
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            if c.server_addr.trim().is_empty() {
                anyhow::bail!("config: client.server_addr is required");
            }
            let transport = parse_transport(&trimmed(&c.transport)).context("config: client.transport")?;
            let protocol: TunnelProtocol = or_default(&c.protocol, "http")
                .parse()
                .map_err(|e: String| anyhow::anyhow!("config: client.protocol: {e}"))?;
            cfg.client = Some(ClientConfig {
                server_addr: c.server_addr.trim().to_string(),
                transport,
                server_name: trimmed(&c.server_name),
                insecure_skip_verify: c.insecure_skip_verify,
                ca_file: trimmed(&c.ca_file),
                auth_token: trimmed(&c.auth_token),
                subdomain: trimmed(&c.subdomain),
                protocol,
                local_addr: c.local_addr.trim().to_string(),
                dial_timeout: millis(c.dial_timeout_ms, 5000),
            });
        }

        if cfg.server.is_none() && cfg.client.is_none() {
            anyhow::bail!("config: nothing to run (add a [server] or [client] section)");
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# exposehost configuration (auto-generated)
#
# This file was created because exposehost could not find a configuration file
# at the resolved config path. As written it runs a single tunnel server with a
# generated self-signed certificate.
#
# Add a [balancer] section to run the front door with a pool of worker
# processes, or a [client] section to expose a local service.

admin_addr = ":8080"

[logging]
level = "info"
format = "text" # text | json
output = "stderr" # stderr | stdout | discard | <file path>
add_source = false

[server]
listen_addr = ":1435"
domain = "exposehost.local"
transport = "tls" # tls | tcp
auth_token = ""
public_bind_host = "0.0.0.0"
heartbeat_interval_ms = 5000
callback_timeout_ms = 5000

[server.tls]
cert_file = ""
key_file = ""

# [balancer]
# listen_addr = ":1435"
# workers = 2
# worker_base_port = 1436
# worker_ports = [] # externally managed workers; replaces spawning

# [client]
# server_addr = "exposehost.local:1435"
# local_addr = "127.0.0.1:8000"
# subdomain = "demo"
# protocol = "http" # http | tcp
# insecure_skip_verify = true
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# exposehost configuration (auto-generated)
#
# This file was created because exposehost could not find a configuration file
# at the resolved config path. As written it runs a single tunnel server with a
# generated self-signed certificate.

admin_addr: ":8080"

logging:
  level: "info"
  format: "text" # text | json
  output: "stderr"
  add_source: false

server:
  listen_addr: ":1435"
  domain: "exposehost.local"
  transport: "tls" # tls | tcp
  auth_token: ""
  public_bind_host: "0.0.0.0"
  heartbeat_interval_ms: 5000
  callback_timeout_ms: 5000
  tls:
    cert_file: ""
    key_file: ""

# balancer:
#   listen_addr: ":1435"
#   workers: 2
#   worker_base_port: 1436
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "exposehost_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn minimal_server_gets_defaults() {
        let cfg = parse_config("[server]\n", "toml").unwrap();
        let s = cfg.server.unwrap();
        assert_eq!(s.listen_addr, ":1435");
        assert_eq!(s.domain, "exposehost.local");
        assert_eq!(s.transport, "tls");
        assert_eq!(s.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(s.callback_timeout, Duration::from_secs(5));
        assert!(cfg.balancer.is_none());
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, "text");
    }

    #[test]
    fn client_section_parses_protocol_and_transport() {
        let toml = r#"
[client]
server_addr = "exposehost.me:1435"
local_addr = "127.0.0.1:8000"
protocol = "TCP"
transport = "tcp"
subdomain = "demo"
"#;
        let cfg = parse_config(toml, "toml").unwrap();
        let c = cfg.client.unwrap();
        assert_eq!(c.protocol, TunnelProtocol::Tcp);
        assert_eq!(c.transport, "tcp");
        assert_eq!(c.dial_timeout, Duration::from_secs(5));

        let bad = toml.replace("\"TCP\"", "\"udp\"");
        let err = parse_config(&bad, "toml").unwrap_err();
        assert!(format!("{err:#}").contains("client.protocol"));
    }

    #[test]
    fn balancer_validation() {
        let err = parse_config("[balancer]\nworkers = 2\n", "toml").unwrap_err();
        assert!(err.to_string().contains("requires a [server]"));

        let err = parse_config("[server]\n[balancer]\nworkers = 0\n", "toml").unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        let err =
            parse_config("[server]\n[balancer]\nworkers = 3\nworker_base_port = 65534\n", "toml")
                .unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = parse_config(
            "[server]\n[balancer]\nworkers = 9223372036854775807\n",
            "toml",
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = parse_config("[server]\n[balancer]\nworker_ports = [1436, 0]\n", "toml")
            .unwrap_err();
        assert!(err.to_string().contains("must not contain 0"));

        let cfg = parse_config("[server]\n[balancer]\n", "toml").unwrap();
        let b = cfg.balancer.unwrap();
        assert_eq!((b.workers, b.worker_base_port), (2, 1436));
        assert!(b.worker_ports.is_empty());

        let cfg = parse_config("[server]\n[balancer]\nworker_ports = [2001, 2002]\n", "toml")
            .unwrap();
        assert_eq!(cfg.balancer.unwrap().worker_ports, vec![2001, 2002]);
    }

    #[test]
    fn unknown_fields_and_empty_configs_are_rejected() {
        let err = parse_config("[server]\nlisten = \":1\"\n", "toml").unwrap_err();
        assert!(format!("{err:#}").contains("listen"));

        let err = parse_config("admin_addr = \":8080\"\n", "toml").unwrap_err();
        assert!(err.to_string().contains("nothing to run"));
    }

    #[test]
    fn yaml_is_accepted() {
        let yaml = "server:\n  domain: Example.Test\n  transport: tcp\nlogging:\n  format: JSON\n";
        let cfg = parse_config(yaml, "yaml").unwrap();
        assert_eq!(cfg.server.unwrap().domain, "example.test");
        assert_eq!(cfg.logging.format, "json");
    }

    #[test]
    fn generated_templates_load() {
        let dir = temp_dir("templates");
        for name in ["exposehost.toml", "exposehost.yaml"] {
            let p = dir.join("nested").join(name);
            assert!(ensure_config_file(&p).unwrap());
            assert!(!ensure_config_file(&p).unwrap());
            let cfg = load_config(&p).unwrap();
            assert!(cfg.server.is_some());
            assert_eq!(cfg.admin_addr, ":8080");
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_dir_resolves_to_config_inside() {
        let dir = temp_dir("resolve");
        std::fs::write(dir.join("exposehost.yml"), "server: {}\n").unwrap();
        let r = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(r.path, dir.join("exposehost.yml"));

        let r = resolve_config_path(Some(dir.join("other"))).unwrap();
        assert_eq!(r.path, dir.join("other.toml"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
