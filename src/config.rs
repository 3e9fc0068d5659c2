use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose};
use clap::{Parser, ValueEnum};
use std::{env, fmt, str::FromStr};

const DEFAULT_MAX_BODY_BYTES: usize = 1 << 30;

/// Which object store backs the WebDAV tree.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Memory,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "memory" => Ok(Backend::Memory),
            other => bail!("unknown backend `{}` (expected sqlite or memory)", other),
        }
    }
}

/// The single shared username/password pair.
///
/// Only the expected `Authorization` header value is kept, computed once at
/// start-up.
#[derive(Clone)]
pub struct Credentials {
    expected: Vec<u8>,
    username: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        let token = general_purpose::STANDARD.encode(format!("{username}:{password}"));
        Self {
            expected: format!("Basic {token}").into_bytes(),
            username: username.to_string(),
        }
    }

    /// Bytes an `Authorization` header must equal exactly.
    pub fn expected_header(&self) -> &[u8] {
        &self.expected
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub storage_dir: String,
    pub database_url: String,
    pub credentials: Credentials,
    pub realm: String,
    /// Upper bound on concurrent per-object operations in COPY/MOVE.
    pub fanout: usize,
    pub max_body_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "WebDAV front end for a key-prefix object store")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_DAV_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_DAV_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Object store backend (overrides OBJECT_DAV_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Directory where object payloads are stored (overrides OBJECT_DAV_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_DAV_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Basic-auth username (overrides OBJECT_DAV_USERNAME)
    #[arg(long)]
    pub username: Option<String>,

    /// Basic-auth password (overrides OBJECT_DAV_PASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// Realm advertised in WWW-Authenticate (overrides OBJECT_DAV_REALM)
    #[arg(long)]
    pub realm: Option<String>,

    /// Concurrent copies per COPY/MOVE request (overrides OBJECT_DAV_FANOUT)
    #[arg(long)]
    pub fanout: Option<usize>,

    /// Largest accepted request body in bytes (overrides OBJECT_DAV_MAX_BODY_BYTES)
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge parsed arguments over the environment over defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        let username = match args.username {
            Some(v) => v,
            None => env_required("OBJECT_DAV_USERNAME")?,
        };
        let password = match args.password {
            Some(v) => v,
            None => env_required("OBJECT_DAV_PASSWORD")?,
        };

        let cfg = Self {
            host: args.host.unwrap_or_else(|| env_or("OBJECT_DAV_HOST", "0.0.0.0")),
            port: match args.port {
                Some(v) => v,
                None => env_parse("OBJECT_DAV_PORT", 3000)?,
            },
            backend: match args.backend {
                Some(v) => v,
                None => env_parse("OBJECT_DAV_BACKEND", Backend::Sqlite)?,
            },
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("OBJECT_DAV_STORAGE_DIR", "./data/objects")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_or("OBJECT_DAV_DATABASE_URL", "sqlite://./data/meta/object_dav.db")
            }),
            credentials: Credentials::new(&username, &password),
            realm: args.realm.unwrap_or_else(|| env_or("OBJECT_DAV_REALM", "OBJECTDAV")),
            fanout: match args.fanout {
                Some(v) => v,
                None => env_parse("OBJECT_DAV_FANOUT", 32)?,
            }
            .max(1),
            max_body_bytes: match args.max_body_bytes {
                Some(v) => v,
                None => env_parse("OBJECT_DAV_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
            },
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn env_required(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        Ok(_) | Err(env::VarError::NotPresent) => {
            bail!("{} (or the matching flag) must be set", name)
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", name, value, err)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_header_is_basic_token() {
        let creds = Credentials::new("user", "pass");
        assert_eq!(creds.expected_header(), b"Basic dXNlcjpwYXNz");
    }

    #[test]
    fn debug_output_hides_password() {
        let creds = Credentials::new("user", "hunter2");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("user"));
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("aHVudGVyMg"));
    }

    #[test]
    fn flags_take_precedence() {
        let args = Args::parse_from([
            "object-dav",
            "--username",
            "u",
            "--password",
            "p",
            "--port",
            "8080",
            "--backend",
            "memory",
            "--fanout",
            "0",
        ]);
        let cfg = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.fanout, 1);
        assert_eq!(cfg.addr(), format!("{}:8080", cfg.host));
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("SQLite".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert!("s3".parse::<Backend>().is_err());
    }
}
