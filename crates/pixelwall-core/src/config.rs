//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level PixelWall configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<GroupsConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<ParticipantConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<ArtworkConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,
}

fn default_port() -> u16 {
    7154
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "none" or "token". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl GatewayAuthConfig {
    /// Get the effective auth mode.
    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

/// The well-known shared grid that every client can join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_grid_name")]
    pub name: String,

    #[serde(default = "default_grid_size")]
    pub width: u32,

    #[serde(default = "default_grid_size")]
    pub height: u32,

    #[serde(default = "default_background")]
    pub background_color: String,

    #[serde(default = "default_grid_rate_limit")]
    pub rate_limit: RateLimitConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            name: default_grid_name(),
            width: default_grid_size(),
            height: default_grid_size(),
            background_color: default_background(),
            rate_limit: default_grid_rate_limit(),
        }
    }
}

fn default_grid_name() -> String {
    "grid".into()
}

fn default_grid_size() -> u32 {
    128
}

fn default_background() -> String {
    "#FFFFFF".into()
}

fn default_grid_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        capacity: 5,
        window_secs: 300,
    }
}

/// Limits and defaults for ad-hoc groups created by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    #[serde(default = "default_group_size")]
    pub default_width: u32,

    #[serde(default = "default_group_size")]
    pub default_height: u32,

    /// Largest accepted edge length for a client-created canvas.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    #[serde(default = "default_max_layers")]
    pub max_layers: usize,

    /// Largest accepted `width * height * layers` for a client-created canvas.
    #[serde(default = "default_max_cells")]
    pub max_cells: u64,

    /// Maximum number of live ad-hoc groups (0 = unlimited).
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    #[serde(default = "default_group_rate_limit")]
    pub rate_limit: RateLimitConfig,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            default_width: default_group_size(),
            default_height: default_group_size(),
            max_dimension: default_max_dimension(),
            max_layers: default_max_layers(),
            max_cells: default_max_cells(),
            max_groups: default_max_groups(),
            rate_limit: default_group_rate_limit(),
        }
    }
}

fn default_group_size() -> u32 {
    32
}

fn default_max_dimension() -> u32 {
    512
}

fn default_max_layers() -> usize {
    16
}

fn default_max_cells() -> u64 {
    1 << 20
}

fn default_max_groups() -> usize {
    64
}

fn default_group_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        capacity: 600,
        window_secs: 60,
    }
}

/// Sliding-window paint admission settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Paints allowed inside one window.
    pub capacity: usize,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_secs)
    }
}

/// A participant known to the token resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub id: i64,
    pub display_name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl ParticipantConfig {
    /// Resolve the token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtworkConfig {
    /// Directory exported artworks are written to (default: `~/.pixelwall/artworks`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "pixelwall_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::PixelWallError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::PixelWallError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway
            .as_ref()
            .map(|g| g.port)
            .unwrap_or_else(default_port)
    }

    /// Address the gateway binds to.
    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Effective auth mode ("none" unless configured).
    pub fn auth_mode(&self) -> &str {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .map(|a| a.effective_mode())
            .unwrap_or("none")
    }

    /// Grid settings, falling back to defaults.
    pub fn grid(&self) -> GridConfig {
        self.grid.clone().unwrap_or_default()
    }

    /// Ad-hoc group settings, falling back to defaults.
    pub fn groups(&self) -> GroupsConfig {
        self.groups.clone().unwrap_or_default()
    }

    /// Directory exported artworks are written to.
    pub fn artwork_dir(&self) -> PathBuf {
        self.artwork
            .as_ref()
            .and_then(|a| a.dir.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("artworks"))
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "grid.rate_limit.capacity").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        match self.auth_mode() {
            "none" => {
                if !self.participants.is_empty() {
                    warnings.push(
                        "Participants are configured but auth mode is 'none'; tokens are ignored"
                            .to_string(),
                    );
                }
            }
            "token" => {
                if self.participants.is_empty() {
                    errors.push("Auth mode 'token' requires at least one participant".to_string());
                }
                for p in &self.participants {
                    if p.resolve_token().is_none() {
                        warnings.push(format!(
                            "Participant '{}' ({}) has no token configured",
                            p.display_name, p.id
                        ));
                    }
                }
            }
            other => errors.push(format!("Unknown auth mode: {other}")),
        }

        let grid = self.grid();
        if grid.width == 0 || grid.height == 0 {
            errors.push("Grid width and height must be positive".to_string());
        }
        if grid.rate_limit.capacity == 0 {
            errors.push("Grid rate limit capacity must be positive".to_string());
        }
        if grid.rate_limit.window_secs == 0 {
            warnings.push("Grid rate limit window is 0; paints are effectively unlimited".to_string());
        }

        let groups = self.groups();
        if groups.max_layers == 0 {
            errors.push("groups.max_layers must be positive".to_string());
        }
        if groups.default_width > groups.max_dimension
            || groups.default_height > groups.max_dimension
        {
            errors.push("Default group size exceeds groups.max_dimension".to_string());
        }
        if u64::from(groups.default_width) * u64::from(groups.default_height) > groups.max_cells {
            errors.push("Default group size exceeds groups.max_cells".to_string());
        }
        if groups.max_groups == 0 {
            warnings.push("groups.max_groups is 0; clients may create unlimited groups".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for PixelWall data: `~/.pixelwall/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pixelwall")
}
