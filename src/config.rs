use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{info, warn};

use crate::optimizer::OptimizerConfig;
use crate::partition::SearchMode;
use crate::tariff::{TariffError, TariffRates};

/// Complete application configuration, loaded from environment variables or default values.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub optimizer: OptimizerSettings,
    pub tariff: TariffSource,
}

impl AppConfig {
    /// Creates a configuration from the currently available environment variables.
    pub fn from_env() -> Self {
        Self {
            api: ApiConfig::from_env(),
            optimizer: OptimizerSettings::from_env(),
            tariff: TariffSource::from_env(),
        }
    }
}

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    bind_ip: IpAddr,
    display_host: String,
    port: u16,
}

impl ApiConfig {
    const DEFAULT_HOST: &'static str = "0.0.0.0";
    const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    const DEFAULT_PORT: u16 = 8080;
    const HOST_VAR: &'static str = "PARCEL_OPTIMIZER_API_HOST";
    const PORT_VAR: &'static str = "PARCEL_OPTIMIZER_API_PORT";

    fn from_env() -> Self {
        let host_value =
            env_string(Self::HOST_VAR).unwrap_or_else(|| Self::DEFAULT_HOST.to_string());
        let (bind_ip, effective_host) = match host_value.parse::<IpAddr>() {
            Ok(ip) => (ip, host_value),
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}'): {}. Using {}.",
                    Self::HOST_VAR,
                    host_value,
                    err,
                    Self::DEFAULT_HOST
                );
                (Self::DEFAULT_BIND_IP, Self::DEFAULT_HOST.to_string())
            }
        };

        let port = match env_string(Self::PORT_VAR) {
            Some(raw) => match raw.parse::<u16>() {
                Ok(value) if value != 0 => value,
                Ok(_) => {
                    warn!(
                        "{} must not be 0. Using {}.",
                        Self::PORT_VAR,
                        Self::DEFAULT_PORT
                    );
                    Self::DEFAULT_PORT
                }
                Err(err) => {
                    warn!(
                        "Could not parse {} ('{}'): {}. Using {}.",
                        Self::PORT_VAR,
                        raw,
                        err,
                        Self::DEFAULT_PORT
                    );
                    Self::DEFAULT_PORT
                }
            },
            None => Self::DEFAULT_PORT,
        };

        Self {
            bind_ip,
            display_host: effective_host,
            port,
        }
    }

    /// Socket address to bind the server to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Visible hostname for logging and hints.
    pub fn display_host(&self) -> &str {
        &self.display_host
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Indicates whether binding to all interfaces.
    pub fn binds_to_all_interfaces(&self) -> bool {
        match self.bind_ip {
            IpAddr::V4(addr) => addr == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(addr) => addr == Ipv6Addr::UNSPECIFIED,
        }
    }
}

/// Optimizer tunables plus the service-level answer for large searches.
#[derive(Clone, Debug, Default)]
pub struct OptimizerSettings {
    optimizer: OptimizerConfig,
    auto_confirm: bool,
}

impl OptimizerSettings {
    const MAX_PARCEL_MASS_VAR: &'static str = "PARCEL_OPTIMIZER_MAX_PARCEL_MASS";
    const WARNING_THRESHOLD_VAR: &'static str = "PARCEL_OPTIMIZER_WARNING_THRESHOLD";
    const COMPACTION_LIMIT_VAR: &'static str = "PARCEL_OPTIMIZER_COMPACTION_LIMIT";
    const LIGHT_ITEM_THRESHOLD_VAR: &'static str = "PARCEL_OPTIMIZER_LIGHT_ITEM_THRESHOLD";
    const COMPACTION_CAPACITY_VAR: &'static str = "PARCEL_OPTIMIZER_COMPACTION_CAPACITY";
    const COMPACTION_STEP_VAR: &'static str = "PARCEL_OPTIMIZER_COMPACTION_STEP";
    const SECONDS_PER_PARTITION_VAR: &'static str = "PARCEL_OPTIMIZER_SECONDS_PER_PARTITION";
    const COMPACTION_VAR: &'static str = "PARCEL_OPTIMIZER_COMPACTION";
    const PARALLEL_SEARCH_VAR: &'static str = "PARCEL_OPTIMIZER_PARALLEL_SEARCH";
    const SEARCH_MODE_VAR: &'static str = "PARCEL_OPTIMIZER_SEARCH_MODE";
    const AUTO_CONFIRM_VAR: &'static str = "PARCEL_OPTIMIZER_AUTO_CONFIRM";

    fn from_env() -> Self {
        let max_parcel_mass = load_f64_with_warning(
            Self::MAX_PARCEL_MASS_VAR,
            OptimizerConfig::DEFAULT_MAX_PARCEL_MASS,
            |value| value > 0.0 && value.is_finite(),
            "must be a positive number",
            "Adjusted maximum parcel mass; make sure it matches the carrier's ceiling",
        );

        let warning_threshold = load_u128_with_warning(
            Self::WARNING_THRESHOLD_VAR,
            OptimizerConfig::DEFAULT_WARNING_THRESHOLD,
            |value| value > 0,
            "must be greater than 0",
            "Adjusted confirmation threshold",
        );

        let compaction_limit = load_u128_with_warning(
            Self::COMPACTION_LIMIT_VAR,
            OptimizerConfig::DEFAULT_COMPACTION_LIMIT,
            |value| value > 0,
            "must be greater than 0",
            "Adjusted compaction limit may allow very long searches",
        );

        let light_item_threshold = load_f64_with_warning(
            Self::LIGHT_ITEM_THRESHOLD_VAR,
            OptimizerConfig::DEFAULT_LIGHT_ITEM_THRESHOLD,
            |value| value > 0.0 && value.is_finite(),
            "must be greater than 0",
            "Adjusted light item threshold",
        );

        let compaction_group_capacity = load_f64_with_warning(
            Self::COMPACTION_CAPACITY_VAR,
            OptimizerConfig::DEFAULT_COMPACTION_GROUP_CAPACITY,
            |value| value > 0.0 && value.is_finite(),
            "must be greater than 0",
            "Adjusted compaction group capacity",
        );

        let compaction_step = load_f64_with_warning(
            Self::COMPACTION_STEP_VAR,
            OptimizerConfig::DEFAULT_COMPACTION_STEP,
            |value| value > 0.0 && value.is_finite(),
            "must be greater than 0",
            "Adjusted compaction step",
        );

        let seconds_per_partition = load_f64_with_warning(
            Self::SECONDS_PER_PARTITION_VAR,
            OptimizerConfig::DEFAULT_SECONDS_PER_PARTITION,
            |value| value > 0.0 && value.is_finite(),
            "must be greater than 0",
            "Adjusted per-partition cost changes runtime estimates",
        );

        let compaction = load_bool(Self::COMPACTION_VAR, true);
        let parallel_search = load_bool(Self::PARALLEL_SEARCH_VAR, false);
        let auto_confirm = load_bool(Self::AUTO_CONFIRM_VAR, false);

        let search_mode = match env_string(Self::SEARCH_MODE_VAR) {
            Some(raw) => SearchMode::parse(&raw).unwrap_or_else(|| {
                warn!(
                    "Could not interpret {} ('{}'), expected exhaustive or branch_and_bound. Using exhaustive.",
                    Self::SEARCH_MODE_VAR,
                    raw
                );
                SearchMode::Exhaustive
            }),
            None => SearchMode::Exhaustive,
        };

        let optimizer = OptimizerConfig::builder()
            .max_parcel_mass(max_parcel_mass)
            .warning_threshold(warning_threshold)
            .compaction_limit(compaction_limit)
            .light_item_threshold(light_item_threshold)
            .compaction_group_capacity(compaction_group_capacity)
            .compaction_step(compaction_step)
            .seconds_per_partition(seconds_per_partition)
            .compaction(compaction)
            .search_mode(search_mode)
            .parallel_search(parallel_search)
            .build();

        Self {
            optimizer,
            auto_confirm,
        }
    }

    /// Returns the configured OptimizerConfig.
    pub fn optimizer_config(&self) -> OptimizerConfig {
        self.optimizer
    }

    /// Answer used when a request does not say whether large searches may run.
    pub fn auto_confirm(&self) -> bool {
        self.auto_confirm
    }
}

/// Where the tariff comes from.
#[derive(Clone, Debug, Default)]
pub struct TariffSource {
    file: Option<PathBuf>,
}

impl TariffSource {
    const TARIFF_FILE_VAR: &'static str = "PARCEL_OPTIMIZER_TARIFF_FILE";

    fn from_env() -> Self {
        Self {
            file: env_string(Self::TARIFF_FILE_VAR).map(PathBuf::from),
        }
    }

    /// Configured tariff file, if any.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Loads the configured tariff, falling back to the built-in reference.
    pub fn load(&self) -> Result<TariffRates, TariffError> {
        match &self.file {
            Some(path) => {
                let rates = TariffRates::from_csv_file(path)?;
                info!(path = %path.display(), brackets = rates.len(), "tariff loaded");
                Ok(rates)
            }
            None => Ok(TariffRates::reference()),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!("Access to {} failed: {}. Using default value.", name, err);
            None
        }
    }
}

fn parse_bool(raw: &str, var_name: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        other => {
            warn!(
                "Could not interpret {} ('{}') as boolean value. Using default value.",
                var_name, other
            );
            None
        }
    }
}

fn load_bool(var_name: &str, default: bool) -> bool {
    let value = env_string(var_name)
        .and_then(|raw| parse_bool(&raw, var_name))
        .unwrap_or(default);
    if value != default {
        info!("{} = {} (default {}).", var_name, value, default);
    }
    value
}

fn load_f64_with_warning(
    var_name: &str,
    default: f64,
    validator: impl Fn(f64) -> bool,
    invalid_hint: &str,
    warning: &str,
) -> f64 {
    parse_f64_setting(
        var_name,
        env_string(var_name).as_deref(),
        default,
        validator,
        invalid_hint,
        warning,
    )
}

fn parse_f64_setting(
    var_name: &str,
    raw: Option<&str>,
    default: f64,
    validator: impl Fn(f64) -> bool,
    invalid_hint: &str,
    warning: &str,
) -> f64 {
    match raw {
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(value) => {
                if !validator(value) {
                    warn!(
                        "{} contains invalid value '{}': {}. Using {}.",
                        var_name, raw, invalid_hint, default
                    );
                    default
                } else {
                    let tolerance = (default.abs().max(1.0)) * 1e-9;
                    if (value - default).abs() > tolerance {
                        warn!("{} ({} = {}).", warning, var_name, value);
                    }
                    value
                }
            }
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}') as number: {}. Using {}.",
                    var_name, raw, err, default
                );
                default
            }
        },
        None => default,
    }
}

fn load_u128_with_warning(
    var_name: &str,
    default: u128,
    validator: impl Fn(u128) -> bool,
    invalid_hint: &str,
    warning: &str,
) -> u128 {
    parse_u128_setting(
        var_name,
        env_string(var_name).as_deref(),
        default,
        validator,
        invalid_hint,
        warning,
    )
}

fn parse_u128_setting(
    var_name: &str,
    raw: Option<&str>,
    default: u128,
    validator: impl Fn(u128) -> bool,
    invalid_hint: &str,
    warning: &str,
) -> u128 {
    match raw {
        Some(raw) => match parse_integer::<u128>(raw.trim()) {
            Ok(value) => {
                if !validator(value) {
                    warn!(
                        "{} contains invalid value '{}': {}. Using {}.",
                        var_name, raw, invalid_hint, default
                    );
                    default
                } else {
                    if value != default {
                        warn!("{} ({} = {}).", warning, var_name, value);
                    }
                    value
                }
            }
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}') as integer: {}. Using {}.",
                    var_name, raw, err, default
                );
                default
            }
        },
        None => default,
    }
}

/// Accepts `_` digit separators, e.g. `4_213_597`.
fn parse_integer<T>(raw: &str) -> Result<T, T::Err>
where
    T: FromStr,
    T::Err: Display,
{
    raw.replace('_', "").parse::<T>()
}
