//! Application configuration module
//! Handles environment variable loading, configuration validation, and engine settings

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub services_db: DatabaseConfig,
    pub users_db: DatabaseConfig,
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub ledger: LedgerConfig,
    pub pricing: PricingConfig,
    pub scheduler: SchedulerConfig,
}

/// Database configuration for one transactional scope
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Which payment gateway client to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayKind {
    Razorpay,
    Mock,
}

/// Payment gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub kind: GatewayKind,
    pub base_url: String,
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
    pub currency: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Loyalty wallet limits and lot lifetimes
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Currency value of one coin
    pub coin_value: Decimal,
    pub per_transaction_cap: i64,
    pub monthly_cap: i64,
    /// Monthly caps keyed by product category (`lodging`, `festival_pass`, `trip`)
    pub category_monthly_caps: HashMap<String, i64>,
    pub grace_period_days: i64,
    pub issued_lot_expiry_days: i64,
    pub referral_reward_coins: i64,
    pub referral_hold_days: i64,
}

/// One band of the service fee table; `upto: None` is the open top band
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSlab {
    pub upto: Option<Decimal>,
    pub fee: Decimal,
}

/// One band of the GST table
#[derive(Debug, Clone, PartialEq)]
pub struct GstSlab {
    pub upto: Option<Decimal>,
    pub pct: Decimal,
}

/// Fee and tax slabs applied to the taxable amount
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub fee_slabs: Vec<FeeSlab>,
    pub gst_slabs: Vec<GstSlab>,
}

/// Sweep intervals and hold lifetime
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub hold_ttl_secs: i64,
    pub hold_expiry_interval_secs: u64,
    pub issuance_interval_secs: u64,
    pub batch_size: i64,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            services_db: DatabaseConfig::from_env("SERVICES")?,
            users_db: DatabaseConfig::from_env("USERS")?,
            logging: LoggingConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
            ledger: LedgerConfig::from_env()?,
            pricing: PricingConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.services_db.validate()?;
        self.users_db.validate()?;
        self.logging.validate()?;
        self.gateway.validate()?;
        self.ledger.validate()?;
        self.pricing.validate()?;
        self.scheduler.validate()?;

        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string()))
}

impl DatabaseConfig {
    /// Reads `<SCOPE>_DATABASE_URL` and `<SCOPE>_DB_*` variables
    pub fn from_env(scope: &str) -> Result<Self, ConfigError> {
        let url_var = format!("{}_DATABASE_URL", scope);
        Ok(DatabaseConfig {
            url: env::var(&url_var).map_err(|_| ConfigError::MissingVariable(url_var.clone()))?,
            max_connections: parse_var(&format!("{}_DB_MAX_CONNECTIONS", scope), "20")?,
            min_connections: parse_var(&format!("{}_DB_MIN_CONNECTIONS", scope), "5")?,
            connection_timeout: parse_var(&format!("{}_DB_CONNECTION_TIMEOUT", scope), "30")?,
            idle_timeout: env::var(format!("{}_DB_IDLE_TIMEOUT", scope))
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let kind = match env::var("PAYMENT_GATEWAY")
            .unwrap_or_else(|_| "mock".to_string())
            .to_lowercase()
            .as_str()
        {
            "razorpay" => GatewayKind::Razorpay,
            "mock" => GatewayKind::Mock,
            _ => return Err(ConfigError::InvalidValue("PAYMENT_GATEWAY".to_string())),
        };

        Ok(GatewayConfig {
            kind,
            base_url: env::var("RAZORPAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string()),
            key_id: env::var("RAZORPAY_KEY_ID").unwrap_or_default(),
            key_secret: env::var("RAZORPAY_KEY_SECRET").unwrap_or_default(),
            webhook_secret: env::var("RAZORPAY_WEBHOOK_SECRET").unwrap_or_default(),
            currency: env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "INR".to_string()),
            timeout_secs: parse_var("PAYMENT_TIMEOUT_SECS", "15")?,
            max_retries: parse_var("PAYMENT_MAX_RETRIES", "2")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == GatewayKind::Razorpay {
            if self.key_id.is_empty() {
                return Err(ConfigError::MissingVariable("RAZORPAY_KEY_ID".to_string()));
            }
            if self.key_secret.is_empty() {
                return Err(ConfigError::MissingVariable(
                    "RAZORPAY_KEY_SECRET".to_string(),
                ));
            }
            if self.webhook_secret.is_empty() {
                return Err(ConfigError::MissingVariable(
                    "RAZORPAY_WEBHOOK_SECRET".to_string(),
                ));
            }
            if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "RAZORPAY_BASE_URL must be a valid URL".to_string(),
                ));
            }
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("PAYMENT_TIMEOUT_SECS".to_string()));
        }

        Ok(())
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let category_monthly_caps = [("lodging", 1000), ("festival_pass", 500), ("trip", 750)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        Self {
            coin_value: Decimal::ONE,
            per_transaction_cap: 500,
            monthly_cap: 2000,
            category_monthly_caps,
            grace_period_days: 7,
            issued_lot_expiry_days: 365,
            referral_reward_coins: 100,
            referral_hold_days: 7,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let category_monthly_caps = match env::var("COIN_CATEGORY_MONTHLY_CAPS") {
            Ok(raw) => parse_category_caps(&raw)?,
            Err(_) => defaults.category_monthly_caps,
        };

        Ok(LedgerConfig {
            coin_value: parse_var("COIN_VALUE", "1")?,
            per_transaction_cap: parse_var("COIN_PER_TRANSACTION_CAP", "500")?,
            monthly_cap: parse_var("COIN_MONTHLY_CAP", "2000")?,
            category_monthly_caps,
            grace_period_days: parse_var("COIN_GRACE_PERIOD_DAYS", "7")?,
            issued_lot_expiry_days: parse_var("COIN_LOT_EXPIRY_DAYS", "365")?,
            referral_reward_coins: parse_var("REFERRAL_REWARD_COINS", "100")?,
            referral_hold_days: parse_var("REFERRAL_HOLD_DAYS", "7")?,
        })
    }

    /// Monthly cap for a category; categories without an entry fall back to the global cap
    pub fn category_cap(&self, category: &str) -> i64 {
        self.category_monthly_caps
            .get(category)
            .copied()
            .unwrap_or(self.monthly_cap)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coin_value <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue("COIN_VALUE".to_string()));
        }
        if self.per_transaction_cap < 0 || self.monthly_cap < 0 {
            return Err(ConfigError::InvalidValue(
                "coin caps cannot be negative".to_string(),
            ));
        }
        if self.category_monthly_caps.values().any(|cap| *cap < 0) {
            return Err(ConfigError::InvalidValue(
                "COIN_CATEGORY_MONTHLY_CAPS".to_string(),
            ));
        }
        if self.grace_period_days <= 0 || self.issued_lot_expiry_days <= 0 {
            return Err(ConfigError::InvalidValue(
                "lot lifetimes must be positive".to_string(),
            ));
        }
        if self.referral_reward_coins < 0 || self.referral_hold_days < 0 {
            return Err(ConfigError::InvalidValue("REFERRAL_*".to_string()));
        }

        Ok(())
    }
}

/// `lodging:1000,festival_pass:500`
fn parse_category_caps(raw: &str) -> Result<HashMap<String, i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (category, cap) = part.split_once(':').ok_or_else(|| {
                ConfigError::InvalidValue("COIN_CATEGORY_MONTHLY_CAPS".to_string())
            })?;
            let cap = cap.trim().parse::<i64>().map_err(|_| {
                ConfigError::InvalidValue("COIN_CATEGORY_MONTHLY_CAPS".to_string())
            })?;
            Ok((category.trim().to_lowercase(), cap))
        })
        .collect()
}

/// `1000:49,5000:99,*:299`; `*` marks the open top band
fn parse_slabs(name: &str, raw: &str) -> Result<Vec<(Option<Decimal>, Decimal)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (upto, value) = part
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidValue(name.to_string()))?;
            let upto = match upto.trim() {
                "*" => None,
                bound => Some(
                    Decimal::from_str(bound)
                        .map_err(|_| ConfigError::InvalidValue(name.to_string()))?,
                ),
            };
            let value = Decimal::from_str(value.trim())
                .map_err(|_| ConfigError::InvalidValue(name.to_string()))?;
            Ok((upto, value))
        })
        .collect()
}

impl Default for PricingConfig {
    fn default() -> Self {
        let fee_slabs = vec![
            FeeSlab {
                upto: Some(Decimal::from(1000)),
                fee: Decimal::from(49),
            },
            FeeSlab {
                upto: Some(Decimal::from(5000)),
                fee: Decimal::from(99),
            },
            FeeSlab {
                upto: Some(Decimal::from(10000)),
                fee: Decimal::from(199),
            },
            FeeSlab {
                upto: None,
                fee: Decimal::from(299),
            },
        ];
        let gst_slabs = vec![
            GstSlab {
                upto: Some(Decimal::from(1000)),
                pct: Decimal::ZERO,
            },
            GstSlab {
                upto: Some(Decimal::from(7500)),
                pct: Decimal::from(12),
            },
            GstSlab {
                upto: None,
                pct: Decimal::from(18),
            },
        ];

        Self {
            fee_slabs,
            gst_slabs,
        }
    }
}

impl PricingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let fee_slabs = match env::var("SERVICE_FEE_SLABS") {
            Ok(raw) => parse_slabs("SERVICE_FEE_SLABS", &raw)?
                .into_iter()
                .map(|(upto, fee)| FeeSlab { upto, fee })
                .collect(),
            Err(_) => defaults.fee_slabs,
        };
        let gst_slabs = match env::var("GST_SLABS") {
            Ok(raw) => parse_slabs("GST_SLABS", &raw)?
                .into_iter()
                .map(|(upto, pct)| GstSlab { upto, pct })
                .collect(),
            Err(_) => defaults.gst_slabs,
        };

        Ok(PricingConfig {
            fee_slabs,
            gst_slabs,
        })
    }

    /// Slabs must be ascending, end in an open band, and never decrease
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fee_bands: Vec<_> = self.fee_slabs.iter().map(|s| (s.upto, s.fee)).collect();
        validate_bands("SERVICE_FEE_SLABS", &fee_bands)?;
        let gst_bands: Vec<_> = self.gst_slabs.iter().map(|s| (s.upto, s.pct)).collect();
        validate_bands("GST_SLABS", &gst_bands)?;

        if self
            .gst_slabs
            .iter()
            .any(|s| s.pct < Decimal::ZERO || s.pct > Decimal::ONE_HUNDRED)
        {
            return Err(ConfigError::ValidationFailed(
                "GST percentages must be within 0..=100".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_bands(name: &str, bands: &[(Option<Decimal>, Decimal)]) -> Result<(), ConfigError> {
    let Some((last_upto, _)) = bands.last() else {
        return Err(ConfigError::ValidationFailed(format!("{} is empty", name)));
    };
    if last_upto.is_some() {
        return Err(ConfigError::ValidationFailed(format!(
            "{} must end with an open band",
            name
        )));
    }

    for pair in bands.windows(2) {
        let (prev_upto, prev_value) = pair[0];
        let (next_upto, next_value) = pair[1];
        let Some(prev_upto) = prev_upto else {
            return Err(ConfigError::ValidationFailed(format!(
                "{} has an open band before the last one",
                name
            )));
        };
        if let Some(next_upto) = next_upto {
            if next_upto <= prev_upto {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} bounds must be ascending",
                    name
                )));
            }
        }
        if next_value < prev_value {
            return Err(ConfigError::ValidationFailed(format!(
                "{} values must not decrease",
                name
            )));
        }
    }

    if bands.iter().any(|(_, value)| *value < Decimal::ZERO) {
        return Err(ConfigError::ValidationFailed(format!(
            "{} values cannot be negative",
            name
        )));
    }

    Ok(())
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hold_ttl_secs: 15 * 60,
            hold_expiry_interval_secs: 120,
            issuance_interval_secs: 600,
            batch_size: 200,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(SchedulerConfig {
            hold_ttl_secs: parse_var("HOLD_TTL_SECS", "900")?,
            hold_expiry_interval_secs: parse_var("HOLD_EXPIRY_INTERVAL_SECS", "120")?,
            issuance_interval_secs: parse_var("ISSUANCE_INTERVAL_SECS", "600")?,
            batch_size: parse_var("SCHEDULER_BATCH_SIZE", "200")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hold_ttl_secs <= 0 {
            return Err(ConfigError::InvalidValue("HOLD_TTL_SECS".to_string()));
        }
        if self.hold_expiry_interval_secs == 0 || self.issuance_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler intervals must be positive".to_string(),
            ));
        }
        if self.batch_size <= 0 {
            return Err(ConfigError::InvalidValue("SCHEDULER_BATCH_SIZE".to_string()));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pricing_slabs_are_valid() {
        assert!(PricingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_decreasing_fee_slabs_rejected() {
        let config = PricingConfig {
            fee_slabs: vec![
                FeeSlab {
                    upto: Some(Decimal::from(1000)),
                    fee: Decimal::from(99),
                },
                FeeSlab {
                    upto: None,
                    fee: Decimal::from(49),
                },
            ],
            gst_slabs: PricingConfig::default().gst_slabs,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slab_parsing() {
        let bands = parse_slabs("SERVICE_FEE_SLABS", "1000:49, 5000:99, *:299").unwrap();
        assert_eq!(bands.len(), 3);
        assert_eq!(bands[0], (Some(Decimal::from(1000)), Decimal::from(49)));
        assert_eq!(bands[2], (None, Decimal::from(299)));
        assert!(parse_slabs("SERVICE_FEE_SLABS", "abc").is_err());
    }

    #[test]
    fn test_category_caps_fall_back_to_global() {
        let mut ledger = LedgerConfig::default();
        ledger.category_monthly_caps =
            parse_category_caps("lodging:300, Trip:50").unwrap();

        assert_eq!(ledger.category_cap("lodging"), 300);
        assert_eq!(ledger.category_cap("trip"), 50);
        assert_eq!(ledger.category_cap("festival_pass"), ledger.monthly_cap);
    }

    #[test]
    fn test_database_config_validation() {
        let config = DatabaseConfig {
            url: "postgres://localhost/services".to_string(),
            max_connections: 5,
            min_connections: 10,
            connection_timeout: 30,
            idle_timeout: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_razorpay_requires_credentials() {
        let config = GatewayConfig {
            kind: GatewayKind::Razorpay,
            base_url: "https://api.razorpay.com/v1".to_string(),
            key_id: String::new(),
            key_secret: "secret".to_string(),
            webhook_secret: "whsec".to_string(),
            currency: "INR".to_string(),
            timeout_secs: 15,
            max_retries: 2,
        };

        assert!(config.validate().is_err());
    }
}
