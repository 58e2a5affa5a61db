use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub queue: QueueSettings,
}

/// Tunables for the consultation queue engine.
///
/// The waiting-room window around an appointment start is
/// `[start - lead, start + grace]`; walk-in and emergency entries expire
/// `max_wait_minutes` after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub appointment_lead_minutes: i64,
    pub appointment_grace_minutes: i64,
    pub max_wait_minutes: i64,
    pub payment_window_minutes: i64,
    pub emergency_max_fanout: usize,
    pub emergency_daily_limit: u32,
    pub emergency_monthly_limit: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            appointment_lead_minutes: 15,
            appointment_grace_minutes: 15,
            max_wait_minutes: 30,
            payment_window_minutes: 30,
            emergency_max_fanout: 5,
            emergency_daily_limit: 3,
            emergency_monthly_limit: 10,
        }
    }
}

impl QueueSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            appointment_lead_minutes: env_i64(
                "QUEUE_APPOINTMENT_LEAD_MINUTES",
                defaults.appointment_lead_minutes,
            ),
            appointment_grace_minutes: env_i64(
                "QUEUE_APPOINTMENT_GRACE_MINUTES",
                defaults.appointment_grace_minutes,
            ),
            max_wait_minutes: env_i64("QUEUE_MAX_WAIT_MINUTES", defaults.max_wait_minutes),
            payment_window_minutes: env_i64(
                "QUEUE_PAYMENT_WINDOW_MINUTES",
                defaults.payment_window_minutes,
            ),
            emergency_max_fanout: env_i64(
                "EMERGENCY_MAX_FANOUT",
                defaults.emergency_max_fanout as i64,
            ) as usize,
            emergency_daily_limit: env_i64(
                "EMERGENCY_DAILY_LIMIT",
                defaults.emergency_daily_limit as i64,
            ) as u32,
            emergency_monthly_limit: env_i64(
                "EMERGENCY_MONTHLY_LIMIT",
                defaults.emergency_monthly_limit as i64,
            ) as u32,
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(raw) => match raw.parse::<i64>() {
            Ok(value) if value > 0 => value,
            _ => {
                warn!("{} is not a positive integer, using default {}", key, default);
                default
            }
        },
        Err(_) => default,
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL").unwrap_or_else(|_| {
                warn!("SUPABASE_URL not set, using empty value");
                String::new()
            }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY").unwrap_or_else(|_| {
                warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                String::new()
            }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET").unwrap_or_else(|_| {
                warn!("SUPABASE_JWT_SECRET not set, using empty value");
                String::new()
            }),
            redis_url: env::var("REDIS_URL").ok(),
            queue: QueueSettings::from_env(),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }
}
