// Callback feature configuration

use crate::{
    log::Logger,
    log_error, log_warning,
    utils::{get_env_string, get_env_u32},
};

/// Callback configuration
#[derive(Clone)]
pub struct CallbackConfiguration {
    /// Callback URL
    pub callback_url: String,

    /// JWT secret
    pub jwt_secret: String,

    /// Custom JWT subject
    pub jwt_custom_subject: String,

    /// Seconds between two update events
    pub update_interval_seconds: u32,
}

impl Default for CallbackConfiguration {
    fn default() -> Self {
        CallbackConfiguration {
            callback_url: "".to_string(),
            jwt_secret: "".to_string(),
            jwt_custom_subject: "".to_string(),
            update_interval_seconds: 10,
        }
    }
}

impl CallbackConfiguration {
    /// Loads callback feature configuration
    /// from environment variables
    pub fn load_from_env(logger: &Logger) -> Result<CallbackConfiguration, ()> {
        let callback_url = get_env_string("CALLBACK_URL", "");

        if !callback_url.is_empty() && url::Url::parse(&callback_url).is_err() {
            log_error!(logger, format!("CALLBACK_URL is not a valid URL: {}", callback_url));
            return Err(());
        }

        let jwt_secret = get_env_string("JWT_SECRET", "");

        if !callback_url.is_empty() && jwt_secret.is_empty() {
            log_warning!(
                logger,
                "JWT_SECRET is empty. \
                 Make sure to set a secure JWT secret to prevent security issues."
            );
        }

        let jwt_custom_subject = get_env_string("CUSTOM_JWT_SUBJECT", "");

        let update_interval_seconds = get_env_u32("CALLBACK_UPDATE_INTERVAL_SEC", 10);

        if update_interval_seconds == 0 {
            log_error!(logger, "CALLBACK_UPDATE_INTERVAL_SEC must be greater than 0");
            return Err(());
        }

        Ok(CallbackConfiguration {
            callback_url,
            jwt_secret,
            jwt_custom_subject,
            update_interval_seconds,
        })
    }

    /// True if events are posted anywhere
    pub fn is_enabled(&self) -> bool {
        !self.callback_url.is_empty()
    }

    /// Get JWT subject
    pub fn get_jwt_subject(&self) -> &str {
        if self.jwt_custom_subject.is_empty() {
            "stream_event"
        } else {
            &self.jwt_custom_subject
        }
    }
}
