//! Conversions from the persisted config into component configs.

use client_config_and_utils::{DeliveryConfig, RealtimeConfig};
use outbound_send_worker::{BackoffPolicy, SendWorkerConfig};
use realtime_subscription_multiplexer::MultiplexerConfig;
use std::time::Duration;

pub fn send_worker_config(delivery: &DeliveryConfig) -> SendWorkerConfig {
    SendWorkerConfig {
        backoff: BackoffPolicy {
            max_attempts: delivery.max_attempts,
            initial_delay: Duration::from_millis(delivery.initial_backoff_ms),
            max_delay: Duration::from_millis(delivery.max_backoff_ms),
        },
        ..SendWorkerConfig::default()
    }
}

pub fn multiplexer_config(realtime: &RealtimeConfig) -> MultiplexerConfig {
    MultiplexerConfig {
        max_concurrent_subscriptions: realtime.max_concurrent_subscriptions,
        background_grace_period: Duration::from_secs(realtime.background_grace_period_secs),
        protected_prefixes: realtime.protected_prefixes.clone(),
        ..MultiplexerConfig::default()
    }
}

pub fn request_timeout(delivery: &DeliveryConfig) -> Duration {
    Duration::from_secs(delivery.request_timeout_secs)
}
