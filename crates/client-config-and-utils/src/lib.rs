//! Configuration, filesystem paths, and logging setup for the Naars Cars
//! client delivery layer.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    compile_time_supabase_url, Config, DeliveryConfig, RealtimeConfig, DEFAULT_LOG_LEVEL,
    DEFAULT_PROTECTED_PREFIXES,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_for_service, parse_level};
pub use paths::Paths;
