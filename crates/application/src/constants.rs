/// Persistence key for the child profile record.
pub const CHILD_PROFILE_KEY: &str = "child_profile";

/// Persistence key for the conversation history.
pub const CONVERSATIONS_KEY: &str = "conversations";

/// Persistence key for the inference parameter record.
pub const PARAMS_KEY: &str = "params";

/// Persistence key for user-added catalog entries.
pub const CUSTOM_MODELS_KEY: &str = "custom_models";

/// Overrides the data directory when set.
pub const DATA_DIR_ENV: &str = "NDIS_ASSIST_DATA_DIR";

/// Directory name under the platform data directory.
pub const APP_DIR_NAME: &str = "ndis-assist";
