use serde::{Deserialize, Serialize};

use crate::model::RestrictedSurface;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub surface: SurfaceConfig,
    pub logging: LoggingConfig,
}

/// Fields and relation targets that update documents may never write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceConfig {
    pub restricted_properties: Vec<String>,
    pub restricted_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `env_logger` filter, used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        let surface = RestrictedSurface::default();
        Self {
            restricted_properties: surface.properties,
            restricted_types: surface.target_types,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional `config` file and
    /// `ENTITY_PATCH_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        config = config.add_source(config::File::with_name("config").required(false));

        // e.g. ENTITY_PATCH_SURFACE__RESTRICTED_TYPES=Group,User,Team
        config = config.add_source(
            config::Environment::with_prefix("ENTITY_PATCH")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("surface.restricted_properties")
                .with_list_parse_key("surface.restricted_types")
                .try_parsing(true),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }

    pub fn restricted_surface(&self) -> RestrictedSurface {
        RestrictedSurface::new(
            self.surface.restricted_properties.clone(),
            self.surface.restricted_types.clone(),
        )
    }
}
