use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::query::DEFAULT_MAX_LIMIT;
use crate::schema::entity::parse_target;
use crate::schema::{EntityDef, FieldDef, FieldKind, SchemaRegistry};
use crate::session::{DEFAULT_SESSION_RETRIES, NO_REACHABLE_SERVERS};
use crate::store::sqlite::DEFAULT_BATCH_SIZE;

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on rows returned by one query
    pub max_limit: usize,
    /// Liveness-probe attempts before giving up on a session
    pub session_retries: u32,
    /// Rows pulled per round trip by batched cursors
    pub cursor_batch_size: usize,
    /// Error text that marks the whole backend as unreachable
    pub unreachable_markers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_limit: DEFAULT_MAX_LIMIT,
            session_retries: DEFAULT_SESSION_RETRIES,
            cursor_batch_size: DEFAULT_BATCH_SIZE,
            unreachable_markers: vec![NO_REACHABLE_SERVERS.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelmapConfig {
    pub database: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, rename = "entity")]
    pub entities: Vec<EntityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldConfig>,
}

/// One `[[entity.field]]` table.
///
/// `references` and `foreign` take `entity.field` targets; `link` names a
/// link group.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FieldConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub omit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign: Option<String>,
}

impl FieldConfig {
    fn to_def(&self) -> crate::Result<FieldDef> {
        let kind = match &self.kind {
            Some(kind) => kind.parse::<FieldKind>()?,
            None => FieldKind::Any,
        };
        let mut field = FieldDef::new(&self.name, kind);
        if let Some(tag) = &self.tag {
            field = field.tag(tag);
        }
        if self.omit {
            field = field.omit();
        }
        // Every annotation is carried over; registration rejects more than one.
        if let Some(target) = &self.references {
            let (entity, remote) = parse_target(target)?;
            field = field.references(entity, remote);
        }
        if let Some(group) = &self.link {
            field = field.link(group);
        }
        if let Some(target) = &self.foreign {
            let (entity, remote) = parse_target(target)?;
            field = field.foreign(entity, remote);
        }
        Ok(field)
    }
}

impl RelmapConfig {
    /// Register every configured entity and validate the result.
    pub fn build_registry(&self) -> anyhow::Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        for entity in &self.entities {
            let mut def = EntityDef::new(&entity.name);
            for field in &entity.fields {
                def = def.field(field.to_def()?);
            }
            registry.register(def)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("relmap.toml")
}

pub fn default_database_path() -> PathBuf {
    PathBuf::from(".relmap").join("relmap.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<RelmapConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: RelmapConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &RelmapConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
