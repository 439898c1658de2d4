//! Titan silo daemon
//!
//! Boots one worker node: loads configuration, initializes tracing,
//! registers the deployment's registry grains, seeds the static catalogs,
//! and serves until SIGTERM.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use titan_runtime::prelude::*;
use titan_runtime::registry::{RegistryEntry, RegistryGrain, RegistryReaderGrain, RegistrySeedTask};
use titan_runtime::runtime::startup::{resolve_seed_document, SeedOrigin};

/// Item catalog shipped with the binary, used when no seed file is
/// configured
const EMBEDDED_ITEM_SEED: &str = include_str!("../resources/item_definitions.json");

const ITEM_REGISTRY: &str = "item-definitions";
const ITEM_READER: &str = "item-definitions-reader";
const MODIFIER_REGISTRY: &str = "modifier-pool";
const MODIFIER_READER: &str = "modifier-pool-reader";

/// One item definition; both the persisted catalog record and the seed
/// JSON shape. Seed files may omit any field.
#[derive(Clone, PartialEq, ::prost::Message, Deserialize)]
#[serde(default)]
struct ItemDefinition {
    #[prost(string, tag = "1")]
    key: String,
    #[prost(string, tag = "2")]
    name: String,
    #[prost(string, tag = "3")]
    slot: String,
    #[prost(uint32, tag = "4")]
    tier: u32,
    #[prost(map = "string, string", tag = "5")]
    metadata: HashMap<String, String>,
}

fn load_item_seed(config: &Config) -> anyhow::Result<Vec<RegistryEntry>> {
    let definitions: Vec<ItemDefinition> =
        match resolve_seed_document(&config.seed, Some(EMBEDDED_ITEM_SEED))
            .context("resolving item seed document")?
        {
            Some((origin, text)) => {
                let definitions: Vec<ItemDefinition> =
                    serde_json::from_str(&text).context("parsing item seed document")?;
                info!(origin = %origin, count = definitions.len(), "item seed loaded");
                if origin == SeedOrigin::File {
                    debug!("seed file overrode the embedded catalog");
                }
                definitions
            }
            None => {
                warn!("no item seed available, using hard-coded fallback");
                vec![ItemDefinition {
                    key: "short-sword".into(),
                    name: "Short Sword".into(),
                    slot: "main-hand".into(),
                    tier: 1,
                    metadata: HashMap::new(),
                }]
            }
        };

    Ok(definitions
        .into_iter()
        .filter(|d| !d.key.is_empty())
        .map(|d| RegistryEntry::typed(d.key.clone(), &d))
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;

    let item_seed = load_item_seed(&config)?;
    let force_reseed = config.seed.force_reseed;

    let silo = SiloBuilder::new(config)
        .register(RegistryGrain::registration(ITEM_REGISTRY))
        .register(RegistryReaderGrain::registration(
            ITEM_READER,
            ITEM_REGISTRY,
            Duration::from_secs(60),
            4,
        ))
        .register(RegistryGrain::registration(MODIFIER_REGISTRY))
        .register(RegistryReaderGrain::registration(
            MODIFIER_READER,
            MODIFIER_REGISTRY,
            Duration::from_secs(60),
            4,
        ))
        .with_startup_task(RegistrySeedTask::new(ITEM_REGISTRY, item_seed, force_reseed))
        .start()
        .await
        .context("starting silo")?;

    silo.run().await.context("serving")?;
    Ok(())
}
