use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::Result;
use crate::ledger::ContractLedger;
use crate::state::Repository;
use crate::types::{Advertiser, AdvertiserContract, ConditionRule, Location, VenueContract};

/// Startup data: everything the dashboard would normally have created.
#[derive(Debug, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub advertisers: Vec<Advertiser>,
    #[serde(default)]
    pub rules: Vec<ConditionRule>,
    #[serde(default)]
    pub advertiser_contracts: Vec<AdvertiserContract>,
    #[serde(default)]
    pub venue_contracts: Vec<VenueContract>,
    #[serde(default)]
    pub locations: Vec<Location>,
}

impl Catalog {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load into the repository and ledger, preserving file order.
    pub async fn install(self, repo: &dyn Repository, ledger: &ContractLedger) -> Result<()> {
        let (advertisers, rules, contracts, venues, locations) = (
            self.advertisers.len(),
            self.rules.len(),
            self.advertiser_contracts.len(),
            self.venue_contracts.len(),
            self.locations.len(),
        );

        for advertiser in self.advertisers {
            repo.upsert_advertiser(advertiser).await?;
        }
        for rule in self.rules {
            repo.upsert_rule(rule).await?;
        }
        for location in self.locations {
            repo.create_location(location).await?;
        }
        for contract in self.advertiser_contracts {
            ledger.insert_advertiser_contract(contract);
        }
        for contract in self.venue_contracts {
            ledger.insert_venue_contract(contract);
        }

        info!(
            advertisers,
            rules,
            contracts,
            venues,
            locations,
            "Catalog installed: {advertisers} advertisers, {rules} rules, {contracts} advertiser contracts, {venues} venue contracts, {locations} locations",
        );
        Ok(())
    }
}
