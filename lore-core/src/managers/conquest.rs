//! The conquest ledger: one singleton entry listing every location taken.

use super::{append_to_entry, read_records, ManagerError};
use crate::config::LorebookConfig;
use crate::entry::{allocate_uid, Entry, EntryKind, EntryType, EntryUid};
use crate::record::{NarrativeRecord, Sender};
use crate::store::Lorebook;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Raw section tag of the ledger.
pub const CONQUEST_SECTION_TAG: &str = "ConquestRecords";

const LEDGER_NAME: &str = "Conquest Records";
const LEDGER_ORDER: i32 = 120;

/// Display label for a location type id.
pub fn location_type_label(location_type: &str) -> &'static str {
    match location_type {
        "village" => "Village",
        "town" => "Town",
        "city" => "City",
        "ruins" => "Ruins",
        "trade_caravan" => "Trade Caravan",
        "adventurer_party" => "Adventurer Party",
        "exile_outpost" => "Exile Outpost",
        "bandit_camp" => "Bandit Camp",
        "elven_forest" => "Elven Forest",
        "fox_colony" => "Fox Colony",
        "dark_spire" => "Dark Spire",
        "slave_camp" => "Slave Camp",
        "dark_fortress" => "Dark Fortress",
        "obsidian_mine" => "Obsidian Mine",
        "raid_dock" => "Raider Dock",
        "fox_water_town" => "Fox Water Town",
        "shrine" => "Shrine",
        "trading_port" => "Trading Port",
        "warship_dock" => "Warship Dock",
        "spice_plantation" => "Spice Plantation",
        "imperial_city" => "Imperial City",
        "noble_estate" => "Noble Estate",
        "mining_district" => "Mining District",
        "border_fortress" => "Border Fortress",
        "cathedral" => "Cathedral",
        "academy" => "Academy",
        "tree_city" => "Tree City",
        "elven_temple" => "Elven Temple",
        "guardian_outpost" => "Guardian Outpost",
        "canopy_palace" => "Canopy Palace",
        _ => "Unknown type",
    }
}

/// A notable figure captured with a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hero {
    pub name: String,
    pub title: String,
}

impl Hero {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
        }
    }
}

/// A location that has just been conquered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConqueredLocation {
    pub name: String,
    /// Type id, e.g. `village` or `border_fortress`.
    pub location_type: String,
    pub continent: String,
    pub region: String,
    /// What the region is like; recorded after the location details.
    #[serde(default)]
    pub region_description: Option<String>,
    pub race: String,
    /// Star rating.
    pub difficulty: u8,
    pub description: String,
    pub heroes: Vec<Hero>,
}

impl ConqueredLocation {
    pub fn new(name: impl Into<String>, location_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location_type: location_type.into(),
            continent: String::new(),
            region: String::new(),
            region_description: None,
            race: String::new(),
            difficulty: 1,
            description: String::new(),
            heroes: Vec::new(),
        }
    }

    pub fn in_region(mut self, continent: impl Into<String>, region: impl Into<String>) -> Self {
        self.continent = continent.into();
        self.region = region.into();
        self
    }

    pub fn with_region_description(mut self, description: impl Into<String>) -> Self {
        self.region_description = Some(description.into());
        self
    }

    pub fn with_race(mut self, race: impl Into<String>) -> Self {
        self.race = race.into();
        self
    }

    pub fn with_difficulty(mut self, difficulty: u8) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_hero(mut self, hero: Hero) -> Self {
        self.heroes.push(hero);
        self
    }

    /// The ledger record for this conquest.
    ///
    /// Sender is `continent/region`; content is
    /// `race-type-name-stars-description`, followed by `-Heroes: ...` when
    /// anyone notable was captured and `-Region: ...` when the region has a
    /// description.
    pub fn to_record(&self, game_time: impl Into<String>) -> NarrativeRecord {
        let or_unknown = |value: &str, fallback: &str| {
            if value.trim().is_empty() {
                fallback.to_string()
            } else {
                value.to_string()
            }
        };

        let sender = format!(
            "{}/{}",
            or_unknown(&self.continent, "Unknown continent"),
            or_unknown(&self.region, "Unknown region")
        );
        let mut content = format!(
            "{}-{}-{}-{}-{}",
            or_unknown(&self.race, "Unknown race"),
            location_type_label(&self.location_type),
            self.name,
            "★".repeat(usize::from(self.difficulty)),
            or_unknown(&self.description, "No description"),
        );
        if !self.heroes.is_empty() {
            let heroes = self
                .heroes
                .iter()
                .map(|h| format!("{}({})", h.name, h.title))
                .collect::<Vec<_>>()
                .join(", ");
            content.push_str(&format!("-Heroes: {heroes}"));
        }
        if let Some(region) = self
            .region_description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            content.push_str(&format!("-Region: {region}"));
        }

        NarrativeRecord::new(game_time, Sender::Named(sender), content)
    }
}

/// Manages the singleton `conquest_records` entry.
pub struct ConquestLedgerManager {
    lorebook: Arc<Lorebook>,
    config: LorebookConfig,
}

impl ConquestLedgerManager {
    pub fn new(lorebook: Arc<Lorebook>, config: LorebookConfig) -> Self {
        Self { lorebook, config }
    }

    /// Record a conquest in the ledger, creating the ledger on first use.
    pub async fn record_conquest(
        &self,
        location: &ConqueredLocation,
        game_time: &str,
    ) -> Result<EntryUid, ManagerError> {
        let record = location.to_record(game_time);
        let uid = append_to_entry(
            &self.lorebook,
            &self.config,
            CONQUEST_SECTION_TAG,
            std::slice::from_ref(&record),
            is_ledger,
            |existing| {
                let uid = allocate_uid(EntryType::ConquestRecords.uid_policy(), LEDGER_NAME, existing);
                Entry::new(uid, LEDGER_NAME, &EntryKind::ConquestRecords, "")
                    .with_keys([LEDGER_NAME])
                    .with_constant(true)
                    .with_order(LEDGER_ORDER)
            },
        )
        .await?;

        tracing::info!(location = %location.name, "recorded conquest");
        Ok(uid)
    }

    /// Every raw ledger record, oldest first.
    pub async fn records(&self) -> Result<Vec<NarrativeRecord>, ManagerError> {
        read_records(&self.lorebook, &self.config, CONQUEST_SECTION_TAG, is_ledger).await
    }
}

fn is_ledger(entry: &Entry) -> bool {
    entry.entry_type() == Some(EntryType::ConquestRecords)
}
