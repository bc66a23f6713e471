//! Triple-redundant recipe storage: three independently written JSON
//! files, each envelope-checksummed, loaded in a fixed primary/backup
//! order rather than by majority vote, and self-repaired whenever a
//! non-primary copy is the one that actually loads.

use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const COPY_NAMES: [&str; 3] = ["recipes_primary.json", "recipes_backup1.json", "recipes_backup2.json"];
/// Name of the single key-value entry a legacy build stored its recipe set
/// under, read once as a migration path if all three JSON copies are gone
/// or unreadable.
const LEGACY_FILE_NAME: &str = "recipes_legacy.json";
/// Ingredient percentages must sum to 100 within this tolerance.
const MIX_TOLERANCE: f32 = 0.1;

/// One ingredient's share of a recipe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Ingredient {
    #[serde(rename = "tankUid")]
    pub tank_uid: u64,
    pub percentage: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    pub uid: u32,
    pub name: String,
    #[serde(rename = "dailyWeight")]
    pub daily_weight_g: f32,
    pub servings: u16,
    /// Unix timestamp, seconds, set once at creation.
    pub created: i64,
    /// Unix timestamp, seconds, updated on every successful feed from this
    /// recipe.
    #[serde(rename = "lastUsed")]
    pub last_used: i64,
    #[serde(rename = "isEnabled")]
    pub enabled: bool,
    pub ingredients: Vec<Ingredient>,
}

impl Recipe {
    /// A recipe's ingredient percentages must sum to 100 within tolerance;
    /// anything else is rejected rather than silently normalised, since a
    /// silently-renormalised recipe would dispense a different mix than
    /// whatever was actually configured.
    pub fn validate(&self) -> Result<(), Error> {
        if self.servings == 0 {
            return Err(Error::RecipeInvalidMix(0.0));
        }
        let total: f32 = self.ingredients.iter().map(|i| i.percentage).sum();
        if (total - 100.0).abs() > MIX_TOLERANCE {
            return Err(Error::RecipeInvalidMix(total));
        }
        Ok(())
    }
}

/// Next auto-incrementing UID for a new recipe: one past the highest UID
/// currently in `existing`.
pub fn next_uid(existing: &[Recipe]) -> u32 {
    existing.iter().map(|r| r.uid).max().unwrap_or(0) + 1
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    crc32: u32,
    recipes: Vec<Recipe>,
}

pub struct RecipeStore {
    dir: PathBuf,
}

impl RecipeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RecipeStore { dir: dir.into() }
    }

    fn copy_path(&self, index: usize) -> PathBuf {
        self.dir.join(COPY_NAMES[index])
    }

    fn legacy_path(&self) -> PathBuf {
        self.dir.join(LEGACY_FILE_NAME)
    }

    /// Parses and checksum-verifies one copy. `None` covers every way a
    /// copy can fail to be trusted: missing, malformed JSON, or a CRC that
    /// no longer matches the recomputed value over its recipes array.
    fn read_copy(path: &Path) -> Option<Vec<Recipe>> {
        let bytes = std::fs::read(path).ok()?;
        let envelope: Envelope = serde_json::from_slice(&bytes).ok()?;
        let body = serde_json::to_vec(&envelope.recipes).ok()?;
        if CRC.checksum(&body) != envelope.crc32 {
            return None;
        }
        Some(envelope.recipes)
    }

    fn write_copy(path: &Path, recipes: &[Recipe]) -> Result<(), Error> {
        let body = serde_json::to_vec(recipes)?;
        let envelope = Envelope { crc32: CRC.checksum(&body), recipes: recipes.to_vec() };
        std::fs::write(path, serde_json::to_vec_pretty(&envelope)?)?;
        Ok(())
    }

    /// Loads the recipe set, trying `primary -> backup1 -> backup2` in
    /// that fixed order and accepting the first copy that parses and
    /// checksum-verifies. A non-primary success triggers a repair pass
    /// that rewrites all three copies from the winner. If all three fail,
    /// falls back to a one-time legacy migration; only if that also fails
    /// does this report no quorum.
    pub fn load(&self) -> Result<Vec<Recipe>, Error> {
        for (i, name) in COPY_NAMES.iter().enumerate() {
            let Some(recipes) = Self::read_copy(&self.copy_path(i)) else {
                warn!("recipe copy {name} missing or failed CRC verification, trying next");
                continue;
            };
            if i > 0 {
                warn!("recipe store recovered from {name}, repairing all three copies");
                for j in 0..3 {
                    if let Err(e) = Self::write_copy(&self.copy_path(j), &recipes) {
                        warn!("repair write of {} failed: {e}", COPY_NAMES[j]);
                    }
                }
            }
            return Ok(recipes);
        }

        self.migrate_legacy()
    }

    /// Documented simplification: this crate has no non-volatile
    /// key-value store of its own, so "the legacy area" is a single flat
    /// JSON file (no envelope, no CRC) at a fixed path. If it is present
    /// and parses, its contents are adopted, the three copies are
    /// (re)written from it, and the legacy file is removed.
    fn migrate_legacy(&self) -> Result<Vec<Recipe>, Error> {
        let legacy = self.legacy_path();
        let bytes = std::fs::read(&legacy).map_err(|_| Error::RecipeNoQuorum(0))?;
        let recipes: Vec<Recipe> = serde_json::from_slice(&bytes).map_err(|_| Error::RecipeNoQuorum(0))?;
        warn!("recovered recipes from legacy store, migrating to triple-redundant copies");
        self.save(&recipes)?;
        let _ = std::fs::remove_file(&legacy);
        Ok(recipes)
    }

    /// Validates every recipe, then writes all three copies independently.
    /// Reports success if at least one write succeeded.
    pub fn save(&self, recipes: &[Recipe]) -> Result<(), Error> {
        for recipe in recipes {
            recipe.validate()?;
        }
        std::fs::create_dir_all(&self.dir)?;

        let mut last_err = None;
        let mut successes = 0;
        for i in 0..3 {
            match Self::write_copy(&self.copy_path(i), recipes) {
                Ok(()) => successes += 1,
                Err(e) => {
                    warn!("failed to write {}: {e}", COPY_NAMES[i]);
                    last_err = Some(e);
                }
            }
        }
        if successes == 0 {
            return Err(last_err.unwrap_or(Error::RecipeNoQuorum(0)));
        }
        Ok(())
    }
}
