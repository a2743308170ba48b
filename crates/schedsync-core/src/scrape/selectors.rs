//! CSS selectors for the schedule page. Overridable from config.

use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::domain::ScrapeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    /// Present once the schedule has rendered (even with zero slots).
    pub container: String,
    pub slot: String,
    /// Text like `10:00` or `10:00 - 10:45`.
    pub time: String,
    pub program: String,
    pub instructor: String,
    pub status: String,
    /// Slot attribute carrying the coarse availability flag.
    pub available_attr: String,
    /// Slot class marking a full lesson when the attribute is absent.
    pub full_class: String,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            container: ".schedule".to_string(),
            slot: ".lesson".to_string(),
            time: ".time".to_string(),
            program: ".program".to_string(),
            instructor: ".instructor".to_string(),
            status: ".status".to_string(),
            available_attr: "data-available".to_string(),
            full_class: "full".to_string(),
        }
    }
}

impl SelectorSet {
    pub(crate) fn compile(&self) -> Result<CompiledSelectors, ScrapeError> {
        Ok(CompiledSelectors {
            container: parse("container", &self.container)?,
            slot: parse("slot", &self.slot)?,
            time: parse("time", &self.time)?,
            program: parse("program", &self.program)?,
            instructor: parse("instructor", &self.instructor)?,
            status: parse("status", &self.status)?,
            available_attr: self.available_attr.clone(),
            full_class: self.full_class.clone(),
        })
    }
}

fn parse(field: &str, raw: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(raw)
        .map_err(|e| ScrapeError::Structure(format!("invalid {field} selector '{raw}': {e}")))
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledSelectors {
    pub container: Selector,
    pub slot: Selector,
    pub time: Selector,
    pub program: Selector,
    pub instructor: Selector,
    pub status: Selector,
    pub available_attr: String,
    pub full_class: String,
}
