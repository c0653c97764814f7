//! Menu lookup collaborator interface and a static in-memory implementation.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::errors::{VoiceError, VoiceResult};

/// One item a tenant's menu offers.
#[derive(Debug, Clone, Deserialize)]
pub struct MenuItem {
    pub name: String,
    #[serde(default)]
    pub price_cents: Option<u64>,
}

/// Result of resolving a spoken item name against a tenant's menu.
#[derive(Debug, Clone)]
pub enum LookupResult {
    Found(MenuItem),
    NotFound { suggestion: Option<String> },
}

/// Read-only menu resolution, safe to call concurrently from any session.
pub trait MenuLookup: Send + Sync {
    fn lookup(&self, tenant_id: &str, query: &str) -> LookupResult;
}

/// In-memory menu keyed by tenant, loaded once at startup.
pub struct StaticMenu {
    tenants: HashMap<String, Vec<MenuItem>>,
}

impl StaticMenu {
    pub fn new(tenants: HashMap<String, Vec<MenuItem>>) -> Self {
        Self { tenants }
    }

    /// Load a `{tenant_id: [items]}` JSON file.
    pub fn from_file(path: &Path) -> VoiceResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VoiceError::SessionStart(format!("failed to read menu file {path:?}: {e}"))
        })?;
        let tenants: HashMap<String, Vec<MenuItem>> = serde_json::from_str(&raw)
            .map_err(|e| VoiceError::SessionStart(format!("invalid menu file {path:?}: {e}")))?;
        info!("Loaded menu for {} tenant(s) from {path:?}", tenants.len());
        Ok(Self { tenants })
    }

    /// Small built-in menu so the server is usable without a menu file.
    pub fn sample(tenant_id: &str) -> Self {
        let items = [
            "Soul Bowl",
            "Harvest Salad",
            "Smash Burger",
            "Citrus Cooler",
            "Sweet Potato Fries",
        ]
        .into_iter()
        .map(|name| MenuItem {
            name: name.to_string(),
            price_cents: None,
        })
        .collect();
        Self::new(HashMap::from([(tenant_id.to_string(), items)]))
    }
}

impl MenuLookup for StaticMenu {
    fn lookup(&self, tenant_id: &str, query: &str) -> LookupResult {
        let Some(items) = self.tenants.get(tenant_id) else {
            return LookupResult::NotFound { suggestion: None };
        };

        let wanted = query.trim().to_lowercase();
        if let Some(item) = items.iter().find(|i| i.name.to_lowercase() == wanted) {
            return LookupResult::Found(item.clone());
        }

        // Spoken input mangles names; offer the closest item within a small
        // edit distance as a correction hint
        let suggestion = items
            .iter()
            .map(|i| (edit_distance(&wanted, &i.name.to_lowercase()), &i.name))
            .filter(|(d, _)| *d <= 3)
            .min_by_key(|(d, _)| *d)
            .map(|(_, name)| name.clone());
        LookupResult::NotFound { suggestion }
    }
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
