//! GPC reference catalog and the required-row matrix per inventory type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::InventoryType;

const EMBEDDED_CATALOG: &str = include_str!("../gpc_reference.yaml");

#[derive(Debug, Error)]
pub enum GpcError {
    #[error("parsing GPC catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid GPC catalog: {0}")]
    Invalid(String),
}

/// Deterministic id for a GPC sector, subsector or subcategory reference number.
pub fn gpc_id(ref_no: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("gpc:{ref_no}").as_bytes())
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[allow(dead_code)]
    version: u32,
    inventory_types: Vec<InventoryTypeRule>,
    sectors: Vec<SectorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct InventoryTypeRule {
    inventory_type: InventoryType,
    sectors: Vec<String>,
    #[serde(default)]
    scope_filter: Option<BTreeMap<String, Vec<u8>>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SectorEntry {
    ref_no: String,
    name: String,
    subsectors: Vec<SubsectorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubsectorEntry {
    ref_no: String,
    name: String,
    #[serde(default)]
    scope: Option<u8>,
    #[serde(default)]
    subcategories: Vec<SubcategoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubcategoryEntry {
    ref_no: String,
    name: String,
    scope: u8,
}

/// One row an inventory of a given type is expected to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredGpcRow {
    pub gpc_ref_no: String,
    pub sector_id: Uuid,
    pub sector_ref_no: String,
    pub sector_name: String,
    pub subsector_id: Uuid,
    pub subsector_ref_no: String,
    pub subsector_name: String,
    pub subcategory_id: Option<Uuid>,
    pub subcategory_ref_no: Option<String>,
    pub subcategory_name: Option<String>,
    pub scope: u8,
}

#[derive(Debug, Clone)]
pub struct GpcCatalog {
    rules: Vec<InventoryTypeRule>,
    sectors: Vec<SectorEntry>,
}

impl GpcCatalog {
    pub fn embedded() -> Result<Self, GpcError> {
        Self::from_yaml(EMBEDDED_CATALOG)
    }

    pub fn from_yaml(text: &str) -> Result<Self, GpcError> {
        let file: CatalogFile = serde_yaml::from_str(text)?;
        for sector in &file.sectors {
            for subsector in &sector.subsectors {
                if subsector.subcategories.is_empty() && subsector.scope.is_none() {
                    return Err(GpcError::Invalid(format!(
                        "subsector {} has neither subcategories nor a scope",
                        subsector.ref_no
                    )));
                }
            }
        }
        for rule in &file.inventory_types {
            if let Some(unknown) = rule
                .sectors
                .iter()
                .find(|s| !file.sectors.iter().any(|sector| &sector.ref_no == *s))
            {
                return Err(GpcError::Invalid(format!(
                    "inventory type {} references unknown sector {unknown}",
                    rule.inventory_type
                )));
            }
        }
        Ok(Self {
            rules: file.inventory_types,
            sectors: file.sectors,
        })
    }

    /// Rows required for `inventory_type`, in catalog order.
    ///
    /// Sectors with subcategories yield one row per subcategory (subject to the
    /// type's scope filter); sectors without them yield subsector-level rows.
    pub fn required_rows(&self, inventory_type: InventoryType) -> Vec<RequiredGpcRow> {
        let Some(rule) = self.rules.iter().find(|r| r.inventory_type == inventory_type) else {
            return Vec::new();
        };

        let mut rows = Vec::new();
        for sector in self
            .sectors
            .iter()
            .filter(|s| rule.sectors.contains(&s.ref_no))
        {
            let allowed_scopes = rule
                .scope_filter
                .as_ref()
                .and_then(|filter| filter.get(&sector.ref_no));
            for subsector in &sector.subsectors {
                if subsector.subcategories.is_empty() {
                    let scope = subsector.scope.unwrap_or(1);
                    if allowed_scopes.is_some_and(|scopes| !scopes.contains(&scope)) {
                        continue;
                    }
                    rows.push(subsector_row(sector, subsector, scope));
                    continue;
                }
                for subcategory in &subsector.subcategories {
                    if allowed_scopes.is_some_and(|scopes| !scopes.contains(&subcategory.scope)) {
                        continue;
                    }
                    let mut row = subsector_row(sector, subsector, subcategory.scope);
                    row.gpc_ref_no = subcategory.ref_no.clone();
                    row.subcategory_id = Some(gpc_id(&subcategory.ref_no));
                    row.subcategory_ref_no = Some(subcategory.ref_no.clone());
                    row.subcategory_name = Some(subcategory.name.clone());
                    rows.push(row);
                }
            }
        }
        rows
    }

    /// Catalog entry for any subcategory or leaf subsector reference number.
    pub fn lookup(&self, gpc_ref_no: &str) -> Option<RequiredGpcRow> {
        for sector in &self.sectors {
            for subsector in &sector.subsectors {
                if subsector.subcategories.is_empty() && subsector.ref_no == gpc_ref_no {
                    return Some(subsector_row(sector, subsector, subsector.scope.unwrap_or(1)));
                }
                if let Some(subcategory) = subsector
                    .subcategories
                    .iter()
                    .find(|c| c.ref_no == gpc_ref_no)
                {
                    let mut row = subsector_row(sector, subsector, subcategory.scope);
                    row.gpc_ref_no = subcategory.ref_no.clone();
                    row.subcategory_id = Some(gpc_id(&subcategory.ref_no));
                    row.subcategory_ref_no = Some(subcategory.ref_no.clone());
                    row.subcategory_name = Some(subcategory.name.clone());
                    return Some(row);
                }
            }
        }
        None
    }
}

fn subsector_row(sector: &SectorEntry, subsector: &SubsectorEntry, scope: u8) -> RequiredGpcRow {
    RequiredGpcRow {
        gpc_ref_no: subsector.ref_no.clone(),
        sector_id: gpc_id(&sector.ref_no),
        sector_ref_no: sector.ref_no.clone(),
        sector_name: sector.name.clone(),
        subsector_id: gpc_id(&subsector.ref_no),
        subsector_ref_no: subsector.ref_no.clone(),
        subsector_name: subsector.name.clone(),
        subcategory_id: None,
        subcategory_ref_no: None,
        subcategory_name: None,
        scope,
    }
}

/// Sector roman numeral of a reference number (`"III.1.2"` -> `"III"`).
pub fn sector_of(gpc_ref_no: &str) -> &str {
    gpc_ref_no.split('.').next().unwrap_or(gpc_ref_no)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> GpcCatalog {
        GpcCatalog::embedded().expect("embedded catalog parses")
    }

    #[test]
    fn basic_inventories_never_require_sectors_iv_or_v() {
        let rows = catalog().required_rows(InventoryType::GpcBasic);
        assert!(!rows.is_empty());
        assert!(rows
            .iter()
            .all(|r| matches!(r.sector_ref_no.as_str(), "I" | "II" | "III")));
    }

    #[test]
    fn basic_inventories_apply_the_scope_allow_list() {
        let rows = catalog().required_rows(InventoryType::GpcBasic);
        for row in &rows {
            let allowed: &[u8] = match row.sector_ref_no.as_str() {
                "I" | "II" => &[1, 2],
                "III" => &[1, 3],
                other => panic!("unexpected sector {other}"),
            };
            assert!(allowed.contains(&row.scope), "{} scope {}", row.gpc_ref_no, row.scope);
        }
        assert!(rows.iter().any(|r| r.gpc_ref_no == "III.1.2"));
        assert!(!rows.iter().any(|r| r.gpc_ref_no == "I.1.3"));
        assert!(!rows.iter().any(|r| r.gpc_ref_no == "II.1.3"));
    }

    #[test]
    fn basic_plus_covers_all_sectors_with_subsector_rows_for_iv_and_v() {
        let rows = catalog().required_rows(InventoryType::GpcBasicPlus);
        for sector in ["I", "II", "III", "IV", "V"] {
            assert!(rows.iter().any(|r| r.sector_ref_no == sector), "missing sector {sector}");
        }
        for row in &rows {
            let is_subsector_level = row.subcategory_id.is_none();
            let in_iv_or_v = matches!(row.sector_ref_no.as_str(), "IV" | "V");
            assert_eq!(is_subsector_level, in_iv_or_v, "{}", row.gpc_ref_no);
        }
        assert!(rows.iter().any(|r| r.gpc_ref_no == "I.1.3"));
        assert!(rows.iter().any(|r| r.gpc_ref_no == "V.3"));
    }

    #[test]
    fn ids_are_stable_and_distinct_per_level() {
        let row = catalog().lookup("I.2.1").unwrap();
        assert_eq!(row.sector_id, gpc_id("I"));
        assert_eq!(row.subsector_id, gpc_id("I.2"));
        assert_eq!(row.subcategory_id, Some(gpc_id("I.2.1")));
        assert_ne!(gpc_id("I"), gpc_id("II"));
        assert!(catalog().lookup("IX.1").is_none());
    }

    #[test]
    fn rejects_catalog_with_unknown_sector_in_rule() {
        let yaml = r#"
version: 1
inventory_types:
  - inventory_type: gpc_basic
    sectors: [VI]
sectors: []
"#;
        assert!(matches!(GpcCatalog::from_yaml(yaml), Err(GpcError::Invalid(_))));
    }

    #[test]
    fn sector_of_takes_leading_numeral() {
        assert_eq!(sector_of("III.1.2"), "III");
        assert_eq!(sector_of("IV"), "IV");
    }
}
