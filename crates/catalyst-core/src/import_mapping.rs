//! Reconciliation of extracted eCRF spreadsheet rows against required GPC rows.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gpc::RequiredGpcRow;
use crate::InventoryType;

/// A row the spreadsheet parser extracted from an uploaded eCRF file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRow {
    pub row_index: usize,
    pub gpc_ref_no: String,
    #[serde(default)]
    pub sector_id: Option<Uuid>,
    #[serde(default)]
    pub subsector_id: Option<Uuid>,
    #[serde(default)]
    pub subcategory_id: Option<Uuid>,
    #[serde(default)]
    pub total_co2e: Option<f64>,
    #[serde(default)]
    pub notation_key: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Mapped,
    Unmapped,
    MissingFromEcrf,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRow {
    pub gpc_ref_no: String,
    pub status: MappingStatus,
    pub required: Option<RequiredGpcRow>,
    pub extracted: Option<ExtractedRow>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSummary {
    pub mapped: usize,
    pub unmapped: usize,
    pub missing_from_ecrf: usize,
    pub error: usize,
}

impl MappingSummary {
    fn count(&mut self, status: MappingStatus) {
        match status {
            MappingStatus::Mapped => self.mapped += 1,
            MappingStatus::Unmapped => self.unmapped += 1,
            MappingStatus::MissingFromEcrf => self.missing_from_ecrf += 1,
            MappingStatus::Error => self.error += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMapping {
    pub inventory_type: InventoryType,
    pub rows: Vec<MappingRow>,
    pub summary: MappingSummary,
}

/// Full outer join of `required` and `extracted` on the GPC reference number.
///
/// Required rows come first in catalog order, followed by extracted rows whose
/// reference number is not required, in file order.
pub fn reconcile(
    inventory_type: InventoryType,
    required: &[RequiredGpcRow],
    extracted: &[ExtractedRow],
) -> ImportMapping {
    let mut by_ref_no: HashMap<&str, Vec<&ExtractedRow>> = HashMap::new();
    for row in extracted {
        by_ref_no.entry(row.gpc_ref_no.trim()).or_default().push(row);
    }

    let mut rows = Vec::with_capacity(required.len().max(extracted.len()));
    let mut required_ref_nos = HashSet::with_capacity(required.len());

    for req in required {
        required_ref_nos.insert(req.gpc_ref_no.as_str());
        match by_ref_no.get(req.gpc_ref_no.as_str()) {
            None => rows.push(MappingRow {
                gpc_ref_no: req.gpc_ref_no.clone(),
                status: MappingStatus::MissingFromEcrf,
                required: Some(req.clone()),
                extracted: None,
                messages: vec![format!(
                    "{} is required for {} inventories but is missing from the file",
                    req.gpc_ref_no, inventory_type
                )],
            }),
            Some(found) => {
                for row in found {
                    rows.push(classify_pair(req, row));
                }
            }
        }
    }

    for row in extracted {
        let ref_no = row.gpc_ref_no.trim();
        if required_ref_nos.contains(ref_no) {
            continue;
        }
        let (status, mut messages) = if row.errors.is_empty() {
            (MappingStatus::Unmapped, Vec::new())
        } else {
            (MappingStatus::Error, row.errors.clone())
        };
        messages.push(format!(
            "{ref_no} is not a required row for {inventory_type} inventories"
        ));
        rows.push(MappingRow {
            gpc_ref_no: ref_no.to_string(),
            status,
            required: None,
            extracted: Some(row.clone()),
            messages,
        });
    }

    let mut summary = MappingSummary::default();
    for row in &rows {
        summary.count(row.status);
    }

    ImportMapping {
        inventory_type,
        rows,
        summary,
    }
}

fn classify_pair(required: &RequiredGpcRow, row: &ExtractedRow) -> MappingRow {
    let (status, messages) = if !row.errors.is_empty() {
        (MappingStatus::Error, row.errors.clone())
    } else {
        let mismatches = id_mismatches(required, row);
        if !mismatches.is_empty() {
            (MappingStatus::Unmapped, mismatches)
        } else if !row.warnings.is_empty() {
            (MappingStatus::Unmapped, row.warnings.clone())
        } else {
            (MappingStatus::Mapped, Vec::new())
        }
    };

    MappingRow {
        gpc_ref_no: required.gpc_ref_no.clone(),
        status,
        required: Some(required.clone()),
        extracted: Some(row.clone()),
        messages,
    }
}

fn id_mismatches(required: &RequiredGpcRow, row: &ExtractedRow) -> Vec<String> {
    let mut out = Vec::new();
    let levels = [
        ("sector", Some(required.sector_id), row.sector_id),
        ("subsector", Some(required.subsector_id), row.subsector_id),
        ("subcategory", required.subcategory_id, row.subcategory_id),
    ];
    for (level, expected, found) in levels {
        if expected != found {
            out.push(format!(
                "{level} ID mismatch for {}: expected {}, found {}",
                required.gpc_ref_no,
                display_id(expected),
                display_id(found)
            ));
        }
    }
    out
}

fn display_id(id: Option<Uuid>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string())
}
